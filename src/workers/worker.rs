//! A worker ties one editor window to one JSON server.
//!
//! Startup is a fixed pipeline: (re)build the endpoint if reconnecting,
//! run the process strategy, verify the child is alive, run the checker,
//! then connect a client. Any failed step faults the worker; the fault is
//! surfaced through the notifier once per transition into the faulty state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::client::{AsyncClient, Callback, ClientError};
use crate::interpreter::{Interpreter, Scheme};
use crate::reactor::Reactor;
use crate::vagrant;
use crate::workers::checker::CheckerStrategy;
use crate::workers::process::ProcessStrategy;
use crate::workers::{Diagnostic, Notifier, StartupError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Worker lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Not started yet, or stopped pending a restart.
    Incomplete,
    /// Connected and answering.
    Healthy,
    /// Startup failed; stays faulty until reconfigured.
    Faulty,
    /// Retired; the market replaces it on the next call.
    Quiting,
}

/// One worker per editor window, created through the market.
pub struct Worker {
    interpreter: Interpreter,
    process: Box<dyn ProcessStrategy>,
    checker: Box<dyn CheckerStrategy>,
    client: Option<AsyncClient>,
    status: WorkerStatus,
    reconnecting: bool,
    last_diagnostic: Option<Diagnostic>,
    reactor: Arc<Reactor>,
    notifier: Arc<dyn Notifier>,
}

impl Worker {
    pub fn new(
        interpreter: Interpreter,
        process: Box<dyn ProcessStrategy>,
        checker: Box<dyn CheckerStrategy>,
        reactor: Arc<Reactor>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            interpreter,
            process,
            checker,
            client: None,
            status: WorkerStatus::Incomplete,
            reconnecting: false,
            last_diagnostic: None,
            reactor,
            notifier,
        }
    }

    pub fn status(&self) -> WorkerStatus {
        self.status
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn client(&self) -> Option<&AsyncClient> {
        self.client.as_ref()
    }

    /// The diagnostic behind the current fault, if any.
    pub fn last_diagnostic(&self) -> Option<&Diagnostic> {
        self.last_diagnostic.as_ref()
    }

    /// Drive the startup pipeline to a healthy client, or fault.
    pub async fn start(&mut self) {
        if self.status == WorkerStatus::Healthy
            && self.client.as_ref().is_some_and(AsyncClient::connected)
        {
            return;
        }
        match self.startup().await {
            Ok(()) => {
                info!(
                    project = self.interpreter.project(),
                    endpoint = %self.interpreter.endpoint(),
                    "worker is healthy"
                );
            }
            Err(diagnostic) => self.fault(diagnostic),
        }
    }

    /// Tear the connection and any owned child down; the worker can be
    /// started again.
    pub async fn stop(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
        self.process.stop().await;
        self.status = WorkerStatus::Incomplete;
    }

    /// Stop and rebuild the session against a fresh endpoint. Used when
    /// the transport dropped underneath a healthy worker.
    pub async fn reconnect(&mut self) {
        debug!(project = self.interpreter.project(), "worker: reconnecting");
        self.stop().await;
        self.reconnecting = true;
        self.start().await;
    }

    /// Permanently remove this worker from duty.
    pub async fn retire(&mut self) {
        self.stop().await;
        self.status = WorkerStatus::Quiting;
    }

    /// React to a changed interpreter setting for this window.
    ///
    /// Same raw string and project: nothing to do. Same scheme with
    /// different details: rebuild the session in place. Different scheme:
    /// retire, the market hires a replacement with matching strategies on
    /// the next call.
    pub async fn on_interpreter_switch(&mut self, new: Interpreter) {
        if new.raw() == self.interpreter.raw() && new.project() == self.interpreter.project() {
            return;
        }
        if new.kind() != self.interpreter.kind() {
            info!(
                project = self.interpreter.project(),
                "interpreter scheme changed, retiring worker"
            );
            self.retire().await;
            return;
        }
        debug!(
            project = self.interpreter.project(),
            "interpreter changed within scheme, rebuilding session"
        );
        self.stop().await;
        self.interpreter = new;
        self.last_diagnostic = None;
        self.reconnecting = true;
        self.start().await;
    }

    /// Submit the reserved `check` heartbeat through the client.
    pub fn heartbeat(&self, callback: Callback) -> Result<String, ClientError> {
        match &self.client {
            Some(client) => client.send_check(callback),
            None => Err(ClientError::Closed),
        }
    }

    async fn startup(&mut self) -> Result<(), Diagnostic> {
        if self.reconnecting {
            self.interpreter.renew().map_err(|e| {
                Diagnostic::new(e.to_string(), "fix your interpreter configuration")
            })?;
        }

        self.start_process().await?;
        self.process.healthy()?;
        self.run_checker().await?;

        let endpoint = self.interpreter.endpoint();
        let transport = endpoint.connect(CONNECT_TIMEOUT).await.map_err(|e| {
            Diagnostic::new(
                format!("can not connect to {endpoint}: {e}"),
                "check that the server endpoint is reachable",
            )
        })?;
        self.client = Some(AsyncClient::new(transport, Arc::clone(&self.reactor)));
        self.status = WorkerStatus::Healthy;
        self.reconnecting = false;
        self.last_diagnostic = None;
        Ok(())
    }

    async fn start_process(&mut self) -> Result<(), Diagnostic> {
        match self.process.start(&mut self.interpreter).await {
            Ok(()) => Ok(()),
            Err(StartupError::MachineNotRunning { machine, diagnostic }) => {
                self.recover_machine(&machine, diagnostic).await?;
                self.process
                    .start(&mut self.interpreter)
                    .await
                    .map_err(StartupError::into_diagnostic)
            }
            Err(e) => Err(e.into_diagnostic()),
        }
    }

    async fn run_checker(&mut self) -> Result<(), Diagnostic> {
        match self.checker.check(&mut self.interpreter).await {
            Ok(()) => Ok(()),
            Err(StartupError::MachineNotRunning { machine, diagnostic }) => {
                self.recover_machine(&machine, diagnostic).await?;
                self.checker
                    .check(&mut self.interpreter)
                    .await
                    .map_err(StartupError::into_diagnostic)
            }
            Err(e) => Err(e.into_diagnostic()),
        }
    }

    /// A guest machine exists but is stopped. Offer the host a `vagrant up`
    /// and run it if accepted; otherwise the original diagnostic stands.
    async fn recover_machine(
        &self,
        machine: &str,
        diagnostic: Diagnostic,
    ) -> Result<(), Diagnostic> {
        if !self.notifier.offer_machine_start(machine) {
            return Err(diagnostic);
        }
        let root = match self.interpreter.scheme() {
            Scheme::Vagrant(plan) => plan.vagrant_root.clone(),
            _ => None,
        };
        info!(machine, "starting vagrant machine on host request");
        vagrant::start_machine(machine, root.as_deref())
            .await
            .map_err(|e| {
                Diagnostic::new(
                    format!("vagrant machine `{machine}` could not be started: {e}"),
                    "run `vagrant up` for the machine manually",
                )
            })
    }

    fn fault(&mut self, diagnostic: Diagnostic) {
        error!(
            project = self.interpreter.project(),
            "worker fault: {}", diagnostic
        );
        if self.status != WorkerStatus::Faulty {
            self.notifier.alert(&diagnostic);
            self.status = WorkerStatus::Faulty;
        }
        self.last_diagnostic = Some(diagnostic);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingNotifier, FakeJsonServer, MockProcess, recorder};
    use crate::workers::checker::RemoteChecker;
    use serde_json::json;
    use std::path::Path;
    use std::time::Duration;

    fn tcp_interpreter(server: &FakeJsonServer) -> Interpreter {
        let crate::transport::Endpoint::Tcp { host, port } = server.endpoint() else {
            panic!("expected tcp endpoint");
        };
        Interpreter::parse(
            &format!("tcp://{host}:{port}"),
            "proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap()
    }

    fn remote_worker(
        server: &FakeJsonServer,
        process: MockProcess,
        notifier: Arc<CountingNotifier>,
    ) -> Worker {
        Worker::new(
            tcp_interpreter(server),
            Box::new(process),
            Box::new(RemoteChecker::new()),
            Arc::new(Reactor::new()),
            notifier,
        )
    }

    #[tokio::test]
    async fn test_start_reaches_healthy_and_heartbeats() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::ok(), notifier.clone());

        worker.start().await;
        assert_eq!(worker.status(), WorkerStatus::Healthy);
        assert_eq!(notifier.alerts(), 0);

        let (responses, record) = recorder();
        worker.heartbeat(Callback::new(record)).unwrap();
        let response = responses.wait_for(1).await.remove(0);
        assert_eq!(response["message"], json!("Ok"));
    }

    #[tokio::test]
    async fn test_spawn_failure_faults_and_alerts_once() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(
            &server,
            MockProcess::failing("no such interpreter"),
            notifier.clone(),
        );

        worker.start().await;
        assert_eq!(worker.status(), WorkerStatus::Faulty);
        assert_eq!(notifier.alerts(), 1);
        assert!(
            worker
                .last_diagnostic()
                .unwrap()
                .error
                .contains("no such interpreter")
        );

        // Still faulty; no second dialog for the same fault.
        worker.start().await;
        assert_eq!(worker.status(), WorkerStatus::Faulty);
        assert_eq!(notifier.alerts(), 1);
    }

    #[tokio::test]
    async fn test_dead_child_is_reported_as_terminated() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::dying(), notifier.clone());

        worker.start().await;
        assert_eq!(worker.status(), WorkerStatus::Faulty);
        assert_eq!(
            worker.last_diagnostic().unwrap().error,
            "the server process is terminated"
        );
    }

    #[tokio::test]
    async fn test_switch_within_scheme_rebuilds_session() {
        let server_a = FakeJsonServer::echo().await;
        let server_b = FakeJsonServer::with_handler(|request| {
            vec![json!({"uid": request["uid"], "message": "Ok", "served_by": "b"})]
        })
        .await;

        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server_a, MockProcess::ok(), notifier.clone());
        worker.start().await;
        assert_eq!(worker.status(), WorkerStatus::Healthy);

        worker.on_interpreter_switch(tcp_interpreter(&server_b)).await;
        assert_eq!(worker.status(), WorkerStatus::Healthy);

        let (responses, record) = recorder();
        worker.heartbeat(Callback::new(record)).unwrap();
        let response = responses.wait_for(1).await.remove(0);
        assert_eq!(response["served_by"], json!("b"));
    }

    #[tokio::test]
    async fn test_switch_to_other_scheme_retires() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::ok(), notifier.clone());
        worker.start().await;

        let local = Interpreter::parse(
            "/bin/sh",
            "proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap();
        worker.on_interpreter_switch(local).await;
        assert_eq!(worker.status(), WorkerStatus::Quiting);
        assert!(worker.client().is_none());
    }

    #[tokio::test]
    async fn test_same_raw_string_is_a_noop() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::ok(), notifier.clone());
        worker.start().await;

        let same = tcp_interpreter(&server);
        worker.on_interpreter_switch(same).await;
        assert_eq!(worker.status(), WorkerStatus::Healthy);
    }

    #[tokio::test]
    async fn test_same_raw_with_new_project_rebuilds_session() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::ok(), notifier.clone());
        worker.start().await;

        let crate::transport::Endpoint::Tcp { host, port } = server.endpoint() else {
            panic!("expected tcp endpoint");
        };
        let renamed = Interpreter::parse(
            &format!("tcp://{host}:{port}"),
            "renamed-proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap();
        worker.on_interpreter_switch(renamed).await;

        // Same endpoint but a new project is a real switch, not a no-op.
        assert_eq!(worker.status(), WorkerStatus::Healthy);
        assert_eq!(worker.interpreter().project(), "renamed-proj");
    }

    #[tokio::test]
    async fn test_reconnect_after_transport_drop() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let mut worker = remote_worker(&server, MockProcess::ok(), notifier.clone());
        worker.start().await;

        let crate::transport::Endpoint::Tcp { port, .. } = server.endpoint() else {
            panic!("expected tcp endpoint");
        };
        server.shutdown().await;

        // Give the client driver a moment to observe the drop.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!worker.client().unwrap().connected());

        // A replacement server comes up on the same endpoint.
        let _revived = FakeJsonServer::echo_on(port).await;
        worker.reconnect().await;
        assert_eq!(worker.status(), WorkerStatus::Healthy);

        let (responses, record) = recorder();
        worker.heartbeat(Callback::new(record)).unwrap();
        let response = responses.wait_for(1).await.remove(0);
        assert_eq!(response["message"], json!("Ok"));
    }
}
