//! The market: process-wide registry and factory for workers.
//!
//! Editor commands hand the market a window context and a payload; the
//! market finds or hires the worker for that window, drives it to health
//! and submits the call. Failed submissions get exactly one delayed retry,
//! then the call is dropped (the next editor event triggers a fresh one
//! anyway).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::client::Callback;
use crate::interpreter::{Interpreter, SchemeKind};
use crate::reactor::Reactor;
use crate::workers::checker::{CheckerStrategy, LocalChecker, RemoteChecker, VagrantChecker};
use crate::workers::process::{LocalProcess, ProcessStrategy, StubProcess, VagrantProcess};
use crate::workers::worker::{Worker, WorkerStatus};
use crate::workers::{Diagnostic, LogNotifier, Notifier};

/// Stable identifier of an editor window.
pub type WindowId = u64;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Everything the market needs to know about an editor window to hire a
/// worker for it.
#[derive(Debug, Clone)]
pub struct WindowContext {
    pub window_id: WindowId,
    /// Raw interpreter setting for the window.
    pub interpreter: String,
    /// Stable project identifier.
    pub project: String,
    /// Open workspace folders.
    pub folders: Vec<PathBuf>,
    /// Host-side location of the bundled JSON server script.
    pub script: PathBuf,
}

pub struct Market {
    workers: StdMutex<HashMap<WindowId, Arc<Mutex<Worker>>>>,
    /// Interpreter strings that failed to parse, keyed by window, so a
    /// broken setting is surfaced once and not on every keystroke.
    broken: StdMutex<HashMap<WindowId, String>>,
    reactor: Arc<Reactor>,
    notifier: Arc<dyn Notifier>,
    retry_delay: Duration,
}

impl Market {
    pub fn new(reactor: Arc<Reactor>) -> Self {
        Self::with_notifier(reactor, Arc::new(LogNotifier))
    }

    pub fn with_notifier(reactor: Arc<Reactor>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            workers: StdMutex::new(HashMap::new()),
            broken: StdMutex::new(HashMap::new()),
            reactor,
            notifier,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Shrink the retry back-off; tests should not sit through seconds of
    /// real sleeping.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// The worker currently hired for a window, if any.
    pub fn lookup(&self, window_id: WindowId) -> Option<Arc<Mutex<Worker>>> {
        self.workers
            .lock()
            .expect("worker pool poisoned")
            .get(&window_id)
            .cloned()
    }

    /// Place a pre-built worker for a window. Replaces any previous one.
    pub fn add(&self, window_id: WindowId, worker: Worker) {
        self.workers
            .lock()
            .expect("worker pool poisoned")
            .insert(window_id, Arc::new(Mutex::new(worker)));
    }

    /// Submit a call for a window.
    ///
    /// Hires a worker if none exists, replaces a retired one, drives the
    /// worker to health if needed, remaps payload filenames for remote
    /// sessions, and performs at most one delayed retry before giving up.
    pub async fn execute(
        &self,
        context: &WindowContext,
        callback: Callback,
        payload: Map<String, Value>,
    ) {
        let Some(mut slot) = self.obtain(context) else {
            return;
        };
        let mut callback = Some(callback);
        let mut payload = Some(payload);
        let mut retried = false;

        loop {
            {
                let mut worker = slot.lock().await;
                match worker.status() {
                    WorkerStatus::Faulty => {
                        debug!(
                            window = context.window_id,
                            "dropping call for a faulty worker"
                        );
                        return;
                    }
                    WorkerStatus::Quiting => {
                        drop(worker);
                        info!(
                            window = context.window_id,
                            "replacing a retired worker"
                        );
                        self.retire(context.window_id).await;
                        match self.obtain(context) {
                            Some(fresh) => {
                                slot = fresh;
                                continue;
                            }
                            None => return,
                        }
                    }
                    WorkerStatus::Healthy => {
                        if worker.client().is_some_and(|c| c.connected()) {
                            submit(&worker, callback.take(), payload.take());
                            return;
                        }
                        // The transport dropped underneath us; rebuild the
                        // session before the call goes out.
                        worker.reconnect().await;
                        if worker.status() == WorkerStatus::Healthy {
                            submit(&worker, callback.take(), payload.take());
                            return;
                        }
                    }
                    WorkerStatus::Incomplete => {
                        worker.start().await;
                        if worker.status() == WorkerStatus::Healthy {
                            submit(&worker, callback.take(), payload.take());
                            return;
                        }
                    }
                }
            }

            if retried {
                debug!(
                    window = context.window_id,
                    "dropping call after a failed retry"
                );
                return;
            }
            retried = true;
            tokio::time::sleep(self.retry_delay).await;
        }
    }

    /// React to a changed interpreter setting for a window. No-op when the
    /// window has no worker yet; the next call hires with the new setting.
    pub async fn interpreter_switch(&self, context: &WindowContext) {
        let Some(slot) = self.lookup(context.window_id) else {
            return;
        };
        match self.parse(context) {
            Ok(interpreter) => {
                slot.lock().await.on_interpreter_switch(interpreter).await;
            }
            Err(diagnostic) => {
                error!(window = context.window_id, "{}", diagnostic);
                self.notifier.alert(&diagnostic);
            }
        }
    }

    /// Remove and tear down the worker for a window.
    pub async fn retire(&self, window_id: WindowId) {
        let slot = self
            .workers
            .lock()
            .expect("worker pool poisoned")
            .remove(&window_id);
        match slot {
            Some(slot) => slot.lock().await.retire().await,
            None => debug!(window = window_id, "no worker to retire"),
        }
    }

    /// Retire every worker and terminate the reactor. Used on host exit.
    pub async fn shutdown(&self) {
        let drained: Vec<_> = self
            .workers
            .lock()
            .expect("worker pool poisoned")
            .drain()
            .collect();
        for (window_id, slot) in drained {
            debug!(window = window_id, "retiring worker on shutdown");
            slot.lock().await.retire().await;
        }
        self.reactor.terminate();
    }

    /// Find the worker for the context's window, hiring one if needed.
    /// `None` means the interpreter setting is broken; it has been
    /// surfaced already.
    fn obtain(&self, context: &WindowContext) -> Option<Arc<Mutex<Worker>>> {
        if let Some(slot) = self.lookup(context.window_id) {
            return Some(slot);
        }

        match self.parse(context) {
            Ok(interpreter) => {
                self.broken
                    .lock()
                    .expect("broken settings poisoned")
                    .remove(&context.window_id);
                let slot = Arc::new(Mutex::new(self.hire(interpreter)));
                let mut pool = self.workers.lock().expect("worker pool poisoned");
                // A concurrent call may have hired first; one worker per
                // window wins.
                Some(
                    pool.entry(context.window_id)
                        .or_insert_with(|| slot)
                        .clone(),
                )
            }
            Err(diagnostic) => {
                let previous = self
                    .broken
                    .lock()
                    .expect("broken settings poisoned")
                    .insert(context.window_id, context.interpreter.clone());
                if previous.as_deref() != Some(context.interpreter.as_str()) {
                    error!(window = context.window_id, "{}", diagnostic);
                    self.notifier.alert(&diagnostic);
                } else {
                    debug!(
                        window = context.window_id,
                        "dropping call for a known-broken interpreter setting"
                    );
                }
                None
            }
        }
    }

    fn parse(&self, context: &WindowContext) -> Result<Interpreter, Diagnostic> {
        Interpreter::parse(
            &context.interpreter,
            &context.project,
            &context.folders,
            &context.script,
        )
        .map_err(|e| {
            Diagnostic::new(
                format!("interpreter setting `{}`: {e}", context.interpreter),
                "fix the interpreter setting for this window",
            )
        })
    }

    /// Build a worker with the strategies matching the descriptor scheme.
    fn hire(&self, interpreter: Interpreter) -> Worker {
        let (process, checker): (Box<dyn ProcessStrategy>, Box<dyn CheckerStrategy>) =
            match interpreter.kind() {
                SchemeKind::Local => (Box::new(LocalProcess::new()), Box::new(LocalChecker::new())),
                SchemeKind::RemoteTcp => {
                    (Box::new(StubProcess::new()), Box::new(RemoteChecker::new()))
                }
                SchemeKind::Vagrant => (
                    Box::new(VagrantProcess::new()),
                    Box::new(VagrantChecker::new()),
                ),
            };
        info!(
            project = interpreter.project(),
            endpoint = %interpreter.endpoint(),
            "hiring worker"
        );
        Worker::new(
            interpreter,
            process,
            checker,
            Arc::clone(&self.reactor),
            Arc::clone(&self.notifier),
        )
    }
}

/// Remap payload filenames for remote sessions and hand the frame to the
/// client. The callback and payload options are always present here; the
/// call sites consume them exactly once.
fn submit(worker: &Worker, callback: Option<Callback>, payload: Option<Map<String, Value>>) {
    let (Some(callback), Some(mut payload)) = (callback, payload) else {
        return;
    };
    if worker.interpreter().is_remote_session() {
        if let Some(Value::String(filename)) = payload.get("filename") {
            let remapped = worker.interpreter().pathmap().to_remote(filename);
            payload.insert("filename".to_string(), Value::String(remapped));
        }
    }
    let Some(client) = worker.client() else {
        return;
    };
    if let Err(e) = client.send_command(callback, payload) {
        warn!("market: submission failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{CountingNotifier, FakeJsonServer, MockProcess, recorder};
    use serde_json::json;

    fn context(server: &FakeJsonServer, window_id: WindowId) -> WindowContext {
        let crate::transport::Endpoint::Tcp { host, port } = server.endpoint() else {
            panic!("expected tcp endpoint");
        };
        WindowContext {
            window_id,
            interpreter: format!("tcp://{host}:{port}"),
            project: "proj".to_string(),
            folders: Vec::new(),
            script: PathBuf::from("/nonexistent/jsonserver.py"),
        }
    }

    fn market(notifier: &Arc<CountingNotifier>) -> Market {
        Market::with_notifier(Arc::new(Reactor::new()), notifier.clone())
            .with_retry_delay(Duration::from_millis(50))
    }

    fn lint_payload() -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("method".into(), json!("lint"));
        payload.insert("filename".into(), json!("/home/me/src/app.py"));
        payload
    }

    #[tokio::test]
    async fn test_execute_hires_connects_and_answers() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = context(&server, 1);
        let (responses, record) = recorder();

        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;

        let response = responses.wait_for(1).await.remove(0);
        assert_eq!(response["method"], json!("lint"));
        assert_eq!(notifier.alerts(), 0);
    }

    #[tokio::test]
    async fn test_add_places_a_prebuilt_worker() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = context(&server, 9);

        let interpreter = Interpreter::parse(
            &context.interpreter,
            &context.project,
            &context.folders,
            &context.script,
        )
        .unwrap();
        let worker = Worker::new(
            interpreter,
            Box::new(MockProcess::ok()),
            Box::new(RemoteChecker::new()),
            Arc::new(Reactor::new()),
            notifier.clone(),
        );
        market.add(9, worker);
        assert!(market.lookup(9).is_some());

        let (responses, record) = recorder();
        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;
        responses.wait_for(1).await;
    }

    #[tokio::test]
    async fn test_one_worker_per_window() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = context(&server, 7);
        let (responses, _) = recorder();

        for _ in 0..3 {
            let responses = responses.clone();
            market
                .execute(
                    &context,
                    Callback::new(move |r| responses.push(r)),
                    lint_payload(),
                )
                .await;
        }
        responses.wait_for(3).await;

        let first = market.lookup(7).unwrap();
        market
            .execute(&context, Callback::new(|_| {}), lint_payload())
            .await;
        let still = market.lookup(7).unwrap();
        assert!(Arc::ptr_eq(&first, &still));
    }

    #[tokio::test]
    async fn test_broken_interpreter_surfaces_once() {
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = WindowContext {
            window_id: 2,
            interpreter: "ssh://nope:22".to_string(),
            project: "proj".to_string(),
            folders: Vec::new(),
            script: PathBuf::from("/nonexistent/jsonserver.py"),
        };

        market
            .execute(&context, Callback::new(|_| {}), lint_payload())
            .await;
        market
            .execute(&context, Callback::new(|_| {}), lint_payload())
            .await;
        assert_eq!(notifier.alerts(), 1, "same broken setting alerts once");
        assert!(market.lookup(2).is_none());
    }

    #[tokio::test]
    async fn test_pathmap_remaps_outbound_filename() {
        let server = FakeJsonServer::echo().await;
        let crate::transport::Endpoint::Tcp { host, port } = server.endpoint() else {
            panic!("expected tcp endpoint");
        };
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = WindowContext {
            window_id: 3,
            interpreter: format!("tcp://{host}:{port}?pathmap=/home/me/src,/srv/src"),
            project: "proj".to_string(),
            folders: Vec::new(),
            script: PathBuf::from("/nonexistent/jsonserver.py"),
        };
        let (responses, record) = recorder();

        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;
        let response = responses.wait_for(1).await.remove(0);
        assert_eq!(response["filename"], json!("/srv/src/app.py"));
    }

    #[tokio::test]
    async fn test_switch_to_new_endpoint_is_served_by_it() {
        let server_a = FakeJsonServer::echo().await;
        let server_b = FakeJsonServer::with_handler(|request| {
            vec![json!({"uid": request["uid"], "served_by": "b"})]
        })
        .await;

        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context_a = context(&server_a, 4);
        let (responses, record) = recorder();
        market
            .execute(&context_a, Callback::new(record), lint_payload())
            .await;
        responses.wait_for(1).await;

        let context_b = context(&server_b, 4);
        market.interpreter_switch(&context_b).await;

        let (responses_b, record_b) = recorder();
        market
            .execute(&context_b, Callback::new(record_b), lint_payload())
            .await;
        let response = responses_b.wait_for(1).await.remove(0);
        assert_eq!(response["served_by"], json!("b"));
    }

    #[tokio::test]
    async fn test_retired_worker_is_replaced_on_next_call() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = context(&server, 5);
        let (responses, record) = recorder();
        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;
        responses.wait_for(1).await;
        let first = market.lookup(5).unwrap();

        // Scheme change retires the worker in place.
        let mut switched = context.clone();
        switched.interpreter = "/bin/sh".to_string();
        market.interpreter_switch(&switched).await;
        assert_eq!(
            first.lock().await.status(),
            WorkerStatus::Quiting
        );

        // The next call, back on the tcp setting, hires a replacement.
        let (responses, record) = recorder();
        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;
        responses.wait_for(1).await;
        let replacement = market.lookup(5).unwrap();
        assert!(!Arc::ptr_eq(&first, &replacement));
    }

    #[tokio::test]
    async fn test_unreachable_server_drops_call_and_faults() {
        let server = FakeJsonServer::echo().await;
        let context = context(&server, 6);
        server.shutdown().await;

        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let fired = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        {
            let fired = fired.clone();
            market
                .execute(
                    &context,
                    Callback::new(move |_| {
                        fired.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }),
                    lint_payload(),
                )
                .await;
        }

        assert_eq!(fired.load(std::sync::atomic::Ordering::SeqCst), 0);
        let slot = market.lookup(6).unwrap();
        assert_eq!(slot.lock().await.status(), WorkerStatus::Faulty);
        assert_eq!(notifier.alerts(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_retires_everything() {
        let server = FakeJsonServer::echo().await;
        let notifier = Arc::new(CountingNotifier::new());
        let market = market(&notifier);
        let context = context(&server, 8);
        let (responses, record) = recorder();
        market
            .execute(&context, Callback::new(record), lint_payload())
            .await;
        responses.wait_for(1).await;

        market.shutdown().await;
        assert!(market.lookup(8).is_none());
        assert!(market.reactor.is_terminated());
    }
}
