//! Checker strategies: decide whether a worker's endpoint is reachable.
//!
//! A local child needs a moment to bind its socket, so the local checker
//! retries inside a short window. The remote checker probes once; a remote
//! server is either there or it is not. The vagrant checker additionally
//! resolves public-network addresses and distinguishes "machine stopped"
//! from "server unreachable".

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::interpreter::{Interpreter, NetworkMode, Scheme};
use crate::transport::Endpoint;
use crate::vagrant;
use crate::workers::process::ensure_machine_running;
use crate::workers::{Diagnostic, StartupError};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const PROBE_INTERVAL: Duration = Duration::from_millis(100);
const PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Readiness check run between process startup and client connection.
#[async_trait]
pub trait CheckerStrategy: Send {
    async fn check(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError>;
}

/// Probe until the window closes, collecting the last error for the
/// diagnostic.
async fn probe_within_window(endpoint: &Endpoint) -> Result<(), Diagnostic> {
    let started = Instant::now();
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match endpoint.probe(PROBE_TIMEOUT).await {
            Ok(()) => {
                debug!(%endpoint, attempts, "endpoint is up");
                return Ok(());
            }
            Err(e) => {
                if started.elapsed() >= PROBE_WINDOW {
                    return Err(Diagnostic::new(
                        format!(
                            "{e}. tried to connect to {endpoint} {attempts} times \
                             during {} seconds",
                            PROBE_WINDOW.as_secs()
                        ),
                        format!(
                            "check that a server for this project is running \
                             and that {endpoint} is reachable"
                        ),
                    ));
                }
            }
        }
        tokio::time::sleep(PROBE_INTERVAL).await;
    }
}

// ============================================================================
// Local
// ============================================================================

/// Waits for the freshly spawned child to bind its socket.
#[derive(Default)]
pub struct LocalChecker;

impl LocalChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CheckerStrategy for LocalChecker {
    async fn check(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError> {
        probe_within_window(&interpreter.endpoint())
            .await
            .map_err(StartupError::Fault)
    }
}

// ============================================================================
// Remote TCP
// ============================================================================

/// Single probe; nobody on this side can start a remote server.
#[derive(Default)]
pub struct RemoteChecker;

impl RemoteChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CheckerStrategy for RemoteChecker {
    async fn check(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError> {
        let endpoint = interpreter.endpoint();
        endpoint
            .probe(PROBE_WINDOW)
            .await
            .map_err(|e| {
                StartupError::Fault(Diagnostic::new(
                    format!("can not connect to {endpoint}: {e}"),
                    format!(
                        "check that your network is up, that the host is \
                         reachable and that the JSON server is listening on \
                         {endpoint}"
                    ),
                ))
            })
    }
}

// ============================================================================
// Vagrant
// ============================================================================

/// Probes the guest endpoint, resolving the public-network address first
/// when the topology needs it.
#[derive(Default)]
pub struct VagrantChecker;

impl VagrantChecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CheckerStrategy for VagrantChecker {
    async fn check(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError> {
        let manual = interpreter.manual();

        if let Scheme::Vagrant(plan) = interpreter.scheme_mut() {
            if plan.network == NetworkMode::Public && plan.host.is_none() {
                ensure_machine_running(plan).await?;
                let machine_id = plan.machine_id.clone().unwrap_or_default();
                let dev = plan.dev.clone().unwrap_or_default();
                match vagrant::ip_address(&machine_id, &dev).await {
                    Ok(address) => {
                        debug!(machine = %plan.machine, %address, "resolved public address");
                        plan.host = Some(address);
                    }
                    Err(e) => {
                        return Err(StartupError::Fault(Diagnostic::new(
                            format!(
                                "could not resolve the address of device {dev} \
                                 on machine {}: {e}",
                                plan.machine
                            ),
                            "check the `dev` option against the guest's \
                             network interfaces",
                        )));
                    }
                }
            }
        }

        let endpoint = interpreter.endpoint();
        if endpoint.probe(PROBE_TIMEOUT).await.is_ok() {
            return Ok(());
        }

        // The server is not answering. Unless the user administers it by
        // hand, check whether the machine itself is even up so a stopped
        // guest surfaces as a start offer instead of a connect error.
        if !manual {
            if let Scheme::Vagrant(plan) = interpreter.scheme_mut() {
                ensure_machine_running(plan).await?;
            }
        }

        probe_within_window(&endpoint)
            .await
            .map_err(StartupError::Fault)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeJsonServer;
    use std::path::Path;

    #[tokio::test]
    async fn test_local_checker_waits_for_late_bind() {
        let mut interpreter = Interpreter::parse(
            "tcp://127.0.0.1:1",
            "proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap();

        // Nothing listens on port 1; the local checker keeps probing and
        // reports the attempts it made.
        let mut checker = LocalChecker::new();
        let error = checker.check(&mut interpreter).await.unwrap_err();
        let StartupError::Fault(diagnostic) = error else {
            panic!("expected a fault");
        };
        assert!(diagnostic.error.contains("tried to connect"));
    }

    #[tokio::test]
    async fn test_local_checker_accepts_listening_endpoint() {
        let server = FakeJsonServer::echo().await;
        let mut interpreter = Interpreter::parse(
            &format!("tcp://{}", host_port(&server)),
            "proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap();

        LocalChecker::new().check(&mut interpreter).await.unwrap();
    }

    #[tokio::test]
    async fn test_remote_checker_single_probe() {
        let server = FakeJsonServer::echo().await;
        let mut interpreter = Interpreter::parse(
            &format!("tcp://{}", host_port(&server)),
            "proj",
            &[],
            Path::new("/nonexistent/jsonserver.py"),
        )
        .unwrap();
        RemoteChecker::new().check(&mut interpreter).await.unwrap();

        server.shutdown().await;
        let error = RemoteChecker::new()
            .check(&mut interpreter)
            .await
            .unwrap_err();
        assert!(matches!(error, StartupError::Fault(_)));
    }

    fn host_port(server: &FakeJsonServer) -> String {
        match server.endpoint() {
            Endpoint::Tcp { host, port } => format!("{host}:{port}"),
            #[cfg(unix)]
            other => panic!("expected tcp endpoint, got {other}"),
        }
    }
}
