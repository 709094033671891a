//! Process strategies: how a worker obtains a running JSON server.
//!
//! Local workers spawn the bundled server script with the configured
//! interpreter and own the child for its whole life. Remote workers spawn
//! nothing. Vagrant workers probe first (somebody may have started the
//! server inside the guest already) and otherwise launch the guest server
//! through `vagrant ssh`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::interpreter::{Interpreter, Scheme, VagrantPlan};
use crate::vagrant::{self, VagrantError};
use crate::workers::{Diagnostic, StartupError};

/// Probe window before a vagrant spawn; a fast accept means the server is
/// already running inside the guest.
const VAGRANT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Grace period after `vagrant ssh` before deciding whether it died.
const VAGRANT_SPAWN_GRACE: Duration = Duration::from_secs(1);

/// Exact stderr an OpenSSH-backed `vagrant ssh` emits when the remote
/// command detaches cleanly.
const SSH_CLEAN_CLOSE: &[u8] = b"Connection to 127.0.0.1 closed.\r\n";

/// Owns (or declines to own) the server process behind a worker.
#[async_trait]
pub trait ProcessStrategy: Send {
    /// Make sure a server process exists for this descriptor.
    async fn start(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError>;

    /// Cheap liveness check on the owned child, if any.
    fn healthy(&mut self) -> Result<(), Diagnostic>;

    /// Tear the owned child down, if any. Idempotent.
    async fn stop(&mut self);
}

fn internal(detail: &str) -> StartupError {
    StartupError::Fault(Diagnostic::new(
        format!("internal error: {detail}"),
        "please report this",
    ))
}

// ============================================================================
// Local child process
// ============================================================================

/// Spawns and owns the local JSON server child.
#[derive(Default)]
pub struct LocalProcess {
    child: Option<Child>,
}

impl LocalProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStrategy for LocalProcess {
    async fn start(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError> {
        if self.child.is_some() {
            return Ok(());
        }
        let Some((argv, cwd)) = interpreter.local_arguments() else {
            return Err(internal("local process strategy with a non-local scheme"));
        };

        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &cwd {
            command.current_dir(cwd);
        }
        #[cfg(windows)]
        command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        match command.spawn() {
            Ok(child) => {
                info!(pid = child.id(), python = %argv[0], "spawned local server");
                self.child = Some(child);
                Ok(())
            }
            Err(e) => Err(StartupError::Fault(Diagnostic::new(
                format!(
                    "can not spawn a new server process with your configured \
                     interpreter ({}): {e}",
                    interpreter.raw()
                ),
                "make sure your interpreter is a valid binary and that it is \
                 in your PATH, or configure an absolute path to it, for \
                 example: /usr/bin/python3",
            ))),
        }
    }

    fn healthy(&mut self) -> Result<(), Diagnostic> {
        let Some(child) = &mut self.child else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                warn!(%status, "local server exited");
                self.child = None;
                Err(Diagnostic::new(
                    "the server process is terminated",
                    "check your configuration",
                ))
            }
            Err(e) => Err(Diagnostic::new(
                format!("can not query the server process: {e}"),
                "check your configuration",
            )),
        }
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!(pid = child.id(), "stopping local server");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ============================================================================
// Nothing to spawn
// ============================================================================

/// For remote servers someone else administers. Always succeeds.
#[derive(Default)]
pub struct StubProcess;

impl StubProcess {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessStrategy for StubProcess {
    async fn start(&mut self, _interpreter: &mut Interpreter) -> Result<(), StartupError> {
        Ok(())
    }

    fn healthy(&mut self) -> Result<(), Diagnostic> {
        Ok(())
    }

    async fn stop(&mut self) {}
}

// ============================================================================
// Vagrant guest process
// ============================================================================

/// Starts the server inside a vagrant guest through `vagrant ssh`.
#[derive(Default)]
pub struct VagrantProcess {
    child: Option<Child>,
}

impl VagrantProcess {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStrategy for VagrantProcess {
    async fn start(&mut self, interpreter: &mut Interpreter) -> Result<(), StartupError> {
        if self.child.is_some() {
            return Ok(());
        }

        let project = interpreter.project().to_string();
        let endpoint = interpreter.endpoint();
        let Scheme::Vagrant(plan) = interpreter.scheme_mut() else {
            return Err(internal("vagrant process strategy with a non-vagrant scheme"));
        };
        if plan.manual {
            return Ok(());
        }

        // Someone (or a previous session) may already run the server inside
        // the guest; adopt it instead of spawning a second one.
        if endpoint.probe(VAGRANT_PROBE_TIMEOUT).await.is_ok() {
            debug!(%endpoint, "guest server already listening, switching to manual");
            plan.manual = true;
            return Ok(());
        }

        ensure_machine_running(plan).await?;
        let machine_id = plan
            .machine_id
            .clone()
            .ok_or_else(|| internal("machine id not resolved"))?;

        let mut remote = format!(
            "{} {} -p {}",
            plan.interpreter,
            plan.guest_script(),
            project
        );
        if !plan.extra.is_empty() {
            remote.push_str(&format!(" -e {}", plan.extra.join(",")));
        }
        remote.push_str(&format!(" {}", plan.port));

        debug!(machine = %plan.machine, command = %remote, "starting guest server");
        let mut child = Command::new("vagrant")
            .args(["ssh", &machine_id, "-c", &remote])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StartupError::Fault(Diagnostic::new(
                    format!("can not spawn `vagrant` to run `{remote}`: {e}"),
                    "check that vagrant is installed and in your PATH",
                ))
            })?;

        // vagrant ssh either keeps running for the life of the guest server
        // or dies quickly; give it a moment to show which one it is.
        tokio::time::sleep(VAGRANT_SPAWN_GRACE).await;
        match child.try_wait() {
            Ok(None) => {
                info!(machine = %plan.machine, "guest server started");
                self.child = Some(child);
                Ok(())
            }
            Ok(Some(_)) | Err(_) => {
                let output = child.wait_with_output().await.map_err(|e| {
                    StartupError::Fault(Diagnostic::new(
                        format!("can not collect `vagrant ssh` output: {e}"),
                        "check your vagrant installation",
                    ))
                })?;
                // OpenSSH reports a clean detach on stderr with a fixed
                // message; that exit is a success.
                if output.stderr == SSH_CLEAN_CLOSE {
                    info!(machine = %plan.machine, "guest server detached");
                    return Ok(());
                }
                Err(StartupError::Fault(Diagnostic::new(
                    format!(
                        "can not start the server in machine {} with `{remote}`\n\n\
                         process output: {}\nprocess error: {}",
                        plan.machine,
                        String::from_utf8_lossy(&output.stdout).trim(),
                        String::from_utf8_lossy(&output.stderr).trim(),
                    ),
                    "check your vagrant machine and interpreter configuration",
                )))
            }
        }
    }

    fn healthy(&mut self) -> Result<(), Diagnostic> {
        let Some(child) = &mut self.child else {
            return Ok(());
        };
        match child.try_wait() {
            Ok(None) => Ok(()),
            Ok(Some(status)) => {
                warn!(%status, "vagrant ssh session exited");
                self.child = None;
                Err(Diagnostic::new(
                    "the server process is terminated",
                    "check your configuration",
                ))
            }
            Err(e) => Err(Diagnostic::new(
                format!("can not query the vagrant ssh session: {e}"),
                "check your configuration",
            )),
        }
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            debug!("stopping vagrant ssh session");
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

// ============================================================================
// Machine resolution
// ============================================================================

/// Resolve the machine id and vagrant root and insist the guest is running.
///
/// A known-but-stopped machine is a distinct failure so the host can offer
/// to run `vagrant up`.
pub(crate) async fn ensure_machine_running(plan: &mut VagrantPlan) -> Result<(), StartupError> {
    let info = match vagrant::machine_info(&plan.machine).await {
        Ok(info) => info,
        Err(VagrantError::MachineNotFound(machine)) => {
            return Err(StartupError::Fault(Diagnostic::new(
                format!("vagrant machine `{machine}` does not exist"),
                "create and start your vagrant machine, or fix the machine \
                 name in your interpreter setting",
            )));
        }
        Err(VagrantError::Spawn(e)) => {
            return Err(StartupError::Fault(Diagnostic::new(
                format!("can not run vagrant: {e}"),
                "install vagrant or add it to your PATH",
            )));
        }
        Err(e) => {
            return Err(StartupError::Fault(Diagnostic::new(
                format!("vagrant machine lookup failed: {e}"),
                "check your vagrant installation",
            )));
        }
    };

    let running = info.is_running();
    plan.machine_id = Some(info.id);
    plan.vagrant_root = Some(info.directory);
    if !running {
        return Err(StartupError::MachineNotRunning {
            machine: plan.machine.clone(),
            diagnostic: Diagnostic::new(
                format!(
                    "vagrant machine `{}` is not running (state: {})",
                    plan.machine, info.state
                ),
                "start the vagrant machine and try again",
            ),
        });
    }
    Ok(())
}
