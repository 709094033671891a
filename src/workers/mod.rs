//! Per-window workers and the market that hires them.
//!
//! A worker pairs a *process strategy* (owns the child JSON server, or a
//! stub when nothing is spawned) with a *checker strategy* (decides whether
//! the endpoint is reachable and ready) and an async client. The market is
//! the process-wide registry and factory through which editor commands
//! submit calls.

pub mod checker;
pub mod market;
pub mod process;
pub mod worker;

use serde::Serialize;
use tracing::error;

// ============================================================================
// Diagnostics
// ============================================================================

/// Human-readable failure with a remediation tip; surfaced to the host at
/// most once per fault transition. Serializable so hosts can ship it to
/// their own UI layer as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub error: String,
    pub tip: String,
}

impl Diagnostic {
    pub fn new(error: impl Into<String>, tip: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            tip: tip.into(),
        }
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\n{}", self.error, self.tip)
    }
}

/// Failure of a startup step (process spawn or health check).
#[derive(Debug)]
pub enum StartupError {
    /// The worker can not become healthy until reconfigured.
    Fault(Diagnostic),
    /// A vagrant guest exists but is not running; the host may offer to
    /// start it.
    MachineNotRunning {
        machine: String,
        diagnostic: Diagnostic,
    },
}

impl StartupError {
    pub fn into_diagnostic(self) -> Diagnostic {
        match self {
            Self::Fault(diagnostic) | Self::MachineNotRunning { diagnostic, .. } => diagnostic,
        }
    }
}

// ============================================================================
// Host surfacing
// ============================================================================

/// How worker faults reach the editor host.
///
/// The host typically pops a dialog; the default just logs. Deduplication
/// happens in the worker, so `alert` fires once per fault transition.
pub trait Notifier: Send + Sync {
    fn alert(&self, diagnostic: &Diagnostic);

    /// A vagrant machine is down; return `true` if the host wants the
    /// broker to run `vagrant up` (which may take a while).
    fn offer_machine_start(&self, machine: &str) -> bool {
        let _ = machine;
        false
    }
}

/// Default notifier: diagnostics go to the log and machine starts are
/// declined.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn alert(&self, diagnostic: &Diagnostic) {
        error!("{}", diagnostic);
    }
}
