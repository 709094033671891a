//! Process-wide registry of live transport driver tasks.
//!
//! The broker drives every transport from small tokio tasks instead of one
//! hand-rolled select loop, but the host still needs a single place that
//! knows about all of them: reconfiguration flows tear every connection
//! down at once, and plugin unload must not leak sockets. The `Reactor`
//! is that place. Driver tasks register a shutdown handle on creation and
//! unregister on exit; `terminate` signals every registered handle and
//! refuses new registrations until `restart`.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Handle held by a driver task; yields once shutdown is requested.
pub struct Registration {
    id: u64,
    signal: mpsc::UnboundedReceiver<()>,
}

impl Registration {
    /// Identifier to pass back to [`Reactor::unregister`].
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolve when the reactor asks this task to shut down.
    ///
    /// Also resolves if the reactor itself is gone; a task with no reactor
    /// left has nothing to outlive.
    pub async fn terminated(&mut self) {
        let _ = self.signal.recv().await;
    }
}

/// Registry of transport shutdown handles.
#[derive(Debug, Default)]
pub struct Reactor {
    handles: Mutex<HashMap<u64, mpsc::UnboundedSender<()>>>,
    next_id: AtomicU64,
    terminated: AtomicBool,
}

impl Reactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new driver task and hand it a shutdown handle.
    ///
    /// After `terminate` the returned handle fires immediately, so a task
    /// registered against a torn-down reactor exits on its first poll.
    pub fn register(&self) -> Registration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();

        if self.terminated.load(Ordering::SeqCst) {
            let _ = tx.send(());
        } else {
            self.handles
                .lock()
                .expect("reactor registry poisoned")
                .insert(id, tx);
            debug!(id, "reactor: registered transport");
        }

        Registration { id, signal: rx }
    }

    /// Drop a handle. Unknown ids are tolerated; a task may have been
    /// unregistered by `terminate` between readiness and dispatch.
    pub fn unregister(&self, id: u64) {
        if self
            .handles
            .lock()
            .expect("reactor registry poisoned")
            .remove(&id)
            .is_some()
        {
            debug!(id, "reactor: unregistered transport");
        }
    }

    /// Signal every registered task to close. Idempotent.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        let handles = {
            let mut map = self.handles.lock().expect("reactor registry poisoned");
            std::mem::take(&mut *map)
        };
        if !handles.is_empty() {
            info!(count = handles.len(), "reactor: terminating transports");
        }
        for (_, handle) in handles {
            // The task may already be gone; that is fine.
            let _ = handle.send(());
        }
    }

    /// Terminate then accept registrations again. Idempotent.
    pub fn restart(&self) {
        self.terminate();
        self.terminated.store(false, Ordering::SeqCst);
        info!("reactor: restarted");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Number of currently registered driver tasks.
    pub fn active_transports(&self) -> usize {
        self.handles.lock().expect("reactor registry poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_unregister() {
        let reactor = Reactor::new();
        let registration = reactor.register();
        assert_eq!(reactor.active_transports(), 1);

        reactor.unregister(registration.id());
        assert_eq!(reactor.active_transports(), 0);

        // Unknown id is a no-op.
        reactor.unregister(registration.id());
    }

    #[tokio::test]
    async fn test_terminate_signals_all_tasks() {
        let reactor = Arc::new(Reactor::new());
        let mut tasks = Vec::new();
        for _ in 0..3 {
            let mut registration = reactor.register();
            tasks.push(tokio::spawn(async move {
                registration.terminated().await;
            }));
        }

        reactor.terminate();
        for task in tasks {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("task did not observe termination")
                .unwrap();
        }
        assert_eq!(reactor.active_transports(), 0);

        // Idempotent.
        reactor.terminate();
    }

    #[tokio::test]
    async fn test_register_after_terminate_fires_immediately() {
        let reactor = Reactor::new();
        reactor.terminate();

        let mut registration = reactor.register();
        tokio::time::timeout(Duration::from_secs(1), registration.terminated())
            .await
            .expect("pre-fired shutdown signal expected");
        assert_eq!(reactor.active_transports(), 0);
    }

    #[tokio::test]
    async fn test_restart_accepts_new_registrations() {
        let reactor = Reactor::new();
        reactor.terminate();
        assert!(reactor.is_terminated());

        reactor.restart();
        assert!(!reactor.is_terminated());
        let _registration = reactor.register();
        assert_eq!(reactor.active_transports(), 1);
    }
}
