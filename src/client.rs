//! Asynchronous JSON client: request/response correlation over a transport.
//!
//! Every outbound request is stamped with a fresh 128-bit hex `uid` and its
//! callback is parked in a pending table; when a frame with a matching
//! `uid` arrives the callback fires exactly once. A single driver task owns
//! the table and a min-heap of deadlines, so callbacks for one client are
//! never invoked concurrently and sends reach the socket in submission
//! order.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde_json::{Map, Value, json};
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};
use uuid::Uuid;

use crate::reactor::{Reactor, Registration};
use crate::transport::Transport;
use crate::transport::framing::escape_raw_tabs;

// ============================================================================
// Callbacks
// ============================================================================

/// Boxed handler taking the decoded response object.
pub type ResponseHandler = Box<dyn FnOnce(Value) + Send + 'static>;

/// Terminal status of a pending call, derived from the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    Succeeded,
    Failed,
    TimedOut,
}

/// Per-call callback with optional failure and timeout branches.
///
/// The success handler doubles as the failure handler when no distinct one
/// is installed, mirroring how editor commands usually render an error
/// result through the same code path.
pub struct Callback {
    on_success: ResponseHandler,
    on_failure: Option<ResponseHandler>,
    on_timeout: Option<ResponseHandler>,
    deadline: Option<Duration>,
}

impl Callback {
    pub fn new<F>(on_success: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        Self {
            on_success: Box::new(on_success),
            on_failure: None,
            on_timeout: None,
            deadline: None,
        }
    }

    /// Install a distinct handler for failed responses.
    pub fn on_failure<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.on_failure = Some(Box::new(handler));
        self
    }

    /// Install a distinct handler for deadline expiry.
    pub fn on_timeout<F>(mut self, handler: F) -> Self
    where
        F: FnOnce(Value) + Send + 'static,
    {
        self.on_timeout = Some(Box::new(handler));
        self
    }

    /// Give this call a deadline. On expiry the callback fires with
    /// `{"success": false, "status": "timed_out"}` and a later genuine
    /// response is discarded.
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Derive the call status from a response object.
    ///
    /// An explicit `"status"` field takes precedence over the `"success"`
    /// boolean; a response carrying neither counts as success.
    pub fn status_of(response: &Value) -> CallbackStatus {
        if let Some(status) = response.get("status").and_then(Value::as_str) {
            return match status {
                "failed" => CallbackStatus::Failed,
                "timed_out" => CallbackStatus::TimedOut,
                _ => CallbackStatus::Succeeded,
            };
        }
        match response.get("success").and_then(Value::as_bool) {
            Some(false) => CallbackStatus::Failed,
            _ => CallbackStatus::Succeeded,
        }
    }

    /// Consume the callback, routing by status. Single invocation is
    /// guaranteed by construction: firing takes the callback by value.
    fn fire(self, response: Value) {
        match Self::status_of(&response) {
            CallbackStatus::Succeeded => (self.on_success)(response),
            CallbackStatus::Failed => match self.on_failure {
                Some(handler) => handler(response),
                None => (self.on_success)(response),
            },
            CallbackStatus::TimedOut => match self.on_timeout.or(self.on_failure) {
                Some(handler) => handler(response),
                None => (self.on_success)(response),
            },
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// Errors raised when submitting a call.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("client is closed")]
    Closed,

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// How long a timed out entry lingers before it is dropped from the
/// pending table. Long enough for any realistic straggler, short enough
/// that a long-lived client does not accumulate markers forever.
const TIMED_OUT_RETENTION: Duration = Duration::from_secs(60);

/// A pending call is consumed on response arrival or deadline expiry; a
/// timed out entry lingers for [`TIMED_OUT_RETENTION`] so a late response
/// can be told apart from a response nobody asked for, then is reaped.
enum PendingCall {
    Waiting(Callback),
    TimedOut,
}

enum Command {
    Send {
        uid: String,
        frame: String,
        callback: Callback,
        deadline: Option<Duration>,
    },
    Close,
}

/// Handle to a client driver task.
///
/// Cheap to clone; a callback may capture a clone and enqueue further
/// sends from inside its own invocation.
#[derive(Clone)]
pub struct AsyncClient {
    commands: mpsc::UnboundedSender<Command>,
    connected: Arc<AtomicBool>,
}

impl AsyncClient {
    /// Spawn the driver task over a connected transport and register it
    /// with the reactor.
    pub fn new<T>(transport: T, reactor: Arc<Reactor>) -> Self
    where
        T: Transport + 'static,
    {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let connected = Arc::new(AtomicBool::new(transport.is_connected()));
        let registration = reactor.register();

        tokio::spawn(drive(
            transport,
            command_rx,
            Arc::clone(&connected),
            reactor,
            registration,
        ));

        Self {
            commands,
            connected,
        }
    }

    /// Submit a call. Mints a uid, merges it into the payload and queues
    /// one frame; the callback fires when the matching response arrives.
    ///
    /// The payload carries everything the server dispatcher needs
    /// (`method`, `handler`, and any method-specific fields); the client
    /// only ever adds the `uid`.
    pub fn send_command(
        &self,
        callback: Callback,
        mut payload: Map<String, Value>,
    ) -> Result<String, ClientError> {
        let uid = Uuid::new_v4().simple().to_string();
        payload.insert("uid".to_string(), Value::String(uid.clone()));
        let frame = serde_json::to_string(&Value::Object(payload))?;
        let deadline = callback.deadline;

        trace!(uid, "client: submitting call");
        self.commands
            .send(Command::Send {
                uid: uid.clone(),
                frame,
                callback,
                deadline,
            })
            .map_err(|_| ClientError::Closed)?;
        Ok(uid)
    }

    /// Submit the reserved heartbeat request (`method: "check"`); a healthy
    /// server answers `{"uid": .., "message": "Ok"}`.
    pub fn send_check(&self, callback: Callback) -> Result<String, ClientError> {
        let mut payload = Map::new();
        payload.insert("method".to_string(), Value::String("check".to_string()));
        self.send_command(callback, payload)
    }

    /// Close the client: every pending callback fires with
    /// `{"success": false, "error": "closed"}`. Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Whether the underlying transport is still usable.
    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.commands.is_closed()
    }
}

// ============================================================================
// Driver task
// ============================================================================

async fn drive<T>(
    transport: T,
    mut commands: mpsc::UnboundedReceiver<Command>,
    connected: Arc<AtomicBool>,
    reactor: Arc<Reactor>,
    mut registration: Registration,
) where
    T: Transport + 'static,
{
    let transport = Arc::new(Mutex::new(transport));
    let mut pending: HashMap<String, PendingCall> = HashMap::new();
    let mut deadlines: BinaryHeap<Reverse<(Instant, String)>> = BinaryHeap::new();

    loop {
        let next_deadline = deadlines.peek().map(|Reverse((when, _))| *when);

        tokio::select! {
            maybe_command = commands.recv() => match maybe_command {
                Some(Command::Send { uid, frame, callback, deadline }) => {
                    if let Some(after) = deadline {
                        deadlines.push(Reverse((Instant::now() + after, uid.clone())));
                    }
                    pending.insert(uid, PendingCall::Waiting(callback));

                    let mut guard = transport.lock().await;
                    if let Err(e) = guard.send(&frame).await {
                        error!("client: send failed, closing: {}", e);
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    debug!("client: close requested");
                    break;
                }
            },
            received = async {
                let mut guard = transport.lock().await;
                guard.receive().await
            } => match received {
                Ok(frame) => dispatch_frame(&frame, &mut pending),
                Err(_) => {
                    debug!("client: transport disconnected");
                    break;
                }
            },
            _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(Instant::now)),
                if next_deadline.is_some() =>
            {
                expire_deadlines(&mut pending, &mut deadlines);
            }
            _ = registration.terminated() => {
                debug!("client: reactor requested shutdown");
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    fail_pending(pending);

    let mut guard = transport.lock().await;
    let _ = guard.close().await;
    reactor.unregister(registration.id());
    trace!("client: driver task finished");
}

/// Parse one inbound frame and resolve the matching pending call.
fn dispatch_frame(frame: &str, pending: &mut HashMap<String, PendingCall>) {
    let response: Value = match serde_json::from_str(&escape_raw_tabs(frame)) {
        Ok(value) => value,
        Err(e) => {
            warn!("client: discarding unparseable frame: {}", e);
            return;
        }
    };

    let Some(uid) = response.get("uid").and_then(Value::as_str).map(str::to_owned) else {
        warn!("client: discarding response without uid");
        return;
    };

    match pending.remove(&uid) {
        Some(PendingCall::Waiting(callback)) => {
            trace!(uid, "client: dispatching response");
            callback.fire(response);
        }
        Some(PendingCall::TimedOut) => {
            warn!(uid, "client: discarding late response for timed out call");
        }
        None => {
            warn!(uid, "client: no pending callback for response");
        }
    }
}

/// Fire every expired deadline. The entry stays behind marked timed out,
/// with a second heap entry scheduled to reap the marker once
/// [`TIMED_OUT_RETENTION`] has passed without the late response showing up.
fn expire_deadlines(
    pending: &mut HashMap<String, PendingCall>,
    deadlines: &mut BinaryHeap<Reverse<(Instant, String)>>,
) {
    let now = Instant::now();
    while deadlines
        .peek()
        .is_some_and(|Reverse((when, _))| *when <= now)
    {
        let Some(Reverse((_, uid))) = deadlines.pop() else {
            break;
        };
        match pending.remove(&uid) {
            Some(PendingCall::Waiting(callback)) => {
                warn!(uid, "client: call timed out");
                pending.insert(uid.clone(), PendingCall::TimedOut);
                deadlines.push(Reverse((now + TIMED_OUT_RETENTION, uid.clone())));
                callback.fire(json!({
                    "uid": uid,
                    "success": false,
                    "status": "timed_out",
                }));
            }
            Some(PendingCall::TimedOut) => {
                trace!(uid, "client: reaping timed out marker");
            }
            // Resolved before its deadline; nothing to do.
            None => {}
        }
    }
}

/// Resolve every still-waiting call with a synthetic failure.
fn fail_pending(pending: HashMap<String, PendingCall>) {
    for (uid, call) in pending {
        if let PendingCall::Waiting(callback) = call {
            debug!(uid, "client: failing pending call on close");
            callback.fire(json!({
                "uid": uid,
                "success": false,
                "error": "closed",
            }));
        }
    }
}
