//! Test doubles: an in-process JSON server and small recording helpers.
//!
//! [`FakeJsonServer`] speaks the real wire protocol over real sockets, so
//! transport, client and worker tests exercise the same code paths as a
//! production session. Handlers map one request to zero or more responses,
//! which makes held-back and out-of-order replies easy to script.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::Instant;
use tracing::debug;

use crate::interpreter::Interpreter;
use crate::transport::{Endpoint, StreamTransport, Transport, TransportError};
use crate::workers::process::ProcessStrategy;
use crate::workers::{Diagnostic, Notifier, StartupError};

type Handler = Arc<dyn Fn(Value) -> Vec<Value> + Send + Sync>;

// ============================================================================
// Fake server
// ============================================================================

/// In-process JSON server for tests. Accepts any number of connections and
/// answers each parsed request through its handler.
pub struct FakeJsonServer {
    endpoint: Endpoint,
    stop: watch::Sender<bool>,
    accept_task: StdMutex<Option<tokio::task::JoinHandle<()>>>,
}

impl FakeJsonServer {
    /// Echo server: `check` requests get the canonical heartbeat answer,
    /// everything else is reflected back unchanged.
    pub async fn echo() -> Self {
        Self::with_handler(echo_handler).await
    }

    /// Echo server on a fixed port, for tests that bring a server back on
    /// the endpoint a client already knows.
    pub async fn echo_on(port: u16) -> Self {
        let listener = Self::bind_retrying(port).await;
        Self::serve_tcp(listener, Arc::new(echo_handler), None)
    }

    /// Echo server on a Unix domain socket.
    #[cfg(unix)]
    pub async fn echo_unix(path: &std::path::Path) -> Self {
        let listener = UnixListener::bind(path).expect("bind unix listener");
        let (stop, stop_rx) = watch::channel(false);
        let handler: Handler = Arc::new(echo_handler);

        let endpoint = Endpoint::Unix(path.to_path_buf());
        let accept_task = tokio::spawn(accept_loop_unix(listener, handler, None, stop_rx));
        Self {
            endpoint,
            stop,
            accept_task: StdMutex::new(Some(accept_task)),
        }
    }

    /// Server with a scripted handler.
    pub async fn with_handler<F>(handler: F) -> Self
    where
        F: Fn(Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = Self::bind_retrying(0).await;
        Self::serve_tcp(listener, Arc::new(handler), None)
    }

    /// Server that sits on every request for `delay` before answering.
    pub async fn with_delayed_handler<F>(delay: Duration, handler: F) -> Self
    where
        F: Fn(Value) -> Vec<Value> + Send + Sync + 'static,
    {
        let listener = Self::bind_retrying(0).await;
        Self::serve_tcp(listener, Arc::new(handler), Some(delay))
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint.clone()
    }

    /// Stop accepting and drop every open connection. The listener is
    /// released before this returns.
    pub async fn shutdown(&self) {
        let _ = self.stop.send(true);
        let accept_task = self.accept_task.lock().unwrap().take();
        if let Some(accept_task) = accept_task {
            let _ = accept_task.await;
        }
        // Connection tasks observe the same signal on their next poll.
        tokio::task::yield_now().await;
    }

    fn serve_tcp(listener: TcpListener, handler: Handler, delay: Option<Duration>) -> Self {
        let address = listener.local_addr().expect("listener address");
        let (stop, stop_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop_tcp(listener, handler, delay, stop_rx));
        Self {
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: address.port(),
            },
            stop,
            accept_task: StdMutex::new(Some(accept_task)),
        }
    }

    /// Bind, tolerating the short window where a just-shut-down listener
    /// still holds the port.
    async fn bind_retrying(port: u16) -> TcpListener {
        for _ in 0..50 {
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return listener,
                Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
            }
        }
        panic!("could not bind 127.0.0.1:{port}");
    }
}

fn echo_handler(request: Value) -> Vec<Value> {
    if request.get("method").and_then(Value::as_str) == Some("check") {
        return vec![json!({"uid": request["uid"], "message": "Ok"})];
    }
    vec![request]
}

async fn accept_loop_tcp(
    listener: TcpListener,
    handler: Handler,
    delay: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "FakeJsonServer: accepted connection");
                    let _ = stream.set_nodelay(true);
                    tokio::spawn(serve_connection(
                        StreamTransport::from_stream(stream),
                        Arc::clone(&handler),
                        delay,
                        stop.clone(),
                    ));
                }
                Err(_) => break,
            },
        }
    }
}

#[cfg(unix)]
async fn accept_loop_unix(
    listener: UnixListener,
    handler: Handler,
    delay: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_connection(
                        StreamTransport::from_stream(stream),
                        Arc::clone(&handler),
                        delay,
                        stop.clone(),
                    ));
                }
                Err(_) => break,
            },
        }
    }
}

async fn serve_connection(
    mut transport: StreamTransport,
    handler: Handler,
    delay: Option<Duration>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => break,
            received = transport.receive() => {
                let Ok(frame) = received else { break };
                let Ok(request) = serde_json::from_str::<Value>(&frame) else {
                    continue;
                };
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                for response in handler(request) {
                    if transport.send(&response.to_string()).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
    let _ = transport.close().await;
}

// ============================================================================
// Mock transport
// ============================================================================

/// In-memory [`Transport`] with no socket behind it. The paired
/// [`MockTransportHandle`] scripts inbound frames and inspects what the
/// client sent, which makes wire-level edge cases (malformed frames,
/// abrupt disconnects) trivial to stage.
pub struct MockTransport {
    inbound: mpsc::UnboundedReceiver<String>,
    sent: Arc<StdMutex<Vec<String>>>,
    connected: bool,
}

/// Scripting side of a [`MockTransport`]. Dropping the handle ends the
/// inbound stream, which the owner observes as a disconnect.
pub struct MockTransportHandle {
    inbound: mpsc::UnboundedSender<String>,
    sent: Arc<StdMutex<Vec<String>>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockTransportHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let sent = Arc::new(StdMutex::new(Vec::new()));
        (
            Self {
                inbound: inbound_rx,
                sent: Arc::clone(&sent),
                connected: true,
            },
            MockTransportHandle {
                inbound: inbound_tx,
                sent,
            },
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = TransportError;

    async fn send(&mut self, frame: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.sent.lock().unwrap().push(frame.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }
        self.inbound.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.inbound.close();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

impl MockTransportHandle {
    /// Queue one inbound frame for the owning transport.
    pub fn push_frame(&self, frame: impl Into<String>) {
        let _ = self.inbound.send(frame.into());
    }

    /// Snapshot of every frame sent so far.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// Wait until at least `n` frames were sent and return a snapshot.
    /// Panics after five seconds; a test that waits longer is stuck.
    pub async fn wait_for_sent(&self, n: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            {
                let sent = self.sent.lock().unwrap();
                if sent.len() >= n {
                    return sent.clone();
                }
            }
            if Instant::now() >= deadline {
                panic!("waited 5s for {n} sent frames, have {}", self.sent().len());
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ============================================================================
// Response recording
// ============================================================================

/// Shared log of callback responses with a bounded wait.
#[derive(Clone, Default)]
pub struct ResponseLog {
    entries: Arc<StdMutex<Vec<Value>>>,
    arrived: Arc<Notify>,
}

impl ResponseLog {
    pub fn push(&self, response: Value) {
        self.entries.lock().unwrap().push(response);
        self.arrived.notify_waiters();
    }

    pub fn count(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Wait until at least `n` responses arrived and return a snapshot.
    /// Panics after five seconds; a test that waits longer is stuck.
    pub async fn wait_for(&self, n: usize) -> Vec<Value> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let notified = self.arrived.notified();
            {
                let entries = self.entries.lock().unwrap();
                if entries.len() >= n {
                    return entries.clone();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                panic!("waited 5s for {n} responses, have {}", self.count());
            }
        }
    }
}

/// A response log plus a closure suitable as a callback handler.
pub fn recorder() -> (ResponseLog, impl Fn(Value) + Send + 'static) {
    let log = ResponseLog::default();
    let sink = log.clone();
    (log, move |response| sink.push(response))
}

// ============================================================================
// Worker doubles
// ============================================================================

/// Notifier that counts alerts instead of showing dialogs.
#[derive(Default)]
pub struct CountingNotifier {
    alerts: AtomicUsize,
}

impl CountingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> usize {
        self.alerts.load(Ordering::SeqCst)
    }
}

impl Notifier for CountingNotifier {
    fn alert(&self, diagnostic: &Diagnostic) {
        debug!("CountingNotifier: {}", diagnostic.error);
        self.alerts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Scriptable process strategy: succeed, fail to start, or report a dead
/// child right after a successful start.
pub struct MockProcess {
    fail_with: Option<String>,
    dies_after_start: bool,
    started: bool,
}

impl MockProcess {
    /// Starts and stays healthy.
    pub fn ok() -> Self {
        Self {
            fail_with: None,
            dies_after_start: false,
            started: false,
        }
    }

    /// Fails every start with the given error text.
    pub fn failing(error: &str) -> Self {
        Self {
            fail_with: Some(error.to_string()),
            dies_after_start: false,
            started: false,
        }
    }

    /// Starts, then reports the child as terminated.
    pub fn dying() -> Self {
        Self {
            fail_with: None,
            dies_after_start: true,
            started: false,
        }
    }
}

#[async_trait]
impl ProcessStrategy for MockProcess {
    async fn start(&mut self, _interpreter: &mut Interpreter) -> Result<(), StartupError> {
        if let Some(error) = &self.fail_with {
            return Err(StartupError::Fault(Diagnostic::new(
                error.clone(),
                "fix the interpreter setting",
            )));
        }
        self.started = true;
        Ok(())
    }

    fn healthy(&mut self) -> Result<(), Diagnostic> {
        if self.dies_after_start && self.started {
            return Err(Diagnostic::new(
                "the server process is terminated",
                "check your configuration",
            ));
        }
        Ok(())
    }

    async fn stop(&mut self) {
        self.started = false;
    }
}
