//! Inspector protocol client
//!
//! Provides async communication with the runtime inspector over a WebSocket.
//! Requests are `{"id", "method", "params"}`; the matching response carries the
//! same `id` with either `result` or `error`. Frames without an `id` are events
//! and are dispatched to the handlers registered with [`InspectorClient::on`].
//!
//! The client never reconnects by itself; retry policy belongs to the caller.

use crate::{Error, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Callback invoked with an event's params
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Events the client knows how to dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InspectorEvent {
    TestFound,
    TestStart,
    TestEnd,
    ConsoleApiCalled,
    LifecycleError,
    /// Transport established (local)
    Connected,
    /// Transport lost; params carry `{"reason": ...}` when known (local)
    Disconnected,
    /// Unreadable frame or transport error (local)
    Error,
}

impl InspectorEvent {
    pub const ALL: [InspectorEvent; 8] = [
        InspectorEvent::TestFound,
        InspectorEvent::TestStart,
        InspectorEvent::TestEnd,
        InspectorEvent::ConsoleApiCalled,
        InspectorEvent::LifecycleError,
        InspectorEvent::Connected,
        InspectorEvent::Disconnected,
        InspectorEvent::Error,
    ];

    /// Protocol method name of the event
    pub fn method(self) -> &'static str {
        match self {
            InspectorEvent::TestFound => "TestReporter.found",
            InspectorEvent::TestStart => "TestReporter.start",
            InspectorEvent::TestEnd => "TestReporter.end",
            InspectorEvent::ConsoleApiCalled => "Runtime.consoleAPICalled",
            InspectorEvent::LifecycleError => "LifecycleReporter.error",
            InspectorEvent::Connected => "Inspector.connected",
            InspectorEvent::Disconnected => "Inspector.disconnected",
            InspectorEvent::Error => "Inspector.error",
        }
    }

    pub fn from_method(method: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|event| event.method() == method)
    }
}

/// Inspector client. Cloning shares the same connection.
#[derive(Clone)]
pub struct InspectorClient {
    inner: Arc<Inner>,
}

struct Inner {
    next_id: AtomicU64,
    /// Bumped on every successful connect so a stale reader cannot tear down a newer link
    epoch: AtomicU64,
    connected: AtomicBool,
    closed: AtomicBool,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    handlers: RwLock<HashMap<InspectorEvent, Vec<EventHandler>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl InspectorClient {
    /// Create a new client (does not connect)
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_id: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                pending: Mutex::new(HashMap::new()),
                handlers: RwLock::new(HashMap::new()),
                outgoing: Mutex::new(None),
                reader: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Open the WebSocket transport.
    ///
    /// Fails on any transport-level error; the caller decides whether to retry.
    pub async fn connect(&self, url: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }

        let (stream, _response) = tokio_tungstenite::connect_async(url).await?;
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (mut sink, mut source) = stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.inner.outgoing.lock() = Some(tx);
        self.inner.connected.store(true, Ordering::SeqCst);

        let token = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    msg = rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                debug!("Inspector write failed: {}", e);
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        });

        let inner = self.inner.clone();
        let token = self.inner.shutdown.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = token.cancelled() => break None,
                    frame = source.next() => match frame {
                        Some(Ok(Message::Text(text))) => inner.handle_frame(&text),
                        Some(Ok(Message::Close(_))) | None => break None,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => break Some(e.to_string()),
                    }
                }
            };
            inner.on_disconnect(epoch, reason);
        });
        *self.inner.reader.lock() = Some(reader);

        debug!("Connected to inspector: {}", url);
        self.inner.dispatch(InspectorEvent::Connected, &Value::Null);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Wait until the peer closes the link and every frame it sent has been
    /// dispatched. Returns at once when not connected.
    pub async fn wait_disconnected(&self) {
        let reader = self.inner.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
    }

    /// Subscribe to an event. Several handlers may share one event.
    pub fn on<F>(&self, event: InspectorEvent, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner
            .handlers
            .write()
            .entry(event)
            .or_default()
            .push(Arc::new(handler));
    }

    /// Issue a command and wait for its response.
    ///
    /// Fails if the transport closes first or the inspector reports an error.
    pub async fn send(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let outgoing = self
            .inner
            .outgoing
            .lock()
            .clone()
            .ok_or(Error::NotConnected)?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let text = serde_json::to_string(&OutboundRequest { id, method, params })?;

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);

        // close()/disconnect drain `pending` after flipping these flags
        if self.is_closed() || !self.is_connected() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::ConnectionClosed);
        }

        trace!("Inspector command: {}", text);
        if outgoing.send(Message::Text(text)).is_err() {
            self.inner.pending.lock().remove(&id);
            return Err(Error::ConnectionClosed);
        }

        rx.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Send a command whose result is irrelevant
    pub async fn send_void(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.send(method, params).await.map(|_| ())
    }

    /// Close the connection. Pending commands fail with `ConnectionClosed`.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.shutdown.cancel();
        self.inner.outgoing.lock().take();
        self.inner.fail_pending();
        debug!("Inspector client closed");
    }
}

impl Default for InspectorClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn handle_frame(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Unreadable inspector frame: {}", e);
                self.dispatch(
                    InspectorEvent::Error,
                    &serde_json::json!({ "message": e.to_string() }),
                );
                return;
            }
        };

        if let Some(id) = frame.id {
            let Some(tx) = self.pending.lock().remove(&id) else {
                trace!("Response for unknown request {}", id);
                return;
            };
            let result = match frame.error {
                Some(error) => Err(Error::Remote {
                    code: error.code,
                    message: error.message,
                }),
                None => Ok(frame.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
            return;
        }

        if let Some(method) = frame.method {
            match InspectorEvent::from_method(&method) {
                Some(event) => self.dispatch(event, &frame.params),
                None => trace!("Unhandled inspector event: {}", method),
            }
        }
    }

    fn dispatch(&self, event: InspectorEvent, params: &Value) {
        let handlers = self.handlers.read().get(&event).cloned().unwrap_or_default();
        for handler in handlers {
            handler(params);
        }
    }

    fn on_disconnect(&self, epoch: u64, reason: Option<String>) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.outgoing.lock().take();
        self.fail_pending();

        match &reason {
            Some(reason) => debug!("Inspector disconnected: {}", reason),
            None => debug!("Inspector disconnected"),
        }
        self.dispatch(
            InspectorEvent::Disconnected,
            &serde_json::json!({ "reason": reason }),
        );
    }

    fn fail_pending(&self) {
        let drained: Vec<_> = self.pending.lock().drain().collect();
        for (_, tx) in drained {
            let _ = tx.send(Err(Error::ConnectionClosed));
        }
    }
}

// Inspector wire types
#[derive(Debug, Serialize)]
struct OutboundRequest<'a> {
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct InboundFrame {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<RemoteError>,
}

#[derive(Debug, Deserialize)]
struct RemoteError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::future::Future;
    use std::time::Duration;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::time::timeout;
    use tokio_tungstenite::WebSocketStream;

    type PeerSocket = WebSocketStream<TcpStream>;

    /// Spawn a one-connection inspector peer driven by `script`.
    async fn fake_inspector<F, Fut>(script: F) -> String
    where
        F: FnOnce(PeerSocket) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            script(socket).await;
        });
        format!("ws://{}/x7k2p", addr)
    }

    async fn next_request(socket: &mut PeerSocket) -> Option<Value> {
        loop {
            match socket.next().await? {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }

    async fn reply(socket: &mut PeerSocket, frame: Value) {
        socket.send(Message::Text(frame.to_string())).await.unwrap();
    }

    #[test]
    fn test_event_method_names_round_trip() {
        for event in InspectorEvent::ALL {
            assert_eq!(InspectorEvent::from_method(event.method()), Some(event));
        }
        assert_eq!(InspectorEvent::from_method("Debugger.paused"), None);
    }

    #[tokio::test]
    async fn test_responses_are_correlated_by_id() {
        let url = fake_inspector(|mut socket| async move {
            let first = next_request(&mut socket).await.unwrap();
            let second = next_request(&mut socket).await.unwrap();
            // answer out of order
            for request in [second, first] {
                let method = request["method"].clone();
                reply(&mut socket, json!({"id": request["id"], "result": {"echo": method}})).await;
            }
            let _ = next_request(&mut socket).await;
        })
        .await;

        let client = InspectorClient::new();
        client.connect(&url).await.unwrap();
        assert!(client.is_connected());

        let (a, b) = tokio::join!(
            client.send("Runtime.enable", None),
            client.send("Console.enable", Some(json!({"x": 1})))
        );
        assert_eq!(a.unwrap()["echo"], "Runtime.enable");
        assert_eq!(b.unwrap()["echo"], "Console.enable");
        client.close();
    }

    #[tokio::test]
    async fn test_remote_error_is_reported() {
        let url = fake_inspector(|mut socket| async move {
            let request = next_request(&mut socket).await.unwrap();
            reply(
                &mut socket,
                json!({"id": request["id"], "error": {"code": -32000, "message": "Debugger domain already enabled"}}),
            )
            .await;
            let _ = next_request(&mut socket).await;
        })
        .await;

        let client = InspectorClient::new();
        client.connect(&url).await.unwrap();
        let err = client.send("Debugger.enable", None).await.unwrap_err();
        assert!(err.is_already_enabled());
        client.close();
    }

    #[tokio::test]
    async fn test_events_reach_every_handler() {
        let url = fake_inspector(|mut socket| async move {
            let request = next_request(&mut socket).await.unwrap();
            reply(&mut socket, json!({"id": request["id"], "result": {}})).await;
            reply(
                &mut socket,
                json!({"method": "TestReporter.found", "params": {"id": 1, "name": "adds", "type": "test"}}),
            )
            .await;
            reply(&mut socket, json!({"method": "Heap.gc", "params": {}})).await;
            let _ = next_request(&mut socket).await;
        })
        .await;

        let client = InspectorClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        for tag in ["first", "second"] {
            let tx = tx.clone();
            client.on(InspectorEvent::TestFound, move |params| {
                let _ = tx.send((tag, params["name"].clone()));
            });
        }

        client.connect(&url).await.unwrap();
        client.send_void("TestReporter.enable", None).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let got = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            seen.push(got);
        }
        assert_eq!(seen, vec![("first", json!("adds")), ("second", json!("adds"))]);
        client.close();
    }

    #[tokio::test]
    async fn test_close_fails_pending_commands() {
        let url = fake_inspector(|mut socket| async move {
            // read but never answer
            while next_request(&mut socket).await.is_some() {}
        })
        .await;

        let client = InspectorClient::new();
        client.connect(&url).await.unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.send("Debugger.resume", None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        client.close();
        client.close();

        let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        assert!(matches!(
            client.send("Runtime.enable", None).await,
            Err(Error::ConnectionClosed)
        ));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_peer_hangup_fails_pending_and_notifies() {
        let url = fake_inspector(|mut socket| async move {
            let _ = next_request(&mut socket).await;
            drop(socket);
        })
        .await;

        let client = InspectorClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(InspectorEvent::Disconnected, move |_| {
            let _ = tx.send(());
        });
        client.connect(&url).await.unwrap();

        let result = timeout(Duration::from_secs(5), client.send("Runtime.enable", None))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_wait_disconnected_dispatches_trailing_events() {
        let url = fake_inspector(|mut socket| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            reply(
                &mut socket,
                json!({"method": "TestReporter.end", "params": {"id": 1, "status": "pass"}}),
            )
            .await;
            let _ = socket.close(None).await;
        })
        .await;

        let client = InspectorClient::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        client.on(InspectorEvent::TestEnd, move |params| {
            let _ = tx.send(params["id"].clone());
        });
        client.connect(&url).await.unwrap();

        timeout(Duration::from_secs(5), client.wait_disconnected())
            .await
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), json!(1));
        assert!(!client.is_connected());

        // nothing left to wait for
        timeout(Duration::from_millis(100), client.wait_disconnected())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = InspectorClient::new();
        let result = client.connect(&format!("ws://127.0.0.1:{}/none", port)).await;
        assert!(result.is_err());
        assert!(!client.is_connected());
        assert!(matches!(
            client.send("Runtime.enable", None).await,
            Err(Error::NotConnected)
        ));
    }
}
