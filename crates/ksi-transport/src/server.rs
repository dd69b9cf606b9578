//! Accept loop and per-connection tasks.
//!
//! # Per-connection layout
//!
//! - **reader task**: reads frames, stamps the connection's `client_id`,
//!   and `try_send`s onto a bounded inbound channel. A full channel
//!   answers the client with a `capacity` error frame instead of ever
//!   applying backpressure to the socket read loop.
//! - **dispatcher task**: drains the inbound channel strictly in order,
//!   submits each frame to the router, and forwards the reply frame —
//!   requests on one connection answer in the order they arrived.
//! - **writer task**: the connection's only writer. Drains the response
//!   channel and the connection's subscription delivery queue (responses
//!   first), so stream frames and replies interleave safely.

use std::sync::Arc;

use dashmap::DashMap;
use ksi_config::TransportSection;
use ksi_core::{ClientId, ErrorFrame, EventName, EventOrigin, KsiError};
use ksi_router::{DeliveryQueue, RouterHandle, SubscriptionRegistry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::framing::{read_frame, write_frame};

// ---------------------------------------------------------------------------
// Client registry
// ---------------------------------------------------------------------------

/// One live connection's delivery surface, visible to the monitor
/// handlers so subscriptions can attach to the caller's writer.
#[derive(Debug, Clone)]
pub(crate) struct ClientHandle {
    pub(crate) outbound: Arc<DeliveryQueue>,
}

/// Live connections keyed by client id.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, ClientHandle>,
}

impl ClientRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The subscription delivery queue of a live connection.
    #[must_use]
    pub fn outbound(&self, client_id: &ClientId) -> Option<Arc<DeliveryQueue>> {
        self.clients.get(client_id).map(|h| Arc::clone(&h.outbound))
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Whether no connections are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn insert(&self, client_id: ClientId, handle: ClientHandle) {
        self.clients.insert(client_id, handle);
    }

    fn remove(&self, client_id: &ClientId) {
        self.clients.remove(client_id);
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// The transport server; owns the accept loop.
pub struct TransportServer {
    config: TransportSection,
    router: RouterHandle,
    clients: Arc<ClientRegistry>,
    subscriptions: Arc<SubscriptionRegistry>,
}

impl std::fmt::Debug for TransportServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportServer")
            .field("socket", &self.config.socket_path)
            .finish_non_exhaustive()
    }
}

impl TransportServer {
    /// Assemble a server.
    #[must_use]
    pub fn new(
        config: TransportSection,
        router: RouterHandle,
        clients: Arc<ClientRegistry>,
        subscriptions: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            config,
            router,
            clients,
            subscriptions,
        }
    }

    /// Bind the socket and spawn the accept loop.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the socket cannot be bound.
    pub fn spawn(self) -> TransportResult<tokio::task::JoinHandle<()>> {
        let path = &self.config.socket_path;
        if path.exists() {
            // Stale socket from an unclean shutdown.
            let _ = std::fs::remove_file(path);
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        info!(path = %path.display(), "listening on local unix socket");

        Ok(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let client_id = ClientId::new();
                        debug!(client = %client_id, "client connected");
                        self.spawn_connection(client_id, stream);
                    },
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    },
                }
            }
        }))
    }

    fn spawn_connection(&self, client_id: ClientId, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let outbound = DeliveryQueue::new(self.config.outbound_watermark);
        self.clients.insert(
            client_id.clone(),
            ClientHandle {
                outbound: Arc::clone(&outbound),
            },
        );

        let (response_tx, response_rx) = mpsc::channel::<serde_json::Value>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<serde_json::Value>(self.config.inbound_capacity);

        tokio::spawn(writer_task(write_half, response_rx, Arc::clone(&outbound)));
        tokio::spawn(dispatcher_task(
            self.router.clone(),
            client_id.clone(),
            inbound_rx,
            response_tx.clone(),
        ));

        let clients = Arc::clone(&self.clients);
        let subscriptions = Arc::clone(&self.subscriptions);
        let max_frame = self.config.max_frame_bytes;
        tokio::spawn(async move {
            reader_task(read_half, max_frame, inbound_tx, response_tx).await;
            // Disconnect: reap the connection's subscriptions, close the
            // queue so the writer task drains out, drop the registry entry.
            let reaped = subscriptions.remove_client(&client_id);
            outbound.close();
            clients.remove(&client_id);
            debug!(client = %client_id, reaped, "client disconnected");
        });
    }
}

// ---------------------------------------------------------------------------
// Connection tasks
// ---------------------------------------------------------------------------

async fn reader_task<R: AsyncRead + Unpin>(
    mut reader: R,
    max_frame: usize,
    inbound: mpsc::Sender<serde_json::Value>,
    responses: mpsc::Sender<serde_json::Value>,
) {
    loop {
        match read_frame(&mut reader, max_frame).await {
            Ok(None) => break,
            Ok(Some(frame)) => {
                if let Err(mpsc::error::TrySendError::Full(_)) = inbound.try_send(frame) {
                    // Inbound overrun: the client sees busy, the router
                    // never sees the frame.
                    let busy = KsiError::capacity("inbound queue full");
                    let frame = serde_json::to_value(ErrorFrame::from_error(&busy, None))
                        .unwrap_or_default();
                    if responses.send(frame).await.is_err() {
                        break;
                    }
                } else if inbound.is_closed() {
                    break;
                }
            },
            Err(TransportError::FrameTooLarge { got, cap }) => {
                let err = KsiError::invalid_argument(format!(
                    "frame of {got} bytes exceeds cap of {cap}"
                ));
                let frame =
                    serde_json::to_value(ErrorFrame::from_error(&err, None)).unwrap_or_default();
                let _ = responses.send(frame).await;
                break;
            },
            Err(e) => {
                debug!(error = %e, "read failed; dropping connection");
                break;
            },
        }
    }
}

/// Drain inbound frames strictly in order; replies go out in arrival
/// order.
async fn dispatcher_task(
    router: RouterHandle,
    client_id: ClientId,
    mut inbound: mpsc::Receiver<serde_json::Value>,
    responses: mpsc::Sender<serde_json::Value>,
) {
    while let Some(frame) = inbound.recv().await {
        let reply = handle_request(&router, &client_id, frame).await;
        if responses.send(reply).await.is_err() {
            break;
        }
    }
}

/// Parse one request frame and run it through the router.
async fn handle_request(
    router: &RouterHandle,
    client_id: &ClientId,
    frame: serde_json::Value,
) -> serde_json::Value {
    let name = frame.get("event").and_then(|v| v.as_str()).unwrap_or_default();
    let name = match EventName::parse(name) {
        Ok(name) => name,
        Err(e) => return error_frame(&e),
    };
    let data = frame.get("data").cloned().unwrap_or_else(|| serde_json::json!({}));
    if !data.is_object() {
        return error_frame(&KsiError::invalid_argument("data must be an object"));
    }
    // Any context a client supplies is discarded; the router stamps its own.
    match router
        .submit(name, data, EventOrigin::Client(client_id.clone()))
        .await
    {
        Ok(results) => match results.len() {
            1 => results.into_iter().next().unwrap_or_default(),
            _ => serde_json::Value::Array(results),
        },
        Err(e) => error_frame(&e),
    }
}

fn error_frame(err: &KsiError) -> serde_json::Value {
    serde_json::to_value(ErrorFrame::from_error(err, None)).unwrap_or_default()
}

/// The single writer for a connection: responses first, then stream
/// frames from the subscription queue.
async fn writer_task<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut responses: mpsc::Receiver<serde_json::Value>,
    outbound: Arc<DeliveryQueue>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            response = responses.recv() => match response {
                Some(frame) => frame,
                None => break,
            },
            event = outbound.pop() => match event {
                Some(event) => match serde_json::to_value(event.as_ref()) {
                    Ok(frame) => frame,
                    Err(_) => continue,
                },
                None => break,
            },
        };
        if write_frame(&mut writer, &frame).await.is_err() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_router::{
        CapabilityIndex, EventLog, HandlerRegistry, HandlerSpec, OrchestrationIndex, Router,
        SubscriptionRegistry, TransformerRegistry,
    };
    use ksi_store::Store;
    use serde_json::json;

    async fn start_server() -> (std::path::PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let log = Arc::new(EventLog::open(&dir.path().join("log"), store).unwrap());
        let registry = Arc::new(HandlerRegistry::new());
        registry.register_fn(HandlerSpec::new("test:ping", "ping"), |_e, _a| async {
            Ok(json!({"pong": true}))
        });
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let router = Router::new(
            Arc::clone(&registry),
            log,
            Arc::new(TransformerRegistry::new()),
            Arc::clone(&subscriptions),
            Arc::new(OrchestrationIndex::new()),
            Arc::new(CapabilityIndex::new()),
        );
        let (handle, _join) = router.start();

        let mut config = TransportSection::default();
        config.socket_path = dir.path().join("daemon.sock");
        let socket_path = config.socket_path.clone();
        let server = TransportServer::new(
            config,
            handle,
            Arc::new(ClientRegistry::new()),
            subscriptions,
        );
        server.spawn().unwrap();
        (socket_path, dir)
    }

    #[tokio::test]
    async fn test_request_reply_over_socket() {
        let (path, _dir) = start_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_frame(&mut stream, &json!({"event": "test:ping", "data": {}}))
            .await
            .unwrap();
        let reply = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        assert_eq!(reply["pong"], true);
    }

    #[tokio::test]
    async fn test_unknown_event_yields_error_frame() {
        let (path, _dir) = start_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_frame(&mut stream, &json!({"event": "nope:nothing", "data": {}}))
            .await
            .unwrap();
        let reply = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        assert_eq!(reply["error"]["kind"], "not_found");
    }

    #[tokio::test]
    async fn test_malformed_event_name_rejected() {
        let (path, _dir) = start_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        write_frame(&mut stream, &json!({"event": "NOT A NAME", "data": {}}))
            .await
            .unwrap();
        let reply = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        assert_eq!(reply["error"]["kind"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_requests_answer_in_order() {
        let (path, _dir) = start_server().await;
        let mut stream = UnixStream::connect(&path).await.unwrap();
        for _ in 0..5 {
            write_frame(&mut stream, &json!({"event": "test:ping", "data": {}}))
                .await
                .unwrap();
        }
        for _ in 0..5 {
            let reply = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
            assert_eq!(reply["pong"], true);
        }
    }
}
