//! Network endpoints that stream frames to remote clients.
//!
//! Two transports share one [`Broadcaster`]:
//!
//! - WebSocket: one text message per frame, served at `/` (and `/ws`).
//! - TCP: newline-delimited JSON, one line per frame.
//!
//! A client attaches by connecting and receives every frame published from
//! then on, without sending anything. Each client drains its own subscriber
//! queue, so a stalled client only ever loses its own frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broadcast::{Broadcaster, Payload};
use crate::error::{Error, Result};

/// How long `shutdown` waits for a server task to finish.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

async fn bind(listen: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(listen)
        .await
        .map_err(|source| Error::Bind {
            addr: listen,
            source,
        })
}

/// Handle for a running push endpoint.
#[derive(Debug)]
pub struct PushServerHandle {
    kind: &'static str,
    address: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl PushServerHandle {
    /// Return the bound listening address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Which transport this endpoint speaks.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Stop accepting clients, detach the attached ones and wait for the
    /// server task to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the task panicked or did not finish in time.
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.task).await {
            Ok(Ok(())) => {
                info!(kind = self.kind, address = %self.address, "push endpoint stopped");
                Ok(())
            }
            Ok(Err(err)) => Err(Error::internal(format!(
                "{} push endpoint task failed: {err}",
                self.kind
            ))),
            Err(_) => Err(Error::Timeout {
                operation: format!("{} push endpoint shutdown", self.kind),
            }),
        }
    }
}

#[derive(Debug)]
struct PushState {
    broadcaster: Arc<Broadcaster>,
    send_timeout: Duration,
    shutdown: watch::Receiver<bool>,
}

/// Builder for the WebSocket endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketServer {
    listen: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    send_timeout: Duration,
}

impl WebSocketServer {
    /// Create a builder bound to `listen`, fed by `broadcaster`.
    #[must_use]
    pub fn new(listen: SocketAddr, broadcaster: Arc<Broadcaster>, send_timeout: Duration) -> Self {
        Self {
            listen,
            broadcaster,
            send_timeout,
        }
    }

    /// Bind and start serving.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound.
    pub async fn spawn(self) -> Result<PushServerHandle> {
        let listener = bind(self.listen).await?;
        let address = listener.local_addr()?;
        info!(%address, "websocket push endpoint listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(PushState {
            broadcaster: self.broadcaster,
            send_timeout: self.send_timeout,
            shutdown: shutdown_rx.clone(),
        });

        let app = Router::new()
            .route("/", get(upgrade_handler))
            .route("/ws", get(upgrade_handler))
            .with_state(state);

        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                warn!(error = %err, "websocket push endpoint exited with error");
            }
        });

        Ok(PushServerHandle {
            kind: "websocket",
            address,
            shutdown: shutdown_tx,
            task,
        })
    }
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<PushState>>,
) -> axum::response::Response {
    ws.on_upgrade(|socket| websocket_client(socket, state))
}

async fn websocket_client(mut socket: WebSocket, state: Arc<PushState>) {
    let mut subscription = state.broadcaster.register();
    let id = subscription.id();
    let mut shutdown = state.shutdown.clone();
    info!(subscriber = %id, "websocket client attached");

    loop {
        tokio::select! {
            payload = subscription.recv() => {
                // `None` means the broadcaster already dropped us.
                let Some(payload) = payload else { break };
                let send = socket.send(Message::Text(payload.to_string()));
                match tokio::time::timeout(state.send_timeout, send).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(subscriber = %id, error = %err, "websocket send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(subscriber = %id, "websocket send timed out");
                        break;
                    }
                }
            }
            message = socket.recv() => {
                match message {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    // Clients have nothing to say; pings are answered by the protocol layer.
                    Some(Ok(_)) => {}
                }
            }
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.broadcaster.unregister(id);
    info!(subscriber = %id, "websocket client detached");
}

/// Builder for the newline-delimited TCP endpoint.
#[derive(Debug, Clone)]
pub struct TcpServer {
    listen: SocketAddr,
    broadcaster: Arc<Broadcaster>,
    send_timeout: Duration,
}

impl TcpServer {
    /// Create a builder bound to `listen`, fed by `broadcaster`.
    #[must_use]
    pub fn new(listen: SocketAddr, broadcaster: Arc<Broadcaster>, send_timeout: Duration) -> Self {
        Self {
            listen,
            broadcaster,
            send_timeout,
        }
    }

    /// Bind and start accepting clients.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Bind`] if the address cannot be bound.
    pub async fn spawn(self) -> Result<PushServerHandle> {
        let listener = bind(self.listen).await?;
        let address = listener.local_addr()?;
        info!(%address, "tcp push endpoint listening");

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let state = Arc::new(PushState {
            broadcaster: self.broadcaster,
            send_timeout: self.send_timeout,
            shutdown: shutdown_rx.clone(),
        });

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            tokio::spawn(tcp_client(stream, peer, Arc::clone(&state)));
                        }
                        Err(err) => warn!(error = %err, "failed to accept tcp client"),
                    },
                    _ = shutdown_rx.changed() => break,
                }
            }
        });

        Ok(PushServerHandle {
            kind: "tcp",
            address,
            shutdown: shutdown_tx,
            task,
        })
    }
}

async fn tcp_client(stream: TcpStream, peer: SocketAddr, state: Arc<PushState>) {
    let mut subscription = state.broadcaster.register();
    let id = subscription.id();
    let mut shutdown = state.shutdown.clone();
    let (mut reader, mut writer) = stream.into_split();
    let mut scratch = [0u8; 256];
    info!(subscriber = %id, %peer, "tcp client attached");

    loop {
        tokio::select! {
            payload = subscription.recv() => {
                let Some(payload) = payload else { break };
                match tokio::time::timeout(state.send_timeout, write_line(&mut writer, &payload)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(subscriber = %id, error = %err, "tcp send failed");
                        break;
                    }
                    Err(_) => {
                        warn!(subscriber = %id, "tcp send timed out");
                        break;
                    }
                }
            }
            read = reader.read(&mut scratch) => {
                // Anything the client sends is ignored; EOF or an error means it left.
                if matches!(read, Ok(0) | Err(_)) {
                    break;
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    state.broadcaster.unregister(id);
    info!(subscriber = %id, %peer, "tcp client detached");
}

async fn write_line(
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    payload: &Payload,
) -> std::io::Result<()> {
    writer.write_all(payload.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use futures_util::StreamExt;
    use tokio::io::AsyncBufReadExt;
    use tokio::time::{sleep, timeout};
    use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};

    use super::*;
    use crate::telemetry::{Field, Reading, Schema, TelemetryFrame};

    fn frame(yaw: f64) -> TelemetryFrame {
        let mut reading = Reading::zeroed(Schema::Attitude);
        reading.set(Field::Yaw, yaw);
        TelemetryFrame::new(reading)
    }

    async fn wait_for_subscribers(broadcaster: &Broadcaster, count: usize) {
        timeout(Duration::from_secs(5), async {
            while broadcaster.subscriber_count() != count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("subscriber count never reached");
    }

    fn any_local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_websocket_client_receives_frames() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let handle = WebSocketServer::new(any_local(), Arc::clone(&broadcaster), Duration::from_secs(1))
            .spawn()
            .await
            .unwrap();
        assert_eq!(handle.kind(), "websocket");

        let url = format!("ws://{}/", handle.local_addr());
        let (mut socket, _response) = connect_async(url.as_str()).await.unwrap();
        wait_for_subscribers(&broadcaster, 1).await;

        let sent = frame(12.0);
        broadcaster.publish(&sent);

        let received = timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match received {
            WsMessage::Text(text) => {
                let decoded: TelemetryFrame = serde_json::from_str(&text).unwrap();
                assert_eq!(decoded, sent);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        drop(socket);
        wait_for_subscribers(&broadcaster, 0).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_tcp_clients_receive_newline_delimited_frames_in_order() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let handle = TcpServer::new(any_local(), Arc::clone(&broadcaster), Duration::from_secs(1))
            .spawn()
            .await
            .unwrap();

        let first = TcpStream::connect(handle.local_addr()).await.unwrap();
        let second = TcpStream::connect(handle.local_addr()).await.unwrap();
        wait_for_subscribers(&broadcaster, 2).await;

        for yaw in [1.0, 2.0, 3.0] {
            broadcaster.publish(&frame(yaw));
        }

        for stream in [first, second] {
            let mut lines = tokio::io::BufReader::new(stream).lines();
            for expected in [1.0, 2.0, 3.0] {
                let line = timeout(Duration::from_secs(5), lines.next_line())
                    .await
                    .unwrap()
                    .unwrap()
                    .unwrap();
                let decoded: TelemetryFrame = serde_json::from_str(&line).unwrap();
                assert_eq!(decoded.reading.get(Field::Yaw), Some(expected));
            }
        }

        wait_for_subscribers(&broadcaster, 0).await;
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_departed_tcp_client_does_not_affect_others() {
        let broadcaster = Arc::new(Broadcaster::new(16));
        let handle = TcpServer::new(any_local(), Arc::clone(&broadcaster), Duration::from_secs(1))
            .spawn()
            .await
            .unwrap();

        let leaving = TcpStream::connect(handle.local_addr()).await.unwrap();
        let staying = TcpStream::connect(handle.local_addr()).await.unwrap();
        wait_for_subscribers(&broadcaster, 2).await;

        drop(leaving);
        wait_for_subscribers(&broadcaster, 1).await;

        broadcaster.publish(&frame(5.0));
        let mut lines = tokio::io::BufReader::new(staying).lines();
        let line = timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(line.contains("\"yaw\":5.0"));

        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict_is_reported() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let first = TcpServer::new(any_local(), Arc::clone(&broadcaster), Duration::from_secs(1))
            .spawn()
            .await
            .unwrap();

        let err = TcpServer::new(first.local_addr(), broadcaster, Duration::from_secs(1))
            .spawn()
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));

        first.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_detaches_clients() {
        let broadcaster = Arc::new(Broadcaster::new(4));
        let handle = TcpServer::new(any_local(), Arc::clone(&broadcaster), Duration::from_secs(1))
            .spawn()
            .await
            .unwrap();

        let _client = TcpStream::connect(handle.local_addr()).await.unwrap();
        wait_for_subscribers(&broadcaster, 1).await;

        handle.shutdown().await.unwrap();
        wait_for_subscribers(&broadcaster, 0).await;
    }
}
