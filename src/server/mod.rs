// ============================================================================
// Transport Endpoint
// ============================================================================
//
// Newline-delimited JSON over TCP. Every `call` runs in its own task and its
// reply is queued to a per-connection writer, so replies may leave in any
// order and are matched to calls by `reference` alone.
//
// ============================================================================

pub mod envelope;
pub mod health;

pub use envelope::{Inbound, Outbound, Parsed, UNKNOWN_REQUEST, parse_line};
pub use health::HealthCheck;

use crate::service::{BatchService, Reply};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct EndpointMetrics {
    connections: AtomicU64,
    calls: AtomicU64,
}

pub struct BatchServer {
    name: String,
    service: BatchService,
    health: HealthCheck,
    metrics: Arc<EndpointMetrics>,
}

impl BatchServer {
    pub fn new(name: &str, service: BatchService, health: HealthCheck) -> Self {
        Self {
            name: name.to_string(),
            service,
            health,
            metrics: Arc::new(EndpointMetrics::default()),
        }
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> u64 {
        self.metrics.connections.load(Ordering::Relaxed)
    }

    /// Calls dispatched so far; unknown requests and casts are not counted.
    pub fn calls(&self) -> u64 {
        self.metrics.calls.load(Ordering::Relaxed)
    }

    pub async fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        TcpListener::bind(addr).await
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        info!(name = %self.name, addr = ?listener.local_addr()?, "Batch endpoint listening");

        loop {
            let (socket, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => accepted?,
            };
            let count = self.metrics.connections.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(%peer, connections = count, "Accepted connection");

            let connection = Connection {
                service: self.service.clone(),
                health: self.health.clone(),
                metrics: Arc::clone(&self.metrics),
                shutdown: shutdown.child_token(),
            };
            tokio::spawn(async move {
                if let Err(err) = connection.run(socket).await {
                    error!(%peer, "Connection error: {err}");
                }
            });
        }

        info!(
            name = %self.name,
            connections = self.connections(),
            calls = self.calls(),
            "Batch endpoint stopped"
        );
        Ok(())
    }
}

struct Connection {
    service: BatchService,
    health: HealthCheck,
    metrics: Arc<EndpointMetrics>,
    shutdown: CancellationToken,
}

impl Connection {
    async fn run(self, socket: TcpStream) -> io::Result<()> {
        let (reader, mut writer) = socket.into_split();
        let (replies, mut outbox) = mpsc::unbounded_channel::<Outbound>();

        let write_task = tokio::spawn(async move {
            while let Some(outbound) = outbox.recv().await {
                let mut line = match serde_json::to_vec(&outbound) {
                    Ok(line) => line,
                    Err(err) => {
                        error!("Failed to encode reply: {err}");
                        continue;
                    }
                };
                line.push(b'\n');
                writer.write_all(&line).await?;
            }
            writer.shutdown().await
        });

        let mut lines = BufReader::new(reader).lines();
        loop {
            let line = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            self.dispatch(&line, &replies).await;
        }

        // The writer drains once every in-flight call has replied.
        drop(replies);
        write_task.await.map_err(io::Error::other)?
    }

    async fn dispatch(&self, line: &str, replies: &mpsc::UnboundedSender<Outbound>) {
        match parse_line(line) {
            Parsed::Message(Inbound::Call {
                reference,
                payload,
                request_id,
            }) => {
                self.metrics.calls.fetch_add(1, Ordering::Relaxed);
                let request_id = request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let service = self.service.clone();
                let cancel = self.shutdown.child_token();
                let replies = replies.clone();

                tokio::spawn(async move {
                    let reply = service
                        .handle_with(payload.as_bytes(), &request_id, &cancel)
                        .await;
                    if replies.send(Outbound { reference, reply }).is_err() {
                        warn!(%request_id, "Connection closed before reply was sent");
                    }
                });
            }
            Parsed::Message(Inbound::Cast { message }) if message == "check" => {
                if let Err(err) = self.health.touch().await {
                    error!(path = ?self.health.path(), "Failed to touch health check file: {err}");
                }
            }
            Parsed::Message(Inbound::Cast { message }) => {
                warn!(%message, "Ignoring unknown cast");
            }
            Parsed::Unknown { reference } => {
                let unknown = Outbound {
                    reference,
                    reply: Reply::error(UNKNOWN_REQUEST),
                };
                if replies.send(unknown).is_err() {
                    warn!("Connection closed before unknown_request reply was sent");
                }
            }
            Parsed::Garbage(reason) => {
                warn!("Dropping unreadable message: {reason}");
            }
        }
    }
}
