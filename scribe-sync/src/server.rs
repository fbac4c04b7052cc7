//! WebSocket session gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── read loop ──► Hub (Edit, Leave)
//!             ├── /ws/<doc_id> ──────┤
//! Client B ──┘                      └── write loop ◄── SessionOutbox
//! ```
//!
//! Each connection joins the hub of the document named by its request path
//! and runs two loops: the read loop turns text frames into edits stamped
//! with the session id, the write loop forwards the session's outbox. Either
//! loop ending tears the session down; nothing propagates to other sessions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;

use crate::config::ServerConfig;
use crate::document::{Document, DocumentId};
use crate::hub::HubError;
use crate::protocol::Edit;
use crate::registry::DocumentRegistry;
use crate::session::Session;

/// How long a closing session gets to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Gateway errors. Only bind/accept failures end the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub edits_received: u64,
    pub malformed_messages: u64,
}

/// Lock-free counters behind [`ServerStats`].
#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    edits_received: AtomicU64,
    malformed_messages: AtomicU64,
}

impl AtomicServerStats {
    fn snapshot(&self) -> ServerStats {
        ServerStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            edits_received: self.edits_received.load(Ordering::Relaxed),
            malformed_messages: self.malformed_messages.load(Ordering::Relaxed),
        }
    }
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<DocumentRegistry>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a server routing sessions into `registry`.
    pub fn new(config: ServerConfig, registry: Arc<DocumentRegistry>) -> Self {
        Self {
            config,
            registry,
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create a single-instance server (no replication).
    pub fn standalone(config: ServerConfig) -> Self {
        let registry = Arc::new(DocumentRegistry::new(config.hub_config(), None));
        Self::new(config, registry)
    }

    /// Bind the configured address and serve until a fatal error.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections accepted from `listener`.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        self.registry
            .insert(Document::new(
                self.config.document_id.clone(),
                self.config.seed_text.clone(),
            ))
            .await;
        log::info!(
            "Sync server listening on {} (default document {})",
            listener.local_addr()?,
            self.config.document_id
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let registry = Arc::clone(&self.registry);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();

            tokio::spawn(async move {
                stats.total_connections.fetch_add(1, Ordering::Relaxed);
                stats.active_connections.fetch_add(1, Ordering::Relaxed);

                if let Err(e) = Self::handle_connection(stream, addr, &registry, &config, &stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }

                stats.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: &DocumentRegistry,
        config: &ServerConfig,
        stats: &AtomicServerStats,
    ) -> Result<(), ServerError> {
        let mut path = String::from("/");
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
                path = request.uri().path().to_string();
                Ok(response)
            },
        )
        .await?;

        let document_id = document_for_path(&path, &config.document_id);
        let hub = registry.acquire(&document_id).await;

        let (session, mut outbox) = Session::open(config.session_buffer);
        let session_id = session.id();
        if let Err(e) = hub.join(session).await {
            registry.release(&document_id).await;
            return Err(e.into());
        }
        log::info!("WebSocket session {session_id} from {addr} on document {document_id}");

        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        // Write loop: runs until the hub closes the outbox or the socket fails
        let mut writer = tokio::spawn(async move {
            while let Some(frame) = outbox.recv().await {
                if let Err(e) = ws_sender.send(Message::text(frame.to_string())).await {
                    log::debug!("Write to session {session_id} failed: {e}");
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        });

        // Read loop
        let writer_finished = loop {
            tokio::select! {
                _ = &mut writer => break true,

                msg = ws_receiver.next() => {
                    let text = match msg {
                        Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                        Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                            Ok(text) => text,
                            Err(_) => {
                                stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Discarding non-UTF-8 frame from session {session_id}");
                                continue;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break false;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break false;
                        }
                    };

                    match Edit::decode(&text) {
                        Ok(edit) => {
                            stats.edits_received.fetch_add(1, Ordering::Relaxed);
                            let edit = edit.authored_by(session_id.to_string());
                            if hub.submit_edit(edit).await.is_err() {
                                break false;
                            }
                        }
                        Err(e) => {
                            stats.malformed_messages.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Discarding malformed edit from session {session_id}: {e}");
                        }
                    }
                }
            }
        };

        // Cleanup: a no-op if the hub already evicted the session
        let _ = hub.leave(session_id).await;
        registry.release(&document_id).await;
        if !writer_finished {
            let _ = tokio::time::timeout(CLOSE_GRACE, writer).await;
        }
        log::info!("WebSocket session {session_id} from {addr} ended");
        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        self.stats.snapshot()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the document registry.
    pub fn registry(&self) -> &Arc<DocumentRegistry> {
        &self.registry
    }
}

/// Document selected by a request path.
///
/// `/` and `/ws` name the default document, `/<id>` and `/ws/<id>` name `<id>`.
fn document_for_path(path: &str, default: &DocumentId) -> DocumentId {
    let mut segments = path.split('/').filter(|segment| !segment.is_empty());
    let id = match segments.next() {
        Some("ws") => segments.next(),
        other => other,
    };
    id.map_or_else(|| default.clone(), DocumentId::new)
}
