//! Reload channels: one WebSocket per server origin.
//!
//! After an upload the bridge asks the server to hot-reload the rendered
//! notebook. Connections are opened lazily on the first request for an
//! origin, reused afterwards, and dropped from the registry when they close.
//! The next request for that origin reconnects.
//!
//! Each connection runs a read task that forwards server notices to the
//! daemon's event channel and keeps the socket alive with pings.

use crate::message::{ReloadNotice, ReloadRequest, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use grove_core::remote::{self, ReloadSignal, RemoteError, API_KEY_HEADER, HOT_RELOAD_PATH};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = Arc<Mutex<SplitSink<WsStream, Message>>>;

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("Cannot derive reload socket URL from {0}")]
    InvalidOrigin(String),

    #[error("Failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },

    #[error("Failed to send reload request: {0}")]
    Send(String),
}

/// Keep-alive and connect timing.
#[derive(Debug, Clone)]
pub struct ReloadConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// How long to wait for traffic after a ping before dropping the socket
    pub ping_timeout: Duration,
    /// Upper bound on the connect handshake
    pub connect_timeout: Duration,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            ping_timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Event emitted by a reload channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadEvent {
    /// The server reported on a reload
    Notice { origin: String, notice: ReloadNotice },
    /// Connection closed and removed from the registry
    Closed { origin: String },
}

/// Map an `http(s)` origin to its reload socket URL.
pub fn socket_url(origin: &str) -> Result<String, ReloadError> {
    let origin = origin.trim_end_matches('/');
    let rest = if let Some(rest) = origin.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = origin.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        return Err(ReloadError::InvalidOrigin(origin.to_string()));
    };
    Ok(format!("{}{}", rest, HOT_RELOAD_PATH))
}

struct Channel {
    id: u64,
    write: WsSink,
    read_task: JoinHandle<()>,
}

/// Connection slot for one origin; its lock is held across connect.
type Slot = Arc<Mutex<Option<Channel>>>;

type Registry = Arc<Mutex<HashMap<String, Slot>>>;

/// Registry of reload connections keyed by origin.
pub struct ReloadChannels {
    channels: Registry,
    config: ReloadConfig,
    event_tx: mpsc::UnboundedSender<ReloadEvent>,
    next_id: AtomicU64,
}

impl ReloadChannels {
    /// Create an empty registry and the receiver for its events.
    pub fn new(config: ReloadConfig) -> (Self, mpsc::UnboundedReceiver<ReloadEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let channels = Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            config,
            event_tx,
            next_id: AtomicU64::new(1),
        };
        (channels, event_rx)
    }

    async fn slots(&self) -> Vec<Slot> {
        self.channels.lock().await.values().cloned().collect()
    }

    /// Number of open connections.
    pub async fn connection_count(&self) -> usize {
        let mut count = 0;
        for slot in self.slots().await {
            if slot.lock().await.is_some() {
                count += 1;
            }
        }
        count
    }

    /// Whether a connection to `origin` is currently registered.
    pub async fn is_connected(&self, origin: &str) -> bool {
        let slot = self.channels.lock().await.get(origin).cloned();
        match slot {
            Some(slot) => slot.lock().await.is_some(),
            None => false,
        }
    }

    /// Send a reload request, connecting first if needed.
    ///
    /// The origin's slot stays locked across the connect so concurrent
    /// requests for one origin share a single socket. Other origins are not
    /// blocked.
    pub async fn send_reload(
        &self,
        origin: &str,
        api_key: &str,
        request: &ReloadRequest,
    ) -> Result<(), ReloadError> {
        let slot = Arc::clone(
            self.channels
                .lock()
                .await
                .entry(origin.to_string())
                .or_default(),
        );
        let mut guard = slot.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect(origin, api_key, &slot).await?);
        }

        let Some(channel) = guard.as_ref() else {
            return Err(ReloadError::Send("connection vanished".into()));
        };
        let sent = channel
            .write
            .lock()
            .await
            .send(Message::Text(request.to_text().into()))
            .await;

        match sent {
            Ok(()) => {
                debug!("Requested reload of {} on {}", request.file_name, origin);
                Ok(())
            }
            Err(e) => {
                // Broken socket: forget it so the next request reconnects
                if let Some(channel) = guard.take() {
                    channel.read_task.abort();
                }
                Err(ReloadError::Send(e.to_string()))
            }
        }
    }

    async fn connect(&self, origin: &str, api_key: &str, slot: &Slot) -> Result<Channel, ReloadError> {
        let url = socket_url(origin)?;
        let connect_err = |reason: String| ReloadError::Connect {
            url: url.clone(),
            reason,
        };

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| connect_err(e.to_string()))?;
        let key = HeaderValue::from_str(api_key).map_err(|e| connect_err(e.to_string()))?;
        request.headers_mut().insert(API_KEY_HEADER, key);

        let (ws_stream, _) = tokio::time::timeout(self.config.connect_timeout, connect_async(request))
            .await
            .map_err(|_| connect_err("timed out".into()))?
            .map_err(|e| connect_err(e.to_string()))?;
        info!("Reload channel open to {}", url);

        let (write, read) = ws_stream.split();
        let write = Arc::new(Mutex::new(write));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let read_task = tokio::spawn(Self::read_loop(
            origin.to_string(),
            id,
            read,
            Arc::clone(&write),
            Arc::clone(slot),
            self.event_tx.clone(),
            self.config.clone(),
        ));

        Ok(Channel {
            id,
            write,
            read_task,
        })
    }

    /// Read loop that forwards notices and keeps the connection alive.
    async fn read_loop(
        origin: String,
        id: u64,
        mut read: SplitStream<WsStream>,
        write: WsSink,
        slot: Slot,
        event_tx: mpsc::UnboundedSender<ReloadEvent>,
        config: ReloadConfig,
    ) {
        let mut ping = tokio::time::interval_at(
            Instant::now() + config.ping_interval,
            config.ping_interval,
        );
        let mut awaiting_since: Option<Instant> = None;

        loop {
            let deadline = awaiting_since.map(|since| since + config.ping_timeout);
            tokio::select! {
                frame = read.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            awaiting_since = None;
                            let text = match msg {
                                Message::Text(text) => text,
                                Message::Ping(_) | Message::Pong(_) => continue,
                                Message::Close(_) => {
                                    debug!("Received close frame from {}", origin);
                                    break;
                                }
                                Message::Binary(_) | Message::Frame(_) => continue,
                            };

                            if text.len() > MAX_MESSAGE_SIZE {
                                warn!(
                                    "Message from {} exceeds max size ({} > {}), dropping",
                                    origin,
                                    text.len(),
                                    MAX_MESSAGE_SIZE
                                );
                                continue;
                            }

                            match ReloadNotice::from_text(&text) {
                                Some(notice) => {
                                    let _ = event_tx.send(ReloadEvent::Notice {
                                        origin: origin.clone(),
                                        notice,
                                    });
                                }
                                None => debug!("Ignoring unrecognised frame from {}", origin),
                            }
                        }
                        Some(Err(e)) => {
                            match e {
                                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                    debug!("Reload channel {} closed", origin);
                                }
                                _ => warn!("WebSocket error on {}: {}", origin, e),
                            }
                            break;
                        }
                        None => {
                            debug!("Reload channel {} stream ended", origin);
                            break;
                        }
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    warn!("Reload channel {} missed keep-alive, dropping", origin);
                    break;
                }
                _ = ping.tick() => {
                    if awaiting_since.is_some() {
                        continue;
                    }
                    if write.lock().await.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    awaiting_since = Some(Instant::now());
                }
            }
        }

        // Only clear our own entry; a reconnect may already have replaced it
        {
            let mut guard = slot.lock().await;
            if guard.as_ref().is_some_and(|channel| channel.id == id) {
                *guard = None;
            }
        }
        let _ = event_tx.send(ReloadEvent::Closed { origin });
    }

    /// Close every connection and clear the registry.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Slot)> = self.channels.lock().await.drain().collect();
        for (origin, slot) in drained {
            let Some(channel) = slot.lock().await.take() else {
                continue;
            };
            if let Ok(mut write) = channel.write.try_lock() {
                let _ = write.send(Message::Close(None)).await;
            }
            channel.read_task.abort();
            debug!("Closed reload channel to {}", origin);
        }
    }
}

#[async_trait]
impl ReloadSignal for ReloadChannels {
    async fn request_reload(
        &self,
        origin: &str,
        api_key: &str,
        file_name: &str,
        project_id: &str,
    ) -> remote::Result<()> {
        let request = ReloadRequest {
            file_name: file_name.to_string(),
            project_id: project_id.to_string(),
        };
        self.send_reload(origin, api_key, &request)
            .await
            .map_err(|e| RemoteError::Channel(e.to_string()))
    }
}
