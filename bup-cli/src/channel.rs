//! Correlation-aware connection to a bup-server `/ws` endpoint.
//!
//! One reader task decodes every frame and hands it to each subscription
//! whose filter matches. Writers queue frames through a channel so sending
//! never waits on the socket.

use crate::filter::MessageFilter;
use bup_server::models::Correlation;
use bup_server::ws::protocol::{ClientCommand, Incoming, MessageKind, Outgoing, ServerMessage};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, ChannelError>;

type Registry = Mutex<Vec<(u64, MessageFilter, mpsc::UnboundedSender<Outgoing>)>>;

/// Messages delivered to one filter. Unsubscribes on drop.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<Outgoing>,
    registry: Weak<Registry>,
}

impl Subscription {
    /// Next matching message, or `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<Outgoing> {
        self.rx.recv().await
    }

    /// Like [`Subscription::recv`], giving up after `timeout` when one is set.
    pub async fn next(&mut self, timeout: Option<Duration>) -> Result<Outgoing> {
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.recv())
                .await
                .map_err(|_| ChannelError::Timeout(limit))?,
            None => self.recv().await,
        };
        received.ok_or(ChannelError::Closed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).retain(|(id, _, _)| *id != self.id);
        }
    }
}

fn lock(registry: &Registry) -> std::sync::MutexGuard<'_, Vec<(u64, MessageFilter, mpsc::UnboundedSender<Outgoing>)>> {
    registry.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Channel {
    outgoing: mpsc::UnboundedSender<Message>,
    registry: Arc<Registry>,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Channel {
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("Connecting to {}", url);
        let (ws_stream, _) = connect_async(url).await?;
        let (mut write, mut read) = ws_stream.split();
        tracing::info!("Connected to {}", url);

        let (outgoing, mut queue) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                if let Err(e) = write.send(message).await {
                    tracing::warn!("WebSocket write error: {}", e);
                    break;
                }
            }
            let _ = write.close().await;
        });

        let registry: Arc<Registry> = Arc::new(Mutex::new(Vec::new()));
        let subscribers = registry.clone();
        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        tracing::debug!("WS message: {}", text);
                        match serde_json::from_str::<Outgoing>(&text) {
                            Ok(message) => deliver(&subscribers, message),
                            Err(e) => tracing::warn!("Ignoring unknown message: {}", e),
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket read error: {}", e);
                        break;
                    }
                }
            }
            tracing::info!("Server closed WebSocket connection");
            // Wakes every pending subscription with `None`
            lock(&subscribers).clear();
        });

        Ok(Self {
            outgoing,
            registry,
            next_id: AtomicU64::new(0),
            reader,
            writer,
        })
    }

    pub fn new_correlation() -> Correlation {
        Correlation::new(uuid::Uuid::new_v4().to_string())
    }

    pub fn subscribe(&self, filter: MessageFilter) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.registry).push((id, filter, tx));
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn send(&self, command: ClientCommand, correlation: &Correlation) -> Result<()> {
        let json = serde_json::to_string(&Incoming {
            correlation: correlation.clone(),
            command,
        })?;
        self.send_text(json)
    }

    /// Sends a raw text frame.
    pub fn send_text(&self, text: String) -> Result<()> {
        tracing::debug!("WS send: {}", text);
        self.outgoing
            .send(Message::Text(text.into()))
            .map_err(|_| ChannelError::Closed)
    }

    /// Sends `command` under a fresh correlation and waits for the first
    /// correlated message of one of `kinds`. A correlated `client-error`
    /// fails the request.
    pub async fn request(
        &self,
        command: ClientCommand,
        kinds: &[MessageKind],
        timeout: Option<Duration>,
    ) -> Result<ServerMessage> {
        let correlation = Self::new_correlation();
        let token = correlation.token().unwrap_or_default().to_string();
        let filter = MessageFilter::kinds(kinds.iter().copied().chain([MessageKind::ClientError]))
            .correlated(token);
        let mut subscription = self.subscribe(filter);

        self.send(command, &correlation)?;
        match subscription.next(timeout).await?.message {
            ServerMessage::ClientError { error } if !kinds.contains(&MessageKind::ClientError) => {
                Err(ChannelError::Server(error))
            }
            message => Ok(message),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn deliver(registry: &Registry, message: Outgoing) {
    lock(registry).retain(|(_, filter, tx)| {
        if filter.matches(&message) {
            // A closed receiver means the subscription is being dropped
            tx.send(message.clone()).is_ok()
        } else {
            true
        }
    });
}
