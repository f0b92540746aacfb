use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::handlers;
use super::protocol::{Incoming, Outgoing, ServerMessage};
use crate::models::Correlation;
use crate::services::events::Event;
use crate::state::AppState;

const SESSION_QUEUE_CAPACITY: usize = 256;

/// Anything queued for one connection, in send order.
#[derive(Debug)]
pub enum Outbound {
    Reply(Outgoing),
    Event(Event),
}

/// Bounded send queue of one connection. A client that lets it fill up is
/// disconnected.
#[derive(Clone)]
pub struct SessionQueue {
    tx: mpsc::Sender<Outbound>,
    overflow: CancellationToken,
}

impl SessionQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            tx,
            overflow: CancellationToken::new(),
        };
        (queue, rx)
    }

    pub fn push(&self, outbound: Outbound) {
        match self.tx.try_send(outbound) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                if !self.overflow.is_cancelled() {
                    tracing::warn!("Client is not keeping up, dropping connection");
                }
                self.overflow.cancel();
            }
            // Closed once the session is gone, nothing left to tell
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn is_overflowed(&self) -> bool {
        self.overflow.is_cancelled()
    }

    async fn overflowed(&self) {
        self.overflow.cancelled().await
    }
}

/// Sends direct replies to the connection a command came from.
#[derive(Clone)]
pub struct Responder {
    queue: SessionQueue,
    correlation: Correlation,
}

impl Responder {
    pub fn new(queue: SessionQueue, correlation: Correlation) -> Self {
        Self { queue, correlation }
    }

    pub fn correlation(&self) -> &Correlation {
        &self.correlation
    }

    pub fn send(&self, message: ServerMessage) {
        self.queue
            .push(Outbound::Reply(Outgoing::new(message, &self.correlation)));
    }

    pub fn error(&self, error: impl Into<String>) {
        self.send(ServerMessage::ClientError {
            error: error.into(),
        });
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_session(socket, state))
}

/// Turns a bus event into the frame sent to clients.
pub async fn render_event(state: &AppState, event: Event) -> Outgoing {
    match event {
        Event::ConfigChanged { correlation } => Outgoing::new(
            ServerMessage::Config {
                config: state.store.get().await,
            },
            &correlation,
        ),
        Event::BackupStatusChanged {
            status,
            correlation,
        } => Outgoing::new(
            ServerMessage::BackupStatus {
                id: status.backup_id.clone(),
                status,
            },
            &correlation,
        ),
        Event::ClientError {
            message,
            correlation,
        } => Outgoing::new(ServerMessage::ClientError { error: message }, &correlation),
    }
}

async fn handle_session(socket: WebSocket, state: Arc<AppState>) {
    let session = uuid::Uuid::new_v4();
    tracing::info!(%session, "WS connected");

    let (mut sender, mut receiver) = socket.split();
    let (queue, mut rx) = SessionQueue::new(SESSION_QUEUE_CAPACITY);

    let events_queue = queue.clone();
    let subscription = state.events.subscribe(move |event| {
        events_queue.push(Outbound::Event(event.clone()));
    });

    let send_state = state.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let outgoing = match outbound {
                Outbound::Reply(outgoing) => outgoing,
                Outbound::Event(event) => render_event(&send_state, event).await,
            };
            let json = match serde_json::to_string(&outgoing) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(%session, "Failed to encode message: {}", e);
                    continue;
                }
            };
            tracing::debug!(%session, "WS send: {}", json);
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let recv_queue = queue.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    tracing::debug!(%session, "WS message: {}", text.as_str());
                    match serde_json::from_str::<Incoming>(text.as_str()) {
                        Ok(incoming) => {
                            let state = state.clone();
                            let responder = Responder::new(recv_queue.clone(), incoming.correlation);
                            tokio::spawn(async move {
                                handlers::dispatch(&state, incoming.command, &responder).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(%session, "Malformed command: {}", e);
                            Responder::new(recv_queue.clone(), Correlation::none())
                                .error(format!("Malformed command: {e}"));
                        }
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = queue.overflowed() => {
            recv_task.abort();
            send_task.abort();
        }
    }

    drop(subscription);
    tracing::info!(%session, "WS disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(text: &str) -> Outbound {
        Outbound::Reply(Outgoing::new(
            ServerMessage::ClientError {
                error: text.to_string(),
            },
            &Correlation::none(),
        ))
    }

    #[tokio::test]
    async fn test_full_queue_marks_session_for_disconnect() {
        let (queue, mut rx) = SessionQueue::new(2);
        queue.push(error("one"));
        queue.push(error("two"));
        assert!(!queue.is_overflowed());

        queue.push(error("three"));
        assert!(queue.is_overflowed());
        tokio::time::timeout(std::time::Duration::from_secs(1), queue.overflowed())
            .await
            .unwrap();

        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, 2);
    }

    #[tokio::test]
    async fn test_push_after_session_closed_is_ignored() {
        let (queue, rx) = SessionQueue::new(1);
        drop(rx);
        queue.push(error("late"));
        assert!(!queue.is_overflowed());
    }
}
