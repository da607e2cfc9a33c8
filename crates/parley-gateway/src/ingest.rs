use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tracing::debug;

use parley_db::{RoomStore, StoreError};
use parley_types::events::GatewayEvent;
use parley_types::models::{Identity, Message};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("room '{0}' not found")]
    RoomNotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("sender '{claimed}' does not match session identity '{session}'")]
    SenderMismatch { claimed: Identity, session: Identity },

    #[error(transparent)]
    Store(StoreError),

    #[error("append task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { kind: "room", key } => Self::RoomNotFound(key),
            StoreError::BadRequest(msg) => Self::BadRequest(msg),
            other => Self::Store(other),
        }
    }
}

/// Payload of a `sendMessage/{roomId}` frame.
#[derive(Debug, Clone)]
pub struct SubmitMessage {
    pub room_id: String,
    pub sender: Option<Identity>,
    pub content: String,
}

/// Turns submissions into appended, broadcast messages.
///
/// Appends and publishes for one room run under that room's lock, so log
/// order, broadcast order and the order any subscriber sees are the same.
/// Different rooms never wait on each other here.
#[derive(Clone)]
pub struct MessageIngestor {
    inner: Arc<IngestInner>,
}

struct IngestInner {
    rooms: Arc<RoomStore>,
    dispatcher: crate::dispatcher::Dispatcher,
    room_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl MessageIngestor {
    pub fn new(rooms: Arc<RoomStore>, dispatcher: crate::dispatcher::Dispatcher) -> Self {
        Self {
            inner: Arc::new(IngestInner {
                rooms,
                dispatcher,
                room_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Append `submission` to `destination`'s log and publish it on the
    /// room topic. The session identity is the sender of record; a
    /// different claimed sender is refused. Nothing is appended or
    /// published when any step fails, and once the append starts the
    /// publish follows even if this future is dropped.
    pub async fn submit(
        &self,
        destination: &str,
        session_identity: &Identity,
        submission: SubmitMessage,
    ) -> Result<Message, IngestError> {
        if submission.room_id != destination {
            return Err(IngestError::BadRequest(format!(
                "payload roomId '{}' does not match destination '{}'",
                submission.room_id, destination
            )));
        }
        if let Some(claimed) = submission.sender {
            if &claimed != session_identity {
                return Err(IngestError::SenderMismatch {
                    claimed,
                    session: session_identity.clone(),
                });
            }
        }

        // The append and its broadcast run on their own task. Dropping the
        // caller (a session torn down mid-submit) cannot separate them.
        let ingestor = self.clone();
        let room_id = destination.to_string();
        let sender = session_identity.clone();
        tokio::spawn(async move { ingestor.append_serialized(room_id, sender, submission.content).await }).await?
    }

    async fn append_serialized(&self, room_id: String, sender: Identity, content: String) -> Result<Message, IngestError> {
        let lock = self.room_lock(&room_id);
        let result = {
            let _guard = lock.lock().await;
            self.append_and_publish(&room_id, &sender, content).await
        };
        self.release_room_lock(&room_id, lock);
        result
    }

    async fn append_and_publish(
        &self,
        room_id: &str,
        sender: &Identity,
        content: String,
    ) -> Result<Message, IngestError> {
        let message = Message {
            sender: sender.clone(),
            content,
            timestamp: Utc::now(),
        };

        let rooms = self.inner.rooms.clone();
        let room = room_id.to_string();
        let message = tokio::task::spawn_blocking(move || rooms.append_message(&room, message)).await??;

        let receivers = self.inner.dispatcher.publish(GatewayEvent::MessageCreate {
            room_id: room_id.to_string(),
            message: message.clone(),
        });
        debug!("Message from {} in {} delivered to {} receivers", sender, room_id, receivers);

        Ok(message)
    }

    fn room_lock(&self, room_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.room_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(room_id.to_string()).or_default().clone()
    }

    /// Drop the room's lock entry once no other submission holds it.
    fn release_room_lock(&self, room_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.inner.room_locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the map, one here
        if Arc::strong_count(&lock) == 2 {
            locks.remove(room_id);
        }
    }
}
