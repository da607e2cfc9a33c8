use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Identity, Message};

/// Broadcast destination on the gateway fan-out bus.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Global presence channel, carries the full active set.
    Presence,
    /// Per-room channel keyed by the external room id.
    Room(String),
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Presence => f.write_str("active-users"),
            Topic::Room(room_id) => write!(f, "room/{}", room_id),
        }
    }
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    /// Server confirms the session was established
    Ready { session_id: Uuid, identity: Identity },

    /// A message was appended to a room log
    MessageCreate { room_id: String, message: Message },

    /// Full presence set after a change
    PresenceUpdate { users: Vec<Identity> },
}

impl GatewayEvent {
    /// Broadcast topic for this event. `None` means it is only ever sent
    /// directly to one session.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            Self::MessageCreate { room_id, .. } => Some(Topic::Room(room_id.clone())),
            Self::PresenceUpdate { .. } => Some(Topic::Presence),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all_fields = "camelCase")]
pub enum GatewayCommand {
    /// Replace the set of rooms whose messages this session receives.
    Subscribe { room_ids: Vec<String> },

    /// Submit a message to `sendMessage/{roomId}`.
    SendMessage {
        room_id: String,
        #[serde(default)]
        sender: Option<Identity>,
        content: String,
    },
}
