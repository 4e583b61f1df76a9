use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::UserId;

/// Presence payload broadcast for the local user and received for remote
/// participants. Remote payloads arrive as raw JSON metas and are parsed
/// into this shape fail-soft.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelfPresence {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub muted: bool,
    #[serde(default)]
    pub deafened: bool,
    #[serde(default)]
    pub speaking: bool,
    #[serde(default)]
    pub hand_raised: bool,
    #[serde(default = "default_has_microphone")]
    pub has_microphone: bool,
    #[serde(default)]
    pub hidden: bool,
    pub joined_at: DateTime<Utc>,
}

fn default_has_microphone() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub muted: bool,
    pub deafened: bool,
    pub speaking: bool,
    pub hand_raised: bool,
    pub has_microphone: bool,
    pub joined_at: DateTime<Utc>,
}

impl From<SelfPresence> for Participant {
    fn from(presence: SelfPresence) -> Self {
        Self {
            user_id: presence.user_id,
            display_name: presence.display_name,
            muted: presence.muted,
            deafened: presence.deafened,
            speaking: presence.speaking,
            hand_raised: presence.hand_raised,
            has_microphone: presence.has_microphone,
            joined_at: presence.joined_at,
        }
    }
}

/// Lifecycle statuses delivered by the channel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Presence fan-out events. Metas are kept as raw JSON so a malformed remote
/// payload cannot poison delivery of the event itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum PresenceChange {
    Sync,
    Join { key: String, metas: Vec<Value> },
    Leave { key: String, metas: Vec<Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Presence(PresenceChange),
}
