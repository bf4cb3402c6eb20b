//! Wire envelope and payload types for channel broadcasts.
//!
//! Every broadcast travels as a bincode-encoded [`Envelope`]:
//!
//! ```text
//! ┌──────────┬───────────┬───────────┬──────┬──────────┐
//! │ event    │ sender    │ origin    │ kind │ payload  │
//! │ string   │ 16 bytes  │ string    │ 1 B  │ variable │
//! └──────────┴───────────┴───────────┴──────┴──────────┘
//! ```
//!
//! `sender` is the per-subscription connection id (used to skip our own
//! messages on the shared bus); `origin` is the stable identity id (used for
//! per-peer keying and leave cleanup). Document and awareness payloads are
//! opaque binary deltas; cursor/drag/hover payloads are small JSON records
//! whose field names are part of the compatibility contract (camelCase,
//! `clerkId`).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::UserIdentity;

/// Event name for CRDT document deltas (binary payload).
pub const EV_DOC_UPDATE: &str = "doc-update";
/// Event name for sync handshake requests carrying a state vector.
pub const EV_SYNC_REQUEST: &str = "sync-request";
/// Event name for sync handshake replies carrying a state diff.
pub const EV_SYNC_REPLY: &str = "sync-reply";
/// Event name for awareness deltas (binary payload).
pub const EV_AWARENESS: &str = "awareness-update";
/// Event name for live cursor positions (JSON payload).
pub const EV_CURSOR: &str = "cursor";
/// Event name for kanban drag state (JSON payload).
pub const EV_DRAG: &str = "drag";
/// Event name for kanban hover state (JSON payload).
pub const EV_HOVER: &str = "hover";

/// Wall-clock milliseconds since the Unix epoch.
///
/// Presence heartbeats and ephemeral timestamps compare wall clocks across
/// machines; millisecond precision is ample for 5s heartbeats.
pub fn wall_clock_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// How an envelope payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum PayloadKind {
    /// Opaque binary bytes (CRDT delta, awareness delta).
    Binary = 0,
    /// UTF-8 JSON bytes (cursor/drag/hover records).
    Json = 1,
}

/// A broadcast message as it travels on the channel bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    /// Event name (see the `EV_*` constants).
    pub event: String,
    /// Connection id of the sending subscription.
    pub sender: Uuid,
    /// Stable identity id of the sending client.
    pub origin: String,
    /// Payload encoding.
    pub kind: PayloadKind,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Build an envelope with a binary payload.
    pub fn binary(
        event: impl Into<String>,
        sender: Uuid,
        origin: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            event: event.into(),
            sender,
            origin: origin.into(),
            kind: PayloadKind::Binary,
            payload,
        }
    }

    /// Build an envelope with a JSON payload.
    pub fn json<T: Serialize>(
        event: impl Into<String>,
        sender: Uuid,
        origin: impl Into<String>,
        value: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self {
            event: event.into(),
            sender,
            origin: origin.into(),
            kind: PayloadKind::Json,
            payload,
        })
    }

    /// Serialize to the binary bus format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the binary bus format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (envelope, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(envelope)
    }

    /// Parse the payload as a JSON record.
    pub fn parse_json<T: for<'de> Deserialize<'de>>(&self) -> Result<T, ProtocolError> {
        if self.kind != PayloadKind::Json {
            return Err(ProtocolError::WrongPayloadKind {
                event: self.event.clone(),
            });
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// User reference embedded in ephemeral JSON payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventUser {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clerk_id: Option<String>,
}

impl From<&UserIdentity> for EventUser {
    fn from(identity: &UserIdentity) -> Self {
        Self {
            id: identity.id.clone(),
            name: identity.display_name.clone(),
            clerk_id: Some(identity.id.clone()),
        }
    }
}

/// 2D position in document coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Live cursor position broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CursorEvent {
    pub position: Position,
    pub user: EventUser,
    /// Hex color string, deterministic per identity.
    pub color: String,
    /// Sender wall clock, millis.
    pub timestamp: u64,
}

/// Kanban card drag state broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DragEvent {
    /// Dragged card id; `None` means the drag ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub card_id: Option<String>,
    pub user: EventUser,
    pub color: String,
    pub timestamp: u64,
}

/// Kanban column hover broadcast.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoverEvent {
    /// Hovered column id; `None` means the hover ended.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_id: Option<String>,
    pub user: EventUser,
    pub timestamp: u64,
}

/// Presence record published while holding (or claiming) the edit lock.
///
/// Field names are part of the wire contract; absence of a `lastHeartbeat`
/// refresh for longer than the stale window implies the claim is abandoned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditLockRecord {
    pub clerk_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Wall clock millis when the holder began editing.
    pub editing_started_at: u64,
    /// Wall clock millis of the most recent heartbeat.
    pub last_heartbeat: u64,
}

impl EditLockRecord {
    /// Fresh record for a new claim by `identity`.
    pub fn claim(identity: &UserIdentity) -> Self {
        let now = wall_clock_millis();
        Self {
            clerk_id: identity.id.clone(),
            name: identity.display_name.clone(),
            image: identity.image_url.clone(),
            editing_started_at: now,
            last_heartbeat: now,
        }
    }

    /// Copy of this record with `last_heartbeat` refreshed to now.
    pub fn refreshed(&self) -> Self {
        Self {
            last_heartbeat: wall_clock_millis(),
            ..self.clone()
        }
    }

    /// Whether the claim's heartbeat is older than `stale_after` millis.
    pub fn is_stale(&self, now_millis: u64, stale_after_millis: u64) -> bool {
        now_millis.saturating_sub(self.last_heartbeat) > stale_after_millis
    }
}

/// Protocol-level errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    WrongPayloadKind { event: String },
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "deserialization error: {e}"),
            Self::WrongPayloadKind { event } => {
                write!(f, "expected JSON payload on event '{event}'")
            }
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserIdentity {
        UserIdentity::new("user_alice", "Alice").with_image("https://img/alice.png")
    }

    #[test]
    fn test_envelope_binary_roundtrip() {
        let sender = Uuid::new_v4();
        let env = Envelope::binary(EV_DOC_UPDATE, sender, "user_alice", vec![1, 2, 3]);

        let encoded = env.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();

        assert_eq!(decoded, env);
        assert_eq!(decoded.kind, PayloadKind::Binary);
        assert_eq!(decoded.sender, sender);
    }

    #[test]
    fn test_envelope_json_roundtrip() {
        let ev = CursorEvent {
            position: Position::new(10.5, 20.25),
            user: EventUser::from(&alice()),
            color: "#aa33cc".into(),
            timestamp: 1234,
        };
        let env = Envelope::json(EV_CURSOR, Uuid::new_v4(), "user_alice", &ev).unwrap();

        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        let parsed: CursorEvent = decoded.parse_json().unwrap();
        assert_eq!(parsed, ev);
    }

    #[test]
    fn test_parse_json_on_binary_fails() {
        let env = Envelope::binary(EV_DOC_UPDATE, Uuid::new_v4(), "u", vec![0]);
        let result: Result<CursorEvent, _> = env.parse_json();
        assert!(matches!(result, Err(ProtocolError::WrongPayloadKind { .. })));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(Envelope::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_cursor_event_wire_field_names() {
        let ev = CursorEvent {
            position: Position::new(1.0, 2.0),
            user: EventUser::from(&alice()),
            color: "#ffffff".into(),
            timestamp: 7,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("position").is_some());
        assert_eq!(json["user"]["clerkId"], "user_alice");
        assert_eq!(json["user"]["name"], "Alice");
        assert!(json.get("timestamp").is_some());
    }

    #[test]
    fn test_lock_record_wire_field_names() {
        let record = EditLockRecord::claim(&alice());
        let json = serde_json::to_value(&record).unwrap();

        assert_eq!(json["clerkId"], "user_alice");
        assert_eq!(json["name"], "Alice");
        assert_eq!(json["image"], "https://img/alice.png");
        assert!(json.get("editingStartedAt").is_some());
        assert!(json.get("lastHeartbeat").is_some());
    }

    #[test]
    fn test_lock_record_staleness() {
        let record = EditLockRecord {
            clerk_id: "u".into(),
            name: "U".into(),
            image: None,
            editing_started_at: 1_000,
            last_heartbeat: 1_000,
        };

        assert!(!record.is_stale(20_000, 30_000));
        assert!(record.is_stale(40_000, 30_000));
        // Exactly at the boundary: not yet stale
        assert!(!record.is_stale(31_000, 30_000));
    }

    #[test]
    fn test_lock_record_refresh_advances_heartbeat() {
        let mut record = EditLockRecord::claim(&alice());
        record.last_heartbeat = 0;
        let refreshed = record.refreshed();
        assert!(refreshed.last_heartbeat > 0);
        assert_eq!(refreshed.editing_started_at, record.editing_started_at);
    }

    #[test]
    fn test_drag_event_end_omits_card_id() {
        let ev = DragEvent {
            card_id: None,
            user: EventUser::from(&alice()),
            color: "#000000".into(),
            timestamp: 1,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert!(json.get("cardId").is_none());
    }

    #[test]
    fn test_wall_clock_monotonic_enough() {
        let a = wall_clock_millis();
        let b = wall_clock_millis();
        assert!(b >= a);
        // Sanity: after 2020-01-01
        assert!(a > 1_577_836_800_000);
    }
}
