//! Last-write-wins awareness store.
//!
//! Awareness is transient per-client metadata (cursor, selection, profile)
//! kept separate from document content. Each client owns exactly one entry,
//! propagated as a binary delta over channel broadcasts. The merge is a
//! total, commutative function: newer `updated_at` wins, ties broken by
//! client id ordering, so any two replicas that see the same set of deltas
//! in any order agree on the resulting map.
//!
//! Entries vanish on explicit clear (tombstone delta) or when the owning
//! client's presence leaves the channel.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::identity::PeerColor;
use crate::protocol::{wall_clock_millis, Position, ProtocolError};

/// One client's awareness entry as replicated locally.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessEntry {
    pub client_id: String,
    /// Opaque state blob; see [`PeerState`] for the conventional encoding.
    pub state: Vec<u8>,
    /// Sender wall clock, millis. Drives the LWW merge.
    pub updated_at: u64,
}

/// Binary awareness delta as broadcast on the `awareness-update` event.
///
/// `state: None` is a tombstone: the client cleared its own entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessDelta {
    pub client_id: String,
    pub updated_at: u64,
    pub state: Option<Vec<u8>>,
}

impl AwarenessDelta {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(delta)
    }
}

/// Conventional typed contents of an awareness blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub cursor: Option<Position>,
    pub name: String,
    pub color: PeerColor,
}

impl PeerState {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (state, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(state)
    }
}

/// Replicated map of client id → awareness entry.
pub struct AwarenessStore {
    local_id: String,
    entries: HashMap<String, AwarenessEntry>,
    /// Highest timestamp we have stamped locally, to keep our own deltas
    /// strictly increasing even if the wall clock stalls.
    last_local_stamp: u64,
}

impl AwarenessStore {
    pub fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            entries: HashMap::new(),
            last_local_stamp: 0,
        }
    }

    /// Set our own entry and return the delta to broadcast.
    pub fn set_local_state(&mut self, state: Vec<u8>) -> AwarenessDelta {
        let stamp = self.next_stamp();
        self.entries.insert(
            self.local_id.clone(),
            AwarenessEntry {
                client_id: self.local_id.clone(),
                state: state.clone(),
                updated_at: stamp,
            },
        );
        AwarenessDelta {
            client_id: self.local_id.clone(),
            updated_at: stamp,
            state: Some(state),
        }
    }

    /// Clear our own entry and return the tombstone delta to broadcast.
    pub fn clear_local_state(&mut self) -> AwarenessDelta {
        let stamp = self.next_stamp();
        self.entries.remove(&self.local_id);
        AwarenessDelta {
            client_id: self.local_id.clone(),
            updated_at: stamp,
            state: None,
        }
    }

    /// Merge a remote delta. Returns whether the map changed.
    ///
    /// Older deltas (and ties lost on client id) are discarded silently;
    /// losing a concurrent write is the expected outcome here, not an error.
    pub fn apply_remote_delta(&mut self, delta: &AwarenessDelta) -> bool {
        if delta.client_id == self.local_id {
            return false; // our own broadcast echoed back
        }
        if let Some(existing) = self.entries.get(&delta.client_id) {
            if !wins(delta.updated_at, &delta.client_id, existing.updated_at, &existing.client_id) {
                return false;
            }
        }
        match &delta.state {
            Some(state) => {
                self.entries.insert(
                    delta.client_id.clone(),
                    AwarenessEntry {
                        client_id: delta.client_id.clone(),
                        state: state.clone(),
                        updated_at: delta.updated_at,
                    },
                );
                true
            }
            None => self.entries.remove(&delta.client_id).is_some(),
        }
    }

    /// Drop a client's entry on presence leave. Returns whether it existed.
    pub fn remove_client(&mut self, client_id: &str) -> bool {
        self.entries.remove(client_id).is_some()
    }

    /// Full current map, for UI observers.
    pub fn entries(&self) -> &HashMap<String, AwarenessEntry> {
        &self.entries
    }

    /// Entries of all peers except ourselves.
    pub fn remote_entries(&self) -> impl Iterator<Item = &AwarenessEntry> {
        self.entries
            .values()
            .filter(move |e| e.client_id != self.local_id)
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn next_stamp(&mut self) -> u64 {
        let stamp = wall_clock_millis().max(self.last_local_stamp + 1);
        self.last_local_stamp = stamp;
        stamp
    }
}

/// LWW comparison: does `(ts_a, id_a)` beat `(ts_b, id_b)`?
///
/// Timestamps first; equal timestamps fall back to client id ordering so
/// every replica picks the same winner. A full tie (same stamp, same id)
/// keeps the first-applied payload, which is order-dependent; it can only
/// arise when one client stamps two different states identically, and
/// `next_stamp` makes local stamps strictly increasing to rule that out.
fn wins(ts_a: u64, id_a: &str, ts_b: u64, id_b: &str) -> bool {
    match ts_a.cmp(&ts_b) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => id_a > id_b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(id: &str, ts: u64, payload: &[u8]) -> AwarenessDelta {
        AwarenessDelta {
            client_id: id.into(),
            updated_at: ts,
            state: Some(payload.to_vec()),
        }
    }

    #[test]
    fn test_set_local_state_returns_delta() {
        let mut store = AwarenessStore::new("user_a");
        let d = store.set_local_state(vec![1, 2, 3]);

        assert_eq!(d.client_id, "user_a");
        assert_eq!(d.state.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_local_stamps_strictly_increase() {
        let mut store = AwarenessStore::new("user_a");
        let d1 = store.set_local_state(vec![1]);
        let d2 = store.set_local_state(vec![2]);
        let d3 = store.clear_local_state();
        assert!(d2.updated_at > d1.updated_at);
        assert!(d3.updated_at > d2.updated_at);
    }

    #[test]
    fn test_lww_newer_wins_either_order() {
        let old = delta("user_b", 100, b"old");
        let new = delta("user_b", 200, b"new");

        let mut forward = AwarenessStore::new("user_a");
        assert!(forward.apply_remote_delta(&old));
        assert!(forward.apply_remote_delta(&new));

        let mut backward = AwarenessStore::new("user_a");
        assert!(backward.apply_remote_delta(&new));
        assert!(!backward.apply_remote_delta(&old)); // discarded silently

        for store in [&forward, &backward] {
            assert_eq!(store.entries()["user_b"].state, b"new".to_vec());
            assert_eq!(store.entries()["user_b"].updated_at, 200);
        }
    }

    #[test]
    fn test_lww_tie_breaks_deterministically() {
        // Same client id cannot tie with itself in practice, but equal
        // timestamps from a clock stall must still resolve one way.
        let first = delta("user_b", 100, b"first");
        let second = AwarenessDelta {
            client_id: "user_b".into(),
            updated_at: 100,
            state: Some(b"second".to_vec()),
        };

        let mut store = AwarenessStore::new("user_a");
        store.apply_remote_delta(&first);
        // Equal (ts, id): not a win, first write is kept everywhere.
        assert!(!store.apply_remote_delta(&second));
        assert_eq!(store.entries()["user_b"].state, b"first".to_vec());
    }

    #[test]
    fn test_duplicate_delta_is_idempotent() {
        let d = delta("user_b", 100, b"state");
        let mut store = AwarenessStore::new("user_a");
        assert!(store.apply_remote_delta(&d));
        assert!(!store.apply_remote_delta(&d));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_tombstone_removes_entry() {
        let mut store = AwarenessStore::new("user_a");
        store.apply_remote_delta(&delta("user_b", 100, b"state"));

        let tombstone = AwarenessDelta {
            client_id: "user_b".into(),
            updated_at: 200,
            state: None,
        };
        assert!(store.apply_remote_delta(&tombstone));
        assert!(store.is_empty());
    }

    #[test]
    fn test_stale_tombstone_ignored() {
        let mut store = AwarenessStore::new("user_a");
        store.apply_remote_delta(&delta("user_b", 200, b"state"));

        let stale_tombstone = AwarenessDelta {
            client_id: "user_b".into(),
            updated_at: 100,
            state: None,
        };
        assert!(!store.apply_remote_delta(&stale_tombstone));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_own_echo_ignored() {
        let mut store = AwarenessStore::new("user_a");
        store.set_local_state(vec![1]);
        let echo = delta("user_a", u64::MAX, b"echo");
        assert!(!store.apply_remote_delta(&echo));
        assert_eq!(store.entries()["user_a"].state, vec![1]);
    }

    #[test]
    fn test_remove_client_on_leave() {
        let mut store = AwarenessStore::new("user_a");
        store.apply_remote_delta(&delta("user_b", 100, b"state"));

        assert!(store.remove_client("user_b"));
        assert!(!store.remove_client("user_b"));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remote_entries_excludes_self() {
        let mut store = AwarenessStore::new("user_a");
        store.set_local_state(vec![0]);
        store.apply_remote_delta(&delta("user_b", 100, b"b"));

        let remote: Vec<_> = store.remote_entries().collect();
        assert_eq!(remote.len(), 1);
        assert_eq!(remote[0].client_id, "user_b");
    }

    #[test]
    fn test_delta_binary_roundtrip() {
        let d = delta("user_b", 42, b"payload");
        let decoded = AwarenessDelta::decode(&d.encode().unwrap()).unwrap();
        assert_eq!(decoded, d);
    }

    #[test]
    fn test_peer_state_roundtrip() {
        let state = PeerState {
            cursor: Some(Position::new(3.0, 4.0)),
            name: "Alice".into(),
            color: PeerColor::from_id("user_a"),
        };
        let decoded = PeerState::decode(&state.encode().unwrap()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(AwarenessDelta::decode(&[0xFF, 0x01]).is_err());
    }
}
