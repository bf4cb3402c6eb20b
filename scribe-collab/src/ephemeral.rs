//! Throttled, loss-tolerant ephemeral broadcast patterns.
//!
//! Two surfaces share the same machinery:
//!
//! - live cursor positions in the document editor ([`CursorTracker`])
//! - drag/hover indicators on the kanban board ([`BoardPresence`])
//!
//! Producers rate-limit outgoing events with a fixed-delay [`Throttle`] so a
//! fast mouse cannot flood the channel. Consumers keep only the newest event
//! per originating client, always filter out their own origin, and expire
//! entries after a TTL via periodic [`sweep`](EphemeralMap::sweep) passes,
//! which substitutes for explicit stop events that may be lost. A presence
//! leave removes a peer's entries immediately, independent of the TTL.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::config::CollabConfig;
use crate::identity::UserIdentity;
use crate::protocol::{wall_clock_millis, CursorEvent, DragEvent, EventUser, HoverEvent, Position};

/// Fixed-delay rate limiter: at most one pass per interval.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self { interval, last: None }
    }

    /// Returns true (and arms the delay) if enough time has passed since the
    /// last accepted call. The first call always passes.
    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

struct EphemeralEntry<T> {
    value: T,
    /// Sender wall clock, for per-origin ordering.
    wall_ts: u64,
    /// Local receive time, for TTL expiry.
    received: Instant,
}

/// Latest-event-per-origin map with TTL expiry.
pub struct EphemeralMap<T> {
    entries: HashMap<String, EphemeralEntry<T>>,
    ttl: Duration,
}

impl<T> EphemeralMap<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Store the newest event for `origin`. Events older than the one
    /// already held (by sender wall clock) are rejected.
    pub fn insert(&mut self, origin: &str, value: T, wall_ts: u64) -> bool {
        if let Some(existing) = self.entries.get(origin) {
            if wall_ts < existing.wall_ts {
                return false;
            }
        }
        self.entries.insert(
            origin.to_string(),
            EphemeralEntry {
                value,
                wall_ts,
                received: Instant::now(),
            },
        );
        true
    }

    /// Delete entries not refreshed within the TTL. Returns removed origins.
    pub fn sweep(&mut self) -> Vec<String> {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.received.elapsed() > ttl)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        expired
    }

    /// Drop one origin's entry immediately (presence leave).
    pub fn remove_origin(&mut self, origin: &str) -> bool {
        self.entries.remove(origin).is_some()
    }

    pub fn get(&self, origin: &str) -> Option<&T> {
        self.entries.get(origin).map(|e| &e.value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.entries.iter().map(|(k, e)| (k.as_str(), &e.value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Live cursors for a document room: throttled producer + remote mirror.
pub struct CursorTracker {
    identity: UserIdentity,
    color: String,
    throttle: Throttle,
    remote: EphemeralMap<CursorEvent>,
}

impl CursorTracker {
    pub fn new(identity: UserIdentity, config: &CollabConfig) -> Self {
        let color = identity.color().to_hex();
        Self {
            identity,
            color,
            throttle: Throttle::new(config.cursor_throttle),
            remote: EphemeralMap::new(config.ephemeral_ttl),
        }
    }

    /// Record a local cursor move. Returns the event to broadcast, or `None`
    /// when throttled.
    pub fn update_local(&mut self, position: Position) -> Option<CursorEvent> {
        if !self.throttle.ready() {
            return None;
        }
        Some(CursorEvent {
            position,
            user: EventUser::from(&self.identity),
            color: self.color.clone(),
            timestamp: wall_clock_millis(),
        })
    }

    /// Mirror a remote cursor event. Our own origin is never rendered.
    pub fn handle_remote(&mut self, event: CursorEvent) -> bool {
        if event.user.id == self.identity.id {
            return false;
        }
        let origin = event.user.id.clone();
        let ts = event.timestamp;
        self.remote.insert(&origin, event, ts)
    }

    /// Current remote cursors, newest event per peer.
    pub fn cursors(&self) -> Vec<&CursorEvent> {
        self.remote.iter().map(|(_, v)| v).collect()
    }

    /// Expire silent cursors. Returns removed peer ids.
    pub fn sweep(&mut self) -> Vec<String> {
        self.remote.sweep()
    }

    /// Remove a departed peer's cursor immediately.
    pub fn remove_peer(&mut self, peer_id: &str) -> bool {
        self.remote.remove_origin(peer_id)
    }
}

/// Drag/hover indicators for a kanban board surface.
///
/// Boards use only this component on a bare channel: no document sync, no
/// awareness, no lock.
pub struct BoardPresence {
    identity: UserIdentity,
    color: String,
    drag_throttle: Throttle,
    hover_throttle: Throttle,
    drags: EphemeralMap<DragEvent>,
    hovers: EphemeralMap<HoverEvent>,
}

impl BoardPresence {
    pub fn new(identity: UserIdentity, config: &CollabConfig) -> Self {
        let color = identity.color().to_hex();
        Self {
            identity,
            color,
            drag_throttle: Throttle::new(config.drag_throttle),
            hover_throttle: Throttle::new(config.hover_throttle),
            drags: EphemeralMap::new(config.ephemeral_ttl),
            hovers: EphemeralMap::new(config.ephemeral_ttl),
        }
    }

    /// Record a local drag move; `None` card ends the drag. End events
    /// bypass the throttle so a release is never delayed.
    pub fn update_local_drag(&mut self, card_id: Option<String>) -> Option<DragEvent> {
        let ended = card_id.is_none();
        if !ended && !self.drag_throttle.ready() {
            return None;
        }
        Some(DragEvent {
            card_id,
            user: EventUser::from(&self.identity),
            color: self.color.clone(),
            timestamp: wall_clock_millis(),
        })
    }

    /// Record a local hover change; `None` column ends the hover.
    pub fn update_local_hover(&mut self, column_id: Option<String>) -> Option<HoverEvent> {
        let ended = column_id.is_none();
        if !ended && !self.hover_throttle.ready() {
            return None;
        }
        Some(HoverEvent {
            column_id,
            user: EventUser::from(&self.identity),
            timestamp: wall_clock_millis(),
        })
    }

    /// Mirror a remote drag event; an end event clears the peer's entry.
    pub fn handle_remote_drag(&mut self, event: DragEvent) -> bool {
        if event.user.id == self.identity.id {
            return false;
        }
        let origin = event.user.id.clone();
        if event.card_id.is_none() {
            return self.drags.remove_origin(&origin);
        }
        let ts = event.timestamp;
        self.drags.insert(&origin, event, ts)
    }

    /// Mirror a remote hover event; an end event clears the peer's entry.
    pub fn handle_remote_hover(&mut self, event: HoverEvent) -> bool {
        if event.user.id == self.identity.id {
            return false;
        }
        let origin = event.user.id.clone();
        if event.column_id.is_none() {
            return self.hovers.remove_origin(&origin);
        }
        let ts = event.timestamp;
        self.hovers.insert(&origin, event, ts)
    }

    /// Peers currently dragging a card.
    pub fn drags(&self) -> Vec<&DragEvent> {
        self.drags.iter().map(|(_, v)| v).collect()
    }

    /// Peers currently hovering a column.
    pub fn hovers(&self) -> Vec<&HoverEvent> {
        self.hovers.iter().map(|(_, v)| v).collect()
    }

    /// Expire silent entries in both maps. Returns removed peer ids.
    pub fn sweep(&mut self) -> Vec<String> {
        let mut removed = self.drags.sweep();
        removed.extend(self.hovers.sweep());
        removed.sort();
        removed.dedup();
        removed
    }

    /// Remove all of a departed peer's indicators immediately.
    pub fn remove_peer(&mut self, peer_id: &str) {
        self.drags.remove_origin(peer_id);
        self.hovers.remove_origin(peer_id);
    }
}
