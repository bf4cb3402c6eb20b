//! Named broadcast + presence channels.
//!
//! A [`ChannelHub`] is an injected factory mapping channel names to topics.
//! Each topic carries two planes:
//!
//! ```text
//! ┌────────────┐  broadcast(event, payload)   ┌────────────┐
//! │ Handle A   │ ───────────────────────────► │ Topic bus  │ ──► every handle
//! └────────────┘                              └────────────┘
//! ┌────────────┐  track / untrack             ┌────────────┐
//! │ Handle B   │ ───────────────────────────► │ Presence   │ ──► Sync + Join/Leave
//! └────────────┘                              │ table      │
//!                                             └────────────┘
//! ```
//!
//! Broadcasts are fire-and-forget encoded [`Envelope`]s fanned out over a
//! tokio broadcast channel; per-sender ordering is preserved, cross-sender
//! ordering is not. The presence table maps presence keys (stable identity
//! ids) to JSON records; every `track`/`untrack` emits incremental
//! `Join`/`Leave` events plus a full `Sync` snapshot, so subscribers can
//! always rebuild their view from the latest event alone.
//!
//! Lagging subscribers drop messages rather than block senders; drops are
//! counted in [`ChannelStats`] via atomics, so the send path never takes a
//! lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::{Envelope, ProtocolError};

/// Presence change delivered to every subscriber of a channel.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    /// Full snapshot of the presence table, sent on every change.
    Sync { state: HashMap<String, Value> },
    /// A presence key appeared.
    Join { key: String, record: Value },
    /// A presence key disappeared.
    Leave { key: String, record: Value },
}

/// Message delivered by [`ChannelHandle::recv`].
#[derive(Debug, Clone)]
pub enum ChannelMessage {
    Broadcast(Envelope),
    Presence(PresenceEvent),
}

/// Channel health counters.
#[derive(Debug, Clone, Default)]
pub struct ChannelStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub subscribers: usize,
    pub tracked_keys: usize,
}

/// Channel-level errors.
#[derive(Debug, Clone)]
pub enum ChannelError {
    /// The channel's bus has shut down.
    Closed,
    /// The handle was already unsubscribed.
    Unsubscribed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "channel closed"),
            Self::Unsubscribed => write!(f, "handle already unsubscribed"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
        }
    }
}

impl std::error::Error for ChannelError {}

impl From<ProtocolError> for ChannelError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

// Lock poisoning carries no recoverable state here; take the inner value.
fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

struct Subscriber {
    presence_key: String,
    tracked: bool,
}

/// One named topic: broadcast bus + presence table.
struct Topic {
    name: String,
    bus: broadcast::Sender<Arc<Vec<u8>>>,
    presence_bus: broadcast::Sender<PresenceEvent>,
    presence: RwLock<HashMap<String, Value>>,
    subscribers: RwLock<HashMap<Uuid, Subscriber>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl Topic {
    fn new(name: String, capacity: usize) -> Self {
        let (bus, _) = broadcast::channel(capacity);
        let (presence_bus, _) = broadcast::channel(capacity);
        Self {
            name,
            bus,
            presence_bus,
            presence: RwLock::new(HashMap::new()),
            subscribers: RwLock::new(HashMap::new()),
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn emit_presence(&self, event: PresenceEvent) {
        // No receivers is fine: nobody to notify.
        let _ = self.presence_bus.send(event);
        let snapshot = read(&self.presence).clone();
        let _ = self.presence_bus.send(PresenceEvent::Sync { state: snapshot });
    }

    fn track(&self, conn_id: Uuid, key: &str, record: Value) -> bool {
        {
            let mut subscribers = write(&self.subscribers);
            match subscribers.get_mut(&conn_id) {
                Some(sub) => sub.tracked = true,
                // Publishers can outlive their handle (heartbeat tasks racing
                // a drop). A track through a dead connection must not
                // resurrect a presence record nothing can untrack.
                None => {
                    log::debug!("ignoring track through dead connection on '{}'", self.name);
                    return false;
                }
            }
        }
        let joined = {
            let mut presence = write(&self.presence);
            presence.insert(key.to_string(), record.clone()).is_none()
        };
        if joined {
            self.emit_presence(PresenceEvent::Join {
                key: key.to_string(),
                record,
            });
        } else {
            // Re-track refreshes the record; snapshot only.
            let snapshot = read(&self.presence).clone();
            let _ = self.presence_bus.send(PresenceEvent::Sync { state: snapshot });
        }
        true
    }

    fn untrack(&self, conn_id: Uuid, key: &str) {
        {
            let mut subscribers = write(&self.subscribers);
            match subscribers.get_mut(&conn_id) {
                Some(sub) if sub.tracked => sub.tracked = false,
                _ => return, // idempotent
            }
            // Another connection with the same identity may still track it.
            let still_tracked = subscribers
                .values()
                .any(|s| s.tracked && s.presence_key == key);
            if still_tracked {
                return;
            }
        }
        let removed = write(&self.presence).remove(key);
        if let Some(record) = removed {
            log::debug!("presence leave on '{}': {key}", self.name);
            self.emit_presence(PresenceEvent::Leave {
                key: key.to_string(),
                record,
            });
        }
    }
}

/// Registry of live channels, injected into every component.
///
/// Channels are created on first subscribe and torn down when the last
/// handle unsubscribes; no state outlives its subscribers.
#[derive(Clone)]
pub struct ChannelHub {
    topics: Arc<RwLock<HashMap<String, Arc<Topic>>>>,
    capacity: usize,
}

impl ChannelHub {
    /// Create a hub whose channels buffer `capacity` messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    /// Join a named channel. `presence_key` identifies this subscriber across
    /// reconnects and must be the stable caller identity id.
    pub fn subscribe(&self, name: &str, presence_key: &str) -> Result<ChannelHandle, ChannelError> {
        let topic = {
            let mut topics = write(&self.topics);
            topics
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Topic::new(name.to_string(), self.capacity)))
                .clone()
        };

        let conn_id = Uuid::new_v4();
        let bus_rx = topic.bus.subscribe();
        let presence_rx = topic.presence_bus.subscribe();
        write(&topic.subscribers).insert(
            conn_id,
            Subscriber {
                presence_key: presence_key.to_string(),
                tracked: false,
            },
        );
        log::debug!("subscribed to '{name}' as {presence_key} ({conn_id})");

        Ok(ChannelHandle {
            hub: self.clone(),
            publisher: ChannelPublisher {
                topic,
                conn_id,
                presence_key: presence_key.to_string(),
            },
            bus_rx,
            presence_rx,
            open: true,
        })
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        read(&self.topics).len()
    }

    fn remove_if_empty(&self, name: &str) {
        let mut topics = write(&self.topics);
        if let Some(topic) = topics.get(name) {
            if read(&topic.subscribers).is_empty() {
                topics.remove(name);
                log::debug!("channel '{name}' torn down");
            }
        }
    }
}

/// Cheap-to-clone sending half of a subscription.
///
/// Publishers let long-lived tasks (heartbeats, local-update pumps) send
/// without owning the receiving half.
#[derive(Clone)]
pub struct ChannelPublisher {
    topic: Arc<Topic>,
    conn_id: Uuid,
    presence_key: String,
}

impl ChannelPublisher {
    /// Fire-and-forget broadcast of a pre-built envelope.
    pub fn broadcast_envelope(&self, envelope: &Envelope) -> Result<usize, ChannelError> {
        let encoded = envelope.encode()?;
        let receivers = self.topic.bus.send(Arc::new(encoded)).unwrap_or(0);
        self.topic.sent.fetch_add(1, Ordering::Relaxed);
        Ok(receivers)
    }

    /// Broadcast a binary payload under `event`.
    pub fn broadcast_binary(&self, event: &str, payload: Vec<u8>) -> Result<usize, ChannelError> {
        let envelope = Envelope::binary(event, self.conn_id, self.presence_key.clone(), payload);
        self.broadcast_envelope(&envelope)
    }

    /// Broadcast a JSON payload under `event`.
    pub fn broadcast_json<T: Serialize>(
        &self,
        event: &str,
        value: &T,
    ) -> Result<usize, ChannelError> {
        let envelope = Envelope::json(event, self.conn_id, self.presence_key.clone(), value)?;
        self.broadcast_envelope(&envelope)
    }

    /// Publish this subscriber's presence record. Returns false when the
    /// subscription is gone and the record was not published.
    pub fn track(&self, record: Value) -> bool {
        self.topic.track(self.conn_id, &self.presence_key, record)
    }

    /// Publish a serializable presence record. Fails with
    /// [`ChannelError::Unsubscribed`] when the subscription is gone, so
    /// long-lived publisher tasks notice and stop.
    pub fn track_value<T: Serialize>(&self, record: &T) -> Result<(), ChannelError> {
        let value = serde_json::to_value(record)
            .map_err(|e| ChannelError::Protocol(ProtocolError::Serialization(e.to_string())))?;
        if !self.track(value) {
            return Err(ChannelError::Unsubscribed);
        }
        Ok(())
    }

    /// Clear this subscriber's presence record. Idempotent.
    pub fn untrack(&self) {
        self.topic.untrack(self.conn_id, &self.presence_key);
    }

    /// Live snapshot of the channel's presence table.
    ///
    /// This reads the table directly rather than any locally cached view, so
    /// callers (the edit lock in particular) race against propagation delay
    /// as little as the transport allows.
    pub fn presence_snapshot(&self) -> HashMap<String, Value> {
        read(&self.topic.presence).clone()
    }

    /// Number of live subscriptions on this channel.
    pub fn subscriber_count(&self) -> usize {
        read(&self.topic.subscribers).len()
    }

    /// Channel health counters.
    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_sent: self.topic.sent.load(Ordering::Relaxed),
            messages_dropped: self.topic.dropped.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            tracked_keys: read(&self.topic.presence).len(),
        }
    }

    /// This subscription's connection id.
    pub fn connection_id(&self) -> Uuid {
        self.conn_id
    }

    /// The presence key this subscription registered with.
    pub fn presence_key(&self) -> &str {
        &self.presence_key
    }

    /// Channel name.
    pub fn name(&self) -> &str {
        &self.topic.name
    }
}

/// One subscription to a channel: publisher plus delivery stream.
pub struct ChannelHandle {
    hub: ChannelHub,
    publisher: ChannelPublisher,
    bus_rx: broadcast::Receiver<Arc<Vec<u8>>>,
    presence_rx: broadcast::Receiver<PresenceEvent>,
    open: bool,
}

impl ChannelHandle {
    /// Sending half, cloneable for background tasks.
    pub fn publisher(&self) -> ChannelPublisher {
        self.publisher.clone()
    }

    /// Receive the next message on this subscription.
    ///
    /// Our own broadcasts are filtered out here (origin filtering); presence
    /// events are delivered for every subscriber including ourselves.
    /// Malformed envelopes are dropped with a warning, never surfaced.
    pub async fn recv(&mut self) -> Result<ChannelMessage, ChannelError> {
        if !self.open {
            return Err(ChannelError::Unsubscribed);
        }
        loop {
            tokio::select! {
                msg = self.bus_rx.recv() => match msg {
                    Ok(bytes) => match Envelope::decode(&bytes) {
                        Ok(envelope) => {
                            if envelope.sender == self.publisher.conn_id {
                                continue;
                            }
                            return Ok(ChannelMessage::Broadcast(envelope));
                        }
                        Err(e) => {
                            log::warn!(
                                "dropping malformed envelope on '{}': {e}",
                                self.publisher.name()
                            );
                            continue;
                        }
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.publisher.topic.dropped.fetch_add(n, Ordering::Relaxed);
                        log::warn!("subscriber lagged on '{}', dropped {n}", self.publisher.name());
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
                },
                ev = self.presence_rx.recv() => match ev {
                    Ok(event) => return Ok(ChannelMessage::Presence(event)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.publisher.topic.dropped.fetch_add(n, Ordering::Relaxed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
                },
            }
        }
    }

    /// Broadcast a binary payload. See [`ChannelPublisher::broadcast_binary`].
    pub fn broadcast_binary(&self, event: &str, payload: Vec<u8>) -> Result<usize, ChannelError> {
        self.publisher.broadcast_binary(event, payload)
    }

    /// Broadcast a JSON payload. See [`ChannelPublisher::broadcast_json`].
    pub fn broadcast_json<T: Serialize>(
        &self,
        event: &str,
        value: &T,
    ) -> Result<usize, ChannelError> {
        self.publisher.broadcast_json(event, value)
    }

    /// Publish this subscriber's presence record.
    pub fn track(&self, record: Value) -> bool {
        self.publisher.track(record)
    }

    /// Clear this subscriber's presence record.
    pub fn untrack(&self) {
        self.publisher.untrack();
    }

    /// Live presence snapshot.
    pub fn presence_snapshot(&self) -> HashMap<String, Value> {
        self.publisher.presence_snapshot()
    }

    /// Leave the channel: untrack presence, drop the subscription, and tear
    /// the channel down if this was the last subscriber. Idempotent.
    pub fn unsubscribe(&mut self) {
        if !self.open {
            return;
        }
        self.open = false;
        self.publisher.untrack();
        write(&self.publisher.topic.subscribers).remove(&self.publisher.conn_id);
        self.hub.remove_if_empty(self.publisher.name());
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
