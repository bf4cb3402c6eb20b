//! Soft, self-expiring edit lock over channel presence.
//!
//! Only one participant edits prose at a time; everyone else watches live.
//! The lock is cooperative: there is no central arbiter, clients voluntarily
//! inspect the live presence table before claiming, and a claim is kept
//! alive by re-tracking the presence record with a refreshed heartbeat every
//! [`CollabConfig::heartbeat_interval`]. A claim whose heartbeat is older
//! than [`CollabConfig::stale_lock_timeout`] is treated as abandoned by the
//! next requester; no one evicts it centrally.
//!
//! Two clients requesting within one presence-propagation window can both
//! observe "no holder" and both claim. That race is accepted: presence
//! convergence makes it visible and self-correcting, and upgrading to a
//! server-arbitrated lock is an explicit design change, not a fix.

use std::collections::HashMap;

use serde_json::Value;
use tokio::task::JoinHandle;

use crate::channel::{ChannelError, ChannelPublisher};
use crate::config::CollabConfig;
use crate::identity::UserIdentity;
use crate::protocol::{wall_clock_millis, EditLockRecord};

/// Per-client lock state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Idle,
    Requesting,
    Held,
}

/// Manages this client's edit lock claim on one channel.
pub struct EditLockManager {
    publisher: ChannelPublisher,
    identity: UserIdentity,
    config: CollabConfig,
    state: LockState,
    heartbeat: Option<JoinHandle<()>>,
}

impl EditLockManager {
    pub fn new(publisher: ChannelPublisher, identity: UserIdentity, config: CollabConfig) -> Self {
        Self {
            publisher,
            identity,
            config,
            state: LockState::Idle,
            heartbeat: None,
        }
    }

    /// Try to claim the edit lock.
    ///
    /// Inspects the *live* presence snapshot rather than any cached view.
    /// Returns `Ok(false)` if a non-stale claim by a different client wins;
    /// otherwise tracks our own record and starts heartbeating.
    /// Re-requesting while held refreshes the claim without resetting its
    /// `editingStartedAt`.
    ///
    /// A denial withdraws any claim we were advertising: if two clients
    /// raced and ours lost, the heartbeat stops and our record is untracked
    /// before the denial is reported.
    pub fn request_edit(&mut self) -> Result<bool, ChannelError> {
        let was_held = self.state == LockState::Held;
        self.state = LockState::Requesting;

        let now = wall_clock_millis();
        let stale_ms = self.config.stale_lock_timeout.as_millis() as u64;
        let record = match self.active_holder(now, stale_ms) {
            Some(holder) if holder.clerk_id == self.identity.id => holder.refreshed(),
            Some(holder) => {
                log::debug!(
                    "edit lock denied: held by {} (heartbeat {}ms ago)",
                    holder.clerk_id,
                    now.saturating_sub(holder.last_heartbeat)
                );
                // Lost a claim race: stop advertising our own record before
                // reporting the denial.
                self.release_edit();
                if was_held {
                    log::info!(
                        "edit lock ceded to {} by {}",
                        holder.clerk_id,
                        self.identity.id
                    );
                }
                return Ok(false);
            }
            None => EditLockRecord::claim(&self.identity),
        };

        if let Err(e) = self.publisher.track_value(&record) {
            self.state = LockState::Idle;
            return Err(e);
        }
        self.start_heartbeat(record);
        self.state = LockState::Held;
        log::info!("edit lock claimed by {}", self.identity.id);
        Ok(true)
    }

    /// Release the lock: stop heartbeats and untrack presence. Idempotent.
    pub fn release_edit(&mut self) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        if self.state == LockState::Held {
            log::info!("edit lock released by {}", self.identity.id);
        }
        self.publisher.untrack();
        self.state = LockState::Idle;
    }

    /// Whether this client may mutate the document right now: no active
    /// holder exists, or the active holder is this client.
    pub fn can_edit(&self) -> bool {
        let now = wall_clock_millis();
        let stale_ms = self.config.stale_lock_timeout.as_millis() as u64;
        match self.active_holder(now, stale_ms) {
            None => true,
            Some(holder) => holder.clerk_id == self.identity.id,
        }
    }

    /// The current non-stale holder, if any (possibly ourselves).
    ///
    /// A stale claim is still reported as absent here, but a *ghost* claim
    /// inside the stale window is reported as the holder: "someone appears
    /// to be editing" stays visible until the window elapses.
    pub fn current_editor(&self) -> Option<EditLockRecord> {
        let now = wall_clock_millis();
        let stale_ms = self.config.stale_lock_timeout.as_millis() as u64;
        self.active_holder(now, stale_ms)
    }

    pub fn state(&self) -> LockState {
        self.state
    }

    pub fn is_held(&self) -> bool {
        self.state == LockState::Held
    }

    fn active_holder(&self, now: u64, stale_ms: u64) -> Option<EditLockRecord> {
        active_editor(&self.publisher.presence_snapshot(), now, stale_ms)
    }

    fn start_heartbeat(&mut self, record: EditLockRecord) {
        if let Some(task) = self.heartbeat.take() {
            task.abort();
        }
        let publisher = self.publisher.clone();
        let interval = self.config.heartbeat_interval;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick completes immediately
            loop {
                ticker.tick().await;
                if let Err(e) = publisher.track_value(&record.refreshed()) {
                    log::warn!("edit lock heartbeat failed: {e}");
                    break;
                }
            }
        }));
    }
}

impl Drop for EditLockManager {
    fn drop(&mut self) {
        self.release_edit();
    }
}

/// The winning non-stale claim in a presence snapshot, if any.
///
/// When two fresh claims race, every replica resolves the same winner: the
/// earliest `editingStartedAt`, ties broken by clerk id. Unreadable records
/// are skipped with a warning so one misbehaving peer cannot wedge the lock
/// for everyone.
pub(crate) fn active_editor(
    snapshot: &HashMap<String, Value>,
    now: u64,
    stale_ms: u64,
) -> Option<EditLockRecord> {
    snapshot
        .iter()
        .filter_map(|(key, value)| {
            match serde_json::from_value::<EditLockRecord>(value.clone()) {
                Ok(record) => Some(record),
                Err(e) => {
                    log::warn!("ignoring unreadable lock record for '{key}': {e}");
                    None
                }
            }
        })
        .filter(|record| !record.is_stale(now, stale_ms))
        .min_by(|a, b| {
            a.editing_started_at
                .cmp(&b.editing_started_at)
                .then_with(|| a.clerk_id.cmp(&b.clerk_id))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelHub;
    use std::time::Duration;

    // The handle must outlive the manager: presence tracked through a dead
    // subscription is ignored by the channel.
    fn manager(hub: &ChannelHub, id: &str, name: &str) -> (EditLockManager, crate::channel::ChannelHandle) {
        let handle = hub.subscribe("room:lock", id).unwrap();
        let manager = EditLockManager::new(
            handle.publisher(),
            UserIdentity::new(id, name),
            CollabConfig::fast(),
        );
        (manager, handle)
    }

    #[tokio::test]
    async fn test_claim_on_free_lock() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");

        assert_eq!(a.state(), LockState::Idle);
        assert!(a.request_edit().unwrap());
        assert_eq!(a.state(), LockState::Held);
        assert!(a.can_edit());
        assert_eq!(a.current_editor().unwrap().clerk_id, "user_a");
    }

    #[tokio::test]
    async fn test_second_claim_denied_while_held() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        let (mut b, _hb) = manager(&hub, "user_b", "Bob");

        assert!(a.request_edit().unwrap());
        assert!(!b.request_edit().unwrap());
        assert_eq!(b.state(), LockState::Idle);
        assert!(!b.can_edit());
        assert_eq!(b.current_editor().unwrap().clerk_id, "user_a");
    }

    #[tokio::test]
    async fn test_release_then_reclaim() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        let (mut b, _hb) = manager(&hub, "user_b", "Bob");

        assert!(a.request_edit().unwrap());
        assert!(!b.request_edit().unwrap());

        a.release_edit();
        assert!(b.request_edit().unwrap());
        assert!(b.can_edit());
        assert!(!a.can_edit());
    }

    #[tokio::test]
    async fn test_release_idempotent_when_not_held() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        a.release_edit();
        a.release_edit();
        assert_eq!(a.state(), LockState::Idle);
    }

    #[tokio::test]
    async fn test_heartbeat_keeps_lock_fresh() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        let (mut b, _hb) = manager(&hub, "user_b", "Bob");

        assert!(a.request_edit().unwrap());

        // Sleep past the stale window; heartbeats must keep the claim alive.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!b.request_edit().unwrap());
        assert_eq!(b.current_editor().unwrap().clerk_id, "user_a");
    }

    #[tokio::test]
    async fn test_stale_claim_reclaimed() {
        let hub = ChannelHub::new(16);
        // A crashed: its record sits in presence with a dead heartbeat.
        let ghost = hub.subscribe("room:lock", "user_a").unwrap();
        let now = wall_clock_millis();
        ghost.track(
            serde_json::to_value(EditLockRecord {
                clerk_id: "user_a".into(),
                name: "Alice".into(),
                image: None,
                editing_started_at: now.saturating_sub(10_000),
                last_heartbeat: now.saturating_sub(1_000), // stale at fast() scale
            })
            .unwrap(),
        );

        let (mut b, _hb) = manager(&hub, "user_b", "Bob");
        assert!(b.can_edit(), "stale claim should not block editing");
        assert!(b.request_edit().unwrap());
        assert_eq!(b.current_editor().unwrap().clerk_id, "user_b");
    }

    #[tokio::test]
    async fn test_ghost_claim_visible_inside_window() {
        let hub = ChannelHub::new(16);
        let ghost = hub.subscribe("room:lock", "user_a").unwrap();
        let now = wall_clock_millis();
        ghost.track(
            serde_json::to_value(EditLockRecord {
                clerk_id: "user_a".into(),
                name: "Alice".into(),
                image: None,
                editing_started_at: now,
                last_heartbeat: now, // fresh: inside the stale window
            })
            .unwrap(),
        );

        let (mut b, _hb) = manager(&hub, "user_b", "Bob");
        // Never silently hidden: the ghost appears as the editor until stale.
        assert!(!b.can_edit());
        assert!(!b.request_edit().unwrap());
        assert_eq!(b.current_editor().unwrap().clerk_id, "user_a");
    }

    #[tokio::test]
    async fn test_rerequest_while_held_refreshes() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        assert!(a.request_edit().unwrap());
        assert!(a.request_edit().unwrap());
        assert_eq!(a.state(), LockState::Held);
    }

    #[tokio::test]
    async fn test_rerequest_preserves_editing_started_at() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");

        assert!(a.request_edit().unwrap());
        let started = a.current_editor().unwrap().editing_started_at;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(a.request_edit().unwrap());

        let refreshed = a.current_editor().unwrap();
        assert_eq!(refreshed.editing_started_at, started);
        assert!(refreshed.last_heartbeat >= started);
    }

    #[tokio::test]
    async fn test_claim_race_loser_withdraws() {
        let hub = ChannelHub::new(16);
        let (mut b, hb) = manager(&hub, "user_b", "Bob");
        assert!(b.request_edit().unwrap());

        // A competing claim that predates ours arrives late (the double-claim
        // race): both sides resolve the earlier claim as the winner.
        let rival = hub.subscribe("room:lock", "user_a").unwrap();
        let now = wall_clock_millis();
        rival.track(
            serde_json::to_value(EditLockRecord {
                clerk_id: "user_a".into(),
                name: "Alice".into(),
                image: None,
                editing_started_at: now.saturating_sub(10_000),
                last_heartbeat: now,
            })
            .unwrap(),
        );

        // Re-inspection loses the race and fully withdraws our claim.
        assert!(!b.request_edit().unwrap());
        assert_eq!(b.state(), LockState::Idle);
        assert!(hb.presence_snapshot().get("user_b").is_none());

        // No heartbeat survives to re-advertise the withdrawn claim.
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(hb.presence_snapshot().get("user_b").is_none());
        assert_eq!(b.current_editor().unwrap().clerk_id, "user_a");
    }

    #[tokio::test]
    async fn test_heartbeat_stops_when_subscription_dies() {
        let hub = ChannelHub::new(16);
        let observer = hub.subscribe("room:lock", "user_x").unwrap();
        let (mut a, ha) = manager(&hub, "user_a", "Alice");

        assert!(a.request_edit().unwrap());
        assert!(observer.presence_snapshot().contains_key("user_a"));

        // Connection dies while the heartbeat task is still running. The
        // untrack on drop removes the record and no heartbeat re-inserts it.
        drop(ha);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer.presence_snapshot().get("user_a").is_none());

        a.release_edit();
        assert!(observer.presence_snapshot().get("user_a").is_none());
    }

    #[tokio::test]
    async fn test_drop_releases_lock() {
        let hub = ChannelHub::new(16);
        let (mut a, _ha) = manager(&hub, "user_a", "Alice");
        let (mut b, _hb) = manager(&hub, "user_b", "Bob");

        assert!(a.request_edit().unwrap());
        assert!(!b.request_edit().unwrap());

        drop(a);
        assert!(b.request_edit().unwrap());
    }

    #[tokio::test]
    async fn test_unreadable_record_does_not_block() {
        let hub = ChannelHub::new(16);
        let other = hub.subscribe("room:lock", "user_x").unwrap();
        other.track(serde_json::json!({ "unexpected": true }));

        let (mut b, _hb) = manager(&hub, "user_b", "Bob");
        assert!(b.request_edit().unwrap());
    }
}
