//! Room facades composing the collaboration components.
//!
//! [`DocumentRoom`] wires one channel subscription per plane for a shared
//! document: CRDT sync + awareness + cursors on the main channel, the edit
//! lock on a companion channel (so lock presence records never mix with
//! profile records). [`BoardRoom`] composes only the ephemeral drag/hover
//! layer on a bare channel; boards have no document and no lock.
//!
//! ```text
//!               ┌────────────────────────────┐
//!  host UI ◄────│ RoomEvent stream (mpsc)    │
//!               └────────────▲───────────────┘
//!                            │
//!   DocumentRoom ── pump ── ChannelHandle "room:<name>"      (doc/awareness/cursor)
//!        │                  ChannelHandle "room:<name>:lock" (edit lock presence)
//!        └── sweeper task (ephemeral TTL)
//! ```
//!
//! The room requires a resolved [`UserIdentity`]; hosts hold off joining
//! until their identity provider delivers one. `close()` (or drop) releases
//! the lock, stops every task, and unsubscribes, and is safe to call at any
//! point of the lifecycle, including mid-handshake.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::awareness::{AwarenessDelta, AwarenessStore, PeerState};
use crate::channel::{
    ChannelError, ChannelHandle, ChannelHub, ChannelMessage, ChannelPublisher, PresenceEvent,
};
use crate::config::{CollabConfig, ConfigError};
use crate::ephemeral::{BoardPresence, CursorTracker};
use crate::identity::UserIdentity;
use crate::lock::{active_editor, EditLockManager, LockState};
use crate::protocol::{
    CursorEvent, DragEvent, EditLockRecord, Envelope, HoverEvent, EV_AWARENESS, EV_CURSOR,
    EV_DOC_UPDATE, EV_DRAG, EV_HOVER, EV_SYNC_REPLY, EV_SYNC_REQUEST,
};
use crate::protocol::wall_clock_millis;
use crate::sync::{CrdtDoc, DocSyncProvider, SyncError, SyncStatus};

/// A peer as presented to the UI: awareness entry plus decoded state.
#[derive(Debug, Clone)]
pub struct Peer {
    pub client_id: String,
    pub state: Option<PeerState>,
    pub updated_at: u64,
}

/// Events emitted to the host UI.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// Connection status or synced flag changed.
    Status { status: SyncStatus, synced: bool },
    /// The ranked peer list changed (most recently active first).
    Peers(Vec<Peer>),
    /// Edit lock ownership changed.
    Lock {
        editor: Option<EditLockRecord>,
        can_edit: bool,
    },
    /// Remote cursor set changed.
    Cursors(Vec<CursorEvent>),
    /// Remote drag indicators changed (board rooms).
    Drags(Vec<DragEvent>),
    /// Remote hover indicators changed (board rooms).
    Hovers(Vec<HoverEvent>),
}

/// Room-level errors.
#[derive(Debug, Clone)]
pub enum RoomError {
    Config(ConfigError),
    Channel(ChannelError),
    Sync(SyncError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Channel(e) => write!(f, "channel error: {e}"),
            Self::Sync(e) => write!(f, "sync error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<ConfigError> for RoomError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<ChannelError> for RoomError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

impl From<SyncError> for RoomError {
    fn from(e: SyncError) -> Self {
        Self::Sync(e)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Profile record tracked on the main channel so peers can attribute
/// leave events to an identity.
fn profile_record(identity: &UserIdentity) -> Value {
    json!({
        "clerkId": identity.id,
        "name": identity.display_name,
        "image": identity.image_url,
    })
}

/// One client's membership in a collaborative document room.
pub struct DocumentRoom<D: CrdtDoc> {
    identity: UserIdentity,
    provider: Arc<DocSyncProvider<D>>,
    awareness: Arc<Mutex<AwarenessStore>>,
    cursors: Arc<Mutex<CursorTracker>>,
    lock_manager: EditLockManager,
    publisher: ChannelPublisher,
    events_tx: mpsc::UnboundedSender<RoomEvent>,
    pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
    /// Pins the doc's local-update observer; not `Send`, so the room (unlike
    /// its background tasks) stays on the thread that created it.
    _update_subscription: D::UpdateSubscription,
}

impl<D: CrdtDoc> DocumentRoom<D> {
    /// Join `room` as `identity`, syncing `doc`.
    ///
    /// Returns the room plus the UI event stream.
    pub fn join(
        hub: &ChannelHub,
        room: &str,
        identity: UserIdentity,
        doc: Arc<D>,
        config: CollabConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>), RoomError> {
        config.validate()?;

        let main = hub.subscribe(&format!("room:{room}"), &identity.id)?;
        let lock_handle = hub.subscribe(&format!("room:{room}:lock"), &identity.id)?;
        let publisher = main.publisher();
        let lock_publisher = lock_handle.publisher();

        main.track(profile_record(&identity));

        let (provider, update_subscription) = DocSyncProvider::start(publisher.clone(), doc)?;
        let provider = Arc::new(provider);
        let awareness = Arc::new(Mutex::new(AwarenessStore::new(identity.id.clone())));
        let cursors = Arc::new(Mutex::new(CursorTracker::new(identity.clone(), &config)));
        let lock_manager =
            EditLockManager::new(lock_publisher.clone(), identity.clone(), config.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(Self::pump(
            main,
            lock_handle,
            provider.clone(),
            awareness.clone(),
            cursors.clone(),
            identity.id.clone(),
            config.clone(),
            events_tx.clone(),
        ));

        let sweeper = {
            let cursors = cursors.clone();
            let events_tx = events_tx.clone();
            let interval = config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let removed = lock(&cursors).sweep();
                    if !removed.is_empty() {
                        let snapshot = lock(&cursors).cursors().into_iter().cloned().collect();
                        let _ = events_tx.send(RoomEvent::Cursors(snapshot));
                    }
                }
            })
        };

        let _ = events_tx.send(RoomEvent::Status {
            status: provider.status(),
            synced: provider.synced(),
        });

        Ok((
            Self {
                identity,
                provider,
                awareness,
                cursors,
                lock_manager,
                publisher,
                events_tx,
                pump: Some(pump),
                sweeper: Some(sweeper),
                _update_subscription: update_subscription,
            },
            events_rx,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        mut main: ChannelHandle,
        mut lock_handle: ChannelHandle,
        provider: Arc<DocSyncProvider<D>>,
        awareness: Arc<Mutex<AwarenessStore>>,
        cursors: Arc<Mutex<CursorTracker>>,
        local_id: String,
        config: CollabConfig,
        events_tx: mpsc::UnboundedSender<RoomEvent>,
    ) {
        let mut was_synced = provider.synced();
        loop {
            tokio::select! {
                msg = main.recv() => match msg {
                    Ok(ChannelMessage::Broadcast(env)) => {
                        Self::on_broadcast(
                            &env, &provider, &awareness, &cursors, &events_tx,
                        );
                        if provider.synced() != was_synced {
                            was_synced = provider.synced();
                            let _ = events_tx.send(RoomEvent::Status {
                                status: provider.status(),
                                synced: was_synced,
                            });
                        }
                    }
                    Ok(ChannelMessage::Presence(PresenceEvent::Leave { key, .. })) => {
                        let changed = lock(&awareness).remove_client(&key);
                        if changed {
                            let _ = events_tx.send(RoomEvent::Peers(peer_list(&lock(&awareness))));
                        }
                        if lock(&cursors).remove_peer(&key) {
                            let snapshot =
                                lock(&cursors).cursors().into_iter().cloned().collect();
                            let _ = events_tx.send(RoomEvent::Cursors(snapshot));
                        }
                    }
                    Ok(ChannelMessage::Presence(_)) => {}
                    Err(_) => {
                        provider.mark_disconnected();
                        let _ = events_tx.send(RoomEvent::Status {
                            status: provider.status(),
                            synced: provider.synced(),
                        });
                        break;
                    }
                },
                ev = lock_handle.recv() => match ev {
                    Ok(ChannelMessage::Presence(_)) => {
                        let snapshot = lock_handle.presence_snapshot();
                        let now = wall_clock_millis();
                        let stale_ms = config.stale_lock_timeout.as_millis() as u64;
                        let editor = active_editor(&snapshot, now, stale_ms);
                        let can_edit = editor
                            .as_ref()
                            .map_or(true, |e| e.clerk_id == local_id);
                        let _ = events_tx.send(RoomEvent::Lock { editor, can_edit });
                    }
                    Ok(ChannelMessage::Broadcast(_)) => {}
                    Err(_) => break,
                },
            }
        }
    }

    fn on_broadcast(
        env: &Envelope,
        provider: &DocSyncProvider<D>,
        awareness: &Mutex<AwarenessStore>,
        cursors: &Mutex<CursorTracker>,
        events_tx: &mpsc::UnboundedSender<RoomEvent>,
    ) {
        match env.event.as_str() {
            EV_DOC_UPDATE | EV_SYNC_REQUEST | EV_SYNC_REPLY => {
                if let Err(e) = provider.handle_remote(env) {
                    log::warn!("sync handling failed: {e}");
                }
            }
            EV_AWARENESS => match AwarenessDelta::decode(&env.payload) {
                Ok(delta) => {
                    let changed = lock(awareness).apply_remote_delta(&delta);
                    if changed {
                        let _ = events_tx.send(RoomEvent::Peers(peer_list(&lock(awareness))));
                    }
                }
                Err(e) => log::warn!("dropping malformed awareness delta: {e}"),
            },
            EV_CURSOR => match env.parse_json::<CursorEvent>() {
                Ok(event) => {
                    if lock(cursors).handle_remote(event) {
                        let snapshot = lock(cursors).cursors().into_iter().cloned().collect();
                        let _ = events_tx.send(RoomEvent::Cursors(snapshot));
                    }
                }
                Err(e) => log::warn!("dropping malformed cursor event: {e}"),
            },
            _ => {}
        }
    }

    /// The synchronized document.
    pub fn doc(&self) -> &Arc<D> {
        self.provider.doc()
    }

    pub fn status(&self) -> SyncStatus {
        self.provider.status()
    }

    pub fn synced(&self) -> bool {
        self.provider.synced()
    }

    /// Publish our awareness state (cursor/selection/profile blob).
    pub fn set_awareness_state(&self, state: &PeerState) -> Result<(), RoomError> {
        let blob = state.encode().map_err(|e| RoomError::Sync(SyncError::Protocol(e)))?;
        let delta = lock(&self.awareness).set_local_state(blob);
        let encoded = delta.encode().map_err(|e| RoomError::Sync(SyncError::Protocol(e)))?;
        self.publisher.broadcast_binary(EV_AWARENESS, encoded)?;
        let _ = self
            .events_tx
            .send(RoomEvent::Peers(peer_list(&lock(&self.awareness))));
        Ok(())
    }

    /// Clear our awareness entry.
    pub fn clear_awareness_state(&self) -> Result<(), RoomError> {
        let delta = lock(&self.awareness).clear_local_state();
        let encoded = delta.encode().map_err(|e| RoomError::Sync(SyncError::Protocol(e)))?;
        self.publisher.broadcast_binary(EV_AWARENESS, encoded)?;
        Ok(())
    }

    /// Broadcast a local cursor move (throttled).
    pub fn set_cursor(&self, position: crate::protocol::Position) -> Result<(), RoomError> {
        let event = lock(&self.cursors).update_local(position);
        if let Some(event) = event {
            self.publisher.broadcast_json(EV_CURSOR, &event)?;
        }
        Ok(())
    }

    /// Ranked peer list: most recently active first.
    pub fn peers(&self) -> Vec<Peer> {
        peer_list(&lock(&self.awareness))
    }

    /// Remote cursors currently visible.
    pub fn cursors(&self) -> Vec<CursorEvent> {
        lock(&self.cursors).cursors().into_iter().cloned().collect()
    }

    /// Try to claim the edit lock. See [`EditLockManager::request_edit`].
    pub fn request_edit(&mut self) -> Result<bool, RoomError> {
        Ok(self.lock_manager.request_edit()?)
    }

    /// Release the edit lock. Idempotent.
    pub fn release_edit(&mut self) {
        self.lock_manager.release_edit();
    }

    pub fn can_edit(&self) -> bool {
        self.lock_manager.can_edit()
    }

    pub fn current_editor(&self) -> Option<EditLockRecord> {
        self.lock_manager.current_editor()
    }

    pub fn lock_state(&self) -> LockState {
        self.lock_manager.state()
    }

    pub fn identity(&self) -> &UserIdentity {
        &self.identity
    }

    /// Leave the room: release the lock, stop all tasks, unsubscribe.
    /// Idempotent and safe at any lifecycle point.
    pub fn close(&mut self) {
        self.lock_manager.release_edit();
        if let Some(task) = self.sweeper.take() {
            task.abort();
        }
        if let Some(task) = self.pump.take() {
            // Aborting drops the channel handles held by the pump, which
            // untracks presence and emits Leave for the other peers.
            task.abort();
        }
        self.publisher.untrack();
        log::info!("left room '{}'", self.publisher.name());
    }
}

impl<D: CrdtDoc> Drop for DocumentRoom<D> {
    fn drop(&mut self) {
        self.close();
    }
}

fn peer_list(store: &AwarenessStore) -> Vec<Peer> {
    let mut peers: Vec<Peer> = store
        .entries()
        .values()
        .map(|entry| Peer {
            client_id: entry.client_id.clone(),
            state: PeerState::decode(&entry.state).ok(),
            updated_at: entry.updated_at,
        })
        .collect();
    peers.sort_by(|a, b| {
        b.updated_at
            .cmp(&a.updated_at)
            .then_with(|| a.client_id.cmp(&b.client_id))
    });
    peers
}

/// One client's membership on a kanban board: ephemeral indicators only.
pub struct BoardRoom {
    board: Arc<Mutex<BoardPresence>>,
    publisher: ChannelPublisher,
    pump: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl BoardRoom {
    /// Join a board channel as `identity`.
    pub fn join(
        hub: &ChannelHub,
        board_id: &str,
        identity: UserIdentity,
        config: CollabConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<RoomEvent>), RoomError> {
        config.validate()?;

        let handle = hub.subscribe(&format!("board:{board_id}"), &identity.id)?;
        let publisher = handle.publisher();
        handle.track(profile_record(&identity));

        let board = Arc::new(Mutex::new(BoardPresence::new(identity, &config)));
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pump = {
            let board = board.clone();
            let events_tx = events_tx.clone();
            let mut handle = handle;
            tokio::spawn(async move {
                loop {
                    match handle.recv().await {
                        Ok(ChannelMessage::Broadcast(env)) => match env.event.as_str() {
                            EV_DRAG => match env.parse_json::<DragEvent>() {
                                Ok(event) => {
                                    if lock(&board).handle_remote_drag(event) {
                                        let snapshot =
                                            lock(&board).drags().into_iter().cloned().collect();
                                        let _ = events_tx.send(RoomEvent::Drags(snapshot));
                                    }
                                }
                                Err(e) => log::warn!("dropping malformed drag event: {e}"),
                            },
                            EV_HOVER => match env.parse_json::<HoverEvent>() {
                                Ok(event) => {
                                    if lock(&board).handle_remote_hover(event) {
                                        let snapshot =
                                            lock(&board).hovers().into_iter().cloned().collect();
                                        let _ = events_tx.send(RoomEvent::Hovers(snapshot));
                                    }
                                }
                                Err(e) => log::warn!("dropping malformed hover event: {e}"),
                            },
                            _ => {}
                        },
                        Ok(ChannelMessage::Presence(PresenceEvent::Leave { key, .. })) => {
                            lock(&board).remove_peer(&key);
                            let drags = lock(&board).drags().into_iter().cloned().collect();
                            let hovers = lock(&board).hovers().into_iter().cloned().collect();
                            let _ = events_tx.send(RoomEvent::Drags(drags));
                            let _ = events_tx.send(RoomEvent::Hovers(hovers));
                        }
                        Ok(ChannelMessage::Presence(_)) => {}
                        Err(_) => break,
                    }
                }
            })
        };

        let sweeper = {
            let board = board.clone();
            let events_tx = events_tx.clone();
            let interval = config.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    let removed = lock(&board).sweep();
                    if !removed.is_empty() {
                        let drags = lock(&board).drags().into_iter().cloned().collect();
                        let hovers = lock(&board).hovers().into_iter().cloned().collect();
                        let _ = events_tx.send(RoomEvent::Drags(drags));
                        let _ = events_tx.send(RoomEvent::Hovers(hovers));
                    }
                }
            })
        };

        Ok((
            Self {
                board,
                publisher,
                pump: Some(pump),
                sweeper: Some(sweeper),
            },
            events_rx,
        ))
    }

    /// Broadcast a local drag move; `None` ends the drag.
    pub fn set_drag(&self, card_id: Option<String>) -> Result<(), RoomError> {
        let event = lock(&self.board).update_local_drag(card_id);
        if let Some(event) = event {
            self.publisher.broadcast_json(EV_DRAG, &event)?;
        }
        Ok(())
    }

    /// Broadcast a local hover change; `None` ends the hover.
    pub fn set_hover(&self, column_id: Option<String>) -> Result<(), RoomError> {
        let event = lock(&self.board).update_local_hover(column_id);
        if let Some(event) = event {
            self.publisher.broadcast_json(EV_HOVER, &event)?;
        }
        Ok(())
    }

    /// Peers currently dragging.
    pub fn drags(&self) -> Vec<DragEvent> {
        lock(&self.board).drags().into_iter().cloned().collect()
    }

    /// Peers currently hovering.
    pub fn hovers(&self) -> Vec<HoverEvent> {
        lock(&self.board).hovers().into_iter().cloned().collect()
    }

    /// Leave the board. Idempotent.
    pub fn close(&mut self) {
        if let Some(task) = self.sweeper.take() {
            task.abort();
        }
        if let Some(task) = self.pump.take() {
            task.abort();
        }
        self.publisher.untrack();
    }
}

impl Drop for BoardRoom {
    fn drop(&mut self) {
        self.close();
    }
}
