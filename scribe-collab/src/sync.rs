//! CRDT document synchronization provider.
//!
//! Wraps a replicated document and keeps it converged with peers on the same
//! channel:
//!
//! ```text
//! local edit ──► CrdtDoc observer ──► pump task ──► broadcast "doc-update"
//! remote "doc-update" ──► apply as Remote origin (never rebroadcast)
//! start ──► broadcast "sync-request" (state vector)
//! remote "sync-request" ──► reply "sync-reply" (state diff)
//! remote "sync-reply" ──► apply, mark synced
//! ```
//!
//! Correctness rests on the CRDT merge being idempotent and commutative:
//! the transport is at-least-once and unordered, and the provider makes no
//! stronger assumption. Updates applied under the remote origin tag are
//! filtered out by the local-update observer, which is what breaks the
//! rebroadcast loop.
//!
//! The provider never blocks local mutation: transport failure only moves
//! the status to `Disconnected`/`Error` while the document stays writable
//! (local-first). Reconnection is caller-initiated by constructing a new
//! provider on a fresh channel subscription.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Origin, ReadTxn, StateVector, Transact, Update};

use crate::channel::{ChannelError, ChannelPublisher};
use crate::protocol::{Envelope, ProtocolError, EV_DOC_UPDATE, EV_SYNC_REPLY, EV_SYNC_REQUEST};

/// Origin tag attached to remote updates so the local observer can tell
/// echoes from genuine local edits.
const REMOTE_ORIGIN: &str = "scribe-remote";

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    Local,
    Remote,
}

/// Provider connection status. `synced` is orthogonal: it flips once the
/// first handshake round completes after `Connected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Connecting,
    Connected,
    Disconnected,
    Error,
}

/// Sync-level errors.
#[derive(Debug, Clone)]
pub enum SyncError {
    Channel(ChannelError),
    Protocol(ProtocolError),
    /// Update or state vector bytes the CRDT refused to decode.
    MalformedUpdate(String),
    /// The document could not register a local-update observer.
    Observer(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Channel(e) => write!(f, "channel error: {e}"),
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::MalformedUpdate(e) => write!(f, "malformed update: {e}"),
            Self::Observer(e) => write!(f, "observer registration failed: {e}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<ChannelError> for SyncError {
    fn from(e: ChannelError) -> Self {
        Self::Channel(e)
    }
}

/// Abstract replicated document.
///
/// Any CRDT whose update application is idempotent and commutative satisfies
/// the provider's convergence contract; the concrete algorithm is not
/// assumed. [`YrsDoc`] is the default implementation.
pub trait CrdtDoc: Send + Sync + 'static {
    /// Guard keeping the local-update observer registered; dropping it
    /// unregisters. The guard is owned by whoever created the provider and
    /// need not be `Send` (yrs subscription guards are not), which is why
    /// it is returned instead of stored behind the shared doc.
    type UpdateSubscription;

    /// Apply an encoded update under the given origin tag.
    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), SyncError>;

    /// Encode the full document state as a single update.
    fn encode_state_as_update(&self) -> Vec<u8>;

    /// Encode the current state vector.
    fn state_vector(&self) -> Vec<u8>;

    /// Encode the difference between local state and a remote state vector.
    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError>;

    /// Register a local-update observer. Updates applied with
    /// [`UpdateOrigin::Remote`] must not be delivered.
    fn subscribe_local_updates(
        &self,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self::UpdateSubscription, SyncError>;
}

/// Yrs-backed document.
pub struct YrsDoc {
    doc: yrs::Doc,
}

impl YrsDoc {
    pub fn new() -> Self {
        Self {
            doc: yrs::Doc::new(),
        }
    }

    /// The underlying yrs document, for host-side editing.
    pub fn doc(&self) -> &yrs::Doc {
        &self.doc
    }
}

impl Default for YrsDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl CrdtDoc for YrsDoc {
    type UpdateSubscription = yrs::Subscription;

    fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<(), SyncError> {
        let update =
            Update::decode_v1(update).map_err(|e| SyncError::MalformedUpdate(e.to_string()))?;
        let mut txn = match origin {
            UpdateOrigin::Remote => self.doc.transact_mut_with(REMOTE_ORIGIN),
            UpdateOrigin::Local => self.doc.transact_mut(),
        };
        txn.apply_update(update)
            .map_err(|e| SyncError::MalformedUpdate(e.to_string()))
    }

    fn encode_state_as_update(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| SyncError::MalformedUpdate(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    fn subscribe_local_updates(
        &self,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<yrs::Subscription, SyncError> {
        let remote_origin = Origin::from(REMOTE_ORIGIN);
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() == Some(&remote_origin) {
                    return; // echo of a remote update
                }
                let _ = tx.send(event.update.clone());
            })
            .map_err(|e| SyncError::Observer(e.to_string()))
    }
}

/// Keeps one [`CrdtDoc`] synchronized over one channel subscription.
///
/// The provider is an explicit state machine: the owning event loop feeds it
/// remote envelopes via [`handle_remote`](Self::handle_remote) and reads
/// [`status`](Self::status)/[`synced`](Self::synced); a background pump task
/// forwards local document updates to the channel.
pub struct DocSyncProvider<D: CrdtDoc> {
    doc: Arc<D>,
    publisher: ChannelPublisher,
    status: Arc<RwLock<SyncStatus>>,
    synced: Arc<AtomicBool>,
    pump: Option<JoinHandle<()>>,
}

impl<D: CrdtDoc> DocSyncProvider<D> {
    /// Start syncing `doc` over `publisher`'s channel.
    ///
    /// Registers the local-update observer, broadcasts the sync handshake
    /// request, and spawns the local-update pump. If no other subscriber is
    /// present there is nobody to handshake with and the provider marks
    /// itself synced immediately.
    ///
    /// The returned subscription guard pins the local-update observer; the
    /// caller holds it for as long as local edits should be broadcast.
    /// Dropping it closes the pump's input and the pump exits.
    pub fn start(
        publisher: ChannelPublisher,
        doc: Arc<D>,
    ) -> Result<(Self, D::UpdateSubscription), SyncError> {
        let status = Arc::new(RwLock::new(SyncStatus::Connecting));
        let synced = Arc::new(AtomicBool::new(false));

        let (local_tx, mut local_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = doc.subscribe_local_updates(local_tx)?;

        let pump_publisher = publisher.clone();
        let pump_status = status.clone();
        let pump = tokio::spawn(async move {
            while let Some(update) = local_rx.recv().await {
                if let Err(e) = pump_publisher.broadcast_binary(EV_DOC_UPDATE, update) {
                    log::warn!("doc-update broadcast failed: {e}");
                    set_status(&pump_status, SyncStatus::Disconnected);
                    break;
                }
            }
        });

        publisher.broadcast_binary(EV_SYNC_REQUEST, doc.state_vector())?;
        set_status(&status, SyncStatus::Connected);

        if publisher.subscriber_count() <= 1 {
            synced.store(true, Ordering::Release);
        }

        log::debug!(
            "sync provider started on '{}' as {}",
            publisher.name(),
            publisher.presence_key()
        );

        Ok((
            Self {
                doc,
                publisher,
                status,
                synced,
                pump: Some(pump),
            },
            subscription,
        ))
    }

    /// Feed a remote broadcast envelope into the state machine.
    ///
    /// Unrelated events are ignored; malformed deltas are dropped with a
    /// warning and never partially applied.
    pub fn handle_remote(&self, envelope: &Envelope) -> Result<(), SyncError> {
        match envelope.event.as_str() {
            EV_DOC_UPDATE => {
                if let Err(e) = self.doc.apply_update(&envelope.payload, UpdateOrigin::Remote) {
                    log::warn!("dropping malformed doc-update from {}: {e}", envelope.origin);
                }
                Ok(())
            }
            EV_SYNC_REQUEST => {
                let diff = match self.doc.diff(&envelope.payload) {
                    Ok(diff) => diff,
                    Err(e) => {
                        log::warn!(
                            "dropping malformed sync-request from {}: {e}",
                            envelope.origin
                        );
                        return Ok(());
                    }
                };
                self.publisher.broadcast_binary(EV_SYNC_REPLY, diff)?;
                Ok(())
            }
            EV_SYNC_REPLY => {
                match self.doc.apply_update(&envelope.payload, UpdateOrigin::Remote) {
                    Ok(()) => {
                        self.synced.store(true, Ordering::Release);
                    }
                    Err(e) => {
                        log::warn!("dropping malformed sync-reply from {}: {e}", envelope.origin);
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// Current connection status.
    pub fn status(&self) -> SyncStatus {
        *self
            .status
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Whether at least one handshake round has completed.
    pub fn synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// The synchronized document.
    pub fn doc(&self) -> &Arc<D> {
        &self.doc
    }

    /// Record a transport failure observed by the owning event loop.
    pub fn mark_disconnected(&self) {
        set_status(&self.status, SyncStatus::Disconnected);
    }

    /// Record a transport error observed by the owning event loop.
    pub fn mark_error(&self) {
        set_status(&self.status, SyncStatus::Error);
    }

    /// Stop the local-update pump. Safe to call in any state; the document
    /// itself stays usable.
    pub fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        set_status(&self.status, SyncStatus::Disconnected);
    }
}

impl<D: CrdtDoc> Drop for DocSyncProvider<D> {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

fn set_status(status: &Arc<RwLock<SyncStatus>>, value: SyncStatus) {
    *status.write().unwrap_or_else(|e| e.into_inner()) = value;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelHub, ChannelMessage};
    use std::time::Duration;
    use yrs::{GetString, Text};

    fn text_of(doc: &YrsDoc) -> String {
        let text = doc.doc().get_or_insert_text("content");
        let txn = doc.doc().transact();
        text.get_string(&txn)
    }

    fn type_text(doc: &YrsDoc, index: u32, chunk: &str) {
        let text = doc.doc().get_or_insert_text("content");
        let mut txn = doc.doc().transact_mut();
        text.insert(&mut txn, index, chunk);
    }

    async fn next_broadcast(
        handle: &mut crate::channel::ChannelHandle,
        event: &str,
    ) -> Envelope {
        loop {
            match tokio::time::timeout(Duration::from_secs(1), handle.recv())
                .await
                .expect("timed out waiting for broadcast")
                .expect("channel closed")
            {
                ChannelMessage::Broadcast(env) if env.event == event => return env,
                _ => continue,
            }
        }
    }

    #[test]
    fn test_doc_and_provider_are_send_sync() {
        // The doc and provider cross thread boundaries (pump tasks, Arc
        // sharing); only the update subscription guard is thread-local.
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<YrsDoc>();
        assert_send_sync::<DocSyncProvider<YrsDoc>>();
    }

    #[test]
    fn test_yrs_apply_is_idempotent() {
        let a = YrsDoc::new();
        type_text(&a, 0, "hello");
        let update = a.encode_state_as_update();

        let b = YrsDoc::new();
        b.apply_update(&update, UpdateOrigin::Remote).unwrap();
        b.apply_update(&update, UpdateOrigin::Remote).unwrap();

        assert_eq!(text_of(&b), "hello");
        assert_eq!(b.state_vector(), a.state_vector());
    }

    #[test]
    fn test_yrs_apply_is_commutative() {
        let a = YrsDoc::new();
        type_text(&a, 0, "aaa");
        let u1 = a.encode_state_as_update();

        let b = YrsDoc::new();
        type_text(&b, 0, "bbb");
        let u2 = b.encode_state_as_update();

        let forward = YrsDoc::new();
        forward.apply_update(&u1, UpdateOrigin::Remote).unwrap();
        forward.apply_update(&u2, UpdateOrigin::Remote).unwrap();

        let backward = YrsDoc::new();
        backward.apply_update(&u2, UpdateOrigin::Remote).unwrap();
        backward.apply_update(&u1, UpdateOrigin::Remote).unwrap();

        assert_eq!(text_of(&forward), text_of(&backward));
        assert_eq!(forward.state_vector(), backward.state_vector());
    }

    #[test]
    fn test_yrs_rejects_garbage() {
        let doc = YrsDoc::new();
        assert!(matches!(
            doc.apply_update(&[0xFF, 0xAB], UpdateOrigin::Remote),
            Err(SyncError::MalformedUpdate(_))
        ));
    }

    #[tokio::test]
    async fn test_local_edit_broadcasts_doc_update() {
        let hub = ChannelHub::new(64);
        let handle_a = hub.subscribe("room:doc", "user_a").unwrap();
        let mut handle_b = hub.subscribe("room:doc", "user_b").unwrap();

        let doc_a = Arc::new(YrsDoc::new());
        let (_provider, _updates) = DocSyncProvider::start(handle_a.publisher(), doc_a.clone()).unwrap();

        type_text(&doc_a, 0, "hi");

        let env = next_broadcast(&mut handle_b, EV_DOC_UPDATE).await;
        assert_eq!(env.origin, "user_a");

        let doc_b = YrsDoc::new();
        doc_b.apply_update(&env.payload, UpdateOrigin::Remote).unwrap();
        assert_eq!(text_of(&doc_b), "hi");
    }

    #[tokio::test]
    async fn test_remote_update_not_rebroadcast() {
        let hub = ChannelHub::new(64);
        let handle_a = hub.subscribe("room:doc", "user_a").unwrap();
        let mut handle_b = hub.subscribe("room:doc", "user_b").unwrap();

        let doc_a = Arc::new(YrsDoc::new());
        let (provider, _updates) = DocSyncProvider::start(handle_a.publisher(), doc_a.clone()).unwrap();

        // Craft a remote update and feed it through the provider.
        let other = YrsDoc::new();
        type_text(&other, 0, "remote text");
        let env = Envelope::binary(
            EV_DOC_UPDATE,
            uuid::Uuid::new_v4(),
            "user_c",
            other.encode_state_as_update(),
        );
        provider.handle_remote(&env).unwrap();
        assert_eq!(text_of(&doc_a), "remote text");

        // The applied remote update must not echo back onto the bus.
        let res = tokio::time::timeout(Duration::from_millis(100), async {
            next_broadcast(&mut handle_b, EV_DOC_UPDATE).await
        })
        .await;
        assert!(res.is_err(), "remote update was rebroadcast");
    }

    #[tokio::test]
    async fn test_handshake_syncs_late_joiner() {
        let hub = ChannelHub::new(64);
        let mut handle_a = hub.subscribe("room:doc", "user_a").unwrap();
        let doc_a = Arc::new(YrsDoc::new());
        let (provider_a, _updates_a) = DocSyncProvider::start(handle_a.publisher(), doc_a.clone()).unwrap();
        type_text(&doc_a, 0, "existing content");

        // B joins later and requests sync.
        let mut handle_b = hub.subscribe("room:doc", "user_b").unwrap();
        let doc_b = Arc::new(YrsDoc::new());
        let (provider_b, _updates_b) = DocSyncProvider::start(handle_b.publisher(), doc_b.clone()).unwrap();
        assert!(!provider_b.synced());

        // A answers the request with a diff.
        let request = next_broadcast(&mut handle_a, EV_SYNC_REQUEST).await;
        provider_a.handle_remote(&request).unwrap();

        // B applies the reply and converges.
        let reply = next_broadcast(&mut handle_b, EV_SYNC_REPLY).await;
        provider_b.handle_remote(&reply).unwrap();

        assert!(provider_b.synced());
        assert_eq!(text_of(&doc_b), "existing content");
    }

    #[tokio::test]
    async fn test_sole_peer_is_synced_immediately() {
        let hub = ChannelHub::new(64);
        let handle = hub.subscribe("room:doc", "user_a").unwrap();
        let (provider, _updates) =
            DocSyncProvider::start(handle.publisher(), Arc::new(YrsDoc::new())).unwrap();

        assert_eq!(provider.status(), SyncStatus::Connected);
        assert!(provider.synced());
    }

    #[tokio::test]
    async fn test_malformed_remote_update_dropped() {
        let hub = ChannelHub::new(64);
        let handle = hub.subscribe("room:doc", "user_a").unwrap();
        let doc = Arc::new(YrsDoc::new());
        let (provider, _updates) = DocSyncProvider::start(handle.publisher(), doc.clone()).unwrap();

        let env = Envelope::binary(EV_DOC_UPDATE, uuid::Uuid::new_v4(), "user_x", vec![0xFF]);
        // Dropped with a warning, not an error.
        provider.handle_remote(&env).unwrap();
        assert_eq!(text_of(&doc), "");
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let hub = ChannelHub::new(64);
        let handle = hub.subscribe("room:doc", "user_a").unwrap();
        let (mut provider, _updates) =
            DocSyncProvider::start(handle.publisher(), Arc::new(YrsDoc::new())).unwrap();

        assert_eq!(provider.status(), SyncStatus::Connected);
        provider.mark_error();
        assert_eq!(provider.status(), SyncStatus::Error);
        provider.shutdown();
        assert_eq!(provider.status(), SyncStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_local_edits_survive_shutdown() {
        let hub = ChannelHub::new(64);
        let handle = hub.subscribe("room:doc", "user_a").unwrap();
        let doc = Arc::new(YrsDoc::new());
        let (mut provider, _updates) = DocSyncProvider::start(handle.publisher(), doc.clone()).unwrap();

        provider.shutdown();
        // Local-first: the document stays writable after the provider stops.
        type_text(&doc, 0, "offline edit");
        assert_eq!(text_of(&doc), "offline edit");
    }
}
