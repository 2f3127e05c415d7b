//! Lifecycle, debounced local/remote handlers, async mutex, safety net,
//! relay pump.
//!
//! The debounce shape (`mpsc::Receiver<()>` signal channel, `tokio::time::
//! sleep` for the window, draining `try_recv()` in a loop to coalesce
//! bursts) is an `auto_save_task`-style pattern, reused verbatim for both
//! the local- and remote-change debounces.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{error, info, warn};
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::apply::{apply_item, match_identities};
use crate::backoff::delay_for_attempt;
use crate::backup;
use crate::config::{Options, SyncMode};
use crate::error::Result;
use crate::push::{push_all, PreviousPushState};
use crate::relay::{RelayClient, RelayFrame};
use crate::schema;
use crate::store::StoreAdapter;
use crate::vault::Vault;

/// `idle → connecting → connected → syncing → connected | error → idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Connecting,
    Connected,
    Syncing,
    Error,
}

/// The document, vault, adapter, and options shared by the push and apply
/// paths — composition over a single struct rather than mixin traits.
pub struct SyncEngineState {
    pub doc: Doc,
    pub adapter: Arc<dyn StoreAdapter>,
    pub options: Options,
    pub profile_dir: PathBuf,
}

/// Owns the lifecycle: connection, debounce tasks, safety-net timer,
/// mutual exclusion between `sync_once` and `apply_pending_remote`.
pub struct SyncEngine {
    state: Arc<SyncEngineState>,
    vault: Arc<AsyncMutex<Vault>>,
    previous_push: Arc<AsyncMutex<PreviousPushState>>,
    engine_state: Arc<SyncMutex<EngineState>>,
    cycle_mutex: Arc<AsyncMutex<()>>,
    paused: Arc<AtomicBool>,
    local_signal_tx: Option<mpsc::Sender<()>>,
    remote_signal_tx: Option<mpsc::Sender<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    relay: Option<RelayClient>,
}

impl SyncEngine {
    pub async fn new(
        options: Options,
        adapter: Arc<dyn StoreAdapter>,
        profile_dir: PathBuf,
    ) -> Result<Self> {
        let vault = Vault::load_from_file(&profile_dir, &options.room).await?;
        let doc = Doc::new();
        schema::ensure_room_schema(&doc);

        if options.clear_tombstones {
            info!(room = %options.room, "clear_tombstones set: starting from a fresh document");
        }

        let state = Arc::new(SyncEngineState {
            doc,
            adapter,
            options,
            profile_dir,
        });

        Ok(Self {
            state,
            vault: Arc::new(AsyncMutex::new(vault)),
            previous_push: Arc::new(AsyncMutex::new(PreviousPushState::new())),
            engine_state: Arc::new(SyncMutex::new(EngineState::Idle)),
            cycle_mutex: Arc::new(AsyncMutex::new(())),
            paused: Arc::new(AtomicBool::new(false)),
            local_signal_tx: None,
            remote_signal_tx: None,
            shutdown_tx: None,
            relay: None,
        })
    }

    pub fn state(&self) -> EngineState {
        *self.engine_state.lock()
    }

    /// Open the replicated document (already open), connect the relay
    /// with back-off, run the initial `sync_once`, and start the debounce
    /// tasks, observer, and safety-net timer.
    pub async fn start(&mut self) -> Result<()> {
        *self.engine_state.lock() = EngineState::Connecting;

        if !self.state.options.startup_delay.is_zero() {
            tokio::time::sleep(self.state.options.startup_delay).await;
        }

        if !self.state.options.server_url.is_empty() {
            let relay = RelayClient::connect(
                &self.state.options.server_url,
                self.state.options.room_token.as_deref(),
            )
            .await?;
            self.relay = Some(relay);
            self.spawn_relay_pump();
        }
        *self.engine_state.lock() = EngineState::Connected;

        self.sync_once().await;

        let (local_tx, local_rx) = mpsc::channel(64);
        let (remote_tx, remote_rx) = mpsc::channel(64);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);

        self.spawn_local_debounce(local_rx);
        self.spawn_remote_debounce(remote_rx);
        self.spawn_safety_net(shutdown_tx.clone());

        if self.state.options.sync_notes || self.state.options.sync_metadata {
            let remote_tx_clone = remote_tx.clone();
            let _sub = schema::observe_annotations_deep(&self.state.doc, move |_change| {
                let _ = remote_tx_clone.try_send(());
            });
            // The subscription handle is intentionally leaked for the
            // engine's lifetime; `stop()` tears down the whole doc/task set.
            std::mem::forget(_sub);
        }

        if let Some(adapter) = Some(self.state.adapter.clone()) {
            let local_tx_clone = local_tx.clone();
            let callback: crate::store::ChangeCallback = Arc::new(move || {
                let _ = local_tx_clone.try_send(());
            });
            let _unsubscribe = adapter.subscribe(callback);
            std::mem::forget(_unsubscribe);
        }

        self.local_signal_tx = Some(local_tx);
        self.remote_signal_tx = Some(remote_tx);
        self.shutdown_tx = Some(shutdown_tx);

        tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
        });

        Ok(())
    }

    /// Unsubscribe, destroy observers/timers/provider/document, persist the
    /// vault, and set the state to `idle`.
    pub async fn stop(&mut self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        self.local_signal_tx = None;
        self.remote_signal_tx = None;
        self.relay = None;

        let mut vault = self.vault.lock().await;
        vault.persist_to_file(&self.state.profile_dir).await?;
        *self.engine_state.lock() = EngineState::Idle;
        Ok(())
    }

    /// Gate local-change handling without tearing down connections.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn spawn_local_debounce(&self, mut rx: mpsc::Receiver<()>) {
        let debounce = self.state.options.local_debounce;
        let paused = self.paused.clone();
        let engine = self.clone_handles();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                if paused.load(Ordering::SeqCst) {
                    continue;
                }
                engine.sync_once().await;
            }
        });
    }

    fn spawn_remote_debounce(&self, mut rx: mpsc::Receiver<()>) {
        let debounce = self.state.options.remote_debounce;
        let engine = self.clone_handles();
        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                tokio::time::sleep(debounce).await;
                while rx.try_recv().is_ok() {}
                if engine.state.options.sync_mode == SyncMode::Push {
                    continue;
                }
                engine.apply_pending_remote().await;
            }
        });
    }

    /// Hand the connected relay to a background task: subscribe to every
    /// doc commit via `observe_update_v1` and forward it as a sync-protocol
    /// update frame, and loop on `relay.recv()` applying inbound state
    /// vectors/updates back into the doc. `applying_remote` stops the
    /// observer from echoing an update straight back out while it's being
    /// applied. If the connection drops, the supervising task reconnects
    /// with the same back-off as the initial connect and sets the engine
    /// state back to `connecting` for the duration.
    fn spawn_relay_pump(&mut self) {
        let Some(relay) = self.relay.take() else {
            return;
        };
        let state = self.state.clone();
        let engine_state = self.engine_state.clone();
        let applying_remote = Arc::new(AtomicBool::new(false));
        let (update_tx, update_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let guard = applying_remote.clone();
        let _sub = state
            .doc
            .observe_update_v1(move |_txn, event| {
                if guard.load(Ordering::SeqCst) {
                    return;
                }
                let _ = update_tx.send(event.update.clone());
            })
            .expect("failed to subscribe to doc updates");
        std::mem::forget(_sub);

        tokio::spawn(run_relay_supervisor(relay, state, engine_state, applying_remote, update_rx));
    }

    fn spawn_safety_net(&self, shutdown: mpsc::Sender<()>) {
        let interval = self.state.options.safety_net_interval;
        if interval.is_zero() {
            return;
        }
        let engine = self.clone_handles();
        tokio::spawn(async move {
            let mut errors: u32 = 0;
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if shutdown.is_closed() {
                    break;
                }
                let delay = delay_for_attempt(errors.min(4), interval * 16);
                if errors > 0 {
                    tokio::time::sleep(delay).await;
                }
                match engine.try_sync_once().await {
                    Ok(()) => errors = 0,
                    Err(e) => {
                        errors += 1;
                        warn!(error = %e, errors, "safety net sync failed");
                    }
                }
            }
        });
    }

    /// A lightweight handle bundle cheap to clone into spawned tasks.
    fn clone_handles(&self) -> EngineHandle {
        EngineHandle {
            state: self.state.clone(),
            vault: self.vault.clone(),
            previous_push: self.previous_push.clone(),
            engine_state: self.engine_state.clone(),
            cycle_mutex: self.cycle_mutex.clone(),
        }
    }

    async fn sync_once(&self) {
        self.clone_handles().sync_once().await;
    }

    async fn apply_pending_remote(&self) {
        self.clone_handles().apply_pending_remote().await;
    }

    /// Expose on-demand apply for `review` mode, where remote changes are
    /// only applied when the user explicitly asks.
    pub async fn apply_on_demand(&self) {
        self.apply_pending_remote().await;
    }

    /// Record that the user chose to ignore a remote deletion: the
    /// tombstone/retraction path for `key` is skipped on every future apply
    /// cycle until the vault is reset.
    pub async fn dismiss_remote_deletion(&self, key: &str) {
        let mut vault = self.vault.lock().await;
        vault.dismiss_key(key);
        if vault.is_dirty() {
            let _ = vault.persist_to_file(&self.state.profile_dir).await;
        }
    }
}

#[derive(Clone)]
struct EngineHandle {
    state: Arc<SyncEngineState>,
    vault: Arc<AsyncMutex<Vault>>,
    previous_push: Arc<AsyncMutex<PreviousPushState>>,
    engine_state: Arc<SyncMutex<EngineState>>,
    cycle_mutex: Arc<AsyncMutex<()>>,
}

impl EngineHandle {
    /// Read the full item graph, build an identity index, apply remote
    /// (if pending), push local, prune the vault. `sync_once` and
    /// `apply_pending_remote` share the [`cycle_mutex`] so they never
    /// observably overlap.
    async fn sync_once(&self) {
        if self.state.options.sync_mode == SyncMode::Pull {
            self.apply_pending_remote().await;
            return;
        }

        let _guard = self.cycle_mutex.lock().await;
        *self.engine_state.lock() = EngineState::Syncing;

        self.state.adapter.suppress_changes();
        let items = match self.state.adapter.get_all_items_full().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to read items for sync_once");
                self.state.adapter.resume_changes();
                *self.engine_state.lock() = EngineState::Connected;
                return;
            }
        };

        if self.state.options.sync_mode != SyncMode::Push {
            self.apply_remote_for_items(&items).await;
        }

        if self.state.options.sync_mode != SyncMode::Pull {
            let mut vault = self.vault.lock().await;
            let mut previous = self.previous_push.lock().await;
            push_all(&self.state, &mut vault, &mut previous, &items, &self.state.options.user_id).await;
            vault.prune_applied_keys();
            if vault.is_dirty() {
                let _ = vault.persist_to_file(&self.state.profile_dir).await;
            }
        }

        self.state.adapter.resume_changes();
        *self.engine_state.lock() = EngineState::Connected;
    }

    async fn try_sync_once(&self) -> Result<()> {
        self.sync_once().await;
        Ok(())
    }

    /// Backup, validate, match (exact + fuzzy), apply per-item.
    async fn apply_pending_remote(&self) {
        let _guard = self.cycle_mutex.lock().await;
        *self.engine_state.lock() = EngineState::Syncing;

        let items = match self.state.adapter.get_all_items_full().await {
            Ok(items) => items,
            Err(e) => {
                warn!(error = %e, "failed to read items for apply_pending_remote");
                *self.engine_state.lock() = EngineState::Connected;
                return;
            }
        };

        self.state.adapter.suppress_changes();
        self.apply_remote_for_items(&items).await;
        self.state.adapter.resume_changes();

        *self.engine_state.lock() = EngineState::Connected;
    }

    async fn apply_remote_for_items(&self, items: &[crate::store::Item]) {
        let crdt_identities: Vec<(String, Vec<String>)> = schema::all_identities(&self.state.doc)
            .into_iter()
            .map(|identity| {
                let checksums = schema::get_checksums(&self.state.doc, &crate::identity::Identity(identity.clone()));
                (identity, checksums)
            })
            .collect();

        let local_items: Vec<(crate::store::LocalId, Vec<String>)> = items
            .iter()
            .map(|i| (i.local_id, i.photos.iter().map(|p| p.checksum.clone()).collect()))
            .collect();

        let matches = match_identities(&crdt_identities, &local_items);

        let item_by_local: std::collections::HashMap<crate::store::LocalId, &crate::store::Item> =
            items.iter().map(|i| (i.local_id, i)).collect();

        let mut vault = self.vault.lock().await;

        let identity_by_local: std::collections::HashMap<crate::store::LocalId, String> = matches
            .iter()
            .map(|(identity_str, local_id, _kind)| (*local_id, identity_str.clone()))
            .collect();

        let backup_items: Vec<backup::SnapshotItem> = items
            .iter()
            .map(|i| backup::SnapshotItem {
                identity: identity_by_local.get(&i.local_id).cloned().unwrap_or_default(),
                local_id: i.local_id.0,
                metadata: i
                    .metadata
                    .iter()
                    .map(|(uri, field)| {
                        (
                            uri.clone(),
                            schema::MetadataRecord {
                                text: field.text.clone(),
                                value_type: field.value_type.clone(),
                                lang: field.lang.clone(),
                                author: self.state.options.user_id.clone(),
                                push_seq: 0,
                                deleted: false,
                            },
                        )
                    })
                    .collect(),
                tags: i
                    .tags
                    .iter()
                    .map(|tag| {
                        (
                            tag.to_lowercase(),
                            schema::TagRecordValue {
                                name: tag.clone(),
                                color: None,
                                author: self.state.options.user_id.clone(),
                                push_seq: 0,
                                deleted: false,
                            },
                        )
                    })
                    .collect(),
                photos: i.photos.iter().map(|p| p.checksum.clone()).collect(),
            })
            .collect();
        let backup_repr = serde_json::to_string(&backup_items).unwrap_or_default();
        if vault.should_backup(&backup_repr) {
            let timestamp = backup::iso_timestamp_now();
            let _ = backup::save_snapshot(
                &self.state.profile_dir,
                &self.state.options.room,
                &timestamp,
                &backup_items,
                crate::vault::VAULT_FILE_VERSION,
                self.state.options.max_backups,
            )
            .await;
        }

        for (identity_str, local_id, _kind) in matches {
            let identity = crate::identity::Identity(identity_str);
            let Some(local_item) = item_by_local.get(&local_id).copied() else {
                continue;
            };
            let conflicts = apply_item(
                &self.state,
                &mut vault,
                &identity,
                local_item,
                &self.state.options.user_id,
            )
            .await;
            for conflict in conflicts {
                warn!(
                    identity = %conflict.identity,
                    field = %conflict.field,
                    remote_author = %conflict.remote_author,
                    resolution = conflict.resolution,
                    "conflict resolved"
                );
            }
        }

        if vault.is_dirty() {
            let _ = vault.persist_to_file(&self.state.profile_dir).await;
        }
    }
}

/// Own the relay connection for the engine's lifetime: run the pump until
/// the socket drops, then reconnect (same back-off as the initial
/// connect) and resume. Gives up only when `RelayClient::connect` itself
/// gives up after its retry cap.
async fn run_relay_supervisor(
    mut relay: RelayClient,
    state: Arc<SyncEngineState>,
    engine_state: Arc<SyncMutex<EngineState>>,
    applying_remote: Arc<AtomicBool>,
    mut local_updates: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        run_relay_pump(&mut relay, &state, &applying_remote, &mut local_updates).await;

        *engine_state.lock() = EngineState::Connecting;
        match RelayClient::connect(&state.options.server_url, state.options.room_token.as_deref()).await {
            Ok(reconnected) => {
                relay = reconnected;
                *engine_state.lock() = EngineState::Connected;
            }
            Err(e) => {
                error!(error = %e, "relay reconnect exhausted its retries, pump stopped");
                break;
            }
        }
    }
}

/// Drive one relay connection: send the initial state vector, then
/// alternate between forwarding local commits out and applying inbound
/// frames in, until the socket closes or a send fails.
async fn run_relay_pump(
    relay: &mut RelayClient,
    state: &Arc<SyncEngineState>,
    applying_remote: &Arc<AtomicBool>,
    local_updates: &mut mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let initial_sv = state.doc.transact().state_vector().encode_v1();
    if let Err(e) = relay.send_state_vector(initial_sv).await {
        warn!(error = %e, "failed to send initial state vector to relay");
        return;
    }

    loop {
        tokio::select! {
            update = local_updates.recv() => {
                match update {
                    Some(bytes) => {
                        if let Err(e) = relay.send_update(bytes).await {
                            warn!(error = %e, "failed to forward local update to relay");
                            break;
                        }
                    }
                    None => break,
                }
            }
            frame = relay.recv() => {
                match frame {
                    Ok(Some(RelayFrame::StateVector(payload))) => {
                        match StateVector::decode_v1(&payload) {
                            Ok(sv) => {
                                let diff = state.doc.transact().encode_state_as_update_v1(&sv);
                                if let Err(e) = relay.send_update(diff).await {
                                    warn!(error = %e, "failed to send diff to relay");
                                    break;
                                }
                            }
                            Err(e) => warn!(error = %e, "relay sent an undecodable state vector"),
                        }
                    }
                    Ok(Some(RelayFrame::Update(payload))) => {
                        match Update::decode_v1(&payload) {
                            Ok(update) => {
                                applying_remote.store(true, Ordering::SeqCst);
                                if let Err(e) = state.doc.transact_mut().apply_update(update) {
                                    warn!(error = %e, "failed to apply relay update");
                                }
                                applying_remote.store(false, Ordering::SeqCst);
                            }
                            Err(e) => warn!(error = %e, "relay sent an undecodable update"),
                        }
                    }
                    Ok(Some(RelayFrame::Awareness(_))) => {}
                    Ok(None) => {
                        info!("relay connection closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "relay recv failed");
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine").field("state", &self.state()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ChangeCallback, CreateNote, CreateSelection, CreateTranscription, Item, ListSummary, LocalId,
        MetadataBatch, SubjectId, TagId, TagRecord, Unsubscribe, UpdateNote,
    };
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct NullAdapter {
        suppressed: AtomicU32,
    }

    #[async_trait]
    impl StoreAdapter for NullAdapter {
        async fn get_all_items_full(&self) -> Result<Vec<Item>> {
            Ok(Vec::new())
        }
        async fn get_all_tags(&self) -> Result<Vec<TagRecord>> {
            Ok(Vec::new())
        }
        async fn get_all_lists(&self) -> Result<Vec<ListSummary>> {
            Ok(Vec::new())
        }
        async fn save_metadata(&self, _subject: SubjectId, _fields: MetadataBatch) -> Result<()> {
            Ok(())
        }
        async fn create_tag(&self, name: &str, _color: Option<&str>) -> Result<TagRecord> {
            Ok(TagRecord { id: LocalId(1), name: name.to_string(), color: None })
        }
        async fn add_tags_to_item(&self, _item: LocalId, _tags: &[TagId]) -> Result<()> {
            Ok(())
        }
        async fn remove_tags_from_item(&self, _item: LocalId, _tags: &[TagId]) -> Result<()> {
            Ok(())
        }
        async fn create_selection(&self, _req: CreateSelection) -> Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_selection(&self, _id: LocalId) -> Result<()> {
            Ok(())
        }
        async fn create_note(&self, _req: CreateNote) -> Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn update_note(&self, _id: LocalId, _req: UpdateNote) -> Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_note(&self, _id: LocalId) -> Result<()> {
            Ok(())
        }
        async fn create_transcription(&self, _req: CreateTranscription) -> Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_transcription(&self, _id: LocalId) -> Result<()> {
            Ok(())
        }
        async fn add_items_to_list(&self, _list: LocalId, _items: &[LocalId]) -> Result<()> {
            Ok(())
        }
        async fn remove_items_from_list(&self, _list: LocalId, _items: &[LocalId]) -> Result<()> {
            Ok(())
        }
        fn subscribe(&self, _callback: ChangeCallback) -> Unsubscribe {
            Box::new(|| {})
        }
        fn suppress_changes(&self) {
            self.suppressed.fetch_add(1, Ordering::SeqCst);
        }
        fn resume_changes(&self) {
            self.suppressed.fetch_sub(1, Ordering::SeqCst);
        }
        fn validate_state_shape(&self) -> Vec<String> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn sync_once_and_apply_pending_remote_never_overlap() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(NullAdapter { suppressed: AtomicU32::new(0) });
        let mut options = Options::default();
        options.room = "test-room".into();
        options.safety_net_interval = std::time::Duration::ZERO;
        let engine = SyncEngine::new(options, adapter, dir.path().to_path_buf()).await.unwrap();
        let handle = engine.clone_handles();
        let handle2 = engine.clone_handles();

        let (a, b) = tokio::join!(
            async move { handle.sync_once().await },
            async move { handle2.apply_pending_remote().await },
        );
        let _ = (a, b);
        // If the cycle mutex were not held across both calls this would be
        // a data race on the doc/vault detectable under loom; here we only
        // assert both complete without panicking as a smoke check.
    }

    #[tokio::test]
    async fn new_engine_starts_idle() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = Arc::new(NullAdapter { suppressed: AtomicU32::new(0) });
        let mut options = Options::default();
        options.room = "idle-room".into();
        let engine = SyncEngine::new(options, adapter, dir.path().to_path_buf()).await.unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
