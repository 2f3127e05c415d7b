//! Durable sidecar: id mappings, applied-key sets, last-pushed hashes.
//!
//! LRU bookkeeping uses the `lru` crate rather than a hand-rolled ring
//! buffer. Persistence follows `persistence::save_project`'s tmp-then-
//! rename idiom, adapted with `tokio::fs` for the async write path.

use std::collections::HashMap;
use std::hash::Hasher;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

const PUSHED_HASHES_CAP: usize = 5_000;
const APPLIED_KEYS_CAP: usize = 50_000;
const MAPPING_CAP: usize = 50_000;
const MAX_NOTE_FAILURES: u32 = 3;
const PRUNE_EVICT_FRACTION: f64 = 0.2;

pub const VAULT_FILE_VERSION: u32 = 4;

fn fnv_hash(input: &str) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(input.as_bytes());
    hasher.finish()
}

fn hash16(input: &str) -> String {
    format!("{:016x}", fnv_hash(input))
}

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).expect("non-zero cap")
}

/// Bidirectional local-id ↔ CRDT-UUID mapping, bounded by an LRU on each
/// side so a cap on one direction also bounds the other.
struct Mapping {
    local_to_uuid: LruCache<String, String>,
    uuid_to_local: LruCache<String, String>,
}

impl Mapping {
    fn new() -> Self {
        Self {
            local_to_uuid: LruCache::new(cap(MAPPING_CAP)),
            uuid_to_local: LruCache::new(cap(MAPPING_CAP)),
        }
    }

    fn get_or_set(&mut self, local_id: &str, generate: impl FnOnce() -> String) -> String {
        if let Some(uuid) = self.local_to_uuid.get(local_id) {
            return uuid.clone();
        }
        let uuid = generate();
        self.local_to_uuid.put(local_id.to_string(), uuid.clone());
        self.uuid_to_local.put(uuid.clone(), local_id.to_string());
        uuid
    }

    fn map_applied(&mut self, uuid: &str, local_id: &str) {
        self.uuid_to_local.put(uuid.to_string(), local_id.to_string());
        self.local_to_uuid.put(local_id.to_string(), uuid.to_string());
    }

    fn local_for_uuid(&mut self, uuid: &str) -> Option<String> {
        self.uuid_to_local.get(uuid).cloned()
    }

    fn len(&self) -> usize {
        self.local_to_uuid.len()
    }

    fn to_pairs(&self) -> Vec<(String, String)> {
        self.local_to_uuid
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn from_pairs(pairs: Vec<(String, String)>) -> Self {
        let mut m = Self::new();
        for (local, uuid) in pairs {
            m.map_applied(&uuid, &local);
        }
        m
    }
}

/// The engine's persistent sidecar. One instance per room.
pub struct Vault {
    room: String,
    pushed_hashes: LruCache<String, String>,
    pushed_field_values: HashMap<String, String>,
    applied_note_keys: LruCache<String, ()>,
    applied_selection_keys: LruCache<String, ()>,
    applied_transcription_keys: LruCache<String, ()>,
    retracted_note_keys: LruCache<String, ()>,
    note_mapping: Mapping,
    selection_mapping: Mapping,
    transcription_mapping: Mapping,
    list_mapping: Mapping,
    failed_note_keys: HashMap<String, u32>,
    original_author: HashMap<String, String>,
    push_seq: u64,
    dismissed_keys: std::collections::HashSet<String>,
    last_crdt_hash: Option<String>,
    last_backup_hash: Option<String>,
    dirty: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct VaultFile {
    #[serde(default = "default_version")]
    version: u32,
    #[serde(default)]
    push_seq: u64,
    #[serde(default)]
    pushed_hashes: Vec<(String, String)>,
    #[serde(default)]
    applied_note_keys: Vec<String>,
    #[serde(default)]
    applied_selection_keys: Vec<String>,
    #[serde(default)]
    applied_transcription_keys: Vec<String>,
    #[serde(default)]
    retracted_note_keys: Vec<String>,
    #[serde(default)]
    note_mapping: Vec<(String, String)>,
    #[serde(default)]
    selection_mapping: Vec<(String, String)>,
    #[serde(default)]
    transcription_mapping: Vec<(String, String)>,
    #[serde(default)]
    list_mapping: Vec<(String, String)>,
    #[serde(default)]
    failed_note_keys: HashMap<String, u32>,
    #[serde(default)]
    original_author: HashMap<String, String>,
    #[serde(default)]
    dismissed_keys: Vec<String>,
    #[serde(default)]
    last_crdt_hash: Option<String>,
    #[serde(default)]
    last_backup_hash: Option<String>,
}

fn default_version() -> u32 {
    1
}

impl Vault {
    pub fn new(room: impl Into<String>) -> Self {
        Self {
            room: room.into(),
            pushed_hashes: LruCache::new(cap(PUSHED_HASHES_CAP)),
            pushed_field_values: HashMap::new(),
            applied_note_keys: LruCache::new(cap(APPLIED_KEYS_CAP)),
            applied_selection_keys: LruCache::new(cap(APPLIED_KEYS_CAP)),
            applied_transcription_keys: LruCache::new(cap(APPLIED_KEYS_CAP)),
            retracted_note_keys: LruCache::new(cap(APPLIED_KEYS_CAP)),
            note_mapping: Mapping::new(),
            selection_mapping: Mapping::new(),
            transcription_mapping: Mapping::new(),
            list_mapping: Mapping::new(),
            failed_note_keys: HashMap::new(),
            original_author: HashMap::new(),
            push_seq: 0,
            dismissed_keys: std::collections::HashSet::new(),
            last_crdt_hash: None,
            last_backup_hash: None,
            dirty: false,
        }
    }

    /// Issue and persist (mark dirty) the next monotonic push sequence.
    pub fn next_push_seq(&mut self) -> u64 {
        self.push_seq += 1;
        self.dirty = true;
        self.push_seq
    }

    /// Fast non-cryptographic hash of `item_repr`; `changed` is true iff it
    /// differs from the hash recorded for `identity` on the last push.
    pub fn has_item_changed(&self, identity: &str, item_repr: &str) -> (bool, String) {
        let hash = hash16(item_repr);
        let changed = self.pushed_hashes.peek(identity) != Some(&hash);
        (changed, hash)
    }

    pub fn mark_pushed(&mut self, identity: &str, hash: String) {
        self.pushed_hashes.put(identity.to_string(), hash);
        self.dirty = true;
    }

    /// Sole conflict signal: true if `field` was never pushed, or its
    /// current hash differs from what was last pushed.
    pub fn has_local_edit(&self, identity: &str, field: &str, current_value_hash: &str) -> bool {
        let key = format!("{identity}:{field}");
        match self.pushed_field_values.get(&key) {
            Some(last) => last != current_value_hash,
            None => true,
        }
    }

    pub fn mark_field_pushed(&mut self, identity: &str, field: &str, hash: String) {
        let key = format!("{identity}:{field}");
        self.pushed_field_values.insert(key, hash);
        self.dirty = true;
    }

    /// Get the CRDT UUID mapped to `local_id`, generating and recording one
    /// with `generate` on first push.
    pub fn get_note_key(&mut self, local_id: &str, generate: impl FnOnce() -> String) -> String {
        self.dirty = true;
        self.note_mapping.get_or_set(local_id, generate)
    }

    pub fn get_selection_key(&mut self, local_id: &str, generate: impl FnOnce() -> String) -> String {
        self.dirty = true;
        self.selection_mapping.get_or_set(local_id, generate)
    }

    pub fn get_transcription_key(&mut self, local_id: &str, generate: impl FnOnce() -> String) -> String {
        self.dirty = true;
        self.transcription_mapping.get_or_set(local_id, generate)
    }

    pub fn get_list_key(&mut self, local_id: &str, generate: impl FnOnce() -> String) -> String {
        self.dirty = true;
        self.list_mapping.get_or_set(local_id, generate)
    }

    pub fn map_applied_note(&mut self, uuid: &str, local_id: &str) {
        self.note_mapping.map_applied(uuid, local_id);
        self.dirty = true;
    }

    pub fn map_applied_selection(&mut self, uuid: &str, local_id: &str) {
        self.selection_mapping.map_applied(uuid, local_id);
        self.dirty = true;
    }

    pub fn map_applied_transcription(&mut self, uuid: &str, local_id: &str) {
        self.transcription_mapping.map_applied(uuid, local_id);
        self.dirty = true;
    }

    pub fn map_applied_list(&mut self, uuid: &str, local_id: &str) {
        self.list_mapping.map_applied(uuid, local_id);
        self.dirty = true;
    }

    pub fn local_note_for_uuid(&mut self, uuid: &str) -> Option<String> {
        self.note_mapping.local_for_uuid(uuid)
    }

    pub fn local_selection_for_uuid(&mut self, uuid: &str) -> Option<String> {
        self.selection_mapping.local_for_uuid(uuid)
    }

    /// True if the local HTML's hash differs from what was recorded when
    /// this synced note was last applied — the user edited it since.
    pub fn has_local_note_edit(&self, note_key: &str, local_html: &str) -> bool {
        let key = format!("applied-html:{note_key}");
        let hash = hash16(local_html);
        match self.pushed_field_values.get(&key) {
            Some(last) => *last != hash,
            None => false,
        }
    }

    pub fn mark_note_applied(&mut self, note_key: &str, html: &str) {
        self.applied_note_keys.put(note_key.to_string(), ());
        let key = format!("applied-html:{note_key}");
        self.pushed_field_values.insert(key, hash16(html));
        self.dirty = true;
    }

    pub fn is_note_applied(&mut self, note_key: &str) -> bool {
        self.applied_note_keys.contains(note_key)
    }

    pub fn mark_selection_applied(&mut self, key: &str) {
        self.applied_selection_keys.put(key.to_string(), ());
        self.dirty = true;
    }

    pub fn is_selection_applied(&mut self, key: &str) -> bool {
        self.applied_selection_keys.contains(key)
    }

    pub fn mark_transcription_applied(&mut self, key: &str) {
        self.applied_transcription_keys.put(key.to_string(), ());
        self.dirty = true;
    }

    pub fn is_transcription_applied(&mut self, key: &str) -> bool {
        self.applied_transcription_keys.contains(key)
    }

    /// Record that a note's tombstone has already been applied locally, so
    /// the retracted-strikethrough rewrite is only performed once.
    pub fn mark_note_retracted(&mut self, note_key: &str) {
        self.retracted_note_keys.put(note_key.to_string(), ());
        self.dirty = true;
    }

    pub fn is_note_retracted(&mut self, note_key: &str) -> bool {
        self.retracted_note_keys.contains(note_key)
    }

    /// Record a failed note push/apply; returns true once the key has
    /// reached the retry cap (three consecutive failures) and should be
    /// permanently abandoned.
    pub fn record_note_failure(&mut self, key: &str) -> bool {
        let count = self.failed_note_keys.entry(key.to_string()).or_insert(0);
        *count += 1;
        self.dirty = true;
        *count >= MAX_NOTE_FAILURES
    }

    pub fn clear_note_failure(&mut self, key: &str) {
        self.failed_note_keys.remove(key);
    }

    /// True once `key` has already hit the retry cap, without incrementing
    /// it — the guard a retry loop checks before attempting again.
    pub fn is_note_failure_exhausted(&self, key: &str) -> bool {
        self.failed_note_keys.get(key).copied().unwrap_or(0) >= MAX_NOTE_FAILURES
    }

    pub fn set_original_author(&mut self, key: &str, author: &str) {
        self.original_author.insert(key.to_string(), author.to_string());
        self.dirty = true;
    }

    /// Tombstone ownership check: a tombstone is accepted only if its author
    /// matches the recorded original author of the key (or none is recorded
    /// yet).
    pub fn tombstone_author_matches(&self, key: &str, author: &str) -> bool {
        match self.original_author.get(key) {
            Some(recorded) => recorded == author,
            None => true,
        }
    }

    pub fn dismiss_key(&mut self, key: &str) {
        self.dismissed_keys.insert(key.to_string());
        self.dirty = true;
    }

    pub fn is_dismissed(&self, key: &str) -> bool {
        self.dismissed_keys.contains(key)
    }

    /// True if `items_repr`'s hash differs from the hash recorded on the
    /// last backup; updates the recorded hash atomically with the check.
    pub fn should_backup(&mut self, items_repr: &str) -> bool {
        let hash = hash16(items_repr);
        let changed = self.last_backup_hash.as_deref() != Some(&hash);
        if changed {
            self.last_backup_hash = Some(hash);
            self.dirty = true;
        }
        changed
    }

    /// True if the CRDT's serialized representation differs from the hash
    /// recorded on the last check; updates the recorded hash atomically.
    pub fn has_crdt_changed(&mut self, crdt_repr: &[u8]) -> bool {
        let hash = format!("{:016x}", {
            let mut hasher = FnvHasher::default();
            hasher.write(crdt_repr);
            hasher.finish()
        });
        let changed = self.last_crdt_hash.as_deref() != Some(&hash);
        if changed {
            self.last_crdt_hash = Some(hash);
            self.dirty = true;
        }
        changed
    }

    /// If any applied-key set exceeds its cap, drop the oldest 20% (LRU
    /// tail), keeping every set at or under its configured bound.
    pub fn prune_applied_keys(&mut self) {
        prune_one(&mut self.applied_note_keys);
        prune_one(&mut self.applied_selection_keys);
        prune_one(&mut self.applied_transcription_keys);
        prune_one(&mut self.retracted_note_keys);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn to_file(&self) -> VaultFile {
        VaultFile {
            version: VAULT_FILE_VERSION,
            push_seq: self.push_seq,
            pushed_hashes: self
                .pushed_hashes
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            applied_note_keys: self.applied_note_keys.iter().map(|(k, _)| k.clone()).collect(),
            applied_selection_keys: self
                .applied_selection_keys
                .iter()
                .map(|(k, _)| k.clone())
                .collect(),
            applied_transcription_keys: self
                .applied_transcription_keys
                .iter()
                .map(|(k, _)| k.clone())
                .collect(),
            retracted_note_keys: self.retracted_note_keys.iter().map(|(k, _)| k.clone()).collect(),
            note_mapping: self.note_mapping.to_pairs(),
            selection_mapping: self.selection_mapping.to_pairs(),
            transcription_mapping: self.transcription_mapping.to_pairs(),
            list_mapping: self.list_mapping.to_pairs(),
            failed_note_keys: self.failed_note_keys.clone(),
            original_author: self.original_author.clone(),
            dismissed_keys: self.dismissed_keys.iter().cloned().collect(),
            last_crdt_hash: self.last_crdt_hash.clone(),
            last_backup_hash: self.last_backup_hash.clone(),
        }
    }

    fn from_file(room: String, file: VaultFile) -> Self {
        let mut pushed_hashes = LruCache::new(cap(PUSHED_HASHES_CAP));
        for (k, v) in file.pushed_hashes {
            pushed_hashes.put(k, v);
        }
        let mut applied_note_keys = LruCache::new(cap(APPLIED_KEYS_CAP));
        for k in file.applied_note_keys {
            applied_note_keys.put(k, ());
        }
        let mut applied_selection_keys = LruCache::new(cap(APPLIED_KEYS_CAP));
        for k in file.applied_selection_keys {
            applied_selection_keys.put(k, ());
        }
        let mut applied_transcription_keys = LruCache::new(cap(APPLIED_KEYS_CAP));
        for k in file.applied_transcription_keys {
            applied_transcription_keys.put(k, ());
        }
        let mut retracted_note_keys = LruCache::new(cap(APPLIED_KEYS_CAP));
        for k in file.retracted_note_keys {
            retracted_note_keys.put(k, ());
        }
        Self {
            room,
            pushed_hashes,
            pushed_field_values: HashMap::new(),
            applied_note_keys,
            applied_selection_keys,
            applied_transcription_keys,
            retracted_note_keys,
            note_mapping: Mapping::from_pairs(file.note_mapping),
            selection_mapping: Mapping::from_pairs(file.selection_mapping),
            transcription_mapping: Mapping::from_pairs(file.transcription_mapping),
            list_mapping: Mapping::from_pairs(file.list_mapping),
            failed_note_keys: file.failed_note_keys,
            original_author: file.original_author,
            push_seq: file.push_seq,
            dismissed_keys: file.dismissed_keys.into_iter().collect(),
            last_crdt_hash: file.last_crdt_hash,
            last_backup_hash: file.last_backup_hash,
            dirty: false,
        }
    }

    fn vault_path(profile_dir: &Path, room: &str) -> PathBuf {
        profile_dir.join("vault").join(format!("{room}.json"))
    }

    /// Write-and-rename the vault to `<profile>/vault/<room>.json`, then
    /// clear the dirty flag.
    pub async fn persist_to_file(&mut self, profile_dir: &Path) -> Result<()> {
        let path = Self::vault_path(profile_dir, &self.room);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(Error::VaultIo)?;
        }
        let file = self.to_file();
        let json = serde_json::to_vec_pretty(&file).map_err(Error::Serde)?;
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await.map_err(Error::VaultIo)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(Error::VaultIo)?;
        self.dirty = false;
        Ok(())
    }

    /// Load `<profile>/vault/<room>.json`, accepting file versions 1–4.
    /// Missing fields default via `#[serde(default)]`; a file beyond the
    /// supported version range is treated as corrupted (fatal-startup).
    pub async fn load_from_file(profile_dir: &Path, room: &str) -> Result<Self> {
        let path = Self::vault_path(profile_dir, room);
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: VaultFile = serde_json::from_slice(&bytes).map_err(Error::Serde)?;
                if file.version == 0 || file.version > VAULT_FILE_VERSION {
                    return Err(Error::VaultCorrupted(format!(
                        "unsupported vault file version {}",
                        file.version
                    )));
                }
                Ok(Self::from_file(room.to_string(), file))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new(room)),
            Err(e) => Err(Error::VaultIo(e)),
        }
    }
}

fn prune_one<K: std::hash::Hash + Eq + Clone>(cache: &mut LruCache<K, ()>) {
    let cap = cache.cap().get();
    if cache.len() <= cap {
        return;
    }
    let to_drop = ((cache.len() as f64) * PRUNE_EVICT_FRACTION).ceil() as usize;
    for _ in 0..to_drop {
        if cache.pop_lru().is_none() {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn has_item_changed_detects_diff_and_mark_clears_it() {
        let mut vault = Vault::new("room");
        let (changed, hash) = vault.has_item_changed("id1", "content-v1");
        assert!(changed);
        vault.mark_pushed("id1", hash);
        let (changed_again, _) = vault.has_item_changed("id1", "content-v1");
        assert!(!changed_again);
    }

    #[test]
    fn has_local_edit_true_until_pushed() {
        let mut vault = Vault::new("room");
        assert!(vault.has_local_edit("id1", "dc:title", "h1"));
        vault.mark_field_pushed("id1", "dc:title", "h1".into());
        assert!(!vault.has_local_edit("id1", "dc:title", "h1"));
        assert!(vault.has_local_edit("id1", "dc:title", "h2"));
    }

    #[test]
    fn note_key_mapping_is_stable_across_pushes() {
        let mut vault = Vault::new("room");
        let first = vault.get_note_key("local-7", || "n_generated".to_string());
        let second = vault.get_note_key("local-7", || "n_should_not_be_used".to_string());
        assert_eq!(first, second);
        assert_eq!(first, "n_generated");
    }

    #[test]
    fn tombstone_author_check() {
        let mut vault = Vault::new("room");
        vault.set_original_author("n_1", "alice");
        assert!(vault.tombstone_author_matches("n_1", "alice"));
        assert!(!vault.tombstone_author_matches("n_1", "mallory"));
        assert!(vault.tombstone_author_matches("unknown-key", "anyone"));
    }

    #[test]
    fn record_note_failure_caps_at_three() {
        let mut vault = Vault::new("room");
        assert!(!vault.is_note_failure_exhausted("n_1"));
        assert!(!vault.record_note_failure("n_1"));
        assert!(!vault.record_note_failure("n_1"));
        assert!(vault.record_note_failure("n_1"));
        assert!(vault.is_note_failure_exhausted("n_1"));
    }

    #[test]
    fn clear_note_failure_resets_the_counter() {
        let mut vault = Vault::new("room");
        vault.record_note_failure("n_1");
        vault.record_note_failure("n_1");
        vault.record_note_failure("n_1");
        assert!(vault.is_note_failure_exhausted("n_1"));
        vault.clear_note_failure("n_1");
        assert!(!vault.is_note_failure_exhausted("n_1"));
    }

    #[test]
    fn prune_applied_keys_stays_within_cap() {
        let mut vault = Vault::new("room");
        for i in 0..(APPLIED_KEYS_CAP + 1000) {
            vault.mark_note_applied(&format!("n_{i}"), "<p>x</p>");
        }
        vault.prune_applied_keys();
        assert!(vault.applied_note_keys.len() <= APPLIED_KEYS_CAP);
    }

    #[tokio::test]
    async fn persist_and_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut vault = Vault::new("myroom");
        vault.next_push_seq();
        vault.next_push_seq();
        let key = vault.get_note_key("local-1", || "n_abc".to_string());
        vault.persist_to_file(dir.path()).await.unwrap();

        let reloaded = Vault::load_from_file(dir.path(), "myroom").await.unwrap();
        assert_eq!(reloaded.push_seq, 2);
        let mut reloaded = reloaded;
        assert_eq!(reloaded.get_note_key("local-1", || unreachable!()), key);
    }

    #[test]
    fn local_selection_for_uuid_round_trips_through_map_applied() {
        let mut vault = Vault::new("room");
        vault.map_applied_selection("sel_abc", "9");
        assert_eq!(vault.local_selection_for_uuid("sel_abc"), Some("9".to_string()));
        assert_eq!(vault.local_selection_for_uuid("sel_missing"), None);
    }

    #[test]
    fn note_retraction_is_recorded_once() {
        let mut vault = Vault::new("room");
        assert!(!vault.is_note_retracted("n_1"));
        vault.mark_note_retracted("n_1");
        assert!(vault.is_note_retracted("n_1"));
    }

    #[tokio::test]
    async fn load_missing_file_returns_fresh_vault() {
        let dir = tempfile::tempdir().unwrap();
        let vault = Vault::load_from_file(dir.path(), "new-room").await.unwrap();
        assert_eq!(vault.push_seq, 0);
    }
}
