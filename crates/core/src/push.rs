//! Local → CRDT: field-level diffing, logic-based conflict check,
//! stale-entry cleanup, deletion detection.
//!
//! A free-function module operating on `&SyncEngineState` (+ `&mut
//! Vault`), mirroring `apply.rs` — see its module doc for why this is two
//! modules rather than two trait impls.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::apply::parse_footer;
use crate::engine::SyncEngineState;
use crate::identity::Identity;
use crate::schema::{
    self, ListRecord, MetadataRecord, NoteRecord, SelectionRecord, TagRecordValue, TranscriptionRecord,
};
use crate::store::Item;
use crate::vault::Vault;

const MAX_PUSH_FAILURES: u32 = 3;

/// Per-item, per-section key sets observed on the previous successful
/// push — used by deletion detection to tell "never existed" apart from
/// "existed last cycle, gone now". Not persisted across restarts: on
/// restart the first cycle treats every key as new, which is safe (no
/// spurious tombstones, only a no-op resend of already-converged keys).
#[derive(Default)]
pub struct PreviousPushState {
    keys: HashMap<String, HashMap<&'static str, HashSet<String>>>,
    failure_counts: HashMap<String, u32>,
}

impl PreviousPushState {
    pub fn new() -> Self {
        Self::default()
    }

    fn previous(&self, identity: &str, section: &'static str) -> HashSet<String> {
        self.keys
            .get(identity)
            .and_then(|m| m.get(section))
            .cloned()
            .unwrap_or_default()
    }

    fn record(&mut self, identity: &str, section: &'static str, keys: HashSet<String>) {
        self.keys.entry(identity.to_string()).or_default().insert(section, keys);
    }
}

/// Push every item, de-duplicated by identity (two local items can share
/// photo checksums and must collapse into one push).
pub async fn push_all(
    state: &SyncEngineState,
    vault: &mut Vault,
    previous: &mut PreviousPushState,
    items: &[Item],
    local_user: &str,
) {
    let list_names: HashMap<i64, String> = state
        .adapter
        .get_all_lists()
        .await
        .unwrap_or_default()
        .into_iter()
        .map(|l| (l.id.0, l.name))
        .collect();

    let mut by_identity: HashMap<String, Vec<&Item>> = HashMap::new();
    let mut order: Vec<String> = Vec::new();
    for item in items {
        let checksums: Vec<String> = item.photos.iter().map(|p| p.checksum.clone()).collect();
        let Some(identity) = crate::identity::compute_identity(&checksums, "", "", "") else {
            continue;
        };
        if !by_identity.contains_key(&identity.0) {
            order.push(identity.0.clone());
        }
        by_identity.entry(identity.0).or_default().push(item);
    }

    for identity_str in order {
        let grouped = &by_identity[&identity_str];
        let identity = Identity(identity_str.clone());
        match push_item(state, vault, previous, &identity, grouped, local_user, &list_names).await {
            Ok(()) => previous.failure_counts.remove(&identity_str),
            Err(()) => {
                let count = previous.failure_counts.entry(identity_str.clone()).or_insert(0);
                *count += 1;
                if *count >= MAX_PUSH_FAILURES {
                    warn!(identity = %identity_str, "push failed {count} times, marking pushed anyway");
                    previous.failure_counts.remove(&identity_str);
                } else {
                    warn!(identity = %identity_str, attempt = *count, "push failed, will retry next cycle");
                }
            }
        }
    }
}

async fn push_item(
    state: &SyncEngineState,
    vault: &mut Vault,
    previous: &mut PreviousPushState,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
    list_names: &HashMap<i64, String>,
) -> Result<(), ()> {
    let checksums: Vec<String> = items.iter().flat_map(|i| i.photos.iter().map(|p| p.checksum.clone())).collect();
    schema::set_checksums(&state.doc, identity, &checksums);

    if state.options.sync_metadata {
        push_metadata(state, vault, identity, items, local_user);
    }
    if state.options.sync_tags {
        push_tags(state, vault, identity, items, local_user);
    }
    if state.options.sync_notes {
        push_notes(state, vault, previous, identity, items, local_user);
    }
    if state.options.sync_selections {
        push_selections(state, vault, identity, items, local_user);
        if state.options.sync_notes {
            push_selection_notes(state, vault, identity, items, local_user);
        }
        if state.options.sync_photo_adjustments {
            push_selection_meta(state, vault, identity, items, local_user);
        }
    }
    if state.options.sync_transcriptions {
        push_transcriptions(state, vault, identity, items, local_user);
    }
    if state.options.sync_lists {
        push_lists(state, vault, identity, items, local_user, list_names);
    }
    if state.options.sync_photo_adjustments {
        push_photo_metadata(state, vault, identity, items, local_user);
    }

    Ok(())
}

pub(crate) fn hash_field(text: &str) -> String {
    use std::hash::Hasher;
    let mut hasher = fnv::FnvHasher::default();
    hasher.write(text.as_bytes());
    format!("{:016x}", hasher.finish())
}

/// The generic per-section push rule from §4.7: skip if equal to the
/// remote value; if remote is authored by someone else, only push when
/// `has_local_edit` says the engine changed this field since its last
/// push (otherwise remote wins). Never resurrect another author's
/// tombstone.
///
/// `scope` is the `has_local_edit` namespace key — the item identity for
/// item-level metadata, or an identity-plus-photo/selection scope for the
/// nested sections (`push_photo_metadata`/`push_selection_meta`).
fn should_push_field(
    vault: &Vault,
    scope: &str,
    field: &str,
    local_value: &str,
    remote: Option<(&str, bool)>,
) -> bool {
    match remote {
        None => true,
        Some((_, true)) => false, // a tombstone: leave foreign deletions alone
        Some((remote_author, false)) => {
            if remote_author == "" {
                return true;
            }
            let local_hash = hash_field(local_value);
            vault.has_local_edit(scope, field, &local_hash)
        }
    }
}

/// `has_local_edit` scope for a photo's own metadata properties, distinct
/// from the item-level scope so a photo and its owning item never collide
/// on the same field name.
fn photo_scope(identity: &Identity, checksum: &str) -> String {
    format!("{}:photo:{checksum}", identity.as_ref())
}

/// `has_local_edit` scope for a selection's own metadata properties.
fn selection_scope(identity: &Identity, sel_uuid: &str) -> String {
    format!("{}:selection:{sel_uuid}", identity.as_ref())
}

fn push_metadata(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    let mut seen_properties = HashSet::new();
    for item in items {
        for (property, field) in &item.metadata {
            if !seen_properties.insert(property.clone()) {
                continue;
            }
            let remote: Option<MetadataRecord> =
                schema::get_record(&state.doc, identity, "metadata", property).unwrap_or(None);
            let remote_ref = remote.as_ref().map(|r| (r.author.as_str(), r.deleted));
            if let Some(r) = &remote {
                if r.text == field.text && !r.deleted {
                    continue;
                }
            }
            if !should_push_field(vault, identity.as_ref(), property, &field.text, remote_ref) {
                continue;
            }
            let push_seq = vault.next_push_seq();
            let record = MetadataRecord {
                text: field.text.clone(),
                value_type: field.value_type.clone(),
                lang: field.lang.clone(),
                author: local_user.to_string(),
                push_seq,
                deleted: false,
            };
            if schema::set_record(&state.doc, identity, "metadata", property, &record).is_ok() {
                vault.mark_field_pushed(identity.as_ref(), property, hash_field(&field.text));
            }
        }
    }
}

/// Push each photo's own metadata properties into the `photos` section,
/// keyed `<checksum>:<property>` (flat, like `selectionNotes`'s composite
/// keys) rather than a nested per-checksum map — the same generic
/// `schema::get_record`/`set_record` used for item metadata apply here
/// unchanged, just under a composite key.
fn push_photo_metadata(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    let mut seen = HashSet::new();
    for item in items {
        for photo in &item.photos {
            for (property, field) in &photo.metadata {
                let key = format!("{}:{property}", photo.checksum);
                if !seen.insert(key.clone()) {
                    continue;
                }
                let scope = photo_scope(identity, &photo.checksum);
                let remote: Option<MetadataRecord> =
                    schema::get_record(&state.doc, identity, "photos", &key).unwrap_or(None);
                let remote_ref = remote.as_ref().map(|r| (r.author.as_str(), r.deleted));
                if let Some(r) = &remote {
                    if r.text == field.text && !r.deleted {
                        continue;
                    }
                }
                if !should_push_field(vault, &scope, property, &field.text, remote_ref) {
                    continue;
                }
                let push_seq = vault.next_push_seq();
                let record = MetadataRecord {
                    text: field.text.clone(),
                    value_type: field.value_type.clone(),
                    lang: field.lang.clone(),
                    author: local_user.to_string(),
                    push_seq,
                    deleted: false,
                };
                if schema::set_record(&state.doc, identity, "photos", &key, &record).is_ok() {
                    vault.mark_field_pushed(&scope, property, hash_field(&field.text));
                }
            }
        }
    }
}

/// Push each selection's own metadata properties into `selectionMeta`,
/// keyed `<selUUID>:<property>` — same composite-key convention as
/// `push_photo_metadata` and `push_selection_notes`.
fn push_selection_meta(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    for item in items {
        for photo in &item.photos {
            for selection in &photo.selections {
                let sel_local_id_str = selection.local_id.0.to_string();
                let sel_uuid = vault.get_selection_key(&sel_local_id_str, crate::identity::generate_selection_uuid);
                let scope = selection_scope(identity, &sel_uuid);

                for (property, field) in &selection.metadata {
                    let key = format!("{sel_uuid}:{property}");
                    let remote: Option<MetadataRecord> =
                        schema::get_record(&state.doc, identity, "selectionMeta", &key).unwrap_or(None);
                    let remote_ref = remote.as_ref().map(|r| (r.author.as_str(), r.deleted));
                    if let Some(r) = &remote {
                        if r.text == field.text && !r.deleted {
                            continue;
                        }
                    }
                    if !should_push_field(vault, &scope, property, &field.text, remote_ref) {
                        continue;
                    }
                    let push_seq = vault.next_push_seq();
                    let record = MetadataRecord {
                        text: field.text.clone(),
                        value_type: field.value_type.clone(),
                        lang: field.lang.clone(),
                        author: local_user.to_string(),
                        push_seq,
                        deleted: false,
                    };
                    if schema::set_record(&state.doc, identity, "selectionMeta", &key, &record).is_ok() {
                        vault.mark_field_pushed(&scope, property, hash_field(&field.text));
                    }
                }
            }
        }
    }
}

fn push_tags(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    let mut seen = HashSet::new();
    for item in items {
        for tag in &item.tags {
            let key = tag.to_lowercase();
            if !seen.insert(key.clone()) {
                continue;
            }
            let remote: Option<TagRecordValue> =
                schema::get_record(&state.doc, identity, "tags", &key).unwrap_or(None);
            if let Some(r) = &remote {
                if r.name == *tag && !r.deleted {
                    continue;
                }
                if r.deleted && r.author != local_user {
                    continue;
                }
            }
            let push_seq = vault.next_push_seq();
            let record = TagRecordValue {
                name: tag.clone(),
                color: None,
                author: local_user.to_string(),
                push_seq,
                deleted: false,
            };
            let _ = schema::set_record(&state.doc, identity, "tags", &key, &record);
        }
    }

    if state.options.sync_deletions {
        let active_remote: Vec<(String, TagRecordValue)> =
            schema::get_active_section(&state.doc, identity, "tags").unwrap_or_default();
        for (key, record) in active_remote {
            if record.author != local_user {
                continue;
            }
            let still_present = items.iter().any(|i| i.tags.iter().any(|t| t.to_lowercase() == key));
            if !still_present {
                let push_seq = vault.next_push_seq();
                let _ = schema::remove_record::<TagRecordValue>(&state.doc, identity, "tags", &key, local_user, push_seq);
            }
        }
    }
}

/// Note push: CRDT key is the UUID stored in the vault (generated on first
/// push). Notes carrying the synced-note footer are recognised as already
/// CRDT-applied and skipped — the user's own applied notes must not be
/// re-pushed. Stale cleanup physically deletes entries the current user
/// authored that vanished locally this cycle without ever having been in
/// the prior observed snapshot; entries that *were* in the prior snapshot
/// are left for deletion detection below to tombstone.
fn push_notes(
    state: &SyncEngineState,
    vault: &mut Vault,
    previous: &mut PreviousPushState,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    let mut pushed_keys = HashSet::new();

    for item in items {
        for note in &item.notes {
            if parse_footer(&note.html).is_some() {
                // This is a note the engine itself rendered from a CRDT
                // record on apply; pushing it back would be a self-loop.
                continue;
            }

            let local_id_str = note.local_id.0.to_string();
            let uuid = vault.get_note_key(&local_id_str, crate::identity::generate_note_uuid);
            pushed_keys.insert(uuid.clone());

            let remote: Option<NoteRecord> = schema::get_record(&state.doc, identity, "notes", &uuid).unwrap_or(None);
            if let Some(r) = &remote {
                if r.html == note.html && !r.deleted {
                    continue;
                }
                if r.deleted && r.author != local_user {
                    continue;
                }
            }

            let push_seq = vault.next_push_seq();
            let record = NoteRecord {
                text: strip_tags_best_effort(&note.html),
                html: note.html.clone(),
                lang: note.language.clone(),
                photo: None,
                author: local_user.to_string(),
                push_seq,
                deleted: false,
            };
            let _ = schema::set_record(&state.doc, identity, "notes", &uuid, &record);
        }
    }

    let prior = previous.previous(identity.as_ref(), "notes");
    let all_remote: Vec<(String, NoteRecord)> = schema::get_section(&state.doc, identity, "notes").unwrap_or_default();
    for (key, record) in &all_remote {
        if record.author != local_user || record.deleted || pushed_keys.contains(key) {
            continue;
        }
        if !prior.contains(key) {
            // Never observed in a previous cycle: stale cleanup, physical delete.
            schema::delete_entry(&state.doc, identity, "notes", key);
        }
        // else: left for deletion-detection to tombstone below.
    }

    if state.options.sync_deletions {
        for key in prior.difference(&pushed_keys) {
            if let Some(record) = all_remote.iter().find(|(k, _)| k == key).map(|(_, r)| r.clone()) {
                if record.author == local_user && !record.deleted {
                    let push_seq = vault.next_push_seq();
                    let _ = schema::remove_record::<NoteRecord>(&state.doc, identity, "notes", key, local_user, push_seq);
                }
            }
        }
    }

    previous.record(identity.as_ref(), "notes", pushed_keys);
}

fn strip_tags_best_effort(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut in_tag = false;
    for c in html.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => out.push(c),
            _ => {}
        }
    }
    out
}

fn push_selections(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    for item in items {
        for photo in &item.photos {
            for selection in &photo.selections {
                let local_id_str = selection.local_id.0.to_string();
                let uuid = vault.get_selection_key(&local_id_str, crate::identity::generate_selection_uuid);
                let remote: Option<SelectionRecord> =
                    schema::get_record(&state.doc, identity, "selections", &uuid).unwrap_or(None);
                if let Some(r) = &remote {
                    let unchanged = r.x == selection.x && r.y == selection.y && r.w == selection.w && r.h == selection.h;
                    if unchanged && !r.deleted {
                        continue;
                    }
                    if r.deleted && r.author != local_user {
                        continue;
                    }
                }
                let push_seq = vault.next_push_seq();
                let record = SelectionRecord {
                    x: selection.x,
                    y: selection.y,
                    w: selection.w,
                    h: selection.h,
                    angle: selection.angle,
                    photo: photo.checksum.clone(),
                    author: local_user.to_string(),
                    push_seq,
                    deleted: false,
                };
                let _ = schema::set_record(&state.doc, identity, "selections", &uuid, &record);
            }
        }
    }
}

/// Push notes attached to a selection, keyed `selUUID:noteUUID` per the
/// `selectionNotes` section layout — same footer-skip and diff rule as
/// `push_notes`, just nested one level under the owning selection.
fn push_selection_notes(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    for item in items {
        for photo in &item.photos {
            for selection in &photo.selections {
                let sel_local_id_str = selection.local_id.0.to_string();
                let sel_uuid = vault.get_selection_key(&sel_local_id_str, crate::identity::generate_selection_uuid);

                for note in &selection.notes {
                    if parse_footer(&note.html).is_some() {
                        continue;
                    }
                    let note_local_id_str = note.local_id.0.to_string();
                    let note_uuid = vault.get_note_key(&note_local_id_str, crate::identity::generate_note_uuid);
                    let key = format!("{sel_uuid}:{note_uuid}");

                    let remote: Option<NoteRecord> =
                        schema::get_record(&state.doc, identity, "selectionNotes", &key).unwrap_or(None);
                    if let Some(r) = &remote {
                        if r.html == note.html && !r.deleted {
                            continue;
                        }
                        if r.deleted && r.author != local_user {
                            continue;
                        }
                    }

                    let push_seq = vault.next_push_seq();
                    let record = NoteRecord {
                        text: strip_tags_best_effort(&note.html),
                        html: note.html.clone(),
                        lang: note.language.clone(),
                        photo: None,
                        author: local_user.to_string(),
                        push_seq,
                        deleted: false,
                    };
                    let _ = schema::set_record(&state.doc, identity, "selectionNotes", &key, &record);
                }
            }
        }
    }
}

fn push_transcriptions(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
) {
    for item in items {
        for transcription in &item.transcriptions {
            let local_id_str = transcription.local_id.0.to_string();
            let uuid = vault.get_transcription_key(&local_id_str, crate::identity::generate_transcription_uuid);
            let remote: Option<TranscriptionRecord> =
                schema::get_record(&state.doc, identity, "transcriptions", &uuid).unwrap_or(None);
            if let Some(r) = &remote {
                if r.text == transcription.text && !r.deleted {
                    continue;
                }
                if r.deleted && r.author != local_user {
                    continue;
                }
            }
            let push_seq = vault.next_push_seq();
            let record = TranscriptionRecord {
                text: transcription.text.clone(),
                data: transcription.data.clone(),
                photo: String::new(),
                selection: None,
                author: local_user.to_string(),
                push_seq,
                deleted: false,
            };
            let _ = schema::set_record(&state.doc, identity, "transcriptions", &uuid, &record);
        }
    }
}

fn push_lists(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    items: &[&Item],
    local_user: &str,
    list_names: &HashMap<i64, String>,
) {
    for item in items {
        for list_local_id in &item.lists {
            let name = match list_names.get(&list_local_id.0) {
                Some(name) => name.clone(),
                None => continue,
            };
            let local_id_str = list_local_id.0.to_string();
            let uuid = vault.get_list_key(&local_id_str, crate::identity::generate_list_uuid);
            let remote: Option<ListRecord> = schema::get_record(&state.doc, identity, "lists", &uuid).unwrap_or(None);
            if let Some(r) = &remote {
                if r.name == name && r.member && !r.deleted {
                    continue;
                }
            }
            let push_seq = vault.next_push_seq();
            let record = ListRecord {
                name,
                member: true,
                author: local_user.to_string(),
                push_seq,
                deleted: false,
            };
            let _ = schema::set_record(&state.doc, identity, "lists", &uuid, &record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_push_field_true_when_no_remote() {
        let vault = Vault::new("room");
        let id = Identity("abc".into());
        assert!(should_push_field(&vault, id.as_ref(), "dc:title", "X", None));
    }

    #[test]
    fn should_push_field_false_for_foreign_tombstone() {
        let vault = Vault::new("room");
        let id = Identity("abc".into());
        assert!(!should_push_field(&vault, id.as_ref(), "dc:title", "X", Some(("alice", true))));
    }

    #[test]
    fn should_push_field_respects_has_local_edit() {
        let mut vault = Vault::new("room");
        let id = Identity("abc".into());
        vault.mark_field_pushed(id.as_ref(), "dc:title", hash_field("X"));
        // Same value as last pushed: no local edit since, remote wins.
        assert!(!should_push_field(&vault, id.as_ref(), "dc:title", "X", Some(("alice", false))));
        // Local value changed since last push: local wins, push it.
        assert!(should_push_field(&vault, id.as_ref(), "dc:title", "Y", Some(("alice", false))));
    }

    #[test]
    fn previous_push_state_tracks_per_section_keys() {
        let mut previous = PreviousPushState::new();
        let mut keys = HashSet::new();
        keys.insert("n_1".to_string());
        previous.record("abc", "notes", keys.clone());
        assert_eq!(previous.previous("abc", "notes"), keys);
        assert!(previous.previous("abc", "selections").is_empty());
    }
}
