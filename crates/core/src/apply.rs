//! CRDT → local: matching, per-section apply, synced-note footer,
//! attribution.
//!
//! A free-function module operating on `&SyncEngineState` (+ `&mut Vault`)
//! rather than a trait impl — composition over mixins, matching the
//! surrounding free-function style for CRDT-adjacent logic
//! (`write_node_field`, `read_node_snapshot`, …).

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};

use crate::engine::SyncEngineState;
use crate::identity::Identity;
use crate::sanitizer;
use crate::schema::{self, ListRecord, MetadataRecord, NoteRecord, SelectionRecord, TranscriptionRecord};
use crate::store::{
    CreateNote, CreateSelection, CreateTranscription, Item, LocalId, MetadataBatch, MetadataField,
    NoteItem, SubjectId, TagId, UpdateNote,
};
use crate::vault::Vault;

const FOOTER_PREFIX: &str = "[troparcel:";

/// A conflict resolution outcome, logged (never silently dropped) per
/// spec's error-handling policy for the "Conflict" error kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictLogEntry {
    pub identity: String,
    pub field: String,
    pub local: String,
    pub remote: String,
    pub remote_author: String,
    pub resolution: &'static str,
}

/// The single source of truth for matching a CRDT note to a local note:
/// `<p><sub>[troparcel:<uuid> from <author> — safe to delete, do not
/// edit]</sub></p>`.
pub fn render_footer(uuid: &str, author: &str) -> String {
    format!("<p><sub>{FOOTER_PREFIX}{uuid} from {author} — safe to delete, do not edit]</sub></p>")
}

/// Replacement footer for a tombstoned note, plus the line-through wrapper
/// applied to every block-level element of the body.
pub fn render_retracted(body_html: &str, uuid: &str, author: &str) -> String {
    let wrapped = wrap_blocks_strikethrough(body_html);
    format!(
        "{wrapped}<p><sub>{FOOTER_PREFIX}{uuid} retracted by {author} — safe to delete, do not edit]</sub></p>"
    )
}

fn wrap_blocks_strikethrough(body_html: &str) -> String {
    // Each top-level block becomes its own <span style="text-decoration: line-through">…</span>,
    // sufficient since the sanitiser only allows block tags at the top level of note HTML.
    format!(r#"<span style="text-decoration: line-through">{body_html}</span>"#)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterInfo {
    pub uuid: String,
    pub author: String,
    pub retracted: bool,
}

/// Parse the synced-note footer out of `html`, if present.
pub fn parse_footer(html: &str) -> Option<FooterInfo> {
    let start = html.rfind(FOOTER_PREFIX)?;
    let rest = &html[start + FOOTER_PREFIX.len()..];
    let end = rest.find(']')?;
    let body = &rest[..end];

    if let Some(idx) = body.find(" retracted by ") {
        let uuid = body[..idx].to_string();
        let author = body[idx + " retracted by ".len()..]
            .split(" — safe to delete")
            .next()?
            .trim()
            .to_string();
        return Some(FooterInfo { uuid, author, retracted: true });
    }

    let idx = body.find(" from ")?;
    let uuid = body[..idx].to_string();
    let author = body[idx + " from ".len()..]
        .split(" — safe to delete")
        .next()?
        .trim()
        .to_string();
    Some(FooterInfo { uuid, author, retracted: false })
}

/// A local item matched against a CRDT identity, exactly or by fuzzy
/// superset-of-checksums match.
#[derive(Debug, Clone, Copy)]
pub enum MatchKind {
    Exact,
    Fuzzy,
}

/// Build the exact + fuzzy match index: for every CRDT identity, find the
/// local item it corresponds to. A local item already exactly matched is
/// not additionally claimed by a fuzzy match.
pub fn match_identities(
    crdt_identities: &[(String, Vec<String>)],
    local_items: &[(LocalId, Vec<String>)],
) -> Vec<(String, LocalId, MatchKind)> {
    let mut claimed: HashSet<LocalId> = HashSet::new();
    let mut matches = Vec::new();

    for (identity, _) in crdt_identities {
        for (local_id, checksums) in local_items {
            if claimed.contains(local_id) {
                continue;
            }
            let computed = crate::identity::compute_identity(checksums, "", "", "");
            if computed.as_ref().map(|c| &c.0) == Some(identity) {
                matches.push((identity.clone(), *local_id, MatchKind::Exact));
                claimed.insert(*local_id);
                break;
            }
        }
    }

    for (identity, crdt_checksums) in crdt_identities {
        if matches.iter().any(|(id, _, _)| id == identity) {
            continue;
        }
        for (local_id, local_checksums) in local_items {
            if claimed.contains(local_id) {
                continue;
            }
            let local_set: HashSet<&String> = local_checksums.iter().collect();
            if !crdt_checksums.is_empty() && crdt_checksums.iter().all(|c| local_set.contains(c)) {
                matches.push((identity.clone(), *local_id, MatchKind::Fuzzy));
                claimed.insert(*local_id);
                break;
            }
        }
    }

    matches
}

/// Apply one CRDT identity's sections onto its matched local item.
pub async fn apply_item(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    local_item: &Item,
    local_user: &str,
) -> Vec<ConflictLogEntry> {
    let mut conflicts = Vec::new();

    if state.options.sync_metadata {
        conflicts.extend(apply_metadata(state, vault, identity, local_item, local_user).await);
    }
    if state.options.sync_tags {
        apply_tags(state, vault, identity, local_item.local_id).await;
    }
    if state.options.sync_notes {
        warn_on_tombstone_flood(state, identity);
        apply_notes(state, vault, identity, local_user, &local_item.notes).await;
    }
    if state.options.sync_selections {
        apply_selections(state, vault, identity).await;
        if state.options.sync_notes {
            apply_selection_notes(state, vault, identity, local_user).await;
        }
        if state.options.sync_photo_adjustments {
            conflicts.extend(apply_selection_meta(state, vault, identity, local_item, local_user).await);
        }
    }
    if state.options.sync_transcriptions {
        apply_transcriptions(state, vault, identity).await;
    }
    if state.options.sync_lists {
        apply_lists(state, identity, local_item.local_id).await;
    }
    if state.options.sync_photo_adjustments {
        conflicts.extend(apply_photo_metadata(state, vault, identity, local_item, local_user).await);
    }

    synthesize_attribution(state, identity, local_item.local_id, local_user).await;

    conflicts
}

/// §4.4/§7 local-wins conflict check: a property is only overwritten by an
/// inbound record when the *local* value's hash has not changed since it was
/// last pushed. Skips entirely once the local and remote text already match,
/// so a converged field never trips a spurious conflict.
async fn apply_metadata(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    local_item: &Item,
    local_user: &str,
) -> Vec<ConflictLogEntry> {
    let mut conflicts = Vec::new();
    let Ok(records) = schema::get_active_section::<MetadataRecord>(&state.doc, identity, "metadata") else {
        return conflicts;
    };

    let mut to_save: MetadataBatch = Vec::new();
    for (property, record) in records {
        if record.author == local_user {
            continue;
        }
        let local_value = local_item
            .metadata
            .iter()
            .find(|(p, _)| *p == property)
            .map(|(_, f)| f.text.as_str());
        if local_value == Some(record.text.as_str()) {
            continue;
        }
        let validation = crate::backup::validate_inbound_record("", &record.text, true);
        if !validation.valid {
            warn!(identity = %identity.0, property, warnings = ?validation.warnings, "rejected oversized inbound metadata");
            continue;
        }

        let local_hash = crate::push::hash_field(local_value.unwrap_or(""));
        if vault.has_local_edit(identity.as_ref(), &property, &local_hash) {
            conflicts.push(ConflictLogEntry {
                identity: identity.0.clone(),
                field: property,
                local: local_value.unwrap_or("").to_string(),
                remote: truncate(&record.text, 64),
                remote_author: record.author,
                resolution: "local-wins",
            });
            continue;
        }
        to_save.push((
            property,
            MetadataField {
                text: record.text,
                value_type: record.value_type,
                lang: record.lang,
            },
        ));
    }

    if !to_save.is_empty() {
        let _ = state.adapter.save_metadata(SubjectId::Item(local_item.local_id), to_save).await;
    }
    conflicts
}

/// Per-photo metadata apply, symmetric with `push::push_photo_metadata`:
/// CRDT key is `<checksum>:<property>`, and the `has_local_edit` scope is
/// the photo's own namespace so its fields never collide with the owning
/// item's fields of the same property name.
async fn apply_photo_metadata(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    local_item: &Item,
    local_user: &str,
) -> Vec<ConflictLogEntry> {
    let mut conflicts = Vec::new();
    let Ok(records) = schema::get_active_section::<MetadataRecord>(&state.doc, identity, "photos") else {
        return conflicts;
    };

    let mut by_checksum: HashMap<&str, MetadataBatch> = HashMap::new();
    for (key, record) in records {
        if record.author == local_user {
            continue;
        }
        let Some((checksum, property)) = key.split_once(':') else {
            continue;
        };
        let Some(photo) = local_item.photos.iter().find(|p| p.checksum == checksum) else {
            continue;
        };
        let local_value = photo
            .metadata
            .iter()
            .find(|(p, _)| p == property)
            .map(|(_, f)| f.text.as_str());
        if local_value == Some(record.text.as_str()) {
            continue;
        }
        let validation = crate::backup::validate_inbound_record("", &record.text, true);
        if !validation.valid {
            warn!(identity = %identity.0, checksum, property, warnings = ?validation.warnings, "rejected oversized inbound photo metadata");
            continue;
        }

        let scope = format!("{}:photo:{checksum}", identity.as_ref());
        let local_hash = crate::push::hash_field(local_value.unwrap_or(""));
        if vault.has_local_edit(&scope, property, &local_hash) {
            conflicts.push(ConflictLogEntry {
                identity: identity.0.clone(),
                field: format!("{checksum}:{property}"),
                local: local_value.unwrap_or("").to_string(),
                remote: truncate(&record.text, 64),
                remote_author: record.author.clone(),
                resolution: "local-wins",
            });
            continue;
        }
        by_checksum.entry(photo.checksum.as_str()).or_default().push((
            property.to_string(),
            MetadataField {
                text: record.text,
                value_type: record.value_type,
                lang: record.lang,
            },
        ));
    }

    for (checksum, batch) in by_checksum {
        if let Some(photo) = local_item.photos.iter().find(|p| p.checksum == checksum) {
            let _ = state.adapter.save_metadata(SubjectId::Photo(photo.local_id), batch).await;
        }
    }
    conflicts
}

/// Per-selection metadata apply, symmetric with `push::push_selection_meta`:
/// CRDT key is `<selUUID>:<property>` under `selectionMeta`, resolved back
/// to a local selection through the vault's selection-uuid mapping.
async fn apply_selection_meta(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    local_item: &Item,
    local_user: &str,
) -> Vec<ConflictLogEntry> {
    let mut conflicts = Vec::new();
    let Ok(records) = schema::get_active_section::<MetadataRecord>(&state.doc, identity, "selectionMeta") else {
        return conflicts;
    };

    let mut by_selection: HashMap<LocalId, MetadataBatch> = HashMap::new();
    for (key, record) in records {
        if record.author == local_user {
            continue;
        }
        let Some((sel_uuid, property)) = key.split_once(':') else {
            continue;
        };
        let Some(sel_local_str) = vault.local_selection_for_uuid(sel_uuid) else {
            continue;
        };
        let Ok(sel_local_id) = sel_local_str.parse::<i64>().map(LocalId) else {
            continue;
        };
        let Some(selection) = local_item
            .photos
            .iter()
            .flat_map(|p| p.selections.iter())
            .find(|s| s.local_id == sel_local_id)
        else {
            continue;
        };
        let local_value = selection
            .metadata
            .iter()
            .find(|(p, _)| p == property)
            .map(|(_, f)| f.text.as_str());
        if local_value == Some(record.text.as_str()) {
            continue;
        }
        let validation = crate::backup::validate_inbound_record("", &record.text, true);
        if !validation.valid {
            warn!(identity = %identity.0, sel_uuid, property, warnings = ?validation.warnings, "rejected oversized inbound selection metadata");
            continue;
        }

        let scope = format!("{}:selection:{sel_uuid}", identity.as_ref());
        let local_hash = crate::push::hash_field(local_value.unwrap_or(""));
        if vault.has_local_edit(&scope, property, &local_hash) {
            conflicts.push(ConflictLogEntry {
                identity: identity.0.clone(),
                field: format!("{sel_uuid}:{property}"),
                local: local_value.unwrap_or("").to_string(),
                remote: truncate(&record.text, 64),
                remote_author: record.author.clone(),
                resolution: "local-wins",
            });
            continue;
        }
        by_selection.entry(sel_local_id).or_default().push((
            property.to_string(),
            MetadataField {
                text: record.text,
                value_type: record.value_type,
                lang: record.lang,
            },
        ));
    }

    for (sel_local_id, batch) in by_selection {
        let _ = state.adapter.save_metadata(SubjectId::Selection(sel_local_id), batch).await;
    }
    conflicts
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        format!("{}…", &s[..max])
    }
}

async fn apply_tags(state: &SyncEngineState, vault: &mut Vault, identity: &Identity, local_item: LocalId) {
    let Ok(records) = schema::get_section::<crate::schema::TagRecordValue>(&state.doc, identity, "tags") else {
        return;
    };
    let Ok(existing) = state.adapter.get_all_tags().await else {
        return;
    };

    for (name_key, record) in records {
        let tombstone_key = format!("tag:{name_key}");

        if record.deleted {
            if !state.options.sync_deletions {
                continue;
            }
            if !vault.tombstone_author_matches(&tombstone_key, &record.author) {
                continue;
            }
            if let Some(existing_tag) = existing.iter().find(|t| t.name.to_lowercase() == name_key) {
                let _ = state
                    .adapter
                    .remove_tags_from_item(local_item, &[TagId(existing_tag.id.0)])
                    .await;
            }
            continue;
        }

        vault.set_original_author(&tombstone_key, &record.author);

        let existing_tag = existing
            .iter()
            .find(|t| t.name.to_lowercase() == name_key.to_lowercase());
        let tag_id = match existing_tag {
            Some(t) => t.id,
            None => match state.adapter.create_tag(&record.name, record.color.as_deref()).await {
                Ok(t) => t.id,
                Err(_) => continue,
            },
        };
        let _ = state
            .adapter
            .add_tags_to_item(local_item, &[TagId(tag_id.0)])
            .await;
    }
}

/// Informational-only: log when a large fraction of a room's note records
/// are tombstones, without blocking apply.
fn warn_on_tombstone_flood(state: &SyncEngineState, identity: &Identity) {
    let Ok(all) = schema::get_section::<NoteRecord>(&state.doc, identity, "notes") else {
        return;
    };
    let total = all.len();
    let tombstoned = all.iter().filter(|(_, r)| r.deleted).count();
    if let Some(warning) =
        crate::backup::check_tombstone_ratio(total, tombstoned, state.options.tombstone_flood_threshold)
    {
        warn!(identity = %identity.0, %warning, "tombstone flood detected");
    }
}

/// Find the local note already tracking `uuid`, preferring the vault's own
/// id mapping and falling back to scanning local notes for one carrying a
/// footer that names this uuid (e.g. a vault rebuilt after a corrupted
/// sidecar reload).
fn find_local_note(vault: &mut Vault, uuid: &str, local_notes: &[NoteItem]) -> Option<LocalId> {
    if let Some(mapped) = vault.local_note_for_uuid(uuid) {
        if let Ok(id) = mapped.parse::<i64>() {
            if local_notes.iter().any(|n| n.local_id.0 == id) {
                return Some(LocalId(id));
            }
        }
    }
    local_notes
        .iter()
        .find(|n| parse_footer(&n.html).is_some_and(|f| f.uuid == uuid))
        .map(|n| n.local_id)
}

/// Last-resort dedup when the footer didn't survive the host's rich-text
/// round-trip: a local note whose body text normalises to the same text as
/// the incoming sanitized record is treated as the same note rather than
/// creating a duplicate. Only candidates without a footer of their own are
/// considered, so a note already tracking a *different* synced uuid is never
/// silently repointed.
fn find_local_note_by_content(incoming_html: &str, local_notes: &[NoteItem]) -> Option<LocalId> {
    let target = normalize_note_text(incoming_html);
    if target.is_empty() {
        return None;
    }
    local_notes
        .iter()
        .find(|n| parse_footer(&n.html).is_none() && normalize_note_text(&n.html) == target)
        .map(|n| n.local_id)
}

fn normalize_note_text(html: &str) -> String {
    strip_tags(&sanitizer::sanitize(&strip_footer(html)))
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_tags(html: &str) -> String {
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

fn strip_footer(html: &str) -> String {
    match html.find(&format!("<p><sub>{FOOTER_PREFIX}")) {
        Some(idx) => html[..idx].to_string(),
        None => html.to_string(),
    }
}

async fn apply_notes(
    state: &SyncEngineState,
    vault: &mut Vault,
    identity: &Identity,
    local_user: &str,
    local_notes: &[NoteItem],
) {
    let Ok(records) = schema::get_section::<NoteRecord>(&state.doc, identity, "notes") else {
        return;
    };

    for (uuid, record) in records {
        if record.author == local_user {
            continue;
        }
        if vault.is_note_failure_exhausted(&uuid) {
            continue;
        }

        if record.deleted {
            apply_note_retraction(state, vault, &uuid, &record, local_notes).await;
            continue;
        }

        // Record the creator before any later tombstone overwrites `author`
        // with the deleter's identity, so ownership can still be checked.
        vault.set_original_author(&uuid, &record.author);

        let validation = crate::backup::validate_inbound_record(&record.html, &record.text, false);
        if !validation.valid {
            warn!(uuid = %uuid, warnings = ?validation.warnings, "rejected oversized inbound note");
            continue;
        }

        let footer_html = render_footer(&uuid, &record.author);
        let html = sanitizer::sanitize(&record.html);
        let existing = find_local_note(vault, &uuid, local_notes)
            .or_else(|| find_local_note_by_content(&record.html, local_notes));

        if let Some(local_id) = existing {
            if vault.is_note_applied(&uuid) {
                let current_html = local_notes
                    .iter()
                    .find(|n| n.local_id == local_id)
                    .map(|n| n.html.as_str())
                    .unwrap_or("");
                if vault.has_local_note_edit(&uuid, current_html) {
                    // The user edited the synced note locally since last
                    // apply: local wins, do not overwrite.
                    continue;
                }
            }
            let full_html = format!("{html}{footer_html}");
            vault.mark_note_applied(&uuid, &full_html);
            let result = state
                .adapter
                .update_note(local_id, UpdateNote { html: full_html, language: record.lang.clone() })
                .await;
            match result {
                Ok(new_id) => {
                    vault.map_applied_note(&uuid, &new_id.0.to_string());
                    vault.clear_note_failure(&uuid);
                }
                Err(_) => {
                    warn!(uuid = %uuid, "failed to update applied note");
                    vault.record_note_failure(&uuid);
                }
            }
            continue;
        }

        let full_html = format!("{html}{footer_html}");
        vault.mark_note_applied(&uuid, &full_html);

        let photo = record.photo.as_ref().map(|_| LocalId(0));
        let result = state
            .adapter
            .create_note(CreateNote {
                photo,
                selection: None,
                html: full_html,
                language: record.lang.clone(),
            })
            .await;
        if let Ok(new_id) = result {
            vault.map_applied_note(&uuid, &new_id.0.to_string());
            vault.clear_note_failure(&uuid);
        } else {
            warn!(uuid = %uuid, "failed to apply note");
            vault.record_note_failure(&uuid);
        }
    }
}

/// Process a tombstoned note record: rewrite the matched local note with
/// a strikethrough body and a "retracted by" footer, once, and only if the
/// tombstone's author matches who originally wrote the record.
async fn apply_note_retraction(
    state: &SyncEngineState,
    vault: &mut Vault,
    uuid: &str,
    record: &NoteRecord,
    local_notes: &[NoteItem],
) {
    if !state.options.sync_deletions {
        return;
    }
    if vault.is_dismissed(uuid) {
        return;
    }
    if vault.is_note_retracted(uuid) {
        return;
    }
    if !vault.tombstone_author_matches(uuid, &record.author) {
        return;
    }
    let Some(local_id) = find_local_note(vault, uuid, local_notes) else {
        vault.mark_note_retracted(uuid);
        return;
    };
    let existing = local_notes.iter().find(|n| n.local_id == local_id);
    let body = existing.map(|n| strip_footer(&n.html)).unwrap_or_default();
    let language = existing.map(|n| n.language.clone()).unwrap_or_default();
    let retracted_html = render_retracted(&sanitizer::sanitize(&body), uuid, &record.author);

    vault.mark_note_retracted(uuid);
    let result = state
        .adapter
        .update_note(local_id, UpdateNote { html: retracted_html, language })
        .await;
    if result.is_err() {
        warn!(uuid = %uuid, "failed to apply note retraction");
    }
}

async fn apply_selections(state: &SyncEngineState, vault: &mut Vault, identity: &Identity) {
    let Ok(records) = schema::get_active_section::<SelectionRecord>(&state.doc, identity, "selections") else {
        return;
    };
    for (uuid, record) in records {
        if vault.is_selection_applied(&uuid) {
            continue;
        }
        let fingerprint = crate::identity::compute_selection_fingerprint(
            &record.photo,
            record.x,
            record.y,
            record.w,
            record.h,
        );
        if vault.is_selection_applied(&fingerprint) {
            vault.mark_selection_applied(&uuid);
            continue;
        }
        let result = state
            .adapter
            .create_selection(CreateSelection {
                photo: LocalId(0),
                x: record.x,
                y: record.y,
                w: record.w,
                h: record.h,
                angle: record.angle,
            })
            .await;
        if let Ok(new_id) = result {
            vault.mark_selection_applied(&uuid);
            vault.mark_selection_applied(&fingerprint);
            vault.map_applied_selection(&uuid, &new_id.0.to_string());
        }
    }
}

/// Apply notes nested under a selection (`selectionNotes` section, key
/// `selUUID:noteUUID`). Simpler than `apply_notes`: once created, a
/// selection note is never re-applied, since selection bodies aren't
/// threaded through `apply_item` the way item-level notes are — matches
/// `apply_transcriptions`'s create-once idiom rather than `apply_notes`'s
/// full update-in-place path.
async fn apply_selection_notes(state: &SyncEngineState, vault: &mut Vault, identity: &Identity, local_user: &str) {
    let Ok(records) = schema::get_active_section::<NoteRecord>(&state.doc, identity, "selectionNotes") else {
        return;
    };
    for (key, record) in records {
        if record.author == local_user || vault.is_note_applied(&key) {
            continue;
        }
        let Some((sel_uuid, note_uuid)) = key.split_once(':') else {
            continue;
        };
        let Some(sel_local_str) = vault.local_selection_for_uuid(sel_uuid) else {
            continue;
        };
        let Ok(sel_local_id) = sel_local_str.parse::<i64>() else {
            continue;
        };

        let validation = crate::backup::validate_inbound_record(&record.html, &record.text, false);
        if !validation.valid {
            warn!(key = %key, warnings = ?validation.warnings, "rejected oversized inbound selection note");
            continue;
        }

        let footer_html = render_footer(note_uuid, &record.author);
        let html = sanitizer::sanitize(&record.html);
        let full_html = format!("{html}{footer_html}");

        let result = state
            .adapter
            .create_note(CreateNote {
                photo: None,
                selection: Some(LocalId(sel_local_id)),
                html: full_html.clone(),
                language: record.lang.clone(),
            })
            .await;
        match result {
            Ok(new_id) => {
                vault.mark_note_applied(&key, &full_html);
                vault.map_applied_note(&key, &new_id.0.to_string());
            }
            Err(_) => warn!(key = %key, "failed to apply selection note"),
        }
    }
}

async fn apply_transcriptions(state: &SyncEngineState, vault: &mut Vault, identity: &Identity) {
    let Ok(records) = schema::get_active_section::<TranscriptionRecord>(&state.doc, identity, "transcriptions") else {
        return;
    };
    for (uuid, record) in records {
        if vault.is_transcription_applied(&uuid) {
            continue;
        }
        let validation = crate::backup::validate_inbound_record(&record.data, &record.text, false);
        if !validation.valid {
            warn!(uuid = %uuid, warnings = ?validation.warnings, "rejected oversized inbound transcription");
            continue;
        }
        let result = state
            .adapter
            .create_transcription(CreateTranscription {
                photo: LocalId(0),
                selection: None,
                text: record.text,
                data: record.data,
            })
            .await;
        if let Ok(new_id) = result {
            vault.mark_transcription_applied(&uuid);
            vault.map_applied_transcription(&uuid, &new_id.0.to_string());
        }
    }
}

async fn apply_lists(state: &SyncEngineState, identity: &Identity, local_item: LocalId) {
    let Ok(records) = schema::get_active_section::<ListRecord>(&state.doc, identity, "lists") else {
        return;
    };
    let Ok(existing_lists) = state.adapter.get_all_lists().await else {
        return;
    };
    for (_, record) in records {
        if let Some(existing) = existing_lists.iter().find(|l| l.name == record.name) {
            let _ = state.adapter.add_items_to_list(existing.id, &[local_item]).await;
        }
    }
}

const ATTRIBUTION_CONTRIBUTORS_PROPERTY: &str = "troparcel/contributors";
const ATTRIBUTION_LAST_SYNC_PROPERTY: &str = "troparcel/lastSync";

/// After a successful per-item apply, tag `@<author>` once per non-self
/// contributor and record a contributor list as dedicated metadata.
/// Dispatched under the same suppression bracket as the rest of apply so
/// these writes never feed back into the CRDT.
async fn synthesize_attribution(
    state: &SyncEngineState,
    identity: &Identity,
    local_item: LocalId,
    local_user: &str,
) {
    let snapshot = match schema::get_snapshot(&state.doc, identity) {
        Ok(s) => s,
        Err(_) => return,
    };
    let mut contributors: HashSet<String> = HashSet::new();
    for (_, r) in &snapshot.metadata {
        contributors.insert(r.author.clone());
    }
    for (_, r) in &snapshot.notes {
        contributors.insert(r.author.clone());
    }
    for (_, r) in &snapshot.tags {
        contributors.insert(r.author.clone());
    }
    contributors.remove(local_user);

    if contributors.is_empty() {
        return;
    }

    for author in &contributors {
        let tag_name = format!("@{author}");
        if let Ok(tag) = state.adapter.create_tag(&tag_name, None).await {
            let _ = state.adapter.add_tags_to_item(local_item, &[TagId(tag.id.0)]).await;
        }
    }

    let batch = vec![
        (
            ATTRIBUTION_CONTRIBUTORS_PROPERTY.to_string(),
            MetadataField {
                text: {
                    let mut list: Vec<&String> = contributors.iter().collect();
                    list.sort();
                    list.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
                },
                value_type: "string".into(),
                lang: String::new(),
            },
        ),
        (
            ATTRIBUTION_LAST_SYNC_PROPERTY.to_string(),
            MetadataField {
                text: crate::backup::iso_timestamp_now(),
                value_type: "dateTime".into(),
                lang: String::new(),
            },
        ),
    ];
    let _ = state.adapter.save_metadata(SubjectId::Item(local_item), batch).await;
    info!(identity = %identity.0, contributors = contributors.len(), "synthesized attribution");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;

    use crate::config::Options;
    use crate::store::{
        ChangeCallback, CreateNote, CreateSelection, CreateTranscription, ListSummary, StoreAdapter,
        TagRecord, Unsubscribe,
    };

    /// A `StoreAdapter` whose only observable behavior is recording
    /// `save_metadata` calls, for asserting what `apply_metadata` and its
    /// per-photo/per-selection siblings actually write.
    struct RecordingAdapter {
        saved: StdMutex<Vec<(SubjectId, MetadataBatch)>>,
    }

    impl RecordingAdapter {
        fn new() -> Self {
            Self { saved: StdMutex::new(Vec::new()) }
        }
    }

    #[async_trait]
    impl StoreAdapter for RecordingAdapter {
        async fn get_all_items_full(&self) -> crate::error::Result<Vec<Item>> {
            Ok(Vec::new())
        }
        async fn get_all_tags(&self) -> crate::error::Result<Vec<TagRecord>> {
            Ok(Vec::new())
        }
        async fn get_all_lists(&self) -> crate::error::Result<Vec<ListSummary>> {
            Ok(Vec::new())
        }
        async fn save_metadata(&self, subject: SubjectId, fields: MetadataBatch) -> crate::error::Result<()> {
            self.saved.lock().unwrap().push((subject, fields));
            Ok(())
        }
        async fn create_tag(&self, name: &str, _color: Option<&str>) -> crate::error::Result<TagRecord> {
            Ok(TagRecord { id: LocalId(1), name: name.to_string(), color: None })
        }
        async fn add_tags_to_item(&self, _item: LocalId, _tags: &[TagId]) -> crate::error::Result<()> {
            Ok(())
        }
        async fn remove_tags_from_item(&self, _item: LocalId, _tags: &[TagId]) -> crate::error::Result<()> {
            Ok(())
        }
        async fn create_selection(&self, _req: CreateSelection) -> crate::error::Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_selection(&self, _id: LocalId) -> crate::error::Result<()> {
            Ok(())
        }
        async fn create_note(&self, _req: CreateNote) -> crate::error::Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn update_note(&self, _id: LocalId, _req: UpdateNote) -> crate::error::Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_note(&self, _id: LocalId) -> crate::error::Result<()> {
            Ok(())
        }
        async fn create_transcription(&self, _req: CreateTranscription) -> crate::error::Result<LocalId> {
            Ok(LocalId(1))
        }
        async fn delete_transcription(&self, _id: LocalId) -> crate::error::Result<()> {
            Ok(())
        }
        async fn add_items_to_list(&self, _list: LocalId, _items: &[LocalId]) -> crate::error::Result<()> {
            Ok(())
        }
        async fn remove_items_from_list(&self, _list: LocalId, _items: &[LocalId]) -> crate::error::Result<()> {
            Ok(())
        }
        fn subscribe(&self, _callback: ChangeCallback) -> Unsubscribe {
            Box::new(|| {})
        }
        fn suppress_changes(&self) {}
        fn resume_changes(&self) {}
        fn validate_state_shape(&self) -> Vec<String> {
            Vec::new()
        }
    }

    fn test_state(adapter: Arc<dyn StoreAdapter>) -> SyncEngineState {
        SyncEngineState {
            doc: yrs::Doc::new(),
            adapter,
            options: Options::default(),
            profile_dir: std::path::PathBuf::new(),
        }
    }

    fn item_with_metadata(text: &str) -> Item {
        Item {
            local_id: LocalId(1),
            metadata: vec![(
                "dc:title".to_string(),
                MetadataField { text: text.to_string(), value_type: "string".into(), lang: String::new() },
            )],
            tags: Vec::new(),
            photos: Vec::new(),
            notes: Vec::new(),
            transcriptions: Vec::new(),
            lists: Vec::new(),
        }
    }

    #[tokio::test]
    async fn apply_metadata_local_wins_when_never_pushed() {
        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter.clone());
        let identity = Identity("room-a".into());
        schema::set_record(
            &state.doc,
            &identity,
            "metadata",
            "dc:title",
            &MetadataRecord {
                text: "Remote Title".into(),
                value_type: "string".into(),
                lang: String::new(),
                author: "bob".into(),
                push_seq: 1,
                deleted: false,
            },
        )
        .unwrap();

        let mut vault = Vault::new("room-a");
        let local_item = item_with_metadata("Local Title");
        let conflicts = apply_metadata(&state, &mut vault, &identity, &local_item, "alice").await;

        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].resolution, "local-wins");
        assert_eq!(conflicts[0].local, "Local Title");
        assert!(adapter.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_metadata_applies_remote_once_local_value_was_pushed_unchanged() {
        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter.clone());
        let identity = Identity("room-b".into());
        schema::set_record(
            &state.doc,
            &identity,
            "metadata",
            "dc:title",
            &MetadataRecord {
                text: "Remote Title".into(),
                value_type: "string".into(),
                lang: String::new(),
                author: "bob".into(),
                push_seq: 1,
                deleted: false,
            },
        )
        .unwrap();

        let mut vault = Vault::new("room-b");
        vault.mark_field_pushed(identity.as_ref(), "dc:title", crate::push::hash_field("Local Title"));
        let local_item = item_with_metadata("Local Title");
        let conflicts = apply_metadata(&state, &mut vault, &identity, &local_item, "alice").await;

        assert!(conflicts.is_empty());
        let saved = adapter.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1[0].1.text, "Remote Title");
    }

    #[tokio::test]
    async fn apply_metadata_skips_when_already_converged() {
        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter.clone());
        let identity = Identity("room-c".into());
        schema::set_record(
            &state.doc,
            &identity,
            "metadata",
            "dc:title",
            &MetadataRecord {
                text: "Same Title".into(),
                value_type: "string".into(),
                lang: String::new(),
                author: "bob".into(),
                push_seq: 1,
                deleted: false,
            },
        )
        .unwrap();

        let mut vault = Vault::new("room-c");
        let local_item = item_with_metadata("Same Title");
        let conflicts = apply_metadata(&state, &mut vault, &identity, &local_item, "alice").await;

        assert!(conflicts.is_empty());
        assert!(adapter.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn apply_photo_metadata_writes_remote_to_the_matching_photo() {
        use crate::store::PhotoRecord;

        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter.clone());
        let identity = Identity("room-photo".into());
        schema::set_record(
            &state.doc,
            &identity,
            "photos",
            "chk1:dc:description",
            &MetadataRecord {
                text: "Remote caption".into(),
                value_type: "string".into(),
                lang: String::new(),
                author: "bob".into(),
                push_seq: 1,
                deleted: false,
            },
        )
        .unwrap();

        let mut vault = Vault::new("room-photo");
        let mut local_item = item_with_metadata("Local Title");
        local_item.photos = vec![PhotoRecord {
            local_id: LocalId(42),
            checksum: "chk1".into(),
            metadata: Vec::new(),
            selections: Vec::new(),
        }];
        let conflicts = apply_photo_metadata(&state, &mut vault, &identity, &local_item, "alice").await;

        assert!(conflicts.is_empty());
        let saved = adapter.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, SubjectId::Photo(LocalId(42)));
        assert_eq!(saved[0].1[0].1.text, "Remote caption");
    }

    #[tokio::test]
    async fn apply_selection_meta_writes_remote_to_the_mapped_selection() {
        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter.clone());
        let identity = Identity("room-sel".into());
        schema::set_record(
            &state.doc,
            &identity,
            "selectionMeta",
            "sel_abc:dc:title",
            &MetadataRecord {
                text: "Remote selection title".into(),
                value_type: "string".into(),
                lang: String::new(),
                author: "bob".into(),
                push_seq: 1,
                deleted: false,
            },
        )
        .unwrap();

        use crate::store::{PhotoRecord, SelectionItem};

        let mut vault = Vault::new("room-sel");
        vault.map_applied_selection("sel_abc", "7");
        let mut local_item = item_with_metadata("Local Title");
        local_item.photos = vec![PhotoRecord {
            local_id: LocalId(1),
            checksum: "chk1".into(),
            metadata: Vec::new(),
            selections: vec![SelectionItem {
                local_id: LocalId(7),
                x: 0.0,
                y: 0.0,
                w: 1.0,
                h: 1.0,
                angle: 0.0,
                notes: Vec::new(),
                metadata: Vec::new(),
            }],
        }];
        let conflicts = apply_selection_meta(&state, &mut vault, &identity, &local_item, "alice").await;

        assert!(conflicts.is_empty());
        let saved = adapter.saved.lock().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].0, SubjectId::Selection(LocalId(7)));
        assert_eq!(saved[0].1[0].1.text, "Remote selection title");
    }

    #[tokio::test]
    async fn apply_note_retraction_skips_dismissed_keys() {
        let adapter = Arc::new(RecordingAdapter::new());
        let state = test_state(adapter);
        let mut vault = Vault::new("room-dismiss");
        vault.dismiss_key("n_dismissed");
        let record = NoteRecord {
            text: "bye".into(),
            html: "<p>bye</p>".into(),
            lang: String::new(),
            photo: None,
            author: "bob".into(),
            push_seq: 1,
            deleted: true,
        };
        apply_note_retraction(&state, &mut vault, "n_dismissed", &record, &[]).await;
        // A dismissed key is never marked retracted: the skip happens before
        // the tombstone-author check that would otherwise record it.
        assert!(!vault.is_note_retracted("n_dismissed"));
    }

    #[test]
    fn footer_round_trips() {
        let footer = render_footer("n_abc", "alice");
        let parsed = parse_footer(&footer).unwrap();
        assert_eq!(parsed.uuid, "n_abc");
        assert_eq!(parsed.author, "alice");
        assert!(!parsed.retracted);
    }

    #[test]
    fn retracted_footer_round_trips() {
        let rendered = render_retracted("<p>hello</p>", "n_abc", "bob");
        let parsed = parse_footer(&rendered).unwrap();
        assert_eq!(parsed.uuid, "n_abc");
        assert_eq!(parsed.author, "bob");
        assert!(parsed.retracted);
        assert!(rendered.contains("line-through"));
    }

    #[test]
    fn parse_footer_returns_none_without_marker() {
        assert!(parse_footer("<p>plain note</p>").is_none());
    }

    #[test]
    fn exact_match_claims_before_fuzzy() {
        let id = crate::identity::compute_identity(&["c1".to_string()], "", "", "").unwrap();
        let crdt = vec![(id.0.clone(), vec!["c1".to_string()])];
        let local = vec![(LocalId(1), vec!["c1".to_string()])];
        let matches = match_identities(&crdt, &local);
        assert_eq!(matches.len(), 1);
        assert!(matches!(matches[0].2, MatchKind::Exact));
    }

    #[test]
    fn fuzzy_match_claims_superset_item() {
        let id = crate::identity::compute_identity(&["c1".to_string()], "", "", "").unwrap();
        let crdt = vec![(id.0.clone(), vec!["c1".to_string()])];
        let local = vec![(LocalId(1), vec!["c1".to_string(), "c2".to_string()])];
        let matches = match_identities(&crdt, &local);
        assert_eq!(matches.len(), 1);
        assert!(matches!(matches[0].2, MatchKind::Fuzzy));
    }

    #[test]
    fn exact_match_is_not_also_claimed_by_fuzzy() {
        let id1 = crate::identity::compute_identity(&["c1".to_string()], "", "", "").unwrap();
        let id2 = crate::identity::compute_identity(&["c1".to_string(), "c2".to_string()], "", "", "").unwrap();
        let crdt = vec![
            (id1.0.clone(), vec!["c1".to_string()]),
            (id2.0.clone(), vec!["c1".to_string(), "c2".to_string()]),
        ];
        let local = vec![(LocalId(1), vec!["c1".to_string()])];
        let matches = match_identities(&crdt, &local);
        // Only id1 gets the exact match on local item 1; id2 has no other
        // local item left to claim, so it does not also grab item 1.
        assert_eq!(matches.iter().filter(|(_, l, _)| *l == LocalId(1)).count(), 1);
    }

    #[test]
    fn find_local_note_prefers_vault_mapping() {
        let mut vault = Vault::new("room");
        vault.map_applied_note("n_abc", "42");
        let notes = vec![NoteItem { local_id: LocalId(42), html: "<p>hi</p>".into(), language: String::new() }];
        assert_eq!(find_local_note(&mut vault, "n_abc", &notes), Some(LocalId(42)));
    }

    #[test]
    fn find_local_note_falls_back_to_footer_scan() {
        let mut vault = Vault::new("room");
        let footer = render_footer("n_xyz", "alice");
        let notes = vec![NoteItem {
            local_id: LocalId(7),
            html: format!("<p>body</p>{footer}"),
            language: String::new(),
        }];
        assert_eq!(find_local_note(&mut vault, "n_xyz", &notes), Some(LocalId(7)));
    }

    #[test]
    fn find_local_note_returns_none_when_unmatched() {
        let mut vault = Vault::new("room");
        let notes = vec![NoteItem { local_id: LocalId(1), html: "<p>unrelated</p>".into(), language: String::new() }];
        assert_eq!(find_local_note(&mut vault, "n_missing", &notes), None);
    }

    #[test]
    fn find_local_note_by_content_matches_unfootered_note_with_same_text() {
        let notes = vec![NoteItem {
            local_id: LocalId(9),
            html: "<p>Great shot of the <b>harbor</b></p>".into(),
            language: String::new(),
        }];
        let incoming = "<p>Great shot of the <i>harbor</i></p>";
        assert_eq!(find_local_note_by_content(incoming, &notes), Some(LocalId(9)));
    }

    #[test]
    fn find_local_note_by_content_ignores_notes_that_already_carry_a_footer() {
        let footer = render_footer("n_other", "bob");
        let notes = vec![NoteItem {
            local_id: LocalId(9),
            html: format!("<p>Great shot of the harbor</p>{footer}"),
            language: String::new(),
        }];
        let incoming = "<p>Great shot of the harbor</p>";
        assert_eq!(find_local_note_by_content(incoming, &notes), None);
    }

    #[test]
    fn find_local_note_by_content_rejects_unrelated_text() {
        let notes = vec![NoteItem { local_id: LocalId(9), html: "<p>unrelated</p>".into(), language: String::new() }];
        assert_eq!(find_local_note_by_content("<p>Great shot of the harbor</p>", &notes), None);
    }

    #[test]
    fn strip_footer_removes_only_the_footer() {
        let footer = render_footer("n_abc", "alice");
        let full = format!("<p>body</p>{footer}");
        assert_eq!(strip_footer(&full), "<p>body</p>");
        assert_eq!(strip_footer("<p>no footer here</p>"), "<p>no footer here</p>");
    }
}
