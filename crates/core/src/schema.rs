//! Typed accessors over the replicated document.
//!
//! Uses the familiar `yrs` vocabulary (`Doc`/`Transact`/`MapRef`) but every
//! section here is a Y.Map-of-Y.Map holding small JSON-serialized records
//! rather than Y.Text prose, the way a workspace-document CRDT stores
//! structured records: `serde_json::from_str(&value.to_string(&txn))`
//! round-tripped through `yrs::Any`.

use std::collections::BTreeMap;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use yrs::types::ToJson;
use yrs::{
    Doc, Map, MapPrelim, MapRef, Origin, ReadTxn, Transact, TransactionMut, WriteTxn,
};

use crate::error::{Error, Result};
use crate::identity::Identity;

/// Transaction-origin marker the engine stamps on every write it performs.
/// The remote observer skips transactions carrying this origin so the
/// engine never reacts to its own writes.
pub const LOCAL_ORIGIN: &str = "troparcel:local";

fn local_origin() -> Origin {
    Origin::from(LOCAL_ORIGIN)
}

/// Run `f` inside a transaction tagged [`LOCAL_ORIGIN`].
pub fn with_local_txn<R>(doc: &Doc, f: impl FnOnce(&mut TransactionMut<'_>) -> R) -> R {
    let mut txn = doc.transact_mut_with(local_origin());
    f(&mut txn)
}

fn is_local(txn: &TransactionMut<'_>) -> bool {
    matches!(txn.origin(), Some(origin) if origin == &local_origin())
}

/// One record stored under a property URI in `metadata`, `selectionMeta`,
/// or a photo's nested `metadata` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub text: String,
    #[serde(rename = "type")]
    pub value_type: String,
    pub lang: String,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagRecordValue {
    pub name: String,
    pub color: Option<String>,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub text: String,
    pub html: String,
    pub lang: String,
    #[serde(default)]
    pub photo: Option<String>,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionRecord {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    pub angle: f64,
    pub photo: String,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionRecord {
    pub text: String,
    pub data: String,
    pub photo: String,
    #[serde(default)]
    pub selection: Option<String>,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord {
    pub name: String,
    pub member: bool,
    pub author: String,
    pub push_seq: u64,
    #[serde(default)]
    pub deleted: bool,
}

/// Marker trait for section record types, so tombstone construction stays
/// generic across `set_tombstone`/`get_active`.
pub trait Tombstoneable: Clone + Serialize + DeserializeOwned {
    fn mark_deleted(&mut self, author: &str, push_seq: u64);
    fn deleted(&self) -> bool;
    fn author(&self) -> &str;
}

macro_rules! impl_tombstoneable {
    ($t:ty) => {
        impl Tombstoneable for $t {
            fn mark_deleted(&mut self, author: &str, push_seq: u64) {
                self.deleted = true;
                self.author = author.to_string();
                self.push_seq = push_seq;
            }
            fn deleted(&self) -> bool {
                self.deleted
            }
            fn author(&self) -> &str {
                &self.author
            }
        }
    };
}

impl_tombstoneable!(MetadataRecord);
impl_tombstoneable!(TagRecordValue);
impl_tombstoneable!(NoteRecord);
impl_tombstoneable!(SelectionRecord);
impl_tombstoneable!(TranscriptionRecord);
impl_tombstoneable!(ListRecord);

/// An `{identity, section}` change notification fed to the remote-change
/// debounce path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SectionChange {
    pub identity: String,
    pub section: String,
}

fn root_annotations(txn: &mut TransactionMut<'_>) -> MapRef {
    txn.get_or_insert_map("annotations")
}

fn item_map(txn: &mut TransactionMut<'_>, identity: &Identity) -> MapRef {
    let annotations = root_annotations(txn);
    match annotations.get(txn, identity.as_ref()) {
        Some(yrs::Out::YMap(existing)) => existing,
        _ => annotations.insert(txn, identity.as_ref(), MapPrelim::default()),
    }
}

fn section_map(txn: &mut TransactionMut<'_>, identity: &Identity, section: &str) -> MapRef {
    let item = item_map(txn, identity);
    match item.get(txn, section) {
        Some(yrs::Out::YMap(existing)) => existing,
        _ => item.insert(txn, section, MapPrelim::default()),
    }
}

fn any_to_record<T: DeserializeOwned>(value: &yrs::Out, txn: &impl ReadTxn) -> Result<T> {
    let json = value.to_json(txn);
    let text = json.to_string();
    serde_json::from_str(&text).map_err(Error::Serde)
}

fn record_to_prelim<T: Serialize>(record: &T) -> Result<yrs::Any> {
    let text = serde_json::to_string(record).map_err(Error::Serde)?;
    let value: serde_json::Value = serde_json::from_str(&text).map_err(Error::Serde)?;
    Ok(json_value_to_any(&value))
}

fn json_value_to_any(value: &serde_json::Value) -> yrs::Any {
    match value {
        serde_json::Value::Null => yrs::Any::Null,
        serde_json::Value::Bool(b) => yrs::Any::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                yrs::Any::BigInt(i)
            } else {
                yrs::Any::Number(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => yrs::Any::from(s.as_str()),
        serde_json::Value::Array(items) => {
            let mapped: Vec<yrs::Any> = items.iter().map(json_value_to_any).collect();
            yrs::Any::from(mapped)
        }
        serde_json::Value::Object(map) => {
            let mapped: BTreeMap<String, yrs::Any> = map
                .iter()
                .map(|(k, v)| (k.clone(), json_value_to_any(v)))
                .collect();
            yrs::Any::from(mapped)
        }
    }
}

/// Read every non-tombstoned record out of `section` for `identity`, in
/// insertion order.
pub fn get_active_section<T: Tombstoneable>(
    doc: &Doc,
    identity: &Identity,
    section: &str,
) -> Result<Vec<(String, T)>> {
    get_section(doc, identity, section).map(|entries| {
        entries
            .into_iter()
            .filter(|(_, record)| !record.deleted())
            .collect()
    })
}

/// Read every record (including tombstones) out of `section` for `identity`.
pub fn get_section<T: Tombstoneable>(
    doc: &Doc,
    identity: &Identity,
    section: &str,
) -> Result<Vec<(String, T)>> {
    let txn = doc.transact();
    let annotations = txn.get_map("annotations");
    let Some(annotations) = annotations else {
        return Ok(Vec::new());
    };
    let Some(yrs::Out::YMap(item)) = annotations.get(&txn, identity.as_ref()) else {
        return Ok(Vec::new());
    };
    let Some(yrs::Out::YMap(section_map)) = item.get(&txn, section) else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for (key, value) in section_map.iter(&txn) {
        let record: T = any_to_record(&value, &txn)?;
        out.push((key.to_string(), record));
    }
    Ok(out)
}

/// Read a single record by key, if present.
pub fn get_record<T: Tombstoneable>(
    doc: &Doc,
    identity: &Identity,
    section: &str,
    key: &str,
) -> Result<Option<T>> {
    let txn = doc.transact();
    let Some(annotations) = txn.get_map("annotations") else {
        return Ok(None);
    };
    let Some(yrs::Out::YMap(item)) = annotations.get(&txn, identity.as_ref()) else {
        return Ok(None);
    };
    let Some(yrs::Out::YMap(section_map)) = item.get(&txn, section) else {
        return Ok(None);
    };
    match section_map.get(&txn, key) {
        Some(value) => Ok(Some(any_to_record(&value, &txn)?)),
        None => Ok(None),
    }
}

/// Write (insert or overwrite) a record, inside a [`LOCAL_ORIGIN`]-tagged
/// transaction.
pub fn set_record<T: Tombstoneable>(
    doc: &Doc,
    identity: &Identity,
    section: &str,
    key: &str,
    record: &T,
) -> Result<()> {
    let prelim = record_to_prelim(record)?;
    with_local_txn(doc, |txn| {
        let map = section_map(txn, identity, section);
        map.insert(txn, key, prelim);
    });
    Ok(())
}

/// Write the tombstone form of `key` (`deleted=true`) preserving the
/// original payload, stamped with `author`/`push_seq`.
pub fn remove_record<T: Tombstoneable>(
    doc: &Doc,
    identity: &Identity,
    section: &str,
    key: &str,
    author: &str,
    push_seq: u64,
) -> Result<()> {
    let Some(mut record) = get_record::<T>(doc, identity, section, key)? else {
        return Ok(());
    };
    record.mark_deleted(author, push_seq);
    set_record(doc, identity, section, key, &record)
}

/// Physically remove an entry (no tombstone). Used only by the push path's
/// stale-entry cleanup on the engine's own authored entries.
pub fn delete_entry(doc: &Doc, identity: &Identity, section: &str, key: &str) {
    with_local_txn(doc, |txn| {
        let map = section_map(txn, identity, section);
        map.remove(txn, key);
    });
}

/// Read the photo checksum set stored for fuzzy matching.
pub fn get_checksums(doc: &Doc, identity: &Identity) -> Vec<String> {
    let txn = doc.transact();
    let Some(annotations) = txn.get_map("annotations") else {
        return Vec::new();
    };
    let Some(yrs::Out::YMap(item)) = annotations.get(&txn, identity.as_ref()) else {
        return Vec::new();
    };
    match item.get(&txn, "checksums") {
        Some(value) => {
            let json = value.to_json(&txn);
            match json {
                yrs::Any::Array(items) => items
                    .iter()
                    .filter_map(|v| match v {
                        yrs::Any::String(s) => Some(s.to_string()),
                        _ => None,
                    })
                    .collect(),
                _ => Vec::new(),
            }
        }
        None => Vec::new(),
    }
}

/// Replace the checksum set stored for `identity`.
pub fn set_checksums(doc: &Doc, identity: &Identity, checksums: &[String]) {
    with_local_txn(doc, |txn| {
        let item = item_map(txn, identity);
        let array = yrs::Any::from(
            checksums
                .iter()
                .map(|c| yrs::Any::from(c.as_str()))
                .collect::<Vec<_>>(),
        );
        item.insert(txn, "checksums", array);
    });
}

/// A materialised view of one item's annotations, for the apply/validate
/// paths.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemSnapshot {
    pub metadata: Vec<(String, MetadataRecord)>,
    pub tags: Vec<(String, TagRecordValue)>,
    pub notes: Vec<(String, NoteRecord)>,
    pub selections: Vec<(String, SelectionRecord)>,
    pub selection_meta: Vec<(String, MetadataRecord)>,
    pub selection_notes: Vec<(String, NoteRecord)>,
    pub transcriptions: Vec<(String, TranscriptionRecord)>,
    pub lists: Vec<(String, ListRecord)>,
    pub checksums: Vec<String>,
}

/// Materialise the entire `annotations` map as plain data.
pub fn get_snapshot(doc: &Doc, identity: &Identity) -> Result<ItemSnapshot> {
    Ok(ItemSnapshot {
        metadata: get_section(doc, identity, "metadata")?,
        tags: get_section(doc, identity, "tags")?,
        notes: get_section(doc, identity, "notes")?,
        selections: get_section(doc, identity, "selections")?,
        selection_meta: get_section(doc, identity, "selectionMeta")?,
        selection_notes: get_section(doc, identity, "selectionNotes")?,
        transcriptions: get_section(doc, identity, "transcriptions")?,
        lists: get_section(doc, identity, "lists")?,
        checksums: get_checksums(doc, identity),
    })
}

/// List every identity currently present in the `annotations` map.
pub fn all_identities(doc: &Doc) -> Vec<String> {
    let txn = doc.transact();
    let Some(annotations) = txn.get_map("annotations") else {
        return Vec::new();
    };
    annotations.keys(&txn).map(|k| k.to_string()).collect()
}

/// Deep-observe the replicated document, invoking `callback` once per
/// `{identity, section}` touched by a transaction whose origin is not
/// [`LOCAL_ORIGIN`]. This is how local writes are filtered out of the
/// remote-change stream the sync engine debounces on.
pub fn observe_annotations_deep(
    doc: &Doc,
    mut callback: impl FnMut(SectionChange) + Send + 'static,
) -> yrs::Subscription {
    let annotations = doc.get_or_insert_map("annotations");
    annotations
        .observe_deep(move |txn, events| {
            if is_local(txn) {
                return;
            }
            for event in events.iter() {
                let path = event.path();
                let mut segments = path.into_iter();
                let Some(yrs::types::PathSegment::Key(identity)) = segments.next() else {
                    continue;
                };
                let section = match segments.next() {
                    Some(yrs::types::PathSegment::Key(section)) => section.to_string(),
                    _ => continue,
                };
                callback(SectionChange {
                    identity: identity.to_string(),
                    section,
                });
            }
        })
        .expect("failed to subscribe to annotations map")
}

/// Read and/or set `room`-level scalar configuration (schema version and
/// policy flags).
pub fn room_schema_version(doc: &Doc) -> u32 {
    let txn = doc.transact();
    let Some(room) = txn.get_map("room") else {
        return 0;
    };
    match room.get(&txn, "schemaVersion") {
        Some(yrs::Out::Any(yrs::Any::BigInt(v))) => v as u32,
        _ => 0,
    }
}

pub fn ensure_room_schema(doc: &Doc) {
    with_local_txn(doc, |txn| {
        let room = txn.get_or_insert_map("room");
        if room.get(txn, "schemaVersion").is_none() {
            room.insert(txn, "schemaVersion", yrs::Any::BigInt(4));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rec(author: &str, seq: u64) -> NoteRecord {
        NoteRecord {
            text: "hello".into(),
            html: "<p>hello</p>".into(),
            lang: "en".into(),
            photo: Some("c1".into()),
            author: author.into(),
            push_seq: seq,
            deleted: false,
        }
    }

    #[test]
    fn write_and_read_note_round_trips() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        set_record(&doc, &id, "notes", "n_1", &rec("alice", 1)).unwrap();
        let got: NoteRecord = get_record(&doc, &id, "notes", "n_1").unwrap().unwrap();
        assert_eq!(got, rec("alice", 1));
    }

    #[test]
    fn remove_record_preserves_payload_and_tombstones() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        set_record(&doc, &id, "notes", "n_1", &rec("alice", 1)).unwrap();
        remove_record::<NoteRecord>(&doc, &id, "notes", "n_1", "alice", 2).unwrap();
        let got: NoteRecord = get_record(&doc, &id, "notes", "n_1").unwrap().unwrap();
        assert!(got.deleted);
        assert_eq!(got.html, "<p>hello</p>");
        assert_eq!(got.author, "alice");
    }

    #[test]
    fn active_section_filters_tombstones() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        set_record(&doc, &id, "notes", "n_1", &rec("alice", 1)).unwrap();
        set_record(&doc, &id, "notes", "n_2", &rec("alice", 1)).unwrap();
        remove_record::<NoteRecord>(&doc, &id, "notes", "n_1", "alice", 2).unwrap();
        let active: Vec<(String, NoteRecord)> = get_active_section(&doc, &id, "notes").unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].0, "n_2");
    }

    #[test]
    fn delete_entry_removes_physically() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        set_record(&doc, &id, "notes", "n_1", &rec("alice", 1)).unwrap();
        delete_entry(&doc, &id, "notes", "n_1");
        let got: Option<NoteRecord> = get_record(&doc, &id, "notes", "n_1").unwrap();
        assert!(got.is_none());
    }

    #[test]
    fn checksum_set_round_trips() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        set_checksums(&doc, &id, &["c1".into(), "c2".into()]);
        assert_eq!(get_checksums(&doc, &id), vec!["c1".to_string(), "c2".to_string()]);
    }

    #[test]
    fn local_writes_are_skipped_by_deep_observer() {
        let doc = Doc::new();
        let id = Identity("abc".into());
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = observe_annotations_deep(&doc, move |change| {
            seen_clone.lock().unwrap().push(change);
        });

        set_record(&doc, &id, "notes", "n_1", &rec("alice", 1)).unwrap();
        assert!(seen.lock().unwrap().is_empty());

        {
            let mut txn = doc.transact_mut();
            let annotations = txn.get_or_insert_map("annotations");
            let item = match annotations.get(&txn, id.as_ref()) {
                Some(yrs::Out::YMap(m)) => m,
                _ => annotations.insert(&mut txn, id.as_ref(), MapPrelim::default()),
            };
            let section = match item.get(&txn, "notes") {
                Some(yrs::Out::YMap(m)) => m,
                _ => item.insert(&mut txn, "notes", MapPrelim::default()),
            };
            section.insert(&mut txn, "n_2", record_to_prelim(&rec("bob", 1)).unwrap());
        }
        assert_eq!(seen.lock().unwrap().len(), 1);
        assert_eq!(seen.lock().unwrap()[0].identity, "abc");
        assert_eq!(seen.lock().unwrap()[0].section, "notes");
    }

    #[test]
    fn room_schema_version_defaults_then_can_be_set() {
        let doc = Doc::new();
        assert_eq!(room_schema_version(&doc), 0);
        ensure_room_schema(&doc);
        assert_eq!(room_schema_version(&doc), 4);
    }
}
