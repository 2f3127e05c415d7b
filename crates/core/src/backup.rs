//! Pre-apply snapshots, inbound validation, and rollback.
//!
//! Snapshot files use the same tmp-then-rename idiom as [`crate::vault`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::schema::{MetadataRecord, NoteRecord, TagRecordValue};

const MAX_RECORD_SIZE: usize = 1 << 20; // 1 MiB, notes/selection-notes/transcriptions
const MAX_METADATA_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub identity: String,
    pub local_id: i64,
    pub metadata: Vec<(String, MetadataRecord)>,
    pub tags: Vec<(String, TagRecordValue)>,
    pub photos: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub room: String,
    pub timestamp: String,
    pub version: u32,
    pub items: Vec<SnapshotItem>,
}

static FILE_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Keep `[A-Za-z0-9_.-]`, truncate to 128 characters, default to
/// `"default"` if nothing survives.
pub fn sanitize_room_name(room: &str) -> String {
    let filtered: String = room
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.' || *c == '-')
        .take(128)
        .collect();
    if filtered.is_empty() {
        "default".to_string()
    } else {
        filtered
    }
}

fn backups_dir(profile_dir: &Path, room: &str) -> PathBuf {
    profile_dir.join("backups").join(sanitize_room_name(room))
}

/// Current UTC time as `YYYY-MM-DDTHH-MM-SSZ`, filesystem-safe (dashes
/// instead of colons). No `chrono` dependency in this stack, so the
/// civil-date conversion is Howard Hinnant's `civil_from_days`.
pub fn iso_timestamp_now() -> String {
    iso_timestamp_at(SystemTime::now())
}

fn iso_timestamp_at(time: SystemTime) -> String {
    let secs = time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let days = (secs / 86_400) as i64;
    let time_of_day = secs % 86_400;
    let (year, month, day) = civil_from_days(days);
    let hour = time_of_day / 3600;
    let minute = (time_of_day % 3600) / 60;
    let second = time_of_day % 60;
    format!("{year:04}-{month:02}-{day:02}T{hour:02}-{minute:02}-{second:02}Z")
}

/// Days-since-epoch to (year, month, day), proleptic Gregorian, UTC.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let year = if month <= 2 { y + 1 } else { y };
    (year, month, day)
}

/// Write `<ISO-ts>-<counter>.json` under `<profile>/backups/<room>/`, then
/// prune to the most recent `max_backups`. The per-process counter
/// disambiguates snapshots written within the same millisecond.
pub async fn save_snapshot(
    profile_dir: &Path,
    room: &str,
    iso_timestamp: &str,
    items: &[SnapshotItem],
    version: u32,
    max_backups: usize,
) -> Result<PathBuf> {
    let dir = backups_dir(profile_dir, room);
    tokio::fs::create_dir_all(&dir).await.map_err(Error::BackupIo)?;

    let counter = FILE_COUNTER.fetch_add(1, Ordering::SeqCst);
    let filename = format!("{iso_timestamp}-{counter}.json");
    let path = dir.join(&filename);
    let tmp_path = path.with_extension("json.tmp");

    let snapshot = Snapshot {
        room: room.to_string(),
        timestamp: iso_timestamp.to_string(),
        version,
        items: items.to_vec(),
    };
    let json = serde_json::to_vec_pretty(&snapshot).map_err(Error::Serde)?;
    tokio::fs::write(&tmp_path, json).await.map_err(Error::BackupIo)?;
    tokio::fs::rename(&tmp_path, &path).await.map_err(Error::BackupIo)?;

    prune_backups(&dir, max_backups).await?;
    Ok(path)
}

async fn prune_backups(dir: &Path, max_backups: usize) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir).await.map_err(Error::BackupIo)?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(Error::BackupIo)? {
        if let Some(name) = entry.file_name().to_str() {
            if name.ends_with(".json") {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    if names.len() > max_backups {
        let to_remove = names.len() - max_backups;
        for name in &names[..to_remove] {
            let _ = tokio::fs::remove_file(dir.join(name)).await;
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationResult {
    pub valid: bool,
    pub warnings: Vec<String>,
}

/// Validate an inbound CRDT record before it's applied locally.
///
/// Notes/selection-notes/transcriptions whose `html+text` exceeds 1 MiB
/// are rejected. Metadata fields whose text exceeds 64 KiB are rejected.
/// A tombstone ratio above 0.5 is an informational warning only — it does
/// not block apply, since tombstones accumulate normally over time.
pub fn validate_inbound_record(html: &str, text: &str, is_metadata: bool) -> ValidationResult {
    let size = html.len() + text.len();
    let cap = if is_metadata { MAX_METADATA_SIZE } else { MAX_RECORD_SIZE };
    if size > cap {
        return ValidationResult {
            valid: false,
            warnings: vec![format!(
                "record size {size} bytes exceeds cap {cap} bytes, rejected"
            )],
        };
    }
    ValidationResult {
        valid: true,
        warnings: Vec::new(),
    }
}

/// Check the tombstone ratio across an item's annotation records; returns
/// an informational warning (not a rejection) if it crosses the
/// configured threshold.
pub fn check_tombstone_ratio(total: usize, tombstoned: usize, threshold: f64) -> Option<String> {
    if total == 0 {
        return None;
    }
    let ratio = tombstoned as f64 / total as f64;
    if ratio > threshold {
        Some(format!(
            "tombstone ratio {ratio:.2} exceeds threshold {threshold:.2} ({tombstoned}/{total})"
        ))
    } else {
        None
    }
}

/// Replay a snapshot's metadata/tags back into the host store. Note and
/// selection content can only be restored through the store adapter; a
/// caller using the HTTP fallback path restores metadata only and reports
/// the rest as unrestorable.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RollbackReport {
    pub restored_items: usize,
    pub unrestorable: Vec<String>,
}

pub fn plan_rollback(snapshot: &Snapshot, full_restore: bool) -> RollbackReport {
    let mut report = RollbackReport::default();
    for item in &snapshot.items {
        report.restored_items += 1;
        if !full_restore {
            report
                .unrestorable
                .push(format!("{}: notes/selections not restorable via HTTP fallback", item.identity));
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_room_name_strips_and_truncates() {
        assert_eq!(sanitize_room_name("My Room! #1"), "MyRoom1");
        assert_eq!(sanitize_room_name(""), "default");
        assert_eq!(sanitize_room_name("!!!"), "default");
        let long = "a".repeat(200);
        assert_eq!(sanitize_room_name(&long).len(), 128);
    }

    #[test]
    fn validate_inbound_rejects_oversized_note() {
        let html = "a".repeat(MAX_RECORD_SIZE + 1);
        let result = validate_inbound_record(&html, "", false);
        assert!(!result.valid);
    }

    #[test]
    fn validate_inbound_rejects_oversized_metadata() {
        let text = "a".repeat(MAX_METADATA_SIZE + 1);
        let result = validate_inbound_record("", &text, true);
        assert!(!result.valid);
    }

    #[test]
    fn validate_inbound_accepts_small_record() {
        let result = validate_inbound_record("<p>hi</p>", "hi", false);
        assert!(result.valid);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn tombstone_ratio_warns_but_is_informational() {
        assert!(check_tombstone_ratio(10, 6, 0.5).is_some());
        assert!(check_tombstone_ratio(10, 4, 0.5).is_none());
        assert!(check_tombstone_ratio(0, 0, 0.5).is_none());
    }

    #[test]
    fn iso_timestamp_formats_known_instant() {
        // 2024-01-01T00:00:00Z
        let t = UNIX_EPOCH + std::time::Duration::from_secs(1_704_067_200);
        assert_eq!(iso_timestamp_at(t), "2024-01-01T00-00-00Z");
    }

    #[test]
    fn iso_timestamp_now_is_filesystem_safe() {
        let ts = iso_timestamp_now();
        assert!(ts.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[tokio::test]
    async fn save_snapshot_prunes_to_retention_count() {
        let dir = tempfile::tempdir().unwrap();
        for _ in 0..5 {
            save_snapshot(dir.path(), "room", "2026-01-01T00-00-00Z", &[], 4, 3)
                .await
                .unwrap();
        }
        let room_dir = backups_dir(dir.path(), "room");
        let count = std::fs::read_dir(&room_dir).unwrap().count();
        assert_eq!(count, 3);
    }
}
