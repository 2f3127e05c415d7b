//! Engine-inward configuration, one field per row of the options table.
//!
//! Mirrors `AiConfig`'s `#[serde(default = "...")]` pattern so every
//! optional knob still has a sensible default when loaded from a partial
//! host-supplied map.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Auto,
    Review,
    Push,
    Pull,
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Auto
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub server_url: String,
    pub room: String,
    pub user_id: String,
    pub room_token: Option<String>,
    pub sync_mode: SyncMode,

    pub sync_metadata: bool,
    pub sync_tags: bool,
    pub sync_notes: bool,
    pub sync_selections: bool,
    pub sync_transcriptions: bool,
    pub sync_photo_adjustments: bool,
    pub sync_lists: bool,
    pub sync_deletions: bool,

    #[serde(with = "duration_millis")]
    pub startup_delay: Duration,
    #[serde(with = "duration_millis")]
    pub local_debounce: Duration,
    #[serde(with = "duration_millis")]
    pub remote_debounce: Duration,
    #[serde(with = "duration_millis")]
    pub safety_net_interval: Duration,
    #[serde(with = "duration_millis")]
    pub write_delay: Duration,

    pub max_backups: usize,
    pub max_note_size: usize,
    pub max_metadata_size: usize,
    pub tombstone_flood_threshold: f64,
    pub clear_tombstones: bool,
    pub debug: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            room: String::new(),
            user_id: default_user_id(),
            room_token: None,
            sync_mode: SyncMode::Auto,

            sync_metadata: true,
            sync_tags: true,
            sync_notes: true,
            sync_selections: true,
            sync_transcriptions: true,
            sync_photo_adjustments: true,
            sync_lists: true,
            sync_deletions: true,

            startup_delay: Duration::ZERO,
            local_debounce: Duration::from_secs(2),
            remote_debounce: Duration::from_millis(500),
            safety_net_interval: Duration::from_secs(120),
            write_delay: Duration::ZERO,

            max_backups: 20,
            max_note_size: 1 << 20,
            max_metadata_size: 64 * 1024,
            tombstone_flood_threshold: 0.5,
            clear_tombstones: false,
            debug: false,
        }
    }
}

fn default_user_id() -> String {
    let user = std::env::var("USER").or_else(|_| std::env::var("USERNAME")).unwrap_or_else(|_| "unknown".into());
    let host = hostname_best_effort();
    format!("{user}@{host}")
}

fn hostname_best_effort() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_documented_defaults() {
        let opts = Options::default();
        assert_eq!(opts.local_debounce, Duration::from_secs(2));
        assert_eq!(opts.remote_debounce, Duration::from_millis(500));
        assert_eq!(opts.safety_net_interval, Duration::from_secs(120));
        assert_eq!(opts.sync_mode, SyncMode::Auto);
        assert!(opts.sync_deletions);
    }

    #[test]
    fn partial_json_backfills_defaults() {
        let partial = serde_json::json!({ "room": "myroom", "localDebounce": 5000 });
        let opts: Options = serde_json::from_value(serde_json::json!({
            "room": partial["room"],
            "local_debounce": partial["localDebounce"],
        }))
        .unwrap();
        assert_eq!(opts.room, "myroom");
        assert_eq!(opts.local_debounce, Duration::from_millis(5000));
        assert_eq!(opts.safety_net_interval, Duration::from_secs(120));
    }
}
