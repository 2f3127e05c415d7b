use crate::identity::Identity;

/// Errors produced by troparcel-core operations.
///
/// Handling policy (not encoded in the type, see `SPEC_FULL.md` §7) is up to
/// the caller: transient and validation errors are logged and the cycle
/// moves on, permanent-per-record errors update vault bookkeeping, and only
/// fatal-startup errors propagate out of [`crate::engine::SyncEngine::start`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no identity could be derived for this item (no photos, and template/title/date all empty)")]
    NoIdentity,

    #[error("CRDT schema error for {identity}/{section}: {message}")]
    Schema {
        identity: Identity,
        section: &'static str,
        message: String,
    },

    #[error("yrs update codec error: {0}")]
    Codec(String),

    #[error("vault I/O error: {0}")]
    VaultIo(#[source] std::io::Error),

    #[error("vault file is corrupted: {0}")]
    VaultCorrupted(String),

    #[error("backup I/O error: {0}")]
    BackupIo(#[source] std::io::Error),

    #[error("store dispatch timed out after {0:?}")]
    StoreTimeout(std::time::Duration),

    #[error("store adapter error: {0}")]
    Store(String),

    #[error("relay connection error: {0}")]
    Relay(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("engine is not running")]
    NotRunning,

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
