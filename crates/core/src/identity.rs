//! Item and sub-resource identity.
//!
//! An item's identity is a content fingerprint, not an assigned id: it is
//! derived from the photo checksums the host reports for that item (or a
//! fallback over template/title/date when there are none), so two instances
//! that independently import the same photos land on the same CRDT key
//! without ever exchanging an id.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A 32-hex-digit content fingerprint — the key under which an item's
/// annotations live in the CRDT `annotations` map.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(pub String);

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Identity {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Derive an item's identity from its photo checksums, falling back to
/// `template|title|date` when there are none. Returns `None` only when both
/// the checksum list and the fallback triple are empty — there is nothing
/// stable to key on.
///
/// Independent of the order `checksums` is supplied in (sorted internally),
/// satisfying invariant 1 of `SPEC_FULL.md` §8.
pub fn compute_identity(checksums: &[String], template: &str, title: &str, date: &str) -> Option<Identity> {
    if !checksums.is_empty() {
        let mut sorted: Vec<&str> = checksums.iter().map(String::as_str).collect();
        sorted.sort_unstable();
        let joined = sorted.join(":");
        return Some(Identity(sha256_hex32(&joined)));
    }

    if template.is_empty() && title.is_empty() && date.is_empty() {
        return None;
    }
    let joined = format!("{template}|{title}|{date}");
    Some(Identity(sha256_hex32(&joined)))
}

/// 24-hex coordinate fingerprint used to dedup selections two peers create
/// over the same region before either has seen the other's UUID.
pub fn compute_selection_fingerprint(checksum: &str, x: f64, y: f64, w: f64, h: f64) -> String {
    let input = format!(
        "sel:{checksum}|{}|{}|{}|{}",
        x.round() as i64,
        y.round() as i64,
        w.round() as i64,
        h.round() as i64,
    );
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..24].to_string()
}

fn sha256_hex32(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())[..32].to_string()
}

/// Generate a fresh note sub-resource id.
pub fn generate_note_uuid() -> String {
    format!("n_{}", Uuid::new_v4())
}

/// Generate a fresh selection sub-resource id.
pub fn generate_selection_uuid() -> String {
    format!("s_{}", Uuid::new_v4())
}

/// Generate a fresh transcription sub-resource id.
pub fn generate_transcription_uuid() -> String {
    format!("t_{}", Uuid::new_v4())
}

/// Generate a fresh list sub-resource id.
pub fn generate_list_uuid() -> String {
    format!("l_{}", Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_independent_of_photo_order() {
        let a = compute_identity(&["c1".into(), "c2".into()], "", "", "").unwrap();
        let b = compute_identity(&["c2".into(), "c1".into()], "", "", "").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn identity_is_32_hex_chars() {
        let id = compute_identity(&["c1".into()], "", "", "").unwrap();
        assert_eq!(id.0.len(), 32);
        assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn shared_checksums_converge_to_same_identity() {
        let a = compute_identity(&["c1".into(), "c2".into()], "", "", "").unwrap();
        let b = compute_identity(&["c1".into(), "c2".into()], "", "", "").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn fallback_hash_used_when_no_photos() {
        let id = compute_identity(&[], "grid", "Summer Trip", "2024-07").unwrap();
        assert_eq!(id.0.len(), 32);
    }

    #[test]
    fn no_identity_when_everything_empty() {
        assert!(compute_identity(&[], "", "", "").is_none());
    }

    #[test]
    fn selection_fingerprint_rounds_coordinates() {
        let a = compute_selection_fingerprint("c1", 10.4, 20.0, 100.0, 50.0);
        let b = compute_selection_fingerprint("c1", 10.49, 20.0, 100.0, 50.0);
        assert_eq!(a, b);
        assert_eq!(a.len(), 24);
    }

    #[test]
    fn sub_resource_uuids_carry_their_prefix() {
        assert!(generate_note_uuid().starts_with("n_"));
        assert!(generate_selection_uuid().starts_with("s_"));
        assert!(generate_transcription_uuid().starts_with("t_"));
        assert!(generate_list_uuid().starts_with("l_"));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn checksum() -> impl Strategy<Value = String> {
        "[a-f0-9]{8,16}"
    }

    proptest! {
        /// Invariant 1 (SPEC_FULL.md §8): identity is independent of the
        /// order checksums are supplied in.
        #[test]
        fn identity_is_permutation_invariant(mut checksums in prop::collection::vec(checksum(), 1..8)) {
            let forward = compute_identity(&checksums, "", "", "").unwrap();
            checksums.reverse();
            let reversed = compute_identity(&checksums, "", "", "").unwrap();
            prop_assert_eq!(forward, reversed);
        }

        /// Identity is a pure function of its inputs: same checksums in,
        /// same 32-hex identity out, every time.
        #[test]
        fn identity_is_deterministic(checksums in prop::collection::vec(checksum(), 0..8), template in "[a-zA-Z ]{0,16}", title in "[a-zA-Z ]{0,16}", date in "[0-9-]{0,10}") {
            let a = compute_identity(&checksums, &template, &title, &date);
            let b = compute_identity(&checksums, &template, &title, &date);
            prop_assert_eq!(a, b);
        }

        /// Whenever an identity is produced, it is exactly 32 lowercase hex digits.
        #[test]
        fn identity_shape_is_32_hex(checksums in prop::collection::vec(checksum(), 1..8)) {
            let id = compute_identity(&checksums, "", "", "").unwrap();
            prop_assert_eq!(id.0.len(), 32);
            prop_assert!(id.0.chars().all(|c| c.is_ascii_hexdigit()));
        }

        /// The selection fingerprint rounds its coordinates before hashing, so
        /// any two inputs that round to the same integers converge.
        #[test]
        fn selection_fingerprint_rounds_consistently(checksum in checksum(), x in -1000.0f64..1000.0, y in -1000.0f64..1000.0, w in 0.0f64..1000.0, h in 0.0f64..1000.0, jitter_x in -0.4f64..0.4, jitter_y in -0.4f64..0.4) {
            let a = compute_selection_fingerprint(&checksum, x, y, w, h);
            let b = compute_selection_fingerprint(&checksum, x + jitter_x, y + jitter_y, w, h);
            prop_assert_eq!(a.len(), 24);
            if x.round() == (x + jitter_x).round() && y.round() == (y + jitter_y).round() {
                prop_assert_eq!(a, b);
            }
        }
    }
}
