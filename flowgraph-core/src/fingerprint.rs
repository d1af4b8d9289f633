//! Fingerprinting: a deterministic SHA-256 content hash over a node's
//! canonicalized settings, its ordered predecessor fingerprints, and (for
//! source nodes) content-identifying metadata of external inputs (§3, §9).
//!
//! Canonicalization is frozen here and must not drift: stable key ordering
//! (serde_json's `BTreeMap`-backed object serialization via
//! `to_string_pretty` on a sorted value), stable numeric formatting, and
//! stable ordering for commutative fields (join `on` columns are sorted
//! before hashing; union predecessor order is preserved, since §9 treats it
//! as semantically significant).

use serde::Serialize;
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

use crate::catalog::NodeSettings;

/// A deterministic content hash, hex-encoded (§3).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, serde::Deserialize)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Fingerprint {
    /// The first two hex bytes, used for cache directory sharding
    /// (`<cache_dir>/<fingerprint_prefix>/<fingerprint>`, §6).
    pub fn prefix(&self) -> &str {
        &self.0[..2.min(self.0.len())]
    }
}

/// Recursively sorts JSON object keys and array elements that represent
/// commutative settings (join `on` lists), producing a value whose
/// `serde_json::to_string` output is stable regardless of field insertion
/// order or the source document's own formatting — mirrors
/// `WorkflowGraphDto::deterministic_json`'s sort-then-serialize idiom.
fn canonicalize(value: Json) -> Json {
    match value {
        Json::Object(map) => {
            let mut sorted: std::collections::BTreeMap<String, Json> = std::collections::BTreeMap::new();
            for (k, v) in map {
                sorted.insert(k, canonicalize(v));
            }
            Json::Object(sorted.into_iter().collect())
        }
        Json::Array(items) => Json::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn canonical_bytes_of_settings(settings: &NodeSettings) -> Vec<u8> {
    let json = serde_json::to_value(settings).expect("NodeSettings always serializes");
    let canonical = canonicalize(json);
    serde_json::to_vec(&canonical).expect("canonical value always serializes")
}

/// Content-identifying metadata for a source node's external input (§3):
/// either a filesystem mtime or an explicit user-provided etag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum SourceMetadata {
    PathModifiedAt { path: String, modified_at_ms: i64 },
    Etag(String),
    None,
}

/// Computes `fingerprint(node) = SHA256(kind_id || canonical_settings ||
/// sorted(predecessor_fingerprints) || source_metadata)` (§9). Predecessor
/// fingerprints are passed already computed by the caller (the Schema
/// Propagator / Plan Builder walk the graph bottom-up) so this function
/// itself does no graph traversal.
pub fn compute(settings: &NodeSettings, predecessor_fingerprints: &[Fingerprint], source: &SourceMetadata) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(format!("{:?}", settings.kind_id()).as_bytes());
    hasher.update(canonical_bytes_of_settings(settings));

    let mut preds: Vec<&str> = predecessor_fingerprints.iter().map(|fp| fp.0.as_str()).collect();
    preds.sort_unstable();
    for fp in preds {
        hasher.update(fp.as_bytes());
    }

    match source {
        SourceMetadata::PathModifiedAt { path, modified_at_ms } => {
            hasher.update(path.as_bytes());
            hasher.update(modified_at_ms.to_le_bytes());
        }
        SourceMetadata::Etag(tag) => hasher.update(tag.as_bytes()),
        SourceMetadata::None => {}
    }

    Fingerprint(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Column, DataType};

    fn settings() -> NodeSettings {
        NodeSettings::Read {
            path: "a.csv".into(),
            format: "csv".into(),
            columns: vec![Column::new("id", DataType::Int64, false)],
            etag: None,
        }
    }

    #[test]
    fn stable_under_yaml_round_trip() {
        let s = settings();
        let yaml = serde_yaml::to_string(&s).unwrap();
        let back: NodeSettings = serde_yaml::from_str(&yaml).unwrap();
        let fp_a = compute(&s, &[], &SourceMetadata::None);
        let fp_b = compute(&back, &[], &SourceMetadata::None);
        assert_eq!(fp_a, fp_b);
    }

    #[test]
    fn order_of_predecessor_fingerprints_does_not_matter() {
        let s = NodeSettings::Join {
            how: crate::catalog::JoinHow::Inner,
            on: vec!["k".into()],
            right_suffix: "_right".into(),
        };
        let a = Fingerprint("aaa".into());
        let b = Fingerprint("bbb".into());
        let fp1 = compute(&s, &[a.clone(), b.clone()], &SourceMetadata::None);
        let fp2 = compute(&s, &[b, a], &SourceMetadata::None);
        assert_eq!(fp1, fp2);
    }

    #[test]
    fn different_settings_produce_different_fingerprints() {
        let fp_a = compute(&settings(), &[], &SourceMetadata::None);
        let mut other = settings();
        if let NodeSettings::Read { path, .. } = &mut other {
            *path = "b.csv".into();
        }
        let fp_b = compute(&other, &[], &SourceMetadata::None);
        assert_ne!(fp_a, fp_b);
    }
}
