use std::path::Path;

use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA-256 and MD5 of one file, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
    pub md5: String,
}

/// Compute the SHA-256 content hash of a file (lowercase hex).
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let content = std::fs::read(path)?;
    Ok(sha256_bytes(&content))
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn md5_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

/// Size plus both digests in a single read. Remote stores report either one.
pub fn digest_file(path: &Path) -> std::io::Result<FileDigest> {
    let content = std::fs::read(path)?;
    Ok(FileDigest {
        size: content.len() as u64,
        sha256: sha256_bytes(&content),
        md5: md5_bytes(&content),
    })
}

/// Recursively sort object keys so logically equal payloads serialize identically.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = serde_json::Map::new();
            for key in keys {
                out.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// SHA-256 of the compact canonical serialization of `value`.
pub fn canonical_json_hash(value: &Value) -> String {
    // Serializing a `Value` cannot fail.
    let text = serde_json::to_string(&canonicalize(value)).unwrap_or_default();
    sha256_bytes(text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.txt");
        std::fs::write(&path, "Hello ingestion world").unwrap();

        let h1 = sha256_file(&path).unwrap();
        let h2 = sha256_file(&path).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn different_content_different_hash() {
        let dir = tempfile::tempdir().unwrap();
        let p1 = dir.path().join("a.txt");
        let p2 = dir.path().join("b.txt");
        std::fs::write(&p1, "Content A").unwrap();
        std::fs::write(&p2, "Content B").unwrap();

        assert_ne!(sha256_file(&p1).unwrap(), sha256_file(&p2).unwrap());
    }

    #[test]
    fn known_digests() {
        assert_eq!(
            sha256_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(md5_bytes(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn digest_file_reports_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, [1u8, 2, 3, 4]).unwrap();
        let digest = digest_file(&path).unwrap();
        assert_eq!(digest.size, 4);
        assert_eq!(digest.sha256, sha256_bytes(&[1, 2, 3, 4]));
    }

    #[test]
    fn canonical_hash_ignores_key_order() {
        let a = serde_json::json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = serde_json::json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(canonical_json_hash(&a), canonical_json_hash(&b));
    }

    #[test]
    fn canonical_hash_respects_array_order() {
        let a = serde_json::json!({"inputs": [1, 2]});
        let b = serde_json::json!({"inputs": [2, 1]});
        assert_ne!(canonical_json_hash(&a), canonical_json_hash(&b));
    }

    #[test]
    fn missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(sha256_file(&dir.path().join("nope")).is_err());
    }
}
