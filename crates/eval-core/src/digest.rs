use anyhow::Result;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Read;
use std::path::Path;

pub fn sha256_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub fn sha256_text(text: &str) -> String {
    sha256_bytes(text.as_bytes())
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn canonicalize_json(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), canonicalize_json(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize_json).collect()),
        other => other.clone(),
    }
}

pub fn canonical_json_digest(value: &Value) -> String {
    let canonical = canonicalize_json(value);
    let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    sha256_bytes(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sha256_text_matches_known_vector() {
        assert_eq!(
            sha256_text("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_digest_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": true, "x": [1, 2]}});
        let b = json!({"a": {"x": [1, 2], "y": true}, "b": 1});
        assert_eq!(canonical_json_digest(&a), canonical_json_digest(&b));
        let c = json!({"a": {"x": [2, 1], "y": true}, "b": 1});
        assert_ne!(canonical_json_digest(&a), canonical_json_digest(&c));
    }

    #[test]
    fn sha256_file_covers_content() {
        let dir = std::env::temp_dir().join(format!(
            "evalrun_digest_test_{}_{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&dir).expect("temp dir");
        let path = dir.join("data.jsonl");
        fs::write(&path, b"abc").expect("write");
        assert_eq!(sha256_file(&path).expect("digest"), sha256_text("abc"));
        fs::write(&path, b"abd").expect("rewrite");
        assert_ne!(sha256_file(&path).expect("digest"), sha256_text("abc"));
        let _ = fs::remove_dir_all(dir);
    }
}
