//! DT-014: Canonical JSON, SHA-256 content hashes, and BLAKE3 checksums.
//!
//! Audit hashes (spec hash, compiled content hash, schema signature) are
//! SHA-256 over canonical JSON: object keys sorted at every depth, arrays in
//! their given order, no insignificant whitespace. Row and artifact checksums
//! use BLAKE3.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Serialize a JSON value with object keys sorted at every depth.
///
/// Independent of serde_json's map ordering features.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, k) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Strings always serialize.
                out.push_str(&Value::String((*k).clone()).to_string());
                out.push(':');
                write_canonical(&map[k.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Canonical JSON of any serializable value.
pub fn canonical_json_of<T: serde::Serialize>(value: &T) -> Result<String, String> {
    let v = serde_json::to_value(value).map_err(|e| format!("JSON serialize error: {}", e))?;
    Ok(canonical_json(&v))
}

/// SHA-256 of bytes. Returns `"sha256:{hex}"`.
pub fn sha256_tagged(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// SHA-256 of a value's canonical JSON. Returns `"sha256:{hex}"`.
pub fn content_hash(value: &serde_json::Value) -> String {
    sha256_tagged(canonical_json(value).as_bytes())
}

/// Signature of a column set and its types. Column order does not matter.
pub fn schema_signature(columns: &IndexMap<String, String>) -> String {
    let map: serde_json::Map<String, serde_json::Value> = columns
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.to_uppercase())))
        .collect();
    content_hash(&serde_json::Value::Object(map))
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Content checksum of a row payload, insensitive to key order.
pub fn row_checksum(payload: &serde_json::Value) -> String {
    hash_string(&canonical_json(payload))
}

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String, String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}
