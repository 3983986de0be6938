//! Content hashing for template bundles
//!
//! A snapshot is deduplicated by the digest of its definitions, so the digest
//! must not depend on how the caller happened to order keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// SHA256 checksum over canonical content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum(String);

impl Checksum {
    /// Compute checksum from raw bytes
    pub fn from_bytes(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(format!("{:x}", hash))
    }

    /// Compute checksum from a string
    pub fn from_str(content: &str) -> Self {
        Self::from_bytes(content.as_bytes())
    }

    /// Compute checksum from a JSON value with every object's keys sorted
    pub fn from_json(value: &Value) -> Self {
        Self::from_str(&canonical_json(value))
    }

    /// Compute the dedup key of a bundle of template definitions
    pub fn of_bundle(definitions: &BTreeMap<String, Value>) -> Self {
        let mut canonical = String::from("{");
        for (i, (template_id, definition)) in definitions.iter().enumerate() {
            if i > 0 {
                canonical.push(',');
            }
            canonical.push_str(&Value::String(template_id.clone()).to_string());
            canonical.push(':');
            canonical.push_str(&canonical_json(definition));
        }
        canonical.push('}');
        Self::from_str(&canonical)
    }

    /// Get the hex string representation
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Serialize `value` with object keys in lexicographic order at every depth.
///
/// `serde_json::to_string` only sorts while `Map` is a `BTreeMap`. Any crate in
/// the build that enables serde_json's `preserve_order` feature turns it into
/// an insertion-ordered map for everyone, and stored content hashes would then
/// change with the caller's key order. Sorting here keeps them stable either way.
///
/// Array order is significant and kept as is.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
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

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Checksum {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Checksum {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}
