//! Canonical topology fingerprinting
//!
//! Two topologies are "the same hardware" iff their canonical JSON matches:
//! object keys sorted, numbers rendered by serde_json's deterministic
//! formatter. The fingerprint is the SHA-256 of that canonical form and is
//! used as the cache discriminator and the change detector on the compacted
//! topology channels.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::topology::Topology;
use crate::Result;

/// Render a JSON value canonically: sorted object keys, no whitespace.
///
/// serde_json formats numbers deterministically (itoa/ryu), so the output is
/// stable across serialize/parse round trips of the same value.
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
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json handles string escaping
                out.push_str(&serde_json::to_string(key).expect("string serialization is infallible"));
                out.push(':');
                write_canonical(&map[*key], out);
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
        other => {
            out.push_str(&other.to_string());
        }
    }
}

/// SHA-256 over the canonical JSON serialization, hex-encoded.
pub fn topology_fingerprint(topology: &Topology) -> Result<String> {
    let value = serde_json::to_value(topology)?;
    let canonical = canonical_json(&value);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}
