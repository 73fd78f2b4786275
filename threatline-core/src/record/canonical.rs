//! Canonical JSON encoding and identifier derivation.
//!
//! `id = lowercase_hex(SHA-256(kind || "\n" || canonical_json(attributes)))`
//! where the canonical encoding is compact JSON with object keys sorted at
//! every depth and integral floats written as integers (`512.0` -> `512`).
//! External readers rely on this being bit-exact.

use serde_json::Value;
use sha2::{Digest, Sha256};

use super::{Attributes, RecordId};

/// Compact JSON with object keys sorted at every depth, independent of the
/// map ordering `serde_json` was built with.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn canonical_attributes(attributes: &Attributes) -> String {
    let mut out = String::new();
    write_object(attributes.iter(), &mut out);
    out
}

/// `lowercase_hex(SHA-256(kind || "\n" || canonical_json(attributes)))`.
pub fn derive_id(kind: &str, attributes: &Attributes) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_attributes(attributes).as_bytes());
    RecordId::from_digest(&hasher.finalize())
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            write_object(entries.into_iter(), out);
        }
        Value::Array(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Number(number) => match integral(number) {
            Some(int) => out.push_str(&int.to_string()),
            None => out.push_str(&number.to_string()),
        },
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Floats with no fractional part inside the `i64` range encode like the
/// equivalent integer.
fn integral(number: &serde_json::Number) -> Option<i64> {
    if number.is_i64() || number.is_u64() {
        return None;
    }
    let float = number.as_f64()?;
    let in_range = float >= i64::MIN as f64 && float < i64::MAX as f64;
    (float.is_finite() && float.fract() == 0.0 && in_range).then_some(float as i64)
}

fn write_object<'a>(entries: impl Iterator<Item = (&'a String, &'a Value)>, out: &mut String) {
    out.push('{');
    for (idx, (key, value)) in entries.enumerate() {
        if idx > 0 {
            out.push(',');
        }
        out.push_str(&Value::String(key.clone()).to_string());
        out.push(':');
        write_value(value, out);
    }
    out.push('}');
}
