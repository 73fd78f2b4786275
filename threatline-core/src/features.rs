//! Feature extraction: turns a canonical record into the ordered numeric
//! vector the inference adapter expects.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::record::AttackRecord;

/// A feature attribute held a value that cannot be read as a number.
/// Terminal for the record; no inference call is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("malformed feature `{field}`: {reason}")]
pub struct FeatureError {
    /// Attribute path that could not be read.
    pub field: String,
    /// Human-readable explanation.
    pub reason: String,
}

/// Ordered list of attribute names (dotted paths allowed) that become the
/// feature vector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSpec {
    /// Attribute paths in vector order.
    pub fields: Vec<String>,
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self {
            fields: vec![
                "payload_size".into(),
                "src_port".into(),
                "dst_port".into(),
                "severity".into(),
            ],
        }
    }
}

/// Ordered numeric input to the inference adapter. Serializes as a plain
/// JSON array.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// Wraps already-extracted values.
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    /// Values in feature order.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Number of features.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when no features were extracted.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FeatureSpec {
    /// Rejects an empty field list.
    pub fn validate(&self) -> Result<(), String> {
        if self.fields.is_empty() {
            return Err("features.fields must name at least one attribute".into());
        }
        Ok(())
    }

    /// Missing attributes default to `0.0`.
    pub fn extract(&self, record: &AttackRecord) -> Result<FeatureVector, FeatureError> {
        self.fields
            .iter()
            .map(|field| match record.attribute(field) {
                None => Ok(0.0),
                Some(value) => numeric(field, value),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(FeatureVector)
    }
}

fn numeric(field: &str, value: &Value) -> Result<f32, FeatureError> {
    let malformed = |reason: String| FeatureError {
        field: field.to_string(),
        reason,
    };
    let number = match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| malformed(format!("{n} is not representable")))?,
        Value::Bool(flag) => f64::from(u8::from(*flag)),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| malformed(format!("`{text}` is not numeric")))?,
        other => return Err(malformed(format!("unsupported value {other}"))),
    };
    if !number.is_finite() {
        return Err(malformed(format!("{number} is not finite")));
    }
    Ok(number as f32)
}
