//! Record validation and canonicalization.
//!
//! Pure: no I/O, no clocks. The same raw mapping always yields the same
//! [`AttackRecord`] (and therefore the same identifier) regardless of key
//! order, alias spelling, or how the timestamp was written.

use std::net::IpAddr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::record::{AttackRecord, Attributes, RecordStatus, derive_id};

/// Canonical name of the source address field.
pub const SOURCE_IP: &str = "source_ip";
/// Canonical name of the destination address field.
pub const DESTINATION_IP: &str = "destination_ip";
/// Canonical name of the event time field.
pub const TIMESTAMP: &str = "timestamp";
/// Canonical name of the attack category field.
pub const CATEGORY: &str = "category";

/// Field used when the input is not a JSON object at all.
pub const ROOT_FIELD: &str = "$root";

/// Required fields, their accepted aliases, and the namespace tag folded into
/// every identifier.
///
/// Aliases are looked up after the canonical name; a dotted alias (`src.ip`)
/// addresses a nested object. Whichever spelling matched is removed once the
/// value has been moved to its canonical name.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordSchema {
    /// Namespace tag folded into every identifier.
    pub kind: String,
    /// Other spellings accepted for `source_ip`.
    pub source_ip_aliases: Vec<String>,
    /// Other spellings accepted for `destination_ip`.
    pub destination_ip_aliases: Vec<String>,
    /// Other spellings accepted for `timestamp`.
    pub timestamp_aliases: Vec<String>,
    /// Other spellings accepted for `category`.
    pub category_aliases: Vec<String>,
    /// Additional fields that must be present and non-null. Checked for
    /// presence only.
    pub extra_required: Vec<String>,
    /// String fields normalized to upper case when present (`tcp` -> `TCP`).
    pub uppercase_fields: Vec<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            kind: "attack_event".to_string(),
            source_ip_aliases: vec!["src_ip".into(), "src.ip".into(), "source.ip".into()],
            destination_ip_aliases: vec![
                "dst_ip".into(),
                "dst.ip".into(),
                "dest_ip".into(),
                "destination.ip".into(),
            ],
            timestamp_aliases: vec!["ts".into(), "@timestamp".into(), "event_time".into()],
            category_aliases: vec!["kind".into(), "attack_type".into()],
            extra_required: Vec::new(),
            uppercase_fields: vec!["protocol".into()],
        }
    }
}

impl RecordSchema {
    /// `kind` must be non-blank and single-line.
    pub fn validate(&self) -> Result<(), String> {
        if self.kind.trim().is_empty() {
            return Err("schema.kind must not be empty".into());
        }
        if self.kind.contains('\n') {
            return Err("schema.kind must not contain a newline".into());
        }
        Ok(())
    }
}

/// Turns raw JSON mappings into canonical records for one schema.
#[derive(Clone, Debug, Default)]
pub struct RecordValidator {
    schema: RecordSchema,
}

impl RecordValidator {
    /// Validator for `schema`.
    pub fn new(schema: RecordSchema) -> Self {
        Self { schema }
    }

    /// Schema in use.
    pub fn schema(&self) -> &RecordSchema {
        &self.schema
    }

    /// Normalizes `raw` into a canonical, PENDING [`AttackRecord`].
    pub fn validate(&self, raw: &Value) -> Result<AttackRecord, ValidationError> {
        let Value::Object(map) = raw else {
            return Err(ValidationError::new(
                ROOT_FIELD,
                format!("expected a JSON object, got {}", json_type(raw)),
            ));
        };
        let mut fields = strip_nulls(map.clone());

        let source_ip = take_field(&mut fields, SOURCE_IP, &self.schema.source_ip_aliases)
            .ok_or_else(|| ValidationError::missing(SOURCE_IP))
            .and_then(|value| parse_ip(SOURCE_IP, &value))?;
        let destination_ip =
            take_field(&mut fields, DESTINATION_IP, &self.schema.destination_ip_aliases)
                .ok_or_else(|| ValidationError::missing(DESTINATION_IP))
                .and_then(|value| parse_ip(DESTINATION_IP, &value))?;
        let timestamp = take_field(&mut fields, TIMESTAMP, &self.schema.timestamp_aliases)
            .ok_or_else(|| ValidationError::missing(TIMESTAMP))
            .and_then(|value| parse_timestamp(&value))?;
        let category = take_field(&mut fields, CATEGORY, &self.schema.category_aliases)
            .ok_or_else(|| ValidationError::missing(CATEGORY))
            .and_then(|value| parse_category(&value))?;

        for name in &self.schema.extra_required {
            if !fields.contains_key(name) {
                return Err(ValidationError::missing(name.as_str()));
            }
        }
        for name in &self.schema.uppercase_fields {
            if let Some(Value::String(text)) = fields.get_mut(name) {
                *text = text.trim().to_uppercase();
            }
        }

        let mut attributes: Attributes = fields.into_iter().collect();
        attributes.insert(SOURCE_IP.into(), Value::String(source_ip.to_string()));
        attributes.insert(DESTINATION_IP.into(), Value::String(destination_ip.to_string()));
        attributes.insert(TIMESTAMP.into(), Value::from(timestamp.timestamp_millis()));
        attributes.insert(CATEGORY.into(), Value::String(category));

        let id = derive_id(&self.schema.kind, &attributes);
        Ok(AttackRecord {
            id,
            kind: self.schema.kind.clone(),
            timestamp,
            attributes,
            status: RecordStatus::Pending,
        })
    }
}

/// Drops null-valued entries at every depth; absent and null are the same
/// thing to the pipeline.
fn strip_nulls(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter()
        .filter_map(|(key, value)| match value {
            Value::Null => None,
            Value::Object(inner) => Some((key, Value::Object(strip_nulls(inner)))),
            other => Some((key, other)),
        })
        .collect()
}

/// Removes and returns the first spelling of a field that is present.
fn take_field(
    fields: &mut Map<String, Value>,
    canonical: &str,
    aliases: &[String],
) -> Option<Value> {
    std::iter::once(canonical)
        .chain(aliases.iter().map(String::as_str))
        .find_map(|name| take_path(fields, name))
}

fn take_path(fields: &mut Map<String, Value>, name: &str) -> Option<Value> {
    if let Some(value) = fields.remove(name) {
        return Some(value);
    }
    let (parent, child) = name.split_once('.')?;
    let inner = fields.get_mut(parent)?.as_object_mut()?;
    let value = take_path(inner, child)?;
    if inner.is_empty() {
        fields.remove(parent);
    }
    Some(value)
}

fn parse_ip(field: &str, value: &Value) -> Result<IpAddr, ValidationError> {
    let text = value.as_str().ok_or_else(|| {
        ValidationError::new(
            field,
            format!("expected an IP address string, got {}", json_type(value)),
        )
    })?;
    text.trim()
        .parse::<IpAddr>()
        .map_err(|_| ValidationError::new(field, format!("`{text}` is not a valid IP address")))
}

fn parse_timestamp(value: &Value) -> Result<DateTime<Utc>, ValidationError> {
    match value {
        Value::Number(number) => {
            if let Some(secs) = number.as_i64() {
                from_epoch_seconds(secs as f64)
            } else if let Some(secs) = number.as_f64() {
                from_epoch_seconds(secs)
            } else {
                Err(ValidationError::new(TIMESTAMP, "timestamp is out of range"))
            }
        }
        Value::String(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<i64>() {
                return from_epoch_seconds(secs as f64);
            }
            if let Ok(secs) = text.parse::<f64>()
                && secs.is_finite()
            {
                return from_epoch_seconds(secs);
            }
            DateTime::parse_from_rfc3339(text)
                .map(|parsed| parsed.with_timezone(&Utc))
                .map_err(|_| {
                    ValidationError::new(
                        TIMESTAMP,
                        format!("`{text}` is neither epoch seconds nor RFC 3339"),
                    )
                })
        }
        other => Err(ValidationError::new(
            TIMESTAMP,
            format!("expected epoch seconds or RFC 3339 string, got {}", json_type(other)),
        )),
    }
}

fn from_epoch_seconds(secs: f64) -> Result<DateTime<Utc>, ValidationError> {
    let millis = (secs * 1_000.0).round();
    if !millis.is_finite() || millis.abs() > i64::MAX as f64 {
        return Err(ValidationError::new(TIMESTAMP, "timestamp is out of range"));
    }
    Utc.timestamp_millis_opt(millis as i64)
        .single()
        .ok_or_else(|| ValidationError::new(TIMESTAMP, "timestamp is out of range"))
}

fn parse_category(value: &Value) -> Result<String, ValidationError> {
    let text = value.as_str().ok_or_else(|| {
        ValidationError::new(CATEGORY, format!("expected a string, got {}", json_type(value)))
    })?;
    let normalized = text.trim().to_lowercase();
    if normalized.is_empty() {
        return Err(ValidationError::new(CATEGORY, "category must not be empty"));
    }
    Ok(normalized)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
