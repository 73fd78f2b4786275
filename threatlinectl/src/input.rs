//! Record sources for `ingest` and `canonical-id`.

use std::path::Path;

use anyhow::{Context, bail};
use clap::ValueEnum;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Map, Number, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum InputFormat {
    /// A single JSON array of objects (or one object).
    Json,
    /// One JSON object per line.
    Jsonl,
    /// Header row plus one record per row.
    Csv,
}

impl InputFormat {
    pub fn detect(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(InputFormat::Json),
            "jsonl" | "ndjson" => Some(InputFormat::Jsonl),
            "csv" => Some(InputFormat::Csv),
            _ => None,
        }
    }
}

/// Opens `path` as a stream of raw records. Lines or rows that cannot be
/// decoded are yielded as `null` so the validator rejects them and the
/// summary still accounts for them.
pub async fn open(
    path: &Path,
    format: Option<InputFormat>,
) -> anyhow::Result<BoxStream<'static, Value>> {
    let format = match format.or_else(|| InputFormat::detect(path)) {
        Some(format) => format,
        None => bail!(
            "cannot infer the input format of {}; pass --format",
            path.display()
        ),
    };

    match format {
        InputFormat::Json => read_json(path).await,
        InputFormat::Jsonl => read_jsonl(path).await,
        InputFormat::Csv => read_csv(path).await,
    }
}

async fn read_json(path: &Path) -> anyhow::Result<BoxStream<'static, Value>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let parsed: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    let records = match parsed {
        Value::Array(items) => items,
        object @ Value::Object(_) => vec![object],
        other => bail!(
            "{} must hold an array of records, found {}",
            path.display(),
            type_name(&other)
        ),
    };
    Ok(stream::iter(records).boxed())
}

async fn read_jsonl(path: &Path) -> anyhow::Result<BoxStream<'static, Value>> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let origin = path.display().to_string();
    let mut lines = BufReader::new(file).lines();

    let records = async_stream::stream! {
        let mut line_no = 0u64;
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<Value>(&line) {
                        Ok(value) => yield value,
                        Err(err) => {
                            warn!(
                                target: "threatline::input",
                                file = %origin,
                                line = line_no,
                                error = %err,
                                "undecodable line"
                            );
                            yield Value::Null;
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(
                        target: "threatline::input",
                        file = %origin,
                        line = line_no,
                        error = %err,
                        "read failed; stopping input"
                    );
                    break;
                }
            }
        }
    };
    Ok(records.boxed())
}

async fn read_csv(path: &Path) -> anyhow::Result<BoxStream<'static, Value>> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(bytes.as_slice());
    let headers = reader
        .headers()
        .with_context(|| format!("{} has no header row", path.display()))?
        .clone();

    let mut records = Vec::new();
    for (row, result) in reader.records().enumerate() {
        match result {
            Ok(cells) => {
                let mut object = Map::new();
                for (name, cell) in headers.iter().zip(cells.iter()) {
                    if let Some(value) = cell_value(cell) {
                        object.insert(name.to_string(), value);
                    }
                }
                records.push(Value::Object(object));
            }
            Err(err) => {
                warn!(
                    target: "threatline::input",
                    file = %path.display(),
                    row = row + 1,
                    error = %err,
                    "undecodable row"
                );
                records.push(Value::Null);
            }
        }
    }
    Ok(stream::iter(records).boxed())
}

/// Empty cells are absent; integers, floats and booleans are typed.
fn cell_value(cell: &str) -> Option<Value> {
    if cell.is_empty() {
        return None;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Some(Value::from(int));
    }
    if let Ok(float) = cell.parse::<f64>()
        && let Some(number) = Number::from_f64(float)
    {
        return Some(Value::Number(number));
    }
    match cell {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        _ => Some(Value::String(cell.to_string())),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
