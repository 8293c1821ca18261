//! Streaming parser for the tap line protocol.
//!
//! A running tap writes one JSON object per line to stdout:
//!
//! ```text
//! {"type":"SCHEMA","stream":"users","schema":{"properties":{...}},"key_properties":["id"]}
//! {"type":"RECORD","stream":"users","record":{"id":1}}
//! {"type":"STATE","value":{"bookmarks":{...}}}
//! ```
//!
//! Lines are consumed in arrival order. Any malformed line, an unknown
//! message type, or a RECORD for a stream whose SCHEMA has not been seen
//! aborts the whole parse with [`SyncError::Protocol`].

use super::inference::infer_fields;
use anyhow::{Context, Result};
use intake::{BatchHeader, Record, SyncError};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Longest accepted protocol line, in bytes (newline excluded).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// How much of an offending line is quoted in error messages.
const LINE_PREVIEW_CHARS: usize = 512;

/// Parsed output of one stream: canonical header, key columns and buffered records.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamRepresentation {
    pub batch_header: BatchHeader,
    pub key_fields: Vec<String>,
    pub objects: Vec<Record>,
}

impl StreamRepresentation {
    pub fn table_name(&self) -> &str {
        &self.batch_header.table_name
    }
}

/// Everything a tap run produced: last checkpoint plus per-stream results.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputRepresentation {
    pub state: Option<Value>,
    pub streams: HashMap<String, StreamRepresentation>,
}

impl OutputRepresentation {
    pub fn record_count(&self) -> usize {
        self.streams.values().map(|s| s.objects.len()).sum()
    }
}

#[derive(Deserialize)]
struct SchemaMessage {
    stream: String,
    schema: SchemaBody,
    #[serde(default)]
    key_properties: Vec<String>,
}

#[derive(Deserialize)]
struct SchemaBody {
    #[serde(default)]
    properties: Map<String, Value>,
}

/// Consumes `reader` to EOF and materializes the tap's output in memory.
pub async fn parse_output<R>(reader: R) -> Result<OutputRepresentation>
where
    R: AsyncBufRead + Unpin,
{
    let mut reader = reader;
    let mut output = OutputRepresentation::default();
    let mut line = Vec::with_capacity(64 * 1024);

    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 2)
            .read_until(b'\n', &mut line)
            .await
            .context("Failed to read tap output")?;
        if read == 0 {
            break;
        }

        let terminated = line.last() == Some(&b'\n');
        if terminated {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }
        if line.len() > MAX_LINE_BYTES {
            return Err(SyncError::Protocol(format!(
                "tap output line exceeds {} bytes: {}",
                MAX_LINE_BYTES,
                preview(&line)
            ))
            .into());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            return Err(SyncError::Protocol(format!(
                "blank line in tap output after {} records",
                output.record_count()
            ))
            .into());
        }

        parse_line(&line, &mut output)?;
    }

    Ok(output)
}

fn parse_line(line: &[u8], output: &mut OutputRepresentation) -> Result<()> {
    let message: Value = serde_json::from_slice(line).map_err(|e| {
        SyncError::Protocol(format!(
            "error unmarshalling tap output line {} into json: {}",
            preview(line),
            e
        ))
    })?;

    let message_type = match message.get("type").and_then(Value::as_str) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => {
            return Err(SyncError::Protocol(format!(
                "error getting 'type' field from tap output line: {}",
                preview(line)
            ))
            .into())
        }
    };

    match message_type.as_str() {
        "SCHEMA" => {
            let stream = parse_schema(message).map_err(|e| {
                SyncError::Protocol(format!("error parsing schema line {}: {}", preview(line), e))
            })?;
            // Records buffered under an earlier schema are kept as-is.
            match output.streams.get_mut(stream.table_name()) {
                Some(existing) => {
                    existing.batch_header = stream.batch_header;
                    existing.key_fields = stream.key_fields;
                }
                None => {
                    output
                        .streams
                        .insert(stream.table_name().to_string(), stream);
                }
            }
        }
        "STATE" => {
            let mut message = message;
            let state = message
                .as_object_mut()
                .and_then(|m| m.remove("value"))
                .ok_or_else(|| {
                    SyncError::Protocol(format!(
                        "malformed state line {}: 'value' doesn't exist",
                        preview(line)
                    ))
                })?;
            output.state = Some(state);
        }
        "RECORD" => {
            let (stream_name, record) = parse_record(message).map_err(|e| {
                SyncError::Protocol(format!("error parsing record line {}: {}", preview(line), e))
            })?;
            let stream = output.streams.get_mut(&stream_name).ok_or_else(|| {
                SyncError::Protocol(format!(
                    "record for stream [{}] arrived before its schema: {}",
                    stream_name,
                    preview(line)
                ))
            })?;
            stream.objects.push(record);
        }
        other => {
            return Err(SyncError::Protocol(format!(
                "unknown output line type [{}]: {}",
                other,
                preview(line)
            ))
            .into())
        }
    }

    Ok(())
}

fn parse_schema(message: Value) -> std::result::Result<StreamRepresentation, String> {
    let schema: SchemaMessage = serde_json::from_value(message).map_err(|e| e.to_string())?;
    Ok(StreamRepresentation {
        batch_header: BatchHeader::new(schema.stream, infer_fields(&schema.schema.properties)),
        key_fields: schema.key_properties,
        objects: Vec::new(),
    })
}

fn parse_record(message: Value) -> std::result::Result<(String, Record), String> {
    let Value::Object(mut message) = message else {
        return Err("line must be a json object".to_string());
    };
    let stream = match message.remove("stream") {
        Some(Value::String(s)) => s,
        Some(_) => return Err("'stream' must be a string".to_string()),
        None => return Err("'stream' doesn't exist".to_string()),
    };
    match message.remove("record") {
        Some(Value::Object(record)) => Ok((stream, record)),
        Some(_) => Err("'record' must be a json object".to_string()),
        None => Err("'record' doesn't exist".to_string()),
    }
}

fn preview(line: &[u8]) -> String {
    let text = String::from_utf8_lossy(line);
    if text.chars().count() <= LINE_PREVIEW_CHARS {
        return text.into_owned();
    }
    let mut cut: String = text.chars().take(LINE_PREVIEW_CHARS).collect();
    cut.push_str("...");
    cut
}
