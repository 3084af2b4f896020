//! Tier-2 source: the agent's append-only JSONL transcript.

use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use turnwatch_protocol::Actor;

use crate::db::{parse_ts, EntityRecord};

/// Upper bound on bytes consumed from one transcript in one pass.
const MAX_READ_BYTES: u64 = 8 * 1024 * 1024;
const SCAN_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub actor: Actor,
    pub text: String,
    pub event_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptBatch {
    pub entries: Vec<LogEntry>,
    /// Where the next read starts. Only complete lines are consumed.
    pub next_offset: u64,
}

pub trait TranscriptSource: Send + Sync {
    /// Entries written after byte `offset` of the entity's transcript.
    fn read_since(&self, entity: &EntityRecord, offset: u64) -> Result<TranscriptBatch, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonlTranscriptSource;

impl TranscriptSource for JsonlTranscriptSource {
    fn read_since(&self, entity: &EntityRecord, offset: u64) -> Result<TranscriptBatch, String> {
        let Some(path) = entity.transcript_path.as_deref() else {
            return Ok(TranscriptBatch {
                entries: Vec::new(),
                next_offset: offset,
            });
        };
        read_jsonl(Path::new(path), offset)
    }
}

pub fn read_jsonl(path: &Path, offset: u64) -> Result<TranscriptBatch, String> {
    read_jsonl_capped(path, offset, MAX_READ_BYTES)
}

fn read_jsonl_capped(path: &Path, offset: u64, cap: u64) -> Result<TranscriptBatch, String> {
    let mut file = match fs_err::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok(TranscriptBatch {
                entries: Vec::new(),
                next_offset: offset,
            });
        }
        Err(err) => return Err(format!("Failed to open transcript: {}", err)),
    };

    let len = file
        .metadata()
        .map_err(|err| format!("Failed to stat transcript: {}", err))?
        .len();
    // A shorter file than our cursor means it was rewritten.
    let mut start = if len < offset {
        warn!(
            path = %path.display(),
            offset,
            len,
            "Transcript shrank below cursor; rereading from start"
        );
        0
    } else {
        offset
    };

    let mut buf = Vec::new();
    let last_newline = loop {
        file.seek(SeekFrom::Start(start))
            .map_err(|err| format!("Failed to seek transcript: {}", err))?;
        buf.clear();
        file.by_ref()
            .take(cap)
            .read_to_end(&mut buf)
            .map_err(|err| format!("Failed to read transcript: {}", err))?;

        if let Some(last_newline) = buf.iter().rposition(|byte| *byte == b'\n') {
            break last_newline;
        }
        if (buf.len() as u64) < cap {
            // Only a partial line so far.
            return Ok(TranscriptBatch {
                entries: Vec::new(),
                next_offset: start,
            });
        }

        // One line fills the whole read budget. Skip it once it is complete so
        // the lines after it still get read.
        match next_newline(&mut file)? {
            Some(line_end) => {
                warn!(
                    path = %path.display(),
                    offset = start,
                    skipped_bytes = line_end + 1 - start,
                    "Skipping oversized transcript line"
                );
                start = line_end + 1;
            }
            None => {
                return Ok(TranscriptBatch {
                    entries: Vec::new(),
                    next_offset: start,
                })
            }
        }
    };
    let complete = &buf[..=last_newline];

    let mut entries = Vec::new();
    for line in String::from_utf8_lossy(complete).lines() {
        if let Some(entry) = parse_line(line) {
            entries.push(entry);
        }
    }

    Ok(TranscriptBatch {
        entries,
        next_offset: start + complete.len() as u64,
    })
}

/// Offset of the next newline at or after the file's current position.
fn next_newline(file: &mut fs_err::File) -> Result<Option<u64>, String> {
    let mut position = file
        .stream_position()
        .map_err(|err| format!("Failed to locate transcript position: {}", err))?;
    let mut chunk = [0u8; SCAN_CHUNK_BYTES];
    loop {
        let read = file
            .read(&mut chunk)
            .map_err(|err| format!("Failed to scan transcript: {}", err))?;
        if read == 0 {
            return Ok(None);
        }
        if let Some(index) = chunk[..read].iter().position(|byte| *byte == b'\n') {
            return Ok(Some(position + index as u64));
        }
        position += read as u64;
    }
}

#[derive(Deserialize)]
struct RawLine {
    #[serde(rename = "type")]
    kind: String,
    timestamp: Option<String>,
    message: Option<RawMessage>,
}

#[derive(Deserialize)]
struct RawMessage {
    #[serde(default)]
    content: Value,
}

fn parse_line(line: &str) -> Option<LogEntry> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let raw: RawLine = serde_json::from_str(line).ok()?;
    let actor = match raw.kind.as_str() {
        "user" => Actor::User,
        "assistant" => Actor::Agent,
        _ => return None,
    };
    let event_time = parse_ts(raw.timestamp.as_deref()?)?;
    let text = message_text(&raw.message?.content)?;
    Some(LogEntry {
        actor,
        text,
        event_time,
    })
}

fn message_text(content: &Value) -> Option<String> {
    let text = match content {
        Value::String(text) => text.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => return None,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .expect("open");
        file.write_all(content.as_bytes()).expect("write");
    }

    #[test]
    fn parses_string_and_block_content() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        write(
            &path,
            concat!(
                r#"{"type":"user","timestamp":"2026-01-01T10:00:00Z","message":{"content":"fix the build"}}"#,
                "\n",
                r#"{"type":"assistant","timestamp":"2026-01-01T10:00:05Z","message":{"content":[{"type":"text","text":"On it."},{"type":"tool_use","name":"Bash"}]}}"#,
                "\n",
            ),
        );

        let batch = read_jsonl(&path, 0).expect("read");
        assert_eq!(batch.entries.len(), 2);
        assert_eq!(batch.entries[0].actor, Actor::User);
        assert_eq!(batch.entries[0].text, "fix the build");
        assert_eq!(batch.entries[1].actor, Actor::Agent);
        assert_eq!(batch.entries[1].text, "On it.");
        assert_eq!(
            batch.entries[1].event_time,
            parse_ts("2026-01-01T10:00:05Z").expect("ts")
        );
    }

    #[test]
    fn skips_other_lines_and_textless_messages() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        write(
            &path,
            concat!(
                r#"{"type":"summary","summary":"x"}"#,
                "\n",
                "not json\n",
                r#"{"type":"user","timestamp":"2026-01-01T10:00:00Z","message":{"content":[{"type":"tool_result","content":"ok"}]}}"#,
                "\n",
                r#"{"type":"assistant","message":{"content":"no timestamp"}}"#,
                "\n",
            ),
        );

        let batch = read_jsonl(&path, 0).expect("read");
        assert!(batch.entries.is_empty());
        assert_eq!(batch.next_offset, std::fs::metadata(&path).expect("meta").len());
    }

    #[test]
    fn leaves_partial_trailing_line_for_next_pass() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        let first = concat!(
            r#"{"type":"user","timestamp":"2026-01-01T10:00:00Z","message":{"content":"one"}}"#,
            "\n"
        );
        write(&path, first);
        write(&path, r#"{"type":"user","timestamp":"2026-01-01T10:00:01Z","#);

        let batch = read_jsonl(&path, 0).expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.next_offset, first.len() as u64);

        write(&path, "\"message\":{\"content\":\"two\"}}\n");
        let batch = read_jsonl(&path, batch.next_offset).expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].text, "two");
    }

    #[test]
    fn oversized_line_is_skipped_once_complete() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        let huge = format!(
            r#"{{"type":"assistant","timestamp":"2026-01-01T10:00:00Z","message":{{"content":"{}"}}}}"#,
            "x".repeat(200)
        );
        write(&path, &huge);

        // Still being written: nothing to skip yet.
        let batch = read_jsonl_capped(&path, 0, 64).expect("read");
        assert!(batch.entries.is_empty());
        assert_eq!(batch.next_offset, 0);

        write(&path, "\n");
        let after = concat!(
            r#"{"type":"user","timestamp":"2026-01-01T10:00:09Z","message":{"content":"next"}}"#,
            "\n"
        );
        write(&path, after);
        let len = std::fs::metadata(&path).expect("meta").len();

        let batch = read_jsonl_capped(&path, 0, 128).expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].text, "next");
        assert_eq!(batch.next_offset, len);
    }

    #[test]
    fn line_past_the_read_budget_does_not_stall_the_cursor() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        let huge = format!(
            r#"{{"type":"assistant","timestamp":"2026-01-01T10:00:00Z","message":{{"content":"{}"}}}}"#,
            "y".repeat(MAX_READ_BYTES as usize + 1024)
        );
        write(&path, &huge);
        write(&path, "\n");
        write(
            &path,
            concat!(
                r#"{"type":"user","timestamp":"2026-01-01T10:00:09Z","message":{"content":"after"}}"#,
                "\n"
            ),
        );

        let batch = read_jsonl(&path, 0).expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].actor, Actor::User);
        assert_eq!(
            batch.next_offset,
            std::fs::metadata(&path).expect("meta").len()
        );
    }

    #[test]
    fn missing_file_is_empty() {
        let dir = tempdir().expect("tempdir");
        let batch = read_jsonl(&dir.path().join("absent.jsonl"), 42).expect("read");
        assert!(batch.entries.is_empty());
        assert_eq!(batch.next_offset, 42);
    }

    #[test]
    fn truncated_file_is_reread_from_start() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("t.jsonl");
        write(
            &path,
            concat!(
                r#"{"type":"user","timestamp":"2026-01-01T10:00:00Z","message":{"content":"fresh"}}"#,
                "\n"
            ),
        );
        let batch = read_jsonl(&path, 10_000).expect("read");
        assert_eq!(batch.entries.len(), 1);
        assert_eq!(batch.entries[0].text, "fresh");
    }
}
