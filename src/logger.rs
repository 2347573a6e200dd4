use std::fs::{File, OpenOptions};
use std::io::Write;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::warn;

/// How much of each message the NDJSON capture keeps.
pub enum MessageLogMode {
    /// Raw frames / envelope bodies included.
    Full,
    /// Direction, kind and sizes only.
    Summary,
}

pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: &str) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { mode, file })
    }

    /// One outbound binary request.
    pub fn log_frame_sent(&mut self, kind: &str, frame: &[u8]) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "req",
            "kind": kind,
            "len": frame.len(),
        });
        if matches!(self.mode, MessageLogMode::Full) {
            entry["frame"] = json!(hex::encode(frame));
        }
        self.write_line(&entry);
    }

    /// One inbound binary frame; `decoded` names the payload type or is
    /// `None` when the frame decoded to no message.
    pub fn log_frame_received(&mut self, decoded: Option<&str>, frame: &[u8]) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "res",
            "decoded": decoded,
            "len": frame.len(),
        });
        if matches!(self.mode, MessageLogMode::Full) {
            entry["frame"] = json!(hex::encode(frame));
        }
        self.write_line(&entry);
    }

    /// One outbound cloud envelope.
    pub fn log_publish(&mut self, topic: &str, session_id: &str, body: &Value) {
        let mut entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "pub",
            "topic": topic,
            "session": session_id,
        });
        if matches!(self.mode, MessageLogMode::Full) {
            entry["body"] = body.clone();
        }
        self.write_line(&entry);
    }

    /// One inbound cloud publish.
    pub fn log_incoming(&mut self, topic: &str, session_id: Option<&str>, len: usize) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "sub",
            "topic": topic,
            "session": session_id,
            "len": len,
        });
        self.write_line(&entry);
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}
