//! Append-only audit trail of authorization decisions, recorded as JSONL so
//! entries can be inspected with tools such as:
//!
//! ```ignore
//! $ jq -C . ~/.openclaw/conductor-audit.jsonl
//! ```

use std::io::Error as IoError;

use serde_json::Value as JsonValue;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::{self};

/// Records audit events for a conductor instance and flushes them to disk
/// after every write. A disabled recorder is a no-op handle so call sites
/// never need to branch on the `audit_log` setting.
#[derive(Clone)]
pub(crate) struct AuditRecorder {
    tx: Option<Sender<String>>,
}

const TS_FORMAT: &[FormatItem] = format_description!(
    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z"
);

impl AuditRecorder {
    /// Open the audit file for appending and spawn the writer task that owns
    /// the handle. Errors are returned so the caller can decide whether to
    /// run without persistence.
    pub(crate) fn new(path: &std::path::Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;

        // A reasonably-sized bounded channel. If the buffer fills up the send
        // future will yield, which is fine; we only need to ensure we never
        // perform blocking I/O on the orchestrator's task.
        let (tx, mut rx) = mpsc::channel::<String>(256);

        tokio::task::spawn(async move {
            let mut file = tokio::fs::File::from_std(file);

            while let Some(line) = rx.recv().await {
                if let Err(e) = file.write_all(line.as_bytes()).await {
                    tracing::warn!("audit writer: failed to write line: {e}");
                    break;
                }
                if let Err(e) = file.write_all(b"\n").await {
                    tracing::warn!("audit writer: failed to write newline: {e}");
                    break;
                }
                if let Err(e) = file.flush().await {
                    tracing::warn!("audit writer: failed to flush: {e}");
                    break;
                }
            }
        });

        Ok(Self { tx: Some(tx) })
    }

    pub(crate) fn disabled() -> Self {
        Self { tx: None }
    }

    /// Append one `{"event", "ts", ...payload}` record. Failures are logged
    /// and swallowed; auditing never interferes with the request lifecycle.
    pub(crate) async fn record(&self, event: &str, payload: JsonValue) {
        let Some(tx) = &self.tx else {
            return;
        };
        let line = match format_line(event, payload) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("audit: failed to serialize `{event}` record: {e}");
                return;
            }
        };
        if tx.send(line).await.is_err() {
            tracing::warn!("audit: writer task is gone; dropping `{event}` record");
        }
    }
}

fn format_line(event: &str, payload: JsonValue) -> std::io::Result<String> {
    let ts = OffsetDateTime::now_utc()
        .format(TS_FORMAT)
        .map_err(|e| IoError::other(format!("failed to format timestamp: {e}")))?;

    let mut record = serde_json::Map::new();
    record.insert("event".to_string(), JsonValue::String(event.to_string()));
    record.insert("ts".to_string(), JsonValue::String(ts));
    if let JsonValue::Object(payload) = payload {
        for (key, value) in payload {
            record.entry(key).or_insert(value);
        }
    }
    serde_json::to_string(&JsonValue::Object(record)).map_err(IoError::other)
}
