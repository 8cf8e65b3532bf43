//! # JSONL Event Sink
//!
//! The machine-readable surface of a node. Every protocol decision —
//! receives, sends, peer table churn, gossip bookkeeping, probe outcomes —
//! is appended as one JSON object per line to
//! `node-<port>-<ts>-<nodeid>.jsonl` in the configured log directory.
//! The experiment harness tails these files; stdout and the tracing
//! output are for humans only and carry no contract.
//!
//! Every record has three mandatory keys: `ts_ms` (wall clock, epoch
//! milliseconds), `event` (the record name), and `node_id`. Event-specific
//! keys are merged in flat next to them.
//!
//! The sink is shared, write-only, and append-ordered: one mutex around
//! the writer, flush after every record so a `kill -9` mid-experiment
//! loses at most the record being written. A sink failure (disk full,
//! deleted directory) must never take the node down — writes degrade to a
//! warning trace and the node keeps running.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;

/// Failed to open the sink file at startup.
#[derive(Debug, Error)]
pub enum EventSinkError {
    #[error("failed to create log directory {dir}: {source}")]
    CreateDir {
        dir: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to open log file {path}: {source}")]
    OpenFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Append-only JSONL writer for protocol events.
pub struct EventSink {
    node_id: String,
    path: Option<PathBuf>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl EventSink {
    /// Opens the sink under `log_dir`, creating the directory if needed.
    ///
    /// The file name embeds the port, the creation time (epoch seconds),
    /// and the node id, so repeated runs never collide.
    pub fn create(log_dir: &Path, port: u16, node_id: &str) -> Result<Self, EventSinkError> {
        fs::create_dir_all(log_dir).map_err(|e| EventSinkError::CreateDir {
            dir: log_dir.to_path_buf(),
            source: e,
        })?;
        let ts = chrono::Utc::now().timestamp();
        let path = log_dir.join(format!("node-{}-{}-{}.jsonl", port, ts, node_id));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| EventSinkError::OpenFile {
                path: path.clone(),
                source: e,
            })?;
        Ok(Self {
            node_id: node_id.to_string(),
            path: Some(path),
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// A sink that swallows everything. Used when `--log-dir` is not given
    /// and by unit tests that don't care about records.
    pub fn disabled(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            path: None,
            writer: Mutex::new(None),
        }
    }

    /// Path of the sink file, when one is open.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Appends one event record. `fields` must be a JSON object; its keys
    /// are merged next to the mandatory `ts_ms` / `event` / `node_id`.
    pub fn emit(&self, event: &str, fields: Value) {
        let mut guard = self.writer.lock();
        let Some(writer) = guard.as_mut() else {
            return;
        };

        let mut record = json!({
            "ts_ms": chrono::Utc::now().timestamp_millis(),
            "event": event,
            "node_id": self.node_id,
        });
        if let (Some(rec), Some(extra)) = (record.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                rec.insert(k.clone(), v.clone());
            }
        }

        let line = record.to_string();
        if writeln!(writer, "{}", line).and_then(|_| writer.flush()).is_err() {
            tracing::warn!(event, "event sink write failed, record dropped");
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("node_id", &self.node_id)
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_records(sink: &EventSink) -> Vec<Value> {
        let content = fs::read_to_string(sink.path().unwrap()).unwrap();
        content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn records_carry_mandatory_keys() {
        let dir = tempfile::tempdir().unwrap();
        let sink = EventSink::create(dir.path(), 5001, "node-a").unwrap();
        sink.emit("peer_add", json!({"addr": "127.0.0.1:5002"}));

        let records = read_records(&sink);
        assert_eq!(records.len(), 1);
        let rec = &records[0];
        assert_eq!(rec["event"], "peer_add");
        assert_eq!(rec["node_id"], "node-a");
        assert_eq!(rec["addr"], "127.0.0.1:5002");
        assert!(rec["ts_ms"].as_i64().unwrap() > 0);
    }

    #[test]
    fn records_are_append_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let sink = EventSink::create(dir.path(), 5001, "node-a").unwrap();
        for i in 0..5 {
            sink.emit("ping_sent", json!({"seq": i}));
        }
        let records = read_records(&sink);
        let seqs: Vec<i64> = records.iter().map(|r| r["seq"].as_i64().unwrap()).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn file_name_embeds_port_and_node_id() {
        let dir = tempfile::tempdir().unwrap();
        let sink = EventSink::create(dir.path(), 6100, "abcd").unwrap();
        let name = sink.path().unwrap().file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("node-6100-"));
        assert!(name.ends_with("-abcd.jsonl"));
    }

    #[test]
    fn disabled_sink_swallows_silently() {
        let sink = EventSink::disabled("node-a");
        sink.emit("send_ok", json!({"target": "127.0.0.1:5002"}));
        assert!(sink.path().is_none());
    }
}
