//! Structured run log — JSON lines per scheduler run.
//!
//! When attached to a scheduler, every lifecycle event (run start/finish,
//! job queued, started, skipped, finished) is appended to a `.jsonl` file.
//! Each line is a self-contained JSON object with a timestamp, making run
//! logs easy to grep, stream, and post-process.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;

use crate::status::JobStatus;

/// A single line of the run log.
#[derive(Debug, Serialize)]
struct LogEntry {
    /// RFC 3339 timestamp.
    timestamp: String,
    #[serde(flatten)]
    event: LogEvent,
}

/// All event types that can appear in the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    /// A scheduler run started over a graph of this many vertices.
    RunStarted { vertices: usize },
    /// A job entered its queue.
    JobQueued {
        uid: String,
        queue: String,
        priority: i32,
    },
    /// A pre-resolved job was collected without being dispatched.
    JobSkipped { uid: String, status: JobStatus },
    /// A job was started on a worker.
    JobStarted {
        uid: String,
        queue: String,
        slot: usize,
        tokens: usize,
    },
    /// A job execution completed and was collected.
    JobFinished {
        uid: String,
        status: JobStatus,
        interrupted: bool,
        duration_secs: f64,
        requeued: bool,
    },
    /// The run completed.
    RunFinished {
        max_active_jobs: usize,
        duration_secs: f64,
    },
}

/// Append-only JSONL writer for scheduler runs.
#[derive(Debug)]
pub struct RunLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl RunLog {
    /// Create or append to the log file at `path`.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open run log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event. Each line is flushed so a crashed run still leaves
    /// a usable log.
    pub fn record(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            event,
        };
        let line = serde_json::to_string(&entry).context("failed to serialize log entry")?;
        let mut writer = self.writer.lock().unwrap();
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .with_context(|| format!("failed to write run log {}", self.path.display()))
    }
}
