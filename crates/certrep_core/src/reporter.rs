//! Node status file.
//!
//! The reporter is a pure observer: it records the node status and recent
//! error/warning log lines into a JSON file that external tooling polls.
//! Every update rewrites the whole file through a temp file and an atomic
//! rename, so readers never see a partial document.

use crate::error::ReplResult;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of errors and warnings kept in the file.
pub const MAX_LOG_MESSAGES: usize = 4;

/// Severity of a reported log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Warning.
    Warning,
    /// Error.
    Error,
}

/// Progress of a long-running status (state transfer, recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Progress {
    /// Units done.
    pub done: u64,
    /// Units in total; zero when unknown.
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct LogEntry {
    timestamp: f64,
    msg: String,
}

#[derive(Debug, Clone, Serialize)]
struct StatusEntry {
    state: String,
    comment: String,
    progress: Progress,
}

#[derive(Debug, Clone, Serialize)]
struct Document<'a> {
    timestamp: f64,
    errors: &'a VecDeque<LogEntry>,
    warnings: &'a VecDeque<LogEntry>,
    status: &'a StatusEntry,
}

#[derive(Debug)]
struct ReporterInner {
    errors: VecDeque<LogEntry>,
    warnings: VecDeque<LogEntry>,
    status: StatusEntry,
}

/// Writes node status updates to a JSON file.
#[derive(Debug)]
pub struct StatusReporter {
    path: PathBuf,
    temp_path: PathBuf,
    inner: Mutex<ReporterInner>,
}

impl StatusReporter {
    /// Creates a reporter writing to `path` and writes the initial
    /// `disconnected` status.
    pub fn new(path: impl Into<PathBuf>) -> ReplResult<Self> {
        let path = path.into();
        let mut temp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        temp_name.push(".tmp");
        let temp_path = path.with_file_name(temp_name);
        let reporter = Self {
            path,
            temp_path,
            inner: Mutex::new(ReporterInner {
                errors: VecDeque::with_capacity(MAX_LOG_MESSAGES),
                warnings: VecDeque::with_capacity(MAX_LOG_MESSAGES),
                status: StatusEntry {
                    state: "disconnected".to_string(),
                    comment: "disconnected".to_string(),
                    progress: Progress::default(),
                },
            }),
        };
        reporter.write(&reporter.inner.lock())?;
        Ok(reporter)
    }

    /// Returns the status file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records a new node status.
    pub fn report_state(
        &self,
        state: &str,
        comment: &str,
        progress: Progress,
    ) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        inner.status = StatusEntry {
            state: state.to_string(),
            comment: comment.to_string(),
            progress,
        };
        self.write(&inner)
    }

    /// Records a log message; only the latest few of each level are kept.
    pub fn report_log_msg(&self, level: LogLevel, msg: &str) -> ReplResult<()> {
        let mut inner = self.inner.lock();
        let queue = match level {
            LogLevel::Error => &mut inner.errors,
            LogLevel::Warning => &mut inner.warnings,
        };
        if queue.len() == MAX_LOG_MESSAGES {
            queue.pop_front();
        }
        queue.push_back(LogEntry {
            timestamp: now(),
            msg: msg.to_string(),
        });
        self.write(&inner)
    }

    fn write(&self, inner: &ReporterInner) -> ReplResult<()> {
        let document = Document {
            timestamp: now(),
            errors: &inner.errors,
            warnings: &inner.warnings,
            status: &inner.status,
        };
        let data = serde_json::to_vec_pretty(&document)?;

        let mut file = File::create(&self.temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.temp_path, &self.path)?;
        Ok(())
    }
}

fn now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn read(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&fs::read(path).unwrap()).unwrap()
    }

    #[test]
    fn initial_status_is_disconnected() {
        let dir = tempdir().unwrap();
        let reporter = StatusReporter::new(dir.path().join("status.json")).unwrap();
        let doc = read(reporter.path());
        assert_eq!(doc["status"]["state"], "disconnected");
        assert!(doc["errors"].as_array().unwrap().is_empty());
    }

    #[test]
    fn state_update_replaces_file() {
        let dir = tempdir().unwrap();
        let reporter = StatusReporter::new(dir.path().join("status.json")).unwrap();
        reporter
            .report_state("joiner", "receiving state", Progress { done: 3, total: 10 })
            .unwrap();

        let doc = read(reporter.path());
        assert_eq!(doc["status"]["state"], "joiner");
        assert_eq!(doc["status"]["comment"], "receiving state");
        assert_eq!(doc["status"]["progress"]["done"], 3);
        assert!(!dir.path().join("status.json.tmp").exists());
    }

    #[test]
    fn keeps_latest_messages_per_level() {
        let dir = tempdir().unwrap();
        let reporter = StatusReporter::new(dir.path().join("status.json")).unwrap();
        for i in 0..6 {
            reporter
                .report_log_msg(LogLevel::Error, &format!("error {i}"))
                .unwrap();
        }
        reporter.report_log_msg(LogLevel::Warning, "careful").unwrap();

        let doc = read(reporter.path());
        let errors: Vec<_> = doc["errors"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["msg"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(errors, vec!["error 2", "error 3", "error 4", "error 5"]);
        assert_eq!(doc["warnings"][0]["msg"], "careful");
    }
}
