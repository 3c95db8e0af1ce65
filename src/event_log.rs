//! Session event log.
//!
//! Keeps a bounded in-memory tail for display and appends every entry to a
//! per-session file under the data directory.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::calibration::AlignmentEvent;
use crate::machine::format_coord;
use crate::settings::AppSettings;

const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Log level enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Status,
    Result,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Status => "STATUS",
            LogLevel::Result => "RESULT",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// A single log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Local::now(),
            level,
            message: message.into(),
        }
    }

    /// Convert a run event into an entry. Preview frames are not logged.
    pub fn from_event(event: &AlignmentEvent) -> Self {
        match event {
            AlignmentEvent::Status(text) => Self::new(LogLevel::Status, text.clone()),
            AlignmentEvent::Message(text) if is_warning(text) => Self::new(LogLevel::Warning, text.clone()),
            AlignmentEvent::Message(text) => Self::new(LogLevel::Info, text.clone()),
            AlignmentEvent::Result(r) => Self::new(
                LogLevel::Result,
                format!(
                    "T{} cycle {}: X{} Y{} (mpp {}, {:.1}s)",
                    r.tool,
                    r.cycle + 1,
                    format_coord(r.x),
                    format_coord(r.y),
                    r.mpp,
                    r.elapsed_secs
                ),
            ),
            AlignmentEvent::Complete { run_id, trials } => Self::new(
                LogLevel::Info,
                format!("Run {} finished with {} trials", run_id, trials),
            ),
        }
    }

    /// Format the log entry for display.
    pub fn format_display(&self) -> String {
        format!(
            "[{}] {:<6} {}",
            self.timestamp.format("%H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }

    /// Format the log entry for file storage.
    pub fn format_file(&self) -> String {
        format!(
            "[{}] [{}] {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.level.as_str(),
            self.message
        )
    }
}

fn is_warning(text: &str) -> bool {
    text.starts_with("No circles") || text.starts_with("Too many circles")
}

/// Log of one alignment session, in memory and on disk.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    max_entries: usize,
    log_file: Option<PathBuf>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLog {
    /// Log to a new session file in the platform logs directory. Falls back
    /// to memory only when the directory is unavailable.
    pub fn new() -> Self {
        let log_file = AppSettings::logs_dir().and_then(|dir| match Self::create_log_file(&dir) {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "session log disabled");
                None
            }
        });
        Self::with_file(log_file)
    }

    /// Log to a new session file in `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> io::Result<Self> {
        Ok(Self::with_file(Some(Self::create_log_file(dir.as_ref())?)))
    }

    pub fn in_memory() -> Self {
        Self::with_file(None)
    }

    fn with_file(log_file: Option<PathBuf>) -> Self {
        Self {
            entries: VecDeque::new(),
            max_entries: DEFAULT_MAX_ENTRIES,
            log_file,
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    fn create_log_file(dir: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let timestamp = Local::now().format("%Y%m%d_%H%M%S");
        let path = dir.join(format!("session_{}.log", timestamp));
        File::create(&path)?;
        Ok(path)
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.push(LogEntry::new(level, message));
    }

    pub fn record(&mut self, event: &AlignmentEvent) {
        self.push(LogEntry::from_event(event));
    }

    fn push(&mut self, entry: LogEntry) {
        if let Some(path) = &self.log_file {
            let written = OpenOptions::new()
                .append(true)
                .open(path)
                .and_then(|mut file| writeln!(file, "{}", entry.format_file()));
            if let Err(e) = written {
                tracing::warn!(path = %path.display(), error = %e, "failed to append to session log");
            }
        }

        self.entries.push_back(entry);
        while self.entries.len() > self.max_entries {
            self.entries.pop_front();
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message);
    }

    pub fn warning(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message);
    }

    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> + '_ {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn log_file_path(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    pub fn format_all(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.format_display())
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Session logs in `dir`, oldest first.
    pub fn list_log_files(dir: impl AsRef<Path>) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(|e| e.ok())
                    .map(|e| e.path())
                    .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
                    .collect()
            })
            .unwrap_or_default();
        files.sort();
        files
    }

    pub fn read_log_file(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
        let reader = BufReader::new(File::open(path)?);
        Ok(reader.lines().map_while(Result::ok).collect())
    }
}
