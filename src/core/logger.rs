//! Traffic logging
//!
//! Every frame a transport sends or receives, plus case start/end markers,
//! is recorded here. The scheduler points the logger at a fresh file for
//! each test set; an in-memory ring buffer keeps the most recent entries.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Shared handle passed to transports and the scheduler
pub type TrafficLog = Arc<Mutex<TrafficLogger>>;

/// Create a shared logger with no file destination
pub fn shared() -> TrafficLog {
    Arc::new(Mutex::new(TrafficLogger::new()))
}

/// Log format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `[time] [port] DIR text-or-hex`
    #[default]
    Text,
    /// JSON lines
    JsonLines,
}

impl LogFormat {
    /// Get file extension for format
    pub fn extension(&self) -> &'static str {
        match self {
            LogFormat::Text => "log",
            LogFormat::JsonLines => "jsonl",
        }
    }
}

/// Data direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    /// Host → device
    Tx,
    /// Device → host
    Rx,
    /// Decoded diagnostic line
    Diag,
    /// Case marker or note
    Info,
}

impl Direction {
    fn tag(self) -> &'static str {
        match self {
            Direction::Tx => ">>>",
            Direction::Rx => "<<<",
            Direction::Diag => "LOG",
            Direction::Info => "##",
        }
    }
}

/// A single log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Port label (empty for markers)
    pub port: String,
    /// Direction
    pub direction: Direction,
    /// Frame bytes as hex, or text for diagnostic and info entries
    pub data: String,
}

impl LogEntry {
    /// Create new entry
    pub fn new(port: &str, direction: Direction, data: String) -> Self {
        Self {
            timestamp: Local::now(),
            port: port.to_string(),
            direction,
            data,
        }
    }

    /// Format as text
    pub fn to_text(&self) -> String {
        let time = self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f");
        if self.port.is_empty() {
            format!("[{}] {} {}", time, self.direction.tag(), self.data)
        } else {
            format!("[{}] [{}] {} {}", time, self.port, self.direction.tag(), self.data)
        }
    }

    /// Format as JSON line
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Traffic logger
pub struct TrafficLogger {
    file: Option<BufWriter<File>>,
    format: LogFormat,
    path: Option<PathBuf>,
    buffer: VecDeque<LogEntry>,
    max_buffer: usize,
    lines_logged: usize,
}

impl Default for TrafficLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficLogger {
    /// Create new logger (not logging to file yet)
    pub fn new() -> Self {
        Self {
            file: None,
            format: LogFormat::Text,
            path: None,
            buffer: VecDeque::new(),
            max_buffer: 10000,
            lines_logged: 0,
        }
    }

    /// Start logging to `path`, closing any previous destination
    pub fn start(&mut self, path: &Path, format: LogFormat) -> std::io::Result<()> {
        self.stop();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        self.file = Some(BufWriter::new(file));
        self.format = format;
        self.path = Some(path.to_path_buf());
        self.lines_logged = 0;
        Ok(())
    }

    /// Flush and detach the file destination
    pub fn stop(&mut self) {
        if let Some(ref mut file) = self.file {
            let _ = file.flush();
        }
        self.file = None;
        self.path = None;
    }

    /// Is currently logging to a file
    pub fn is_logging(&self) -> bool {
        self.file.is_some()
    }

    /// Current file destination
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record an entry
    pub fn log(&mut self, entry: LogEntry) {
        if let Some(ref mut file) = self.file {
            let line = match self.format {
                LogFormat::Text => entry.to_text(),
                LogFormat::JsonLines => entry.to_json(),
            };
            let _ = writeln!(file, "{}", line);
            self.lines_logged += 1;

            if self.lines_logged % 100 == 0 {
                let _ = file.flush();
            }
        }

        self.buffer.push_back(entry);
        while self.buffer.len() > self.max_buffer {
            self.buffer.pop_front();
        }
    }

    /// Log a frame sent to a device
    pub fn log_tx(&mut self, port: &str, frame: &[u8]) {
        self.log(LogEntry::new(port, Direction::Tx, hex::encode(frame)));
    }

    /// Log a frame received from a device
    pub fn log_rx(&mut self, port: &str, frame: &[u8]) {
        self.log(LogEntry::new(port, Direction::Rx, hex::encode(frame)));
    }

    /// Log a decoded diagnostic line
    pub fn log_diag(&mut self, port: &str, text: &str) {
        self.log(LogEntry::new(port, Direction::Diag, text.to_string()));
    }

    /// Log a marker or note
    pub fn log_info(&mut self, message: &str) {
        self.log(LogEntry::new("", Direction::Info, message.to_string()));
    }

    /// Recent entries, oldest first
    pub fn buffer(&self) -> impl Iterator<Item = &LogEntry> {
        self.buffer.iter()
    }

    /// Set max buffer size
    pub fn set_max_buffer(&mut self, size: usize) {
        self.max_buffer = size;
    }

    /// Flush to disk
    pub fn flush(&mut self) {
        if let Some(ref mut file) = self.file {
            let _ = file.flush();
        }
    }
}

impl Drop for TrafficLogger {
    fn drop(&mut self) {
        self.stop();
    }
}
