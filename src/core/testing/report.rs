//! Result sinks
//!
//! The scheduler attaches a [`Reporter`] for the length of a run; cases emit
//! result rows through it and every attached sink receives each row.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::case::CaseResult;

/// Destination of result rows
#[cfg_attr(test, mockall::automock)]
pub trait ResultSink: Send {
    /// Record one row
    fn emit(&mut self, result: &CaseResult) -> std::io::Result<()>;

    /// Flush and release the destination
    fn close(&mut self) -> std::io::Result<()>;
}

/// Fan-out over attached sinks, shared by the cases of a run
#[derive(Clone, Default)]
pub struct Reporter {
    sinks: Arc<Mutex<Vec<Box<dyn ResultSink>>>>,
}

impl std::fmt::Debug for Reporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reporter").field("sinks", &self.sinks.lock().len()).finish()
    }
}

impl Reporter {
    /// Reporter with no sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a sink
    pub fn attach(&self, sink: Box<dyn ResultSink>) {
        self.sinks.lock().push(sink);
    }

    /// Number of attached sinks
    pub fn len(&self) -> usize {
        self.sinks.lock().len()
    }

    /// Whether no sink is attached
    pub fn is_empty(&self) -> bool {
        self.sinks.lock().is_empty()
    }

    /// Send a row to every sink; sink failures are logged, not raised
    pub fn emit(&self, result: &CaseResult) {
        tracing::info!(
            set = %result.set,
            no = %result.no,
            result = %result.result,
            msg = result.msg.as_deref().unwrap_or(""),
            "Case result"
        );
        for sink in self.sinks.lock().iter_mut() {
            if let Err(e) = sink.emit(result) {
                tracing::warn!(error = %e, "Result sink write failed");
            }
        }
    }

    /// Close and detach every sink
    pub fn close(&self) {
        let sinks: Vec<Box<dyn ResultSink>> = std::mem::take(&mut *self.sinks.lock());
        for mut sink in sinks {
            if let Err(e) = sink.close() {
                tracing::warn!(error = %e, "Result sink close failed");
            }
        }
    }
}

/// One JSON object per line
pub struct JsonLinesSink {
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Append to `path`, creating parent directories
    pub fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(BufWriter::new(file)),
        })
    }

    /// Destination path
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ResultSink for JsonLinesSink {
    fn emit(&mut self, result: &CaseResult) -> std::io::Result<()> {
        let Some(file) = self.file.as_mut() else {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "sink closed"));
        };
        let line = serde_json::to_string(result)?;
        writeln!(file, "{}", line)
    }

    fn close(&mut self) -> std::io::Result<()> {
        match self.file.take() {
            Some(mut file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Keeps rows in memory; clones share the same rows
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<CaseResult>>>,
    closed: Arc<Mutex<bool>>,
}

impl MemorySink {
    /// Empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows received so far
    pub fn rows(&self) -> Vec<CaseResult> {
        self.rows.lock().clone()
    }

    /// Whether `close` was called
    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl ResultSink for MemorySink {
    fn emit(&mut self, result: &CaseResult) -> std::io::Result<()> {
        self.rows.lock().push(result.clone());
        Ok(())
    }

    fn close(&mut self) -> std::io::Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}
