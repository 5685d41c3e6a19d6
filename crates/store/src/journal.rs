use chrono::{DateTime, Utc};
use inbox_core::types::{Experiment, ExperimentId, OutcomeEvent, VariantId};
use inbox_core::{InboxError, InboxResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

/// One line of the append-only journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    Created { experiment: Experiment },
    /// Serve counted by variant selection. Carries no event id since callers
    /// never see one to retry with.
    Served {
        variant_id: VariantId,
        at: DateTime<Utc>,
    },
    /// Caller-reported outcome, deduplicated by its event id.
    Event { event: OutcomeEvent },
    Closed {
        experiment_id: ExperimentId,
        at: DateTime<Utc>,
    },
    Reset {
        experiment_id: ExperimentId,
        at: DateTime<Utc>,
    },
}

impl JournalEntry {
    pub fn experiment_id(&self) -> &ExperimentId {
        match self {
            JournalEntry::Created { experiment } => &experiment.id,
            JournalEntry::Served { variant_id, .. } => &variant_id.experiment_id,
            JournalEntry::Event { event } => &event.variant_id.experiment_id,
            JournalEntry::Closed { experiment_id, .. } | JournalEntry::Reset { experiment_id, .. } => {
                experiment_id
            }
        }
    }
}

/// Writable journal file that can be cut back to a known length.
trait LogFile: Write + Send {
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl LogFile for File {
    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

enum Sink {
    /// Nothing is retained; the store lives in memory only.
    Disabled,
    File {
        path: PathBuf,
        file: Box<dyn LogFile>,
        /// Length of the file up to the last complete line.
        len: u64,
        /// A failed write could not be rolled back; `len` is the target.
        torn: bool,
    },
}

/// JSON-lines journal, file-backed or disabled.
///
/// Each entry is written with a single unbuffered write. A failed write is
/// truncated back to the last complete line, so an entry reported as failed
/// never reaches a later replay.
pub struct Journal {
    sink: Mutex<Sink>,
}

impl Journal {
    /// Journal that keeps nothing. Stores using it cannot rebuild counters.
    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(Sink::Disabled),
        }
    }

    /// Open (or create) a journal file and return the entries already in it.
    pub fn open(path: impl AsRef<Path>) -> InboxResult<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let existing = if path.exists() {
            read_entries(&path)?
        } else {
            Vec::new()
        };
        let torn_tail = std::fs::read(&path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if torn_tail {
            file.write_all(b"\n")?;
        }
        let len = file.metadata()?.len();
        info!(path = %path.display(), entries = existing.len(), "Journal opened");

        Ok((Self::from_file(path, Box::new(file), len), existing))
    }

    fn from_file(path: PathBuf, file: Box<dyn LogFile>, len: u64) -> Self {
        Self {
            sink: Mutex::new(Sink::File {
                path,
                file,
                len,
                torn: false,
            }),
        }
    }

    /// Append one entry as a complete line.
    pub fn append(&self, entry: &JournalEntry) -> InboxResult<()> {
        let mut sink = self.sink.lock();
        let Sink::File {
            file, len, torn, ..
        } = &mut *sink
        else {
            return Ok(());
        };

        if *torn {
            file.truncate(*len)
                .map_err(|e| InboxError::Store(format!("journal repair failed: {e}")))?;
            *torn = false;
        }

        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        if let Err(e) = file.write_all(&line) {
            metrics::counter!("store.journal_failures").increment(1);
            if let Err(rollback) = file.truncate(*len) {
                error!(error = %rollback, "Journal rollback failed, repairing on next append");
                *torn = true;
            }
            return Err(InboxError::Store(format!("journal append failed: {e}")));
        }
        *len += line.len() as u64;
        metrics::counter!("store.journal_appends").increment(1);
        Ok(())
    }

    /// Every entry written so far, in order. Empty when disabled.
    pub fn entries(&self) -> InboxResult<Vec<JournalEntry>> {
        let sink = self.sink.lock();
        match &*sink {
            Sink::Disabled => Ok(Vec::new()),
            Sink::File { path, .. } => read_entries(path),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(&*self.sink.lock(), Sink::File { .. })
    }
}

/// Unparseable lines (e.g. a torn final write) are skipped with a warning.
fn read_entries(path: &Path) -> InboxResult<Vec<JournalEntry>> {
    let reader = BufReader::new(File::open(path)?);
    let mut entries = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(&line) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                metrics::counter!("store.journal_corrupt_lines").increment(1);
                warn!(path = %path.display(), line = line_no + 1, error = %e, "Skipping corrupt journal line");
            }
        }
    }
    Ok(entries)
}
