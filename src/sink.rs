//! Append-only result store.
//!
//! One row per record, in completion order. The file-backed sink writes each
//! row through to disk and syncs it before `append` returns.

use crate::{input::Row, stats::Cost};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum FailureReason {
    /// The inference call itself failed.
    Dispatch(String),
    /// The reply did not conform to the output schema.
    Parse(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Dispatch(m) => write!(f, "dispatch failure: {m}"),
            FailureReason::Parse(m) => write!(f, "parse failure: {m}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Succeeded { fields: Row },
    Failed { reason: FailureReason },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub record_id: u64,
    pub source: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub input_tokens: u64,
    pub cached_input_tokens: u64,
    pub output_tokens: u64,
    pub cost: Cost,
    pub completed_at: String,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Succeeded { .. })
    }

    pub fn fields(&self) -> Option<&Row> {
        match &self.outcome {
            Outcome::Succeeded { fields } => Some(fields),
            Outcome::Failed { .. } => None,
        }
    }

    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.outcome {
            Outcome::Succeeded { .. } => None,
            Outcome::Failed { reason } => Some(reason),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("record {0} already has a result")]
    Duplicate(u64),

    #[error("writing results to {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("serializing result: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Backing {
    path: PathBuf,
    file: File,
}

impl Backing {
    /// Writes one whole line or nothing: a failed write is cut back to the
    /// previous line end.
    fn write_line(&mut self, line: &[u8]) -> Result<(), SinkError> {
        let io_err = |path: &Path, source| SinkError::Io {
            path: path.display().to_string(),
            source,
        };
        let start = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|e| io_err(&self.path, e))?;

        let written = self
            .file
            .write_all(line)
            .and_then(|_| self.file.flush())
            .and_then(|_| self.file.sync_data());
        if let Err(source) = written {
            if let Err(err) = self.file.set_len(start) {
                warn!("truncating {} after failed write: {err}", self.path.display());
            }
            return Err(io_err(&self.path, source));
        }
        Ok(())
    }
}

#[derive(Default)]
struct SinkInner {
    rows: Vec<RunResult>,
    written: HashSet<u64>,
    backing: Option<Backing>,
}

#[derive(Default)]
pub struct ResultSink {
    inner: Mutex<SinkInner>,
}

impl ResultSink {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Creates (or truncates) a JSON Lines file backing the sink.
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self {
            inner: Mutex::new(SinkInner {
                backing: Some(Backing {
                    path: path.to_path_buf(),
                    file,
                }),
                ..Default::default()
            }),
        })
    }

    pub fn append(&self, result: RunResult) -> Result<(), SinkError> {
        self.append_then(result, |_| {})
    }

    /// Appends a result and, while still holding the sink lock, runs `after`
    /// on the stored row. `after` only runs when the row was durably written.
    pub fn append_then(
        &self,
        result: RunResult,
        after: impl FnOnce(&RunResult),
    ) -> Result<(), SinkError> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.written.contains(&result.record_id) {
            return Err(SinkError::Duplicate(result.record_id));
        }

        if let Some(backing) = inner.backing.as_mut() {
            let mut line = serde_json::to_vec(&result)?;
            line.push(b'\n');
            backing.write_line(&line)?;
        }

        inner.written.insert(result.record_id);
        inner.rows.push(result);
        if let Some(stored) = inner.rows.last() {
            after(stored);
        }
        Ok(())
    }

    /// Rows in completion order.
    pub fn snapshot(&self) -> Vec<RunResult> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .clone()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .rows
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .backing
            .as_ref()
            .map(|b| b.path.clone())
    }
}

/// Reads back a results file written by a file-backed sink.
pub fn read_results(path: &Path) -> anyhow::Result<Vec<RunResult>> {
    use anyhow::Context;
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading results: {}", path.display()))?;
    raw.lines()
        .filter(|l| !l.trim().is_empty())
        .enumerate()
        .map(|(i, l)| {
            serde_json::from_str::<RunResult>(l).with_context(|| format!("{} row {}", path.display(), i + 1))
        })
        .collect()
}
