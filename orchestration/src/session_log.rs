//! Session log: append-only JSON-lines ledger
//!
//! Every run start, state transition, resolution result, compile attempt,
//! fix proposal, applied edit, terminal state and upload of a session is
//! appended here. Entries are never rewritten; a persisted log can be read
//! back with [`SessionLog::replay`] without the process that wrote it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::fix_loop::{CompileAttempt, LoopState};
use crate::resolver::{InstalledLibrary, UnresolvedDependency};
use crate::source::{Dependency, SourceOrigin};
use crate::toolchain::UploadResult;

#[derive(Debug, Error)]
pub enum SessionLogError {
    #[error("session log I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("session log {path} line {line}: {source}")]
    Malformed {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode log entry: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        run: u32,
        fqbn: String,
        dependencies: Vec<Dependency>,
    },
    Transition {
        from: LoopState,
        to: LoopState,
        attempt: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    ResolutionSucceeded {
        libraries: Vec<InstalledLibrary>,
    },
    ResolutionFailed {
        unresolved: Vec<UnresolvedDependency>,
        error: String,
    },
    CompileAttempt(CompileAttempt),
    FixProposal {
        accepted: bool,
        reason: String,
        rationale: String,
        /// Revision the proposal became, when accepted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        new_revision: Option<u32>,
    },
    EditApplied {
        origin: SourceOrigin,
    },
    Terminal {
        state: LoopState,
        reason: String,
        attempts: u32,
    },
    Upload {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<UploadResult>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl LogEvent {
    /// Short event name for summaries
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::Transition { .. } => "transition",
            Self::ResolutionSucceeded { .. } => "resolution_succeeded",
            Self::ResolutionFailed { .. } => "resolution_failed",
            Self::CompileAttempt(_) => "compile_attempt",
            Self::FixProposal { .. } => "fix_proposal",
            Self::EditApplied { .. } => "edit_applied",
            Self::Terminal { .. } => "terminal",
            Self::Upload { .. } => "upload",
        }
    }
}

/// One ledger line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log, starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    /// Source revision current when the event happened
    pub revision: u32,
    pub event: LogEvent,
}

impl LogEntry {
    /// Human-readable one-liner
    pub fn to_log_line(&self) -> String {
        let detail = match &self.event {
            LogEvent::RunStarted { run, fqbn, dependencies } => {
                format!("run {run} for {fqbn}, {} dependencies", dependencies.len())
            }
            LogEvent::Transition { from, to, attempt, reason } => match reason {
                Some(r) => format!("{from} → {to} (attempt {attempt}): {r}"),
                None => format!("{from} → {to} (attempt {attempt})"),
            },
            LogEvent::ResolutionSucceeded { libraries } => {
                let names: Vec<String> = libraries
                    .iter()
                    .map(|l| format!("{} [{}]", l.installed_name, l.source))
                    .collect();
                format!("resolved {}", names.join(", "))
            }
            LogEvent::ResolutionFailed { error, .. } => error.clone(),
            LogEvent::CompileAttempt(a) => format!(
                "attempt #{} {} in {}ms, {} diagnostics",
                a.seq,
                a.status,
                a.duration_ms,
                a.diagnostics.len()
            ),
            LogEvent::FixProposal { accepted, reason, .. } => {
                let verdict = if *accepted { "accepted" } else { "discarded" };
                format!("fix {verdict}: {reason}")
            }
            LogEvent::EditApplied { origin } => format!("edit applied ({origin})"),
            LogEvent::Terminal { state, reason, attempts } => {
                format!("{state} after {attempts} attempts: {reason}")
            }
            LogEvent::Upload { result: Some(r), .. } => {
                format!("upload to {} {}", r.port, r.status)
            }
            LogEvent::Upload { error, .. } => {
                format!("upload failed: {}", error.as_deref().unwrap_or("unknown"))
            }
        };
        format!(
            "{} #{} rev {} {} {}",
            self.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.seq,
            self.revision,
            self.event.kind(),
            detail
        )
    }
}

/// Append-only ledger, optionally mirrored to a JSONL file
#[derive(Debug)]
pub struct SessionLog {
    session_id: String,
    path: Option<PathBuf>,
    entries: Vec<LogEntry>,
}

impl SessionLog {
    /// Log kept in memory only
    pub fn in_memory(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            path: None,
            entries: Vec::new(),
        }
    }

    /// Log persisted to `path`. Existing lines are loaded so sequence
    /// numbers keep increasing across processes.
    pub fn open(
        path: impl AsRef<Path>,
        session_id: impl Into<String>,
    ) -> Result<Self, SessionLogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| SessionLogError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let entries = Self::replay(&path)?;
        Ok(Self {
            session_id: session_id.into(),
            path: Some(path),
            entries,
        })
    }

    /// Read every entry of a persisted log. A missing file is an empty log.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<LogEntry>, SessionLogError> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let io_err = |source| SessionLogError::Io {
            path: path.to_path_buf(),
            source,
        };
        let reader = BufReader::new(File::open(path).map_err(io_err)?);

        let mut entries = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let entry = serde_json::from_str(&line).map_err(|source| SessionLogError::Malformed {
                path: path.to_path_buf(),
                line: idx + 1,
                source,
            })?;
            entries.push(entry);
        }
        Ok(entries)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append an event. The entry is kept in memory even when the file
    /// write fails; the error is returned so the caller can report it.
    pub fn append(&mut self, revision: u32, event: LogEvent) -> Result<&LogEntry, SessionLogError> {
        let entry = LogEntry {
            seq: self.entries.last().map_or(1, |e| e.seq + 1),
            timestamp: Utc::now(),
            session_id: self.session_id.clone(),
            revision,
            event,
        };
        let persisted = self.persist(&entry);
        self.entries.push(entry);
        persisted?;
        Ok(&self.entries[self.entries.len() - 1])
    }

    fn persist(&self, entry: &LogEntry) -> Result<(), SessionLogError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let line = serde_json::to_string(entry)?;
        let io_err = |source| SessionLogError::Io {
            path: path.clone(),
            source,
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(io_err)?;
        writeln!(file, "{line}").map_err(io_err)
    }

    /// Read-only view of every entry
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Entries recorded while `revision` was current
    pub fn for_revision(&self, revision: u32) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.revision == revision).collect()
    }

    /// Entries of this session only (a shared file may hold several)
    pub fn for_session(&self) -> Vec<&LogEntry> {
        self.entries
            .iter()
            .filter(|e| e.session_id == self.session_id)
            .collect()
    }

    /// Every compile attempt, in order
    pub fn compile_attempts(&self) -> Vec<&CompileAttempt> {
        self.entries
            .iter()
            .filter_map(|e| match &e.event {
                LogEvent::CompileAttempt(a) => Some(a),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
