//! Fix Loop Controller
//!
//! Drives one source unit from its current revision to a terminal state:
//!
//! ```text
//! Idle → Resolving → Compiling → Succeeded
//!                        ↓
//!                   Diagnosing → Repairing → (Resolving →) Compiling ...
//!                        ↓
//!                  Exhausted | Aborted
//! ```
//!
//! The loop is bounded by [`LoopPolicy::max_attempts`] and stops early when
//! two consecutive attempts produce the same error set.

pub mod controller;
pub mod repair;
pub mod state_machine;

pub use controller::{FixLoop, RunContext};
pub use repair::{strip_code_fences, FixProposal, RepairCollaborator, RepairError, RepairRequest};
pub use state_machine::{
    is_legal_transition, IllegalTransition, LoopState, StateMachine, TransitionRecord,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diagnostics::Diagnostic;
use crate::error::FailureKind;
use crate::resolver::ResolutionError;
use crate::toolchain::{BuildArtifact, ProcessStatus};

/// What to do when a dependency cannot be installed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnresolvedPolicy {
    /// End the run with the resolution error
    #[default]
    Abort,
    /// Ask the repair collaborator to work around the missing library
    Repair,
}

/// Retry policy (`[policy]` in the config file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopPolicy {
    /// Compile attempts per run
    pub max_attempts: u32,
    pub on_unresolved: UnresolvedPolicy,
    pub repair_timeout_secs: u64,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            on_unresolved: UnresolvedPolicy::Abort,
            repair_timeout_secs: 120,
        }
    }
}

/// One compile invocation and its parsed result. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompileAttempt {
    /// Sequence number, monotonic across every run of a session
    pub seq: u64,
    /// Source revision compiled
    pub revision: u32,
    pub raw_output: String,
    pub status: ProcessStatus,
    pub diagnostics: Vec<Diagnostic>,
    /// blake3 over the error diagnostics
    pub fingerprint: String,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

impl CompileAttempt {
    pub fn succeeded(&self) -> bool {
        self.status.success()
    }

    pub fn errors(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.iter().filter(|d| d.is_error())
    }

    pub fn error_count(&self) -> usize {
        self.errors().count()
    }
}

/// Append-only attempt history of a session
#[derive(Debug, Clone, Default)]
pub struct AttemptHistory {
    attempts: Vec<CompileAttempt>,
}

impl AttemptHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence number the next attempt will get
    pub fn next_seq(&self) -> u64 {
        self.attempts.last().map_or(1, |a| a.seq + 1)
    }

    pub(crate) fn record(&mut self, attempt: CompileAttempt) -> &CompileAttempt {
        self.attempts.push(attempt);
        &self.attempts[self.attempts.len() - 1]
    }

    pub fn all(&self) -> &[CompileAttempt] {
        &self.attempts
    }

    pub fn last(&self) -> Option<&CompileAttempt> {
        self.attempts.last()
    }

    pub fn len(&self) -> usize {
        self.attempts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attempts.is_empty()
    }
}

/// Terminal result of one run
#[derive(Debug, Clone)]
pub struct BuildOutcome {
    pub state: LoopState,
    /// Human-readable reason for the terminal state
    pub reason: String,
    /// None when the run succeeded
    pub failure: Option<FailureKind>,
    /// Set when the run aborted on unresolved dependencies
    pub resolution_error: Option<ResolutionError>,
    /// Compile attempts made in this run
    pub attempts: u32,
    /// Revision current at the end of the run
    pub revision: u32,
    /// Diagnostics of the last attempt
    pub diagnostics: Vec<Diagnostic>,
    pub transitions: Vec<TransitionRecord>,
    artifact: Option<BuildArtifact>,
}

impl BuildOutcome {
    pub(crate) fn new(state: LoopState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            failure: None,
            resolution_error: None,
            attempts: 0,
            revision: 0,
            diagnostics: Vec::new(),
            transitions: Vec::new(),
            artifact: None,
        }
    }

    /// Only a succeeded run carries an artifact
    pub(crate) fn with_artifact(mut self, artifact: BuildArtifact) -> Self {
        if self.state == LoopState::Succeeded {
            self.artifact = Some(artifact);
        }
        self
    }

    pub fn succeeded(&self) -> bool {
        self.state == LoopState::Succeeded
    }

    /// The artifact that permits upload
    pub fn artifact(&self) -> Option<&BuildArtifact> {
        self.artifact.as_ref()
    }
}

impl std::fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} after {} attempt{} (revision {}): {}",
            self.state,
            self.attempts,
            if self.attempts == 1 { "" } else { "s" },
            self.revision,
            self.reason
        )
    }
}
