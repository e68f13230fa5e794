//! Fix loop state machine: explicit states and legal transition guards.
//!
//! Every run starts at `Idle` and ends at `Succeeded`, `Exhausted` or
//! `Aborted`. The controller calls [`StateMachine::advance`] for each move;
//! illegal edges are rejected and every accepted edge is recorded, so a run
//! can be reconstructed from its transition log.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// The set of fix loop states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Nothing started yet.
    Idle,
    /// Installing dependencies not yet attempted this run.
    Resolving,
    /// A compile attempt is in flight.
    Compiling,
    /// Parsing and classifying a failed attempt.
    Diagnosing,
    /// Waiting on the repair collaborator.
    Repairing,
    /// Compile succeeded; terminal.
    Succeeded,
    /// Attempt cap reached or repairs stalled; terminal.
    Exhausted,
    /// Unrecoverable failure or cancellation; terminal.
    Aborted,
}

impl LoopState {
    /// Whether this is a terminal state (no further transitions allowed).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Exhausted | Self::Aborted)
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Resolving => write!(f, "Resolving"),
            Self::Compiling => write!(f, "Compiling"),
            Self::Diagnosing => write!(f, "Diagnosing"),
            Self::Repairing => write!(f, "Repairing"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Exhausted => write!(f, "Exhausted"),
            Self::Aborted => write!(f, "Aborted"),
        }
    }
}

/// Legal transitions between loop states.
///
/// ```text
/// Idle       → Resolving
/// Resolving  → Compiling | Repairing | Aborted
/// Compiling  → Succeeded | Diagnosing | Aborted
/// Diagnosing → Repairing | Resolving | Exhausted | Aborted
/// Repairing  → Resolving | Compiling | Exhausted | Aborted
/// ```
pub fn is_legal_transition(from: LoopState, to: LoopState) -> bool {
    use LoopState::*;

    // Any non-terminal state can abort.
    if to == Aborted && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Idle, Resolving)
            | (Resolving, Compiling)
            // Unresolved libraries under the repair policy
            | (Resolving, Repairing)
            | (Compiling, Succeeded)
            | (Compiling, Diagnosing)
            | (Diagnosing, Repairing)
            // Missing header for a dependency not yet attempted
            | (Diagnosing, Resolving)
            | (Diagnosing, Exhausted)
            | (Repairing, Resolving)
            | (Repairing, Compiling)
            // Repair rounds used up
            | (Repairing, Exhausted)
    )
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: LoopState,
    pub to: LoopState,
    /// Compile attempts made in this run at the time of transition.
    pub attempt: u32,
    /// Milliseconds since the run started.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub from: LoopState,
    pub to: LoopState,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Illegal state transition: {} → {}", self.from, self.to)
    }
}

impl std::error::Error for IllegalTransition {}

/// State of one fix loop run.
///
/// Tracks the current state and the run's attempt counter, enforces legal
/// transitions, and keeps the transition log.
#[derive(Debug)]
pub struct StateMachine {
    current: LoopState,
    attempt: u32,
    started_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: LoopState::Idle,
            attempt: 0,
            started_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> LoopState {
        self.current
    }

    /// Compile attempts made so far in this run.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Attempt to advance to the next state.
    ///
    /// Entering `Compiling` increments the attempt counter.
    pub fn advance(
        &mut self,
        to: LoopState,
        reason: Option<&str>,
    ) -> Result<&TransitionRecord, IllegalTransition> {
        if !is_legal_transition(self.current, to) {
            return Err(IllegalTransition {
                from: self.current,
                to,
            });
        }
        if to == LoopState::Compiling {
            self.attempt += 1;
        }

        tracing::debug!(
            from = %self.current,
            to = %to,
            attempt = self.attempt,
            reason = reason.unwrap_or(""),
            "State transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            attempt: self.attempt,
            elapsed_ms: self.started_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(&self.transitions[self.transitions.len() - 1])
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// One-line history: `Idle → Succeeded (12ms, 4 transitions) [Resolving → ...]`
    pub fn summary(&self) -> String {
        let states: Vec<String> = self.transitions.iter().map(|t| t.to.to_string()).collect();
        let mut out = format!(
            "{} → {} ({}ms, {} transitions)",
            LoopState::Idle,
            self.current,
            self.started_at.elapsed().as_millis(),
            self.transitions.len(),
        );
        if !states.is_empty() {
            out.push_str(&format!(" [{}]", states.join(" → ")));
        }
        out
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
