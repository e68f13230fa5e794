//! Fix loop controller: one run from `Idle` to a terminal state.
//!
//! The controller owns the source unit exclusively for the duration of a run
//! (`RunContext` holds `&mut SourceUnit`), so exactly one compile attempt is
//! in flight per source unit at any time.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::repair::{RepairCollaborator, RepairError, RepairRequest};
use super::state_machine::{IllegalTransition, LoopState, StateMachine};
use super::{AttemptHistory, BuildOutcome, CompileAttempt, LoopPolicy, UnresolvedPolicy};
use crate::board::BoardProfile;
use crate::diagnostics::{fingerprint, Diagnostic, DiagnosticParser};
use crate::error::FailureKind;
use crate::resolver::{LibraryResolver, ResolutionError};
use crate::session_log::{LogEvent, SessionLog};
use crate::source::{declared_dependencies, is_core_header, Dependency, SourceOrigin, SourceUnit};
use crate::toolchain::{BuildArtifact, Toolchain, ToolchainError};

/// Borrowed state a run works on
pub struct RunContext<'a> {
    pub source: &'a mut SourceUnit,
    pub board: &'a BoardProfile,
    /// Dependencies declared outside the sketch text
    pub extra_dependencies: &'a [Dependency],
    pub history: &'a mut AttemptHistory,
    pub log: &'a mut SessionLog,
    pub cancel: &'a CancellationToken,
    /// Run number within the session, starting at 1
    pub run: u32,
}

/// Compile → diagnose → repair controller
#[derive(Clone)]
pub struct FixLoop {
    toolchain: Arc<dyn Toolchain>,
    resolver: LibraryResolver,
    repair: Arc<dyn RepairCollaborator>,
    policy: LoopPolicy,
}

impl FixLoop {
    pub fn new(
        toolchain: Arc<dyn Toolchain>,
        resolver: LibraryResolver,
        repair: Arc<dyn RepairCollaborator>,
        policy: LoopPolicy,
    ) -> Self {
        Self {
            toolchain,
            resolver,
            repair,
            policy,
        }
    }

    pub fn policy(&self) -> &LoopPolicy {
        &self.policy
    }

    pub fn toolchain(&self) -> &Arc<dyn Toolchain> {
        &self.toolchain
    }

    /// Run the loop to a terminal state.
    ///
    /// Expected failures (exhaustion, unresolved libraries, cancellation,
    /// toolchain faults) are reported in the outcome. `Err` means the
    /// controller attempted an illegal transition.
    pub async fn run(&self, ctx: RunContext<'_>) -> Result<BuildOutcome, IllegalTransition> {
        Run::new(self, ctx).drive().await
    }
}

/// What the current state decided
enum Step {
    Next(LoopState, Option<String>),
    Finish(Terminal),
}

struct Terminal {
    state: LoopState,
    failure: Option<FailureKind>,
    reason: String,
    resolution_error: Option<ResolutionError>,
}

impl Terminal {
    fn succeeded(reason: String) -> Self {
        Self {
            state: LoopState::Succeeded,
            failure: None,
            reason,
            resolution_error: None,
        }
    }

    fn exhausted(reason: String) -> Self {
        Self {
            state: LoopState::Exhausted,
            failure: Some(FailureKind::RepairNonConvergence),
            reason,
            resolution_error: None,
        }
    }

    fn aborted(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            state: LoopState::Aborted,
            failure: Some(kind),
            reason: reason.into(),
            resolution_error: None,
        }
    }

    fn cancelled() -> Self {
        Self::aborted(FailureKind::Cancelled, "cancelled")
    }

    fn from_toolchain(err: ToolchainError) -> Self {
        match err {
            ToolchainError::Cancelled => Self::cancelled(),
            other => Self::aborted(FailureKind::ToolchainUnavailable, other.to_string()),
        }
    }
}

struct Run<'a> {
    fix_loop: &'a FixLoop,
    ctx: RunContext<'a>,
    sm: StateMachine,
    /// Dependency keys attempted this run
    attempted: HashSet<String>,
    /// Headers whose dependency was attempted this run
    attempted_headers: HashSet<String>,
    pending: Vec<Dependency>,
    repair_input: Vec<Diagnostic>,
    previous_fingerprint: Option<String>,
    last_diagnostics: Vec<Diagnostic>,
    artifact: Option<BuildArtifact>,
    /// Collaborator calls this run; capped like compiles so a
    /// resolve/repair cycle with no compile in between still ends
    repairs: u32,
}

impl<'a> Run<'a> {
    fn new(fix_loop: &'a FixLoop, ctx: RunContext<'a>) -> Self {
        Self {
            fix_loop,
            ctx,
            sm: StateMachine::new(),
            attempted: HashSet::new(),
            attempted_headers: HashSet::new(),
            pending: Vec::new(),
            repair_input: Vec::new(),
            previous_fingerprint: None,
            last_diagnostics: Vec::new(),
            artifact: None,
            repairs: 0,
        }
    }

    async fn drive(mut self) -> Result<BuildOutcome, IllegalTransition> {
        self.pending = self.new_dependencies();
        info!(
            sketch = self.ctx.source.name(),
            revision = self.ctx.source.revision(),
            fqbn = %self.ctx.board.fqbn,
            run = self.ctx.run,
            dependencies = self.pending.len(),
            "Build run started"
        );
        self.log(LogEvent::RunStarted {
            run: self.ctx.run,
            fqbn: self.ctx.board.fqbn.clone(),
            dependencies: self.pending.clone(),
        });

        loop {
            let step = if self.ctx.cancel.is_cancelled() {
                Step::Finish(Terminal::cancelled())
            } else {
                match self.sm.current() {
                    LoopState::Idle => Step::Next(
                        LoopState::Resolving,
                        Some(format!("{} declared dependencies", self.pending.len())),
                    ),
                    LoopState::Resolving => self.resolve().await,
                    LoopState::Compiling => self.compile().await,
                    LoopState::Diagnosing => self.diagnose(),
                    LoopState::Repairing => self.repair().await,
                    terminal => Step::Finish(Terminal {
                        state: terminal,
                        failure: None,
                        reason: "run already finished".to_string(),
                        resolution_error: None,
                    }),
                }
            };

            match step {
                Step::Next(to, reason) => self.go(to, reason.as_deref())?,
                Step::Finish(terminal) => return self.finish(terminal),
            }
        }
    }

    fn log(&mut self, event: LogEvent) {
        if let Err(e) = self.ctx.log.append(self.ctx.source.revision(), event) {
            warn!(error = %e, "Session log write failed");
        }
    }

    fn go(&mut self, to: LoopState, reason: Option<&str>) -> Result<(), IllegalTransition> {
        let record = self.sm.advance(to, reason)?.clone();
        self.log(LogEvent::Transition {
            from: record.from,
            to: record.to,
            attempt: record.attempt,
            reason: record.reason,
        });
        Ok(())
    }

    fn finish(mut self, terminal: Terminal) -> Result<BuildOutcome, IllegalTransition> {
        if !self.sm.is_terminal() {
            self.go(terminal.state, Some(&terminal.reason))?;
        }
        let attempts = self.sm.attempt();
        debug!(history = %self.sm.summary(), "Run transitions");
        self.log(LogEvent::Terminal {
            state: terminal.state,
            reason: terminal.reason.clone(),
            attempts,
        });

        if terminal.state == LoopState::Succeeded {
            info!(attempts, revision = self.ctx.source.revision(), "Build succeeded");
        } else {
            warn!(
                state = %terminal.state,
                failure = ?terminal.failure,
                attempts,
                reason = %terminal.reason,
                "Build did not succeed"
            );
        }

        let mut outcome = BuildOutcome::new(terminal.state, terminal.reason);
        outcome.failure = terminal.failure;
        outcome.resolution_error = terminal.resolution_error;
        outcome.attempts = attempts;
        outcome.revision = self.ctx.source.revision();
        outcome.diagnostics = std::mem::take(&mut self.last_diagnostics);
        outcome.transitions = self.sm.transitions().to_vec();
        if let Some(artifact) = self.artifact.take() {
            outcome = outcome.with_artifact(artifact);
        }
        Ok(outcome)
    }

    /// Dependencies of the current revision plus extras
    fn declared(&self) -> Vec<Dependency> {
        let mut deps = declared_dependencies(self.ctx.source.text(), self.ctx.board);
        for extra in self.ctx.extra_dependencies {
            if !deps.iter().any(|d| d.key() == extra.key()) {
                deps.push(extra.clone());
            }
        }
        deps
    }

    fn is_attempted(&self, dep: &Dependency) -> bool {
        self.attempted.contains(&dep.key())
            || dep
                .header
                .as_ref()
                .is_some_and(|h| self.attempted_headers.contains(h))
    }

    /// Declared dependencies not yet attempted this run
    fn new_dependencies(&self) -> Vec<Dependency> {
        self.declared()
            .into_iter()
            .filter(|d| !self.is_attempted(d))
            .collect()
    }

    /// Dependencies for missing headers not yet attempted this run
    fn dependencies_for_headers(&self, headers: &[String]) -> Vec<Dependency> {
        let declared = self.declared();
        let mut deps: Vec<Dependency> = Vec::new();
        for header in headers {
            if is_core_header(header, self.ctx.board) {
                continue;
            }
            let dep = declared
                .iter()
                .find(|d| d.header.as_deref() == Some(header.as_str()))
                .cloned()
                .unwrap_or_else(|| Dependency::from_header(header));
            if !self.is_attempted(&dep) && !deps.iter().any(|d| d.key() == dep.key()) {
                deps.push(dep);
            }
        }
        deps
    }

    async fn resolve(&mut self) -> Step {
        let pending = std::mem::take(&mut self.pending);
        for dep in &pending {
            self.attempted.insert(dep.key());
            if let Some(header) = &dep.header {
                self.attempted_headers.insert(header.clone());
            }
        }
        if pending.is_empty() {
            return Step::Next(LoopState::Compiling, Some("no new dependencies".to_string()));
        }

        let resolver = self.fix_loop.resolver.clone();
        match resolver.ensure(&pending, self.ctx.board, self.ctx.cancel).await {
            Ok(libraries) => {
                let count = libraries.len();
                self.log(LogEvent::ResolutionSucceeded { libraries });
                Step::Next(
                    LoopState::Compiling,
                    Some(format!("{count} dependencies ready")),
                )
            }
            Err(ResolutionError::Toolchain(err)) => {
                self.log(LogEvent::ResolutionFailed {
                    unresolved: Vec::new(),
                    error: err.to_string(),
                });
                Step::Finish(Terminal::from_toolchain(err))
            }
            Err(err) => {
                let unresolved = match &err {
                    ResolutionError::Unresolved { unresolved, .. } => unresolved.clone(),
                    ResolutionError::Toolchain(_) => Vec::new(),
                };
                self.log(LogEvent::ResolutionFailed {
                    unresolved: unresolved.clone(),
                    error: err.to_string(),
                });
                match self.fix_loop.policy.on_unresolved {
                    UnresolvedPolicy::Abort => Step::Finish(Terminal {
                        state: LoopState::Aborted,
                        failure: Some(FailureKind::ResolutionError),
                        reason: err.to_string(),
                        resolution_error: Some(err),
                    }),
                    UnresolvedPolicy::Repair => {
                        self.repair_input = unresolved
                            .iter()
                            .map(|u| {
                                Diagnostic::unresolved_library(
                                    &u.dependency.name,
                                    u.dependency.header.as_deref(),
                                )
                            })
                            .collect();
                        Step::Next(LoopState::Repairing, Some(err.to_string()))
                    }
                }
            }
        }
    }

    async fn compile(&mut self) -> Step {
        let toolchain = self.fix_loop.toolchain.clone();
        let output = match toolchain
            .compile(&*self.ctx.source, self.ctx.board, self.ctx.cancel)
            .await
        {
            Ok(output) => output,
            Err(err) => return Step::Finish(Terminal::from_toolchain(err)),
        };

        let diagnostics = DiagnosticParser::parse(&output.raw_output);
        let errors = diagnostics.iter().filter(|d| d.is_error()).count();
        let attempt = CompileAttempt {
            seq: self.ctx.history.next_seq(),
            revision: self.ctx.source.revision(),
            raw_output: output.raw_output.clone(),
            status: output.status,
            diagnostics: diagnostics.clone(),
            fingerprint: fingerprint(&diagnostics),
            timestamp: Utc::now(),
            duration_ms: output.duration.as_millis() as u64,
        };
        info!(
            seq = attempt.seq,
            attempt = self.sm.attempt(),
            revision = attempt.revision,
            status = %attempt.status,
            errors,
            "Compile attempt finished"
        );
        self.log(LogEvent::CompileAttempt(attempt.clone()));
        self.ctx.history.record(attempt);
        self.last_diagnostics = diagnostics;

        if !output.success() {
            return Step::Next(LoopState::Diagnosing, Some(output.status.to_string()));
        }
        match output.artifact {
            Some(artifact) => {
                self.artifact = Some(artifact);
                Step::Finish(Terminal::succeeded(format!(
                    "revision {} compiled on attempt {}",
                    self.ctx.source.revision(),
                    self.sm.attempt()
                )))
            }
            None => Step::Finish(Terminal::aborted(
                FailureKind::ToolchainUnavailable,
                "compile reported success without producing an artifact",
            )),
        }
    }

    fn diagnose(&mut self) -> Step {
        let Some(attempt) = self.ctx.history.last() else {
            return Step::Finish(Terminal::aborted(
                FailureKind::CompileFailure,
                "no compile attempt to diagnose",
            ));
        };
        let errors = attempt.error_count();
        let status = attempt.status;
        let current = attempt.fingerprint.clone();
        let diagnostics = attempt.diagnostics.clone();

        if errors == 0 {
            return Step::Finish(Terminal::aborted(
                FailureKind::CompileFailure,
                format!("compile failed ({status}) without actionable diagnostics"),
            ));
        }

        let previous = self.previous_fingerprint.replace(current.clone());
        if previous.as_deref() == Some(current.as_str()) {
            return Step::Finish(Terminal::exhausted(format!(
                "attempt {} produced the same diagnostics ({errors} error(s)) as the previous",
                self.sm.attempt()
            )));
        }

        let max = self.fix_loop.policy.max_attempts;
        if self.sm.attempt() >= max {
            return Step::Finish(Terminal::exhausted(format!(
                "reached the limit of {max} compile attempts with {errors} error(s) remaining"
            )));
        }

        let headers = DiagnosticParser::missing_headers(&diagnostics);
        let missing = self.dependencies_for_headers(&headers);
        if !missing.is_empty() {
            let names: Vec<String> = missing.iter().map(|d| d.to_string()).collect();
            self.pending = missing;
            return Step::Next(
                LoopState::Resolving,
                Some(format!("missing libraries: {}", names.join(", "))),
            );
        }

        self.repair_input = diagnostics;
        Step::Next(LoopState::Repairing, Some(format!("{errors} error(s)")))
    }

    async fn repair(&mut self) -> Step {
        let max = self.fix_loop.policy.max_attempts;
        if self.repairs >= max {
            return Step::Finish(Terminal::exhausted(format!(
                "reached the limit of {max} repair rounds after {} compile attempt(s)",
                self.sm.attempt()
            )));
        }
        self.repairs += 1;

        let request = RepairRequest {
            sketch_name: self.ctx.source.name().to_string(),
            source: self.ctx.source.text().to_string(),
            revision: self.ctx.source.revision(),
            diagnostics: std::mem::take(&mut self.repair_input),
            board: self.ctx.board.clone(),
            attempt: self.sm.attempt(),
        };
        let secs = self.fix_loop.policy.repair_timeout_secs;
        let repair = self.fix_loop.repair.clone();
        let cancel = self.ctx.cancel;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Step::Finish(Terminal::cancelled()),
            result = tokio::time::timeout(
                Duration::from_secs(secs),
                repair.propose(&request),
            ) => result,
        };
        let proposal = match result {
            Ok(Ok(proposal)) => proposal,
            Ok(Err(err)) => {
                return Step::Finish(Terminal::aborted(FailureKind::RepairFailed, err.to_string()))
            }
            Err(_) => {
                return Step::Finish(Terminal::aborted(
                    FailureKind::RepairFailed,
                    RepairError::Timeout { secs }.to_string(),
                ))
            }
        };

        if proposal.is_empty() {
            self.log(LogEvent::FixProposal {
                accepted: false,
                reason: "empty proposal".to_string(),
                rationale: proposal.rationale,
                new_revision: None,
            });
            return Step::Finish(Terminal::aborted(
                FailureKind::RepairFailed,
                "repair collaborator returned an empty proposal",
            ));
        }

        if self.ctx.source.is_unchanged(&proposal.source) {
            warn!(revision = self.ctx.source.revision(), "Fix proposal unchanged, discarding");
            self.log(LogEvent::FixProposal {
                accepted: false,
                reason: "unchanged source".to_string(),
                rationale: proposal.rationale,
                new_revision: None,
            });
            return Step::Next(
                LoopState::Compiling,
                Some(format!("recompiling unchanged revision {}", self.ctx.source.revision())),
            );
        }

        let revision = self.ctx.source.apply(proposal.source, SourceOrigin::Fix);
        info!(revision, rationale = %proposal.rationale, "Fix proposal accepted");
        self.log(LogEvent::FixProposal {
            accepted: true,
            reason: "applied".to_string(),
            rationale: proposal.rationale,
            new_revision: Some(revision),
        });

        let new_deps = self.new_dependencies();
        if new_deps.is_empty() {
            Step::Next(LoopState::Compiling, Some(format!("revision {revision}")))
        } else {
            let names: Vec<String> = new_deps.iter().map(|d| d.to_string()).collect();
            self.pending = new_deps;
            Step::Next(
                LoopState::Resolving,
                Some(format!("revision {revision} adds {}", names.join(", "))),
            )
        }
    }
}
