//! Build session: one sketch, one board, many runs.
//!
//! The session is the only writer of its [`SourceUnit`]. Edits submitted
//! through an [`EditQueue`] while a run is in progress wait until the
//! session is idle again.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::board::BoardProfile;
use crate::error::SessionError;
use crate::fix_loop::{AttemptHistory, BuildOutcome, FixLoop, RunContext};
use crate::session_log::{LogEvent, SessionLog};
use crate::source::{Dependency, SourceOrigin, SourceUnit};
use crate::toolchain::{BuildArtifact, PortId, UploadResult};
use crate::upload::UploadCoordinator;

/// Cloneable handle for submitting source edits
#[derive(Debug, Clone, Default)]
pub struct EditQueue {
    inner: Arc<Mutex<VecDeque<String>>>,
}

impl EditQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue full replacement text for the sketch
    pub fn submit(&self, text: impl Into<String>) {
        self.guard().push_back(text.into());
    }

    pub fn pending(&self) -> usize {
        self.guard().len()
    }

    fn drain(&self) -> Vec<String> {
        self.guard().drain(..).collect()
    }
}

/// Cloneable handle that cancels the session's current run, or the next
/// one when the session is idle. Stays valid across runs.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    inner: Arc<Mutex<CancelState>>,
}

#[derive(Debug, Default)]
struct CancelState {
    /// Token of the run or upload in progress
    active: Option<CancellationToken>,
    /// Cancel requested while idle
    requested: bool,
}

impl CancelHandle {
    fn guard(&self) -> MutexGuard<'_, CancelState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn cancel(&self) {
        let mut state = self.guard();
        match &state.active {
            Some(token) => token.cancel(),
            None => state.requested = true,
        }
    }

    /// Whether a cancel is waiting for the next run
    pub fn is_requested(&self) -> bool {
        self.guard().requested
    }

    /// Token for an operation that is starting; consumes a pending request
    fn begin(&self) -> CancellationToken {
        let mut state = self.guard();
        let token = CancellationToken::new();
        if std::mem::take(&mut state.requested) {
            token.cancel();
        }
        state.active = Some(token.clone());
        token
    }

    fn end(&self) {
        self.guard().active = None;
    }
}

pub struct BuildSession {
    source: SourceUnit,
    board: BoardProfile,
    extra_dependencies: Vec<Dependency>,
    fix_loop: FixLoop,
    uploader: UploadCoordinator,
    log: SessionLog,
    history: AttemptHistory,
    edits: EditQueue,
    cancel: CancelHandle,
    runs: u32,
    last_outcome: Option<BuildOutcome>,
}

impl BuildSession {
    pub fn new(
        name: impl Into<String>,
        initial_text: impl Into<String>,
        board: BoardProfile,
        extra_dependencies: Vec<Dependency>,
        fix_loop: FixLoop,
        uploader: UploadCoordinator,
        log: SessionLog,
    ) -> Self {
        Self {
            source: SourceUnit::new(name, initial_text, SourceOrigin::Generated),
            board,
            extra_dependencies,
            fix_loop,
            uploader,
            log,
            history: AttemptHistory::new(),
            edits: EditQueue::new(),
            cancel: CancelHandle::default(),
            runs: 0,
            last_outcome: None,
        }
    }

    pub fn edit_handle(&self) -> EditQueue {
        self.edits.clone()
    }

    /// Handle that cancels the current (or next) run or upload
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Apply queued edits; each becomes its own revision
    fn apply_pending_edits(&mut self) -> usize {
        let edits = self.edits.drain();
        let mut applied = 0;
        for text in edits {
            if self.source.is_unchanged(&text) {
                continue;
            }
            let revision = self.source.apply(text, SourceOrigin::UserEdit);
            self.append(LogEvent::EditApplied {
                origin: SourceOrigin::UserEdit,
            });
            info!(sketch = self.source.name(), revision, "User edit applied");
            applied += 1;
        }
        applied
    }

    fn append(&mut self, event: LogEvent) {
        if let Err(e) = self.log.append(self.source.revision(), event) {
            warn!(error = %e, "Session log write failed");
        }
    }

    /// Run one fix-loop cycle to a terminal state
    pub async fn run(&mut self) -> Result<BuildOutcome, SessionError> {
        self.apply_pending_edits();
        self.runs += 1;

        let cancel = self.cancel.begin();
        let outcome = self
            .fix_loop
            .run(RunContext {
                source: &mut self.source,
                board: &self.board,
                extra_dependencies: &self.extra_dependencies,
                history: &mut self.history,
                log: &mut self.log,
                cancel: &cancel,
                run: self.runs,
            })
            .await;
        self.cancel.end();
        let outcome = outcome?;

        // Edits that arrived mid-run land now that the session is idle
        self.apply_pending_edits();
        self.last_outcome = Some(outcome.clone());
        Ok(outcome)
    }

    /// Flash a build artifact
    pub async fn upload(
        &mut self,
        artifact: &BuildArtifact,
        port_override: Option<PortId>,
    ) -> Result<UploadResult, SessionError> {
        let cancel = self.cancel.begin();
        let result = self
            .uploader
            .upload(artifact, &self.board, port_override, &cancel)
            .await;
        self.cancel.end();
        match result {
            Ok(result) => {
                self.append(LogEvent::Upload {
                    result: Some(result.clone()),
                    error: None,
                });
                Ok(result)
            }
            Err(err) => {
                self.append(LogEvent::Upload {
                    result: None,
                    error: Some(err.to_string()),
                });
                Err(err.into())
            }
        }
    }

    pub fn source(&self) -> &SourceUnit {
        &self.source
    }

    pub fn board(&self) -> &BoardProfile {
        &self.board
    }

    pub fn history(&self) -> &AttemptHistory {
        &self.history
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    /// Runs started so far
    pub fn runs(&self) -> u32 {
        self.runs
    }

    pub fn last_outcome(&self) -> Option<&BuildOutcome> {
        self.last_outcome.as_ref()
    }
}
