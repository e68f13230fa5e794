//! Failure taxonomy shared by the fix loop, upload coordinator and session

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fix_loop::IllegalTransition;
use crate::session_log::SessionLogError;
use crate::upload::UploadError;

/// Why a run or upload did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Toolchain missing, not permitted, or missing the board platform.
    /// Fatal to the whole session.
    ToolchainUnavailable,
    /// Dependencies no tier could install
    ResolutionError,
    /// The compile failed in a way the loop cannot act on
    CompileFailure,
    /// Attempt cap reached or repairs stopped making progress
    RepairNonConvergence,
    /// The repair collaborator erred, timed out or returned nothing
    RepairFailed,
    /// The run was cancelled
    Cancelled,
    UploadFailure,
    NoPortFound,
    AmbiguousPort,
}

impl FailureKind {
    /// Whether retrying without fixing the environment is pointless
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ToolchainUnavailable)
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::ToolchainUnavailable => "toolchain_unavailable",
            Self::ResolutionError => "resolution_error",
            Self::CompileFailure => "compile_failure",
            Self::RepairNonConvergence => "repair_non_convergence",
            Self::RepairFailed => "repair_failed",
            Self::Cancelled => "cancelled",
            Self::UploadFailure => "upload_failure",
            Self::NoPortFound => "no_port_found",
            Self::AmbiguousPort => "ambiguous_port",
        };
        write!(f, "{name}")
    }
}

/// Exceptional session errors (expected outcomes are return values)
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error(transparent)]
    Upload(#[from] UploadError),

    #[error(transparent)]
    Log(#[from] SessionLogError),
}

impl SessionError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            Self::Upload(e) => Some(e.failure_kind()),
            _ => None,
        }
    }
}
