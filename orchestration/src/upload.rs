//! Upload Coordinator
//!
//! Picks the serial port a board is attached to and flashes a build
//! artifact. Ambiguity is reported back to the caller, never guessed, and a
//! failed upload is not retried.

use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::board::BoardProfile;
use crate::error::FailureKind;
use crate::toolchain::{
    BuildArtifact, DetectedPort, PortEnumerator, PortId, Toolchain, ToolchainError, UploadResult,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortSelectionError {
    #[error("no serial port found for {board}")]
    NoPortFound { board: String },

    #[error(
        "{} ports could be {board}: {}; choose one explicitly",
        .candidates.len(),
        describe_ports(.candidates)
    )]
    AmbiguousPort {
        board: String,
        candidates: Vec<DetectedPort>,
    },

    #[error("port enumeration failed: {0}")]
    Enumeration(ToolchainError),
}

fn describe_ports(ports: &[DetectedPort]) -> String {
    ports
        .iter()
        .map(|p| p.address.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error(transparent)]
    PortSelection(#[from] PortSelectionError),

    #[error("artifact was built for {artifact_fqbn}, not {board_fqbn}")]
    BoardMismatch {
        artifact_fqbn: String,
        board_fqbn: String,
    },

    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

impl UploadError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::PortSelection(selection) => match selection {
                PortSelectionError::NoPortFound { .. } => FailureKind::NoPortFound,
                PortSelectionError::AmbiguousPort { .. } => FailureKind::AmbiguousPort,
                PortSelectionError::Enumeration(e) => toolchain_failure(e),
            },
            Self::Toolchain(e) => toolchain_failure(e),
            Self::BoardMismatch { .. } => FailureKind::UploadFailure,
        }
    }
}

fn toolchain_failure(e: &ToolchainError) -> FailureKind {
    match e {
        ToolchainError::Cancelled => FailureKind::Cancelled,
        e if e.is_fatal() => FailureKind::ToolchainUnavailable,
        _ => FailureKind::UploadFailure,
    }
}

/// Serial ports that could plausibly be `board`.
///
/// With known USB identifiers a port must match one (VID, plus PID when
/// the identifier names one) or list the board's FQBN among its matches.
/// Without identifiers every serial port is plausible.
pub fn plausible_ports(ports: &[DetectedPort], board: &BoardProfile) -> Vec<DetectedPort> {
    ports
        .iter()
        .filter(|p| p.is_serial())
        .filter(|p| {
            if !board.has_usb_ids() {
                return true;
            }
            let usb_match = p.vid.is_some_and(|vid| board.matches_usb(vid, p.pid));
            usb_match || p.matching_fqbns.iter().any(|f| f == &board.fqbn)
        })
        .cloned()
        .collect()
}

/// Port selection and flashing
#[derive(Clone)]
pub struct UploadCoordinator {
    toolchain: Arc<dyn Toolchain>,
    ports: Arc<dyn PortEnumerator>,
}

impl UploadCoordinator {
    pub fn new(toolchain: Arc<dyn Toolchain>, ports: Arc<dyn PortEnumerator>) -> Self {
        Self { toolchain, ports }
    }

    /// Every plausible port for a board
    pub async fn candidates(
        &self,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedPort>, ToolchainError> {
        let ports = self.ports.list_ports(cancel).await?;
        let plausible = plausible_ports(&ports, board);
        debug!(
            board = %board.name,
            detected = ports.len(),
            plausible = plausible.len(),
            "Enumerated ports"
        );
        Ok(plausible)
    }

    /// Select the single plausible port for a board
    pub async fn select_port(
        &self,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<PortId, PortSelectionError> {
        let mut candidates = self
            .candidates(board, cancel)
            .await
            .map_err(PortSelectionError::Enumeration)?;
        match candidates.len() {
            0 => Err(PortSelectionError::NoPortFound {
                board: board.name.clone(),
            }),
            1 => Ok(candidates.remove(0).address),
            _ => Err(PortSelectionError::AmbiguousPort {
                board: board.name.clone(),
                candidates,
            }),
        }
    }

    /// Flash an artifact. Uses `port_override` when given, otherwise
    /// [`select_port`](Self::select_port). One attempt only.
    pub async fn upload(
        &self,
        artifact: &BuildArtifact,
        board: &BoardProfile,
        port_override: Option<PortId>,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, UploadError> {
        if artifact.fqbn != board.fqbn {
            return Err(UploadError::BoardMismatch {
                artifact_fqbn: artifact.fqbn.clone(),
                board_fqbn: board.fqbn.clone(),
            });
        }
        let port = match port_override {
            Some(port) => port,
            None => self.select_port(board, cancel).await?,
        };

        info!(port = %port, board = %board.name, revision = artifact.revision, "Uploading");
        let result = self.toolchain.upload(artifact, &port, board, cancel).await?;
        if !result.success() {
            warn!(port = %port, status = %result.status, "Upload did not succeed");
        }
        Ok(result)
    }
}
