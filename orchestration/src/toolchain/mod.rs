//! Toolchain adapter
//!
//! Wraps the external compiler/uploader (`arduino-cli`) behind the
//! [`Toolchain`] and [`PortEnumerator`] traits so the fix loop and upload
//! coordinator can be driven by fakes in tests.
//!
//! A failing compile is an ordinary [`CompileOutput`]; only environment
//! faults (binary missing, permission denied, platform not installed) are
//! reported as [`ToolchainError::Unavailable`].

pub mod arduino_cli;
pub mod process;

pub use arduino_cli::{ArduinoCli, ToolchainConfig};
pub use process::{run_command, ProcessError, ProcessOutput, ProcessStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::board::BoardProfile;
use crate::source::SourceUnit;

/// Errors that prevent the toolchain from producing a result at all
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ToolchainError {
    /// Environment is broken; no code change can fix this
    #[error("toolchain unavailable: {reason}")]
    Unavailable { reason: String },

    /// The caller cancelled the operation
    #[error("toolchain operation cancelled")]
    Cancelled,

    /// A query command (listing, search) exited unsuccessfully
    #[error("`{command}` failed ({status}): {output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },

    /// Output could not be interpreted
    #[error("unexpected toolchain output: {message}")]
    InvalidOutput { message: String },
}

impl ToolchainError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether this error must end the whole session
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

impl From<ProcessError> for ToolchainError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Cancelled { .. } => Self::Cancelled,
            spawn @ ProcessError::Spawn { .. } => Self::Unavailable {
                reason: spawn.to_string(),
            },
        }
    }
}

/// Compiled output of a successful build, the only thing an upload accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildArtifact {
    /// Directory holding the firmware images
    pub dir: PathBuf,
    /// Sketch directory the artifact was built from
    pub sketch_dir: PathBuf,
    /// Board the artifact targets
    pub fqbn: String,
    /// Source revision the artifact was built from
    pub revision: u32,
}

/// Result of one compile invocation
#[derive(Debug, Clone)]
pub struct CompileOutput {
    pub status: ProcessStatus,
    /// stdout + stderr, captured in full
    pub raw_output: String,
    pub duration: Duration,
    /// Present only when the compile succeeded
    pub artifact: Option<BuildArtifact>,
}

impl CompileOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Serial port identifier ("/dev/ttyACM0", "COM3")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortId(pub String);

impl PortId {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A device port as reported by the toolchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedPort {
    pub address: PortId,
    /// Port protocol ("serial", "network", ...)
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vid: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u16>,
    /// FQBNs the toolchain believes are attached to this port
    #[serde(default)]
    pub matching_fqbns: Vec<String>,
}

impl DetectedPort {
    pub fn is_serial(&self) -> bool {
        self.protocol.eq_ignore_ascii_case("serial")
    }
}

/// How an upload ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum UploadStatus {
    Succeeded,
    /// The device or uploader refused the image
    Rejected { exit_code: Option<i32> },
    /// The uploader hung and was killed
    TimedOut,
}

impl std::fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Rejected {
                exit_code: Some(code),
            } => write!(f, "rejected (exit {code})"),
            Self::Rejected { exit_code: None } => write!(f, "rejected"),
            Self::TimedOut => write!(f, "timed out"),
        }
    }
}

/// Outcome of an upload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResult {
    pub port: PortId,
    pub protocol: String,
    pub status: UploadStatus,
    pub raw_output: String,
    pub duration_ms: u64,
}

impl UploadResult {
    pub fn success(&self) -> bool {
        self.status == UploadStatus::Succeeded
    }
}

/// Library as listed by the toolchain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryRecord {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub provides_includes: Vec<String>,
}

/// Result of a state-changing library command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub output: String,
}

/// Compile and upload against a board profile.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Compile one revision of a sketch. A failing compile is `Ok`.
    async fn compile(
        &self,
        source: &SourceUnit,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<CompileOutput, ToolchainError>;

    /// Flash a built artifact. Timeouts and device rejections are `Ok`.
    async fn upload(
        &self,
        artifact: &BuildArtifact,
        port: &PortId,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, ToolchainError>;
}

/// Enumerates device ports
#[async_trait]
pub trait PortEnumerator: Send + Sync {
    async fn list_ports(&self, cancel: &CancellationToken)
        -> Result<Vec<DetectedPort>, ToolchainError>;
}
