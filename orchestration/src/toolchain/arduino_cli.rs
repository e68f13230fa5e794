//! `arduino-cli` wrapper
//!
//! Runs arduino-cli subcommands and captures structured output. Query
//! commands use `--format json`; both the current wrapped object shapes and
//! the legacy top-level arrays are accepted.

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::process::{run_command, ProcessOutput, ProcessStatus};
use super::{
    BuildArtifact, CommandOutcome, CompileOutput, DetectedPort, LibraryRecord, PortEnumerator,
    PortId, Toolchain, ToolchainError, UploadResult, UploadStatus,
};
use crate::board::BoardProfile;
use crate::source::SourceUnit;

/// Compile output lines meaning the toolchain itself is not usable
static ENVIRONMENT_FAULT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)^.*(platform '[^']*' not found|platform not installed|invalid fqbn|error resolving fqbn|unknown fqbn).*$",
    )
    .unwrap()
});

/// Toolchain invocation settings (`[toolchain]` in the config file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolchainConfig {
    /// arduino-cli binary (resolved through PATH when relative)
    pub cli_path: PathBuf,
    /// Root under which sketch folders and build outputs are written
    pub build_root: PathBuf,
    /// Sketchbook passed as `ARDUINO_DIRECTORIES_USER`; libraries install
    /// into its `libraries` folder
    pub user_dir: PathBuf,
    /// Optional `--config-file` passed to every invocation
    pub cli_config_file: Option<PathBuf>,
    pub compile_timeout_secs: u64,
    pub upload_timeout_secs: u64,
    pub library_timeout_secs: u64,
    pub query_timeout_secs: u64,
    /// Extra `compile` arguments, shell-quoted ("--warnings all")
    pub extra_compile_flags: String,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        let home = std::env::var("HOME")
            .or_else(|_| std::env::var("USERPROFILE"))
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        Self {
            cli_path: PathBuf::from("arduino-cli"),
            build_root: std::env::temp_dir().join("sketchforge"),
            user_dir: home.join("Arduino"),
            cli_config_file: None,
            compile_timeout_secs: 300,
            upload_timeout_secs: 120,
            library_timeout_secs: 300,
            query_timeout_secs: 60,
            extra_compile_flags: String::new(),
        }
    }
}

impl ToolchainConfig {
    /// Split `extra_compile_flags` the way a POSIX shell would.
    /// None when the quoting is unbalanced.
    pub fn compile_flags(&self) -> Option<Vec<String>> {
        shlex::split(&self.extra_compile_flags)
    }

    /// Library folder every arduino-cli invocation installs into and
    /// compiles against; sessions lock on this path
    pub fn library_dir(&self) -> PathBuf {
        self.user_dir.join("libraries")
    }
}

/// The arduino-cli toolchain
#[derive(Debug, Clone)]
pub struct ArduinoCli {
    config: ToolchainConfig,
}

impl ArduinoCli {
    pub fn new(config: ToolchainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ToolchainConfig {
        &self.config
    }

    /// `<build_root>/<sketch>-<workspace id>`, private to one source unit
    fn workspace_dir(&self, source: &SourceUnit) -> PathBuf {
        self.config
            .build_root
            .join(format!("{}-{}", source.name(), source.workspace_id()))
    }

    /// Folder the sketch is written to; its name matches the `.ino` stem
    pub fn sketch_dir(&self, source: &SourceUnit) -> PathBuf {
        self.workspace_dir(source).join(source.name())
    }

    /// Per-revision output folder, so artifacts of older revisions survive
    pub fn output_dir(&self, source: &SourceUnit) -> PathBuf {
        self.workspace_dir(source)
            .join("out")
            .join(format!("rev-{}", source.revision()))
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.config.cli_path);
        if let Some(config_file) = &self.config.cli_config_file {
            cmd.arg("--config-file").arg(config_file);
        }
        cmd.env("ARDUINO_DIRECTORIES_USER", &self.config.user_dir);
        cmd
    }

    async fn run(
        &self,
        cmd: &mut Command,
        timeout_secs: u64,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput, ToolchainError> {
        debug!(command = ?cmd.as_std(), "Running arduino-cli");
        Ok(run_command(cmd, Duration::from_secs(timeout_secs), cancel).await?)
    }

    /// Run a read-only `--format json` query and hand back stdout
    async fn query(
        &self,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> Result<String, ToolchainError> {
        let mut cmd = self.command();
        cmd.args(args).args(["--format", "json"]);
        let output = self.run(&mut cmd, self.config.query_timeout_secs, cancel).await?;
        if !output.status.success() {
            return Err(ToolchainError::CommandFailed {
                command: format!("arduino-cli {}", args.join(" ")),
                status: output.status.to_string(),
                output: output.combined(),
            });
        }
        Ok(output.stdout)
    }

    /// Libraries currently installed in the toolchain library directory
    pub async fn installed_libraries(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LibraryRecord>, ToolchainError> {
        let stdout = self.query(&["lib", "list"], cancel).await?;
        parse_library_list(&stdout)
    }

    /// Library names the index returns for a query, in index order
    pub async fn search_library(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ToolchainError> {
        let stdout = self.query(&["lib", "search", query], cancel).await?;
        parse_search_results(&stdout)
    }

    /// `lib install <spec>`; a refused install is an ordinary outcome
    pub async fn install_library(
        &self,
        spec: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        let mut cmd = self.command();
        cmd.args(["lib", "install", spec]);
        let output = self.run(&mut cmd, self.config.library_timeout_secs, cancel).await?;
        Ok(CommandOutcome {
            success: output.status.success(),
            output: output.combined(),
        })
    }

    /// `lib install --zip-path <archive>`; requires unsafe installs enabled
    pub async fn install_library_zip(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        let mut cmd = self.command();
        cmd.args(["lib", "install", "--zip-path"])
            .arg(archive)
            .env("ARDUINO_LIBRARY_ENABLE_UNSAFE_INSTALL", "true");
        let output = self.run(&mut cmd, self.config.library_timeout_secs, cancel).await?;
        Ok(CommandOutcome {
            success: output.status.success(),
            output: output.combined(),
        })
    }
}

#[async_trait]
impl Toolchain for ArduinoCli {
    async fn compile(
        &self,
        source: &SourceUnit,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<CompileOutput, ToolchainError> {
        let sketch_dir = self.sketch_dir(source);
        let output_dir = self.output_dir(source);
        let flags = self.config.compile_flags().ok_or_else(|| {
            ToolchainError::unavailable(format!(
                "unbalanced quoting in extra compile flags: {}",
                self.config.extra_compile_flags
            ))
        })?;

        for dir in [&sketch_dir, &output_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                ToolchainError::unavailable(format!(
                    "build directory {} not writable: {e}",
                    dir.display()
                ))
            })?;
        }
        let sketch_file = sketch_dir.join(source.file_name());
        tokio::fs::write(&sketch_file, source.text()).await.map_err(|e| {
            ToolchainError::unavailable(format!("cannot write {}: {e}", sketch_file.display()))
        })?;

        let mut cmd = self.command();
        cmd.arg("compile")
            .arg("--fqbn")
            .arg(&board.fqbn)
            .arg("--output-dir")
            .arg(&output_dir)
            .args(&flags)
            .arg(&sketch_dir);
        let output = self.run(&mut cmd, self.config.compile_timeout_secs, cancel).await?;
        let raw_output = output.combined();

        if !output.status.success() {
            if let Some(fault) = ENVIRONMENT_FAULT.find(&raw_output) {
                warn!(
                    fqbn = %board.fqbn,
                    reason = fault.as_str().trim(),
                    "Toolchain cannot build for board"
                );
                return Err(ToolchainError::unavailable(fault.as_str().trim()));
            }
        }

        let artifact = output.status.success().then(|| BuildArtifact {
            dir: output_dir.clone(),
            sketch_dir: sketch_dir.clone(),
            fqbn: board.fqbn.clone(),
            revision: source.revision(),
        });

        info!(
            sketch = source.name(),
            revision = source.revision(),
            fqbn = %board.fqbn,
            status = %output.status,
            duration_ms = output.duration.as_millis() as u64,
            "Compile finished"
        );

        Ok(CompileOutput {
            status: output.status,
            raw_output,
            duration: output.duration,
            artifact,
        })
    }

    async fn upload(
        &self,
        artifact: &BuildArtifact,
        port: &PortId,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<UploadResult, ToolchainError> {
        let protocol = board.preferred_protocol().to_string();
        let mut cmd = self.command();
        cmd.arg("upload")
            .arg("--fqbn")
            .arg(&artifact.fqbn)
            .arg("--port")
            .arg(port.as_str())
            .arg("--protocol")
            .arg(&protocol)
            .arg("--input-dir")
            .arg(&artifact.dir)
            .arg(&artifact.sketch_dir);
        let output = self.run(&mut cmd, self.config.upload_timeout_secs, cancel).await?;

        let status = match output.status {
            ProcessStatus::TimedOut => UploadStatus::TimedOut,
            s if s.success() => UploadStatus::Succeeded,
            s => UploadStatus::Rejected { exit_code: s.code() },
        };
        info!(port = %port, protocol = %protocol, status = %status, "Upload finished");

        Ok(UploadResult {
            port: port.clone(),
            protocol,
            status,
            raw_output: output.combined(),
            duration_ms: output.duration.as_millis() as u64,
        })
    }
}

#[async_trait]
impl PortEnumerator for ArduinoCli {
    async fn list_ports(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<DetectedPort>, ToolchainError> {
        let stdout = self.query(&["board", "list"], cancel).await?;
        parse_port_list(&stdout)
    }
}

// ── JSON shapes ────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(untagged)]
enum LibListResponse {
    Legacy(Vec<LibListEntry>),
    Wrapped {
        #[serde(default)]
        installed_libraries: Vec<LibListEntry>,
    },
}

#[derive(Deserialize)]
struct LibListEntry {
    library: LibInfo,
}

#[derive(Deserialize)]
struct LibInfo {
    name: String,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    provides_includes: Vec<String>,
}

#[derive(Deserialize)]
struct LibSearchResponse {
    #[serde(default)]
    libraries: Vec<LibSearchEntry>,
}

#[derive(Deserialize)]
struct LibSearchEntry {
    name: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum BoardListResponse {
    Legacy(Vec<PortEntry>),
    Wrapped {
        #[serde(default)]
        detected_ports: Vec<PortEntry>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortEntry {
    Nested {
        port: PortInfo,
        #[serde(default)]
        matching_boards: Vec<MatchingBoard>,
    },
    /// Pre-0.20 flat shape
    Flat {
        address: String,
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        protocol_label: Option<String>,
        #[serde(default)]
        boards: Vec<MatchingBoard>,
    },
}

#[derive(Deserialize)]
struct PortInfo {
    address: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    protocol: Option<String>,
    #[serde(default)]
    properties: HashMap<String, String>,
}

#[derive(Deserialize)]
struct MatchingBoard {
    #[serde(default, alias = "FQBN")]
    fqbn: Option<String>,
}

fn invalid(what: &str, err: serde_json::Error) -> ToolchainError {
    ToolchainError::InvalidOutput {
        message: format!("{what}: {err}"),
    }
}

/// Parse `lib list --format json`
pub fn parse_library_list(stdout: &str) -> Result<Vec<LibraryRecord>, ToolchainError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: LibListResponse =
        serde_json::from_str(stdout).map_err(|e| invalid("lib list", e))?;
    let entries = match response {
        LibListResponse::Legacy(entries) => entries,
        LibListResponse::Wrapped {
            installed_libraries,
        } => installed_libraries,
    };
    Ok(entries
        .into_iter()
        .map(|e| LibraryRecord {
            name: e.library.name,
            version: e.library.version,
            provides_includes: e.library.provides_includes,
        })
        .collect())
}

/// Parse `lib search --format json` into library names
pub fn parse_search_results(stdout: &str) -> Result<Vec<String>, ToolchainError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: LibSearchResponse =
        serde_json::from_str(stdout).map_err(|e| invalid("lib search", e))?;
    Ok(response.libraries.into_iter().map(|l| l.name).collect())
}

/// Parse `board list --format json`
pub fn parse_port_list(stdout: &str) -> Result<Vec<DetectedPort>, ToolchainError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let response: BoardListResponse =
        serde_json::from_str(stdout).map_err(|e| invalid("board list", e))?;
    let entries = match response {
        BoardListResponse::Legacy(entries) => entries,
        BoardListResponse::Wrapped { detected_ports } => detected_ports,
    };

    Ok(entries
        .into_iter()
        .map(|entry| match entry {
            PortEntry::Nested {
                port,
                matching_boards,
            } => DetectedPort {
                address: PortId::new(port.address),
                protocol: port.protocol.unwrap_or_else(|| "serial".to_string()),
                label: port.label,
                vid: port.properties.get("vid").and_then(|v| parse_usb_id(v)),
                pid: port.properties.get("pid").and_then(|v| parse_usb_id(v)),
                matching_fqbns: matching_boards.into_iter().filter_map(|b| b.fqbn).collect(),
            },
            PortEntry::Flat {
                address,
                protocol,
                protocol_label,
                boards,
            } => DetectedPort {
                address: PortId::new(address),
                protocol: protocol.unwrap_or_else(|| "serial".to_string()),
                label: protocol_label,
                vid: None,
                pid: None,
                matching_fqbns: boards.into_iter().filter_map(|b| b.fqbn).collect(),
            },
        })
        .collect())
}

/// "0x2341" / "2341" → 0x2341
fn parse_usb_id(raw: &str) -> Option<u16> {
    let trimmed = raw.trim();
    let hex = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    u16::from_str_radix(hex, 16).ok()
}
