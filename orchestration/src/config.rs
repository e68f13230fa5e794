//! Configuration
//!
//! `ForgeConfig` is read from a TOML file with `[toolchain]`, `[resolver]`,
//! `[policy]`, `[[boards]]` and `[session]` sections; every section and
//! field is optional. `SKETCHFORGE_*` environment variables override the
//! file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::board::{BoardCatalog, BoardProfile};
use crate::fix_loop::LoopPolicy;
use crate::resolver::ResolverConfig;
use crate::toolchain::ToolchainConfig;

pub const ENV_CLI_PATH: &str = "SKETCHFORGE_CLI_PATH";
pub const ENV_BUILD_ROOT: &str = "SKETCHFORGE_BUILD_ROOT";
pub const ENV_MAX_ATTEMPTS: &str = "SKETCHFORGE_MAX_ATTEMPTS";
pub const ENV_DOWNLOAD_DIR: &str = "SKETCHFORGE_DOWNLOAD_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("{var}={value} is not valid: {reason}")]
    InvalidEnv {
        var: String,
        value: String,
        reason: String,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// `[session]`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// JSONL ledger path; None keeps the log in memory
    pub log_path: Option<PathBuf>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeConfig {
    pub toolchain: ToolchainConfig,
    pub resolver: ResolverConfig,
    pub policy: LoopPolicy,
    /// Extra or replacement board profiles
    pub boards: Vec<BoardProfile>,
    pub session: SessionConfig,
}

impl ForgeConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read a TOML file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Apply `SKETCHFORGE_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from any variable source
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup(ENV_CLI_PATH) {
            self.toolchain.cli_path = PathBuf::from(path);
        }
        if let Some(root) = lookup(ENV_BUILD_ROOT) {
            self.toolchain.build_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup(ENV_DOWNLOAD_DIR) {
            self.resolver.download_dir = PathBuf::from(dir);
        }
        if let Some(raw) = lookup(ENV_MAX_ATTEMPTS) {
            self.policy.max_attempts = raw.trim().parse().map_err(|e: std::num::ParseIntError| {
                ConfigError::InvalidEnv {
                    var: ENV_MAX_ATTEMPTS.to_string(),
                    value: raw.clone(),
                    reason: e.to_string(),
                }
            })?;
        }
        Ok(())
    }

    /// Reject settings the loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.policy.max_attempts == 0 {
            return Err(ConfigError::Invalid("policy.max_attempts must be at least 1".into()));
        }
        if self.policy.repair_timeout_secs == 0 {
            return Err(ConfigError::Invalid("policy.repair_timeout_secs must be positive".into()));
        }
        let timeouts = [
            ("compile_timeout_secs", self.toolchain.compile_timeout_secs),
            ("upload_timeout_secs", self.toolchain.upload_timeout_secs),
            ("library_timeout_secs", self.toolchain.library_timeout_secs),
            ("query_timeout_secs", self.toolchain.query_timeout_secs),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, secs)| *secs == 0) {
            return Err(ConfigError::Invalid(format!("toolchain.{name} must be positive")));
        }
        if self.toolchain.compile_flags().is_none() {
            return Err(ConfigError::Invalid(format!(
                "toolchain.extra_compile_flags has unbalanced quotes: {}",
                self.toolchain.extra_compile_flags
            )));
        }
        for board in &self.boards {
            if board.fqbn.split(':').filter(|part| !part.is_empty()).count() < 3 {
                return Err(ConfigError::Invalid(format!(
                    "board '{}' has malformed FQBN '{}'",
                    board.name, board.fqbn
                )));
            }
        }
        Ok(())
    }

    /// Built-in catalog extended with configured boards
    pub fn catalog(&self) -> BoardCatalog {
        let mut catalog = BoardCatalog::builtin();
        catalog.extend(self.boards.iter().cloned());
        catalog
    }
}
