//! Library Resolver
//!
//! Ensures every dependency of a sketch is installed in the toolchain's
//! library directory, falling back through two tiers:
//!
//! ```text
//! dependency
//!   ├─ already installed            → AlreadyInstalled
//!   ├─ primary index install+verify → PrimaryIndex
//!   ├─ mirror archive install+verify → SourceMirror
//!   └─ all tiers failed             → collected into ResolutionError
//! ```
//!
//! Dependencies are attempted independently; failures are aggregated, never
//! fail-fast. Every install happens under the [`LibraryDirectory`] lock.

pub mod lock;
pub mod mirror;

pub use lock::{LibraryDirectory, LibraryLocks};
pub use mirror::{best_candidate, normalize_library_name, GithubMirror, LibraryMirror, MirrorRepo};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::board::BoardProfile;
use crate::source::{is_core_header, Dependency};
use crate::toolchain::{ArduinoCli, CommandOutcome, LibraryRecord, ToolchainError};

/// Primary package index operations (the Arduino Library Manager)
#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn installed(&self, cancel: &CancellationToken)
        -> Result<Vec<LibraryRecord>, ToolchainError>;

    /// Candidate library names for a query, best ranked first
    async fn search(&self, query: &str, cancel: &CancellationToken)
        -> Result<Vec<String>, ToolchainError>;

    async fn install(&self, spec: &str, cancel: &CancellationToken)
        -> Result<CommandOutcome, ToolchainError>;

    async fn install_zip(&self, archive: &Path, cancel: &CancellationToken)
        -> Result<CommandOutcome, ToolchainError>;
}

#[async_trait]
impl PackageIndex for ArduinoCli {
    async fn installed(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LibraryRecord>, ToolchainError> {
        self.installed_libraries(cancel).await
    }

    async fn search(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ToolchainError> {
        self.search_library(query, cancel).await
    }

    async fn install(
        &self,
        spec: &str,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        self.install_library(spec, cancel).await
    }

    async fn install_zip(
        &self,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        self.install_library_zip(archive, cancel).await
    }
}

/// Which tier satisfied a dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    AlreadyInstalled,
    PrimaryIndex,
    SourceMirror,
}

impl std::fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyInstalled => write!(f, "already_installed"),
            Self::PrimaryIndex => write!(f, "primary_index"),
            Self::SourceMirror => write!(f, "source_mirror"),
        }
    }
}

/// Install tiers that can fail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    PrimaryIndex,
    SourceMirror,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrimaryIndex => write!(f, "primary index"),
            Self::SourceMirror => write!(f, "source mirror"),
        }
    }
}

/// A dependency confirmed present in the library directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledLibrary {
    pub dependency: Dependency,
    /// Name under which the toolchain lists it
    pub installed_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub source: ResolutionSource,
}

/// Why one tier could not provide a dependency
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierFailure {
    pub tier: Tier,
    pub reason: String,
}

/// A dependency no tier could provide
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnresolvedDependency {
    pub dependency: Dependency,
    pub failures: Vec<TierFailure>,
}

impl std::fmt::Display for UnresolvedDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dependency)?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.tier, failure.reason)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error)]
pub enum ResolutionError {
    /// Some dependencies could not be installed by any tier
    #[error("{}", describe_unresolved(.unresolved))]
    Unresolved {
        unresolved: Vec<UnresolvedDependency>,
        /// Dependencies that did resolve in the same call
        resolved: Vec<InstalledLibrary>,
    },

    /// The toolchain itself failed (unavailable or cancelled)
    #[error(transparent)]
    Toolchain(#[from] ToolchainError),
}

fn describe_unresolved(unresolved: &[UnresolvedDependency]) -> String {
    let names: Vec<String> = unresolved.iter().map(|u| u.dependency.to_string()).collect();
    let noun = if names.len() == 1 { "dependency" } else { "dependencies" };
    format!("{} unresolved {noun}: {}", names.len(), names.join(", "))
}

impl ResolutionError {
    /// The dependencies that failed every tier
    pub fn unresolved(&self) -> Vec<&Dependency> {
        match self {
            Self::Unresolved { unresolved, .. } => {
                unresolved.iter().map(|u| &u.dependency).collect()
            }
            Self::Toolchain(_) => Vec::new(),
        }
    }
}

/// Resolver settings (`[resolver]` in the config file)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Where mirror archives are downloaded before install
    pub download_dir: PathBuf,
    pub mirror_enabled: bool,
    pub mirror_api_base: String,
    /// Host serving `<owner>/<repo>/zip/refs/heads/<branch>` archives
    pub mirror_archive_base: String,
    pub mirror_timeout_secs: u64,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            download_dir: std::env::temp_dir().join("sketchforge-downloads"),
            mirror_enabled: true,
            mirror_api_base: GithubMirror::DEFAULT_API_BASE.to_string(),
            mirror_archive_base: GithubMirror::DEFAULT_ARCHIVE_BASE.to_string(),
            mirror_timeout_secs: 60,
        }
    }
}

type TierResult = Result<Result<LibraryRecord, String>, ToolchainError>;

/// Two-tier library resolver.
#[derive(Clone)]
pub struct LibraryResolver {
    index: Arc<dyn PackageIndex>,
    mirror: Option<Arc<dyn LibraryMirror>>,
    directory: LibraryDirectory,
    download_dir: PathBuf,
}

impl LibraryResolver {
    pub fn new(
        index: Arc<dyn PackageIndex>,
        directory: LibraryDirectory,
        download_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            index,
            mirror: None,
            directory,
            download_dir: download_dir.into(),
        }
    }

    /// Enable the secondary tier
    pub fn with_mirror(mut self, mirror: Arc<dyn LibraryMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    pub fn directory(&self) -> &LibraryDirectory {
        &self.directory
    }

    /// Make sure every dependency is installed.
    ///
    /// Returns the installed set when all resolve. Otherwise returns
    /// [`ResolutionError::Unresolved`] listing every failure with per-tier
    /// notes. Toolchain unavailability and cancellation abort immediately.
    pub async fn ensure(
        &self,
        dependencies: &[Dependency],
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<Vec<InstalledLibrary>, ResolutionError> {
        let wanted: Vec<&Dependency> = dependencies
            .iter()
            .filter(|d| !d.header.as_deref().is_some_and(|h| is_core_header(h, board)))
            .collect();
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolchainError::Cancelled.into()),
            guard = self.directory.lock() => guard,
        };
        debug!(
            library_dir = %self.directory.path().display(),
            fqbn = %board.fqbn,
            count = wanted.len(),
            "Resolving dependencies"
        );

        let mut listing = self.listing(cancel).await?;
        let mut resolved = Vec::new();
        let mut unresolved = Vec::new();

        for dep in wanted {
            if let Some(record) = find_installed(&listing, dep, None) {
                debug!(dependency = %dep, installed = %record.name, "Already installed");
                resolved.push(installed(dep, record, ResolutionSource::AlreadyInstalled));
                continue;
            }

            let mut failures = Vec::new();

            match self.try_primary(dep, cancel).await? {
                Ok(record) => {
                    info!(
                        dependency = %dep,
                        installed = %record.name,
                        "Installed from primary index"
                    );
                    resolved.push(installed(dep, &record, ResolutionSource::PrimaryIndex));
                    listing = self.listing(cancel).await?;
                    continue;
                }
                Err(reason) => {
                    warn!(
                        dependency = %dep,
                        reason = %reason,
                        "Primary index failed, trying mirror"
                    );
                    failures.push(TierFailure {
                        tier: Tier::PrimaryIndex,
                        reason,
                    });
                }
            }

            match self.try_mirror(dep, cancel).await? {
                Ok(record) => {
                    info!(
                        dependency = %dep,
                        installed = %record.name,
                        "Installed from source mirror"
                    );
                    resolved.push(installed(dep, &record, ResolutionSource::SourceMirror));
                    listing = self.listing(cancel).await?;
                }
                Err(reason) => {
                    warn!(dependency = %dep, reason = %reason, "Source mirror failed");
                    failures.push(TierFailure {
                        tier: Tier::SourceMirror,
                        reason,
                    });
                    unresolved.push(UnresolvedDependency {
                        dependency: dep.clone(),
                        failures,
                    });
                }
            }
        }

        if unresolved.is_empty() {
            Ok(resolved)
        } else {
            Err(ResolutionError::Unresolved {
                unresolved,
                resolved,
            })
        }
    }

    /// Installed listing; a failed listing counts as empty so installs are still tried
    async fn listing(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<LibraryRecord>, ToolchainError> {
        match self.index.installed(cancel).await {
            Ok(list) => Ok(list),
            Err(e) if is_hard(&e) => Err(e),
            Err(e) => {
                warn!(error = %e, "Could not list installed libraries");
                Ok(Vec::new())
            }
        }
    }

    async fn try_primary(&self, dep: &Dependency, cancel: &CancellationToken) -> TierResult {
        let candidates = match self.index.search(&dep.name, cancel).await {
            Ok(c) => c,
            Err(e) => return soft(e),
        };
        let Some(best) = best_candidate(dep, &candidates) else {
            return Ok(Err(format!("no match for '{}' in library index", dep.name)));
        };

        let spec = match &dep.version {
            Some(v) => format!("{best}@{v}"),
            None => best.clone(),
        };
        let outcome = match self.index.install(&spec, cancel).await {
            Ok(o) => o,
            Err(e) => return soft(e),
        };
        if !outcome.success {
            return Ok(Err(format!("install of '{spec}' failed: {}", last_line(&outcome.output))));
        }
        self.verify(dep, Some(best), cancel).await
    }

    async fn try_mirror(&self, dep: &Dependency, cancel: &CancellationToken) -> TierResult {
        let Some(mirror) = &self.mirror else {
            return Ok(Err("source mirror disabled".to_string()));
        };

        let found = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolchainError::Cancelled),
            found = mirror.find(dep) => found,
        };
        let repo = match found {
            Ok(Some(repo)) => repo,
            Ok(None) => return Ok(Err(format!("no repository found for '{}'", dep.name))),
            Err(e) => return Ok(Err(e.to_string())),
        };

        let archive = self.download_dir.join(repo.archive_file_name());
        let result = self.fetch_and_install(mirror.as_ref(), &repo, &archive, cancel).await;
        remove_archive(&archive).await;

        match result? {
            Ok(()) => self.verify(dep, Some(&repo.name), cancel).await,
            Err(reason) => Ok(Err(reason)),
        }
    }

    async fn fetch_and_install(
        &self,
        mirror: &dyn LibraryMirror,
        repo: &MirrorRepo,
        archive: &Path,
        cancel: &CancellationToken,
    ) -> Result<Result<(), String>, ToolchainError> {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ToolchainError::Cancelled),
            fetched = mirror.fetch(repo, archive) => fetched,
        };
        match fetched {
            Ok(bytes) => debug!(repo = %repo.full_name(), bytes, "Downloaded archive"),
            Err(e) => return Ok(Err(e.to_string())),
        }

        match self.index.install_zip(archive, cancel).await {
            Ok(outcome) if outcome.success => Ok(Ok(())),
            Ok(outcome) => Ok(Err(format!(
                "archive install of {} failed: {}",
                repo.full_name(),
                last_line(&outcome.output)
            ))),
            Err(e) => soft(e).map(|r| r.map(|_| ())),
        }
    }

    async fn verify(
        &self,
        dep: &Dependency,
        installed_as: Option<&String>,
        cancel: &CancellationToken,
    ) -> TierResult {
        let listing = match self.index.installed(cancel).await {
            Ok(l) => l,
            Err(e) => return soft(e),
        };
        Ok(find_installed(&listing, dep, installed_as.map(String::as_str))
            .cloned()
            .ok_or_else(|| format!("'{}' not listed after install", dep.name)))
    }
}

fn installed(
    dep: &Dependency,
    record: &LibraryRecord,
    source: ResolutionSource,
) -> InstalledLibrary {
    InstalledLibrary {
        dependency: dep.clone(),
        installed_name: record.name.clone(),
        version: record.version.clone(),
        source,
    }
}

/// Listing entry satisfying a dependency: name match (case-insensitive,
/// raw or normalized) or the header it was inferred from
fn find_installed<'a>(
    listing: &'a [LibraryRecord],
    dep: &Dependency,
    installed_as: Option<&str>,
) -> Option<&'a LibraryRecord> {
    let wanted = normalize_library_name(&dep.name);
    listing.iter().find(|record| {
        record.name.eq_ignore_ascii_case(&dep.name)
            || installed_as.is_some_and(|n| {
                record.name.eq_ignore_ascii_case(n)
                    || normalize_library_name(&record.name) == normalize_library_name(n)
            })
            || normalize_library_name(&record.name) == wanted
            || dep
                .header
                .as_deref()
                .is_some_and(|h| record.provides_includes.iter().any(|p| p == h))
    })
}

/// Cancellation and unavailability abort resolution; anything else is a tier note
fn is_hard(err: &ToolchainError) -> bool {
    err.is_fatal() || matches!(err, ToolchainError::Cancelled)
}

fn soft(err: ToolchainError) -> TierResult {
    if is_hard(&err) {
        Err(err)
    } else {
        Ok(Err(err.to_string()))
    }
}

fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("no output")
}

/// Archives are deleted whatever the install outcome
async fn remove_archive(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "Removed archive"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove archive"),
    }
}
