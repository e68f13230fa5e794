//! Subcommand implementations

use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use orchestration::board::{BoardCatalog, BoardProfile};
use orchestration::config::ForgeConfig;
use orchestration::fix_loop::{BuildOutcome, FixLoop};
use orchestration::resolver::{GithubMirror, LibraryLocks, LibraryResolver};
use orchestration::session::BuildSession;
use orchestration::session_log::SessionLog;
use orchestration::source::Dependency;
use orchestration::toolchain::{ArduinoCli, PortEnumerator, PortId};
use orchestration::upload::UploadCoordinator;

use crate::repair_client::{HttpRepairClient, RepairEndpoint};

/// Options of `sketchforge build`
#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub sketch: PathBuf,
    pub board: String,
    pub upload: bool,
    pub port: Option<String>,
    pub max_attempts: Option<u32>,
    pub libraries: Vec<String>,
    pub session_log: Option<PathBuf>,
}

/// File config, then environment
pub fn load_config(path: Option<&Path>) -> Result<ForgeConfig> {
    let mut config = match path {
        Some(path) => ForgeConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ForgeConfig::default(),
    };
    config.apply_env().context("Invalid SKETCHFORGE_* environment")?;
    Ok(config)
}

pub fn find_board(catalog: &BoardCatalog, key: &str) -> Result<BoardProfile> {
    catalog
        .find(key)
        .cloned()
        .ok_or_else(|| anyhow!("Unknown board '{key}' (see `sketchforge boards`)"))
}

/// `Name` or `Name@version`
pub fn parse_library(spec: &str) -> Result<Dependency> {
    let spec = spec.trim();
    let (name, version) = match spec.rsplit_once('@') {
        Some((name, version)) => (name.trim(), Some(version.trim())),
        None => (spec, None),
    };
    if name.is_empty() || version.is_some_and(str::is_empty) {
        bail!("Malformed library spec '{spec}'");
    }
    let dep = Dependency::named(name);
    Ok(match version {
        Some(v) => dep.with_version(v),
        None => dep,
    })
}

fn exit_code(outcome: &BuildOutcome) -> ExitCode {
    match outcome.failure {
        None => ExitCode::SUCCESS,
        Some(kind) if kind.is_fatal() => ExitCode::from(2),
        Some(_) => ExitCode::from(1),
    }
}

pub async fn build(config: ForgeConfig, options: BuildOptions) -> Result<ExitCode> {
    let mut config = config;
    if let Some(max) = options.max_attempts {
        config.policy.max_attempts = max;
    }
    if let Some(path) = options.session_log.clone() {
        config.session.log_path = Some(path);
    }
    config.validate()?;

    let board = find_board(&config.catalog(), &options.board)?;
    let text = std::fs::read_to_string(&options.sketch)
        .with_context(|| format!("Failed to read sketch {}", options.sketch.display()))?;
    let name = options
        .sketch
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "sketch".to_string());
    let libraries = options
        .libraries
        .iter()
        .map(|spec| parse_library(spec))
        .collect::<Result<Vec<_>>>()?;

    let cli = Arc::new(ArduinoCli::new(config.toolchain.clone()));
    let locks = LibraryLocks::new();
    let mut resolver = LibraryResolver::new(
        cli.clone(),
        locks.directory(cli.config().library_dir()),
        config.resolver.download_dir.clone(),
    );
    if config.resolver.mirror_enabled {
        let mirror = GithubMirror::new(
            config.resolver.mirror_api_base.clone(),
            Duration::from_secs(config.resolver.mirror_timeout_secs),
        )
        .context("Failed to create mirror client")?
        .with_archive_base(config.resolver.mirror_archive_base.clone())
        .with_token(std::env::var("GITHUB_TOKEN").ok());
        resolver = resolver.with_mirror(Arc::new(mirror));
    }

    let repair = HttpRepairClient::new(RepairEndpoint::default())?;
    info!(
        url = %repair.endpoint().completions_url(),
        model = %repair.endpoint().model,
        "Repair endpoint"
    );

    let session_id = uuid::Uuid::new_v4().to_string();
    let log = match &config.session.log_path {
        Some(path) => SessionLog::open(path, session_id.clone())?,
        None => SessionLog::in_memory(session_id.clone()),
    };

    let fix_loop = FixLoop::new(cli.clone(), resolver, Arc::new(repair), config.policy.clone());
    let uploader = UploadCoordinator::new(cli.clone(), cli);
    let mut session = BuildSession::new(name, text, board, libraries, fix_loop, uploader, log);

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling build");
            cancel.cancel();
        }
    });

    info!(session = %session_id, board = %session.board(), "Starting build");
    let outcome = session.run().await?;
    println!("{outcome}");
    for diagnostic in outcome.diagnostics.iter().filter(|d| d.is_error()) {
        println!("  {diagnostic}");
    }
    if let Some(error) = &outcome.resolution_error {
        println!("  {error}");
    }

    if !outcome.succeeded() {
        return Ok(exit_code(&outcome));
    }
    if outcome.revision > 1 {
        std::fs::write(&options.sketch, session.source().text())
            .with_context(|| {
                format!("Failed to write repaired sketch {}", options.sketch.display())
            })?;
        println!("Wrote revision {} to {}", outcome.revision, options.sketch.display());
    }

    if options.upload {
        let artifact = outcome
            .artifact()
            .cloned()
            .ok_or_else(|| anyhow!("Succeeded build has no artifact"))?;
        let result = session
            .upload(&artifact, options.port.map(PortId::new))
            .await
            .context("Upload failed")?;
        println!("Upload to {} {}", result.port, result.status);
        if !result.success() {
            if !result.raw_output.trim().is_empty() {
                println!("{}", result.raw_output.trim_end());
            }
            return Ok(ExitCode::from(1));
        }
    }

    Ok(ExitCode::SUCCESS)
}

pub async fn ports(config: ForgeConfig, board: Option<String>) -> Result<ExitCode> {
    let cli = Arc::new(ArduinoCli::new(config.toolchain.clone()));
    let cancel = CancellationToken::new();
    let ports = match board {
        Some(key) => {
            let board = find_board(&config.catalog(), &key)?;
            UploadCoordinator::new(cli.clone(), cli)
                .candidates(&board, &cancel)
                .await?
        }
        None => cli.list_ports(&cancel).await?,
    };

    if ports.is_empty() {
        println!("No ports found");
    }
    for port in ports {
        let usb = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" {vid:04X}:{pid:04X}"),
            (Some(vid), None) => format!(" {vid:04X}"),
            _ => String::new(),
        };
        let label = port.label.as_deref().unwrap_or("");
        println!("{} ({}){usb} {label}", port.address, port.protocol);
    }
    Ok(ExitCode::SUCCESS)
}

pub fn boards(config: &ForgeConfig) -> ExitCode {
    for board in config.catalog().boards() {
        println!("{:<32} {:<28} {} baud", board.name, board.fqbn, board.default_baud);
    }
    ExitCode::SUCCESS
}

pub fn replay(log: &Path, revision: Option<u32>) -> Result<ExitCode> {
    let entries = SessionLog::replay(log)?;
    if entries.is_empty() {
        bail!("No entries in {}", log.display());
    }
    for entry in entries
        .iter()
        .filter(|e| revision.map_or(true, |r| e.revision == r))
    {
        println!("{}", entry.to_log_line());
    }
    Ok(ExitCode::SUCCESS)
}
