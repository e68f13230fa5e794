//! In-memory fakes of the toolchain, package index, mirror and port list

#![allow(dead_code)]

use async_trait::async_trait;
use mockall::mock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use orchestration::board::{BoardCatalog, BoardProfile};
use orchestration::fix_loop::{FixProposal, RepairCollaborator, RepairError, RepairRequest};
use orchestration::resolver::{LibraryMirror, MirrorRepo, PackageIndex};
use orchestration::resolver::mirror::MirrorError;
use orchestration::source::{Dependency, SourceUnit};
use orchestration::toolchain::{
    BuildArtifact, CommandOutcome, CompileOutput, DetectedPort, LibraryRecord, PortEnumerator,
    PortId, ProcessStatus, Toolchain, ToolchainError, UploadResult, UploadStatus,
};

mock! {
    pub Repair {}

    #[async_trait]
    impl RepairCollaborator for Repair {
        async fn propose(&self, request: &RepairRequest) -> Result<FixProposal, RepairError>;
    }
}

pub fn uno() -> BoardProfile {
    BoardCatalog::builtin()
        .find("arduino:avr:uno")
        .cloned()
        .expect("uno is built in")
}

pub const BLINK_TYPO: &str = "void setup() {\n  pinMode(13, OUTPUT);\n}\n\nvoid loop() {\n  digitalWrte(13, HIGH);\n}\n";
pub const BLINK_FIXED: &str = "void setup() {\n  pinMode(13, OUTPUT);\n}\n\nvoid loop() {\n  digitalWrite(13, HIGH);\n}\n";

pub fn typo_error(file: &str) -> String {
    format!(
        "{file}: In function 'void loop()':\n{file}:6:3: error: 'digitalWrte' was not declared in this scope\n   digitalWrte(13, HIGH);\n   ^~~~~~~~~~~\n"
    )
}

/// What a compile of some text should report
pub enum CompileScript {
    /// Exit 0
    Pass,
    /// Exit 1 with this output
    Fail(String),
    /// The toolchain itself is broken
    Unavailable(String),
    /// Block until cancelled
    Hang,
}

type CompileRule = Box<dyn Fn(&str) -> CompileScript + Send + Sync>;

/// Toolchain whose compile result is a function of the sketch text
pub struct FakeToolchain {
    rule: CompileRule,
    compiles: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    uploads: Mutex<Vec<PortId>>,
    upload_status: UploadStatus,
}

impl FakeToolchain {
    pub fn new(rule: impl Fn(&str) -> CompileScript + Send + Sync + 'static) -> Self {
        Self {
            rule: Box::new(rule),
            compiles: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            uploads: Mutex::new(Vec::new()),
            upload_status: UploadStatus::Succeeded,
        }
    }

    /// Compiles pass unless the text contains `marker`
    pub fn failing_on(marker: &'static str) -> Self {
        Self::new(move |text| {
            if text.contains(marker) {
                CompileScript::Fail(typo_error("/tmp/sketchforge/blink/blink.ino"))
            } else {
                CompileScript::Pass
            }
        })
    }

    pub fn with_upload_status(mut self, status: UploadStatus) -> Self {
        self.upload_status = status;
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<PortId> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl Toolchain for FakeToolchain {
    async fn compile(
        &self,
        source: &SourceUnit,
        board: &BoardProfile,
        cancel: &CancellationToken,
    ) -> Result<CompileOutput, ToolchainError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let script = (self.rule)(source.text());
        let result = match script {
            CompileScript::Pass => Ok(CompileOutput {
                status: ProcessStatus::Exited(Some(0)),
                raw_output: "Sketch uses 924 bytes (2%) of program storage space.\n".to_string(),
                duration: Duration::from_millis(5),
                artifact: Some(BuildArtifact {
                    dir: PathBuf::from(format!(
                        "/tmp/out/{}/rev-{}",
                        source.name(),
                        source.revision()
                    )),
                    sketch_dir: PathBuf::from(format!("/tmp/sketches/{}", source.name())),
                    fqbn: board.fqbn.clone(),
                    revision: source.revision(),
                }),
            }),
            CompileScript::Fail(output) => Ok(CompileOutput {
                status: ProcessStatus::Exited(Some(1)),
                raw_output: output,
                duration: Duration::from_millis(5),
                artifact: None,
            }),
            CompileScript::Unavailable(reason) => Err(ToolchainError::unavailable(reason)),
            CompileScript::Hang => {
                tokio::select! {
                    _ = cancel.cancelled() => Err(ToolchainError::Cancelled),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => {
                        Err(ToolchainError::unavailable("hang outlived the test"))
                    }
                }
            }
        };

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn upload(
        &self,
        _artifact: &BuildArtifact,
        port: &PortId,
        board: &BoardProfile,
        _cancel: &CancellationToken,
    ) -> Result<UploadResult, ToolchainError> {
        self.uploads.lock().unwrap().push(port.clone());
        Ok(UploadResult {
            port: port.clone(),
            protocol: board.preferred_protocol().to_string(),
            status: self.upload_status,
            raw_output: String::new(),
            duration_ms: 3,
        })
    }
}

/// Library Manager stand-in
#[derive(Default)]
pub struct FakeIndex {
    /// Libraries `install` can provide, by name
    available: HashMap<String, LibraryRecord>,
    /// Libraries an archive install provides, by archive file name
    archives: HashMap<String, LibraryRecord>,
    installed: Mutex<Vec<LibraryRecord>>,
    installs: Mutex<Vec<String>>,
    zip_installs: Mutex<Vec<(PathBuf, bool)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    install_delay: Duration,
}

pub fn library(name: &str, includes: &[&str]) -> LibraryRecord {
    LibraryRecord {
        name: name.to_string(),
        version: Some("1.0.0".to_string()),
        provides_includes: includes.iter().map(|s| s.to_string()).collect(),
    }
}

impl FakeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_available(mut self, record: LibraryRecord) -> Self {
        self.available.insert(record.name.clone(), record);
        self
    }

    pub fn with_installed(self, record: LibraryRecord) -> Self {
        self.installed.lock().unwrap().push(record);
        self
    }

    pub fn with_archive(mut self, archive_name: &str, record: LibraryRecord) -> Self {
        self.archives.insert(archive_name.to_string(), record);
        self
    }

    pub fn with_install_delay(mut self, delay: Duration) -> Self {
        self.install_delay = delay;
        self
    }

    pub fn installs(&self) -> Vec<String> {
        self.installs.lock().unwrap().clone()
    }

    /// Archive paths handed to `install_zip`, and whether each existed then
    pub fn zip_installs(&self) -> Vec<(PathBuf, bool)> {
        self.zip_installs.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn busy(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.install_delay.is_zero() {
            tokio::time::sleep(self.install_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl PackageIndex for FakeIndex {
    async fn installed(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<LibraryRecord>, ToolchainError> {
        Ok(self.installed.lock().unwrap().clone())
    }

    async fn search(
        &self,
        query: &str,
        _cancel: &CancellationToken,
    ) -> Result<Vec<String>, ToolchainError> {
        let query = query.to_ascii_lowercase();
        let mut names: Vec<String> = self
            .available
            .keys()
            .filter(|name| name.to_ascii_lowercase().contains(&query))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn install(
        &self,
        spec: &str,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        self.busy().await;
        self.installs.lock().unwrap().push(spec.to_string());
        let name = spec.split('@').next().unwrap_or(spec);
        match self.available.get(name) {
            Some(record) => {
                self.installed.lock().unwrap().push(record.clone());
                Ok(CommandOutcome {
                    success: true,
                    output: format!("Installed {spec}"),
                })
            }
            None => Ok(CommandOutcome {
                success: false,
                output: format!("Error installing {spec}: library not found"),
            }),
        }
    }

    async fn install_zip(
        &self,
        archive: &Path,
        _cancel: &CancellationToken,
    ) -> Result<CommandOutcome, ToolchainError> {
        self.busy().await;
        self.zip_installs
            .lock()
            .unwrap()
            .push((archive.to_path_buf(), archive.exists()));
        let file_name = archive
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match self.archives.get(&file_name) {
            Some(record) => {
                self.installed.lock().unwrap().push(record.clone());
                Ok(CommandOutcome {
                    success: true,
                    output: "Library installed".to_string(),
                })
            }
            None => Ok(CommandOutcome {
                success: false,
                output: "Error: invalid library archive".to_string(),
            }),
        }
    }
}

/// Mirror serving fixed repositories by dependency name
#[derive(Default)]
pub struct FakeMirror {
    repos: HashMap<String, MirrorRepo>,
}

impl FakeMirror {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_repo(mut self, dependency: &str, owner: &str, name: &str) -> Self {
        self.repos.insert(
            dependency.to_ascii_lowercase(),
            MirrorRepo {
                owner: owner.to_string(),
                name: name.to_string(),
                default_branch: "master".to_string(),
            },
        );
        self
    }
}

#[async_trait]
impl LibraryMirror for FakeMirror {
    async fn find(&self, dependency: &Dependency) -> Result<Option<MirrorRepo>, MirrorError> {
        Ok(self.repos.get(&dependency.key()).cloned())
    }

    async fn fetch(&self, _repo: &MirrorRepo, dest: &Path) -> Result<u64, MirrorError> {
        let io = |source| MirrorError::Io {
            path: dest.to_path_buf(),
            source,
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(io)?;
        }
        std::fs::write(dest, b"PK\x03\x04fake").map_err(io)?;
        Ok(8)
    }
}

/// Fixed port list
pub struct FakePorts {
    ports: Vec<DetectedPort>,
}

impl FakePorts {
    pub fn new(ports: Vec<DetectedPort>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl PortEnumerator for FakePorts {
    async fn list_ports(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<Vec<DetectedPort>, ToolchainError> {
        Ok(self.ports.clone())
    }
}

pub fn serial_port(address: &str, vid: Option<u16>, pid: Option<u16>) -> DetectedPort {
    DetectedPort {
        address: PortId::new(address),
        protocol: "serial".to_string(),
        label: Some(address.to_string()),
        vid,
        pid,
        matching_fqbns: Vec::new(),
    }
}
