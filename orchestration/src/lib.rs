//! SketchForge orchestration library
//!
//! Build orchestration and auto-fix loop for Arduino sketches:
//! - Library resolution with a primary index and a source-archive mirror
//! - Compilation through `arduino-cli` with timeouts and cancellation
//! - Diagnostic parsing and classification of GCC-style compiler output
//! - A bounded compile → diagnose → repair loop driven by a state machine
//! - Port selection and upload
//! - An append-only JSON-lines session log
//!
//! # Usage
//!
//! ```ignore
//! let cli = Arc::new(ArduinoCli::new(config.toolchain.clone()));
//! let locks = LibraryLocks::new();
//! let library_dir = locks.directory(config.toolchain.library_dir());
//! let resolver = LibraryResolver::new(cli.clone(), library_dir, &config.resolver.download_dir);
//! let fix_loop = FixLoop::new(cli.clone(), resolver, repair, config.policy.clone());
//! let uploader = UploadCoordinator::new(cli.clone(), cli);
//! let mut session = BuildSession::new("blink", text, board, vec![], fix_loop, uploader, log);
//! let outcome = session.run().await?;
//! ```

pub mod board;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod fix_loop;
pub mod resolver;
pub mod session;
pub mod session_log;
pub mod source;
pub mod toolchain;
pub mod upload;

pub use board::{BoardCatalog, BoardProfile, UsbId};
pub use config::{ConfigError, ForgeConfig};
pub use diagnostics::{Diagnostic, DiagnosticClass, DiagnosticParser, Severity};
pub use error::{FailureKind, SessionError};
pub use fix_loop::{
    AttemptHistory, BuildOutcome, CompileAttempt, FixLoop, FixProposal, LoopPolicy, LoopState,
    RepairCollaborator, RepairError, RepairRequest, UnresolvedPolicy,
};
pub use resolver::{LibraryLocks, LibraryResolver, PackageIndex, ResolutionError};
pub use session::{BuildSession, CancelHandle, EditQueue};
pub use session_log::{LogEntry, LogEvent, SessionLog};
pub use source::{Dependency, SourceOrigin, SourceUnit};
pub use toolchain::{ArduinoCli, BuildArtifact, PortId, Toolchain, ToolchainError, UploadResult};
pub use upload::{PortSelectionError, UploadCoordinator, UploadError};
