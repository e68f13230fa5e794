//! Port selection, upload, and session behavior across runs

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{serial_port, uno, FakeIndex, FakePorts, FakeToolchain, MockRepair, BLINK_FIXED, BLINK_TYPO};
use orchestration::error::{FailureKind, SessionError};
use orchestration::fix_loop::{FixLoop, LoopPolicy, LoopState, RepairError};
use orchestration::resolver::{LibraryLocks, LibraryResolver};
use orchestration::session::BuildSession;
use orchestration::session_log::{LogEvent, SessionLog};
use orchestration::source::SourceOrigin;
use orchestration::toolchain::{BuildArtifact, DetectedPort, PortId, UploadStatus};
use orchestration::upload::{PortSelectionError, UploadCoordinator, UploadError};

fn coordinator(toolchain: Arc<FakeToolchain>, ports: Vec<DetectedPort>) -> UploadCoordinator {
    UploadCoordinator::new(toolchain, Arc::new(FakePorts::new(ports)))
}

fn uno_artifact() -> BuildArtifact {
    BuildArtifact {
        dir: PathBuf::from("/tmp/out/blink/rev-2"),
        sketch_dir: PathBuf::from("/tmp/sketches/blink"),
        fqbn: "arduino:avr:uno".to_string(),
        revision: 2,
    }
}

/// Test: the one port with the board's VID is selected automatically
#[tokio::test]
async fn test_single_vid_match_auto_selects() {
    let toolchain = Arc::new(FakeToolchain::failing_on("never"));
    let uploader = coordinator(
        toolchain.clone(),
        vec![
            serial_port("/dev/ttyS0", None, None),
            serial_port("/dev/ttyACM0", Some(0x2341), Some(0x0043)),
            serial_port("/dev/ttyUSB0", Some(0x10C4), Some(0xEA60)),
        ],
    );

    let result = uploader
        .upload(&uno_artifact(), &uno(), None, &CancellationToken::new())
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.port, PortId::new("/dev/ttyACM0"));
    assert_eq!(result.protocol, "serial");
    assert_eq!(toolchain.uploads(), vec![PortId::new("/dev/ttyACM0")]);
}

/// Test: two matching ports are reported, never guessed
#[tokio::test]
async fn test_two_matches_are_ambiguous() {
    let toolchain = Arc::new(FakeToolchain::failing_on("never"));
    let uploader = coordinator(
        toolchain.clone(),
        vec![
            serial_port("/dev/ttyACM0", Some(0x2341), Some(0x0043)),
            serial_port("/dev/ttyACM1", Some(0x2341), Some(0x0001)),
        ],
    );

    let err = uploader
        .upload(&uno_artifact(), &uno(), None, &CancellationToken::new())
        .await
        .unwrap_err();

    match &err {
        UploadError::PortSelection(PortSelectionError::AmbiguousPort { candidates, .. }) => {
            assert_eq!(candidates.len(), 2)
        }
        other => panic!("expected ambiguous port, got {other:?}"),
    }
    assert_eq!(err.failure_kind(), FailureKind::AmbiguousPort);
    assert!(toolchain.uploads().is_empty());
}

/// Test: no plausible port is its own failure
#[tokio::test]
async fn test_no_port_found() {
    let toolchain = Arc::new(FakeToolchain::failing_on("never"));
    let uploader = coordinator(toolchain, vec![serial_port("/dev/ttyUSB0", Some(0x10C4), Some(0xEA60))]);

    let err = uploader
        .select_port(&uno(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PortSelectionError::NoPortFound { .. }));
}

/// Test: an explicit port bypasses selection, and a rejection is not retried
#[tokio::test]
async fn test_override_and_rejection() {
    let toolchain = Arc::new(
        FakeToolchain::failing_on("never").with_upload_status(UploadStatus::Rejected { exit_code: Some(1) }),
    );
    let uploader = coordinator(toolchain.clone(), vec![]);

    let result = uploader
        .upload(
            &uno_artifact(),
            &uno(),
            Some(PortId::new("COM4")),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(!result.success());
    assert_eq!(toolchain.uploads(), vec![PortId::new("COM4")]);
}

/// Test: an artifact built for another board is refused
#[tokio::test]
async fn test_artifact_for_other_board_refused() {
    let toolchain = Arc::new(FakeToolchain::failing_on("never"));
    let uploader = coordinator(toolchain.clone(), vec![]);
    let mut artifact = uno_artifact();
    artifact.fqbn = "esp32:esp32:esp32".to_string();

    let err = uploader
        .upload(&artifact, &uno(), Some(PortId::new("COM4")), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, UploadError::BoardMismatch { .. }));
    assert!(toolchain.uploads().is_empty());
}

fn session(
    toolchain: Arc<FakeToolchain>,
    repair: MockRepair,
    ports: Vec<DetectedPort>,
    log: SessionLog,
    dir: &TempDir,
) -> BuildSession {
    let locks = LibraryLocks::new();
    let resolver = LibraryResolver::new(
        Arc::new(FakeIndex::new()),
        locks.directory(dir.path().join("libraries")),
        dir.path().join("downloads"),
    );
    let fix_loop = FixLoop::new(toolchain.clone(), resolver, Arc::new(repair), LoopPolicy::default());
    BuildSession::new(
        "blink",
        BLINK_TYPO,
        uno(),
        Vec::new(),
        fix_loop,
        coordinator(toolchain, ports),
        log,
    )
}

/// Test: queued edits apply between runs and attempt numbers keep counting
#[tokio::test]
async fn test_edits_apply_while_idle_and_seq_continues() {
    let dir = TempDir::new().unwrap();
    let toolchain = Arc::new(FakeToolchain::failing_on("digitalWrte"));
    let mut repair = MockRepair::new();
    repair
        .expect_propose()
        .times(1)
        .returning(|_| Err(RepairError::Unavailable("offline".into())));

    let mut session = session(toolchain.clone(), repair, vec![], SessionLog::in_memory("edits"), &dir);
    let edits = session.edit_handle();

    let first = session.run().await.unwrap();
    assert_eq!(first.state, LoopState::Aborted);
    assert_eq!(first.failure, Some(FailureKind::RepairFailed));

    edits.submit(BLINK_FIXED);
    assert_eq!(session.source().revision(), 1, "edit must wait for the next run");

    let second = session.run().await.unwrap();
    assert!(second.succeeded());
    assert_eq!(session.source().revision(), 2);
    assert_eq!(session.source().origin(), SourceOrigin::UserEdit);
    assert_eq!(session.runs(), 2);
    assert_eq!(edits.pending(), 0);

    let seqs: Vec<u64> = session.history().all().iter().map(|a| a.seq).collect();
    assert_eq!(seqs, vec![1, 2]);
    assert!(session
        .log()
        .entries()
        .iter()
        .any(|e| matches!(e.event, LogEvent::EditApplied { origin: SourceOrigin::UserEdit })));
    assert_eq!(session.last_outcome().map(|o| o.state), Some(LoopState::Succeeded));
}

/// Test: the persisted log replays every run, compile and upload
#[tokio::test]
async fn test_persisted_log_replays_build_and_upload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("logs/blink.jsonl");
    let toolchain = Arc::new(FakeToolchain::failing_on("digitalWrte"));
    let mut repair = MockRepair::new();
    repair
        .expect_propose()
        .times(1)
        .returning(|_| Ok(orchestration::fix_loop::FixProposal::new(BLINK_FIXED, "typo")));

    let log = SessionLog::open(&path, "persisted").unwrap();
    let ports = vec![serial_port("/dev/ttyACM0", Some(0x2341), Some(0x0043))];
    let mut session = session(toolchain.clone(), repair, ports, log, &dir);

    let outcome = session.run().await.unwrap();
    let artifact = outcome.artifact().cloned().expect("succeeded run has an artifact");
    let result = session.upload(&artifact, None).await.unwrap();
    assert!(result.success());

    let replayed = SessionLog::replay(&path).unwrap();
    assert_eq!(replayed.len(), session.log().len());
    assert_eq!(replayed.first().map(|e| e.event.kind()), Some("run_started"));
    assert_eq!(replayed.last().map(|e| e.event.kind()), Some("upload"));
    let compiles = replayed
        .iter()
        .filter(|e| matches!(e.event, LogEvent::CompileAttempt(_)))
        .count();
    assert_eq!(compiles, 2);
    assert!(replayed.iter().all(|e| e.session_id == "persisted"));
}

/// Test: a failed port selection is logged and returned as a session error
#[tokio::test]
async fn test_session_upload_failure_logged() {
    let dir = TempDir::new().unwrap();
    let toolchain = Arc::new(FakeToolchain::failing_on("never"));
    let mut session = session(toolchain, MockRepair::new(), vec![], SessionLog::in_memory("no-port"), &dir);

    let err = session.upload(&uno_artifact(), None).await.unwrap_err();
    assert!(matches!(err, SessionError::Upload(_)));
    assert_eq!(err.failure_kind(), Some(FailureKind::NoPortFound));
    assert!(session
        .log()
        .entries()
        .iter()
        .any(|e| matches!(&e.event, LogEvent::Upload { result: None, error: Some(_) })));
}
