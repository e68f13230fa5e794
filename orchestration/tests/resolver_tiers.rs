//! Library resolver tier fallback, aggregation and directory locking

mod common;

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use common::{library, uno, FakeIndex, FakeMirror};
use orchestration::resolver::{
    LibraryLocks, LibraryResolver, ResolutionError, ResolutionSource, Tier,
};
use orchestration::source::Dependency;
use orchestration::toolchain::ToolchainError;

const NEOPIXEL_ARCHIVE: &str = "adafruit-Adafruit_NeoPixel-master.zip";

fn resolver(index: Arc<FakeIndex>, dir: &TempDir, locks: &LibraryLocks) -> LibraryResolver {
    LibraryResolver::new(
        index,
        locks.directory(dir.path().join("libraries")),
        dir.path().join("downloads"),
    )
}

/// Test: N dependencies with M failing report exactly the M failures
#[tokio::test]
async fn test_aggregate_error_lists_only_failures() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(
        FakeIndex::new()
            .with_available(library("Servo", &["Servo.h"]))
            .with_archive(
                NEOPIXEL_ARCHIVE,
                library("Adafruit NeoPixel", &["Adafruit_NeoPixel.h"]),
            ),
    );
    let mirror = FakeMirror::new()
        .with_repo("Adafruit_NeoPixel", "adafruit", "Adafruit_NeoPixel")
        .with_repo("Foo", "someone", "foo-lib");
    let resolver = resolver(index.clone(), &dir, &LibraryLocks::new()).with_mirror(Arc::new(mirror));

    let deps = vec![
        Dependency::from_header("Servo.h"),
        Dependency::from_header("DHT.h"),
        Dependency::from_header("Adafruit_NeoPixel.h"),
        Dependency::named("Foo"),
    ];
    let err = resolver
        .ensure(&deps, &uno(), &CancellationToken::new())
        .await
        .unwrap_err();

    let ResolutionError::Unresolved { unresolved, resolved } = &err else {
        panic!("expected unresolved dependencies, got {err:?}");
    };
    let failed: Vec<&str> = unresolved.iter().map(|u| u.dependency.name.as_str()).collect();
    assert_eq!(failed, vec!["DHT", "Foo"]);
    for u in unresolved {
        let tiers: Vec<Tier> = u.failures.iter().map(|f| f.tier).collect();
        assert_eq!(tiers, vec![Tier::PrimaryIndex, Tier::SourceMirror]);
    }

    let sources: Vec<(String, ResolutionSource)> = resolved
        .iter()
        .map(|l| (l.installed_name.clone(), l.source))
        .collect();
    assert_eq!(
        sources,
        vec![
            ("Servo".to_string(), ResolutionSource::PrimaryIndex),
            ("Adafruit NeoPixel".to_string(), ResolutionSource::SourceMirror),
        ]
    );
    assert!(err.to_string().starts_with("2 unresolved dependencies: DHT, Foo"));
}

/// Test: downloaded archives are removed whether the install worked or not
#[tokio::test]
async fn test_archives_deleted_after_install() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(FakeIndex::new().with_archive(
        NEOPIXEL_ARCHIVE,
        library("Adafruit NeoPixel", &["Adafruit_NeoPixel.h"]),
    ));
    let mirror = FakeMirror::new()
        .with_repo("Adafruit_NeoPixel", "adafruit", "Adafruit_NeoPixel")
        .with_repo("Foo", "someone", "foo-lib");
    let resolver = resolver(index.clone(), &dir, &LibraryLocks::new()).with_mirror(Arc::new(mirror));

    let deps = vec![Dependency::from_header("Adafruit_NeoPixel.h"), Dependency::named("Foo")];
    let _ = resolver.ensure(&deps, &uno(), &CancellationToken::new()).await;

    let zips = index.zip_installs();
    assert_eq!(zips.len(), 2);
    for (path, existed) in zips {
        assert!(existed, "archive should exist while installing");
        assert!(!path.exists(), "{} should have been deleted", path.display());
    }
}

/// Test: installed libraries are matched by the header they provide
#[tokio::test]
async fn test_already_installed_by_header() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(FakeIndex::new().with_installed(library("DHT sensor library", &["DHT.h"])));
    let resolver = resolver(index.clone(), &dir, &LibraryLocks::new());

    let installed = resolver
        .ensure(&[Dependency::from_header("DHT.h")], &uno(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].source, ResolutionSource::AlreadyInstalled);
    assert_eq!(installed[0].installed_name, "DHT sensor library");
    assert!(index.installs().is_empty());
}

/// Test: version constraints reach the install command and core headers are skipped
#[tokio::test]
async fn test_version_spec_and_core_headers() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(FakeIndex::new().with_available(library("Servo", &["Servo.h"])));
    let resolver = resolver(index.clone(), &dir, &LibraryLocks::new());

    let deps = vec![
        Dependency::from_header("Wire.h"),
        Dependency::named("Servo").with_version("1.2.1"),
    ];
    let installed = resolver
        .ensure(&deps, &uno(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(installed.len(), 1);
    assert_eq!(index.installs(), vec!["Servo@1.2.1".to_string()]);
}

/// Test: resolution is refused once cancelled
#[tokio::test]
async fn test_cancelled_resolution() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(FakeIndex::new().with_available(library("Servo", &["Servo.h"])));
    let resolver = resolver(index.clone(), &dir, &LibraryLocks::new());
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = resolver
        .ensure(&[Dependency::named("Servo")], &uno(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ResolutionError::Toolchain(ToolchainError::Cancelled)));
    assert!(index.installs().is_empty());
}

/// Test: two sessions sharing a library directory never install concurrently
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_directory_serializes_installs() {
    let dir = TempDir::new().unwrap();
    let index = Arc::new(
        FakeIndex::new()
            .with_available(library("Servo", &["Servo.h"]))
            .with_available(library("Stepper", &["Stepper.h"]))
            .with_install_delay(Duration::from_millis(30)),
    );
    let locks = LibraryLocks::new();
    let first = resolver(index.clone(), &dir, &locks);
    let second = resolver(index.clone(), &dir, &locks);
    assert!(first.directory().shares_lock_with(second.directory()));

    let board = uno();
    let cancel = CancellationToken::new();
    let servo = [Dependency::named("Servo")];
    let stepper = [Dependency::named("Stepper")];
    let (a, b) = tokio::join!(
        first.ensure(&servo, &board, &cancel),
        second.ensure(&stepper, &board, &cancel),
    );

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(index.installs().len(), 2);
    assert_eq!(index.max_in_flight(), 1);
}
