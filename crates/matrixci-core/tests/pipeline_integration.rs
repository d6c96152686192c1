//! Integration tests for single pipeline runs against a filesystem store.

use matrixci_core::fakes::{FakeBuilder, FakeInstaller, FakeProvisioner, FakeTestRunner};
use matrixci_core::{
    ArtifactStore, CancelHandle, CancelSignal, ContextManager, EnvironmentDescriptor, FailureKind,
    FsArtifactStore, PipelineMachine, PipelineState, SourceLocation, StageKind, SuiteRef,
};
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    provisioner: Arc<FakeProvisioner>,
    builder: Arc<FakeBuilder>,
    installer: Arc<FakeInstaller>,
    tester: Arc<FakeTestRunner>,
    store: Arc<FsArtifactStore>,
    machine: PipelineMachine,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().expect("tempdir");
    let provisioner = Arc::new(FakeProvisioner::new());
    let builder = Arc::new(FakeBuilder::new());
    let installer = Arc::new(FakeInstaller::new());
    let tester = Arc::new(FakeTestRunner::new());
    let store = Arc::new(FsArtifactStore::new(dir.path().join("artifacts")).expect("store"));
    let machine = PipelineMachine::new(
        Arc::new(ContextManager::new(provisioner.clone())),
        builder.clone(),
        installer.clone(),
        tester.clone(),
        store.clone(),
        SourceLocation(dir.path().to_path_buf()),
        SuiteRef("tests".to_string()),
    );
    Fixture {
        _dir: dir,
        provisioner,
        builder,
        installer,
        tester,
        store,
        machine,
    }
}

fn descriptor(id: &str) -> EnvironmentDescriptor {
    EnvironmentDescriptor::new(id, "3.12", "x86_64")
}

/// Test: a passing run commits its artifact with a checksum sidecar
#[tokio::test]
async fn test_successful_run_commits_artifact() {
    let f = fixture();

    let run = f.machine.run(descriptor("A"), CancelSignal::never()).await;

    assert_eq!(run.state, PipelineState::Succeeded);
    assert_eq!(run.stages.len(), 4, "every stage should be recorded");
    assert!(run.stages.windows(2).all(|w| w[0].stage < w[1].stage));

    let artifact = f.store.get("A").expect("artifact should be committed");
    assert!(artifact.path.starts_with(f.store.root().join("A")));
    assert!(artifact.path.is_file());
    assert!(artifact.sidecar_path().is_file());
    assert!(f.store.staged("A").is_none(), "staging should be cleared");
}

/// Test: install receives the staged copy, never the build tree's file
#[tokio::test]
async fn test_install_reads_from_store() {
    let f = fixture();

    f.machine.run(descriptor("A"), CancelSignal::never()).await;

    let installed = f.installer.installed();
    assert_eq!(installed.len(), 1);
    assert!(
        installed[0].path.starts_with(f.store.root().join(".staging")),
        "install used {:?}",
        installed[0].path
    );
}

/// Test: stage k failing leaves exactly k stage results
#[tokio::test]
async fn test_fail_fast_lengths() {
    let f = fixture();
    f.builder.fail_for("build");
    f.installer.fail_for("install");
    f.tester.fail_for("test");

    let expectations = [("build", 2, StageKind::Build), ("install", 3, StageKind::Install), ("test", 4, StageKind::Test)];
    for (id, k, stage) in expectations {
        let run = f.machine.run(descriptor(id), CancelSignal::never()).await;
        assert_eq!(run.state, PipelineState::Failed, "{id}");
        assert_eq!(run.stages.len(), k, "{id}");
        assert_eq!(run.failure.as_ref().unwrap().stage, Some(stage));
        assert_eq!(run.failure.as_ref().unwrap().kind, FailureKind::StageFailed);
        assert!(!run.stages.last().unwrap().passed());
    }

    assert!(f.store.list().is_empty(), "no failed run may register an artifact");
    assert!(!f.store.root().join(".staging").join("install").exists());
    assert_eq!(f.provisioner.provision_calls(), 3);
    assert_eq!(f.provisioner.teardown_calls(), 3);
}

/// Test: cancellation mid-build still tears the context down
#[tokio::test]
async fn test_cancel_mid_run_releases_context() {
    let f = fixture();
    let handle = CancelHandle::new();
    f.builder.cancel_during_build(handle.clone());

    let run = f.machine.run(descriptor("A"), handle.signal()).await;

    assert_eq!(run.state, PipelineState::Failed);
    assert_eq!(run.failure.unwrap().kind, FailureKind::Cancelled);
    assert_eq!(f.machine.contexts().acquired_count(), 1);
    assert_eq!(f.machine.contexts().released_count(), 1);
    assert!(f.store.list().is_empty());
    assert!(f.store.staged("A").is_none());
}

/// Test: the same machine can serve the same descriptor twice
#[tokio::test]
async fn test_rerun_replaces_artifact() {
    let f = fixture();

    let first = f.machine.run(descriptor("A"), CancelSignal::never()).await;
    let second = f.machine.run(descriptor("A"), CancelSignal::never()).await;

    assert!(first.succeeded() && second.succeeded());
    assert_eq!(f.store.list().len(), 1);
    assert_eq!(f.provisioner.provision_calls(), 2);
    assert_eq!(f.provisioner.teardown_calls(), 2);
}

/// Test: run records serialize for reports
#[tokio::test]
async fn test_run_serializes() {
    let f = fixture();
    f.builder.fail_for("B");

    let run = f.machine.run(descriptor("B"), CancelSignal::never()).await;
    let json = serde_json::to_value(&run).expect("serialize run");

    assert_eq!(json["state"], "failed");
    assert_eq!(json["failure"]["stage"], "build");
    assert_eq!(json["stages"][1]["exit_code"], 1);
    assert!(json["stages"][1]["output"]["stderr"]
        .as_str()
        .unwrap()
        .contains("build failed for B"));
}

/// Test: a later failing invocation removes the artifact an earlier one committed
#[tokio::test]
async fn test_failed_rerun_clears_persisted_artifact() {
    let f = fixture();
    let first = f.machine.run(descriptor("A"), CancelSignal::never()).await;
    assert!(first.succeeded());
    let committed_dir = f.store.root().join("A");
    assert!(committed_dir.join("A-pkg.tar.gz.sha256").is_file());

    let tester = Arc::new(FakeTestRunner::new());
    tester.fail_for("A");
    let store = Arc::new(FsArtifactStore::new(f.store.root()).expect("reopen store"));
    let machine = PipelineMachine::new(
        Arc::new(ContextManager::new(Arc::new(FakeProvisioner::new()))),
        Arc::new(FakeBuilder::new()),
        Arc::new(FakeInstaller::new()),
        tester,
        store.clone(),
        SourceLocation(f.store.root().to_path_buf()),
        SuiteRef("tests".to_string()),
    );

    let second = machine.run(descriptor("A"), CancelSignal::never()).await;

    assert_eq!(second.state, PipelineState::Failed);
    assert!(store.list().is_empty());
    assert!(!committed_dir.exists(), "stale artifact left behind");
    assert!(!store.root().join(".staging").join("A").exists());
}
