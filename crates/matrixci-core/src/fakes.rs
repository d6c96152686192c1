//! In-memory fakes for the collaborator traits (testing only)
//!
//! Provides scripted `Fake*` collaborators that count their calls, and a
//! `MemoryArtifactStore`, so pipelines can be driven without spawning
//! processes.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::collaborators::{
    Builder, Installer, Provisioner, PublishTarget, Publisher, SourceLocation, SuiteRef,
    TestOutcome, TestRunner,
};
use crate::context::ExecutionContext;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{
    BuildError, InstallError, ProvisionError, PublishError, RunError, RunnerError, StoreError,
};
use crate::pipeline::CancelHandle;
use crate::stage::{CapturedOutput, Completed};
use crate::store::{Artifact, ArtifactStore};

fn ids(set: &Mutex<HashSet<String>>) -> std::sync::MutexGuard<'_, HashSet<String>> {
    set.lock().unwrap_or_else(|p| p.into_inner())
}

// ---------------------------------------------------------------------------
// FakeProvisioner
// ---------------------------------------------------------------------------

/// Provisioner creating real context directories under a temp root.
#[derive(Debug)]
pub struct FakeProvisioner {
    root: PathBuf,
    failing: Mutex<HashSet<String>>,
    failing_teardown: bool,
    provision_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl FakeProvisioner {
    pub fn new() -> Self {
        Self {
            root: std::env::temp_dir()
                .join("matrixci-fakes")
                .join(uuid::Uuid::new_v4().simple().to_string()),
            failing: Mutex::new(HashSet::new()),
            failing_teardown: false,
            provision_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
            live: AtomicUsize::new(0),
            max_live: AtomicUsize::new(0),
        }
    }

    /// Refuse to provision `id`.
    pub fn failing_for(self, id: &str) -> Self {
        ids(&self.failing).insert(id.to_string());
        self
    }

    /// Make every teardown report an error (after counting it).
    pub fn failing_teardown(mut self) -> Self {
        self.failing_teardown = true;
        self
    }

    pub fn provision_calls(&self) -> usize {
        self.provision_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously live contexts observed.
    pub fn max_live(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }
}

impl Default for FakeProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FakeProvisioner {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn provision(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Completed<ExecutionContext>, ProvisionError> {
        if ids(&self.failing).contains(&descriptor.id) {
            return Err(ProvisionError::new(format!(
                "unsupported combination {} on {}",
                descriptor.runtime, descriptor.arch
            )));
        }
        self.provision_calls.fetch_add(1, Ordering::SeqCst);
        let root = self
            .root
            .join(format!("{}-{}", descriptor.id, uuid::Uuid::new_v4()));
        let ctx = ExecutionContext::create(descriptor.clone(), root, Vec::new())
            .map_err(|e| ProvisionError::new(e.to_string()))?;

        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Completed::new(
            ctx,
            CapturedOutput::new(format!("provisioned {}", descriptor), ""),
        ))
    }

    async fn teardown(&self, context: &ExecutionContext) -> Result<(), ProvisionError> {
        self.teardown_calls.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_sub(1, Ordering::SeqCst);
        if self.failing_teardown {
            return Err(ProvisionError::new("teardown refused"));
        }
        let _ = std::fs::remove_dir_all(context.root());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// FakeBuilder
// ---------------------------------------------------------------------------

/// Builder writing a small file into the context's dist directory.
#[derive(Debug, Default)]
pub struct FakeBuilder {
    failing: Mutex<HashSet<String>>,
    cancel_on_build: Mutex<Option<CancelHandle>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with status 1 when building `id`.
    pub fn fail_for(&self, id: &str) {
        ids(&self.failing).insert(id.to_string());
    }

    /// Request cancellation from inside the build stage.
    pub fn cancel_during_build(&self, handle: CancelHandle) {
        *self.cancel_on_build.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    /// Sleep this long in every build.
    pub fn with_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Builder for FakeBuilder {
    async fn build(
        &self,
        context: &ExecutionContext,
        _source: &SourceLocation,
    ) -> Result<Completed<Artifact>, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = context.descriptor().id.clone();

        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let cancel = self.cancel_on_build.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(handle) = cancel {
            handle.cancel();
        }

        if ids(&self.failing).contains(&id) {
            return Err(BuildError {
                exit_status: 1,
                output: CapturedOutput::new("compiling", format!("build failed for {}", id)),
            }
            .into());
        }

        let path = context.dist_dir().join(format!("{}-pkg.tar.gz", id));
        std::fs::write(&path, format!("artifact for {}", id)).map_err(RunnerError::from)?;
        let artifact = Artifact::from_file(id, path).map_err(RunnerError::from)?;
        Ok(Completed::new(artifact, CapturedOutput::new("built", "")))
    }
}

// ---------------------------------------------------------------------------
// FakeInstaller
// ---------------------------------------------------------------------------

/// Installer recording which artifacts it was handed.
#[derive(Debug, Default)]
pub struct FakeInstaller {
    failing: Mutex<HashSet<String>>,
    broken: Mutex<HashSet<String>>,
    installed: Mutex<Vec<Artifact>>,
    calls: AtomicUsize,
}

impl FakeInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exit with status 1 when installing for `id`.
    pub fn fail_for(&self, id: &str) {
        ids(&self.failing).insert(id.to_string());
    }

    /// Raise an infrastructure error when installing for `id`.
    pub fn break_infrastructure_for(&self, id: &str) {
        ids(&self.broken).insert(id.to_string());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn installed(&self) -> Vec<Artifact> {
        self.installed.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Installer for FakeInstaller {
    async fn install(
        &self,
        context: &ExecutionContext,
        artifact: &Artifact,
    ) -> Result<Completed<()>, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let id = &context.descriptor().id;
        if ids(&self.broken).contains(id) {
            return Err(RunnerError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "installer process vanished",
            ))
            .into());
        }
        if ids(&self.failing).contains(id) {
            return Err(InstallError {
                exit_status: 1,
                output: CapturedOutput::from_stderr("install failed"),
            }
            .into());
        }
        self.installed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(artifact.clone());
        Ok(Completed::new((), CapturedOutput::new("installed", "")))
    }
}

// ---------------------------------------------------------------------------
// FakeTestRunner
// ---------------------------------------------------------------------------

/// Test runner that passes unless scripted otherwise.
#[derive(Debug, Default)]
pub struct FakeTestRunner {
    failing: Mutex<HashSet<String>>,
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
}

impl FakeTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a failing suite for `id`.
    pub fn fail_for(&self, id: &str) {
        ids(&self.failing).insert(id.to_string());
    }

    /// Sleep this long in every test run.
    pub fn with_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = Some(delay);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TestRunner for FakeTestRunner {
    async fn test(
        &self,
        context: &ExecutionContext,
        suite: &SuiteRef,
    ) -> Result<TestOutcome, RunError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let passed = !ids(&self.failing).contains(&context.descriptor().id);
        Ok(TestOutcome {
            passed,
            exit_code: if passed { 0 } else { 1 },
            output: CapturedOutput::new(
                format!("suite {} {}", suite.0, if passed { "passed" } else { "failed" }),
                "",
            ),
        })
    }
}

// ---------------------------------------------------------------------------
// FakePublisher
// ---------------------------------------------------------------------------

/// Publisher recording every batch it receives.
#[derive(Debug, Default)]
pub struct FakePublisher {
    failing: AtomicBool,
    batches: Mutex<Vec<Vec<Artifact>>>,
}

impl FakePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        let p = Self::default();
        p.failing.store(true, Ordering::SeqCst);
        p
    }

    pub fn calls(&self) -> usize {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn batches(&self) -> Vec<Vec<Artifact>> {
        self.batches.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

#[async_trait]
impl Publisher for FakePublisher {
    async fn publish(
        &self,
        artifacts: &[Artifact],
        target: &PublishTarget,
    ) -> Result<(), PublishError> {
        self.batches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(artifacts.to_vec());
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::new(format!("{} rejected upload", target.0)));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

/// In-memory artifact store. Paths it hands out are virtual
/// (`memory/...`) and never point into a context.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    committed: Mutex<BTreeMap<String, Artifact>>,
    staged: Mutex<BTreeMap<String, Artifact>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn relocate(artifact: &Artifact, tier: &str, descriptor_id: &str) -> Artifact {
        let mut moved = artifact.clone();
        moved.descriptor_id = descriptor_id.to_string();
        moved.path = PathBuf::from("memory")
            .join(tier)
            .join(descriptor_id)
            .join(&artifact.file_name);
        moved
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn put(
        &self,
        descriptor: &EnvironmentDescriptor,
        artifact: Artifact,
    ) -> Result<Artifact, StoreError> {
        let committed = Self::relocate(&artifact, "committed", &descriptor.id);
        self.committed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(descriptor.id.clone(), committed.clone());
        Ok(committed)
    }

    fn get(&self, descriptor_id: &str) -> Option<Artifact> {
        self.committed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(descriptor_id)
            .cloned()
    }

    fn list(&self) -> Vec<Artifact> {
        self.committed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect()
    }

    fn stage(
        &self,
        descriptor: &EnvironmentDescriptor,
        artifact: &Artifact,
    ) -> Result<Artifact, StoreError> {
        let staged = Self::relocate(artifact, "staging", &descriptor.id);
        self.staged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(descriptor.id.clone(), staged.clone());
        Ok(staged)
    }

    fn staged(&self, descriptor_id: &str) -> Option<Artifact> {
        self.staged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(descriptor_id)
            .cloned()
    }

    fn discard(&self, descriptor_id: &str) -> Result<(), StoreError> {
        self.staged
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(descriptor_id);
        Ok(())
    }

    fn retract(&self, descriptor_id: &str) -> Result<(), StoreError> {
        self.committed
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(descriptor_id);
        Ok(())
    }
}
