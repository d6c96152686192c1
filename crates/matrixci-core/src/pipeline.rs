//! Per-entry pipeline state machine.
//!
//! `Pending → Provisioning → Building → Installing → Testing → Succeeded`,
//! with `Failed` reachable from every non-terminal state and `Aborted` only
//! before the build starts. The first failing stage ends the run; the
//! execution context is released on every path.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::collaborators::{Builder, Installer, SourceLocation, SuiteRef, TestRunner};
use crate::context::{Acquired, ContextManager};
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{RunError, RunnerError};
use crate::runner::StageResult;
use crate::stage::StageKind;
use crate::store::ArtifactStore;

/// State of one pipeline run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Provisioning,
    Building,
    Installing,
    Testing,
    Succeeded,
    Failed,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineState::Succeeded | PipelineState::Failed | PipelineState::Aborted
        )
    }

    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;
        match (self, next) {
            (Pending, Provisioning) | (Pending, Failed) | (Pending, Aborted) => true,
            (Provisioning, Building) | (Provisioning, Failed) | (Provisioning, Aborted) => true,
            (Building, Installing) | (Building, Failed) => true,
            (Installing, Testing) | (Installing, Failed) => true,
            (Testing, Succeeded) | (Testing, Failed) => true,
            _ => false,
        }
    }

    /// State entered while `stage` runs.
    pub fn for_stage(stage: StageKind) -> Option<PipelineState> {
        match stage {
            StageKind::Provision => Some(PipelineState::Provisioning),
            StageKind::Build => Some(PipelineState::Building),
            StageKind::Install => Some(PipelineState::Installing),
            StageKind::Test => Some(PipelineState::Testing),
            StageKind::Publish => None,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Pending => "pending",
            PipelineState::Provisioning => "provisioning",
            PipelineState::Building => "building",
            PipelineState::Installing => "installing",
            PipelineState::Testing => "testing",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
            PipelineState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stage's command ran and failed: the code under test is broken.
    StageFailed,
    /// Provisioning, process spawning, I/O or teardown failed.
    Infrastructure,
    /// Cancellation reached the run.
    Cancelled,
}

/// The first failure of a run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FailureInfo {
    /// Failing stage, or `None` for failures between stages
    /// (cancellation, teardown, artifact commit).
    pub stage: Option<StageKind>,
    pub kind: FailureKind,
    pub message: String,
}

/// One matrix entry's run: stage history plus state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    pub descriptor: EnvironmentDescriptor,
    pub stages: Vec<StageResult>,
    pub state: PipelineState,
    pub failure: Option<FailureInfo>,
}

impl PipelineRun {
    pub fn new(descriptor: EnvironmentDescriptor) -> Self {
        Self {
            descriptor,
            stages: Vec::new(),
            state: PipelineState::Pending,
            failure: None,
        }
    }

    /// A run whose task died before reaching a terminal state.
    pub(crate) fn crashed(descriptor: EnvironmentDescriptor, message: impl Into<String>) -> Self {
        let mut run = Self::new(descriptor);
        run.fail(None, FailureKind::Infrastructure, message);
        run
    }

    pub fn succeeded(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Result of the first failing stage, if the failure came from one.
    pub fn first_failing_stage(&self) -> Option<&StageResult> {
        let stage = self.failure.as_ref()?.stage?;
        self.stages.iter().find(|s| s.stage == stage)
    }

    fn transition(&mut self, next: PipelineState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        info!(descriptor = %self.descriptor.id, from = %self.state, to = %next, "pipeline transition");
        self.state = next;
    }

    fn enter(&mut self, stage: StageKind) {
        if let Some(next) = PipelineState::for_stage(stage) {
            self.transition(next);
        }
    }

    fn record(&mut self, result: StageResult) {
        debug_assert!(
            self.stages.last().map_or(true, |prev| prev.stage < result.stage),
            "stage results must follow stage order"
        );
        self.stages.push(result);
    }

    fn fail(&mut self, stage: Option<StageKind>, kind: FailureKind, message: impl Into<String>) {
        if self.is_terminal() {
            return;
        }
        let message = message.into();
        warn!(descriptor = %self.descriptor.id, stage = ?stage, kind = ?kind, %message, "pipeline failed");
        self.failure = Some(FailureInfo {
            stage,
            kind,
            message,
        });
        self.transition(PipelineState::Failed);
    }

    /// Record a failed stage from the error that ended it.
    fn fail_stage(&mut self, stage: StageKind, started_at: DateTime<Utc>, err: RunError) {
        self.record(StageResult::new(
            stage,
            err.exit_status(),
            err.captured_output(),
            started_at,
            Utc::now(),
        ));
        let kind = match &err {
            RunError::Cancelled => FailureKind::Cancelled,
            e if e.is_infrastructure() => FailureKind::Infrastructure,
            _ => FailureKind::StageFailed,
        };
        self.fail(Some(stage), kind, err.to_string());
    }

    /// Stop at a boundary because of cancellation.
    fn cancel(&mut self) {
        match self.state {
            PipelineState::Pending | PipelineState::Provisioning => {
                info!(descriptor = %self.descriptor.id, "pipeline aborted before build");
                self.failure = Some(FailureInfo {
                    stage: None,
                    kind: FailureKind::Cancelled,
                    message: "cancelled before build started".to_string(),
                });
                self.transition(PipelineState::Aborted);
            }
            _ => self.fail(None, FailureKind::Cancelled, "cancelled at stage boundary"),
        }
    }
}

/// Requests cancellation of every run subscribed to it.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal(self.tx.subscribe())
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving side of a [`CancelHandle`], checked at stage boundaries.
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        CancelHandle::new().signal()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        if self.0.wait_for(|c| *c).await.is_err() {
            // Handle dropped without cancelling.
            futures::future::pending::<()>().await;
        }
    }
}

/// Drives one descriptor through provision, build, install and test.
pub struct PipelineMachine {
    contexts: Arc<ContextManager>,
    builder: Arc<dyn Builder>,
    installer: Arc<dyn Installer>,
    tester: Arc<dyn TestRunner>,
    store: Arc<dyn ArtifactStore>,
    source: SourceLocation,
    suite: SuiteRef,
}

impl PipelineMachine {
    pub fn new(
        contexts: Arc<ContextManager>,
        builder: Arc<dyn Builder>,
        installer: Arc<dyn Installer>,
        tester: Arc<dyn TestRunner>,
        store: Arc<dyn ArtifactStore>,
        source: SourceLocation,
        suite: SuiteRef,
    ) -> Self {
        Self {
            contexts,
            builder,
            installer,
            tester,
            store,
            source,
            suite,
        }
    }

    pub fn contexts(&self) -> &Arc<ContextManager> {
        &self.contexts
    }

    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Run one descriptor to a terminal state.
    #[instrument(skip(self, descriptor, cancel), fields(descriptor = %descriptor.id))]
    pub async fn run(&self, descriptor: EnvironmentDescriptor, cancel: CancelSignal) -> PipelineRun {
        let mut run = PipelineRun::new(descriptor.clone());

        if cancel.is_cancelled() {
            run.cancel();
            self.settle_artifact(&mut run);
            return run;
        }

        run.enter(StageKind::Provision);
        let provision_started = Utc::now();

        let run_ref = &mut run;
        let cancel_ref = &cancel;
        let scoped = self
            .contexts
            .scoped(&descriptor, move |acquired| {
                self.drive(run_ref, acquired, provision_started, cancel_ref)
            })
            .await;

        match scoped {
            Err(provision_err) => {
                run.fail_stage(StageKind::Provision, provision_started, provision_err.into());
            }
            Ok(((), teardown)) => {
                if let Err(e) = teardown {
                    if run.is_terminal() {
                        warn!(error = %e, "teardown failed after run already ended");
                    }
                    run.fail(None, FailureKind::Infrastructure, format!("teardown failed: {}", e));
                }
            }
        }

        self.settle_artifact(&mut run);
        info!(state = %run.state, stages = run.stages.len(), "pipeline finished");
        run
    }

    /// Stages after provisioning, inside the acquired context.
    async fn drive(
        &self,
        run: &mut PipelineRun,
        acquired: Acquired,
        provision_started: DateTime<Utc>,
        cancel: &CancelSignal,
    ) {
        let ctx = acquired.context;
        run.record(StageResult::new(
            StageKind::Provision,
            0,
            acquired.output,
            provision_started,
            Utc::now(),
        ));

        if cancel.is_cancelled() {
            run.cancel();
            return;
        }

        // Build, then move the artifact into the store's staging area.
        run.enter(StageKind::Build);
        let started = Utc::now();
        let staged = match self.builder.build(&ctx, &self.source).await {
            Ok(built) => match self.store.stage(&run.descriptor, &built.value) {
                Ok(staged) => {
                    run.record(StageResult::new(StageKind::Build, 0, built.output, started, Utc::now()));
                    staged
                }
                Err(e) => return run.fail_stage(StageKind::Build, started, e.into()),
            },
            Err(e) => return run.fail_stage(StageKind::Build, started, e),
        };

        if cancel.is_cancelled() {
            run.cancel();
            return;
        }

        // Install strictly from the store, never from the build tree.
        run.enter(StageKind::Install);
        let started = Utc::now();
        if staged.path.starts_with(ctx.root()) || ctx.is_in_source_tree(&staged.path) {
            let err = RunnerError::IsolationViolation {
                stage: StageKind::Install.to_string(),
                reason: format!("artifact {:?} is not served from the artifact store", staged.path),
            };
            return run.fail_stage(StageKind::Install, started, err.into());
        }
        match self.installer.install(&ctx, &staged).await {
            Ok(done) => {
                run.record(StageResult::new(StageKind::Install, 0, done.output, started, Utc::now()));
            }
            Err(e) => return run.fail_stage(StageKind::Install, started, e),
        }

        if cancel.is_cancelled() {
            run.cancel();
            return;
        }

        run.enter(StageKind::Test);
        let started = Utc::now();
        match self.tester.test(&ctx, &self.suite).await {
            Ok(outcome) => {
                let exit_code = match (outcome.passed, outcome.exit_code) {
                    (true, _) => 0,
                    (false, 0) => 1,
                    (false, code) => code,
                };
                run.record(StageResult::new(StageKind::Test, exit_code, outcome.output, started, Utc::now()));
                if !outcome.passed {
                    run.fail(
                        Some(StageKind::Test),
                        FailureKind::StageFailed,
                        format!("test suite failed with status {}", exit_code),
                    );
                }
            }
            Err(e) => run.fail_stage(StageKind::Test, started, e),
        }
    }

    /// Commit the staged artifact of a run that passed every stage, or drop
    /// both the staged copy and whatever was committed for the id before.
    fn settle_artifact(&self, run: &mut PipelineRun) {
        let id = run.descriptor.id.clone();
        if run.state == PipelineState::Testing {
            match self.store.commit(&run.descriptor) {
                Ok(artifact) => {
                    info!(descriptor = %id, digest = %artifact.digest, "artifact registered");
                    run.transition(PipelineState::Succeeded);
                }
                Err(e) => {
                    run.fail(None, FailureKind::Infrastructure, format!("artifact commit failed: {}", e));
                }
            }
        }

        if !run.succeeded() {
            if let Err(e) = self.store.discard(&id) {
                warn!(descriptor = %id, error = %e, "failed to discard staged artifact");
            }
            if let Err(e) = self.store.retract(&id) {
                warn!(descriptor = %id, error = %e, "failed to retract committed artifact");
            }
        }
    }
}
