//! Matrix coordinator: fan-out, aggregation barrier, all-or-nothing publish.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::collaborators::{PublishTarget, Publisher};
use crate::descriptor::{validate_matrix, EnvironmentDescriptor};
use crate::error::ConfigurationError;
use crate::pipeline::{CancelHandle, PipelineMachine, PipelineRun};
use crate::store::Artifact;

/// How many pipeline runs may be in flight at once.
///
/// Negative values count back from the number of CPUs: `-1` uses all of
/// them, `-2` all but one, and so on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "RawConcurrency", into = "RawConcurrency")]
pub enum Concurrency {
    #[default]
    Unbounded,
    Auto,
    Fixed(usize),
    /// All CPUs except `k - 1`, written `-k`.
    CpusMinus(usize),
}

impl Concurrency {
    /// Resolve to a permit count, or `None` for no bound.
    pub fn limit(&self) -> Option<usize> {
        let cpus = || std::thread::available_parallelism().map_or(1, |n| n.get());
        match *self {
            Concurrency::Unbounded => None,
            Concurrency::Auto => Some(cpus()),
            Concurrency::Fixed(n) => Some(n),
            Concurrency::CpusMinus(k) => Some((cpus() + 1).saturating_sub(k).max(1)),
        }
    }

    fn from_signed(value: i64) -> Result<Self, ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidConcurrency {
            value: value.to_string(),
            reason,
        };
        match value {
            0 => Err(invalid("must be non-zero".to_string())),
            n if n > 0 => usize::try_from(n)
                .ok()
                .filter(|n| *n <= Semaphore::MAX_PERMITS)
                .map(Concurrency::Fixed)
                .ok_or_else(|| invalid(format!("must be at most {}", Semaphore::MAX_PERMITS))),
            n => Ok(Concurrency::CpusMinus(
                usize::try_from(n.unsigned_abs()).unwrap_or(usize::MAX),
            )),
        }
    }
}

impl FromStr for Concurrency {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unbounded" | "none" => Ok(Concurrency::Unbounded),
            "auto" => Ok(Concurrency::Auto),
            other => other
                .parse::<i64>()
                .map_err(|_| ConfigurationError::InvalidConcurrency {
                    value: s.to_string(),
                    reason: "expected an integer, `auto` or `unbounded`".to_string(),
                })
                .and_then(Concurrency::from_signed),
        }
    }
}

impl fmt::Display for Concurrency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Concurrency::Unbounded => f.write_str("unbounded"),
            Concurrency::Auto => f.write_str("auto"),
            Concurrency::Fixed(n) => write!(f, "{}", n),
            Concurrency::CpusMinus(k) => write!(f, "-{}", k),
        }
    }
}

/// Wire form: an integer or a keyword.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawConcurrency {
    Number(i64),
    Keyword(String),
}

impl TryFrom<RawConcurrency> for Concurrency {
    type Error = ConfigurationError;

    fn try_from(raw: RawConcurrency) -> Result<Self, Self::Error> {
        match raw {
            RawConcurrency::Number(n) => Concurrency::from_signed(n),
            RawConcurrency::Keyword(s) => s.parse(),
        }
    }
}

impl From<Concurrency> for RawConcurrency {
    fn from(c: Concurrency) -> Self {
        match c {
            Concurrency::Fixed(n) => RawConcurrency::Number(n as i64),
            Concurrency::CpusMinus(k) => RawConcurrency::Number(-(k as i64)),
            other => RawConcurrency::Keyword(other.to_string()),
        }
    }
}

/// Coordinator settings.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub concurrency: Concurrency,
    pub publish_on_success: bool,
    pub publish_target: Option<PublishTarget>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::Unbounded,
            publish_on_success: true,
            publish_target: None,
        }
    }
}

/// Every run of one matrix, in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AggregateReport {
    pub runs: Vec<PipelineRun>,
    /// True iff every run succeeded.
    pub success: bool,
}

impl AggregateReport {
    pub fn new(runs: Vec<PipelineRun>) -> Self {
        let success = !runs.is_empty() && runs.iter().all(PipelineRun::succeeded);
        Self { runs, success }
    }

    pub fn succeeded_count(&self) -> usize {
        self.runs.iter().filter(|r| r.succeeded()).count()
    }

    /// Runs that did not succeed, in declaration order.
    pub fn failures(&self) -> impl Iterator<Item = &PipelineRun> {
        self.runs.iter().filter(|r| !r.succeeded())
    }

    pub fn run(&self, descriptor_id: &str) -> Option<&PipelineRun> {
        self.runs.iter().find(|r| r.descriptor.id == descriptor_id)
    }
}

/// What happened to the publish step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PublishStatus {
    /// No publisher or target configured.
    NotConfigured,
    /// Publishing turned off for this invocation.
    Disabled,
    /// At least one run did not succeed.
    Skipped,
    Published { artifacts: Vec<Artifact> },
    Failed { reason: String },
}

/// Report plus publish status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MatrixOutcome {
    pub report: AggregateReport,
    pub publish: PublishStatus,
}

impl MatrixOutcome {
    /// Matrix succeeded and, if attempted, publishing did too.
    pub fn succeeded(&self) -> bool {
        self.report.success && !matches!(self.publish, PublishStatus::Failed { .. })
    }
}

/// Runs every matrix entry through its own pipeline and aggregates.
pub struct MatrixCoordinator {
    machine: Arc<PipelineMachine>,
    publisher: Option<Arc<dyn Publisher>>,
    config: CoordinatorConfig,
    cancel: CancelHandle,
}

impl MatrixCoordinator {
    pub fn new(
        machine: Arc<PipelineMachine>,
        publisher: Option<Arc<dyn Publisher>>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            machine,
            publisher,
            config,
            cancel: CancelHandle::new(),
        }
    }

    pub fn machine(&self) -> &Arc<PipelineMachine> {
        &self.machine
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Handle that cancels in-flight and queued runs.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Validate, run every entry, then decide on publishing.
    ///
    /// Only configuration problems return `Err`, and they do so before any
    /// context is acquired. Everything else ends up in the report.
    #[instrument(skip_all, fields(entries = descriptors.len(), concurrency = %self.config.concurrency))]
    pub async fn run(
        &self,
        descriptors: Vec<EnvironmentDescriptor>,
    ) -> Result<MatrixOutcome, ConfigurationError> {
        validate_matrix(&descriptors)?;

        let permits = self
            .config
            .concurrency
            .limit()
            .map(|n| Arc::new(Semaphore::new(n.clamp(1, Semaphore::MAX_PERMITS))));

        let mut tasks = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors.iter().cloned() {
            let machine = Arc::clone(&self.machine);
            let permits = permits.clone();
            let mut cancel = self.cancel.signal();

            tasks.push(tokio::spawn(async move {
                // Queued runs wait here; cancellation releases them so the
                // machine can mark them aborted.
                let _permit = match permits {
                    Some(sem) => tokio::select! {
                        permit = sem.acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    },
                    None => None,
                };
                machine.run(descriptor, cancel).await
            }));
        }

        let mut runs = Vec::with_capacity(tasks.len());
        for (descriptor, task) in descriptors.into_iter().zip(tasks) {
            match task.await {
                Ok(run) => runs.push(run),
                Err(e) => {
                    warn!(descriptor = %descriptor.id, error = %e, "pipeline task died");
                    runs.push(PipelineRun::crashed(
                        descriptor,
                        format!("pipeline task died: {}", e),
                    ));
                }
            }
        }

        let report = AggregateReport::new(runs);
        info!(
            success = report.success,
            succeeded = report.succeeded_count(),
            total = report.runs.len(),
            "matrix finished"
        );

        let publish = self.publish(&report).await;
        Ok(MatrixOutcome { report, publish })
    }

    async fn publish(&self, report: &AggregateReport) -> PublishStatus {
        let (Some(publisher), Some(target)) = (&self.publisher, &self.config.publish_target) else {
            return PublishStatus::NotConfigured;
        };
        if !self.config.publish_on_success {
            info!("publishing disabled");
            return PublishStatus::Disabled;
        }
        if !report.success {
            info!(failed = report.runs.len() - report.succeeded_count(), "publish skipped");
            return PublishStatus::Skipped;
        }

        let ids: BTreeSet<&str> = report.runs.iter().map(|r| r.descriptor.id.as_str()).collect();
        let artifacts: Vec<Artifact> = self
            .machine
            .store()
            .list()
            .into_iter()
            .filter(|a| ids.contains(a.descriptor_id.as_str()))
            .collect();

        match publisher.publish(&artifacts, target).await {
            Ok(()) => {
                info!(target = %target.0, artifacts = artifacts.len(), "artifacts published");
                PublishStatus::Published { artifacts }
            }
            Err(e) => {
                warn!(target = %target.0, error = %e, "publish failed");
                PublishStatus::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{SourceLocation, SuiteRef};
    use crate::context::ContextManager;
    use crate::fakes::{
        FakeBuilder, FakeInstaller, FakeProvisioner, FakePublisher, FakeTestRunner,
        MemoryArtifactStore,
    };
    use crate::pipeline::PipelineState;

    fn coordinator(
        provisioner: Arc<FakeProvisioner>,
        tester: Arc<FakeTestRunner>,
        publisher: Arc<FakePublisher>,
        config: CoordinatorConfig,
    ) -> MatrixCoordinator {
        let machine = PipelineMachine::new(
            Arc::new(ContextManager::new(provisioner)),
            Arc::new(FakeBuilder::new()),
            Arc::new(FakeInstaller::new()),
            tester,
            Arc::new(MemoryArtifactStore::new()),
            SourceLocation(".".into()),
            SuiteRef("tests".to_string()),
        );
        MatrixCoordinator::new(Arc::new(machine), Some(publisher), config)
    }

    fn publishing() -> CoordinatorConfig {
        CoordinatorConfig {
            publish_target: Some(PublishTarget("release".to_string())),
            ..CoordinatorConfig::default()
        }
    }

    fn matrix(ids: &[&str]) -> Vec<EnvironmentDescriptor> {
        ids.iter()
            .map(|id| EnvironmentDescriptor::new(*id, "3.12", "x86_64"))
            .collect()
    }

    #[test]
    fn test_concurrency_parsing() {
        assert_eq!("unbounded".parse::<Concurrency>().unwrap(), Concurrency::Unbounded);
        assert_eq!("auto".parse::<Concurrency>().unwrap(), Concurrency::Auto);
        assert_eq!("4".parse::<Concurrency>().unwrap(), Concurrency::Fixed(4));
        assert_eq!("-2".parse::<Concurrency>().unwrap(), Concurrency::CpusMinus(2));
        assert!(matches!(
            "0".parse::<Concurrency>(),
            Err(ConfigurationError::InvalidConcurrency { .. })
        ));
        assert!("lots".parse::<Concurrency>().is_err());
    }

    #[test]
    fn test_concurrency_upper_bound() {
        let max = Semaphore::MAX_PERMITS;
        assert_eq!(max.to_string().parse::<Concurrency>().unwrap(), Concurrency::Fixed(max));
        assert!(matches!(
            (max + 1).to_string().parse::<Concurrency>(),
            Err(ConfigurationError::InvalidConcurrency { .. })
        ));
        assert!(matches!(
            "9000000000000000000".parse::<Concurrency>(),
            Err(ConfigurationError::InvalidConcurrency { .. })
        ));
        assert!(serde_json::from_str::<Concurrency>("9000000000000000000").is_err());
        assert_eq!(
            "-9000000000000000000".parse::<Concurrency>().unwrap(),
            Concurrency::CpusMinus(9_000_000_000_000_000_000)
        );
    }

    #[tokio::test]
    async fn test_oversized_fixed_bound_does_not_panic() {
        let config = CoordinatorConfig {
            concurrency: Concurrency::Fixed(usize::MAX),
            ..publishing()
        };
        let c = coordinator(
            Arc::new(FakeProvisioner::new()),
            Arc::new(FakeTestRunner::new()),
            Arc::new(FakePublisher::new()),
            config,
        );

        let outcome = c.run(matrix(&["a"])).await.unwrap();
        assert!(outcome.report.success);
    }

    #[test]
    fn test_concurrency_limits() {
        let cpus = std::thread::available_parallelism().unwrap().get();
        assert_eq!(Concurrency::Unbounded.limit(), None);
        assert_eq!(Concurrency::Fixed(3).limit(), Some(3));
        assert_eq!(Concurrency::Auto.limit(), Some(cpus));
        assert_eq!(Concurrency::CpusMinus(1).limit(), Some(cpus));
        assert_eq!(Concurrency::CpusMinus(cpus + 10).limit(), Some(1));
    }

    #[test]
    fn test_concurrency_serde() {
        #[derive(Deserialize)]
        struct Doc {
            concurrency: Concurrency,
        }
        let doc: Doc = toml::from_str("concurrency = 2").unwrap();
        assert_eq!(doc.concurrency, Concurrency::Fixed(2));
        let doc: Doc = toml::from_str("concurrency = \"auto\"").unwrap();
        assert_eq!(doc.concurrency, Concurrency::Auto);
        assert!(toml::from_str::<Doc>("concurrency = 0").is_err());
        assert_eq!(serde_json::to_string(&Concurrency::CpusMinus(2)).unwrap(), "-2");
    }

    #[tokio::test]
    async fn test_all_succeed_publishes_once() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let publisher = Arc::new(FakePublisher::new());
        let c = coordinator(provisioner.clone(), Arc::new(FakeTestRunner::new()), publisher.clone(), publishing());

        let outcome = c.run(matrix(&["a", "b", "c"])).await.unwrap();

        assert!(outcome.report.success);
        assert!(outcome.succeeded());
        assert_eq!(publisher.calls(), 1);
        match &outcome.publish {
            PublishStatus::Published { artifacts } => assert_eq!(artifacts.len(), 3),
            other => panic!("unexpected publish status {other:?}"),
        }
        assert_eq!(provisioner.provision_calls(), provisioner.teardown_calls());
    }

    #[tokio::test]
    async fn test_one_failure_blocks_publish() {
        let tester = Arc::new(FakeTestRunner::new());
        tester.fail_for("b");
        let publisher = Arc::new(FakePublisher::new());
        let c = coordinator(Arc::new(FakeProvisioner::new()), tester, publisher.clone(), publishing());

        let outcome = c.run(matrix(&["a", "b"])).await.unwrap();

        assert!(!outcome.report.success);
        assert_eq!(outcome.publish, PublishStatus::Skipped);
        assert_eq!(publisher.calls(), 0);
        assert_eq!(outcome.report.run("a").unwrap().state, PipelineState::Succeeded);
        assert_eq!(outcome.report.run("b").unwrap().state, PipelineState::Failed);
    }

    #[tokio::test]
    async fn test_publish_disabled_and_unconfigured() {
        let publisher = Arc::new(FakePublisher::new());
        let disabled = CoordinatorConfig {
            publish_on_success: false,
            ..publishing()
        };
        let c = coordinator(Arc::new(FakeProvisioner::new()), Arc::new(FakeTestRunner::new()), publisher.clone(), disabled);
        assert_eq!(c.run(matrix(&["a"])).await.unwrap().publish, PublishStatus::Disabled);

        let c = coordinator(
            Arc::new(FakeProvisioner::new()),
            Arc::new(FakeTestRunner::new()),
            publisher.clone(),
            CoordinatorConfig::default(),
        );
        assert_eq!(c.run(matrix(&["a"])).await.unwrap().publish, PublishStatus::NotConfigured);
        assert_eq!(publisher.calls(), 0);
    }

    #[tokio::test]
    async fn test_publish_failure_fails_outcome() {
        let publisher = Arc::new(FakePublisher::failing());
        let c = coordinator(Arc::new(FakeProvisioner::new()), Arc::new(FakeTestRunner::new()), publisher, publishing());

        let outcome = c.run(matrix(&["a"])).await.unwrap();
        assert!(outcome.report.success);
        assert!(matches!(outcome.publish, PublishStatus::Failed { .. }));
        assert!(!outcome.succeeded());
    }

    #[tokio::test]
    async fn test_invalid_matrix_acquires_nothing() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let c = coordinator(provisioner.clone(), Arc::new(FakeTestRunner::new()), Arc::new(FakePublisher::new()), publishing());

        assert!(matches!(
            c.run(matrix(&["a", "a"])).await,
            Err(ConfigurationError::DuplicateId { .. })
        ));
        assert!(matches!(c.run(Vec::new()).await, Err(ConfigurationError::EmptyMatrix)));
        assert_eq!(provisioner.provision_calls(), 0);
    }

    #[tokio::test]
    async fn test_report_follows_declaration_order() {
        let tester = Arc::new(FakeTestRunner::new());
        let c = coordinator(Arc::new(FakeProvisioner::new()), tester, Arc::new(FakePublisher::new()), publishing());

        let outcome = c.run(matrix(&["z", "m", "a"])).await.unwrap();
        let ids: Vec<&str> = outcome.report.runs.iter().map(|r| r.descriptor.id.as_str()).collect();
        assert_eq!(ids, vec!["z", "m", "a"]);
    }

    #[tokio::test]
    async fn test_concurrency_bound_respected() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let tester = Arc::new(FakeTestRunner::new());
        tester.with_delay(std::time::Duration::from_millis(20));
        let config = CoordinatorConfig {
            concurrency: Concurrency::Fixed(2),
            ..publishing()
        };
        let c = coordinator(provisioner.clone(), tester, Arc::new(FakePublisher::new()), config);

        let outcome = c.run(matrix(&["a", "b", "c", "d", "e"])).await.unwrap();
        assert!(outcome.report.success);
        assert!(provisioner.max_live() <= 2);
    }

    #[tokio::test]
    async fn test_cancel_before_run_aborts_everything() {
        let provisioner = Arc::new(FakeProvisioner::new());
        let publisher = Arc::new(FakePublisher::new());
        let c = coordinator(provisioner.clone(), Arc::new(FakeTestRunner::new()), publisher.clone(), publishing());
        c.cancel_handle().cancel();

        let outcome = c.run(matrix(&["a", "b"])).await.unwrap();
        assert!(outcome.report.runs.iter().all(|r| r.state == PipelineState::Aborted));
        assert_eq!(provisioner.provision_calls(), 0);
        assert_eq!(outcome.publish, PublishStatus::Skipped);
        assert_eq!(publisher.calls(), 0);
    }
}
