//! matrixci: matrix CI pipeline execution core
//!
//! Runs a declared matrix of target environments through
//! provision → build → isolated install → test, one pipeline per entry:
//! - Every context is released whatever the outcome
//! - Artifacts are committed only for runs that passed every stage
//! - Results are aggregated in declaration order
//! - Publishing happens once, and only when every entry succeeded

pub mod collaborators;
pub mod command;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod fakes;
pub mod pipeline;
pub mod report;
pub mod runner;
pub mod stage;
pub mod store;
pub mod telemetry;

// Re-export key types
pub use collaborators::{
    Builder, Installer, Provisioner, PublishTarget, Publisher, SourceLocation, SuiteRef,
    TestOutcome, TestRunner,
};
pub use command::{
    CommandBuilder, CommandInstaller, CommandPublisher, CommandTestRunner, DirectoryPublisher,
    LocalProvisioner,
};
pub use config::{MatrixConfig, RunOptions, DEFAULT_ARTIFACT_DIR, DEFAULT_WORK_DIR};
pub use context::{Acquired, ContextManager, ExecutionContext};
pub use coordinator::{
    AggregateReport, Concurrency, CoordinatorConfig, MatrixCoordinator, MatrixOutcome,
    PublishStatus,
};
pub use descriptor::{validate_matrix, EnvironmentDescriptor, RESERVED_VARIABLES};
pub use digest::Digest;
pub use error::{
    BuildError, ConfigurationError, InstallError, ProvisionError, PublishError, RunError,
    RunnerError, StoreError,
};
pub use pipeline::{
    CancelHandle, CancelSignal, FailureInfo, FailureKind, PipelineMachine, PipelineRun,
    PipelineState,
};
pub use report::{render_summary, write_report_json};
pub use runner::{StageResult, StageRunner};
pub use stage::{CapturedOutput, CommandSpec, Completed, Placeholders, StageKind, WorkDir};
pub use store::{Artifact, ArtifactStore, FsArtifactStore};
pub use telemetry::{init_tracing, level_for_verbosity};
