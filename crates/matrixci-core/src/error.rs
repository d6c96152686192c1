//! Error taxonomy for matrix pipeline runs.
//!
//! `ConfigurationError` is fatal and raised before any context is acquired.
//! Everything in [`RunError`] is scoped to a single pipeline run and only
//! fails that run. `PublishError` belongs to the coordinator.

use std::path::PathBuf;

use crate::stage::CapturedOutput;

/// Malformed or inconsistent matrix input. Aborts before execution.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("duplicate descriptor id: {id}")]
    DuplicateId { id: String },

    #[error("invalid descriptor {id:?}: {reason}")]
    InvalidDescriptor { id: String, reason: String },

    #[error("matrix has no entries")]
    EmptyMatrix,

    #[error("failed to read matrix file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse matrix file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid concurrency {value:?}: {reason}")]
    InvalidConcurrency { value: String, reason: String },

    #[error("invalid {stage} stage: {reason}")]
    InvalidStage { stage: String, reason: String },
}

/// The provisioner could not satisfy a descriptor, or could not tear down.
#[derive(Debug, thiserror::Error)]
#[error("provision failed: {reason}")]
pub struct ProvisionError {
    pub reason: String,
}

impl ProvisionError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// The build command ran and exited unsuccessfully (or produced nothing).
#[derive(Debug, thiserror::Error)]
#[error("build exited with status {exit_status}")]
pub struct BuildError {
    pub exit_status: i32,
    pub output: CapturedOutput,
}

/// The install command ran and exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("install exited with status {exit_status}")]
pub struct InstallError {
    pub exit_status: i32,
    pub output: CapturedOutput,
}

/// Infrastructure failure while running a stage, as opposed to a stage
/// whose command failed.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("execution context {context} has been released")]
    ContextReleased { context: String },

    #[error("command not found on context search path: {program}")]
    CommandNotFound { program: String },

    #[error("stage {stage} has empty command")]
    EmptyCommand { stage: String },

    #[error("stage {stage} timed out after {timeout_secs} seconds")]
    Timeout { stage: String, timeout_secs: u64 },

    #[error("isolation violation in {stage} stage: {reason}")]
    IsolationViolation { stage: String, reason: String },

    #[error("working directory {workdir:?} escapes execution context {context}")]
    WorkDirEscapesContext { context: String, workdir: PathBuf },

    #[error("artifact store error: {0}")]
    Store(#[from] StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything that can end a single pipeline run early.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    /// A collaborator gave up because cancellation was requested.
    #[error("run cancelled")]
    Cancelled,
}

impl RunError {
    /// Whether this error is an infrastructure problem rather than the code
    /// under test failing.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, RunError::Provision(_) | RunError::Runner(_))
    }

    /// Exit status to record on the failing stage. Infrastructure errors use -1.
    pub fn exit_status(&self) -> i32 {
        match self {
            RunError::Build(e) => e.exit_status,
            RunError::Install(e) => e.exit_status,
            _ => -1,
        }
    }

    /// Output captured before the failure, if the command got to run.
    pub fn captured_output(&self) -> CapturedOutput {
        match self {
            RunError::Build(e) => e.output.clone(),
            RunError::Install(e) => e.output.clone(),
            other => CapturedOutput::from_stderr(other.to_string()),
        }
    }
}

impl From<StoreError> for RunError {
    fn from(err: StoreError) -> Self {
        RunError::Runner(RunnerError::Store(err))
    }
}

/// Publication failed after every run succeeded.
#[derive(Debug, thiserror::Error)]
#[error("publish failed: {reason}")]
pub struct PublishError {
    pub reason: String,
}

impl PublishError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors from the artifact store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("no staged artifact for {0}")]
    NotStaged(String),

    #[error("digest mismatch for {descriptor}: expected {expected}, got {actual}")]
    DigestMismatch {
        descriptor: String,
        expected: String,
        actual: String,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
