//! Contracts for the external collaborators a pipeline drives.
//!
//! The core never knows how a runtime is installed or how a package is built;
//! it only calls these traits. [`crate::command`] has command-driven
//! implementations, [`crate::fakes`] has scripted ones for tests.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::context::ExecutionContext;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{ProvisionError, PublishError, RunError};
use crate::stage::{CapturedOutput, Completed};
use crate::store::Artifact;

/// Where the source to build lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceLocation(pub PathBuf);

/// Reference to the verification suite, passed through to the test runner.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SuiteRef(pub String);

/// Publication destination.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PublishTarget(pub String);

/// Result of running the verification suite.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub passed: bool,
    pub exit_code: i32,
    pub output: CapturedOutput,
}

/// Creates and destroys execution contexts.
#[async_trait]
pub trait Provisioner: Send + Sync {
    async fn provision(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Completed<ExecutionContext>, ProvisionError>;

    async fn teardown(&self, context: &ExecutionContext) -> Result<(), ProvisionError>;
}

/// Produces a distributable artifact from source.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(
        &self,
        context: &ExecutionContext,
        source: &SourceLocation,
    ) -> Result<Completed<Artifact>, RunError>;
}

/// Materialises an artifact into the context's install prefix.
#[async_trait]
pub trait Installer: Send + Sync {
    async fn install(
        &self,
        context: &ExecutionContext,
        artifact: &Artifact,
    ) -> Result<Completed<()>, RunError>;
}

/// Runs the verification suite against the installed artifact.
#[async_trait]
pub trait TestRunner: Send + Sync {
    async fn test(&self, context: &ExecutionContext, suite: &SuiteRef)
        -> Result<TestOutcome, RunError>;
}

/// Publishes the artifacts of a fully successful matrix.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, artifacts: &[Artifact], target: &PublishTarget)
        -> Result<(), PublishError>;
}
