//! Matrix configuration file.
//!
//! A matrix file names the source tree, the command for each stage, an
//! optional publish target and the matrix entries. TOML is the primary
//! format; files ending in `.json` are read as JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::collaborators::{Publisher, PublishTarget, SourceLocation, SuiteRef};
use crate::command::{
    CommandBuilder, CommandInstaller, CommandPublisher, CommandTestRunner, DirectoryPublisher,
    LocalProvisioner,
};
use crate::context::ContextManager;
use crate::coordinator::{Concurrency, CoordinatorConfig, MatrixCoordinator};
use crate::descriptor::{validate_matrix, EnvironmentDescriptor};
use crate::error::ConfigurationError;
use crate::pipeline::PipelineMachine;
use crate::stage::{CommandSpec, WorkDir};
use crate::store::FsArtifactStore;

/// Default artifact directory, relative to the current directory.
pub const DEFAULT_ARTIFACT_DIR: &str = "dist/matrixci";

/// Default root for execution contexts, relative to the current directory.
pub const DEFAULT_WORK_DIR: &str = ".matrixci/work";

fn default_source() -> PathBuf {
    PathBuf::from(".")
}

fn default_artifact() -> String {
    "{dist}".to_string()
}

fn default_true() -> bool {
    true
}

/// Commands for each per-entry stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct StageCommands {
    #[serde(default)]
    pub provision: Option<CommandSpec>,
    pub build: CommandSpec,
    pub install: CommandSpec,
    pub test: CommandSpec,
}

/// Where artifacts go after a fully successful matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct PublishConfig {
    /// Directory to copy artifacts into.
    #[serde(default)]
    pub target: Option<PathBuf>,
    /// Command to run instead.
    #[serde(default)]
    pub command: Option<CommandSpec>,
}

/// Parsed matrix file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MatrixConfig {
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Suite reference passed to the test command as `{suite}`.
    #[serde(default)]
    pub suite: String,

    /// Build output: a file, or a directory holding a single file.
    #[serde(default = "default_artifact")]
    pub artifact: String,

    #[serde(default)]
    pub allowed_arch: Vec<String>,

    /// Runtime name -> toolchain `bin` directory.
    #[serde(default)]
    pub toolchains: BTreeMap<String, PathBuf>,

    #[serde(default)]
    pub concurrency: Concurrency,

    #[serde(default = "default_true")]
    pub publish_on_success: bool,

    pub stages: StageCommands,

    #[serde(default)]
    pub publish: Option<PublishConfig>,

    #[serde(default)]
    pub matrix: Vec<EnvironmentDescriptor>,
}

/// Per-invocation settings layered over the file.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub artifact_dir: PathBuf,
    pub work_dir: PathBuf,
    pub keep_workdirs: bool,
    pub concurrency: Option<Concurrency>,
    pub publish_on_success: Option<bool>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from(DEFAULT_ARTIFACT_DIR),
            work_dir: PathBuf::from(DEFAULT_WORK_DIR),
            keep_workdirs: false,
            concurrency: None,
            publish_on_success: None,
        }
    }
}

impl MatrixConfig {
    /// Read, parse and validate a matrix file. Relative paths in the file
    /// are taken from the file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(path, &content)?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        config.validate()?;
        debug!(path = ?path, entries = config.matrix.len(), "matrix file loaded");
        Ok(config)
    }

    /// Parse without touching the filesystem. `path` picks the format.
    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigurationError> {
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        let parse_err = |reason: String| ConfigurationError::Parse {
            path: path.to_path_buf(),
            reason,
        };
        if is_json {
            serde_json::from_str(content).map_err(|e| parse_err(e.to_string()))
        } else {
            toml::from_str(content).map_err(|e| parse_err(e.to_string()))
        }
    }

    fn resolve_paths(&mut self, base: &Path) {
        if self.source.is_relative() {
            self.source = base.join(&self.source);
        }
        for dir in self.toolchains.values_mut() {
            if dir.is_relative() {
                *dir = base.join(&*dir);
            }
        }
        if let Some(PublishConfig {
            target: Some(target),
            ..
        }) = &mut self.publish
        {
            if target.is_relative() {
                *target = base.join(&*target);
            }
        }
    }

    /// Check everything that can be checked before running.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_matrix(&self.matrix)?;

        let stages = [
            ("provision", self.stages.provision.as_ref()),
            ("build", Some(&self.stages.build)),
            ("install", Some(&self.stages.install)),
            ("test", Some(&self.stages.test)),
        ];
        for (name, spec) in stages {
            if let Some(spec) = spec {
                if spec.program.trim().is_empty() {
                    return Err(invalid_stage(name, "program must not be empty"));
                }
                if !spec.workdir.is_contained() {
                    return Err(invalid_stage(
                        name,
                        "workdir must be relative to the execution context, without `..`",
                    ));
                }
            }
        }
        if self.stages.test.workdir.targets_source() {
            return Err(invalid_stage("test", "tests cannot run inside the source tree"));
        }
        if self.artifact.trim().is_empty() {
            return Err(invalid_stage("build", "artifact path must not be empty"));
        }

        if let Some(publish) = &self.publish {
            match (&publish.target, &publish.command) {
                (Some(_), None) => {}
                (None, Some(cmd)) if !cmd.program.trim().is_empty() => {}
                (None, Some(_)) => return Err(invalid_stage("publish", "program must not be empty")),
                _ => {
                    return Err(invalid_stage(
                        "publish",
                        "exactly one of `target` or `command` must be set",
                    ))
                }
            }
        }
        Ok(())
    }

    /// Build a coordinator wired to the command collaborators.
    pub fn coordinator(&self, options: &RunOptions) -> Result<MatrixCoordinator> {
        if !self.source.is_dir() {
            return Err(invalid_stage(
                "build",
                &format!("source {:?} is not a directory", self.source),
            )
            .into());
        }
        std::fs::create_dir_all(&options.work_dir)
            .with_context(|| format!("create work directory {:?}", options.work_dir))?;
        let store = FsArtifactStore::new(&options.artifact_dir)
            .with_context(|| format!("open artifact store at {:?}", options.artifact_dir))?;

        let mut provisioner = LocalProvisioner::new(&options.work_dir)
            .with_toolchains(self.toolchains.clone())
            .allow_arch(self.allowed_arch.clone())
            .keep_workdirs(options.keep_workdirs);
        if let Some(cmd) = &self.stages.provision {
            provisioner = provisioner.with_command(cmd.clone());
        }

        let builder = CommandBuilder::new(self.stages.build.clone(), self.artifact.clone())
            .excluding([options.work_dir.clone(), options.artifact_dir.clone()]);

        let machine = PipelineMachine::new(
            Arc::new(ContextManager::new(Arc::new(provisioner))),
            Arc::new(builder),
            Arc::new(CommandInstaller::new(self.stages.install.clone())),
            Arc::new(CommandTestRunner::new(self.stages.test.clone())),
            Arc::new(store),
            SourceLocation(self.source.clone()),
            SuiteRef(self.suite.clone()),
        );

        let (publisher, publish_target) = self.publisher()?;
        let config = CoordinatorConfig {
            concurrency: options.concurrency.unwrap_or(self.concurrency),
            publish_on_success: options.publish_on_success.unwrap_or(self.publish_on_success),
            publish_target,
        };
        Ok(MatrixCoordinator::new(Arc::new(machine), publisher, config))
    }

    fn publisher(&self) -> Result<(Option<Arc<dyn Publisher>>, Option<PublishTarget>)> {
        let Some(publish) = &self.publish else {
            return Ok((None, None));
        };
        if let Some(target) = &publish.target {
            let publisher: Arc<dyn Publisher> = Arc::new(DirectoryPublisher::new());
            let target = PublishTarget(target.to_string_lossy().into_owned());
            return Ok((Some(publisher), Some(target)));
        }
        if let Some(cmd) = &publish.command {
            let cwd = std::env::current_dir().context("resolve current directory")?;
            let publisher: Arc<dyn Publisher> = Arc::new(CommandPublisher::new(cmd.clone(), cwd));
            return Ok((Some(publisher), Some(PublishTarget(cmd.program.clone()))));
        }
        Ok((None, None))
    }
}

fn invalid_stage(stage: &str, reason: &str) -> ConfigurationError {
    ConfigurationError::InvalidStage {
        stage: stage.to_string(),
        reason: reason.to_string(),
    }
}
