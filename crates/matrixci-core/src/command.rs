//! Command-driven collaborators.
//!
//! Generic implementations of the collaborator traits that run configured
//! commands inside execution contexts. They know nothing about any
//! particular runtime: what "build" or "install" means is entirely in the
//! commands.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::collaborators::{
    Builder, Installer, Provisioner, PublishTarget, Publisher, SourceLocation, SuiteRef,
    TestOutcome, TestRunner,
};
use crate::context::ExecutionContext;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{BuildError, InstallError, ProvisionError, PublishError, RunError, RunnerError};
use crate::runner::{StageResult, StageRunner};
use crate::stage::{CapturedOutput, CommandSpec, Completed, Placeholders, StageKind};
use crate::store::Artifact;

/// Directories always appended to a context's search path.
pub const DEFAULT_SYSTEM_DIRS: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];

/// Directory names never copied into a context's source tree.
const SKIPPED_SOURCE_DIRS: [&str; 2] = [".git", "target"];

/// Lines of captured output quoted in error messages.
const ERROR_TAIL_LINES: usize = 20;

/// Placeholder values for a stage. Only build is told where the source
/// copy lives.
fn context_placeholders(ctx: &ExecutionContext, stage: StageKind) -> Placeholders {
    let placeholders = Placeholders::new()
        .with("prefix", ctx.prefix_dir().to_string_lossy())
        .with("dist", ctx.dist_dir().to_string_lossy())
        .with("work", ctx.work_dir().to_string_lossy())
        .with("id", ctx.descriptor().id.clone())
        .with("runtime", ctx.descriptor().runtime.clone())
        .with("arch", ctx.descriptor().arch.clone());
    match stage {
        StageKind::Build => placeholders.with("source", ctx.source_dir().to_string_lossy()),
        _ => placeholders,
    }
}

fn failure_summary(result: &StageResult) -> String {
    let tail = result.output.tail(ERROR_TAIL_LINES);
    if tail.is_empty() {
        format!("{} exited with status {}", result.stage, result.exit_code)
    } else {
        format!("{} exited with status {}: {}", result.stage, result.exit_code, tail)
    }
}

// ---------------------------------------------------------------------------
// LocalProvisioner
// ---------------------------------------------------------------------------

/// Provisions contexts as directories under a local work root.
#[derive(Debug, Clone)]
pub struct LocalProvisioner {
    work_root: PathBuf,
    toolchains: BTreeMap<String, PathBuf>,
    allowed_arch: Vec<String>,
    system_dirs: Vec<PathBuf>,
    command: Option<CommandSpec>,
    keep_workdirs: bool,
}

impl LocalProvisioner {
    pub fn new(work_root: impl Into<PathBuf>) -> Self {
        Self {
            work_root: work_root.into(),
            toolchains: BTreeMap::new(),
            allowed_arch: Vec::new(),
            system_dirs: DEFAULT_SYSTEM_DIRS.iter().map(PathBuf::from).collect(),
            command: None,
            keep_workdirs: false,
        }
    }

    /// Map runtimes to toolchain `bin` directories. When non-empty, a
    /// runtime missing from the table cannot be provisioned.
    pub fn with_toolchains(mut self, toolchains: BTreeMap<String, PathBuf>) -> Self {
        self.toolchains = toolchains;
        self
    }

    /// Architectures this host can serve. Empty means the host's own.
    pub fn allow_arch(mut self, arch: Vec<String>) -> Self {
        self.allowed_arch = arch;
        self
    }

    pub fn with_system_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.system_dirs = dirs;
        self
    }

    /// Command run inside each fresh context.
    pub fn with_command(mut self, command: CommandSpec) -> Self {
        self.command = Some(command);
        self
    }

    pub fn keep_workdirs(mut self, keep: bool) -> Self {
        self.keep_workdirs = keep;
        self
    }

    fn arch_supported(&self, arch: &str) -> bool {
        if self.allowed_arch.is_empty() {
            arch == std::env::consts::ARCH
        } else {
            self.allowed_arch.iter().any(|a| a == arch)
        }
    }

    fn toolchain_dirs(&self, descriptor: &EnvironmentDescriptor) -> Result<Vec<PathBuf>, ProvisionError> {
        let mut dirs = Vec::new();
        if !self.toolchains.is_empty() {
            let dir = self.toolchains.get(&descriptor.runtime).ok_or_else(|| {
                ProvisionError::new(format!("no toolchain configured for runtime {}", descriptor.runtime))
            })?;
            if !dir.is_dir() {
                return Err(ProvisionError::new(format!(
                    "toolchain directory {:?} for runtime {} does not exist",
                    dir, descriptor.runtime
                )));
            }
            dirs.push(dir.clone());
        }
        dirs.extend(self.system_dirs.iter().filter(|d| d.is_dir()).cloned());
        Ok(dirs)
    }

    async fn remove_root(&self, ctx: &ExecutionContext) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(ctx.root()).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn provision(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Completed<ExecutionContext>, ProvisionError> {
        if !self.arch_supported(&descriptor.arch) {
            return Err(ProvisionError::new(format!(
                "architecture {} is not available on this host",
                descriptor.arch
            )));
        }
        let toolchain_dirs = self.toolchain_dirs(descriptor)?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let root = self
            .work_root
            .join(format!("{}-{}", descriptor.id, &suffix[..8]));
        let ctx = ExecutionContext::create(descriptor.clone(), &root, toolchain_dirs)
            .map_err(|e| ProvisionError::new(format!("create context at {:?}: {}", root, e)))?;
        debug!(descriptor = %descriptor.id, root = ?root, "context directories created");

        let Some(command) = &self.command else {
            return Ok(Completed::new(
                ctx,
                CapturedOutput::new(format!("context ready at {}", root.display()), ""),
            ));
        };

        let placeholders = context_placeholders(&ctx, StageKind::Provision);
        let outcome = StageRunner::run(&ctx, StageKind::Provision, command, &placeholders).await;
        let failure = match outcome {
            Ok(result) if result.passed() => return Ok(Completed::new(ctx, result.output)),
            Ok(result) => failure_summary(&result),
            Err(e) => e.to_string(),
        };
        if let Err(e) = self.remove_root(&ctx).await {
            warn!(descriptor = %descriptor.id, error = %e, "cleanup after failed provision failed");
        }
        Err(ProvisionError::new(failure))
    }

    async fn teardown(&self, context: &ExecutionContext) -> Result<(), ProvisionError> {
        if self.keep_workdirs {
            info!(descriptor = %context.descriptor().id, root = ?context.root(), "keeping work directory");
            return Ok(());
        }
        self.remove_root(context)
            .await
            .map_err(|e| ProvisionError::new(format!("remove {:?}: {}", context.root(), e)))
    }
}

// ---------------------------------------------------------------------------
// CommandBuilder
// ---------------------------------------------------------------------------

/// Copies the source into the context and runs the build command.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    command: CommandSpec,
    artifact: String,
    exclude: Vec<PathBuf>,
}

impl CommandBuilder {
    /// `artifact` names the build output: a file, or a directory holding
    /// exactly one file. Placeholders are expanded and relative paths are
    /// taken from the build command's working directory.
    pub fn new(command: CommandSpec, artifact: impl Into<String>) -> Self {
        Self {
            command,
            artifact: artifact.into(),
            exclude: Vec::new(),
        }
    }

    /// Paths never copied into the context, e.g. a work root that lives
    /// inside the source tree.
    pub fn excluding(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.exclude.extend(paths);
        self
    }

    fn locate_artifact(&self, ctx: &ExecutionContext, placeholders: &Placeholders) -> Result<PathBuf, String> {
        let cwd = ctx.resolve_workdir(&self.command.workdir).map_err(|e| e.to_string())?;
        let path = cwd.join(placeholders.expand(&self.artifact));
        if path.is_file() {
            return Ok(path);
        }
        if !path.is_dir() {
            return Err(format!("build output {:?} not found", path));
        }
        let files: Vec<PathBuf> = std::fs::read_dir(&path)
            .map_err(|e| format!("read {:?}: {}", path, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        match files.as_slice() {
            [single] => Ok(single.clone()),
            [] => Err(format!("build output directory {:?} is empty", path)),
            many => Err(format!(
                "build output directory {:?} holds {} files, expected one",
                path,
                many.len()
            )),
        }
    }
}

/// Recursively copy `from` into `to`, skipping VCS and build directories.
fn copy_tree(from: &Path, to: &Path, exclude: &HashSet<PathBuf>) -> std::io::Result<u64> {
    let mut copied = 0;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            let skipped_name = SKIPPED_SOURCE_DIRS.iter().any(|s| name == *s);
            let canonical = path.canonicalize().unwrap_or_else(|_| path.clone());
            if skipped_name || exclude.contains(&canonical) {
                continue;
            }
            let dest = to.join(&name);
            std::fs::create_dir_all(&dest)?;
            copied += copy_tree(&path, &dest, exclude)?;
        } else if file_type.is_file() {
            std::fs::copy(&path, to.join(&name))?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl Builder for CommandBuilder {
    async fn build(
        &self,
        context: &ExecutionContext,
        source: &SourceLocation,
    ) -> Result<Completed<Artifact>, RunError> {
        context.ensure_live()?;

        let from = source.0.clone();
        let to = context.source_dir();
        let mut exclude: HashSet<PathBuf> = self
            .exclude
            .iter()
            .map(|p| p.canonicalize().unwrap_or_else(|_| p.clone()))
            .collect();
        exclude.insert(context.root().canonicalize().unwrap_or_else(|_| context.root().to_path_buf()));
        let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &to, &exclude))
            .await
            .map_err(|e| RunnerError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(RunnerError::from)?;
        debug!(descriptor = %context.descriptor().id, files = copied, "source copied into context");

        let placeholders = context_placeholders(context, StageKind::Build);
        let result = StageRunner::run(context, StageKind::Build, &self.command, &placeholders).await?;
        if !result.passed() {
            return Err(BuildError {
                exit_status: result.exit_code,
                output: result.output,
            }
            .into());
        }

        let path = match self.locate_artifact(context, &placeholders) {
            Ok(path) => path,
            Err(reason) => {
                // The command succeeded but left nothing to install.
                let mut output = result.output;
                output.stderr.push_str(&reason);
                output.stderr.push('\n');
                return Err(BuildError {
                    exit_status: 1,
                    output,
                }
                .into());
            }
        };

        let artifact = Artifact::from_file(context.descriptor().id.clone(), path).map_err(RunnerError::from)?;
        info!(
            descriptor = %context.descriptor().id,
            artifact = %artifact.file_name,
            size = artifact.size,
            "artifact built"
        );
        Ok(Completed::new(artifact, result.output))
    }
}

// ---------------------------------------------------------------------------
// CommandInstaller
// ---------------------------------------------------------------------------

/// Installs an artifact by running a command with `{artifact}` bound to it.
#[derive(Debug, Clone)]
pub struct CommandInstaller {
    command: CommandSpec,
}

impl CommandInstaller {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl Installer for CommandInstaller {
    async fn install(
        &self,
        context: &ExecutionContext,
        artifact: &Artifact,
    ) -> Result<Completed<()>, RunError> {
        let artifact_path = artifact.path.to_string_lossy().into_owned();
        let placeholders = context_placeholders(context, StageKind::Install).with("artifact", artifact_path.clone());
        let mut env = BTreeMap::new();
        env.insert("ARTIFACT".to_string(), artifact_path);

        let result =
            StageRunner::run_with_env(context, StageKind::Install, &self.command, &placeholders, &env).await?;
        if !result.passed() {
            return Err(InstallError {
                exit_status: result.exit_code,
                output: result.output,
            }
            .into());
        }
        Ok(Completed::new((), result.output))
    }
}

// ---------------------------------------------------------------------------
// CommandTestRunner
// ---------------------------------------------------------------------------

/// Runs the suite command with `{suite}` bound to the suite reference.
#[derive(Debug, Clone)]
pub struct CommandTestRunner {
    command: CommandSpec,
}

impl CommandTestRunner {
    pub fn new(command: CommandSpec) -> Self {
        Self { command }
    }
}

#[async_trait]
impl TestRunner for CommandTestRunner {
    async fn test(&self, context: &ExecutionContext, suite: &SuiteRef) -> Result<TestOutcome, RunError> {
        let placeholders = context_placeholders(context, StageKind::Test).with("suite", suite.0.clone());
        let result = StageRunner::run(context, StageKind::Test, &self.command, &placeholders).await?;
        Ok(TestOutcome {
            passed: result.passed(),
            exit_code: result.exit_code,
            output: result.output,
        })
    }
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

/// Copies artifacts and their checksum sidecars into a directory,
/// one subdirectory per descriptor.
#[derive(Debug, Clone, Default)]
pub struct DirectoryPublisher;

impl DirectoryPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Publisher for DirectoryPublisher {
    async fn publish(&self, artifacts: &[Artifact], target: &PublishTarget) -> Result<(), PublishError> {
        let root = PathBuf::from(&target.0);
        for artifact in artifacts {
            let dir = root.join(&artifact.descriptor_id);
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| PublishError::new(format!("create {:?}: {}", dir, e)))?;
            let dest = dir.join(&artifact.file_name);
            tokio::fs::copy(&artifact.path, &dest)
                .await
                .map_err(|e| PublishError::new(format!("copy {:?}: {}", artifact.path, e)))?;
            tokio::fs::write(
                dir.join(format!("{}.sha256", artifact.file_name)),
                artifact.digest.sidecar_line(&artifact.file_name),
            )
            .await
            .map_err(|e| PublishError::new(format!("write sidecar for {:?}: {}", dest, e)))?;
            debug!(descriptor = %artifact.descriptor_id, dest = ?dest, "artifact published");
        }
        Ok(())
    }
}

/// Runs a host command to publish.
///
/// An argument that is exactly `{artifacts}` expands to one argument per
/// artifact path; `{target}` is replaced by the target string. Unlike
/// stage commands this runs on the host with the host's environment.
#[derive(Debug, Clone)]
pub struct CommandPublisher {
    command: CommandSpec,
    cwd: PathBuf,
}

impl CommandPublisher {
    pub fn new(command: CommandSpec, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
        }
    }

    fn expand(&self, artifacts: &[Artifact], target: &PublishTarget) -> Vec<String> {
        let placeholders = Placeholders::new().with("target", target.0.clone());
        let mut args = Vec::new();
        for arg in &self.command.args {
            if arg == "{artifacts}" {
                args.extend(artifacts.iter().map(|a| a.path.to_string_lossy().into_owned()));
            } else {
                args.push(placeholders.expand(arg));
            }
        }
        args
    }
}

#[async_trait]
impl Publisher for CommandPublisher {
    async fn publish(&self, artifacts: &[Artifact], target: &PublishTarget) -> Result<(), PublishError> {
        let args = self.expand(artifacts, target);
        debug!(program = %self.command.program, args = ?args, "running publish command");

        let mut cmd = tokio::process::Command::new(&self.command.program);
        cmd.args(&args)
            .current_dir(&self.cwd)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        let run = cmd.output();
        let output = if self.command.timeout_secs > 0 {
            tokio::time::timeout(std::time::Duration::from_secs(self.command.timeout_secs), run)
                .await
                .map_err(|_| PublishError::new(format!("timed out after {}s", self.command.timeout_secs)))?
        } else {
            run.await
        }
        .map_err(|e| PublishError::new(format!("spawn {}: {}", self.command.program, e)))?;

        if !output.status.success() {
            let captured = CapturedOutput::new(
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            );
            return Err(PublishError::new(format!(
                "{} exited with status {}: {}",
                self.command.program,
                output.status.code().unwrap_or(-1),
                captured.tail(ERROR_TAIL_LINES)
            )));
        }
        Ok(())
    }
}
