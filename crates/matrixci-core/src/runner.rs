//! Stage execution inside an execution context.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::context::ExecutionContext;
use crate::error::RunnerError;
use crate::stage::{CapturedOutput, CommandSpec, Placeholders, StageKind};

/// Result of a stage execution. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageResult {
    /// Stage kind.
    pub stage: StageKind,

    /// Exit code (0 = success, -1 = no exit code / infrastructure failure).
    pub exit_code: i32,

    /// Captured stdout and stderr.
    pub output: CapturedOutput,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

impl StageResult {
    /// Build a result from timestamps taken around the stage.
    pub fn new(
        stage: StageKind,
        exit_code: i32,
        output: CapturedOutput,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            stage,
            exit_code,
            output,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one stage's command inside a context.
pub struct StageRunner;

impl StageRunner {
    /// Execute `spec` for `stage` inside `context`.
    ///
    /// A non-zero exit is reported in [`StageResult::exit_code`]; only
    /// infrastructure problems return `Err`.
    pub async fn run(
        context: &ExecutionContext,
        stage: StageKind,
        spec: &CommandSpec,
        placeholders: &Placeholders,
    ) -> Result<StageResult, RunnerError> {
        Self::run_with_env(context, stage, spec, placeholders, &BTreeMap::new()).await
    }

    /// Like [`StageRunner::run`], with extra variables layered over the
    /// context's stage environment.
    pub async fn run_with_env(
        context: &ExecutionContext,
        stage: StageKind,
        spec: &CommandSpec,
        placeholders: &Placeholders,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<StageResult, RunnerError> {
        context.ensure_live()?;

        if spec.program.trim().is_empty() {
            return Err(RunnerError::EmptyCommand {
                stage: stage.to_string(),
            });
        }

        let cwd = context.resolve_workdir(&spec.workdir)?;
        if stage == StageKind::Test && context.is_in_source_tree(&cwd) {
            return Err(RunnerError::IsolationViolation {
                stage: stage.to_string(),
                reason: format!("working directory {:?} is inside the source tree", cwd),
            });
        }
        tokio::fs::create_dir_all(&cwd).await?;
        context.ensure_within_root(&cwd)?;

        let program = context.resolve_program(&spec.program, stage, &cwd)?;
        let args = spec.expand_args(placeholders);

        debug!(
            descriptor = %context.descriptor().id,
            stage = %stage,
            program = ?program,
            args = ?args,
            "spawning stage command"
        );

        let mut env = context.env_for(stage);
        env.extend(extra_env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let started_at = Utc::now();
        let child = Command::new(&program)
            .args(&args)
            .current_dir(&cwd)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = if spec.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(spec.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| RunnerError::Timeout {
                stage: stage.to_string(),
                timeout_secs: spec.timeout_secs,
            })??
        } else {
            child.wait_with_output().await?
        };
        let finished_at = Utc::now();

        let exit_code = output.status.code().unwrap_or(-1);
        let captured = CapturedOutput::new(
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr),
        );

        Ok(StageResult::new(stage, exit_code, captured, started_at, finished_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::EnvironmentDescriptor;
    use crate::stage::WorkDir;
    use std::path::PathBuf;

    fn context(dir: &std::path::Path) -> ExecutionContext {
        let d = EnvironmentDescriptor::new("a", "3.12", "x86_64").with_var("GREETING", "hello");
        ExecutionContext::create(d, dir.join("ctx"), vec![PathBuf::from("/bin"), PathBuf::from("/usr/bin")])
            .unwrap()
    }

    #[test]
    fn test_stage_result_passed() {
        let now = Utc::now();
        let result = StageResult::new(StageKind::Build, 0, CapturedOutput::default(), now, now);
        assert!(result.passed());
        let failed = StageResult::new(StageKind::Build, 1, CapturedOutput::from_stderr("error"), now, now);
        assert!(!failed.passed());
    }

    #[tokio::test]
    async fn test_execute_simple_command() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("echo").args(["hello"]);

        let result = StageRunner::run(&ctx, StageKind::Build, &spec, &Placeholders::new())
            .await
            .expect("execute failed");
        assert!(result.passed());
        assert!(result.output.stdout.contains("hello"));
        assert!(result.finished_at >= result.started_at);
    }

    #[tokio::test]
    async fn test_execute_failing_command_is_data() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("false");

        let result = StageRunner::run(&ctx, StageKind::Test, &spec, &Placeholders::new())
            .await
            .expect("non-zero exit must not be an error");
        assert!(!result.passed());
        assert_ne!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn test_host_environment_not_inherited() {
        std::env::set_var("MATRIXCI_HOST_LEAK", "leaked");
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("sh").args(["-c", "echo \"[$MATRIXCI_HOST_LEAK][$GREETING][$MATRIXCI_ID]\""]);

        let result = StageRunner::run(&ctx, StageKind::Build, &spec, &Placeholders::new())
            .await
            .unwrap();
        assert_eq!(result.output.stdout.trim(), "[][hello][a]");
    }

    #[tokio::test]
    async fn test_placeholders_and_workdir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("sh")
            .args(["-c", "pwd; echo {suite}"])
            .in_dir(WorkDir::Work);
        let ph = Placeholders::new().with("suite", "tests/unit");

        let result = StageRunner::run(&ctx, StageKind::Test, &spec, &ph).await.unwrap();
        let mut lines = result.output.stdout.lines();
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(cwd.canonicalize().unwrap(), ctx.work_dir().canonicalize().unwrap());
        assert_eq!(lines.next(), Some("tests/unit"));
    }

    #[tokio::test]
    async fn test_extra_env_layered() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("sh").args(["-c", "echo \"$ARTIFACT:$MATRIXCI_STAGE\""]);
        let mut extra = BTreeMap::new();
        extra.insert("ARTIFACT".to_string(), "/store/a/pkg.whl".to_string());

        let result = StageRunner::run_with_env(&ctx, StageKind::Install, &spec, &Placeholders::new(), &extra)
            .await
            .unwrap();
        assert_eq!(result.output.stdout.trim(), "/store/a/pkg.whl:install");
    }

    #[tokio::test]
    async fn test_command_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("definitely-not-a-real-binary");

        assert!(matches!(
            StageRunner::run(&ctx, StageKind::Build, &spec, &Placeholders::new()).await,
            Err(RunnerError::CommandNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_test_stage_refuses_source_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("true").in_dir(WorkDir::Source);

        assert!(matches!(
            StageRunner::run(&ctx, StageKind::Test, &spec, &Placeholders::new()).await,
            Err(RunnerError::IsolationViolation { .. })
        ));
        assert!(StageRunner::run(&ctx, StageKind::Build, &spec, &Placeholders::new())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_test_stage_refuses_relative_source_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        for rel in ["source", "./source", "source/sub/not-created"] {
            let spec = CommandSpec::new("true").in_dir(WorkDir::Relative(rel.into()));
            assert!(
                matches!(
                    StageRunner::run(&ctx, StageKind::Test, &spec, &Placeholders::new()).await,
                    Err(RunnerError::IsolationViolation { .. })
                ),
                "{rel}"
            );
        }
        assert!(!ctx.source_dir().join("source/sub").exists());
    }

    #[tokio::test]
    async fn test_workdir_escapes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let host = dir.path().join("host_project");
        std::fs::create_dir_all(&host).unwrap();
        std::fs::write(host.join("mypkg.py"), "").unwrap();

        let escapes = [
            WorkDir::Relative(host.clone()),
            WorkDir::Relative("../host_project".into()),
            WorkDir::Relative("work/../../host_project".into()),
        ];
        for workdir in escapes {
            for stage in [StageKind::Build, StageKind::Install, StageKind::Test] {
                let spec = CommandSpec::new("sh").args(["-c", "pwd; ls"]).in_dir(workdir.clone());
                assert!(
                    matches!(
                        StageRunner::run(&ctx, stage, &spec, &Placeholders::new()).await,
                        Err(RunnerError::WorkDirEscapesContext { .. })
                    ),
                    "{stage} ran in {workdir:?}"
                );
            }
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlink_out_of_context_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let host = dir.path().join("host_project");
        std::fs::create_dir_all(&host).unwrap();
        std::os::unix::fs::symlink(&host, ctx.work_dir().join("checkout")).unwrap();

        let spec = CommandSpec::new("true").in_dir(WorkDir::Relative("work/checkout".into()));
        assert!(matches!(
            StageRunner::run(&ctx, StageKind::Test, &spec, &Placeholders::new()).await,
            Err(RunnerError::WorkDirEscapesContext { .. })
        ));
    }

    #[tokio::test]
    async fn test_released_context_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        ctx.mark_released();

        assert!(matches!(
            StageRunner::run(&ctx, StageKind::Build, &CommandSpec::new("true"), &Placeholders::new()).await,
            Err(RunnerError::ContextReleased { .. })
        ));
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());
        let spec = CommandSpec::new("sleep").args(["5"]).timeout(1);

        assert!(matches!(
            StageRunner::run(&ctx, StageKind::Test, &spec, &Placeholders::new()).await,
            Err(RunnerError::Timeout { .. })
        ));
    }
}
