//! matrixci - matrix CI pipeline runner
//!
//! The `matrixci` command runs a matrix file through provision, build,
//! isolated install and test for every entry, then publishes when every
//! entry succeeded.
//!
//! ## Commands
//!
//! - `run`: execute the matrix and print a summary
//! - `validate`: parse and check a matrix file without running anything
//!
//! ## Exit codes
//!
//! `0` success, `1` pipeline failure, `3` publish failure, `70` internal
//! error, `78` configuration error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use matrixci_core::{
    render_summary, write_report_json, Concurrency, ConfigurationError, MatrixConfig,
    MatrixOutcome, PublishStatus, RunOptions, DEFAULT_ARTIFACT_DIR, DEFAULT_WORK_DIR,
};

const EXIT_PIPELINE_FAILURE: u8 = 1;
const EXIT_PUBLISH_FAILURE: u8 = 3;
const EXIT_INTERNAL: u8 = 70;
const EXIT_CONFIG: u8 = 78;

const EXIT_CODES_HELP: &str = "Exit codes:
  0   every entry succeeded and publishing, if configured, went through
  1   at least one entry did not succeed
  3   every entry succeeded but publishing failed
  70  internal error
  78  invalid matrix file or option";

#[derive(Parser)]
#[command(name = "matrixci")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a build/install/test matrix and publish on success", long_about = None)]
#[command(after_help = EXIT_CODES_HELP)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every matrix entry and publish if all succeed
    Run {
        /// Matrix file (TOML, or JSON by extension)
        matrix: PathBuf,

        /// Concurrent runs: N, -k (all CPUs but k-1), `auto` or `unbounded`
        #[arg(long, allow_hyphen_values = true, env = "MATRIXCI_CONCURRENCY")]
        concurrency: Option<String>,

        /// Publish when every entry succeeds (overrides the matrix file)
        #[arg(long)]
        publish_on_success: Option<bool>,

        /// Where built artifacts are stored
        #[arg(long, default_value = DEFAULT_ARTIFACT_DIR)]
        artifact_dir: PathBuf,

        /// Root for per-entry execution contexts
        #[arg(long, default_value = DEFAULT_WORK_DIR)]
        work_dir: PathBuf,

        /// Keep execution context directories after each run
        #[arg(long)]
        keep_workdirs: bool,

        /// Also write the report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Parse and validate a matrix file
    Validate {
        /// Matrix file (TOML, or JSON by extension)
        matrix: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    matrixci_core::init_tracing(cli.json, matrixci_core::level_for_verbosity(cli.verbose));

    let result = match cli.command {
        Commands::Run {
            matrix,
            concurrency,
            publish_on_success,
            artifact_dir,
            work_dir,
            keep_workdirs,
            report,
        } => {
            cmd_run(
                &matrix,
                concurrency.as_deref(),
                publish_on_success,
                artifact_dir,
                work_dir,
                keep_workdirs,
                report.as_deref(),
            )
            .await
        }
        Commands::Validate { matrix } => cmd_validate(&matrix, cli.json),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            if err.downcast_ref::<ConfigurationError>().is_some() {
                ExitCode::from(EXIT_CONFIG)
            } else {
                ExitCode::from(EXIT_INTERNAL)
            }
        }
    }
}

/// Exit code for a finished matrix. A publish failure after a passing
/// matrix gets its own code so callers can retry just the publish.
fn exit_code(outcome: &MatrixOutcome) -> u8 {
    if !outcome.report.success {
        EXIT_PIPELINE_FAILURE
    } else if matches!(outcome.publish, PublishStatus::Failed { .. }) {
        EXIT_PUBLISH_FAILURE
    } else {
        0
    }
}

/// Run the matrix
async fn cmd_run(
    matrix: &Path,
    concurrency: Option<&str>,
    publish_on_success: Option<bool>,
    artifact_dir: PathBuf,
    work_dir: PathBuf,
    keep_workdirs: bool,
    report: Option<&Path>,
) -> Result<u8> {
    let config = MatrixConfig::load(matrix)?;
    let concurrency = concurrency
        .map(str::parse::<Concurrency>)
        .transpose()?;

    let options = RunOptions {
        artifact_dir,
        work_dir,
        keep_workdirs,
        concurrency,
        publish_on_success,
    };
    let coordinator = config.coordinator(&options)?;

    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling remaining runs");
            cancel.cancel();
        }
    });

    info!(
        matrix = ?matrix,
        entries = config.matrix.len(),
        concurrency = %coordinator.config().concurrency,
        "starting matrix"
    );
    let outcome = coordinator.run(config.matrix.clone()).await?;

    print!("{}", render_summary(&outcome));
    if let Some(path) = report {
        write_report_json(path, &outcome).with_context(|| format!("write report to {:?}", path))?;
        println!("Report: {}", path.display());
    }

    Ok(exit_code(&outcome))
}

#[derive(Serialize)]
struct ValidationSummary<'a> {
    matrix: &'a Path,
    entries: Vec<&'a str>,
    concurrency: String,
    publish: bool,
}

/// Validate a matrix file
fn cmd_validate(matrix: &Path, json: bool) -> Result<u8> {
    let config = MatrixConfig::load(matrix)?;
    let summary = ValidationSummary {
        matrix,
        entries: config.matrix.iter().map(|d| d.id.as_str()).collect(),
        concurrency: config.concurrency.to_string(),
        publish: config.publish.is_some() && config.publish_on_success,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&summary).context("serialize validation summary")?
        );
    } else {
        println!("✓ {} is valid", matrix.display());
        println!("  entries: {}", summary.entries.join(", "));
        println!("  concurrency: {}", summary.concurrency);
        println!("  publish on success: {}", summary.publish);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use matrixci_core::{AggregateReport, EnvironmentDescriptor, PipelineRun, PipelineState};

    fn outcome(success: bool, publish: PublishStatus) -> MatrixOutcome {
        let mut run = PipelineRun::new(EnvironmentDescriptor::new("a", "3.12", "x86_64"));
        run.state = if success {
            PipelineState::Succeeded
        } else {
            PipelineState::Failed
        };
        MatrixOutcome {
            report: AggregateReport::new(vec![run]),
            publish,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(&outcome(true, PublishStatus::NotConfigured)), 0);
        assert_eq!(exit_code(&outcome(true, PublishStatus::Published { artifacts: vec![] })), 0);
        assert_eq!(exit_code(&outcome(false, PublishStatus::Skipped)), EXIT_PIPELINE_FAILURE);
        assert_eq!(
            exit_code(&outcome(true, PublishStatus::Failed { reason: "denied".into() })),
            EXIT_PUBLISH_FAILURE
        );
    }

    #[test]
    fn test_help_lists_exit_codes() {
        use clap::CommandFactory;
        let help = Cli::command().render_help().to_string();
        assert!(help.contains("3   every entry succeeded but publishing failed"));
        assert!(help.contains("78  invalid matrix file"));
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "matrixci",
            "-vv",
            "run",
            "matrix.toml",
            "--concurrency",
            "-2",
            "--publish-on-success",
            "false",
            "--keep-workdirs",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Commands::Run {
                concurrency,
                publish_on_success,
                keep_workdirs,
                artifact_dir,
                ..
            } => {
                assert_eq!(concurrency.as_deref(), Some("-2"));
                assert_eq!(publish_on_success, Some(false));
                assert!(keep_workdirs);
                assert_eq!(artifact_dir, PathBuf::from(DEFAULT_ARTIFACT_DIR));
            }
            Commands::Validate { .. } => panic!("expected run"),
        }
    }

    #[test]
    fn test_validate_reports_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "stages = 1").unwrap();

        let err = cmd_validate(&path, false).unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }

    #[tokio::test]
    async fn test_bad_concurrency_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.toml");
        std::fs::write(
            &path,
            r#"
[stages.build]
program = "true"
[stages.install]
program = "true"
[stages.test]
program = "true"
[[matrix]]
id = "a"
runtime = "x"
arch = "x86_64"
"#,
        )
        .unwrap();

        let err = cmd_run(
            &path,
            Some("0"),
            None,
            dir.path().join("artifacts"),
            dir.path().join("work"),
            false,
            None,
        )
        .await
        .unwrap_err();
        assert!(err.downcast_ref::<ConfigurationError>().is_some());
    }
}
