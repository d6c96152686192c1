//! Matrix reports: a terminal summary and a versioned JSON document.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::Path;

use crate::coordinator::{MatrixOutcome, PublishStatus};
use crate::pipeline::{FailureKind, PipelineRun, PipelineState};
use crate::runner::StageResult;
use crate::stage::StageKind;

/// Version of the JSON report layout.
pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// Output lines quoted under a failed entry in the summary.
const SUMMARY_TAIL_LINES: usize = 10;

/// One matrix entry in the persisted report.
#[derive(Debug, Serialize)]
pub struct ReportEntry<'a> {
    pub id: &'a str,
    pub runtime: &'a str,
    pub arch: &'a str,
    pub state: PipelineState,
    pub failed_stage: Option<StageKind>,
    pub failure_kind: Option<FailureKind>,
    pub message: Option<&'a str>,
    pub stages: &'a [StageResult],
}

impl<'a> From<&'a PipelineRun> for ReportEntry<'a> {
    fn from(run: &'a PipelineRun) -> Self {
        Self {
            id: &run.descriptor.id,
            runtime: &run.descriptor.runtime,
            arch: &run.descriptor.arch,
            state: run.state,
            failed_stage: run.failure.as_ref().and_then(|f| f.stage),
            failure_kind: run.failure.as_ref().map(|f| f.kind),
            message: run.failure.as_ref().map(|f| f.message.as_str()),
            stages: &run.stages,
        }
    }
}

/// Matrix report written for CI consumers.
#[derive(Debug, Serialize)]
pub struct ReportDocument<'a> {
    pub schema_version: &'static str,
    pub generated_at: DateTime<Utc>,
    pub success: bool,
    pub entries: Vec<ReportEntry<'a>>,
    pub publish: &'a PublishStatus,
}

impl<'a> ReportDocument<'a> {
    pub fn new(outcome: &'a MatrixOutcome) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION,
            generated_at: Utc::now(),
            success: outcome.succeeded(),
            entries: outcome.report.runs.iter().map(ReportEntry::from).collect(),
            publish: &outcome.publish,
        }
    }
}

/// Write the outcome as pretty JSON.
pub fn write_report_json(path: &Path, outcome: &MatrixOutcome) -> Result<()> {
    let content =
        serde_json::to_string_pretty(&ReportDocument::new(outcome)).context("serialize matrix report")?;
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("create {:?}", parent))?;
    }
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render a plain-text summary for the terminal.
pub fn render_summary(outcome: &MatrixOutcome) -> String {
    let report = &outcome.report;
    let mut out = String::new();
    out.push_str(&format!(
        "Matrix: {} entries, {} succeeded, {} not succeeded\n\n",
        report.runs.len(),
        report.succeeded_count(),
        report.runs.len() - report.succeeded_count()
    ));

    for run in &report.runs {
        let d = &run.descriptor;
        let duration: u64 = run.stages.iter().map(|s| s.duration_ms).sum();
        match run.state {
            PipelineState::Succeeded => out.push_str(&format!(
                "  ✓ {} ({} / {}) {} stages, {}ms\n",
                d.id,
                d.runtime,
                d.arch,
                run.stages.len(),
                duration
            )),
            state => {
                let marker = if state == PipelineState::Aborted { "-" } else { "✗" };
                let at = run
                    .failure
                    .as_ref()
                    .and_then(|f| f.stage)
                    .map_or_else(String::new, |s| format!(" at {}", s));
                out.push_str(&format!("  {} {} ({} / {}) {}{}\n", marker, d.id, d.runtime, d.arch, state, at));
                if let Some(failure) = &run.failure {
                    out.push_str(&format!("      {}\n", failure.message));
                }
                if let Some(stage) = run.first_failing_stage() {
                    for line in stage.output.tail(SUMMARY_TAIL_LINES).lines() {
                        out.push_str(&format!("      | {}\n", line));
                    }
                }
            }
        }
    }

    out.push('\n');
    let publish = match &outcome.publish {
        PublishStatus::NotConfigured => "not configured".to_string(),
        PublishStatus::Disabled => "disabled".to_string(),
        PublishStatus::Skipped => "skipped (not every entry succeeded)".to_string(),
        PublishStatus::Published { artifacts } => format!("published {} artifacts", artifacts.len()),
        PublishStatus::Failed { reason } => format!("FAILED: {}", reason),
    };
    out.push_str(&format!("Publish: {}\n", publish));
    let result = match (&outcome.publish, report.success) {
        (_, false) => "FAILED",
        (PublishStatus::Failed { .. }, true) => "matrix PASSED, publish FAILED",
        _ => "PASSED",
    };
    out.push_str(&format!("Result: {}\n", result));
    out
}
