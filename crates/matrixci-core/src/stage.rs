//! Pipeline stage definitions and command configuration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fmt;
use std::path::{Component, PathBuf};

/// Pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Acquire and prepare the execution context.
    Provision,

    /// Produce a distributable artifact from source.
    Build,

    /// Install the stored artifact into the context's prefix.
    Install,

    /// Run the verification suite against the installed artifact.
    Test,

    /// Publish artifacts. Driven by the coordinator, never per entry.
    Publish,
}

impl StageKind {
    /// Stages a single pipeline run walks through, in order.
    pub const PER_ENTRY: [StageKind; 4] = [
        StageKind::Provision,
        StageKind::Build,
        StageKind::Install,
        StageKind::Test,
    ];

    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            StageKind::Provision => "provision",
            StageKind::Build => "build",
            StageKind::Install => "install",
            StageKind::Test => "test",
            StageKind::Publish => "publish",
        }
    }

    /// 1-based position in the per-entry sequence. `Publish` has none.
    pub fn ordinal(&self) -> Option<usize> {
        Self::PER_ENTRY
            .iter()
            .position(|s| s == self)
            .map(|i| i + 1)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Working directory of a command, resolved against an execution context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WorkDir {
    /// The context's private copy of the source tree.
    Source,
    /// Directory build output is written to.
    Dist,
    /// Install prefix.
    Prefix,
    /// Scratch directory outside the source tree. Default.
    #[default]
    Work,
    /// Path relative to the context root.
    Relative(PathBuf),
}

impl WorkDir {
    /// Whether the directory stays under the context root. Relative paths
    /// may only use plain components: no root, prefix or `..`.
    pub fn is_contained(&self) -> bool {
        match self {
            WorkDir::Relative(rel) => rel
                .components()
                .all(|c| matches!(c, Component::Normal(_) | Component::CurDir)),
            _ => true,
        }
    }

    /// Whether the directory is the context's source copy or lies under it.
    pub fn targets_source(&self) -> bool {
        match self {
            WorkDir::Source => true,
            WorkDir::Relative(rel) => {
                rel.components().find(|c| *c != Component::CurDir)
                    == Some(Component::Normal(OsStr::new("source")))
            }
            _ => false,
        }
    }
}

/// Command to execute for a stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable name or path. Bare names are looked up on the context's
    /// search path only.
    pub program: String,

    /// Arguments, with `{placeholder}` substitution.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory inside the context.
    #[serde(default)]
    pub workdir: WorkDir,

    /// Timeout in seconds (0 = none).
    #[serde(default)]
    pub timeout_secs: u64,
}

impl CommandSpec {
    /// Create a command with no arguments running in the work directory.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            workdir: WorkDir::Work,
            timeout_secs: 0,
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory.
    pub fn in_dir(mut self, workdir: WorkDir) -> Self {
        self.workdir = workdir;
        self
    }

    /// Set a timeout.
    pub fn timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    /// Substitute `{name}` placeholders in the arguments.
    pub fn expand_args(&self, placeholders: &Placeholders) -> Vec<String> {
        self.args.iter().map(|a| placeholders.expand(a)).collect()
    }
}

/// Values substituted into command arguments.
#[derive(Debug, Clone, Default)]
pub struct Placeholders(BTreeMap<&'static str, String>);

impl Placeholders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.0.insert(name, value.into());
        self
    }

    /// Replace every known `{name}` in `input`. Unknown names are left as-is.
    pub fn expand(&self, input: &str) -> String {
        let mut out = input.to_string();
        for (name, value) in &self.0 {
            out = out.replace(&format!("{{{}}}", name), value);
        }
        out
    }
}

/// Output captured from a stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
}

impl CapturedOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    pub fn from_stderr(stderr: impl Into<String>) -> Self {
        Self::new(String::new(), stderr)
    }

    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }

    /// Last `n` lines of stdout followed by stderr, for reports.
    pub fn tail(&self, n: usize) -> String {
        let combined: Vec<&str> = self
            .stdout
            .lines()
            .chain(self.stderr.lines())
            .collect();
        let start = combined.len().saturating_sub(n);
        combined[start..].join("\n")
    }
}

/// A collaborator result together with the output it produced.
#[derive(Debug, Clone)]
pub struct Completed<T> {
    pub value: T,
    pub output: CapturedOutput,
}

impl<T> Completed<T> {
    pub fn new(value: T, output: CapturedOutput) -> Self {
        Self { value, output }
    }

    pub fn silent(value: T) -> Self {
        Self::new(value, CapturedOutput::default())
    }
}
