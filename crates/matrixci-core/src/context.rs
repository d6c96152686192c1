//! Execution contexts and scoped acquisition.
//!
//! An [`ExecutionContext`] is an isolated filesystem scope bound to one
//! descriptor. It owns its root directory and builds its own environment map;
//! nothing is inherited from the host process. [`ContextManager`] pairs every
//! acquire with exactly one release.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborators::Provisioner;
use crate::descriptor::EnvironmentDescriptor;
use crate::error::{ProvisionError, RunnerError};
use crate::stage::{CapturedOutput, StageKind, WorkDir};

/// A provisioned, isolated environment for one matrix entry.
///
/// Layout under `root`:
///
/// ```text
/// source/   private copy of the source tree (build only)
/// dist/     build output
/// prefix/   install prefix; prefix/bin leads the search path
/// work/     cwd for tests, outside source/
/// home/     HOME
/// tmp/      TMPDIR
/// ```
#[derive(Debug)]
pub struct ExecutionContext {
    id: Uuid,
    descriptor: EnvironmentDescriptor,
    root: PathBuf,
    toolchain_dirs: Vec<PathBuf>,
    released: AtomicBool,
}

impl ExecutionContext {
    /// Create the directory layout under `root`.
    pub fn create(
        descriptor: EnvironmentDescriptor,
        root: impl Into<PathBuf>,
        toolchain_dirs: Vec<PathBuf>,
    ) -> std::io::Result<Self> {
        let ctx = Self {
            id: Uuid::new_v4(),
            descriptor,
            root: root.into(),
            toolchain_dirs,
            released: AtomicBool::new(false),
        };
        for dir in [
            ctx.source_dir(),
            ctx.dist_dir(),
            ctx.prefix_bin_dir(),
            ctx.work_dir(),
            ctx.home_dir(),
            ctx.tmp_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(ctx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn descriptor(&self) -> &EnvironmentDescriptor {
        &self.descriptor
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join("source")
    }

    pub fn dist_dir(&self) -> PathBuf {
        self.root.join("dist")
    }

    pub fn prefix_dir(&self) -> PathBuf {
        self.root.join("prefix")
    }

    pub fn prefix_bin_dir(&self) -> PathBuf {
        self.prefix_dir().join("bin")
    }

    pub fn work_dir(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn home_dir(&self) -> PathBuf {
        self.root.join("home")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    /// Directories searched for bare program names: the install prefix first,
    /// then toolchain directories. The source tree is never on it.
    pub fn search_path(&self) -> Vec<PathBuf> {
        let mut path = vec![self.prefix_bin_dir()];
        path.extend(self.toolchain_dirs.iter().cloned());
        path
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }

    /// Fail if the context has already been torn down.
    pub fn ensure_live(&self) -> Result<(), RunnerError> {
        if self.is_released() {
            return Err(RunnerError::ContextReleased {
                context: self.descriptor.id.clone(),
            });
        }
        Ok(())
    }

    /// Resolve a working directory against this context.
    ///
    /// Absolute paths and `..` are refused; a working directory never leaves
    /// the context root.
    pub fn resolve_workdir(&self, workdir: &WorkDir) -> Result<PathBuf, RunnerError> {
        Ok(match workdir {
            WorkDir::Source => self.source_dir(),
            WorkDir::Dist => self.dist_dir(),
            WorkDir::Prefix => self.prefix_dir(),
            WorkDir::Work => self.work_dir(),
            WorkDir::Relative(rel) if workdir.is_contained() => self.root.join(rel),
            WorkDir::Relative(rel) => return Err(self.escape(rel)),
        })
    }

    /// Fail unless `path`, with symlinks resolved, lies under the context root.
    pub fn ensure_within_root(&self, path: &Path) -> Result<(), RunnerError> {
        if canonical_prefix(path).starts_with(canonical_prefix(&self.root)) {
            Ok(())
        } else {
            Err(self.escape(path))
        }
    }

    fn escape(&self, path: &Path) -> RunnerError {
        RunnerError::WorkDirEscapesContext {
            context: self.descriptor.id.clone(),
            workdir: path.to_path_buf(),
        }
    }

    /// Whether `path` lies inside the context's source tree. The path need
    /// not exist yet.
    pub fn is_in_source_tree(&self, path: &Path) -> bool {
        let source = self.source_dir();
        path.starts_with(&source) || canonical_prefix(path).starts_with(canonical_prefix(&source))
    }

    /// Fully specified environment for a stage.
    ///
    /// Only build sees source locations; only install and test see the prefix.
    pub fn env_for(&self, stage: StageKind) -> BTreeMap<String, String> {
        let mut env = self.descriptor.variables.clone();

        let path = std::env::join_paths(self.search_path())
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        env.insert("PATH".to_string(), path);
        env.insert("HOME".to_string(), display(&self.home_dir()));
        env.insert("TMPDIR".to_string(), display(&self.tmp_dir()));
        env.insert("MATRIXCI_ID".to_string(), self.descriptor.id.clone());
        env.insert("MATRIXCI_RUNTIME".to_string(), self.descriptor.runtime.clone());
        env.insert("MATRIXCI_ARCH".to_string(), self.descriptor.arch.clone());
        env.insert("MATRIXCI_STAGE".to_string(), stage.name().to_string());

        match stage {
            StageKind::Build => {
                env.insert("SOURCE_DIR".to_string(), display(&self.source_dir()));
                env.insert("DIST_DIR".to_string(), display(&self.dist_dir()));
            }
            StageKind::Install | StageKind::Test => {
                env.insert("INSTALL_PREFIX".to_string(), display(&self.prefix_dir()));
            }
            StageKind::Provision | StageKind::Publish => {}
        }
        env
    }

    /// Look a program up on the context's search path.
    ///
    /// Names containing a separator are taken as paths relative to `cwd`.
    /// For the test stage, a program inside the source tree is rejected.
    pub fn resolve_program(
        &self,
        program: &str,
        stage: StageKind,
        cwd: &Path,
    ) -> Result<PathBuf, RunnerError> {
        let resolved = if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            let candidate = cwd.join(program);
            if !candidate.is_file() {
                return Err(RunnerError::CommandNotFound {
                    program: program.to_string(),
                });
            }
            candidate
        } else {
            self.search_path()
                .into_iter()
                .map(|dir| dir.join(program))
                .find(|candidate| candidate.is_file())
                .ok_or_else(|| RunnerError::CommandNotFound {
                    program: program.to_string(),
                })?
        };

        if stage == StageKind::Test && self.is_in_source_tree(&resolved) {
            return Err(RunnerError::IsolationViolation {
                stage: stage.to_string(),
                reason: format!("{} resolves into the source tree", program),
            });
        }
        Ok(resolved)
    }
}

/// Canonicalize the deepest existing ancestor of `path` and re-append the
/// components below it.
fn canonical_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            return missing.iter().rev().fold(canonical, |acc, name| acc.join(name));
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}

fn display(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// A freshly acquired context plus what the provisioner printed.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub context: Arc<ExecutionContext>,
    pub output: CapturedOutput,
}

/// Pairs provisioning with guaranteed teardown.
pub struct ContextManager {
    provisioner: Arc<dyn Provisioner>,
    active: Mutex<HashMap<String, Arc<ExecutionContext>>>,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl ContextManager {
    pub fn new(provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            provisioner,
            active: Mutex::new(HashMap::new()),
            acquired: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        }
    }

    /// Acquire the context for `descriptor`.
    ///
    /// Idempotent: a descriptor that already has a live context gets the same
    /// one back without provisioning again.
    pub async fn acquire(
        &self,
        descriptor: &EnvironmentDescriptor,
    ) -> Result<Acquired, ProvisionError> {
        if let Some(existing) = self.active.lock().await.get(&descriptor.id) {
            debug!(descriptor = %descriptor.id, "reusing live execution context");
            return Ok(Acquired {
                context: Arc::clone(existing),
                output: CapturedOutput::default(),
            });
        }

        let completed = self.provisioner.provision(descriptor).await?;
        let context = Arc::new(completed.value);

        let mut active = self.active.lock().await;
        if let Some(existing) = active.get(&descriptor.id) {
            // Lost a race with a concurrent acquire for the same descriptor.
            let existing = Arc::clone(existing);
            drop(active);
            if let Err(e) = self.provisioner.teardown(&context).await {
                warn!(descriptor = %descriptor.id, error = %e, "teardown of duplicate context failed");
            }
            return Ok(Acquired {
                context: existing,
                output: completed.output,
            });
        }
        active.insert(descriptor.id.clone(), Arc::clone(&context));
        drop(active);

        self.acquired.fetch_add(1, Ordering::SeqCst);
        info!(descriptor = %descriptor.id, context = %context.id(), "execution context acquired");
        Ok(Acquired {
            context,
            output: completed.output,
        })
    }

    /// Tear down the context for `descriptor_id`.
    ///
    /// Returns `Ok(false)` when there was nothing to release.
    pub async fn release(&self, descriptor_id: &str) -> Result<bool, ProvisionError> {
        let Some(context) = self.active.lock().await.remove(descriptor_id) else {
            return Ok(false);
        };
        if !context.mark_released() {
            return Ok(false);
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        let result = self.provisioner.teardown(&context).await;
        match &result {
            Ok(()) => info!(descriptor = %descriptor_id, "execution context released"),
            Err(e) => warn!(descriptor = %descriptor_id, error = %e, "execution context teardown failed"),
        }
        result.map(|_| true)
    }

    /// Acquire a context, run `body`, and release on every exit path.
    ///
    /// Panics inside `body` are re-raised after teardown.
    pub async fn scoped<T, F, Fut>(
        &self,
        descriptor: &EnvironmentDescriptor,
        body: F,
    ) -> Result<(T, Result<(), ProvisionError>), ProvisionError>
    where
        F: FnOnce(Acquired) -> Fut,
        Fut: Future<Output = T>,
    {
        let acquired = self.acquire(descriptor).await?;
        let outcome = AssertUnwindSafe(body(acquired)).catch_unwind().await;
        let teardown = self.release(&descriptor.id).await.map(|_| ());
        match outcome {
            Ok(value) => Ok((value, teardown)),
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Contexts acquired so far.
    pub fn acquired_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    /// Contexts released so far.
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Contexts currently live.
    pub async fn live_count(&self) -> usize {
        self.active.lock().await.len()
    }
}
