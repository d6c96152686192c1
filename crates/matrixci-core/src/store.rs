//! Artifact store: built packages keyed by descriptor.
//!
//! Two tiers. Build output is first *staged* so the install stage can take
//! it from the store rather than from the build tree. Only when the run
//! succeeds is it *committed*; `get` and `list` see committed artifacts only.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::descriptor::EnvironmentDescriptor;
use crate::digest::Digest;
use crate::error::StoreError;

/// A built package produced for one descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    pub descriptor_id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub digest: Digest,
    pub size: u64,
}

impl Artifact {
    /// Describe an existing file, computing its digest.
    pub fn from_file(descriptor_id: impl Into<String>, path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("artifact path has no file name: {:?}", path),
                )
            })?;
        let size = fs::metadata(&path)?.len();
        let digest = Digest::of_file(&path)?;
        Ok(Self {
            descriptor_id: descriptor_id.into(),
            file_name,
            path,
            digest,
            size,
        })
    }

    /// Path of the checksum sidecar next to the artifact.
    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_file_name(format!("{}.sha256", self.file_name))
    }
}

/// Store interface. Safe for concurrent use from many pipeline runs.
pub trait ArtifactStore: Send + Sync {
    /// Commit `artifact` for `descriptor`, replacing any prior one.
    fn put(&self, descriptor: &EnvironmentDescriptor, artifact: Artifact) -> Result<Artifact, StoreError>;

    /// Committed artifact for a descriptor.
    fn get(&self, descriptor_id: &str) -> Option<Artifact>;

    /// All committed artifacts, ordered by descriptor id.
    fn list(&self) -> Vec<Artifact>;

    /// Copy freshly built output into staging and return the staged copy.
    fn stage(&self, descriptor: &EnvironmentDescriptor, artifact: &Artifact) -> Result<Artifact, StoreError>;

    /// Staged (not yet committed) artifact for a descriptor.
    fn staged(&self, descriptor_id: &str) -> Option<Artifact>;

    /// Promote the staged artifact to committed.
    fn commit(&self, descriptor: &EnvironmentDescriptor) -> Result<Artifact, StoreError> {
        let staged = self
            .staged(&descriptor.id)
            .ok_or_else(|| StoreError::NotStaged(descriptor.id.clone()))?;
        let committed = self.put(descriptor, staged)?;
        self.discard(&descriptor.id)?;
        Ok(committed)
    }

    /// Drop any staged artifact for a descriptor.
    fn discard(&self, descriptor_id: &str) -> Result<(), StoreError>;

    /// Remove the committed artifact for a descriptor, including one an
    /// earlier invocation left in the store.
    fn retract(&self, descriptor_id: &str) -> Result<(), StoreError>;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Filesystem-backed store.
///
/// Layout:
///
/// ```text
/// <root>/<descriptor id>/<file>          committed artifact
/// <root>/<descriptor id>/<file>.sha256   checksum sidecar
/// <root>/.staging/<descriptor id>/<file> staged artifact
/// ```
pub struct FsArtifactStore {
    root: PathBuf,
    committed: Mutex<BTreeMap<String, Artifact>>,
    staged: Mutex<BTreeMap<String, Artifact>>,
}

impl FsArtifactStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(".staging"))?;
        Ok(Self {
            root,
            committed: Mutex::new(BTreeMap::new()),
            staged: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn staging_dir(&self, descriptor_id: &str) -> PathBuf {
        self.root.join(".staging").join(descriptor_id)
    }

    fn committed_dir(&self, descriptor_id: &str) -> PathBuf {
        self.root.join(descriptor_id)
    }

    /// Copy `src` into `dir` atomically and verify the digest of the copy.
    fn copy_verified(
        dir: &Path,
        descriptor_id: &str,
        src: &Artifact,
    ) -> Result<Artifact, StoreError> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;

        let dest = dir.join(&src.file_name);
        let mut tmp = NamedTempFile::new_in(dir)?;
        let mut input = fs::File::open(&src.path)?;
        std::io::copy(&mut input, &mut tmp)?;
        tmp.flush()?;
        tmp.persist(&dest).map_err(|e| e.error)?;

        let copied = Artifact::from_file(descriptor_id, &dest)?;
        if copied.digest != src.digest {
            return Err(StoreError::DigestMismatch {
                descriptor: descriptor_id.to_string(),
                expected: src.digest.to_hex(),
                actual: copied.digest.to_hex(),
            });
        }
        Ok(copied)
    }
}

impl ArtifactStore for FsArtifactStore {
    fn put(&self, descriptor: &EnvironmentDescriptor, artifact: Artifact) -> Result<Artifact, StoreError> {
        let dir = self.committed_dir(&descriptor.id);
        let committed = Self::copy_verified(&dir, &descriptor.id, &artifact)?;
        fs::write(
            committed.sidecar_path(),
            committed.digest.sidecar_line(&committed.file_name),
        )?;
        debug!(descriptor = %descriptor.id, digest = %committed.digest, "artifact committed");
        lock(&self.committed).insert(descriptor.id.clone(), committed.clone());
        Ok(committed)
    }

    fn get(&self, descriptor_id: &str) -> Option<Artifact> {
        lock(&self.committed).get(descriptor_id).cloned()
    }

    fn list(&self) -> Vec<Artifact> {
        lock(&self.committed).values().cloned().collect()
    }

    fn stage(&self, descriptor: &EnvironmentDescriptor, artifact: &Artifact) -> Result<Artifact, StoreError> {
        let dir = self.staging_dir(&descriptor.id);
        let staged = Self::copy_verified(&dir, &descriptor.id, artifact)?;
        debug!(descriptor = %descriptor.id, path = ?staged.path, "artifact staged");
        lock(&self.staged).insert(descriptor.id.clone(), staged.clone());
        Ok(staged)
    }

    fn staged(&self, descriptor_id: &str) -> Option<Artifact> {
        lock(&self.staged).get(descriptor_id).cloned()
    }

    fn discard(&self, descriptor_id: &str) -> Result<(), StoreError> {
        lock(&self.staged).remove(descriptor_id);
        let dir = self.staging_dir(descriptor_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn retract(&self, descriptor_id: &str) -> Result<(), StoreError> {
        lock(&self.committed).remove(descriptor_id);
        let dir = self.committed_dir(descriptor_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
            debug!(descriptor = %descriptor_id, "committed artifact retracted");
        }
        Ok(())
    }
}
