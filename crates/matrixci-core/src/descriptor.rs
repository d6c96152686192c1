//! Environment descriptors: one immutable value per matrix entry.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::error::ConfigurationError;

/// Variables every execution context sets itself. A descriptor may not
/// override them.
pub const RESERVED_VARIABLES: [&str; 11] = [
    "PATH",
    "HOME",
    "TMPDIR",
    "MATRIXCI_ID",
    "MATRIXCI_RUNTIME",
    "MATRIXCI_ARCH",
    "MATRIXCI_STAGE",
    "SOURCE_DIR",
    "DIST_DIR",
    "INSTALL_PREFIX",
    "ARTIFACT",
];

/// One matrix entry: runtime identity, architecture and variables.
///
/// `id` is the aggregation key and must be unique across the matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EnvironmentDescriptor {
    pub id: String,
    pub runtime: String,
    pub arch: String,
    #[serde(default, rename = "env")]
    pub variables: BTreeMap<String, String>,
}

impl EnvironmentDescriptor {
    pub fn new(id: impl Into<String>, runtime: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runtime: runtime.into(),
            arch: arch.into(),
            variables: BTreeMap::new(),
        }
    }

    /// Add an environment variable.
    pub fn with_var(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    fn check(&self) -> Result<(), ConfigurationError> {
        let invalid = |reason: &str| ConfigurationError::InvalidDescriptor {
            id: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.id.trim().is_empty() {
            return Err(invalid("id must not be empty"));
        }
        // Ids name artifact subdirectories.
        if self.id.contains(['/', '\\']) || self.id == "." || self.id == ".." {
            return Err(invalid("id must not contain path separators"));
        }
        if self.id.starts_with('.') {
            return Err(invalid("id must not start with '.'"));
        }
        if self.runtime.trim().is_empty() {
            return Err(invalid("runtime must not be empty"));
        }
        if self.arch.trim().is_empty() {
            return Err(invalid("arch must not be empty"));
        }
        if self.variables.keys().any(|k| k.is_empty() || k.contains('=')) {
            return Err(invalid("variable names must be non-empty and contain no '='"));
        }
        if let Some(name) = self
            .variables
            .keys()
            .find(|k| RESERVED_VARIABLES.contains(&k.as_str()))
        {
            return Err(invalid(&format!("variable {} is set by the execution context", name)));
        }
        Ok(())
    }
}

impl fmt::Display for EnvironmentDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} on {})", self.id, self.runtime, self.arch)
    }
}

/// Validate a whole matrix before anything runs.
///
/// Rejects an empty matrix, malformed entries, and repeated ids.
pub fn validate_matrix(descriptors: &[EnvironmentDescriptor]) -> Result<(), ConfigurationError> {
    if descriptors.is_empty() {
        return Err(ConfigurationError::EmptyMatrix);
    }

    let mut seen = HashSet::new();
    for descriptor in descriptors {
        descriptor.check()?;
        if !seen.insert(descriptor.id.as_str()) {
            return Err(ConfigurationError::DuplicateId {
                id: descriptor.id.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_matrix() {
        let matrix = vec![
            EnvironmentDescriptor::new("py38", "3.8", "x86_64"),
            EnvironmentDescriptor::new("py312", "3.12", "aarch64").with_var("CC", "clang"),
        ];
        assert!(validate_matrix(&matrix).is_ok());
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let matrix = vec![
            EnvironmentDescriptor::new("A", "3.8", "x86_64"),
            EnvironmentDescriptor::new("A", "3.12", "x86_64"),
        ];
        match validate_matrix(&matrix) {
            Err(ConfigurationError::DuplicateId { id }) => assert_eq!(id, "A"),
            other => panic!("expected DuplicateId, got {other:?}"),
        }
    }

    #[test]
    fn test_empty_matrix_rejected() {
        assert!(matches!(
            validate_matrix(&[]),
            Err(ConfigurationError::EmptyMatrix)
        ));
    }

    #[test]
    fn test_path_like_id_rejected() {
        let matrix = vec![EnvironmentDescriptor::new("../evil", "3.8", "x86_64")];
        assert!(matches!(
            validate_matrix(&matrix),
            Err(ConfigurationError::InvalidDescriptor { .. })
        ));
    }

    #[test]
    fn test_empty_runtime_rejected() {
        let matrix = vec![EnvironmentDescriptor::new("a", " ", "x86_64")];
        assert!(validate_matrix(&matrix).is_err());
    }

    #[test]
    fn test_reserved_variables_rejected() {
        for name in ["PATH", "HOME", "TMPDIR", "ARTIFACT"] {
            let matrix = vec![EnvironmentDescriptor::new("a", "3.8", "x86_64").with_var(name, "/x")];
            match validate_matrix(&matrix) {
                Err(ConfigurationError::InvalidDescriptor { reason, .. }) => assert!(reason.contains(name)),
                other => panic!("{name} accepted: {other:?}"),
            }
        }
        let matrix = vec![EnvironmentDescriptor::new("a", "3.8", "x86_64").with_var("PATHS", "/x")];
        assert!(validate_matrix(&matrix).is_ok());
    }

    #[test]
    fn test_equality_is_by_value() {
        let a = EnvironmentDescriptor::new("a", "3.8", "x86_64").with_var("K", "V");
        let b = EnvironmentDescriptor::new("a", "3.8", "x86_64").with_var("K", "V");
        assert_eq!(a, b);
        assert_ne!(a, b.clone().with_var("K", "W"));
    }

    #[test]
    fn test_deserialize_env_table() {
        let d: EnvironmentDescriptor = serde_json::from_str(
            r#"{"id": "a", "runtime": "3.8", "arch": "x86_64", "env": {"FOO": "bar"}}"#,
        )
        .unwrap();
        assert_eq!(d.variables.get("FOO").map(String::as_str), Some("bar"));
    }
}
