//! # Source Manifest
//!
//! Local mode reads source declarations from a YAML file instead of a
//! cluster API. The file is a list of resources:
//!
//! ```yaml
//! - apiVersion: source.fluxcd.io/v1alpha1
//!   kind: HelmRepository
//!   metadata:
//!     name: stable
//!     namespace: flux-system
//!   spec:
//!     url: https://charts.example.com
//!     intervalSecs: 600
//! ```
//!
//! Kinds are resolved through the [`KindRegistry`]; a kind the registry
//! does not hold is rejected.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use sctl_core::kind::{API_GROUP, API_VERSION};
use sctl_core::{KindRegistry, ObjectRef, SourceObject, SourceSpec, ValidationError};
use sctl_reconcile::InMemorySourceStore;

/// Errors loading a manifest.
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// The file could not be read.
    #[error("cannot read manifest {path}: {source}")]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML of the expected shape.
    #[error("cannot parse manifest {path}: {source}")]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_yaml::Error,
    },

    /// An entry declares an unexpected API version.
    #[error("entry {index}: unsupported apiVersion {found:?}, expected {expected:?}")]
    ApiVersion {
        /// Position in the list.
        index: usize,
        /// Declared value.
        found: String,
        /// Supported value.
        expected: String,
    },

    /// An entry has an unknown kind or an invalid identity.
    #[error("entry {index}: {source}")]
    Invalid {
        /// Position in the list.
        index: usize,
        /// The validation failure.
        #[source]
        source: ValidationError,
    },

    /// The same object is declared twice.
    #[error("entry {index}: {id} is declared more than once")]
    Duplicate {
        /// Position of the second declaration.
        index: usize,
        /// The repeated identity.
        id: ObjectRef,
    },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestEntry {
    api_version: Option<String>,
    kind: String,
    metadata: Metadata,
    spec: SourceSpec,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    name: String,
    #[serde(default = "default_namespace")]
    namespace: String,
}

fn default_namespace() -> String {
    "default".to_string()
}

fn expected_api_version() -> String {
    format!("{API_GROUP}/{API_VERSION}")
}

/// Parse manifest text into source objects.
pub fn parse(text: &str, registry: &KindRegistry, path: &Path) -> Result<Vec<SourceObject>, ManifestError> {
    let entries: Vec<ManifestEntry> = if text.trim().is_empty() {
        Vec::new()
    } else {
        serde_yaml::from_str(text).map_err(|source| ManifestError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };

    let expected = expected_api_version();
    let mut seen = BTreeSet::new();
    let mut objects = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        if let Some(found) = entry.api_version.filter(|v| *v != expected) {
            return Err(ManifestError::ApiVersion {
                index,
                found,
                expected,
            });
        }
        let invalid = |source| ManifestError::Invalid { index, source };
        let kind = registry.lookup(&entry.kind).map_err(invalid)?;
        let id = ObjectRef::new(kind, entry.metadata.namespace, entry.metadata.name).map_err(invalid)?;
        if !seen.insert(id.clone()) {
            return Err(ManifestError::Duplicate { index, id });
        }
        objects.push(SourceObject::new(id, entry.spec));
    }
    Ok(objects)
}

/// Read and parse the manifest at `path`.
pub fn load(path: &Path, registry: &KindRegistry) -> Result<Vec<SourceObject>, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&text, registry, path)
}

/// Apply every object to `store`. Returns how many were applied.
pub fn apply(store: &InMemorySourceStore, objects: Vec<SourceObject>) -> usize {
    let count = objects.len();
    for object in objects {
        tracing::debug!(object = %object.id, url = %object.spec.url, "declared source");
        store.apply(object);
    }
    count
}
