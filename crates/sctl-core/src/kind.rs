//! # Resource Kinds and the Kind Registry
//!
//! The controller reconciles exactly three resource kinds. Which kinds a
//! process handles is decided once at startup by building a
//! [`KindRegistry`] and passing it to whatever needs to resolve kind names
//! (manifest loading, coordinator wiring).

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// API group of every source resource.
pub const API_GROUP: &str = "source.fluxcd.io";

/// API version of every source resource.
pub const API_VERSION: &str = "v1alpha1";

/// A reconcilable resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    /// A version-controlled repository tracked by branch, tag, or commit.
    GitRepository,
    /// A package repository whose index is cached as an artifact.
    HelmRepository,
    /// A packaged chart pulled from a `HelmRepository`.
    HelmChart,
}

impl ResourceKind {
    /// All kinds, in registration order.
    pub fn all() -> &'static [ResourceKind] {
        &[Self::GitRepository, Self::HelmRepository, Self::HelmChart]
    }

    /// The kind name as it appears in manifests and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GitRepository => "GitRepository",
            Self::HelmRepository => "HelmRepository",
            Self::HelmChart => "HelmChart",
        }
    }

    /// Directory name for this kind under the storage root.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::GitRepository => "gitrepository",
            Self::HelmRepository => "helmrepository",
            Self::HelmChart => "helmchart",
        }
    }

    /// Parse a storage directory name back into a kind.
    pub fn from_dir_name(dir: &str) -> Option<Self> {
        Self::all().iter().copied().find(|k| k.dir_name() == dir)
    }

    /// File extension used for artifacts of this kind.
    pub fn artifact_extension(&self) -> &'static str {
        match self {
            Self::GitRepository => "tar.gz",
            Self::HelmRepository => "yaml",
            Self::HelmChart => "tgz",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownKind(s.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Explicit set of kinds this process reconciles, keyed by kind name.
///
/// Built once during bootstrap and shared by reference. Lookups of names
/// that were never registered fail with [`ValidationError::UnknownKind`]
/// even if the name is a valid [`ResourceKind`].
#[derive(Debug, Clone, Default)]
pub struct KindRegistry {
    kinds: BTreeMap<&'static str, ResourceKind>,
}

impl KindRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry holding all three source kinds.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        for kind in ResourceKind::all() {
            registry.kinds.insert(kind.as_str(), *kind);
        }
        registry
    }

    /// Register a kind. Registering the same kind twice is an error.
    pub fn register(&mut self, kind: ResourceKind) -> Result<(), ValidationError> {
        if self.kinds.contains_key(kind.as_str()) {
            return Err(ValidationError::DuplicateKind(kind.as_str().to_string()));
        }
        self.kinds.insert(kind.as_str(), kind);
        Ok(())
    }

    /// Resolve a kind name.
    pub fn lookup(&self, name: &str) -> Result<ResourceKind, ValidationError> {
        self.kinds
            .get(name)
            .copied()
            .ok_or_else(|| ValidationError::UnknownKind(name.to_string()))
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: ResourceKind) -> bool {
        self.kinds.contains_key(kind.as_str())
    }

    /// Registered kinds, ordered by name.
    pub fn kinds(&self) -> impl Iterator<Item = ResourceKind> + '_ {
        self.kinds.values().copied()
    }

    /// Number of registered kinds.
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether no kinds are registered.
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}
