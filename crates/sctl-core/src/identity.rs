//! # Object Identity, Revisions, and the Path Codec
//!
//! [`ObjectRef`] names one declared source resource. [`Revision`] is the
//! opaque upstream state identifier (commit hash, chart version, index
//! digest). [`ArtifactKey`] pairs them and owns the single deterministic
//! mapping to a storage-relative path:
//!
//! ```text
//! <kind-dir>/<namespace>/<name>/<revision-stem>.<ext>
//! ```
//!
//! Namespace and name are validated as DNS-1123 subdomains, so they never
//! contain `/` or `..`. Revisions are arbitrary strings; a revision that is
//! not safe to use as a file name is replaced by `sha256~<hex>` of its
//! bytes, which keeps the mapping deterministic and injective in practice.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::digest::sha256_digest;
use crate::error::ValidationError;
use crate::kind::ResourceKind;

/// Maximum length of a namespace or name segment.
pub const MAX_NAME_LEN: usize = 253;

/// Maximum length of a revision string.
pub const MAX_REVISION_LEN: usize = 1024;

/// Longest revision used literally as a file stem.
const MAX_LITERAL_STEM: usize = 128;

/// Prefix of hashed revision stems.
const HASHED_STEM_PREFIX: &str = "sha256~";

fn validate_segment(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let reject = |reason: &str| ValidationError::InvalidName {
        field,
        value: value.to_string(),
        reason: reason.to_string(),
    };
    if value.is_empty() {
        return Err(reject("must not be empty"));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(reject("longer than 253 characters"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
    {
        return Err(reject("only lowercase alphanumerics, '-' and '.' are allowed"));
    }
    let starts_ok = value.starts_with(|c: char| c.is_ascii_alphanumeric());
    let ends_ok = value.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !starts_ok || !ends_ok {
        return Err(reject("must start and end with an alphanumeric character"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ObjectRef
// ---------------------------------------------------------------------------

/// Identity of one declared source resource: kind, namespace, and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawObjectRef")]
pub struct ObjectRef {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

#[derive(Deserialize)]
struct RawObjectRef {
    kind: ResourceKind,
    namespace: String,
    name: String,
}

impl TryFrom<RawObjectRef> for ObjectRef {
    type Error = ValidationError;

    fn try_from(raw: RawObjectRef) -> Result<Self, Self::Error> {
        ObjectRef::new(raw.kind, raw.namespace, raw.name)
    }
}

impl ObjectRef {
    /// Build a validated object reference.
    pub fn new(
        kind: ResourceKind,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, ValidationError> {
        let namespace = namespace.into();
        let name = name.into();
        validate_segment("namespace", &namespace)?;
        validate_segment("name", &name)?;
        Ok(Self {
            kind,
            namespace,
            name,
        })
    }

    /// The resource kind.
    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    /// The namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The object name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner directory relative to the storage root.
    pub fn relative_dir(&self) -> String {
        format!("{}/{}/{}", self.kind.dir_name(), self.namespace, self.name)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Revision
// ---------------------------------------------------------------------------

/// Opaque identifier of upstream content state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision(String);

impl Revision {
    /// Build a revision. Rejects empty, oversized, or control-character input.
    pub fn new(value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_REVISION_LEN || value.chars().any(char::is_control)
        {
            return Err(ValidationError::InvalidRevision(value));
        }
        Ok(Self(value))
    }

    /// The revision string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File stem used for artifacts of this revision.
    ///
    /// Revisions made only of `[A-Za-z0-9._-]`, not starting with `.`, and
    /// at most 128 bytes long are used literally. Anything else maps to
    /// `sha256~<hex>` of the revision bytes. No literal stem contains `~`,
    /// so the two forms never collide.
    pub fn file_stem(&self) -> String {
        let literal = self.0.len() <= MAX_LITERAL_STEM
            && !self.0.starts_with('.')
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
        if literal {
            self.0.clone()
        } else {
            format!(
                "{HASHED_STEM_PREFIX}{}",
                sha256_digest(self.0.as_bytes()).to_hex()
            )
        }
    }
}

impl TryFrom<String> for Revision {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ArtifactKey
// ---------------------------------------------------------------------------

/// Identifies one cached artifact: an owner plus a revision.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    /// The owning resource.
    pub owner: ObjectRef,
    /// The upstream revision the artifact represents.
    pub revision: Revision,
}

impl ArtifactKey {
    /// Pair an owner with a revision.
    pub fn new(owner: ObjectRef, revision: Revision) -> Self {
        Self { owner, revision }
    }

    /// Artifact file name inside the owner directory.
    pub fn file_name(&self) -> String {
        format!(
            "{}.{}",
            self.revision.file_stem(),
            self.owner.kind().artifact_extension()
        )
    }

    /// Storage-relative path, using `/` separators on every platform.
    pub fn relative_path(&self) -> String {
        format!("{}/{}", self.owner.relative_dir(), self.file_name())
    }
}

impl fmt::Display for ArtifactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.owner, self.revision)
    }
}
