//! # Artifact Metadata
//!
//! What the storage engine returns after a successful write. The external
//! URL is not part of the record; it is derived from `relative_path` by the
//! URL resolver whenever it is needed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::ContentDigest;
use crate::identity::Revision;

/// One cached, checksummed artifact file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Path relative to the storage root, `/`-separated.
    pub relative_path: String,
    /// SHA-256 of the stored bytes, computed during the write.
    pub checksum: ContentDigest,
    /// Stored size in bytes.
    pub size_bytes: u64,
    /// When the artifact file was committed.
    pub created_at: DateTime<Utc>,
    /// The revision the artifact represents.
    pub revision: Revision,
}

impl Artifact {
    /// Whether this artifact holds `revision` with the given checksum.
    pub fn matches(&self, revision: &Revision, checksum: &ContentDigest) -> bool {
        &self.revision == revision && &self.checksum == checksum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_digest;

    #[test]
    fn serializes_camel_case() {
        let artifact = Artifact {
            relative_path: "helmchart/default/nginx/1.0.0.tgz".into(),
            checksum: sha256_digest(b"chart"),
            size_bytes: 5,
            created_at: Utc::now(),
            revision: Revision::new("1.0.0").unwrap(),
        };
        let json = serde_json::to_value(&artifact).unwrap();
        assert_eq!(json["relativePath"], "helmchart/default/nginx/1.0.0.tgz");
        assert_eq!(json["sizeBytes"], 5);
        assert!(json.get("url").is_none());
        assert!(artifact.matches(&Revision::new("1.0.0").unwrap(), &sha256_digest(b"chart")));
    }
}
