//! # Fetchers
//!
//! A [`Fetcher`] turns a declared source into a revision and, when the
//! revision differs from the last one stored, the artifact bytes for it.
//!
//! | Kind | Fetcher | Revision |
//! |------|---------|----------|
//! | `HelmRepository` | [`IndexFetcher`] | SHA-256 of `<url>/index.yaml` |
//! | `HelmChart` | [`ChartFetcher`] | declared chart version |
//! | `GitRepository` | [`ArchiveFetcher`] | `<reference>/<sha256 of archive>` |

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;

use sctl_core::{sha256_digest, ResourceKind, Revision, SourceObject};

use crate::error::FetchError;
use crate::getter::GetterRegistry;

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    /// Upstream still at the last stored revision.
    Unchanged(Revision),
    /// New content for `revision`.
    Fetched {
        /// Upstream revision.
        revision: Revision,
        /// Artifact bytes.
        content: Bytes,
    },
}

/// Per-kind upstream logic.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Resolve the upstream revision of `source` and fetch its content
    /// unless it equals `last`.
    ///
    /// With `last = None` an implementation must return
    /// [`FetchResult::Fetched`].
    async fn fetch(
        &self,
        source: &SourceObject,
        last: Option<&Revision>,
    ) -> Result<FetchResult, FetchError>;
}

fn join_url(base: &str, file: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), file)
}

// ---------------------------------------------------------------------------
// HelmRepository
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IndexFile {
    api_version: String,
    #[serde(default)]
    entries: BTreeMap<String, serde_yaml::Value>,
}

/// Downloads a package repository index; the revision is its digest.
pub struct IndexFetcher {
    getters: Arc<GetterRegistry>,
}

impl IndexFetcher {
    /// Create a fetcher using `getters`.
    pub fn new(getters: Arc<GetterRegistry>) -> Self {
        Self { getters }
    }
}

#[async_trait]
impl Fetcher for IndexFetcher {
    async fn fetch(
        &self,
        source: &SourceObject,
        last: Option<&Revision>,
    ) -> Result<FetchResult, FetchError> {
        let url = join_url(&source.spec.url, "index.yaml");
        let content = self.getters.fetch(&url).await?;

        let index: IndexFile =
            serde_yaml::from_slice(&content).map_err(|e| FetchError::InvalidContent {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if index.api_version.is_empty() {
            return Err(FetchError::InvalidContent {
                url,
                reason: "apiVersion is empty".into(),
            });
        }
        tracing::debug!(url = %url, charts = index.entries.len(), "fetched repository index");

        let revision = Revision::new(sha256_digest(&content).to_hex())?;
        if last == Some(&revision) {
            return Ok(FetchResult::Unchanged(revision));
        }
        Ok(FetchResult::Fetched { revision, content })
    }
}

// ---------------------------------------------------------------------------
// HelmChart
// ---------------------------------------------------------------------------

/// Downloads `<url>/<chart>-<version>.tgz`; the revision is the version.
///
/// The version is known from the spec, so an unchanged chart costs no
/// network round trip.
pub struct ChartFetcher {
    getters: Arc<GetterRegistry>,
}

impl ChartFetcher {
    /// Create a fetcher using `getters`.
    pub fn new(getters: Arc<GetterRegistry>) -> Self {
        Self { getters }
    }
}

#[async_trait]
impl Fetcher for ChartFetcher {
    async fn fetch(
        &self,
        source: &SourceObject,
        last: Option<&Revision>,
    ) -> Result<FetchResult, FetchError> {
        let chart = source
            .spec
            .chart
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| FetchError::IncompleteSpec("chart is required".into()))?;
        let version = source
            .spec
            .reference
            .as_deref()
            .filter(|v| !v.is_empty())
            .ok_or_else(|| FetchError::IncompleteSpec("chart version (reference) is required".into()))?;

        let revision = Revision::new(version)?;
        if last == Some(&revision) {
            return Ok(FetchResult::Unchanged(revision));
        }
        let url = join_url(&source.spec.url, &format!("{chart}-{version}.tgz"));
        let content = self.getters.fetch(&url).await?;
        Ok(FetchResult::Fetched { revision, content })
    }
}

// ---------------------------------------------------------------------------
// GitRepository
// ---------------------------------------------------------------------------

/// Downloads a repository snapshot archive served over HTTP.
///
/// Cloning is left to an external fetcher; this covers forges that publish
/// archives of a branch or tag. The revision is `<reference>/<digest>`,
/// with `latest` when no reference is declared.
pub struct ArchiveFetcher {
    getters: Arc<GetterRegistry>,
}

impl ArchiveFetcher {
    /// Create a fetcher using `getters`.
    pub fn new(getters: Arc<GetterRegistry>) -> Self {
        Self { getters }
    }
}

#[async_trait]
impl Fetcher for ArchiveFetcher {
    async fn fetch(
        &self,
        source: &SourceObject,
        last: Option<&Revision>,
    ) -> Result<FetchResult, FetchError> {
        let content = self.getters.fetch(&source.spec.url).await?;
        if content.is_empty() {
            return Err(FetchError::InvalidContent {
                url: source.spec.url.clone(),
                reason: "empty archive".into(),
            });
        }
        let reference = source.spec.reference.as_deref().unwrap_or("latest");
        let revision = Revision::new(format!("{reference}/{}", sha256_digest(&content)))?;
        if last == Some(&revision) {
            return Ok(FetchResult::Unchanged(revision));
        }
        Ok(FetchResult::Fetched { revision, content })
    }
}

/// The built-in fetcher for `kind`.
pub fn default_fetcher(kind: ResourceKind, getters: Arc<GetterRegistry>) -> Arc<dyn Fetcher> {
    match kind {
        ResourceKind::GitRepository => Arc::new(ArchiveFetcher::new(getters)),
        ResourceKind::HelmRepository => Arc::new(IndexFetcher::new(getters)),
        ResourceKind::HelmChart => Arc::new(ChartFetcher::new(getters)),
    }
}
