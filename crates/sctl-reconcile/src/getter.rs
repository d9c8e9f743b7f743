//! # Getters
//!
//! A [`Getter`] downloads the bytes behind a URL. The [`GetterRegistry`]
//! maps URL schemes to getters and is built once at startup, then handed
//! to the fetchers that need remote data.
//!
//! The HTTP getter enforces the artifact size limit while downloading, so
//! an oversized body is refused before it is buffered.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use url::Url;

use crate::error::FetchError;

/// Default per-request timeout for HTTP getters.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Downloads the content behind a URL.
#[async_trait]
pub trait Getter: Send + Sync {
    /// Fetch the full body at `url`.
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError>;
}

/// HTTP(S) getter backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpGetter {
    client: reqwest::Client,
    max_size: Option<u64>,
}

impl HttpGetter {
    /// Build a getter with the given per-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("source-controller/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            max_size: None,
        })
    }

    /// Refuse bodies larger than `max_size` bytes.
    pub fn with_max_size(mut self, max_size: Option<u64>) -> Self {
        self.max_size = max_size;
        self
    }
}

#[async_trait]
impl Getter for HttpGetter {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        let mut resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let Some(limit) = self.max_size else {
            return resp.bytes().await.map_err(|source| FetchError::Http {
                url: url.to_string(),
                source,
            });
        };
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit,
        };
        if resp.content_length().is_some_and(|len| len > limit) {
            return Err(too_large());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await.map_err(|source| FetchError::Http {
            url: url.to_string(),
            source,
        })? {
            if body.len() as u64 + chunk.len() as u64 > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Scheme-keyed set of getters.
#[derive(Clone, Default)]
pub struct GetterRegistry {
    getters: BTreeMap<String, Arc<dyn Getter>>,
}

impl GetterRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with one [`HttpGetter`] serving `http` and `https`,
    /// refusing bodies over `max_size` bytes.
    pub fn with_http(timeout: Duration, max_size: Option<u64>) -> Result<Self, FetchError> {
        let http: Arc<dyn Getter> = Arc::new(HttpGetter::new(timeout)?.with_max_size(max_size));
        let mut registry = Self::new();
        registry.register("http", http.clone());
        registry.register("https", http);
        Ok(registry)
    }

    /// Register `getter` for `scheme`, replacing any previous one.
    pub fn register(&mut self, scheme: impl Into<String>, getter: Arc<dyn Getter>) {
        self.getters.insert(scheme.into().to_ascii_lowercase(), getter);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.getters.keys().map(String::as_str)
    }

    /// Parse `url` and fetch it with the getter for its scheme.
    pub async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        let parsed = Url::parse(url).map_err(|source| FetchError::InvalidUrl {
            url: url.to_string(),
            source,
        })?;
        let getter = self
            .getters
            .get(parsed.scheme())
            .ok_or_else(|| FetchError::UnsupportedScheme {
                scheme: parsed.scheme().to_string(),
                url: url.to_string(),
            })?;
        getter.fetch(&parsed).await
    }
}

impl std::fmt::Debug for GetterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GetterRegistry")
            .field("schemes", &self.getters.keys().collect::<Vec<_>>())
            .finish()
    }
}
