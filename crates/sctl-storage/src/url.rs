//! # URL Resolution
//!
//! Maps storage-relative paths to URLs other workloads can fetch.
//!
//! The hostname is resolved once at startup:
//!
//! - an explicitly configured hostname is used as-is;
//! - inside a cluster (a namespace is known), the hostname is derived from
//!   the instance identity token, e.g. pod `source-controller-7d8f9c6b78-x9v2q`
//!   in namespace `flux-system` becomes `source-controller.flux-system`,
//!   the name of the fronting service rather than the ephemeral pod;
//! - otherwise the static responder's own bind address is used, with an
//!   empty or wildcard host rewritten to `localhost`.
//!
//! A token that is too short to derive from is a [`ConfigurationError`];
//! [`resolve_hostname_or_fallback`] logs it and falls back to the bind
//! address instead of failing.

use thiserror::Error;

use sctl_core::ErrorKind;

/// Separator between segments of an instance identity token.
pub const IDENTITY_SEPARATOR: char = '-';

/// Trailing segments added by the workload controller (template hash and
/// random suffix).
const GENERATED_SEGMENTS: usize = 2;

/// Errors deriving a hostname from the environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// The identity token has too few segments to strip the generated suffix.
    #[error("instance identity {token:?} has {segments} segment(s); at least {required} are required")]
    IdentityTooShort {
        /// The rejected token.
        token: String,
        /// Segments found.
        segments: usize,
        /// Segments required.
        required: usize,
    },

    /// No identity token, or nothing left after stripping the suffix.
    #[error("instance identity {0:?} does not contain a workload name")]
    EmptyIdentity(String),

    /// A namespace was expected but is empty.
    #[error("namespace must not be empty")]
    EmptyNamespace,
}

impl ConfigurationError {
    /// Every hostname error classifies as [`ErrorKind::Configuration`].
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

/// Derive `<workload-name>.<namespace>` from an instance identity token.
pub fn derive_hostname(identity: &str, namespace: &str) -> Result<String, ConfigurationError> {
    if namespace.is_empty() {
        return Err(ConfigurationError::EmptyNamespace);
    }
    let segments: Vec<&str> = identity.split(IDENTITY_SEPARATOR).collect();
    let required = GENERATED_SEGMENTS + 1;
    if segments.len() < required {
        return Err(ConfigurationError::IdentityTooShort {
            token: identity.to_string(),
            segments: segments.len(),
            required,
        });
    }
    let workload = segments[..segments.len() - GENERATED_SEGMENTS].join("-");
    if workload.is_empty() {
        return Err(ConfigurationError::EmptyIdentity(identity.to_string()));
    }
    Ok(format!("{workload}.{namespace}"))
}

/// Resolve the artifact hostname.
///
/// Returns an error only when derivation is attempted (a namespace is
/// present) and fails.
pub fn resolve_hostname(
    explicit: Option<&str>,
    identity: Option<&str>,
    namespace: Option<&str>,
    bind_address: &str,
) -> Result<String, ConfigurationError> {
    if let Some(host) = explicit.filter(|h| !h.is_empty()) {
        return Ok(host.to_string());
    }
    match namespace.filter(|ns| !ns.is_empty()) {
        Some(ns) => {
            let identity = identity
                .filter(|id| !id.is_empty())
                .ok_or_else(|| ConfigurationError::EmptyIdentity(String::new()))?;
            derive_hostname(identity, ns)
        }
        None => Ok(local_address(bind_address)),
    }
}

/// Like [`resolve_hostname`], but a derivation failure is logged and the
/// bind address is used instead.
pub fn resolve_hostname_or_fallback(
    explicit: Option<&str>,
    identity: Option<&str>,
    namespace: Option<&str>,
    bind_address: &str,
) -> String {
    match resolve_hostname(explicit, identity, namespace, bind_address) {
        Ok(host) => host,
        Err(e) => {
            let fallback = local_address(bind_address);
            tracing::warn!(
                error = %e,
                fallback = %fallback,
                "cannot derive artifact hostname from instance identity"
            );
            fallback
        }
    }
}

/// Turn a bind address into a reachable `host:port`.
fn local_address(bind_address: &str) -> String {
    if bind_address.starts_with(':') {
        return format!("localhost{bind_address}");
    }
    for wildcard in ["0.0.0.0:", "[::]:"] {
        if let Some(port) = bind_address.strip_prefix(wildcard) {
            return format!("localhost:{port}");
        }
    }
    bind_address.to_string()
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Builds artifact URLs from storage-relative paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlResolver {
    scheme: String,
    hostname: String,
}

impl UrlResolver {
    /// A resolver producing `http://<hostname>/<path>` URLs.
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            scheme: "http".to_string(),
            hostname: hostname.into(),
        }
    }

    /// Use a different URL scheme.
    pub fn with_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.scheme = scheme.into();
        self
    }

    /// The resolved hostname.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// URL of the artifact at `relative_path`.
    pub fn resolve(&self, relative_path: &str) -> String {
        format!(
            "{}://{}/{}",
            self.scheme,
            self.hostname,
            relative_path.trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn derives_service_hostname_from_pod_name() {
        assert_eq!(
            derive_hostname("source-controller-7d8f9c6b78-x9v2q", "flux-system").unwrap(),
            "source-controller.flux-system"
        );
    }

    #[test]
    fn single_segment_workload() {
        assert_eq!(derive_hostname("app-5c9d-abcde", "default").unwrap(), "app.default");
    }

    #[test]
    fn too_few_segments_is_configuration_error() {
        let err = derive_hostname("standalone", "default").unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::IdentityTooShort {
                token: "standalone".into(),
                segments: 1,
                required: 3,
            }
        );
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(derive_hostname("a-b", "default").is_err());
    }

    #[test]
    fn leading_separator_leaves_empty_workload() {
        assert!(matches!(
            derive_hostname("-abc-def", "default"),
            Err(ConfigurationError::EmptyIdentity(_))
        ));
    }

    #[test]
    fn empty_namespace_rejected() {
        assert_eq!(
            derive_hostname("a-b-c", ""),
            Err(ConfigurationError::EmptyNamespace)
        );
    }

    // ── resolve_hostname ─────────────────────────────────────────────

    #[test]
    fn explicit_hostname_wins() {
        let host = resolve_hostname(
            Some("artifacts.example.com"),
            Some("source-controller-1-2"),
            Some("flux-system"),
            ":9090",
        )
        .unwrap();
        assert_eq!(host, "artifacts.example.com");
    }

    #[test]
    fn no_namespace_uses_bind_address() {
        assert_eq!(resolve_hostname(None, None, None, ":9090").unwrap(), "localhost:9090");
        assert_eq!(
            resolve_hostname(None, Some("x"), Some(""), "0.0.0.0:9090").unwrap(),
            "localhost:9090"
        );
        assert_eq!(
            resolve_hostname(None, None, None, "10.0.0.5:9090").unwrap(),
            "10.0.0.5:9090"
        );
    }

    #[test]
    fn missing_identity_in_cluster_is_error() {
        assert!(resolve_hostname(None, None, Some("flux-system"), ":9090").is_err());
    }

    #[test]
    fn fallback_degrades_to_bind_address() {
        let host = resolve_hostname_or_fallback(None, Some("short"), Some("flux-system"), ":9090");
        assert_eq!(host, "localhost:9090");
    }

    #[test]
    fn resolver_joins_path() {
        let resolver = UrlResolver::new("localhost:9090");
        assert_eq!(
            resolver.resolve("/helmchart/default/nginx/1.0.0.tgz"),
            "http://localhost:9090/helmchart/default/nginx/1.0.0.tgz"
        );
        let tls = UrlResolver::new("artifacts").with_scheme("https");
        assert_eq!(tls.resolve("a/b"), "https://artifacts/a/b");
    }

    proptest! {
        #[test]
        fn derivation_strips_exactly_two_segments(
            parts in proptest::collection::vec("[a-z0-9]{1,8}", 1..5),
            hash in "[a-z0-9]{5,10}",
            suffix in "[a-z0-9]{5}",
            ns in "[a-z][a-z0-9-]{0,20}",
        ) {
            let workload = parts.join("-");
            let token = format!("{workload}-{hash}-{suffix}");
            let host = derive_hostname(&token, &ns).unwrap();
            prop_assert_eq!(host, format!("{workload}.{ns}"));
        }
    }
}
