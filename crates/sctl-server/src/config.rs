//! # Configuration
//!
//! Command-line flags, each with an environment fallback, plus the
//! identity values read from the process environment.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use url::Url;

use sctl_storage::RetentionPolicy;

/// Default lease name, shared by every replica of the controller.
pub const DEFAULT_LEADER_ELECTION_ID: &str = "305740c0.fluxcd.io";

/// Errors in configuration values that clap cannot check on its own.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A bind address is neither `:port` nor `host:port`.
    #[error("invalid bind address {address:?}: {reason}")]
    BindAddress {
        /// The rejected value.
        address: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The working directory could not be determined.
    #[error("cannot determine working directory: {0}")]
    WorkingDirectory(#[source] std::io::Error),
}

/// Source controller configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "source-controller", version, about = "Fetches upstream sources and serves them as artifacts.")]
pub struct Config {
    /// Address the metrics and health endpoint binds to.
    #[arg(long, env = "METRICS_ADDRESS", default_value = ":8080")]
    pub metrics_address: String,

    /// URL of an external receiver for reconciliation events.
    #[arg(long, env = "EVENTS_ADDRESS")]
    pub events_address: Option<Url>,

    /// Elect a single active instance among replicas.
    #[arg(long, env = "ENABLE_LEADER_ELECTION")]
    pub enable_leader_election: bool,

    /// Name of the leader election lease.
    #[arg(long, env = "LEADER_ELECTION_ID", default_value = DEFAULT_LEADER_ELECTION_ID)]
    pub leader_election_id: String,

    /// Directory holding the lease record. Defaults to the storage path.
    #[arg(long, env = "LEADER_ELECTION_PATH")]
    pub leader_election_path: Option<PathBuf>,

    /// How long a lease stays valid without renewal.
    #[arg(long, default_value_t = 15)]
    pub lease_duration_secs: u64,

    /// How often the lease is renewed or retried.
    #[arg(long, default_value_t = 5)]
    pub renew_interval_secs: u64,

    /// Local artifact root. Defaults to `bin` under the working directory.
    #[arg(long, env = "STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Address the artifact file server binds to.
    #[arg(long, env = "STORAGE_ADDRESS", default_value = ":9090")]
    pub storage_address: String,

    /// Hostname used in artifact URLs, overriding derivation.
    #[arg(long, env = "STORAGE_HOSTNAME")]
    pub storage_hostname: Option<String>,

    /// Reconciliations run at once, per resource kind.
    #[arg(long, alias = "concurrent", env = "MAX_CONCURRENT_RECONCILES", default_value_t = 2)]
    pub max_concurrent_reconciles: usize,

    /// Largest artifact accepted, in bytes.
    #[arg(long, env = "MAX_ARTIFACT_SIZE")]
    pub max_artifact_size: Option<u64>,

    /// Seconds between retention sweeps.
    #[arg(long, default_value_t = 300)]
    pub artifact_gc_interval_secs: u64,

    /// Age after which non-current artifacts are swept.
    #[arg(long, default_value_t = 300)]
    pub artifact_retention_ttl_secs: u64,

    /// YAML file of source declarations served by the in-memory store.
    #[arg(long, env = "SOURCE_MANIFEST")]
    pub manifest: Option<PathBuf>,

    /// Log as JSON instead of human-readable text.
    #[arg(long, env = "LOG_AS_JSON")]
    pub log_as_json: bool,
}

impl Config {
    /// The artifact root, resolving the default against the working
    /// directory.
    pub fn storage_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.storage_path {
            Some(path) => Ok(path.clone()),
            None => std::env::current_dir()
                .map(|cwd| cwd.join("bin"))
                .map_err(ConfigError::WorkingDirectory),
        }
    }

    /// Directory for the lease record.
    pub fn leader_election_path(&self) -> Result<PathBuf, ConfigError> {
        match &self.leader_election_path {
            Some(path) => Ok(path.clone()),
            None => self.storage_path(),
        }
    }

    /// Sweeper schedule.
    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            interval: Duration::from_secs(self.artifact_gc_interval_secs.max(1)),
            ttl: Duration::from_secs(self.artifact_retention_ttl_secs),
        }
    }

    /// Lease validity period.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs.max(1))
    }

    /// Lease renewal period.
    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs.max(1))
    }
}

/// Parse a bind address. `:port` binds every interface.
pub fn parse_bind_address(address: &str) -> Result<SocketAddr, ConfigError> {
    let invalid = |reason: String| ConfigError::BindAddress {
        address: address.to_string(),
        reason,
    };
    if let Some(port) = address.strip_prefix(':') {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Some(port) = address.strip_prefix("localhost:") {
        let port: u16 = port.parse().map_err(|e| invalid(format!("bad port: {e}")))?;
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port));
    }
    address.parse().map_err(|e| invalid(format!("{e}")))
}

// ---------------------------------------------------------------------------
// Environment
// ---------------------------------------------------------------------------

/// Identity values read from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    /// Namespace the instance runs in (`RUNTIME_NAMESPACE`).
    pub namespace: Option<String>,
    /// Instance identity token (`HOSTNAME`).
    pub identity: Option<String>,
}

impl Environment {
    /// Read `RUNTIME_NAMESPACE` and `HOSTNAME`. Empty values count as unset.
    pub fn from_env() -> Self {
        let read = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        Self {
            namespace: read("RUNTIME_NAMESPACE"),
            identity: read("HOSTNAME"),
        }
    }

    /// Identity for leader election: the instance token, or a random one.
    pub fn election_identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| format!("source-controller-{}", uuid::Uuid::new_v4()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let mut argv = vec!["source-controller"];
        argv.extend_from_slice(args);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn defaults() {
        let config = parse(&[]);
        assert_eq!(config.metrics_address, ":8080");
        assert_eq!(config.storage_address, ":9090");
        assert_eq!(config.max_concurrent_reconciles, 2);
        assert_eq!(config.leader_election_id, DEFAULT_LEADER_ELECTION_ID);
        assert_eq!(config.artifact_gc_interval_secs, 300);
        assert!(config.max_artifact_size.is_none());
        assert!(config.storage_path().unwrap().ends_with("bin"));
    }

    #[test]
    fn concurrent_alias() {
        let config = parse(&["--concurrent", "4"]);
        assert_eq!(config.max_concurrent_reconciles, 4);
    }

    #[test]
    fn explicit_flags() {
        let config = parse(&[
            "--storage-path",
            "/data",
            "--enable-leader-election",
            "--events-address",
            "http://notification-controller/",
            "--max-artifact-size",
            "1048576",
            "--log-as-json",
        ]);
        assert_eq!(config.storage_path().unwrap(), PathBuf::from("/data"));
        assert_eq!(config.leader_election_path().unwrap(), PathBuf::from("/data"));
        assert!(config.enable_leader_election);
        assert!(config.log_as_json);
        assert_eq!(config.max_artifact_size, Some(1_048_576));
        assert_eq!(
            config.events_address.unwrap().as_str(),
            "http://notification-controller/"
        );
    }

    #[test]
    fn rejects_malformed_events_address() {
        let argv = ["source-controller", "--events-address", "not a url"];
        assert!(Config::try_parse_from(argv).is_err());
    }

    #[test]
    fn bind_addresses() {
        assert_eq!(parse_bind_address(":9090").unwrap(), "0.0.0.0:9090".parse().unwrap());
        assert_eq!(
            parse_bind_address("localhost:8080").unwrap(),
            "127.0.0.1:8080".parse().unwrap()
        );
        assert_eq!(
            parse_bind_address("[::1]:80").unwrap(),
            "[::1]:80".parse().unwrap()
        );
        assert!(parse_bind_address(":http").is_err());
        assert!(parse_bind_address("nowhere").is_err());
    }

    #[test]
    fn random_election_identity_without_hostname() {
        let env = Environment::default();
        let a = env.election_identity();
        let b = env.election_identity();
        assert!(a.starts_with("source-controller-"));
        assert_ne!(a, b);

        let env = Environment {
            namespace: None,
            identity: Some("source-controller-7d8f9c6b78-x9v2q".into()),
        };
        assert_eq!(env.election_identity(), "source-controller-7d8f9c6b78-x9v2q");
    }
}
