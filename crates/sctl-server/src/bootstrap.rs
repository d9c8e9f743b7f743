//! # Bootstrap
//!
//! Turns a [`Config`] and the process [`Environment`] into a [`Runtime`]
//! without touching the network, then [`Runtime::start`] binds the
//! listeners and spawns every task under a [`Supervisor`].
//!
//! ## Sequence
//!
//! 1. **Storage**: create and probe the artifact root. Failure is fatal;
//!    there is no degraded mode without storage.
//! 2. **Hostname**: explicit flag, else derived from the instance
//!    identity, else the bind address (with a warning).
//! 3. **Kinds and sources**: build the [`KindRegistry`] and load the
//!    manifest into the in-memory source store.
//! 4. **Leadership**: a lease elector when enabled, otherwise permanent
//!    leadership.
//! 5. **Coordinators**: one per registered kind, sharing storage, the
//!    getter registry, and the event forwarder.
//!
//! Every failure is returned as an [`InitError`]; deciding to exit is
//! left to `main`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use sctl_core::{leadership_channel, KindRegistry, LeaderWatch};
use sctl_reconcile::forwarder::{DEFAULT_BUFFER, DEFAULT_POST_TIMEOUT};
use sctl_reconcile::getter::DEFAULT_TIMEOUT;
use sctl_reconcile::{
    default_fetcher, Coordinator, EventForwarder, FetchError, FileLeaseStore, ForwarderWorker,
    GetterRegistry, InMemorySourceStore, LeaderElector,
};
use sctl_storage::{resolve_hostname_or_fallback, Storage, StorageError, Sweeper, UrlResolver};

use crate::config::{parse_bind_address, Config, ConfigError, Environment};
use crate::file_server;
use crate::manifest::{self, ManifestError};
use crate::supervisor::Supervisor;
use crate::telemetry::Telemetry;

/// How long shutdown waits for tasks before aborting them.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Errors that prevent the controller from starting.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// A configuration value is unusable.
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// The artifact root is unusable.
    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    /// The source manifest could not be loaded.
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),

    /// An HTTP client could not be built.
    #[error("http client: {0}")]
    Client(#[from] FetchError),

    /// A listener could not be bound.
    #[error("cannot bind {server} to {address}: {source}")]
    Bind {
        /// Which server.
        server: &'static str,
        /// Requested address.
        address: SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// A fully wired, not yet running controller.
pub struct Runtime {
    config: Config,
    storage: Arc<Storage>,
    store: Arc<InMemorySourceStore>,
    registry: KindRegistry,
    coordinators: Vec<Arc<Coordinator>>,
    sweeper: Arc<Sweeper>,
    leader: LeaderWatch,
    elector: Option<LeaderElector>,
    forwarder: Option<ForwarderWorker>,
    telemetry: Telemetry,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("storage", &self.storage.base_dir())
            .field("hostname", &self.storage.resolver().hostname())
            .field("kinds", &self.registry.len())
            .field("leader_election", &self.elector.is_some())
            .field("events", &self.forwarder.is_some())
            .finish_non_exhaustive()
    }
}

/// Build the controller from configuration.
pub fn bootstrap(config: Config, env: Environment) -> Result<Runtime, InitError> {
    let storage = init_storage(&config, &env)?;
    let registry = KindRegistry::with_defaults();

    let store = Arc::new(InMemorySourceStore::new());
    if let Some(path) = &config.manifest {
        let objects = manifest::load(path, &registry)?;
        let count = manifest::apply(&store, objects);
        tracing::info!(manifest = %path.display(), sources = count, "loaded source manifest");
    }

    let (leader, elector) = if config.enable_leader_election {
        let (signal, watch) = leadership_channel(false);
        let lease_dir = config.leader_election_path()?;
        let lease_store = Arc::new(FileLeaseStore::new(lease_dir, &config.leader_election_id));
        let elector = LeaderElector::new(
            env.election_identity(),
            lease_store,
            config.lease_duration(),
            config.renew_interval(),
            signal,
        );
        (watch, Some(elector))
    } else {
        (LeaderWatch::always(), None)
    };

    let (events, forwarder) = match &config.events_address {
        Some(endpoint) => {
            let (events, worker) = EventForwarder::new(endpoint.clone(), DEFAULT_BUFFER, DEFAULT_POST_TIMEOUT)?;
            (events, Some(worker))
        }
        None => (EventForwarder::disabled(), None),
    };

    let getters = Arc::new(GetterRegistry::with_http(DEFAULT_TIMEOUT, config.max_artifact_size)?);
    let coordinators = registry
        .kinds()
        .map(|kind| {
            Arc::new(Coordinator::new(
                kind,
                storage.clone(),
                default_fetcher(kind, getters.clone()),
                store.clone(),
                events.clone(),
                config.max_concurrent_reconciles,
            ))
        })
        .collect();

    let sweeper = Arc::new(Sweeper::new(storage.clone(), config.retention_policy()));

    let telemetry = match Telemetry::install() {
        Ok(telemetry) => telemetry,
        Err(e) => {
            tracing::warn!(error = %e, "metrics recorder unavailable, /metrics will be empty");
            Telemetry::detached()
        }
    };

    tracing::info!(
        storage = %storage.base_dir().display(),
        hostname = %storage.resolver().hostname(),
        kinds = registry.len(),
        leader_election = config.enable_leader_election,
        max_concurrent_reconciles = config.max_concurrent_reconciles,
        "source controller configured"
    );

    Ok(Runtime {
        config,
        storage,
        store,
        registry,
        coordinators,
        sweeper,
        leader,
        elector,
        forwarder,
        telemetry,
    })
}

fn init_storage(config: &Config, env: &Environment) -> Result<Arc<Storage>, InitError> {
    let hostname = resolve_hostname_or_fallback(
        config.storage_hostname.as_deref(),
        env.identity.as_deref(),
        env.namespace.as_deref(),
        &config.storage_address,
    );
    let storage = Storage::new(config.storage_path()?, UrlResolver::new(hostname))
        .with_max_artifact_size(config.max_artifact_size);
    storage.initialize()?;
    Ok(Arc::new(storage))
}

async fn bind(server: &'static str, address: &str) -> Result<TcpListener, InitError> {
    let address = parse_bind_address(address)?;
    TcpListener::bind(address)
        .await
        .map_err(|source| InitError::Bind {
            server,
            address,
            source,
        })
}

impl Runtime {
    /// The artifact storage.
    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    /// The in-memory source store.
    pub fn store(&self) -> &Arc<InMemorySourceStore> {
        &self.store
    }

    /// Registered resource kinds.
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// One coordinator per registered kind.
    pub fn coordinators(&self) -> &[Arc<Coordinator>] {
        &self.coordinators
    }

    /// Current leadership view.
    pub fn leader(&self) -> &LeaderWatch {
        &self.leader
    }

    /// Bind both listeners and spawn every task.
    pub async fn start(self) -> Result<Running, InitError> {
        let files = bind("artifacts", &self.config.storage_address).await?;
        let probes = bind("metrics", &self.config.metrics_address).await?;
        let storage_addr = local_addr("artifacts", &files)?;
        let metrics_addr = local_addr("metrics", &probes)?;

        let mut supervisor = Supervisor::new();
        let token = supervisor.token();

        let router = file_server::router(self.storage.base_dir());
        let cancel = token.clone();
        supervisor.spawn("artifact-server", async move {
            if let Err(e) = file_server::serve("artifacts", files, router, cancel).await {
                tracing::error!(error = %e, "artifact server failed");
            }
        });

        let router = self.telemetry.router();
        let cancel = token.clone();
        supervisor.spawn("metrics-server", async move {
            if let Err(e) = file_server::serve("metrics", probes, router, cancel).await {
                tracing::error!(error = %e, "metrics server failed");
            }
        });

        if let Some(elector) = self.elector {
            supervisor.spawn("leader-election", elector.run(token.clone()));
        }
        if let Some(worker) = self.forwarder {
            supervisor.spawn("event-forwarder", worker.run(token.clone()));
        }
        supervisor.spawn("sweeper", self.sweeper.run(self.leader.clone(), token.clone()));
        for coordinator in self.coordinators {
            supervisor.spawn("coordinator", coordinator.run(self.leader.clone(), token.clone()));
        }

        self.telemetry.mark_ready();
        tracing::info!(%storage_addr, %metrics_addr, tasks = supervisor.len(), "source controller started");
        Ok(Running {
            supervisor,
            storage_addr,
            metrics_addr,
        })
    }
}

fn local_addr(server: &'static str, listener: &TcpListener) -> Result<SocketAddr, InitError> {
    listener.local_addr().map_err(|source| InitError::Bind {
        server,
        address: SocketAddr::from(([0, 0, 0, 0], 0)),
        source,
    })
}

/// A started controller.
pub struct Running {
    supervisor: Supervisor,
    storage_addr: SocketAddr,
    metrics_addr: SocketAddr,
}

impl Running {
    /// Where the artifact server listens.
    pub fn storage_addr(&self) -> SocketAddr {
        self.storage_addr
    }

    /// Where the metrics endpoint listens.
    pub fn metrics_addr(&self) -> SocketAddr {
        self.metrics_addr
    }

    /// Run until `shutdown` resolves or a task exits, then stop everything.
    pub async fn run_until<S>(self, shutdown: S)
    where
        S: std::future::Future<Output = ()>,
    {
        self.supervisor.run_until(shutdown, SHUTDOWN_GRACE).await;
    }

    /// Stop everything now.
    pub async fn shutdown(self) {
        self.supervisor.shutdown_and_join(SHUTDOWN_GRACE).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn config(storage: &std::path::Path, extra: &[&str]) -> Config {
        let storage = storage.to_str().unwrap();
        let mut argv = vec![
            "source-controller",
            "--storage-path",
            storage,
            "--storage-address",
            "127.0.0.1:0",
            "--metrics-address",
            "127.0.0.1:0",
        ];
        argv.extend_from_slice(extra);
        Config::try_parse_from(argv).unwrap()
    }

    #[test]
    fn wires_one_coordinator_per_kind() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = bootstrap(config(&tmp.path().join("bin"), &[]), Environment::default()).unwrap();
        assert_eq!(runtime.coordinators().len(), 3);
        assert!(runtime.leader().is_leader());
        assert!(tmp.path().join("bin").is_dir());
    }

    #[test]
    fn derives_hostname_from_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let env = Environment {
            namespace: Some("flux-system".into()),
            identity: Some("source-controller-7d8f9c6b78-x9v2q".into()),
        };
        let runtime = bootstrap(config(tmp.path(), &[]), env).unwrap();
        assert_eq!(
            runtime.storage().resolver().hostname(),
            "source-controller.flux-system"
        );
    }

    #[test]
    fn storage_path_that_is_a_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("occupied");
        std::fs::write(&file, b"x").unwrap();
        let err = bootstrap(config(&file, &[]), Environment::default()).unwrap_err();
        assert!(matches!(err, InitError::Storage(_)));
    }

    #[test]
    fn bad_manifest_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest = tmp.path().join("sources.yaml");
        std::fs::write(&manifest, "- kind: OCIRepository\n  metadata: {name: a}\n  spec: {url: x}\n").unwrap();
        let manifest = manifest.to_str().unwrap().to_string();
        let err = bootstrap(config(tmp.path(), &["--manifest", &manifest]), Environment::default()).unwrap_err();
        assert!(matches!(err, InitError::Manifest(_)));
    }

    #[test]
    fn leader_election_starts_as_standby() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = bootstrap(
            config(tmp.path(), &["--enable-leader-election"]),
            Environment::default(),
        )
        .unwrap();
        assert!(!runtime.leader().is_leader());
    }

    #[tokio::test]
    async fn starts_and_stops() {
        let tmp = tempfile::tempdir().unwrap();
        let runtime = bootstrap(config(tmp.path(), &[]), Environment::default()).unwrap();
        let running = runtime.start().await.unwrap();
        assert_ne!(running.storage_addr().port(), 0);
        assert_ne!(running.metrics_addr().port(), 0);
        running.shutdown().await;
    }
}
