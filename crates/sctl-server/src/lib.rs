//! # sctl-server — The `source-controller` Process
//!
//! Wires storage, reconciliation, and the HTTP surfaces into one
//! supervised process.
//!
//! ## HTTP Surfaces
//!
//! - `storage-address` (default `:9090`): read-only artifact file server.
//! - `metrics-address` (default `:8080`): `/metrics`, `/healthz`, `/readyz`.
//!
//! ## Startup
//!
//! [`bootstrap`] validates configuration and prepares storage without
//! binding anything, so it can be exercised in tests. [`Runtime::start`]
//! binds the listeners and spawns every task; the returned [`Running`]
//! handle waits for a shutdown signal and drains the tasks.

pub mod bootstrap;
pub mod config;
pub mod file_server;
pub mod logging;
pub mod manifest;
pub mod supervisor;
pub mod telemetry;

pub use bootstrap::{bootstrap, InitError, Running, Runtime};
pub use config::{Config, Environment};
pub use supervisor::Supervisor;
pub use telemetry::Telemetry;
