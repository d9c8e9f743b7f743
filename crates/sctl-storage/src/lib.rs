//! # sctl-storage — Artifact Storage Engine
//!
//! Owns the local artifact root. Every mutation of that directory goes
//! through [`Storage`]: artifacts are streamed to a temporary file inside
//! the owner directory, hashed on the way, and renamed into place, so a
//! reader sees either nothing or the complete file.
//!
//! ## Layout
//!
//! ```text
//! <root>/<kind>/<namespace>/<name>/<revision>.<ext>   artifacts
//! <root>/<kind>/<namespace>/<name>/.current           current pointer
//! <root>/<kind>/<namespace>/<name>/.tmp-<uuid>        in-flight writes
//! ```
//!
//! ## Components
//!
//! - [`Storage`]: write, read, mark-current, and delete.
//! - [`Sweeper`]: periodic retention pass, gated by leadership.
//! - [`UrlResolver`]: storage-relative path to externally reachable URL.

pub mod engine;
pub mod error;
pub mod sweeper;
pub mod url;

pub use engine::{Storage, StoredEntry, CURRENT_POINTER, TEMP_PREFIX};
pub use error::StorageError;
pub use sweeper::{RetentionPolicy, SweepReport, SweepTarget, Sweeper};
pub use url::{
    derive_hostname, resolve_hostname, resolve_hostname_or_fallback, ConfigurationError,
    UrlResolver,
};
