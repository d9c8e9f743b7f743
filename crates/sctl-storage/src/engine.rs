//! # Storage Engine
//!
//! Atomic, checksummed artifact storage on a single local filesystem.
//!
//! ## Write protocol
//!
//! 1. Create `<owner-dir>/.tmp-<uuid>` with `create_new`.
//! 2. Stream content into it, hashing every chunk and enforcing the size
//!    limit as bytes arrive.
//! 3. `sync_all`, then rename over the final path.
//!
//! The temporary file lives in the owner directory so the rename never
//! crosses a filesystem. Any failure before the rename removes the
//! temporary file. Concurrent writers of the same key each use their own
//! temporary file; the last rename wins and, because a revision maps to
//! deterministic content, the checksum is unaffected.
//!
//! ## Current pointer
//!
//! Each owner directory may hold a `.current` file naming the artifact
//! consumers should fetch. It is written with the same temp-and-rename
//! protocol, and only after the artifact it names exists.

use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sctl_core::{
    sha256_digest, Artifact, ArtifactKey, ContentDigest, ObjectRef, ResourceKind, Sha256Accumulator,
};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

use crate::error::StorageError;
use crate::url::UrlResolver;

/// Name of the per-owner current-artifact pointer file.
pub const CURRENT_POINTER: &str = ".current";

/// Prefix of in-flight temporary files.
pub const TEMP_PREFIX: &str = ".tmp-";

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// One file found in an owner directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    /// File name inside the owner directory.
    pub file_name: String,
    /// Last modification time.
    pub modified: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
    /// Whether this is a leftover temporary file rather than an artifact.
    pub temporary: bool,
}

/// The artifact storage engine.
///
/// Cheap to share behind an `Arc`; holds no locks. Correctness under
/// concurrency comes from the write protocol described above.
#[derive(Debug, Clone)]
pub struct Storage {
    base_dir: PathBuf,
    resolver: UrlResolver,
    max_artifact_size: Option<u64>,
}

impl Storage {
    /// Create an engine rooted at `base_dir`. Call [`Storage::initialize`]
    /// before use.
    pub fn new(base_dir: impl Into<PathBuf>, resolver: UrlResolver) -> Self {
        Self {
            base_dir: base_dir.into(),
            resolver,
            max_artifact_size: None,
        }
    }

    /// Limit the size of any single artifact.
    pub fn with_max_artifact_size(mut self, limit: Option<u64>) -> Self {
        self.max_artifact_size = limit;
        self
    }

    /// Storage root.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// The URL resolver used for published artifact URLs.
    pub fn resolver(&self) -> &UrlResolver {
        &self.resolver
    }

    /// Ensure the root exists, is a directory, and is writable.
    ///
    /// Runs once at process start, before any task is spawned; failure
    /// means the process has no usable storage.
    pub fn initialize(&self) -> Result<(), StorageError> {
        match std::fs::metadata(&self.base_dir) {
            Ok(meta) if !meta.is_dir() => {
                return Err(StorageError::NotADirectory(self.base_dir.clone()));
            }
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                std::fs::create_dir_all(&self.base_dir)
                    .map_err(StorageError::io(&self.base_dir))?;
            }
            Err(e) => return Err(StorageError::io(&self.base_dir)(e)),
        }

        let probe = self
            .base_dir
            .join(format!("{TEMP_PREFIX}probe-{}", Uuid::new_v4()));
        std::fs::write(&probe, b"").map_err(StorageError::io(&probe))?;
        std::fs::remove_file(&probe).map_err(StorageError::io(&probe))?;

        tracing::info!(path = %self.base_dir.display(), "artifact storage ready");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Paths
    // -----------------------------------------------------------------------

    /// Directory holding every artifact of `owner`.
    pub fn owner_dir(&self, owner: &ObjectRef) -> PathBuf {
        self.base_dir
            .join(owner.kind().dir_name())
            .join(owner.namespace())
            .join(owner.name())
    }

    /// Absolute path of the artifact for `key`.
    pub fn artifact_path(&self, key: &ArtifactKey) -> PathBuf {
        self.owner_dir(&key.owner).join(key.file_name())
    }

    /// Externally reachable URL of the artifact for `key`.
    pub fn artifact_url(&self, key: &ArtifactKey) -> String {
        self.resolver.resolve(&key.relative_path())
    }

    // -----------------------------------------------------------------------
    // Write
    // -----------------------------------------------------------------------

    /// Stream `content` into the artifact for `key`.
    ///
    /// The checksum is computed from the bytes actually written. On
    /// [`StorageError::SizeExceeded`] or any I/O failure the temporary file
    /// is removed and the final path is left untouched.
    pub async fn write<R>(&self, key: &ArtifactKey, mut content: R) -> Result<Artifact, StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let dir = self.owner_dir(&key.owner);
        fs::create_dir_all(&dir)
            .await
            .map_err(StorageError::io(&dir))?;

        let tmp_path = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let (checksum, size) = match self.stream_to(&tmp_path, &mut content).await {
            Ok(written) => written,
            Err(e) => {
                discard(&tmp_path).await;
                return Err(e);
            }
        };

        let final_path = dir.join(key.file_name());
        if let Err(e) = fs::rename(&tmp_path, &final_path).await {
            discard(&tmp_path).await;
            return Err(StorageError::io(&final_path)(e));
        }

        tracing::debug!(
            artifact = %key,
            path = %final_path.display(),
            checksum = %checksum,
            size,
            "artifact written"
        );

        Ok(Artifact {
            relative_path: key.relative_path(),
            checksum,
            size_bytes: size,
            created_at: Utc::now(),
            revision: key.revision.clone(),
        })
    }

    /// Convenience wrapper around [`Storage::write`] for in-memory content.
    pub async fn write_bytes(&self, key: &ArtifactKey, content: &[u8]) -> Result<Artifact, StorageError> {
        self.write(key, content).await
    }

    async fn stream_to<R>(&self, path: &Path, content: &mut R) -> Result<(ContentDigest, u64), StorageError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .await
            .map_err(StorageError::io(path))?;

        let mut acc = Sha256Accumulator::new();
        let mut buf = vec![0u8; COPY_BUFFER_SIZE];
        loop {
            let n = content.read(&mut buf).await.map_err(StorageError::io(path))?;
            if n == 0 {
                break;
            }
            acc.update(&buf[..n]);
            if let Some(limit) = self.max_artifact_size {
                if acc.len() > limit {
                    return Err(StorageError::SizeExceeded { limit });
                }
            }
            file.write_all(&buf[..n])
                .await
                .map_err(StorageError::io(path))?;
        }
        file.sync_all().await.map_err(StorageError::io(path))?;

        let size = acc.len();
        Ok((acc.finalize(), size))
    }

    // -----------------------------------------------------------------------
    // Current pointer
    // -----------------------------------------------------------------------

    /// Point the owner's current pointer at `key`.
    ///
    /// Fails with [`StorageError::NotFound`] if the artifact has not been
    /// written, so the pointer never names a missing file.
    pub async fn mark_current(&self, key: &ArtifactKey) -> Result<(), StorageError> {
        let artifact_path = self.artifact_path(key);
        match fs::metadata(&artifact_path).await {
            Ok(_) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(StorageError::NotFound(key.relative_path()));
            }
            Err(e) => return Err(StorageError::io(&artifact_path)(e)),
        }

        let dir = self.owner_dir(&key.owner);
        let tmp_path = dir.join(format!("{TEMP_PREFIX}{}", Uuid::new_v4()));
        let pointer = dir.join(CURRENT_POINTER);
        if let Err(e) = fs::write(&tmp_path, key.file_name().as_bytes()).await {
            discard(&tmp_path).await;
            return Err(StorageError::io(&tmp_path)(e));
        }
        if let Err(e) = fs::rename(&tmp_path, &pointer).await {
            discard(&tmp_path).await;
            return Err(StorageError::io(&pointer)(e));
        }
        tracing::debug!(artifact = %key, "current pointer updated");
        Ok(())
    }

    /// File name of the owner's current artifact, if a pointer exists.
    pub async fn current(&self, owner: &ObjectRef) -> Result<Option<String>, StorageError> {
        let pointer = self.owner_dir(owner).join(CURRENT_POINTER);
        match fs::read_to_string(&pointer).await {
            Ok(name) => {
                let name = name.trim();
                Ok((!name.is_empty()).then(|| name.to_string()))
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&pointer)(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Read
    // -----------------------------------------------------------------------

    /// Whether the artifact for `key` exists.
    pub async fn exists(&self, key: &ArtifactKey) -> Result<bool, StorageError> {
        let path = self.artifact_path(key);
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::io(&path)(e)),
        }
    }

    /// Open the artifact for `key` for streaming.
    pub async fn read(&self, key: &ArtifactKey) -> Result<fs::File, StorageError> {
        let path = self.artifact_path(key);
        match fs::File::open(&path).await {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                Err(StorageError::NotFound(key.relative_path()))
            }
            Err(e) => Err(StorageError::io(&path)(e)),
        }
    }

    /// Read the whole artifact for `key` into memory.
    pub async fn read_to_vec(&self, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
        let path = self.artifact_path(key);
        let mut file = self.read(key).await?;
        let mut out = Vec::new();
        file.read_to_end(&mut out)
            .await
            .map_err(StorageError::io(&path))?;
        Ok(out)
    }

    /// Metadata for an existing artifact, with the checksum recomputed from
    /// disk.
    pub async fn stat(&self, key: &ArtifactKey) -> Result<Artifact, StorageError> {
        let path = self.artifact_path(key);
        let bytes = self.read_to_vec(key).await?;
        let meta = fs::metadata(&path).await.map_err(StorageError::io(&path))?;
        let created_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Artifact {
            relative_path: key.relative_path(),
            checksum: sha256_digest(&bytes),
            size_bytes: bytes.len() as u64,
            created_at,
            revision: key.revision.clone(),
        })
    }

    // -----------------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------------

    /// Remove the artifact for `key`. A missing file is not an error.
    ///
    /// Without `force`, refuses to remove the owner's current artifact.
    pub async fn delete(&self, key: &ArtifactKey, force: bool) -> Result<(), StorageError> {
        if !force && self.current(&key.owner).await?.as_deref() == Some(key.file_name().as_str()) {
            return Err(StorageError::CurrentArtifact(key.relative_path()));
        }
        remove_if_present(&self.artifact_path(key)).await?;
        Ok(())
    }

    /// Remove one file from an owner directory by name, never the current
    /// artifact or the pointer itself. Returns whether a file was removed.
    pub async fn remove_entry(&self, owner: &ObjectRef, file_name: &str) -> Result<bool, StorageError> {
        if file_name == CURRENT_POINTER || file_name.contains('/') || file_name.contains('\\') {
            return Err(StorageError::CurrentArtifact(format!(
                "{}/{file_name}",
                owner.relative_dir()
            )));
        }
        if self.current(owner).await?.as_deref() == Some(file_name) {
            return Err(StorageError::CurrentArtifact(format!(
                "{}/{file_name}",
                owner.relative_dir()
            )));
        }
        remove_if_present(&self.owner_dir(owner).join(file_name)).await
    }

    /// Remove every artifact of `owner`, including the current one.
    ///
    /// Used only when the owning resource has been deleted.
    pub async fn delete_owner(&self, owner: &ObjectRef) -> Result<(), StorageError> {
        let dir = self.owner_dir(owner);
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {
                tracing::info!(owner = %owner, "removed owner artifacts");
                Ok(())
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(&dir)(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Listing
    // -----------------------------------------------------------------------

    /// Every owner that has a directory under the root.
    ///
    /// Directories that do not map to a known kind or a valid identity are
    /// skipped.
    pub async fn list_owners(&self) -> Result<Vec<ObjectRef>, StorageError> {
        let mut owners = Vec::new();
        for (kind_dir, _) in list_dirs(&self.base_dir).await? {
            let Some(kind) = ResourceKind::from_dir_name(&kind_dir) else {
                continue;
            };
            let kind_path = self.base_dir.join(&kind_dir);
            for (namespace, ns_path) in list_dirs(&kind_path).await? {
                for (name, _) in list_dirs(&ns_path).await? {
                    match ObjectRef::new(kind, namespace.clone(), name) {
                        Ok(owner) => owners.push(owner),
                        Err(e) => tracing::debug!(error = %e, "skipping foreign directory"),
                    }
                }
            }
        }
        owners.sort();
        Ok(owners)
    }

    /// Files in the owner directory, excluding the current pointer.
    pub async fn list_entries(&self, owner: &ObjectRef) -> Result<Vec<StoredEntry>, StorageError> {
        let dir = self.owner_dir(owner);
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::io(&dir)(e)),
        };

        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(StorageError::io(&dir))? {
            let Ok(file_name) = entry.file_name().into_string() else {
                continue;
            };
            if file_name == CURRENT_POINTER {
                continue;
            }
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                // Removed between listing and stat.
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(entry.path())(e)),
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map_err(StorageError::io(entry.path()))?;
            entries.push(StoredEntry {
                temporary: file_name.starts_with(TEMP_PREFIX),
                file_name,
                modified: DateTime::<Utc>::from(modified),
                size: meta.len(),
            });
        }
        entries.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        Ok(entries)
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != IoErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file");
        }
    }
}

async fn remove_if_present(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == IoErrorKind::NotFound => Ok(false),
        Err(e) => Err(StorageError::io(path)(e)),
    }
}

async fn list_dirs(dir: &Path) -> Result<Vec<(String, PathBuf)>, StorageError> {
    let mut read_dir = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StorageError::io(dir)(e)),
    };
    let mut out = Vec::new();
    while let Some(entry) = read_dir.next_entry().await.map_err(StorageError::io(dir))? {
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        if !is_dir {
            continue;
        }
        if let Ok(name) = entry.file_name().into_string() {
            out.push((name, entry.path()));
        }
    }
    Ok(out)
}
