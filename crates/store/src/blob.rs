//! Filesystem blob store.
//!
//! Opaque byte payloads stored by logical path under one base directory.
//! Every save is atomic (write-temp-then-rename), computes SHA-256, and
//! leaves a `.meta` sidecar next to the blob. Paths are normalized before
//! use; anything escaping the base fails with `PermissionDenied`. Blobs are
//! immutable once written.

use firma_crypto::hash_bytes;
use firma_telemetry::unix_millis;
use firma_types::{new_id, StoreError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Extension of the sidecar carrying a blob's hash, size, and write time.
const META_EXT: &str = "meta";

/// Sidecar contents, serialized as JSON next to the blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMeta {
    /// SHA-256 of the blob bytes, lowercase hex.
    pub hash: String,
    pub size: u64,
    /// Unix milliseconds at write time.
    pub timestamp: i64,
}

/// Result of a successful save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedBlob {
    /// The normalized logical path the blob lives at.
    pub path: String,
    pub size: u64,
    pub hash: String,
}

/// One listing entry. Sidecars never appear in listings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub path: String,
    pub size: u64,
    /// Hash from the sidecar, when one exists.
    pub hash: Option<String>,
}

/// Aggregate usage of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobUsage {
    /// Total bytes on disk, sidecars included.
    pub used: u64,
    /// Blob count, sidecars excluded.
    pub file_count: u64,
    pub dir_count: u64,
}

pub struct BlobStore {
    base: PathBuf,
    max_file_size: u64,
    quota: Option<u64>,
    /// Bytes currently on disk; maintained incrementally after the opening
    /// walk so quota checks stay O(1).
    used: AtomicU64,
}

impl BlobStore {
    /// Opens (creating if needed) a store rooted at `base`.
    pub fn open(
        base: impl Into<PathBuf>,
        max_file_size: u64,
        quota: Option<u64>,
    ) -> Result<Self, StoreError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        let base = base
            .canonicalize()
            .map_err(|e| StoreError::Backend(format!("canonicalize base: {e}")))?;
        let store = Self {
            base,
            max_file_size,
            quota,
            used: AtomicU64::new(0),
        };
        let usage = store.usage()?;
        store.used.store(usage.used, Ordering::Relaxed);
        Ok(store)
    }

    /// The store's size cap, reported as a transport-style capability.
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Normalizes `rel` and resolves it under the base. `..` escapes and
    /// absolute paths fail with `PermissionDenied`.
    fn resolve(&self, rel: &str) -> Result<(PathBuf, String), StoreError> {
        let mut parts: Vec<String> = Vec::new();
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(part) => {
                    let part = part
                        .to_str()
                        .ok_or_else(|| {
                            StoreError::PermissionDenied(format!("non-UTF-8 path: {rel:?}"))
                        })?
                        .to_string();
                    parts.push(part);
                }
                Component::CurDir => {}
                Component::ParentDir => {
                    if parts.pop().is_none() {
                        return Err(StoreError::PermissionDenied(format!(
                            "path escapes the store root: {rel}"
                        )));
                    }
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(StoreError::PermissionDenied(format!(
                        "absolute paths are not allowed: {rel}"
                    )));
                }
            }
        }
        if parts.is_empty() {
            return Err(StoreError::PermissionDenied(format!(
                "empty path after normalization: {rel}"
            )));
        }
        let normalized = parts.join("/");
        Ok((self.base.join(&normalized), normalized))
    }

    fn sidecar_path(path: &Path) -> PathBuf {
        let mut name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        name.push('.');
        name.push_str(META_EXT);
        path.with_file_name(name)
    }

    fn is_sidecar(path: &Path) -> bool {
        path.extension().map(|e| e == META_EXT).unwrap_or(false)
    }

    fn check_cap(&self, size: u64) -> Result<(), StoreError> {
        if size > self.max_file_size {
            return Err(StoreError::FileTooLarge {
                size,
                max: self.max_file_size,
            });
        }
        Ok(())
    }

    fn check_quota(&self, incoming: u64) -> Result<(), StoreError> {
        if let Some(quota) = self.quota {
            let used = self.used.load(Ordering::Relaxed);
            if used.saturating_add(incoming) > quota {
                return Err(StoreError::QuotaExceeded { used, quota });
            }
        }
        Ok(())
    }

    fn write_sidecar(&self, path: &Path, meta: &BlobMeta) -> Result<(), StoreError> {
        let body = serde_json::to_vec(meta)
            .map_err(|e| StoreError::Backend(format!("encode sidecar: {e}")))?;
        let sidecar = Self::sidecar_path(path);
        fs::write(&sidecar, &body)?;
        self.used.fetch_add(body.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    /// Saves `bytes` at `rel`. Atomic: the blob appears fully written or not
    /// at all. Fails with `AlreadyExists` if the path is taken — blobs are
    /// immutable.
    pub fn save(&self, rel: &str, bytes: &[u8]) -> Result<SavedBlob, StoreError> {
        let (path, normalized) = self.resolve(rel)?;
        let size = bytes.len() as u64;
        self.check_cap(size)?;
        self.check_quota(size)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(normalized));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp = path.with_file_name(format!(".tmp-{}", new_id()));
        let result = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
            fs::rename(&temp, &path)?;
            Ok(())
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }
        self.used.fetch_add(size, Ordering::Relaxed);

        let hash = hash_bytes(bytes);
        let meta = BlobMeta {
            hash: hash.clone(),
            size,
            timestamp: unix_millis(),
        };
        self.write_sidecar(&path, &meta)?;
        tracing::debug!(target: "blob", event = "saved", path = %normalized, size, hash = %hash);
        Ok(SavedBlob {
            path: normalized,
            size,
            hash,
        })
    }

    /// Streams `reader` into the blob at `rel`, hashing as it goes. The size
    /// cap is enforced the moment the accumulated length exceeds it; the
    /// partial temp file is removed and no blob remains.
    pub async fn save_stream<R>(&self, rel: &str, mut reader: R) -> Result<SavedBlob, StoreError>
    where
        R: AsyncRead + Unpin,
    {
        let (path, normalized) = self.resolve(rel)?;
        if path.exists() {
            return Err(StoreError::AlreadyExists(normalized));
        }
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = path.with_file_name(format!(".tmp-{}", new_id()));
        let outcome = async {
            let mut file = tokio::fs::File::create(&temp).await?;
            let mut hasher = Sha256::new();
            let mut total: u64 = 0;
            let mut buf = vec![0u8; 64 * 1024];
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                total += n as u64;
                self.check_cap(total)?;
                self.check_quota(total)?;
                hasher.update(&buf[..n]);
                tokio::io::AsyncWriteExt::write_all(&mut file, &buf[..n]).await?;
            }
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp, &path).await?;
            Ok::<(u64, String), StoreError>((total, hex::encode(hasher.finalize())))
        }
        .await;

        let (size, hash) = match outcome {
            Ok(done) => done,
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        };
        self.used.fetch_add(size, Ordering::Relaxed);
        let meta = BlobMeta {
            hash: hash.clone(),
            size,
            timestamp: unix_millis(),
        };
        self.write_sidecar(&path, &meta)?;
        Ok(SavedBlob {
            path: normalized,
            size,
            hash,
        })
    }

    /// Reads the whole blob at `rel`.
    pub fn read(&self, rel: &str) -> Result<Vec<u8>, StoreError> {
        let (path, normalized) = self.resolve(rel)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(normalized));
        }
        Ok(fs::read(&path)?)
    }

    /// Opens the blob for streaming reads.
    pub async fn open_stream(&self, rel: &str) -> Result<tokio::fs::File, StoreError> {
        let (path, normalized) = self.resolve(rel)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(normalized));
        }
        Ok(tokio::fs::File::open(&path).await?)
    }

    /// Reads the `.meta` sidecar for the blob at `rel`.
    pub fn meta(&self, rel: &str) -> Result<BlobMeta, StoreError> {
        let (path, normalized) = self.resolve(rel)?;
        let sidecar = Self::sidecar_path(&path);
        if !sidecar.is_file() {
            return Err(StoreError::NotFound(format!("{normalized}.{META_EXT}")));
        }
        let body = fs::read(&sidecar)?;
        serde_json::from_slice(&body)
            .map_err(|e| StoreError::InvalidRecord(format!("sidecar {normalized}: {e}")))
    }

    pub fn exists(&self, rel: &str) -> Result<bool, StoreError> {
        let (path, _) = self.resolve(rel)?;
        Ok(path.is_file())
    }

    /// Deletes the blob and its sidecar. Only the coordinator calls this, as
    /// part of a transfer purge.
    pub fn delete(&self, rel: &str) -> Result<(), StoreError> {
        let (path, normalized) = self.resolve(rel)?;
        if !path.is_file() {
            return Err(StoreError::NotFound(normalized));
        }
        let size = fs::metadata(&path)?.len();
        fs::remove_file(&path)?;
        self.used.fetch_sub(size, Ordering::Relaxed);
        let sidecar = Self::sidecar_path(&path);
        if sidecar.is_file() {
            let side_size = fs::metadata(&sidecar).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&sidecar)?;
            self.used.fetch_sub(side_size, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Removes an entire subtree. Used for transfer purges; missing paths
    /// are fine.
    pub fn delete_tree(&self, rel: &str) -> Result<(), StoreError> {
        let (path, _) = self.resolve(rel)?;
        if path.is_dir() {
            let removed = Self::tree_size(&path)?;
            fs::remove_dir_all(&path)?;
            self.used.fetch_sub(removed, Ordering::Relaxed);
        }
        Ok(())
    }

    fn tree_size(path: &Path) -> Result<u64, StoreError> {
        let mut total = 0;
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += Self::tree_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
        Ok(total)
    }

    pub fn create_dir(&self, rel: &str) -> Result<(), StoreError> {
        let (path, _) = self.resolve(rel)?;
        fs::create_dir_all(&path)?;
        Ok(())
    }

    /// Lists blobs under `prefix`, recursively, excluding sidecars. Hashes
    /// come from the sidecars, never from re-reading blob bytes.
    pub fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>, StoreError> {
        let (path, normalized) = self.resolve(prefix)?;
        let mut entries = Vec::new();
        if path.is_dir() {
            self.collect(&path, &normalized, &mut entries)?;
        } else if path.is_file() && !Self::is_sidecar(&path) {
            let size = fs::metadata(&path)?.len();
            let hash = self.meta(&normalized).ok().map(|m| m.hash);
            entries.push(BlobEntry {
                path: normalized,
                size,
                hash,
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn collect(
        &self,
        dir: &Path,
        rel: &str,
        out: &mut Vec<BlobEntry>,
    ) -> Result<(), StoreError> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let child_rel = format!("{rel}/{name}");
            let path = entry.path();
            if path.is_dir() {
                self.collect(&path, &child_rel, out)?;
            } else if !Self::is_sidecar(&path) {
                let size = entry.metadata()?.len();
                let hash = self.meta(&child_rel).ok().map(|m| m.hash);
                out.push(BlobEntry {
                    path: child_rel,
                    size,
                    hash,
                });
            }
        }
        Ok(())
    }

    /// Walks the store and reports aggregate usage.
    pub fn usage(&self) -> Result<BlobUsage, StoreError> {
        fn walk(path: &Path, usage: &mut BlobUsage) -> Result<(), StoreError> {
            for entry in fs::read_dir(path)? {
                let entry = entry?;
                let meta = entry.metadata()?;
                if meta.is_dir() {
                    usage.dir_count += 1;
                    walk(&entry.path(), usage)?;
                } else {
                    usage.used += meta.len();
                    if !BlobStore::is_sidecar(&entry.path()) {
                        usage.file_count += 1;
                    }
                }
            }
            Ok(())
        }
        let mut usage = BlobUsage {
            used: 0,
            file_count: 0,
            dir_count: 0,
        };
        walk(&self.base, &mut usage)?;
        Ok(usage)
    }
}
