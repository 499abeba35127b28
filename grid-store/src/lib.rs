use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use grid_error::{GridError, Result};
use grid_hash::ContentHash;

/// Prefix for in-flight writes. Files with this prefix are invisible
/// to `list_all` and are swept away on store construction.
const TMP_PREFIX: &str = ".tmp-";

/// Describes one stored artifact.
#[derive(Debug, Clone)]
pub struct ArtifactHandle {
    pub content_hash: ContentHash,
    pub size_bytes: u64,
    pub last_accessed: SystemTime,
}

/// Content-addressed storage for compiled shader binaries.
///
/// Every artifact lives in a single flat directory under its own hex
/// digest as filename. Writes are two-phase: bytes land in a temporary
/// file, the digest of the written file is verified against the claimed
/// hash, and only then is the file renamed into place. A partially
/// written or corrupted transfer is never visible under its content
/// hash.
pub struct ArtifactStore {
    /// Label for logging
    label: String,
    /// Directory holding the artifacts
    path: PathBuf,
}

impl ArtifactStore {
    /// Opens (or creates) the store directory and sweeps temporary
    /// files left behind by interrupted writes.
    pub fn new(label: String, path: &Path) -> Result<Self> {
        fs::create_dir_all(path).map_err(|err| {
            GridError::Storage(
                label.clone(),
                format!(
                    "Failed to create store directory {}: {}",
                    path.display(),
                    err
                ),
            )
        })?;

        let store = Self {
            label,
            path: PathBuf::from(path),
        };
        store.sweep_partials();

        log::debug!(
            "store/{}: opened at {}",
            store.label,
            store.path.display()
        );
        Ok(store)
    }

    /// Directory the artifacts live in. Suitable for pointing an
    /// external process's shader-cache environment at.
    pub fn root(&self) -> &Path {
        &self.path
    }

    /// Location an artifact with this hash would occupy. The returned
    /// path alone does not guarantee existence.
    pub fn path_for(&self, hash: &ContentHash) -> PathBuf {
        self.path.join(hash.to_string())
    }

    pub fn has(&self, hash: &ContentHash) -> bool {
        self.path_for(hash).is_file()
    }

    /// Stores `bytes` under `hash` using a verified two-phase write.
    ///
    /// Returns `GridError::Integrity` and leaves the store unchanged
    /// when the digest of the written bytes does not match `hash`.
    /// Writing a hash that is already present is a no-op: identical
    /// bytes yield identical digests, so duplicate writes are safe.
    pub fn put(&self, hash: &ContentHash, bytes: &[u8]) -> Result<()> {
        let tmp = self.path.join(format!(
            "{}{:08x}-{}",
            TMP_PREFIX,
            fastrand::u32(..),
            hash
        ));

        fs::write(&tmp, bytes)?;

        let actual = match ContentHash::from_path(&tmp) {
            Ok(actual) => actual,
            Err(err) => {
                let _ = fs::remove_file(&tmp);
                return Err(err);
            }
        };
        if actual != *hash {
            let _ = fs::remove_file(&tmp);
            log::warn!(
                "store/{}: rejected write for {}: bytes hash to {}",
                self.label,
                hash,
                actual
            );
            return Err(GridError::Integrity {
                expected: hash.to_string(),
                actual: actual.to_string(),
            });
        }

        fs::rename(&tmp, self.path_for(hash))?;
        log::debug!(
            "store/{}: stored {} ({} bytes)",
            self.label,
            hash,
            bytes.len()
        );
        Ok(())
    }

    /// Reads an artifact back, verifying its digest on the way out.
    ///
    /// An entry whose bytes no longer hash to its filename is treated
    /// as corruption: the file is deleted and `None` is returned. A
    /// successful read refreshes the entry's last-access time so hot
    /// artifacts survive eviction.
    pub fn get(&self, hash: &ContentHash) -> Result<Option<Vec<u8>>> {
        let file_path = self.path_for(hash);
        let bytes = match fs::read(&file_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let actual = ContentHash::from_bytes(&bytes);
        if actual != *hash {
            log::warn!(
                "store/{}: {} is corrupt (bytes hash to {}), evicting",
                self.label,
                hash,
                actual
            );
            let _ = fs::remove_file(&file_path);
            return Ok(None);
        }

        self.touch(&file_path);
        Ok(Some(bytes))
    }

    /// Snapshot of every artifact currently published in the store.
    pub fn list_all(&self) -> Result<Vec<ArtifactHandle>> {
        let mut handles = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            // Temporary files and strays do not parse as digests
            let content_hash: ContentHash = match name.parse() {
                Ok(hash) => hash,
                Err(_) => continue,
            };

            let metadata = entry.metadata()?;
            handles.push(ArtifactHandle {
                content_hash,
                size_bytes: metadata.len(),
                last_accessed: metadata.modified()?,
            });
        }
        Ok(handles)
    }

    /// Sum of all published artifact sizes in bytes.
    pub fn total_bytes(&self) -> Result<u64> {
        Ok(self
            .list_all()?
            .iter()
            .map(|handle| handle.size_bytes)
            .sum())
    }

    /// Deletes least-recently-accessed artifacts until the store is at
    /// or under `max_total_bytes`.
    ///
    /// Best-effort cleanup: failures are logged, never returned. The
    /// listing is snapshotted up front; atomic publish guarantees the
    /// snapshot never contains a half-written file.
    pub fn evict_if_over_capacity(&self, max_total_bytes: u64) {
        let mut entries = match self.list_all() {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "store/{}: eviction sweep failed to list: {}",
                    self.label,
                    err
                );
                return;
            }
        };

        let mut total: u64 = entries.iter().map(|h| h.size_bytes).sum();
        if total <= max_total_bytes {
            return;
        }

        // Oldest first; the sort is stable so ties keep listing order
        entries.sort_by_key(|handle| handle.last_accessed);

        for handle in entries {
            if total <= max_total_bytes {
                break;
            }
            match fs::remove_file(self.path_for(&handle.content_hash)) {
                Ok(()) => {
                    total = total.saturating_sub(handle.size_bytes);
                    log::debug!(
                        "store/{}: evicted {} ({} bytes)",
                        self.label,
                        handle.content_hash,
                        handle.size_bytes
                    );
                }
                Err(err) => {
                    log::warn!(
                        "store/{}: failed to evict {}: {}",
                        self.label,
                        handle.content_hash,
                        err
                    );
                }
            }
        }
    }

    /// Removes temporary files left behind by interrupted writes.
    fn sweep_partials(&self) {
        let entries = match fs::read_dir(&self.path) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!(
                    "store/{}: failed to sweep partials: {}",
                    self.label,
                    err
                );
                return;
            }
        };

        for entry in entries.filter_map(|e| e.ok()) {
            let is_partial = entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(TMP_PREFIX))
                .unwrap_or(false);
            if is_partial {
                log::debug!(
                    "store/{}: sweeping partial {:?}",
                    self.label,
                    entry.file_name()
                );
                let _ = fs::remove_file(entry.path());
            }
        }
    }

    /// Best-effort refresh of an entry's modification time, which this
    /// store uses as its last-access time.
    fn touch(&self, path: &Path) {
        let refreshed = fs::File::options()
            .append(true)
            .open(path)
            .and_then(|file| file.set_modified(SystemTime::now()));
        if let Err(err) = refreshed {
            log::debug!(
                "store/{}: failed to refresh access time for {}: {}",
                self.label,
                path.display(),
                err
            );
        }
    }
}
