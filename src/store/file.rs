//! Directory-backed store.
//!
//! Each key maps to one JSON envelope on disk. Every operation holds a
//! `flock` on `<root>/.lock` (shared for reads, exclusive for writes), which
//! makes compare-and-swap atomic across every process on the host sharing the
//! directory.

use nix::fcntl::{flock, FlockArg};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::{Store, StoreError, Versioned, ROOT_PREFIX};

const LOCK_FILE: &str = ".lock";
const REVISION_FILE: &str = ".revision";
const DOCUMENT_SUFFIX: &str = ".json";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    revision: u64,
    value: String,
}

/// Held flock; released when dropped
struct StoreLock {
    file: File,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(err) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            warn!("failed to release store lock: {}", err);
        }
    }
}

#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a store rooted at `root`
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn lock(&self, exclusive: bool) -> Result<StoreLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.root.join(LOCK_FILE))?;
        let arg = if exclusive {
            FlockArg::LockExclusive
        } else {
            FlockArg::LockShared
        };
        flock(file.as_raw_fd(), arg).map_err(|err| StoreError::Lock(err.to_string()))?;
        Ok(StoreLock { file })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StoreError> {
        let relative = key
            .strip_prefix(ROOT_PREFIX)
            .ok_or_else(|| StoreError::InvalidKey(key.to_string()))?;
        let segments: Vec<&str> = relative.split('/').collect();
        let valid = segments.iter().all(|s| {
            !s.is_empty() && *s != "." && *s != ".." && !s.starts_with('.') && !s.contains('\0')
        });
        if !valid {
            return Err(StoreError::InvalidKey(key.to_string()));
        }
        let mut path = self.root.clone();
        for (i, segment) in segments.iter().enumerate() {
            if i + 1 == segments.len() {
                path.push(format!("{segment}{DOCUMENT_SUFFIX}"));
            } else {
                path.push(segment);
            }
        }
        Ok(path)
    }

    fn read_envelope(path: &Path) -> Result<Option<Envelope>, StoreError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Document {
                    key: path.display().to_string(),
                    source,
                }),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn next_revision(&self) -> Result<u64, StoreError> {
        let path = self.root.join(REVISION_FILE);
        let current = match fs::read_to_string(&path) {
            Ok(text) => text.trim().parse::<u64>().unwrap_or(0),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };
        let next = current + 1;
        Self::write_atomic(&path, next.to_string().as_bytes())?;
        Ok(next)
    }

    fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn write_document(&self, path: &Path, value: &[u8]) -> Result<u64, StoreError> {
        let value = String::from_utf8(value.to_vec()).map_err(|_| {
            StoreError::InvalidKey(format!("{}: value is not UTF-8", path.display()))
        })?;
        let revision = self.next_revision()?;
        let envelope = Envelope { revision, value };
        let bytes = serde_json::to_vec(&envelope).map_err(|source| StoreError::Document {
            key: path.display().to_string(),
            source,
        })?;
        Self::write_atomic(path, &bytes)?;
        Ok(revision)
    }

    fn collect(&self, dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), StoreError> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                self.collect(&path, out)?;
            } else if name.to_string_lossy().ends_with(DOCUMENT_SUFFIX) {
                out.push(path);
            }
        }
        Ok(())
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?.to_str()?;
        let relative = relative.strip_suffix(DOCUMENT_SUFFIX)?;
        Some(format!("{ROOT_PREFIX}{relative}"))
    }
}

impl Store for FileStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(false)?;
        Ok(Self::read_envelope(&path)?.map(|envelope| Versioned {
            value: envelope.value.into_bytes(),
            revision: envelope.revision,
        }))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(true)?;
        self.write_document(&path, value)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(true)?;
        let current = Self::read_envelope(&path)?.map(|envelope| envelope.revision);
        if current != expected {
            debug!(key, ?current, ?expected, "compare-and-swap lost the race");
            return Ok(false);
        }
        self.write_document(&path, value)?;
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let path = self.path_for(key)?;
        let _lock = self.lock(true)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        let _lock = self.lock(false)?;
        let mut paths = Vec::new();
        self.collect(&self.root, &mut paths)?;
        let mut found = Vec::new();
        for path in paths {
            let Some(key) = self.key_for(&path) else {
                continue;
            };
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(envelope) = Self::read_envelope(&path)? {
                found.push((
                    key,
                    Versioned {
                        value: envelope.value.into_bytes(),
                        revision: envelope.revision,
                    },
                ));
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(found)
    }
}
