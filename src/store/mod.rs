//! Shared, cluster-visible document store.
//!
//! Every document lives under [`ROOT_PREFIX`] and carries a revision. Writers
//! that read-modify-write a document must go through
//! [`Store::compare_and_swap`] so two processes can never both commit against
//! the same revision.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

pub mod file;
pub mod models;

pub use file::FileStore;
pub use models::{AllocatedIp, FixedIp, NetworkCrd, Node, Pod, PodEth, Subnet};

pub const ROOT_PREFIX: &str = "/tinycni/";
pub const NODES_KEY_NAME: &str = "nodes";
pub const NETWORKS_KEY_NAME: &str = "networks";
pub const PODS_KEY_NAME: &str = "pods";

pub fn nodes_key() -> String {
    format!("{ROOT_PREFIX}{NODES_KEY_NAME}/")
}

pub fn node_key(node_name: &str) -> String {
    format!("{}{}", nodes_key(), node_name)
}

pub fn networks_key() -> String {
    format!("{ROOT_PREFIX}{NETWORKS_KEY_NAME}/")
}

pub fn network_key(network_name: &str) -> String {
    format!("{}{}", networks_key(), network_name)
}

pub fn pods_key() -> String {
    format!("{ROOT_PREFIX}{PODS_KEY_NAME}/")
}

pub fn pod_key(namespace: &str, pod_name: &str) -> String {
    format!("{}{}/{}", pods_key(), namespace, pod_name)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed document at {key}: {source}")]
    Document {
        key: String,
        source: serde_json::Error,
    },
    #[error("invalid key {0:?}")]
    InvalidKey(String),
    #[error("lock failure: {0}")]
    Lock(String),
}

/// Stored value and the revision it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub value: Vec<u8>,
    pub revision: u64,
}

pub trait Store: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Unconditional write, returning the new revision.
    fn put(&self, key: &str, value: &[u8]) -> Result<u64, StoreError>;

    /// Write only if the key is still at `expected` (`None`: must not exist).
    /// Returns false when another writer got there first.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<bool, StoreError>;

    /// Returns false when the key did not exist.
    fn delete(&self, key: &str) -> Result<bool, StoreError>;

    fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError>;
}

fn decode<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|source| StoreError::Document {
        key: key.to_string(),
        source,
    })
}

fn encode<T: Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|source| StoreError::Document {
        key: key.to_string(),
        source,
    })
}

pub fn get_json<T: DeserializeOwned>(
    store: &dyn Store,
    key: &str,
) -> Result<Option<(T, u64)>, StoreError> {
    match store.get(key)? {
        Some(versioned) => Ok(Some((decode(key, &versioned.value)?, versioned.revision))),
        None => Ok(None),
    }
}

pub fn put_json<T: Serialize>(store: &dyn Store, key: &str, value: &T) -> Result<u64, StoreError> {
    store.put(key, &encode(key, value)?)
}

pub fn cas_json<T: Serialize>(
    store: &dyn Store,
    key: &str,
    expected: Option<u64>,
    value: &T,
) -> Result<bool, StoreError> {
    store.compare_and_swap(key, expected, &encode(key, value)?)
}

pub fn list_json<T: DeserializeOwned>(
    store: &dyn Store,
    prefix: &str,
) -> Result<Vec<T>, StoreError> {
    store
        .list(prefix)?
        .into_iter()
        .map(|(key, versioned)| decode(&key, &versioned.value))
        .collect()
}

#[derive(Debug, Default)]
struct MemoryInner {
    revision: u64,
    entries: BTreeMap<String, Versioned>,
}

/// In-process store, used by tests and single-process tooling
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Lock("memory store mutex poisoned".to_string()))
    }
}

impl Store for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.locked()?.entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<u64, StoreError> {
        let mut inner = self.locked()?;
        inner.revision += 1;
        let revision = inner.revision;
        inner.entries.insert(
            key.to_string(),
            Versioned {
                value: value.to_vec(),
                revision,
            },
        );
        Ok(revision)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
    ) -> Result<bool, StoreError> {
        let mut inner = self.locked()?;
        let current = inner.entries.get(key).map(|v| v.revision);
        if current != expected {
            return Ok(false);
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.entries.insert(
            key.to_string(),
            Versioned {
                value: value.to_vec(),
                revision,
            },
        );
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.locked()?.entries.remove(key).is_some())
    }

    fn list(&self, prefix: &str) -> Result<Vec<(String, Versioned)>, StoreError> {
        Ok(self
            .locked()?
            .entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }
}
