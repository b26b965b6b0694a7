//! Key-value persistence for tasks and events.
//!
//! Two backends sit behind the [`Store`] trait: a map for throwaway
//! deployments and tests, and a sled-backed single-file store whose named
//! tree plays the role of a bucket. Each file has a single writing process.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::path::Path;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("key not found: {0}")]
    NotFound(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("storage backend error: {0}")]
    Backend(#[from] sled::Error),
}

/// Uniform key-to-value persistence.
///
/// `put` is total: writing an existing key overwrites it. `get` fails with
/// [`StoreError::NotFound`] for absent keys.
#[async_trait]
pub trait Store<T>: Send + Sync {
    async fn put(&self, key: &str, value: T) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<T, StoreError>;

    async fn list(&self) -> Result<Vec<T>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-memory store backed by a map.
#[derive(Debug, Default)]
pub struct MemoryStore<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl<T> Store<T> for MemoryStore<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn put(&self, key: &str, value: T) -> Result<(), StoreError> {
        self.items.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, StoreError> {
        self.items
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        Ok(self.items.read().await.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.items.read().await.len())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.items.write().await.remove(key);
        Ok(())
    }
}

/// Durable single-file store: one sled database, one named tree as the
/// bucket, values encoded as JSON.
pub struct SledStore<T> {
    _db: sled::Db,
    tree: sled::Tree,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SledStore<T> {
    /// Open (creating if missing) the database at `path` and its `bucket`
    /// tree.
    pub fn open(path: impl AsRef<Path>, bucket: &str) -> Result<Self, StoreError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(bucket)?;
        Ok(Self {
            _db: db,
            tree,
            _marker: PhantomData,
        })
    }
}

#[async_trait]
impl<T> Store<T> for SledStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn put(&self, key: &str, value: T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(&value)?;
        self.tree.insert(key.as_bytes(), bytes)?;
        self.tree.flush()?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<T, StoreError> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list(&self) -> Result<Vec<T>, StoreError> {
        let mut values = Vec::new();
        for entry in self.tree.iter() {
            let (_, bytes) = entry?;
            values.push(serde_json::from_slice(&bytes)?);
        }
        Ok(values)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.tree.len())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.tree.remove(key.as_bytes())?;
        self.tree.flush()?;
        Ok(())
    }
}
