//! Content-addressed storage.
//!
//! Values are stored under the hash of their canonical encoding. A store also
//! tracks a single root hash naming the latest persisted peer snapshot.

use crate::encoding::{self, EncodingError};
use crate::Hash;
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;

/// Storage failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),

    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error("content under {expected} hashes to {actual}")]
    Corrupt { expected: Hash, actual: Hash },
}

/// Raw byte store keyed by content hash.
pub trait ContentStore: Send + Sync {
    fn put_raw(&self, hash: Hash, bytes: Vec<u8>) -> Result<(), StoreError>;

    fn get_raw(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError>;

    fn root_hash(&self) -> Result<Option<Hash>, StoreError>;

    fn set_root_hash(&self, hash: Hash) -> Result<(), StoreError>;
}

/// Typed persist/resolve on top of any [`ContentStore`].
pub trait ContentStoreExt: ContentStore {
    /// Store `value`, returning its content hash.
    fn persist<T: Serialize>(&self, value: &T) -> Result<Hash, StoreError> {
        let bytes = encoding::encode(value)?;
        let hash = Hash::from_bytes(&bytes);
        self.put_raw(hash, bytes)?;
        Ok(hash)
    }

    /// Load the value stored under `hash`, checking its integrity.
    fn resolve<T: DeserializeOwned>(&self, hash: &Hash) -> Result<Option<T>, StoreError> {
        let Some(bytes) = self.get_raw(hash)? else {
            return Ok(None);
        };
        let actual = Hash::from_bytes(&bytes);
        if actual != *hash {
            return Err(StoreError::Corrupt {
                expected: *hash,
                actual,
            });
        }
        Ok(Some(encoding::decode(&bytes)?))
    }
}

impl<S: ContentStore + ?Sized> ContentStoreExt for S {}

/// In-memory store for tests and simulation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    content: RwLock<HashMap<Hash, Vec<u8>>>,
    root: RwLock<Option<Hash>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.content.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.read().is_empty()
    }
}

impl ContentStore for MemoryStore {
    fn put_raw(&self, hash: Hash, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.content.write().insert(hash, bytes);
        Ok(())
    }

    fn get_raw(&self, hash: &Hash) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.content.read().get(hash).cloned())
    }

    fn root_hash(&self) -> Result<Option<Hash>, StoreError> {
        Ok(*self.root.read())
    }

    fn set_root_hash(&self, hash: Hash) -> Result<(), StoreError> {
        *self.root.write() = Some(hash);
        Ok(())
    }
}
