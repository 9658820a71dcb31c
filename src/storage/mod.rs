//! Durable key→bytes storage for provider state.
//!
//! The lease engine only sees this trait: objects that know their own
//! identifier and byte encoding get hydrated on startup and saved after
//! every mutation. Save failures are non-fatal to the caller (logged, the
//! lease call still succeeds); hydrate failures at startup are fatal.

mod sqlite;

pub use sqlite::SqliteStorage;

use std::fmt;

use async_trait::async_trait;

/// Error type for storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// The store has not been opened (or was already closed).
    NotInitialized,
    /// The underlying store failed (I/O, SQL, runtime).
    Backend(String),
    /// A stored blob could not be decoded.
    Corrupt(String),
    /// An object could not be encoded for storage.
    Encode(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotInitialized => write!(f, "storage is not initialized"),
            StorageError::Backend(msg) => write!(f, "storage backend error: {}", msg),
            StorageError::Corrupt(msg) => write!(f, "stored data is corrupt: {}", msg),
            StorageError::Encode(msg) => write!(f, "could not encode object: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

/// An object that can live in the store.
pub trait StateObject: Send + Sync {
    /// Key under which the object is stored. Must be non-empty and unique.
    fn identifier(&self) -> &str;
    /// Byte encoding written to the store.
    fn marshal(&self) -> Result<Vec<u8>, StorageError>;
    /// Fills `self` from a blob previously produced by [`marshal`](Self::marshal).
    fn unmarshal(&mut self, bytes: &[u8]) -> Result<(), StorageError>;
}

#[async_trait]
pub trait Storage<T: StateObject>: Send + Sync {
    /// Opens the store. Idempotent.
    async fn init(&self) -> Result<(), StorageError>;

    /// Gracefully closes the store.
    async fn close(&self) -> Result<(), StorageError>;

    /// Fills `obj` from the blob stored under its identifier. When no blob
    /// exists the call succeeds and `obj` is left unchanged.
    async fn hydrate(&self, obj: &mut T) -> Result<(), StorageError>;

    /// Writes `obj` under its identifier with the store's max-age TTL.
    async fn save(&self, obj: &T) -> Result<(), StorageError>;

    /// Whether the store is open and a sample hydration succeeds.
    async fn health_check(&self, sample: &mut T) -> bool;
}

/// No-op storage honoring the [`Storage`] contract.
///
/// Drop-in dependency for unit tests that do not care about persistence.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStorage;

#[async_trait]
impl<T: StateObject> Storage<T> for NullStorage {
    async fn init(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn hydrate(&self, _obj: &mut T) -> Result<(), StorageError> {
        Ok(())
    }

    async fn save(&self, _obj: &T) -> Result<(), StorageError> {
        Ok(())
    }

    async fn health_check(&self, _sample: &mut T) -> bool {
        true
    }
}
