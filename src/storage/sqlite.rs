//! SQLite-backed key/value store.
//!
//! One row per object: `id`, the marshaled blob, and an absolute expiry
//! stamp. Blobs older than [`MAX_AGE_SECONDS`] are treated as absent and
//! purged lazily, which keeps leaked state from surviving forever.
//!
//! `rusqlite::Connection` is not `Sync`, so the connection lives behind a
//! `std::sync::Mutex` and every database call runs on the blocking pool.
//! Saves therefore run to completion even when the originating request is
//! cancelled mid-flight.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, error};

use super::{StateObject, Storage, StorageError};

/// Maximum age of a stored blob: one week. Anything older is expired.
const MAX_AGE_SECONDS: i64 = 7 * 24 * 60 * 60;

/// Current schema version, tracked via SQLite's `user_version` pragma.
const SCHEMA_VERSION: i32 = 1;

/// Embedded key→bytes store with a max-age TTL on every blob.
pub struct SqliteStorage {
    path: PathBuf,
    conn: Arc<Mutex<Option<Connection>>>,
}

impl SqliteStorage {
    /// Creates the storage handle without opening it; call
    /// [`init`](Storage::init) before use.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            conn: Arc::new(Mutex::new(None)),
        }
    }

    fn open_and_migrate(path: &Path) -> Result<Connection, StorageError> {
        let conn = Connection::open(path)
            .map_err(|err| StorageError::Backend(format!("failed to open {:?}: {}", path, err)))?;

        let current_version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        if current_version > SCHEMA_VERSION {
            return Err(StorageError::Backend(format!(
                "database schema version {} is newer than supported version {}",
                current_version, SCHEMA_VERSION
            )));
        }

        if current_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS blobs (
                    id TEXT PRIMARY KEY,
                    payload BLOB NOT NULL,
                    expires_at INTEGER NOT NULL
                );
                "#,
            )
            .map_err(|err| StorageError::Backend(err.to_string()))?;
        }
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)
            .map_err(|err| StorageError::Backend(err.to_string()))?;

        Ok(conn)
    }

    /// Runs `op` against the open connection on the blocking pool.
    async fn with_conn<R, F>(&self, op: F) -> Result<R, StorageError>
    where
        R: Send + 'static,
        F: FnOnce(&Connection) -> Result<R, StorageError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|_| {
                StorageError::Backend("storage mutex poisoned".to_string())
            })?;
            let conn = guard.as_ref().ok_or(StorageError::NotInitialized)?;
            op(conn)
        })
        .await
        .map_err(|err| StorageError::Backend(format!("blocking task failed: {}", err)))?
    }

    fn is_open(&self) -> bool {
        self.conn.lock().map(|guard| guard.is_some()).unwrap_or(false)
    }
}

#[async_trait]
impl<T: StateObject> Storage<T> for SqliteStorage {
    async fn init(&self) -> Result<(), StorageError> {
        let path = self.path.clone();
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("storage mutex poisoned".to_string()))?;
            if guard.is_some() {
                return Ok(());
            }
            *guard = Some(Self::open_and_migrate(&path)?);
            Ok(())
        })
        .await
        .map_err(|err| StorageError::Backend(format!("blocking task failed: {}", err)))?
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| StorageError::Backend("storage mutex poisoned".to_string()))?;
        match guard.take() {
            Some(conn) => conn
                .close()
                .map_err(|(_, err)| StorageError::Backend(err.to_string())),
            None => Err(StorageError::NotInitialized),
        }
    }

    async fn hydrate(&self, obj: &mut T) -> Result<(), StorageError> {
        let id = obj.identifier().to_string();
        let now = Utc::now().timestamp();

        let blob: Option<Vec<u8>> = self
            .with_conn(move |conn| {
                // Expired rows are as good as absent; purge on sight.
                conn.execute("DELETE FROM blobs WHERE expires_at <= ?1", (now,))
                    .map_err(|err| StorageError::Backend(err.to_string()))?;
                conn.query_row(
                    "SELECT payload FROM blobs WHERE id = ?1",
                    (&id,),
                    |row| row.get(0),
                )
                .optional()
                .map_err(|err| StorageError::Backend(err.to_string()))
            })
            .await?;

        match blob {
            Some(bytes) => obj.unmarshal(&bytes),
            None => {
                debug!(id = obj.identifier(), "no stored blob, keeping default object");
                Ok(())
            }
        }
    }

    async fn save(&self, obj: &T) -> Result<(), StorageError> {
        let id = obj.identifier().to_string();
        let payload = obj.marshal()?;
        let expires_at = Utc::now().timestamp() + MAX_AGE_SECONDS;

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO blobs (id, payload, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET payload = ?2, expires_at = ?3",
                (&id, &payload, expires_at),
            )
            .map_err(|err| StorageError::Backend(err.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn health_check(&self, sample: &mut T) -> bool {
        if !self.is_open() {
            error!("storage healthcheck failed: store is not open");
            return false;
        }
        if let Err(err) = self.hydrate(sample).await {
            error!(error = %err, "storage healthcheck failed: could not hydrate sample");
            return false;
        }
        true
    }
}
