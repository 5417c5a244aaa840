//! Shared storage handle
//!
//! Wraps the redb database together with the query log. The association
//! store, the type table and any owner tables that want atomic cascades all
//! share one `Storage`, so a single write transaction can span them.

use std::path::Path;
use std::sync::Arc;

use assoc_types::{AssocError, Result};
use redb::{Database, Key, ReadTransaction, TableDefinition, Value, WriteTransaction};

use crate::query_log::{QueryKind, QueryLog};

/// Map any redb error into the workspace error type
pub fn db_err<E: Into<redb::Error>>(err: E) -> AssocError {
    AssocError::Database(err.into().to_string())
}

/// Database handle plus query instrumentation
#[derive(Clone)]
pub struct Storage {
    db: Arc<Database>,
    log: Arc<QueryLog>,
}

impl Storage {
    /// Open (or create) a database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AssocError::Database(format!(
                        "Failed to create {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let db = Database::create(path).map_err(|e| {
            AssocError::Database(format!("Failed to open database: {}", e))
        })?;
        tracing::info!("Storage opened (db: {})", path.display());

        Ok(Self::from_database(db))
    }

    /// Open a throwaway in-memory database
    pub fn in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(db_err)?;
        Ok(Self::from_database(db))
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            log: Arc::new(QueryLog::new()),
        }
    }

    /// Query counters shared by everything using this storage
    pub fn log(&self) -> &QueryLog {
        &self.log
    }

    /// Shared handle to the query counters
    pub fn shared_log(&self) -> Arc<QueryLog> {
        self.log.clone()
    }

    /// Start a read transaction, recording it as one query of `kind`
    pub fn read(&self, kind: QueryKind) -> Result<ReadTransaction> {
        self.log.record(kind);
        self.db.begin_read().map_err(db_err)
    }

    /// Start a write transaction, recording it as one query of `kind`
    pub fn write(&self, kind: QueryKind) -> Result<WriteTransaction> {
        self.log.record(kind);
        self.db.begin_write().map_err(db_err)
    }

    /// Create a table if it does not exist yet
    ///
    /// Read transactions fail on tables that were never created, so every
    /// table is created once at startup.
    pub fn create_table<K: Key + 'static, V: Value + 'static>(
        &self,
        definition: TableDefinition<K, V>,
    ) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        txn.open_table(definition).map_err(db_err)?;
        txn.commit().map_err(db_err)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("queries", &self.log.total())
            .finish()
    }
}
