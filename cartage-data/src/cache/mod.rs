//! Session-scoped backing tables for caches and deferred queues.
//!
//! A [`CacheTableStore`] owns a temporary directory. Every table it hands
//! out lives in its own SQLite database file inside that directory, so
//! partitions and queues never contend on a shared database lock. The store
//! removes every table and the directory on [`CacheTableStore::drop_all`]
//! and, best effort, when dropped.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use cartage_core::DeferredKind;
use log::{debug, warn};
use parking_lot::Mutex;
use rusqlite::Connection;
use tempfile::TempDir;
use thiserror::Error;

/// Errors raised by cache tables and the id caches built on them.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The session directory could not be created.
    #[error("failed to create cache directory in {path:?}: {source}")]
    CreateStore {
        /// Requested parent directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A SQLite operation on a cache table failed.
    #[error("cache table {table}: failed to {operation}: {source}")]
    Sqlite {
        /// Table name.
        table: String,
        /// Operation being performed.
        operation: &'static str,
        /// Source error returned by `rusqlite`.
        #[source]
        source: rusqlite::Error,
    },
    /// The table was used after the store dropped it.
    #[error("cache table {table} has been dropped")]
    Dropped {
        /// Table name.
        table: String,
    },
    /// Removing the session directory failed.
    #[error("failed to remove cache directory {path:?}: {source}")]
    Cleanup {
        /// Session directory.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The background spill pool failed.
    #[error("id cache {cache} could not spill entries: {message}")]
    Spill {
        /// Cache name.
        cache: &'static str,
        /// First failure reported by the spill workers.
        message: String,
    },
}

/// Kind of an id cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdCacheKind {
    /// Feature external ids.
    Feature,
    /// Geometry external ids.
    Geometry,
}

impl IdCacheKind {
    /// Cache name used for table names and logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Feature => "feature_ids",
            Self::Geometry => "geometry_ids",
        }
    }
}

/// Schema of a cache table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheTableModel {
    /// Overflow of an id cache: `external_id → key, type_id`.
    IdMap(IdCacheKind),
    /// Records of one deferred reference queue.
    Deferred(DeferredKind),
}

impl CacheTableModel {
    fn prefix(self) -> String {
        match self {
            Self::IdMap(kind) => kind.as_str().to_owned(),
            Self::Deferred(kind) => format!("deferred_{}", kind.as_str()),
        }
    }

    fn schema(self, table: &str) -> String {
        match self {
            Self::IdMap(_) => format!(
                "CREATE TABLE {table} (
                    external_id TEXT PRIMARY KEY,
                    key INTEGER NOT NULL,
                    type_id INTEGER
                )"
            ),
            Self::Deferred(_) => format!(
                "CREATE TABLE {table} (
                    seq INTEGER PRIMARY KEY AUTOINCREMENT,
                    source_key INTEGER NOT NULL,
                    payload TEXT NOT NULL,
                    consumed INTEGER NOT NULL DEFAULT 0
                );
                CREATE INDEX {table}_source_idx ON {table} (source_key, seq)"
            ),
        }
    }
}

/// One backing table and its private connection.
pub struct CacheTable {
    name: String,
    model: CacheTableModel,
    path: PathBuf,
    connection: Mutex<Option<Connection>>,
}

impl fmt::Debug for CacheTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheTable")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl CacheTable {
    fn open(dir: &Path, name: String, model: CacheTableModel) -> Result<Self, CacheError> {
        let path = dir.join(format!("{name}.db"));
        let sqlite = |operation, source| CacheError::Sqlite {
            table: name.clone(),
            operation,
            source,
        };
        let connection = Connection::open(&path).map_err(|source| sqlite("open", source))?;
        connection
            .execute_batch("PRAGMA synchronous = OFF; PRAGMA temp_store = MEMORY;")
            .map_err(|source| sqlite("configure", source))?;
        connection
            .execute_batch(&model.schema(&name))
            .map_err(|source| sqlite("create schema", source))?;
        Ok(Self {
            name,
            model,
            path,
            connection: Mutex::new(Some(connection)),
        })
    }

    /// Unique table name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schema of the table.
    #[must_use]
    pub const fn model(&self) -> CacheTableModel {
        self.model
    }

    /// Run `action` with exclusive access to the table's connection.
    ///
    /// # Errors
    /// Returns [`CacheError::Dropped`] once the store dropped the table and
    /// wraps SQLite failures raised by `action` with `operation`.
    pub fn with_connection<R>(
        &self,
        operation: &'static str,
        action: impl FnOnce(&mut Connection) -> rusqlite::Result<R>,
    ) -> Result<R, CacheError> {
        let mut guard = self.connection.lock();
        let connection = guard.as_mut().ok_or_else(|| CacheError::Dropped {
            table: self.name.clone(),
        })?;
        action(connection).map_err(|source| CacheError::Sqlite {
            table: self.name.clone(),
            operation,
            source,
        })
    }

    /// Number of rows in the table.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the table is gone or the query fails.
    pub fn row_count(&self) -> Result<u64, CacheError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.name);
        self.with_connection("count rows", |conn| {
            conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
        })
        .map(|count| u64::try_from(count).unwrap_or_default())
    }

    fn close(&self) -> Result<(), CacheError> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };
        connection
            .close()
            .map_err(|(_, source)| CacheError::Sqlite {
                table: self.name.clone(),
                operation: "close",
                source,
            })
    }
}

/// Session-scoped set of backing tables.
///
/// # Examples
/// ```
/// use cartage_data::cache::{CacheTableModel, CacheTableStore, IdCacheKind};
///
/// let store = CacheTableStore::create(None).unwrap();
/// let table = store
///     .create_table(CacheTableModel::IdMap(IdCacheKind::Feature))
///     .unwrap();
/// assert_eq!(table.name(), "feature_ids_1");
/// store.drop_all().unwrap();
/// assert!(!store.path().exists());
/// ```
#[derive(Debug)]
pub struct CacheTableStore {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
    tables: Mutex<Vec<Arc<CacheTable>>>,
    next_id: AtomicUsize,
}

impl CacheTableStore {
    /// Create the session directory inside `parent`, or inside the system
    /// temporary directory when `parent` is `None`.
    ///
    /// # Errors
    /// Returns [`CacheError::CreateStore`] when the directory cannot be
    /// created.
    pub fn create(parent: Option<&Path>) -> Result<Self, CacheError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("cartage-cache-");
        let created = match parent {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        let dir = created.map_err(|source| CacheError::CreateStore {
            path: parent.map_or_else(std::env::temp_dir, Path::to_path_buf),
            source,
        })?;
        debug!("created cache directory {}", dir.path().display());
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Mutex::new(Some(dir)),
            tables: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
        })
    }

    /// Session directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create a table following `model`. Names are `{model}_{n}` and unique
    /// within the store.
    ///
    /// # Errors
    /// Returns [`CacheError`] when the store was dropped or the table
    /// cannot be created.
    pub fn create_table(&self, model: CacheTableModel) -> Result<Arc<CacheTable>, CacheError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{id}", model.prefix());
        if self.dir.lock().is_none() {
            return Err(CacheError::Dropped { table: name });
        }
        let table = Arc::new(CacheTable::open(&self.path, name, model)?);
        self.tables.lock().push(Arc::clone(&table));
        Ok(table)
    }

    /// Number of live tables.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.lock().len()
    }

    /// Close every table and delete the session directory.
    ///
    /// Every table is closed even when an earlier one fails; the first
    /// failure is returned.
    ///
    /// # Errors
    /// Returns the first [`CacheError`] raised while closing or deleting.
    pub fn drop_all(&self) -> Result<(), CacheError> {
        let tables = std::mem::take(&mut *self.tables.lock());
        let mut first_error = None;
        for table in tables {
            if let Err(err) = table.close() {
                warn!("{err}");
                first_error.get_or_insert(err);
            }
        }
        if let Some(dir) = self.dir.lock().take() {
            if let Err(source) = dir.close() {
                let err = CacheError::Cleanup {
                    path: self.path.clone(),
                    source,
                };
                warn!("{err}");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for CacheTableStore {
    fn drop(&mut self) {
        if self.dir.lock().is_some() {
            if let Err(err) = self.drop_all() {
                warn!("cache cleanup failed: {err}");
            }
        }
    }
}
