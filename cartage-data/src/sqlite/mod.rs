//! SQLite feature database used as export source and import sink.
//!
//! Features are stored as JSON bodies keyed by their internal key, with the
//! envelope copied into real columns so spatial predicates can be narrowed
//! in SQL before the exact [`Predicate::matches`] check runs in Rust.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use cartage_core::{
    DatabaseAdapter, DatabaseError, ExternalId, Feature, FeatureRows, FeatureWriter, InternalKey,
    KeyAllocator, PayloadError, PayloadStore, Predicate, ReferenceKind, ReferenceSystem,
    ResolvedReference, WriteError,
};
use geo::Rect;
use log::debug;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use thiserror::Error;

/// Rows fetched per page when streaming a selection.
const SELECT_PAGE: usize = 256;

/// Name of the envelope index standing in for a spatial index.
pub const ENVELOPE_INDEX: &str = "features_envelope_idx";

/// Errors raised while opening or maintaining a [`SqliteFeatureStore`].
#[derive(Debug, Error)]
pub enum SqliteStoreError {
    /// Opening the database failed.
    #[error("failed to open feature database at {path:?}: {source}")]
    Open {
        /// Database location.
        path: PathBuf,
        /// Driver error.
        #[source]
        source: rusqlite::Error,
    },
    /// A schema step failed.
    #[error("feature database schema step '{step}' failed: {source}")]
    Schema {
        /// Step description.
        step: &'static str,
        /// Driver error.
        #[source]
        source: rusqlite::Error,
    },
    /// A statement failed.
    #[error("feature database failed to {operation}: {source}")]
    Statement {
        /// Operation being performed.
        operation: &'static str,
        /// Driver error.
        #[source]
        source: rusqlite::Error,
    },
    /// A feature could not be encoded as JSON.
    #[error("failed to encode feature {external_id}: {source}")]
    Encode {
        /// Offending feature.
        external_id: ExternalId,
        /// Encoder error.
        #[source]
        source: serde_json::Error,
    },
}

/// A resolved reference persisted by [`FeatureWriter::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredLink {
    /// Reference kind in snake case.
    pub kind: String,
    /// Key of the target feature.
    pub target_key: InternalKey,
    /// External id of the target feature.
    pub target: String,
    /// Optional role.
    pub role: Option<String>,
}

struct Settings {
    reference_system: ReferenceSystem,
    workspace: Option<String>,
}

/// SQLite-backed feature database.
///
/// Implements [`DatabaseAdapter`] for export and [`FeatureWriter`],
/// [`KeyAllocator`] and [`PayloadStore`] for import.
pub struct SqliteFeatureStore {
    connection: Mutex<Connection>,
    next_key: AtomicI64,
    settings: Mutex<Settings>,
    closed: AtomicBool,
}

impl fmt::Debug for SqliteFeatureStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteFeatureStore")
            .field("next_key", &self.next_key.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl SqliteFeatureStore {
    /// Open or create a database file.
    ///
    /// # Examples
    /// ```
    /// use cartage_data::sqlite::SqliteFeatureStore;
    ///
    /// let dir = tempfile::tempdir().unwrap();
    /// let store = SqliteFeatureStore::open(dir.path().join("city.db")).unwrap();
    /// assert_eq!(store.feature_count().unwrap(), 0);
    /// ```
    ///
    /// # Errors
    /// Returns [`SqliteStoreError`] when the file cannot be opened or the
    /// schema cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SqliteStoreError> {
        let db_path = path.as_ref();
        let connection = Connection::open(db_path).map_err(|source| SqliteStoreError::Open {
            path: db_path.to_path_buf(),
            source,
        })?;
        Self::with_connection(connection)
    }

    /// Create a private in-memory database.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError`] when the schema cannot be created.
    pub fn open_in_memory() -> Result<Self, SqliteStoreError> {
        let connection =
            Connection::open_in_memory().map_err(|source| SqliteStoreError::Open {
                path: PathBuf::from(":memory:"),
                source,
            })?;
        Self::with_connection(connection)
    }

    fn with_connection(mut connection: Connection) -> Result<Self, SqliteStoreError> {
        initialise_schema(&mut connection)?;
        let max_key: i64 = connection
            .query_row("SELECT COALESCE(MAX(key), 0) FROM features", [], |row| {
                row.get(0)
            })
            .map_err(|source| SqliteStoreError::Statement {
                operation: "read the highest key",
                source,
            })?;
        let settings = load_settings(&connection)?;
        Ok(Self {
            connection: Mutex::new(connection),
            next_key: AtomicI64::new(max_key.saturating_add(1)),
            settings: Mutex::new(settings),
            closed: AtomicBool::new(false),
        })
    }

    /// Create the envelope index used as spatial index.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the index cannot be built.
    pub fn create_spatial_index(&self) -> Result<(), SqliteStoreError> {
        let sql = format!(
            "CREATE INDEX IF NOT EXISTS {ENVELOPE_INDEX} ON features(min_x, max_x, min_y, max_y)"
        );
        self.execute("create the spatial index", &sql)
    }

    /// Drop the envelope index.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the index cannot be dropped.
    pub fn drop_spatial_index(&self) -> Result<(), SqliteStoreError> {
        self.execute(
            "drop the spatial index",
            &format!("DROP INDEX IF EXISTS {ENVELOPE_INDEX}"),
        )
    }

    /// Record the reference system of the stored geometries.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the metadata cannot be
    /// written.
    pub fn set_reference_system(&self, srs: &ReferenceSystem) -> Result<(), SqliteStoreError> {
        let mut settings = self.settings.lock();
        self.put_metadata("srid", &srs.srid.to_string())?;
        self.put_metadata("is_3d", if srs.is_3d { "1" } else { "0" })?;
        self.put_metadata("srs_name", &srs.name)?;
        settings.reference_system = srs.clone();
        Ok(())
    }

    /// Record the versioning workspace in use.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the metadata cannot be
    /// written.
    pub fn set_workspace(&self, workspace: Option<&str>) -> Result<(), SqliteStoreError> {
        let mut settings = self.settings.lock();
        match workspace {
            Some(name) => self.put_metadata("workspace", name)?,
            None => self.execute(
                "clear the workspace",
                "DELETE FROM metadata WHERE name = 'workspace'",
            )?,
        }
        settings.workspace = workspace.map(str::to_owned);
        Ok(())
    }

    /// Insert one feature under its own key.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError`] when the feature cannot be encoded or a
    /// feature with the same key or external id exists.
    pub fn insert(&self, feature: &Feature) -> Result<(), SqliteStoreError> {
        let body = serde_json::to_string(feature).map_err(|source| SqliteStoreError::Encode {
            external_id: feature.external_id.clone(),
            source,
        })?;
        let min = feature.envelope.min();
        let max = feature.envelope.max();
        let connection = self.connection.lock();
        connection
            .execute(
                "INSERT INTO features (key, external_id, type_id, min_x, min_y, max_x, max_y, body)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    feature.key.get(),
                    feature.external_id.as_str(),
                    i64::from(feature.type_id.get()),
                    min.x,
                    min.y,
                    max.x,
                    max.y,
                    body
                ],
            )
            .map_err(|source| SqliteStoreError::Statement {
                operation: "insert a feature",
                source,
            })?;
        self.next_key
            .fetch_max(feature.key.get().saturating_add(1), Ordering::AcqRel);
        Ok(())
    }

    /// Number of stored features.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the count fails.
    pub fn feature_count(&self) -> Result<u64, SqliteStoreError> {
        let count: i64 = self
            .connection
            .lock()
            .query_row("SELECT COUNT(*) FROM features", [], |row| row.get(0))
            .map_err(|source| SqliteStoreError::Statement {
                operation: "count features",
                source,
            })?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    /// Look up a feature by external id.
    ///
    /// # Errors
    /// Returns [`DatabaseError`] when the query fails or the row is invalid.
    pub fn feature_by_id(&self, external_id: &ExternalId) -> Result<Option<Feature>, DatabaseError> {
        let found: Option<(i64, String)> = self
            .connection
            .lock()
            .query_row(
                "SELECT key, body FROM features WHERE external_id = ?1",
                [external_id.as_str()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(query_error("look up a feature"))?;
        found
            .map(|(key, body)| decode_feature(key, &body))
            .transpose()
    }

    /// Links recorded for the feature `source`, in insertion order.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the query fails.
    pub fn links_from(&self, source: InternalKey) -> Result<Vec<StoredLink>, SqliteStoreError> {
        let statement_error = |source| SqliteStoreError::Statement {
            operation: "read feature links",
            source,
        };
        let connection = self.connection.lock();
        let mut statement = connection
            .prepare(
                "SELECT kind, target_key, target_id, role FROM feature_links
                 WHERE source_key = ?1 ORDER BY rowid",
            )
            .map_err(statement_error)?;
        let rows = statement
            .query_map([source.get()], |row| {
                Ok(StoredLink {
                    kind: row.get(0)?,
                    target_key: InternalKey::new(row.get(1)?),
                    target: row.get(2)?,
                    role: row.get(3)?,
                })
            })
            .map_err(statement_error)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(statement_error)
    }

    /// Stored texture image of `owner` named `name`.
    ///
    /// # Errors
    /// Returns [`SqliteStoreError::Statement`] when the query fails.
    pub fn texture_image(
        &self,
        owner: InternalKey,
        name: &str,
    ) -> Result<Option<Vec<u8>>, SqliteStoreError> {
        self.connection
            .lock()
            .query_row(
                "SELECT data FROM texture_images WHERE owner_key = ?1 AND name = ?2",
                params![owner.get(), name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| SqliteStoreError::Statement {
                operation: "read a texture image",
                source,
            })
    }

    fn execute(&self, operation: &'static str, sql: &str) -> Result<(), SqliteStoreError> {
        self.connection
            .lock()
            .execute_batch(sql)
            .map_err(|source| SqliteStoreError::Statement { operation, source })
    }

    fn put_metadata(&self, name: &str, value: &str) -> Result<(), SqliteStoreError> {
        self.connection
            .lock()
            .execute(
                "INSERT INTO metadata (name, value) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET value = excluded.value",
                params![name, value],
            )
            .map(drop)
            .map_err(|source| SqliteStoreError::Statement {
                operation: "write metadata",
                source,
            })
    }

    fn select_page(
        &self,
        after: i64,
        bounds: Option<Rect<f64>>,
    ) -> Result<Vec<(i64, String)>, DatabaseError> {
        let connection = self.connection.lock();
        let limit = i64::try_from(SELECT_PAGE).unwrap_or(i64::MAX);
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(i64, String)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows = if let Some(rect) = bounds {
            let mut statement = connection
                .prepare_cached(
                    "SELECT key, body FROM features
                     WHERE key > ?1 AND max_x >= ?2 AND min_x <= ?3 AND max_y >= ?4 AND min_y <= ?5
                     ORDER BY key LIMIT ?6",
                )
                .map_err(query_error("prepare a bounded selection"))?;
            let mapped = statement
                .query_map(
                    params![
                        after,
                        rect.min().x,
                        rect.max().x,
                        rect.min().y,
                        rect.max().y,
                        limit
                    ],
                    map_row,
                )
                .map_err(query_error("run a bounded selection"))?;
            mapped.collect::<Result<Vec<_>, _>>()
        } else {
            let mut statement = connection
                .prepare_cached("SELECT key, body FROM features WHERE key > ?1 ORDER BY key LIMIT ?2")
                .map_err(query_error("prepare a selection"))?;
            let mapped = statement
                .query_map(params![after, limit], map_row)
                .map_err(query_error("run a selection"))?;
            mapped.collect::<Result<Vec<_>, _>>()
        };
        rows.map_err(query_error("read selected rows"))
    }
}

fn query_error(message: &'static str) -> impl Fn(rusqlite::Error) -> DatabaseError {
    move |source| DatabaseError::Query {
        message: message.to_owned(),
        source: Box::new(source),
    }
}

fn decode_feature(key: i64, body: &str) -> Result<Feature, DatabaseError> {
    let mut feature: Feature =
        serde_json::from_str(body).map_err(|err| DatabaseError::InvalidRow {
            key,
            message: err.to_string(),
        })?;
    feature.key = InternalKey::new(key);
    Ok(feature)
}

fn run_schema_step(
    transaction: &Transaction<'_>,
    step: &'static str,
    sql: &str,
) -> Result<(), SqliteStoreError> {
    transaction
        .execute_batch(sql)
        .map_err(|source| SqliteStoreError::Schema { step, source })
}

fn initialise_schema(connection: &mut Connection) -> Result<(), SqliteStoreError> {
    let transaction = connection
        .transaction()
        .map_err(|source| SqliteStoreError::Schema {
            step: "begin schema transaction",
            source,
        })?;
    run_schema_step(
        &transaction,
        "create features",
        "CREATE TABLE IF NOT EXISTS features (
            key INTEGER PRIMARY KEY,
            external_id TEXT NOT NULL UNIQUE CHECK (length(trim(external_id)) > 0),
            type_id INTEGER NOT NULL,
            min_x REAL NOT NULL,
            min_y REAL NOT NULL,
            max_x REAL NOT NULL,
            max_y REAL NOT NULL,
            body TEXT NOT NULL
        )",
    )?;
    run_schema_step(
        &transaction,
        "create feature_links",
        "CREATE TABLE IF NOT EXISTS feature_links (
            source_key INTEGER NOT NULL,
            target_key INTEGER NOT NULL,
            target_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            role TEXT
        )",
    )?;
    run_schema_step(
        &transaction,
        "create texture_images",
        "CREATE TABLE IF NOT EXISTS texture_images (
            owner_key INTEGER NOT NULL,
            name TEXT NOT NULL,
            data BLOB NOT NULL,
            PRIMARY KEY (owner_key, name)
        ) WITHOUT ROWID",
    )?;
    run_schema_step(
        &transaction,
        "create metadata",
        "CREATE TABLE IF NOT EXISTS metadata (
            name TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID",
    )?;
    run_schema_step(
        &transaction,
        "index feature_links",
        "CREATE INDEX IF NOT EXISTS feature_links_source_idx ON feature_links(source_key)",
    )?;
    // A fresh database starts with its spatial index active.
    let fresh: bool = transaction
        .query_row(
            "SELECT NOT EXISTS (SELECT 1 FROM metadata WHERE name = 'initialised')",
            [],
            |row| row.get(0),
        )
        .map_err(|source| SqliteStoreError::Schema {
            step: "detect a fresh database",
            source,
        })?;
    if fresh {
        run_schema_step(
            &transaction,
            "create the spatial index",
            &format!(
                "CREATE INDEX IF NOT EXISTS {ENVELOPE_INDEX} ON features(min_x, max_x, min_y, max_y);
                 INSERT INTO metadata (name, value) VALUES ('initialised', '1');"
            ),
        )?;
    }
    transaction
        .commit()
        .map_err(|source| SqliteStoreError::Schema {
            step: "commit schema transaction",
            source,
        })
}

fn load_settings(connection: &Connection) -> Result<Settings, SqliteStoreError> {
    let read = |name: &str| -> Result<Option<String>, SqliteStoreError> {
        connection
            .query_row(
                "SELECT value FROM metadata WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
            .map_err(|source| SqliteStoreError::Statement {
                operation: "read metadata",
                source,
            })
    };
    let srid = read("srid")?
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or_default();
    let is_3d = read("is_3d")?.is_some_and(|value| value == "1");
    let name = read("srs_name")?.unwrap_or_default();
    Ok(Settings {
        reference_system: ReferenceSystem::new(srid, is_3d, name),
        workspace: read("workspace")?,
    })
}

const fn kind_name(kind: ReferenceKind) -> &'static str {
    match kind {
        ReferenceKind::GroupMember => "group_member",
        ReferenceKind::GroupParent => "group_parent",
        ReferenceKind::FeatureLink => "feature_link",
        ReferenceKind::TextureBinding => "texture_binding",
    }
}

struct PagedRows<'a> {
    store: &'a SqliteFeatureStore,
    predicate: Predicate,
    bounds: Option<Rect<f64>>,
    after: i64,
    buffer: VecDeque<Result<Feature, DatabaseError>>,
    exhausted: bool,
}

impl PagedRows<'_> {
    fn fill(&mut self) -> Result<(), DatabaseError> {
        let rows = self.store.select_page(self.after, self.bounds)?;
        if rows.len() < SELECT_PAGE {
            self.exhausted = true;
        }
        for (key, body) in rows {
            self.after = key;
            match decode_feature(key, &body) {
                Ok(feature) if self.predicate.matches(&feature) => {
                    self.buffer.push_back(Ok(feature));
                }
                Ok(_) => {}
                Err(err) => self.buffer.push_back(Err(err)),
            }
        }
        Ok(())
    }
}

impl Iterator for PagedRows<'_> {
    type Item = Result<Feature, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(item);
            }
            if self.exhausted {
                return None;
            }
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
    }
}

impl DatabaseAdapter for SqliteFeatureStore {
    fn spatial_index_enabled(&self) -> Result<bool, DatabaseError> {
        self.connection
            .lock()
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'index' AND name = ?1)",
                [ENVELOPE_INDEX],
                |row| row.get(0),
            )
            .map_err(query_error("check the spatial index"))
    }

    fn reference_system(&self) -> ReferenceSystem {
        self.settings.lock().reference_system.clone()
    }

    fn workspace(&self) -> Option<String> {
        self.settings.lock().workspace.clone()
    }

    fn count(&self, predicate: &Predicate) -> Result<u64, DatabaseError> {
        self.select(predicate)?
            .try_fold(0_u64, |count, row| row.map(|_| count.saturating_add(1)))
    }

    fn select(&self, predicate: &Predicate) -> Result<FeatureRows<'_>, DatabaseError> {
        debug!("selecting features matching {predicate:?}");
        Ok(Box::new(PagedRows {
            store: self,
            predicate: predicate.clone(),
            bounds: predicate.spatial_bounds(),
            after: i64::MIN,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }
}

fn sink_error(err: SqliteStoreError) -> WriteError {
    WriteError::Sink {
        source: Box::new(err),
    }
}

impl FeatureWriter for SqliteFeatureStore {
    fn write(&self, feature: &Feature) -> Result<(), WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }
        self.insert(feature).map_err(sink_error)
    }

    fn apply(&self, reference: &ResolvedReference) -> Result<(), WriteError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(WriteError::Closed);
        }
        self.connection
            .lock()
            .execute(
                "INSERT INTO feature_links (source_key, target_key, target_id, kind, role)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    reference.source.get(),
                    reference.target_key.get(),
                    reference.target.as_str(),
                    kind_name(reference.kind),
                    reference.role.as_deref()
                ],
            )
            .map(drop)
            .map_err(|source| {
                sink_error(SqliteStoreError::Statement {
                    operation: "insert a feature link",
                    source,
                })
            })
    }

    fn close(&self) -> Result<(), WriteError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("feature database sink closed");
        }
        Ok(())
    }
}

impl KeyAllocator for SqliteFeatureStore {
    fn next_key(&self) -> Result<InternalKey, DatabaseError> {
        let key = self.next_key.fetch_add(1, Ordering::AcqRel);
        if key == i64::MAX {
            return Err(DatabaseError::Query {
                message: "key sequence exhausted".to_owned(),
                source: "no keys left".into(),
            });
        }
        Ok(InternalKey::new(key))
    }
}

impl PayloadStore for SqliteFeatureStore {
    fn store(&self, owner: InternalKey, name: &str, bytes: &[u8]) -> Result<(), PayloadError> {
        let store_error = |source: rusqlite::Error| PayloadError::Store {
            name: name.to_owned(),
            source: Box::new(source),
        };
        let mut connection = self.connection.lock();
        let transaction = connection.transaction().map_err(store_error)?;
        transaction
            .execute(
                "INSERT OR REPLACE INTO texture_images (owner_key, name, data) VALUES (?1, ?2, ?3)",
                params![owner.get(), name, bytes],
            )
            .map_err(store_error)?;
        transaction.commit().map_err(store_error)
    }
}

#[cfg(test)]
mod tests;
