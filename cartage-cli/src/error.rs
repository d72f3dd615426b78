//! Error types emitted by the Cartage CLI.
//!
//! Keep this error type reasonably small, as many CLI helpers return
//! `Result<_, CliError>` and the workspace enables `clippy::result_large_err`.

use std::sync::Arc;

use camino::Utf8PathBuf;
use cartage_core::PayloadError;
use cartage_data::SqliteStoreError;
use cartage_engine::TransferError;
use thiserror::Error;

/// Errors emitted by the Cartage CLI.
#[derive(Debug, Error)]
pub enum CliError {
    /// Provided arguments failed Clap validation.
    #[error(transparent)]
    ArgumentParsing(#[from] clap::Error),
    /// Configuration layering failed (files, env, CLI).
    #[error("failed to load configuration: {0}")]
    Configuration(#[from] Arc<ortho_config::OrthoError>),
    /// A required option is missing after configuration merging.
    #[error("missing {field} (set --{field} or {env})")]
    MissingArgument {
        /// Flag name.
        field: &'static str,
        /// Environment variable carrying the same option.
        env: &'static str,
    },
    /// An option was set but could not be interpreted.
    #[error("invalid --{field} value {value:?}: {reason}")]
    InvalidArgument {
        /// Flag name.
        field: &'static str,
        /// Raw value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },
    /// A referenced input path does not exist on disk.
    #[error("{field} path {path:?} does not exist")]
    MissingSourceFile {
        /// Flag name.
        field: &'static str,
        /// Missing path.
        path: Utf8PathBuf,
    },
    /// A referenced input path exists but is not a file.
    #[error("{field} path {path:?} exists but is not a file")]
    SourcePathNotFile {
        /// Flag name.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
    },
    /// A referenced input path could not be inspected due to an IO error.
    #[error("failed to inspect {field} path {path:?}: {source}")]
    InspectSourcePath {
        /// Flag name.
        field: &'static str,
        /// Offending path.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Opening the feature database failed.
    #[error("failed to open feature database {path:?}: {source}")]
    OpenDatabase {
        /// Database location.
        path: Utf8PathBuf,
        /// Store error.
        #[source]
        source: Box<SqliteStoreError>,
    },
    /// Opening the JSON-lines input failed.
    #[error("failed to open input {path:?}: {source}")]
    OpenInput {
        /// Input location.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Building the envelope index after an import failed.
    #[error("failed to write spatial index to {path:?}: {source}")]
    WriteSpatialIndex {
        /// Database location.
        path: Utf8PathBuf,
        /// Store error.
        #[source]
        source: Box<SqliteStoreError>,
    },
    /// The remote payload client could not be built.
    #[error("failed to build the remote payload client: {0}")]
    BuildFetcher(#[source] PayloadError),
    /// The transfer session failed.
    #[error(transparent)]
    Transfer(#[from] TransferError),
}
