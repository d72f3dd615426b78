//! The single error a transfer session surfaces to its caller.

use std::fmt;

use cartage_core::BoxError;
use thiserror::Error;

/// Classification of a [`TransferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A spatial filter was requested but the database has no spatial index.
    SpatialIndexesNotActivated,
    /// The requested reference system is incompatible with the database's.
    ReferenceSystemMismatch,
    /// The output path cannot be written.
    InvalidOutput,
    /// Session settings were rejected.
    Configuration,
    /// A pool started without any worker.
    NoWorkers,
    /// A cache table or id cache failed.
    Cache,
    /// Reading input or writing output failed.
    Io,
    /// The database adapter failed.
    Database,
    /// The session was aborted by a fatal interrupt.
    Aborted,
}

impl ErrorCode {
    /// Stable name of the code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SpatialIndexesNotActivated => "spatial_indexes_not_activated",
            Self::ReferenceSystemMismatch => "reference_system_mismatch",
            Self::InvalidOutput => "invalid_output",
            Self::Configuration => "configuration",
            Self::NoWorkers => "no_workers",
            Self::Cache => "cache",
            Self::Io => "io",
            Self::Database => "database",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a transfer session.
///
/// Carries a human-readable message, an optional [`ErrorCode`] and the root
/// cause when one is known.
///
/// # Examples
/// ```
/// use cartage_engine::{ErrorCode, TransferError};
///
/// let err = TransferError::new("the output file is a directory")
///     .with_code(ErrorCode::InvalidOutput);
/// assert_eq!(err.code(), Some(ErrorCode::InvalidOutput));
/// assert_eq!(err.to_string(), "the output file is a directory");
/// ```
#[derive(Debug, Error)]
#[error("{message}")]
pub struct TransferError {
    message: String,
    code: Option<ErrorCode>,
    #[source]
    cause: Option<BoxError>,
}

impl TransferError {
    /// Create an error with `message` only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            cause: None,
        }
    }

    /// Attach a classification.
    #[must_use]
    pub fn with_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the root cause.
    #[must_use]
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// Human-readable message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classification, if any.
    #[must_use]
    pub const fn code(&self) -> Option<ErrorCode> {
        self.code
    }

    pub(crate) fn coded(
        code: ErrorCode,
        message: impl Into<String>,
        cause: impl Into<BoxError>,
    ) -> Self {
        Self::new(message).with_code(code).with_cause(cause)
    }
}

/// Keeps the first error of a teardown sequence and logs the rest.
#[derive(Debug, Default)]
pub(crate) struct FirstError(Option<TransferError>);

impl FirstError {
    pub(crate) fn record(&mut self, err: TransferError) {
        if self.0.is_some() {
            log::error!("{err}");
        } else {
            self.0 = Some(err);
        }
    }

    pub(crate) fn check<E>(&mut self, result: Result<(), E>, wrap: impl FnOnce(E) -> TransferError) {
        if let Err(err) = result {
            self.record(wrap(err));
        }
    }

    pub(crate) const fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub(crate) fn into_result(self) -> Result<(), TransferError> {
        self.0.map_or(Ok(()), Err)
    }
}
