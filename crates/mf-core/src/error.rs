//! Unified error type for meshforge.
//!
//! All crates funnel their failures into [`Error`], which carries enough context
//! for API handlers to derive an HTTP status code via [`Error::http_status`].
//!
//! Stage-level tool failures are *not* errors: they travel as data
//! (`StageOutcome::Failure`) so the executor can decide retry versus terminal
//! failure. An [`Error`] escaping the executor means the infrastructure
//! (database, disk) misbehaved.

use std::fmt;

/// Why an upload was refused before a job was created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The declared extension is outside the supported set.
    UnsupportedExtension(String),
    /// The upload exceeds the configured size limit.
    TooLarge {
        /// Size of the upload in bytes.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rejection::UnsupportedExtension(ext) if ext.is_empty() => {
                write!(f, "unsupported extension: file has no extension")
            }
            Rejection::UnsupportedExtension(ext) => write!(f, "unsupported extension: .{ext}"),
            Rejection::TooLarge { size, limit } => {
                write!(f, "file too large: {size} bytes exceeds limit of {limit} bytes")
            }
        }
    }
}

/// Unified error type covering all failure modes in meshforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// An upload was refused at admission.
    #[error("Admission rejected: {0}")]
    AdmissionRejected(Rejection),

    /// The job exists but has not produced a result yet.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// The job succeeded but its result artifact has since been purged.
    #[error("Result expired: {0}")]
    Expired(String),

    /// A job state transition was attempted from the wrong state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The artifact store could not create, move or delete job files.
    #[error("Storage error: {0}")]
    Storage(String),

    /// An external tool could not be located or started.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// A pipeline could not be resolved or driven.
    #[error("Pipeline error [{step}]: {message}")]
    Pipeline {
        /// The pipeline step that failed.
        step: String,
        /// Human-readable error description.
        message: String,
    },

    /// Configuration could not be loaded or is inconsistent.
    #[error("Config error: {0}")]
    Config(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Map this error to an appropriate HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::Validation(_) => 400,
            Error::AdmissionRejected(Rejection::UnsupportedExtension(_)) => 400,
            Error::AdmissionRejected(Rejection::TooLarge { .. }) => 413,
            Error::NotReady(_) => 409,
            Error::Expired(_) => 410,
            Error::InvalidTransition(_) => 409,
            Error::Database { .. } => 500,
            Error::Io { .. } => 500,
            Error::Storage(_) => 500,
            Error::Tool { .. } => 502,
            Error::Pipeline { .. } => 500,
            Error::Config(_) => 500,
            Error::Internal(_) => 500,
        }
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(message: impl Into<String>) -> Self {
        Error::Storage(message.into())
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Pipeline`].
    pub fn pipeline(step: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Pipeline {
            step: step.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from the artifact store or the filesystem.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::Io { .. })
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
