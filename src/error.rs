//! Error types for record processing and the photon pipeline.
//!
//! All errors implement `std::error::Error` and carry structured context for
//! debugging and recovery guidance. Each error also maps onto a severity level
//! and a stable numeric code, which is what gets written into exception records
//! posted to downstream queues.
//!
//! ## Error Categories
//!
//! - **Record Errors**: unknown schemas, duplicate definitions, bad field access, short buffers
//! - **Fetch Errors**: dataset reads that time out or return invalid data
//! - **Subset Errors**: spatial filters that exclude every photon (non-fatal)
//! - **Queue Errors**: timeouts, full queues and failed posts on the message bus
//! - **Configuration Errors**: invalid parameters or YAML
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use trackline::TracklineError;
//!
//! let error = TracklineError::queue_timeout("atl03q");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```
//!
//! ## Helper Constructors
//!
//! ```rust
//! use trackline::TracklineError;
//!
//! let missing = TracklineError::schema_not_found("atl06rec");
//! let field = TracklineError::invalid_field("atl06rec.elevation", "h_mean[3]");
//! let short = TracklineError::buffer_too_small(64, 12);
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T, E = TracklineError> = std::result::Result<T, E>;

/// Stable numeric codes written into exception records.
pub mod codes {
    pub const INFO: i32 = 0;
    pub const ERROR: i32 = -1;
    pub const TIMEOUT: i32 = -2;
    pub const RESOURCE_DOES_NOT_EXIST: i32 = -3;
    pub const EMPTY_SUBSET: i32 = -4;
}

/// Severity attached to an error when it is reported downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub enum Severity {
    Debug = 0,
    Info = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TracklineError {
    #[error("Record definition '{name}' not found")]
    SchemaNotFound { name: String },

    #[error("Record definition '{name}' already exists")]
    DuplicateDefinition { name: String },

    #[error("Invalid record definition '{name}': {reason}")]
    InvalidDefinition { name: String, reason: String },

    #[error("Invalid access of field '{field}' in record '{record}'")]
    InvalidFieldAccess { record: String, field: String },

    #[error("Buffer too small: needed {needed} bytes, have {actual}")]
    BufferTooSmall { needed: usize, actual: usize },

    #[error("Read of dataset '{dataset}' timed out after {duration:?}")]
    DatasetFetchTimeout { dataset: String, duration: Duration },

    #[error("Read of dataset '{dataset}' failed: {reason}")]
    DatasetFetchInvalid { dataset: String, reason: String },

    #[error("Empty spatial subset for {resource}")]
    EmptySpatialSubset { resource: String },

    #[error("Timed out waiting on queue '{queue}'")]
    QueueTimeout { queue: String },

    #[error("Queue '{queue}' is full")]
    QueueFull { queue: String },

    #[error("Failed to post to queue '{queue}': {reason}")]
    PostFailure { queue: String, reason: String },

    #[error("Invalid data in {context}: {details}")]
    InvalidData { context: String, details: String },

    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[error("File error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("YAML error: {context}")]
    Yaml {
        context: String,
        #[source]
        source: serde_yaml_ng::Error,
    },

    #[cfg(feature = "arrow")]
    #[error("Arrow error: {context}")]
    Arrow {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl TracklineError {
    /// Returns whether this error is potentially recoverable through retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            TracklineError::QueueTimeout { .. } => true,
            TracklineError::DatasetFetchTimeout { .. } => true,
            TracklineError::QueueFull { .. } => true,
            TracklineError::PostFailure { .. } => false,
            TracklineError::SchemaNotFound { .. } => false,
            TracklineError::DuplicateDefinition { .. } => false,
            TracklineError::InvalidDefinition { .. } => false,
            TracklineError::InvalidFieldAccess { .. } => false,
            TracklineError::BufferTooSmall { .. } => false,
            TracklineError::DatasetFetchInvalid { .. } => false,
            TracklineError::EmptySpatialSubset { .. } => false,
            TracklineError::InvalidData { .. } => false,
            TracklineError::Config { .. } => false,
            TracklineError::File { .. } => false,
            TracklineError::Yaml { .. } => false,
            #[cfg(feature = "arrow")]
            TracklineError::Arrow { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            TracklineError::SchemaNotFound { .. } => vec![
                "Register the record definition before constructing records",
                "Check the record type name for typos",
            ],
            TracklineError::DuplicateDefinition { .. } => vec![
                "Register each record type once per registry",
                "Use a separate registry for isolated definitions",
            ],
            TracklineError::InvalidDefinition { .. } => vec![
                "Check field offsets against the record size",
                "Verify the id field is declared",
            ],
            TracklineError::InvalidFieldAccess { .. } => vec![
                "Check the field name and element index",
                "Use dotted names for nested records",
            ],
            TracklineError::BufferTooSmall { .. } => vec![
                "Verify the sender serialized the full record",
                "Check that both sides use the same record definition",
            ],
            TracklineError::DatasetFetchTimeout { .. } => vec![
                "Increase the read timeout",
                "Check availability of the dataset service",
            ],
            TracklineError::DatasetFetchInvalid { .. } => vec![
                "Verify the resource name and dataset path",
                "Check the granule is complete",
            ],
            TracklineError::EmptySpatialSubset { .. } => vec![
                "Widen the region of interest",
                "Check the polygon winding and coordinate order (lon, lat)",
            ],
            TracklineError::QueueTimeout { .. } => vec![
                "Retry the operation",
                "Check that downstream consumers are running",
            ],
            TracklineError::QueueFull { .. } => vec![
                "Retry once consumers have caught up",
                "Increase the queue depth",
            ],
            TracklineError::PostFailure { .. } => vec![
                "Check the queue has subscribers",
                "Verify message size limits",
            ],
            TracklineError::InvalidData { .. } => vec![
                "Verify source data integrity",
                "Check data ranges against product documentation",
            ],
            TracklineError::Config { .. } => vec![
                "Check parameter names and ranges",
                "Compare against the default parameters",
            ],
            TracklineError::File { .. } => vec![
                "Check file exists and is readable",
                "Check file permissions",
            ],
            TracklineError::Yaml { .. } => vec![
                "Validate the YAML syntax",
                "Check parameter names against the documented keys",
            ],
            #[cfg(feature = "arrow")]
            TracklineError::Arrow { .. } => vec![
                "Check column types against the record definition",
                "Verify the output path is writable",
            ],
        }
    }

    /// Severity used when reporting this error in an exception record.
    pub fn severity(&self) -> Severity {
        match self {
            TracklineError::EmptySpatialSubset { .. } => Severity::Debug,
            TracklineError::QueueTimeout { .. } | TracklineError::QueueFull { .. } => {
                Severity::Warning
            }
            TracklineError::InvalidFieldAccess { .. } => Severity::Error,
            TracklineError::BufferTooSmall { .. } => Severity::Error,
            TracklineError::SchemaNotFound { .. } => Severity::Error,
            TracklineError::DuplicateDefinition { .. } => Severity::Warning,
            TracklineError::PostFailure { .. } => Severity::Critical,
            _ => Severity::Critical,
        }
    }

    /// Machine-readable code used in exception records.
    pub fn code(&self) -> i32 {
        match self {
            TracklineError::DatasetFetchTimeout { .. }
            | TracklineError::QueueTimeout { .. }
            | TracklineError::QueueFull { .. } => codes::TIMEOUT,
            TracklineError::DatasetFetchInvalid { .. } | TracklineError::SchemaNotFound { .. } => {
                codes::RESOURCE_DOES_NOT_EXIST
            }
            TracklineError::EmptySpatialSubset { .. } => codes::EMPTY_SUBSET,
            _ => codes::ERROR,
        }
    }

    /// Helper constructor for unknown record types.
    pub fn schema_not_found(name: impl Into<String>) -> Self {
        TracklineError::SchemaNotFound { name: name.into() }
    }

    /// Helper constructor for invalid field access.
    pub fn invalid_field(record: impl Into<String>, field: impl Into<String>) -> Self {
        TracklineError::InvalidFieldAccess { record: record.into(), field: field.into() }
    }

    /// Helper constructor for short buffers.
    pub fn buffer_too_small(needed: usize, actual: usize) -> Self {
        TracklineError::BufferTooSmall { needed, actual }
    }

    /// Helper constructor for invalid definitions.
    pub fn invalid_definition(name: impl Into<String>, reason: impl Into<String>) -> Self {
        TracklineError::InvalidDefinition { name: name.into(), reason: reason.into() }
    }

    /// Helper constructor for queue timeouts.
    pub fn queue_timeout(queue: impl Into<String>) -> Self {
        TracklineError::QueueTimeout { queue: queue.into() }
    }

    /// Helper constructor for posts refused by a full queue.
    pub fn queue_full(queue: impl Into<String>) -> Self {
        TracklineError::QueueFull { queue: queue.into() }
    }

    /// Helper constructor for failed posts.
    pub fn post_failure(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        TracklineError::PostFailure { queue: queue.into(), reason: reason.into() }
    }

    /// Helper constructor for invalid data.
    pub fn invalid_data(context: impl Into<String>, details: impl Into<String>) -> Self {
        TracklineError::InvalidData { context: context.into(), details: details.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        TracklineError::Config { reason: reason.into() }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        TracklineError::File { path, source }
    }

    /// Helper constructor for Arrow and Parquet failures.
    #[cfg(feature = "arrow")]
    pub fn arrow(
        context: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        TracklineError::Arrow { context: context.into(), source: Box::new(source) }
    }
}

impl From<std::io::Error> for TracklineError {
    fn from(err: std::io::Error) -> Self {
        TracklineError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}
