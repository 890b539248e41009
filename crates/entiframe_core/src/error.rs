//! Error types for entiframe core.

use crate::types::EntryId;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Result type for store client operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors reported by a store client.
///
/// These pass through the query and save pipelines unmodified.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    /// The addressed document or row does not exist.
    #[error("not found: {key} in {container}")]
    NotFound {
        /// Container or table name.
        container: String,
        /// Document id or key description.
        key: String,
    },

    /// A document or row with the same id already exists.
    #[error("conflict: {key} already exists in {container}")]
    Conflict {
        /// Container or table name.
        container: String,
        /// Document id or key description.
        key: String,
    },

    /// An if-match precondition did not hold.
    #[error("precondition failed for {key} in {container}")]
    PreconditionFailed {
        /// Container or table name.
        container: String,
        /// Document id.
        key: String,
    },

    /// The connection failed.
    #[error("connection error: {message}")]
    Connection {
        /// Description of the failure.
        message: String,
        /// Whether a retry might succeed.
        transient: bool,
    },

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// The store could not run the query it was given.
    #[error("invalid query: {message}")]
    InvalidQuery {
        /// Description of the problem.
        message: String,
    },

    /// Stored bytes could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] entiframe_codec::CodecError),
}

impl StoreError {
    /// Creates a connection error.
    pub fn connection(message: impl Into<String>, transient: bool) -> Self {
        Self::Connection {
            message: message.into(),
            transient,
        }
    }

    /// Creates an invalid query error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::InvalidQuery {
            message: message.into(),
        }
    }
}

/// Errors that can occur in entiframe core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// A query construct could not be mapped to the store query.
    #[error("translation of query over '{entity_type}' failed: {message}")]
    TranslationFailed {
        /// Entity type the query is rooted at.
        entity_type: String,
        /// What could not be translated.
        message: String,
    },

    /// A member chain did not resolve against the query's source.
    #[error("property path '{path}' cannot be bound to the query source")]
    UnboundPropertyPath {
        /// The dotted path as written.
        path: String,
    },

    /// The model does not support the requested operation.
    #[error("mapping error on '{entity_type}': {message}")]
    Mapping {
        /// Entity type involved.
        entity_type: String,
        /// Description of the problem.
        message: String,
    },

    /// A document root has no property mapped to `id`.
    #[error("entity type '{entity_type}' has no property mapped to 'id'")]
    MissingIdProperty {
        /// Entity type involved.
        entity_type: String,
    },

    /// The pending commands depend on each other through required foreign keys.
    #[error("unable to order commands, cycle through {entity_types:?}")]
    CommandOrderingCycle {
        /// Entity types on the cycle.
        entity_types: Vec<String>,
    },

    /// Store client error, passed through unchanged.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Optimistic concurrency check failed.
    #[error("concurrency conflict on {entries:?}: expected {expected} affected, got {actual}")]
    ConcurrencyConflict {
        /// The tracked entries whose write failed.
        entries: Vec<EntryId>,
        /// Rows or documents the command expected to affect.
        expected: u64,
        /// Rows or documents actually affected.
        actual: u64,
    },

    /// The store did not return a value it was expected to generate.
    #[error("store did not return generated value for {entity_type}.{property}")]
    GeneratedValueMissing {
        /// Entity type involved.
        entity_type: String,
        /// Property that should have been generated.
        property: String,
    },

    /// A row or document could not be shaped into an entity.
    #[error("materialization of '{entity_type}' failed: {message}")]
    Materialization {
        /// Entity type being materialized.
        entity_type: String,
        /// Description of the problem.
        message: String,
    },

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] entiframe_codec::CodecError),
}

impl CoreError {
    /// Creates a translation failure.
    pub fn translation_failed(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TranslationFailed {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Creates an unbound property path error.
    pub fn unbound_property_path(path: impl Into<String>) -> Self {
        Self::UnboundPropertyPath { path: path.into() }
    }

    /// Creates a mapping error.
    pub fn mapping(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mapping {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Creates a missing id property error.
    pub fn missing_id_property(entity_type: impl Into<String>) -> Self {
        Self::MissingIdProperty {
            entity_type: entity_type.into(),
        }
    }

    /// Creates a generated value missing error.
    pub fn generated_value_missing(
        entity_type: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self::GeneratedValueMissing {
            entity_type: entity_type.into(),
            property: property.into(),
        }
    }

    /// Creates a materialization error.
    pub fn materialization(entity_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Materialization {
            entity_type: entity_type.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a concurrency conflict.
    #[must_use]
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. })
    }
}
