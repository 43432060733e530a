//! Unified error type for the engine
//!
//! Errors fall into four groups:
//! - configuration mistakes in how a view or loader was built, never retried
//! - policy errors such as OR composition that was not enabled for the call
//! - invalid request input (filter values, cursors, arguments)
//! - database and transaction failures surfaced by the executor

use thiserror::Error;

/// Error type for every engine operation
#[derive(Error, Debug)]
pub enum EngineError {
    /// Builder misconfiguration
    #[error("Configuration error: {0}")]
    Config(String),

    /// A name that must be unique was registered twice
    #[error("{kind} with name {name} already exists")]
    DuplicateName { kind: &'static str, name: String },

    /// A load was attempted without an executor
    #[error("Database is not set. Please set the database by calling options({{ db: db }})")]
    MissingDatabase,

    /// Explicit grouping combined with aggregate selection
    #[error("Cannot specify groupBy when selecting aggregates")]
    GroupByConflict,

    /// A virtual field was selected without the columns it reads
    #[error("Virtual field {field} requires column {dependency} to be selected")]
    MissingDependency { field: String, dependency: String },

    /// OR composition requested on a call that did not enable it
    #[error("OR filters are disabled. Pass or_enabled to allow them")]
    OrDisabled,

    /// A filter value did not have the shape its interpreter expects
    #[error("Invalid value for filter {filter}: {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// Invalid load arguments
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A cursor that could not be decoded or does not match the ordering
    #[error("Invalid cursor: {0}")]
    InvalidCursor(String),

    /// Table alias lookup for an alias that was never declared
    #[error("Unknown table alias: {0}")]
    UnknownAlias(String),

    /// A batched run whose confirmation callback declined the results
    #[error("Confirmation failed")]
    ConfirmationRejected,

    /// Database error reported by the executor
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

impl EngineError {
    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid filter error
    pub fn invalid_filter(filter: &str, reason: impl Into<String>) -> Self {
        Self::InvalidFilter {
            filter: filter.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a duplicate name error
    pub fn duplicate(kind: &'static str, name: &str) -> Self {
        Self::DuplicateName {
            kind,
            name: name.to_string(),
        }
    }

    /// Errors caused by how a view, loader or CTE chain was assembled
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::DuplicateName { .. }
                | Self::MissingDatabase
                | Self::GroupByConflict
                | Self::MissingDependency { .. }
                | Self::UnknownAlias(_)
        )
    }

    /// Errors the caller can recover from by changing call options
    pub fn is_policy(&self) -> bool {
        matches!(self, Self::OrDisabled)
    }

    /// Check if this is a connection-related error that might be transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            ),
            _ => false,
        }
    }
}
