//! Error types for ID parsing.

use thiserror::Error;

/// Errors that can occur when parsing an ID.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdError {
    /// The input string was empty.
    #[error("id string is empty")]
    Empty,

    /// The UUID portion could not be parsed.
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),

    /// A derived name did not match the expected shape.
    #[error("invalid service name: {0}")]
    InvalidServiceName(String),
}
