//! Error types for Hubfile.
//!
//! This module provides a unified error type for all engine operations.
//! Admission failures carry the numeric response code that is put on the
//! wire when the same condition is reported to a remote peer.

use std::io;

use thiserror::Error;

/// A specialized `Result` type for Hubfile operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for Hubfile.
#[derive(Error, Debug)]
pub enum Error {
    /// File name failed sanitization (400)
    #[error("invalid name: {0:?}")]
    InvalidName(String),

    /// Directory failed sanitization (400)
    #[error("invalid dir: {0:?}")]
    InvalidDir(String),

    /// Resolved path escapes the base directory (400)
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Session id is not a canonical UUID (400)
    #[error("invalid session id: {0:?}")]
    InvalidSession(String),

    /// A required argument was missing or zero (400)
    #[error("{0} is required")]
    MissingArgument(&'static str),

    /// File or directory does not exist (404)
    #[error("not found: {0}")]
    NotFound(String),

    /// Destination exists and overwrite was not allowed (409)
    #[error("file already exists: {0}")]
    AlreadyExists(String),

    /// File exceeds the configured size limit (413)
    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge {
        /// Size of the file
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Content is not valid UTF-8 text (415)
    #[error("not text")]
    NotText,

    /// Concurrent session limit reached (429)
    #[error("too many sessions")]
    TooManySessions,

    /// No task with the given id
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// No pending offer with the given session id
    #[error("offer not found: {0}")]
    OfferNotFound(String),

    /// Local node or hub id has not been set
    #[error("identity not set")]
    IdentityNotSet,

    /// The underlying session failed to send a frame
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid protocol frame
    #[error("invalid protocol message: {0}")]
    ProtocolError(String),

    /// Configuration file error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Invalid configuration value
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidConfig {
        /// Configuration key
        key: String,
        /// Reason for invalidity
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal error (should not happen)
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns the wire response code for this error, if it has one.
    ///
    /// Codes mirror HTTP status semantics; `1` is reserved for success and
    /// is never returned here.
    #[must_use]
    pub const fn response_code(&self) -> Option<u16> {
        match self {
            Self::InvalidName(_)
            | Self::InvalidDir(_)
            | Self::InvalidPath(_)
            | Self::InvalidSession(_)
            | Self::MissingArgument(_) => Some(400),
            Self::NotFound(_) => Some(404),
            Self::AlreadyExists(_) => Some(409),
            Self::TooLarge { .. } => Some(413),
            Self::NotText => Some(415),
            Self::TooManySessions => Some(429),
            Self::Io(_) | Self::Internal(_) => Some(500),
            _ => None,
        }
    }
}
