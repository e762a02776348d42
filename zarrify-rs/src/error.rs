//! Error type shared by every stage of the conversion.
//!
//! Fatal conditions (missing or ambiguous input folders, unreadable stores) bubble
//! up to `main`. Per-file and per-quantity failures are caught by the caller and
//! logged so a long conversion keeps going.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("array store error: {0}")]
    Store(#[source] Box<dyn std::error::Error>),

    #[error("cannot decode {path}: {message}")]
    Mat { path: PathBuf, message: String },

    #[error("shape error: {0}")]
    Shape(String),

    #[error("cannot format {quantity}: {message}")]
    Record { quantity: String, message: String },

    #[error("missing input: {0}")]
    MissingInput(String),

    #[error("ambiguous input: {0}")]
    AmbiguousInput(String),

    #[error("cannot decode image {path}: {message}")]
    Image { path: PathBuf, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

impl Error {
    /// Wrap any zarrs error (storage, array or group creation, codec).
    pub fn store<E: std::error::Error + 'static>(err: E) -> Self {
        Error::Store(Box::new(err))
    }

    pub fn record(quantity: &str, message: impl Into<String>) -> Self {
        Error::Record {
            quantity: quantity.to_string(),
            message: message.into(),
        }
    }
}
