//! Error handling.

use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use displaydoc::Display;

pub type AlpenhornResult<T> = Result<T, AlpenhornError>;

/// An error.
#[derive(Debug, Display)]
pub enum AlpenhornError {
    /// Invalid archive path {path:?}: {reason}
    InvalidArchivePath { path: PathBuf, reason: &'static str },

    /// Invalid node name "{name}"
    InvalidNodeName { name: String },

    /// Hashing error: {0}
    HashError(super::hash::Error),

    /// I/O error: {error}.
    IoError { error: io::Error },
}

impl AlpenhornError {
    pub fn name(&self) -> &'static str {
        match self {
            Self::InvalidArchivePath { .. } => "InvalidArchivePath",
            Self::InvalidNodeName { .. } => "InvalidNodeName",
            Self::HashError(_) => "HashError",
            Self::IoError { .. } => "IoError",
        }
    }
}

impl StdError for AlpenhornError {}

impl From<io::Error> for AlpenhornError {
    fn from(error: io::Error) -> Self {
        Self::IoError { error }
    }
}

impl From<super::hash::Error> for AlpenhornError {
    fn from(error: super::hash::Error) -> Self {
        Self::HashError(error)
    }
}
