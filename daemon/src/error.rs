//! Error handling.

use std::error::Error as StdError;

use anyhow::Error as AnyError;
use displaydoc::Display;

use alpenhorn::error::AlpenhornError;

pub type DaemonResult<T> = Result<T, DaemonError>;

/// An error.
#[derive(Debug, Display)]
pub enum DaemonError {
    /// Database error: {0}
    DatabaseError(AnyError),

    /// Data Index schema is version {found}, daemon requires {required}
    SchemaVersionMismatch { found: i32, required: i32 },

    /// The requested node does not exist.
    NoSuchNode,

    /// The requested group does not exist.
    NoSuchGroup,

    /// No I/O class "{name}"
    NoSuchIoClass { name: String },

    /// Unknown extension "{name}"
    UnknownExtension { name: String },

    /// Invalid I/O config: {0}
    InvalidIoConfig(AnyError),

    /// File registration conflict: {path}
    RegistrationConflict { path: String },

    /// Filesystem error: {0}
    FilesystemError(AnyError),

    /// Transfer error: {0}
    TransferError(AnyError),

    /// Error from the common components.
    AlpenhornError(AlpenhornError),
}

impl DaemonError {
    pub fn database_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }

    pub fn filesystem_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::FilesystemError(AnyError::new(error))
    }

    pub fn transfer_error(error: impl StdError + Send + Sync + 'static) -> Self {
        Self::TransferError(AnyError::new(error))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) => "DatabaseError",
            Self::SchemaVersionMismatch { .. } => "SchemaVersionMismatch",
            Self::NoSuchNode => "NoSuchNode",
            Self::NoSuchGroup => "NoSuchGroup",
            Self::NoSuchIoClass { .. } => "NoSuchIoClass",
            Self::UnknownExtension { .. } => "UnknownExtension",
            Self::InvalidIoConfig(_) => "InvalidIoConfig",
            Self::RegistrationConflict { .. } => "RegistrationConflict",
            Self::FilesystemError(_) => "FilesystemError",
            Self::TransferError(_) => "TransferError",
            Self::AlpenhornError(e) => e.name(),
        }
    }
}

impl StdError for DaemonError {}

impl From<AlpenhornError> for DaemonError {
    fn from(error: AlpenhornError) -> Self {
        Self::AlpenhornError(error)
    }
}

impl From<sea_orm::DbErr> for DaemonError {
    fn from(error: sea_orm::DbErr) -> Self {
        Self::DatabaseError(AnyError::new(error))
    }
}

impl From<std::io::Error> for DaemonError {
    fn from(error: std::io::Error) -> Self {
        Self::FilesystemError(AnyError::new(error))
    }
}
