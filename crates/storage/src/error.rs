//! Storage-layer errors: filesystem and format failures reading/writing
//! the on-disk artifacts spec.md §6 names. Distinct from
//! `esd_core::error::DriverError` — callers decide how a storage
//! failure maps onto the domain error taxonomy (usually `PrepareFailed`
//! or `Unknown`).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io { path: String, #[source] source: std::io::Error },

    #[error("malformed {what} at {path}: {reason}")]
    Format { what: &'static str, path: String, reason: String },
}

impl StorageError {
    pub(crate) fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        StorageError::Io { path: path.into(), source }
    }

    pub(crate) fn format(what: &'static str, path: impl Into<String>, reason: impl Into<String>) -> Self {
        StorageError::Format { what, path: path.into(), reason: reason.into() }
    }
}
