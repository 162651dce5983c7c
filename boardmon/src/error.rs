//! Common error types for boardmon.
//!
//! This module provides a centralized Error enum using thiserror. Hotplug
//! records that are merely incomplete are never errors; everything here is
//! something the caller has to decide about.

use std::io;

use thiserror::Error;

/// Main error type for boardmon operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Allocation failure, always propagated
    #[error("Out of memory")]
    Memory,

    /// An OS primitive failed unexpectedly
    #[error("{op} failed: {source}")]
    System {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The board or device does not currently exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid filter, argument or configuration value
    #[error("Invalid parameter: {0}")]
    Param(String),

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors outside of the monitoring primitives
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Raised by consumers to abort a dispatch pass
    #[error("Callback aborted: {0}")]
    Callback(String),
}

impl Error {
    /// Wrap an OS error from the named primitive.
    ///
    /// `ENOMEM` is reported as [`Error::Memory`] so callers see allocation
    /// failures the same way whether they came from us or from the OS.
    pub fn system(op: &'static str, source: io::Error) -> Self {
        if source.raw_os_error() == Some(rustix::io::Errno::NOMEM.raw_os_error()) {
            Error::Memory
        } else {
            Error::System { op, source }
        }
    }

    /// Adapter for `map_err`.
    pub(crate) fn os(op: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Self::system(op, source)
    }

    /// Adapter for `map_err` on rustix calls.
    pub(crate) fn errno(op: &'static str) -> impl FnOnce(rustix::io::Errno) -> Self {
        move |errno| Self::system(op, errno.into())
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
