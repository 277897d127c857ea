//! Declare the scanner's error type.

use std::path::PathBuf;
use thiserror::Error;

/// An error that aborts a scan.
///
/// Per-relay problems (circuit failures, probe errors) are never
/// reported through this type: they are recorded in the statistics and
/// result records, and the scan moves on.  Everything here is fatal and
/// maps to exit code 1.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Bad flags, unreadable input files, or inconsistent settings.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Exit selection yielded zero candidates.
    #[error("Exit selection yielded no exits but need at least one")]
    NoExitsSelected,

    /// We could not read a file from the Tor client's cache.
    #[error("Could not read {path:?}")]
    CacheIo {
        /// The file we tried to read.
        path: PathBuf,
        /// The underlying I/O problem.
        #[source]
        err: std::io::Error,
    },

    /// A directory failed our permission requirements.
    #[error("Insecure directory")]
    DirPermissions(#[from] fs_mistrust::Error),

    /// The Tor client could not be launched or bootstrapped.
    #[error("Could not launch Tor client: {0}")]
    Launch(String),

    /// A control-port operation failed fatally.
    #[error("Control-port failure")]
    Control(#[from] exitmap_control::Error),

    /// Some other I/O error.
    #[error("I/O error")]
    Io(#[from] std::io::Error),
}

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
