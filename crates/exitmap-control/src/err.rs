//! Declare an error type for the exitmap-control crate.

use std::path::PathBuf;
use thiserror::Error;

/// An error returned while talking to a Tor client's control port.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An I/O error on the control connection.
    #[error("I/O error on control connection")]
    Io(#[from] std::io::Error),

    /// The control connection closed while we were waiting for a reply.
    #[error("Control connection closed unexpectedly")]
    ConnectionClosed,

    /// The controller rejected one of our commands.
    #[error("Controller rejected command: {code} {msg}")]
    Rejected {
        /// The status code of the rejection.
        code: u16,
        /// The text the controller sent along with the code.
        msg: String,
    },

    /// The controller sent a reply or event we could not make sense of.
    #[error("Control protocol violation: {0}")]
    Protocol(String),

    /// A string did not parse as a relay fingerprint.
    #[error("Not a valid relay fingerprint: {0:?}")]
    BadFingerprint(String),

    /// We could not read the authentication cookie the controller told
    /// us to use.
    #[error("Could not read control auth cookie at {path:?}")]
    CookieUnreadable {
        /// Location of the cookie file.
        path: PathBuf,
        /// The underlying I/O problem.
        #[source]
        err: std::io::Error,
    },

    /// The controller offered no authentication method we support.
    #[error("No supported authentication method (controller offered: {0})")]
    AuthUnsupported(String),
}
