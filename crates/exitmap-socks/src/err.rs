//! Declare an error type for the exitmap-socks crate.

use thiserror::Error;

/// An error that occurs while encoding or decoding a SOCKS message.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The message was incomplete; more bytes are needed.
    ///
    /// This is not a fatal condition: the caller should read more data
    /// and try again.
    #[error("Message truncated; need to read more and retry")]
    Truncated,

    /// The peer spoke a SOCKS version we do not support.
    #[error("Unsupported SOCKS protocol version {0}")]
    BadProtocolVersion(u8),

    /// The proxy did not accept any authentication method we offered.
    #[error("Proxy rejected our authentication methods")]
    NoAuthMethod,

    /// The message violated the SOCKS protocol.
    #[error("SOCKS protocol syntax violation: {0}")]
    Syntax(&'static str),

    /// A hostname was too long to fit into a SOCKS request.
    #[error("Hostname of {0} bytes does not fit into a SOCKS request")]
    HostTooLong(usize),
}
