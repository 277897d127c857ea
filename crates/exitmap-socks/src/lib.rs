//! Client-side encoding and decoding for the SOCKS5 protocol, as
//! extended in Tor.
//!
//! In addition to the standard CONNECT command, Tor's SOCKS port accepts
//! a RESOLVE command (0xF0) that performs a remote hostname lookup over
//! the attached circuit and returns the resolved address in the reply.
//! The exit-relay scanner uses both: RESOLVE for DNS probes and CONNECT
//! for TCP probes.
//!
//! This crate is deliberately free of I/O: it produces request buffers
//! and interprets reply buffers, and the caller owns the socket.  Partial
//! input is reported as [`Error::Truncated`], in which case the caller
//! should read more bytes and retry.

// @@ begin lint list maintained by maint/add_warning @@
#![cfg_attr(not(ci_arti_stable), allow(renamed_and_removed_lints))]
#![cfg_attr(not(ci_arti_nightly), allow(unknown_lints))]
#![deny(missing_docs)]
#![warn(noop_method_call)]
#![deny(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![deny(clippy::missing_panics_doc)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod err;

pub use err::Error;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// The only SOCKS version we speak.
const SOCKS_VERSION: u8 = 5;

/// Method code for "no authentication required".
const NO_AUTHENTICATION: u8 = 0x00;

/// Method code for "no acceptable methods".
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// A SOCKS command that Tor's SOCKS port will accept from us.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksCmd {
    /// Open a TCP connection to the target.
    Connect,
    /// Tor extension: resolve a hostname over the attached circuit.
    Resolve,
}

impl SocksCmd {
    /// Return the wire representation of this command.
    fn code(self) -> u8 {
        match self {
            SocksCmd::Connect => 0x01,
            SocksCmd::Resolve => 0xF0,
        }
    }
}

/// The status code from a SOCKS5 reply.
///
/// Every non-success code corresponds to a fixed status token that the
/// scanner records in its per-relay results; downstream tooling relies on
/// these tokens being stable.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SocksStatus {
    /// The request succeeded.
    Succeeded,
    /// General SOCKS server failure.
    GeneralFailure,
    /// Connection not allowed by the server's ruleset.
    NotAllowed,
    /// The network was unreachable.
    NetworkUnreachable,
    /// The host was unreachable.
    ///
    /// For RESOLVE requests, Tor uses this code to report a failed
    /// lookup (including NXDOMAIN).
    HostUnreachable,
    /// The connection was refused by the destination.
    ConnectionRefused,
    /// The TTL on the request expired.
    TtlExpired,
    /// The command is not supported.
    CommandNotSupported,
    /// The address type is not supported.
    AddressTypeNotSupported,
    /// Some other, unrecognized status code.
    Unrecognized(u8),
}

impl SocksStatus {
    /// Build a status from its wire representation.
    fn from_code(code: u8) -> Self {
        match code {
            0 => SocksStatus::Succeeded,
            1 => SocksStatus::GeneralFailure,
            2 => SocksStatus::NotAllowed,
            3 => SocksStatus::NetworkUnreachable,
            4 => SocksStatus::HostUnreachable,
            5 => SocksStatus::ConnectionRefused,
            6 => SocksStatus::TtlExpired,
            7 => SocksStatus::CommandNotSupported,
            8 => SocksStatus::AddressTypeNotSupported,
            other => SocksStatus::Unrecognized(other),
        }
    }

    /// Return the stable status token for this code.
    ///
    /// Success has no token: successful operations are reported with the
    /// probe's own status vocabulary.
    pub fn token(&self) -> &'static str {
        match self {
            SocksStatus::Succeeded => "success",
            SocksStatus::GeneralFailure => "socks_general_failure",
            SocksStatus::NotAllowed => "socks_ruleset_blocked",
            SocksStatus::NetworkUnreachable => "network_unreachable",
            SocksStatus::HostUnreachable => "dns_fail",
            SocksStatus::ConnectionRefused => "connection_refused",
            SocksStatus::TtlExpired => "ttl_expired",
            SocksStatus::CommandNotSupported => "socks_command_unsupported",
            SocksStatus::AddressTypeNotSupported => "socks_address_unsupported",
            SocksStatus::Unrecognized(_) => "socks_general_failure",
        }
    }

    /// Return true if this is the success status.
    pub fn is_success(&self) -> bool {
        matches!(self, SocksStatus::Succeeded)
    }
}

/// A parsed SOCKS5 reply.
#[derive(Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub struct SocksReply {
    /// The server's status code.
    pub status: SocksStatus,
    /// The bound (or, for RESOLVE, resolved) address, if one was given.
    pub addr: Option<IpAddr>,
    /// The bound port.
    pub port: u16,
}

/// Return the method-negotiation message offering only "no authentication".
pub fn method_selection_msg() -> [u8; 3] {
    [SOCKS_VERSION, 1, NO_AUTHENTICATION]
}

/// Interpret the server's reply to our method negotiation.
pub fn check_method_reply(buf: &[u8]) -> Result<()> {
    if buf.len() < 2 {
        return Err(Error::Truncated);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::BadProtocolVersion(buf[0]));
    }
    match buf[1] {
        NO_AUTHENTICATION => Ok(()),
        NO_ACCEPTABLE_METHODS => Err(Error::NoAuthMethod),
        _ => Err(Error::Syntax("server chose a method we did not offer")),
    }
}

/// Encode a request for `cmd` against `host`:`port`.
///
/// The host is always sent in domain-name form, so that the proxy (not
/// this process) performs any name resolution.
pub fn request_msg(cmd: SocksCmd, host: &str, port: u16) -> Result<Vec<u8>> {
    let hostbytes = host.as_bytes();
    if hostbytes.len() > 255 {
        return Err(Error::HostTooLong(hostbytes.len()));
    }
    let mut buf = Vec::with_capacity(7 + hostbytes.len());
    buf.push(SOCKS_VERSION);
    buf.push(cmd.code());
    buf.push(0); // reserved
    buf.push(3); // address type: domain name
    buf.push(hostbytes.len() as u8);
    buf.extend_from_slice(hostbytes);
    buf.extend_from_slice(&port.to_be_bytes());
    Ok(buf)
}

/// Try to parse a SOCKS5 reply from the start of `buf`.
///
/// On success, return the reply and the number of bytes consumed.
/// Return [`Error::Truncated`] if the buffer does not yet hold a
/// complete reply.
pub fn parse_reply(buf: &[u8]) -> Result<(SocksReply, usize)> {
    if buf.len() < 4 {
        return Err(Error::Truncated);
    }
    if buf[0] != SOCKS_VERSION {
        return Err(Error::BadProtocolVersion(buf[0]));
    }
    let status = SocksStatus::from_code(buf[1]);
    // buf[2] is reserved; Tor sends 0 but we don't insist.
    let (addr, addrlen): (Option<IpAddr>, usize) = match buf[3] {
        1 => {
            if buf.len() < 4 + 4 + 2 {
                return Err(Error::Truncated);
            }
            let octets: [u8; 4] = buf[4..8].try_into().map_err(|_| Error::Truncated)?;
            (Some(IpAddr::V4(Ipv4Addr::from(octets))), 4)
        }
        3 => {
            let n = usize::from(buf[4]);
            if buf.len() < 5 + n + 2 {
                return Err(Error::Truncated);
            }
            // A domain-name reply carries no address we can use for
            // correlation; report it as absent.
            (None, 1 + n)
        }
        4 => {
            if buf.len() < 4 + 16 + 2 {
                return Err(Error::Truncated);
            }
            let octets: [u8; 16] = buf[4..20].try_into().map_err(|_| Error::Truncated)?;
            (Some(IpAddr::V6(Ipv6Addr::from(octets))), 16)
        }
        _ => return Err(Error::Syntax("unrecognized address type in reply")),
    };
    let portpos = 4 + addrlen;
    let port = u16::from_be_bytes(
        buf[portpos..portpos + 2]
            .try_into()
            .map_err(|_| Error::Truncated)?,
    );
    Ok((SocksReply { status, addr, port }, portpos + 2))
}
