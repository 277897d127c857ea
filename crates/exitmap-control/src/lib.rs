//! Asynchronous client for the Tor control protocol, scoped to what an
//! exit-relay scanner needs.
//!
//! The scanner drives a local Tor client entirely over its control
//! port: it builds two-hop circuits with EXTENDCIRCUIT, leaves new
//! streams unattached, pairs them back up with ATTACHSTREAM, and
//! subscribes to CIRC and STREAM events to learn the outcome of each.
//! This crate provides that surface and nothing more.
//!
//! Structure: [`ControlConn`] opens and authenticates the connection;
//! [`ControlConn::launch`] spawns a reactor task that owns the socket's
//! read half, completes command replies in FIFO order, and forwards
//! typed [`ControlEvent`]s on a channel.  The [`ControlHandle`] is
//! cheaply cloneable and can be used from any task.

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

mod conn;
mod err;
mod events;
mod fp;
mod proto;

pub use conn::{ControlConn, ControlHandle};
pub use err::Error;
pub use events::{
    parse_event, CircEvent, CircStatus, CircuitId, ControlEvent, StreamEvent, StreamId,
    StreamStatus,
};
pub use fp::Fingerprint;
pub use proto::Reply;

/// A Result type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
