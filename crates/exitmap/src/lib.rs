//! A scanner for the Tor network's exit relays.
//!
//! exitmap drives a local Tor client over its control port: it selects
//! exit relays from the consensus, builds one two-hop circuit per
//! relay, pins each probe's streams to its circuit, and runs a
//! pluggable probe module against every exit.  Outcomes land as one
//! JSON record per relay, plus aggregate statistics.
//!
//! The crate is organized the way the scan flows:
//!
//! * [`consensus`], [`policy`], [`geoip`], [`selector`] — figure out
//!   *which* exits to scan;
//! * [`launch`], [`scan`] — bring up the client and drive the run;
//! * [`reactor`], [`attacher`], [`stats`], [`worker`], [`socksio`] —
//!   the concurrent core: build circuits, pair streams to them, run
//!   probes, account for everything;
//! * [`modules`] — the probes themselves;
//! * [`sink`] — where results go.

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
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::uninlined_format_args)]
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

pub mod attacher;
pub mod config;
pub mod consensus;
pub mod err;
pub mod geoip;
pub mod launch;
pub mod modules;
pub mod policy;
pub mod reactor;
pub mod scan;
pub mod selector;
pub mod sink;
pub mod socksio;
pub mod stats;
pub mod worker;

pub use config::Args;
pub use err::{Error, Result};
pub use scan::run;
