//! Choose which exit relays to scan.
//!
//! Selection starts from every running exit in the consensus and
//! narrows by the operator's filters (BadExit handling, country,
//! explicit fingerprints) and by exit-policy compatibility with the
//! scan's destinations.

use crate::consensus::{Consensus, RelayFlags};
use crate::err::{Error, Result};
use crate::geoip::{CountryCode, GeoipDb};
use crate::policy::ExitPolicy;
use exitmap_control::Fingerprint;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, info};

/// A resolved scan destination.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct Destination {
    /// The destination address.
    pub addr: Ipv4Addr,
    /// The destination port.
    pub port: u16,
}

/// For each selected exit, the subset of destinations its policy
/// accepts.
///
/// When the destination set is non-empty, so is every value in this
/// map.  A module that only issues resolves declares no destinations,
/// in which case policy filtering is skipped and the sets are empty.
pub type ExitDestinations = HashMap<Fingerprint, HashSet<Destination>>;

/// Which exits qualify, with respect to the BadExit flag.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ExitQuality {
    /// Exits without the BadExit flag (the default).
    GoodOnly,
    /// Only exits carrying the BadExit flag (`-b`).
    BadOnly,
    /// Everything (`-l`).
    All,
}

/// The operator's exit-selection criteria.
pub struct ExitFilter {
    /// BadExit handling.
    pub quality: ExitQuality,
    /// Restrict to one country, if set.
    pub country: Option<CountryCode>,
    /// Restrict to an explicit fingerprint list, if set.
    pub requested: Option<HashSet<Fingerprint>>,
}

impl ExitFilter {
    /// Does `flags` pass the BadExit criterion?
    fn quality_ok(&self, flags: RelayFlags) -> bool {
        match self.quality {
            ExitQuality::GoodOnly => !flags.contains(RelayFlags::BADEXIT),
            ExitQuality::BadOnly => flags.contains(RelayFlags::BADEXIT),
            ExitQuality::All => true,
        }
    }
}

/// Read a fingerprint-per-line file, as given with `-E`.
pub fn read_requested_exits(path: &Path) -> Result<HashSet<Fingerprint>> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| Error::Config(format!("could not read {:?}: {}", path, err)))?;
    let mut exits = HashSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fp = line
            .parse()
            .map_err(|_| Error::Config(format!("bad fingerprint in {:?}: {:?}", path, line)))?;
        exits.insert(fp);
    }
    Ok(exits)
}

/// Select the exits to scan.
///
/// Returns the map from chosen exit to the destinations its policy
/// accepts; fails with [`Error::NoExitsSelected`] when nothing is left.
pub fn select_exits(
    consensus: &Consensus,
    policies: &HashMap<Fingerprint, ExitPolicy>,
    filter: &ExitFilter,
    destinations: &HashSet<Destination>,
    geoip: Option<&GeoipDb>,
) -> Result<ExitDestinations> {
    let mut selected: ExitDestinations = HashMap::new();

    for relay in consensus.relays() {
        if !relay
            .flags
            .contains(RelayFlags::RUNNING | RelayFlags::EXIT)
        {
            continue;
        }
        if !filter.quality_ok(relay.flags) {
            continue;
        }
        if let Some(want) = filter.country {
            let got = geoip.and_then(|db| db.lookup(relay.address));
            if got != Some(want) {
                continue;
            }
        }
        if let Some(requested) = &filter.requested {
            if !requested.contains(&relay.fingerprint) {
                continue;
            }
        }

        if destinations.is_empty() {
            selected.insert(relay.fingerprint, HashSet::new());
            continue;
        }

        // A relay whose descriptor never made it into the cache gets
        // dropped here: we cannot verify its policy.
        let Some(policy) = policies.get(&relay.fingerprint) else {
            debug!(
                "No descriptor for {}; dropping it from selection.",
                relay.fingerprint
            );
            continue;
        };
        let reachable: HashSet<Destination> = destinations
            .iter()
            .filter(|d| policy.can_exit_to(d.addr, d.port))
            .copied()
            .collect();
        if !reachable.is_empty() {
            selected.insert(relay.fingerprint, reachable);
        }
    }

    if selected.is_empty() {
        return Err(Error::NoExitsSelected);
    }
    info!("Selected {} exit relays.", selected.len());
    Ok(selected)
}
