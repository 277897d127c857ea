//! Load relay information from the Tor client's on-disk directory
//! cache.
//!
//! We read two files out of the data directory: `cached-consensus` (the
//! network-status document: one `r`/`s`/`w` line group per relay) and
//! `cached-descriptors` (server descriptors, which carry the full exit
//! policies that the consensus only summarizes).  Both are parsed
//! leniently: a relay we cannot make sense of is skipped with a
//! warning, and only a missing or unreadable file is fatal.

use crate::err::{Error, Result};
use crate::policy::ExitPolicy;
use base64ct::{Base64Unpadded, Encoding};
use bitflags::bitflags;
use exitmap_control::Fingerprint;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, warn};

bitflags! {
    /// The consensus flags the scanner cares about.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct RelayFlags: u16 {
        /// Suitable as an entry guard.
        const GUARD = 1 << 0;
        /// Permits exiting to at least some useful ports.
        const EXIT = 1 << 1;
        /// Flagged as a bad exit by the directory authorities.
        const BADEXIT = 1 << 2;
        /// Suitable for long-lived circuits.
        const STABLE = 1 << 3;
        /// Above the bandwidth cutoff.
        const FAST = 1 << 4;
        /// Currently reachable.
        const RUNNING = 1 << 5;
        /// Validly signed descriptor.
        const VALID = 1 << 6;
    }
}

impl RelayFlags {
    /// Map one consensus `s`-line token onto a flag, if we track it.
    fn from_token(token: &str) -> Option<RelayFlags> {
        Some(match token {
            "Guard" => RelayFlags::GUARD,
            "Exit" => RelayFlags::EXIT,
            "BadExit" => RelayFlags::BADEXIT,
            "Stable" => RelayFlags::STABLE,
            "Fast" => RelayFlags::FAST,
            "Running" => RelayFlags::RUNNING,
            "Valid" => RelayFlags::VALID,
            _ => return None,
        })
    }
}

/// One relay, as described by the consensus.
#[derive(Clone, Debug)]
pub struct RelayInfo {
    /// The relay's identity.
    pub fingerprint: Fingerprint,
    /// Its self-chosen nickname (not unique, display only).
    pub nickname: String,
    /// Its primary OR address.
    pub address: Ipv4Addr,
    /// Its OR port.
    pub or_port: u16,
    /// Its consensus flags.
    pub flags: RelayFlags,
    /// Advertised bandwidth from the `w` line, in kilobytes/s.
    pub bandwidth: u64,
    /// False if the authorities marked the bandwidth `Unmeasured`.
    pub measured: bool,
}

/// The consensus: every relay we know, keyed by fingerprint.
///
/// Immutable after loading; shared read-only across the scan.
pub struct Consensus {
    /// All parsed relays.
    relays: HashMap<Fingerprint, RelayInfo>,
}

impl Consensus {
    /// Load the consensus from `cached-consensus` in `tor_dir`.
    pub fn load(tor_dir: &Path) -> Result<Self> {
        let path = tor_dir.join("cached-consensus");
        let text = std::fs::read_to_string(&path).map_err(|err| Error::CacheIo { path, err })?;
        let consensus = Self::parse(&text);
        debug!("Loaded consensus with {} relays.", consensus.len());
        Ok(consensus)
    }

    /// Parse a consensus document.
    pub fn parse(text: &str) -> Self {
        let mut relays = HashMap::new();
        let mut current: Option<RelayInfo> = None;
        for line in text.lines() {
            if let Some(rest) = line.strip_prefix("r ") {
                if let Some(done) = current.take() {
                    relays.insert(done.fingerprint, done);
                }
                current = match parse_r_line(rest) {
                    Some(relay) => Some(relay),
                    None => {
                        warn!("Skipping unparseable consensus entry: {:?}", line);
                        None
                    }
                };
            } else if let Some(rest) = line.strip_prefix("s ") {
                if let Some(relay) = current.as_mut() {
                    for token in rest.split_ascii_whitespace() {
                        if let Some(flag) = RelayFlags::from_token(token) {
                            relay.flags |= flag;
                        }
                    }
                }
            } else if let Some(rest) = line.strip_prefix("w ") {
                if let Some(relay) = current.as_mut() {
                    for word in rest.split_ascii_whitespace() {
                        if let Some(bw) = word.strip_prefix("Bandwidth=") {
                            relay.bandwidth = bw.parse().unwrap_or(0);
                        } else if word == "Unmeasured=1" {
                            relay.measured = false;
                        }
                    }
                }
            }
        }
        if let Some(done) = current.take() {
            relays.insert(done.fingerprint, done);
        }
        Consensus { relays }
    }

    /// Number of relays.
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// True if no relays were parsed.
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Look up one relay.
    pub fn get(&self, fp: &Fingerprint) -> Option<&RelayInfo> {
        self.relays.get(fp)
    }

    /// Is this fingerprint listed?
    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.relays.contains_key(fp)
    }

    /// Iterate over all relays.
    pub fn relays(&self) -> impl Iterator<Item = &RelayInfo> {
        self.relays.values()
    }

    /// List the relays eligible as a randomly chosen first hop.
    ///
    /// With `reliable` set, restrict to measured guards with the
    /// Stable and Fast flags and at least 5 MB/s of advertised
    /// bandwidth; otherwise any running, valid relay qualifies.
    pub fn first_hop_candidates(&self, reliable: bool) -> Vec<Fingerprint> {
        /// Bandwidth floor for reliable first hops, in kilobytes/s.
        const RELIABLE_MIN_BW: u64 = 5000;
        let base = RelayFlags::RUNNING | RelayFlags::VALID;
        let reliable_flags = base | RelayFlags::GUARD | RelayFlags::STABLE | RelayFlags::FAST;
        self.relays
            .values()
            .filter(|r| {
                if reliable {
                    r.flags.contains(reliable_flags)
                        && !r.flags.contains(RelayFlags::BADEXIT)
                        && r.measured
                        && r.bandwidth >= RELIABLE_MIN_BW
                } else {
                    r.flags.contains(base)
                }
            })
            .map(|r| r.fingerprint)
            .collect()
    }
}

/// Parse the remainder of an `r` line into a relay with empty flags.
///
/// Layout: nickname, base64 identity, base64 digest, publication date,
/// publication time, address, OR port, dir port.
fn parse_r_line(rest: &str) -> Option<RelayInfo> {
    let words: Vec<&str> = rest.split_ascii_whitespace().collect();
    if words.len() < 8 {
        return None;
    }
    let identity = Base64Unpadded::decode_vec(words[1]).ok()?;
    let identity: [u8; 20] = identity.try_into().ok()?;
    Some(RelayInfo {
        fingerprint: Fingerprint::from_bytes(identity),
        nickname: words[0].to_owned(),
        address: words[5].parse().ok()?,
        or_port: words[6].parse().ok()?,
        flags: RelayFlags::default(),
        bandwidth: 0,
        measured: true,
    })
}

/// Load the full exit policies from `cached-descriptors` in `tor_dir`.
///
/// Returns a map from fingerprint to policy.  Relays whose descriptor
/// we cannot parse are simply absent, which later drops them from exit
/// selection.
pub fn load_exit_policies(tor_dir: &Path) -> Result<HashMap<Fingerprint, ExitPolicy>> {
    let path = tor_dir.join("cached-descriptors");
    let text = std::fs::read_to_string(&path).map_err(|err| Error::CacheIo { path, err })?;
    Ok(parse_descriptors(&text))
}

/// Parse a concatenation of server descriptors into exit policies.
pub fn parse_descriptors(text: &str) -> HashMap<Fingerprint, ExitPolicy> {
    let mut policies = HashMap::new();
    let mut fingerprint: Option<Fingerprint> = None;
    let mut policy = ExitPolicy::new();
    let mut flush = |fingerprint: &mut Option<Fingerprint>, policy: &mut ExitPolicy| {
        if let Some(fp) = fingerprint.take() {
            policies.insert(fp, std::mem::take(policy));
        } else if !policy.is_empty() {
            debug!("Dropping descriptor without a fingerprint line.");
            *policy = ExitPolicy::new();
        }
    };
    for line in text.lines() {
        // Old descriptors wrap some keywords in an "opt " prefix.
        let line = line.strip_prefix("opt ").unwrap_or(line);
        if line.starts_with("router ") {
            flush(&mut fingerprint, &mut policy);
        } else if let Some(rest) = line.strip_prefix("fingerprint ") {
            let joined: String = rest.split_ascii_whitespace().collect();
            match joined.parse() {
                Ok(fp) => fingerprint = Some(fp),
                Err(_) => warn!("Skipping descriptor with bad fingerprint: {:?}", rest),
            }
        } else if line.starts_with("accept ") || line.starts_with("reject ") {
            match line.parse() {
                Ok(rule) => policy.push(rule),
                Err(_) => debug!("Ignoring unparseable policy rule: {:?}", line),
            }
        }
    }
    flush(&mut fingerprint, &mut policy);
    policies
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// A two-relay consensus: one exit, one guard.
    ///
    /// The identities decode to AAAA…  and BBBB… fingerprints below.
    const CONSENSUS: &str = "\
network-status-version 3
r exity qqqqqqqqqqqqqqqqqqqqqqqqqqo AAAAAAAAAAAAAAAAAAAAAAAAAAA 2026-01-01 00:00:00 198.51.100.7 9001 0
s Exit Fast Running Valid
w Bandwidth=2000
r guardy u7u7u7u7u7u7u7u7u7u7u7u7u7s AAAAAAAAAAAAAAAAAAAAAAAAAAA 2026-01-01 00:00:00 203.0.113.5 443 0
s Fast Guard Running Stable Valid
w Bandwidth=20000
directory-footer
";

    fn exit_fp() -> Fingerprint {
        Fingerprint::from_bytes([0xAA; 20])
    }

    fn guard_fp() -> Fingerprint {
        Fingerprint::from_bytes([0xBB; 20])
    }

    #[test]
    fn parse_consensus() {
        let c = Consensus::parse(CONSENSUS);
        assert_eq!(c.len(), 2);
        let exit = c.get(&exit_fp()).unwrap();
        assert_eq!(exit.nickname, "exity");
        assert_eq!(exit.address, "198.51.100.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(exit.or_port, 9001);
        assert!(exit.flags.contains(RelayFlags::EXIT | RelayFlags::RUNNING));
        assert!(!exit.flags.contains(RelayFlags::GUARD));
        assert_eq!(exit.bandwidth, 2000);
        assert!(c.contains(&guard_fp()));
    }

    #[test]
    fn first_hop_candidates_reliable() {
        let c = Consensus::parse(CONSENSUS);
        let all = c.first_hop_candidates(false);
        assert_eq!(all.len(), 2);
        let reliable = c.first_hop_candidates(true);
        assert_eq!(reliable, vec![guard_fp()]);
    }

    #[test]
    fn unmeasured_relays_are_not_reliable() {
        let tweaked = CONSENSUS.replace("w Bandwidth=20000", "w Bandwidth=20000 Unmeasured=1");
        let c = Consensus::parse(&tweaked);
        assert!(c.first_hop_candidates(true).is_empty());
    }

    #[test]
    fn parse_descriptor_policies() {
        let descs = "\
router exity 198.51.100.7 9001 0 0
platform Tor 0.4.8.9 on Linux
fingerprint AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA AAAA
reject 0.0.0.0/8:*
accept *:53
reject *:*
router-signature
router broken 192.0.2.1 9001 0 0
accept *:*
router old 192.0.2.2 9001 0 0
opt fingerprint BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB BBBB
reject *:*
router-signature
";
        let policies = parse_descriptors(descs);
        assert_eq!(policies.len(), 2);
        let p = policies.get(&exit_fp()).unwrap();
        assert_eq!(p.len(), 3);
        assert!(p.can_exit_to("8.8.8.8".parse().unwrap(), 53));
        assert!(!p.can_exit_to("8.8.8.8".parse().unwrap(), 54));
        assert!(policies.get(&guard_fp()).unwrap().len() == 1);
    }
}
