//! Exit policies: the per-relay rule lists that say which destinations
//! a relay will forward traffic to.
//!
//! A policy is an ordered list of `accept`/`reject` rules over an
//! address pattern and a port range; the first matching rule wins, and
//! anything unmatched is rejected.  We parse the IPv4 rules from cached
//! server descriptors and ignore the IPv6 ones (`accept6`/`reject6`):
//! scan destinations are resolved to IPv4 before selection.

use std::net::Ipv4Addr;
use std::str::FromStr;

/// The address half of a policy rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum AddrSpec {
    /// `*`: any address.
    Any,
    /// A network, expressed as base address and mask.  A bare host is a
    /// /32; `a.b.c.d/n` and `a.b.c.d/x.y.z.w` both reduce to this.
    Net {
        /// Base address in integer form, already masked.
        base: u32,
        /// The netmask in integer form.
        mask: u32,
    },
}

impl AddrSpec {
    /// Does `addr` fall inside this pattern?
    fn matches(&self, addr: Ipv4Addr) -> bool {
        match self {
            AddrSpec::Any => true,
            AddrSpec::Net { base, mask } => (u32::from(addr) & mask) == *base,
        }
    }
}

/// An inclusive port range; `*` is 1–65535.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct PortRange {
    /// Lowest matching port.
    lo: u16,
    /// Highest matching port.
    hi: u16,
}

impl PortRange {
    /// Does `port` fall inside this range?
    fn matches(&self, port: u16) -> bool {
        self.lo <= port && port <= self.hi
    }
}

/// One `accept` or `reject` rule.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct PolicyRule {
    /// True for `accept`, false for `reject`.
    accept: bool,
    /// The address pattern.
    addr: AddrSpec,
    /// The port range.
    ports: PortRange,
}

/// Errors from rule parsing.
///
/// Kept crate-internal: a descriptor with a malformed policy line is
/// skipped wholesale by the consensus loader.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PolicyParseError(());

impl FromStr for PolicyRule {
    type Err = PolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_ascii_whitespace();
        let accept = match words.next() {
            Some("accept") => true,
            Some("reject") => false,
            _ => return Err(PolicyParseError(())),
        };
        let target = words.next().ok_or(PolicyParseError(()))?;
        let (addrpart, portpart) = target.rsplit_once(':').ok_or(PolicyParseError(()))?;

        let addr = if addrpart == "*" {
            AddrSpec::Any
        } else {
            let (base, mask) = match addrpart.split_once('/') {
                None => (addrpart, u32::MAX),
                Some((base, maskpart)) => {
                    let mask = if let Ok(prefix) = maskpart.parse::<u8>() {
                        if prefix > 32 {
                            return Err(PolicyParseError(()));
                        }
                        // Checked shift: 1 << 32 would overflow.
                        (u64::MAX << (32 - u32::from(prefix))) as u32
                    } else {
                        u32::from(
                            maskpart
                                .parse::<Ipv4Addr>()
                                .map_err(|_| PolicyParseError(()))?,
                        )
                    };
                    (base, mask)
                }
            };
            let base = u32::from(base.parse::<Ipv4Addr>().map_err(|_| PolicyParseError(()))?);
            AddrSpec::Net {
                base: base & mask,
                mask,
            }
        };

        let ports = if portpart == "*" {
            PortRange { lo: 1, hi: 65535 }
        } else if let Some((lo, hi)) = portpart.split_once('-') {
            PortRange {
                lo: lo.parse().map_err(|_| PolicyParseError(()))?,
                hi: hi.parse().map_err(|_| PolicyParseError(()))?,
            }
        } else {
            let port: u16 = portpart.parse().map_err(|_| PolicyParseError(()))?;
            PortRange { lo: port, hi: port }
        };

        Ok(PolicyRule {
            accept,
            addr,
            ports,
        })
    }
}

/// An ordered exit policy.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ExitPolicy {
    /// The rules, in descriptor order.
    rules: Vec<PolicyRule>,
}

impl ExitPolicy {
    /// An empty (reject-everything) policy.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule.
    pub fn push(&mut self, rule: PolicyRule) {
        self.rules.push(rule);
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// True if the policy has no rules.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Would this relay forward traffic to `addr`:`port`?
    ///
    /// First matching rule wins; no match means reject.
    pub fn can_exit_to(&self, addr: Ipv4Addr, port: u16) -> bool {
        for rule in &self.rules {
            if rule.addr.matches(addr) && rule.ports.matches(port) {
                return rule.accept;
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn policy(lines: &[&str]) -> ExitPolicy {
        let mut p = ExitPolicy::new();
        for line in lines {
            p.push(line.parse().unwrap());
        }
        p
    }

    #[test]
    fn default_reject() {
        let p = ExitPolicy::new();
        assert!(!p.can_exit_to("1.2.3.4".parse().unwrap(), 80));
    }

    #[test]
    fn first_match_wins() {
        let p = policy(&["reject 1.2.3.0/24:*", "accept *:80", "reject *:*"]);
        assert!(!p.can_exit_to("1.2.3.4".parse().unwrap(), 80));
        assert!(p.can_exit_to("4.3.2.1".parse().unwrap(), 80));
        assert!(!p.can_exit_to("4.3.2.1".parse().unwrap(), 443));
    }

    #[test]
    fn port_ranges() {
        let p = policy(&["accept *:80-90", "reject *:*"]);
        assert!(p.can_exit_to("1.1.1.1".parse().unwrap(), 80));
        assert!(p.can_exit_to("1.1.1.1".parse().unwrap(), 90));
        assert!(!p.can_exit_to("1.1.1.1".parse().unwrap(), 91));
    }

    #[test]
    fn host_and_netmask_forms() {
        let p = policy(&[
            "reject 9.9.9.9:*",
            "reject 10.0.0.0/255.0.0.0:*",
            "accept *:*",
        ]);
        assert!(!p.can_exit_to("9.9.9.9".parse().unwrap(), 53));
        assert!(!p.can_exit_to("10.200.1.1".parse().unwrap(), 53));
        assert!(p.can_exit_to("9.9.9.8".parse().unwrap(), 53));
    }

    #[test]
    fn prefix_zero_matches_everything() {
        let p = policy(&["reject 0.0.0.0/0:25", "accept *:*"]);
        assert!(!p.can_exit_to("8.8.8.8".parse().unwrap(), 25));
        assert!(p.can_exit_to("8.8.8.8".parse().unwrap(), 26));
    }

    #[test]
    fn parse_failures() {
        for bad in [
            "allow *:*",
            "accept *",
            "accept 1.2.3.4/33:80",
            "accept 1.2.3:80",
            "accept *:0-",
            "",
        ] {
            assert!(bad.parse::<PolicyRule>().is_err(), "{:?}", bad);
        }
    }
}
