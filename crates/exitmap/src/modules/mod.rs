//! Probe modules and their registry.
//!
//! A module is the pluggable piece that runs once per exit relay.  It
//! declares the destinations it wants to reach, gets a one-off `setup`
//! before the scan, a `probe` per built circuit (with all I/O going
//! through the circuit-pinned facade), and a `teardown` with the final
//! statistics.

use crate::consensus::{Consensus, RelayInfo};
use crate::err::{Error, Result};
use crate::selector::Destination;
use crate::sink::ResultSink;
use crate::socksio::CircuitIo;
use crate::stats::Statistics;
use async_trait::async_trait;
use exitmap_control::Fingerprint;
use std::collections::HashSet;
use std::sync::Arc;

pub mod dnshealth;

/// Context for a module's one-off setup.
pub struct SetupCtx<'a> {
    /// The loaded consensus, for modules that want to narrow their
    /// work from it.
    pub consensus: &'a Consensus,
    /// The `-H` destination override, if the operator gave one.
    pub target_host: Option<&'a str>,
}

/// Everything a probe gets for one exit relay.
pub struct ProbeCtx {
    /// The exit under test.
    pub exit: RelayInfo,
    /// The destinations this exit's policy accepts.
    pub destinations: HashSet<Destination>,
    /// The `-H` destination override.
    pub target_host: Option<String>,
    /// The `-p` destination override.
    pub target_port: Option<u16>,
    /// The circuit's first hop.
    pub first_hop: Option<Fingerprint>,
    /// Network operations, pinned to this probe's circuit.
    pub io: Arc<dyn CircuitIo>,
    /// Where to record the result.
    pub sink: Arc<ResultSink>,
}

/// The capability contract every probe module implements.
#[async_trait]
pub trait ProbeModule: Send + Sync {
    /// The module's name, as given on the command line.
    fn name(&self) -> &'static str;

    /// Hostname/port pairs the module wants to scan.
    ///
    /// Modules that only resolve names return nothing here, which
    /// skips exit-policy filtering.
    fn destinations(&self) -> Vec<(String, u16)> {
        Vec::new()
    }

    /// One-off setup before the scan starts.
    async fn setup(&self, ctx: SetupCtx<'_>) -> Result<()>;

    /// Probe one exit relay.  Runs inside a worker; outcomes are
    /// recorded through the sink, not returned.
    async fn probe(&self, ctx: ProbeCtx);

    /// One-off teardown after the scan finished.  `terminated` lists
    /// the exits whose probes had to be killed.
    async fn teardown(&self, stats: &Statistics, sink: &ResultSink, terminated: &[Fingerprint]);
}

/// The modules this build knows about.
pub fn available() -> &'static [&'static str] {
    &["dnshealth"]
}

/// Instantiate a module by name.
pub fn create(name: &str) -> Result<Arc<dyn ProbeModule>> {
    match name {
        "dnshealth" => Ok(Arc::new(dnshealth::DnsHealth::from_env()?)),
        _ => Err(Error::Config(format!(
            "unknown module {:?} (available: {})",
            name,
            available().join(", ")
        ))),
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn registry_knows_dnshealth() {
        assert!(available().contains(&"dnshealth"));
        let module = create("dnshealth").unwrap();
        assert_eq!(module.name(), "dnshealth");
    }

    #[test]
    fn unknown_module_is_a_config_error() {
        match create("nosuchmodule") {
            Err(Error::Config(msg)) => assert!(msg.contains("nosuchmodule")),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }
}
