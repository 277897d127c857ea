//! The top-level scan drive: everything between "parsed arguments" and
//! "process exit code".

use crate::config::{Args, EnvConfig};
use crate::consensus::{load_exit_policies, Consensus};
use crate::err::{Error, Result};
use crate::geoip::GeoipDb;
use crate::launch::TorProcess;
use crate::modules::{self, ProbeModule, SetupCtx};
use crate::reactor::{ScanPlan, ScanReactor};
use crate::selector::{
    read_requested_exits, select_exits, Destination, ExitFilter, ExitQuality,
};
use crate::sink::ResultSink;
use crate::stats::Statistics;
use exitmap_control::{ControlConn, ControlEvent, ControlHandle, Fingerprint};
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::macros::format_description;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Run a whole scan.  This is the body behind `main`.
pub async fn run(args: Args) -> Result<()> {
    let env = EnvConfig::from_env()?;
    let tor_dir = args.tor_dir();
    prepare_tor_dir(&tor_dir)?;

    let pinned_first_hop = pinned_first_hop(&args, &env)?;
    if pinned_first_hop.is_none() {
        info!("No first hop given.  Using randomly determined first hops for circuits.");
    }

    let tor = TorProcess::launch(&tor_dir).await?;
    let mut conn = ControlConn::connect(tor.control_addr()).await?;
    conn.authenticate().await?;
    let (control, mut events) = conn.launch();
    configure_client(&control, &env).await?;

    let consensus = Arc::new(Consensus::load(&tor_dir)?);
    if consensus.is_empty() {
        return Err(Error::Config(
            "the consensus cache is empty; did the client bootstrap?".to_owned(),
        ));
    }
    let policies = load_exit_policies(&tor_dir)?;
    let geoip = load_geoip(&args, &tor_dir)?;

    if let Some(fp) = &pinned_first_hop {
        if !consensus.contains(fp) {
            return Err(Error::Config(format!(
                "given first hop {} not found in consensus.  Is it offline?",
                fp
            )));
        }
    }

    control.set_events(&["CIRC", "STREAM"]).await?;

    let mut stats = Statistics::new();
    for module_name in &args.modules {
        stats.modules_run += 1;
        stats = run_module(
            module_name,
            &args,
            &env,
            &control,
            &mut events,
            &consensus,
            &policies,
            geoip.as_ref(),
            pinned_first_hop,
            tor.socks_addr(),
            stats,
        )
        .await?;
    }
    info!("{}", stats);
    Ok(())
}

/// Run one module over the selected exits.
#[allow(clippy::too_many_arguments)] // internal plumbing, not an API
async fn run_module(
    module_name: &str,
    args: &Args,
    env: &EnvConfig,
    control: &ControlHandle,
    events: &mut mpsc::UnboundedReceiver<ControlEvent>,
    consensus: &Arc<Consensus>,
    policies: &HashMap<Fingerprint, crate::policy::ExitPolicy>,
    geoip: Option<&GeoipDb>,
    pinned_first_hop: Option<Fingerprint>,
    socks_addr: std::net::SocketAddr,
    stats: Statistics,
) -> Result<Statistics> {
    info!("Running module '{}'.", module_name);
    let module = modules::create(module_name)?;
    module
        .setup(SetupCtx {
            consensus: consensus.as_ref(),
            target_host: args.host.as_deref(),
        })
        .await?;

    let destinations = lookup_destinations(module.as_ref(), args).await?;
    let filter = build_filter(args)?;
    let exit_destinations = select_exits(consensus, policies, &filter, &destinations, geoip)?;

    // Shuffle so per-destination load spreads over the scan.
    let mut exits: Vec<Fingerprint> = exit_destinations.keys().copied().collect();
    exits.shuffle(&mut rand::thread_rng());

    let sink = Arc::new(ResultSink::new(
        args.analysis_dir.as_deref(),
        make_run_id(module_name),
    ));
    debug!("Results go to {:?}.", sink.dir());

    let plan = ScanPlan {
        exits,
        exit_destinations,
        redundancy: args.redundancy.max(1),
        build_delay: args.build_delay,
        delay_noise: args.delay_noise,
        pinned_first_hop,
        first_hop_candidates: consensus.first_hop_candidates(env.reliable_first_hop),
        grace: env.grace_timeout,
        socks_addr,
        target_host: args.host.clone(),
        target_port: args.port,
    };
    let reactor = ScanReactor::new(
        Arc::new(control.clone()),
        module,
        sink,
        Arc::clone(consensus),
        plan,
        stats,
    );
    let outcome = reactor.run(events).await;
    Ok(outcome.stats)
}

/// Create the data directory (private to this user) and verify it.
fn prepare_tor_dir(tor_dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(tor_dir)?;
    fs_mistrust::Mistrust::new()
        .verifier()
        .require_directory()
        .check(tor_dir)?;
    Ok(())
}

/// Post-bootstrap client configuration.
async fn configure_client(control: &ControlHandle, env: &EnvConfig) -> Result<()> {
    // The client will not bootstrap over an existing data directory
    // with this option set at launch; it has to be set here, at
    // runtime.
    control.set_conf("__DisablePredictedCircuits", "1").await?;
    control
        .set_conf(
            "MaxClientCircuitsPending",
            &env.max_pending_circuits.to_string(),
        )
        .await?;
    debug!(
        "Set MaxClientCircuitsPending to {}.",
        env.max_pending_circuits
    );
    // The client's own log chatter goes elsewhere, and the cache is
    // already complete, so nothing gets fetched behind our back.
    control.set_conf("Log", "err file /dev/null").await?;
    control.set_conf("FetchServerDescriptors", "0").await?;
    Ok(())
}

/// The `-i` flag, or `EXITMAP_FIRST_HOP`, as a fingerprint.
fn pinned_first_hop(args: &Args, env: &EnvConfig) -> Result<Option<Fingerprint>> {
    match &args.first_hop {
        Some(raw) => Ok(Some(raw.parse().map_err(|_| {
            Error::Config(format!("bad first-hop fingerprint {:?}", raw))
        })?)),
        None => Ok(env.first_hop),
    }
}

/// Translate the CLI flags into selection criteria.
fn build_filter(args: &Args) -> Result<ExitFilter> {
    let quality = if args.all_exits {
        ExitQuality::All
    } else if args.bad_exits {
        ExitQuality::BadOnly
    } else {
        ExitQuality::GoodOnly
    };
    let country = match &args.country {
        Some(raw) => Some(raw.parse()?),
        None => None,
    };
    let requested = match (&args.exit, &args.exit_file) {
        (Some(raw), _) => {
            let fp = raw
                .parse()
                .map_err(|_| Error::Config(format!("bad exit fingerprint {:?}", raw)))?;
            Some(HashSet::from([fp]))
        }
        (None, Some(path)) => Some(read_requested_exits(path)?),
        (None, None) => None,
    };
    Ok(ExitFilter {
        quality,
        country,
        requested,
    })
}

/// Determine and resolve the destination set.
///
/// A `-H HOST -p PORT` pair overrides whatever the module declares;
/// a bare `-H` does not (modules use it as a target in their own way).
async fn lookup_destinations(
    module: &dyn ProbeModule,
    args: &Args,
) -> Result<HashSet<Destination>> {
    let raw = match (&args.host, args.port) {
        (Some(host), Some(port)) => vec![(host.clone(), port)],
        _ => module.destinations(),
    };
    let mut destinations = HashSet::new();
    let mut resolved: HashMap<String, Ipv4Addr> = HashMap::new();
    for (host, port) in raw {
        let addr = match resolved.get(&host) {
            Some(addr) => *addr,
            None => {
                let addr = resolve_host(&host).await?;
                resolved.insert(host.clone(), addr);
                addr
            }
        };
        destinations.insert(Destination { addr, port });
    }
    Ok(destinations)
}

/// Forward-resolve a hostname to its first IPv4 address.
async fn resolve_host(host: &str) -> Result<Ipv4Addr> {
    let addrs = tokio::net::lookup_host((host, 0_u16))
        .await
        .map_err(|e| Error::Config(format!("cannot resolve {:?}: {}", host, e)))?;
    addrs
        .filter_map(|sa| match sa.ip() {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| Error::Config(format!("no IPv4 address for {:?}", host)))
}

/// Find a geoip table when the country filter asks for one.
fn load_geoip(args: &Args, tor_dir: &Path) -> Result<Option<GeoipDb>> {
    if args.country.is_none() {
        return Ok(None);
    }
    let candidates = [tor_dir.join("geoip"), PathBuf::from("/usr/share/tor/geoip")];
    for path in &candidates {
        if path.exists() {
            let db = GeoipDb::load(path)?;
            info!("Loaded geoip table with {} ranges from {:?}.", db.len(), path);
            return Ok(Some(db));
        }
    }
    Err(Error::Config(
        "country filter requested but no geoip database was found".to_owned(),
    ))
}

/// The run identifier: scan start time plus module name.
fn make_run_id(module_name: &str) -> String {
    let format = format_description!("[year]-[month]-[day]_[hour]:[minute]:[second]");
    let stamp = time::OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_else(|_| crate::stats::unix_now().to_string());
    format!("{}_{}", stamp, module_name)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["exitmap"];
        argv.extend_from_slice(extra);
        argv.push("dnshealth");
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn filter_from_flags() {
        let filter = build_filter(&args(&[])).unwrap();
        assert_eq!(filter.quality, ExitQuality::GoodOnly);
        assert!(filter.country.is_none());
        assert!(filter.requested.is_none());

        let filter = build_filter(&args(&["-b"])).unwrap();
        assert_eq!(filter.quality, ExitQuality::BadOnly);

        let fp = "ABCDEF0123456789ABCDEF0123456789ABCD7890";
        let filter = build_filter(&args(&["-l", "-e", fp])).unwrap();
        assert_eq!(filter.quality, ExitQuality::All);
        assert_eq!(filter.requested.unwrap().len(), 1);

        assert!(build_filter(&args(&["-e", "tooshort"])).is_err());
        assert!(build_filter(&args(&["-C", "x"])).is_err());
    }

    #[test]
    fn first_hop_precedence() {
        let fp = "ABCDEF0123456789ABCDEF0123456789ABCD7890";
        let env = EnvConfig {
            max_pending_circuits: 128,
            reliable_first_hop: false,
            grace_timeout: std::time::Duration::from_secs(10),
            first_hop: Some(Fingerprint::from_bytes([0x77; 20])),
        };
        // The flag wins over the environment.
        let picked = pinned_first_hop(&args(&["-i", fp]), &env).unwrap().unwrap();
        assert_eq!(picked.to_string(), fp);
        let picked = pinned_first_hop(&args(&[]), &env).unwrap().unwrap();
        assert_eq!(picked, Fingerprint::from_bytes([0x77; 20]));

        assert!(pinned_first_hop(&args(&["-i", "junk"]), &env).is_err());
    }

    #[tokio::test]
    async fn destination_lookup_prefers_cli_pair() {
        let dests = lookup_destinations(
            modules::create("dnshealth").unwrap().as_ref(),
            &args(&["-H", "127.0.0.1", "-p", "8000"]),
        )
        .await
        .unwrap();
        assert_eq!(dests.len(), 1);
        assert!(dests.contains(&Destination {
            addr: "127.0.0.1".parse().unwrap(),
            port: 8000,
        }));

        // A bare -H is a module target, not a destination.
        let dests = lookup_destinations(
            modules::create("dnshealth").unwrap().as_ref(),
            &args(&["-H", "example.com"]),
        )
        .await
        .unwrap();
        assert!(dests.is_empty());
    }

    #[test]
    fn run_ids_embed_the_module() {
        let id = make_run_id("dnshealth");
        assert!(id.ends_with("_dnshealth"));
        assert_eq!(id.len(), "2026-01-01_00:00:00_dnshealth".len());
    }
}
