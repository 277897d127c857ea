//! Command-line and environment configuration.
//!
//! The command-line surface follows the original exitmap tool; a few
//! settings that operators rarely touch (pending-circuit ceiling, grace
//! timeout, first-hop quality) come from environment variables instead.

use crate::err::{Error, Result};
use clap::{ArgGroup, Parser};
use exitmap_control::Fingerprint;
use std::path::PathBuf;
use std::time::Duration;

/// Perform a task over (a subset of) all Tor exit relays.
#[derive(Parser, Debug)]
#[clap(name = "exitmap", version, about)]
#[clap(group(ArgGroup::new("exit-filter").multiple(false)))]
#[clap(group(ArgGroup::new("exit-quality").multiple(false)))]
pub struct Args {
    /// Only probe exit relays of the country with the given 2-letter
    /// country code.
    #[clap(short = 'C', long, group = "exit-filter")]
    pub country: Option<String>,

    /// Only probe the exit relay which has the given 20-byte
    /// fingerprint.
    #[clap(short = 'e', long = "exit", group = "exit-filter")]
    pub exit: Option<String>,

    /// File containing the 20-byte fingerprints of exit relays to
    /// probe, one per line.
    #[clap(short = 'E', long = "exit-file", group = "exit-filter")]
    pub exit_file: Option<PathBuf>,

    /// Wait for the given delay (in seconds) between circuit builds.
    #[clap(short = 'd', long = "build-delay", default_value_t = 0.0)]
    pub build_delay: f64,

    /// Sample a random value in [0, DELAY_NOISE) and randomly add it to
    /// or subtract it from the build delay, randomising the build
    /// pattern.
    #[clap(short = 'n', long = "delay-noise", default_value_t = 0.0)]
    pub delay_noise: f64,

    /// Tor's data directory.  If set, the network consensus can be
    /// re-used in between scans, which speeds up bootstrapping.
    #[clap(short = 't', long = "tor-dir")]
    pub tor_dir: Option<PathBuf>,

    /// The directory where analysis results are written to.
    #[clap(short = 'a', long = "analysis-dir")]
    pub analysis_dir: Option<PathBuf>,

    /// Minimum verbosity level for logging (debug, info, warning,
    /// error, critical).
    #[clap(short = 'v', long, default_value = "info")]
    pub verbosity: String,

    /// Filename to which log output should be written.
    #[clap(short = 'o', long)]
    pub logfile: Option<PathBuf>,

    /// The 20-byte fingerprint of the Tor relay to use as first hop.
    /// This relay should be under your control.
    #[clap(short = 'i', long = "first-hop")]
    pub first_hop: Option<String>,

    /// Only scan exit relays that have the BadExit flag.  By default,
    /// only good exits are scanned.
    #[clap(short = 'b', long = "bad-exits", group = "exit-quality")]
    pub bad_exits: bool,

    /// Scan all exits, including those that have the BadExit flag.
    #[clap(short = 'l', long = "all-exits", group = "exit-quality")]
    pub all_exits: bool,

    /// A host to be targeted by the chosen module.
    #[clap(short = 'H', long)]
    pub host: Option<String>,

    /// A port to be targeted by the chosen module.
    #[clap(short = 'p', long)]
    pub port: Option<u16>,

    /// Number of circuits to build per relay, to reduce false positives
    /// from network volatility.
    #[clap(short = 'R', long, default_value_t = 1)]
    pub redundancy: usize,

    /// Run the given probe module(s).
    #[clap(required = true)]
    pub modules: Vec<String>,
}

impl Args {
    /// The Tor data directory to use, defaulting to a per-user
    /// directory under /tmp so that many users can scan in parallel.
    pub fn tor_dir(&self) -> PathBuf {
        self.tor_dir.clone().unwrap_or_else(|| {
            let user = std::env::var("USER").unwrap_or_else(|_| "nouser".to_owned());
            PathBuf::from(format!("/tmp/exitmap_tor_datadir-{}", user))
        })
    }
}

/// Settings read from the environment at startup.
#[derive(Clone, Debug)]
pub struct EnvConfig {
    /// Ceiling for the client's pending-circuit queue
    /// (`MAX_PENDING_CIRCUITS`, default 128).
    pub max_pending_circuits: u32,
    /// Restrict random first hops to reliable guards
    /// (`RELIABLE_FIRST_HOP`).
    pub reliable_first_hop: bool,
    /// Grace window for straggling probes after the scan finishes
    /// (`EXITMAP_GRACE_TIMEOUT`, seconds, default 10).
    pub grace_timeout: Duration,
    /// Pinned first hop (`EXITMAP_FIRST_HOP`), overridden by `-i`.
    pub first_hop: Option<Fingerprint>,
}

/// Read an environment variable and parse it, treating garbage as a
/// configuration error rather than silently falling back.
fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("cannot parse {}={:?}", name, raw))),
        Err(_) => Ok(None),
    }
}

/// Read a boolean environment variable ("1", "true", "yes", "y").
fn env_bool(name: &str) -> bool {
    matches!(
        std::env::var(name)
            .unwrap_or_default()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "y"
    )
}

impl EnvConfig {
    /// Capture the environment.
    pub fn from_env() -> Result<Self> {
        let first_hop = match std::env::var("EXITMAP_FIRST_HOP") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| Error::Config(format!("EXITMAP_FIRST_HOP={:?}", raw)))?,
            ),
            Err(_) => None,
        };
        Ok(EnvConfig {
            max_pending_circuits: env_parse("MAX_PENDING_CIRCUITS")?.unwrap_or(128),
            reliable_first_hop: env_bool("RELIABLE_FIRST_HOP"),
            grace_timeout: Duration::from_secs(
                env_parse("EXITMAP_GRACE_TIMEOUT")?.unwrap_or(10),
            ),
            first_hop,
        })
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn minimal_args() {
        let args = Args::try_parse_from(["exitmap", "dnshealth"]).unwrap();
        assert_eq!(args.modules, vec!["dnshealth"]);
        assert_eq!(args.redundancy, 1);
        assert!(!args.bad_exits);
        assert!(args
            .tor_dir()
            .to_string_lossy()
            .starts_with("/tmp/exitmap_tor_datadir-"));
    }

    #[test]
    fn exit_filters_are_mutually_exclusive() {
        assert!(Args::try_parse_from(["exitmap", "-C", "de", "-e", "A", "dnshealth"]).is_err());
        assert!(Args::try_parse_from(["exitmap", "-b", "-l", "dnshealth"]).is_err());
        assert!(Args::try_parse_from(["exitmap"]).is_err());
    }

    #[test]
    fn full_flag_set() {
        let args = Args::try_parse_from([
            "exitmap",
            "-C",
            "at",
            "-d",
            "0.5",
            "-n",
            "0.25",
            "-R",
            "3",
            "-H",
            "example.com",
            "-p",
            "80",
            "-t",
            "/tmp/td",
            "-a",
            "/tmp/out",
            "dnshealth",
        ])
        .unwrap();
        assert_eq!(args.country.as_deref(), Some("at"));
        assert_eq!(args.redundancy, 3);
        assert_eq!(args.port, Some(80));
        assert_eq!(args.tor_dir(), PathBuf::from("/tmp/td"));
    }
}
