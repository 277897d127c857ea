//! Detect broken DNS resolution on exit relays.
//!
//! Two modes:
//!
//! * **Wildcard** (default): resolve a freshly generated subdomain of a
//!   wildcard zone we control; healthy resolvers return the zone's
//!   fixed address.
//! * **NXDOMAIN** (`-H some.domain`): resolve a freshly generated name
//!   that cannot exist; healthy resolvers report NXDOMAIN, which the
//!   client surfaces as SOCKS reply code 4.
//!
//! Every query is unique per relay and per attempt, so cached answers
//! can never masquerade as healthy resolution.

use crate::err::{Error, Result};
use crate::modules::{ProbeCtx, ProbeModule, SetupCtx};
use crate::sink::{exit_url, ProbeMode, ProbeResult, ProbeStatus, ResultSink};
use crate::stats::{unix_now, Statistics};
use async_trait::async_trait;
use exitmap_control::Fingerprint;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tunables, all overridable from the environment.
#[derive(Clone, Debug)]
pub struct DnsHealthConfig {
    /// The wildcard zone queried in wildcard mode
    /// (`DNS_WILDCARD_DOMAIN`).
    pub wildcard_domain: String,
    /// The address a healthy resolver returns for the wildcard zone
    /// (`DNS_EXPECTED_IP`).
    pub expected_ip: Option<Ipv4Addr>,
    /// Per-attempt timeout (`DNS_QUERY_TIMEOUT`, seconds).
    pub query_timeout: Duration,
    /// Attempts per relay (`DNS_MAX_RETRIES`).
    pub max_retries: u32,
    /// Whole-probe watchdog (`DNS_HARD_TIMEOUT`, seconds).
    pub hard_timeout: Duration,
    /// Fixed delay between attempts (`DNS_RETRY_DELAY`, seconds).
    pub retry_delay: Duration,
}

impl Default for DnsHealthConfig {
    fn default() -> Self {
        DnsHealthConfig {
            wildcard_domain: "tor.exit.validator.1aeo.com".to_owned(),
            expected_ip: Some(Ipv4Addr::new(64, 65, 4, 1)),
            query_timeout: Duration::from_secs(45),
            max_retries: 3,
            hard_timeout: Duration::from_secs(180),
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Read a float-seconds environment variable.
fn env_secs(name: &str, default: Duration) -> Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<f64>()
            .ok()
            .filter(|s| s.is_finite() && *s >= 0.0)
            .map(Duration::from_secs_f64)
            .ok_or_else(|| Error::Config(format!("cannot parse {}={:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

impl DnsHealthConfig {
    /// Capture the environment, falling back to the defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let expected_ip = match std::env::var("DNS_EXPECTED_IP") {
            Ok(raw) => Some(
                raw.parse()
                    .map_err(|_| Error::Config(format!("DNS_EXPECTED_IP={:?}", raw)))?,
            ),
            Err(_) => defaults.expected_ip,
        };
        let max_retries = match std::env::var("DNS_MAX_RETRIES") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| Error::Config(format!("DNS_MAX_RETRIES={:?}", raw)))?,
            Err(_) => defaults.max_retries,
        };
        Ok(DnsHealthConfig {
            wildcard_domain: std::env::var("DNS_WILDCARD_DOMAIN")
                .unwrap_or(defaults.wildcard_domain),
            expected_ip,
            query_timeout: env_secs("DNS_QUERY_TIMEOUT", defaults.query_timeout)?,
            max_retries,
            hard_timeout: env_secs("DNS_HARD_TIMEOUT", defaults.hard_timeout)?,
            retry_delay: env_secs("DNS_RETRY_DELAY", defaults.retry_delay)?,
        })
    }
}

/// Generate a query that no cache can have seen before.
///
/// Shape: `<uuid hex>.<first 8 fingerprint digits>.<base>`.  The
/// fingerprint label ties the query back to the relay in the zone's
/// server logs.
pub fn generate_unique_query(exit: &Fingerprint, base: &str) -> String {
    format!(
        "{}.{}.{}",
        Uuid::new_v4().simple(),
        hex::encode(&exit.as_bytes()[..4]),
        base
    )
}

/// The terminal outcome of the attempt loop.
struct AttemptOutcome {
    /// Final status.
    status: ProbeStatus,
    /// Resolved address, `"NXDOMAIN"`, or nothing.
    resolved_ip: Option<String>,
    /// Error detail for non-success outcomes.
    error: Option<String>,
    /// Which attempt decided the outcome (1-based).
    attempt: u32,
    /// Wall-clock time of the deciding attempt.
    latency: Duration,
}

/// The DNS-health module.
pub struct DnsHealth {
    /// Captured configuration.
    cfg: DnsHealthConfig,
}

impl DnsHealth {
    /// Build the module from the environment.
    pub fn from_env() -> Result<Self> {
        Ok(DnsHealth {
            cfg: DnsHealthConfig::from_env()?,
        })
    }

    /// Build the module with explicit configuration.
    pub fn with_config(cfg: DnsHealthConfig) -> Self {
        DnsHealth { cfg }
    }

    /// Is this status worth another attempt?
    ///
    /// Success, a wrong address, and NXDOMAIN are answers from the
    /// exit's resolver and will not change on retry; everything else is
    /// transient.
    fn retryable(status: ProbeStatus) -> bool {
        !matches!(
            status,
            ProbeStatus::Success | ProbeStatus::WrongIp | ProbeStatus::DnsFail
        )
    }

    /// Judge one resolver answer.
    fn judge(
        &self,
        mode: ProbeMode,
        answer: std::result::Result<Ipv4Addr, crate::socksio::SocksIoError>,
    ) -> (ProbeStatus, Option<String>, Option<String>) {
        match (mode, answer) {
            (ProbeMode::Wildcard, Ok(ip)) => match self.cfg.expected_ip {
                Some(expected) if ip == expected => {
                    (ProbeStatus::Success, Some(ip.to_string()), None)
                }
                Some(expected) => (
                    ProbeStatus::WrongIp,
                    Some(ip.to_string()),
                    Some(format!("Expected {}, got {}", expected, ip)),
                ),
                None => (
                    ProbeStatus::Exception,
                    Some(ip.to_string()),
                    Some("No expected address configured".to_owned()),
                ),
            },
            (ProbeMode::Nxdomain, Ok(ip)) => (
                ProbeStatus::WrongIp,
                Some(ip.to_string()),
                Some(format!("Expected NXDOMAIN, got {}", ip)),
            ),
            (ProbeMode::Nxdomain, Err(e)) if e.status() == ProbeStatus::DnsFail => {
                (ProbeStatus::Success, Some("NXDOMAIN".to_owned()), None)
            }
            (_, Err(e)) => (e.status(), None, Some(e.to_string())),
        }
    }

    /// Run the attempt loop until a terminal status or attempts run
    /// out.
    async fn attempts(
        &self,
        ctx: &ProbeCtx,
        mode: ProbeMode,
        base: &str,
        last_query: &Mutex<String>,
    ) -> AttemptOutcome {
        let max = self.cfg.max_retries.max(1);
        let mut attempt = 1;
        loop {
            let query = generate_unique_query(&ctx.exit.fingerprint, base);
            *last_query.lock().unwrap_or_else(|e| e.into_inner()) = query.clone();
            let t0 = Instant::now();
            let (status, resolved_ip, error) =
                match tokio::time::timeout(self.cfg.query_timeout, ctx.io.resolve(&query)).await
                {
                    Ok(answer) => self.judge(mode, answer),
                    Err(_) => (
                        ProbeStatus::Timeout,
                        None,
                        Some(format!(
                            "Query timed out after {}",
                            humantime::format_duration(self.cfg.query_timeout)
                        )),
                    ),
                };
            let outcome = AttemptOutcome {
                status,
                resolved_ip,
                error,
                attempt,
                latency: t0.elapsed(),
            };
            if !Self::retryable(status) || attempt >= max {
                return outcome;
            }
            debug!(
                "Attempt {}/{} for {} got {}; retrying.",
                attempt,
                max,
                ctx.exit.fingerprint.short(),
                status
            );
            attempt += 1;
            tokio::time::sleep(self.cfg.retry_delay).await;
        }
    }
}

#[async_trait]
impl ProbeModule for DnsHealth {
    fn name(&self) -> &'static str {
        "dnshealth"
    }

    async fn setup(&self, ctx: SetupCtx<'_>) -> Result<()> {
        match ctx.target_host {
            Some(host) => {
                info!("dnshealth in NXDOMAIN mode against {:?}.", host);
            }
            None => {
                if self.cfg.expected_ip.is_none() {
                    return Err(Error::Config(
                        "dnshealth wildcard mode needs DNS_EXPECTED_IP".to_owned(),
                    ));
                }
                info!(
                    "dnshealth in wildcard mode against {:?}, expecting {}.",
                    self.cfg.wildcard_domain,
                    self.cfg
                        .expected_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_default()
                );
            }
        }
        Ok(())
    }

    async fn probe(&self, ctx: ProbeCtx) {
        let mode = match ctx.target_host {
            Some(_) => ProbeMode::Nxdomain,
            None => ProbeMode::Wildcard,
        };
        let base = ctx
            .target_host
            .clone()
            .unwrap_or_else(|| self.cfg.wildcard_domain.clone());

        let started = Instant::now();
        let last_query = Mutex::new(String::new());
        let outcome =
            match tokio::time::timeout(
                self.cfg.hard_timeout,
                self.attempts(&ctx, mode, &base, &last_query),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => AttemptOutcome {
                    status: ProbeStatus::HardTimeout,
                    resolved_ip: None,
                    error: Some(format!(
                        "Probe interrupted after {}",
                        humantime::format_duration(self.cfg.hard_timeout)
                    )),
                    attempt: self.cfg.max_retries,
                    latency: started.elapsed(),
                },
            };

        let query = {
            let q = last_query.lock().unwrap_or_else(|e| e.into_inner());
            if q.is_empty() {
                base.clone()
            } else {
                q.clone()
            }
        };
        let fingerprint = ctx.exit.fingerprint.to_string();
        let result = ProbeResult {
            exit_url: exit_url(&fingerprint),
            fingerprint,
            nickname: ctx.exit.nickname.clone(),
            address: ctx.exit.address.to_string(),
            query,
            expected_ip: match mode {
                ProbeMode::Wildcard => self.cfg.expected_ip.map(|ip| ip.to_string()),
                ProbeMode::Nxdomain => None,
            },
            timestamp: unix_now(),
            run_id: ctx.sink.run_id().to_owned(),
            mode,
            first_hop: ctx.first_hop.map(|fp| fp.to_string()),
            status: outcome.status,
            resolved_ip: outcome.resolved_ip,
            latency_ms: Some(u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX)),
            error: outcome.error,
            attempt: outcome.attempt,
        };
        if let Err(e) = ctx.sink.record(self.name(), &result) {
            warn!(
                "Could not write result for {}: {}",
                result.fingerprint, e
            );
        }
    }

    async fn teardown(&self, stats: &Statistics, sink: &ResultSink, terminated: &[Fingerprint]) {
        let histogram = sink.histogram();
        let mut counts: Vec<_> = histogram.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.as_token().cmp(b.0.as_token())));
        for (status, count) in counts {
            info!("dnshealth: {:>5} relays with status {}", count, status);
        }
        if !stats.failed_circuit_relays().is_empty() {
            info!(
                "dnshealth: {} relays were unreachable (circuit failures).",
                stats.failed_circuit_relays().len()
            );
        }
        if !terminated.is_empty() {
            warn!(
                "dnshealth: {} probes were terminated as stragglers.",
                terminated.len()
            );
        }
    }
}
