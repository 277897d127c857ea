//! Persist per-relay probe results and keep a running status
//! histogram.
//!
//! Each probe writes exactly one JSON object to
//! `<analysis_dir>/<run_id>/<module>_<fingerprint>.json`.  The field
//! names and status tokens are a stable interface: offline analysis
//! tooling keys on them.

use crate::err::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Which flavor of DNS check produced a result.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeMode {
    /// Query a unique name under a wildcard domain; expect a fixed
    /// address back.
    Wildcard,
    /// Query a unique name that must not exist; expect NXDOMAIN back.
    Nxdomain,
}

/// The terminal status of one probe.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ProbeStatus {
    /// The probe observed what it expected.
    Success,
    /// A resolution succeeded but returned the wrong address.
    WrongIp,
    /// The exit's resolver failed the lookup (NXDOMAIN et al.).
    DnsFail,
    /// A single attempt exceeded its query timeout.
    Timeout,
    /// The SOCKS connection ended mid-exchange.
    EofError,
    /// The connection to the local Tor client was lost.
    TorConnectionLost,
    /// The local Tor client refused our connection.
    TorConnectionRefused,
    /// The whole probe exceeded its hard timeout.
    HardTimeout,
    /// An unexpected error not covered by the other tokens.
    Exception,
    /// SOCKS reply code 1.
    SocksGeneralFailure,
    /// SOCKS reply code 2.
    SocksRulesetBlocked,
    /// SOCKS reply code 3.
    NetworkUnreachable,
    /// SOCKS reply code 5.
    ConnectionRefused,
    /// SOCKS reply code 6.
    TtlExpired,
    /// SOCKS reply code 7.
    SocksCommandUnsupported,
    /// SOCKS reply code 8.
    SocksAddressUnsupported,
}

impl ProbeStatus {
    /// The stable token for this status.
    pub fn as_token(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "success",
            ProbeStatus::WrongIp => "wrong_ip",
            ProbeStatus::DnsFail => "dns_fail",
            ProbeStatus::Timeout => "timeout",
            ProbeStatus::EofError => "eof_error",
            ProbeStatus::TorConnectionLost => "tor_connection_lost",
            ProbeStatus::TorConnectionRefused => "tor_connection_refused",
            ProbeStatus::HardTimeout => "hard_timeout",
            ProbeStatus::Exception => "exception",
            ProbeStatus::SocksGeneralFailure => "socks_general_failure",
            ProbeStatus::SocksRulesetBlocked => "socks_ruleset_blocked",
            ProbeStatus::NetworkUnreachable => "network_unreachable",
            ProbeStatus::ConnectionRefused => "connection_refused",
            ProbeStatus::TtlExpired => "ttl_expired",
            ProbeStatus::SocksCommandUnsupported => "socks_command_unsupported",
            ProbeStatus::SocksAddressUnsupported => "socks_address_unsupported",
        }
    }
}

impl Display for ProbeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_token())
    }
}

/// The relay-search page for an exit, for quick operator lookup.
pub fn exit_url(fingerprint: &str) -> String {
    format!("https://metrics.torproject.org/rs.html#details/{}", fingerprint)
}

/// One per-relay probe record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ProbeResult {
    /// The exit's fingerprint (40 hex digits).
    pub fingerprint: String,
    /// The exit's nickname.
    pub nickname: String,
    /// The exit's OR address.
    pub address: String,
    /// Metrics page for the exit.
    pub exit_url: String,
    /// The DNS name the probe queried.
    pub query: String,
    /// The address we expected back (wildcard mode only).
    pub expected_ip: Option<String>,
    /// When the probe finished (Unix seconds).
    pub timestamp: u64,
    /// The run this record belongs to.
    pub run_id: String,
    /// Which check mode produced the record.
    pub mode: ProbeMode,
    /// The circuit's first hop, when known.
    pub first_hop: Option<String>,
    /// The probe's terminal status.
    pub status: ProbeStatus,
    /// The resolved address, `"NXDOMAIN"`, or null.
    pub resolved_ip: Option<String>,
    /// Wall-clock latency of the deciding attempt, in milliseconds.
    pub latency_ms: Option<u64>,
    /// Error detail for non-success statuses.
    pub error: Option<String>,
    /// Which attempt produced the terminal status (1-based).
    pub attempt: u32,
}

/// Writes result records and aggregates the status histogram.
pub struct ResultSink {
    /// Directory all records of this run go into.
    dir: PathBuf,
    /// The run identifier embedded in every record.
    run_id: String,
    /// Count of results per status.
    histogram: Mutex<HashMap<ProbeStatus, u64>>,
}

impl ResultSink {
    /// Create a sink writing under `analysis_dir/run_id`.
    ///
    /// `analysis_dir` falls back to `/tmp` when the operator gave none.
    pub fn new(analysis_dir: Option<&Path>, run_id: String) -> Self {
        let base = analysis_dir.unwrap_or_else(|| Path::new("/tmp"));
        ResultSink {
            dir: base.join(&run_id),
            run_id,
            histogram: Mutex::new(HashMap::new()),
        }
    }

    /// The run identifier.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// The directory records are written into.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Record one probe result: write its JSON file and count its
    /// status.
    pub fn record(&self, module: &str, result: &ProbeResult) -> Result<PathBuf> {
        {
            let mut histogram = self.histogram.lock().unwrap_or_else(|e| e.into_inner());
            *histogram.entry(result.status).or_insert(0) += 1;
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self
            .dir
            .join(format!("{}_{}.json", module, result.fingerprint));
        let json = serde_json::to_string_pretty(result)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(&path, json)?;
        debug!("Wrote result for {} to {:?}.", result.fingerprint, path);
        Ok(path)
    }

    /// A snapshot of the status histogram.
    pub fn histogram(&self) -> HashMap<ProbeStatus, u64> {
        self.histogram
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    fn sample(status: ProbeStatus) -> ProbeResult {
        ProbeResult {
            fingerprint: "ABCDEF0123456789ABCDEF0123456789ABCD7890".into(),
            nickname: "exity".into(),
            address: "198.51.100.7".into(),
            exit_url: exit_url("ABCDEF0123456789ABCDEF0123456789ABCD7890"),
            query: "deadbeef.abcdef01.tor.exit.validator.1aeo.com".into(),
            expected_ip: Some("64.65.4.1".into()),
            timestamp: 1_767_225_600,
            run_id: "2026-01-01_00:00:00_dnshealth".into(),
            mode: ProbeMode::Wildcard,
            first_hop: None,
            status,
            resolved_ip: Some("64.65.4.1".into()),
            latency_ms: Some(42),
            error: None,
            attempt: 1,
        }
    }

    #[test]
    fn schema_is_stable() {
        // Downstream tooling keys on these exact names and tokens.
        let json = serde_json::to_value(sample(ProbeStatus::Success)).unwrap();
        for field in [
            "fingerprint",
            "nickname",
            "address",
            "exit_url",
            "query",
            "expected_ip",
            "timestamp",
            "run_id",
            "mode",
            "first_hop",
            "status",
            "resolved_ip",
            "latency_ms",
            "error",
            "attempt",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(json["mode"], "wildcard");
        assert_eq!(json["status"], "success");

        let json = serde_json::to_value(sample(ProbeStatus::TorConnectionLost)).unwrap();
        assert_eq!(json["status"], "tor_connection_lost");
    }

    #[test]
    fn tokens_match_serde() {
        for status in [
            ProbeStatus::Success,
            ProbeStatus::WrongIp,
            ProbeStatus::DnsFail,
            ProbeStatus::HardTimeout,
            ProbeStatus::SocksRulesetBlocked,
        ] {
            let via_serde = serde_json::to_value(status).unwrap();
            assert_eq!(via_serde, status.as_token());
        }
    }

    #[test]
    fn writes_one_file_per_relay() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = ResultSink::new(Some(tmp.path()), "run_test".into());
        let path = sink.record("dnshealth", &sample(ProbeStatus::Success)).unwrap();
        assert!(path.ends_with(
            "run_test/dnshealth_ABCDEF0123456789ABCDEF0123456789ABCD7890.json"
        ));
        let text = std::fs::read_to_string(&path).unwrap();
        let back: ProbeResult = serde_json::from_str(&text).unwrap();
        assert_eq!(back.status, ProbeStatus::Success);

        sink.record("dnshealth", &sample(ProbeStatus::WrongIp)).unwrap();
        let histogram = sink.histogram();
        assert_eq!(histogram[&ProbeStatus::Success], 1);
        assert_eq!(histogram[&ProbeStatus::WrongIp], 1);
    }
}
