//! Scan statistics and the circuit registry.
//!
//! The registry is the ground truth for "which exit did this circuit
//! target?": the client does not reliably echo the requested path when
//! a circuit fails, so we record the intended path ourselves before
//! asking for the circuit, and resolve terminal events against that
//! record.
//!
//! Thread ownership: a `Statistics` value is owned and written
//! exclusively by the scan reactor task; nothing here needs a lock.

use exitmap_control::{CircEvent, CircStatus, CircuitId, Fingerprint};
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};
use std::time::{Instant, SystemTime};
use tracing::{debug, info};

/// Seconds since the Unix epoch, for result records.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Map a raw circuit-failure reason from the client onto a stable JSON
/// key and a human-readable message.
pub fn failure_info(reason: Option<&str>) -> (&'static str, String) {
    let raw = reason.unwrap_or("UNKNOWN").to_ascii_uppercase();
    let (key, text) = match raw.as_str() {
        "TIMEOUT" => ("circuit_timeout", "Construction timed out"),
        "CONNECTFAILED" => ("relay_connect_failed", "Could not connect to relay"),
        "NOPATH" => ("circuit_no_path", "No path available"),
        "RESOURCELIMIT" => ("relay_resource_limit", "Relay at capacity"),
        "HIBERNATING" => ("relay_hibernating", "Relay is hibernating"),
        "DESTROYED" => ("circuit_destroyed", "Circuit was closed"),
        "FINISHED" => ("circuit_finished", "Circuit finished normally"),
        "OR_CONN_CLOSED" => ("relay_connection_closed", "Connection to relay closed"),
        "CHANNEL_CLOSED" => ("channel_closed", "Relay channel closed unexpectedly"),
        "IOERROR" => ("io_error", "I/O error on connection"),
        "TORPROTOCOL" => ("tor_protocol_error", "Protocol violation"),
        "INTERNAL" => ("tor_internal_error", "Internal error"),
        "REQUESTED" => ("circuit_requested", "Circuit close requested"),
        "NOSUCHSERVICE" => ("no_such_service", "Hidden service not found"),
        "MEASUREMENT_EXPIRED" => ("measurement_expired", "Measurement expired"),
        "GUARD_LIMIT_REACHED" => ("guard_limit", "Guard circuit limit reached"),
        other => {
            return (
                "circuit_failed",
                format!("Tor Circuit Error: Unknown failure ({})", other),
            )
        }
    };
    (key, format!("Tor Circuit Error: {}", text))
}

/// What we know about a failed circuit.
#[derive(Clone, Debug)]
pub struct CircuitFailure {
    /// The stable reason key (see [`failure_info`]).
    pub reason_key: &'static str,
    /// A human-readable message.
    pub error: String,
    /// The raw reason token the client reported.
    pub tor_reason: String,
    /// The intended first hop, when the registry knew the circuit.
    pub first_hop: Option<Fingerprint>,
    /// When the failure was recorded (Unix seconds).
    pub timestamp: u64,
    /// True if the circuit id was not in the registry.
    pub unresolved: bool,
}

/// The intended path of a circuit we have requested.
#[derive(Clone, Debug)]
struct PendingCircuit {
    /// First hop of the requested path.
    first_hop: Fingerprint,
    /// Intended exit relay.
    exit: Fingerprint,
    /// When the circuit was requested.
    #[allow(dead_code)] // kept for debugging dumps
    created_at: u64,
}

/// Counters and per-relay failure records for one scan.
pub struct Statistics {
    /// When this statistics object was created.
    start: Instant,
    /// Circuits we decided to build (including ones that failed
    /// synchronously before getting an id).
    pub total_circuits: u64,
    /// Circuits that reached BUILT.
    pub successful_circuits: u64,
    /// Circuits that failed, either via a FAILED event or an immediate
    /// creation error.
    pub failed_circuits: u64,
    /// Probes that signalled completion.
    pub finished_streams: u64,
    /// Number of modules run so far.
    pub modules_run: u64,
    /// Failure details, keyed by exit fingerprint (or a synthetic
    /// `UNRESOLVED_<cid>` key when the registry had no entry).
    failed_circuit_relays: HashMap<String, CircuitFailure>,
    /// The circuit registry.
    pending_circuits: HashMap<CircuitId, PendingCircuit>,
}

impl Statistics {
    /// Create a fresh statistics object.
    pub fn new() -> Self {
        Statistics {
            start: Instant::now(),
            total_circuits: 0,
            successful_circuits: 0,
            failed_circuits: 0,
            finished_streams: 0,
            modules_run: 0,
            failed_circuit_relays: HashMap::new(),
            pending_circuits: HashMap::new(),
        }
    }

    /// Register a circuit we are about to create.
    ///
    /// Must be called before any event for `circuit` can be processed;
    /// the reactor guarantees this by registering on the same task that
    /// dispatches events.
    pub fn register_circuit(
        &mut self,
        circuit: CircuitId,
        first_hop: Fingerprint,
        exit: Fingerprint,
    ) {
        debug!(
            "Registered circuit {}: {} -> {}",
            circuit,
            first_hop.short(),
            exit.short()
        );
        self.pending_circuits.insert(
            circuit,
            PendingCircuit {
                first_hop,
                exit,
                created_at: unix_now(),
            },
        );
        if self.pending_circuits.len() % 100 == 0 {
            info!(
                "Circuit registry: {} circuits registered",
                self.pending_circuits.len()
            );
        }
    }

    /// Look up the intended path for a circuit.
    pub fn resolve_circuit(&self, circuit: &CircuitId) -> Option<(Fingerprint, Fingerprint)> {
        self.pending_circuits
            .get(circuit)
            .map(|p| (p.first_hop, p.exit))
    }

    /// Drop a circuit from the registry after its terminal transition.
    pub fn complete_circuit(&mut self, circuit: &CircuitId) {
        self.pending_circuits.remove(circuit);
    }

    /// Number of circuits registered but not yet terminal.
    pub fn in_flight(&self) -> usize {
        self.pending_circuits.len()
    }

    /// Record a circuit whose creation request failed synchronously,
    /// before the client assigned an id.
    pub fn record_immediate_failure(
        &mut self,
        first_hop: Fingerprint,
        exit: Fingerprint,
        error: &str,
    ) {
        debug!(
            "Recorded immediate circuit failure for {}: {}",
            exit.short(),
            error
        );
        self.failed_circuits += 1;
        self.failed_circuit_relays.insert(
            exit.to_string(),
            CircuitFailure {
                reason_key: "circuit_creation_failed",
                error: format!("Tor Circuit Error: Failed to create circuit ({})", error),
                tor_reason: "CREATION_FAILED".to_owned(),
                first_hop: Some(first_hop),
                timestamp: unix_now(),
                unresolved: false,
            },
        );
    }

    /// Update counters from a terminal circuit event.
    ///
    /// BUILT and FAILED transitions pop the registry; everything else
    /// is ignored.  Only circuits we registered move the counters: the
    /// client also reports circuits it opened on its own behalf, and
    /// counting those would make `failed + successful` overshoot
    /// `total` and leave the termination predicate unsatisfiable.
    /// Unsolicited failures are still recorded, under a synthetic key.
    pub fn update_circs(&mut self, ev: &CircEvent) {
        match ev.status {
            CircStatus::Failed => {
                debug!("Circuit {} failed: {:?}", ev.id, ev.reason);
                let resolved = self.resolve_circuit(&ev.id);
                let (reason_key, error) = failure_info(ev.reason.as_deref());
                let tor_reason = ev
                    .reason
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN".to_owned());
                match resolved {
                    Some((first_hop, exit)) => {
                        self.failed_circuits += 1;
                        self.failed_circuit_relays.insert(
                            exit.to_string(),
                            CircuitFailure {
                                reason_key,
                                error,
                                tor_reason,
                                first_hop: Some(first_hop),
                                timestamp: unix_now(),
                                unresolved: false,
                            },
                        );
                    }
                    None => {
                        debug!("Circuit {} not in registry; recording as unresolved.", ev.id);
                        self.failed_circuit_relays.insert(
                            format!("UNRESOLVED_{}", ev.id),
                            CircuitFailure {
                                reason_key,
                                error,
                                tor_reason,
                                first_hop: None,
                                timestamp: unix_now(),
                                unresolved: true,
                            },
                        );
                    }
                }
                self.complete_circuit(&ev.id);
            }
            CircStatus::Built => {
                if self.resolve_circuit(&ev.id).is_some() {
                    self.successful_circuits += 1;
                } else {
                    debug!("Ignoring BUILT for unregistered circuit {}.", ev.id);
                }
                self.complete_circuit(&ev.id);
            }
            _ => {}
        }
    }

    /// The recorded per-relay failures.
    pub fn failed_circuit_relays(&self) -> &HashMap<String, CircuitFailure> {
        &self.failed_circuit_relays
    }

    /// Log a progress line every `sampling` finished probes.
    pub fn print_progress(&self, sampling: u64) {
        if sampling == 0
            || self.total_circuits == 0
            || self.finished_streams % sampling != 0
        {
            return;
        }
        let percent =
            (self.successful_circuits as f64 / self.total_circuits as f64) * 100.0;
        info!(
            "Probed {} out of {} exit relays, so we are {:.2}% done.",
            self.successful_circuits, self.total_circuits, percent
        );
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for Statistics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let percent = if self.total_circuits > 0 {
            (self.failed_circuits as f64 / self.total_circuits as f64) * 100.0
        } else {
            0.0
        };
        write!(
            f,
            "Ran {} module(s) in {} and {}/{} circuits failed ({:.2}%).",
            self.modules_run,
            humantime::format_duration(std::time::Duration::from_secs(
                self.start.elapsed().as_secs()
            )),
            self.failed_circuits,
            self.total_circuits,
            percent
        )
    }
}
