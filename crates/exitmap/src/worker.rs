//! Probe workers: one task per built circuit.
//!
//! A worker runs the module's probe with the circuit-pinned I/O facade
//! and sends exactly one completion token when it is done.  Workers that
//! outlive the scan are given a slice of the grace window and then
//! aborted; their exit fingerprints are reported to the module's
//! teardown.

use crate::modules::{ProbeCtx, ProbeModule};
use exitmap_control::{CircuitId, Fingerprint};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A message from a probe worker to the scan reactor.
#[derive(Clone, Debug)]
pub enum WorkerMsg {
    /// "Source port `port` belongs to `circuit`": attach the stream
    /// that the client is about to announce for that port.
    Attach {
        /// The circuit the probe is pinned to.
        circuit: CircuitId,
        /// The local source port of the probe's SOCKS connection.
        port: u16,
    },
    /// The probe for `circuit` is done; close the circuit and count
    /// the completion.
    Finished {
        /// The probe's circuit.
        circuit: CircuitId,
    },
}

/// One live worker.
struct Worker {
    /// The exit relay the worker is probing.
    exit: Fingerprint,
    /// The worker task.
    handle: JoinHandle<()>,
}

/// All live workers, keyed by circuit.
#[derive(Default)]
pub struct WorkerPool {
    /// Live workers.
    workers: HashMap<CircuitId, Worker>,
}

impl WorkerPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker probing `exit` over `circuit`.
    pub fn spawn(
        &mut self,
        circuit: CircuitId,
        exit: Fingerprint,
        module: Arc<dyn ProbeModule>,
        ctx: ProbeCtx,
        reactor_tx: mpsc::UnboundedSender<WorkerMsg>,
    ) {
        let completion_circuit = circuit.clone();
        let handle = tokio::spawn(async move {
            module.probe(ctx).await;
            debug!("Informing the reactor that the probe finished.");
            let _ = reactor_tx.send(WorkerMsg::Finished {
                circuit: completion_circuit,
            });
        });
        self.workers.insert(circuit, Worker { exit, handle });
    }

    /// Retire the worker for `circuit` after its completion token.
    pub fn finish(&mut self, circuit: &CircuitId) -> Option<Fingerprint> {
        self.workers.remove(circuit).map(|w| w.exit)
    }

    /// Number of live workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// True if no workers are live.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Give every remaining worker a slice of `grace`, then abort the
    /// rest.
    ///
    /// Returns the exit fingerprints of the workers that had to be
    /// terminated.
    pub async fn terminate_stragglers(&mut self, grace: Duration) -> Vec<Fingerprint> {
        let mut terminated = Vec::new();
        let live = self.workers.len();
        if live == 0 {
            return terminated;
        }
        let slice = std::cmp::max(grace / live as u32, Duration::from_secs(1));
        for (circuit, mut worker) in self.workers.drain() {
            match tokio::time::timeout(slice, &mut worker.handle).await {
                Ok(_) => {}
                Err(_) => {
                    warn!(
                        "Probe for {} (circuit {}) still running; terminating it.",
                        worker.exit.short(),
                        circuit
                    );
                    worker.handle.abort();
                    terminated.push(worker.exit);
                }
            }
        }
        terminated
    }
}
