//! Pair up streams with the circuits their probes intend to use.
//!
//! Two event flows race each other: the control port tells us about a
//! new unattached stream (with the local source port that opened it),
//! and the probe worker tells us which circuit the connection it just
//! made from that source port belongs to.  Whichever side arrives first
//! parks in a table keyed by source port; the second arrival completes
//! the pair.
//!
//! Correctness hinges on the take-or-insert being a single critical
//! section: checking and inserting separately would allow the classic
//! lost-wakeup interleaving where both sides park and nobody attaches.

use exitmap_control::{CircuitId, StreamId};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

/// Half of an attach, waiting for its counterpart.
#[derive(Clone, Debug)]
enum Pending {
    /// The circuit id arrived first.
    Circuit(CircuitId),
    /// The stream id arrived first.
    Stream(StreamId),
}

/// A matched pair, ready to be attached by the caller.
pub type AttachPair = (StreamId, CircuitId);

/// The attach table.
///
/// Thread-safe; every operation is a single short critical section.
/// Entries whose counterpart never shows up are abandoned in place and
/// die with the table when the scan's worker is gone; there is no
/// per-slot timer.
#[derive(Default)]
pub struct Attacher {
    /// In-flight halves, keyed by local source port.
    slots: Mutex<HashMap<u16, Pending>>,
}

impl Attacher {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Offer the circuit half for `port`.
    ///
    /// Returns the completed pair if the stream half was already
    /// waiting.
    pub fn prepare_circuit(&self, port: u16, circuit: CircuitId) -> Option<AttachPair> {
        self.prepare(port, Pending::Circuit(circuit))
    }

    /// Offer the stream half for `port`.
    ///
    /// Returns the completed pair if the circuit half was already
    /// waiting.
    pub fn prepare_stream(&self, port: u16, stream: StreamId) -> Option<AttachPair> {
        self.prepare(port, Pending::Stream(stream))
    }

    /// Atomic take-or-insert.
    fn prepare(&self, port: u16, offer: Pending) -> Option<AttachPair> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let matched = match (slots.remove(&port), offer) {
            (Some(Pending::Circuit(c)), Pending::Stream(s))
            | (Some(Pending::Stream(s)), Pending::Circuit(c)) => Some((s, c)),
            (None, offer) => {
                slots.insert(port, offer);
                None
            }
            (Some(stale), offer) => {
                // Two arrivals of the same kind on one port: the port
                // has been reused before its old entry was matched.
                // Keep the newer one.
                warn!(
                    "Replacing stale pending attach on port {}: {:?}",
                    port, stale
                );
                slots.insert(port, offer);
                None
            }
        };
        debug!("Pending attachers: {}.", slots.len());
        matched
    }

    /// Number of halves still waiting.
    pub fn pending(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use std::sync::Arc;

    fn cid(n: u32) -> CircuitId {
        CircuitId::new(n.to_string())
    }

    fn sid(n: u32) -> StreamId {
        StreamId::new(n.to_string())
    }

    #[test]
    fn circuit_then_stream() {
        let attacher = Attacher::new();
        assert!(attacher.prepare_circuit(4000, cid(1)).is_none());
        assert_eq!(attacher.pending(), 1);
        let (s, c) = attacher.prepare_stream(4000, sid(7)).unwrap();
        assert_eq!((s.as_str(), c.as_str()), ("7", "1"));
        assert_eq!(attacher.pending(), 0);
    }

    #[test]
    fn stream_then_circuit() {
        let attacher = Attacher::new();
        assert!(attacher.prepare_stream(4000, sid(7)).is_none());
        let (s, c) = attacher.prepare_circuit(4000, cid(1)).unwrap();
        assert_eq!((s.as_str(), c.as_str()), ("7", "1"));
        assert_eq!(attacher.pending(), 0);
    }

    #[test]
    fn ports_do_not_interfere() {
        let attacher = Attacher::new();
        assert!(attacher.prepare_circuit(4000, cid(1)).is_none());
        assert!(attacher.prepare_stream(4001, sid(7)).is_none());
        assert_eq!(attacher.pending(), 2);
        assert!(attacher.prepare_stream(4000, sid(8)).is_some());
        assert!(attacher.prepare_circuit(4001, cid(2)).is_some());
        assert_eq!(attacher.pending(), 0);
    }

    #[test]
    fn duplicate_side_replaces() {
        let attacher = Attacher::new();
        assert!(attacher.prepare_circuit(4000, cid(1)).is_none());
        assert!(attacher.prepare_circuit(4000, cid(2)).is_none());
        let (_, c) = attacher.prepare_stream(4000, sid(7)).unwrap();
        assert_eq!(c.as_str(), "2");
        assert_eq!(attacher.pending(), 0);
    }

    /// Exactly one attach per matched pair, under every interleaving
    /// two racing threads can produce.
    #[test]
    fn concurrent_hammer() {
        const PORTS: u16 = 500;
        let attacher = Arc::new(Attacher::new());

        let a = Arc::clone(&attacher);
        let circuits = std::thread::spawn(move || {
            let mut matched = 0_u32;
            for port in 0..PORTS {
                if a.prepare_circuit(port, cid(u32::from(port))).is_some() {
                    matched += 1;
                }
            }
            matched
        });
        let a = Arc::clone(&attacher);
        let streams = std::thread::spawn(move || {
            let mut matched = 0_u32;
            for port in 0..PORTS {
                if a.prepare_stream(port, sid(u32::from(port))).is_some() {
                    matched += 1;
                }
            }
            matched
        });

        let total = circuits.join().unwrap() + streams.join().unwrap();
        // Every pair was matched by exactly one of the two callers, and
        // the table drained completely.
        assert_eq!(total, u32::from(PORTS));
        assert_eq!(attacher.pending(), 0);
    }
}
