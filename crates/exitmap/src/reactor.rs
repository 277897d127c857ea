//! The scan reactor: the single task that drives a scan.
//!
//! One `select!` loop multiplexes three sources:
//!
//! * control-port events (CIRC and STREAM),
//! * worker messages (attach requests and completion tokens),
//! * the build pacer, which triggers the next circuit request.
//!
//! Folding circuit creation into the same task gives the ordering
//! guarantee the registry needs for free: a circuit is registered
//! immediately after EXTENDCIRCUIT returns, on the same task that
//! dispatches events, so no event for that circuit can be processed
//! first.  It also makes this task the only writer of the statistics
//! and the registry.

use crate::attacher::Attacher;
use crate::consensus::Consensus;
use crate::modules::{ProbeCtx, ProbeModule};
use crate::selector::ExitDestinations;
use crate::sink::ResultSink;
use crate::socksio::SocksCircuitIo;
use crate::stats::Statistics;
use crate::worker::{WorkerMsg, WorkerPool};
use async_trait::async_trait;
use exitmap_control::{
    CircEvent, CircStatus, CircuitId, ControlEvent, ControlHandle, Fingerprint, StreamEvent,
    StreamId, StreamStatus,
};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// The control-port operations the reactor needs.
///
/// A seam for testing: the production implementation is
/// [`ControlHandle`]; tests substitute a mock that scripts circuit
/// outcomes.
#[async_trait]
pub trait ScanControl: Send + Sync {
    /// Request a new circuit through `path`.
    async fn extend_circuit(&self, path: &[Fingerprint]) -> exitmap_control::Result<CircuitId>;

    /// Attach `stream` to `circuit`.
    async fn attach_stream(
        &self,
        stream: &StreamId,
        circuit: &CircuitId,
    ) -> exitmap_control::Result<()>;

    /// Close `circuit`.
    async fn close_circuit(&self, circuit: &CircuitId) -> exitmap_control::Result<()>;
}

#[async_trait]
impl ScanControl for ControlHandle {
    async fn extend_circuit(&self, path: &[Fingerprint]) -> exitmap_control::Result<CircuitId> {
        ControlHandle::extend_circuit(self, path).await
    }

    async fn attach_stream(
        &self,
        stream: &StreamId,
        circuit: &CircuitId,
    ) -> exitmap_control::Result<()> {
        ControlHandle::attach_stream(self, stream, circuit).await
    }

    async fn close_circuit(&self, circuit: &CircuitId) -> exitmap_control::Result<()> {
        ControlHandle::close_circuit(self, circuit).await
    }
}

/// Everything a scan needs to run.
pub struct ScanPlan {
    /// The exits to probe, already shuffled.
    pub exits: Vec<Fingerprint>,
    /// Destinations each exit's policy accepts.
    pub exit_destinations: ExitDestinations,
    /// Circuits to build per exit.
    pub redundancy: usize,
    /// Delay between circuit builds for distinct exits, in seconds.
    pub build_delay: f64,
    /// Randomisation bound for the build delay, in seconds.
    pub delay_noise: f64,
    /// Operator-pinned first hop, if any.
    pub pinned_first_hop: Option<Fingerprint>,
    /// Pool of first-hop candidates for random selection.
    pub first_hop_candidates: Vec<Fingerprint>,
    /// Grace window for stragglers after the scan finishes.
    pub grace: Duration,
    /// The client's SOCKS listener.
    pub socks_addr: SocketAddr,
    /// The `-H` destination override.
    pub target_host: Option<String>,
    /// The `-p` destination override.
    pub target_port: Option<u16>,
}

/// What a finished scan leaves behind.
pub struct ScanOutcome {
    /// Final statistics (ownership returns to the orchestrator).
    pub stats: Statistics,
    /// Exits whose probes had to be terminated.
    pub terminated: Vec<Fingerprint>,
}

/// State for one scan run.
pub struct ScanReactor<C> {
    /// The control-port seam.
    control: Arc<C>,
    /// The module being run.
    module: Arc<dyn ProbeModule>,
    /// The run's result sink.
    sink: Arc<ResultSink>,
    /// The loaded consensus (shared, immutable).
    consensus: Arc<Consensus>,
    /// The scan plan.
    plan: ScanPlan,
    /// Stream/circuit pairing table.
    attacher: Attacher,
    /// Counters and the circuit registry; this task is the only
    /// writer.
    stats: Statistics,
    /// Live probe workers.
    pool: WorkerPool,
    /// Set once the termination condition has fired.
    finished: bool,
}

impl<C: ScanControl + 'static> ScanReactor<C> {
    /// Create a reactor.
    pub fn new(
        control: Arc<C>,
        module: Arc<dyn ProbeModule>,
        sink: Arc<ResultSink>,
        consensus: Arc<Consensus>,
        plan: ScanPlan,
        stats: Statistics,
    ) -> Self {
        ScanReactor {
            control,
            module,
            sink,
            consensus,
            plan,
            attacher: Attacher::new(),
            stats,
            pool: WorkerPool::new(),
            finished: false,
        }
    }

    /// Drive the scan to completion.
    pub async fn run(
        mut self,
        events: &mut mpsc::UnboundedReceiver<ControlEvent>,
    ) -> ScanOutcome {
        let (worker_tx, mut worker_rx) = mpsc::unbounded_channel();

        let mut queue: VecDeque<Fingerprint> = self.plan.exits.clone().into();
        self.stats.total_circuits = (queue.len() * self.plan.redundancy) as u64;
        info!(
            "Beginning to trigger {} circuit creation(s).",
            self.stats.total_circuits
        );
        if self.plan.build_delay > 0.0 {
            let estimate = Duration::from_secs_f64(
                self.plan.build_delay * queue.len() as f64,
            );
            info!(
                "Scan is estimated to take around {}.",
                humantime::format_duration(estimate)
            );
        }

        let mut pacer = Box::pin(tokio::time::sleep(Duration::ZERO));
        loop {
            if self.check_finished() {
                break;
            }
            tokio::select! {
                maybe_ev = events.recv() => match maybe_ev {
                    Some(ev) => self.handle_event(ev, &worker_tx).await,
                    None => {
                        warn!("Control event stream ended; aborting the scan.");
                        break;
                    }
                },
                Some(msg) = worker_rx.recv() => self.handle_worker_msg(msg).await,
                _ = &mut pacer, if !queue.is_empty() => {
                    if let Some(exit) = queue.pop_front() {
                        self.build_circuits_for(exit).await;
                    }
                    if !queue.is_empty() {
                        pacer = Box::pin(tokio::time::sleep(jittered(
                            self.plan.build_delay,
                            self.plan.delay_noise,
                        )));
                    }
                }
            }
        }

        let terminated = self.pool.terminate_stragglers(self.plan.grace).await;
        if !terminated.is_empty() {
            info!("Terminated {} stalled relays.", terminated.len());
        }
        self.module
            .teardown(&self.stats, &self.sink, &terminated)
            .await;
        ScanOutcome {
            stats: self.stats,
            terminated,
        }
    }

    /// Evaluate the termination condition; true at most once.
    ///
    /// `circs_done`: every requested circuit reached a terminal state.
    /// `streams_done`: every built circuit's probe signalled
    /// completion.  (Each BUILT circuit yields exactly one completion
    /// token; failed circuits consume none.)
    fn check_finished(&mut self) -> bool {
        if self.finished {
            return true;
        }
        let circs_done = self.stats.failed_circuits + self.stats.successful_circuits
            == self.stats.total_circuits;
        let streams_done = self.stats.finished_streams >= self.stats.successful_circuits;
        debug!(
            "failedCircs={}, builtCircs={}, totalCircs={}, finishedStreams={}",
            self.stats.failed_circuits,
            self.stats.successful_circuits,
            self.stats.total_circuits,
            self.stats.finished_streams
        );
        if circs_done && streams_done {
            self.finished = true;
        }
        self.finished
    }

    /// Dispatch one control-port event.
    async fn handle_event(
        &mut self,
        ev: ControlEvent,
        worker_tx: &mpsc::UnboundedSender<WorkerMsg>,
    ) {
        match ev {
            ControlEvent::Circ(ev) => self.handle_circ(ev, worker_tx).await,
            ControlEvent::Stream(ev) => self.handle_stream(ev).await,
            ControlEvent::Other(body) => debug!("Ignoring event: {}", body),
            _ => debug!("Ignoring unknown event"),
        }
    }

    /// Handle a CIRC event: account for terminal transitions and spawn
    /// a probe on BUILT.
    async fn handle_circ(
        &mut self,
        ev: CircEvent,
        worker_tx: &mpsc::UnboundedSender<WorkerMsg>,
    ) {
        // Resolve the intended path before update_circs pops the
        // registry entry.
        let registered = self.stats.resolve_circuit(&ev.id);
        self.stats.update_circs(&ev);
        if ev.status != CircStatus::Built {
            return;
        }

        // The registry is authoritative: the client does not reliably
        // echo the requested path, and circuits it opened on its own
        // behalf are none of our business.
        let Some((first_hop, exit)) = registered else {
            warn!("BUILT circuit {} is not ours; closing it.", ev.id);
            self.close_circuit(&ev.id).await;
            return;
        };

        let Some(relay) = self.consensus.get(&exit).cloned() else {
            warn!(
                "No consensus entry for exit {}; closing circuit {}.",
                exit, ev.id
            );
            self.close_circuit(&ev.id).await;
            self.stats.finished_streams += 1;
            return;
        };

        debug!(
            "Circuit for exit relay {} is built (first hop: {}).  Now invoking probing module.",
            exit.short(),
            first_hop.short()
        );
        let ctx = ProbeCtx {
            exit: relay,
            destinations: self
                .plan
                .exit_destinations
                .get(&exit)
                .cloned()
                .unwrap_or_default(),
            target_host: self.plan.target_host.clone(),
            target_port: self.plan.target_port,
            first_hop: Some(first_hop),
            io: Arc::new(SocksCircuitIo::new(
                self.plan.socks_addr,
                ev.id.clone(),
                worker_tx.clone(),
            )),
            sink: Arc::clone(&self.sink),
        };
        self.pool.spawn(
            ev.id,
            exit,
            Arc::clone(&self.module),
            ctx,
            worker_tx.clone(),
        );
    }

    /// Handle a STREAM event: offer the stream half to the attacher.
    async fn handle_stream(&mut self, ev: StreamEvent) {
        if !matches!(ev.status, StreamStatus::New | StreamStatus::NewResolve) {
            return;
        }
        let Some(port) = ev.source_port() else {
            warn!(
                "Couldn't extract source port from stream event: {} {:?}",
                ev.id, ev.source_addr
            );
            return;
        };
        debug!("Adding attacher for new stream {}.", ev.id);
        if let Some((stream, circuit)) = self.attacher.prepare_stream(port, ev.id) {
            self.attach(stream, circuit).await;
        }
    }

    /// Handle one worker message.
    async fn handle_worker_msg(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::Attach { circuit, port } => {
                if let Some((stream, circuit)) = self.attacher.prepare_circuit(port, circuit) {
                    self.attach(stream, circuit).await;
                }
            }
            WorkerMsg::Finished { circuit } => {
                debug!("Closing finished circuit {}.", circuit);
                self.close_circuit(&circuit).await;
                self.stats.finished_streams += 1;
                self.stats.print_progress(50);
                self.pool.finish(&circuit);
            }
        }
    }

    /// Issue one ATTACHSTREAM; rejection is logged and dropped, and
    /// the probe will observe its stream closing.
    async fn attach(&self, stream: StreamId, circuit: CircuitId) {
        debug!(
            "Attempting to attach stream {} to circuit {}.",
            stream, circuit
        );
        if let Err(e) = self.control.attach_stream(&stream, &circuit).await {
            warn!("Failed to attach stream because: {}", e);
        }
    }

    /// Close a circuit, tolerating failure.
    async fn close_circuit(&self, circuit: &CircuitId) {
        if let Err(e) = self.control.close_circuit(circuit).await {
            debug!("Could not close circuit because: {}", e);
        }
    }

    /// Request `redundancy` circuits to `exit`, registering each.
    async fn build_circuits_for(&mut self, exit: Fingerprint) {
        for _ in 0..self.plan.redundancy.max(1) {
            let Some(first_hop) = self.pick_first_hop(&exit) else {
                self.stats
                    .record_immediate_failure(exit, exit, "no first hop available");
                continue;
            };
            match self.control.extend_circuit(&[first_hop, exit]).await {
                Ok(circuit) => {
                    self.stats.register_circuit(circuit, first_hop, exit);
                }
                Err(e) => {
                    debug!(
                        "Circuit with exit relay {} could not be created: {}",
                        exit.short(),
                        e
                    );
                    self.stats
                        .record_immediate_failure(first_hop, exit, &e.to_string());
                }
            }
        }
    }

    /// The pinned first hop, or a random candidate distinct from the
    /// exit.
    fn pick_first_hop(&self, exit: &Fingerprint) -> Option<Fingerprint> {
        if let Some(pinned) = self.plan.pinned_first_hop {
            return Some(pinned);
        }
        let mut rng = rand::thread_rng();
        // Rejection sampling: a collision with the exit is rare, so a
        // bounded retry loop almost never falls through to the scan.
        for _ in 0..8 {
            if let Some(fp) = self.plan.first_hop_candidates.choose(&mut rng) {
                if fp != exit {
                    return Some(*fp);
                }
            } else {
                return None;
            }
        }
        self.plan
            .first_hop_candidates
            .iter()
            .find(|fp| *fp != exit)
            .copied()
    }
}

/// The build delay with its random noise applied, clamped at zero.
fn jittered(delay: f64, noise: f64) -> Duration {
    let mut delay = delay;
    if noise > 0.0 {
        let mut rng = rand::thread_rng();
        let sample: f64 = rng.gen_range(0.0..noise);
        if rng.gen::<bool>() {
            delay += sample;
        } else {
            delay -= sample;
        }
    }
    Duration::from_secs_f64(delay.max(0.0))
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::modules::SetupCtx;
    use crate::selector::Destination;
    use base64ct::{Base64Unpadded, Encoding};
    use exitmap_control::parse_event;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// A scripted controller: every even-numbered circuit BUILTs,
    /// every odd-numbered one FAILs.
    struct MockControl {
        /// Where the reactor listens for events.
        events_tx: mpsc::UnboundedSender<ControlEvent>,
        /// Next circuit id.
        next_id: AtomicU32,
        /// Attach calls seen.
        attached: Mutex<Vec<(String, String)>>,
        /// Close calls seen.
        closed: Mutex<Vec<String>>,
    }

    impl MockControl {
        fn new(events_tx: mpsc::UnboundedSender<ControlEvent>) -> Self {
            MockControl {
                events_tx,
                next_id: AtomicU32::new(0),
                attached: Mutex::new(Vec::new()),
                closed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ScanControl for MockControl {
        async fn extend_circuit(
            &self,
            path: &[Fingerprint],
        ) -> exitmap_control::Result<CircuitId> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let body = if id % 2 == 0 {
                format!("CIRC {} BUILT ${},${}", id, path[0], path[1])
            } else {
                format!("CIRC {} FAILED REASON=TIMEOUT", id)
            };
            self.events_tx.send(parse_event(&body).unwrap()).unwrap();
            Ok(CircuitId::new(id.to_string()))
        }

        async fn attach_stream(
            &self,
            stream: &StreamId,
            circuit: &CircuitId,
        ) -> exitmap_control::Result<()> {
            self.attached
                .lock()
                .unwrap()
                .push((stream.as_str().into(), circuit.as_str().into()));
            Ok(())
        }

        async fn close_circuit(&self, circuit: &CircuitId) -> exitmap_control::Result<()> {
            self.closed.lock().unwrap().push(circuit.as_str().into());
            Ok(())
        }
    }

    /// A probe that returns immediately.
    struct NullModule;

    #[async_trait]
    impl ProbeModule for NullModule {
        fn name(&self) -> &'static str {
            "null"
        }
        async fn setup(&self, _ctx: SetupCtx<'_>) -> crate::err::Result<()> {
            Ok(())
        }
        async fn probe(&self, _ctx: ProbeCtx) {}
        async fn teardown(
            &self,
            _stats: &Statistics,
            _sink: &ResultSink,
            _terminated: &[Fingerprint],
        ) {
        }
    }

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 20])
    }

    /// A consensus carrying the given exits (plus flags we need).
    fn consensus_for(exits: &[Fingerprint]) -> Consensus {
        let mut text = String::new();
        for (i, exit) in exits.iter().enumerate() {
            let identity = Base64Unpadded::encode_string(exit.as_bytes());
            text.push_str(&format!(
                "r ex{} {} AAAAAAAAAAAAAAAAAAAAAAAAAAA 2026-01-01 00:00:00 198.51.100.{} 9001 0\n\
                 s Exit Running Valid\n\
                 w Bandwidth=1000\n",
                i,
                identity,
                i + 1
            ));
        }
        Consensus::parse(&text)
    }

    fn plan_for(exits: Vec<Fingerprint>) -> ScanPlan {
        let exit_destinations: ExitDestinations = exits
            .iter()
            .map(|fp| (*fp, HashSet::<Destination>::new()))
            .collect();
        ScanPlan {
            exits,
            exit_destinations,
            redundancy: 1,
            build_delay: 0.0,
            delay_noise: 0.0,
            pinned_first_hop: Some(fp(0x01)),
            first_hop_candidates: Vec::new(),
            grace: Duration::from_secs(2),
            socks_addr: "127.0.0.1:1".parse().unwrap(),
            target_host: None,
            target_port: None,
        }
    }

    /// Everything a reactor test needs, wired together.
    struct Fixture {
        /// The scripted controller.
        control: Arc<MockControl>,
        /// Inject extra events here.
        events_tx: mpsc::UnboundedSender<ControlEvent>,
        /// The reactor's event source.
        events_rx: mpsc::UnboundedReceiver<ControlEvent>,
        /// The reactor under test.
        reactor: ScanReactor<MockControl>,
    }

    fn fixture(exits: Vec<Fingerprint>, sink_dir: &std::path::Path) -> Fixture {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let control = Arc::new(MockControl::new(events_tx.clone()));
        let sink = Arc::new(ResultSink::new(Some(sink_dir), "test_run".into()));
        let consensus = Arc::new(consensus_for(&exits));
        let reactor = ScanReactor::new(
            Arc::clone(&control),
            Arc::new(NullModule),
            sink,
            consensus,
            plan_for(exits),
            Statistics::new(),
        );
        Fixture {
            control,
            events_tx,
            events_rx,
            reactor,
        }
    }

    /// Deterministic BUILT/FAILED outcomes drive the scan to a clean
    /// shutdown with consistent accounting.
    #[tokio::test]
    async fn scan_terminates_with_consistent_accounting() {
        let tmp = tempfile::tempdir().unwrap();
        let exits: Vec<_> = (0xA0..0xA6_u8).map(fp).collect();
        let mut fx = fixture(exits, tmp.path());

        let outcome = fx.reactor.run(&mut fx.events_rx).await;
        let stats = &outcome.stats;
        assert_eq!(stats.total_circuits, 6);
        assert_eq!(
            stats.successful_circuits + stats.failed_circuits,
            stats.total_circuits
        );
        assert_eq!(stats.finished_streams, stats.successful_circuits);
        assert_eq!(stats.in_flight(), 0);
        assert!(outcome.terminated.is_empty());

        // Every failure was resolvable through the registry: no
        // synthetic UNRESOLVED keys.
        assert!(stats
            .failed_circuit_relays()
            .keys()
            .all(|k| !k.starts_with("UNRESOLVED_")));

        // Every successful probe closed its circuit.
        let closed = fx.control.closed.lock().unwrap().len();
        assert_eq!(closed as u64, stats.successful_circuits);
        drop(fx.events_tx);
    }

    /// A failure event for a circuit we never requested lands under a
    /// synthetic key rather than being dropped.
    #[tokio::test]
    async fn unsolicited_failure_is_recorded_unresolved() {
        let tmp = tempfile::tempdir().unwrap();
        let exits = vec![fp(0xA0), fp(0xA2)];
        let mut fx = fixture(exits, tmp.path());
        fx.events_tx
            .send(parse_event("CIRC 999 FAILED REASON=DESTROYED").unwrap())
            .unwrap();

        let outcome = fx.reactor.run(&mut fx.events_rx).await;
        assert!(outcome
            .stats
            .failed_circuit_relays()
            .contains_key("UNRESOLVED_999"));
        drop(fx.events_tx);
    }

    /// The attacher joins the two halves whichever order they arrive
    /// in, and exactly one ATTACHSTREAM goes out per pair.
    #[tokio::test]
    async fn attach_halves_join_in_either_order() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fx = fixture(vec![fp(0xA0)], tmp.path());
        let (worker_tx, _worker_rx) = mpsc::unbounded_channel();

        // Circuit half first.
        fx.reactor
            .handle_worker_msg(WorkerMsg::Attach {
                circuit: CircuitId::new("10"),
                port: 4000,
            })
            .await;
        assert!(fx.control.attached.lock().unwrap().is_empty());
        fx.reactor
            .handle_event(
                parse_event("STREAM 7 NEW 0 example.com:80 SOURCE_ADDR=127.0.0.1:4000").unwrap(),
                &worker_tx,
            )
            .await;
        // Stream half first.
        fx.reactor
            .handle_event(
                parse_event("STREAM 8 NEWRESOLVE 0 example.com:0 SOURCE_ADDR=127.0.0.1:4001")
                    .unwrap(),
                &worker_tx,
            )
            .await;
        fx.reactor
            .handle_worker_msg(WorkerMsg::Attach {
                circuit: CircuitId::new("11"),
                port: 4001,
            })
            .await;

        let attached = fx.control.attached.lock().unwrap().clone();
        assert_eq!(
            attached,
            vec![
                ("7".to_owned(), "10".to_owned()),
                ("8".to_owned(), "11".to_owned())
            ]
        );
        assert_eq!(fx.reactor.attacher.pending(), 0);
    }

    /// Streams in states other than NEW/NEWRESOLVE are ignored.
    #[tokio::test]
    async fn other_stream_states_are_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut fx = fixture(vec![fp(0xA0)], tmp.path());
        let (worker_tx, _worker_rx) = mpsc::unbounded_channel();
        fx.reactor
            .handle_event(
                parse_event("STREAM 7 SUCCEEDED 3 example.com:80 SOURCE_ADDR=127.0.0.1:4000")
                    .unwrap(),
                &worker_tx,
            )
            .await;
        assert_eq!(fx.reactor.attacher.pending(), 0);
    }

    #[test]
    fn jitter_bounds() {
        for _ in 0..100 {
            let d = jittered(1.0, 0.5);
            assert!(d >= Duration::from_secs_f64(0.5));
            assert!(d <= Duration::from_secs_f64(1.5));
        }
        // Noise can push the delay below zero; it must clamp.
        for _ in 0..100 {
            let d = jittered(0.1, 5.0);
            assert!(d <= Duration::from_secs_f64(5.1));
        }
        assert_eq!(jittered(0.0, 0.0), Duration::ZERO);
    }
}
