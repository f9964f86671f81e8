//! [`Port`]: the stateful binding of one live [`Wire`] to the router.
//!
//! A port owns exactly one wire and runs three loops against it (traffic-in,
//! traffic-out, routing) for as long as the wire stays healthy. Ports are
//! never addressed by pointer from outside the router: they're registered
//! under a [`PortId`] allocated once at `register_port` time, so the route
//! table and the connector can hold a stable, `Copy`able handle without
//! reaching back into the port map during shutdown.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;

use crate::message::{Message, Packet, Routing};
use crate::wire::BoxWire;

/// Opaque, `Copy`able handle to a registered port. Allocated by
/// [`crate::router::Router::register_port`]; never reused within a process
/// lifetime so a stale `PortId` can never alias a different port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

impl PortId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Deterministic id for tests, bypassing the global counter.
    #[cfg(any(test, feature = "test-util"))]
    pub fn for_test(n: u64) -> Self {
        Self(n)
    }
}

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// What kind of wire a port wraps. Replaces the source's string-prefix check
/// ("does this endpoint start with `tun/`?") with a field set once when the
/// wire is adopted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    /// The local TUN device: the node's own gateway into the overlay.
    Tunnel,
    /// Any remote peer, regardless of transport.
    Peer,
}

/// Capacity of a port's outbound packet queue (§3, §5).
pub const OUTBOUND_QUEUE_CAPACITY: usize = 2048;
/// How long a sender will wait for a saturated outbound queue before giving
/// up and declaring the port dead (§5).
pub const QUEUE_SEND_TIMEOUT: Duration = Duration::from_secs(30);
/// A port with no traffic for this long is declared idle and closed (§4.2).
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
/// Cadence of the routing loop's advertise/idle-check tick (§4.2).
pub const ROUTING_TICK: Duration = Duration::from_secs(30);

/// Smoothed round-trip time: EWMA mean and variance over Register/Ack
/// round trips, used by the router's path selector (§4.2, §4.3).
#[derive(Debug, Clone, Copy)]
pub struct RttEstimate {
    mean_ms: f64,
    var_ms: f64,
    samples: u32,
}

const ALPHA_MEAN: f64 = 0.15;
const ALPHA_VAR: f64 = 0.15;

impl Default for RttEstimate {
    fn default() -> Self {
        Self {
            mean_ms: 0.0,
            var_ms: 0.0,
            samples: 0,
        }
    }
}

impl RttEstimate {
    pub fn observe(&mut self, sample_ms: f64) {
        if self.samples == 0 {
            self.mean_ms = sample_ms;
            self.var_ms = 0.0;
        } else {
            let delta = sample_ms - self.mean_ms;
            self.mean_ms += ALPHA_MEAN * delta;
            self.var_ms = (1.0 - ALPHA_VAR) * self.var_ms + ALPHA_VAR * delta * delta;
        }
        self.samples += 1;
    }

    pub fn mean(&self) -> u32 {
        self.mean_ms.round().max(0.0) as u32
    }

    fn stddev(&self) -> f64 {
        self.var_ms.max(0.0).sqrt()
    }

    /// `true` iff `base - mean > 3*stddev`: a statistically significant
    /// improvement over `base`, used to decide whether to flap a route to a
    /// faster-looking port (§4.2). Requires at least a couple of samples so
    /// a brand-new port doesn't win purely on noise.
    pub fn faster(&self, base_ms: u32) -> bool {
        if self.samples < 2 {
            return false;
        }
        (base_ms as f64) - self.mean_ms > 3.0 * self.stddev()
    }
}

/// Running counters surfaced for logging/diagnostics; not load-bearing for
/// any routing decision.
#[derive(Debug, Default)]
pub struct PortStats {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
}

/// One pending Register→Ack round trip, used to finalize an RTT sample when
/// the Ack for it arrives.
struct PendingAdvertise {
    sent_at: Instant,
}

/// The router-side state of one connected peer (or the local tunnel).
///
/// `Port` is always held behind an `Arc` once registered: the three loops
/// each hold a clone, plus the router's port map and the route table (via
/// `PortId`, not a live reference).
pub struct Port {
    id: PortId,
    endpoint: String,
    kind: PortKind,
    address: Ipv4Addr,
    outbound: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    routing_tx: mpsc::Sender<Routing>,
    routing_rx: Mutex<Option<mpsc::Receiver<Routing>>>,
    pending_advertise: Mutex<Option<PendingAdvertise>>,
    rtt: Mutex<RttEstimate>,
    stats: PortStats,
    last_active: Mutex<Instant>,
    last_advertise: Mutex<Option<Instant>>,
    closed: AtomicBool,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
    close_rx: Mutex<Option<oneshot::Receiver<()>>>,
    /// Broadcast half of the close signal every one of this port's own
    /// loops awaits, alongside `router.done()`, so a close initiated from
    /// *outside* the currently-running loop (another port's traffic-in loop
    /// closing this one on saturation, or this port's own routing loop
    /// closing it on idle) still reaches `traffic_out_loop`/`traffic_in_loop`
    /// instead of leaving them blocked on a channel only `close()` itself
    /// will ever stop feeding (§3, §8).
    closed_watch_tx: watch::Sender<bool>,
}

impl Port {
    pub fn new(wire: &BoxWire, kind: PortKind) -> Arc<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (routing_tx, routing_rx) = mpsc::channel(8);
        let (close_tx, close_rx) = oneshot::channel();
        let (closed_watch_tx, _closed_watch_rx) = watch::channel(false);
        Arc::new(Self {
            id: PortId::next(),
            endpoint: wire.endpoint(),
            kind,
            address: wire.address(),
            outbound: outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            routing_tx,
            routing_rx: Mutex::new(Some(routing_rx)),
            pending_advertise: Mutex::new(None),
            rtt: Mutex::new(RttEstimate::default()),
            stats: PortStats::default(),
            last_active: Mutex::new(Instant::now()),
            last_advertise: Mutex::new(None),
            closed: AtomicBool::new(false),
            close_tx: Mutex::new(Some(close_tx)),
            close_rx: Mutex::new(Some(close_rx)),
            closed_watch_tx,
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn kind(&self) -> PortKind {
        self.kind
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn is_tunnel(&self) -> bool {
        self.kind == PortKind::Tunnel
    }

    /// Enqueue a packet for transmission, waiting up to
    /// [`QUEUE_SEND_TIMEOUT`] for room if the queue is saturated. Per §5,
    /// a timeout here is the sender's cue to close *this* port, not to keep
    /// blocking a shared task.
    pub async fn send_packet(&self, packet: Packet) -> Result<(), PortDead> {
        match timeout(QUEUE_SEND_TIMEOUT, self.outbound.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(PortDead),
        }
    }

    pub async fn queue_routing(&self, routing: Routing) -> Result<(), PortDead> {
        self.routing_tx.send(routing).await.map_err(|_| PortDead)
    }

    pub fn take_outbound_rx(&self) -> mpsc::Receiver<Packet> {
        self.outbound_rx
            .try_lock()
            .expect("port loops take queues exactly once at spawn")
            .take()
            .expect("outbound receiver already taken")
    }

    pub fn take_routing_rx(&self) -> mpsc::Receiver<Routing> {
        self.routing_rx
            .try_lock()
            .expect("port loops take queues exactly once at spawn")
            .take()
            .expect("routing receiver already taken")
    }

    pub async fn touch(&self) {
        *self.last_active.lock().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_active.lock().await.elapsed()
    }

    pub async fn due_for_advertise(&self) -> bool {
        match *self.last_advertise.lock().await {
            None => true,
            Some(at) => at.elapsed() >= ROUTING_TICK,
        }
    }

    /// Record the send time of an outgoing Register so the matching Ack can
    /// be turned into an RTT sample.
    pub async fn start_advertise_timer(&self) {
        let now = Instant::now();
        *self.last_advertise.lock().await = Some(now);
        *self.pending_advertise.lock().await = Some(PendingAdvertise { sent_at: now });
    }

    /// Finalize the RTT sample for the Ack that just arrived. A no-op if no
    /// Register is outstanding (e.g. a spurious or duplicate Ack).
    pub async fn finish_advertise_timer(&self) {
        let pending = self.pending_advertise.lock().await.take();
        if let Some(p) = pending {
            let elapsed_ms = p.sent_at.elapsed().as_secs_f64() * 1000.0;
            self.rtt.lock().await.observe(elapsed_ms);
        }
    }

    pub async fn rtt_mean(&self) -> u32 {
        self.rtt.lock().await.mean()
    }

    /// `true` iff this port's RTT is statistically faster than `base_ms`
    /// (§4.2's 3-sigma test).
    pub async fn faster(&self, base_ms: u32) -> bool {
        self.rtt.lock().await.faster(base_ms)
    }

    pub fn record_packet_in(&self) {
        self.stats.packets_in.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_packet_out(&self) {
        self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
    }

    /// Single-fire close signal for this port. Safe to call more than once;
    /// only the first call has any effect, mirroring the source's
    /// `close.Do` idempotence as a compare-and-swap flag. Closing broadcasts
    /// on `closed_watch_tx` (observed by all three of this port's own loops
    /// via [`Port::wait_closed`]) in addition to firing the one-shot signal
    /// [`Port::take_closed_signal`] hands to the connector.
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let _ = self.closed_watch_tx.send(true);
            if let Some(tx) = self.close_tx.try_lock().ok().and_then(|mut g| g.take()) {
                let _ = tx.send(());
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`Port::close`] has been called, from any caller —
    /// not just the loop that happens to be running when it is. Each of
    /// `traffic_in_loop`/`traffic_out_loop`/`routing_loop` awaits this
    /// alongside `router.done()` so a close initiated from outside a given
    /// loop (a saturated target port closed by another port's traffic-in
    /// loop, or this port's own routing loop closing it on idle) still
    /// wakes every loop rather than leaving the others parked forever on a
    /// channel recv (§3, §8).
    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        let mut rx = self.closed_watch_tx.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    pub fn take_closed_signal(&self) -> oneshot::Receiver<()> {
        self.close_rx
            .try_lock()
            .expect("close receiver taken exactly once at spawn")
            .take()
            .expect("close receiver already taken")
    }
}

/// Sentinel error for a port whose outbound queue could not accept a packet
/// within the grace period, or whose routing channel is gone. The caller's
/// response is always the same: close the port.
#[derive(Debug)]
pub struct PortDead;

impl std::fmt::Display for PortDead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-dead")
    }
}

impl std::error::Error for PortDead {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtt_prefers_statistically_faster_port() {
        let mut fast = RttEstimate::default();
        for _ in 0..20 {
            fast.observe(30.0);
        }
        assert!(fast.faster(200));
        assert!(!fast.faster(31));
    }

    #[test]
    fn rtt_requires_multiple_samples_before_judging() {
        let mut rtt = RttEstimate::default();
        rtt.observe(10.0);
        assert!(!rtt.faster(500));
    }

    #[test]
    fn port_id_is_stable_and_unique() {
        let a = PortId::for_test(1);
        let b = PortId::for_test(2);
        assert_ne!(a, b);
        assert_eq!(a, PortId::for_test(1));
    }
}
