//! The connector: dials transports, reconciles inbound/outbound wire
//! events, tracks per-endpoint failure counts, and schedules retries
//! (§4.4).
//!
//! The endpoint state map is the connector's only shared resource (§5); it
//! is held only long enough to compute a state transition, never across a
//! `dial` call. A port's [`crate::router::port::Port::take_closed_signal`]
//! is this module's hook for "a wire died, go decide what the endpoint
//! should do next" — reusing the same single-fire close the router already
//! has instead of inventing a second callback mechanism (§9).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use crate::router::port::PortKind;
use crate::router::Router;
use crate::wire::{BoxWire, WireRegistry};

/// Capacity of the connector's dial request channel (§4.4, §5).
pub const REQUEST_QUEUE_CAPACITY: usize = 8;
/// Number of concurrent workers draining dial requests (§4.4).
const DIAL_WORKERS: usize = 8;
/// An endpoint failing this many times in a row is evicted entirely (§3,
/// §5, §7 kind 1).
pub const MAX_FAILURES: u32 = 32;
/// Cadence of the retry scanner (§4.4).
pub const RETRY_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("dial request queue is full, dropping request for {0}")]
    QueueFull(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EndpointStatus {
    Unknown,
    Connecting,
    Connected,
    Failed,
}

struct EndpointState {
    status: EndpointStatus,
    failure_count: u32,
}

impl Default for EndpointState {
    fn default() -> Self {
        Self {
            status: EndpointStatus::Unknown,
            failure_count: 0,
        }
    }
}

/// Whether a wire arrived because we dialed out, or because a peer dialed
/// us. Governs whether a subsequent port close should be retried (§4.1,
/// §4.4).
#[derive(Debug, Clone, Copy)]
enum Provenance {
    Outbound,
    Inbound,
}

pub struct Connector {
    router: Arc<Router>,
    registry: Arc<WireRegistry>,
    states: Mutex<HashMap<String, EndpointState>>,
    request_tx: mpsc::Sender<String>,
    request_rx: Mutex<Option<mpsc::Receiver<String>>>,
}

impl Connector {
    pub fn new(router: Arc<Router>, registry: Arc<WireRegistry>) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        Arc::new(Self {
            router,
            registry,
            states: Mutex::new(HashMap::new()),
            request_tx,
            request_rx: Mutex::new(Some(request_rx)),
        })
    }

    /// Non-blocking enqueue of a dial request (§4.4). A full queue just
    /// drops the request and logs; the retry scanner will pick the
    /// endpoint back up on its next pass if it's still worth dialing.
    pub fn dial(&self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        if let Err(err) = self.request_tx.try_send(endpoint.clone()) {
            tracing::warn!(target: "connector", endpoint = %endpoint, %err, "dial queue full, dropping request");
        }
    }

    /// Spawns the full worker set: the dial workers, the inbound/outbound
    /// wire watcher, and the retry scanner. Returns once spawned; every
    /// task observes `router.done()` and exits within one 15s check (§4.4,
    /// §5).
    pub fn spawn(
        self: &Arc<Self>,
        mut inbound: mpsc::Receiver<BoxWire>,
        mut outbound: mpsc::Receiver<BoxWire>,
    ) {
        let request_rx = self
            .request_rx
            .try_lock()
            .expect("spawn is called exactly once")
            .take()
            .expect("request receiver already taken");
        let shared_rx = Arc::new(Mutex::new(request_rx));

        for worker_id in 0..DIAL_WORKERS {
            let connector = Arc::clone(self);
            let shared_rx = Arc::clone(&shared_rx);
            tokio::spawn(async move { connector.dial_worker(worker_id, shared_rx).await });
        }

        let connector = Arc::clone(self);
        tokio::spawn(async move {
            connector.wire_watcher(&mut inbound, &mut outbound).await;
        });

        let connector = Arc::clone(self);
        tokio::spawn(async move { connector.retry_scanner().await });
    }

    async fn dial_worker(self: Arc<Self>, worker_id: usize, shared_rx: Arc<Mutex<mpsc::Receiver<String>>>) {
        let mut done = self.router.done();
        loop {
            let endpoint = tokio::select! {
                _ = done.wait() => break,
                endpoint = async {
                    let mut rx = shared_rx.lock().await;
                    rx.recv().await
                } => endpoint,
            };
            let Some(endpoint) = endpoint else { break };
            tracing::debug!(target: "connector", worker = worker_id, %endpoint, "dial worker picked up request");
            self.attempt_dial(endpoint).await;
        }
    }

    /// Transitions `Unknown`/`Failed` to `Connecting` and attempts the
    /// dial; refuses (no-op) if already `Connecting`/`Connected` (§4.4
    /// step 1).
    async fn attempt_dial(&self, endpoint: String) {
        {
            let mut states = self.states.lock().await;
            let state = states.entry(endpoint.clone()).or_default();
            match state.status {
                EndpointStatus::Connecting | EndpointStatus::Connected => {
                    tracing::trace!(target: "connector", %endpoint, "already connecting or connected, skipping");
                    return;
                }
                EndpointStatus::Unknown | EndpointStatus::Failed => {
                    state.status = EndpointStatus::Connecting;
                }
            }
        }

        if let Err(err) = self.registry.dial(&endpoint).await {
            tracing::warn!(target: "connector", %endpoint, %err, "dial failed");
            self.record_failure(&endpoint).await;
        }
    }

    /// §4.4 step 3: mark `Failed`, increment the failure count, evict the
    /// endpoint entirely once it crosses [`MAX_FAILURES`] (§3, §7 kind 1,
    /// §8 boundary behavior).
    async fn record_failure(&self, endpoint: &str) {
        let mut states = self.states.lock().await;
        let Some(state) = states.get_mut(endpoint) else { return };
        state.status = EndpointStatus::Failed;
        state.failure_count += 1;
        if state.failure_count >= MAX_FAILURES {
            tracing::info!(target: "connector", %endpoint, "endpoint evicted after repeated failures");
            states.remove(endpoint);
        }
    }

    /// The ninth task (§4.4): watches both wire channels, registers a port
    /// for every wire that arrives, and arranges for the endpoint state to
    /// react once that port eventually closes.
    async fn wire_watcher(
        self: Arc<Self>,
        inbound: &mut mpsc::Receiver<BoxWire>,
        outbound: &mut mpsc::Receiver<BoxWire>,
    ) {
        let mut done = self.router.done();
        loop {
            tokio::select! {
                _ = done.wait() => break,
                wire = inbound.recv() => {
                    let Some(wire) = wire else { break };
                    self.adopt_wire(wire, Provenance::Inbound).await;
                }
                wire = outbound.recv() => {
                    let Some(wire) = wire else { break };
                    self.adopt_wire(wire, Provenance::Outbound).await;
                }
            }
        }
    }

    async fn adopt_wire(self: &Arc<Self>, wire: BoxWire, provenance: Provenance) {
        let endpoint = wire.endpoint();
        {
            let mut states = self.states.lock().await;
            let state = states.entry(endpoint.clone()).or_default();
            state.status = EndpointStatus::Connected;
            state.failure_count = 0;
        }
        tracing::info!(target: "connector", %endpoint, ?provenance, "wire established, registering port");

        let port = self.router.register_port(wire, PortKind::Peer).await;
        let close_signal = port.take_closed_signal();
        let connector = Arc::clone(self);
        tokio::spawn(async move {
            let _ = close_signal.await;
            connector.on_port_closed(&endpoint, provenance).await;
        });
    }

    /// §4.4's close callback: revert to `Failed` so the endpoint gets
    /// retried, or `Unknown` so we simply wait for the peer to redial.
    async fn on_port_closed(&self, endpoint: &str, provenance: Provenance) {
        let mut states = self.states.lock().await;
        let state = states.entry(endpoint.to_string()).or_default();
        match provenance {
            Provenance::Outbound => {
                state.status = EndpointStatus::Failed;
                tracing::debug!(target: "connector", %endpoint, "outbound port closed, will retry");
            }
            Provenance::Inbound => {
                state.status = EndpointStatus::Unknown;
                tracing::debug!(target: "connector", %endpoint, "inbound port closed, awaiting redial");
            }
        }
    }

    /// The tenth task (§4.4): every [`RETRY_INTERVAL`], re-enqueue every
    /// `Failed` endpoint that hasn't hit [`MAX_FAILURES`].
    async fn retry_scanner(self: Arc<Self>) {
        let mut done = self.router.done();
        let mut tick = tokio::time::interval(RETRY_INTERVAL);
        loop {
            tokio::select! {
                _ = done.wait() => break,
                _ = tick.tick() => {
                    let due: Vec<String> = {
                        let states = self.states.lock().await;
                        states
                            .iter()
                            .filter(|(_, s)| s.status == EndpointStatus::Failed && s.failure_count < MAX_FAILURES)
                            .map(|(endpoint, _)| endpoint.clone())
                            .collect()
                    };
                    for endpoint in due {
                        self.dial(endpoint);
                    }
                }
            }
        }
    }

    #[cfg(test)]
    pub async fn status_for_test(&self, endpoint: &str) -> Option<(bool, u32)> {
        self.states
            .lock()
            .await
            .get(endpoint)
            .map(|s| (s.status == EndpointStatus::Connected, s.failure_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouterConfig;

    fn router() -> Arc<Router> {
        Router::new(RouterConfig {
            node_id: "node-a".into(),
            max_metric: 4,
            local_networks: vec![],
        })
    }

    #[tokio::test]
    async fn dial_to_unreachable_endpoint_records_a_failure() {
        let router = router();
        let registry = Arc::new(WireRegistry::new());
        let connector = Connector::new(Arc::clone(&router), Arc::clone(&registry));
        connector.attempt_dial("tun/does-not-exist".to_string()).await;
        let status = connector.status_for_test("tun/does-not-exist").await.unwrap();
        assert_eq!(status, (false, 1));
    }

    #[tokio::test]
    async fn connecting_endpoint_refuses_a_second_dial() {
        let router = router();
        let registry = Arc::new(WireRegistry::new());
        let connector = Connector::new(Arc::clone(&router), Arc::clone(&registry));
        {
            let mut states = connector.states.lock().await;
            states.insert(
                "ipfs/abc".to_string(),
                EndpointState {
                    status: EndpointStatus::Connecting,
                    failure_count: 0,
                },
            );
        }
        connector.attempt_dial("ipfs/abc".to_string()).await;
        // Still Connecting (not bumped to Failed), since attempt_dial
        // returned early rather than re-dialing.
        let states = connector.states.lock().await;
        assert_eq!(states.get("ipfs/abc").unwrap().failure_count, 0);
    }
}
