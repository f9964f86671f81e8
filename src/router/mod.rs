//! The router: the central table of virtual-network → next-hop mappings,
//! the split-horizon advertiser, the RTT-weighted path selector, and the
//! per-peer packet pump (§4.3).
//!
//! `Router` owns the [`RouteTable`](crate::route_table::RouteTable) and the
//! port registry exclusively; ports are referenced by the stable
//! [`PortId`](port::PortId) handle everywhere else so the shutdown path
//! never has to walk live port references out of the map (§9).

pub mod port;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::fakeip::FakeIpEngine;
use crate::message::{Message, Packet, Routing, RoutingEntry, RoutingKind};
use crate::route_table::{RouteTable, StoredEntry};
use crate::shutdown::{Shutdown, ShutdownWatch};
use crate::wire::{BoxWire, WireError};

use port::{Port, PortDead, PortId, PortKind};

/// Hop ceiling: a candidate route with `metric >= max_metric` is dropped
/// (§4.3, §8).
pub const DEFAULT_MAX_METRIC: u16 = 4;
/// Entries older than this are swept from the table (§4.3).
pub const ROUTE_MAX_AGE: Duration = Duration::from_secs(90);
/// Cadence of the background sweeper (§4.3).
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no route to {0}")]
    NoRoute(Ipv4Addr),
    #[error("port {0} is not registered")]
    UnknownPort(PortId),
}

/// Construction-time configuration the router needs but does not own the
/// lifecycle of: the node's own identity and the networks it announces for
/// itself.
pub struct RouterConfig {
    pub node_id: String,
    pub max_metric: u16,
    pub local_networks: Vec<Ipv4Net>,
}

enum Decision {
    Conflict,
    Adopt,
    Ignore,
}

pub struct Router {
    config: RouterConfig,
    table: Mutex<RouteTable>,
    ports: Mutex<HashMap<PortId, Arc<Port>>>,
    fakeip: Mutex<Option<Arc<FakeIpEngine>>>,
    shutdown: Shutdown,
    shutdown_watch: ShutdownWatch,
}

impl Router {
    pub fn new(config: RouterConfig) -> Arc<Self> {
        let (shutdown, shutdown_watch) = Shutdown::new();
        Arc::new(Self {
            config,
            table: Mutex::new(RouteTable::new()),
            ports: Mutex::new(HashMap::new()),
            fakeip: Mutex::new(None),
            shutdown,
            shutdown_watch,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub async fn attach_fakeip(&self, engine: Arc<FakeIpEngine>) {
        *self.fakeip.lock().await = Some(engine);
    }

    /// A fresh clone of the shutdown watch; every spawned loop gets one.
    pub fn done(&self) -> ShutdownWatch {
        self.shutdown_watch.clone()
    }

    /// Registers `wire` as a new port and spawns its three loops. Mirrors
    /// the source's `RegisterPort`, generalized to the typed [`PortKind`]
    /// split instead of an endpoint string-prefix check (§9).
    pub async fn register_port(self: &Arc<Self>, wire: BoxWire, kind: PortKind) -> Arc<Port> {
        let port = Port::new(&wire, kind);
        tracing::info!(target: "router", endpoint = %port.endpoint(), id = %port.id(), ?kind, "port registered");

        self.ports.lock().await.insert(port.id(), Arc::clone(&port));

        let router = Arc::clone(self);
        tokio::spawn(traffic_in_loop(Arc::clone(&router), Arc::clone(&port), Arc::clone(&wire)));
        tokio::spawn(traffic_out_loop(Arc::clone(&router), Arc::clone(&port), wire));
        tokio::spawn(routing_loop(router, Arc::clone(&port)));
        port
    }

    /// Longest-prefix match for packet forwarding (§4.3).
    pub async fn find_dest_port(&self, dst: Ipv4Addr) -> Option<Arc<Port>> {
        let port_id = {
            let table = self.table.lock().await;
            table.longest_match(dst).map(|e| e.port)
        }?;
        self.ports.lock().await.get(&port_id).cloned()
    }

    async fn port_by_id(&self, id: PortId) -> Option<Arc<Port>> {
        self.ports.lock().await.get(&id).cloned()
    }

    /// The heart of the distance-vector protocol (§4.3). Returns the Ack (or
    /// Failed) reply the caller should send back on `port`'s wire.
    pub async fn update_routing(&self, port: &Arc<Port>, msg: Routing) -> Routing {
        match msg.kind {
            Some(RoutingKind::Ack) => {
                port.finish_advertise_timer().await;
                // Conflict redirects riding on this Ack: forward each one
                // toward its destination port with metric-1 so the notice
                // propagates back toward whoever originally announced the
                // disputed /32 (§4.3 step 1, §7 kind 4).
                for entry in msg.entries {
                    self.forward_conflict_notice(entry).await;
                }
                Routing::default()
            }
            Some(RoutingKind::Register) => {
                let conflicts = self.adopt_register(port, msg.entries).await;
                port.touch().await;
                Routing::ack(conflicts)
            }
            Some(RoutingKind::Failed) | None => {
                // A peer telling us it's tearing down, or a malformed
                // message with no discriminator: either way this port is
                // done (§7 kind 3).
                Routing::default()
            }
        }
    }

    async fn adopt_register(
        &self,
        port: &Arc<Port>,
        entries: Vec<RoutingEntry>,
    ) -> Vec<RoutingEntry> {
        let rtt = port.rtt_mean().await;
        let mut conflicts = Vec::new();

        for entry in entries {
            let candidate_metric = entry.metric.saturating_add(1);
            if candidate_metric >= self.config.max_metric {
                continue;
            }
            let candidate = StoredEntry {
                network: entry.network,
                port: port.id(),
                metric: candidate_metric,
                rtt: rtt.saturating_add(entry.rtt),
                origin: entry.origin.clone(),
                updated_at: std::time::Instant::now(),
            };

            // Snapshot the one stored entry for this exact network (if any)
            // and drop the table lock before doing anything that awaits
            // (`port.faster`) or any further table access, per §5's "held
            // briefly, never across I/O" discipline.
            let existing = {
                let table = self.table.lock().await;
                table
                    .exact(entry.network)
                    .map(|e| (e.metric, e.port, e.origin.clone(), e.rtt))
            };

            let decision = match existing {
                None => Decision::Adopt,
                Some((ex_metric, ex_port, ex_origin, ex_rtt)) => {
                    if entry.network.prefix_len() == 32
                        && !ex_origin.is_empty()
                        && ex_origin != candidate.origin
                        && ex_port != candidate.port
                    {
                        Decision::Conflict
                    } else if candidate.metric < ex_metric {
                        Decision::Adopt
                    } else if candidate.metric == ex_metric && ex_port == candidate.port {
                        Decision::Adopt
                    } else if candidate.metric == ex_metric
                        && ex_port != candidate.port
                        && port.faster(ex_rtt).await
                    {
                        Decision::Adopt
                    } else {
                        Decision::Ignore
                    }
                }
            };

            match decision {
                Decision::Conflict => {
                    // Address conflict (§3, §7 kind 4): keep the existing
                    // entry, tell the late announcer via a conflict Ack.
                    conflicts.push(RoutingEntry {
                        network: entry.network,
                        metric: entry.metric.saturating_sub(1),
                        rtt: entry.rtt,
                        origin: entry.origin,
                    });
                }
                Decision::Adopt => {
                    self.table.lock().await.insert(candidate);
                }
                Decision::Ignore => {}
            }
        }
        conflicts
    }

    /// Route a conflict notice toward `entry.network`'s current owner,
    /// decrementing `metric` again at this hop (§4.3 step 1: "forward it
    /// toward its destination port with `metric-1`" describes the
    /// Ack-handling relay itself, not just the originating detection). If
    /// the network has no stored route (it's already been swept, or never
    /// existed at this node), the notice simply dies here — the
    /// `max_metric` ceiling this repeated decrement drives toward is what
    /// bounds propagation in the general case (§9).
    async fn forward_conflict_notice(&self, mut entry: RoutingEntry) {
        let target = {
            let table = self.table.lock().await;
            table.exact(entry.network).map(|e| e.port)
        };
        let Some(target_id) = target else { return };
        let Some(target_port) = self.port_by_id(target_id).await else {
            return;
        };
        entry.metric = entry.metric.saturating_sub(1);
        let _ = target_port.queue_routing(Routing::ack(vec![entry])).await;
    }

    /// The split-horizon route set to advertise on `port`: every stored
    /// route whose owning port is *not* `port` (never re-advertise a route
    /// back to the port it was learned from, §4.3 open question decision:
    /// per-entry replace). The fake-IP capture CIDRs ride in here too, once
    /// they've been self-registered into `self.table` by the tunnel port's
    /// routing loop (§4.5) under the tunnel port's id — peers see them like
    /// any other route this node owns; the tunnel port itself never does,
    /// since the filter below excludes its own port id.
    pub async fn advertise_routes(&self, port: &Arc<Port>) -> Vec<RoutingEntry> {
        let table = self.table.lock().await;
        table
            .iter()
            .filter(|e| e.port != port.id())
            .map(|e| RoutingEntry {
                network: e.network,
                metric: e.metric,
                rtt: e.rtt,
                origin: e.origin.clone(),
            })
            .collect()
    }

    /// The locally configured networks this node itself announces, used by
    /// the tunnel port's routing loop to inject its own reachability
    /// (§4.2: "this is how the local node injects its own reachability").
    pub fn local_routing_entries(&self) -> Vec<RoutingEntry> {
        self.config
            .local_networks
            .iter()
            .map(|n| RoutingEntry::local(*n, self.config.node_id.clone()))
            .collect()
    }

    /// [`local_routing_entries`](Self::local_routing_entries) plus, if a
    /// fake-IP engine is attached, its capture CIDRs (§4.5's
    /// `dns_routings()`) — both fed back through `update_routing` by the
    /// tunnel port's routing loop so they land in `self.table` owned by the
    /// tunnel port, the same self-registration path local networks use.
    /// Without this the fake CIDR is never routable: a later packet to a
    /// fake IP would miss `find_dest_port` entirely (§8 scenario 4).
    pub async fn local_and_fakeip_entries(&self) -> Vec<RoutingEntry> {
        let mut entries = self.local_routing_entries();
        if let Some(engine) = self.fakeip.lock().await.as_ref() {
            for network in engine.dns_routings() {
                entries.push(RoutingEntry::local(network, self.config.node_id.clone()));
            }
        }
        entries
    }

    /// Forward one packet from `from` toward its destination, per the
    /// traffic-in loop's dispatch rule (§4.2): TTL already decremented by
    /// the caller. Closes the *target* port (never `from`) if its queue is
    /// saturated past the grace period.
    pub async fn forward_packet(&self, packet: Packet) {
        let Some(target) = self.find_dest_port(packet.dst).await else {
            tracing::debug!(target: "router", dst = %packet.dst, "no route, dropping packet");
            return;
        };
        target.record_packet_in();
        if let Err(PortDead) = target.send_packet(packet).await {
            tracing::warn!(target: "router", port = %target.id(), "outbound queue saturated, closing target port");
            self.close_port(&target).await;
        } else {
            target.record_packet_out();
        }
    }

    /// Remove a port's routes and signal its loops to exit. Idempotent.
    pub async fn close_port(&self, port: &Arc<Port>) {
        port.close();
        let removed = self.table.lock().await.remove_port(port.id());
        self.ports.lock().await.remove(&port.id());
        if !removed.is_empty() {
            tracing::debug!(target: "router", port = %port.id(), routes = removed.len(), "port closed, routes swept");
        }
    }

    /// Background sweeper: every [`SWEEP_INTERVAL`], remove routes whose
    /// `updated_at` is older than [`ROUTE_MAX_AGE`] (§4.3, §8).
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = Arc::clone(self);
        let mut done = router.done();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = done.wait() => break,
                    _ = tick.tick() => {
                        let removed = router.table.lock().await.sweep_stale(ROUTE_MAX_AGE);
                        for entry in removed {
                            tracing::debug!(target: "router", network = %entry.network, origin = %entry.origin, "route swept (stale)");
                        }
                    }
                }
            }
        })
    }

    /// Broadcast shutdown to every port loop and the sweeper (§4.3,
    /// §5). Per §8's invariant, every spawned loop terminates within one
    /// pending I/O timeout of this call returning.
    pub async fn close(&self) {
        self.shutdown.trigger();
        let ports: Vec<Arc<Port>> = self.ports.lock().await.values().cloned().collect();
        for port in ports {
            port.close();
        }
    }

    #[cfg(test)]
    pub async fn route_count(&self) -> usize {
        self.table.lock().await.len()
    }

    #[cfg(test)]
    pub async fn insert_test_route(&self, entry: StoredEntry) {
        self.table.lock().await.insert(entry);
    }
}

async fn traffic_in_loop(
    router: Arc<Router>,
    port: Arc<Port>,
    wire: BoxWire,
) {
    let mut done = router.done();
    loop {
        let recv_result = tokio::select! {
            _ = done.wait() => break,
            _ = port.wait_closed() => break,
            result = wire.recv() => result,
        };
        match recv_result {
            Ok(Some(Message::Packet(pkt))) => {
                port.touch().await;
                let Some(pkt) = pkt.decrement_ttl() else {
                    tracing::trace!(target: "router", port = %port.id(), "ttl expired, dropping packet");
                    continue;
                };
                let pkt = maybe_egress_transform(&router, &port, pkt).await;
                router.forward_packet(pkt).await;
            }
            Ok(Some(Message::Routing(routing))) => {
                port.touch().await;
                let reply = router.update_routing(&port, routing).await;
                if reply.kind.is_some() {
                    if queue_routing_chunked(&port, reply).await.is_err() {
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!(target: "router", port = %port.id(), "wire closed cleanly");
                break;
            }
            Err(WireError::Closed) => break,
            Err(err) => {
                tracing::warn!(target: "router", port = %port.id(), %err, "protocol violation, closing port");
                let _ = port
                    .queue_routing(Routing::failed(err.to_string()))
                    .await;
                break;
            }
        }
    }
    router.close_port(&port).await;
}

async fn traffic_out_loop(
    router: Arc<Router>,
    port: Arc<Port>,
    wire: BoxWire,
) {
    let mut done = router.done();
    let mut outbound = port.take_outbound_rx();
    let mut routing = port.take_routing_rx();
    loop {
        tokio::select! {
            _ = done.wait() => break,
            _ = port.wait_closed() => break,
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                let packet = maybe_ingress_transform(&router, &port, packet).await;
                if let Err(err) = wire.send(&Message::Packet(packet)).await {
                    tracing::warn!(target: "router", port = %port.id(), %err, "encode failed, closing port");
                    break;
                }
            }
            msg = routing.recv() => {
                let Some(msg) = msg else { break };
                if let Err(err) = wire.send(&Message::Routing(msg)).await {
                    tracing::warn!(target: "router", port = %port.id(), %err, "encode failed, closing port");
                    break;
                }
            }
        }
    }
    wire.close().await;
    router.close_port(&port).await;
}

async fn routing_loop(router: Arc<Router>, port: Arc<Port>) {
    let mut done = router.done();
    let mut tick = tokio::time::interval(port::ROUTING_TICK);
    loop {
        tokio::select! {
            _ = done.wait() => break,
            _ = port.wait_closed() => break,
            _ = tick.tick() => {
                if port.idle_for().await > port::IDLE_TIMEOUT {
                    tracing::info!(target: "router", port = %port.id(), "port idle, closing");
                    break;
                }
                if !port.due_for_advertise().await {
                    continue;
                }
                let entries = router.advertise_routes(&port).await;
                port.start_advertise_timer().await;
                if queue_routing_chunked(&port, Routing::register(entries)).await.is_err() {
                    break;
                }
                if port.is_tunnel() {
                    let local = router.local_and_fakeip_entries().await;
                    if !local.is_empty() {
                        let synthetic = Routing::register(local);
                        let _ = router.update_routing(&port, synthetic).await;
                    }
                }
            }
        }
    }
    router.close_port(&port).await;
}

/// Splits `routing` into ≤32-entry fragments (§6: "Routing messages
/// carrying more than 32 entries MUST be split into multiple messages")
/// and queues each independently, in order, on `port`'s routing channel.
/// Stops and reports `PortDead` at the first fragment the port won't
/// accept.
async fn queue_routing_chunked(port: &Arc<Port>, routing: Routing) -> Result<(), PortDead> {
    for chunk in routing.into_chunks() {
        port.queue_routing(chunk).await?;
    }
    Ok(())
}

/// Packets just decoded off a tunnel wire are leaving the local machine for
/// the overlay: the fake-IP engine's egress phase (§4.5).
async fn maybe_egress_transform(router: &Arc<Router>, port: &Arc<Port>, packet: Packet) -> Packet {
    if !port.is_tunnel() {
        return packet;
    }
    let engine = router.fakeip.lock().await.clone();
    match engine {
        Some(engine) => engine.egress(packet).await,
        None => packet,
    }
}

/// Packets about to be encoded onto a tunnel wire are arriving from the
/// overlay for the local machine: the fake-IP engine's ingress phase (§4.5).
async fn maybe_ingress_transform(router: &Arc<Router>, port: &Arc<Port>, packet: Packet) -> Packet {
    if !port.is_tunnel() {
        return packet;
    }
    let engine = router.fakeip.lock().await.clone();
    match engine {
        Some(engine) => engine.ingress(packet).await,
        None => packet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RoutingEntry;
    use ipnet::Ipv4Net;

    fn cfg() -> RouterConfig {
        RouterConfig {
            node_id: "node-a".into(),
            max_metric: DEFAULT_MAX_METRIC,
            local_networks: vec![],
        }
    }

    #[tokio::test]
    async fn register_at_max_metric_is_dropped() {
        let router = Router::new(cfg());
        let port = PortId::for_test(1);
        router
            .insert_test_route(StoredEntry {
                network: "10.0.0.0/24".parse().unwrap(),
                port,
                metric: 1,
                rtt: 0,
                origin: "node-b".into(),
                updated_at: std::time::Instant::now(),
            })
            .await;
        assert_eq!(router.route_count().await, 1);
    }

    #[tokio::test]
    async fn adopt_register_rejects_entries_at_ceiling() {
        let router = Router::new(RouterConfig {
            node_id: "node-a".into(),
            max_metric: 4,
            local_networks: vec![],
        });
        // metric 3 + 1 = 4 >= max_metric(4): dropped.
        let wire = crate::wire::tunnel::test_support::loopback_wire("10.0.0.1".parse().unwrap());
        let port = Port::new(&wire, PortKind::Peer);
        let entries = vec![RoutingEntry {
            network: "192.168.50.0/24".parse::<Ipv4Net>().unwrap(),
            metric: 3,
            rtt: 0,
            origin: "node-z".into(),
        }];
        router.adopt_register(&port, entries).await;
        assert_eq!(router.route_count().await, 0);
    }
}
