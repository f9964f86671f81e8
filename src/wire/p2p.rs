//! The libp2p manager: reaches a peer over a libp2p stream rather than a
//! direct socket, so two nodes behind NAT can still exchange [`Message`]
//! frames via relay/hole-punching without either side running a listener
//! reachable from the public internet (§4.1, §6 `-e ipfs/<peer-id>`).
//!
//! A single [`libp2p::Swarm`] is driven by one background task for the
//! whole process; [`P2pManager::dial`] and inbound connections both
//! register a per-peer channel with that task and hand back a [`P2pWire`]
//! that reads/writes through it. Message delivery rides libp2p's
//! request-response protocol: every [`Message`] is one request, acknowledged
//! with a unit response so the sender knows the peer's swarm accepted it.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::str::FromStr;

use async_trait::async_trait;
use futures::StreamExt;
use libp2p::request_response::{self, OutboundRequestId, ProtocolSupport};
use libp2p::swarm::{NetworkBehaviour, SwarmEvent};
use libp2p::{identity::Keypair, Multiaddr, PeerId, StreamProtocol, Swarm};
use tokio::sync::{mpsc, oneshot};

use crate::message::Message;

use super::{BoxWire, Wire, WireError, WireManager};

const PROTOCOL: &str = "/ipmesh/message/1";
/// Inbound queue depth per peer; a saturated peer is no different from a
/// saturated port outbound queue (§5) but this sits upstream of that, so it
/// only needs to smooth out swarm-task scheduling jitter.
const PEER_QUEUE_DEPTH: usize = 256;

#[derive(NetworkBehaviour)]
struct Behaviour {
    request_response: request_response::cbor::Behaviour<Message, ()>,
    identify: libp2p::identify::Behaviour,
}

enum Command {
    Dial {
        addr: Multiaddr,
        peer: PeerId,
        reply: oneshot::Sender<Result<BoxWire, WireError>>,
    },
    Send {
        peer: PeerId,
        msg: Message,
        reply: oneshot::Sender<Result<(), WireError>>,
    },
}

/// One peer reachable over libp2p, framed as [`Message`]s via request-response.
pub struct P2pWire {
    peer: PeerId,
    address: Ipv4Addr,
    cmd_tx: mpsc::Sender<Command>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<Message>>,
}

#[async_trait]
impl Wire for P2pWire {
    async fn recv(&self) -> Result<Option<Message>, WireError> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Send {
                peer: self.peer,
                msg: msg.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| WireError::Closed)?;
        reply_rx.await.map_err(|_| WireError::Closed)?
    }

    fn endpoint(&self) -> String {
        format!("ipfs/{}", self.peer)
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn protocol(&self) -> &'static str {
        "ipfs"
    }

    async fn close(&self) {}
}

/// Owns the process's single libp2p [`Swarm`] and dispatches wires for it.
pub struct P2pManager {
    cmd_tx: mpsc::Sender<Command>,
    inbound_peers_rx: tokio::sync::Mutex<Option<mpsc::Receiver<BoxWire>>>,
}

impl P2pManager {
    /// Builds the swarm over QUIC (the transport this crate's dependency
    /// set enables) and spawns its driver task. `keypair` is the node's own
    /// identity, reused here so the libp2p `PeerId` is derived from the
    /// same key as the node's `origin` string (§10.4).
    pub fn new(keypair: Keypair) -> Result<Self, WireError> {
        let local_peer_id = PeerId::from(keypair.public());
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_quic()
            .with_behaviour(|key| Behaviour {
                request_response: request_response::cbor::Behaviour::new(
                    std::iter::once((
                        StreamProtocol::new(PROTOCOL),
                        ProtocolSupport::Full,
                    )),
                    request_response::Config::default(),
                ),
                identify: libp2p::identify::Behaviour::new(libp2p::identify::Config::new(
                    "ipmesh/1.0.0".to_string(),
                    key.public(),
                )),
            })
            .map_err(|e| WireError::Transport(format!("failed to build swarm: {e}")))?
            .build();
        swarm
            .listen_on("/ip4/0.0.0.0/udp/0/quic-v1".parse().unwrap())
            .map_err(|e| WireError::Transport(format!("failed to listen: {e}")))?;

        let (cmd_tx, cmd_rx) = mpsc::channel(256);
        let (peer_tx, peer_rx) = mpsc::channel(64);
        tokio::spawn(drive_swarm(swarm, local_peer_id, cmd_rx, cmd_tx.clone(), peer_tx));

        Ok(Self {
            cmd_tx,
            inbound_peers_rx: tokio::sync::Mutex::new(Some(peer_rx)),
        })
    }
}

#[async_trait]
impl WireManager for P2pManager {
    fn protocol(&self) -> &'static str {
        "ipfs"
    }

    /// `endpoint` is `ipfs/<multiaddr>` where the multiaddr carries a
    /// `/p2p/<peer-id>` suffix.
    async fn dial(&self, endpoint: &str) -> Result<BoxWire, WireError> {
        let rest = endpoint
            .strip_prefix("ipfs/")
            .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))?;
        let addr: Multiaddr = rest
            .parse()
            .map_err(|_| WireError::InvalidEndpoint(endpoint.to_string()))?;
        let peer = addr
            .iter()
            .find_map(|p| match p {
                libp2p::multiaddr::Protocol::P2p(id) => Some(id),
                _ => None,
            })
            .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))?;

        let (reply, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Dial { addr, peer, reply })
            .await
            .map_err(|_| WireError::Closed)?;
        reply_rx.await.map_err(|_| WireError::Closed)?
    }

    /// The swarm is already listening (started in [`P2pManager::new`]);
    /// this just drains the channel of peers that connect to us first.
    async fn listen(&self, inbound: mpsc::Sender<BoxWire>) -> Result<(), WireError> {
        let mut rx = self
            .inbound_peers_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| WireError::Transport("p2p listener already taken".into()))?;
        while let Some(wire) = rx.recv().await {
            if inbound.send(wire).await.is_err() {
                break;
            }
        }
        Ok(())
    }
}

/// A registered peer: the channel its inbound messages are pushed through,
/// plus the wire handle itself (so a second caller asking for the same peer
/// gets the same `P2pWire`, not a disjoint channel).
struct PeerEntry {
    tx: mpsc::Sender<Message>,
    wire: BoxWire,
}

/// Returns the existing wire for `peer`, or builds and registers a fresh one.
/// Shared by the inbound-request path and the post-dial `ConnectionEstablished`
/// path so a given peer never ends up with two disjoint inbound channels.
fn get_or_create_wire(
    peers: &mut HashMap<PeerId, PeerEntry>,
    peer: PeerId,
    cmd_tx: &mpsc::Sender<Command>,
) -> BoxWire {
    peers
        .entry(peer)
        .or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
            let wire: BoxWire = std::sync::Arc::new(P2pWire {
                peer,
                address: Ipv4Addr::UNSPECIFIED,
                cmd_tx: cmd_tx.clone(),
                inbound_rx: tokio::sync::Mutex::new(rx),
            });
            PeerEntry { tx, wire }
        })
        .wire
        .clone()
}

/// The swarm's single owning task. Matches inbound requests to a per-peer
/// inbound channel (creating the channel, and surfacing a fresh [`P2pWire`]
/// to `new_peers`, the first time a peer is seen) and drives outbound
/// dial/send commands issued by [`P2pWire`]/[`P2pManager`].
async fn drive_swarm(
    mut swarm: Swarm<Behaviour>,
    local_peer_id: PeerId,
    mut cmd_rx: mpsc::Receiver<Command>,
    cmd_tx: mpsc::Sender<Command>,
    new_peers: mpsc::Sender<BoxWire>,
) {
    let mut peers: HashMap<PeerId, PeerEntry> = HashMap::new();
    let mut pending_dials: HashMap<PeerId, oneshot::Sender<Result<BoxWire, WireError>>> =
        HashMap::new();
    let mut pending_sends: HashMap<OutboundRequestId, oneshot::Sender<Result<(), WireError>>> =
        HashMap::new();

    tracing::info!(target: "wire", peer_id = %local_peer_id, "libp2p swarm started");

    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                handle_swarm_event(event, &mut swarm, &mut peers, &mut pending_dials, &mut pending_sends, &new_peers, &cmd_tx).await;
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Dial { addr, peer, reply }) => {
                        match swarm.dial(addr) {
                            Ok(()) => {
                                pending_dials.insert(peer, reply);
                            }
                            Err(err) => {
                                let _ = reply.send(Err(WireError::Transport(err.to_string())));
                            }
                        }
                    }
                    Some(Command::Send { peer, msg, reply }) => {
                        let request_id = swarm
                            .behaviour_mut()
                            .request_response
                            .send_request(&peer, msg);
                        pending_sends.insert(request_id, reply);
                    }
                    None => break,
                }
            }
        }
    }
}

async fn handle_swarm_event(
    event: SwarmEvent<BehaviourEvent>,
    swarm: &mut Swarm<Behaviour>,
    peers: &mut HashMap<PeerId, PeerEntry>,
    pending_dials: &mut HashMap<PeerId, oneshot::Sender<Result<BoxWire, WireError>>>,
    pending_sends: &mut HashMap<OutboundRequestId, oneshot::Sender<Result<(), WireError>>>,
    new_peers: &mpsc::Sender<BoxWire>,
    cmd_tx: &mpsc::Sender<Command>,
) {
    match event {
        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            if let Some(reply) = pending_dials.remove(&peer_id) {
                let wire = get_or_create_wire(peers, peer_id, cmd_tx);
                let _ = reply.send(Ok(wire));
            }
        }
        SwarmEvent::OutgoingConnectionError { peer_id: Some(peer_id), error, .. } => {
            if let Some(reply) = pending_dials.remove(&peer_id) {
                let _ = reply.send(Err(WireError::Transport(error.to_string())));
            }
        }
        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(request_response::Event::Message {
            peer,
            message,
        })) => match message {
            request_response::Message::Request { request, channel, .. } => {
                let _ = swarm
                    .behaviour_mut()
                    .request_response
                    .send_response(channel, ());
                let is_new = !peers.contains_key(&peer);
                let wire = get_or_create_wire(peers, peer, cmd_tx);
                if is_new {
                    let _ = new_peers.try_send(wire);
                }
                let tx = peers.get(&peer).expect("just inserted").tx.clone();
                if tx.send(request).await.is_err() {
                    peers.remove(&peer);
                }
            }
            request_response::Message::Response { request_id, response: () } => {
                if let Some(reply) = pending_sends.remove(&request_id) {
                    let _ = reply.send(Ok(()));
                }
            }
        },
        SwarmEvent::Behaviour(BehaviourEvent::RequestResponse(
            request_response::Event::OutboundFailure { request_id, error, .. },
        )) => {
            if let Some(reply) = pending_sends.remove(&request_id) {
                let _ = reply.send(Err(WireError::Transport(error.to_string())));
            }
        }
        _ => {}
    }
}

/// Parses the `<host>:<port>/<peer-id>`-style endpoint form §6 documents for
/// `-e ipfs/<peer-id>` into a dialable multiaddr, when the caller has a
/// known address rather than relying on discovery. Not used by `dial`
/// directly (which expects a full multiaddr) but kept for callers that only
/// have a bare peer id plus a known relay address.
pub fn peer_id_multiaddr(relay: &Multiaddr, peer: &str) -> Result<Multiaddr, WireError> {
    let peer_id = PeerId::from_str(peer)
        .map_err(|_| WireError::InvalidEndpoint(peer.to_string()))?;
    let mut addr = relay.clone();
    addr.push(libp2p::multiaddr::Protocol::P2p(peer_id));
    Ok(addr)
}
