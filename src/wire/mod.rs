//! The wire abstraction: pluggable point-to-point transports that carry
//! [`crate::message::Message`] frames between this node and a peer.
//!
//! A [`Wire`] is one connected endpoint; a [`WireManager`] knows how to dial
//! or listen for a particular protocol and hands back `Wire`s as they come
//! up. The [`WireRegistry`] keeps one manager per protocol name and exposes
//! the two global channels the rest of the system reads from: wires that
//! arrived because a peer dialed us ([`WireRegistry::inbound`]) and wires
//! that came up because we dialed out ([`WireRegistry::outbound`]).

pub mod p2p;
pub mod tunnel;
pub mod wireguard;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::message::{CodecError, Message};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("wire codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("wire i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("endpoint {0:?} could not be parsed for this protocol")]
    InvalidEndpoint(String),
    #[error("wire closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Either side of an active point-to-point link.
///
/// Implementations wrap whatever the underlying transport gives them
/// (a TUN device, a libp2p stream, a WireGuard UDP socket) and translate it
/// to/from framed [`Message`] values. Methods take `&self`, not `&mut self`:
/// a port's traffic-in and traffic-out loops call `recv`/`send` concurrently
/// against the same wire, so any serialization a transport needs between its
/// read and write paths is its own business, not a lock the router holds
/// across a blocking I/O call (§5).
#[async_trait]
pub trait Wire: Send + Sync {
    /// Read the next message. Returns `Ok(None)` on a clean remote close.
    /// Implementations must support being called concurrently with `send`.
    async fn recv(&self) -> Result<Option<Message>, WireError>;

    /// Send a message. Implementations are responsible for chunking
    /// oversized routing updates before this is called; this layer treats
    /// `msg` as a single opaque frame. Must support being called
    /// concurrently with `recv`.
    async fn send(&self, msg: &Message) -> Result<(), WireError>;

    /// A stable human-readable identifier for this endpoint, e.g.
    /// `ipfs/<peer-id>` or `wireguard/203.0.113.4:51820`.
    fn endpoint(&self) -> String;

    /// The peer's virtual overlay address as seen at this wire's near side
    /// (§3). For the tunnel wire this is the locally configured address.
    fn address(&self) -> std::net::Ipv4Addr;

    /// The wire protocol name this endpoint belongs to, e.g. `tunnel`,
    /// `ipfs`, `wireguard`.
    fn protocol(&self) -> &'static str;

    /// Tear the link down. Safe to call more than once, and concurrently
    /// with `recv`/`send` (those should then start returning `WireError`).
    async fn close(&self);
}

/// A live wire, shared between a port's concurrent loops. `Arc` rather than
/// `Box` because the traffic-in, traffic-out, and routing loops each hold
/// their own clone; there is deliberately no outer lock (see [`Wire`]).
pub type BoxWire = Arc<dyn Wire>;

/// A source of [`Wire`]s for one protocol: it can dial a specific
/// `endpoint` on request, and it can be asked to start listening, pushing
/// any wires that result from peers dialing us onto the registry's inbound
/// channel.
#[async_trait]
pub trait WireManager: Send + Sync {
    fn protocol(&self) -> &'static str;

    /// Parse `endpoint` and open an outbound connection to it.
    async fn dial(&self, endpoint: &str) -> Result<BoxWire, WireError>;

    /// Begin accepting inbound connections, if this protocol supports
    /// listening. Accepted wires are pushed to `inbound`. Managers that are
    /// purely outbound (none in the reference set, but the trait allows it)
    /// can make this a no-op future that never resolves.
    async fn listen(&self, inbound: mpsc::Sender<BoxWire>) -> Result<(), WireError>;
}

pub type ArcWireManager = Arc<dyn WireManager>;

/// Registers one [`WireManager`] per protocol name and fans the two classes
/// of connection (peer-initiated, locally-initiated) out to their own
/// channels so the [`crate::connector::Connector`] and
/// [`crate::router::Router`] don't have to distinguish wire provenance by
/// inspecting the wire itself.
pub struct WireRegistry {
    managers: Vec<Arc<dyn WireManager>>,
    inbound_tx: mpsc::Sender<BoxWire>,
    inbound_rx: Option<mpsc::Receiver<BoxWire>>,
    outbound_tx: mpsc::Sender<BoxWire>,
    outbound_rx: Option<mpsc::Receiver<BoxWire>>,
}

impl fmt::Debug for WireRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WireRegistry")
            .field(
                "protocols",
                &self.managers.iter().map(|m| m.protocol()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl WireRegistry {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        Self {
            managers: Vec::new(),
            inbound_tx,
            inbound_rx: Some(inbound_rx),
            outbound_tx,
            outbound_rx: Some(outbound_rx),
        }
    }

    pub fn register(&mut self, manager: Arc<dyn WireManager>) {
        self.managers.push(manager);
    }

    pub fn manager_for(&self, protocol: &str) -> Option<&dyn WireManager> {
        self.managers
            .iter()
            .find(|m| m.protocol() == protocol)
            .map(|m| m.as_ref())
    }

    /// A clone of the inbound-wire sender, for process composition to feed
    /// wires in from a listener that isn't one of the registered
    /// [`WireManager`]s (e.g. a fixed `-wg` config's listener, which
    /// coexists with a dial-only [`wireguard::WireGuardManager`] under the
    /// same protocol name).
    pub fn inbound_sender(&self) -> mpsc::Sender<BoxWire> {
        self.inbound_tx.clone()
    }

    /// Dial `endpoint`, inferring the protocol from its `<protocol>/...`
    /// prefix, and push the resulting wire onto the outbound channel.
    pub async fn dial(&self, endpoint: &str) -> Result<(), WireError> {
        let protocol = endpoint
            .split_once('/')
            .map(|(p, _)| p)
            .unwrap_or(endpoint);
        let manager = self
            .manager_for(protocol)
            .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))?;
        let wire = manager.dial(endpoint).await?;
        self.outbound_tx
            .send(wire)
            .await
            .map_err(|_| WireError::Closed)?;
        Ok(())
    }

    /// Start every registered manager listening. Each manager's accept loop
    /// runs for the lifetime of the process; failures are logged by the
    /// caller via the returned join handles.
    pub fn spawn_listeners(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();
        for manager in &self.managers {
            let tx = self.inbound_tx.clone();
            let manager = Arc::clone(manager);
            let protocol = manager.protocol();
            let handle = tokio::spawn(async move {
                if let Err(err) = manager.listen(tx).await {
                    tracing::warn!(target: "wire", protocol, %err, "listener exited");
                }
            });
            handles.push(handle);
        }
        handles
    }

    pub fn take_inbound(&mut self) -> mpsc::Receiver<BoxWire> {
        self.inbound_rx.take().expect("inbound receiver already taken")
    }

    pub fn take_outbound(&mut self) -> mpsc::Receiver<BoxWire> {
        self.outbound_rx.take().expect("outbound receiver already taken")
    }
}

impl Default for WireRegistry {
    fn default() -> Self {
        Self::new()
    }
}
