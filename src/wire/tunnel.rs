//! The tunnel manager: owns the local TUN device and turns it into a
//! [`Wire`] whose near side is this node's own virtual address (§4.1).
//!
//! There is exactly one tunnel wire per process, created eagerly at startup
//! and handed straight to [`crate::router::Router::register_port`] rather
//! than dialed or listened for. `TunnelManager` exists mainly so the rest of
//! the system can treat it uniformly alongside the peer-facing managers.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};

use crate::message::{Message, Packet};

use super::{BoxWire, Wire, WireError, WireManager};

/// Hop ceiling stamped onto packets originated locally, decremented once per
/// router hop (§4.2's traffic-in loop). 64 mirrors a typical IP TTL; there is
/// no wire-format reason to pick anything else.
const DEFAULT_TTL: u8 = 64;
const MAX_PACKET: usize = 65536;

/// A connected TUN device, framed as raw IPv4 [`Packet`]s. Parses just
/// enough of the header to fill in `src`/`dst` for the router; payload bytes
/// are never otherwise inspected here.
pub struct TunWire {
    address: Ipv4Addr,
    name: String,
    reader: Mutex<ReadHalf<tun::AsyncDevice>>,
    writer: Mutex<WriteHalf<tun::AsyncDevice>>,
}

impl TunWire {
    fn new(name: String, address: Ipv4Addr, device: tun::AsyncDevice) -> Self {
        let (reader, writer) = tokio::io::split(device);
        Self {
            address,
            name,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl Wire for TunWire {
    async fn recv(&self) -> Result<Option<Message>, WireError> {
        let mut buf = vec![0u8; MAX_PACKET];
        let mut reader = self.reader.lock().await;
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        let Some((src, dst)) = parse_ipv4_header(&buf) else {
            return Err(WireError::Transport("non-ipv4 frame from tun device".into()));
        };
        Ok(Some(Message::Packet(Packet::new(
            src,
            dst,
            DEFAULT_TTL,
            buf.into(),
        ))))
    }

    async fn send(&self, msg: &Message) -> Result<(), WireError> {
        let Message::Packet(packet) = msg else {
            // Routing messages addressed to the tunnel wire are a platform
            // command (§6), not a frame for the kernel; the router never
            // actually calls `send` with one (the tunnel port's peer-facing
            // loop only ever emits Packets here), but ignoring it is the
            // correct behavior if it ever does.
            return Ok(());
        };
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet.data).await?;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("tun/{}", self.name)
    }

    fn address(&self) -> Ipv4Addr {
        self.address
    }

    fn protocol(&self) -> &'static str {
        "tun"
    }

    async fn close(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

fn parse_ipv4_header(buf: &[u8]) -> Option<(Ipv4Addr, Ipv4Addr)> {
    if buf.len() < 20 || buf[0] >> 4 != 4 {
        return None;
    }
    let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
    let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
    Some((src, dst))
}

/// Creates and configures the local TUN interface. There is only ever one of
/// these per node, so unlike the peer-facing managers this does not dial or
/// listen for additional wires; [`TunnelManager::open`] is called once at
/// startup and its result registered directly.
pub struct TunnelManager;

impl TunnelManager {
    /// Bring up a TUN device named `name` with `network`'s address assigned
    /// to it, mirroring the source's `create_tun` (address/netmask/up, packet
    /// information disabled on Linux).
    pub fn open(name: &str, network: Ipv4Net) -> Result<BoxWire, WireError> {
        let addr = network.addr();
        let mask = network.netmask().octets();
        let mut config = tun::Configuration::default();
        let octets = addr.octets();
        config
            .name(name)
            .address((octets[0], octets[1], octets[2], octets[3]))
            .netmask((mask[0], mask[1], mask[2], mask[3]))
            .up();
        #[cfg(target_os = "linux")]
        config.platform(|cfg| {
            cfg.packet_information(false);
        });

        let device = tun::create_as_async(&config)
            .map_err(|err| WireError::Transport(format!("failed to create tun device: {err}")))?;
        Ok(std::sync::Arc::new(TunWire::new(name.to_string(), addr, device)))
    }
}

#[async_trait]
impl WireManager for TunnelManager {
    fn protocol(&self) -> &'static str {
        "tun"
    }

    async fn dial(&self, endpoint: &str) -> Result<BoxWire, WireError> {
        Err(WireError::InvalidEndpoint(endpoint.to_string()))
    }

    /// The tunnel never receives inbound connections from peers; it is
    /// registered directly by the process composition instead (§9).
    async fn listen(&self, _inbound: mpsc::Sender<BoxWire>) -> Result<(), WireError> {
        std::future::pending().await
    }
}

/// Test-only in-memory wire pair, used wherever a test needs a [`Wire`]
/// without a real kernel TUN device or network socket.
#[cfg(any(test, feature = "test-util"))]
pub mod test_support {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// A wire backed by an in-process queue rather than any real transport.
    /// `recv` pulls from an inbound queue fed by [`loopback_wire`]'s caller
    /// (or stays empty, for tests that never push anything); `send` is
    /// recorded so tests can assert on what was written.
    pub struct LoopbackWire {
        address: Ipv4Addr,
        inbound: Mutex<mpsc::Receiver<Message>>,
        sent: StdMutex<Vec<Message>>,
    }

    impl LoopbackWire {
        pub fn sent(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Wire for LoopbackWire {
        async fn recv(&self) -> Result<Option<Message>, WireError> {
            Ok(self.inbound.lock().await.recv().await)
        }

        async fn send(&self, msg: &Message) -> Result<(), WireError> {
            self.sent.lock().unwrap().push(msg.clone());
            Ok(())
        }

        fn endpoint(&self) -> String {
            "tun/loopback".to_string()
        }

        fn address(&self) -> Ipv4Addr {
            self.address
        }

        fn protocol(&self) -> &'static str {
            "tun"
        }

        async fn close(&self) {}
    }

    /// A `Wire` with no inbound traffic, suitable for tests that only care
    /// about router-side state transitions and never need the wire to
    /// produce a message.
    pub fn loopback_wire(address: Ipv4Addr) -> BoxWire {
        let (_tx, rx) = mpsc::channel(1);
        std::sync::Arc::new(LoopbackWire {
            address,
            inbound: Mutex::new(rx),
            sent: StdMutex::new(Vec::new()),
        })
    }
}
