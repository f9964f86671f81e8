//! Wire message types and their binary codec.
//!
//! A [`Message`] is the only thing that ever crosses a [`crate::wire::Wire`]:
//! either a raw IP [`Packet`] or a [`Routing`] control message. Both arms are
//! framed the same way: a big-endian `u32` length prefix followed by a
//! `bincode`-encoded payload, mirroring the length-prefixed tagged records the
//! original protocol used.

use std::net::Ipv4Addr;

use bytes::Bytes;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Maximum number of [`RoutingEntry`] values carried by a single wire message.
/// Larger route sets must be split with [`Routing::into_chunks`].
pub const MAX_ROUTING_ENTRIES: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame exceeds maximum wire message size ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("malformed frame: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("truncated frame")]
    Truncated,
}

/// Keep a single malicious/corrupt peer from making us allocate unboundedly.
pub const MAX_FRAME_BYTES: usize = 1 << 20;

/// The unit of wire I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Packet(Packet),
    Routing(Routing),
}

impl Message {
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let body = bincode::serialize(self)?;
        if body.len() > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        Ok(framed)
    }

    /// Decode a single message from `buf`, returning the message and the
    /// number of bytes consumed. `Ok(None)` means more bytes are needed.
    pub fn decode(buf: &[u8]) -> Result<Option<(Message, usize)>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(CodecError::FrameTooLarge(len));
        }
        if buf.len() < 4 + len {
            return Ok(None);
        }
        let msg: Message = bincode::deserialize(&buf[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}

/// A raw IPv4 frame in flight between two tunnel endpoints.
///
/// `src`/`dst` duplicate the IP header so the router never has to reparse
/// `data` just to make a forwarding decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    #[serde(with = "bytes_as_vec")]
    pub data: Bytes,
}

impl Packet {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, ttl: u8, data: Bytes) -> Self {
        Self { src, dst, ttl, data }
    }

    /// Decrement TTL, returning `None` if the packet must be dropped.
    pub fn decrement_ttl(mut self) -> Option<Self> {
        if self.ttl == 0 {
            return None;
        }
        self.ttl -= 1;
        if self.ttl == 0 {
            return None;
        }
        Some(self)
    }
}

mod bytes_as_vec {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        bytes.as_ref().serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        Ok(Bytes::from(v))
    }
}

/// The distance-vector control message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingKind {
    /// Advertise a route set.
    Register,
    /// Acknowledge a Register, optionally carrying conflict redirects.
    Ack,
    /// Terminal reply sent by a port before it closes due to a protocol
    /// violation.
    Failed,
}

/// One reachability claim: "`network` is `metric` hops away via the
/// announcing node `origin`, with `rtt` milliseconds of path latency already
/// accrued".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingEntry {
    pub network: Ipv4Net,
    pub metric: u16,
    pub rtt: u32,
    pub origin: String,
}

impl RoutingEntry {
    pub fn local(network: Ipv4Net, origin: impl Into<String>) -> Self {
        Self {
            network,
            metric: 0,
            rtt: 0,
            origin: origin.into(),
        }
    }

    /// `true` if this is a /32 claim that can participate in address
    /// conflict detection.
    pub fn is_host_route(&self) -> bool {
        self.network.prefix_len() == 32
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Routing {
    pub kind: Option<RoutingKind>,
    pub entries: Vec<RoutingEntry>,
    pub message: String,
}

impl Routing {
    pub fn register(entries: Vec<RoutingEntry>) -> Self {
        Self {
            kind: Some(RoutingKind::Register),
            entries,
            message: String::new(),
        }
    }

    pub fn ack(conflicts: Vec<RoutingEntry>) -> Self {
        Self {
            kind: Some(RoutingKind::Ack),
            entries: conflicts,
            message: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            kind: Some(RoutingKind::Failed),
            entries: Vec::new(),
            message: message.into(),
        }
    }

    /// Split a route set into fragments of at most [`MAX_ROUTING_ENTRIES`]
    /// entries each. The receiver treats every fragment independently, so
    /// this is purely a transport-MTU concern.
    pub fn into_chunks(self) -> Vec<Routing> {
        if self.entries.len() <= MAX_ROUTING_ENTRIES {
            return vec![self];
        }
        self.entries
            .chunks(MAX_ROUTING_ENTRIES)
            .map(|chunk| Routing {
                kind: self.kind,
                entries: chunk.to_vec(),
                message: self.message.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(n: &str, metric: u16) -> RoutingEntry {
        RoutingEntry {
            network: n.parse().unwrap(),
            metric,
            rtt: 0,
            origin: "node-a".into(),
        }
    }

    #[test]
    fn round_trip_packet() {
        let msg = Message::Packet(Packet::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            64,
            Bytes::from_static(b"hello"),
        ));
        let encoded = msg.encode().unwrap();
        let (decoded, consumed) = Message::decode(&encoded).unwrap().unwrap();
        assert_eq!(consumed, encoded.len());
        match decoded {
            Message::Packet(p) => {
                assert_eq!(p.ttl, 64);
                assert_eq!(&p.data[..], b"hello");
            }
            _ => panic!("expected packet"),
        }
    }

    #[test]
    fn decode_needs_more_bytes() {
        let msg = Message::Routing(Routing::register(vec![entry("10.0.0.0/24", 1)]));
        let encoded = msg.encode().unwrap();
        assert!(Message::decode(&encoded[..encoded.len() - 1])
            .unwrap()
            .is_none());
    }

    #[test]
    fn chunking_respects_max_entries() {
        let entries: Vec<_> = (0..70)
            .map(|i| entry(&format!("10.0.{}.0/24", i), 1))
            .collect();
        let routing = Routing::register(entries);
        let chunks = routing.into_chunks();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].entries.len(), 32);
        assert_eq!(chunks[1].entries.len(), 32);
        assert_eq!(chunks[2].entries.len(), 6);
        for c in &chunks {
            assert_eq!(c.kind, Some(RoutingKind::Register));
        }
    }

    #[test]
    fn small_routing_is_not_split() {
        let routing = Routing::register(vec![entry("10.0.0.0/24", 1)]);
        assert_eq!(routing.into_chunks().len(), 1);
    }

    #[test]
    fn ttl_decrement_drops_at_zero() {
        let p = Packet::new(
            "10.0.0.1".parse().unwrap(),
            "10.0.0.2".parse().unwrap(),
            1,
            Bytes::new(),
        );
        assert!(p.decrement_ttl().is_none());
    }
}
