//! The fake-IP engine: DNS response rewriting and bidirectional NAT for
//! packets traversing the local tunnel (§4.5).
//!
//! Grounded in `original_source/pkg/routing/fakeip/{dns,pool}.go`'s pool
//! allocation and NAT shape, generalized with the DNS-message handling
//! `firezone-firezone`'s `dns-types`/`connlib/tunnel/src/dns.rs` show for
//! this exact concern (parsing/rewriting answers via the `domain` crate)
//! rather than hand-rolling a DNS parser. IPv4/UDP header rewriting stays
//! manual, continuing [`crate::wire::tunnel`]'s byte-offset parsing idiom —
//! fixed-size headers don't need a library, variable-length, compressed DNS
//! records do.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use domain::base::iana::{Class, Rcode};
use domain::base::{Message, MessageBuilder, ToName};
use domain::rdata::rfc1035::A;
use domain::rdata::AllRecordData;
use ipnet::Ipv4Net;
use tokio::sync::Mutex;

use crate::ip_pool::{ExpiringMap, IpPool, PoolError};
use crate::message::Packet;
use crate::rule::RuleEngine;

/// Per-entry mapping lifetime, refreshed on access (§4.5).
const MAPPING_TTL: Duration = Duration::from_secs(900);
/// Cadence of the background eviction sweep (§4.5).
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(120);
/// Upstream resolvers whose answers are never captured (§4.5).
const GOOGLE_DNS: [Ipv4Addr; 2] = [Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)];
const DNS_PORT: u16 = 53;
/// TTL stamped on synthesized/rewritten answers.
const ANSWER_TTL_SECS: u32 = 60;

/// Bidirectional fake↔real IP mapping, an address pool, and a small cache of
/// custom DNS records, sitting in front of the tunnel port's traffic loops.
pub struct FakeIpEngine {
    cidr: Ipv4Net,
    pool: Mutex<IpPool>,
    fake_to_real: Mutex<ExpiringMap<Ipv4Addr, Ipv4Addr>>,
    real_to_fake: Mutex<ExpiringMap<Ipv4Addr, Ipv4Addr>>,
    custom_records: Mutex<HashMap<String, Vec<Ipv4Addr>>>,
    rules: RuleEngine,
}

impl FakeIpEngine {
    pub fn new(cidr: Ipv4Net, rules: RuleEngine) -> Arc<Self> {
        Arc::new(Self {
            cidr,
            pool: Mutex::new(IpPool::new(cidr)),
            fake_to_real: Mutex::new(ExpiringMap::new(MAPPING_TTL)),
            real_to_fake: Mutex::new(ExpiringMap::new(MAPPING_TTL)),
            custom_records: Mutex::new(HashMap::new()),
            rules,
        })
    }

    /// Registers a name that should resolve to `ips` even when upstream
    /// returns NXDOMAIN (§4.5 step 1's NXDOMAIN-promotion case).
    pub async fn add_custom_record(&self, name: impl Into<String>, ips: Vec<Ipv4Addr>) {
        self.custom_records.lock().await.insert(normalize_name(&name.into()), ips);
    }

    /// The capture CIDRs spliced into the tunnel port's route advertisement:
    /// the fake pool plus the one upstream resolver this node itself talks
    /// to directly (§4.5).
    pub fn dns_routings(&self) -> Vec<Ipv4Net> {
        vec![
            self.cidr,
            Ipv4Net::new(GOOGLE_DNS[0], 32).expect("8.8.8.8/32 is well-formed"),
        ]
    }

    async fn alloc_or_reuse(&self, real: Ipv4Addr) -> Result<Ipv4Addr, PoolError> {
        if let Some(fake) = self.real_to_fake.lock().await.get(&real) {
            self.fake_to_real.lock().await.get(&fake);
            return Ok(fake);
        }
        let fake = self.pool.lock().await.alloc()?;
        self.fake_to_real.lock().await.insert(fake, real);
        self.real_to_fake.lock().await.insert(real, fake);
        Ok(fake)
    }

    async fn to_real(&self, fake: Ipv4Addr) -> Option<Ipv4Addr> {
        let real = self.fake_to_real.lock().await.get(&fake)?;
        self.real_to_fake.lock().await.get(&real);
        Some(real)
    }

    async fn to_fake(&self, real: Ipv4Addr) -> Option<Ipv4Addr> {
        let fake = self.real_to_fake.lock().await.get(&real)?;
        self.fake_to_real.lock().await.get(&fake);
        Some(fake)
    }

    /// Every 120s, evict fake-IP mappings untouched for 900s and return
    /// their addresses to the pool (§4.5). Both directions of a pair are
    /// always freed together even if only one side's clock expired first.
    pub async fn sweep(&self) {
        let expired_fake = self.fake_to_real.lock().await.sweep_expired();
        for (fake, real) in &expired_fake {
            self.real_to_fake.lock().await.remove(real);
            self.pool.lock().await.free(*fake);
        }
        let expired_real = self.real_to_fake.lock().await.sweep_expired();
        for (real, fake) in &expired_real {
            if self.fake_to_real.lock().await.remove(fake).is_some() {
                self.pool.lock().await.free(*fake);
            }
        }
    }

    /// Egress phase (local tunnel → overlay): DNS response rewrite, then
    /// sNAT. Called from the tunnel port's traffic-in loop on every packet
    /// just read off the tun device (§4.5, §9).
    pub async fn egress(&self, packet: Packet) -> Packet {
        let packet = self.rewrite_dns_response(packet).await;
        self.apply_snat(packet).await
    }

    /// Ingress phase (overlay → local tunnel): dNAT only. Called from the
    /// tunnel port's traffic-out loop just before a packet is written back
    /// to the tun device (§4.5, §9).
    pub async fn ingress(&self, packet: Packet) -> Packet {
        self.apply_dnat(packet).await
    }

    async fn apply_snat(&self, packet: Packet) -> Packet {
        let Some(fake) = self.to_fake(packet.src).await else {
            return packet;
        };
        rewrite_addrs(packet, Some(fake), None)
    }

    async fn apply_dnat(&self, packet: Packet) -> Packet {
        let Some(real) = self.to_real(packet.dst).await else {
            return packet;
        };
        rewrite_addrs(packet, None, Some(real))
    }

    async fn rewrite_dns_response(&self, packet: Packet) -> Packet {
        let Some(header) = Ipv4Header::parse(&packet.data) else {
            return packet;
        };
        if header.protocol != PROTO_UDP {
            return packet;
        }
        let Some(udp) = UdpSegment::parse(&packet.data, header.header_len) else {
            return packet;
        };
        if udp.src_port != DNS_PORT {
            return packet;
        }
        let Ok(message) = Message::from_octets(udp.payload.to_vec()) else {
            return packet;
        };
        if !message.header().qr() {
            return packet;
        }
        let Ok(question) = message.sole_question() else {
            return packet;
        };
        let qname = question.qname();
        let name = qname.to_string();

        let mut answer_ips = Vec::new();
        let mut rewrote_any = false;
        if let Ok(answers) = message.answer() {
            for record in answers.flatten() {
                let Ok(record) = record.into_any_record::<AllRecordData<_, _>>() else {
                    continue;
                };
                if let AllRecordData::A(a) = record.data() {
                    let real_ip = a.addr();
                    if GOOGLE_DNS.contains(&real_ip) || self.rules.excluded(&name, real_ip) {
                        answer_ips.push(real_ip);
                        continue;
                    }
                    match self.alloc_or_reuse(real_ip).await {
                        Ok(fake_ip) => {
                            answer_ips.push(fake_ip);
                            rewrote_any = true;
                        }
                        Err(_) => answer_ips.push(real_ip),
                    }
                }
            }
        }

        let rcode = message.header().rcode();
        let custom = if rcode == Rcode::NXDOMAIN && answer_ips.is_empty() {
            self.custom_records.lock().await.get(&normalize_name(&name)).cloned()
        } else {
            None
        };
        if custom.is_some() {
            rewrote_any = true;
        }
        if !rewrote_any {
            return packet;
        }

        let final_rcode = if custom.is_some() { Rcode::NOERROR } else { rcode };
        let builder = MessageBuilder::new_vec();
        let Ok(mut answer_builder) = builder.start_answer(&message, final_rcode) else {
            return packet;
        };
        for ip in answer_ips.iter().chain(custom.iter().flatten()) {
            let rdata = AllRecordData::<Vec<u8>, domain::base::Name<Vec<u8>>>::A(A::new(*ip));
            if answer_builder.push((qname, Class::IN, ANSWER_TTL_SECS, rdata)).is_err() {
                return packet;
            }
        }
        let new_payload = answer_builder.finish();

        rebuild_udp_payload(&packet, &header, &udp, &new_payload)
    }
}

fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

const PROTO_UDP: u8 = 17;
const PROTO_TCP: u8 = 6;

struct Ipv4Header {
    header_len: usize,
    protocol: u8,
    ttl: u8,
}

impl Ipv4Header {
    fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < 20 || buf[0] >> 4 != 4 {
            return None;
        }
        let header_len = ((buf[0] & 0x0F) as usize) * 4;
        if buf.len() < header_len {
            return None;
        }
        Some(Self {
            header_len,
            protocol: buf[9],
            ttl: buf[8],
        })
    }
}

struct UdpSegment<'a> {
    src_port: u16,
    dst_port: u16,
    payload: &'a [u8],
}

impl<'a> UdpSegment<'a> {
    fn parse(buf: &'a [u8], ip_header_len: usize) -> Option<Self> {
        if buf.len() < ip_header_len + 8 {
            return None;
        }
        let udp = &buf[ip_header_len..];
        let src_port = u16::from_be_bytes([udp[0], udp[1]]);
        let dst_port = u16::from_be_bytes([udp[2], udp[3]]);
        let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
        if udp_len < 8 || ip_header_len + udp_len > buf.len() {
            return None;
        }
        Some(Self {
            src_port,
            dst_port,
            payload: &udp[8..udp_len],
        })
    }
}

fn internet_checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = bytes.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = *chunks.remainder() {
        sum += u16::from_be_bytes([last, 0]) as u32;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp_segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + udp_segment.len() + (udp_segment.len() % 2));
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(PROTO_UDP);
    pseudo.extend_from_slice(&(udp_segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(udp_segment);
    let checksum = internet_checksum(&pseudo);
    if checksum == 0 {
        0xFFFF
    } else {
        checksum
    }
}

fn tcp_checksum(src: Ipv4Addr, dst: Ipv4Addr, tcp_segment: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + tcp_segment.len() + (tcp_segment.len() % 2));
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(PROTO_TCP);
    pseudo.extend_from_slice(&(tcp_segment.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(tcp_segment);
    internet_checksum(&pseudo)
}

/// Rewrite `src`/`dst` in place and recompute every checksum from scratch
/// (§4.5's "partial-update shortcuts are not used"): the IP header checksum
/// always, plus the UDP or TCP pseudo-header checksum when the transport
/// is one of those two. Other protocols (e.g. ICMP) have no pseudo-header
/// dependency on the addresses, so only the IP checksum changes.
fn rewrite_addrs(packet: Packet, new_src: Option<Ipv4Addr>, new_dst: Option<Ipv4Addr>) -> Packet {
    let Some(header) = Ipv4Header::parse(&packet.data) else {
        return packet;
    };
    let mut buf = packet.data.to_vec();
    let src = new_src.unwrap_or(packet.src);
    let dst = new_dst.unwrap_or(packet.dst);
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());
    buf[10] = 0;
    buf[11] = 0;
    let ip_checksum = internet_checksum(&buf[..header.header_len]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    match header.protocol {
        PROTO_UDP if buf.len() >= header.header_len + 8 => {
            let segment_start = header.header_len;
            buf[segment_start + 6] = 0;
            buf[segment_start + 7] = 0;
            let checksum = udp_checksum(src, dst, &buf[segment_start..]);
            buf[segment_start + 6..segment_start + 8].copy_from_slice(&checksum.to_be_bytes());
        }
        PROTO_TCP if buf.len() >= header.header_len + 20 => {
            let segment_start = header.header_len;
            buf[segment_start + 16] = 0;
            buf[segment_start + 17] = 0;
            let checksum = tcp_checksum(src, dst, &buf[segment_start..]);
            buf[segment_start + 16..segment_start + 18].copy_from_slice(&checksum.to_be_bytes());
        }
        _ => {}
    }

    Packet::new(src, dst, packet.ttl, Bytes::from(buf))
}

/// Rebuild the IPv4/UDP frame around a replaced DNS payload. Addresses and
/// TTL are unchanged; only the UDP/IP lengths and checksums need to move.
fn rebuild_udp_payload(
    packet: &Packet,
    header: &Ipv4Header,
    udp: &UdpSegment<'_>,
    new_payload: &[u8],
) -> Packet {
    let udp_len = 8 + new_payload.len();
    let total_len = header.header_len + udp_len;
    let mut buf = vec![0u8; total_len];

    buf[..header.header_len].copy_from_slice(&packet.data[..header.header_len]);
    buf[0] = 0x45;
    buf[8] = header.ttl;
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[10] = 0;
    buf[11] = 0;

    let udp_start = header.header_len;
    buf[udp_start..udp_start + 2].copy_from_slice(&udp.src_port.to_be_bytes());
    buf[udp_start + 2..udp_start + 4].copy_from_slice(&udp.dst_port.to_be_bytes());
    buf[udp_start + 4..udp_start + 6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    buf[udp_start + 6] = 0;
    buf[udp_start + 7] = 0;
    buf[udp_start + 8..].copy_from_slice(new_payload);

    let checksum = udp_checksum(packet.src, packet.dst, &buf[udp_start..]);
    buf[udp_start + 6..udp_start + 8].copy_from_slice(&checksum.to_be_bytes());

    let ip_checksum = internet_checksum(&buf[..header.header_len]);
    buf[10..12].copy_from_slice(&ip_checksum.to_be_bytes());

    Packet::new(packet.src, packet.dst, packet.ttl, Bytes::from(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn udp_dns_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Packet {
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;
        let mut buf = vec![0u8; total_len];
        buf[0] = 0x45;
        buf[8] = 64;
        buf[9] = PROTO_UDP;
        buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        buf[12..16].copy_from_slice(&src.octets());
        buf[16..20].copy_from_slice(&dst.octets());
        buf[20..22].copy_from_slice(&12345u16.to_be_bytes());
        buf[22..24].copy_from_slice(&DNS_PORT.to_be_bytes());
        buf[24..26].copy_from_slice(&(udp_len as u16).to_be_bytes());
        buf[28..].copy_from_slice(payload);
        Packet::new(src, dst, 64, Bytes::from(buf))
    }

    fn dns_response(name: &str, answer_ip: Ipv4Addr) -> Vec<u8> {
        let domain_name = domain::base::Name::<Vec<u8>>::from_str(name).unwrap();
        let mut msg = MessageBuilder::new_vec().question();
        msg.header_mut().set_qr(false);
        msg.header_mut().set_id(7);
        msg.push((domain_name.clone(), domain::base::iana::Rtype::A)).unwrap();
        let query = msg.into_message();
        let mut answer = MessageBuilder::new_vec().start_answer(&query, Rcode::NOERROR).unwrap();
        answer
            .push((domain_name, Class::IN, 60u32, AllRecordData::<Vec<u8>, _>::A(A::new(answer_ip))))
            .unwrap();
        answer.finish()
    }

    #[tokio::test]
    async fn dns_answer_is_rewritten_to_a_fake_ip_and_mapping_recorded() {
        let engine = FakeIpEngine::new("198.18.0.0/24".parse().unwrap(), RuleEngine::empty());
        let real_ip: Ipv4Addr = "203.0.113.7".parse().unwrap();
        let payload = dns_response("example.com", real_ip);
        let packet = udp_dns_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), &payload);

        let rewritten = engine.egress(packet).await;

        let header = Ipv4Header::parse(&rewritten.data).unwrap();
        let udp = UdpSegment::parse(&rewritten.data, header.header_len).unwrap();
        let message = Message::from_octets(udp.payload.to_vec()).unwrap();
        let answers: Vec<_> = message.answer().unwrap().flatten().collect();
        let record = answers[0].clone().into_any_record::<AllRecordData<_, _>>().unwrap();
        let AllRecordData::A(a) = record.data() else { panic!("expected an A record") };
        let fake_ip = a.addr();
        assert!(engine.cidr.contains(&fake_ip));
        assert_eq!(engine.to_real(fake_ip).await, Some(real_ip));
        assert_eq!(engine.to_fake(real_ip).await, Some(fake_ip));
    }

    #[tokio::test]
    async fn google_dns_answers_are_never_captured() {
        let engine = FakeIpEngine::new("198.18.0.0/24".parse().unwrap(), RuleEngine::empty());
        let payload = dns_response("dns.google", GOOGLE_DNS[0]);
        let packet = udp_dns_packet("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap(), &payload);

        let rewritten = engine.egress(packet).await;
        assert!(!engine.pool.lock().await.contains(GOOGLE_DNS[0]));
        let _ = rewritten;
    }

    #[tokio::test]
    async fn dnat_rewrites_destination_for_a_mapped_fake_ip() {
        let engine = FakeIpEngine::new("198.18.0.0/24".parse().unwrap(), RuleEngine::empty());
        let real: Ipv4Addr = "203.0.113.9".parse().unwrap();
        let fake = engine.alloc_or_reuse(real).await.unwrap();

        let mut buf = vec![0u8; 20];
        buf[0] = 0x45;
        buf[8] = 64;
        buf[9] = 1; // icmp, no pseudo-header dependency
        buf[2..4].copy_from_slice(&20u16.to_be_bytes());
        buf[12..16].copy_from_slice(&[10, 0, 0, 2]);
        buf[16..20].copy_from_slice(&fake.octets());
        let packet = Packet::new("10.0.0.2".parse().unwrap(), fake, 64, Bytes::from(buf));

        let rewritten = engine.ingress(packet).await;
        assert_eq!(rewritten.dst, real);
    }

    #[test]
    fn checksum_round_trips_to_zero_over_the_whole_datagram() {
        let mut header = vec![0x45, 0, 0, 20, 0, 0, 0, 0, 64, 6, 0, 0, 10, 0, 0, 1, 10, 0, 0, 2];
        let checksum = internet_checksum(&header);
        header[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(internet_checksum(&header), 0);
    }
}
