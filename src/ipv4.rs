//! Internet layer: IPv4 header parse/emit, checksum, and next-hop MAC
//! resolution via the router (§4.4).
//!
//! No IP options, no fragmentation (spec Non-goals): `version` must be 4,
//! `MF` must be 0, and the fragment offset must be 0, or the packet is
//! logged and dropped.

use tracing::debug;

use crate::addr::{Ipv4Address, MacAddress};
use crate::checksum::{checksum_finalize, internet_checksum};
use crate::ethernet::{EtherType, EthernetFrame};
use crate::framework::{Consumed, Subprotocol};
use crate::router::Router;

const HEADER_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProtocol {
    Icmp,
    Tcp,
    Udp,
    Other(u8),
}

impl IpProtocol {
    pub fn to_u8(self) -> u8 {
        match self {
            IpProtocol::Icmp => 1,
            IpProtocol::Tcp => 6,
            IpProtocol::Udp => 17,
            IpProtocol::Other(v) => v,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => IpProtocol::Icmp,
            6 => IpProtocol::Tcp,
            17 => IpProtocol::Udp,
            other => IpProtocol::Other(other),
        }
    }
}

/// A decoded IPv4 packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Packet {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub dscp: u8,
    pub ecn: u8,
    pub dont_fragment: bool,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub payload: Vec<u8>,
}

/// Parse an IPv4 header + payload. Rejects (logs + drops) anything that
/// isn't version 4, carries IP options, is fragmented, has a `total_length`
/// that doesn't match the bytes actually received, or fails its header
/// checksum (§4.4).
pub fn parse(bytes: &[u8]) -> Option<Ipv4Packet> {
    if bytes.len() < HEADER_LEN {
        debug!(len = bytes.len(), "ipv4 packet shorter than header");
        return None;
    }
    let version = bytes[0] >> 4;
    let ihl_words = bytes[0] & 0x0F;
    if version != 4 {
        debug!(version, "unsupported ip version");
        return None;
    }
    if ihl_words != 5 {
        debug!(ihl_words, "ip options are not supported");
        return None;
    }
    let total_length = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
    if total_length != bytes.len() {
        debug!(total_length, actual = bytes.len(), "ipv4 total_length does not match received bytes");
        return None;
    }
    let flags_and_offset = u16::from_be_bytes([bytes[6], bytes[7]]);
    let more_fragments = flags_and_offset & 0x2000 != 0;
    let dont_fragment = flags_and_offset & 0x4000 != 0;
    let fragment_offset = flags_and_offset & 0x1FFF;
    if more_fragments || fragment_offset != 0 {
        debug!("ip fragmentation is not supported");
        return None;
    }
    if !verify_internet_checksum_header(&bytes[0..HEADER_LEN]) {
        debug!("ipv4 header checksum mismatch");
        return None;
    }

    Some(Ipv4Packet {
        src: Ipv4Address::from_bytes(&bytes[12..16]),
        dst: Ipv4Address::from_bytes(&bytes[16..20]),
        dscp: bytes[1] >> 2,
        ecn: bytes[1] & 0x03,
        dont_fragment,
        ttl: bytes[8],
        protocol: IpProtocol::from_u8(bytes[9]),
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

fn verify_internet_checksum_header(header: &[u8]) -> bool {
    crate::checksum::verify_internet_checksum(header)
}

/// Emit an IPv4 packet. Header length is fixed at 20 (no options),
/// identification is always zero (no fragmentation to disambiguate), and the
/// checksum is computed over the header with the checksum field zeroed,
/// then complemented (§4.4).
pub fn emit(packet: &Ipv4Packet) -> Vec<u8> {
    let total_length = HEADER_LEN + packet.payload.len();
    let mut header = [0_u8; HEADER_LEN];
    header[0] = (4 << 4) | 5; // version=4, IHL=5 words
    header[1] = (packet.dscp << 2) | packet.ecn;
    header[2..4].copy_from_slice(&(total_length as u16).to_be_bytes());
    header[4..6].copy_from_slice(&0_u16.to_be_bytes()); // identification
    let flags = if packet.dont_fragment { 0x4000_u16 } else { 0 };
    header[6..8].copy_from_slice(&flags.to_be_bytes());
    header[8] = packet.ttl;
    header[9] = packet.protocol.to_u8();
    header[10..12].copy_from_slice(&[0, 0]); // checksum placeholder
    header[12..16].copy_from_slice(&packet.src.octets());
    header[16..20].copy_from_slice(&packet.dst.octets());

    let checksum = internet_checksum(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    debug_assert!(
        verify_internet_checksum_header(&header),
        "ipv4 header we just emitted must validate its own checksum"
    );

    let mut out = Vec::with_capacity(total_length);
    out.extend_from_slice(&header);
    out.extend_from_slice(&packet.payload);
    out
}

/// Intent describing an outbound IPv4 packet before its destination MAC is
/// known. The IPv4 layer resolves `dst` to a MAC via the router; an
/// unresolved destination is a bug-class error (§4.4), not a recoverable one.
#[derive(Debug, Clone)]
pub struct Ipv4SendIntent {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub dscp: u8,
    pub ttl: u8,
    pub protocol: IpProtocol,
    pub payload: Vec<u8>,
}

/// Resolve `dst`'s MAC via the router and wrap `intent` into an Ethernet
/// frame ready for the bus.
///
/// # Panics
/// If the router has no device for `dst`. Per §4.4 this is a transient
/// impossibility, not malformed input: every destination this stack emits to
/// is one it already knows about (an ARP-resolved peer or the router
/// itself), so an unresolvable destination means the stack's own bookkeeping
/// is wrong.
pub fn build_frame(router: &Router, src_mac: MacAddress, intent: &Ipv4SendIntent) -> EthernetFrame {
    let device = router
        .get_device_by_ip(intent.dst)
        .unwrap_or_else(|| panic!("unresolvable ipv4 destination {}: no known device", intent.dst));
    let packet = Ipv4Packet {
        src: intent.src,
        dst: intent.dst,
        dscp: intent.dscp,
        ecn: 0,
        dont_fragment: true,
        ttl: intent.ttl,
        protocol: intent.protocol,
        payload: intent.payload.clone(),
    };
    EthernetFrame {
        dst_mac: device.mac,
        src_mac,
        ethertype: EtherType::Ipv4,
        payload: emit(&packet),
    }
}

/// The IPv4 layer: sits on Ethernet, decodes, verifies, and routes the
/// decoded packet to ICMP, UDP, or TCP by protocol number (§4.4).
pub struct Ipv4Layer;

impl Subprotocol<EthernetFrame, crate::state::NetState> for Ipv4Layer {
    fn on_frame(&mut self, ctx: &mut crate::state::NetState, frame: &EthernetFrame) -> Consumed {
        if frame.ethertype != EtherType::Ipv4 {
            return Consumed::NO;
        }
        let Some(packet) = parse(&frame.payload) else {
            return Consumed::YES;
        };
        let consumed = ctx.dispatch_ipv4(&packet);
        if !consumed.is_consumed() {
            debug!(protocol = ?packet.protocol, "unconsumed ipv4 packet");
        }
        Consumed::YES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Ipv4Packet {
        Ipv4Packet {
            src: Ipv4Address::new([10, 0, 0, 1]),
            dst: Ipv4Address::new([10, 0, 0, 2]),
            dscp: 0,
            ecn: 0,
            dont_fragment: true,
            ttl: 64,
            protocol: IpProtocol::Udp,
            payload: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let packet = sample();
        let bytes = emit(&packet);
        assert_eq!(parse(&bytes), Some(packet));
    }

    #[test]
    fn checksum_round_trip_is_all_ones() {
        let bytes = emit(&sample());
        assert!(verify_internet_checksum_header(&bytes[0..HEADER_LEN]));
    }

    #[test]
    fn rejects_mismatched_total_length() {
        let mut bytes = emit(&sample());
        bytes[2..4].copy_from_slice(&9999_u16.to_be_bytes());
        assert_eq!(parse(&bytes), None);
    }

    #[test]
    fn rejects_fragmented_packets() {
        let mut bytes = emit(&sample());
        bytes[6] |= 0x20; // MF bit
        // total_length check passes, but the stale checksum now gets
        // recomputed to keep this test focused on the fragmentation check.
        let checksum = internet_checksum(&{
            let mut h = bytes[0..HEADER_LEN].to_vec();
            h[10] = 0;
            h[11] = 0;
            h
        });
        bytes[10..12].copy_from_slice(&checksum.to_be_bytes());
        assert_eq!(parse(&bytes), None);
    }

    #[test]
    fn rejects_ip_options() {
        let mut bytes = emit(&sample());
        bytes[0] = (4 << 4) | 6; // IHL = 6 words, i.e. options present
        assert_eq!(parse(&bytes), None);
    }
}
