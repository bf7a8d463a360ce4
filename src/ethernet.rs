//! Link layer: Ethernet II framing.
//!
//! Parses destination MAC, source MAC, then a 16-bit tag field (§4.2). A
//! VLAN tag (0x8100 / 0x88A8) is logged and dropped rather than treated as
//! EtherType; this stack has no VLAN support (spec Non-goals). Otherwise the
//! tag is the EtherType and the remainder of the frame is the payload.
//! Emission is the mirror of parsing. No frame is ever dropped for length;
//! readers read what they need.

use tracing::debug;

use crate::addr::MacAddress;
use crate::framework::{Consumed, Dispatcher};

const VLAN_8021Q: u16 = 0x8100;
const VLAN_8021AD: u16 = 0x88A8;

/// EtherType values this stack cares about. Unknown values are kept verbatim
/// so they can still be logged meaningfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EtherType {
    Ipv4,
    Arp,
    Ipv6,
    Other(u16),
}

impl EtherType {
    pub fn to_u16(self) -> u16 {
        match self {
            EtherType::Ipv4 => 0x0800,
            EtherType::Arp => 0x0806,
            EtherType::Ipv6 => 0x86DD,
            EtherType::Other(v) => v,
        }
    }

    pub fn from_u16(value: u16) -> Self {
        match value {
            0x0800 => EtherType::Ipv4,
            0x0806 => EtherType::Arp,
            0x86DD => EtherType::Ipv6,
            other => EtherType::Other(other),
        }
    }
}

/// A decoded Ethernet II frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub dst_mac: MacAddress,
    pub src_mac: MacAddress,
    pub ethertype: EtherType,
    pub payload: Vec<u8>,
}

/// Parse an Ethernet II frame. Returns `None` only if the buffer is too
/// short to even hold the fixed header (14 bytes) — anything shorter is
/// malformed wire input, logged and dropped by the caller.
pub fn parse(bytes: &[u8]) -> Option<EthernetFrame> {
    if bytes.len() < 14 {
        debug!(len = bytes.len(), "ethernet frame shorter than header");
        return None;
    }
    let dst_mac = MacAddress::from_bytes(&bytes[0..6]);
    let src_mac = MacAddress::from_bytes(&bytes[6..12]);
    let tag = u16::from_be_bytes([bytes[12], bytes[13]]);
    let offset = 14;

    if tag == VLAN_8021Q || tag == VLAN_8021AD {
        debug!(tag, "dropping VLAN-tagged frame: VLAN is not supported");
        return None;
    }

    Some(EthernetFrame {
        dst_mac,
        src_mac,
        ethertype: EtherType::from_u16(tag),
        payload: bytes[offset..].to_vec(),
    })
}

/// Emit an Ethernet II frame to bytes.
pub fn emit(frame: &EthernetFrame) -> Vec<u8> {
    let mut out = Vec::with_capacity(14 + frame.payload.len());
    out.extend_from_slice(&frame.dst_mac.octets());
    out.extend_from_slice(&frame.src_mac.octets());
    out.extend_from_slice(&frame.ethertype.to_u16().to_be_bytes());
    out.extend_from_slice(&frame.payload);
    out
}

/// The Ethernet layer: decodes inbound bytes and fans the decoded frame out
/// to registered subprotocols (ARP, IPv4; IPv6 has no registrant and is
/// silently blackholed per spec Non-goals).
#[derive(Default)]
pub struct EthernetLayer {
    pub subprotocols: Dispatcher<EthernetFrame, crate::state::NetState>,
}

impl EthernetLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode `bytes` and offer the frame to registered subprotocols.
    /// Returns `Consumed::NO` for malformed input or an unconsumed frame;
    /// both are logged, not errored (§2).
    pub fn receive(&mut self, ctx: &mut crate::state::NetState, bytes: &[u8]) -> Consumed {
        let Some(frame) = parse(bytes) else {
            return Consumed::NO;
        };
        let consumed = self.subprotocols.dispatch(ctx, &frame);
        if !consumed.is_consumed() {
            debug!(ethertype = ?frame.ethertype, "unconsumed ethernet frame");
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EthernetFrame {
        EthernetFrame {
            dst_mac: MacAddress::new([1, 2, 3, 4, 5, 6]),
            src_mac: MacAddress::new([7, 8, 9, 10, 11, 12]),
            ethertype: EtherType::Ipv4,
            payload: vec![0xAB; 20],
        }
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let frame = sample();
        let bytes = emit(&frame);
        assert_eq!(parse(&bytes), Some(frame));
    }

    #[test]
    fn vlan_tagged_frames_are_dropped() {
        let mut bytes = vec![0xFF; 12];
        bytes.extend_from_slice(&VLAN_8021Q.to_be_bytes());
        bytes.extend_from_slice(&[0, 1, 2, 3]);
        assert_eq!(parse(&bytes), None);
    }

    #[test]
    fn too_short_is_dropped_not_panicked() {
        assert_eq!(parse(&[1, 2, 3]), None);
    }
}
