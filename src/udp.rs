//! UDP: parse/emit with the IPv4 pseudo-header checksum (§4.6).
//!
//! The only subprotocol riding on UDP in this stack is the router's DHCP
//! server, registered at port 67 (§9, "Router-as-subprotocol").

use tracing::debug;

use crate::checksum::{pseudo_header_checksum, verify_pseudo_header_checksum};
use crate::framework::{Consumed, Dispatcher, Subprotocol};
use crate::ipv4::{IpProtocol, Ipv4Packet};

const HEADER_LEN: usize = 8;
const PROTOCOL_UDP: u8 = 0x11;

/// A decoded UDP datagram. `src`/`dst` carry the enclosing IPv4 addresses so
/// a registered subprotocol can reply without re-deriving them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: Vec<u8>,
}

/// Parse a UDP datagram from an IPv4 payload. The `length` field must equal
/// the bytes actually present, and the pseudo-header checksum (covering
/// `src_ip`/`dst_ip`) must validate; both failures are logged and dropped
/// (§4.6, malformed wire input).
pub fn parse(bytes: &[u8], src_ip: crate::addr::Ipv4Address, dst_ip: crate::addr::Ipv4Address) -> Option<UdpDatagram> {
    if bytes.len() < HEADER_LEN {
        debug!(len = bytes.len(), "udp datagram shorter than header");
        return None;
    }
    let length = u16::from_be_bytes([bytes[4], bytes[5]]) as usize;
    if length != bytes.len() {
        debug!(length, actual = bytes.len(), "udp length does not match received bytes");
        return None;
    }
    if !verify_pseudo_header_checksum(src_ip, dst_ip, PROTOCOL_UDP, bytes) {
        debug!("udp checksum mismatch");
        return None;
    }
    Some(UdpDatagram {
        src_port: u16::from_be_bytes([bytes[0], bytes[1]]),
        dst_port: u16::from_be_bytes([bytes[2], bytes[3]]),
        payload: bytes[HEADER_LEN..].to_vec(),
    })
}

/// Emit a UDP datagram. If the computed checksum folds to zero, it is
/// replaced with `0xFFFF` per the UDP-over-IPv4 "no checksum" disambiguation
/// convention (§4.6).
pub fn emit(src_ip: crate::addr::Ipv4Address, dst_ip: crate::addr::Ipv4Address, datagram: &UdpDatagram) -> Vec<u8> {
    let length = HEADER_LEN + datagram.payload.len();
    let mut out = Vec::with_capacity(length);
    out.extend_from_slice(&datagram.src_port.to_be_bytes());
    out.extend_from_slice(&datagram.dst_port.to_be_bytes());
    out.extend_from_slice(&(length as u16).to_be_bytes());
    out.extend_from_slice(&[0, 0]); // checksum placeholder
    out.extend_from_slice(&datagram.payload);

    let checksum = match pseudo_header_checksum(src_ip, dst_ip, PROTOCOL_UDP, &out) {
        0 => 0xFFFF,
        other => other,
    };
    out[6..8].copy_from_slice(&checksum.to_be_bytes());
    out
}

/// The UDP layer: decodes datagrams out of an IPv4 payload and fans them
/// out to registered subprotocols (the DHCP server).
#[derive(Default)]
pub struct UdpLayer {
    pub subprotocols: Dispatcher<UdpDatagram, crate::state::NetState>,
}

impl UdpLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle an inbound IPv4 packet already known to carry UDP.
    pub fn receive(&mut self, ctx: &mut crate::state::NetState, ip: &Ipv4Packet) -> Consumed {
        if ip.protocol != IpProtocol::Udp {
            return Consumed::NO;
        }
        let Some(datagram) = parse(&ip.payload, ip.src, ip.dst) else {
            return Consumed::YES;
        };
        let consumed = self.subprotocols.dispatch(ctx, &datagram);
        if !consumed.is_consumed() {
            debug!(port = datagram.dst_port, "unconsumed udp datagram");
        }
        Consumed::YES
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Ipv4Address;

    fn addrs() -> (Ipv4Address, Ipv4Address) {
        (Ipv4Address::new([10, 0, 0, 1]), Ipv4Address::new([10, 0, 0, 2]))
    }

    #[test]
    fn round_trips_through_emit_and_parse() {
        let (src, dst) = addrs();
        let datagram = UdpDatagram { src_port: 68, dst_port: 67, payload: vec![1, 2, 3, 4, 5] };
        let bytes = emit(src, dst, &datagram);
        assert_eq!(parse(&bytes, src, dst), Some(datagram));
    }

    #[test]
    fn zero_checksum_is_replaced_with_all_ones() {
        let (src, dst) = addrs();
        let datagram = UdpDatagram { src_port: 0, dst_port: 0, payload: vec![] };
        let bytes = emit(src, dst, &datagram);
        assert_eq!(&bytes[6..8], &0xFFFF_u16.to_be_bytes());
    }

    #[test]
    fn rejects_mismatched_length() {
        let (src, dst) = addrs();
        let datagram = UdpDatagram { src_port: 1, dst_port: 2, payload: vec![9; 4] };
        let mut bytes = emit(src, dst, &datagram);
        bytes[4..6].copy_from_slice(&9999_u16.to_be_bytes());
        assert_eq!(parse(&bytes, src, dst), None);
    }

    #[test]
    fn rejects_checksum_mismatch_against_wrong_addresses() {
        let (src, dst) = addrs();
        let datagram = UdpDatagram { src_port: 1, dst_port: 2, payload: vec![9; 4] };
        let bytes = emit(src, dst, &datagram);
        let wrong_src = Ipv4Address::new([192, 168, 0, 99]);
        assert_eq!(parse(&bytes, wrong_src, dst), None);
    }
}
