//! Address Resolution Protocol: request/reply parsing and emission, plus the
//! router's ARP responder.
//!
//! ARP is not a distinct layer in the Ethernet → IPv4 sense; it rides
//! directly on Ethernet (§4.3) and the router answers on behalf of every
//! device it has a lease for instead of maintaining a cache of its own.

use tracing::debug;

use crate::addr::{Ipv4Address, MacAddress};
use crate::ethernet::{EtherType, EthernetFrame};
use crate::framework::{Consumed, Subprotocol};
use crate::router::Router;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOperation {
    Request,
    Reply,
}

impl ArpOperation {
    fn to_u16(self) -> u16 {
        match self {
            ArpOperation::Request => 1,
            ArpOperation::Reply => 2,
        }
    }

    fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(ArpOperation::Request),
            2 => Some(ArpOperation::Reply),
            _ => None,
        }
    }
}

/// A decoded ARP request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub operation: ArpOperation,
    pub src_mac: MacAddress,
    pub src_ip: Ipv4Address,
    /// For a request, the IP being queried ("who has"). For a reply, the
    /// requester's own address — same field position on the wire, different
    /// meaning depending on `operation`.
    pub dst_mac: MacAddress,
    pub dst_ip: Ipv4Address,
}

const ARP_PAYLOAD_LEN: usize = 2 + 2 + 1 + 1 + 2 + 6 + 4 + 6 + 4;

/// Parse an ARP packet from an Ethernet payload. Invalid `htype`/`ptype` or
/// an unrecognized operation are logged and consumed (§4.3): the caller
/// should treat `None` as "consumed, nothing more to do".
pub fn parse(bytes: &[u8]) -> Option<ArpPacket> {
    if bytes.len() < ARP_PAYLOAD_LEN {
        debug!(len = bytes.len(), "arp packet shorter than fixed payload");
        return None;
    }
    let htype = u16::from_be_bytes([bytes[0], bytes[1]]);
    let ptype = u16::from_be_bytes([bytes[2], bytes[3]]);
    if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 {
        debug!(htype, ptype, "unsupported arp hardware/protocol type");
        return None;
    }
    let operation = match ArpOperation::from_u16(u16::from_be_bytes([bytes[6], bytes[7]])) {
        Some(op) => op,
        None => {
            debug!("unsupported arp operation");
            return None;
        }
    };
    Some(ArpPacket {
        operation,
        src_mac: MacAddress::from_bytes(&bytes[8..14]),
        src_ip: Ipv4Address::from_bytes(&bytes[14..18]),
        dst_mac: MacAddress::from_bytes(&bytes[18..24]),
        dst_ip: Ipv4Address::from_bytes(&bytes[24..28]),
    })
}

/// Emit an ARP packet.
pub fn emit(packet: &ArpPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(ARP_PAYLOAD_LEN);
    out.extend_from_slice(&HTYPE_ETHERNET.to_be_bytes());
    out.extend_from_slice(&PTYPE_IPV4.to_be_bytes());
    out.push(6); // hlen
    out.push(4); // plen
    out.extend_from_slice(&packet.operation.to_u16().to_be_bytes());
    out.extend_from_slice(&packet.src_mac.octets());
    out.extend_from_slice(&packet.src_ip.octets());
    out.extend_from_slice(&packet.dst_mac.octets());
    out.extend_from_slice(&packet.dst_ip.octets());
    out
}

/// The ARP layer: sits on Ethernet, decodes, and runs the router responder
/// before any ordinary client logic (there is none here beyond validation —
/// this stack resolves next-hop MACs by asking the router directly, per
/// §4.4, rather than maintaining an ARP cache).
pub struct ArpLayer;

impl Subprotocol<EthernetFrame, crate::state::NetState> for ArpLayer {
    fn on_frame(&mut self, ctx: &mut crate::state::NetState, frame: &EthernetFrame) -> Consumed {
        if frame.ethertype != EtherType::Arp {
            return Consumed::NO;
        }
        let Some(packet) = parse(&frame.payload) else {
            return Consumed::YES; // malformed input: logged by `parse`, consumed
        };
        respond(&mut ctx.router, &packet);
        Consumed::YES
    }
}

/// Router ARP responder (§4.3). Runs for every inbound ARP frame:
/// 1. Loopback suppression: a frame whose source MAC is the router's own is ignored.
/// 2. A frame not addressed to us (unicast to someone else) passes through unanswered.
/// 3. Otherwise, answer with the queried device's MAC if known, else log and drop.
fn respond(router: &mut Router, packet: &ArpPacket) {
    if packet.src_mac == router.mac() {
        return;
    }
    // Steps 2/3 only make sense for requests; replies aren't aimed at us to answer.
    if packet.operation != ArpOperation::Request {
        debug!(?packet, "arp reply observed, no cache to update");
        return;
    }
    if packet.dst_mac != router.mac() && !packet.dst_mac.is_broadcast() {
        return;
    }
    match router.get_device_by_ip(packet.dst_ip) {
        Some(device) => {
            let reply = ArpPacket {
                operation: ArpOperation::Reply,
                src_mac: device.mac,
                src_ip: packet.dst_ip,
                dst_mac: packet.src_mac,
                dst_ip: packet.src_ip,
            };
            router.queue_arp_reply(reply);
        }
        None => {
            debug!(queried = %packet.dst_ip, "arp who-has for unknown device, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ArpPacket {
        ArpPacket {
            operation: ArpOperation::Request,
            src_mac: MacAddress::new([1, 2, 3, 4, 5, 6]),
            src_ip: Ipv4Address::new([192, 168, 0, 5]),
            dst_mac: MacAddress::BROADCAST,
            dst_ip: Ipv4Address::new([192, 168, 0, 1]),
        }
    }

    #[test]
    fn round_trips() {
        let packet = sample();
        assert_eq!(parse(&emit(&packet)), Some(packet));
    }

    #[test]
    fn rejects_wrong_hardware_type() {
        let mut bytes = emit(&sample());
        bytes[1] = 2; // htype = 2, not ethernet
        assert_eq!(parse(&bytes), None);
    }
}
