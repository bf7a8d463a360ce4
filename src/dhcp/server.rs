//! The router's DHCP server: DISCOVER→OFFER, REQUEST→ACK (§4.7).
//!
//! Registered as a subprotocol at the UDP layer's port 67, exactly like the
//! ARP responder rides on Ethernet (§9, "Router-as-subprotocol") — it
//! receives already-decoded `UdpDatagram`s and answers through the router's
//! outbox rather than recursing into another layer.

use tracing::debug;

use crate::dhcp::protocol::{DhcpMessage, DhcpMessageType, DhcpOp, DhcpOption};
use crate::framework::{Consumed, Subprotocol};
use crate::router::{DhcpReply, Router};
use crate::udp::UdpDatagram;

const SERVER_PORT: u16 = 67;
const LEASE_SECONDS: u32 = 86400;
const HOST_NAME: &str = "emulatorhost";

pub struct DhcpServer;

impl Subprotocol<UdpDatagram, crate::state::NetState> for DhcpServer {
    fn on_frame(&mut self, ctx: &mut crate::state::NetState, datagram: &UdpDatagram) -> Consumed {
        if datagram.dst_port != SERVER_PORT {
            return Consumed::NO;
        }
        if datagram.src_port == SERVER_PORT {
            // Our own replies get looped back to the local dispatcher too;
            // a server-sourced port-67 datagram is one of ours, ignore it.
            debug!("ignoring dhcp datagram from our own server port");
            return Consumed::YES;
        }
        let Some(message) = crate::dhcp::protocol::parse(&datagram.payload) else {
            return Consumed::YES;
        };
        handle(&mut ctx.router, &message);
        Consumed::YES
    }
}

fn handle(router: &mut Router, message: &DhcpMessage) {
    match message.message_type() {
        Some(DhcpMessageType::Discover) => {
            let Some(device) = router.get_or_register_device(message.client_mac) else {
                debug!(mac = %message.client_mac, "dhcp discover dropped: subnet exhausted");
                return;
            };
            let reply = build_reply(router, &device.ip, message, DhcpMessageType::Offer);
            router.queue_dhcp_reply(DhcpReply { message: reply, dst_mac: message.client_mac });
        }
        Some(DhcpMessageType::Request) => {
            let Some(device) = router.get_or_register_device(message.client_mac) else {
                debug!(mac = %message.client_mac, "dhcp request dropped: subnet exhausted");
                return;
            };
            router.confirm_device(message.client_mac);
            let reply = build_reply(router, &device.ip, message, DhcpMessageType::Ack);
            router.queue_dhcp_reply(DhcpReply { message: reply, dst_mac: message.client_mac });
        }
        other => {
            debug!(?other, "dhcp message type not handled by this server");
        }
    }
}

/// Build the option set in every OFFER/ACK (§4.7): message type first, then
/// the client's requested order (option 55) if present, else the fixed set.
fn build_reply(
    router: &Router,
    assigned_ip: &crate::addr::Ipv4Address,
    request: &DhcpMessage,
    kind: DhcpMessageType,
) -> DhcpMessage {
    let mut options = vec![DhcpOption::MessageType(kind)];

    let available = |code: u8| -> Option<DhcpOption> {
        match code {
            1 => Some(DhcpOption::SubnetMask(router.subnet_mask())),
            3 => Some(DhcpOption::Router(vec![router.ip()])),
            6 => Some(DhcpOption::DomainNameServer(vec![router.ip()])),
            12 => Some(DhcpOption::HostName(HOST_NAME.to_string())),
            15 => Some(DhcpOption::DomainName(HOST_NAME.to_string())),
            28 => Some(DhcpOption::BroadcastAddress(crate::addr::Ipv4Address::BROADCAST)),
            51 => Some(DhcpOption::IpAddressLeaseTime(LEASE_SECONDS)),
            54 => Some(DhcpOption::ServerIdentifier(router.ip())),
            _ => None,
        }
    };
    const DEFAULT_ORDER: [u8; 8] = [1, 3, 6, 12, 15, 28, 51, 54];

    match request.parameter_request_list() {
        Some(requested) => {
            for &code in requested {
                if let Some(option) = available(code) {
                    options.push(option);
                }
            }
            // Always include the server identifier even if the client didn't ask.
            if !requested.contains(&54) {
                options.push(available(54).unwrap());
            }
        }
        None => {
            for code in DEFAULT_ORDER {
                options.push(available(code).unwrap());
            }
        }
    }

    DhcpMessage {
        op: DhcpOp::BootReply,
        xid: request.xid,
        secs: 0,
        flags: request.flags,
        client_ip: crate::addr::Ipv4Address::ANY,
        your_ip: *assigned_ip,
        server_ip: router.ip(),
        gateway_ip: crate::addr::Ipv4Address::ANY,
        client_mac: request.client_mac,
        server_name: String::new(),
        boot_file: String::new(),
        options,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::MacAddress;
    use crate::router::RouterConfig;

    fn discover(mac: MacAddress, xid: u32) -> DhcpMessage {
        DhcpMessage {
            op: DhcpOp::BootRequest,
            xid,
            secs: 0,
            flags: 0,
            client_ip: crate::addr::Ipv4Address::ANY,
            your_ip: crate::addr::Ipv4Address::ANY,
            server_ip: crate::addr::Ipv4Address::ANY,
            gateway_ip: crate::addr::Ipv4Address::ANY,
            client_mac: mac,
            server_name: String::new(),
            boot_file: String::new(),
            options: vec![DhcpOption::MessageType(DhcpMessageType::Discover)],
        }
    }

    #[test]
    fn discover_yields_offer_with_assigned_address_in_subnet() {
        let mut router = Router::new(RouterConfig::default());
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let request = discover(mac, 0xDEAD_BEEF);
        handle(&mut router, &request);

        let replies = router.drain_dhcp_replies();
        assert_eq!(replies.len(), 1);
        let reply = &replies[0].message;
        assert_eq!(reply.message_type(), Some(DhcpMessageType::Offer));
        assert_ne!(reply.your_ip, router.ip());
        assert_eq!(replies[0].dst_mac, mac);
    }

    #[test]
    fn request_confirms_device_and_yields_ack() {
        let mut router = Router::new(RouterConfig::default());
        let mac = MacAddress::new([1, 2, 3, 4, 5, 6]);
        handle(&mut router, &discover(mac, 1));
        router.drain_dhcp_replies();

        let mut request = discover(mac, 1);
        request.options = vec![DhcpOption::MessageType(DhcpMessageType::Request)];
        handle(&mut router, &request);

        let replies = router.drain_dhcp_replies();
        assert_eq!(replies[0].message.message_type(), Some(DhcpMessageType::Ack));
        assert!(router.get_device_by_mac(mac).unwrap().confirmed);
    }

    #[test]
    fn server_sourced_datagrams_are_ignored() {
        let mut layer = DhcpServer;
        let mut state = crate::state::NetState::new_for_test();
        let datagram = UdpDatagram { src_port: SERVER_PORT, dst_port: SERVER_PORT, payload: vec![] };
        assert_eq!(layer.on_frame(&mut state, &datagram), Consumed::YES);
        assert!(state.router.drain_dhcp_replies().is_empty());
    }
}
