//! The concrete context (`Ctx`) threaded through every layer's dispatcher:
//! router state, the ICMP/UDP/TCP protocol state, the timer queue, and the
//! rng. One value of this type is what an adapter owns and feeds bytes into.

use std::collections::VecDeque;
use std::time::Instant;

use crate::addr::Ipv4Address;
use crate::dhcp::server::DhcpServer;
use crate::framework::Consumed;
use crate::icmp::IcmpState;
use crate::ipv4::{IpProtocol, Ipv4Packet, Ipv4SendIntent};
use crate::router::{Router, RouterConfig};
use crate::rng::Rng;
use crate::scheduler::Scheduler;
use crate::tcp::TcpStack;
use crate::udp::UdpLayer;

/// Everything above the Ethernet layer, owned by one side of the bridge.
pub struct NetState {
    pub router: Router,
    pub icmp: IcmpState,
    udp: UdpLayer,
    pub tcp: TcpStack,
    pub scheduler: Scheduler<NetState>,
    pub rng: Box<dyn Rng>,
    ipv4_unconsumed: u64,
}

impl NetState {
    pub fn new(now: Instant, router_config: RouterConfig, ping_server: Ipv4Address, rng: Box<dyn Rng>) -> Self {
        let mut udp = UdpLayer::new();
        udp.subprotocols.register(DhcpServer);
        NetState {
            router: Router::new(router_config),
            icmp: IcmpState::new(ping_server),
            udp,
            tcp: TcpStack::new(),
            scheduler: Scheduler::new(now),
            rng,
            ipv4_unconsumed: 0,
        }
    }

    /// IPv4 packets decoded but claimed by no registered protocol (§4.10
    /// ambient instrumentation).
    pub fn ipv4_unconsumed(&self) -> u64 {
        self.ipv4_unconsumed
    }

    #[cfg(test)]
    pub fn new_for_test() -> Self {
        let config = RouterConfig::default();
        let ping_server = config.ip;
        let rng = Box::new(crate::rng::StepRng(rand::rngs::mock::StepRng::new(0x1234_5678, 0x9ABC_DEF0)));
        Self::new(Instant::now(), config, ping_server, rng)
    }

    /// Route a decoded IPv4 packet to ICMP, UDP, or TCP by protocol number
    /// (§4.4). UDP owns its own subprotocol dispatcher keyed on this same
    /// `NetState`, so it's taken out of `self` for the call and put back —
    /// the one place this stack needs the take/call/restore dance, since
    /// every other dispatcher lives outside `NetState` entirely (ethernet,
    /// ARP, IPv4 are all zero-state handlers registered into dispatchers
    /// owned by the adapter, not by the context they're handed).
    pub fn dispatch_ipv4(&mut self, packet: &Ipv4Packet) -> Consumed {
        match packet.protocol {
            IpProtocol::Icmp => {
                let now = self.scheduler.now();
                self.icmp.receive(packet, now);
                Consumed::YES
            }
            IpProtocol::Udp => {
                let mut udp = std::mem::take(&mut self.udp);
                let consumed = udp.receive(self, packet);
                self.udp = udp;
                consumed
            }
            IpProtocol::Tcp => crate::tcp::receive(self, packet),
            IpProtocol::Other(_) => {
                self.ipv4_unconsumed += 1;
                Consumed::NO
            }
        }
    }

    /// Advance the timer queue to `now`, firing any due retransmissions or
    /// the deferred `onEstablished` callback (§5).
    pub fn advance(&mut self, now: Instant) {
        crate::scheduler::advance(self, now, |state| &mut state.scheduler);
    }

    /// Drain every layer's outbox into finished Ethernet frames ready for
    /// the bus. Called once per adapter tick, after inbound bytes have been
    /// fed through and the scheduler has been advanced.
    pub fn drain_outbound_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();

        for reply in self.router.drain_arp_replies() {
            frames.push(crate::ethernet::emit(&crate::ethernet::EthernetFrame {
                dst_mac: reply.dst_mac,
                src_mac: self.router.mac(),
                ethertype: crate::ethernet::EtherType::Arp,
                payload: crate::arp::emit(&reply),
            }));
        }

        for reply in self.router.drain_dhcp_replies() {
            let datagram = crate::udp::UdpDatagram {
                src_port: 67,
                dst_port: 68,
                payload: crate::dhcp::protocol::emit(&reply.message),
            };
            let ip_payload = crate::udp::emit(self.router.ip(), Ipv4Address::BROADCAST, &datagram);
            let packet = Ipv4Packet {
                src: self.router.ip(),
                dst: Ipv4Address::BROADCAST,
                dscp: 0,
                ecn: 0,
                dont_fragment: true,
                ttl: 64,
                protocol: IpProtocol::Udp,
                payload: ip_payload,
            };
            frames.push(crate::ethernet::emit(&crate::ethernet::EthernetFrame {
                dst_mac: reply.dst_mac,
                src_mac: self.router.mac(),
                ethertype: crate::ethernet::EtherType::Ipv4,
                payload: crate::ipv4::emit(&packet),
            }));
        }

        let icmp_outbox: Vec<_> = self.icmp.outbox.drain(..).collect();
        for (src, dst, echo) in icmp_outbox {
            let intent = Ipv4SendIntent { src, dst, dscp: 0, ttl: 64, protocol: IpProtocol::Icmp, payload: crate::icmp::emit(&echo) };
            let frame = crate::ipv4::build_frame(&self.router, self.router.mac(), &intent);
            frames.push(crate::ethernet::emit(&frame));
        }

        let tcp_outbox: Vec<_> = self.tcp.outbox.drain(..).collect();
        for (src, dst, segment) in tcp_outbox {
            let payload = crate::tcp::emit(src, dst, &segment);
            let intent = Ipv4SendIntent { src, dst, dscp: 0, ttl: 64, protocol: IpProtocol::Tcp, payload };
            let frame = crate::ipv4::build_frame(&self.router, self.router.mac(), &intent);
            frames.push(crate::ethernet::emit(&frame));
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_server_reply_drains_as_an_ethernet_frame() {
        let mut state = NetState::new_for_test();
        let device_mac = crate::addr::MacAddress::new([1, 2, 3, 4, 5, 6]);
        let device_ip = state.router.register_device(device_mac).unwrap().ip;

        let echo = crate::icmp::IcmpEcho { is_reply: false, identifier: 1, sequence: 1, payload: vec![] };
        let packet = Ipv4Packet {
            src: device_ip,
            dst: state.router.ip(),
            dscp: 0,
            ecn: 0,
            dont_fragment: true,
            ttl: 64,
            protocol: IpProtocol::Icmp,
            payload: crate::icmp::emit(&echo),
        };
        assert_eq!(state.dispatch_ipv4(&packet), Consumed::YES);

        let frames = state.drain_outbound_frames();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn unroutable_protocol_is_not_consumed() {
        let mut state = NetState::new_for_test();
        let packet = Ipv4Packet {
            src: Ipv4Address::new([10, 0, 0, 1]),
            dst: state.router.ip(),
            dscp: 0,
            ecn: 0,
            dont_fragment: true,
            ttl: 64,
            protocol: IpProtocol::Other(200),
            payload: vec![],
        };
        assert_eq!(state.dispatch_ipv4(&packet), Consumed::NO);
    }
}
