//! Router state: the device registry, IP allocation, and the outboxes the
//! ARP and DHCP responders drop their replies into (§4.9).
//!
//! The router is itself always registered as the first device, always
//! confirmed, and is never removed for the adapter's lifetime.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::addr::{Ipv4Address, MacAddress};
use crate::arp::ArpPacket;
use crate::dhcp::protocol::DhcpMessage;

/// A device the router knows about: a MAC with a leased IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Device {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    /// Set once a DHCP REQUEST for this device's lease has been seen.
    pub confirmed: bool,
}

/// Router configuration fixed at construction (§4.10's adapter defaults).
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    pub mac: MacAddress,
    pub ip: Ipv4Address,
    pub subnet_mask: Ipv4Address,
}

impl Default for RouterConfig {
    fn default() -> Self {
        RouterConfig {
            mac: MacAddress::new([0x00, 0x0C, 0x13, 0x37, 0x42, 0x69]),
            ip: Ipv4Address::new([192, 168, 13, 37]),
            subnet_mask: Ipv4Address::new([255, 255, 0, 0]),
        }
    }
}

/// An outbound DHCP reply the server wants delivered: the message bytes, the
/// destination IP (normally the broadcast address), and the destination MAC.
#[derive(Debug, Clone)]
pub struct DhcpReply {
    pub message: DhcpMessage,
    pub dst_mac: MacAddress,
}

/// Router device registry, ARP responder state, and DHCP server state.
pub struct Router {
    config: RouterConfig,
    ip_to_mac: HashMap<Ipv4Address, MacAddress>,
    mac_to_device: HashMap<MacAddress, Device>,
    arp_outbox: VecDeque<ArpPacket>,
    dhcp_outbox: VecDeque<DhcpReply>,
}

impl Router {
    pub fn new(config: RouterConfig) -> Self {
        let mut router = Router {
            config,
            ip_to_mac: HashMap::new(),
            mac_to_device: HashMap::new(),
            arp_outbox: VecDeque::new(),
            dhcp_outbox: VecDeque::new(),
        };
        // The router registers itself first, always confirmed (§4.9).
        router.ip_to_mac.insert(config.ip, config.mac);
        router.mac_to_device.insert(
            config.mac,
            Device { mac: config.mac, ip: config.ip, confirmed: true },
        );
        router
    }

    pub fn mac(&self) -> MacAddress {
        self.config.mac
    }

    pub fn ip(&self) -> Ipv4Address {
        self.config.ip
    }

    pub fn subnet_mask(&self) -> Ipv4Address {
        self.config.subnet_mask
    }

    pub fn config(&self) -> RouterConfig {
        self.config
    }

    /// Network address of the router's subnet (bitwise AND of IP and mask).
    fn network_address(&self) -> Ipv4Address {
        self.config.ip.bitand(&self.config.subnet_mask)
    }

    /// Broadcast address of the router's subnet (network address with the
    /// host bits all set).
    fn broadcast_address(&self) -> Ipv4Address {
        self.network_address().bitor(&self.config.subnet_mask.not())
    }

    pub fn get_device_by_ip(&self, ip: Ipv4Address) -> Option<Device> {
        self.ip_to_mac.get(&ip).and_then(|mac| self.mac_to_device.get(mac)).copied()
    }

    pub fn get_device_by_mac(&self, mac: MacAddress) -> Option<Device> {
        self.mac_to_device.get(&mac).copied()
    }

    /// Allocate a fresh IP for `mac`, or return its existing lease if any
    /// (§4.9, idempotent). Scans the subnet linearly, skipping the network
    /// address, the broadcast address, and any already-assigned IP; returns
    /// `None` when the subnet is exhausted.
    pub fn get_or_register_device(&mut self, mac: MacAddress) -> Option<Device> {
        if let Some(device) = self.get_device_by_mac(mac) {
            return Some(device);
        }
        self.register_device(mac)
    }

    /// Unconditionally allocate a new lease for `mac`. Returns `None` if the
    /// subnet is exhausted. If `mac` already has a device, the existing
    /// device is returned unchanged (no double allocation per MAC).
    pub fn register_device(&mut self, mac: MacAddress) -> Option<Device> {
        if let Some(existing) = self.get_device_by_mac(mac) {
            return Some(existing);
        }
        let network = self.network_address().to_u32();
        let broadcast = self.broadcast_address().to_u32();
        for candidate in (network + 1)..broadcast {
            let ip = Ipv4Address::from_u32(candidate);
            if !self.ip_to_mac.contains_key(&ip) {
                let device = Device { mac, ip, confirmed: false };
                self.ip_to_mac.insert(ip, mac);
                self.mac_to_device.insert(mac, device);
                return Some(device);
            }
        }
        debug!(subnet = %self.network_address(), "subnet exhausted, cannot allocate a device address");
        None
    }

    /// Mark a device's lease confirmed (DHCP REQUEST seen). No-op if `mac`
    /// is unknown.
    pub fn confirm_device(&mut self, mac: MacAddress) {
        if let Some(device) = self.mac_to_device.get_mut(&mac) {
            device.confirmed = true;
            self.ip_to_mac.insert(device.ip, mac);
        }
    }

    pub fn queue_arp_reply(&mut self, reply: ArpPacket) {
        self.arp_outbox.push_back(reply);
    }

    pub fn drain_arp_replies(&mut self) -> Vec<ArpPacket> {
        self.arp_outbox.drain(..).collect()
    }

    pub fn queue_dhcp_reply(&mut self, reply: DhcpReply) {
        self.dhcp_outbox.push_back(reply);
    }

    pub fn drain_dhcp_replies(&mut self) -> Vec<DhcpReply> {
        self.dhcp_outbox.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn router() -> Router {
        Router::new(RouterConfig::default())
    }

    #[test]
    fn router_is_registered_first_and_confirmed() {
        let router = router();
        let device = router.get_device_by_ip(router.ip()).unwrap();
        assert_eq!(device.mac, router.mac());
        assert!(device.confirmed);
    }

    #[test]
    fn registering_assigns_unique_ips_within_subnet() {
        let mut router = router();
        let mac_a = MacAddress::new([1; 6]);
        let mac_b = MacAddress::new([2; 6]);
        let a = router.register_device(mac_a).unwrap();
        let b = router.register_device(mac_b).unwrap();
        assert_ne!(a.ip, b.ip);
        assert_ne!(a.ip, router.network_address());
        assert_ne!(a.ip, router.broadcast_address());
    }

    #[test]
    fn get_or_register_is_idempotent() {
        let mut router = router();
        let mac = MacAddress::new([9; 6]);
        let first = router.get_or_register_device(mac).unwrap();
        let second = router.get_or_register_device(mac).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn confirm_marks_device_confirmed() {
        let mut router = router();
        let mac = MacAddress::new([3; 6]);
        router.register_device(mac).unwrap();
        assert!(!router.get_device_by_mac(mac).unwrap().confirmed);
        router.confirm_device(mac);
        assert!(router.get_device_by_mac(mac).unwrap().confirmed);
    }

    #[test]
    fn exhausted_subnet_returns_none() {
        let config = RouterConfig {
            mac: MacAddress::new([0; 6]),
            ip: Ipv4Address::new([10, 0, 0, 1]),
            subnet_mask: Ipv4Address::new([255, 255, 255, 252]), // /30: 2 usable hosts
        };
        let mut router = Router::new(config);
        // .1 is the router itself; .2 is the only other usable address.
        assert!(router.register_device(MacAddress::new([1; 6])).is_some());
        assert!(router.register_device(MacAddress::new([2; 6])).is_none());
    }
}
