//! A user-space virtual network stack bridging an emulated Ethernet NIC's
//! raw byte bus to host-side clients expecting ordinary TCP sockets.
//!
//! Ethernet frames come in over [`adapter::ByteBus`] and are decoded,
//! dispatched, and answered entirely in this process: ARP and DHCP are
//! answered by the router in place, ICMP either answers on behalf of the
//! configured ping-server address or resolves an outbound [`Adapter::ping`],
//! and TCP terminates full connections so that ordinary PostgreSQL wire
//! protocol bytes can flow between the emulator and the host. IPv6 has no
//! registered handler and is silently dropped.

pub mod addr;
pub mod adapter;
pub mod arp;
pub mod checksum;
pub mod dhcp;
pub mod error;
pub mod ethernet;
pub mod framework;
pub mod icmp;
pub mod ipv4;
pub mod rng;
pub mod router;
pub mod scheduler;
pub mod state;
pub mod tcp;
pub mod udp;

pub use adapter::{Adapter, ByteBus, NetworkStats};
pub use error::NetstackError;
