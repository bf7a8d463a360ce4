//! The adapter: wiring from the byte bus into the protocol stack, packet
//! capture, lifecycle, and the socket-facing API surface (§4.10).
//!
//! Construction fixes the router's MAC/IP/subnet and registers ARP and IPv4
//! at the Ethernet layer; IPv6 has no registrant and is silently blackholed
//! (spec Non-goals). Everything above Ethernet runs on a single thread with
//! no internal mutex (§5) — the only reason this type ever needs `Rc<RefCell<_>>`
//! is [`Adapter::ping`], whose returned future must reach back into the
//! stack after the call that created it returns.

use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant, SystemTime};

use tracing::{info, warn};

use crate::addr::Ipv4Address;
use crate::arp::ArpLayer;
use crate::error::NetstackError;
use crate::ethernet::EthernetLayer;
use crate::icmp::IcmpState;
use crate::ipv4::Ipv4Layer;
use crate::rng::Rng;
use crate::router::RouterConfig;
use crate::state::NetState;
use crate::tcp::{TcpHandle, TcpSocket};

/// The emulator-facing byte bus (§6). `send` pushes a frame toward the
/// emulator on the named channel (normally `"net0-receive"`); the matching
/// direction — frames the emulator sends out on `"net0-send"` — arrives as a
/// direct call to [`Adapter::receive_frame`] from the embedder's poll loop,
/// rather than a callback this type registers into the bus itself (doing so
/// would need the bus to hold a reference back into the adapter it's wired
/// into, which this single-threaded, no-internal-mutex design avoids).
pub trait ByteBus {
    fn send(&mut self, channel: &str, bytes: Vec<u8>);
}

struct NullBus;
impl ByteBus for NullBus {
    fn send(&mut self, _channel: &str, _bytes: Vec<u8>) {}
}

/// Frame/byte counters and coarse drop counts, updated synchronously as
/// frames are processed (§4.10 ambient instrumentation).
#[derive(Debug, Default, Clone, Copy)]
pub struct NetworkStats {
    pub rx_frames: u64,
    pub rx_bytes: u64,
    pub tx_frames: u64,
    pub tx_bytes: u64,
    /// Frames the Ethernet layer dropped: too short, VLAN-tagged, or
    /// unconsumed by every registered subprotocol.
    pub ethernet_dropped: u64,
    /// IPv4 packets decoded but not claimed by ICMP/UDP/TCP (unknown protocol number).
    pub ipv4_unconsumed: u64,
}

const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
const PCAP_VERSION_MAJOR: u16 = 2;
const PCAP_VERSION_MINOR: u16 = 4;
const DLT_ETHERNET: u32 = 1;

fn pcap_global_header() -> Vec<u8> {
    let mut header = Vec::with_capacity(24);
    header.extend_from_slice(&PCAP_MAGIC.to_le_bytes());
    header.extend_from_slice(&PCAP_VERSION_MAJOR.to_le_bytes());
    header.extend_from_slice(&PCAP_VERSION_MINOR.to_le_bytes());
    header.extend_from_slice(&0_i32.to_le_bytes()); // thiszone
    header.extend_from_slice(&0_u32.to_le_bytes()); // sigfigs
    header.extend_from_slice(&0xFFFF_FFFF_u32.to_le_bytes()); // snaplen
    header.extend_from_slice(&DLT_ETHERNET.to_le_bytes());
    header
}

fn pcap_record(bytes: &[u8]) -> Vec<u8> {
    let now = SystemTime::now().duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    let mut record = Vec::with_capacity(16 + bytes.len());
    record.extend_from_slice(&(now.as_secs() as u32).to_le_bytes());
    record.extend_from_slice(&(now.subsec_micros()).to_le_bytes());
    record.extend_from_slice(&(bytes.len() as u32).to_le_bytes()); // captured length
    record.extend_from_slice(&(bytes.len() as u32).to_le_bytes()); // original length
    record.extend_from_slice(bytes);
    record
}

/// The top-level handle an embedder holds: one protocol stack, one bus
/// reference, optional packet capture, and the lifecycle around them.
pub struct Adapter {
    state: NetState,
    ethernet: EthernetLayer,
    bus: Box<dyn ByteBus>,
    capture: Option<Vec<u8>>,
    stats: NetworkStats,
    destroyed: bool,
}

impl Adapter {
    pub fn new(bus: Box<dyn ByteBus>, now: Instant, rng: Box<dyn Rng>) -> Self {
        let router_config = RouterConfig::default();
        let ping_server = router_config.ip;
        let mut ethernet = EthernetLayer::new();
        ethernet.subprotocols.register(ArpLayer);
        ethernet.subprotocols.register(Ipv4Layer);
        Adapter {
            state: NetState::new(now, router_config, ping_server, rng),
            ethernet,
            bus,
            capture: None,
            stats: NetworkStats::default(),
            destroyed: false,
        }
    }

    /// Entry point for frames the emulator sends out (`"net0-send"`).
    /// Captures the frame first if capture is running, then decodes and
    /// dispatches it (§4.10: only inbound-to-the-adapter frames are captured).
    pub fn receive_frame(&mut self, bytes: &[u8]) {
        if self.destroyed {
            warn!("receive_frame called on a destroyed adapter");
            return;
        }
        if let Some(capture) = self.capture.as_mut() {
            capture.extend_from_slice(&pcap_record(bytes));
        }
        self.stats.rx_frames += 1;
        self.stats.rx_bytes += bytes.len() as u64;

        let consumed = self.ethernet.receive(&mut self.state, bytes);
        if !consumed.is_consumed() {
            self.stats.ethernet_dropped += 1;
        }
    }

    /// Advance the timer queue and flush every layer's outbox to the bus.
    /// Drives retransmission, the deferred `onEstablished` callback, and
    /// outbound ARP/DHCP/ICMP/TCP traffic (§5).
    ///
    /// Every emitted frame is both written to the bus *and* looped back into
    /// the local dispatcher (§4.10), so that local clients can talk to the
    /// emulator's NIC through this same stack — this is also what makes the
    /// ARP/DHCP loopback-suppression checks in `arp.rs`/`dhcp/server.rs`
    /// reachable: our own emissions re-enter as inbound frames whose source
    /// is the router itself.
    pub fn advance(&mut self, now: Instant) {
        if self.destroyed {
            return;
        }
        self.state.advance(now);
        for frame in self.state.drain_outbound_frames() {
            self.stats.tx_frames += 1;
            self.stats.tx_bytes += frame.len() as u64;
            self.bus.send("net0-receive", frame.clone());
            self.deliver_locally(&frame);
        }
    }

    /// Feed an outbound frame back through the local dispatcher. Distinct
    /// from `receive_frame`: this frame didn't arrive over the bus, so it's
    /// neither captured nor counted as an rx frame; anything it provokes in
    /// turn is left queued for the next `advance` tick rather than recursed
    /// into immediately.
    fn deliver_locally(&mut self, bytes: &[u8]) {
        let consumed = self.ethernet.receive(&mut self.state, bytes);
        if !consumed.is_consumed() {
            self.stats.ethernet_dropped += 1;
        }
    }

    pub fn stats(&self) -> NetworkStats {
        let mut stats = self.stats;
        stats.ipv4_unconsumed = self.state.ipv4_unconsumed();
        stats
    }

    pub fn start_capture(&mut self) {
        self.capture = Some(pcap_global_header());
    }

    /// Stop capture and return the accumulated pcap buffer, if capture was running.
    pub fn stop_capture(&mut self) -> Option<Vec<u8>> {
        self.capture.take()
    }

    pub fn connect(&mut self, src_ip: Ipv4Address, dst_ip: Ipv4Address, src_port: u16, dst_port: u16) -> Result<TcpHandle, NetstackError> {
        if self.destroyed {
            return Err(NetstackError::Destroyed);
        }
        let now = self.state.scheduler.now();
        let rng: &mut dyn Rng = &mut *self.state.rng;
        Ok(crate::tcp::connect(&mut self.state.tcp, &mut self.state.scheduler, rng, now, src_ip, dst_ip, src_port, dst_port))
    }

    pub fn listen(&mut self, ip: Ipv4Address, port: u16, callback: impl FnMut(&mut TcpSocket) + 'static) -> Result<(), NetstackError> {
        if self.destroyed {
            return Err(NetstackError::Destroyed);
        }
        self.state.tcp.listen(ip, port, callback)
    }

    pub fn listen_exact(&mut self, server_ip: Ipv4Address, client_ip: Ipv4Address, server_port: u16, client_port: u16) -> Result<TcpHandle, NetstackError> {
        if self.destroyed {
            return Err(NetstackError::Destroyed);
        }
        Ok(self.state.tcp.listen_exact(server_ip, client_ip, server_port, client_port))
    }

    pub fn write(&mut self, handle: &TcpHandle, bytes: Vec<u8>) -> Result<(), NetstackError> {
        if self.destroyed {
            return Err(NetstackError::Destroyed);
        }
        let now = self.state.scheduler.now();
        let rng: &mut dyn Rng = &mut *self.state.rng;
        crate::tcp::write(&mut self.state.tcp, &mut self.state.scheduler, rng, now, handle, bytes)
    }

    pub fn close(&mut self, handle: &TcpHandle) -> Result<(), NetstackError> {
        if self.destroyed {
            return Err(NetstackError::Destroyed);
        }
        let now = self.state.scheduler.now();
        let rng: &mut dyn Rng = &mut *self.state.rng;
        crate::tcp::close(&mut self.state.tcp, &mut self.state.scheduler, rng, now, handle)
    }

    pub fn on_established(&mut self, handle: &TcpHandle, cb: impl FnMut() + 'static) {
        self.state.tcp.on_established(handle, cb);
    }

    pub fn on_data(&mut self, handle: &TcpHandle, cb: impl FnMut(&[u8]) + 'static) {
        self.state.tcp.on_data(handle, cb);
    }

    pub fn on_close(&mut self, handle: &TcpHandle, cb: impl FnMut() + 'static) {
        self.state.tcp.on_close(handle, cb);
    }

    pub fn tcp_is_closed(&self, handle: &TcpHandle) -> bool {
        self.state.tcp.is_closed(handle)
    }

    /// Ping `dest_ip` from `src_ip`, resolving with the round-trip time.
    /// Takes `&Rc<RefCell<Adapter>>` rather than `&mut self` because the
    /// returned future must reach back into the stack on a later poll, after
    /// this call has already returned (§6; mirrors [`IcmpState::into_awaitable`]'s
    /// own doc comment on the intended usage).
    pub fn ping(adapter: &Rc<RefCell<Adapter>>, src_ip: Ipv4Address, dest_ip: Ipv4Address) -> impl std::future::Future<Output = Result<Duration, NetstackError>> {
        let future = {
            let mut a = adapter.borrow_mut();
            let now = a.state.scheduler.now();
            let rng: &mut dyn Rng = &mut *a.state.rng;
            a.state.icmp.ping(src_ip, dest_ip, now, rng)
        };
        let weak: Weak<RefCell<Adapter>> = Rc::downgrade(adapter);
        IcmpState::into_awaitable(future, move |access: &mut dyn FnMut(&mut IcmpState)| {
            if let Some(strong) = weak.upgrade() {
                access(&mut strong.borrow_mut().state.icmp);
            }
        })
    }

    /// Tear down: stop accepting inbound frames, drop the bus reference, and
    /// make every subsequent operation return `Destroyed` (§5, §7).
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        info!("adapter destroyed");
        self.destroyed = true;
        self.bus = Box::new(NullBus);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rng::StepRng;

    struct RecordingBus {
        sent: Vec<(String, Vec<u8>)>,
    }
    impl ByteBus for RecordingBus {
        fn send(&mut self, channel: &str, bytes: Vec<u8>) {
            self.sent.push((channel.to_string(), bytes));
        }
    }

    fn test_adapter() -> Adapter {
        let rng = Box::new(StepRng(rand::rngs::mock::StepRng::new(0x1111_1111, 0x2222_2222)));
        Adapter::new(Box::new(RecordingBus { sent: Vec::new() }), Instant::now(), rng)
    }

    /// A `ByteBus` that shares its sent frames with the test so they can be
    /// inspected after they're moved into the `Adapter`.
    struct SharedBus(std::rc::Rc<std::cell::RefCell<Vec<Vec<u8>>>>);
    impl ByteBus for SharedBus {
        fn send(&mut self, _channel: &str, bytes: Vec<u8>) {
            self.0.borrow_mut().push(bytes);
        }
    }

    #[test]
    fn malformed_frame_is_dropped_and_counted() {
        let mut adapter = test_adapter();
        adapter.receive_frame(&[1, 2, 3]); // shorter than an Ethernet header
        assert_eq!(adapter.stats().rx_frames, 1);
        assert_eq!(adapter.stats().ethernet_dropped, 1);
    }

    #[test]
    fn capture_accumulates_a_valid_pcap_header() {
        let mut adapter = test_adapter();
        adapter.start_capture();
        adapter.receive_frame(&[0xFF; 14]);
        let pcap = adapter.stop_capture().unwrap();
        assert!(pcap.len() >= 24);
        assert_eq!(&pcap[0..4], &PCAP_MAGIC.to_le_bytes());
    }

    #[test]
    fn operations_after_destroy_return_destroyed_error() {
        let mut adapter = test_adapter();
        adapter.destroy();
        let result = adapter.connect(Ipv4Address::new([10, 0, 0, 1]), Ipv4Address::new([10, 0, 0, 2]), 1234, 5432);
        assert_eq!(result, Err(NetstackError::Destroyed));
    }

    /// An ARP who-has for the router's own address is answered on the bus,
    /// and the reply loops back into the local dispatcher too (§4.10). The
    /// reply's source MAC is the router's own, so the loopback suppression
    /// in `arp.rs` must silently absorb it rather than answering its own
    /// answer — if that loop weren't wired up, this couldn't happen at all.
    #[test]
    fn outbound_arp_reply_loops_back_and_is_suppressed() {
        let sent = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let rng = Box::new(StepRng(rand::rngs::mock::StepRng::new(0x1111_1111, 0x2222_2222)));
        let mut adapter = Adapter::new(Box::new(SharedBus(sent.clone())), Instant::now(), rng);

        let router_ip = adapter.state.router.ip();
        let requester_mac = crate::addr::MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let requester_ip = Ipv4Address::new([192, 168, 0, 5]);
        let request = crate::arp::ArpPacket {
            operation: crate::arp::ArpOperation::Request,
            src_mac: requester_mac,
            src_ip: requester_ip,
            dst_mac: crate::addr::MacAddress::BROADCAST,
            dst_ip: router_ip,
        };
        let frame = crate::ethernet::EthernetFrame {
            dst_mac: crate::addr::MacAddress::BROADCAST,
            src_mac: requester_mac,
            ethertype: crate::ethernet::EtherType::Arp,
            payload: crate::arp::emit(&request),
        };
        adapter.receive_frame(&crate::ethernet::emit(&frame));
        adapter.advance(Instant::now());

        assert_eq!(sent.borrow().len(), 1);
        assert_eq!(adapter.stats().ethernet_dropped, 0);
    }
}
