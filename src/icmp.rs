//! ICMP: echo request/reply, the "ping server" behavior, and an outbound
//! `ping()` future (§4.5).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::addr::Ipv4Address;
use crate::checksum::{checksum_finalize, internet_checksum};
use crate::error::NetstackError;
use crate::ipv4::{IpProtocol, Ipv4Packet};

const ICMP_ECHO_REQUEST: u8 = 8;
const ICMP_ECHO_REPLY: u8 = 0;

/// A decoded ICMP echo request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub is_reply: bool,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// Parse an ICMP message. Only echo request (type 8) and echo reply (type 0),
/// code 0, are supported; anything else is logged and dropped (§4.5).
pub fn parse(bytes: &[u8]) -> Option<IcmpEcho> {
    if bytes.len() < 8 {
        debug!(len = bytes.len(), "icmp message shorter than header");
        return None;
    }
    let kind = bytes[0];
    let code = bytes[1];
    if code != 0 || (kind != ICMP_ECHO_REQUEST && kind != ICMP_ECHO_REPLY) {
        debug!(kind, code, "unsupported icmp type/code");
        return None;
    }
    if !verify_checksum(bytes) {
        debug!("icmp checksum mismatch");
        return None;
    }
    Some(IcmpEcho {
        is_reply: kind == ICMP_ECHO_REPLY,
        identifier: u16::from_be_bytes([bytes[4], bytes[5]]),
        sequence: u16::from_be_bytes([bytes[6], bytes[7]]),
        payload: bytes[8..].to_vec(),
    })
}

fn verify_checksum(bytes: &[u8]) -> bool {
    let stated = u16::from_be_bytes([bytes[2], bytes[3]]);
    let mut probe = bytes.to_vec();
    probe[2] = 0xFF;
    probe[3] = 0xFF;
    checksum_finalize(crate::checksum::checksum_accumulate(&probe, 0)) == stated
}

/// Emit an ICMP echo message. Header is `type, code, checksum-placeholder,
/// identifier, sequence, payload`; checksum is the bitwise-NOT of the
/// ones'-complement sum over the entire message (§4.5).
pub fn emit(echo: &IcmpEcho) -> Vec<u8> {
    let kind = if echo.is_reply { ICMP_ECHO_REPLY } else { ICMP_ECHO_REQUEST };
    let mut out = Vec::with_capacity(8 + echo.payload.len());
    out.push(kind);
    out.push(0); // code
    out.extend_from_slice(&[0xFF, 0xFF]); // checksum placeholder
    out.extend_from_slice(&echo.identifier.to_be_bytes());
    out.extend_from_slice(&echo.sequence.to_be_bytes());
    out.extend_from_slice(&echo.payload);
    let checksum = internet_checksum(&out);
    out[2..4].copy_from_slice(&checksum.to_be_bytes());
    out
}

struct Waiter {
    sent_at: Instant,
    waker: Option<Waker>,
    result: Option<Duration>,
}

/// ICMP layer state: the configured ping-server address and outstanding
/// outbound pings keyed by `identifier << 16 | sequence` (§4.5).
pub struct IcmpState {
    pub ping_server: Ipv4Address,
    waiters: HashMap<u32, Waiter>,
    pub outbox: Vec<(Ipv4Address, Ipv4Address, IcmpEcho)>, // (src, dst, message)
}

impl IcmpState {
    pub fn new(ping_server: Ipv4Address) -> Self {
        IcmpState { ping_server, waiters: HashMap::new(), outbox: Vec::new() }
    }

    /// Handle an inbound IPv4 packet whose protocol is ICMP.
    pub fn receive(&mut self, ip: &Ipv4Packet, now: Instant) {
        if ip.protocol != IpProtocol::Icmp {
            return;
        }
        let Some(echo) = parse(&ip.payload) else { return };

        if !echo.is_reply && ip.dst == self.ping_server {
            let reply = IcmpEcho { is_reply: true, identifier: echo.identifier, sequence: echo.sequence, payload: echo.payload };
            self.outbox.push((ip.dst, ip.src, reply));
            return;
        }

        if echo.is_reply {
            let key = (echo.identifier as u32) << 16 | echo.sequence as u32;
            if let Some(mut waiter) = self.waiters.remove(&key) {
                waiter.result = Some(now.saturating_duration_since(waiter.sent_at));
                if let Some(waker) = waiter.waker.take() {
                    waker.wake();
                }
                self.waiters.insert(key, waiter);
            }
        }
    }

    /// Start a ping from `src_ip` to `dest_ip`, returning a future that
    /// resolves with the round-trip time once the matching echo reply
    /// arrives.
    pub fn ping(&mut self, src_ip: Ipv4Address, dest_ip: Ipv4Address, now: Instant, rng: &mut dyn crate::rng::Rng) -> PingFuture {
        let identifier = (rng.next_u32() & 0xFFFF) as u16;
        let sequence = (rng.next_u32() & 0xFFFF) as u16;
        let key = (identifier as u32) << 16 | sequence as u32;
        self.waiters.insert(key, Waiter { sent_at: now, waker: None, result: None });
        self.outbox.push((
            src_ip,
            dest_ip,
            IcmpEcho { is_reply: false, identifier, sequence, payload: Vec::new() },
        ));
        PingFuture { key }
    }

    fn poll_key(&mut self, key: u32, waker: &Waker) -> Poll<Result<Duration, NetstackError>> {
        match self.waiters.get_mut(&key) {
            Some(waiter) => match waiter.result {
                Some(rtt) => {
                    self.waiters.remove(&key);
                    Poll::Ready(Ok(rtt))
                }
                None => {
                    waiter.waker = Some(waker.clone());
                    Poll::Pending
                }
            },
            // Removed means the adapter tore the waiter down (e.g. destroy()).
            None => Poll::Ready(Err(NetstackError::Destroyed)),
        }
    }
}

/// Future returned by [`IcmpState::ping`]. Polling it only makes progress
/// when the scheduler drives a tick that calls [`IcmpState::receive`] with a
/// matching reply — there is no background executor here (§6).
pub struct PingFuture {
    key: u32,
}

impl IcmpState {
    /// Wrap a [`PingFuture`] together with an accessor into a type that
    /// implements `std::future::Future` outright, for adapters that hold the
    /// stack behind `Rc<RefCell<_>>`.
    pub fn into_awaitable<A>(future: PingFuture, access: A) -> impl Future<Output = Result<Duration, NetstackError>>
    where
        A: Fn(&mut dyn FnMut(&mut IcmpState)) + 'static,
    {
        AwaitablePing { future: Some(future), access }
    }
}

struct AwaitablePing<A> {
    future: Option<PingFuture>,
    access: A,
}

impl<A> Future for AwaitablePing<A>
where
    A: Fn(&mut dyn FnMut(&mut IcmpState)) + 'static,
{
    type Output = Result<Duration, NetstackError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let future = this.future.as_ref().expect("polled after completion");
        let waker = cx.waker().clone();
        let mut result = Poll::Pending;
        (this.access)(&mut |state: &mut IcmpState| {
            result = state.poll_key(future.key, &waker);
        });
        if result.is_ready() {
            this.future = None;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_emit_and_parse() {
        let echo = IcmpEcho { is_reply: false, identifier: 7, sequence: 42, payload: vec![1, 2, 3] };
        let bytes = emit(&echo);
        assert_eq!(parse(&bytes), Some(echo));
    }

    #[test]
    fn checksum_round_trip_is_all_ones() {
        let echo = IcmpEcho { is_reply: true, identifier: 1, sequence: 1, payload: vec![9; 32] };
        let bytes = emit(&echo);
        assert!(crate::checksum::verify_internet_checksum(&bytes));
    }

    #[test]
    fn ping_server_answers_echo_request() {
        let ping_server = Ipv4Address::new([192, 168, 13, 37]);
        let mut state = IcmpState::new(ping_server);
        let request = IcmpEcho { is_reply: false, identifier: 1, sequence: 1, payload: vec![] };
        let ip = Ipv4Packet {
            src: Ipv4Address::new([192, 168, 0, 5]),
            dst: ping_server,
            dscp: 0,
            ecn: 0,
            dont_fragment: true,
            ttl: 64,
            protocol: IpProtocol::Icmp,
            payload: emit(&request),
        };
        state.receive(&ip, Instant::now());
        assert_eq!(state.outbox.len(), 1);
        assert!(state.outbox[0].2.is_reply);
    }
}
