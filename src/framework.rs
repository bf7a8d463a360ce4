//! The layered frame/data pipeline that every protocol module plugs into.
//!
//! A protocol is parameterized by four shapes: the frame it receives from its
//! parent, the decoded data it emits upward, the frame it emits to its
//! parent, and the data it consumes from upward layers (§4.1). In Rust this
//! is expressed as a handler owning a [`Dispatcher`] over its own decoded
//! frame type, rather than a single deeply-generic recursive type — each
//! protocol module (ethernet, arp, ipv4, ...) is concrete about its own wire
//! format, and only the fan-out/fan-in points are generic.
//!
//! Composition rule: a frame arriving at a layer is offered to the layer
//! itself first, then to each registered subprotocol in registration order;
//! the first one that reports [`Consumed(true)`] stops propagation at that
//! layer. An unconsumed frame is logged, not errored (§2). "Responder"
//! subprotocols — the ARP and DHCP responders riding on the router — are
//! ordinary [`Subprotocol`] implementors registered at their parent's data
//! shape; they don't recurse into another layer, they just answer in place
//! (§9, "Router-as-subprotocol").

/// Whether a subprotocol claimed a frame. A plain boolean, per the source:
/// no subprotocol needs to communicate anything richer than "handled / not
/// handled" back to its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Consumed(pub bool);

impl Consumed {
    pub const YES: Consumed = Consumed(true);
    pub const NO: Consumed = Consumed(false);

    pub fn is_consumed(self) -> bool {
        self.0
    }
}

/// A subprotocol registered at some parent layer's decoded-frame shape.
///
/// `Ctx` is whatever side-channel the subprotocol needs to emit frames
/// downward or schedule follow-up work (e.g. `&mut Router`, `&mut Scheduler`);
/// most subprotocols don't need one and use `()`.
pub trait Subprotocol<Frame, Ctx = ()> {
    /// Offer a decoded frame to this subprotocol. Returning `Consumed::YES`
    /// stops the parent's dispatch loop for this frame.
    fn on_frame(&mut self, ctx: &mut Ctx, frame: &Frame) -> Consumed;
}

/// Ordered fan-out for one layer's decoded frame type.
///
/// Holds the layer's registered subprotocols and offers each incoming frame
/// to them in registration order, short-circuiting on the first consumer.
pub struct Dispatcher<Frame, Ctx = ()> {
    subprotocols: Vec<Box<dyn Subprotocol<Frame, Ctx>>>,
}

impl<Frame, Ctx> Default for Dispatcher<Frame, Ctx> {
    fn default() -> Self {
        Dispatcher { subprotocols: Vec::new() }
    }
}

impl<Frame, Ctx> Dispatcher<Frame, Ctx> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subprotocol. Order matters: earlier registrations see the
    /// frame first and can consume it before later ones are even offered it.
    pub fn register(&mut self, subprotocol: impl Subprotocol<Frame, Ctx> + 'static) {
        self.subprotocols.push(Box::new(subprotocol));
    }

    /// Offer `frame` to every registered subprotocol in order, stopping at
    /// the first that consumes it. Returns whether anything consumed it.
    pub fn dispatch(&mut self, ctx: &mut Ctx, frame: &Frame) -> Consumed {
        for subprotocol in self.subprotocols.iter_mut() {
            if subprotocol.on_frame(ctx, frame).is_consumed() {
                return Consumed::YES;
            }
        }
        Consumed::NO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct ClaimIfEven;
    impl Subprotocol<u32> for ClaimIfEven {
        fn on_frame(&mut self, _ctx: &mut (), frame: &u32) -> Consumed {
            Consumed(frame % 2 == 0)
        }
    }

    struct CountAll(u32);
    impl Subprotocol<u32> for CountAll {
        fn on_frame(&mut self, _ctx: &mut (), _frame: &u32) -> Consumed {
            self.0 += 1;
            Consumed::NO
        }
    }

    #[test]
    fn first_consumer_stops_dispatch() {
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        dispatcher.register(ClaimIfEven);
        dispatcher.register(CountAll(0));

        let mut ctx = ();
        assert_eq!(dispatcher.dispatch(&mut ctx, &4), Consumed::YES);
        assert_eq!(dispatcher.dispatch(&mut ctx, &5), Consumed::NO);
    }

    #[test]
    fn registration_order_determines_priority() {
        // A responder registered first should see the frame before an
        // ordinary client handler gets a chance, mirroring the ARP
        // responder running "before the ordinary client logic" (§4.3).
        let mut dispatcher: Dispatcher<u32> = Dispatcher::new();
        dispatcher.register(CountAll(0));
        dispatcher.register(ClaimIfEven);
        let mut ctx = ();
        // CountAll never consumes, so ClaimIfEven still gets every frame.
        assert_eq!(dispatcher.dispatch(&mut ctx, &2), Consumed::YES);
    }
}
