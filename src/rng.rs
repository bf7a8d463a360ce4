//! Randomness used for initial sequence numbers, ping identifiers, and
//! retransmission jitter.
//!
//! Wrapped behind a small trait so tests can swap in a deterministic source
//! without threading a generic parameter through every protocol module.

use rand::rngs::OsRng;
use rand::RngCore;

/// A source of randomness for the stack. The default implementation draws
/// from the OS CSPRNG; tests substitute [`StepRng`]-backed determinism.
pub trait Rng: Send {
    /// A random 32-bit value.
    fn next_u32(&mut self) -> u32;

    /// A random `f64` in `[0, 1)`, used for retransmission jitter.
    fn next_unit_f64(&mut self) -> f64 {
        (self.next_u32() as f64) / (u32::MAX as f64 + 1.0)
    }

    /// A cryptographically random 30-bit value, floor-rounded to the nearest
    /// multiple of 100, per the TCP initial-sequence-number recipe in §4.8.
    fn initial_sequence_number(&mut self) -> u32 {
        let raw = self.next_u32() & 0x3FFF_FFFF; // 30 bits
        (raw / 100) * 100
    }
}

/// The OS-backed CSPRNG, used in production.
#[derive(Default)]
pub struct SystemRng;

impl Rng for SystemRng {
    fn next_u32(&mut self) -> u32 {
        OsRng.next_u32()
    }
}

#[cfg(test)]
pub struct StepRng(pub rand::rngs::mock::StepRng);

#[cfg(test)]
impl Rng for StepRng {
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_sequence_number_is_a_multiple_of_100_within_30_bits() {
        let mut rng = StepRng(rand::rngs::mock::StepRng::new(0x7FFF_FFFF, 0x1234_5678));
        for _ in 0..16 {
            let isn = rng.initial_sequence_number();
            assert_eq!(isn % 100, 0);
            assert!(isn < (1 << 30));
        }
    }
}
