//! Arithmetic modulo `2^W` over the machine-integer widths used by the engine.
//!
//! All correlated randomness is generated over the rings `Z_{2^W}` for
//! `W ∈ {8, 16, 32, 64, 128}`. Code that is generic over the width is
//! written against the [`Ring`] trait instead of being duplicated per
//! integer type.

use std::fmt::Debug;
use std::ops::BitAnd;

use num_traits::{One, WrappingAdd, WrappingMul, WrappingShl, WrappingShr, WrappingSub, Zero};
use rand::Rng;

/// An unsigned machine integer viewed as the ring `Z_{2^BITS}`.
pub trait Ring:
    Copy
    + Debug
    + Eq
    + Send
    + Sync
    + 'static
    + WrappingAdd
    + WrappingSub
    + WrappingMul
    + WrappingShl
    + WrappingShr
    + BitAnd<Output = Self>
    + Zero
    + One
{
    /// The width of the ring in bits.
    const BITS: usize;
    /// The width of the ring in bytes.
    const BYTES: usize;

    /// Samples a uniformly random ring element.
    fn random(rng: &mut impl Rng) -> Self;

    /// The little-endian byte representation, exactly [`Ring::BYTES`] long.
    fn to_bytes(&self) -> Vec<u8>;

    /// Parses a little-endian byte representation of exactly [`Ring::BYTES`]
    /// bytes, or returns `None` on a length mismatch.
    fn from_bytes(bytes: &[u8]) -> Option<Self>;

    /// Whether bit `i` (counted from the least significant bit) is set.
    fn bit(&self, i: usize) -> bool {
        !(self.wrapping_shr(i as u32) & Self::one()).is_zero()
    }
}

macro_rules! impl_ring {
    ($($t:ty),*) => {
        $(
            impl Ring for $t {
                const BITS: usize = std::mem::size_of::<$t>() * 8;
                const BYTES: usize = std::mem::size_of::<$t>();

                fn random(rng: &mut impl Rng) -> Self {
                    rng.gen()
                }

                fn to_bytes(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn from_bytes(bytes: &[u8]) -> Option<Self> {
                    Some(<$t>::from_le_bytes(bytes.try_into().ok()?))
                }
            }
        )*
    };
}

impl_ring!(u8, u16, u32, u64, u128);

#[cfg(test)]
mod tests {
    use super::Ring;

    #[test]
    fn bytes_round_trip() {
        assert_eq!(u8::from_bytes(&0xab_u8.to_bytes()), Some(0xab));
        assert_eq!(u32::from_bytes(&0xdead_beef_u32.to_bytes()), Some(0xdead_beef));
        let x = 0x0123_4567_89ab_cdef_0123_4567_89ab_cdef_u128;
        assert_eq!(u128::from_bytes(&x.to_bytes()), Some(x));
        assert_eq!(u16::from_bytes(&[1, 2, 3]), None);
    }

    #[test]
    fn bytes_are_little_endian() {
        assert_eq!(0x0102_u16.to_bytes(), vec![0x02, 0x01]);
    }

    #[test]
    fn bit_extraction() {
        let x = 0b1010_u8;
        assert!(!x.bit(0));
        assert!(x.bit(1));
        assert!(!x.bit(2));
        assert!(x.bit(3));
        assert!(!x.bit(7));
        assert!(u128::MAX.bit(127));
    }

    #[test]
    fn squaring_wraps() {
        use num_traits::WrappingMul;
        let a = 200_u8;
        assert_eq!(a.wrapping_mul(a), (200_u32 * 200 % 256) as u8);
    }
}
