//! Random number generation utilities.

use std::num::NonZeroU32;

pub use rand_core::{CryptoRng, RngCore, SeedableRng};
use ring::rand::SecureRandom;

const RAND_ERROR_CODE: NonZeroU32 =
    match NonZeroU32::new(rand_core::Error::CUSTOM_START) {
        Some(code) => code,
        None => unreachable!(),
    };

/// A succinct trait alias for a cryptographically secure PRNG.
pub trait Crng: RngCore + CryptoRng {}

impl<R: RngCore + CryptoRng> Crng for R {}

/// A compatibility wrapper so we can use `ring`'s PRG with `rand_core` traits.
#[derive(Clone, Debug)]
pub struct SysRng(ring::rand::SystemRandom);

impl SysRng {
    pub fn new() -> Self {
        Self(ring::rand::SystemRandom::new())
    }
}

impl Default for SysRng {
    fn default() -> Self {
        Self::new()
    }
}

/// [`ring::rand::SystemRandom`] is a cryptographically secure PRG.
impl CryptoRng for SysRng {}

impl RngCore for SysRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        rand_core::impls::next_u32_via_fill(self)
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        rand_core::impls::next_u64_via_fill(self)
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.try_fill_bytes(dest).expect("os rng failed")
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        // ring's error type here is empty/unspecified, so any code will do.
        self.0
            .fill(dest)
            .map_err(|_| rand_core::Error::from(RAND_ERROR_CODE))
    }
}

/// A small, fast, seedable rng (xorshift64*) with decent statistical
/// properties. Deterministic; intended for tests where reproducibility
/// matters more than cryptographic strength.
#[derive(Clone, Debug)]
pub struct FastRng {
    state: u64,
}

impl FastRng {
    pub fn new() -> Self {
        Self::seed_from_u64(0xdeadbeef_f00baa44)
    }

    pub fn from_u64(seed: u64) -> Self {
        Self::seed_from_u64(seed)
    }
}

impl Default for FastRng {
    fn default() -> Self {
        Self::new()
    }
}

impl SeedableRng for FastRng {
    type Seed = [u8; 8];

    fn from_seed(seed: Self::Seed) -> Self {
        let mut state = u64::from_le_bytes(seed);
        // xorshift must not start at zero.
        if state == 0 {
            state = 0x9e3779b97f4a7c15;
        }
        Self { state }
    }
}

/// Tests need [`FastRng`] to satisfy `Crng` bounds.
#[cfg(any(test, feature = "test-utils"))]
impl CryptoRng for FastRng {}

impl RngCore for FastRng {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545f4914f6cdd1d)
    }

    #[inline]
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        rand_core::impls::fill_bytes_via_next(self, dest);
    }

    #[inline]
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

/// Extension methods on [`RngCore`].
pub trait RngExt {
    /// Sample 32 random bytes.
    fn gen_bytes32(&mut self) -> [u8; 32];
    /// Sample 16 random bytes.
    fn gen_bytes16(&mut self) -> [u8; 16];
}

impl<R: RngCore> RngExt for R {
    fn gen_bytes32(&mut self) -> [u8; 32] {
        let mut out = [0u8; 32];
        self.fill_bytes(&mut out);
        out
    }

    fn gen_bytes16(&mut self) -> [u8; 16] {
        let mut out = [0u8; 16];
        self.fill_bytes(&mut out);
        out
    }
}

#[cfg(any(test, feature = "test-utils"))]
mod arbitrary_impl {
    use proptest::{
        arbitrary::{any, Arbitrary},
        strategy::{BoxedStrategy, Strategy},
    };

    use super::*;

    impl Arbitrary for FastRng {
        type Parameters = ();
        type Strategy = BoxedStrategy<Self>;
        fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
            any::<u64>().prop_map(FastRng::from_u64).no_shrink().boxed()
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fast_rng_is_deterministic() {
        let mut a = FastRng::from_u64(42);
        let mut b = FastRng::from_u64(42);
        for _ in 0..16 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn fast_rng_zero_seed_doesnt_stall() {
        let mut rng = FastRng::from_seed([0u8; 8]);
        assert_ne!(rng.next_u64(), 0);
    }

    #[test]
    fn sys_rng_fills() {
        let mut rng = SysRng::new();
        let a = rng.gen_bytes32();
        let b = rng.gen_bytes32();
        assert_ne!(a, b);
    }
}
