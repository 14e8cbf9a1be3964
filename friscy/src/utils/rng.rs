// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Random number generation

/// A non-cryptographically-secure random number generator.
///
/// Serves the guest's `getrandom` and the `AT_RANDOM` stack seed. Deterministic for a
/// given seed, which keeps guest runs reproducible in tests.
pub struct FastRng {
    state: u64,
}

impl FastRng {
    // Multiplier from the xorshift* family.
    const MULTIPLIER: u64 = 0x2545_F491_4F6C_DD1D;

    /// Create a generator from a seed. A zero seed is remapped so the state never
    /// degenerates.
    pub const fn from_seed(seed: u64) -> Self {
        let seed = if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed };
        FastRng {
            state: seed.wrapping_mul(Self::MULTIPLIER),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(Self::MULTIPLIER)
    }

    /// Fill `buf` with pseudo-random bytes.
    pub fn fill_bytes(&mut self, buf: &mut [u8]) {
        for chunk in buf.chunks_mut(8) {
            let bytes = self.next_u64().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::FastRng;

    #[test]
    fn deterministic_for_a_seed() {
        let mut a = FastRng::from_seed(7);
        let mut b = FastRng::from_seed(7);
        for _ in 0..32 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn fill_covers_odd_lengths() {
        let mut rng = FastRng::from_seed(1);
        let mut buf = [0u8; 13];
        rng.fill_bytes(&mut buf);
        assert!(buf.iter().any(|&b| b != 0));
    }

    #[test]
    fn zero_seed_is_not_degenerate() {
        let mut rng = FastRng::from_seed(0);
        assert_ne!(rng.next_u64(), 0);
    }
}
