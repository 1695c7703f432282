//! Deterministic pseudo-random numbers for replacement decisions.
//!
//! The simulated machine has no entropy source; runs are reproducible from
//! the configured seed.

/// xorshift64* generator.
#[derive(Debug, Clone)]
pub struct Random {
    state: u64,
}

impl Random {
    pub fn new(seed: u64) -> Self {
        // The all-zero state is a fixed point of xorshift.
        let state = seed ^ 0x9E37_79B9_7F4A_7C15;
        Self {
            state: if state == 0 { 0x2545_F491_4F6C_DD1D } else { state },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform-ish value in `0..bound`.
    ///
    /// Panics if `bound` is zero.
    #[allow(clippy::cast_possible_truncation)]
    pub fn next_below(&mut self, bound: usize) -> usize {
        assert!(bound > 0, "next_below called with an empty range");
        (self.next_u64() % bound as u64) as usize
    }
}
