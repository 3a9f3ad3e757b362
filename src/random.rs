//! Independent random streams
//!
//! Every replica of every step draws from its own ChaCha stream, derived only
//! from a seed, a salt chain and the replica index. Results are therefore the
//! same whether replicas run sequentially or on the rayon pool.

use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seed from which per-replica random streams are derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeedStream {
    seed: u64,
}

impl SeedStream {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    /// Draw a fresh seed from an existing generator.
    pub fn from_rng(rng: &mut dyn RngCore) -> Self {
        Self::new(rng.next_u64())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Child stream identified by `salt`.
    pub fn derive(&self, salt: u64) -> Self {
        Self::new(splitmix64(self.seed ^ splitmix64(salt)))
    }

    /// Generator for replica `index`.
    pub fn rng(&self, index: u64) -> ChaCha8Rng {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(index);
        rng
    }
}

fn splitmix64(x: u64) -> u64 {
    let mut z = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
