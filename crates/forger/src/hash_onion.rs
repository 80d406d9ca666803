//! Hash onion: a reverse hash chain consumed one layer per forged block.
//!
//! The chain is `h_0, h_1 = H(h_0), …, h_count`; only every `distance`-th
//! layer is kept as a checkpoint, so the reveal for a given usage index is
//! recomputed by hashing forward from the nearest checkpoint. Revealing
//! `h_{count - u}` for usage `u` lets every observer check
//! `H(reveal_u) == reveal_{u-1}`, which is what makes double-forging with a
//! reused layer detectable.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// One hash-onion layer.
pub type OnionLayer = [u8; 16];

fn hash16(data: &[u8]) -> OnionLayer {
    let digest: [u8; 32] = Sha256::digest(data).into();
    let mut layer = [0u8; 16];
    layer.copy_from_slice(&digest[..16]);
    layer
}

/// Checkpointed hash onion, as carried in the forging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashOnionConfig {
    /// Total number of layers.
    pub count: u32,
    /// Checkpoint spacing; must divide `count`.
    pub distance: u32,
    /// Checkpoints `h_0, h_distance, …, h_count`.
    pub hashes: Vec<OnionLayer>,
}

/// A usable hash onion.
#[derive(Debug, Clone)]
pub struct HashOnion {
    config: HashOnionConfig,
}

impl HashOnion {
    /// Wrap a configured onion. Returns `None` when the checkpoint layout
    /// is inconsistent.
    pub fn new(config: HashOnionConfig) -> Option<Self> {
        if config.count == 0 || config.distance == 0 || config.count % config.distance != 0 {
            return None;
        }
        if config.hashes.len() != (config.count / config.distance) as usize + 1 {
            return None;
        }
        Some(Self { config })
    }

    /// Generate a fresh onion from a random seed.
    pub fn generate(count: u32, distance: u32) -> Self {
        assert!(count > 0 && distance > 0 && count % distance == 0);
        let mut seed = [0u8; 16];
        rand::Rng::fill(&mut rand::thread_rng(), &mut seed);
        Self::generate_from_seed(seed, count, distance)
    }

    /// Generate deterministically from a seed layer (`h_0`).
    pub fn generate_from_seed(seed: OnionLayer, count: u32, distance: u32) -> Self {
        assert!(count > 0 && distance > 0 && count % distance == 0);
        let mut hashes = Vec::with_capacity((count / distance) as usize + 1);
        let mut layer = seed;
        hashes.push(layer);
        for i in 1..=count {
            layer = hash16(&layer);
            if i % distance == 0 {
                hashes.push(layer);
            }
        }
        Self { config: HashOnionConfig { count, distance, hashes } }
    }

    pub fn config(&self) -> &HashOnionConfig {
        &self.config
    }

    /// Number of layers.
    pub fn count(&self) -> u32 {
        self.config.count
    }

    /// The reveal for usage index `u`: layer `h_{count - u}`.
    ///
    /// Usage 0 reveals the chain head `h_count`; each subsequent usage
    /// reveals the pre-image of the previous one. Returns `None` once the
    /// onion is exhausted.
    pub fn reveal(&self, usage: u32) -> Option<OnionLayer> {
        if usage > self.config.count {
            return None;
        }
        let target = self.config.count - usage;
        let checkpoint = (target / self.config.distance) as usize;
        let mut layer = self.config.hashes[checkpoint];
        for _ in 0..(target % self.config.distance) {
            layer = hash16(&layer);
        }
        Some(layer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn each_reveal_hashes_to_the_previous_one() {
        let onion = HashOnion::generate_from_seed([7u8; 16], 100, 10);
        for usage in 1..=100 {
            let current = onion.reveal(usage).unwrap();
            let previous = onion.reveal(usage - 1).unwrap();
            assert_eq!(hash16(&current), previous, "usage {usage}");
        }
    }

    #[test]
    fn reveal_is_exhausted_past_count() {
        let onion = HashOnion::generate_from_seed([1u8; 16], 10, 5);
        assert!(onion.reveal(10).is_some());
        assert!(onion.reveal(11).is_none());
    }

    #[test]
    fn checkpoints_round_trip_through_config() {
        let onion = HashOnion::generate_from_seed([9u8; 16], 50, 10);
        let restored = HashOnion::new(onion.config().clone()).unwrap();
        assert_eq!(restored.reveal(17), onion.reveal(17));
    }

    #[test]
    fn inconsistent_config_is_rejected() {
        assert!(HashOnion::new(HashOnionConfig { count: 10, distance: 3, hashes: vec![] }).is_none());
        assert!(HashOnion::new(HashOnionConfig { count: 10, distance: 5, hashes: vec![[0; 16]] })
            .is_none());
        assert!(HashOnion::new(HashOnionConfig { count: 0, distance: 1, hashes: vec![[0; 16]] })
            .is_none());
    }
}
