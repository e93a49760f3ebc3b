//! Reproducible random sources.
//!
//! Every entity that draws random numbers (a path scheduler, a weighted
//! switch, a simulated link) owns its own generator. Generators are handed out
//! by a [`RandomStreams`] factory built from a `(seed, run)` pair, so two runs
//! with the same configuration make the same decisions and changing `run`
//! yields an independent replication.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Source of uniform draws in `[0, 1)`.
pub trait DrawSource: Send {
    fn next_draw(&mut self) -> f64;
}

impl DrawSource for ChaCha8Rng {
    fn next_draw(&mut self) -> f64 {
        self.gen::<f64>()
    }
}

/// Factory of independent, deterministically seeded generators.
#[derive(Debug, Clone)]
pub struct RandomStreams {
    seed: u64,
    run: u64,
    next_stream: u64,
}

impl RandomStreams {
    pub fn new(seed: u64, run: u64) -> Self {
        Self {
            seed,
            run,
            next_stream: 0,
        }
    }

    /// Create the next generator. Each call yields a different stream.
    pub fn next_rng(&mut self) -> ChaCha8Rng {
        let stream = self.next_stream;
        self.next_stream += 1;
        Self::stream(self.seed, self.run, stream)
    }

    /// Number of generators handed out so far.
    pub fn streams_created(&self) -> u64 {
        self.next_stream
    }

    /// Seed and run fill separate halves of the key, so distinct pairs never share a key.
    fn stream(seed: u64, run: u64, stream: u64) -> ChaCha8Rng {
        let mut key = [0u8; 32];
        key[..8].copy_from_slice(&seed.to_le_bytes());
        key[8..16].copy_from_slice(&run.to_le_bytes());
        let mut rng = ChaCha8Rng::from_seed(key);
        rng.set_stream(stream);
        rng
    }
}

impl Default for RandomStreams {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Replays a fixed list of draws, cycling when exhausted.
///
/// Counts how many draws were taken, which lets tests assert that no
/// selection happened at all.
#[derive(Debug, Clone)]
pub struct FixedDraws {
    draws: VecDeque<f64>,
    taken: u64,
}

impl FixedDraws {
    pub fn new(draws: impl IntoIterator<Item = f64>) -> Self {
        Self {
            draws: draws.into_iter().collect(),
            taken: 0,
        }
    }

    pub fn taken(&self) -> u64 {
        self.taken
    }
}

impl DrawSource for FixedDraws {
    fn next_draw(&mut self) -> f64 {
        self.taken += 1;
        match self.draws.pop_front() {
            Some(draw) => {
                self.draws.push_back(draw);
                draw
            }
            None => 0.0,
        }
    }
}
