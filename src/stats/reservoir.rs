//! Reservoir Sampling (Algorithm L)
//!
//! Uniform k-sample over a stream of unknown length in O(k log(N/k))
//! random draws: constant-time insertion until the reservoir fills, then
//! geometric skips governed by a continuously updated weight `W`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Uniform reservoir sample of fixed capacity.
#[derive(Debug, Clone)]
pub struct Reservoir<T> {
    capacity: usize,
    sample: Vec<T>,
    seen: u64,
    /// Skip distance to the next accepted element (0 = accept next)
    skip: u64,
    w: f64,
    rng: StdRng,
}

impl<T> Reservoir<T> {
    pub fn new(capacity: usize) -> Self {
        Reservoir::with_seed(capacity, rand::thread_rng().gen())
    }

    /// Deterministic reservoir for tests.
    pub fn with_seed(capacity: usize, seed: u64) -> Self {
        Reservoir {
            capacity: capacity.max(1),
            sample: Vec::with_capacity(capacity.max(1)),
            seen: 0,
            skip: 0,
            w: 1.0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Offer one element from the stream.
    pub fn offer(&mut self, value: T) {
        self.seen += 1;
        if self.sample.len() < self.capacity {
            self.sample.push(value);
            if self.sample.len() == self.capacity {
                self.advance_weight();
            }
            return;
        }
        if self.skip > 0 {
            self.skip -= 1;
            return;
        }
        let slot = self.rng.gen_range(0..self.capacity);
        self.sample[slot] = value;
        self.advance_weight();
    }

    /// Draw the next geometric skip and update `W`.
    fn advance_weight(&mut self) {
        let k = self.capacity as f64;
        self.w *= (self.rng.gen::<f64>().ln() / k).exp();
        let u: f64 = self.rng.gen::<f64>().max(f64::MIN_POSITIVE);
        self.skip = (u.ln() / (1.0 - self.w).ln()).floor() as u64;
    }

    pub fn sample(&self) -> &[T] {
        &self.sample
    }

    pub fn into_sample(self) -> Vec<T> {
        self.sample
    }

    /// Total elements offered.
    pub fn seen(&self) -> u64 {
        self.seen
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.sample.len() == self.capacity
    }
}
