//! Seeded RNG wrapper for reproducible behavior.
//!
//! Thread-safe ChaCha8 generator shared by noise generation and error
//! injection. Seed it in tests to get identical traces on every run.

use parking_lot::Mutex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub struct MockRng {
    inner: Mutex<ChaCha8Rng>,
}

impl MockRng {
    /// Create a new RNG with optional seed.
    /// If seed is None, uses a random seed from the OS.
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: Mutex::new(rng),
        }
    }

    /// Check if an operation should fail based on the given failure rate.
    ///
    /// # Arguments
    /// * `rate` - Failure probability from 0.0 (never fail) to 1.0 (always fail)
    pub fn should_fail(&self, rate: f64) -> bool {
        if rate <= 0.0 {
            return false;
        }
        if rate >= 1.0 {
            return true;
        }
        self.inner.lock().gen::<f64>() < rate
    }

    /// Uniform value in [0.0, 1.0)
    pub fn next_f64(&self) -> f64 {
        self.inner.lock().gen()
    }

    /// Fill `out` with normally distributed samples (Box-Muller).
    pub fn fill_normal(&self, out: &mut [f64], mean: f64, std_dev: f64) {
        let mut rng = self.inner.lock();
        let mut chunks = out.chunks_mut(2);
        for pair in &mut chunks {
            // 1 - u keeps the logarithm argument in (0, 1].
            let u1: f64 = 1.0 - rng.gen::<f64>();
            let u2: f64 = rng.gen();
            let radius = (-2.0 * u1.ln()).sqrt();
            let theta = std::f64::consts::TAU * u2;
            pair[0] = mean + std_dev * radius * theta.cos();
            if let Some(second) = pair.get_mut(1) {
                *second = mean + std_dev * radius * theta.sin();
            }
        }
    }

    /// Single normally distributed sample.
    pub fn normal(&self, mean: f64, std_dev: f64) -> f64 {
        let mut sample = [0.0];
        self.fill_normal(&mut sample, mean, std_dev);
        sample[0]
    }
}

impl Default for MockRng {
    fn default() -> Self {
        Self::new(None)
    }
}

impl std::fmt::Debug for MockRng {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRng")
            .field("inner", &"<Mutex<ChaCha8Rng>>")
            .finish()
    }
}
