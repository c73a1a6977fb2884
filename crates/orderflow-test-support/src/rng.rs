//! Test RNG — deterministic `DeterministicRng` implementations for tests.

use orderflow_core::rng::DeterministicRng;

/// A no-op RNG that always returns `min` for `next_u32_range` and `0.0` for
/// `next_f64`. With backoff jitter this always picks the shortest delay.
#[derive(Debug)]
pub struct MockRng;

impl DeterministicRng for MockRng {
    fn next_u32_range(&mut self, min: u32, _max: u32) -> u32 {
        min
    }

    fn next_f64(&mut self) -> f64 {
        0.0
    }
}

/// An RNG that returns `next_f64` values from a predetermined sequence,
/// cycling when exhausted. Used in tests that need specific jitter factors.
#[derive(Debug)]
pub struct SequenceRng {
    values: Vec<f64>,
    index: usize,
}

impl SequenceRng {
    /// Create a new `SequenceRng` with the given values in `[0.0, 1.0)`.
    ///
    /// # Panics
    ///
    /// Panics if `values` is empty.
    #[must_use]
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "SequenceRng needs at least one value");
        Self { values, index: 0 }
    }
}

impl DeterministicRng for SequenceRng {
    fn next_u32_range(&mut self, min: u32, max: u32) -> u32 {
        let span = f64::from(max.saturating_sub(min));
        let offset = (self.next_f64() * span).floor();
        // `offset` lies in [0, span], which fits in u32 by construction.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let offset = offset as u32;
        min + offset
    }

    fn next_f64(&mut self) -> f64 {
        let val = self.values[self.index % self.values.len()];
        self.index += 1;
        val
    }
}
