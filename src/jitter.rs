//! Jitter to keep retries from synchronizing.
//!
//! `Percent(p)` perturbs a delay by a uniform factor in `[-p%, +p%]`, so the result can be shorter
//! or longer than the input. The caller clamps the result (see [`Jitter::apply_capped`]).
//!
//! RNG: `rand`'s thread-local RNG by default; deterministic RNGs can be injected via
//! [`Jitter::apply_with_rng`].

use rand::{rng, Rng};
use std::time::Duration;

/// Jitter strategy for randomizing retry delays
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum Jitter {
    /// Use the exact backoff delay
    #[default]
    None,
    /// Add up to ± this percentage of the delay
    Percent(f64),
}

/// Rejected jitter percentage.
#[derive(Debug, Clone, Copy, PartialEq, thiserror::Error)]
#[error("jitter percent must be within 0..=100 (got {0})")]
pub struct JitterError(pub f64);

impl Jitter {
    /// Percentage jitter; `0` is the same as [`Jitter::None`].
    pub fn percent(percent: f64) -> Result<Self, JitterError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(JitterError(percent));
        }
        if percent == 0.0 {
            return Ok(Jitter::None);
        }
        Ok(Jitter::Percent(percent))
    }

    /// Apply jitter and clamp to `[0, max]`.
    pub fn apply_capped(&self, delay: Duration, max: Duration) -> Duration {
        self.apply_with_rng(delay, max, &mut rng())
    }

    /// Apply jitter with a custom RNG (for testing)
    pub fn apply_with_rng<R: Rng>(&self, delay: Duration, max: Duration, rng: &mut R) -> Duration {
        let jittered = match *self {
            Jitter::None => delay,
            Jitter::Percent(percent) => {
                let spread = percent.clamp(0.0, 100.0) / 100.0;
                let factor = if spread == 0.0 { 0.0 } else { rng.random_range(-spread..=spread) };
                let secs = delay.as_secs_f64() * (1.0 + factor);
                Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(max)
            }
        };
        jittered.min(max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn none_only_clamps() {
        let max = Duration::from_secs(1);
        assert_eq!(Jitter::None.apply_capped(Duration::from_millis(300), max), Duration::from_millis(300));
        assert_eq!(Jitter::None.apply_capped(Duration::from_secs(5), max), max);
    }

    #[test]
    fn percent_stays_within_band() {
        let jitter = Jitter::percent(10.0).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let delay = Duration::from_millis(1_000);
        for _ in 0..500 {
            let d = jitter.apply_with_rng(delay, Duration::from_secs(10), &mut rng);
            assert!(d >= Duration::from_millis(899), "{d:?}");
            assert!(d <= Duration::from_millis(1_101), "{d:?}");
        }
    }

    #[test]
    fn percent_both_shortens_and_lengthens() {
        let jitter = Jitter::percent(50.0).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        let delay = Duration::from_millis(1_000);
        let samples: Vec<Duration> = (0..200)
            .map(|_| jitter.apply_with_rng(delay, Duration::from_secs(10), &mut rng))
            .collect();
        assert!(samples.iter().any(|d| *d < delay));
        assert!(samples.iter().any(|d| *d > delay));
    }

    #[test]
    fn result_never_exceeds_max() {
        let jitter = Jitter::percent(100.0).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let max = Duration::from_millis(1_200);
        for _ in 0..200 {
            assert!(jitter.apply_with_rng(Duration::from_secs(1), max, &mut rng) <= max);
        }
    }

    #[test]
    fn rejects_out_of_range_percent() {
        assert_eq!(Jitter::percent(-1.0), Err(JitterError(-1.0)));
        assert!(Jitter::percent(150.0).is_err());
        assert_eq!(Jitter::percent(0.0), Ok(Jitter::None));
    }
}
