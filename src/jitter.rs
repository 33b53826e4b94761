//! Human-timing jitter.
//!
//! Automated clicks and scrolls that land on a fixed cadence are easy to spot
//! and trip request-rate limits, so every interaction waits a uniformly random
//! delay inside a configured window.

use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Jitter {
    min: Duration,
    max: Duration,
}

impl Jitter {
    /// Bounds are swapped if given in the wrong order.
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    /// No delay at all, used by tests and dry runs.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, Duration::ZERO)
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    /// Uniform random delay in `[min, max]`.
    pub fn sample(&self) -> Duration {
        let min_ms = self.min.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        if min_ms >= max_ms {
            return self.min;
        }
        let ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        Duration::from_millis(ms)
    }

    /// Sleep for a sampled delay and return how long it was.
    pub async fn pause(&self) -> Duration {
        let delay = self.sample();
        if !delay.is_zero() {
            trace!("Jitter pause {:?}", delay);
            sleep(delay).await;
        }
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_stay_in_range() {
        let jitter = Jitter::new(Duration::from_millis(800), Duration::from_millis(1400));
        for _ in 0..500 {
            let d = jitter.sample();
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1400), "{:?}", d);
        }
    }

    #[test]
    fn test_reversed_bounds_are_swapped() {
        let jitter = Jitter::new(Duration::from_millis(500), Duration::from_millis(100));
        assert_eq!(jitter.min(), Duration::from_millis(100));
        assert_eq!(jitter.max(), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_zero_jitter_does_not_sleep() {
        assert_eq!(Jitter::none().pause().await, Duration::ZERO);
    }
}
