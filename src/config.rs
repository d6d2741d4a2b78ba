//! Scheduler configuration.
//!
//! A [`SchedulerConfig`] describes one thread pool: how many cores to
//! service, whether the fairness stealing policy is active, whether leaks
//! are reported at teardown, and the tuning knobs of the steal loop.
//! Construction is infallible; [`SchedulerConfig::validate`] enforces the
//! guardrail invariants before a pool is built from it.

use std::thread;
use std::time::Duration;

/// Hard cap on the number of scheduler threads in one pool.
///
/// The limit exists to catch configuration mistakes (for example a byte
/// count passed where a thread count was meant), not as a real resource
/// bound.
pub const MAX_THREADS: usize = 1024;

/// Configuration for a scheduler thread pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Number of cores (and scheduler threads) to create.
    pub threads: usize,
    /// Fairness mode: recognizing our own token latches a one-shot steal so
    /// a busy queue cannot starve its peers.
    pub fair: bool,
    /// Report cowns still weakly referenced at teardown instead of
    /// reclaiming them.
    pub detect_leaks: bool,
    /// How long an idle thread spins through victims before it is allowed
    /// to park. Ignored under the `systematic` feature, which gates parking
    /// on a deterministic coin instead.
    pub steal_quiescence: Duration,
    /// Seed for the per-thread deterministic RNG used by the `systematic`
    /// feature's coin flips.
    pub seed: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            threads: thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            fair: false,
            detect_leaks: true,
            steal_quiescence: Duration::from_millis(1),
            seed: 0x5eed_c0c0,
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with an explicit thread count.
    #[must_use]
    pub fn with_threads(threads: usize) -> Self {
        Self {
            threads,
            ..Self::default()
        }
    }

    /// Enables or disables the fairness stealing policy.
    #[must_use]
    pub const fn fair(mut self, fair: bool) -> Self {
        self.fair = fair;
        self
    }

    /// Enables or disables leak reporting at teardown.
    #[must_use]
    pub const fn detect_leaks(mut self, detect: bool) -> Self {
        self.detect_leaks = detect;
        self
    }

    /// Sets the deterministic RNG seed.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validates the configuration for basic sanity.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::NoThreads);
        }
        if self.threads > MAX_THREADS {
            return Err(ConfigError::TooManyThreads(self.threads));
        }
        if self.steal_quiescence.is_zero() {
            return Err(ConfigError::ZeroQuiescence);
        }
        Ok(())
    }
}

/// A configuration validation failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// The thread count was zero.
    #[error("thread count must be at least 1")]
    NoThreads,
    /// The thread count exceeded [`MAX_THREADS`].
    #[error("thread count {0} exceeds the maximum of {MAX_THREADS}")]
    TooManyThreads(usize),
    /// The steal quiescence window was zero.
    #[error("steal quiescence window must be non-zero")]
    ZeroQuiescence,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = SchedulerConfig::with_threads(0);
        assert_eq!(config.validate(), Err(ConfigError::NoThreads));
    }

    #[test]
    fn test_too_many_threads_rejected() {
        let config = SchedulerConfig::with_threads(MAX_THREADS + 1);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::TooManyThreads(_))
        ));
    }

    #[test]
    fn test_zero_quiescence_rejected() {
        let config = SchedulerConfig {
            steal_quiescence: Duration::ZERO,
            ..SchedulerConfig::with_threads(2)
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroQuiescence));
    }

    #[test]
    fn test_builders_compose() {
        let config = SchedulerConfig::with_threads(4)
            .fair(true)
            .detect_leaks(false)
            .seed(7);
        assert_eq!(config.threads, 4);
        assert!(config.fair);
        assert!(!config.detect_leaks);
        assert_eq!(config.seed, 7);
    }
}
