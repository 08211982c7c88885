//! Concurrency strategy: a pure value computed once from a
//! [`ServiceConcurrency`](crate::model::ServiceConcurrency) config, cached
//! by the activator so the duration string is parsed at most once per
//! bucket.

use std::time::Duration;

use crate::model::{ConcurrencyMode, ServiceConcurrency};
use crate::tracker::Tracker;

/// Fallback scale-down delay used when `scale_down_delay` fails to parse.
/// The config is operator-supplied and the system must remain available,
/// so a parse failure degrades to a sensible default rather than erroring.
pub const DEFAULT_SCALE_DOWN_DELAY: Duration = Duration::from_secs(15 * 60);

/// Derived runtime parameters for a single service's concurrency config.
#[derive(Debug, Clone, Copy)]
pub struct Strategy {
    mode: ConcurrencyMode,
    requests_per_instance: u32,
    desired_floor: u32,
    scale_down_delay: Duration,
}

impl Strategy {
    /// Compute the strategy for a service's concurrency config.
    pub fn new(config: &ServiceConcurrency) -> Self {
        match config.mode {
            ConcurrencyMode::Auto => {
                let requests_per_instance = config.requests_per_instance.unwrap_or(1).max(1);
                let scale_down_delay = config
                    .scale_down_delay
                    .as_deref()
                    .map(|s| match humantime::parse_duration(s) {
                        Ok(d) => d,
                        Err(e) => {
                            tracing::warn!(
                                value = s,
                                error = %e,
                                default_secs = DEFAULT_SCALE_DOWN_DELAY.as_secs(),
                                "failed to parse scale_down_delay, using default"
                            );
                            DEFAULT_SCALE_DOWN_DELAY
                        }
                    })
                    .unwrap_or(DEFAULT_SCALE_DOWN_DELAY);

                Self {
                    mode: ConcurrencyMode::Auto,
                    requests_per_instance,
                    desired_floor: 0,
                    scale_down_delay,
                }
            }
            ConcurrencyMode::Fixed => Self {
                mode: ConcurrencyMode::Fixed,
                requests_per_instance: 1,
                desired_floor: config.num_instances,
                scale_down_delay: Duration::ZERO,
            },
        }
    }

    /// Requests-per-instance capacity: `requests_per_instance` in auto
    /// mode, 1 in fixed mode.
    pub fn per_instance_capacity(&self) -> u32 {
        self.requests_per_instance
    }

    /// Floor on `desired_instances`: 0 in auto mode, `num_instances` in
    /// fixed mode.
    pub fn desired_floor(&self) -> u32 {
        self.desired_floor
    }

    /// Scale-down delay: parsed duration in auto mode, zero in fixed mode
    /// (the reconciler interprets zero as "never retire").
    pub fn scale_down_delay(&self) -> Duration {
        self.scale_down_delay
    }

    /// `true` in fixed mode, where the reconciler must never stop a
    /// sandbox voluntarily.
    pub fn never_scales_down(&self) -> bool {
        self.mode == ConcurrencyMode::Fixed
    }

    /// A fresh [`Tracker`] sized to this strategy's per-instance capacity.
    pub fn new_tracker(&self) -> Tracker {
        Tracker::new(self.requests_per_instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_mode_parses_delay() {
        let config = ServiceConcurrency::auto(10, "2m");
        let strategy = Strategy::new(&config);
        assert_eq!(strategy.per_instance_capacity(), 10);
        assert_eq!(strategy.desired_floor(), 0);
        assert_eq!(strategy.scale_down_delay(), Duration::from_secs(120));
        assert!(!strategy.never_scales_down());
    }

    #[test]
    fn auto_mode_defaults_requests_per_instance_to_one() {
        let mut config = ServiceConcurrency::auto(10, "2m");
        config.requests_per_instance = None;
        let strategy = Strategy::new(&config);
        assert_eq!(strategy.per_instance_capacity(), 1);
    }

    #[test]
    fn auto_mode_bad_delay_falls_back_to_default() {
        let mut config = ServiceConcurrency::auto(10, "not-a-duration");
        config.scale_down_delay = Some("nonsense".to_string());
        let strategy = Strategy::new(&config);
        assert_eq!(strategy.scale_down_delay(), DEFAULT_SCALE_DOWN_DELAY);
    }

    #[test]
    fn fixed_mode_ignores_requests_per_instance_and_delay() {
        let config = ServiceConcurrency::fixed(5);
        let strategy = Strategy::new(&config);
        assert_eq!(strategy.per_instance_capacity(), 1);
        assert_eq!(strategy.desired_floor(), 5);
        assert_eq!(strategy.scale_down_delay(), Duration::ZERO);
        assert!(strategy.never_scales_down());
    }

    #[test]
    fn new_tracker_matches_capacity() {
        let config = ServiceConcurrency::auto(7, "1m");
        let strategy = Strategy::new(&config);
        let tracker = strategy.new_tracker();
        assert_eq!(tracker.max(), 7);
        assert_eq!(tracker.used(), 0);
    }
}
