//! Convenience layer for scheduling standard timers.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::timer::{TimerManager, TimerSettings, TimerType};
use crate::transaction::TransactionKey;

/// Backoff interval for the doubling retransmission timers: the base
/// interval shifted left once per elapsed iteration, clamped to `cap`
/// when given. Timer A doubles without cap; Timers E and G cap at T2.
pub fn calculate_backoff_interval(
    base: Duration,
    iterations: u32,
    cap: Option<Duration>,
) -> Duration {
    // Saturate the shift so a pathological iteration count cannot wrap.
    let factor = 1u32.checked_shl(iterations.min(16)).unwrap_or(u32::MAX);
    let interval = base.saturating_mul(factor);
    match cap {
        Some(limit) if interval > limit => limit,
        _ => interval,
    }
}

/// Pairs a [`TimerManager`] with the [`TimerSettings`] in force, so state
/// machines schedule timers by type without repeating duration lookups.
#[derive(Debug, Clone)]
pub struct TimerFactory {
    settings: TimerSettings,
    manager: Arc<TimerManager>,
}

impl TimerFactory {
    pub fn new(settings: TimerSettings, manager: Arc<TimerManager>) -> Self {
        Self { settings, manager }
    }

    pub fn settings(&self) -> &TimerSettings {
        &self.settings
    }

    pub fn manager(&self) -> &Arc<TimerManager> {
        &self.manager
    }

    /// Schedule `timer` with an explicit duration (retransmission timers,
    /// whose interval depends on the iteration count).
    pub fn start_timer(
        &self,
        key: TransactionKey,
        timer: TimerType,
        duration: Duration,
    ) -> JoinHandle<()> {
        self.manager.start_timer(key, timer.as_str(), duration)
    }

    /// Schedule `timer` with its standard duration from the settings.
    pub fn start_standard_timer(&self, key: TransactionKey, timer: TimerType) -> JoinHandle<()> {
        let duration = match timer {
            TimerType::A | TimerType::E | TimerType::G => self.settings.t1,
            TimerType::B | TimerType::F | TimerType::H => self.settings.transaction_timeout,
            TimerType::D => self.settings.wait_time_d,
            TimerType::I => self.settings.wait_time_i,
            TimerType::J => self.settings.wait_time_j,
            TimerType::K => self.settings.wait_time_k,
        };
        self.start_timer(key, timer, duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_uncapped() {
        let base = Duration::from_millis(500);
        assert_eq!(calculate_backoff_interval(base, 0, None), base);
        assert_eq!(
            calculate_backoff_interval(base, 1, None),
            Duration::from_secs(1)
        );
        assert_eq!(
            calculate_backoff_interval(base, 4, None),
            Duration::from_secs(8)
        );
    }

    #[test]
    fn backoff_caps_at_limit() {
        let base = Duration::from_millis(500);
        let cap = Duration::from_secs(4);
        assert_eq!(calculate_backoff_interval(base, 2, Some(cap)), Duration::from_secs(2));
        assert_eq!(calculate_backoff_interval(base, 3, Some(cap)), cap);
        assert_eq!(calculate_backoff_interval(base, 10, Some(cap)), cap);
    }

    #[test]
    fn backoff_survives_large_iteration_counts() {
        let base = Duration::from_millis(500);
        let big = calculate_backoff_interval(base, 1000, None);
        assert!(big >= calculate_backoff_interval(base, 16, None));
    }
}
