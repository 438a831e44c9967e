use jobcompat_core::config::{BackoffConfig, BackoffPolicy};

use crate::types::ExecutionConstraint;

/// Start/end offsets in milliseconds, relative to the moment of registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl Window {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self {
            start_ms,
            end_ms: end_ms.max(start_ms),
        }
    }

    pub fn width_ms(&self) -> u64 {
        self.end_ms - self.start_ms
    }
}

/// `at_ms` moved forward by `delta_ms`, saturating at `i64::MAX`.
pub fn offset_ms(at_ms: i64, delta_ms: u64) -> i64 {
    at_ms.saturating_add(i64::try_from(delta_ms).unwrap_or(i64::MAX))
}

/// Milliseconds from `since_ms` to `now_ms`; zero when `since_ms` is later.
pub fn elapsed_ms(since_ms: i64, now_ms: i64) -> u64 {
    u64::try_from(now_ms.saturating_sub(since_ms)).unwrap_or(0)
}

/// Window of the first firing after a fresh schedule.
///
/// Periodic jobs fire inside the last `flex_ms` of each interval.
pub fn initial_window(constraint: ExecutionConstraint) -> Window {
    match constraint {
        ExecutionConstraint::OneShot { start_ms, end_ms, .. } => Window::new(start_ms, end_ms),
        ExecutionConstraint::Periodic {
            interval_ms,
            flex_ms,
        } => Window::new(interval_ms.saturating_sub(flex_ms), interval_ms),
    }
}

/// Window left for a job that was scheduled `elapsed_ms` ago.
///
/// A one-shot window moves closer by the elapsed time and never goes
/// negative; periodic jobs start a fresh period.
pub fn remaining_window(constraint: ExecutionConstraint, elapsed_ms: u64) -> Window {
    match constraint {
        ExecutionConstraint::OneShot { start_ms, end_ms, .. } => Window::new(
            start_ms.saturating_sub(elapsed_ms),
            end_ms.saturating_sub(elapsed_ms),
        ),
        periodic => initial_window(periodic),
    }
}

/// Window of the occurrence after a periodic run: one interval later.
pub fn next_period_window(constraint: ExecutionConstraint) -> Window {
    match constraint {
        ExecutionConstraint::Periodic { interval_ms, .. } => Window::new(interval_ms, interval_ms),
        one_shot => initial_window(one_shot),
    }
}

/// Delay before the `failure_count`-th retry (1-based).
pub fn backoff_delay(config: &BackoffConfig, failure_count: u32) -> u64 {
    let n = failure_count.max(1);
    let delay = match config.policy {
        BackoffPolicy::Linear => config.initial_ms.saturating_mul(n as u64),
        BackoffPolicy::Exponential => {
            let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
            config.initial_ms.saturating_mul(factor)
        }
    };
    delay.min(config.max_ms)
}

/// Window for a one-shot job retried after `failure_count` failures: the
/// backoff delay, keeping the width of the original window.
pub fn backoff_window(
    constraint: ExecutionConstraint,
    config: &BackoffConfig,
    failure_count: u32,
) -> Window {
    let start = backoff_delay(config, failure_count);
    let width = initial_window(constraint).width_ms();
    Window::new(start, start.saturating_add(width))
}

/// A periodic wake arriving this soon after the last run belongs to the
/// period that already ran.
pub fn is_duplicate_periodic_wake(interval_ms: u64, last_run_ms: Option<i64>, now_ms: i64) -> bool {
    match last_run_ms {
        Some(last) => elapsed_ms(last, now_ms) < interval_ms / 2,
        None => false,
    }
}
