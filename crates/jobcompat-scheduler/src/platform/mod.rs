//! Boundary to the OS scheduling primitives.
//!
//! The engine never talks to a real scheduler directly: adapters translate
//! job requests into [`JobInfo`] / [`Alarm`] registrations and hand them to
//! these traits. [`sim::SimulatedPlatform`] implements both in memory.

pub mod sim;

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use jobcompat_core::{Extras, JobId, NetworkType};
use thiserror::Error;

use crate::schedule::offset_ms;

pub use sim::SimulatedPlatform;

/// Failure reported by a platform scheduling call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    /// The platform refused the registration (quota, bad arguments, …).
    #[error("registration rejected: {0}")]
    Rejected(String),

    /// The scheduling service could not be reached.
    #[error("scheduler service unavailable: {0}")]
    Unavailable(String),
}

/// Periodic part of a job-service registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodicSpec {
    pub interval_ms: u64,
    /// `None` when the platform version has no flex support.
    pub flex_ms: Option<u64>,
}

/// A registration with an OS job service.
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub id: JobId,
    pub tag: String,
    /// Earliest start, relative to `registered_at_ms`. Ignored for periodic jobs.
    pub min_latency_ms: u64,
    /// Latest start, relative to `registered_at_ms`.
    pub deadline_ms: Option<u64>,
    pub periodic: Option<PeriodicSpec>,
    /// Survives a device restart.
    pub persisted: bool,
    pub extras: Extras,
    /// Delivered with the wake; never survives a restart.
    pub transient_extras: Option<Extras>,
    pub requires_charging: bool,
    pub requires_device_idle: bool,
    pub network_type: NetworkType,
    pub registered_at_ms: i64,
}

/// An alarm that wakes the process at an absolute time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alarm {
    pub id: JobId,
    pub tag: String,
    pub trigger_at_ms: i64,
    /// Delivery window after `trigger_at_ms`; `None` means exact.
    pub window_ms: Option<u64>,
    /// Repeat automatically every N ms.
    pub repeat_interval_ms: Option<u64>,
}

/// OS job scheduler. Scheduling an id that is already pending replaces it.
pub trait JobService: Send + Sync {
    fn schedule(&self, info: JobInfo) -> Result<(), PlatformError>;
    /// Cancelling an unknown id is a no-op.
    fn cancel(&self, id: JobId);
    fn pending_job(&self, id: JobId) -> Option<JobInfo>;
    fn pending_jobs(&self) -> Vec<JobInfo>;
}

/// OS alarm service. Setting an id that is already pending replaces it.
pub trait AlarmService: Send + Sync {
    fn set(&self, alarm: Alarm) -> Result<(), PlatformError>;
    /// Cancelling an unknown id is a no-op.
    fn cancel(&self, id: JobId);
    fn pending_alarm(&self, id: JobId) -> Option<Alarm>;
    fn pending_alarms(&self) -> Vec<Alarm>;
}

/// Wall clock in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, ms: u64) -> i64 {
        let step = |now: i64| offset_ms(now, ms);
        let prev = self
            .now_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| Some(step(now)))
            .unwrap_or_else(|now| now);
        step(prev)
    }

    pub fn set(&self, ms: i64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Everything an engine needs from the platform.
#[derive(Clone)]
pub struct PlatformServices {
    pub jobs: Arc<dyn JobService>,
    pub alarms: Arc<dyn AlarmService>,
    pub clock: Arc<dyn Clock>,
}

/// Who woke a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeSource {
    /// The OS scheduler fired a registration.
    Platform,
    /// The transient bridge launched the job directly.
    DirectLaunch,
}

/// Message delivered to the executing side when a job should run.
#[derive(Debug, Clone, PartialEq)]
pub struct Wake {
    pub id: JobId,
    pub source: WakeSource,
    pub transient_extras: Option<Extras>,
}
