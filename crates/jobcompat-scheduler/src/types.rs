use jobcompat_core::{BackendKind, Extras, JobId, NetworkType};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SchedulerError};

/// Smallest periodic interval any backend accepts (15 minutes).
pub const MIN_INTERVAL_MS: u64 = 15 * 60 * 1000;
/// Smallest flex window for periodic jobs (5 minutes).
pub const MIN_FLEX_MS: u64 = 5 * 60 * 1000;
/// Longest offset or interval a request may carry (1000 years). Larger
/// values are clamped so that every deadline stays well inside `i64` millis.
pub const MAX_WINDOW_MS: u64 = 1000 * 365 * 24 * 60 * 60 * 1000;

/// When a job may run. Offsets are milliseconds from the moment it is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExecutionConstraint {
    /// Run once, somewhere inside `[start_ms, end_ms]`.
    OneShot { start_ms: u64, end_ms: u64, exact: bool },

    /// Run every `interval_ms`, somewhere inside the last `flex_ms` of each period.
    Periodic { interval_ms: u64, flex_ms: u64 },
}

impl ExecutionConstraint {
    pub fn is_periodic(&self) -> bool {
        matches!(self, ExecutionConstraint::Periodic { .. })
    }

    pub fn is_exact(&self) -> bool {
        matches!(self, ExecutionConstraint::OneShot { exact: true, .. })
    }
}

/// An immutable job request. Built through [`JobRequestBuilder`]; the id is
/// handed out by the job manager.
#[derive(Debug, Clone, PartialEq)]
pub struct JobRequest {
    id: JobId,
    tag: String,
    constraint: ExecutionConstraint,
    transient_extras: Extras,
    persisted_extras: Extras,
    required_backend: Option<BackendKind>,
    requires_charging: bool,
    requires_device_idle: bool,
    network_type: NetworkType,
}

impl JobRequest {
    pub fn builder(tag: impl Into<String>) -> JobRequestBuilder {
        JobRequestBuilder::new(tag)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn constraint(&self) -> ExecutionConstraint {
        self.constraint
    }

    pub fn is_periodic(&self) -> bool {
        self.constraint.is_periodic()
    }

    pub fn transient_extras(&self) -> &Extras {
        &self.transient_extras
    }

    pub fn persisted_extras(&self) -> &Extras {
        &self.persisted_extras
    }

    /// True when the request carries payload that only a direct launch can deliver.
    pub fn is_transient(&self) -> bool {
        !self.transient_extras.is_empty()
    }

    pub fn required_backend(&self) -> Option<BackendKind> {
        self.required_backend
    }

    pub fn requires_charging(&self) -> bool {
        self.requires_charging
    }

    pub fn requires_device_idle(&self) -> bool {
        self.requires_device_idle
    }

    pub fn network_type(&self) -> NetworkType {
        self.network_type
    }

    /// Whether any device-state constraint is set.
    pub fn has_device_constraints(&self) -> bool {
        self.requires_charging || self.requires_device_idle || self.network_type != NetworkType::Any
    }

    /// Reassemble a request loaded from the store.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        id: JobId,
        tag: String,
        constraint: ExecutionConstraint,
        persisted_extras: Extras,
        required_backend: Option<BackendKind>,
        requires_charging: bool,
        requires_device_idle: bool,
        network_type: NetworkType,
    ) -> Self {
        Self {
            id,
            tag,
            constraint,
            transient_extras: Extras::new(),
            persisted_extras,
            required_backend,
            requires_charging,
            requires_device_idle,
            network_type,
        }
    }
}

/// Collects and validates the fields of a [`JobRequest`].
#[derive(Debug, Clone)]
pub struct JobRequestBuilder {
    tag: String,
    constraint: Option<ExecutionConstraint>,
    transient_extras: Extras,
    persisted_extras: Extras,
    required_backend: Option<BackendKind>,
    requires_charging: bool,
    requires_device_idle: bool,
    network_type: NetworkType,
}

impl JobRequestBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            constraint: None,
            transient_extras: Extras::new(),
            persisted_extras: Extras::new(),
            required_backend: None,
            requires_charging: false,
            requires_device_idle: false,
            network_type: NetworkType::Any,
        }
    }

    /// Run once, no earlier than `start_ms` and no later than `end_ms`.
    pub fn execution_window(mut self, start_ms: u64, end_ms: u64) -> Self {
        self.constraint = Some(ExecutionConstraint::OneShot {
            start_ms,
            end_ms,
            exact: false,
        });
        self
    }

    /// Run once at exactly `at_ms`.
    pub fn exact(mut self, at_ms: u64) -> Self {
        self.constraint = Some(ExecutionConstraint::OneShot {
            start_ms: at_ms,
            end_ms: at_ms,
            exact: true,
        });
        self
    }

    /// Repeat every `interval_ms`; the flex window defaults to the whole interval.
    pub fn periodic(self, interval_ms: u64) -> Self {
        self.periodic_with_flex(interval_ms, interval_ms)
    }

    pub fn periodic_with_flex(mut self, interval_ms: u64, flex_ms: u64) -> Self {
        self.constraint = Some(ExecutionConstraint::Periodic {
            interval_ms,
            flex_ms,
        });
        self
    }

    pub fn transient_extras(mut self, extras: Extras) -> Self {
        self.transient_extras = extras;
        self
    }

    pub fn persisted_extras(mut self, extras: Extras) -> Self {
        self.persisted_extras = extras;
        self
    }

    /// Force a specific backend for this request.
    pub fn required_backend(mut self, kind: BackendKind) -> Self {
        self.required_backend = Some(kind);
        self
    }

    pub fn requires_charging(mut self, yes: bool) -> Self {
        self.requires_charging = yes;
        self
    }

    pub fn requires_device_idle(mut self, yes: bool) -> Self {
        self.requires_device_idle = yes;
        self
    }

    pub fn network_type(mut self, network_type: NetworkType) -> Self {
        self.network_type = network_type;
        self
    }

    /// Validate and freeze the request under `id`.
    pub(crate) fn build(self, id: JobId) -> Result<JobRequest> {
        if self.tag.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest("tag must not be empty".into()));
        }

        let constraint = match self.constraint {
            None => {
                return Err(SchedulerError::InvalidRequest(
                    "an execution window or a periodic interval is required".into(),
                ))
            }
            Some(ExecutionConstraint::OneShot { start_ms, end_ms, .. }) if end_ms < start_ms => {
                return Err(SchedulerError::InvalidRequest(format!(
                    "window end {end_ms} is before window start {start_ms}"
                )))
            }
            Some(ExecutionConstraint::Periodic { interval_ms, .. }) if interval_ms < MIN_INTERVAL_MS => {
                return Err(SchedulerError::InvalidRequest(format!(
                    "periodic interval {interval_ms}ms is below the minimum of {MIN_INTERVAL_MS}ms"
                )))
            }
            Some(ExecutionConstraint::Periodic { interval_ms, flex_ms }) => {
                let interval_ms = cap_window(interval_ms, "interval");
                ExecutionConstraint::Periodic {
                    interval_ms,
                    flex_ms: flex_ms.clamp(MIN_FLEX_MS, interval_ms),
                }
            }
            Some(ExecutionConstraint::OneShot { start_ms, end_ms, exact }) => ExecutionConstraint::OneShot {
                start_ms: cap_window(start_ms, "window start"),
                end_ms: cap_window(end_ms, "window end"),
                exact,
            },
        };

        let has_device_constraints = self.requires_charging
            || self.requires_device_idle
            || self.network_type != NetworkType::Any;
        if constraint.is_exact() && has_device_constraints {
            return Err(SchedulerError::InvalidRequest(
                "exact jobs cannot require charging, idle or network".into(),
            ));
        }

        let bad_keys = self.persisted_extras.non_persistable_keys();
        if !bad_keys.is_empty() {
            return Err(SchedulerError::InvalidRequest(format!(
                "persisted extras must be persistable; offending keys: {}",
                bad_keys.join(", ")
            )));
        }

        Ok(JobRequest {
            id,
            tag: self.tag,
            constraint,
            transient_extras: self.transient_extras,
            persisted_extras: self.persisted_extras,
            required_backend: self.required_backend,
            requires_charging: self.requires_charging,
            requires_device_idle: self.requires_device_idle,
            network_type: self.network_type,
        })
    }
}

fn cap_window(ms: u64, what: &str) -> u64 {
    if ms > MAX_WINDOW_MS {
        warn!(requested_ms = ms, max_ms = MAX_WINDOW_MS, "{what} reduced to the maximum");
        MAX_WINDOW_MS
    } else {
        ms
    }
}

/// What a job handler receives when its job runs.
#[derive(Debug, Clone, PartialEq)]
pub struct JobParams {
    pub request: JobRequest,
    /// Present when the wake delivered a payload: a direct launch or a
    /// backend with native support.
    pub transient_extras: Option<Extras>,
    /// Number of earlier runs that asked to be rescheduled.
    pub failure_count: u32,
}

impl JobParams {
    pub fn id(&self) -> JobId {
        self.request.id()
    }

    pub fn tag(&self) -> &str {
        self.request.tag()
    }
}

#[cfg(test)]
mod tests {
    use jobcompat_core::ExtraValue;

    use super::*;

    #[test]
    fn window_end_before_start_is_rejected() {
        let err = JobRequest::builder("tag")
            .execution_window(20_000, 10_000)
            .build(JobId(1))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REQUEST");
    }

    #[test]
    fn short_interval_is_rejected() {
        assert!(JobRequest::builder("tag")
            .periodic(MIN_INTERVAL_MS - 1)
            .build(JobId(1))
            .is_err());
    }

    #[test]
    fn flex_is_clamped() {
        let req = JobRequest::builder("tag")
            .periodic_with_flex(MIN_INTERVAL_MS, 1)
            .build(JobId(1))
            .unwrap();
        assert_eq!(
            req.constraint(),
            ExecutionConstraint::Periodic {
                interval_ms: MIN_INTERVAL_MS,
                flex_ms: MIN_FLEX_MS
            }
        );
    }

    #[test]
    fn far_off_windows_are_clamped() {
        let req = JobRequest::builder("tag")
            .execution_window(u64::MAX - 1, u64::MAX)
            .build(JobId(1))
            .unwrap();
        assert_eq!(
            req.constraint(),
            ExecutionConstraint::OneShot {
                start_ms: MAX_WINDOW_MS,
                end_ms: MAX_WINDOW_MS,
                exact: false
            }
        );

        let req = JobRequest::builder("tag").periodic(u64::MAX).build(JobId(1)).unwrap();
        assert_eq!(
            req.constraint(),
            ExecutionConstraint::Periodic {
                interval_ms: MAX_WINDOW_MS,
                flex_ms: MAX_WINDOW_MS
            }
        );
        assert!(i64::try_from(MAX_WINDOW_MS).is_ok());
    }

    #[test]
    fn missing_constraint_and_empty_tag_are_rejected() {
        assert!(JobRequest::builder("tag").build(JobId(1)).is_err());
        assert!(JobRequest::builder("  ").exact(10).build(JobId(1)).is_err());
    }

    #[test]
    fn bytes_in_persisted_extras_are_rejected() {
        let extras = Extras::new().with("blob", ExtraValue::Bytes(vec![0xff]));
        let err = JobRequest::builder("tag")
            .execution_window(0, 10)
            .persisted_extras(extras.clone())
            .build(JobId(1))
            .unwrap_err();
        assert!(err.to_string().contains("blob"));

        // Transient extras may carry anything.
        let req = JobRequest::builder("tag")
            .execution_window(0, 10)
            .transient_extras(extras)
            .build(JobId(1))
            .unwrap();
        assert!(req.is_transient());
    }

    #[test]
    fn exact_jobs_reject_device_constraints() {
        assert!(JobRequest::builder("tag")
            .exact(1_000)
            .requires_charging(true)
            .build(JobId(1))
            .is_err());
    }
}
