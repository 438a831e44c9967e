use std::sync::Arc;

use jobcompat_core::{BackendKind, JobId};
use tracing::debug;

use super::{BackendAdapter, Registration};
use crate::{
    backend::BackendDescriptor,
    platform::{Clock, JobInfo, JobService, PeriodicSpec, PlatformError},
    types::ExecutionConstraint,
};

/// Adapter over the OS job scheduler. The three platform generations share
/// one service and differ in what a registration may carry.
pub struct JobSchedulerAdapter {
    descriptor: BackendDescriptor,
    service: Arc<dyn JobService>,
    clock: Arc<dyn Clock>,
}

impl JobSchedulerAdapter {
    pub fn new(kind: BackendKind, service: Arc<dyn JobService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            descriptor: BackendDescriptor::of(kind),
            service,
            clock,
        }
    }

    fn job_info(&self, registration: &Registration<'_>) -> JobInfo {
        let request = registration.request;
        let window = registration.window;

        let (min_latency_ms, deadline_ms, periodic) = match request.constraint() {
            ExecutionConstraint::Periodic {
                interval_ms,
                flex_ms,
            } => {
                let flex = self.descriptor.periodic_flex.then_some(flex_ms);
                (0, None, Some(PeriodicSpec { interval_ms, flex_ms: flex }))
            }
            ExecutionConstraint::OneShot { .. } => (window.start_ms, Some(window.end_ms), None),
        };

        let transient_extras = (self.descriptor.transient_extras && request.is_transient())
            .then(|| request.transient_extras().clone());

        JobInfo {
            id: request.id(),
            tag: request.tag().to_string(),
            min_latency_ms,
            deadline_ms,
            periodic,
            // The platform refuses to persist jobs that carry transient extras.
            persisted: transient_extras.is_none(),
            extras: request.persisted_extras().clone(),
            transient_extras,
            requires_charging: request.requires_charging(),
            requires_device_idle: request.requires_device_idle(),
            network_type: request.network_type(),
            registered_at_ms: self.clock.now_ms(),
        }
    }
}

impl BackendAdapter for JobSchedulerAdapter {
    fn kind(&self) -> BackendKind {
        self.descriptor.kind
    }

    fn schedule(&self, registration: &Registration<'_>) -> Result<(), PlatformError> {
        let info = self.job_info(registration);
        debug!(
            job_id = %info.id,
            backend = %self.descriptor.kind,
            min_latency_ms = info.min_latency_ms,
            deadline_ms = ?info.deadline_ms,
            persisted = info.persisted,
            "registering with job service"
        );
        self.service.schedule(info)
    }

    fn cancel(&self, id: JobId) {
        self.service.cancel(id);
    }

    fn is_registered(&self, id: JobId) -> bool {
        self.service.pending_job(id).is_some()
    }

    fn registered_ids(&self) -> Vec<JobId> {
        self.service.pending_jobs().into_iter().map(|j| j.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use jobcompat_core::{ExtraValue, Extras, NetworkType};

    use super::*;
    use crate::{
        platform::{ManualClock, SimulatedPlatform},
        schedule::Window,
        types::JobRequest,
    };

    fn make_adapter(kind: BackendKind) -> (Arc<SimulatedPlatform>, JobSchedulerAdapter) {
        let clock = Arc::new(ManualClock::new(1_000));
        let sim = SimulatedPlatform::new(clock.clone());
        let adapter = JobSchedulerAdapter::new(kind, sim.clone(), clock);
        (sim, adapter)
    }

    fn transient_request() -> JobRequest {
        JobRequest::builder("tag")
            .execution_window(10_000, 20_000)
            .transient_extras(Extras::new().with("key", ExtraValue::Text("value".into())))
            .network_type(NetworkType::Unmetered)
            .build(JobId(3))
            .unwrap()
    }

    fn register(adapter: &JobSchedulerAdapter, request: &JobRequest) {
        adapter
            .schedule(&Registration {
                request,
                window: Window::new(10_000, 20_000),
            })
            .unwrap();
    }

    #[test]
    fn newest_generation_carries_transient_extras() {
        let (sim, adapter) = make_adapter(BackendKind::JobScheduler26);
        register(&adapter, &transient_request());

        let info = sim.pending_job(JobId(3)).unwrap();
        assert_eq!(info.min_latency_ms, 10_000);
        assert_eq!(info.deadline_ms, Some(20_000));
        assert_eq!(info.registered_at_ms, 1_000);
        assert_eq!(info.network_type, NetworkType::Unmetered);
        assert!(!info.persisted);
        assert_eq!(
            info.transient_extras.unwrap().get_text("key"),
            Some("value")
        );
    }

    #[test]
    fn older_generations_drop_transient_extras() {
        let (sim, adapter) = make_adapter(BackendKind::JobScheduler21);
        register(&adapter, &transient_request());

        let info = sim.pending_job(JobId(3)).unwrap();
        assert!(info.transient_extras.is_none());
        assert!(info.persisted);
    }

    #[test]
    fn flex_only_from_24() {
        let req = JobRequest::builder("tag")
            .periodic_with_flex(24 * 60 * 60 * 1000, 60 * 60 * 1000)
            .build(JobId(5))
            .unwrap();
        for (kind, expect_flex) in [
            (BackendKind::JobScheduler24, Some(60 * 60 * 1000)),
            (BackendKind::JobScheduler21, None),
        ] {
            let (sim, adapter) = make_adapter(kind);
            register(&adapter, &req);
            let periodic = sim.pending_job(JobId(5)).unwrap().periodic.unwrap();
            assert_eq!(periodic.flex_ms, expect_flex);
        }
    }

    #[test]
    fn cancel_is_idempotent() {
        let (_sim, adapter) = make_adapter(BackendKind::JobScheduler24);
        register(&adapter, &transient_request());
        assert!(adapter.is_registered(JobId(3)));
        adapter.cancel(JobId(3));
        adapter.cancel(JobId(3));
        assert!(!adapter.is_registered(JobId(3)));
        assert!(adapter.registered_ids().is_empty());
    }
}
