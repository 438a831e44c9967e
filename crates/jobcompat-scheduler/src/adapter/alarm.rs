use std::sync::Arc;

use jobcompat_core::{BackendKind, JobId};
use tracing::debug;

use super::{BackendAdapter, Registration};
use crate::{
    backend::BackendDescriptor,
    platform::{Alarm, AlarmService, Clock, PlatformError},
    schedule::offset_ms,
    types::ExecutionConstraint,
};

/// Adapter over the alarm service.
///
/// The exact flavour sets one-off exact alarms and relies on the engine to
/// re-arm periodic work after each firing. The inexact flavour uses windowed
/// and repeating alarms.
pub struct AlarmAdapter {
    descriptor: BackendDescriptor,
    service: Arc<dyn AlarmService>,
    clock: Arc<dyn Clock>,
}

impl AlarmAdapter {
    pub fn new(kind: BackendKind, service: Arc<dyn AlarmService>, clock: Arc<dyn Clock>) -> Self {
        Self {
            descriptor: BackendDescriptor::of(kind),
            service,
            clock,
        }
    }

    fn alarm(&self, registration: &Registration<'_>) -> Alarm {
        let request = registration.request;
        let window = registration.window;
        let trigger_at_ms = offset_ms(self.clock.now_ms(), window.start_ms);

        let (window_ms, repeat_interval_ms) = match request.constraint() {
            _ if self.descriptor.exact => (None, None),
            ExecutionConstraint::Periodic { interval_ms, .. } => {
                (Some(window.width_ms()), Some(interval_ms))
            }
            ExecutionConstraint::OneShot { .. } => (Some(window.width_ms()), None),
        };

        Alarm {
            id: request.id(),
            tag: request.tag().to_string(),
            trigger_at_ms,
            window_ms,
            repeat_interval_ms,
        }
    }
}

impl BackendAdapter for AlarmAdapter {
    fn kind(&self) -> BackendKind {
        self.descriptor.kind
    }

    fn schedule(&self, registration: &Registration<'_>) -> Result<(), PlatformError> {
        let alarm = self.alarm(registration);
        debug!(
            job_id = %alarm.id,
            backend = %self.descriptor.kind,
            trigger_at_ms = alarm.trigger_at_ms,
            window_ms = ?alarm.window_ms,
            repeat_interval_ms = ?alarm.repeat_interval_ms,
            "setting alarm"
        );
        self.service.set(alarm)
    }

    fn cancel(&self, id: JobId) {
        self.service.cancel(id);
    }

    fn is_registered(&self, id: JobId) -> bool {
        self.service.pending_alarm(id).is_some()
    }

    fn registered_ids(&self) -> Vec<JobId> {
        self.service
            .pending_alarms()
            .into_iter()
            .map(|a| a.id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        platform::{ManualClock, SimulatedPlatform},
        schedule::Window,
        types::JobRequest,
    };

    const HOUR: u64 = 60 * 60 * 1000;

    fn make_adapter(kind: BackendKind) -> (Arc<SimulatedPlatform>, AlarmAdapter) {
        let clock = Arc::new(ManualClock::new(5_000));
        let sim = SimulatedPlatform::new(clock.clone());
        let adapter = AlarmAdapter::new(kind, sim.clone(), clock);
        (sim, adapter)
    }

    #[test]
    fn exact_alarm_has_no_window_or_repeat() {
        let (sim, adapter) = make_adapter(BackendKind::ExactAlarm19);
        let req = JobRequest::builder("tag").periodic(HOUR).build(JobId(1)).unwrap();
        adapter
            .schedule(&Registration {
                request: &req,
                window: Window::new(0, HOUR),
            })
            .unwrap();

        let alarm = sim.pending_alarm(JobId(1)).unwrap();
        assert_eq!(alarm.trigger_at_ms, 5_000);
        assert_eq!(alarm.window_ms, None);
        assert_eq!(alarm.repeat_interval_ms, None);
    }

    #[test]
    fn inexact_periodic_alarm_repeats() {
        let (sim, adapter) = make_adapter(BackendKind::Alarm14);
        let req = JobRequest::builder("tag").periodic(HOUR).build(JobId(2)).unwrap();
        adapter
            .schedule(&Registration {
                request: &req,
                window: Window::new(0, HOUR),
            })
            .unwrap();

        let alarm = sim.pending_alarm(JobId(2)).unwrap();
        assert_eq!(alarm.window_ms, Some(HOUR));
        assert_eq!(alarm.repeat_interval_ms, Some(HOUR));
        assert_eq!(adapter.registered_ids(), vec![JobId(2)]);
    }

    #[test]
    fn one_shot_window_becomes_trigger_and_window() {
        let (sim, adapter) = make_adapter(BackendKind::Alarm14);
        let req = JobRequest::builder("tag")
            .execution_window(10_000, 20_000)
            .build(JobId(3))
            .unwrap();
        adapter
            .schedule(&Registration {
                request: &req,
                window: Window::new(10_000, 20_000),
            })
            .unwrap();
        let alarm = sim.pending_alarm(JobId(3)).unwrap();
        assert_eq!(alarm.trigger_at_ms, 15_000);
        assert_eq!(alarm.window_ms, Some(10_000));

        adapter.cancel(JobId(3));
        adapter.cancel(JobId(3));
        assert!(!adapter.is_registered(JobId(3)));
    }
}
