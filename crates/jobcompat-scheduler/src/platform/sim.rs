use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobcompat_core::JobId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{
    Alarm, AlarmService, Clock, JobInfo, JobService, PlatformError, PlatformServices, Wake,
    WakeSource,
};
use crate::schedule::offset_ms;

#[derive(Debug, Clone)]
struct SimJob {
    info: JobInfo,
    next_due_ms: i64,
}

#[derive(Debug, Default)]
struct SimState {
    jobs: HashMap<JobId, SimJob>,
    alarms: HashMap<JobId, Alarm>,
}

/// In-memory job service and alarm service.
///
/// Used by the `jobcompat` binary and by tests. Time only matters through
/// [`SimulatedPlatform::take_due`], which fires whatever is due at `now`.
pub struct SimulatedPlatform {
    clock: Arc<dyn Clock>,
    state: Mutex<SimState>,
    fail_next: AtomicBool,
}

impl SimulatedPlatform {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            state: Mutex::new(SimState::default()),
            fail_next: AtomicBool::new(false),
        })
    }

    /// Services backed by this platform, for building an engine.
    pub fn services(self: &Arc<Self>) -> PlatformServices {
        PlatformServices {
            jobs: self.clone(),
            alarms: self.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Make the next `schedule` / `set` call fail once.
    pub fn fail_next_registration(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Simulate a device restart: non-persisted jobs, every alarm and all
    /// transient payloads are gone.
    pub fn reboot(&self) {
        let mut state = self.state.lock().expect("sim platform poisoned");
        state.jobs.retain(|_, j| j.info.persisted);
        for job in state.jobs.values_mut() {
            job.info.transient_extras = None;
        }
        state.alarms.clear();
        info!(surviving_jobs = state.jobs.len(), "simulated platform rebooted");
    }

    /// Fire everything due at `now_ms`, ordered by due time.
    ///
    /// One-shot registrations are consumed; periodic jobs and repeating
    /// alarms move on to their next occurrence.
    pub fn take_due(&self, now_ms: i64) -> Vec<Wake> {
        let mut state = self.state.lock().expect("sim platform poisoned");
        let mut due: Vec<(i64, Wake)> = Vec::new();

        let mut finished = Vec::new();
        for (id, job) in state.jobs.iter_mut() {
            if job.next_due_ms > now_ms {
                continue;
            }
            due.push((
                job.next_due_ms,
                Wake {
                    id: *id,
                    source: WakeSource::Platform,
                    transient_extras: job.info.transient_extras.clone(),
                },
            ));
            match job.info.periodic {
                Some(p) => job.next_due_ms = offset_ms(job.next_due_ms, p.interval_ms),
                None => finished.push(*id),
            }
        }
        for id in finished {
            state.jobs.remove(&id);
        }

        let mut finished = Vec::new();
        for (id, alarm) in state.alarms.iter_mut() {
            if alarm.trigger_at_ms > now_ms {
                continue;
            }
            due.push((
                alarm.trigger_at_ms,
                Wake {
                    id: *id,
                    source: WakeSource::Platform,
                    transient_extras: None,
                },
            ));
            match alarm.repeat_interval_ms {
                Some(every) => alarm.trigger_at_ms = offset_ms(alarm.trigger_at_ms, every),
                None => finished.push(*id),
            }
        }
        for id in finished {
            state.alarms.remove(&id);
        }

        due.sort_by_key(|(at, w)| (*at, w.id));
        due.into_iter().map(|(_, w)| w).collect()
    }

    /// Poll every `tick` and forward due wakes until `shutdown` broadcasts `true`.
    pub async fn run(
        self: Arc<Self>,
        wake_tx: mpsc::Sender<Wake>,
        tick: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("simulated platform started");
        let mut interval = tokio::time::interval(tick);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for wake in self.take_due(self.clock.now_ms()) {
                        let id = wake.id;
                        if wake_tx.try_send(wake).is_err() {
                            warn!(job_id = %id, "wake channel full or closed, wake dropped");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("simulated platform shutting down");
                        break;
                    }
                }
            }
        }
    }

    fn check_failure(&self) -> Result<(), PlatformError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PlatformError::Rejected("injected failure".into()));
        }
        Ok(())
    }
}

impl JobService for SimulatedPlatform {
    fn schedule(&self, info: JobInfo) -> Result<(), PlatformError> {
        self.check_failure()?;
        let first_due = match info.periodic {
            Some(p) => p.interval_ms.saturating_sub(p.flex_ms.unwrap_or(p.interval_ms)),
            None => info.min_latency_ms,
        };
        let next_due_ms = offset_ms(info.registered_at_ms, first_due);
        debug!(job_id = %info.id, next_due_ms, "sim job registered");
        let mut state = self.state.lock().expect("sim platform poisoned");
        state.jobs.insert(info.id, SimJob { info, next_due_ms });
        Ok(())
    }

    fn cancel(&self, id: JobId) {
        let mut state = self.state.lock().expect("sim platform poisoned");
        state.jobs.remove(&id);
    }

    fn pending_job(&self, id: JobId) -> Option<JobInfo> {
        let state = self.state.lock().expect("sim platform poisoned");
        state.jobs.get(&id).map(|j| j.info.clone())
    }

    fn pending_jobs(&self) -> Vec<JobInfo> {
        let state = self.state.lock().expect("sim platform poisoned");
        let mut jobs: Vec<JobInfo> = state.jobs.values().map(|j| j.info.clone()).collect();
        jobs.sort_by_key(|j| j.id);
        jobs
    }
}

impl AlarmService for SimulatedPlatform {
    fn set(&self, alarm: Alarm) -> Result<(), PlatformError> {
        self.check_failure()?;
        debug!(job_id = %alarm.id, trigger_at_ms = alarm.trigger_at_ms, "sim alarm set");
        let mut state = self.state.lock().expect("sim platform poisoned");
        state.alarms.insert(alarm.id, alarm);
        Ok(())
    }

    fn cancel(&self, id: JobId) {
        let mut state = self.state.lock().expect("sim platform poisoned");
        state.alarms.remove(&id);
    }

    fn pending_alarm(&self, id: JobId) -> Option<Alarm> {
        let state = self.state.lock().expect("sim platform poisoned");
        state.alarms.get(&id).cloned()
    }

    fn pending_alarms(&self) -> Vec<Alarm> {
        let state = self.state.lock().expect("sim platform poisoned");
        let mut alarms: Vec<Alarm> = state.alarms.values().cloned().collect();
        alarms.sort_by_key(|a| a.id);
        alarms
    }
}

#[cfg(test)]
mod tests {
    use jobcompat_core::{ExtraValue, Extras, NetworkType};

    use super::*;
    use crate::platform::{ManualClock, PeriodicSpec};

    fn info(id: i32, latency: u64, periodic: Option<PeriodicSpec>, persisted: bool) -> JobInfo {
        JobInfo {
            id: JobId(id),
            tag: "t".into(),
            min_latency_ms: latency,
            deadline_ms: None,
            periodic,
            persisted,
            extras: Extras::new(),
            transient_extras: Some(Extras::new().with("k", ExtraValue::Int(1))),
            requires_charging: false,
            requires_device_idle: false,
            network_type: NetworkType::Any,
            registered_at_ms: 0,
        }
    }

    #[test]
    fn one_shot_job_fires_once() {
        let sim = SimulatedPlatform::new(Arc::new(ManualClock::new(0)));
        JobService::schedule(&*sim, info(1, 100, None, true)).unwrap();
        assert!(sim.take_due(99).is_empty());
        let wakes = sim.take_due(100);
        assert_eq!(wakes.len(), 1);
        assert!(wakes[0].transient_extras.is_some());
        assert!(sim.take_due(1_000).is_empty());
        assert!(sim.pending_jobs().is_empty());
    }

    #[test]
    fn periodic_job_keeps_firing() {
        let sim = SimulatedPlatform::new(Arc::new(ManualClock::new(0)));
        let spec = PeriodicSpec {
            interval_ms: 1_000,
            flex_ms: Some(200),
        };
        JobService::schedule(&*sim, info(1, 0, Some(spec), true)).unwrap();
        assert_eq!(sim.take_due(800).len(), 1);
        assert!(sim.take_due(1_000).is_empty());
        assert_eq!(sim.take_due(1_800).len(), 1);
        assert!(sim.pending_job(JobId(1)).is_some());
    }

    #[test]
    fn reboot_keeps_only_persisted_jobs_without_payload() {
        let sim = SimulatedPlatform::new(Arc::new(ManualClock::new(0)));
        JobService::schedule(&*sim, info(1, 10, None, true)).unwrap();
        JobService::schedule(&*sim, info(2, 10, None, false)).unwrap();
        sim.set(Alarm {
            id: JobId(3),
            tag: "t".into(),
            trigger_at_ms: 10,
            window_ms: None,
            repeat_interval_ms: None,
        })
        .unwrap();

        sim.reboot();

        let jobs = sim.pending_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, JobId(1));
        assert!(jobs[0].transient_extras.is_none());
        assert!(sim.pending_alarms().is_empty());
    }

    #[test]
    fn injected_failure_hits_once() {
        let sim = SimulatedPlatform::new(Arc::new(ManualClock::new(0)));
        sim.fail_next_registration();
        assert!(JobService::schedule(&*sim, info(1, 0, None, true)).is_err());
        assert!(JobService::schedule(&*sim, info(1, 0, None, true)).is_ok());
    }

    #[test]
    fn repeating_alarm_moves_forward() {
        let sim = SimulatedPlatform::new(Arc::new(ManualClock::new(0)));
        sim.set(Alarm {
            id: JobId(4),
            tag: "t".into(),
            trigger_at_ms: 50,
            window_ms: Some(10),
            repeat_interval_ms: Some(100),
        })
        .unwrap();
        assert_eq!(sim.take_due(50).len(), 1);
        assert_eq!(sim.pending_alarm(JobId(4)).unwrap().trigger_at_ms, 150);
    }
}
