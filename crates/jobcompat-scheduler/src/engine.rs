use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};

use chrono::Utc;
use dashmap::DashMap;
use jobcompat_core::{
    config::{BackoffConfig, JobCompatConfig, DEFAULT_PLATFORM_VERSION},
    BackendKind, JobId,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    adapter::{AdapterTable, BackendAdapter, Registration},
    backend::BackendDescriptor,
    bridge::TransientBridge,
    error::{Result, SchedulerError},
    platform::{Clock, PlatformError, PlatformServices, Wake, WakeSource},
    prober::CapabilityProber,
    schedule::{
        backoff_delay, backoff_window, elapsed_ms, initial_window, is_duplicate_periodic_wake,
        next_period_window, offset_ms, remaining_window, Window,
    },
    selector::select,
    store::{JobStore, StoreEntry},
    types::{ExecutionConstraint, JobParams, JobRequest},
};

/// Knobs the engine takes from configuration.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub platform_version: u32,
    pub disabled_backends: Vec<BackendKind>,
    /// Diagnostic override; `None` means normal selection.
    pub force_backend: Option<BackendKind>,
    pub backoff: BackoffConfig,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            platform_version: DEFAULT_PLATFORM_VERSION,
            disabled_backends: Vec::new(),
            force_backend: None,
            backoff: BackoffConfig::default(),
        }
    }
}

impl EngineOptions {
    pub fn from_config(config: &JobCompatConfig) -> Self {
        Self {
            platform_version: config.platform.version,
            disabled_backends: config.scheduler.disabled_backends.clone(),
            force_backend: config.scheduler.force_backend.as_override(),
            backoff: config.backoff.clone(),
        }
    }
}

/// Where a job stands after a firing was processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// One-shot job done; its store entry is gone.
    Completed,
    /// Still pending: periodic, or rescheduled after a failure.
    Pending,
    /// The store had no entry for the id.
    Absent,
}

/// What to do with an incoming [`Wake`].
#[derive(Debug, Clone, PartialEq)]
pub enum WakeDecision {
    Run(JobParams),
    /// The bridge was launched instead; its wake carries the payload.
    Deferred,
    /// A periodic job that already ran in this period.
    Duplicate,
    /// No store entry: any registration for the id was cancelled.
    Orphan,
}

/// Result of [`DispatchEngine::on_boot_or_process_restart`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootReport {
    /// Entries whose registration was still in place.
    pub intact: usize,
    /// Entries re-registered.
    pub repaired: usize,
    /// Entries whose re-registration failed; they stay in the store.
    pub failed: Vec<JobId>,
    /// Registrations cancelled because the store did not list them.
    pub orphans_cancelled: usize,
}

/// Orchestrates schedule / cancel / firing / boot repair on top of the
/// store, the selector, the adapters and the transient bridge.
///
/// The store is the single source of truth: every other piece of state can
/// be re-derived from it. All work on one id runs under that id's lock.
pub struct DispatchEngine {
    store: JobStore,
    adapters: AdapterTable,
    candidates: Vec<BackendDescriptor>,
    forced: RwLock<Option<BackendKind>>,
    bridge: TransientBridge,
    clock: Arc<dyn Clock>,
    backoff: BackoffConfig,
    locks: DashMap<JobId, Arc<Mutex<()>>>,
}

impl DispatchEngine {
    /// Build an engine. Direct launches from the transient bridge are sent
    /// on `launch_tx`.
    pub fn new(
        store: JobStore,
        services: &PlatformServices,
        launch_tx: mpsc::Sender<Wake>,
        options: EngineOptions,
    ) -> Self {
        let candidates = CapabilityProber::new(options.disabled_backends)
            .available_backends(options.platform_version);
        info!(
            platform_version = options.platform_version,
            backends = ?candidates.iter().map(|d| d.kind.as_str()).collect::<Vec<_>>(),
            "dispatch engine ready"
        );
        Self {
            store,
            adapters: AdapterTable::for_platform(services),
            candidates,
            forced: RwLock::new(options.force_backend),
            bridge: TransientBridge::new(launch_tx),
            clock: services.clock.clone(),
            backoff: options.backoff,
            locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn candidates(&self) -> &[BackendDescriptor] {
        &self.candidates
    }

    pub fn adapter(&self, kind: BackendKind) -> Option<&dyn BackendAdapter> {
        self.adapters.get(kind)
    }

    pub fn is_bridge_armed(&self, id: JobId) -> bool {
        self.bridge.is_armed(id)
    }

    /// Force every following selection onto `kind`; `None` restores auto.
    pub fn set_backend_override(&self, kind: Option<BackendKind>) {
        *self.forced.write().expect("backend override poisoned") = kind;
        info!(backend = ?kind, "backend override changed");
    }

    pub fn backend_override(&self) -> Option<BackendKind> {
        *self.forced.read().expect("backend override poisoned")
    }

    /// Register `request` with the backend the selector picks.
    ///
    /// The store entry is written before the backend is asked, so a failed
    /// registration leaves an entry that boot repair will retry. Scheduling
    /// an id again replaces its previous registration.
    pub fn schedule(&self, request: JobRequest) -> Result<JobId> {
        let id = request.id();
        self.with_id_lock(id, || self.schedule_locked(request))
    }

    fn schedule_locked(&self, request: JobRequest) -> Result<JobId> {
        let id = request.id();
        let descriptor = select(&request, &self.candidates, self.backend_override())?;
        let previous = self.store.get(id)?;
        if let Some(ref prev) = previous {
            if prev.backend != descriptor.kind {
                self.cancel_registration(prev.backend, id);
            }
            self.bridge.disarm(id);
        }

        let entry = StoreEntry {
            request,
            backend: descriptor.kind,
            created_at: previous
                .map(|p| p.created_at)
                .unwrap_or_else(|| Utc::now().to_rfc3339()),
            scheduled_at_ms: self.clock.now_ms(),
            failure_count: 0,
            last_run_ms: None,
        };
        self.store.put(&entry)?;
        self.register(&entry, &descriptor, initial_window(entry.request.constraint()))?;

        info!(
            job_id = %id,
            tag = %entry.request.tag(),
            backend = %descriptor.kind,
            periodic = entry.request.is_periodic(),
            "job scheduled"
        );
        Ok(id)
    }

    /// Cancel `id` everywhere it is registered. Returns `false` if the
    /// store had no entry. The entry is gone once this returns `Ok`.
    pub fn cancel(&self, id: JobId) -> Result<bool> {
        self.with_id_lock(id, || {
            let Some(entry) = self.store.get(id)? else {
                debug!(job_id = %id, "cancel: no such job");
                return Ok(false);
            };
            self.cancel_registration(entry.backend, id);
            self.bridge.disarm(id);
            self.store.remove(id)?;
            info!(job_id = %id, backend = %entry.backend, "job cancelled");
            Ok(true)
        })
    }

    /// Cancel every job with `tag`. Returns how many were cancelled.
    pub fn cancel_tag(&self, tag: &str) -> Result<usize> {
        let mut cancelled = 0;
        for entry in self.store.for_tag(tag)? {
            if self.cancel(entry.request.id())? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn cancel_all(&self) -> Result<usize> {
        let mut cancelled = 0;
        for entry in self.store.all_pending()? {
            if self.cancel(entry.request.id())? {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    pub fn get_job_request(&self, id: JobId) -> Result<Option<JobRequest>> {
        Ok(self.store.get(id)?.map(|e| e.request))
    }

    pub fn all_job_requests(&self) -> Result<Vec<JobRequest>> {
        Ok(self
            .store
            .all_pending()?
            .into_iter()
            .map(|e| e.request)
            .collect())
    }

    pub fn job_requests_for_tag(&self, tag: &str) -> Result<Vec<JobRequest>> {
        Ok(self
            .store
            .for_tag(tag)?
            .into_iter()
            .map(|e| e.request)
            .collect())
    }

    /// Decide whether a wake should run its job.
    pub fn handle_wake(&self, wake: &Wake) -> Result<WakeDecision> {
        self.with_id_lock(wake.id, || self.handle_wake_locked(wake))
    }

    fn handle_wake_locked(&self, wake: &Wake) -> Result<WakeDecision> {
        let id = wake.id;
        let Some(entry) = self.store.get(id)? else {
            warn!(job_id = %id, source = ?wake.source, "wake for unknown job, cancelling orphan");
            for adapter in self.adapters.iter() {
                adapter.cancel(id);
            }
            self.bridge.disarm(id);
            return Ok(WakeDecision::Orphan);
        };

        if let ExecutionConstraint::Periodic { interval_ms, .. } = entry.request.constraint() {
            if is_duplicate_periodic_wake(interval_ms, entry.last_run_ms, self.clock.now_ms()) {
                debug!(job_id = %id, source = ?wake.source, "periodic wake already served this period");
                return Ok(WakeDecision::Duplicate);
            }
        }

        // Let the bridge run it so the transient extras come along.
        if wake.source == WakeSource::Platform && self.bridge.fire_now(id) {
            return Ok(WakeDecision::Deferred);
        }

        // A launch that already left the bridge, or one that could not be
        // armed: this process still holds the payload.
        let transient_extras = wake.transient_extras.clone().or_else(|| {
            entry
                .request
                .is_transient()
                .then(|| entry.request.transient_extras().clone())
        });

        Ok(WakeDecision::Run(JobParams {
            transient_extras,
            failure_count: entry.failure_count,
            request: entry.request,
        }))
    }

    /// Record that `id` ran.
    ///
    /// One-shot jobs are finished: registration, bridge timer and store
    /// entry all go. Periodic jobs stay pending; backends that do not repeat
    /// on their own are re-registered, and the bridge is re-armed for the
    /// next occurrence before this returns.
    pub fn on_fired(&self, id: JobId) -> Result<FireOutcome> {
        self.with_id_lock(id, || self.on_fired_locked(id))
    }

    fn on_fired_locked(&self, id: JobId) -> Result<FireOutcome> {
        let Some(mut entry) = self.store.get(id)? else {
            return Ok(FireOutcome::Absent);
        };

        match entry.request.constraint() {
            ExecutionConstraint::OneShot { .. } => {
                self.bridge.disarm(id);
                self.cancel_registration(entry.backend, id);
                self.store.remove(id)?;
                info!(job_id = %id, "one-shot job completed");
                Ok(FireOutcome::Completed)
            }
            periodic => {
                let now = self.clock.now_ms();
                let descriptor = BackendDescriptor::of(entry.backend);
                let window = next_period_window(periodic);

                entry.last_run_ms = Some(now);
                entry.failure_count = 0;
                if !descriptor.rearms_periodic {
                    entry.scheduled_at_ms = now;
                }
                self.store.put(&entry)?;

                if !descriptor.rearms_periodic {
                    self.register(&entry, &descriptor, window)?;
                } else if needs_bridge(&entry.request, &descriptor) {
                    self.bridge.arm(&entry.request, window.start_ms);
                }
                debug!(job_id = %id, backend = %entry.backend, "periodic job fired, still pending");
                Ok(FireOutcome::Pending)
            }
        }
    }

    /// Record that a run asked to be retried.
    ///
    /// One-shot jobs are re-registered after a backoff delay that grows with
    /// each failure. Periodic jobs simply wait for their next period.
    pub fn reschedule_with_backoff(&self, id: JobId) -> Result<FireOutcome> {
        self.with_id_lock(id, || match self.store.get(id)? {
            None => Ok(FireOutcome::Absent),
            Some(entry) if entry.request.is_periodic() => self.on_fired_locked(id),
            Some(entry) => self.backoff_locked(entry),
        })
    }

    fn backoff_locked(&self, mut entry: StoreEntry) -> Result<FireOutcome> {
        let id = entry.request.id();
        let constraint = entry.request.constraint();
        entry.failure_count += 1;
        let window = backoff_window(constraint, &self.backoff, entry.failure_count);
        // Anchor so that `scheduled_at_ms + start_ms` is the backoff start;
        // boot repair then computes the right remaining window.
        let anchor_ms = offset_ms(self.clock.now_ms(), window.start_ms);
        let first_start_ms = offset_ms(0, initial_window(constraint).start_ms);
        entry.scheduled_at_ms = anchor_ms.saturating_sub(first_start_ms);
        self.store.put(&entry)?;

        let descriptor = BackendDescriptor::of(entry.backend);
        self.register(&entry, &descriptor, window)?;
        info!(
            job_id = %id,
            failures = entry.failure_count,
            delay_ms = backoff_delay(&self.backoff, entry.failure_count),
            "job rescheduled with backoff"
        );
        Ok(FireOutcome::Pending)
    }

    /// Re-derive every registration from the store.
    ///
    /// Entries whose backend lost the registration (or is no longer
    /// available) are registered again with whatever is left of their
    /// window. Registrations the store does not know are cancelled.
    /// Individual failures are reported, not returned.
    pub fn on_boot_or_process_restart(&self) -> Result<BootReport> {
        let mut report = BootReport::default();
        let now = self.clock.now_ms();

        for pending in self.store.all_pending()? {
            let id = pending.request.id();
            // Re-read under the lock; the job may have been cancelled meanwhile.
            let repaired = self.with_id_lock(id, || {
                Ok(self.store.get(id)?.map(|entry| self.repair(entry, now)))
            })?;
            match repaired {
                None => {}
                Some(Ok(true)) => report.repaired += 1,
                Some(Ok(false)) => report.intact += 1,
                Some(Err(e)) => {
                    warn!(job_id = %id, code = e.code(), error = %e, "boot repair failed, entry kept");
                    report.failed.push(id);
                }
            }
        }

        report.orphans_cancelled = self.sweep_orphans()?;
        info!(
            intact = report.intact,
            repaired = report.repaired,
            failed = report.failed.len(),
            orphans = report.orphans_cancelled,
            "boot repair complete"
        );
        Ok(report)
    }

    // --- private helpers ---------------------------------------------------

    /// Run `f` under the lock for `id`. The lock is dropped from the map
    /// again once no other caller holds or waits on it.
    fn with_id_lock<T>(&self, id: JobId, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.locks.entry(id).or_default().clone();
        let result = {
            let _guard = lock.lock().expect("job lock poisoned");
            f()
        };
        drop(lock);
        self.locks.remove_if(&id, |_, l| Arc::strong_count(l) == 1);
        result
    }

    /// Register with the adapter and, when the backend cannot carry the
    /// payload, arm the bridge for the start of the window.
    fn register(&self, entry: &StoreEntry, descriptor: &BackendDescriptor, window: Window) -> Result<()> {
        let id = entry.request.id();
        let failed = |source: PlatformError| SchedulerError::AdapterRegistrationFailed {
            id,
            backend: descriptor.kind,
            source,
        };
        let adapter = self
            .adapters
            .get(descriptor.kind)
            .ok_or_else(|| failed(PlatformError::Unavailable("no adapter registered".into())))?;

        adapter
            .schedule(&Registration {
                request: &entry.request,
                window,
            })
            .map_err(failed)?;

        if needs_bridge(&entry.request, descriptor) {
            self.bridge.arm(&entry.request, window.start_ms);
        }
        Ok(())
    }

    fn cancel_registration(&self, backend: BackendKind, id: JobId) {
        match self.adapters.get(backend) {
            Some(adapter) => adapter.cancel(id),
            None => warn!(job_id = %id, backend = %backend, "no adapter to cancel registration"),
        }
    }

    /// Returns whether the entry had to be registered again.
    fn repair(&self, mut entry: StoreEntry, now: i64) -> Result<bool> {
        let id = entry.request.id();
        let current = self.candidates.iter().find(|d| d.kind == entry.backend).copied();

        let descriptor = match current {
            Some(d) if self.adapters.get(d.kind).is_some_and(|a| a.is_registered(id)) => {
                // Registration survived. A restarted process still has to
                // re-arm the bridge if it kept the payload.
                if needs_bridge(&entry.request, &d) && !self.bridge.is_armed(id) {
                    let elapsed = elapsed_ms(entry.scheduled_at_ms, now);
                    let window = remaining_window(entry.request.constraint(), elapsed);
                    self.bridge.arm(&entry.request, window.start_ms);
                }
                return Ok(false);
            }
            Some(d) => d,
            None => {
                let d = select(&entry.request, &self.candidates, self.backend_override())?;
                info!(job_id = %id, from = %entry.backend, to = %d.kind, "owning backend gone, moving job");
                self.cancel_registration(entry.backend, id);
                d
            }
        };

        let window = match entry.request.constraint() {
            ExecutionConstraint::OneShot { .. } => {
                let elapsed = elapsed_ms(entry.scheduled_at_ms, now);
                remaining_window(entry.request.constraint(), elapsed)
            }
            periodic => {
                entry.scheduled_at_ms = now;
                initial_window(periodic)
            }
        };

        entry.backend = descriptor.kind;
        self.store.put(&entry)?;
        self.register(&entry, &descriptor, window)?;
        info!(job_id = %id, backend = %descriptor.kind, start_ms = window.start_ms, "registration repaired");
        Ok(true)
    }

    fn sweep_orphans(&self) -> Result<usize> {
        let known: HashSet<JobId> = self
            .store
            .all_pending()?
            .into_iter()
            .map(|e| e.request.id())
            .collect();

        let mut cancelled = 0;
        for adapter in self.adapters.iter() {
            for id in adapter.registered_ids() {
                if known.contains(&id) {
                    continue;
                }
                let orphaned = self.with_id_lock(id, || {
                    // Scheduled since the snapshot was taken.
                    if self.store.get(id)?.is_some() {
                        return Ok(false);
                    }
                    adapter.cancel(id);
                    self.bridge.disarm(id);
                    Ok(true)
                })?;
                if orphaned {
                    cancelled += 1;
                    warn!(job_id = %id, backend = %adapter.kind(), "orphaned registration cancelled");
                }
            }
        }
        Ok(cancelled)
    }
}

fn needs_bridge(request: &JobRequest, descriptor: &BackendDescriptor) -> bool {
    request.is_transient() && descriptor.needs_transient_bridge()
}
