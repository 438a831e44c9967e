//! Backend adapters: one per [`BackendKind`], all behind [`BackendAdapter`].

mod alarm;
mod job_scheduler;

use std::collections::HashMap;

use jobcompat_core::{BackendKind, JobId};
use tracing::info;

pub use alarm::AlarmAdapter;
pub use job_scheduler::JobSchedulerAdapter;

use crate::{
    platform::{PlatformError, PlatformServices},
    schedule::Window,
    types::JobRequest,
};

/// One registration to hand to a backend: the request plus the window it
/// should fire in, relative to now.
#[derive(Debug, Clone, Copy)]
pub struct Registration<'a> {
    pub request: &'a JobRequest,
    pub window: Window,
}

/// Common contract of every backend mechanism.
///
/// Adapters keep no state of their own; whatever they know comes from the
/// platform service underneath.
pub trait BackendAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Register the job, replacing any registration with the same id.
    fn schedule(&self, registration: &Registration<'_>) -> Result<(), PlatformError>;

    /// Deregister the job. Unknown ids are a no-op.
    fn cancel(&self, id: JobId);

    fn is_registered(&self, id: JobId) -> bool;

    /// Every id the underlying mechanism currently holds.
    fn registered_ids(&self) -> Vec<JobId>;
}

/// Dispatch table from backend kind to its adapter.
pub struct AdapterTable {
    adapters: HashMap<BackendKind, Box<dyn BackendAdapter>>,
}

impl AdapterTable {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// One adapter per known backend, all wired to `services`.
    pub fn for_platform(services: &PlatformServices) -> Self {
        let mut table = Self::new();
        for kind in BackendKind::ALL {
            let adapter: Box<dyn BackendAdapter> = match kind {
                BackendKind::JobScheduler26
                | BackendKind::JobScheduler24
                | BackendKind::JobScheduler21 => Box::new(JobSchedulerAdapter::new(
                    kind,
                    services.jobs.clone(),
                    services.clock.clone(),
                )),
                BackendKind::ExactAlarm19 | BackendKind::Alarm14 => Box::new(AlarmAdapter::new(
                    kind,
                    services.alarms.clone(),
                    services.clock.clone(),
                )),
            };
            table.register(adapter);
        }
        table
    }

    /// Register an adapter. An adapter of the same kind is replaced.
    pub fn register(&mut self, adapter: Box<dyn BackendAdapter>) {
        let kind = adapter.kind();
        info!(backend = %kind, "registering backend adapter");
        self.adapters.insert(kind, adapter);
    }

    pub fn get(&self, kind: BackendKind) -> Option<&dyn BackendAdapter> {
        self.adapters.get(&kind).map(|b| b.as_ref())
    }

    /// Adapters sorted best-first.
    pub fn iter(&self) -> impl Iterator<Item = &dyn BackendAdapter> {
        let mut kinds: Vec<&BackendKind> = self.adapters.keys().collect();
        kinds.sort();
        kinds.into_iter().map(move |k| self.adapters[k].as_ref())
    }
}

impl Default for AdapterTable {
    fn default() -> Self {
        Self::new()
    }
}
