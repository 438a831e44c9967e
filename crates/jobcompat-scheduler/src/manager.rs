use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use jobcompat_core::{config::JobCompatConfig, BackendKind, JobId};
use rusqlite::Connection;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::{
    engine::{BootReport, DispatchEngine, EngineOptions, FireOutcome, WakeDecision},
    error::Result,
    platform::{PlatformServices, Wake},
    store::JobStore,
    types::{JobParams, JobRequest, JobRequestBuilder},
};

/// Result of one run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Success,
    Failure,
    /// Run again later; one-shot jobs back off, periodic jobs wait for the
    /// next period.
    Reschedule,
}

/// Application code that runs the jobs of one tag.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, params: JobParams) -> JobOutcome;
}

/// Tag -> handler lookup.
#[derive(Default)]
pub struct JobRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `tag`, replacing any earlier one.
    pub fn register(&self, tag: impl Into<String>, handler: Arc<dyn JobHandler>) {
        let tag = tag.into();
        let mut handlers = self.handlers.write().expect("job registry poisoned");
        if handlers.insert(tag.clone(), handler).is_some() {
            debug!(%tag, "job handler replaced");
        } else {
            debug!(%tag, "job handler registered");
        }
    }

    pub fn get(&self, tag: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .read()
            .expect("job registry poisoned")
            .get(tag)
            .cloned()
    }
}

/// Public entry point: builds requests, schedules them, and runs their
/// handlers when wakes arrive.
pub struct JobManager {
    engine: DispatchEngine,
    registry: JobRegistry,
}

impl JobManager {
    /// Open the store on `conn` and build the engine. Bridge launches are
    /// sent on `wake_tx`, the same channel the platform delivers wakes on.
    pub fn new(
        conn: Connection,
        services: &PlatformServices,
        wake_tx: mpsc::Sender<Wake>,
        config: &JobCompatConfig,
    ) -> Result<Self> {
        let store = JobStore::new(conn)?;
        let engine = DispatchEngine::new(store, services, wake_tx, EngineOptions::from_config(config));
        Ok(Self {
            engine,
            registry: JobRegistry::new(),
        })
    }

    pub fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    pub fn register_handler(&self, tag: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.registry.register(tag, handler);
    }

    /// Validate `builder` and give the request a fresh id.
    pub fn build(&self, builder: JobRequestBuilder) -> Result<JobRequest> {
        builder.build(self.engine.store().allocate_id()?)
    }

    /// Build and schedule in one step.
    pub fn schedule_new(&self, builder: JobRequestBuilder) -> Result<JobId> {
        let request = self.build(builder)?;
        self.schedule(request)
    }

    pub fn schedule(&self, request: JobRequest) -> Result<JobId> {
        self.engine.schedule(request)
    }

    pub fn cancel(&self, id: JobId) -> Result<bool> {
        self.engine.cancel(id)
    }

    pub fn cancel_all_for_tag(&self, tag: &str) -> Result<usize> {
        self.engine.cancel_tag(tag)
    }

    pub fn cancel_all(&self) -> Result<usize> {
        self.engine.cancel_all()
    }

    pub fn get_job_request(&self, id: JobId) -> Result<Option<JobRequest>> {
        self.engine.get_job_request(id)
    }

    pub fn all_job_requests(&self) -> Result<Vec<JobRequest>> {
        self.engine.all_job_requests()
    }

    pub fn all_job_requests_for_tag(&self, tag: &str) -> Result<Vec<JobRequest>> {
        self.engine.job_requests_for_tag(tag)
    }

    pub fn set_backend_override(&self, kind: Option<BackendKind>) {
        self.engine.set_backend_override(kind);
    }

    pub fn on_boot_or_process_restart(&self) -> Result<BootReport> {
        self.engine.on_boot_or_process_restart()
    }

    /// Handle one wake: run the job's handler if the engine says so, then
    /// record the outcome. Returns `None` when nothing ran.
    pub async fn dispatch(&self, wake: Wake) -> Result<Option<JobOutcome>> {
        let params = match self.engine.handle_wake(&wake)? {
            WakeDecision::Run(params) => params,
            decision => {
                debug!(job_id = %wake.id, ?decision, "wake not run");
                return Ok(None);
            }
        };

        let id = params.id();
        let outcome = match self.registry.get(params.tag()) {
            Some(handler) => handler.run(params).await,
            None => {
                warn!(job_id = %id, tag = %params.tag(), "no handler for tag");
                JobOutcome::Failure
            }
        };

        let state = match outcome {
            JobOutcome::Reschedule => self.engine.reschedule_with_backoff(id)?,
            JobOutcome::Success | JobOutcome::Failure => self.engine.on_fired(id)?,
        };
        info!(job_id = %id, ?outcome, ?state, "job ran");
        if state == FireOutcome::Absent {
            debug!(job_id = %id, "job cancelled while running");
        }
        Ok(Some(outcome))
    }

    /// Process wakes until `shutdown` broadcasts `true` or the channel closes.
    pub async fn run(self: Arc<Self>, mut wakes: mpsc::Receiver<Wake>, mut shutdown: watch::Receiver<bool>) {
        info!("job manager started");
        loop {
            tokio::select! {
                wake = wakes.recv() => {
                    let Some(wake) = wake else {
                        info!("wake channel closed, job manager stopping");
                        break;
                    };
                    let id = wake.id;
                    if let Err(e) = self.dispatch(wake).await {
                        error!(job_id = %id, code = e.code(), error = %e, "dispatch failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("job manager shutting down");
                        break;
                    }
                }
            }
        }
    }
}
