use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{mapref::entry::Entry, DashMap};
use jobcompat_core::{Extras, JobId};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::{
    platform::{Wake, WakeSource},
    types::JobRequest,
};

/// Why a direct launch could not be armed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("no async runtime to host the launch timer")]
    NoRuntime,

    #[error("launch channel is closed")]
    LauncherClosed,
}

struct ArmedLaunch {
    generation: u64,
    extras: Extras,
    timer: AbortHandle,
}

/// Delivers transient extras by launching a job directly when its timer
/// expires, with the payload inline in the [`Wake`] message.
///
/// The payload lives only in the armed timer and is never written to the
/// store or handed to an OS scheduler. At most one timer is armed per id.
pub struct TransientBridge {
    launch_tx: mpsc::Sender<Wake>,
    armed: Arc<DashMap<JobId, ArmedLaunch>>,
    generation: AtomicU64,
}

impl TransientBridge {
    pub fn new(launch_tx: mpsc::Sender<Wake>) -> Self {
        Self {
            launch_tx,
            armed: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Arm a direct launch of `request` after `delay_ms`.
    ///
    /// Returns `true` iff the timer is armed. A failure is logged; the job
    /// still has its primary registration.
    pub fn arm(&self, request: &JobRequest, delay_ms: u64) -> bool {
        match self.try_arm(request, delay_ms) {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %request.id(), error = %e, "BridgeArmFailed: direct launch not armed");
                false
            }
        }
    }

    pub fn try_arm(&self, request: &JobRequest, delay_ms: u64) -> Result<(), BridgeError> {
        if self.launch_tx.is_closed() {
            return Err(BridgeError::LauncherClosed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| BridgeError::NoRuntime)?;

        let id = request.id();
        let extras = request.transient_extras().clone();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst);
        let armed = Arc::clone(&self.armed);
        let tx = self.launch_tx.clone();
        let payload = extras.clone();

        // Holding the entry keeps the timer from looking itself up before
        // it has been recorded.
        let slot = self.armed.entry(id);
        let task = runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            // Only the timer that is still current may launch.
            if armed.remove_if(&id, |_, a| a.generation == generation).is_none() {
                return;
            }
            info!(job_id = %id, "direct launch with transient extras");
            let wake = Wake {
                id,
                source: WakeSource::DirectLaunch,
                transient_extras: Some(payload),
            };
            if tx.send(wake).await.is_err() {
                warn!(job_id = %id, "launch channel closed, direct launch dropped");
            }
        });

        let launch = ArmedLaunch {
            generation,
            extras,
            timer: task.abort_handle(),
        };
        match slot {
            Entry::Occupied(mut occupied) => occupied.insert(launch).timer.abort(),
            Entry::Vacant(vacant) => {
                vacant.insert(launch);
            }
        }
        debug!(job_id = %id, delay_ms, "direct launch armed");
        Ok(())
    }

    /// Cancel the armed timer for `id`. No-op when nothing is armed.
    pub fn disarm(&self, id: JobId) {
        if let Some((_, launch)) = self.armed.remove(&id) {
            launch.timer.abort();
            debug!(job_id = %id, "direct launch disarmed");
        }
    }

    pub fn is_armed(&self, id: JobId) -> bool {
        self.armed.contains_key(&id)
    }

    /// Launch now instead of waiting for the timer. Returns `false` when
    /// nothing was armed or the launch could not be queued.
    pub fn fire_now(&self, id: JobId) -> bool {
        let Some((_, launch)) = self.armed.remove(&id) else {
            return false;
        };
        launch.timer.abort();
        let wake = Wake {
            id,
            source: WakeSource::DirectLaunch,
            transient_extras: Some(launch.extras),
        };
        match self.launch_tx.try_send(wake) {
            Ok(()) => {
                info!(job_id = %id, "direct launch fired early");
                true
            }
            Err(e) => {
                warn!(job_id = %id, error = %e, "direct launch could not be queued");
                false
            }
        }
    }
}
