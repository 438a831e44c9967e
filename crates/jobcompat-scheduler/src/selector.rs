use jobcompat_core::BackendKind;
use tracing::debug;

use crate::{
    backend::BackendDescriptor,
    error::{Result, SchedulerError},
    types::JobRequest,
};

/// Pick the backend that will own `request`.
///
/// `forced` wins when it is among `candidates`; a request's own required
/// backend is treated the same way. Otherwise the first candidate that meets
/// every hard requirement is chosen, preferring one that enforces device
/// constraints when the request has any.
pub fn select(
    request: &JobRequest,
    candidates: &[BackendDescriptor],
    forced: Option<BackendKind>,
) -> Result<BackendDescriptor> {
    for kind in [forced, request.required_backend()].into_iter().flatten() {
        if let Some(d) = candidates.iter().find(|d| d.kind == kind) {
            debug!(job_id = %request.id(), backend = %kind, "backend forced");
            return Ok(*d);
        }
        debug!(job_id = %request.id(), backend = %kind, "forced backend unavailable, selecting normally");
    }

    let compatible: Vec<&BackendDescriptor> =
        candidates.iter().filter(|d| satisfies(request, d)).collect();

    let chosen = if request.has_device_constraints() {
        compatible
            .iter()
            .find(|d| d.device_constraints)
            .or_else(|| compatible.first())
    } else {
        compatible.first()
    };

    chosen.map(|d| **d).ok_or_else(|| SchedulerError::NoCompatibleBackend {
        id: request.id(),
        reason: describe_requirements(request, candidates),
    })
}

fn satisfies(request: &JobRequest, d: &BackendDescriptor) -> bool {
    (!request.is_periodic() || d.periodic)
        && (request.persisted_extras().is_empty() || d.persisted_extras)
        && (!request.constraint().is_exact() || d.exact)
}

fn describe_requirements(request: &JobRequest, candidates: &[BackendDescriptor]) -> String {
    let mut needs = Vec::new();
    if request.is_periodic() {
        needs.push("periodic");
    }
    if !request.persisted_extras().is_empty() {
        needs.push("persisted extras");
    }
    if request.constraint().is_exact() {
        needs.push("exact timing");
    }
    let available: Vec<&str> = candidates.iter().map(|d| d.kind.as_str()).collect();
    format!(
        "needs [{}], available [{}]",
        needs.join(", "),
        available.join(", ")
    )
}
