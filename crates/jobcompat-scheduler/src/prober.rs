use jobcompat_core::BackendKind;

use crate::backend::{BackendDescriptor, DESCRIPTORS};

/// Backends present on a platform of the given version, best-first.
///
/// Absent backends are simply omitted.
pub fn available_backends(platform_version: u32) -> Vec<BackendDescriptor> {
    DESCRIPTORS
        .iter()
        .filter(|d| platform_version >= d.min_version)
        .copied()
        .collect()
}

/// Reports usable backends: what the platform has, minus what the
/// configuration disabled.
#[derive(Debug, Clone, Default)]
pub struct CapabilityProber {
    disabled: Vec<BackendKind>,
}

impl CapabilityProber {
    pub fn new(disabled: Vec<BackendKind>) -> Self {
        Self { disabled }
    }

    pub fn available_backends(&self, platform_version: u32) -> Vec<BackendDescriptor> {
        available_backends(platform_version)
            .into_iter()
            .filter(|d| !self.disabled.contains(&d.kind))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(v: &[BackendDescriptor]) -> Vec<BackendKind> {
        v.iter().map(|d| d.kind).collect()
    }

    #[test]
    fn newest_platform_has_everything_best_first() {
        assert_eq!(kinds(&available_backends(33)), BackendKind::ALL.to_vec());
    }

    #[test]
    fn older_platforms_lose_newer_backends() {
        assert_eq!(
            kinds(&available_backends(21)),
            vec![
                BackendKind::JobScheduler21,
                BackendKind::ExactAlarm19,
                BackendKind::Alarm14
            ]
        );
        assert!(available_backends(10).is_empty());
    }

    #[test]
    fn disabled_backends_are_omitted() {
        let prober = CapabilityProber::new(vec![BackendKind::JobScheduler26]);
        assert_eq!(
            kinds(&prober.available_backends(26))[0],
            BackendKind::JobScheduler24
        );
    }
}
