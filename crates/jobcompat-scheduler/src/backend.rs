use jobcompat_core::BackendKind;
use serde::Serialize;

/// Static capabilities of one scheduling mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub kind: BackendKind,
    /// First platform version that ships the mechanism.
    pub min_version: u32,
    pub periodic: bool,
    /// Periodic jobs honour a flex window shorter than the interval.
    pub periodic_flex: bool,
    /// Persisted extras survive a device restart.
    pub persisted_extras: bool,
    /// Transient extras are delivered natively, no direct launch needed.
    pub transient_extras: bool,
    /// Fires at an exact instant rather than inside a window.
    pub exact: bool,
    /// Enforces charging / idle / network constraints itself.
    pub device_constraints: bool,
    /// Periodic registrations repeat without the engine re-scheduling them.
    pub rearms_periodic: bool,
}

/// Every known backend, best-first.
pub const DESCRIPTORS: [BackendDescriptor; 5] = [
    BackendDescriptor {
        kind: BackendKind::JobScheduler26,
        min_version: 26,
        periodic: true,
        periodic_flex: true,
        persisted_extras: true,
        transient_extras: true,
        exact: false,
        device_constraints: true,
        rearms_periodic: true,
    },
    BackendDescriptor {
        kind: BackendKind::JobScheduler24,
        min_version: 24,
        periodic: true,
        periodic_flex: true,
        persisted_extras: true,
        transient_extras: false,
        exact: false,
        device_constraints: true,
        rearms_periodic: true,
    },
    BackendDescriptor {
        kind: BackendKind::JobScheduler21,
        min_version: 21,
        periodic: true,
        periodic_flex: false,
        persisted_extras: true,
        transient_extras: false,
        exact: false,
        device_constraints: true,
        rearms_periodic: true,
    },
    BackendDescriptor {
        kind: BackendKind::ExactAlarm19,
        min_version: 19,
        periodic: true,
        periodic_flex: false,
        persisted_extras: false,
        transient_extras: false,
        exact: true,
        device_constraints: false,
        rearms_periodic: false,
    },
    BackendDescriptor {
        kind: BackendKind::Alarm14,
        min_version: 14,
        periodic: true,
        periodic_flex: false,
        persisted_extras: false,
        transient_extras: false,
        exact: false,
        device_constraints: false,
        rearms_periodic: true,
    },
];

impl BackendDescriptor {
    pub fn of(kind: BackendKind) -> BackendDescriptor {
        match kind {
            BackendKind::JobScheduler26 => DESCRIPTORS[0],
            BackendKind::JobScheduler24 => DESCRIPTORS[1],
            BackendKind::JobScheduler21 => DESCRIPTORS[2],
            BackendKind::ExactAlarm19 => DESCRIPTORS[3],
            BackendKind::Alarm14 => DESCRIPTORS[4],
        }
    }

    /// The direct-launch bridge must carry transient extras for this backend.
    pub fn needs_transient_bridge(&self) -> bool {
        !self.transient_extras
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_best_first_and_matches_of() {
        for pair in DESCRIPTORS.windows(2) {
            assert!(pair[0].min_version > pair[1].min_version);
        }
        for kind in BackendKind::ALL {
            assert_eq!(BackendDescriptor::of(kind).kind, kind);
        }
    }
}
