//! Admission control for the staging phase.
//!
//! Staging copies large image sets onto shared scratch storage, so the
//! staging array job throttles how many new tasks may start based on how
//! full that storage is. The policy here is a pure function of observed
//! utilization; the generated script polls it in a shell loop (see
//! [`crate::scripts`]). This is advisory backpressure, not a hard
//! guarantee: a race window exists between the check and the marker.

/// Caps on concurrently-admitted staging tasks per utilization band.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct AdmissionPolicy {
    /// Below this usage percentage, admission is unbounded.
    pub moderate_pct: u8,
    /// Below this, at most `moderate_cap` tasks run.
    pub high_pct: u8,
    /// Below this, at most `high_cap` tasks run; at or above, zero.
    pub critical_pct: u8,
    pub moderate_cap: u32,
    pub high_cap: u32,
}

impl Default for AdmissionPolicy {
    fn default() -> AdmissionPolicy {
        AdmissionPolicy {
            moderate_pct: 70,
            high_pct: 85,
            critical_pct: 95,
            moderate_cap: 20,
            high_cap: 5,
        }
    }
}

impl AdmissionPolicy {
    /// Maximum number of staging tasks that may run at the given scratch
    /// utilization; `None` means unbounded.
    pub fn max_running(&self, usage_percent: u8) -> Option<u32> {
        if usage_percent < self.moderate_pct {
            None
        } else if usage_percent < self.high_pct {
            Some(self.moderate_cap)
        } else if usage_percent < self.critical_pct {
            Some(self.high_cap)
        } else {
            Some(0)
        }
    }

    /// Whether a new task may start given the utilization and the number of
    /// tasks currently holding markers.
    pub fn admit(&self, usage_percent: u8, running: u32) -> bool {
        match self.max_running(usage_percent) {
            None => true,
            Some(cap) => running < cap,
        }
    }
}
