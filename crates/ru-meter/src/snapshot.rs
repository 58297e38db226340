//! Resource usage snapshots and diff arithmetic
//!
//! A [`UsageSnapshot`] is one complete reading of the OS resource-accounting
//! counters for the current process, mirroring the fields of the platform
//! `rusage` structure. All counters are cumulative since process start; the
//! CPU time fields are fractional seconds, the remaining fields are raw
//! platform units (notably `ru_maxrss`, which is kilobytes on Linux and bytes
//! on macOS - the value is passed through, never converted).

use serde::{Deserialize, Serialize};

/// One complete reading of the process resource-usage counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    /// User CPU time consumed, in fractional seconds
    pub ru_utime: f64,
    /// System CPU time consumed, in fractional seconds
    pub ru_stime: f64,
    /// Peak resident set size (platform-defined unit)
    pub ru_maxrss: i64,
    /// Integral shared memory size
    pub ru_ixrss: i64,
    /// Integral unshared data size
    pub ru_idrss: i64,
    /// Integral unshared stack size
    pub ru_isrss: i64,
    /// Minor page faults (page reclaims)
    pub ru_minflt: i64,
    /// Major page faults
    pub ru_majflt: i64,
    /// Swaps
    pub ru_nswap: i64,
    /// Block input operations
    pub ru_inblock: i64,
    /// Block output operations
    pub ru_oublock: i64,
    /// IPC messages sent
    pub ru_msgsnd: i64,
    /// IPC messages received
    pub ru_msgrcv: i64,
    /// Signals received
    pub ru_nsignals: i64,
    /// Voluntary context switches
    pub ru_nvcsw: i64,
    /// Involuntary context switches
    pub ru_nivcsw: i64,
}

impl UsageSnapshot {
    /// Field-wise difference against an earlier snapshot.
    ///
    /// All counters are monotonically increasing, so every diff field is
    /// non-negative under normal operation. Counter fields are signed, which
    /// keeps the subtraction well-defined even across a platform counter
    /// reset (not otherwise handled).
    pub fn diff(&self, earlier: &UsageSnapshot) -> UsageSnapshot {
        UsageSnapshot {
            ru_utime: self.ru_utime - earlier.ru_utime,
            ru_stime: self.ru_stime - earlier.ru_stime,
            ru_maxrss: self.ru_maxrss - earlier.ru_maxrss,
            ru_ixrss: self.ru_ixrss - earlier.ru_ixrss,
            ru_idrss: self.ru_idrss - earlier.ru_idrss,
            ru_isrss: self.ru_isrss - earlier.ru_isrss,
            ru_minflt: self.ru_minflt - earlier.ru_minflt,
            ru_majflt: self.ru_majflt - earlier.ru_majflt,
            ru_nswap: self.ru_nswap - earlier.ru_nswap,
            ru_inblock: self.ru_inblock - earlier.ru_inblock,
            ru_oublock: self.ru_oublock - earlier.ru_oublock,
            ru_msgsnd: self.ru_msgsnd - earlier.ru_msgsnd,
            ru_msgrcv: self.ru_msgrcv - earlier.ru_msgrcv,
            ru_nsignals: self.ru_nsignals - earlier.ru_nsignals,
            ru_nvcsw: self.ru_nvcsw - earlier.ru_nvcsw,
            ru_nivcsw: self.ru_nivcsw - earlier.ru_nivcsw,
        }
    }

    /// Combined user + system CPU time, in fractional seconds
    pub fn cpu_seconds(&self) -> f64 {
        self.ru_utime + self.ru_stime
    }
}

/// A usage sample: the cumulative counters and the consumption since the
/// previous tick
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Cumulative counters at this tick
    pub current: UsageSnapshot,
    /// Field-wise difference against the previous tick's snapshot.
    ///
    /// The first event after `start()` diffs against a zero baseline, so its
    /// values equal `current` and are not meaningful for CPU-time assertions;
    /// consumers should use the first event only to establish a baseline.
    pub diff: UsageSnapshot,
    /// When this sample was taken
    pub timestamp: chrono::DateTime<chrono::Utc>,
}
