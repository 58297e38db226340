//! Platform resource-usage accessor
//!
//! [`UsageSource`] abstracts "read the current cumulative resource counters
//! for this process". The production implementation is [`RusageSource`]:
//! `getrusage(RUSAGE_SELF)` on unix, `GetProcessTimes` plus
//! `GetProcessMemoryInfo` on Windows. The trait seam exists so the engine can
//! be driven by deterministic or failing sources in tests.

use crate::error::Result;
use crate::snapshot::UsageSnapshot;

/// Accessor for the current process's cumulative resource counters
///
/// A read either succeeds with a complete snapshot or fails atomically; it
/// never mutates global state and never blocks beyond the platform call
/// itself.
pub trait UsageSource: Send + Sync {
    /// Read the current cumulative counters
    fn read(&self) -> Result<UsageSnapshot>;
}

/// Production source backed by the OS process-accounting call
#[derive(Debug, Clone, Copy, Default)]
pub struct RusageSource;

impl UsageSource for RusageSource {
    fn read(&self) -> Result<UsageSnapshot> {
        read_process_usage()
    }
}

#[cfg(unix)]
fn read_process_usage() -> Result<UsageSnapshot> {
    use crate::error::MeterError;
    use std::mem::MaybeUninit;

    let mut usage = MaybeUninit::<libc::rusage>::uninit();
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        return Err(MeterError::UsageRead(format!("getrusage failed: {err}")));
    }
    let ru = unsafe { usage.assume_init() };

    Ok(UsageSnapshot {
        ru_utime: timeval_seconds(ru.ru_utime),
        ru_stime: timeval_seconds(ru.ru_stime),
        ru_maxrss: ru.ru_maxrss as i64,
        ru_ixrss: ru.ru_ixrss as i64,
        ru_idrss: ru.ru_idrss as i64,
        ru_isrss: ru.ru_isrss as i64,
        ru_minflt: ru.ru_minflt as i64,
        ru_majflt: ru.ru_majflt as i64,
        ru_nswap: ru.ru_nswap as i64,
        ru_inblock: ru.ru_inblock as i64,
        ru_oublock: ru.ru_oublock as i64,
        ru_msgsnd: ru.ru_msgsnd as i64,
        ru_msgrcv: ru.ru_msgrcv as i64,
        ru_nsignals: ru.ru_nsignals as i64,
        ru_nvcsw: ru.ru_nvcsw as i64,
        ru_nivcsw: ru.ru_nivcsw as i64,
    })
}

#[cfg(unix)]
fn timeval_seconds(tv: libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(windows)]
fn read_process_usage() -> Result<UsageSnapshot> {
    use crate::error::MeterError;
    use std::mem;

    // Windows has no getrusage; map what the process APIs expose and leave
    // the remaining counters at zero.
    unsafe {
        let handle = windows_sys::Win32::System::Threading::GetCurrentProcess();

        let mut creation_time = mem::zeroed();
        let mut exit_time = mem::zeroed();
        let mut kernel_time = mem::zeroed();
        let mut user_time = mem::zeroed();

        let ok = windows_sys::Win32::System::Threading::GetProcessTimes(
            handle,
            &mut creation_time,
            &mut exit_time,
            &mut kernel_time,
            &mut user_time,
        );
        if ok == 0 {
            return Err(MeterError::UsageRead("GetProcessTimes failed".into()));
        }

        let mut mem_info: windows_sys::Win32::System::ProcessStatus::PROCESS_MEMORY_COUNTERS =
            mem::zeroed();
        mem_info.cb = mem::size_of::<
            windows_sys::Win32::System::ProcessStatus::PROCESS_MEMORY_COUNTERS,
        >() as u32;

        let ok = windows_sys::Win32::System::ProcessStatus::GetProcessMemoryInfo(
            handle,
            &mut mem_info,
            mem_info.cb,
        );
        if ok == 0 {
            return Err(MeterError::UsageRead("GetProcessMemoryInfo failed".into()));
        }

        Ok(UsageSnapshot {
            ru_utime: filetime_seconds(&user_time),
            ru_stime: filetime_seconds(&kernel_time),
            ru_maxrss: mem_info.PeakWorkingSetSize as i64,
            ru_majflt: mem_info.PageFaultCount as i64,
            ..Default::default()
        })
    }
}

#[cfg(windows)]
fn filetime_seconds(ft: &windows_sys::Win32::Foundation::FILETIME) -> f64 {
    // FILETIME is in 100-nanosecond intervals
    let ticks = ((ft.dwHighDateTime as u64) << 32) | (ft.dwLowDateTime as u64);
    ticks as f64 / 10_000_000.0
}

#[cfg(not(any(unix, windows)))]
fn read_process_usage() -> Result<UsageSnapshot> {
    Err(crate::error::MeterError::UsageRead(
        "process accounting is not available on this platform".into(),
    ))
}
