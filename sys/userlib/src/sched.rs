// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Thread scheduling: real-time priorities and CPU pinning.
//!
//! Priorities map onto Linux `SCHED_FIFO`. Using them needs `CAP_SYS_NICE` (or
//! a suitable `RLIMIT_RTPRIO`); without it, we warn once and carry on with
//! the OS's normal time-sharing policy. The priority a thread *asked* for is
//! still tracked, so that it is reported in the messages the thread sends and
//! servers can float to it; only the enforcement by the OS is lost.

use std::cell::Cell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use abi::Priority;

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error(
        "priority {0} is outside {min}..={max}",
        min = Priority::MIN,
        max = Priority::MAX
    )]
    InvalidPriority(Priority),
    #[error("no such CPU: {0}")]
    NoSuchCpu(usize),
    #[error("could not set scheduling policy: {0}")]
    Os(#[source] io::Error),
}

thread_local! {
    static CURRENT: Cell<Option<Priority>> = const { Cell::new(None) };
}

static RT_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// Returns the priority the calling thread runs at, or `None` if it runs
/// under the normal time-sharing policy.
pub fn current_priority() -> Option<Priority> {
    CURRENT.with(Cell::get)
}

/// Moves the calling thread to real-time priority `prio`.
pub fn set_current_priority(prio: Priority) -> Result<(), SchedError> {
    if !prio.is_valid() {
        return Err(SchedError::InvalidPriority(prio));
    }
    apply(Some(prio))?;
    CURRENT.with(|c| c.set(Some(prio)));
    Ok(())
}

/// Returns the calling thread to the normal time-sharing policy.
pub fn clear_current_priority() -> Result<(), SchedError> {
    apply(None)?;
    CURRENT.with(|c| c.set(None));
    Ok(())
}

#[cfg(target_os = "linux")]
fn apply(prio: Option<Priority>) -> Result<(), SchedError> {
    let (policy, level) = match prio {
        Some(p) => (libc::SCHED_FIFO, i32::from(p.0)),
        None => (libc::SCHED_OTHER, 0),
    };
    // SAFETY: sched_param is plain old data, and pthread_self always names
    // a live thread (us).
    let rc = unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = level;
        libc::pthread_setschedparam(libc::pthread_self(), policy, &param)
    };
    match rc {
        0 => Ok(()),
        libc::EPERM => {
            if !RT_UNAVAILABLE.swap(true, Ordering::Relaxed) {
                log::warn!(
                    "real-time scheduling is not permitted; running at \
                     normal priority (priorities are advisory only)"
                );
            }
            Ok(())
        }
        e => Err(SchedError::Os(io::Error::from_raw_os_error(e))),
    }
}

#[cfg(not(target_os = "linux"))]
fn apply(_prio: Option<Priority>) -> Result<(), SchedError> {
    if !RT_UNAVAILABLE.swap(true, Ordering::Relaxed) {
        log::warn!("real-time scheduling is not supported on this platform");
    }
    Ok(())
}

/// Returns `true` if an attempt to use real-time scheduling has been refused
/// by the OS.
pub fn realtime_unavailable() -> bool {
    RT_UNAVAILABLE.load(Ordering::Relaxed)
}

/// Runs the calling thread at a client's priority until dropped, then puts
/// it back where it was.
#[must_use]
pub struct FloatGuard {
    restore: Option<Option<Priority>>,
}

/// Floats the calling thread to `prio`. Returns a guard that restores the
/// previous priority.
pub fn float_to(prio: Priority) -> FloatGuard {
    let prev = current_priority();
    if prev == Some(prio) {
        return FloatGuard { restore: None };
    }
    match set_current_priority(prio) {
        Ok(()) => FloatGuard {
            restore: Some(prev),
        },
        Err(e) => {
            log::warn!("cannot float to priority {prio}: {e}");
            FloatGuard { restore: None }
        }
    }
}

impl Drop for FloatGuard {
    fn drop(&mut self) {
        let r = match self.restore {
            None => return,
            Some(Some(p)) => set_current_priority(p),
            Some(None) => clear_current_priority(),
        };
        if let Err(e) = r {
            log::warn!("cannot restore base priority: {e}");
        }
    }
}

/// Pins the calling thread to CPU `cpu`.
pub fn pin_to_cpu(cpu: usize) -> Result<(), SchedError> {
    let ids = core_affinity::get_core_ids().unwrap_or_default();
    let id = ids
        .into_iter()
        .find(|c| c.id == cpu)
        .ok_or(SchedError::NoSuchCpu(cpu))?;
    if core_affinity::set_for_current(id) {
        Ok(())
    } else {
        Err(SchedError::Os(io::Error::last_os_error()))
    }
}

/// Spawns a named thread that moves itself to `prio` (and optionally onto
/// `cpu`) before running `f`.
pub fn spawn_with_priority<F, T>(
    name: &str,
    prio: Priority,
    cpu: Option<usize>,
    f: F,
) -> io::Result<JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let task = name.to_string();
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            if let Some(cpu) = cpu {
                if let Err(e) = pin_to_cpu(cpu) {
                    log::warn!("{task}: {e}");
                }
            }
            if let Err(e) = set_current_priority(prio) {
                crate::error_out(&task, "set priority", &e);
            }
            f()
        })
}
