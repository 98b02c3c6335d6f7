// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The simulated hardware unit.
//!
//! A `Hardware` is a lock plus the device state that lock guards. Operations
//! take the lock, busy-wait for as long as the real device would take to do
//! the transfer, and let go. Which lock is used is chosen at construction:
//! a binary semaphore, under which a low-priority holder can be starved by a
//! mid-priority thread while a high-priority waiter looks on, or a mutex
//! using the priority-inheritance protocol, under which it can't.
//!
//! Waiters are not woken in any particular order.

use core::marker::PhantomData;
use std::cell::UnsafeCell;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

use serde::Deserialize;
use userlib::sched;

/// Largest transfer buffer the device keeps.
pub const BUFFER_CAPACITY: usize = 4096;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LockKind {
    /// Binary semaphore; no priority inheritance.
    #[default]
    Semaphore,
    /// POSIX mutex with `PTHREAD_PRIO_INHERIT`.
    InheritingMutex,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("released a lock that was not held")]
    NotHeld,
    #[error("{op} failed: {err}")]
    Os {
        op: &'static str,
        #[source]
        err: io::Error,
    },
}

fn check(op: &'static str, rc: libc::c_int) -> Result<(), LockError> {
    match rc {
        0 => Ok(()),
        libc::EPERM => Err(LockError::NotHeld),
        e => Err(LockError::Os {
            op,
            err: io::Error::from_raw_os_error(e),
        }),
    }
}

struct Semaphore {
    taken: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    fn new() -> Self {
        Self {
            taken: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut taken =
            self.taken.lock().unwrap_or_else(PoisonError::into_inner);
        while *taken {
            taken = self.cv.wait(taken).unwrap_or_else(PoisonError::into_inner);
        }
        *taken = true;
    }

    fn post(&self) -> Result<(), LockError> {
        let mut taken =
            self.taken.lock().unwrap_or_else(PoisonError::into_inner);
        if !*taken {
            return Err(LockError::NotHeld);
        }
        *taken = false;
        self.cv.notify_one();
        Ok(())
    }
}

/// A `pthread_mutex_t` set up for priority inheritance and error checking.
///
/// The mutex lives in its own allocation because pthread mutexes must not
/// move once initialized.
struct PiMutex {
    raw: Box<UnsafeCell<libc::pthread_mutex_t>>,
}

// SAFETY: pthread mutexes are made to be shared between threads; we only
// ever touch the inner value through the pthread API.
unsafe impl Send for PiMutex {}
unsafe impl Sync for PiMutex {}

impl PiMutex {
    fn new() -> Result<Self, LockError> {
        let raw = Box::new(UnsafeCell::new(libc::PTHREAD_MUTEX_INITIALIZER));
        // SAFETY: attr is initialized before use and destroyed after;
        // raw is a valid, pinned mutex that nobody else can see yet.
        unsafe {
            let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
            check(
                "pthread_mutexattr_init",
                libc::pthread_mutexattr_init(&mut attr),
            )?;
            let r = check(
                "pthread_mutexattr_settype",
                libc::pthread_mutexattr_settype(
                    &mut attr,
                    libc::PTHREAD_MUTEX_ERRORCHECK,
                ),
            )
            .and_then(|()| {
                check(
                    "pthread_mutexattr_setprotocol",
                    libc::pthread_mutexattr_setprotocol(
                        &mut attr,
                        libc::PTHREAD_PRIO_INHERIT,
                    ),
                )
            })
            .and_then(|()| {
                check(
                    "pthread_mutex_init",
                    libc::pthread_mutex_init(raw.get(), &attr),
                )
            });
            libc::pthread_mutexattr_destroy(&mut attr);
            r?;
        }
        Ok(Self { raw })
    }

    fn lock(&self) -> Result<(), LockError> {
        // SAFETY: raw was initialized in new and is destroyed only in drop.
        check("pthread_mutex_lock", unsafe {
            libc::pthread_mutex_lock(self.raw.get())
        })
    }

    fn unlock(&self) -> Result<(), LockError> {
        // SAFETY: as above. An error-checking mutex reports EPERM if we
        // don't own it rather than misbehaving.
        check("pthread_mutex_unlock", unsafe {
            libc::pthread_mutex_unlock(self.raw.get())
        })
    }
}

impl Drop for PiMutex {
    fn drop(&mut self) {
        // SAFETY: we have exclusive access, so nobody holds the mutex.
        unsafe {
            libc::pthread_mutex_destroy(self.raw.get());
        }
    }
}

enum HwLock {
    Semaphore(Semaphore),
    Inheriting(PiMutex),
}

impl HwLock {
    fn new(kind: LockKind) -> Result<Self, LockError> {
        Ok(match kind {
            LockKind::Semaphore => HwLock::Semaphore(Semaphore::new()),
            LockKind::InheritingMutex => HwLock::Inheriting(PiMutex::new()?),
        })
    }

    fn acquire(&self) -> Result<(), LockError> {
        match self {
            HwLock::Semaphore(s) => {
                s.wait();
                Ok(())
            }
            HwLock::Inheriting(m) => m.lock(),
        }
    }

    fn release(&self) -> Result<(), LockError> {
        match self {
            HwLock::Semaphore(s) => s.post(),
            HwLock::Inheriting(m) => m.unlock(),
        }
    }
}

/// Source of the time an operation takes.
pub trait Latency: Send + Sync {
    /// Occupies the calling thread for `us` microseconds without giving up
    /// the CPU.
    fn spin(&self, us: u32);

    /// Reads the clock that `spin` is measured against, in nanoseconds.
    fn now_ns(&self) -> u64;
}

/// Real time: spins on the cycle clock.
#[derive(Copy, Clone, Debug, Default)]
pub struct Nanospin;

impl Latency for Nanospin {
    fn spin(&self, us: u32) {
        userlib::nanospin(u64::from(us) * 1000);
    }

    fn now_ns(&self) -> u64 {
        userlib::cycles_to_ns(0, userlib::clock_cycles())
    }
}

/// Virtual time: `spin` returns at once, having moved a private clock
/// forward by exactly the requested duration.
#[derive(Debug, Default)]
pub struct VirtualLatency {
    clock_ns: AtomicU64,
}

impl VirtualLatency {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Latency for VirtualLatency {
    fn spin(&self, us: u32) {
        self.clock_ns
            .fetch_add(u64::from(us) * 1000, Ordering::SeqCst);
    }

    fn now_ns(&self) -> u64 {
        self.clock_ns.load(Ordering::SeqCst)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum OpKind {
    /// `hw_out`: a write, on behalf of `SendData`.
    Out,
    /// `hw_in`: a read, on behalf of `GetData`.
    In,
}

/// One period during which the lock was held, timed by the `Latency` clock.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Hold {
    pub op: Option<(OpKind, u32)>,
    pub start_ns: u64,
    pub end_ns: u64,
}

#[derive(Debug, Default)]
struct HwState {
    last_op: Option<(OpKind, u32)>,
    ops_completed: u64,
    ibuf: Vec<u8>,
    obuf: Vec<u8>,
}

/// What the device looks like from outside, at one instant.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct HwSnapshot {
    pub last_op: Option<(OpKind, u32)>,
    pub ops_completed: u64,
    pub ibuf_len: usize,
    pub obuf_len: usize,
}

pub struct Hardware<L = Nanospin> {
    kind: LockKind,
    lock: HwLock,
    state: UnsafeCell<HwState>,
    latency: L,
    holds: Option<Mutex<Vec<Hold>>>,
}

// SAFETY: `state` is only reachable through an `HwGuard`, and at most one
// guard exists at a time because making one takes `lock`.
unsafe impl<L: Sync> Sync for Hardware<L> {}

impl<L: Latency> Hardware<L> {
    pub fn new(kind: LockKind, latency: L) -> Result<Self, LockError> {
        Ok(Self {
            kind,
            lock: HwLock::new(kind)?,
            state: UnsafeCell::new(HwState::default()),
            latency,
            holds: None,
        })
    }

    /// Turns on recording of every hold of the lock.
    pub fn with_access_log(mut self) -> Self {
        self.holds = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn lock_kind(&self) -> LockKind {
        self.kind
    }

    pub fn latency(&self) -> &L {
        &self.latency
    }

    /// Blocks until the hardware is ours.
    pub fn acquire(&self) -> Result<HwGuard<'_, L>, LockError> {
        self.lock.acquire()?;
        Ok(HwGuard {
            hw: self,
            start_ns: self.latency.now_ns(),
            op: None,
            released: false,
            _not_send: PhantomData,
        })
    }

    /// Writes to the device for `oplength_us` microseconds.
    pub fn hw_out(&self, oplength_us: u32) -> Result<(), LockError> {
        let mut g = self.acquire()?;
        log::info!("hw_out post-lock, period: {oplength_us}");
        g.simulate(OpKind::Out, oplength_us);
        log::info!("hw_out pre-unlock");
        g.release()?;
        log::info!("hw_out post-unlock");
        Ok(())
    }

    /// Reads from the device for `bytes_needed` microseconds.
    pub fn hw_in(&self, bytes_needed: u32) -> Result<(), LockError> {
        let mut g = self.acquire()?;
        log::info!("hw_in post-lock, length: {bytes_needed}");
        g.simulate(OpKind::In, bytes_needed);
        log::info!(
            "hw_in pre-unlock, running at priority {:?}",
            sched::current_priority()
        );
        g.release()?;
        log::info!("hw_in post-unlock");
        Ok(())
    }

    /// Waits for the lock and reports the device state.
    pub fn snapshot(&self) -> Result<HwSnapshot, LockError> {
        let g = self.acquire()?;
        let s = g.state();
        let snap = HwSnapshot {
            last_op: s.last_op,
            ops_completed: s.ops_completed,
            ibuf_len: s.ibuf.len(),
            obuf_len: s.obuf.len(),
        };
        g.release()?;
        Ok(snap)
    }

    /// Returns every recorded hold, in the order they ended. Empty if the
    /// access log isn't on.
    pub fn access_log(&self) -> Vec<Hold> {
        self.holds
            .as_ref()
            .map(|h| h.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }
}

/// Exclusive use of the hardware. Must be released on the thread that
/// acquired it, which is why this isn't `Send`.
pub struct HwGuard<'a, L: Latency> {
    hw: &'a Hardware<L>,
    start_ns: u64,
    op: Option<(OpKind, u32)>,
    released: bool,
    _not_send: PhantomData<*const ()>,
}

impl<L: Latency> HwGuard<'_, L> {
    fn state(&self) -> &HwState {
        // SAFETY: we hold the lock.
        unsafe { &*self.hw.state.get() }
    }

    fn state_mut(&mut self) -> &mut HwState {
        // SAFETY: we hold the lock, and `&mut self` keeps us from handing
        // out two of these.
        unsafe { &mut *self.hw.state.get() }
    }

    /// Performs an operation of `duration_us` microseconds on the device.
    pub fn simulate(&mut self, op: OpKind, duration_us: u32) {
        self.hw.latency.spin(duration_us);
        let len = (duration_us as usize).min(BUFFER_CAPACITY);
        let s = self.state_mut();
        match op {
            OpKind::Out => s.obuf.resize(len, 0),
            OpKind::In => s.ibuf.resize(len, 0),
        }
        s.last_op = Some((op, duration_us));
        s.ops_completed += 1;
        self.op = Some((op, duration_us));
    }

    /// Lets go of the hardware, waking one waiter.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.record();
        self.hw.lock.release()
    }

    fn record(&self) {
        if let Some(holds) = &self.hw.holds {
            let hold = Hold {
                op: self.op,
                start_ns: self.start_ns,
                end_ns: self.hw.latency.now_ns(),
            };
            holds
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(hold);
        }
    }
}

impl<L: Latency> Drop for HwGuard<'_, L> {
    fn drop(&mut self) {
        if !self.released {
            self.record();
            if let Err(e) = self.hw.lock.release() {
                log::error!("releasing hardware on unwind: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_update_state() {
        let hw = Hardware::new(LockKind::Semaphore, VirtualLatency::new())
            .unwrap();
        hw.hw_out(190).unwrap();
        hw.hw_in(1050).unwrap();
        let s = hw.snapshot().unwrap();
        assert_eq!(s.ops_completed, 2);
        assert_eq!(s.last_op, Some((OpKind::In, 1050)));
        assert_eq!((s.obuf_len, s.ibuf_len), (190, 1050));
        assert_eq!(hw.latency().now_ns(), 1_240_000);
    }

    #[test]
    fn semaphore_refuses_double_release() {
        let s = Semaphore::new();
        s.wait();
        s.post().unwrap();
        assert!(matches!(s.post(), Err(LockError::NotHeld)));
    }

    #[test]
    fn access_log_times_each_hold() {
        let hw = Hardware::new(LockKind::Semaphore, VirtualLatency::new())
            .unwrap()
            .with_access_log();
        hw.hw_out(50).unwrap();
        hw.hw_in(100).unwrap();
        assert_eq!(
            hw.access_log(),
            [
                Hold {
                    op: Some((OpKind::Out, 50)),
                    start_ns: 0,
                    end_ns: 50_000
                },
                Hold {
                    op: Some((OpKind::In, 100)),
                    start_ns: 50_000,
                    end_ns: 150_000
                },
            ]
        );
    }

    #[test]
    fn dropped_guard_releases() {
        let hw = Hardware::new(LockKind::Semaphore, VirtualLatency::new())
            .unwrap();
        drop(hw.acquire().unwrap());
        // Would block forever if the lock were still held.
        hw.hw_out(1).unwrap();
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn inheriting_mutex_works() {
        let hw = Hardware::new(LockKind::InheritingMutex, Nanospin).unwrap();
        hw.hw_out(10).unwrap();
        hw.hw_in(10).unwrap();
        assert_eq!(hw.snapshot().unwrap().ops_completed, 2);
    }

    #[test]
    fn virtual_time_is_additive() {
        let v = VirtualLatency::new();
        for us in [50, 100, 75] {
            v.spin(us);
        }
        assert_eq!(v.now_ns(), 225_000);
    }
}
