// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Clocks, busy-waiting and periodic timers.
//!
//! The *cycle clock* counts at `CYCLES_PER_SEC` and is what latencies are
//! measured with. It is monotonic and starts at zero when the process first
//! looks at it. Periodic timers are scheduled against `Instant`.

use std::io;
use std::sync::OnceLock;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use abi::Priority;
use crossbeam_channel::{RecvTimeoutError, Sender};

use crate::ipc::Notifier;
use crate::sched;

/// Rate of the cycle clock.
pub const CYCLES_PER_SEC: u64 = 1_000_000_000;

fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Reads the cycle counter.
pub fn clock_cycles() -> u64 {
    epoch().elapsed().as_nanos() as u64
}

/// Converts the cycles elapsed between two readings into nanoseconds. The
/// counter is allowed to have wrapped between `start` and `end`.
pub fn cycles_to_ns(start: u64, end: u64) -> u64 {
    let delta = u128::from(end.wrapping_sub(start));
    (delta * 1_000_000_000 / u128::from(CYCLES_PER_SEC)) as u64
}

/// Spins, without yielding the CPU, until strictly more than `nsec`
/// nanoseconds have passed.
///
/// If the cycle counter is seen to go backwards (it wrapped), we give up
/// early rather than spin for the length of a whole counter period.
pub fn nanospin(nsec: u64) {
    let start = clock_cycles();
    loop {
        let now = clock_cycles();
        if now < start || cycles_to_ns(start, now) > nsec {
            break;
        }
        core::hint::spin_loop();
    }
}

/// How a periodic timer's next deadline is chosen.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Repeat {
    /// Next deadline is the previous one plus the interval. Periods that were
    /// missed entirely (because the timer thread was starved) are skipped,
    /// not delivered in a burst.
    AfterDeadline(Duration),
    /// Next deadline is the time of delivery plus the interval.
    AfterWake(Duration),
}

impl Repeat {
    fn interval(self) -> Duration {
        match self {
            Repeat::AfterDeadline(d) | Repeat::AfterWake(d) => d,
        }
    }

    fn next(self, deadline: Instant, now: Instant) -> Instant {
        match self {
            Repeat::AfterWake(period) => now + period,
            Repeat::AfterDeadline(period) => {
                let next = deadline + period;
                if next > now {
                    next
                } else {
                    let behind = (now - next).as_nanos();
                    let skip = behind / period.as_nanos() + 1;
                    next + period * skip as u32
                }
            }
        }
    }
}

/// A timer that posts a notification into a channel, first after a start
/// delay and then repeatedly.
///
/// The timer runs on its own thread, at the given priority; a notification
/// posted by it wakes the receiver no sooner than that thread gets to run.
/// Dropping the timer stops it.
#[derive(Debug)]
pub struct PeriodicTimer {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl PeriodicTimer {
    pub fn start(
        notifier: Notifier,
        bits: u32,
        start_delay: Duration,
        repeat: Repeat,
        priority: Option<Priority>,
    ) -> io::Result<Self> {
        if repeat.interval().is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "timer interval must be nonzero",
            ));
        }
        let first = Instant::now().checked_add(start_delay).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "start delay too long")
        })?;
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let thread = std::thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || {
                if let Some(p) = priority {
                    if let Err(e) = sched::set_current_priority(p) {
                        log::warn!("timer: {e}");
                    }
                }
                let mut deadline = first;
                loop {
                    match stop_rx.recv_deadline(deadline) {
                        Err(RecvTimeoutError::Timeout) => (),
                        // Stopped, or the timer handle was dropped.
                        _ => break,
                    }
                    if !notifier.post(bits) {
                        break;
                    }
                    deadline = repeat.next(deadline, Instant::now());
                }
            })?;
        Ok(Self {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

impl Drop for PeriodicTimer {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{Channel, Received};
    use proptest::prelude::*;

    #[test]
    fn nanospin_waits_at_least_as_long_as_asked() {
        let start = Instant::now();
        nanospin(2_000_000);
        assert!(start.elapsed() > Duration::from_millis(2));
    }

    #[test]
    fn cycle_conversion_survives_wrap() {
        assert_eq!(cycles_to_ns(u64::MAX - 9, 10), 20);
        assert_eq!(cycles_to_ns(100, 1100), 1000);
    }

    #[test]
    fn after_deadline_skips_missed_periods() {
        let t0 = Instant::now();
        let p = Duration::from_millis(10);
        let r = Repeat::AfterDeadline(p);
        assert_eq!(r.next(t0, t0), t0 + p);
        // Woke 35ms late: the 10, 20 and 30ms deadlines are gone.
        assert_eq!(r.next(t0, t0 + Duration::from_millis(35)), t0 + 4 * p);
        // Exactly on a deadline counts as missing it.
        assert_eq!(r.next(t0, t0 + 2 * p), t0 + 3 * p);

        let r = Repeat::AfterWake(p);
        let late = t0 + Duration::from_millis(3);
        assert_eq!(r.next(t0, late), late + p);
    }

    #[test]
    fn periodic_timer_posts_its_bits() {
        let ch = Channel::new();
        let timer = PeriodicTimer::start(
            ch.notifier(),
            1 << 4,
            Duration::from_millis(1),
            Repeat::AfterDeadline(Duration::from_millis(2)),
            None,
        )
        .unwrap();
        for _ in 0..3 {
            match ch.recv() {
                Ok(Received::Notification(bits)) => assert_eq!(bits, 1 << 4),
                other => panic!("unexpected {other:?}"),
            }
        }
        drop(timer);
    }

    #[test]
    fn zero_interval_is_refused() {
        let ch = Channel::new();
        assert!(PeriodicTimer::start(
            ch.notifier(),
            1,
            Duration::ZERO,
            Repeat::AfterWake(Duration::ZERO),
            None,
        )
        .is_err());
    }

    #[test]
    fn absurd_start_delay_is_refused() {
        let ch = Channel::new();
        let err = PeriodicTimer::start(
            ch.notifier(),
            1,
            Duration::MAX,
            Repeat::AfterDeadline(Duration::from_millis(1)),
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert_eq!(ch.queued(), 0);
    }

    proptest! {
        #[test]
        fn after_deadline_stays_on_the_grid(
            period_ms in 1u64..50,
            late_us in 0u64..1_000_000,
        ) {
            let t0 = Instant::now();
            let p = Duration::from_millis(period_ms);
            let now = t0 + Duration::from_micros(late_us);
            let next = Repeat::AfterDeadline(p).next(t0, now);
            prop_assert!(next > now);
            prop_assert!(next - now <= p);
            prop_assert_eq!((next - t0).as_nanos() % p.as_nanos(), 0);
        }
    }
}
