// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-priority periodic client.
//!
//! On every timer tick this sends one `SendData` request, cycling through a
//! fixed table of operation sizes, and times the round trip on the cycle
//! clock. A round trip shorter than the deadline is a success; anything
//! else is a miss, which is reported along with how many deadlines in a row
//! had been made before it.

use hw_server_api::{HwError, HwServer, WorkCycle};
use ringbuf::{count_entry, counted_ringbuf};
use userlib::*;

/// Operation lengths, in microseconds, sent in turn.
pub static WORK: [u32; 10] = [50, 100, 75, 190, 100, 200, 25, 50, 100, 180];

pub const DEFAULT_DEADLINE_NS: u64 = 1_000_000;

/// Notification bit the tick timer posts.
pub const TICK: u32 = 1 << 0;

#[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
enum Trace {
    None,
    Met { oplength: u32, elapsed_ns: u64 },
    Missed { oplength: u32, elapsed_ns: u64 },
}

counted_ringbuf!(Trace, 128, Trace::None);

/// Logs the client's event counters and most recent events.
pub fn dump_trace() {
    __RINGBUF.dump(log::Level::Warn);
}

/// Parses a deadline given in (possibly fractional) milliseconds, returning
/// nanoseconds.
pub fn parse_deadline_ms(s: &str) -> Result<u64, String> {
    let ms: f64 = s
        .trim()
        .parse()
        .map_err(|_| format!("Bad value for -d argument: {s:?}"))?;
    if !ms.is_finite() || ms <= 0.0 {
        return Err(format!("Bad value for -d argument: {s:?}"));
    }
    let ns = (ms * 1_000_000.0).round();
    if ns < 1.0 {
        return Err(format!("Bad value for -d argument: {s:?}"));
    }
    Ok(ns as u64)
}

/// Outcome of one timed operation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// Made the deadline; `streak` counts this one.
    Met { streak: u32 },
    /// Missed it; `prior_streak` deadlines in a row had been made before.
    Missed { elapsed_ns: u64, prior_streak: u32 },
}

/// Tracks consecutive deadlines made.
#[derive(Clone, Debug)]
pub struct DeadlineMonitor {
    deadline_ns: u64,
    consecutive_successes: u32,
}

impl DeadlineMonitor {
    pub fn new(deadline_ns: u64) -> Self {
        Self {
            deadline_ns,
            consecutive_successes: 0,
        }
    }

    pub fn deadline_ns(&self) -> u64 {
        self.deadline_ns
    }

    pub fn streak(&self) -> u32 {
        self.consecutive_successes
    }

    /// Classifies a round trip of `elapsed_ns`. Taking exactly the deadline
    /// counts as missing it.
    pub fn record(&mut self, elapsed_ns: u64) -> Verdict {
        if elapsed_ns < self.deadline_ns {
            self.consecutive_successes =
                self.consecutive_successes.saturating_add(1);
            Verdict::Met {
                streak: self.consecutive_successes,
            }
        } else {
            let prior_streak =
                core::mem::replace(&mut self.consecutive_successes, 0);
            Verdict::Missed {
                elapsed_ns,
                prior_streak,
            }
        }
    }
}

/// Totals over a whole run.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub successes: u64,
    pub misses: u64,
    pub longest_streak: u32,
    pub worst_ns: u64,
}

impl Report {
    fn add(&mut self, v: Verdict, elapsed_ns: u64) {
        self.worst_ns = self.worst_ns.max(elapsed_ns);
        match v {
            Verdict::Met { streak } => {
                self.successes += 1;
                self.longest_streak = self.longest_streak.max(streak);
            }
            Verdict::Missed { .. } => self.misses += 1,
        }
    }
}

pub struct HighPrioClient<T> {
    hw: HwServer<T>,
    work: WorkCycle,
    monitor: DeadlineMonitor,
    /// Freeze and dump the trace on the first miss.
    trigger: bool,
    report: Report,
}

impl<T: Transport> HighPrioClient<T> {
    pub fn new(hw: HwServer<T>, deadline_ns: u64, trigger: bool) -> Self {
        Self {
            hw,
            work: WorkCycle::new(&WORK),
            monitor: DeadlineMonitor::new(deadline_ns),
            trigger,
            report: Report::default(),
        }
    }

    pub fn report(&self) -> Report {
        self.report
    }

    pub fn monitor(&self) -> &DeadlineMonitor {
        &self.monitor
    }

    /// Sends the next operation, times it and judges it.
    pub fn on_tick(&mut self) -> Result<Verdict, HwError> {
        let oplength = self.work.next().unwrap_or_default();
        let before = clock_cycles();
        self.hw.send_data(oplength)?;
        let after = clock_cycles();
        let elapsed_ns = cycles_to_ns(before, after);
        log::info!("elapsed: {elapsed_ns} ns, oplength: {oplength} us");

        let verdict = self.monitor.record(elapsed_ns);
        self.report.add(verdict, elapsed_ns);
        match verdict {
            Verdict::Met { streak } => {
                count_entry!(Trace::Met {
                    oplength,
                    elapsed_ns
                });
                if streak % 100 == 0 {
                    log::info!("100 successes");
                }
            }
            Verdict::Missed { prior_streak, .. } => {
                count_entry!(Trace::Missed {
                    oplength,
                    elapsed_ns
                });
                if self.trigger && __RINGBUF.freeze() {
                    log::warn!("trace stopped on deadline miss");
                    dump_trace();
                }
                log::warn!(
                    "missed a deadline for {oplength} us operation!, \
                     took: {elapsed_ns} ns"
                );
                log::warn!("Had made {prior_streak} previous deadlines.");
            }
        }
        Ok(verdict)
    }

    /// Runs one operation per tick until `channel` shuts down.
    pub fn run(&mut self, channel: &Channel) -> Result<(), HwError> {
        while let Ok(bits) = hl::recv_notification(channel) {
            if bits & TICK != 0 {
                self.on_tick()?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn streak_resets_on_miss() {
        let mut m = DeadlineMonitor::new(700_000);
        for i in 1..=5 {
            assert_eq!(m.record(100_000), Verdict::Met { streak: i });
        }
        assert_eq!(
            m.record(900_000),
            Verdict::Missed {
                elapsed_ns: 900_000,
                prior_streak: 5
            }
        );
        assert_eq!(m.streak(), 0);
        assert_eq!(m.record(1), Verdict::Met { streak: 1 });
    }

    #[test]
    fn exactly_the_deadline_is_a_miss() {
        let mut m = DeadlineMonitor::new(1_000_000);
        assert!(matches!(m.record(1_000_000), Verdict::Missed { .. }));
        assert!(matches!(m.record(999_999), Verdict::Met { streak: 1 }));
    }

    #[test]
    fn deadline_parsing() {
        assert_eq!(parse_deadline_ms("1"), Ok(1_000_000));
        assert_eq!(parse_deadline_ms("0.7"), Ok(700_000));
        assert!(parse_deadline_ms("0").is_err());
        assert!(parse_deadline_ms("-2").is_err());
        assert!(parse_deadline_ms("soon").is_err());
        assert!(parse_deadline_ms("NaN").is_err());
    }

    #[test]
    fn report_tracks_longest_streak() {
        let mut r = Report::default();
        let mut m = DeadlineMonitor::new(10);
        for e in [1, 2, 3, 50, 4] {
            let v = m.record(e);
            r.add(v, e);
        }
        assert_eq!(
            r,
            Report {
                successes: 4,
                misses: 1,
                longest_streak: 3,
                worst_ns: 50,
            }
        );
    }

    /// A server that takes a fixed time to answer anything.
    struct Delay(u64);

    impl Transport for Delay {
        fn send(
            &self,
            _: u16,
            _: &[u8],
            _: &mut [u8],
        ) -> Result<(u32, usize), SendError> {
            nanospin(self.0);
            Ok((SUCCESS, 0))
        }
    }

    #[test]
    fn ticks_are_timed_against_the_deadline() {
        let hw = HwServer::attach(Delay(0)).unwrap();
        let mut fast = HighPrioClient::new(hw, 50_000_000, false);
        assert_eq!(fast.on_tick().unwrap(), Verdict::Met { streak: 1 });

        let hw = HwServer::attach(Delay(2_000_000)).unwrap();
        let mut slow = HighPrioClient::new(hw, 1_000_000, false);
        let v = slow.on_tick().unwrap();
        assert!(matches!(
            v,
            Verdict::Missed { elapsed_ns, prior_streak: 0 }
                if elapsed_ns > 2_000_000
        ));
        assert_eq!(slow.report().misses, 1);
    }

    proptest! {
        #[test]
        fn met_iff_strictly_under(
            deadline in 1u64..10_000_000,
            elapsed in any::<u64>(),
        ) {
            let mut m = DeadlineMonitor::new(deadline);
            let v = m.record(elapsed);
            prop_assert_eq!(
                matches!(v, Verdict::Met { .. }),
                elapsed < deadline
            );
        }

        #[test]
        fn one_miss_after_n_successes(n in 0u32..500) {
            let mut m = DeadlineMonitor::new(1000);
            for _ in 0..n {
                m.record(999);
            }
            prop_assert_eq!(
                m.record(1000),
                Verdict::Missed { elapsed_ns: 1000, prior_streak: n }
            );
            prop_assert_eq!(m.record(0), Verdict::Met { streak: 1 });
        }
    }
}
