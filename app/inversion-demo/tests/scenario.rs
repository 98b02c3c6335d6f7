// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::{Duration, Instant};

use high_prio_client::Verdict;
use hw_server::LockKind;
use inversion_demo::{probe, run, Config, ProbeReport};

/// A probe with a roomy deadline, so only the forced contention can miss it.
fn probe_config(lock: LockKind) -> Config {
    let mut c = Config::default();
    c.server.lock = lock;
    c.high_prio_client.deadline_ms = 5.0;
    c.probe.warmup_ticks = 5;
    c.probe.hold_us = 40_000;
    c
}

fn check_streaks(r: &ProbeReport) {
    let mut expect = 0;
    for v in &r.warmup {
        match *v {
            Verdict::Met { streak } => {
                expect += 1;
                assert_eq!(streak, expect);
            }
            Verdict::Missed { prior_streak, .. } => {
                assert_eq!(prior_streak, expect);
                expect = 0;
            }
        }
    }
    assert_eq!(r.streak_before, expect);
}

fn assert_forced_miss(r: &ProbeReport) {
    assert_eq!(r.warmup.len(), 5);
    check_streaks(r);
    match r.contended {
        Verdict::Missed {
            elapsed_ns,
            prior_streak,
        } => {
            assert_eq!(prior_streak, r.streak_before);
            assert!(elapsed_ns >= 5_000_000, "{elapsed_ns}");
        }
        v => panic!("high-priority operation wasn't held up: {v:?}"),
    }
}

#[test]
fn long_low_priority_request_breaks_the_streak() {
    let r = probe(&probe_config(LockKind::Semaphore)).unwrap();
    assert_eq!(r.lock, LockKind::Semaphore);
    assert_forced_miss(&r);
}

#[test]
fn inheriting_mutex_still_waits_out_the_holder() {
    let r = probe(&probe_config(LockKind::InheritingMutex)).unwrap();
    assert_eq!(r.lock, LockKind::InheritingMutex);
    assert_forced_miss(&r);
}

#[test]
fn probe_needs_two_workers() {
    let mut c = probe_config(LockKind::Semaphore);
    c.server.workers = 1;
    assert!(probe(&c).is_err());
}

fn short_run() -> Config {
    let mut c = Config::default();
    c.duration_ms = 300;
    c.high_prio_client.deadline_ms = 50.0;
    c.high_prio_client.start_delay_ms = 10;
    c.low_prio_client.start_delay_ms = 10;
    c.cpu_burner.start_delay_ms = 10;
    c.cpu_burner.burn_us = 500;
    c
}

#[test]
fn everyone_gets_work_done() {
    let (_tx, rx) = crossbeam_channel::bounded(1);
    let r = run(&short_run(), &rx).unwrap();
    assert!(r.high.successes + r.high.misses > 0);
    assert!(r.low_completed > 0);
    assert!(r.bursts > 0);
}

#[test]
fn burner_can_be_left_out() {
    let mut c = short_run();
    c.cpu_burner.disabled = true;
    let (_tx, rx) = crossbeam_channel::bounded(1);
    let r = run(&c, &rx).unwrap();
    assert_eq!(r.bursts, 0);
    assert!(r.low_completed > 0);
}

/// Everything on one CPU, with long bursts from the burner and a deadline
/// the high-priority client can only meet when nothing is in its way.
fn crowded_cpu() -> Config {
    let mut c = Config::default();
    c.duration_ms = 2000;
    c.cpu = Some(0);
    c.high_prio_client.deadline_ms = 0.7;
    c.high_prio_client.start_delay_ms = 10;
    c.low_prio_client.start_delay_ms = 10;
    c.cpu_burner.start_delay_ms = 10;
    c.cpu_burner.burn_us = 20_000;
    c.cpu_burner.interval_ms = 25;
    c
}

#[test]
fn burner_on_a_shared_cpu_causes_misses() {
    let (_tx, rx) = crossbeam_channel::bounded(1);
    let r = run(&crowded_cpu(), &rx).unwrap();
    assert!(r.bursts > 0);
    assert!(r.high.misses > 0, "{r}");
    assert!(r.high.longest_streak > 0, "{r}");
}

#[test]
fn shared_cpu_without_burner_meets_a_roomy_deadline() {
    let mut c = crowded_cpu();
    c.cpu_burner.disabled = true;
    c.high_prio_client.deadline_ms = 50.0;
    let (_tx, rx) = crossbeam_channel::bounded(1);
    let r = run(&c, &rx).unwrap();
    assert_eq!(r.bursts, 0);
    assert!(r.high.successes > 0);
    assert_eq!(r.high.misses, 0, "{r}");
}

#[test]
fn stop_request_ends_the_run_early() {
    let mut c = short_run();
    c.duration_ms = 60_000;
    let (tx, rx) = crossbeam_channel::bounded(1);
    tx.send(()).unwrap();
    let start = Instant::now();
    run(&c, &rx).unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));
}

#[test]
fn invalid_scenarios_are_refused_up_front() {
    let mut c = short_run();
    c.server.workers = 0;
    let (_tx, rx) = crossbeam_channel::bounded(1);
    assert!(run(&c, &rx).is_err());
}
