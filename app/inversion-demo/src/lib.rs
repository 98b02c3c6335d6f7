// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The whole priority-inversion scenario in one process.
//!
//! The hardware server's worker pool, both clients and the CPU burner each
//! run on their own threads at their own priorities, talking over
//! same-process connections instead of the name service.

pub mod config;

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use cpu_burner::CpuBurner;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use high_prio_client::{HighPrioClient, Report, Verdict};
use hw_server::{Hardware, LockKind, Nanospin, Server, ServerConfig};
use hw_server_api::{HwError, HwServer};
use low_prio_client::LowPrioClient;
use userlib::time::{PeriodicTimer, Repeat};
use userlib::{sched, Channel, Priority};

pub use config::Config;

/// What a timed run amounted to.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub lock: LockKind,
    pub high: Report,
    pub low_completed: u64,
    pub bursts: u64,
    /// False if the threads only pretended to have real-time priorities.
    pub realtime: bool,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "hardware lock:      {:?}", self.lock)?;
        writeln!(f, "deadlines made:     {}", self.high.successes)?;
        writeln!(f, "deadlines missed:   {}", self.high.misses)?;
        writeln!(f, "longest streak:     {}", self.high.longest_streak)?;
        writeln!(f, "worst round trip:   {} ns", self.high.worst_ns)?;
        writeln!(f, "low-prio requests:  {}", self.low_completed)?;
        writeln!(f, "cpu bursts:         {}", self.bursts)?;
        if !self.realtime {
            writeln!(
                f,
                "(real-time priorities unavailable; results are noisy)"
            )?;
        }
        Ok(())
    }
}

fn server_config(config: &Config) -> Result<ServerConfig> {
    Ok(ServerConfig {
        workers: config.server.workers,
        priority: config.server_priority()?,
        cpu: config.cpu,
    })
}

fn start_server(config: &Config) -> Result<Server<Nanospin>> {
    let hw = Hardware::new(config.server.lock, Nanospin)
        .context("initializing hardware lock")?;
    Server::start(Channel::new(), Arc::new(hw), &server_config(config)?)
        .context("starting hardware server")
}

/// A thread driven by its own periodic timer.
struct Ticking<T> {
    name: &'static str,
    channel: Channel,
    timer: PeriodicTimer,
    handle: JoinHandle<T>,
}

impl<T: Send + 'static> Ticking<T> {
    fn spawn<F>(
        name: &'static str,
        prio: Priority,
        cpu: Option<usize>,
        tick: u32,
        start_delay_ms: u64,
        interval_ms: u64,
        body: F,
    ) -> Result<Self>
    where
        F: FnOnce(&Channel) -> T + Send + 'static,
    {
        let channel = Channel::new();
        let timer = PeriodicTimer::start(
            channel.notifier(),
            tick,
            Duration::from_millis(start_delay_ms),
            Repeat::AfterDeadline(Duration::from_millis(interval_ms)),
            Some(prio),
        )
        .with_context(|| format!("starting {name} timer"))?;
        let handle = {
            let channel = channel.clone();
            sched::spawn_with_priority(name, prio, cpu, move || body(&channel))
                .with_context(|| format!("spawning {name}"))?
        };
        Ok(Self {
            name,
            channel,
            timer,
            handle,
        })
    }

    /// Stops the ticks, lets the current one finish and collects the result.
    fn stop(self) -> Result<T> {
        drop(self.timer);
        self.channel.shutdown(1);
        self.handle
            .join()
            .map_err(|_| anyhow!("{} panicked", self.name))
    }
}

/// Runs every participant for the configured duration, or until something
/// arrives on `stop`.
pub fn run(config: &Config, stop: &Receiver<()>) -> Result<RunReport> {
    config.validate()?;
    let lock = config.server.lock;
    let server = start_server(config)?;
    log::info!("hardware guarded by {lock:?}");

    let h = &config.high_prio_client;
    let high = {
        let conn = server.connect();
        let deadline_ns = config.deadline_ns()?;
        let trigger = h.trigger;
        Ticking::spawn(
            "high-prio-client",
            config.high_priority()?,
            config.cpu,
            high_prio_client::TICK,
            h.start_delay_ms,
            h.interval_ms,
            move |channel| -> Result<Report, HwError> {
                let hw = HwServer::attach(conn)?;
                let mut client = HighPrioClient::new(hw, deadline_ns, trigger);
                client.run(channel).map(|()| client.report())
            },
        )?
    };

    let l = &config.low_prio_client;
    let low = {
        let conn = server.connect();
        Ticking::spawn(
            "low-prio-client",
            config.low_priority()?,
            config.cpu,
            low_prio_client::TICK,
            l.start_delay_ms,
            l.interval_ms,
            move |channel| -> Result<u64, HwError> {
                let mut client = LowPrioClient::new(HwServer::attach(conn)?);
                client.run(channel).map(|()| client.completed())
            },
        )?
    };

    let b = &config.cpu_burner;
    let burner = if b.disabled {
        None
    } else {
        let burn_us = b.burn_us;
        Some(Ticking::spawn(
            "cpu-burner",
            config.burner_priority()?,
            config.cpu,
            cpu_burner::TICK,
            b.start_delay_ms,
            b.interval_ms,
            move |channel| {
                let mut burner = CpuBurner::new(burn_us);
                burner.run(channel);
                burner.bursts()
            },
        )?)
    };

    let deadline = Instant::now() + config.duration();
    match stop.recv_deadline(deadline) {
        Ok(()) => log::warn!("stopping early"),
        Err(RecvTimeoutError::Timeout) => {}
        Err(RecvTimeoutError::Disconnected) => {
            std::thread::sleep(
                deadline.saturating_duration_since(Instant::now()),
            )
        }
    }

    let bursts = burner.map(Ticking::stop).transpose()?.unwrap_or(0);
    let low = low.stop()?;
    let high = high.stop()?;
    server.stop();

    Ok(RunReport {
        lock,
        high: high.context("high-prio-client")?,
        low_completed: low.context("low-prio-client")?,
        bursts,
        realtime: !sched::realtime_unavailable(),
    })
}

/// Outcome of [`probe`].
#[derive(Clone, Debug)]
pub struct ProbeReport {
    pub lock: LockKind,
    pub warmup: Vec<Verdict>,
    /// Deadlines made in a row going into the contended operation.
    pub streak_before: u32,
    pub contended: Verdict,
    /// The first operation once the hardware is free again.
    pub recovery: Verdict,
}

/// Forces one inversion on purpose. Times a few uncontended high-priority
/// operations, then ties the hardware up with one long low-priority request
/// and times another operation while it is held.
pub fn probe(config: &Config) -> Result<ProbeReport> {
    config.validate()?;
    if config.server.workers < 2 {
        bail!("the probe needs at least two workers");
    }
    let lock = config.server.lock;
    let server = start_server(config)?;

    let high_hw = HwServer::attach(server.connect())
        .context("connecting high-prio-client")?;
    let low_hw = HwServer::attach(server.connect())
        .context("connecting low-prio-client")?;
    let deadline_ns = config.deadline_ns()?;
    let trigger = config.high_prio_client.trigger;
    let low_priority = config.low_priority()?;
    let cpu = config.cpu;
    let warmup_ticks = config.probe.warmup_ticks;
    let hold_us = config.probe.hold_us;
    let head_start = Duration::from_micros(u64::from(hold_us) / 4);

    let high = sched::spawn_with_priority(
        "high-prio-client",
        config.high_priority()?,
        cpu,
        move || -> Result<ProbeReport> {
            let mut client = HighPrioClient::new(high_hw, deadline_ns, trigger);
            let warmup = (0..warmup_ticks)
                .map(|_| client.on_tick())
                .collect::<Result<Vec<_>, _>>()?;
            let streak_before = client.monitor().streak();

            log::info!("tying up the hardware for {hold_us} us");
            let holder = sched::spawn_with_priority(
                "low-prio-client",
                low_priority,
                cpu,
                move || low_hw.get_data(hold_us),
            )?;
            std::thread::sleep(head_start);
            let contended = client.on_tick()?;
            holder
                .join()
                .map_err(|_| anyhow!("low-prio-client panicked"))??;

            let recovery = client.on_tick()?;
            Ok(ProbeReport {
                lock,
                warmup,
                streak_before,
                contended,
                recovery,
            })
        },
    )
    .context("spawning high-prio-client")?;

    let report = high
        .join()
        .map_err(|_| anyhow!("high-prio-client panicked"))?;
    server.stop();
    report
}
