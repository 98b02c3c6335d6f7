// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use cpu_burner::{CpuBurner, DEFAULT_BURN_US, TICK};
use userlib::time::{PeriodicTimer, Repeat};
use userlib::{sched, Channel, Priority};

/// Periodic CPU load at a middling priority
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Priority to burn at
    #[arg(
        short,
        long,
        default_value_t = 15,
        value_parser = clap::value_parser!(u8).range(1..=99)
    )]
    priority: u8,

    /// Microseconds of CPU to burn per tick
    #[arg(long, default_value_t = DEFAULT_BURN_US)]
    burn: u32,

    /// Milliseconds between bursts
    #[arg(long, default_value_t = 13)]
    interval: u64,

    /// Milliseconds before the first burst
    #[arg(long, default_value_t = 2000)]
    start_delay: u64,

    /// Pin to this CPU
    #[arg(long)]
    cpu: Option<usize>,

    /// More output; repeat for more still
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    userlib::init_logging(args.verbose);
    let priority = Priority(args.priority);

    if let Some(cpu) = args.cpu {
        sched::pin_to_cpu(cpu).context("pinning to CPU")?;
    }
    sched::set_current_priority(priority).context("setting priority")?;

    let channel = Channel::new();
    let _timer = PeriodicTimer::start(
        channel.notifier(),
        TICK,
        Duration::from_millis(args.start_delay),
        Repeat::AfterDeadline(Duration::from_millis(args.interval)),
        Some(priority),
    )
    .context("starting tick timer")?;
    {
        let channel = channel.clone();
        ctrlc::set_handler(move || channel.shutdown(1))
            .context("installing signal handler")?;
    }

    CpuBurner::new(args.burn).run(&channel);
    Ok(())
}
