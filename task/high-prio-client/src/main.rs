// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use high_prio_client::{HighPrioClient, TICK};
use hw_server_api::{HwServer, HW_SERVER_NAME};
use userlib::time::{PeriodicTimer, Repeat};
use userlib::{name, sched, Channel, Priority};

/// High-priority periodic client of the hardware server, checking every
/// round trip against a deadline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Deadline in milliseconds (fractions allowed, e.g. 0.7)
    #[arg(
        short,
        long = "deadline",
        value_parser = high_prio_client::parse_deadline_ms,
        default_value = "1",
        value_name = "MS"
    )]
    deadline_ns: u64,

    /// Priority to run (and have ticks delivered) at
    #[arg(
        short,
        long,
        default_value_t = 40,
        value_parser = clap::value_parser!(u8).range(1..=99)
    )]
    priority: u8,

    /// Stop and dump the trace on the first missed deadline
    #[arg(short, long)]
    trigger: bool,

    /// More output; repeat for more still
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Milliseconds between operations
    #[arg(long, default_value_t = 7)]
    interval: u64,

    /// Milliseconds before the first operation
    #[arg(long, default_value_t = 1000)]
    start_delay: u64,

    /// Pin to this CPU
    #[arg(long)]
    cpu: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    userlib::init_logging(args.verbose);
    let priority = Priority(args.priority);
    log::info!("priority: {priority}, verbosity level: {}", args.verbose);

    if let Some(cpu) = args.cpu {
        sched::pin_to_cpu(cpu).context("pinning to CPU")?;
    }
    sched::set_current_priority(priority).context("setting priority")?;

    let conn =
        name::name_open_with_retry(HW_SERVER_NAME, Duration::from_secs(1))
            .context("failed to find server")?;
    let hw = HwServer::attach(conn).context("connecting to server")?;

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

    let mut client = HighPrioClient::new(hw, args.deadline_ns, args.trigger);
    let result = client.run(&channel);
    let r = client.report();
    log::warn!(
        "{} deadlines made, {} missed, longest streak {}, worst {} ns",
        r.successes,
        r.misses,
        r.longest_streak,
        r.worst_ns
    );
    result.context("sending to hardware server")?;
    Ok(())
}
