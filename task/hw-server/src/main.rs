// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hw_server::{Hardware, LockKind, Nanospin, Server, ServerConfig};
use hw_server_api::HW_SERVER_NAME;
use userlib::{name, sched, Channel, Priority};

/// Multi-threaded server fronting a simulated hardware unit
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of worker threads
    #[arg(
        short = 't',
        long,
        default_value_t = 4,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    threads: u16,

    /// More output; repeat for more still
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Priority workers run at between requests
    #[arg(short, long, default_value_t = 10)]
    priority: u8,

    /// Guard the hardware with a priority-inheriting mutex instead of a
    /// semaphore
    #[arg(long)]
    prio_fix: bool,

    /// Pin the server to this CPU
    #[arg(long)]
    cpu: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    userlib::init_logging(args.verbose);

    let priority = Priority(args.priority);
    if !priority.is_valid() {
        bail!(
            "priority must be between {} and {}",
            Priority::MIN,
            Priority::MAX
        );
    }
    if let Some(cpu) = args.cpu {
        // Threads spawned from here on inherit the affinity.
        sched::pin_to_cpu(cpu).context("pinning to CPU")?;
    }

    let kind = if args.prio_fix {
        LockKind::InheritingMutex
    } else {
        LockKind::Semaphore
    };
    let hw = Arc::new(
        Hardware::new(kind, Nanospin).context("initializing hardware lock")?,
    );
    log::info!("hardware guarded by {kind:?}");

    let channel = Channel::new();
    let attachment = name::name_attach(HW_SERVER_NAME, &channel)
        .context("name_attach failed")?;

    let workers = usize::from(args.threads);
    {
        let channel = channel.clone();
        ctrlc::set_handler(move || {
            log::warn!("terminating");
            channel.shutdown(workers);
        })
        .context("installing signal handler")?;
    }

    if workers == 1 {
        sched::set_current_priority(priority).context("setting priority")?;
        hw_server::worker_loop(&channel, &hw);
    } else {
        let config = ServerConfig {
            workers,
            priority,
            cpu: None,
        };
        Server::start(channel, hw, &config)
            .context("starting workers")?
            .join();
    }

    hw_server::dump_trace();
    drop(attachment);
    Ok(())
}
