// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use hw_server::LockKind;
use inversion_demo::Config;

/// Runs the hardware server, both clients and the CPU burner in one process
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Scenario file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Milliseconds to run for, overriding the scenario
    #[arg(long)]
    duration: Option<u64>,

    /// Guard the hardware with a priority-inheriting mutex
    #[arg(long)]
    prio_fix: bool,

    /// Pin every thread to this CPU
    #[arg(long)]
    cpu: Option<usize>,

    /// Force a single contended operation instead of a timed run
    #[arg(long)]
    probe: bool,

    /// More output; repeat for more still
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    userlib::init_logging(args.verbose);

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(ms) = args.duration {
        config.duration_ms = ms;
    }
    if args.prio_fix {
        config.server.lock = LockKind::InheritingMutex;
    }
    if args.cpu.is_some() {
        config.cpu = args.cpu;
    }

    if args.probe {
        let r = inversion_demo::probe(&config)?;
        println!("hardware lock:  {:?}", r.lock);
        println!("warm-up streak: {}", r.streak_before);
        println!("contended:      {:?}", r.contended);
        println!("afterwards:     {:?}", r.recovery);
        return Ok(());
    }

    let (tx, rx) = crossbeam_channel::bounded(1);
    ctrlc::set_handler(move || {
        let _ = tx.try_send(());
    })
    .context("installing signal handler")?;

    let report = inversion_demo::run(&config, &rx)?;
    if report.high.misses > 0 {
        hw_server::dump_trace();
    }
    print!("{report}");
    Ok(())
}
