// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! User application support library.
//!
//! This is the message-passing substrate that servers and clients are built
//! on: channels with synchronous send/receive/reply semantics, coalescing
//! notifications, a name service reachable from other processes, periodic
//! timers, a cycle clock and control over OS thread scheduling. It re-exports
//! the contents of the `abi` crate.
//!
//! # Shape of a server
//!
//! A server creates a [`Channel`], publishes it with [`name::name_attach`],
//! and then loops on [`hl::recv`] from as many threads as it likes. Each
//! received message comes with a [`hl::Caller`] that must be used to reply.
//!
//! # Shape of a client
//!
//! A client locates a server with [`name::name_open_with_retry`] (or, in the
//! same process, [`Channel::connect`]), then calls [`Transport::send`], which
//! blocks until the server replies. Periodic work is driven by a
//! [`time::PeriodicTimer`] posting notifications into the client's own
//! channel.

pub use abi::*;
pub use num_derive::FromPrimitive;
pub use num_traits::FromPrimitive;

pub mod hl;
pub mod ipc;
pub mod name;
pub mod sched;
pub mod time;

pub use ipc::{
    Channel, Incoming, LocalConnection, Notifier, Received, RecvError, Reply,
    SendError, Transport,
};
pub use time::{clock_cycles, cycles_to_ns, nanospin, CYCLES_PER_SEC};

/// Reports an unrecoverable failure and terminates the process.
///
/// The message names the process, the operation that failed and the
/// underlying error (for OS errors, this includes the error number).
pub fn error_out(
    task: &str,
    operation: &str,
    err: &dyn std::error::Error,
) -> ! {
    log::error!("{task}: {operation} failed: {err}");
    std::process::exit(1)
}

/// Installs the process-wide logger.
///
/// `verbosity` is the number of `-v` flags given: none logs warnings and
/// errors, then each `-v` adds `info`, `debug` and `trace`. `RUST_LOG`, if
/// set, takes precedence.
pub fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(level),
    )
    .format_timestamp_micros()
    .init();
}
