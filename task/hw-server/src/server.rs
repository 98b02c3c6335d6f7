// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Request dispatch and the worker pool.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use hw_server_api::{GetDataMsg, Operation, SendDataMsg};
use ringbuf::{count_entry, counted_ringbuf};
use userlib::*;

use crate::hardware::{Hardware, Latency, LockError};

#[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
enum Trace {
    None,
    Connect(u16),
    SendData { client: u16, oplength: u32 },
    GetData { client: u16, bytes_needed: u32 },
    BadMessage(u16),
    Pulse(u32),
}

counted_ringbuf!(Trace, 64, Trace::None);

/// Logs the server's event counters and most recent events.
pub fn dump_trace() {
    __RINGBUF.dump(log::Level::Warn);
}

/// Worker pool settings.
#[derive(Copy, Clone, Debug)]
pub struct ServerConfig {
    pub workers: usize,
    /// Priority workers return to between requests.
    pub priority: Priority,
    pub cpu: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            priority: Priority(10),
            cpu: None,
        }
    }
}

fn fatal(op: &str, e: LockError) -> ! {
    userlib::error_out("hw_server", op, &e)
}

/// Receives and handles one message or notification.
pub fn handle_one<L: Latency>(
    channel: &Channel,
    hw: &Hardware<L>,
) -> Result<(), RecvError> {
    log::trace!("waiting for a message");
    hl::recv(
        channel,
        hw,
        |_, bits| {
            count_entry!(Trace::Pulse(bits));
            log::info!("got a pulse: {bits:#x}");
        },
        |hw, op: Operation, msg| -> Result<(), ResponseCode> {
            let client = msg.sender().0;
            log::debug!("client {client}: {op:?}");
            match op {
                Operation::Connect => {
                    // Any payload is ignored.
                    count_entry!(Trace::Connect(client));
                    msg.caller::<()>().reply(());
                }
                Operation::SendData => {
                    let (m, caller) = msg
                        .fixed::<SendDataMsg, ()>()
                        .ok_or_else(|| {
                            count_entry!(Trace::BadMessage(client));
                            ResponseCode::BadMessage
                        })?;
                    let oplength = m.oplength.get();
                    count_entry!(Trace::SendData { client, oplength });
                    hw.hw_out(oplength)
                        .unwrap_or_else(|e| fatal("hw_out", e));
                    caller.reply(());
                }
                Operation::GetData => {
                    let (m, caller) = msg
                        .fixed::<GetDataMsg, ()>()
                        .ok_or_else(|| {
                            count_entry!(Trace::BadMessage(client));
                            ResponseCode::BadMessage
                        })?;
                    let bytes_needed = m.bytes_needed.get();
                    count_entry!(Trace::GetData {
                        client,
                        bytes_needed
                    });
                    hw.hw_in(bytes_needed)
                        .unwrap_or_else(|e| fatal("hw_in", e));
                    caller.reply(());
                }
            }
            Ok(())
        },
    )
}

/// Serves requests until the channel shuts down.
pub fn worker_loop<L: Latency>(channel: &Channel, hw: &Hardware<L>) {
    while handle_one(channel, hw).is_ok() {}
    log::debug!("worker exiting");
}

/// A running pool of workers draining one channel.
pub struct Server<L> {
    channel: Channel,
    hw: Arc<Hardware<L>>,
    workers: Vec<JoinHandle<()>>,
}

impl<L: Latency + 'static> Server<L> {
    /// Starts `config.workers` threads serving `channel`.
    pub fn start(
        channel: Channel,
        hw: Arc<Hardware<L>>,
        config: &ServerConfig,
    ) -> io::Result<Self> {
        let mut workers = Vec::with_capacity(config.workers);
        for i in 0..config.workers {
            let channel = channel.clone();
            let hw = hw.clone();
            workers.push(sched::spawn_with_priority(
                &format!("hw-worker-{i}"),
                config.priority,
                config.cpu,
                move || worker_loop(&channel, &hw),
            )?);
        }
        log::info!("started {} workers", workers.len());
        Ok(Self {
            channel,
            hw,
            workers,
        })
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn hardware(&self) -> &Arc<Hardware<L>> {
        &self.hw
    }

    /// Opens a same-process connection to the server.
    pub fn connect(&self) -> LocalConnection {
        self.channel.connect()
    }

    /// Blocks until every worker has exited.
    pub fn join(self) {
        for w in self.workers {
            if w.join().is_err() {
                log::error!("worker panicked");
            }
        }
    }

    /// Lets the workers finish what is queued, then stops them.
    pub fn stop(self) {
        self.channel.shutdown(self.workers.len());
        self.join();
    }
}
