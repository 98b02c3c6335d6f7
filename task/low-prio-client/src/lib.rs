// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Low-priority periodic client: one `GetData` per tick, best effort.

use hw_server_api::{HwError, HwServer, WorkCycle};
use ringbuf::{count_entry, counted_ringbuf};
use userlib::*;

/// Transfer lengths, in microseconds, requested in turn.
pub static WORK: [u32; 10] =
    [500, 750, 1000, 350, 200, 1100, 700, 150, 450, 1050];

/// Notification bit the tick timer posts.
pub const TICK: u32 = 1 << 0;

#[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
enum Trace {
    None,
    GetData(u32),
}

counted_ringbuf!(Trace, 16, Trace::None);

pub fn dump_trace() {
    __RINGBUF.dump(log::Level::Warn);
}

pub struct LowPrioClient<T> {
    hw: HwServer<T>,
    work: WorkCycle,
    completed: u64,
}

impl<T: Transport> LowPrioClient<T> {
    pub fn new(hw: HwServer<T>) -> Self {
        Self {
            hw,
            work: WorkCycle::new(&WORK),
            completed: 0,
        }
    }

    /// Number of requests answered so far.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    /// Sends the next `GetData`. Returns its length.
    pub fn on_tick(&mut self) -> Result<u32, HwError> {
        let bytes_needed = self.work.next().unwrap_or_default();
        count_entry!(Trace::GetData(bytes_needed));
        self.hw.get_data(bytes_needed)?;
        self.completed += 1;
        log::debug!("read {bytes_needed}");
        Ok(bytes_needed)
    }

    /// Runs one request per tick until `channel` shuts down.
    pub fn run(&mut self, channel: &Channel) -> Result<(), HwError> {
        while let Ok(bits) = hl::recv_notification(channel) {
            if bits & TICK != 0 {
                self.on_tick()?;
            }
        }
        Ok(())
    }
}
