// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Mid-priority load: on every tick, keep the CPU busy for a while.
//!
//! The burner serves nobody; messages sent to it are refused.

use ringbuf::{count_entry, counted_ringbuf};
use userlib::*;

pub const DEFAULT_BURN_US: u32 = 2100;

/// Notification bit the tick timer posts.
pub const TICK: u32 = 1 << 0;

#[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
enum Trace {
    None,
    Burn(u32),
}

counted_ringbuf!(Trace, 8, Trace::None);

pub struct CpuBurner {
    burn_us: u32,
    bursts: u64,
}

impl CpuBurner {
    pub fn new(burn_us: u32) -> Self {
        Self { burn_us, bursts: 0 }
    }

    pub fn bursts(&self) -> u64 {
        self.bursts
    }

    /// Spins for the configured time.
    pub fn on_tick(&mut self) {
        count_entry!(Trace::Burn(self.burn_us));
        nanospin(u64::from(self.burn_us) * 1000);
        self.bursts += 1;
    }

    /// Burns once per tick until `channel` shuts down.
    pub fn run(&mut self, channel: &Channel) {
        while let Ok(bits) = hl::recv_notification(channel) {
            if bits & TICK != 0 {
                self.on_tick();
            }
        }
        log::info!("{} bursts", self.bursts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    #[test]
    fn burns_for_at_least_the_configured_time() {
        let mut b = CpuBurner::new(1500);
        let start = Instant::now();
        b.on_tick();
        assert!(start.elapsed() > Duration::from_micros(1500));
        assert_eq!(b.bursts(), 1);
    }

    #[test]
    fn refuses_messages_and_burns_on_ticks() {
        let ch = Channel::new();
        let conn = ch.connect();
        let sender = std::thread::spawn(move || {
            conn.send(1, &[], &mut []).map(|(rc, _)| rc)
        });
        while ch.queued() == 0 {
            std::thread::yield_now();
        }
        ch.notifier().post(TICK);
        ch.shutdown(1);

        let mut b = CpuBurner::new(10);
        b.run(&ch);
        assert_eq!(b.bursts(), 1);
        assert_eq!(
            sender.join().unwrap().unwrap(),
            u32::from(ResponseCode::NotImplemented)
        );
    }
}
