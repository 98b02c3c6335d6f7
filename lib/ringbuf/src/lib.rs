// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Ring buffers for tracing servers and clients.
//!
//! This contains an implementation of a static ring buffer designed to be
//! used to instrument arbitrary contexts, including hot loops that must not
//! block on I/O. Entries are recorded in memory and can be dumped to the log
//! on demand -- on shutdown, or the moment something interesting happens,
//! such as a missed deadline.
//!
//! ## Constraints
//!
//! The type in the ring buffer must implement `Copy`, `PartialEq` and
//! `Debug`. Counted ring buffers additionally need [`Count`], which any type
//! convertible into a `&'static str` gets for free (derive
//! `strum::IntoStaticStr` on your event `enum`).
//!
//! If you use the variants of the `ringbuf!` macro that leave the name of the
//! data structure implicit, you can only have one per module. (You can lift
//! this constraint by providing a name.)
//!
//! ## Creating a ring buffer
//!
//! ```
//! # use ringbuf::*;
//! ringbuf!(u32, 16, 0);
//!
//! ringbuf_entry!(0xf00d);
//! ```
//!
//! You can also provide a name for the ring buffer, to distinguish between
//! them if you have more than one:
//!
//! ```
//! # use ringbuf::*;
//! ringbuf!(MY_RINGBUF, u32, 16, 0);
//!
//! ringbuf_entry!(MY_RINGBUF, 7);
//! ```
//!
//! ## Freezing
//!
//! [`StaticRingbuf::freeze`] stops a ring buffer from accepting entries, so
//! that the history leading up to an event can be captured without being
//! overwritten by what comes after.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Declares a ringbuffer in the current module or context.
///
/// `ringbuf!(NAME, Type, N, expr)` makes a ringbuffer named `NAME`,
/// containing entries of type `Type`, with room for `N` such entries, all of
/// which are initialized to `expr`.
///
/// The resulting ringbuffer will be static, so `NAME` should be uppercase.
/// The actual type of `NAME` will be `StaticRingbuf<T, N>`.
///
/// To support the common case of having one quickly-installed ringbuffer per
/// module, if you omit the name, it will default to `__RINGBUF`.
#[macro_export]
macro_rules! ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        static $name: $crate::StaticRingbuf<$t, $n> =
            $crate::StaticRingbuf::new(stringify!($name), $init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Declares a ringbuffer that also keeps a count of every kind of event
/// recorded into it.
///
/// The ring buffer itself is the same as one made by [`ringbuf!`]; the
/// difference is that events should be recorded with [`count_entry!`], which
/// bumps the per-variant counter before inserting the entry. Counters are
/// never overwritten, so they survive long after the entries themselves have
/// been lapped.
#[macro_export]
macro_rules! counted_ringbuf {
    ($name:ident, $t:ty, $n:expr, $init:expr) => {
        $crate::ringbuf!($name, $t, $n, $init);
    };
    ($t:ty, $n:expr, $init:expr) => {
        $crate::counted_ringbuf!(__RINGBUF, $t, $n, $init);
    };
}

/// Inserts data into a named ringbuffer (which should have been declared with
/// the `ringbuf!` macro).
///
/// `ringbuf_entry!(NAME, expr)` will insert `expr` into the ringbuffer called
/// `NAME`.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[macro_export]
macro_rules! ringbuf_entry {
    ($buf:expr, $payload:expr) => {{
        // Evaluate both buf and payload, without letting them access each
        // other, by evaluating them in a tuple where each cannot
        // accidentally use the other's binding.
        let (p, buf) = ($payload, &$buf);
        $crate::StaticRingbuf::entry(buf, line!() as u16, p);
    }};
    ($payload:expr) => {
        $crate::ringbuf_entry!(__RINGBUF, $payload);
    };
}

/// Inserts data into a named, counted ringbuffer (which should have been
/// declared with the [`counted_ringbuf!`] macro), counting the event.
///
/// If you declared your ringbuffer without a name, you can also use this
/// without a name, and it will default to `__RINGBUF`.
#[macro_export]
macro_rules! count_entry {
    ($buf:expr, $event:expr) => {{
        let (e, buf) = ($event, &$buf);
        $crate::StaticRingbuf::count_entry(buf, line!() as u16, e);
    }};
    ($event:expr) => {
        $crate::count_entry!(__RINGBUF, $event);
    };
}

///
/// A countable ringbuf event.
///
/// Counters are keyed by the label each event reports; variants that carry
/// data should report one label regardless of the data.
///
pub trait Count {
    fn label(&self) -> &'static str;
}

impl<T> Count for T
where
    T: Copy + Into<&'static str>,
{
    fn label(&self) -> &'static str {
        (*self).into()
    }
}

///
/// The structure of a single [`Ringbuf`] entry, carrying a payload of
/// arbitrary type.  When a ring buffer entry is generated with an identical
/// payload to the most recent entry (in terms of both `line` and `payload`),
/// `count` will be incremented rather than generating a new entry.
///
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct RingbufEntry<T: Copy + PartialEq> {
    pub line: u16,
    pub generation: u16,
    pub count: u32,
    pub payload: T,
}

///
/// A ring buffer of parametrized type and size.  In practice, instantiating
/// this directly is strange -- see the [`ringbuf!`] macro.
///
#[derive(Debug)]
pub struct Ringbuf<T: Copy + PartialEq, const N: usize> {
    pub last: Option<usize>,
    pub buffer: [RingbufEntry<T>; N],
}

impl<T: Copy + PartialEq, const N: usize> Ringbuf<T, { N }> {
    pub const fn new(init: T) -> Self {
        Self {
            last: None,
            buffer: [RingbufEntry {
                line: 0,
                generation: 0,
                count: 0,
                payload: init,
            }; N],
        }
    }

    pub fn entry(&mut self, line: u16, payload: T) {
        // If this is the first time this ringbuf has been poked, last will be
        // None. In this specific case we want to make sure we don't add to
        // the count of an existing entry, and also that we deposit the first
        // entry in slot 0. Treating None as an out-of-range value does both.
        let last = self.last.unwrap_or(usize::MAX);

        if let Some(ent) = self.buffer.get_mut(last) {
            if ent.line == line && ent.payload == payload {
                // Only reuse this entry if we don't overflow the count.
                if let Some(new_count) = ent.count.checked_add(1) {
                    ent.count = new_count;
                    return;
                }
            }
        }

        // Either we were unable to reuse the entry, or the last index was out
        // of range. Advance last and wrap if required; wrapping_add turns
        // usize::MAX into 0 for the starting condition.
        let ndx = {
            let last_plus_1 = last.wrapping_add(1);
            if last_plus_1 >= self.buffer.len() {
                0
            } else {
                last_plus_1
            }
        };

        let Some(ent) = self.buffer.get_mut(ndx) else {
            // Zero-sized ring buffer; nothing to record into.
            return;
        };
        *ent = RingbufEntry {
            line,
            payload,
            count: 1,
            generation: ent.generation.wrapping_add(1),
        };

        self.last = Some(ndx);
    }

    /// Returns the recorded entries, oldest first.
    pub fn entries(&self) -> Vec<RingbufEntry<T>> {
        let Some(last) = self.last else {
            return Vec::new();
        };
        let start = last + 1;
        self.buffer[start..]
            .iter()
            .chain(self.buffer[..start].iter())
            .filter(|e| e.generation != 0)
            .copied()
            .collect()
    }
}

struct Inner<T: Copy + PartialEq, const N: usize> {
    ring: Ringbuf<T, N>,
    frozen: bool,
    counts: Vec<(&'static str, u64)>,
}

/// A ring buffer that can live in a `static` and be shared between threads.
pub struct StaticRingbuf<T: Copy + PartialEq, const N: usize> {
    name: &'static str,
    inner: Mutex<Inner<T, N>>,
}

impl<T: Copy + PartialEq, const N: usize> StaticRingbuf<T, N> {
    pub const fn new(name: &'static str, init: T) -> Self {
        Self {
            name,
            inner: Mutex::new(Inner {
                ring: Ringbuf::new(init),
                frozen: false,
                counts: Vec::new(),
            }),
        }
    }

    // Recording must keep working even if some other thread panicked while
    // holding the lock; the ring itself is always in a consistent state.
    fn lock(&self) -> MutexGuard<'_, Inner<T, N>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn entry(&self, line: u16, payload: T) {
        let mut inner = self.lock();
        if !inner.frozen {
            inner.ring.entry(line, payload);
        }
    }

    /// Records `event` and bumps its counter. Counting continues while the
    /// ring buffer is frozen.
    pub fn count_entry(&self, line: u16, event: T)
    where
        T: Count,
    {
        let mut inner = self.lock();
        let label = event.label();
        match inner.counts.iter_mut().find(|(l, _)| *l == label) {
            Some((_, n)) => *n = n.saturating_add(1),
            None => inner.counts.push((label, 1)),
        }
        if !inner.frozen {
            inner.ring.entry(line, event);
        }
    }

    /// Stops recording new entries. Returns `true` if this call did the
    /// freezing, `false` if the ring buffer was already frozen.
    pub fn freeze(&self) -> bool {
        !std::mem::replace(&mut self.lock().frozen, true)
    }

    pub fn thaw(&self) {
        self.lock().frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.lock().frozen
    }

    /// Returns the recorded entries, oldest first.
    pub fn snapshot(&self) -> Vec<RingbufEntry<T>> {
        self.lock().ring.entries()
    }

    /// Returns the value of the counter for events labeled `label`.
    pub fn count_of(&self, label: &str) -> u64 {
        self.lock()
            .counts
            .iter()
            .find(|(l, _)| *l == label)
            .map(|&(_, n)| n)
            .unwrap_or(0)
    }

    /// Returns all event counters, in the order their events first occurred.
    pub fn counts(&self) -> Vec<(&'static str, u64)> {
        self.lock().counts.clone()
    }
}

impl<T: Copy + PartialEq + core::fmt::Debug, const N: usize>
    StaticRingbuf<T, N>
{
    /// Writes the counters and every recorded entry to the log at `level`.
    pub fn dump(&self, level: log::Level) {
        let entries = self.snapshot();
        let counts = self.counts();
        let state = if self.is_frozen() { "frozen" } else { "live" };
        log::log!(
            level,
            "ring buffer {} ({state}): {} entries",
            self.name,
            entries.len()
        );
        for (label, n) in counts {
            log::log!(level, "  {label:>24} {n}");
        }
        log::log!(level, "  {:>5} {:>5} {:>8} PAYLOAD", "LINE", "GEN", "COUNT");
        for e in entries {
            log::log!(
                level,
                "  {:>5} {:>5} {:>8} {:?}",
                e.line,
                e.generation,
                e.count,
                e.payload
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
    enum Trace {
        None,
        Tick(u32),
        Miss,
    }

    #[test]
    fn repeated_entries_are_coalesced() {
        let mut r = Ringbuf::<u32, 4>::new(0);
        r.entry(10, 7);
        r.entry(10, 7);
        r.entry(10, 7);
        let e = r.entries();
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].count, 3);

        // Same payload from a different line is a new entry.
        r.entry(11, 7);
        assert_eq!(r.entries().len(), 2);
    }

    #[test]
    fn wraps_and_reports_oldest_first() {
        let mut r = Ringbuf::<u32, 3>::new(0);
        for i in 1..=5 {
            r.entry(1, i);
        }
        let payloads: Vec<u32> =
            r.entries().iter().map(|e| e.payload).collect();
        assert_eq!(payloads, [3, 4, 5]);
        // Slot 0 has been written twice now.
        assert!(r.entries().iter().any(|e| e.generation == 2));
    }

    #[test]
    fn counted_entries_survive_freezing() {
        counted_ringbuf!(TEST_RINGBUF, Trace, 8, Trace::None);

        count_entry!(TEST_RINGBUF, Trace::Tick(1));
        count_entry!(TEST_RINGBUF, Trace::Tick(2));
        assert!(TEST_RINGBUF.freeze());
        assert!(!TEST_RINGBUF.freeze());
        count_entry!(TEST_RINGBUF, Trace::Miss);

        assert!(TEST_RINGBUF.is_frozen());
        assert_eq!(TEST_RINGBUF.count_of("Tick"), 2);
        assert_eq!(TEST_RINGBUF.count_of("Miss"), 1);
        assert_eq!(TEST_RINGBUF.counts(), [("Tick", 2), ("Miss", 1)]);
        // The miss was counted but not recorded.
        let recorded: Vec<Trace> =
            TEST_RINGBUF.snapshot().iter().map(|e| e.payload).collect();
        assert_eq!(recorded, [Trace::Tick(1), Trace::Tick(2)]);

        TEST_RINGBUF.thaw();
        assert!(!TEST_RINGBUF.is_frozen());
        ringbuf_entry!(TEST_RINGBUF, Trace::Miss);
        assert_eq!(TEST_RINGBUF.snapshot().len(), 3);
    }
}
