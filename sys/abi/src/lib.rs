// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! IPC ABI definitions, shared between servers, clients and the runtime.
//!
//! Everything in here is plain data: identifiers, priorities, response codes
//! and the byte layout of the frames that cross a socket when a client talks
//! to a server registered with the name service.

use static_assertions::const_assert_eq;
use zerocopy::byteorder::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Largest payload, in bytes, that a single message or reply may carry.
pub const MAX_MESSAGE_LEN: usize = 256;

/// Operation code reserved for the connection handshake. Every server must
/// answer it with `SUCCESS` and no payload.
pub const CONNECT_OPERATION: u16 = 0;

/// Response code meaning "it worked."
pub const SUCCESS: u32 = 0;

/// Names the sender of a received message.
///
/// Clients are numbered by the channel they connect to, starting at zero, in
/// connection order. The all-ones value is reserved for the "virtual kernel
/// task" that delivers notifications.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct ClientId(pub u16);

impl ClientId {
    /// The all-ones `ClientId` is reserved to represent notifications.
    pub const KERNEL: Self = Self(!0);
}

/// Indicates the OS scheduling priority of a thread.
///
/// These map directly onto `SCHED_FIFO` priorities: 1 through 99, where a
/// numerically *higher* priority is more important.
///
/// Note that this type *deliberately* does not implement `PartialOrd`/`Ord`,
/// to keep us from confusing ourselves on whether `>` means "numerically
/// greater" or "more important."
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
#[repr(transparent)]
pub struct Priority(pub u8);

impl Priority {
    pub const MIN: Self = Self(1);
    pub const MAX: Self = Self(99);

    /// Checks if `self` is strictly more important than `other`.
    pub fn is_more_important_than(self, other: Self) -> bool {
        self.0 > other.0
    }

    /// Returns `true` if this priority can be handed to the scheduler.
    pub fn is_valid(self) -> bool {
        (Self::MIN.0..=Self::MAX.0).contains(&self.0)
    }
}

impl core::fmt::Display for Priority {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Non-success response codes understood by every server.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum ResponseCode {
    /// The operation code is not one the server implements.
    NotImplemented = 1,
    /// The payload is the wrong size for the operation, or the reply buffer
    /// is too small for the response.
    BadMessage = 2,
    /// The server's handler returned without replying. This is a server bug;
    /// the runtime sends this so that the client does not wait forever.
    ServerDefect = 3,
}

impl From<ResponseCode> for u32 {
    fn from(rc: ResponseCode) -> Self {
        rc as u32
    }
}

impl TryFrom<u32> for ResponseCode {
    type Error = u32;

    fn try_from(x: u32) -> Result<Self, Self::Error> {
        match x {
            1 => Ok(ResponseCode::NotImplemented),
            2 => Ok(ResponseCode::BadMessage),
            3 => Ok(ResponseCode::ServerDefect),
            _ => Err(x),
        }
    }
}

/// Header preceding every request written to a named server's socket.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct RequestHeader {
    pub operation: U16,
    /// Sender's priority, or 0 if the sender does not run at a real-time
    /// priority.
    pub priority: u8,
    pub reserved: u8,
    /// Number of payload bytes that follow the header.
    pub len: U32,
}

impl RequestHeader {
    pub fn new(operation: u16, priority: Option<Priority>, len: usize) -> Self {
        Self {
            operation: U16::new(operation),
            priority: priority.map(|p| p.0).unwrap_or(0),
            reserved: 0,
            len: U32::new(len as u32),
        }
    }

    pub fn priority(&self) -> Option<Priority> {
        Some(Priority(self.priority)).filter(|p| p.is_valid())
    }
}

/// Header preceding every reply written back to a client's socket.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct ReplyHeader {
    pub code: U32,
    pub len: U32,
}

impl ReplyHeader {
    pub fn new(code: u32, len: usize) -> Self {
        Self {
            code: U32::new(code),
            len: U32::new(len as u32),
        }
    }
}

const_assert_eq!(core::mem::size_of::<RequestHeader>(), 8);
const_assert_eq!(core::mem::size_of::<ReplyHeader>(), 8);

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn response_codes_round_trip_through_u32() {
        for rc in [
            ResponseCode::NotImplemented,
            ResponseCode::BadMessage,
            ResponseCode::ServerDefect,
        ] {
            assert_eq!(ResponseCode::try_from(u32::from(rc)), Ok(rc));
        }
        assert_eq!(ResponseCode::try_from(SUCCESS), Err(SUCCESS));
    }

    #[test]
    fn priority_zero_means_none() {
        let h = RequestHeader::new(1, None, 4);
        assert_eq!(h.priority, 0);
        assert_eq!(h.priority(), None);

        let h = RequestHeader::new(1, Some(Priority(40)), 4);
        assert_eq!(h.priority(), Some(Priority(40)));
    }

    #[test]
    fn higher_number_is_more_important() {
        assert!(Priority(40).is_more_important_than(Priority(15)));
        assert!(!Priority(11).is_more_important_than(Priority(11)));
    }

    proptest! {
        #[test]
        fn request_header_layout_is_little_endian(
            op in any::<u16>(),
            prio in 0u8..=99,
            len in 0usize..=MAX_MESSAGE_LEN,
        ) {
            let h = RequestHeader::new(op, Some(Priority(prio)), len);
            let bytes = h.as_bytes();
            prop_assert_eq!(&bytes[0..2], &op.to_le_bytes()[..]);
            prop_assert_eq!(bytes[2], prio);
            prop_assert_eq!(&bytes[4..8], &(len as u32).to_le_bytes()[..]);

            let back = RequestHeader::read_from_bytes(bytes).unwrap();
            prop_assert_eq!(back.operation.get(), op);
            prop_assert_eq!(back.len.get() as usize, len);
        }
    }
}
