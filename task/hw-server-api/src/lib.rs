// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Client API for the hardware server.

use static_assertions::const_assert_eq;
use userlib::*;
use zerocopy::byteorder::little_endian::U32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Name the hardware server attaches as.
pub const HW_SERVER_NAME: &str = "HW_SERVER";

#[derive(Copy, Clone, Debug, Eq, PartialEq, FromPrimitive)]
pub enum Operation {
    Connect = 0,
    SendData = 1,
    GetData = 2,
}

const_assert_eq!(Operation::Connect as u16, CONNECT_OPERATION);

/// Write `oplength` microseconds' worth of data to the hardware.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct SendDataMsg {
    pub oplength: U32,
}

impl SendDataMsg {
    pub fn new(oplength_us: u32) -> Self {
        Self {
            oplength: U32::new(oplength_us),
        }
    }
}

impl hl::Call for SendDataMsg {
    const OP: u16 = Operation::SendData as u16;
    type Response = ();
    type Err = HwError;
}

/// Read data from the hardware; the transfer takes `bytes_needed`
/// microseconds.
#[derive(
    Copy, Clone, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
#[repr(C)]
pub struct GetDataMsg {
    pub bytes_needed: U32,
}

impl GetDataMsg {
    pub fn new(bytes_needed: u32) -> Self {
        Self {
            bytes_needed: U32::new(bytes_needed),
        }
    }
}

impl hl::Call for GetDataMsg {
    const OP: u16 = Operation::GetData as u16;
    type Response = ();
    type Err = HwError;
}

#[derive(Debug, thiserror::Error)]
pub enum HwError {
    #[error("operation not implemented by the server")]
    NotImplemented,
    #[error("server rejected a malformed request")]
    BadMessage,
    #[error("server dropped the request without replying")]
    ServerDefect,
    #[error("unexpected response code {0}")]
    Unknown(u32),
    #[error(transparent)]
    Send(#[from] SendError),
}

impl From<u32> for HwError {
    fn from(x: u32) -> Self {
        match ResponseCode::try_from(x) {
            Ok(ResponseCode::NotImplemented) => HwError::NotImplemented,
            Ok(ResponseCode::BadMessage) => HwError::BadMessage,
            Ok(ResponseCode::ServerDefect) => HwError::ServerDefect,
            Err(x) => HwError::Unknown(x),
        }
    }
}

/// A connection to the hardware server.
pub struct HwServer<T> {
    transport: T,
}

impl<T: Transport> HwServer<T> {
    /// Performs the connection handshake over `transport`.
    pub fn attach(transport: T) -> Result<Self, HwError> {
        let (rc, _) =
            transport.send(Operation::Connect as u16, &[], &mut [])?;
        if rc != SUCCESS {
            return Err(HwError::from(rc));
        }
        Ok(Self { transport })
    }

    /// Writes to the hardware, taking `oplength_us` microseconds.
    pub fn send_data(&self, oplength_us: u32) -> Result<(), HwError> {
        hl::send(&self.transport, &SendDataMsg::new(oplength_us))
    }

    /// Reads from the hardware, taking `bytes_needed` microseconds.
    pub fn get_data(&self, bytes_needed: u32) -> Result<(), HwError> {
        hl::send(&self.transport, &GetDataMsg::new(bytes_needed))
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

/// Endless round-robin over a fixed table of operation sizes.
#[derive(Clone, Debug)]
pub struct WorkCycle {
    table: &'static [u32],
    next: usize,
}

impl WorkCycle {
    pub const fn new(table: &'static [u32]) -> Self {
        Self { table, next: 0 }
    }
}

impl Iterator for WorkCycle {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        let v = *self.table.get(self.next)?;
        self.next = (self.next + 1) % self.table.len();
        Some(v)
    }
}
