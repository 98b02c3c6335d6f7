// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Hardware server: a worker pool serving `SendData` and `GetData` requests
//! against a simulated hardware unit.

pub mod hardware;
pub mod server;

pub use hardware::{
    Hardware, HwSnapshot, LockError, LockKind, Latency, Nanospin, OpKind,
    VirtualLatency,
};
pub use server::{dump_trace, handle_one, worker_loop, Server, ServerConfig};
