// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channels: the raw send/receive/reply layer.
//!
//! A `Channel` is a many-to-many queue of requests. Any number of threads may
//! receive from it; each request is delivered to exactly one of them, in no
//! particular order across receivers. Requests from one connection are
//! queued in the order they were sent, but since a sender blocks until it is
//! answered, a connection never has more than one request in flight anyway.
//!
//! Notifications are delivered through the same queue as single wake tokens
//! carrying a bitmask. Posting a bit that is already pending does not queue
//! another token, so a slow receiver sees one notification with the union of
//! everything posted since it last looked.

use std::sync::atomic::{AtomicU16, AtomicU32, Ordering};
use std::sync::Arc;

use abi::{ClientId, Priority, MAX_MESSAGE_LEN};
use crossbeam_channel::{Receiver, Sender};

use crate::sched;

/// A response to a request: a response code and (possibly empty) payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reply {
    pub code: u32,
    pub payload: Vec<u8>,
}

/// A request as it sits in a channel.
#[derive(Debug)]
pub struct Incoming {
    pub sender: ClientId,
    pub operation: u16,
    /// Priority the sender was running at when it sent the request, if it
    /// runs at a real-time priority at all.
    pub priority: Option<Priority>,
    pub payload: Vec<u8>,
    /// Largest reply payload the sender is prepared to accept.
    pub response_capacity: usize,
    pub reply: Sender<Reply>,
}

#[derive(Debug)]
enum Envelope {
    Message(Incoming),
    Notification,
    Shutdown,
}

/// What a receiver gets out of [`Channel::recv`].
#[derive(Debug)]
pub enum Received {
    Message(Incoming),
    /// One or more notifications; a bit is set for each one pending.
    Notification(u32),
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("server has gone away")]
    ServerGone,
    #[error("message of {0} bytes exceeds the {MAX_MESSAGE_LEN} byte limit")]
    MessageTooLarge(usize),
    #[error("malformed reply: {0}")]
    Protocol(&'static str),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RecvError {
    #[error("channel is shutting down")]
    Shutdown,
}

/// Anything that can carry a request to a server and bring back its reply.
pub trait Transport {
    /// Sends `outgoing` as operation `operation` and blocks until the server
    /// replies. The reply payload is written to the front of `incoming`;
    /// returns the response code and the number of bytes written.
    fn send(
        &self,
        operation: u16,
        outgoing: &[u8],
        incoming: &mut [u8],
    ) -> Result<(u32, usize), SendError>;
}

/// The receiving end of a server, cheaply cloneable.
#[derive(Clone)]
pub struct Channel {
    tx: Sender<Envelope>,
    rx: Receiver<Envelope>,
    pending: Arc<AtomicU32>,
    next_client: Arc<AtomicU16>,
}

impl Default for Channel {
    fn default() -> Self {
        Self::new()
    }
}

impl Channel {
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            tx,
            rx,
            pending: Arc::new(AtomicU32::new(0)),
            next_client: Arc::new(AtomicU16::new(0)),
        }
    }

    /// Opens a new connection to this channel, with a fresh `ClientId`.
    pub fn connect(&self) -> LocalConnection {
        let mut id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        if id == ClientId::KERNEL {
            // Wrapped; that one is taken.
            id = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        }
        LocalConnection {
            tx: self.tx.clone(),
            id,
        }
    }

    /// Returns a handle that can post notifications to this channel.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            tx: self.tx.clone(),
            pending: self.pending.clone(),
        }
    }

    /// Blocks until a message or notification arrives.
    pub fn recv(&self) -> Result<Received, RecvError> {
        loop {
            match self.rx.recv() {
                Ok(Envelope::Message(m)) => return Ok(Received::Message(m)),
                Ok(Envelope::Notification) => {
                    // Another receiver may already have collected the bits
                    // this token was posted for.
                    let bits = self.pending.swap(0, Ordering::AcqRel);
                    if bits != 0 {
                        return Ok(Received::Notification(bits));
                    }
                }
                Ok(Envelope::Shutdown) | Err(_) => {
                    return Err(RecvError::Shutdown)
                }
            }
        }
    }

    /// Makes the next `receivers` calls to `recv` return
    /// `RecvError::Shutdown`. Requests already queued are delivered first.
    pub fn shutdown(&self, receivers: usize) {
        for _ in 0..receivers {
            // We hold a receiver ourselves, so this cannot fail.
            let _ = self.tx.send(Envelope::Shutdown);
        }
    }

    /// Number of envelopes waiting to be received.
    pub fn queued(&self) -> usize {
        self.rx.len()
    }
}

/// Posts notifications into a channel.
#[derive(Clone)]
pub struct Notifier {
    tx: Sender<Envelope>,
    pending: Arc<AtomicU32>,
}

impl Notifier {
    /// Sets `bits` in the channel's pending notifications, waking a receiver
    /// if none were pending. Returns `false` if the channel no longer exists.
    pub fn post(&self, bits: u32) -> bool {
        if bits == 0 {
            return true;
        }
        let prev = self.pending.fetch_or(bits, Ordering::AcqRel);
        if prev == 0 {
            self.tx.send(Envelope::Notification).is_ok()
        } else {
            true
        }
    }
}

/// A connection to a channel in the same process.
#[derive(Clone)]
pub struct LocalConnection {
    tx: Sender<Envelope>,
    id: ClientId,
}

impl LocalConnection {
    pub fn client_id(&self) -> ClientId {
        self.id
    }

    /// Sends a request on behalf of some other client, at the priority it
    /// reported. This is how the name service forwards requests that arrive
    /// over a socket.
    pub(crate) fn send_as(
        &self,
        priority: Option<Priority>,
        operation: u16,
        outgoing: &[u8],
        response_capacity: usize,
    ) -> Result<Reply, SendError> {
        if outgoing.len() > MAX_MESSAGE_LEN {
            return Err(SendError::MessageTooLarge(outgoing.len()));
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.tx
            .send(Envelope::Message(Incoming {
                sender: self.id,
                operation,
                priority,
                payload: outgoing.to_vec(),
                response_capacity,
                reply: reply_tx,
            }))
            .map_err(|_| SendError::ServerGone)?;
        // If every handle to the reply sender goes away without a reply, the
        // server is gone.
        reply_rx.recv().map_err(|_| SendError::ServerGone)
    }
}

impl Transport for LocalConnection {
    fn send(
        &self,
        operation: u16,
        outgoing: &[u8],
        incoming: &mut [u8],
    ) -> Result<(u32, usize), SendError> {
        let reply = self.send_as(
            sched::current_priority(),
            operation,
            outgoing,
            incoming.len(),
        )?;
        let n = reply.payload.len();
        let dest = incoming
            .get_mut(..n)
            .ok_or(SendError::Protocol("reply larger than response buffer"))?;
        dest.copy_from_slice(&reply.payload);
        Ok((reply.code, n))
    }
}
