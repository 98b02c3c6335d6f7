// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level user interface.
//!
//! This is intended to provide a more ergonomic interface than the raw
//! channel operations in `ipc`.

use core::marker::PhantomData;
use std::cell::RefCell;
use std::rc::Rc;

use abi::{ClientId, ResponseCode};
use crossbeam_channel::Sender;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};

use crate::ipc::{Channel, Received, RecvError, Reply, SendError, Transport};
use crate::{sched, FromPrimitive};

/// A message type with a fixed operation code and response type.
///
/// Implement this for each request struct in a client API, then use
/// [`send`] to make the call.
pub trait Call: IntoBytes + Immutable {
    /// Operation code this message is sent as.
    const OP: u16;
    /// Payload of a successful reply.
    type Response: FromBytes + IntoBytes;
    /// Error type; built from non-zero response codes, or from a failure to
    /// get a response at all.
    type Err: From<u32> + From<SendError>;
}

/// Sends `message` through `server` and waits for the reply.
pub fn send<M: Call>(
    server: &impl Transport,
    message: &M,
) -> Result<M::Response, M::Err> {
    let mut response = M::Response::new_zeroed();
    let (rc, len) =
        server.send(M::OP, message.as_bytes(), response.as_mut_bytes())?;
    if rc != abi::SUCCESS {
        Err(M::Err::from(rc))
    } else if len != core::mem::size_of::<M::Response>() {
        Err(M::Err::from(SendError::Protocol("short reply")))
    } else {
        Ok(response)
    }
}

/// Receives a message, or a notification, and handles it.
///
/// `state` is a value of your choice that will get passed to whichever closure
/// -- `notify` or `msg` -- gets executed. More on this below.
///
/// `notify` will be called if the channel delivers notifications instead of a
/// message. Its only parameter: a `u32` with a bit set for each pending
/// notification.
///
/// `msg` will be called if a client sent a proper message. It will be passed:
/// the `state`, the decoded operation, and a `Message` describing the
/// contents.
///
/// The only error is `RecvError::Shutdown`, once the channel has been told to
/// stop.
///
/// # About operation decoding
///
/// `hl::recv` operates on a type, `O`, that you choose. This represents the
/// operation code, and must implement `FromPrimitive` so we can try to make an
/// `O` from a `u16`.
///
/// If that *fails*, we immediately respond to the caller with
/// `ResponseCode::NotImplemented` (1) and your closures never see the
/// message.
///
/// # About error encoding
///
/// Your `msg` closure can return an error type, `E`. If this occurs, and the
/// caller has not been replied to yet, `recv` will convert it into a `u32` and
/// send it back to the caller as the response code.
///
/// Because the response code 0 means "success," your error type `E` should not
/// have a value corresponding to 0, or things will get weird for you.
///
/// # About replies
///
/// Every message is answered exactly once. Replying consumes the `Caller`, so
/// you cannot reply twice. If every handle to a message -- the `Message`
/// itself and any `Caller` made from it -- is dropped without a reply, the
/// caller is sent `ResponseCode::ServerDefect` and an error is logged. A
/// client is never left blocked by a handler bug.
///
/// # About priority
///
/// If the sender reported a priority, the handler runs at that priority and
/// the receiving thread returns to its own priority once `recv` returns.
///
/// # About the `state` parameter
///
/// If `recv` took only one closure, it could borrow exclusively (`&mut`)
/// anything it wanted from the caller's stack frame. Because it takes *two*,
/// and both almost certainly need the same mutable state, borrow it and pass
/// it as `state` instead. If you don't need this, just pass `()`.
pub fn recv<O, E, S>(
    channel: &Channel,
    state: S,
    notify: impl FnOnce(S, u32),
    msg: impl FnOnce(S, O, Message<'_>) -> Result<(), E>,
) -> Result<(), RecvError>
where
    O: FromPrimitive,
    E: Into<u32>,
{
    let rm = match channel.recv()? {
        Received::Notification(bits) => {
            notify(state, bits);
            return Ok(());
        }
        Received::Message(rm) => rm,
    };

    let slot = Rc::new(ReplySlot::new(rm.sender, rm.reply));
    let Some(op) = O::from_u16(rm.operation) else {
        log::debug!(
            "client {} sent unknown operation {}",
            rm.sender.0,
            rm.operation
        );
        slot.send(ResponseCode::NotImplemented.into(), &[]);
        return Ok(());
    };

    let _float = rm.priority.map(sched::float_to);
    let m = Message {
        buffer: &rm.payload,
        response_capacity: rm.response_capacity,
        sender: rm.sender,
        slot: slot.clone(),
    };
    if let Err(e) = msg(state, op, m) {
        let code = e.into();
        if !slot.send(code, &[]) {
            log::warn!(
                "handler failed with {code} after replying to client {}",
                rm.sender.0
            );
        }
    }
    Ok(())
}

/// Blocks until a notification arrives and returns its bits. Any message that
/// arrives in the meantime is answered with `ResponseCode::NotImplemented`.
///
/// This is the receive loop of a task that serves nobody.
pub fn recv_notification(channel: &Channel) -> Result<u32, RecvError> {
    loop {
        match channel.recv()? {
            Received::Notification(bits) => return Ok(bits),
            Received::Message(rm) => {
                log::debug!(
                    "rejecting operation {} from client {}",
                    rm.operation,
                    rm.sender.0
                );
                ReplySlot::new(rm.sender, rm.reply)
                    .send(ResponseCode::NotImplemented.into(), &[]);
            }
        }
    }
}

/// Where a reply goes. Sends `ServerDefect` if dropped while still pending.
struct ReplySlot {
    sender: ClientId,
    tx: RefCell<Option<Sender<Reply>>>,
}

impl ReplySlot {
    fn new(sender: ClientId, tx: Sender<Reply>) -> Self {
        Self {
            sender,
            tx: RefCell::new(Some(tx)),
        }
    }

    /// Sends the reply, if one hasn't been sent. Returns `false` if one had.
    ///
    /// A client that has gone away by the time we reply is logged and
    /// otherwise ignored.
    fn send(&self, code: u32, payload: &[u8]) -> bool {
        let Some(tx) = self.tx.borrow_mut().take() else {
            return false;
        };
        let reply = Reply {
            code,
            payload: payload.to_vec(),
        };
        if tx.send(reply).is_err() {
            log::error!(
                "reply to client {} failed: client gone",
                self.sender.0
            );
        }
        true
    }
}

impl Drop for ReplySlot {
    fn drop(&mut self) {
        if self.tx.get_mut().is_some() {
            log::error!(
                "message from client {} dropped without a reply",
                self.sender.0
            );
            self.send(ResponseCode::ServerDefect.into(), &[]);
        }
    }
}

/// Represents a received message (not a notification).
///
/// This type gets passed by `recv` (and related operations) into the message
/// handler.
///
/// If you know the operation code, you can work out what type of message is
/// expected for that operation. At this point the first (and only) thing you
/// probably want to do with a `Message` is call `fixed`.
pub struct Message<'a> {
    buffer: &'a [u8],
    response_capacity: usize,
    sender: ClientId,
    slot: Rc<ReplySlot>,
}

impl<'a> Message<'a> {
    /// Parses this message as a fixed-size value of type `M`, and prepares to
    /// (maybe, eventually) send a response of type `R`.
    ///
    /// If the caller sent a message whose size doesn't match `M` (too big *or*
    /// too small), or prepared a response buffer too small for `R`, this
    /// returns `None`. (We return `Option` instead of `Result` to allow you to
    /// use your server's own error type using `ok_or`.)
    ///
    /// `M` should be [`Unaligned`][zerocopy::Unaligned]; a type with stricter
    /// alignment may be refused depending on where the payload landed.
    pub fn fixed<M, R>(self) -> Option<(&'a M, Caller<R>)>
    where
        M: FromBytes + KnownLayout + Immutable,
        R: IntoBytes,
    {
        if self.buffer.len() != core::mem::size_of::<M>()
            || self.response_capacity < core::mem::size_of::<R>()
        {
            return None;
        }
        let msg = M::ref_from_bytes(self.buffer).ok()?;
        Some((msg, Caller::from_slot(self.slot)))
    }

    /// Gives up on parsing and returns a handle to reply to the caller.
    pub fn caller<R>(self) -> Caller<R> {
        Caller::from_slot(self.slot)
    }

    pub fn sender(&self) -> ClientId {
        self.sender
    }

    pub fn payload(&self) -> &'a [u8] {
        self.buffer
    }
}

/// A typed handle to a client, used to send a single reply of type `R`.
pub struct Caller<R> {
    slot: Rc<ReplySlot>,
    _phantom: PhantomData<fn(R)>,
}

impl<R> Caller<R> {
    fn from_slot(slot: Rc<ReplySlot>) -> Self {
        Caller {
            slot,
            _phantom: PhantomData,
        }
    }

    /// Sends a successful reply message of type `R`, consuming the handle.
    pub fn reply(self, message: R)
    where
        R: IntoBytes + Immutable,
    {
        self.slot.send(abi::SUCCESS, message.as_bytes());
    }

    /// Sends a failure message with response code `rc`, consuming the handle.
    ///
    /// Because a response code of 0 conventionally means "success," `rc` should
    /// not convert to 0, or things will get weird for you.
    pub fn reply_fail(self, rc: impl Into<u32>) {
        self.slot.send(rc.into(), &[]);
    }

    /// Extracts the `ClientId` of a caller.
    pub fn client_id(&self) -> ClientId {
        self.slot.sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::{LocalConnection, Transport};
    use num_derive::FromPrimitive;
    use std::thread;
    use zerocopy::byteorder::little_endian::U32;
    use zerocopy::Unaligned;

    #[derive(Copy, Clone, Debug, FromPrimitive)]
    enum Op {
        Double = 1,
        Forget = 2,
        Stash = 3,
    }

    #[derive(FromBytes, KnownLayout, Immutable, Unaligned)]
    #[repr(C)]
    struct Arg {
        x: U32,
    }

    /// Runs `n` rounds of a toy server in the background.
    fn serve(ch: &Channel, n: usize) -> thread::JoinHandle<()> {
        let ch = ch.clone();
        thread::spawn(move || {
            let mut stash: Vec<Caller<()>> = Vec::new();
            for _ in 0..n {
                recv(
                    &ch,
                    &mut stash,
                    |_, _| (),
                    |stash, op: Op, m| -> Result<(), ResponseCode> {
                        match op {
                            Op::Double => {
                                let (arg, caller) = m
                                    .fixed::<Arg, U32>()
                                    .ok_or(ResponseCode::BadMessage)?;
                                caller.reply(U32::new(arg.x.get() * 2));
                            }
                            Op::Forget => (),
                            Op::Stash => stash.push(m.caller()),
                        }
                        Ok(())
                    },
                )
                .unwrap();
            }
            // Deferred replies go out when we get around to them.
            for c in stash {
                c.reply(());
            }
        })
    }

    fn call(
        conn: &LocalConnection,
        op: u16,
        payload: &[u8],
    ) -> (u32, Vec<u8>) {
        let mut buf = [0u8; 8];
        let (code, n) = conn.send(op, payload, &mut buf).unwrap();
        (code, buf[..n].to_vec())
    }

    #[test]
    fn replies_with_payload() {
        let ch = Channel::new();
        let server = serve(&ch, 1);
        let (code, reply) = call(&ch.connect(), 1, &21u32.to_le_bytes());
        assert_eq!(code, 0);
        assert_eq!(reply, 42u32.to_le_bytes());
        server.join().unwrap();
    }

    #[test]
    fn unknown_operation_is_not_implemented() {
        let ch = Channel::new();
        let server = serve(&ch, 1);
        let (code, _) = call(&ch.connect(), 99, &[]);
        assert_eq!(code, u32::from(ResponseCode::NotImplemented));
        server.join().unwrap();
    }

    #[test]
    fn wrong_size_is_bad_message() {
        let ch = Channel::new();
        let server = serve(&ch, 1);
        let (code, _) = call(&ch.connect(), 1, &[1, 2]);
        assert_eq!(code, u32::from(ResponseCode::BadMessage));
        server.join().unwrap();
    }

    #[test]
    fn forgotten_reply_is_server_defect() {
        let ch = Channel::new();
        let server = serve(&ch, 1);
        let (code, _) = call(&ch.connect(), 2, &[]);
        assert_eq!(code, u32::from(ResponseCode::ServerDefect));
        server.join().unwrap();
    }

    #[test]
    fn deferred_reply_is_not_a_defect() {
        let ch = Channel::new();
        let server = serve(&ch, 1);
        let (code, _) = call(&ch.connect(), 3, &[]);
        assert_eq!(code, abi::SUCCESS);
        server.join().unwrap();
    }

    /// Keeps every log record, for checking what got logged and how loudly.
    struct Capture(std::sync::Mutex<Vec<(log::Level, String)>>);

    impl log::Log for Capture {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            self.0
                .lock()
                .unwrap()
                .push((record.level(), record.args().to_string()));
        }

        fn flush(&self) {}
    }

    static CAPTURE: Capture = Capture(std::sync::Mutex::new(Vec::new()));

    #[test]
    fn reply_to_departed_client_is_an_error() {
        if log::set_logger(&CAPTURE).is_ok() {
            log::set_max_level(log::LevelFilter::Trace);
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        drop(rx);
        let slot = ReplySlot::new(ClientId(4242), tx);
        assert!(slot.send(0, &[]));
        assert!(!slot.send(0, &[]));

        let logged = CAPTURE.0.lock().unwrap();
        let expected = (
            log::Level::Error,
            "reply to client 4242 failed: client gone".to_string(),
        );
        assert!(logged.contains(&expected), "{logged:?}");
    }

    #[test]
    fn recv_notification_rejects_messages() {
        let ch = Channel::new();
        let conn = ch.connect();
        let client = thread::spawn(move || call(&conn, 1, &[]).0);
        // Make sure the message is queued ahead of the notification.
        while ch.queued() == 0 {
            thread::yield_now();
        }
        ch.notifier().post(1 << 2);
        assert_eq!(recv_notification(&ch).unwrap(), 1 << 2);
        assert_eq!(
            client.join().unwrap(),
            u32::from(ResponseCode::NotImplemented)
        );
    }
}
