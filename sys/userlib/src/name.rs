// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The name service: publishing a channel under a well-known name, and
//! finding it again from another process.
//!
//! A name is a Unix domain socket in the runtime directory
//! (`$HW_SERVER_RUNTIME_DIR`, or `hw-sim` under the system temporary
//! directory). Each connection to it gets a bridge thread that reads request
//! frames off the socket, forwards them into the channel as if sent by a
//! local client at the priority the remote client reported, and writes the
//! reply back. Frames are an `abi::RequestHeader` or `abi::ReplyHeader`
//! followed by the payload.
//!
//! Bridge threads wait for requests at `BRIDGE_PRIORITY`, so that a request
//! is picked up as soon as it arrives no matter what else is running, and
//! float to the sender's priority while forwarding it.

use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use abi::{Priority, ReplyHeader, RequestHeader, MAX_MESSAGE_LEN};
use ringbuf::{count_entry, counted_ringbuf};
use zerocopy::{FromZeros, IntoBytes};

use crate::ipc::{Channel, LocalConnection, SendError, Transport};
use crate::sched;

/// Environment variable naming the runtime directory.
pub const RUNTIME_DIR_VAR: &str = "HW_SERVER_RUNTIME_DIR";

/// Priority bridge threads wait for requests at.
pub const BRIDGE_PRIORITY: Priority = Priority::MAX;

#[derive(Copy, Clone, Debug, PartialEq, strum::IntoStaticStr)]
enum Trace {
    None,
    Forward {
        operation: u16,
        picked_up_at: Option<Priority>,
        forwarded_at: Option<Priority>,
    },
    OversizedReply(usize),
}

counted_ringbuf!(Trace, 32, Trace::None);

#[derive(Debug, thiserror::Error)]
pub enum NameError {
    #[error("{0:?} is not a valid name")]
    InvalidName(String),
    #[error("name {0:?} is already attached by a live server")]
    InUse(String),
    #[error("no server is attached as {0:?}")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// A directory in which names live.
#[derive(Clone, Debug)]
pub struct NameService {
    dir: PathBuf,
}

impl NameService {
    pub fn from_env() -> Self {
        let dir = std::env::var_os(RUNTIME_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("hw-sim"));
        Self { dir }
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_of(&self, name: &str) -> Result<PathBuf, NameError> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".."
        {
            return Err(NameError::InvalidName(name.to_string()));
        }
        Ok(self.dir.join(name))
    }

    /// Publishes `channel` as `name`.
    ///
    /// A socket left behind by a server that died is removed and replaced;
    /// one with a live server behind it is an error.
    pub fn attach(
        &self,
        name: &str,
        channel: &Channel,
    ) -> Result<NameAttachment, NameError> {
        let path = self.path_of(name)?;
        fs::create_dir_all(&self.dir)?;
        let listener = match UnixListener::bind(&path) {
            Ok(l) => l,
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                if UnixStream::connect(&path).is_ok() {
                    return Err(NameError::InUse(name.to_string()));
                }
                log::info!("removing stale socket {}", path.display());
                fs::remove_file(&path)?;
                UnixListener::bind(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        let stopping = Arc::new(AtomicBool::new(false));
        let acceptor = {
            let channel = channel.clone();
            let stopping = stopping.clone();
            let name = name.to_string();
            std::thread::Builder::new()
                .name(format!("{name}-accept"))
                .spawn(move || accept_loop(listener, channel, &stopping))?
        };
        log::info!("attached {name} at {}", path.display());

        Ok(NameAttachment {
            path,
            stopping,
            acceptor: Some(acceptor),
        })
    }

    /// Opens a connection to the server attached as `name`.
    pub fn open(&self, name: &str) -> Result<SocketConnection, NameError> {
        let path = self.path_of(name)?;
        match UnixStream::connect(&path) {
            Ok(stream) => Ok(SocketConnection {
                stream: Mutex::new(stream),
                desynced: AtomicBool::new(false),
            }),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                ) =>
            {
                Err(NameError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Like `open`, but waits for the server to appear, trying again every
    /// `interval`.
    pub fn open_with_retry(
        &self,
        name: &str,
        interval: Duration,
    ) -> Result<SocketConnection, NameError> {
        loop {
            match self.open(name) {
                Err(NameError::NotFound(_)) => {
                    log::info!("{name} not found, retrying");
                    std::thread::sleep(interval);
                }
                other => return other,
            }
        }
    }
}

/// Publishes `channel` as `name` in the default runtime directory.
pub fn name_attach(
    name: &str,
    channel: &Channel,
) -> Result<NameAttachment, NameError> {
    NameService::from_env().attach(name, channel)
}

/// Opens a connection to `name` in the default runtime directory, waiting
/// for it to appear.
pub fn name_open_with_retry(
    name: &str,
    interval: Duration,
) -> Result<SocketConnection, NameError> {
    NameService::from_env().open_with_retry(name, interval)
}

/// A published name. Dropping it withdraws the name; connections already
/// made keep working until their clients hang up.
pub struct NameAttachment {
    path: PathBuf,
    stopping: Arc<AtomicBool>,
    acceptor: Option<JoinHandle<()>>,
}

impl NameAttachment {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NameAttachment {
    fn drop(&mut self) {
        self.stopping.store(true, Ordering::Release);
        // Kick the acceptor out of accept().
        let _ = UnixStream::connect(&self.path);
        if let Some(t) = self.acceptor.take() {
            let _ = t.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

fn accept_loop(
    listener: UnixListener,
    channel: Channel,
    stopping: &AtomicBool,
) {
    for stream in listener.incoming() {
        if stopping.load(Ordering::Acquire) {
            break;
        }
        let stream = match stream {
            Ok(s) => s,
            Err(e) => {
                log::warn!("accept failed: {e}");
                continue;
            }
        };
        let conn = channel.connect();
        let spawned = sched::spawn_with_priority(
            &format!("bridge-{}", conn.client_id().0),
            BRIDGE_PRIORITY,
            None,
            move || {
                let id = conn.client_id().0;
                match bridge(&conn, stream) {
                    Ok(()) => log::debug!("client {id} hung up"),
                    Err(e) => log::warn!("client {id}: {e}"),
                }
            },
        );
        if let Err(e) = spawned {
            log::warn!("cannot start bridge thread: {e}");
        }
    }
}

/// Forwards frames from one socket client until it hangs up.
fn bridge(conn: &LocalConnection, mut stream: UnixStream) -> io::Result<()> {
    let mut payload = [0u8; MAX_MESSAGE_LEN];
    loop {
        let mut hdr = RequestHeader::new_zeroed();
        match stream.read_exact(hdr.as_mut_bytes()) {
            Ok(()) => (),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(())
            }
            Err(e) => return Err(e),
        }
        let len = hdr.len.get() as usize;
        let Some(body) = payload.get_mut(..len) else {
            // We can't find the next frame boundary; give up on this client.
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("request of {len} bytes is too large"),
            ));
        };
        stream.read_exact(body)?;

        let picked_up_at = sched::current_priority();
        let sender = hdr.priority();
        let _float = sender.map(sched::float_to);
        count_entry!(Trace::Forward {
            operation: hdr.operation.get(),
            picked_up_at,
            forwarded_at: sched::current_priority(),
        });
        let reply = conn
            .send_as(sender, hdr.operation.get(), body, MAX_MESSAGE_LEN)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        let rh = ReplyHeader::new(reply.code, reply.payload.len());
        stream.write_all(rh.as_bytes())?;
        stream.write_all(&reply.payload)?;
    }
}

/// A connection to a named server, possibly in another process.
pub struct SocketConnection {
    stream: Mutex<UnixStream>,
    /// Set once a reply could not be read to its end; the next frame
    /// boundary is unknown after that.
    desynced: AtomicBool,
}

fn gone_or(e: io::Error) -> SendError {
    match e.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset => SendError::ServerGone,
        _ => SendError::Io(e),
    }
}

impl Transport for SocketConnection {
    fn send(
        &self,
        operation: u16,
        outgoing: &[u8],
        incoming: &mut [u8],
    ) -> Result<(u32, usize), SendError> {
        if outgoing.len() > MAX_MESSAGE_LEN {
            return Err(SendError::MessageTooLarge(outgoing.len()));
        }
        let mut stream =
            self.stream.lock().unwrap_or_else(PoisonError::into_inner);
        if self.desynced.load(Ordering::Acquire) {
            return Err(SendError::Protocol("connection lost frame sync"));
        }

        let hdr = RequestHeader::new(
            operation,
            sched::current_priority(),
            outgoing.len(),
        );
        stream.write_all(hdr.as_bytes()).map_err(gone_or)?;
        stream.write_all(outgoing).map_err(gone_or)?;

        let mut rh = ReplyHeader::new_zeroed();
        stream.read_exact(rh.as_mut_bytes()).map_err(gone_or)?;
        let n = rh.len.get() as usize;
        let mut payload = [0u8; MAX_MESSAGE_LEN];
        let Some(body) = payload.get_mut(..n) else {
            count_entry!(Trace::OversizedReply(n));
            self.desynced.store(true, Ordering::Release);
            return Err(SendError::Protocol("reply exceeds message limit"));
        };
        // Always take the whole reply off the socket, so the next call
        // starts on a frame boundary.
        stream.read_exact(body).map_err(gone_or)?;
        let dest = incoming
            .get_mut(..n)
            .ok_or(SendError::Protocol("reply larger than response buffer"))?;
        dest.copy_from_slice(body);
        Ok((rh.code.get(), n))
    }
}
