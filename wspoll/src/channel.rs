//! Per-connection handle.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::{fmt, io};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::codec::{self, Incoming, MessageReader, MessageWriter};
use crate::handler::{OpCode, Shared};
use crate::reactor::Desc;
use crate::transport::Transport;

/// Callback fired once when a channel closes.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// One websocket connection served by a [`Handler`](crate::Handler).
///
/// Channels are handed to the receive callback as `&Arc<Channel>`; clone the `Arc`
/// to keep sending from elsewhere.
pub struct Channel {
    id: u64,
    shared: Arc<Shared>,
    desc: Arc<Desc>,
    /// Clone of the socket used to tear the connection down.
    socket: TcpStream,
    reader: Mutex<MessageReader>,
    writer: MessageWriter,
    on_close: Mutex<Option<CloseCallback>>,
    closed: AtomicBool,
}

impl Channel {
    /// Wraps an upgraded transport and creates its read registration. The
    /// registration is not started here.
    pub(crate) fn new<T: Transport>(transport: T, shared: Arc<Shared>) -> io::Result<Arc<Self>> {
        let socket = transport.socket().try_clone()?;
        let desc = shared.poller.handle_read_once(socket.as_raw_fd());
        let (reader, writer) = transport.split()?;
        let (reader, writer) = codec::split(reader, writer, shared.config.websocket.clone());

        let id = shared.next_channel_id();
        gauge!("wspoll_channels_open").increment(1.0);
        trace!(conn = id, fd = desc.fd(), "channel opened");

        Ok(Arc::new(Self {
            id,
            shared,
            desc,
            socket,
            reader: Mutex::new(reader),
            writer,
            on_close: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    /// Identifier unique within the owning handler.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Address of the remote peer.
    ///
    /// # Returns
    ///
    /// The socket's peer address, or an IO error once the socket is shut down.
    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket.peer_addr()
    }

    /// Whether [`close`](Channel::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn desc(&self) -> &Arc<Desc> {
        &self.desc
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Sends a message over the channel.
    ///
    /// The write runs on the handler's write pool; once write concurrency is
    /// reached this blocks until a writer frees up. A failed write closes the
    /// channel. Two sends on the same channel are independent tasks and may be
    /// written in either order unless the write pool has a single worker.
    pub fn send(self: &Arc<Self>, op: OpCode, data: Vec<u8>) {
        let channel = Arc::clone(self);
        self.shared.write_pool.schedule(move || {
            if channel.is_closed() {
                return;
            }
            match channel.writer.write_message(op, data) {
                Ok(()) => {
                    counter!("wspoll_messages_written_total").increment(1);
                }
                Err(e) => {
                    debug!(conn = channel.id, error = %e, "write failed, closing channel");
                    channel.close();
                }
            }
        });
    }

    /// Sets the callback to run when the channel closes, replacing any previous one.
    /// A callback set after the channel has closed never runs.
    pub fn set_on_close<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_close.lock() = Some(Box::new(callback));
    }

    /// Closes the channel.
    ///
    /// Retires the read registration, shuts the socket down (unblocking any read or
    /// write in progress) and runs the close callback. Only the first call has any
    /// effect, whichever path it comes from.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        if let Err(e) = self.shared.poller.stop(&self.desc) {
            trace!(conn = self.id, error = %e, "registration already gone");
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            trace!(conn = self.id, error = %e, "socket shutdown failed");
        }

        gauge!("wspoll_channels_open").decrement(1.0);
        counter!("wspoll_channels_closed_total").increment(1);
        debug!(conn = self.id, "channel closed");

        // Taken out of the slot so the callback can touch the channel freely.
        let callback = self.on_close.lock().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Reads one message and hands it to the receive callback, then delivers any
    /// messages that were already buffered behind it.
    ///
    /// Returns false if the channel closed. Only the handler calls this, and only
    /// while the registration is disarmed, so reads never overlap.
    pub(crate) fn read(self: &Arc<Self>) -> bool {
        let mut reader = self.reader.lock();

        match reader.read_message() {
            Ok(incoming) => self.deliver(incoming),
            Err(e) => {
                drop(reader);
                debug!(conn = self.id, error = %e, "read failed, closing channel");
                self.close();
                return false;
            }
        }

        while !self.is_closed() {
            match reader.read_buffered() {
                Ok(Incoming::Empty) => break,
                Ok(incoming) => self.deliver(incoming),
                Err(e) => {
                    drop(reader);
                    debug!(conn = self.id, error = %e, "read failed, closing channel");
                    self.close();
                    return false;
                }
            }
        }

        !self.is_closed()
    }

    fn deliver(self: &Arc<Self>, incoming: Incoming) {
        if let Incoming::Message(op, data) = incoming {
            counter!("wspoll_messages_read_total").increment(1);
            (self.shared.callback)(self, op, data);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("state", &self.desc.state())
            .field("closed", &self.is_closed())
            .finish()
    }
}
