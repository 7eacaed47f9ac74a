//! The multiplexer: upgrades connections and drives the read-resume cycle.
//!
//! Every channel moves through the same states:
//!
//! ```text
//!   ARMED --readable--> READING --read ok, resume ok--> ARMED
//!     |                    |
//!   hangup          read or resume failed
//!     v                    v
//!   CLOSED <---------------+
//! ```
//!
//! The poller's dispatch thread only ever schedules work; the read itself, the
//! receive callback and the resume all run on the read pool.

use std::io::Write;
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use metrics::counter;
use tracing::{debug, info, trace, warn};
use tungstenite::Error as WsError;
use tungstenite::handshake::{HandshakeError, HandshakeRole};

use crate::channel::Channel;
use crate::config::Config;
use crate::error::{Error, PollError, Result};
use crate::executor::Pool;
use crate::reactor::Poller;
use crate::transport::Transport;

/// Sent when an upgrade request is not a valid websocket handshake.
const BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n";

/// Message kinds surfaced to the receive callback. Control frames are handled
/// internally and never reach application code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Text,
    Binary,
}

/// Called on a read worker for every message received on a channel.
pub type ReceivedCallback = dyn Fn(&Arc<Channel>, OpCode, Vec<u8>) + Send + Sync;

/// State shared by a handler and all of its channels.
pub(crate) struct Shared {
    pub(crate) callback: Box<ReceivedCallback>,
    pub(crate) poller: Arc<Poller>,
    pub(crate) read_pool: Pool,
    pub(crate) write_pool: Pool,
    pub(crate) config: Config,
    next_channel_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_channel_id(&self) -> u64 {
        self.next_channel_id.fetch_add(1, Ordering::Relaxed)
    }
}

/// A websocket handler serving many connections with bounded read and write
/// concurrency.
///
/// Cloning is cheap; clones share the poller and pools. There is no shutdown: the
/// poller and pools live as long as any clone or channel does.
#[derive(Clone)]
pub struct Handler {
    shared: Arc<Shared>,
}

impl Handler {
    /// Creates a handler that runs at most `read_concurrency` receive callbacks and
    /// `write_concurrency` writes at once.
    ///
    /// # Errors
    ///
    /// Fails if either limit is zero or the poller cannot be created.
    pub fn new<F>(callback: F, read_concurrency: usize, write_concurrency: usize) -> Result<Self>
    where
        F: Fn(&Arc<Channel>, OpCode, Vec<u8>) + Send + Sync + 'static,
    {
        let config = Config::default()
            .read_concurrency(read_concurrency)
            .write_concurrency(write_concurrency);
        Self::with_config(callback, config)
    }

    /// Creates a handler from a full [`Config`].
    ///
    /// # Errors
    ///
    /// Fails if the configuration is invalid, the poller cannot be created, or the
    /// metrics exporter cannot be installed.
    pub fn with_config<F>(callback: F, config: Config) -> Result<Self>
    where
        F: Fn(&Arc<Channel>, OpCode, Vec<u8>) + Send + Sync + 'static,
    {
        config.validate()?;

        if let Some(addr) = config.metrics_listener {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .map_err(|e| Error::Metrics(e.to_string()))?;
            info!(%addr, "metrics enabled");
        }

        // One poller per handler replaces a blocked reader thread per connection.
        let poller = Poller::new()?;

        Ok(Self {
            shared: Arc::new(Shared {
                callback: Box::new(callback),
                poller,
                read_pool: Pool::new("read", config.read_concurrency, config.idle_timeout),
                write_pool: Pool::new("write", config.write_concurrency, config.idle_timeout),
                config,
                next_channel_id: AtomicU64::new(0),
            }),
        })
    }

    /// Performs the websocket handshake on `stream` and starts serving it.
    ///
    /// A malformed upgrade request is answered with `400 Bad Request`; either way
    /// a failed handshake creates no channel. The configured handshake timeout
    /// applies only while the handshake runs.
    pub fn upgrade<T: Transport>(&self, mut stream: T) -> Result<Arc<Channel>> {
        let config = &self.shared.config;
        let socket = stream.socket();
        let peer = socket.peer_addr().ok();
        socket.set_read_timeout(config.handshake_timeout)?;
        socket.set_write_timeout(config.handshake_timeout)?;

        let handshake = tungstenite::accept_with_config(&mut stream, Some(config.websocket.clone()))
            .map(drop)
            .map_err(|e| (is_unanswered(&e), e.to_string()));

        if let Err((unanswered, message)) = handshake {
            counter!("wspoll_upgrades_failed_total").increment(1);
            debug!(?peer, error = %message, "websocket upgrade failed");
            if unanswered {
                reject(&mut stream);
            }
            return Err(Error::Upgrade(message));
        }

        let socket = stream.socket();
        socket.set_read_timeout(None)?;
        socket.set_write_timeout(None)?;

        let channel = Channel::new(stream, self.shared.clone())?;
        debug!(conn = channel.id(), ?peer, "websocket upgraded");
        self.start_read(&channel);
        Ok(channel)
    }

    /// Accepts connections from `listener` forever, upgrading each on its own
    /// short-lived thread so a slow handshake cannot hold up the others.
    pub fn serve(&self, listener: &TcpListener) -> Result<()> {
        info!(addr = ?listener.local_addr().ok(), "accepting websocket connections");

        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let handler = self.clone();
            let spawned = thread::Builder::new()
                .name("wspoll-upgrade".into())
                .spawn(move || {
                    // Failures are logged by upgrade.
                    let _ = handler.upgrade(stream);
                });
            if let Err(e) = spawned {
                warn!(error = %e, "failed to spawn upgrade thread");
            }
        }
        Ok(())
    }

    /// Number of live read workers.
    pub fn read_workers(&self) -> usize {
        self.shared.read_pool.workers()
    }

    /// Number of live write workers.
    pub fn write_workers(&self) -> usize {
        self.shared.write_pool.workers()
    }

    /// Number of channels currently registered with the poller.
    pub fn open_channels(&self) -> usize {
        self.shared.poller.registrations()
    }

    /// Registers the channel with the poller and starts the read-resume cycle.
    fn start_read(&self, channel: &Arc<Channel>) {
        let watched = channel.clone();
        let result = self.shared.poller.start(channel.desc(), move |event| {
            if event.is_hangup() {
                debug!(conn = watched.id(), "peer hung up");
                watched.close();
                return;
            }

            // Blocks the dispatch thread once read concurrency is reached.
            let channel = watched.clone();
            watched.shared().read_pool.schedule(move || read_and_resume(&channel));
        });

        match result {
            Ok(()) => {}
            Err(PollError::Registered) => trace!(conn = channel.id(), "already being handled"),
            Err(PollError::Closed) => trace!(conn = channel.id(), "already closed"),
            Err(e) => {
                warn!(conn = channel.id(), error = %e, "failed to start reading");
                channel.close();
            }
        }
    }
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("poller", &self.shared.poller)
            .field("read_pool", &self.shared.read_pool)
            .field("write_pool", &self.shared.write_pool)
            .finish()
    }
}

/// Whether a failed handshake ended without writing anything to the peer.
///
/// `tungstenite` writes its own response for `Error::Http`; a request it could not
/// parse or validate gets nothing.
fn is_unanswered<R: HandshakeRole>(e: &HandshakeError<R>) -> bool {
    matches!(
        e,
        HandshakeError::Failure(WsError::Protocol(_) | WsError::Capacity(_))
    )
}

/// Answers a rejected upgrade request. Best effort: the connection is dropped next.
fn reject<T: Write>(stream: &mut T) {
    if let Err(e) = stream
        .write_all(BAD_REQUEST)
        .and_then(|()| stream.flush())
    {
        trace!(error = %e, "failed to send upgrade rejection");
    }
}

/// Body of every read task: read, then re-arm for the next message.
fn read_and_resume(channel: &Arc<Channel>) {
    if !channel.read() {
        return;
    }

    if let Err(e) = channel.shared().poller.resume(channel.desc()) {
        debug!(conn = channel.id(), error = %e, "failed to resume reading, closing channel");
        channel.close();
    }
}
