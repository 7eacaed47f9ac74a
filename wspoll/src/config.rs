//! Handler configuration.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use tungstenite::protocol::WebSocketConfig;

use crate::error::{Error, Result};

/// Upper bound for the default pool sizes.
const MAX_DEFAULT_CONCURRENCY: usize = 10;

/// Settings for a [`Handler`](crate::Handler).
///
/// ```
/// use std::time::Duration;
///
/// let config = wspoll::Config::default()
///     .read_concurrency(8)
///     .write_concurrency(2)
///     .idle_timeout(Some(Duration::from_secs(30)));
/// assert_eq!(config.read_concurrency, 8);
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    /// Maximum number of reads (and receive callbacks) running at once.
    pub read_concurrency: usize,
    /// Maximum number of writes running at once.
    pub write_concurrency: usize,
    /// How long an idle pool worker waits for work before exiting.
    /// `None` keeps workers alive for the life of the process.
    pub idle_timeout: Option<Duration>,
    /// Read/write timeout applied to the socket while the upgrade handshake runs.
    pub handshake_timeout: Option<Duration>,
    /// Limits passed to the websocket codec.
    pub websocket: WebSocketConfig,
    /// When set, a Prometheus exporter is served on this address.
    pub metrics_listener: Option<SocketAddr>,
}

impl Default for Config {
    fn default() -> Self {
        let concurrency = thread::available_parallelism()
            .map(|n| n.get().min(MAX_DEFAULT_CONCURRENCY))
            .unwrap_or(4);

        Self {
            read_concurrency: concurrency,
            write_concurrency: concurrency,
            idle_timeout: None,
            handshake_timeout: Some(Duration::from_secs(10)),
            websocket: WebSocketConfig::default(),
            metrics_listener: None,
        }
    }
}

impl Config {
    /// Sets the maximum number of concurrent reads.
    ///
    /// # Arguments
    ///
    /// * `concurrency` - Must be at least 1; zero is rejected when the handler is built.
    pub fn read_concurrency(mut self, concurrency: usize) -> Self {
        self.read_concurrency = concurrency;
        self
    }

    /// Sets the maximum number of concurrent writes.
    ///
    /// # Arguments
    ///
    /// * `concurrency` - Must be at least 1; zero is rejected when the handler is built.
    pub fn write_concurrency(mut self, concurrency: usize) -> Self {
        self.write_concurrency = concurrency;
        self
    }

    /// Sets how long an idle worker waits before exiting. `None` disables shrinking.
    pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Sets the socket timeout used during the upgrade handshake. `None` waits forever.
    pub fn handshake_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the frame and message limits passed to `tungstenite`.
    pub fn websocket(mut self, websocket: WebSocketConfig) -> Self {
        self.websocket = websocket;
        self
    }

    /// Serves Prometheus metrics on `addr` when set.
    pub fn metrics_listener(mut self, addr: Option<SocketAddr>) -> Self {
        self.metrics_listener = addr;
        self
    }

    /// Rejects settings the handler cannot run with.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.read_concurrency == 0 {
            return Err(Error::Config("read_concurrency must be at least 1".into()));
        }
        if self.write_concurrency == 0 {
            return Err(Error::Config("write_concurrency must be at least 1".into()));
        }
        if self.handshake_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("handshake_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
