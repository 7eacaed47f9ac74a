//! Error types for the multiplexer and its poller.

use std::io;
use std::string::FromUtf8Error;

use thiserror::Error;

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the multiplexer.
///
/// Only construction and upgrade failures reach the application. Errors on an
/// established connection close that connection and are reported through logs and
/// the channel's close callback.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket or poller setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A readiness registration call failed.
    #[error("poller: {0}")]
    Poll(#[from] PollError),
    /// Reading or writing a websocket message failed.
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// A text message was sent with a payload that is not UTF-8.
    #[error("text payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    /// The websocket handshake was rejected or did not complete.
    #[error("upgrade failed: {0}")]
    Upgrade(String),
    /// The handler configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The Prometheus exporter could not be installed.
    #[error("metrics exporter: {0}")]
    Metrics(String),
}

/// Errors returned by [`Poller`](crate::reactor::Poller) registration calls.
#[derive(Debug, Error)]
pub enum PollError {
    /// `start` was called on a descriptor that is already registered.
    #[error("descriptor is already registered")]
    Registered,
    /// The descriptor has been retired or the poller has shut down.
    #[error("descriptor or poller is closed")]
    Closed,
    /// `resume` was called before `start`.
    #[error("descriptor was never started")]
    NotStarted,
    /// The OS rejected the registration.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
