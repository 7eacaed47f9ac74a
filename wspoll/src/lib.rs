//! A readiness-driven websocket multiplexer.
//!
//! Instead of parking one thread per connection in a blocking read, every
//! connection is registered with a one-shot readiness poller. When a connection
//! becomes readable a single read is scheduled on a bounded worker pool, and the
//! registration is re-armed once that read finishes. Outbound messages go through a
//! second, independently bounded pool. It consists of:
//!
//! - [`executor`]: bounded worker pools that reuse threads across short tasks
//! - [`reactor`]: one-shot readiness registrations on top of `mio`
//! - [`transport`]: the adapter exposing the raw socket under a (possibly TLS) stream
//! - [`channel`]: the per-connection handle used to send, receive and close
//! - [`handler`]: the multiplexer driving the read-resume cycle
//!
//! ```no_run
//! use std::net::TcpListener;
//!
//! fn main() -> wspoll::Result<()> {
//!     let handler = wspoll::Handler::new(|channel, op, data| channel.send(op, data), 4, 4)?;
//!     let listener = TcpListener::bind("127.0.0.1:9001")?;
//!     handler.serve(&listener)
//! }
//! ```

pub mod channel;
mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod handler;
pub mod reactor;
pub mod task;
pub mod transport;

pub use channel::Channel;
pub use config::Config;
pub use error::{Error, PollError, Result};
pub use handler::{Handler, OpCode};
pub use transport::{BufferedRead, Transport};

#[cfg(feature = "tls")]
pub use transport::{TlsHalf, TlsStream};
