//! The boundary between the multiplexer and the byte stream it serves.
//!
//! The poller needs the raw socket, while reads and writes must go through whatever
//! wraps it (for example a TLS session). [`Transport`] is the single place that knows
//! how to reach the socket under a stream and how to split the stream into halves a
//! read worker and a write worker can drive at the same time.

use std::io::{self, Read, Write};
use std::net::TcpStream;

/// A readable half that can also report bytes it has already buffered.
///
/// Websocket codecs read ahead. Once a registration has fired, bytes already pulled
/// off the socket will not produce another readiness event, so the read path drains
/// them through [`read_buffered`](BufferedRead::read_buffered) before re-arming.
pub trait BufferedRead: Read {
    /// Reads only data that is available without touching the socket. Returns
    /// [`io::ErrorKind::WouldBlock`] when there is none.
    fn read_buffered(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::ErrorKind::WouldBlock.into())
    }
}

/// A duplex stream the multiplexer can register and serve.
pub trait Transport: Read + Write + Send + 'static {
    type Reader: BufferedRead + Send + 'static;
    type Writer: Write + Send + 'static;

    /// The socket under any wrapping; this is what the poller watches.
    fn socket(&self) -> &TcpStream;

    /// Splits the stream into a read half and a write half.
    fn split(self) -> io::Result<(Self::Reader, Self::Writer)>;
}

impl BufferedRead for TcpStream {}

impl Transport for TcpStream {
    type Reader = TcpStream;
    type Writer = TcpStream;

    fn socket(&self) -> &TcpStream {
        self
    }

    fn split(self) -> io::Result<(TcpStream, TcpStream)> {
        let reader = self.try_clone()?;
        Ok((reader, self))
    }
}

#[cfg(feature = "tls")]
pub use self::tls::{TlsHalf, TlsStream};

#[cfg(feature = "tls")]
mod tls {
    use std::io::{self, Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use rustls::{ServerConnection, StreamOwned};

    use super::{BufferedRead, Transport};

    /// A server-side TLS stream over TCP.
    pub type TlsStream = StreamOwned<ServerConnection, TcpStream>;

    /// One half of a split [`TlsStream`].
    ///
    /// A TLS session cannot be driven from two threads at once, so both halves share
    /// the session behind a mutex. A read that blocks mid-record holds the session
    /// until the rest of the record arrives.
    #[derive(Clone)]
    pub struct TlsHalf(Arc<Mutex<TlsStream>>);

    impl Read for TlsHalf {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.0.lock().read(buf)
        }
    }

    impl Write for TlsHalf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.lock().flush()
        }
    }

    impl BufferedRead for TlsHalf {
        fn read_buffered(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            // Decrypted plaintext only; WouldBlock when the session holds none.
            self.0.lock().conn.reader().read(buf)
        }
    }

    impl Transport for TlsStream {
        type Reader = TlsHalf;
        type Writer = TlsHalf;

        fn socket(&self) -> &TcpStream {
            self.get_ref()
        }

        fn split(self) -> io::Result<(TlsHalf, TlsHalf)> {
            let half = TlsHalf(Arc::new(Mutex::new(self)));
            Ok((half.clone(), half))
        }
    }
}
