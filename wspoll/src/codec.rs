//! Websocket framing over a split transport.
//!
//! Framing is `tungstenite`'s job; this module only arranges for one websocket
//! state machine to read from the read half while another writes to the write
//! half. Control replies produced while reading (pongs, the closing handshake) are
//! written through the writer's lock so they never interleave with a data frame.

use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;
use tungstenite::protocol::{Role, WebSocketConfig};
use tungstenite::{Message, WebSocket};

use crate::error::{Error, Result};
use crate::handler::OpCode;
use crate::transport::BufferedRead;

/// What one read produced.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Incoming {
    /// An application message.
    Message(OpCode, Vec<u8>),
    /// A ping or pong; already answered where needed.
    Control,
    /// Nothing buffered (only from [`MessageReader::read_buffered`]).
    Empty,
}

/// Write half as seen by the writing websocket. It is never read from.
struct WriteSide(Box<dyn Write + Send>);

impl Read for WriteSide {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "write half is not readable",
        ))
    }
}

impl Write for WriteSide {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

type SharedWriter = Arc<Mutex<WebSocket<WriteSide>>>;

/// Read half as seen by the reading websocket.
struct ReadSide {
    inner: Box<dyn BufferedRead + Send>,
    writer: SharedWriter,
    draining: bool,
}

impl Read for ReadSide {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.draining {
            self.inner.read_buffered(buf)
        } else {
            self.inner.read(buf)
        }
    }
}

impl Write for ReadSide {
    // Each call carries the reader's whole pending output, so holding the lock for
    // one call keeps a control frame in one piece.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock();
        writer.get_mut().write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.lock().get_mut().flush()
    }
}

pub(crate) struct MessageReader {
    ws: WebSocket<ReadSide>,
}

impl MessageReader {
    /// Blocks until the next message or control frame arrives.
    pub fn read_message(&mut self) -> Result<Incoming> {
        self.ws.get_mut().draining = false;
        let message = self.ws.read()?;
        self.classify(message)
    }

    /// Returns the next message only if it is already buffered.
    pub fn read_buffered(&mut self) -> Result<Incoming> {
        self.ws.get_mut().draining = true;
        let result = self.ws.read();
        self.ws.get_mut().draining = false;

        match result {
            Ok(message) => self.classify(message),
            Err(tungstenite::Error::Io(e)) if e.kind() == io::ErrorKind::WouldBlock => {
                Ok(Incoming::Empty)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn classify(&mut self, message: Message) -> Result<Incoming> {
        match message {
            Message::Text(text) => {
                Ok(Incoming::Message(OpCode::Text, text.as_str().as_bytes().to_vec()))
            }
            Message::Binary(data) => Ok(Incoming::Message(OpCode::Binary, data.to_vec())),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {
                // Push out the queued pong now instead of on the next read.
                self.ws.flush()?;
                Ok(Incoming::Control)
            }
            Message::Close(_) => {
                // Best effort: echo the close frame before the channel shuts down.
                let _ = self.ws.flush();
                Err(Error::WebSocket(tungstenite::Error::ConnectionClosed))
            }
        }
    }
}

#[derive(Clone)]
pub(crate) struct MessageWriter {
    ws: SharedWriter,
}

impl MessageWriter {
    /// Frames and writes one message, blocking until it is flushed.
    pub fn write_message(&self, op: OpCode, data: Vec<u8>) -> Result<()> {
        let message = match op {
            OpCode::Text => Message::text(String::from_utf8(data)?),
            OpCode::Binary => Message::binary(data),
        };
        self.ws.lock().send(message)?;
        Ok(())
    }
}

/// Builds the reader and writer for a freshly upgraded connection.
pub(crate) fn split<R, W>(
    reader: R,
    writer: W,
    config: WebSocketConfig,
) -> (MessageReader, MessageWriter)
where
    R: BufferedRead + Send + 'static,
    W: Write + Send + 'static,
{
    let writer = WebSocket::from_raw_socket(
        WriteSide(Box::new(writer)),
        Role::Server,
        Some(config.clone()),
    );
    let writer: SharedWriter = Arc::new(Mutex::new(writer));

    let reader = WebSocket::from_raw_socket(
        ReadSide {
            inner: Box::new(reader),
            writer: writer.clone(),
            draining: false,
        },
        Role::Server,
        Some(config),
    );

    (MessageReader { ws: reader }, MessageWriter { ws: writer })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    use crate::transport::Transport;

    /// Returns the server-side reader/writer and a raw client websocket.
    fn connected() -> (MessageReader, MessageWriter, WebSocket<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();

        let (reader, writer) = server.split().unwrap();
        let (reader, writer) = split(reader, writer, WebSocketConfig::default());
        let client = WebSocket::from_raw_socket(client, Role::Client, None);
        (reader, writer, client)
    }

    #[test]
    fn reads_text_and_binary() {
        let (mut reader, _writer, mut client) = connected();

        client.send(Message::text("hello")).unwrap();
        assert_eq!(
            reader.read_message().unwrap(),
            Incoming::Message(OpCode::Text, b"hello".to_vec())
        );

        client.send(Message::binary(vec![1u8, 2, 3])).unwrap();
        assert_eq!(
            reader.read_message().unwrap(),
            Incoming::Message(OpCode::Binary, vec![1, 2, 3])
        );
    }

    #[test]
    fn drains_pipelined_messages_without_blocking() {
        let (mut reader, _writer, mut client) = connected();

        for i in 0..3 {
            client.write(Message::text(format!("m{i}"))).unwrap();
        }
        client.flush().unwrap();

        let mut seen = vec![];
        if let Incoming::Message(_, data) = reader.read_message().unwrap() {
            seen.push(data);
        }
        while seen.len() < 3 {
            match reader.read_buffered().unwrap() {
                Incoming::Message(_, data) => seen.push(data),
                Incoming::Control => {}
                // The kernel may have handed over only part of the burst.
                Incoming::Empty => match reader.read_message().unwrap() {
                    Incoming::Message(_, data) => seen.push(data),
                    _ => {}
                },
            }
        }
        assert_eq!(seen, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec()]);
        assert_eq!(reader.read_buffered().unwrap(), Incoming::Empty);
    }

    #[test]
    fn answers_ping_through_writer() {
        let (mut reader, _writer, mut client) = connected();

        client.send(Message::Ping(vec![7u8].into())).unwrap();
        assert_eq!(reader.read_message().unwrap(), Incoming::Control);

        match client.read().unwrap() {
            Message::Pong(payload) => assert_eq!(payload.to_vec(), vec![7u8]),
            other => panic!("expected pong, got {other:?}"),
        }
    }

    #[test]
    fn writes_messages_with_opcode() {
        let (_reader, writer, mut client) = connected();

        writer.write_message(OpCode::Text, b"hi".to_vec()).unwrap();
        writer.write_message(OpCode::Binary, vec![0xff]).unwrap();

        assert_eq!(client.read().unwrap(), Message::text("hi"));
        assert_eq!(client.read().unwrap(), Message::binary(vec![0xffu8]));
    }

    #[test]
    fn rejects_non_utf8_text() {
        let (_reader, writer, _client) = connected();
        let err = writer.write_message(OpCode::Text, vec![0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, Error::InvalidUtf8(_)));
    }

    #[test]
    fn close_frame_ends_the_stream() {
        let (mut reader, _writer, mut client) = connected();
        client.close(None).unwrap();
        assert!(reader.read_message().is_err());
    }
}
