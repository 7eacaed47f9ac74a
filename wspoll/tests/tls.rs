//! Integration tests: websocket echo over rustls.
//!
//! The handler only ever sees the socket under the TLS session, so these check that
//! readiness still tracks the connection once a TLS layer buffers records on top.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::{ClientConfig, ClientConnection, ServerConfig, ServerConnection, StreamOwned};
use tungstenite::{Message, WebSocket};
use wspoll::{BufferedRead, Channel, Handler, OpCode, TlsStream, Transport};

type Client = WebSocket<StreamOwned<ClientConnection, TcpStream>>;

// ── Helpers ─────────────────────────────────────────────────────────

fn tls_configs() -> (Arc<ServerConfig>, Arc<ClientConfig>) {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let key = PrivatePkcs8KeyDer::from(cert.key_pair.serialize_der());
    let cert_der: CertificateDer<'static> = cert.cert.der().clone();

    let server = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], PrivateKeyDer::from(key))
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    (Arc::new(server), Arc::new(client))
}

fn echo(channel: &Arc<Channel>, op: OpCode, data: Vec<u8>) {
    channel.send(op, data);
}

fn tls_stream(
    addr: SocketAddr,
    config: Arc<ClientConfig>,
) -> StreamOwned<ClientConnection, TcpStream> {
    let tcp = TcpStream::connect(addr).unwrap();
    tcp.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let conn = ClientConnection::new(config, "localhost".try_into().unwrap()).unwrap();
    StreamOwned::new(conn, tcp)
}

fn connect(addr: SocketAddr, config: Arc<ClientConfig>) -> Client {
    let stream = tls_stream(addr, config);
    let (client, _) = tungstenite::client("ws://localhost/", stream)
        .unwrap_or_else(|e| panic!("websocket handshake failed: {e}"));
    client
}

/// Accepts one connection, wraps it in TLS and upgrades it.
fn accept_one(
    listener: &TcpListener,
    handler: &Handler,
    config: Arc<ServerConfig>,
) -> Arc<Channel> {
    let (tcp, _) = listener.accept().unwrap();
    let stream: TlsStream = StreamOwned::new(ServerConnection::new(config).unwrap(), tcp);
    handler.upgrade(stream).unwrap()
}

// ── Transport ───────────────────────────────────────────────────────

#[test]
fn tls_stream_exposes_its_tcp_socket() {
    let (server_config, _) = tls_configs();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = TcpStream::connect(addr).unwrap();
    let (tcp, _) = listener.accept().unwrap();
    let fd = tcp.as_raw_fd();
    let local = tcp.local_addr().unwrap();

    let stream: TlsStream = StreamOwned::new(ServerConnection::new(server_config).unwrap(), tcp);
    assert_eq!(stream.socket().as_raw_fd(), fd);
    assert_eq!(stream.socket().local_addr().unwrap(), local);
    assert_eq!(stream.socket().peer_addr().unwrap(), client.local_addr().unwrap());
}

#[test]
fn tls_half_drains_decrypted_bytes_only() {
    let (server_config, client_config) = tls_configs();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || {
        let mut stream = tls_stream(addr, client_config);
        stream.write_all(b"abc").unwrap();
        stream.flush().unwrap();
        stream
    });

    let (tcp, _) = listener.accept().unwrap();
    let stream: TlsStream = StreamOwned::new(ServerConnection::new(server_config).unwrap(), tcp);
    let (mut reader, _writer) = stream.split().unwrap();

    // Nothing decrypted yet, and the socket is left alone.
    let mut buf = [0u8; 8];
    let err = reader.read_buffered(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    // One record carries all three bytes; reading one leaves two in the session.
    let mut first = [0u8; 1];
    reader.read_exact(&mut first).unwrap();
    assert_eq!(&first, b"a");

    let n = reader.read_buffered(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"bc");
    let err = reader.read_buffered(&mut buf).unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::WouldBlock);

    let _client = client.join().unwrap();
}

// ── Handler over TLS ────────────────────────────────────────────────

#[test]
fn tls_echo_round_trip() {
    let (server_config, client_config) = tls_configs();
    let handler = Handler::new(echo, 1, 1).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || connect(addr, client_config));
    let _channel = accept_one(&listener, &handler, server_config);
    let mut client = client.join().unwrap();

    for _ in 0..3 {
        client.send(Message::text("test")).unwrap();
        assert_eq!(client.read().unwrap(), Message::text("test"));
    }
    client.send(Message::binary(vec![1u8, 2, 3])).unwrap();
    assert_eq!(client.read().unwrap(), Message::binary(vec![1u8, 2, 3]));
}

#[test]
fn tls_pipelined_messages_are_all_delivered() {
    let (server_config, client_config) = tls_configs();
    let handler = Handler::new(echo, 2, 1).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || connect(addr, client_config));
    let _channel = accept_one(&listener, &handler, server_config);
    let mut client = client.join().unwrap();

    // Several rounds, so the channel has to re-arm after each drained burst.
    for round in 0..3 {
        for i in 0..5 {
            client.write(Message::text(format!("{round}-{i}"))).unwrap();
        }
        client.flush().unwrap();

        for i in 0..5 {
            assert_eq!(client.read().unwrap(), Message::text(format!("{round}-{i}")));
        }
    }
}

#[test]
fn tls_disconnect_closes_channel() {
    let (server_config, client_config) = tls_configs();
    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();
    let handler = Handler::new(echo, 1, 1).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let client = thread::spawn(move || connect(addr, client_config));
    let channel = accept_one(&listener, &handler, server_config);
    channel.set_on_close(move || {
        let _ = closed_tx.send(());
    });
    let mut client = client.join().unwrap();

    client.send(Message::text("hello")).unwrap();
    assert_eq!(client.read().unwrap(), Message::text("hello"));
    drop(client);

    closed_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(channel.is_closed());
    assert_eq!(handler.open_channels(), 0);
}
