//! Websocket echo server.
//!
//! ```text
//! RUST_LOG=wspoll=debug cargo run --example echo_server -- 127.0.0.1:9001
//! ```

use std::net::TcpListener;
use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;
use wspoll::{Config, Handler};

fn main() -> wspoll::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:9001".to_string());

    let config = Config::default()
        .read_concurrency(8)
        .write_concurrency(4)
        .idle_timeout(Some(Duration::from_secs(60)));

    let handler = Handler::with_config(
        |channel, op, data| {
            channel.send(op, data);
        },
        config,
    )?;

    let listener = TcpListener::bind(&addr)?;
    info!(%addr, "echo server listening");
    handler.serve(&listener)
}
