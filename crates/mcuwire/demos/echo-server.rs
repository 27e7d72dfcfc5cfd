//! Framed echo peer plus a client that talks to it through a lifecycle.
//!
//! Run with:
//!   cargo run -p mcuwire --example echo-server
//!
//! The server half stands in for a microcontroller that answers every
//! 16-bit length-prefixed frame with the same payload.

use mcuwire::frame::{ConnectionConfig, PrefixWidth};
use mcuwire::link::{AlwaysGrant, ConnectionLifecycle, DefaultConnector, DeviceIdentity};
use mcuwire::transport::TransportConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    eprintln!("Device listening on {addr}");

    tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else {
            return;
        };
        let mut header = [0u8; 2];
        while socket.read_exact(&mut header).await.is_ok() {
            let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
            if socket.read_exact(&mut payload).await.is_err() {
                break;
            }
            if socket.write_all(&header).await.is_err() || socket.write_all(&payload).await.is_err()
            {
                break;
            }
        }
    });

    let endpoint = TransportConfig::stream("127.0.0.1", addr.port());
    let lifecycle = ConnectionLifecycle::new(AlwaysGrant, DefaultConnector)
        .with_connection_config(ConnectionConfig::default());
    let mut states = lifecycle.subscribe();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            eprintln!("state: {}", *states.borrow_and_update());
        }
    });

    let conn = lifecycle
        .connect(DeviceIdentity::from_endpoint(endpoint.to_string()), endpoint)
        .await?;

    for message in ["PING", "STATUS?", ""] {
        conn.write_frame(message.as_bytes(), PrefixWidth::U16).await?;
        let reply = conn.read_frame(PrefixWidth::U16).await?;
        eprintln!(
            "sent {:?}, got {:?}",
            message,
            String::from_utf8_lossy(&reply)
        );
    }

    lifecycle.disconnect().await;
    drop(lifecycle);
    let _ = watcher.await;
    Ok(())
}
