//! Print lines from a device until it goes quiet.
//!
//! Run with:
//!   cargo run -p mcuwire --example line-monitor -- tcp://192.168.4.1:23
//!
//! Without an argument a local peer emits a few CRLF-terminated readings.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use mcuwire::frame::{spawn_line_stream, Connection, ConnectionConfig, LineConfig, LineReader};
use mcuwire::transport::TransportConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let endpoint: TransportConfig = match std::env::args().nth(1) {
        Some(arg) => arg.parse()?,
        None => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let port = listener.local_addr()?.port();
            tokio::spawn(async move {
                if let Ok((mut socket, _)) = listener.accept().await {
                    for reading in ["T=21.5\r\n", "T=21.6\r", "\nT=21.8\n"] {
                        let _ = socket.write_all(reading.as_bytes()).await;
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            });
            TransportConfig::stream("127.0.0.1", port)
        }
    };

    let conn = Arc::new(Connection::open(&endpoint, ConnectionConfig::default()).await?);
    let config = LineConfig {
        timeout: Duration::from_secs(2),
        ..LineConfig::default()
    };
    let cancel = CancellationToken::new();
    let mut lines = spawn_line_stream(conn.clone(), LineReader::new(), config, cancel);

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => println!("{line}"),
            Err(err) => {
                eprintln!("stream ended: {err}");
                break;
            }
        }
    }

    conn.close().await;
    Ok(())
}
