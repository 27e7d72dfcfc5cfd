use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use mcuwire_frame::{decode_datagram, encode, LengthPrefixCodec, PrefixWidth};
use mcuwire_transport::{TransportConfig, MAX_DATAGRAM_SIZE};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cmd::EchoArgs;
use crate::exit::{frame_error, io_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_listening, OutputFormat};

pub async fn run(args: EchoArgs, format: OutputFormat) -> CliResult<i32> {
    let width = if args.framed {
        Some(PrefixWidth::from_bits(args.prefix_bits).map_err(|err| frame_error("echo", err))?)
    } else {
        None
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("interrupt received, shutting down"),
            Err(err) => warn!(error = %err, "signal handler setup failed"),
        }
        signal.cancel();
    });

    match &args.endpoint {
        TransportConfig::Stream { host, port } => {
            let listener = TcpListener::bind((host.as_str(), *port))
                .await
                .map_err(|err| io_error("bind failed", err))?;
            let local = listener
                .local_addr()
                .map_err(|err| io_error("bind failed", err))?;
            print_listening(local, "tcp", args.framed, format);
            serve_stream(listener, width, args.max_payload, shutdown).await
        }
        TransportConfig::Datagram { host, port } => {
            let socket = UdpSocket::bind((host.as_str(), *port))
                .await
                .map_err(|err| io_error("bind failed", err))?;
            let local = socket
                .local_addr()
                .map_err(|err| io_error("bind failed", err))?;
            print_listening(local, "udp", args.framed, format);
            serve_datagram(socket, width, args.max_payload, shutdown).await
        }
        TransportConfig::Serial(_) => Err(CliError::new(
            USAGE,
            "echo serves tcp:// or udp:// endpoints only",
        )),
    }
}

async fn serve_stream(
    listener: TcpListener,
    width: Option<PrefixWidth>,
    max_payload: usize,
    shutdown: CancellationToken,
) -> CliResult<i32> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SUCCESS),
            accepted = listener.accept() => {
                accepted.map_err(|err| io_error("accept failed", err))?
            }
        };
        info!(%peer, "client connected");

        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                result = echo_stream(stream, width, max_payload) => result,
            };
            match result {
                Ok(()) => info!(%peer, "client disconnected"),
                Err(err) => warn!(%peer, error = %err, "echo session failed"),
            }
        });
    }
}

async fn echo_stream(
    stream: TcpStream,
    width: Option<PrefixWidth>,
    max_payload: usize,
) -> CliResult<()> {
    match width {
        Some(width) => {
            let codec = LengthPrefixCodec::new(width).with_max_payload(max_payload);
            let mut framed = Framed::new(stream, codec);
            while let Some(frame) = framed.next().await {
                let frame = frame.map_err(|err| frame_error("receive failed", err))?;
                debug!(size = frame.payload.len(), "echoing frame");
                framed
                    .send(frame.payload)
                    .await
                    .map_err(|err| frame_error("echo send failed", err))?;
            }
            Ok(())
        }
        None => {
            let (mut reader, mut writer) = stream.into_split();
            let copied = tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(|err| io_error("echo failed", err))?;
            debug!(bytes = copied, "raw echo finished");
            Ok(())
        }
    }
}

async fn serve_datagram(
    socket: UdpSocket,
    width: Option<PrefixWidth>,
    max_payload: usize,
    shutdown: CancellationToken,
) -> CliResult<i32> {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
    loop {
        let (len, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(SUCCESS),
            received = socket.recv_from(&mut buf) => {
                received.map_err(|err| io_error("receive failed", err))?
            }
        };
        let datagram = &buf[..len];

        let reply = match width {
            Some(width) => match decode_datagram(datagram, width, Some(max_payload)) {
                Ok(frame) => encode(&frame.payload, width.bits())
                    .map_err(|err| frame_error("echo encode failed", err))?,
                Err(err) => {
                    warn!(%peer, error = %err, "dropping malformed datagram");
                    continue;
                }
            },
            None => Bytes::copy_from_slice(datagram),
        };

        debug!(%peer, size = reply.len(), "echoing datagram");
        socket
            .send_to(&reply, peer)
            .await
            .map_err(|err| io_error("echo send failed", err))?;
    }
}
