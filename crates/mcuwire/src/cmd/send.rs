use std::time::Duration;

use mcuwire_frame::{Connection, ConnectionConfig, PrefixWidth};

use crate::cmd::{open, parse_duration, SendArgs};
use crate::exit::{
    frame_error, io_error, CliError, CliResult, DATA_INVALID, SUCCESS, TIMEOUT, USAGE,
};
use crate::output::{print_payload, OutputFormat};

pub async fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let width = if args.framed {
        Some(PrefixWidth::from_bits(args.prefix_bits).map_err(|err| frame_error("send", err))?)
    } else {
        None
    };
    if let Some(width) = width {
        if payload.len() as u64 > width.max_length() {
            return Err(CliError::new(
                DATA_INVALID,
                format!(
                    "payload of {} bytes does not fit a {width} prefix",
                    payload.len()
                ),
            ));
        }
    }

    let config = ConnectionConfig {
        exact_read_timeout: Some(wait_timeout),
        ..ConnectionConfig::default()
    };
    let (lifecycle, conn) = open(&args.endpoint, config).await?;
    let result = exchange(&conn, &args, &payload, width, wait_timeout, format).await;
    lifecycle.disconnect().await;
    result
}

async fn exchange(
    conn: &Connection,
    args: &SendArgs,
    payload: &[u8],
    width: Option<PrefixWidth>,
    wait_timeout: Duration,
    format: OutputFormat,
) -> CliResult<i32> {
    let endpoint = args.endpoint.to_string();
    let sent = match width {
        Some(width) => conn.write_frame(payload, width).await,
        None => conn.write(payload).await,
    };
    sent.map_err(|err| frame_error("send failed", err))?;
    tracing::info!(%endpoint, size = payload.len(), framed = args.framed, "payload sent");

    if !args.wait {
        return Ok(SUCCESS);
    }

    let response = match width {
        Some(width) => conn
            .read_frame(width)
            .await
            .map_err(|err| frame_error("receive failed", err))?,
        None => conn
            .read_response(args.max_response, wait_timeout)
            .await
            .map_err(|err| frame_error("receive failed", err))?,
    };
    if response.is_empty() && width.is_none() {
        return Err(CliError::new(
            TIMEOUT,
            format!("no response within {wait_timeout:?}"),
        ));
    }

    print_payload(&response, &endpoint, format);
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(encoded) = &args.hex {
        return hex::decode(encoded.trim())
            .map_err(|err| CliError::new(USAGE, format!("invalid --hex payload: {err}")));
    }
    if let Some(path) = &args.file {
        return std::fs::read(path).map_err(|err| io_error("payload file read failed", err));
    }

    Err(CliError::new(
        USAGE,
        "one of --data, --hex, or --file is required",
    ))
}
