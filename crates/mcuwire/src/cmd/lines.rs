use mcuwire_frame::{spawn_line_stream, ConnectionConfig, LineConfig, LineReader};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cmd::{open, parse_duration, LinesArgs};
use crate::exit::{frame_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_line, OutputFormat};

pub async fn run(args: LinesArgs, format: OutputFormat) -> CliResult<i32> {
    if args.max_line == 0 {
        return Err(CliError::new(USAGE, "--max-line must be at least 1"));
    }
    let config = LineConfig {
        timeout: parse_duration(&args.timeout)?,
        max_line_length: args.max_line,
    };
    let endpoint = args.endpoint.to_string();

    let (lifecycle, conn) = open(&args.endpoint, ConnectionConfig::default()).await?;
    let mut lines = spawn_line_stream(conn, LineReader::new(), config, CancellationToken::new());

    let mut received = 0usize;
    let result = loop {
        if args.count.is_some_and(|limit| received >= limit) {
            break Ok(SUCCESS);
        }
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping");
                break Ok(SUCCESS);
            }
            next = lines.recv() => next,
        };
        match next {
            Some(Ok(line)) => {
                received += 1;
                print_line(&line, &endpoint, format);
            }
            Some(Err(err)) => break Err(frame_error("read failed", err)),
            None => break Ok(SUCCESS),
        }
    };

    let _ = lines.stop().await;
    lifecycle.disconnect().await;
    info!(%endpoint, lines = received, "line monitor finished");
    result
}
