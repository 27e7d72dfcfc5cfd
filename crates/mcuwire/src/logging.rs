use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::filter::ParseError;
use tracing_subscriber::EnvFilter;

/// Crates whose events follow `--log-level`; everything else stays at `warn`.
const OWN_TARGETS: [&str; 4] = [
    "mcuwire",
    "mcuwire_transport",
    "mcuwire_frame",
    "mcuwire_link",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
}

/// Filter applying `level` to the mcuwire crates only.
pub fn default_filter(level: LogLevel) -> EnvFilter {
    let level = LevelFilter::from(level);
    OWN_TARGETS
        .iter()
        .fold(EnvFilter::new("warn"), |filter, target| {
            match format!("{target}={level}").parse() {
                Ok(directive) => filter.add_directive(directive),
                Err(_) => filter,
            }
        })
}

/// Build the event filter from `MCUWIRE_LOG`-style directives, if any.
///
/// Directives use the `target=level` syntax, for example
/// `mcuwire_frame=trace,tokio=debug`.
pub fn log_filter(level: LogLevel, directives: Option<&str>) -> Result<EnvFilter, ParseError> {
    match directives.map(str::trim).filter(|d| !d.is_empty()) {
        Some(directives) => EnvFilter::try_new(directives),
        None => Ok(default_filter(level)),
    }
}

/// Install the stderr subscriber. Stdout is reserved for command output.
///
/// Targets are shown once debugging is on, where events from several crates
/// interleave.
pub fn init_logging(format: LogFormat, level: LogLevel, directives: Option<&str>) {
    let (filter, rejected) = match log_filter(level, directives) {
        Ok(filter) => (filter, None),
        Err(err) => (default_filter(level), Some(err)),
    };
    let custom = directives.is_some_and(|d| !d.trim().is_empty());
    let show_targets = custom || matches!(level, LogLevel::Debug | LogLevel::Trace);

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_ansi(false)
        .with_target(show_targets);

    // A subscriber may already be installed (tests); keep the first one.
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(false).try_init(),
    };

    if let Some(err) = rejected {
        warn!(error = %err, "ignoring invalid log filter, using --log-level");
    }
}
