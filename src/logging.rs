//! tracing subscriber setup
//!
//! Console output goes to stderr so stdout only ever carries results. The
//! optional log file is written through a non-blocking appender; the
//! returned guard must stay alive until exit to flush it.
use crate::config::{LogLevel, LoggingConfig};
use std::io;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

/// Level used when neither RUST_LOG nor `--verbose` says otherwise
pub fn effective_level(config: &LoggingConfig, verbose: u8) -> LogLevel {
    match verbose {
        0 => config.level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    }
}

/// Default filter directive: our crate at `level`, dependencies at `warn`.
pub fn filter_directive(level: LogLevel) -> String {
    format!("warn,kopikita_agent={}", level)
}

/// Install the global subscriber. Returns the file writer guard, if any.
pub fn init(config: &LoggingConfig, verbose: u8) -> io::Result<Option<WorkerGuard>> {
    let level = effective_level(config, verbose);
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let (file_writer, guard) = if config.file_output {
        let path = Path::new(&config.file_path);
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "agent.log".into());
        let appender = tracing_appender::rolling::never(dir, file_name);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (Some(writer), Some(guard))
    } else {
        (None, None)
    };

    let writer = match (config.console_output, file_writer) {
        (true, Some(file)) => BoxMakeWriter::new(io::stderr.and(file)),
        (true, None) => BoxMakeWriter::new(io::stderr),
        (false, Some(file)) => BoxMakeWriter::new(file),
        (false, None) => BoxMakeWriter::new(io::sink),
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(config.console_output && !config.file_output)
        .with_target(false)
        .try_init();

    Ok(guard)
}
