//! Binary entry point: logging, the async runtime, and exit codes.

#![allow(clippy::print_stderr)]

use anyhow::Context;
use clap::Parser;
use exitmap::Args;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::prelude::*;

/// Translate the `-v` flag into a default tracing filter.
///
/// `RUST_LOG` wins when set, so operators can still get per-crate
/// filtering.
fn default_filter(verbosity: &str) -> anyhow::Result<EnvFilter> {
    let level = match verbosity {
        // The historical level names, mapped onto tracing's.
        "warning" => "warn",
        "critical" => "error",
        other => other,
    };
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .with_context(|| format!("bad verbosity level {:?}", verbosity))
}

/// Install the log subscriber, to stderr and optionally to a file.
fn setup_logging(args: &Args) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = default_filter(&args.verbosity)?;
    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    match &args.logfile {
        Some(path) => {
            let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let name = path.file_name().unwrap_or_else(|| "exitmap.log".as_ref());
            let appender = tracing_appender::rolling::never(dir, name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();
            Ok(None)
        }
    }
}

fn main() {
    let args = Args::parse();
    let _guard = match setup_logging(&args) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("exitmap: {:#}", e);
            std::process::exit(1);
        }
    };

    let outcome = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(anyhow::Error::from)
        .and_then(|runtime| runtime.block_on(exitmap::run(args)).map_err(Into::into));

    match outcome {
        Ok(()) => {}
        Err(e) => {
            error!("Failed to run because: {:#}", e);
            std::process::exit(1);
        }
    }
}
