//! # failover-bench - Main Entry Point
//!
//! Soak/latency harness for the failover transport. The run proceeds in
//! four steps:
//!
//! 1. **Initialize logging**: a detailed rolling file (or stderr) layer plus
//!    an optional colorized stdout layer.
//! 2. **Parse and validate arguments**.
//! 3. **Run the bench**: drive a failover transport against the configured
//!    broker (or an embedded stub broker), optionally pausing the broker
//!    mid-run to exercise a failover cycle.
//! 4. **Report**: human-readable summary to the log, JSON to `--output-file`
//!    when requested.

use anyhow::Result;
use clap::Parser;
use openwire_failover::bench::BenchRunner;
use openwire_failover::cli::Args;
use tracing::info;
use tracing_subscriber::{filter::LevelFilter, prelude::*, Layer};

mod logging;
use logging::ComponentFormatter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;

    // Verbosity: default INFO, -v DEBUG, -vv TRACE. Applies to both the
    // detailed layer and stdout.
    let log_level = match args.verbose {
        0 => LevelFilter::INFO,
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };

    // Detailed layer: a daily-rolling file unless "stderr" was requested.
    // The appender guard must stay alive for the duration of the run.
    let guard;
    let detailed_layer;
    if let Some("stderr") = args.log_file.as_deref() {
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(log_level)
            .boxed();
        guard = None;
    } else {
        let file_appender = match args.log_file.as_deref() {
            Some(path_str) => {
                let log_path = std::path::Path::new(path_str);
                let log_dir =
                    log_path.parent().unwrap_or_else(|| std::path::Path::new("."));
                let log_name = log_path
                    .file_name()
                    .unwrap_or_else(|| std::ffi::OsStr::new("failover_bench.log"));
                tracing_appender::rolling::daily(log_dir, log_name)
            }
            None => tracing_appender::rolling::daily(".", "failover_bench.log"),
        };
        let (non_blocking, file_guard) = tracing_appender::non_blocking(file_appender);
        detailed_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(log_level)
            .boxed();
        guard = Some(file_guard);
    }

    // Clean, component-tagged output unless --quiet.
    let stdout_layer = if !args.quiet {
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stdout)
                .event_format(ComponentFormatter)
                .with_filter(log_level),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(detailed_layer)
        .with(stdout_layer)
        .init();
    let _log_guard = guard;

    info!("failover-bench {} starting", openwire_failover::VERSION);

    let report = BenchRunner::new(args).run().await?;
    report.log_summary();

    info!("failover-bench completed");
    Ok(())
}
