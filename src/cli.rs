//! # Command-Line Interface for `failover-bench`
//!
//! Argument parsing for the soak/latency harness that drives a
//! [`crate::FailoverTransport`] against a broker. With no `--uri` the
//! harness starts an in-process stub broker on a loopback port, which makes
//! the failover scenarios (`--pause-broker-ms`) self-contained.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Self-contained soak against the embedded stub broker
//! failover-bench -n 50000 -s 512
//!
//! # Exercise failover: pause the embedded broker for 500ms mid-run
//! failover-bench -n 10000 --pause-broker-ms 500
//!
//! # Point at a real broker cluster
//! failover-bench --uri "failover:(tcp://a:61616,tcp://b:61616)?randomize=false"
//! ```

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;

/// Help styling kept close to clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Failover URI to benchmark against
    ///
    /// When omitted, an in-process stub broker is started and a
    /// single-candidate failover URI pointing at it is used.
    #[arg(long, help_heading = "Core Options")]
    pub uri: Option<String>,

    /// Number of messages to send
    #[arg(short = 'n', long, default_value_t = 10_000, help_heading = "Core Options")]
    pub message_count: usize,

    /// Message payload size in bytes
    #[arg(short = 's', long, default_value_t = 1024, help_heading = "Core Options")]
    pub message_size: usize,

    /// Queue name messages are produced to (and consumed from)
    #[arg(long, default_value = "bench.queue", help_heading = "Core Options")]
    pub queue: String,

    /// Measure send-side latency only; skip the consuming side
    #[arg(long, default_value_t = false, help_heading = "Core Options")]
    pub one_way: bool,

    /// Warmup messages excluded from the measurements
    #[arg(short = 'w', long, default_value_t = 100)]
    pub warmup: usize,

    /// Pause the embedded stub broker for this many milliseconds halfway
    /// through the run, forcing a failover cycle under load
    ///
    /// Only meaningful without --uri.
    #[arg(long, help_heading = "Failover")]
    pub pause_broker_ms: Option<u64>,

    /// Percentiles reported in the latency summary
    #[arg(long, default_values_t = vec![50.0, 95.0, 99.0, 99.9])]
    pub percentiles: Vec<f64>,

    /// JSON results output path
    #[arg(short = 'o', long, help_heading = "Output and Logging")]
    pub output_file: Option<PathBuf>,

    /// Suppress the colorized stdout log (file log is unaffected)
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Detailed log destination: a path, or "stderr"
    #[arg(long, help_heading = "Output and Logging")]
    pub log_file: Option<String>,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Basic cross-field validation clap cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.message_count == 0 {
            anyhow::bail!("message-count must be greater than 0");
        }
        if self.message_size == 0 {
            anyhow::bail!("message-size must be greater than 0");
        }
        if self.uri.is_some() && self.pause_broker_ms.is_some() {
            anyhow::bail!("--pause-broker-ms only applies to the embedded stub broker");
        }
        for p in &self.percentiles {
            if !(0.0..=100.0).contains(p) {
                anyhow::bail!("percentile {p} is outside 0..=100");
            }
        }
        Ok(())
    }
}
