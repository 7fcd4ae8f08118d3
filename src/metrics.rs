//! # Latency and Throughput Metrics
//!
//! Measurement support for the `failover-bench` harness. Latency is
//! collected into an HDR (High Dynamic Range) histogram, which records in
//! constant time regardless of value and computes percentiles without
//! keeping every sample, so measurement overhead does not distort the
//! numbers being measured.
//!
//! ## Measurement Patterns
//!
//! - **OneWay**: time from handing a message to the transport until the
//!   broker accepted it (send-side latency under failover).
//! - **RoundTrip**: time from send until the dispatch came back to a
//!   consumer on the same process.

use anyhow::Result;
use hdrhistogram::Histogram;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Latency measurement pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatencyType {
    /// Send-side latency: message handed to the transport → broker ack.
    OneWay,
    /// Full cycle: message sent → dispatch received back.
    RoundTrip,
}

/// A percentile level paired with its latency value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PercentileValue {
    /// Percentile level (0.0 to 100.0).
    pub percentile: f64,
    /// Latency at this percentile in nanoseconds.
    pub value_ns: u64,
}

/// Statistical summary of collected latencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyMetrics {
    pub latency_type: LatencyType,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: f64,
    pub std_dev_ns: f64,
    pub percentiles: Vec<PercentileValue>,
    pub total_samples: usize,
}

/// Message-rate and byte-rate summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThroughputMetrics {
    pub messages_per_second: f64,
    pub bytes_per_second: f64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub duration_ns: u64,
}

/// HDR-histogram-backed latency collector.
pub struct LatencyCollector {
    latency_type: LatencyType,
    histogram: Histogram<u64>,
}

impl LatencyCollector {
    /// Three significant digits over a 1ns..1h range covers everything a
    /// transport bench can produce.
    pub fn new(latency_type: LatencyType) -> Result<Self> {
        let histogram = Histogram::new_with_bounds(1, 3_600_000_000_000, 3)?;
        Ok(Self { latency_type, histogram })
    }

    pub fn record(&mut self, latency: Duration) -> Result<()> {
        let nanos = latency.as_nanos().max(1) as u64;
        self.histogram.saturating_record(nanos);
        Ok(())
    }

    pub fn sample_count(&self) -> u64 {
        self.histogram.len()
    }

    /// Summarises into [`LatencyMetrics`] at the requested percentiles.
    pub fn metrics(&self, percentiles: &[f64]) -> LatencyMetrics {
        let percentile_values = percentiles
            .iter()
            .map(|&p| PercentileValue {
                percentile: p,
                value_ns: self.histogram.value_at_percentile(p),
            })
            .collect();

        LatencyMetrics {
            latency_type: self.latency_type,
            min_ns: self.histogram.min(),
            max_ns: self.histogram.max(),
            mean_ns: self.histogram.mean(),
            median_ns: self.histogram.value_at_percentile(50.0) as f64,
            std_dev_ns: self.histogram.stdev(),
            percentiles: percentile_values,
            total_samples: self.histogram.len() as usize,
        }
    }

    pub fn reset(&mut self) {
        self.histogram.reset();
    }
}

/// Wall-clock throughput accumulator.
pub struct ThroughputCalculator {
    started: Instant,
    messages: u64,
    bytes: u64,
}

impl ThroughputCalculator {
    pub fn new() -> Self {
        Self { started: Instant::now(), messages: 0, bytes: 0 }
    }

    pub fn record_message(&mut self, message_size: usize) {
        self.messages += 1;
        self.bytes += message_size as u64;
    }

    pub fn metrics(&self) -> ThroughputMetrics {
        let elapsed = self.started.elapsed();
        let seconds = elapsed.as_secs_f64().max(f64::EPSILON);
        ThroughputMetrics {
            messages_per_second: self.messages as f64 / seconds,
            bytes_per_second: self.bytes as f64 / seconds,
            total_messages: self.messages,
            total_bytes: self.bytes,
            duration_ns: elapsed.as_nanos() as u64,
        }
    }
}

impl Default for ThroughputCalculator {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable latency formatter for summary output.
pub fn format_latency(latency_ns: u64) -> String {
    if latency_ns < 1_000 {
        format!("{latency_ns}ns")
    } else if latency_ns < 1_000_000 {
        format!("{:.1}µs", latency_ns as f64 / 1_000.0)
    } else if latency_ns < 1_000_000_000 {
        format!("{:.2}ms", latency_ns as f64 / 1_000_000.0)
    } else {
        format!("{:.2}s", latency_ns as f64 / 1_000_000_000.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collector_summarises_percentiles() {
        let mut collector = LatencyCollector::new(LatencyType::RoundTrip).unwrap();
        for micros in 1..=1000u64 {
            collector.record(Duration::from_micros(micros)).unwrap();
        }
        let metrics = collector.metrics(&[50.0, 99.0]);
        assert_eq!(metrics.total_samples, 1000);
        assert!(metrics.min_ns >= 1_000 - 8);
        assert_eq!(metrics.percentiles.len(), 2);
        // P50 should land near 500µs given the uniform ramp.
        let p50 = metrics.percentiles[0].value_ns;
        assert!((400_000..600_000).contains(&p50), "p50 was {p50}");
    }

    #[test]
    fn throughput_accumulates() {
        let mut calc = ThroughputCalculator::new();
        for _ in 0..10 {
            calc.record_message(1024);
        }
        let metrics = calc.metrics();
        assert_eq!(metrics.total_messages, 10);
        assert_eq!(metrics.total_bytes, 10 * 1024);
        assert!(metrics.messages_per_second > 0.0);
    }

    #[test]
    fn latency_formatting() {
        assert_eq!(format_latency(500), "500ns");
        assert_eq!(format_latency(1_500), "1.5µs");
        assert_eq!(format_latency(2_500_000), "2.50ms");
    }
}
