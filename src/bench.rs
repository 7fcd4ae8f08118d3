//! # Soak/Latency Runner
//!
//! Drives a [`FailoverTransport`] end to end: builds the broker-side state
//! (connection, session, consumer, producer), produces a stream of messages
//! while measuring send and round-trip latency, and optionally pauses the
//! embedded stub broker mid-run to force a failover cycle under load.
//!
//! Duplicate deliveries caused by replay are detected with a
//! [`MessageAudit`] and dropped from the round-trip accounting, mirroring
//! what a consuming client does after a reconnect.

use crate::audit::MessageAudit;
use crate::broker::StubBroker;
use crate::cli::Args;
use crate::commands::{
    Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Destination,
    Message, MessageId, ProducerId, ProducerInfo, SessionId, SessionInfo,
};
use crate::metrics::{LatencyCollector, LatencyMetrics, LatencyType, ThroughputCalculator,
    ThroughputMetrics};
use crate::transport::{Transport, TransportListener};
use crate::FailoverTransport;
use anyhow::{Context, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Final results of one bench run.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub run_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub uri: String,
    pub message_count: usize,
    pub message_size: usize,
    pub send_latency: LatencyMetrics,
    pub round_trip_latency: Option<LatencyMetrics>,
    pub throughput: ThroughputMetrics,
    pub interruptions: usize,
    pub resumptions: usize,
    pub duplicates_dropped: usize,
    pub lost_round_trips: usize,
}

struct BenchListener {
    dispatches: mpsc::UnboundedSender<i64>,
    audit: MessageAudit,
    duplicates: AtomicUsize,
    interruptions: Arc<AtomicUsize>,
    resumptions: Arc<AtomicUsize>,
}

impl TransportListener for BenchListener {
    fn on_command(&self, command: Command) {
        if let CommandBody::MessageDispatch(dispatch) = &command.body {
            if let Some(message) = &dispatch.message {
                if self.audit.is_duplicate(&message.message_id) {
                    self.duplicates.fetch_add(1, Ordering::SeqCst);
                    return;
                }
                let _ = self.dispatches.send(message.message_id.producer_sequence_id);
            }
        }
    }

    fn on_exception(&self, error: crate::error::TransportError) {
        warn!(%error, "bench listener observed transport exception");
    }

    fn transport_interrupted(&self) {
        self.interruptions.fetch_add(1, Ordering::SeqCst);
    }

    fn transport_resumed(&self) {
        self.resumptions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Executes the configured run and produces a [`BenchReport`].
pub struct BenchRunner {
    args: Args,
}

impl BenchRunner {
    pub fn new(args: Args) -> Self {
        Self { args }
    }

    pub async fn run(&self) -> Result<BenchReport> {
        let args = &self.args;

        // Embedded broker unless the caller pointed us somewhere real.
        let broker = match args.uri {
            Some(_) => None,
            None => Some(StubBroker::start().await?),
        };
        let uri = match (&args.uri, &broker) {
            (Some(uri), _) => uri.clone(),
            (None, Some(broker)) => format!(
                "failover:({})?maxReconnectAttempts=-1&startupMaxReconnectAttempts=-1&\
                 randomize=false&trackMessages=true",
                broker.uri_string()
            ),
            _ => unreachable!(),
        };
        info!(%uri, "bench starting");

        let transport = FailoverTransport::from_uri(&uri).context("building transport")?;
        let (dispatch_tx, mut dispatch_rx) = mpsc::unbounded_channel();
        let interruptions = Arc::new(AtomicUsize::new(0));
        let resumptions = Arc::new(AtomicUsize::new(0));
        let listener = Arc::new(BenchListener {
            dispatches: dispatch_tx,
            audit: MessageAudit::new(),
            duplicates: AtomicUsize::new(0),
            interruptions: interruptions.clone(),
            resumptions: resumptions.clone(),
        });
        transport.set_listener(listener.clone());
        transport.start().await.context("starting transport")?;

        // Broker-side state: connection → session → consumer + producer.
        let connection_id = ConnectionId::new(format!("ID:bench-{}", uuid::Uuid::new_v4()));
        let session_id = SessionId::new(&connection_id, 1);
        let producer_id = ProducerId::new(&session_id, 1);
        let destination = Destination::queue(args.queue.clone());

        transport
            .oneway(Command::request(CommandBody::ConnectionInfo(ConnectionInfo::new(
                connection_id.clone(),
                format!("failover-bench-{}", std::process::id()),
            ))))
            .await?;
        transport
            .oneway(Command::request(CommandBody::SessionInfo(SessionInfo {
                session_id: session_id.clone(),
            })))
            .await?;
        if !args.one_way {
            let consumer_id = ConsumerId::new(&session_id, 1);
            transport
                .oneway(Command::request(CommandBody::ConsumerInfo(ConsumerInfo::new(
                    consumer_id,
                    destination.clone(),
                ))))
                .await?;
        }
        transport
            .oneway(Command::request(CommandBody::ProducerInfo(ProducerInfo::new(
                producer_id.clone(),
                Some(destination.clone()),
            ))))
            .await?;

        let mut send_latency = LatencyCollector::new(LatencyType::OneWay)?;
        let mut round_trip_latency = LatencyCollector::new(LatencyType::RoundTrip)?;
        let mut throughput = ThroughputCalculator::new();
        let mut lost_round_trips = 0usize;
        let payload = vec![0u8; args.message_size];

        let total = args.warmup + args.message_count;
        let halfway = args.warmup + args.message_count / 2;
        for index in 0..total {
            let measured = index >= args.warmup;
            if measured && index == halfway {
                if let (Some(pause_ms), Some(broker)) = (args.pause_broker_ms, &broker) {
                    info!(pause_ms, "pausing broker mid-run");
                    broker.pause();
                    let resume_after = Duration::from_millis(pause_ms);
                    tokio::time::sleep(resume_after).await;
                    broker.resume();
                    info!("broker resumed");
                }
            }

            let sequence = index as i64 + 1;
            let mut message = Message::new(
                MessageId {
                    producer_id: producer_id.clone(),
                    producer_sequence_id: sequence,
                },
                destination.clone(),
                payload.clone(),
            );
            message.timestamp = chrono::Utc::now().timestamp_millis();
            let mut command = Command::new(CommandBody::Message(message));
            command.response_required = true;

            let send_start = Instant::now();
            transport.oneway(command).await.context("send failed")?;
            if measured {
                send_latency.record(send_start.elapsed())?;
                throughput.record_message(args.message_size);
            }

            if !args.one_way {
                // Wait for this sequence to come back around; replays can
                // reorder, so drain until we see it or give up.
                let mut seen = false;
                while !seen {
                    match tokio::time::timeout(Duration::from_secs(10), dispatch_rx.recv()).await
                    {
                        Ok(Some(received)) if received == sequence => seen = true,
                        Ok(Some(_)) => continue,
                        Ok(None) => anyhow::bail!("dispatch channel closed"),
                        Err(_) => {
                            warn!(sequence, "round trip timed out");
                            lost_round_trips += 1;
                            break;
                        }
                    }
                }
                if seen && measured {
                    round_trip_latency.record(send_start.elapsed())?;
                }
            }
        }

        transport.close().await.ok();
        if let Some(broker) = &broker {
            broker.shutdown();
        }

        let report = BenchReport {
            run_id: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now(),
            uri,
            message_count: args.message_count,
            message_size: args.message_size,
            send_latency: send_latency.metrics(&args.percentiles),
            round_trip_latency: (!args.one_way)
                .then(|| round_trip_latency.metrics(&args.percentiles)),
            throughput: throughput.metrics(),
            interruptions: interruptions.load(Ordering::SeqCst),
            resumptions: resumptions.load(Ordering::SeqCst),
            duplicates_dropped: listener.duplicates.load(Ordering::SeqCst),
            lost_round_trips,
        };

        if let Some(path) = &args.output_file {
            let json = serde_json::to_string_pretty(&report)?;
            std::fs::write(path, json)
                .with_context(|| format!("writing results to {}", path.display()))?;
            info!(path = %path.display(), "results written");
        }
        Ok(report)
    }
}

impl BenchReport {
    /// Logs a human-readable summary through the tracing pipeline.
    pub fn log_summary(&self) {
        use crate::metrics::format_latency;
        info!("── bench summary ──────────────────────────────");
        info!("messages: {} × {}B over {}", self.message_count, self.message_size, self.uri);
        info!(
            "throughput: {:.0} msg/s ({:.1} MiB/s)",
            self.throughput.messages_per_second,
            self.throughput.bytes_per_second / (1024.0 * 1024.0)
        );
        info!(
            "send latency: mean {} / max {}",
            format_latency(self.send_latency.mean_ns as u64),
            format_latency(self.send_latency.max_ns)
        );
        for p in &self.send_latency.percentiles {
            info!("  send p{}: {}", p.percentile, format_latency(p.value_ns));
        }
        if let Some(rt) = &self.round_trip_latency {
            info!(
                "round trip: mean {} / max {}",
                format_latency(rt.mean_ns as u64),
                format_latency(rt.max_ns)
            );
        }
        if self.interruptions > 0 || self.duplicates_dropped > 0 {
            info!(
                "failover: {} interruption(s), {} resumption(s), {} duplicate(s) dropped, {} lost",
                self.interruptions, self.resumptions, self.duplicates_dropped,
                self.lost_round_trips
            );
        }
    }
}
