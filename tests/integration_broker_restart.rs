use anyhow::Result;
use openwire_failover::broker::StubBroker;
use openwire_failover::commands::{
    Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Destination,
    Message, MessageId, ProducerId, ProducerInfo, SessionId, SessionInfo,
};
use openwire_failover::{FailoverTransport, MessageAudit, Transport, TransportListener};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Listener that deduplicates replayed deliveries the way a consuming
/// client does, and counts the interrupt/resume notifications.
struct RestartAwareCollector {
    dispatches: mpsc::UnboundedSender<i64>,
    audit: MessageAudit,
    interruptions: Arc<AtomicUsize>,
    resumptions: Arc<AtomicUsize>,
}

impl TransportListener for RestartAwareCollector {
    fn on_command(&self, command: Command) {
        if let CommandBody::MessageDispatch(dispatch) = command.body {
            if let Some(message) = dispatch.message {
                if !self.audit.is_duplicate(&message.message_id) {
                    let _ = self.dispatches.send(message.message_id.producer_sequence_id);
                }
            }
        }
    }
    fn on_exception(&self, _error: openwire_failover::TransportError) {}
    fn transport_interrupted(&self) {
        self.interruptions.fetch_add(1, Ordering::SeqCst);
    }
    fn transport_resumed(&self) {
        self.resumptions.fetch_add(1, Ordering::SeqCst);
    }
}

/// Send a stream of messages while the broker goes away mid-run. Every
/// message must eventually be delivered, in producer order, and the
/// interrupted/resumed notifications must both fire.
#[tokio::test]
async fn broker_restart_under_load() -> Result<()> {
    const TOTAL: i64 = 200;
    const PAUSE_AT: i64 = 100;

    let broker = StubBroker::start().await?;
    let transport = FailoverTransport::from_uri(&format!(
        "failover:({})?randomize=false&maxReconnectAttempts=-1&\
         startupMaxReconnectAttempts=-1&initialReconnectDelay=10&trackMessages=true",
        broker.uri_string()
    ))?;

    let (tx, mut dispatches) = mpsc::unbounded_channel();
    let interruptions = Arc::new(AtomicUsize::new(0));
    let resumptions = Arc::new(AtomicUsize::new(0));
    transport.set_listener(Arc::new(RestartAwareCollector {
        dispatches: tx,
        audit: MessageAudit::new(),
        interruptions: interruptions.clone(),
        resumptions: resumptions.clone(),
    }));
    transport.start().await?;

    let connection_id = ConnectionId::new("ID:restart-1");
    let session_id = SessionId::new(&connection_id, 1);
    let queue = Destination::queue("restart.queue");
    transport
        .oneway(Command::request(CommandBody::ConnectionInfo(ConnectionInfo::new(
            connection_id.clone(),
            "restart-test",
        ))))
        .await?;
    transport
        .oneway(Command::request(CommandBody::SessionInfo(SessionInfo {
            session_id: session_id.clone(),
        })))
        .await?;
    transport
        .oneway(Command::request(CommandBody::ConsumerInfo(ConsumerInfo::new(
            ConsumerId::new(&session_id, 1),
            queue.clone(),
        ))))
        .await?;
    let producer_id = ProducerId::new(&session_id, 1);
    transport
        .oneway(Command::request(CommandBody::ProducerInfo(ProducerInfo::new(
            producer_id.clone(),
            Some(queue.clone()),
        ))))
        .await?;

    for sequence in 1..=TOTAL {
        if sequence == PAUSE_AT {
            // Broker "restart": sever everything, refuse new connections for
            // a while, come back with state intact.
            broker.pause();
            tokio::time::sleep(Duration::from_millis(400)).await;
            broker.resume();
        }
        let mut send = Command::new(CommandBody::Message(Message::new(
            MessageId { producer_id: producer_id.clone(), producer_sequence_id: sequence },
            queue.clone(),
            sequence.to_be_bytes().to_vec(),
        )));
        send.response_required = true;
        transport.oneway(send).await?;
    }

    // Drain until every sequence arrived; the audit already dropped replays.
    let mut seen: BTreeSet<i64> = BTreeSet::new();
    let mut arrival_order: Vec<i64> = Vec::new();
    while seen.len() < TOTAL as usize {
        let sequence = tokio::time::timeout(Duration::from_secs(30), dispatches.recv())
            .await
            .expect("timed out waiting for deliveries")
            .expect("dispatch channel closed");
        if seen.insert(sequence) {
            arrival_order.push(sequence);
        }
    }

    assert_eq!(seen.len(), TOTAL as usize, "every message delivered");
    let mut sorted = arrival_order.clone();
    sorted.sort_unstable();
    assert_eq!(arrival_order, sorted, "FIFO order per producer");

    assert!(interruptions.load(Ordering::SeqCst) >= 1, "transportInterrupted fired");
    assert!(resumptions.load(Ordering::SeqCst) >= 1, "transportResumed fired");

    transport.close().await?;
    Ok(())
}
