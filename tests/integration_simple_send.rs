use anyhow::Result;
use openwire_failover::broker::StubBroker;
use openwire_failover::commands::{
    Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Destination,
    Message, MessageId, ProducerId, ProducerInfo, SessionId, SessionInfo,
};
use openwire_failover::{FailoverTransport, Transport, TransportListener};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct Collector {
    dispatches: mpsc::UnboundedSender<Message>,
}

impl TransportListener for Collector {
    fn on_command(&self, command: Command) {
        if let CommandBody::MessageDispatch(dispatch) = command.body {
            if let Some(message) = dispatch.message {
                let _ = self.dispatches.send(message);
            }
        }
    }
    fn on_exception(&self, _error: openwire_failover::TransportError) {}
}

async fn wait_connected(transport: &FailoverTransport) {
    for _ in 0..100 {
        if transport.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("transport never connected");
}

/// Verify a message produced through the failover transport comes back to a
/// consumer on the same queue, exactly once, with the transport reporting
/// connected throughout.
#[tokio::test]
async fn simple_send_receive() -> Result<()> {
    let broker = StubBroker::start().await?;
    let transport = FailoverTransport::from_uri(&format!(
        "failover:({})?randomize=false",
        broker.uri_string()
    ))?;

    let (tx, mut dispatches) = mpsc::unbounded_channel();
    transport.set_listener(Arc::new(Collector { dispatches: tx }));
    transport.start().await?;
    wait_connected(&transport).await;
    assert!(transport.is_fault_tolerant());
    assert!(transport.remote_address().is_some());

    // Connection → session → consumer + producer on queue Q.
    let connection_id = ConnectionId::new("ID:simple-1");
    let session_id = SessionId::new(&connection_id, 1);
    let queue = Destination::queue("Q");
    transport
        .oneway(Command::request(CommandBody::ConnectionInfo(ConnectionInfo::new(
            connection_id.clone(),
            "simple-send-test",
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

    let payload = b"hello failover".to_vec();
    let mut send = Command::new(CommandBody::Message(Message::new(
        MessageId { producer_id, producer_sequence_id: 1 },
        queue,
        payload.clone(),
    )));
    send.response_required = true;
    transport.oneway(send).await?;

    let received = tokio::time::timeout(Duration::from_secs(5), dispatches.recv())
        .await
        .expect("timed out waiting for dispatch")
        .expect("dispatch channel closed");
    assert_eq!(received.content, payload);
    assert_eq!(received.message_id.producer_sequence_id, 1);
    assert!(transport.is_connected());

    // Exactly one delivery.
    let extra = tokio::time::timeout(Duration::from_millis(300), dispatches.recv()).await;
    assert!(extra.is_err(), "unexpected second delivery");

    transport.close().await?;
    Ok(())
}
