//! # Stub Broker
//!
//! A minimal in-process broker speaking just enough of the wire protocol to
//! exercise the failover transport: it negotiates, acknowledges
//! response-required commands, routes producer sends to matching consumers,
//! buffers transactional work until commit, and can be paused and resumed to
//! simulate broker restarts.
//!
//! The accept loop spawns one handler task per connection; handlers push
//! nothing through shared channels on the hot path, they write straight back
//! to their own connection and only take the broker-wide locks to route
//! dispatches. While paused, accepted connections are dropped on the floor,
//! which a client observes as a handshake failure.
//!
//! This is a test and benchmarking collaborator, not a broker: nothing is
//! persisted and destinations are plain byte-for-byte name matches.

use crate::commands::{
    Command, CommandBody, ConsumerId, Destination, Message, MessageDispatch, Response,
    TransactionId, TransactionPhase, WireFormatInfo,
};
use crate::error::Result;
use crate::wire::{self, WireFormat};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// A connected client's outbound half plus its negotiated format.
struct ClientWriter {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    wire: WireFormat,
}

impl ClientWriter {
    async fn send(&self, command: &Command) -> Result<()> {
        let mut writer = self.writer.lock().await;
        wire::write_command(&mut *writer, command, &self.wire).await
    }
}

struct BrokerState {
    /// Live consumers and the connection that owns each.
    consumers: HashMap<ConsumerId, (Destination, usize, Arc<ClientWriter>)>,
    /// Messages with no consumer yet, per destination name.
    backlog: HashMap<String, VecDeque<Message>>,
    /// Open transactions: owning connection plus buffered sends. Scoped to
    /// the connection; an uncommitted transaction dies with it.
    transactions: HashMap<TransactionId, (usize, Vec<Message>)>,
    /// Every accepted (committed or non-transactional) message, in order.
    received: Vec<Message>,
}

struct BrokerInner {
    addr: SocketAddr,
    accepting: AtomicBool,
    state: Mutex<BrokerState>,
    connection_counter: AtomicUsize,
    live_connections: Mutex<Vec<(usize, Arc<ClientWriter>)>>,
    /// When set, the next response-required Message is accepted but its
    /// Response is swallowed, simulating a lost acknowledgement.
    swallow_one_message_ack: AtomicBool,
    /// Transaction commits observed, for test assertions.
    commits: AtomicUsize,
}

impl BrokerInner {
    fn deliver_or_queue(&self, message: Message) -> Option<(Arc<ClientWriter>, Command)> {
        let mut state = self.state.lock();
        state.received.push(message.clone());

        let target = state
            .consumers
            .iter()
            .find(|(_, (destination, _, _))| *destination == message.destination)
            .map(|(id, (_, _, writer))| (id.clone(), writer.clone()));

        match target {
            Some((consumer_id, writer)) => {
                let dispatch = Command::new(CommandBody::MessageDispatch(MessageDispatch {
                    consumer_id,
                    destination: message.destination.clone(),
                    message: Some(message),
                    redelivery_counter: 0,
                }));
                Some((writer, dispatch))
            }
            _ => {
                state
                    .backlog
                    .entry(message.destination.name.clone())
                    .or_default()
                    .push_back(message);
                None
            }
        }
    }

    fn drain_backlog(&self, consumer_id: &ConsumerId) -> Vec<(Arc<ClientWriter>, Command)> {
        let mut state = self.state.lock();
        let Some((destination, _, writer)) = state.consumers.get(consumer_id).cloned() else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if let Some(queue) = state.backlog.get_mut(&destination.name) {
            while let Some(message) = queue.pop_front() {
                out.push((
                    writer.clone(),
                    Command::new(CommandBody::MessageDispatch(MessageDispatch {
                        consumer_id: consumer_id.clone(),
                        destination: destination.clone(),
                        message: Some(message),
                        redelivery_counter: 0,
                    })),
                ));
            }
        }
        out
    }
}

/// In-process broker for tests and the bench harness.
pub struct StubBroker {
    inner: Arc<BrokerInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl StubBroker {
    /// Binds a loopback port and starts accepting.
    pub async fn start() -> Result<StubBroker> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let inner = Arc::new(BrokerInner {
            addr,
            accepting: AtomicBool::new(true),
            state: Mutex::new(BrokerState {
                consumers: HashMap::new(),
                backlog: HashMap::new(),
                transactions: HashMap::new(),
                received: Vec::new(),
            }),
            connection_counter: AtomicUsize::new(0),
            live_connections: Mutex::new(Vec::new()),
            swallow_one_message_ack: AtomicBool::new(false),
            commits: AtomicUsize::new(0),
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        if !accept_inner.accepting.load(Ordering::Acquire) {
                            // Paused: drop the connection; the client sees a
                            // handshake failure.
                            trace!(%peer, "paused, dropping connection");
                            continue;
                        }
                        let connection_id =
                            accept_inner.connection_counter.fetch_add(1, Ordering::Relaxed);
                        debug!(%peer, connection_id, "broker accepted connection");
                        let handler_inner = accept_inner.clone();
                        tokio::spawn(async move {
                            if let Err(error) =
                                handle_connection(handler_inner, stream, connection_id).await
                            {
                                trace!(connection_id, %error, "connection handler ended");
                            }
                        });
                    }
                    Err(error) => {
                        warn!(%error, "broker accept failed");
                        break;
                    }
                }
            }
        });

        debug!(%addr, "stub broker listening");
        Ok(StubBroker { inner, accept_task: Mutex::new(Some(accept_task)) })
    }

    pub fn addr(&self) -> SocketAddr {
        self.inner.addr
    }

    pub fn uri_string(&self) -> String {
        format!("tcp://{}:{}", self.inner.addr.ip(), self.inner.addr.port())
    }

    /// Simulates a broker crash: every live connection is severed and new
    /// ones are refused until [`StubBroker::resume`]. Accepted state
    /// (backlog, received log) survives, like a broker restart with a
    /// persistent store.
    pub fn pause(&self) {
        self.inner.accepting.store(false, Ordering::Release);
        self.sever_connections();
    }

    pub fn resume(&self) {
        self.inner.accepting.store(true, Ordering::Release);
    }

    /// Severs live connections without pausing the listener.
    pub fn sever_connections(&self) {
        let connections: Vec<(usize, Arc<ClientWriter>)> =
            std::mem::take(&mut *self.inner.live_connections.lock());
        debug!(count = connections.len(), "severing broker connections");
        // Dropped outside a runtime (e.g. in a late Drop) there is nothing
        // left to sever gracefully.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        for (connection_id, writer) in connections {
            let inner = self.inner.clone();
            handle.spawn(async move {
                use tokio::io::AsyncWriteExt;
                let mut guard = writer.writer.lock().await;
                let _ = guard.shutdown().await;
                inner
                    .state
                    .lock()
                    .consumers
                    .retain(|_, (_, owner, _)| *owner != connection_id);
            });
        }
    }

    /// Arms the lost-acknowledgement simulation for the next message.
    pub fn swallow_next_message_ack(&self) {
        self.inner.swallow_one_message_ack.store(true, Ordering::Release);
    }

    /// Every accepted message so far, in arrival order.
    pub fn received_messages(&self) -> Vec<Message> {
        self.inner.state.lock().received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.inner.state.lock().received.len()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.state.lock().consumers.len()
    }

    pub fn live_connection_count(&self) -> usize {
        self.inner.live_connections.lock().len()
    }

    /// Transaction commits the broker has processed.
    pub fn commit_count(&self) -> usize {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// Stops the broker for good.
    pub fn shutdown(&self) {
        self.pause();
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
    }
}

impl Drop for StubBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn handle_connection(
    inner: Arc<BrokerInner>,
    stream: TcpStream,
    connection_id: usize,
) -> Result<()> {
    let (mut read_half, mut write_half) = stream.into_split();
    let bootstrap = WireFormat::default();

    // Handshake: send ours, read theirs, negotiate.
    let local_info = WireFormatInfo::default();
    wire::write_command(
        &mut write_half,
        &Command::new(CommandBody::WireFormatInfo(local_info.clone())),
        &bootstrap,
    )
    .await?;
    let first = wire::read_command(&mut read_half, &bootstrap).await?;
    let negotiated = match first.body {
        CommandBody::WireFormatInfo(remote) => WireFormat::negotiate(&local_info, &remote)?,
        _ => {
            return Err(crate::error::TransportError::Negotiation(
                "client did not open with WireFormatInfo".to_string(),
            ))
        }
    };

    let writer = Arc::new(ClientWriter {
        writer: tokio::sync::Mutex::new(write_half),
        wire: negotiated.clone(),
    });
    inner.live_connections.lock().push((connection_id, writer.clone()));

    loop {
        let command = match wire::read_command(&mut read_half, &negotiated).await {
            Ok(command) => command,
            Err(_) => break,
        };
        let mut respond = command.response_required;
        let mut dispatches: Vec<(Arc<ClientWriter>, Command)> = Vec::new();

        match &command.body {
            CommandBody::KeepAliveInfo => {
                // Echo so the client's read-check stays satisfied.
                writer.send(&Command::new(CommandBody::KeepAliveInfo)).await?;
            }
            CommandBody::ConsumerInfo(info) => {
                inner.state.lock().consumers.insert(
                    info.consumer_id.clone(),
                    (info.destination.clone(), connection_id, writer.clone()),
                );
                dispatches.extend(inner.drain_backlog(&info.consumer_id));
            }
            CommandBody::RemoveInfo(remove) => {
                if let crate::commands::RemoveTarget::Consumer(id) = &remove.target {
                    inner.state.lock().consumers.remove(id);
                }
            }
            CommandBody::Message(message) => {
                if respond && inner.swallow_one_message_ack.swap(false, Ordering::AcqRel) {
                    respond = false;
                    trace!("swallowing acknowledgement for {}", message.message_id);
                }
                match &message.transaction_id {
                    Some(transaction_id) => {
                        inner
                            .state
                            .lock()
                            .transactions
                            .entry(transaction_id.clone())
                            .or_insert_with(|| (connection_id, Vec::new()))
                            .1
                            .push(message.clone());
                    }
                    None => {
                        if let Some(dispatch) = inner.deliver_or_queue(message.clone()) {
                            dispatches.push(dispatch);
                        }
                    }
                }
            }
            CommandBody::TransactionInfo(info) => match info.phase {
                TransactionPhase::Begin => {
                    // A fresh Begin supersedes any leftover buffer a dead
                    // connection may not have been pruned for yet.
                    inner
                        .state
                        .lock()
                        .transactions
                        .insert(info.transaction_id.clone(), (connection_id, Vec::new()));
                }
                TransactionPhase::Commit => {
                    inner.commits.fetch_add(1, Ordering::SeqCst);
                    let buffered = inner
                        .state
                        .lock()
                        .transactions
                        .remove(&info.transaction_id)
                        .map(|(_, messages)| messages)
                        .unwrap_or_default();
                    for message in buffered {
                        if let Some(dispatch) = inner.deliver_or_queue(message) {
                            dispatches.push(dispatch);
                        }
                    }
                }
                TransactionPhase::Rollback | TransactionPhase::Forget => {
                    inner.state.lock().transactions.remove(&info.transaction_id);
                }
                TransactionPhase::Prepare => {}
            },
            CommandBody::MessagePull(pull) => {
                let next = inner
                    .state
                    .lock()
                    .backlog
                    .get_mut(&pull.destination.name)
                    .and_then(|queue| queue.pop_front());
                let dispatch = Command::new(CommandBody::MessageDispatch(MessageDispatch {
                    consumer_id: pull.consumer_id.clone(),
                    destination: pull.destination.clone(),
                    message: next,
                    redelivery_counter: 0,
                }));
                writer.send(&dispatch).await?;
            }
            CommandBody::ShutdownInfo => {
                respond = false;
                break;
            }
            _ => {}
        }

        if respond {
            writer
                .send(&Command::new(CommandBody::Response(Response {
                    correlation_id: command.command_id,
                })))
                .await?;
        }
        for (target, dispatch) in dispatches {
            let _ = target.send(&dispatch).await;
        }
    }

    // Connection gone: prune its consumers, writer, and open transactions.
    inner.live_connections.lock().retain(|(id, _)| *id != connection_id);
    {
        let mut state = inner.state.lock();
        state.consumers.retain(|_, (_, owner, _)| *owner != connection_id);
        state.transactions.retain(|_, (owner, _)| *owner != connection_id);
    }
    debug!(connection_id, "broker connection closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ConnectionId, MessageId, ProducerId, SessionId};
    use crate::furi::BrokerUri;
    use crate::transport::{TcpConfig, TcpTransport, Transport, TransportListener};
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Sink {
        tx: mpsc::UnboundedSender<Command>,
    }
    impl TransportListener for Sink {
        fn on_command(&self, command: Command) {
            let _ = self.tx.send(command);
        }
        fn on_exception(&self, _error: crate::error::TransportError) {}
    }

    fn test_message(seq: i64) -> Message {
        let connection = ConnectionId::new("ID:broker-test-1");
        let session = SessionId::new(&connection, 1);
        Message::new(
            MessageId {
                producer_id: ProducerId::new(&session, 1),
                producer_sequence_id: seq,
            },
            Destination::queue("broker.test"),
            vec![seq as u8],
        )
    }

    #[tokio::test]
    async fn accepts_negotiates_and_acks() {
        let broker = StubBroker::start().await.unwrap();
        let uri = BrokerUri::parse(&broker.uri_string()).unwrap();
        let transport = TcpTransport::new(uri, TcpConfig::default());
        let (tx, mut rx) = mpsc::unbounded_channel();
        transport.set_listener(Arc::new(Sink { tx }));
        transport.start().await.unwrap();

        let mut send = Command::new(CommandBody::Message(test_message(1)));
        send.command_id = 9;
        send.response_required = true;
        transport.oneway(send).await.unwrap();

        let answer = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer.correlation_id(), Some(9));
        assert_eq!(broker.received_count(), 1);
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn pause_refuses_resume_recovers() {
        let broker = StubBroker::start().await.unwrap();
        broker.pause();

        let uri = BrokerUri::parse(&broker.uri_string()).unwrap();
        let config = TcpConfig {
            connect_timeout: Some(Duration::from_millis(400)),
            ..TcpConfig::default()
        };
        let transport = TcpTransport::new(uri.clone(), config.clone());
        assert!(transport.start().await.is_err(), "paused broker must not negotiate");

        broker.resume();
        let transport = TcpTransport::new(uri, config);
        transport.start().await.unwrap();
        transport.close().await.unwrap();
    }
}
