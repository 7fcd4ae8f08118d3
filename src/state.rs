//! # Connection State Tracker
//!
//! Maintains a shadow of everything the broker has been told about this
//! client: connections, their sessions, consumers, producers, open
//! transactions, and (optionally) a bounded cache of recent messages and
//! pulls. After a reconnect the tracker replays the exact command sequence
//! that recreates that state on the new physical transport.
//!
//! ## Replay ordering
//!
//! The replayed sequence is causally consistent: a ConsumerInfo never
//! precedes its owning SessionInfo, which never precedes its owning
//! ConnectionInfo; a transaction's accumulated commands replay in original
//! send order, starting with the Begin that opened it.
//!
//! ## Locking
//!
//! All tracker state sits behind one mutex. `restore` snapshots the command
//! list under the lock and performs every network write after releasing it.

use crate::commands::{
    Command, CommandBody, ConnectionId, ConnectionInfo, ConsumerId, ConsumerInfo, Destination,
    MessageId, ProducerId, ProducerInfo, RemoveTarget, SessionId, SessionInfo, TransactionId,
    TransactionPhase,
};
use crate::error::Result;
use crate::transport::Transport;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace};

/// What the tracker should do once the broker acknowledges a tracked
/// command.
#[derive(Debug, Clone)]
enum ResponseAction {
    None,
    /// Retire the transaction once its completion was acknowledged.
    RemoveTransaction(ConnectionId, TransactionId),
}

/// Handle to a command the tracker has accepted.
///
/// `waiting_for_response` tells the failover layer whether this handle must
/// be parked in the request map: tracked-but-not-waiting commands are
/// replayed from the tracker's own tree instead.
pub struct Tracked {
    command: Command,
    action: ResponseAction,
}

impl Tracked {
    fn plain(command: Command) -> Self {
        Self { command, action: ResponseAction::None }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    pub fn is_waiting_for_response(&self) -> bool {
        !matches!(self.action, ResponseAction::None)
    }

    /// Invoked by the failover layer when the broker's Response for this
    /// command arrives.
    pub fn on_response(&self, tracker: &ConnectionStateTracker) {
        if let ResponseAction::RemoveTransaction(connection_id, transaction_id) = &self.action {
            tracker.remove_transaction(connection_id, transaction_id);
        }
    }
}

#[derive(Debug, Clone)]
struct TransactionState {
    /// Commands comprising the transaction so far, Begin first.
    commands: Vec<Command>,
    /// Producers used inside the transaction, replayed ahead of it when
    /// `track_transaction_producers` is on.
    producers: Vec<ProducerInfo>,
}

#[derive(Debug, Clone)]
struct ProducerState {
    info: ProducerInfo,
    /// Present while the producer participates in an open transaction.
    transaction: Option<TransactionId>,
}

#[derive(Debug, Clone)]
struct SessionState {
    info: SessionInfo,
    consumers: HashMap<ConsumerId, ConsumerInfo>,
    producers: HashMap<ProducerId, ProducerState>,
}

impl SessionState {
    fn new(info: SessionInfo) -> Self {
        Self { info, consumers: HashMap::new(), producers: HashMap::new() }
    }
}

#[derive(Debug, Clone)]
struct ConnectionState {
    info: ConnectionInfo,
    sessions: HashMap<SessionId, SessionState>,
    transactions: HashMap<TransactionId, TransactionState>,
    temp_destinations: Vec<Destination>,
    /// Cleared when the transport is interrupted, set again once the upper
    /// layer finished its interrupt processing.
    interrupt_processing_complete: bool,
}

impl ConnectionState {
    fn new(info: ConnectionInfo) -> Self {
        Self {
            info,
            sessions: HashMap::new(),
            transactions: HashMap::new(),
            temp_destinations: Vec::new(),
            interrupt_processing_complete: true,
        }
    }
}

struct TrackerState {
    connections: HashMap<ConnectionId, ConnectionState>,
    /// Connection ids in creation order so replay is deterministic.
    connection_order: Vec<ConnectionId>,
    /// Recent non-transactional messages keyed by id, FIFO-bounded.
    message_cache: HashMap<MessageId, Command>,
    message_order: VecDeque<MessageId>,
    /// At most one cached pull per consumer, FIFO-bounded.
    pull_cache: Vec<(ConsumerId, Command)>,
}

/// Tunables mirrored from the failover configuration.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    pub track_messages: bool,
    pub track_transaction_producers: bool,
    pub max_cache_size: usize,
    pub max_pull_cache_size: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            track_messages: false,
            track_transaction_producers: true,
            max_cache_size: crate::defaults::MAX_CACHE_SIZE,
            max_pull_cache_size: crate::defaults::MAX_PULL_CACHE_SIZE,
        }
    }
}

/// The shadow of broker-visible session state.
pub struct ConnectionStateTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl ConnectionStateTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState {
                connections: HashMap::new(),
                connection_order: Vec::new(),
                message_cache: HashMap::new(),
                message_order: VecDeque::new(),
                pull_cache: Vec::new(),
            }),
        }
    }

    /// Records a command that mutates broker-observable state.
    ///
    /// Returns `None` for commands the tracker has no interest in; the
    /// failover layer then parks them in the request map itself when they
    /// require a response.
    pub fn track(&self, command: &Command) -> Option<Tracked> {
        match &command.body {
            CommandBody::ConnectionInfo(info) => {
                let mut state = self.state.lock();
                if !state.connections.contains_key(&info.connection_id) {
                    state.connection_order.push(info.connection_id.clone());
                }
                state
                    .connections
                    .insert(info.connection_id.clone(), ConnectionState::new(info.clone()));
                trace!(connection = %info.connection_id, "tracked connection");
                Some(Tracked::plain(command.clone()))
            }
            CommandBody::SessionInfo(info) => {
                let mut state = self.state.lock();
                if let Some(connection) =
                    state.connections.get_mut(&info.session_id.parent())
                {
                    connection
                        .sessions
                        .insert(info.session_id.clone(), SessionState::new(info.clone()));
                }
                Some(Tracked::plain(command.clone()))
            }
            CommandBody::ConsumerInfo(info) => {
                let mut state = self.state.lock();
                let session_id = info.consumer_id.parent();
                if let Some(session) = state
                    .connections
                    .get_mut(&session_id.parent())
                    .and_then(|c| c.sessions.get_mut(&session_id))
                {
                    session.consumers.insert(info.consumer_id.clone(), info.clone());
                }
                if info.destination.is_temporary() {
                    self.remember_temp_destination(&mut state, &info.consumer_id.parent().parent(), &info.destination);
                }
                Some(Tracked::plain(command.clone()))
            }
            CommandBody::ProducerInfo(info) => {
                let mut state = self.state.lock();
                let session_id = info.producer_id.parent();
                if let Some(session) = state
                    .connections
                    .get_mut(&session_id.parent())
                    .and_then(|c| c.sessions.get_mut(&session_id))
                {
                    session.producers.insert(
                        info.producer_id.clone(),
                        ProducerState { info: info.clone(), transaction: None },
                    );
                }
                if let Some(destination) = info.destination.as_ref().filter(|d| d.is_temporary())
                {
                    self.remember_temp_destination(&mut state, &info.producer_id.parent().parent(), destination);
                }
                Some(Tracked::plain(command.clone()))
            }
            CommandBody::RemoveInfo(remove) => {
                self.process_remove(&remove.target);
                Some(Tracked::plain(command.clone()))
            }
            CommandBody::TransactionInfo(info) => self.process_transaction(command, info),
            CommandBody::Message(message) => {
                if let Some(transaction_id) = &message.transaction_id {
                    if self.append_to_transaction(
                        &connection_of_message(message),
                        transaction_id,
                        command,
                        Some(&message.message_id.producer_id),
                    ) {
                        return Some(Tracked::plain(command.clone()));
                    }
                    return None;
                }
                if self.config.track_messages {
                    self.cache_message(message.message_id.clone(), command.clone());
                    return Some(Tracked::plain(command.clone()));
                }
                None
            }
            CommandBody::MessageAck(ack) => {
                if let Some(transaction_id) = &ack.transaction_id {
                    let connection = ConnectionId::new(ack.consumer_id.connection_id.clone());
                    if self.append_to_transaction(&connection, transaction_id, command, None) {
                        return Some(Tracked::plain(command.clone()));
                    }
                }
                None
            }
            CommandBody::MessagePull(pull) => {
                self.cache_pull(pull.consumer_id.clone(), command.clone());
                None
            }
            _ => None,
        }
    }

    fn remember_temp_destination(
        &self,
        state: &mut TrackerState,
        connection_id: &ConnectionId,
        destination: &Destination,
    ) {
        if let Some(connection) = state.connections.get_mut(connection_id) {
            if !connection.temp_destinations.contains(destination) {
                connection.temp_destinations.push(destination.clone());
            }
        }
    }

    fn process_remove(&self, target: &RemoveTarget) {
        let mut state = self.state.lock();
        match target {
            RemoveTarget::Connection(id) => {
                state.connections.remove(id);
                state.connection_order.retain(|c| c != id);
            }
            RemoveTarget::Session(id) => {
                if let Some(connection) = state.connections.get_mut(&id.parent()) {
                    connection.sessions.remove(id);
                }
            }
            RemoveTarget::Consumer(id) => {
                let session_id = id.parent();
                if let Some(session) = state
                    .connections
                    .get_mut(&session_id.parent())
                    .and_then(|c| c.sessions.get_mut(&session_id))
                {
                    session.consumers.remove(id);
                }
            }
            RemoveTarget::Producer(id) => {
                let session_id = id.parent();
                if let Some(session) = state
                    .connections
                    .get_mut(&session_id.parent())
                    .and_then(|c| c.sessions.get_mut(&session_id))
                {
                    session.producers.remove(id);
                }
            }
        }
    }

    fn process_transaction(
        &self,
        command: &Command,
        info: &crate::commands::TransactionInfo,
    ) -> Option<Tracked> {
        match info.phase {
            TransactionPhase::Begin => {
                let mut state = self.state.lock();
                if let Some(connection) = state.connections.get_mut(&info.connection_id) {
                    connection.transactions.insert(
                        info.transaction_id.clone(),
                        TransactionState {
                            commands: vec![command.clone()],
                            producers: Vec::new(),
                        },
                    );
                    trace!("tracked transaction begin");
                }
                Some(Tracked::plain(command.clone()))
            }
            TransactionPhase::Prepare => {
                self.append_to_transaction(
                    &info.connection_id,
                    &info.transaction_id,
                    command,
                    None,
                );
                Some(Tracked::plain(command.clone()))
            }
            TransactionPhase::Commit | TransactionPhase::Rollback | TransactionPhase::Forget => {
                Some(Tracked {
                    command: command.clone(),
                    action: ResponseAction::RemoveTransaction(
                        info.connection_id.clone(),
                        info.transaction_id.clone(),
                    ),
                })
            }
        }
    }

    /// Appends a command to an open transaction. Returns false when the
    /// transaction is unknown (the command is then not tracked).
    fn append_to_transaction(
        &self,
        connection_id: &ConnectionId,
        transaction_id: &TransactionId,
        command: &Command,
        producer: Option<&ProducerId>,
    ) -> bool {
        let mut state = self.state.lock();
        let Some(connection) = state.connections.get_mut(connection_id) else {
            return false;
        };

        // Note the producing producer so replay can recreate it ahead of the
        // transaction when configured to.
        let producer_info = producer.and_then(|id| {
            let session_id = id.parent();
            connection
                .sessions
                .get(&session_id)
                .and_then(|s| s.producers.get(id))
                .map(|p| p.info.clone())
        });

        let Some(transaction) = connection.transactions.get_mut(transaction_id) else {
            return false;
        };
        transaction.commands.push(command.clone());
        if self.config.track_transaction_producers {
            if let Some(info) = producer_info {
                if !transaction.producers.iter().any(|p| p.producer_id == info.producer_id) {
                    transaction.producers.push(info);
                }
            }
        }
        true
    }

    fn cache_message(&self, id: MessageId, command: Command) {
        let mut state = self.state.lock();
        if state.message_cache.insert(id.clone(), command).is_none() {
            state.message_order.push_back(id);
        }
        while state.message_order.len() > self.config.max_cache_size {
            if let Some(evicted) = state.message_order.pop_front() {
                state.message_cache.remove(&evicted);
            }
        }
    }

    fn cache_pull(&self, consumer: ConsumerId, command: Command) {
        let mut state = self.state.lock();
        state.pull_cache.retain(|(existing, _)| *existing != consumer);
        state.pull_cache.push((consumer, command));
        while state.pull_cache.len() > self.config.max_pull_cache_size {
            state.pull_cache.remove(0);
        }
    }

    pub fn remove_transaction(&self, connection_id: &ConnectionId, transaction_id: &TransactionId) {
        let mut state = self.state.lock();
        if let Some(connection) = state.connections.get_mut(connection_id) {
            if connection.transactions.remove(transaction_id).is_some() {
                trace!("retired transaction");
            }
        }
    }

    /// Marks every connection as being in interrupt processing; the upper
    /// layer clears it per connection once its own cleanup finished.
    pub fn transport_interrupted(&self) {
        let mut state = self.state.lock();
        for connection in state.connections.values_mut() {
            connection.interrupt_processing_complete = false;
        }
    }

    pub fn connection_interrupt_processing_complete(&self, connection_id: &ConnectionId) {
        let mut state = self.state.lock();
        if let Some(connection) = state.connections.get_mut(connection_id) {
            connection.interrupt_processing_complete = true;
        }
    }

    pub fn tracked_connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    /// Snapshots the causally ordered replay sequence.
    fn restore_sequence(&self) -> Vec<Command> {
        let state = self.state.lock();
        let mut sequence = Vec::new();

        for connection_id in &state.connection_order {
            let Some(connection) = state.connections.get(connection_id) else {
                continue;
            };
            sequence.push(Command::new(CommandBody::ConnectionInfo(connection.info.clone())));

            let mut session_ids: Vec<&SessionId> = connection.sessions.keys().collect();
            session_ids.sort();
            for session_id in session_ids {
                let session = &connection.sessions[session_id];
                sequence.push(Command::new(CommandBody::SessionInfo(session.info.clone())));

                let mut consumer_ids: Vec<&ConsumerId> = session.consumers.keys().collect();
                consumer_ids.sort();
                for consumer_id in consumer_ids {
                    sequence.push(Command::new(CommandBody::ConsumerInfo(
                        session.consumers[consumer_id].clone(),
                    )));
                }

                let mut producer_ids: Vec<&ProducerId> = session.producers.keys().collect();
                producer_ids.sort();
                for producer_id in producer_ids {
                    sequence.push(Command::new(CommandBody::ProducerInfo(
                        session.producers[producer_id].info.clone(),
                    )));
                }
            }

            for transaction in connection.transactions.values() {
                for producer in &transaction.producers {
                    sequence.push(Command::new(CommandBody::ProducerInfo(producer.clone())));
                }
                sequence.extend(transaction.commands.iter().cloned());
            }
        }

        for id in &state.message_order {
            if let Some(command) = state.message_cache.get(id) {
                sequence.push(command.clone());
            }
        }
        for (_, command) in &state.pull_cache {
            sequence.push(command.clone());
        }
        sequence
    }

    /// Replays the tracked state onto a freshly connected transport. The
    /// request-map replay that follows is the failover layer's job.
    pub async fn restore(&self, transport: &dyn Transport) -> Result<()> {
        let sequence = self.restore_sequence();
        debug!(commands = sequence.len(), "restoring broker state");
        for command in sequence {
            transport.oneway(command).await?;
        }
        Ok(())
    }
}

fn connection_of_message(message: &crate::commands::Message) -> ConnectionId {
    ConnectionId::new(message.message_id.producer_id.connection_id.clone())
}

impl Default for ConnectionStateTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{Message, MessageAck, AckType, RemoveInfo, TransactionInfo};
    use crate::error::Result as TxResult;
    use crate::transport::{Transport, TransportListener};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct RecordingTransport {
        sent: Mutex<Vec<Command>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start(&self) -> TxResult<()> {
            Ok(())
        }
        async fn oneway(&self, command: Command) -> TxResult<()> {
            self.sent.lock().push(command);
            Ok(())
        }
        async fn close(&self) -> TxResult<()> {
            Ok(())
        }
        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}
        fn is_connected(&self) -> bool {
            true
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    fn ids() -> (ConnectionId, SessionId, ConsumerId, ProducerId) {
        let connection = ConnectionId::new("ID:tracker-1");
        let session = SessionId::new(&connection, 1);
        let consumer = ConsumerId::new(&session, 1);
        let producer = ProducerId::new(&session, 1);
        (connection, session, consumer, producer)
    }

    fn build_tree(tracker: &ConnectionStateTracker) {
        let (connection, session, consumer, producer) = ids();
        tracker.track(&Command::new(CommandBody::ConnectionInfo(ConnectionInfo::new(
            connection,
            "client-1",
        ))));
        tracker.track(&Command::new(CommandBody::SessionInfo(SessionInfo {
            session_id: session,
        })));
        tracker.track(&Command::new(CommandBody::ConsumerInfo(ConsumerInfo::new(
            consumer,
            Destination::queue("Q"),
        ))));
        tracker.track(&Command::new(CommandBody::ProducerInfo(ProducerInfo::new(
            producer,
            Some(Destination::queue("Q")),
        ))));
    }

    #[tokio::test]
    async fn restore_replays_in_causal_order() {
        let tracker = ConnectionStateTracker::default();
        build_tree(&tracker);

        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        tracker.restore(&transport).await.unwrap();

        let names: Vec<&'static str> =
            transport.sent.lock().iter().map(|c| c.type_name()).collect();
        assert_eq!(
            names,
            vec!["ConnectionInfo", "SessionInfo", "ConsumerInfo", "ProducerInfo"]
        );
    }

    #[test]
    fn remove_prunes_subtree() {
        let tracker = ConnectionStateTracker::default();
        build_tree(&tracker);
        let (connection, ..) = ids();

        assert_eq!(tracker.tracked_connection_count(), 1);
        tracker.track(&Command::new(CommandBody::RemoveInfo(RemoveInfo {
            target: RemoveTarget::Connection(connection),
            last_delivered_sequence_id: 0,
        })));
        assert_eq!(tracker.tracked_connection_count(), 0);
    }

    #[tokio::test]
    async fn transactional_sends_replay_in_order_after_the_begin() {
        let tracker = ConnectionStateTracker::default();
        build_tree(&tracker);
        let (connection, _session, consumer, producer) = ids();
        let tx = TransactionId::Local { connection_id: connection.value.clone(), value: 9 };

        let begin = Command::new(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: connection.clone(),
            transaction_id: tx.clone(),
            phase: TransactionPhase::Begin,
            one_phase: false,
        }));
        assert!(!tracker.track(&begin).unwrap().is_waiting_for_response());

        for sequence in 1..=3 {
            let mut message = Message::new(
                MessageId { producer_id: producer.clone(), producer_sequence_id: sequence },
                Destination::queue("Q"),
                vec![sequence as u8],
            );
            message.transaction_id = Some(tx.clone());
            let tracked = tracker.track(&Command::new(CommandBody::Message(message)));
            assert!(tracked.is_some(), "transactional send must be tracked");
        }

        let ack = MessageAck {
            consumer_id: consumer,
            destination: Destination::queue("Q"),
            transaction_id: Some(tx.clone()),
            ack_type: AckType::Standard,
            first_message_id: None,
            last_message_id: None,
            message_count: 1,
        };
        assert!(tracker.track(&Command::new(CommandBody::MessageAck(ack))).is_some());

        let transport = RecordingTransport { sent: Mutex::new(Vec::new()) };
        tracker.restore(&transport).await.unwrap();

        let sent = transport.sent.lock();
        let tx_commands: Vec<&Command> = sent
            .iter()
            .filter(|c| {
                matches!(
                    c.body,
                    CommandBody::TransactionInfo(_)
                        | CommandBody::Message(_)
                        | CommandBody::MessageAck(_)
                )
            })
            .collect();
        assert_eq!(tx_commands.len(), 5, "begin + 3 sends + 1 ack");
        assert!(matches!(tx_commands[0].body, CommandBody::TransactionInfo(_)));
        for (index, command) in tx_commands[1..4].iter().enumerate() {
            match &command.body {
                CommandBody::Message(m) => {
                    assert_eq!(m.message_id.producer_sequence_id, index as i64 + 1)
                }
                other => panic!("expected message, got {other:?}"),
            }
        }
        assert!(matches!(tx_commands[4].body, CommandBody::MessageAck(_)));
    }

    #[test]
    fn commit_is_tracked_as_waiting_and_retires_on_response() {
        let tracker = ConnectionStateTracker::default();
        build_tree(&tracker);
        let (connection, ..) = ids();
        let tx = TransactionId::Local { connection_id: connection.value.clone(), value: 3 };

        tracker.track(&Command::new(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: connection.clone(),
            transaction_id: tx.clone(),
            phase: TransactionPhase::Begin,
            one_phase: false,
        })));

        let commit = Command::request(CommandBody::TransactionInfo(TransactionInfo {
            connection_id: connection.clone(),
            transaction_id: tx.clone(),
            phase: TransactionPhase::Commit,
            one_phase: true,
        }));
        let tracked = tracker.track(&commit).unwrap();
        assert!(tracked.is_waiting_for_response());

        // Transaction is still live until the broker acknowledges.
        assert_eq!(tracker.state.lock().connections[&connection].transactions.len(), 1);
        tracked.on_response(&tracker);
        assert_eq!(tracker.state.lock().connections[&connection].transactions.len(), 0);
    }

    #[test]
    fn message_cache_is_bounded_fifo() {
        let tracker = ConnectionStateTracker::new(TrackerConfig {
            track_messages: true,
            max_cache_size: 2,
            ..TrackerConfig::default()
        });
        build_tree(&tracker);
        let (.., producer) = ids();

        for sequence in 1..=3 {
            let message = Message::new(
                MessageId { producer_id: producer.clone(), producer_sequence_id: sequence },
                Destination::queue("Q"),
                vec![],
            );
            tracker.track(&Command::new(CommandBody::Message(message)));
        }

        let state = tracker.state.lock();
        assert_eq!(state.message_order.len(), 2);
        assert_eq!(state.message_order[0].producer_sequence_id, 2);
        assert_eq!(state.message_order[1].producer_sequence_id, 3);
    }

    #[test]
    fn pull_cache_keeps_one_entry_per_consumer() {
        let tracker = ConnectionStateTracker::default();
        build_tree(&tracker);
        let (_, _, consumer, _) = ids();

        for timeout in [100, 200] {
            tracker.track(&Command::new(CommandBody::MessagePull(
                crate::commands::MessagePull {
                    consumer_id: consumer.clone(),
                    destination: Destination::queue("Q"),
                    timeout,
                },
            )));
        }
        let state = tracker.state.lock();
        assert_eq!(state.pull_cache.len(), 1);
        match &state.pull_cache[0].1.body {
            CommandBody::MessagePull(pull) => assert_eq!(pull.timeout, 200),
            other => panic!("unexpected {other:?}"),
        }
    }
}
