//! # OpenWire Command Model
//!
//! This module defines the typed protocol units exchanged with the broker.
//! Every frame on the wire carries exactly one [`Command`]: a small header
//! (command id + response-required flag) and a tagged body.
//!
//! ## Identifier scheme
//!
//! Broker-visible objects form a tree and their identifiers nest the same
//! way:
//!
//! ```text
//! ConnectionId ──▶ SessionId ──▶ ConsumerId
//!                            └─▶ ProducerId ──▶ MessageId (per-producer sequence)
//! ```
//!
//! All identifier types are cheap to clone, hashable, and serde-encodable so
//! they can be used both as wire fields and as map keys in the
//! connection-state tracker.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Wire-level command id. Zero means "not yet assigned"; the id sequence
/// starts at one.
pub type CommandId = i32;

/// Identifies a logical connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId {
    pub value: String,
}

impl ConnectionId {
    pub fn new(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.value)
    }
}

/// Identifies a session within a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub connection_id: String,
    pub value: i64,
}

impl SessionId {
    pub fn new(connection_id: &ConnectionId, value: i64) -> Self {
        Self {
            connection_id: connection_id.value.clone(),
            value,
        }
    }

    pub fn parent(&self) -> ConnectionId {
        ConnectionId::new(self.connection_id.clone())
    }
}

/// Identifies a consumer within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId {
    pub connection_id: String,
    pub session_id: i64,
    pub value: i64,
}

impl ConsumerId {
    pub fn new(session: &SessionId, value: i64) -> Self {
        Self {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value,
        }
    }

    pub fn parent(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

/// Identifies a producer within a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProducerId {
    pub connection_id: String,
    pub session_id: i64,
    pub value: i64,
}

impl ProducerId {
    pub fn new(session: &SessionId, value: i64) -> Self {
        Self {
            connection_id: session.connection_id.clone(),
            session_id: session.value,
            value,
        }
    }

    pub fn parent(&self) -> SessionId {
        SessionId {
            connection_id: self.connection_id.clone(),
            value: self.session_id,
        }
    }
}

impl fmt::Display for ProducerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.connection_id, self.session_id, self.value)
    }
}

/// Identifies a single message: the producing producer plus a monotonically
/// increasing per-producer sequence number. The sequence is what the
/// duplicate audit windows over.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId {
    pub producer_id: ProducerId,
    pub producer_sequence_id: i64,
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.producer_id, self.producer_sequence_id)
    }
}

/// Local or XA transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionId {
    Local {
        connection_id: String,
        value: i64,
    },
    Xa {
        format_id: i32,
        global_tx_id: Vec<u8>,
        branch_qualifier: Vec<u8>,
    },
}

/// Destination flavor. Temporary destinations are scoped to the creating
/// connection and torn down with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DestinationKind {
    Queue,
    Topic,
    TempQueue,
    TempTopic,
}

impl DestinationKind {
    pub fn is_temporary(&self) -> bool {
        matches!(self, DestinationKind::TempQueue | DestinationKind::TempTopic)
    }
}

/// A named destination on the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Destination {
    pub kind: DestinationKind,
    pub name: String,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Queue, name: name.into() }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self { kind: DestinationKind::Topic, name: name.into() }
    }

    pub fn is_temporary(&self) -> bool {
        self.kind.is_temporary()
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = match self.kind {
            DestinationKind::Queue => "queue",
            DestinationKind::Topic => "topic",
            DestinationKind::TempQueue => "temp-queue",
            DestinationKind::TempTopic => "temp-topic",
        };
        write!(f, "{}://{}", prefix, self.name)
    }
}

/// Negotiable wire parameters carried inside a [`WireFormatInfo`].
///
/// Booleans negotiate by logical AND of the two proposals, numerics by
/// minimum; see [`crate::wire`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormatProperties {
    pub tight_encoding_enabled: bool,
    pub size_prefix_disabled: bool,
    pub cache_enabled: bool,
    pub stack_trace_enabled: bool,
    /// Milliseconds; zero disables the inactivity monitor.
    pub max_inactivity_duration: i64,
    pub max_inactivity_duration_initial_delay: i64,
    pub max_frame_size: i64,
}

impl Default for WireFormatProperties {
    fn default() -> Self {
        Self {
            tight_encoding_enabled: true,
            size_prefix_disabled: false,
            cache_enabled: true,
            stack_trace_enabled: true,
            max_inactivity_duration: crate::defaults::MAX_INACTIVITY_DURATION_MS,
            max_inactivity_duration_initial_delay:
                crate::defaults::MAX_INACTIVITY_INITIAL_DELAY_MS,
            max_frame_size: crate::defaults::MAX_FRAME_SIZE as i64,
        }
    }
}

/// The very first command each side sends: protocol magic, version, and the
/// proposed wire parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireFormatInfo {
    pub version: u32,
    pub properties: WireFormatProperties,
}

impl Default for WireFormatInfo {
    fn default() -> Self {
        Self {
            version: crate::defaults::WIRE_VERSION,
            properties: WireFormatProperties::default(),
        }
    }
}

/// Announces a logical connection to the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub connection_id: ConnectionId,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Set for clients running over a failover transport; the broker relaxes
    /// duplicate detection accordingly.
    pub fault_tolerant: bool,
    pub failover_reconnect: bool,
}

impl ConnectionInfo {
    pub fn new(connection_id: ConnectionId, client_id: impl Into<String>) -> Self {
        Self {
            connection_id,
            client_id: client_id.into(),
            username: None,
            password: None,
            fault_tolerant: false,
            failover_reconnect: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub session_id: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerInfo {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub prefetch_size: i32,
    pub selector: Option<String>,
    pub subscription_name: Option<String>,
    pub browser: bool,
}

impl ConsumerInfo {
    pub fn new(consumer_id: ConsumerId, destination: Destination) -> Self {
        Self {
            consumer_id,
            destination,
            prefetch_size: 1000,
            selector: None,
            subscription_name: None,
            browser: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    /// `None` for anonymous producers that name a destination per message.
    pub destination: Option<Destination>,
    pub window_size: i32,
}

impl ProducerInfo {
    pub fn new(producer_id: ProducerId, destination: Option<Destination>) -> Self {
        Self { producer_id, destination, window_size: 0 }
    }
}

/// Which stage of a transaction's lifecycle this TransactionInfo drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionPhase {
    Begin,
    Prepare,
    Commit,
    Rollback,
    Forget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInfo {
    pub connection_id: ConnectionId,
    pub transaction_id: TransactionId,
    pub phase: TransactionPhase,
    /// Only meaningful for `Commit`: one-phase vs. two-phase completion.
    pub one_phase: bool,
}

/// An application message travelling producer → broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub destination: Destination,
    pub transaction_id: Option<TransactionId>,
    pub persistent: bool,
    /// Absolute expiration in epoch millis; zero = never.
    pub expiration: i64,
    pub priority: u8,
    pub timestamp: i64,
    pub correlation_id: Option<String>,
    pub reply_to: Option<Destination>,
    pub properties: HashMap<String, String>,
    pub content: Vec<u8>,
}

impl Message {
    pub fn new(message_id: MessageId, destination: Destination, content: Vec<u8>) -> Self {
        Self {
            message_id,
            destination,
            transaction_id: None,
            persistent: true,
            expiration: 0,
            priority: 4,
            timestamp: 0,
            correlation_id: None,
            reply_to: None,
            properties: HashMap::new(),
            content,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckType {
    Standard,
    Delivered,
    Poisoned,
    Redelivered,
    Individual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub transaction_id: Option<TransactionId>,
    pub ack_type: AckType,
    pub first_message_id: Option<MessageId>,
    pub last_message_id: Option<MessageId>,
    pub message_count: i32,
}

/// A synchronous fetch request from a zero-prefetch consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePull {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    /// Milliseconds the broker may wait for a message; zero = immediate.
    pub timeout: i64,
}

/// Broker → consumer delivery. `message == None` signals an empty pull
/// completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDispatch {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub message: Option<Message>,
    pub redelivery_counter: i32,
}

/// Positive acknowledgement of a response-required command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub correlation_id: CommandId,
}

/// An error the broker raised while handling a tracked request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub exception_class: String,
    pub message: String,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.exception_class, self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionResponse {
    pub correlation_id: CommandId,
    pub error: RemoteError,
}

/// Which broker-side object a RemoveInfo tears down.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoveTarget {
    Connection(ConnectionId),
    Session(SessionId),
    Consumer(ConsumerId),
    Producer(ProducerId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveInfo {
    pub target: RemoveTarget,
    pub last_delivered_sequence_id: i64,
}

/// Broker-initiated connection management: redirects, rebalancing, and the
/// advertised cluster membership list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionControl {
    pub close: bool,
    pub exit: bool,
    pub fault_tolerant: bool,
    pub resume: bool,
    pub suspend: bool,
    /// Non-empty: the broker asks this client to reconnect to the given URI.
    pub reconnect_to: String,
    /// Comma-separated URI list of the currently connected cluster members.
    pub connected_brokers: String,
    pub rebalance_connection: bool,
}

impl Default for ConnectionControl {
    fn default() -> Self {
        Self {
            close: false,
            exit: false,
            fault_tolerant: false,
            resume: false,
            suspend: false,
            reconnect_to: String::new(),
            connected_brokers: String::new(),
            rebalance_connection: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerControl {
    pub consumer_id: ConsumerId,
    pub destination: Destination,
    pub close: bool,
    pub prefetch: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    pub broker_id: String,
    pub broker_name: String,
    pub broker_url: String,
}

/// Asynchronous fatal error pushed by the broker for a whole connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionError {
    pub connection_id: Option<ConnectionId>,
    pub error: RemoteError,
}

/// The tagged body of a protocol unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandBody {
    WireFormatInfo(WireFormatInfo),
    KeepAliveInfo,
    ShutdownInfo,
    ConnectionInfo(ConnectionInfo),
    SessionInfo(SessionInfo),
    ConsumerInfo(ConsumerInfo),
    ProducerInfo(ProducerInfo),
    TransactionInfo(TransactionInfo),
    Message(Message),
    MessageAck(MessageAck),
    MessagePull(MessagePull),
    MessageDispatch(MessageDispatch),
    Response(Response),
    ExceptionResponse(ExceptionResponse),
    RemoveInfo(RemoveInfo),
    ConnectionControl(ConnectionControl),
    ConsumerControl(ConsumerControl),
    BrokerInfo(BrokerInfo),
    ConnectionError(ConnectionError),
}

/// One protocol unit: header plus tagged body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Assigned by the first correlator the command passes through; zero
    /// until then.
    pub command_id: CommandId,
    pub response_required: bool,
    pub body: CommandBody,
}

impl Command {
    pub fn new(body: CommandBody) -> Self {
        Self { command_id: 0, response_required: false, body }
    }

    /// Builds a command that expects a broker Response.
    pub fn request(body: CommandBody) -> Self {
        Self { command_id: 0, response_required: true, body }
    }

    /// Wire type tag, written after the length prefix of every frame. The
    /// values follow the classic OpenWire data-structure registry so that
    /// dumps stay recognizable.
    pub fn type_tag(&self) -> u8 {
        match &self.body {
            CommandBody::WireFormatInfo(_) => 1,
            CommandBody::BrokerInfo(_) => 2,
            CommandBody::ConnectionInfo(_) => 3,
            CommandBody::SessionInfo(_) => 4,
            CommandBody::ConsumerInfo(_) => 5,
            CommandBody::ProducerInfo(_) => 6,
            CommandBody::TransactionInfo(_) => 7,
            CommandBody::KeepAliveInfo => 10,
            CommandBody::ShutdownInfo => 11,
            CommandBody::RemoveInfo(_) => 12,
            CommandBody::ConnectionError(_) => 16,
            CommandBody::ConsumerControl(_) => 17,
            CommandBody::ConnectionControl(_) => 18,
            CommandBody::MessagePull(_) => 20,
            CommandBody::MessageDispatch(_) => 21,
            CommandBody::MessageAck(_) => 22,
            CommandBody::Message(_) => 23,
            CommandBody::Response(_) => 30,
            CommandBody::ExceptionResponse(_) => 31,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match &self.body {
            CommandBody::WireFormatInfo(_) => "WireFormatInfo",
            CommandBody::BrokerInfo(_) => "BrokerInfo",
            CommandBody::ConnectionInfo(_) => "ConnectionInfo",
            CommandBody::SessionInfo(_) => "SessionInfo",
            CommandBody::ConsumerInfo(_) => "ConsumerInfo",
            CommandBody::ProducerInfo(_) => "ProducerInfo",
            CommandBody::TransactionInfo(_) => "TransactionInfo",
            CommandBody::KeepAliveInfo => "KeepAliveInfo",
            CommandBody::ShutdownInfo => "ShutdownInfo",
            CommandBody::RemoveInfo(_) => "RemoveInfo",
            CommandBody::ConnectionError(_) => "ConnectionError",
            CommandBody::ConsumerControl(_) => "ConsumerControl",
            CommandBody::ConnectionControl(_) => "ConnectionControl",
            CommandBody::MessagePull(_) => "MessagePull",
            CommandBody::MessageDispatch(_) => "MessageDispatch",
            CommandBody::MessageAck(_) => "MessageAck",
            CommandBody::Message(_) => "Message",
            CommandBody::Response(_) => "Response",
            CommandBody::ExceptionResponse(_) => "ExceptionResponse",
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self.body, CommandBody::Message(_))
    }

    pub fn is_message_ack(&self) -> bool {
        matches!(self.body, CommandBody::MessageAck(_))
    }

    pub fn is_message_pull(&self) -> bool {
        matches!(self.body, CommandBody::MessagePull(_))
    }

    pub fn is_remove_info(&self) -> bool {
        matches!(self.body, CommandBody::RemoveInfo(_))
    }

    pub fn is_shutdown_info(&self) -> bool {
        matches!(self.body, CommandBody::ShutdownInfo)
    }

    pub fn is_keep_alive(&self) -> bool {
        matches!(self.body, CommandBody::KeepAliveInfo)
    }

    pub fn is_wire_format_info(&self) -> bool {
        matches!(self.body, CommandBody::WireFormatInfo(_))
    }

    /// For Response/ExceptionResponse: which outbound command this answers.
    pub fn correlation_id(&self) -> Option<CommandId> {
        match &self.body {
            CommandBody::Response(r) => Some(r.correlation_id),
            CommandBody::ExceptionResponse(r) => Some(r.correlation_id),
            _ => None,
        }
    }
}
