//! # Response Correlator
//!
//! Sits immediately above the wire on each physical transport. Assigns
//! command ids, pairs broker responses with the waiting caller, and converts
//! a transport failure into failure of every pending waiter, in the order
//! the requests were registered.
//!
//! The id sequence can be shared: the failover transport hands one sequence
//! to every correlator it creates so that a command replayed after a
//! reconnect keeps its original id and fresh commands never collide with it.
//! At most one completion is ever delivered per request: a Response, an
//! ExceptionResponse, a timeout, or the transport failure, whichever comes
//! first.

use crate::commands::{Command, CommandBody, CommandId, Response};
use crate::error::{Result, TransportError};
use crate::transport::{ListenerSlot, Transport, TransportListener};
use crate::wire::WireFormat;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Monotonic command-id source. Cloning shares the underlying counter.
#[derive(Clone)]
pub struct CommandIdSequence {
    next: Arc<AtomicI32>,
}

impl CommandIdSequence {
    pub fn new() -> Self {
        Self { next: Arc::new(AtomicI32::new(1)) }
    }

    pub fn next_id(&self) -> CommandId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Assigns an id only when the command does not already carry one, so
    /// replayed commands keep their identity.
    pub fn assign(&self, command: &mut Command) {
        if command.command_id == 0 {
            command.command_id = self.next_id();
        }
    }
}

impl Default for CommandIdSequence {
    fn default() -> Self {
        Self::new()
    }
}

type Waiter = oneshot::Sender<Result<Response>>;

struct CorrelatorShared {
    listener: ListenerSlot,
    /// Pending waiters in registration order; drained front-to-back when the
    /// transport fails.
    pending: Mutex<Vec<(CommandId, Waiter)>>,
    failed: AtomicBool,
}

impl CorrelatorShared {
    fn complete(&self, id: CommandId, outcome: Result<Response>) {
        let waiter = {
            let mut pending = self.pending.lock();
            pending
                .iter()
                .position(|(pending_id, _)| *pending_id == id)
                .map(|index| pending.remove(index).1)
        };
        if let Some(waiter) = waiter {
            // The receiver may have timed out and gone away; that is fine.
            let _ = waiter.send(outcome);
        }
    }

    fn fail_all(&self, error: &TransportError) {
        let drained: Vec<(CommandId, Waiter)> = std::mem::take(&mut *self.pending.lock());
        for (id, waiter) in drained {
            trace!(id, "failing pending request");
            let _ = waiter.send(Err(error.duplicate()));
        }
    }
}

/// Listener installed on the inner transport; responses are matched here and
/// everything (responses included) flows on to the upper listener.
struct CorrelatorTap {
    shared: Arc<CorrelatorShared>,
}

impl TransportListener for CorrelatorTap {
    fn on_command(&self, command: Command) {
        match &command.body {
            CommandBody::Response(response) => {
                self.shared.complete(response.correlation_id, Ok(*response));
            }
            CommandBody::ExceptionResponse(exception) => {
                self.shared.complete(
                    exception.correlation_id,
                    Err(TransportError::Protocol {
                        class: exception.error.exception_class.clone(),
                        message: exception.error.message.clone(),
                    }),
                );
            }
            _ => {}
        }
        if let Some(listener) = self.shared.listener.current() {
            listener.on_command(command);
        }
    }

    fn on_exception(&self, error: TransportError) {
        if !self.shared.failed.swap(true, Ordering::SeqCst) {
            self.shared.fail_all(&error);
        }
        if let Some(listener) = self.shared.listener.current() {
            listener.on_exception(error);
        }
    }
}

/// Request/response correlation layer over a single physical transport.
pub struct ResponseCorrelator {
    inner: Arc<dyn Transport>,
    sequence: CommandIdSequence,
    shared: Arc<CorrelatorShared>,
}

impl ResponseCorrelator {
    /// Wraps `inner` with a private id sequence.
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self::with_sequence(inner, CommandIdSequence::new())
    }

    /// Wraps `inner` sharing an existing id sequence (the failover path).
    pub fn with_sequence(inner: Arc<dyn Transport>, sequence: CommandIdSequence) -> Self {
        let shared = Arc::new(CorrelatorShared {
            listener: ListenerSlot::empty(),
            pending: Mutex::new(Vec::new()),
            failed: AtomicBool::new(false),
        });
        inner.set_listener(Arc::new(CorrelatorTap { shared: shared.clone() }));
        Self { inner, sequence, shared }
    }

    pub fn sequence(&self) -> CommandIdSequence {
        self.sequence.clone()
    }

    fn register(&self, id: CommandId) -> oneshot::Receiver<Result<Response>> {
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().push((id, tx));
        rx
    }

    fn unregister(&self, id: CommandId) {
        let mut pending = self.shared.pending.lock();
        pending.retain(|(pending_id, _)| *pending_id != id);
    }
}

#[async_trait]
impl Transport for ResponseCorrelator {
    async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    async fn oneway(&self, mut command: Command) -> Result<()> {
        self.sequence.assign(&mut command);
        let id = command.command_id;

        // Register before writing so an immediate response cannot race past
        // its waiter.
        if command.response_required {
            let _receiver = self.register(id);
        }
        match self.inner.oneway(command).await {
            Ok(()) => Ok(()),
            Err(error) => {
                self.unregister(id);
                Err(error)
            }
        }
    }

    async fn request(&self, mut command: Command, timeout: Duration) -> Result<Response> {
        command.response_required = true;
        self.sequence.assign(&mut command);
        let id = command.command_id;
        let receiver = self.register(id);

        if let Err(error) = self.inner.oneway(command).await {
            self.unregister(id);
            return Err(error);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::closed()),
            Err(_) => {
                self.unregister(id);
                Err(TransportError::Timeout(format!(
                    "request {id} timed out after {timeout:?}"
                )))
            }
        }
    }

    async fn async_request(
        &self,
        mut command: Command,
        timeout: Duration,
        callback: crate::transport::ResponseCallback,
    ) -> Result<()> {
        command.response_required = true;
        self.sequence.assign(&mut command);
        let id = command.command_id;
        let receiver = self.register(id);

        if let Err(error) = self.inner.oneway(command).await {
            self.unregister(id);
            return Err(error);
        }

        // The caller only pays for the write; completion (or the timeout)
        // reaches the callback from a detached task.
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(TransportError::closed()),
                Err(_) => {
                    shared.pending.lock().retain(|(pending_id, _)| *pending_id != id);
                    Err(TransportError::Timeout(format!(
                        "request {id} timed out after {timeout:?}"
                    )))
                }
            };
            callback(outcome);
        });
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        debug!("correlator closing, failing pending requests");
        self.shared.fail_all(&TransportError::closed());
        self.inner.close().await
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.shared.listener.set(listener);
    }

    fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    fn remote_address(&self) -> Option<String> {
        self.inner.remote_address()
    }

    fn wire_format(&self) -> Option<WireFormat> {
        self.inner.wire_format()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ExceptionResponse, RemoteError};

    /// Loopback stub: records sends and lets the test inject inbound
    /// commands through the installed tap.
    struct Loopback {
        listener: ListenerSlot,
        sent: Mutex<Vec<Command>>,
        fail_writes: AtomicBool,
    }

    impl Loopback {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                listener: ListenerSlot::empty(),
                sent: Mutex::new(Vec::new()),
                fail_writes: AtomicBool::new(false),
            })
        }

        fn inject(&self, command: Command) {
            self.listener.current().unwrap().on_command(command);
        }

        fn inject_failure(&self) {
            self.listener.current().unwrap().on_exception(TransportError::Io(
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"),
            ));
        }
    }

    #[async_trait]
    impl Transport for Loopback {
        async fn start(&self) -> Result<()> {
            Ok(())
        }
        async fn oneway(&self, command: Command) -> Result<()> {
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "pipe",
                )));
            }
            self.sent.lock().push(command);
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
        fn set_listener(&self, listener: Arc<dyn TransportListener>) {
            self.listener.set(listener);
        }
        fn is_connected(&self) -> bool {
            true
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn request_completes_with_matching_response() {
        let inner = Loopback::new();
        let correlator = Arc::new(ResponseCorrelator::new(inner.clone()));

        let pending = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_secs(1))
                    .await
            })
        };

        // Wait until the command hit the wire, then answer it.
        let sent_id = loop {
            if let Some(command) = inner.sent.lock().first() {
                break command.command_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert!(sent_id > 0);
        inner.inject(Command::new(CommandBody::Response(Response { correlation_id: sent_id })));

        let response = pending.await.unwrap().unwrap();
        assert_eq!(response.correlation_id, sent_id);
    }

    #[tokio::test]
    async fn exception_response_surfaces_as_protocol_error() {
        let inner = Loopback::new();
        let correlator = Arc::new(ResponseCorrelator::new(inner.clone()));

        let pending = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_secs(1))
                    .await
            })
        };

        let sent_id = loop {
            if let Some(command) = inner.sent.lock().first() {
                break command.command_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        inner.inject(Command::new(CommandBody::ExceptionResponse(ExceptionResponse {
            correlation_id: sent_id,
            error: RemoteError {
                exception_class: "javax.jms.JMSSecurityException".into(),
                message: "denied".into(),
            },
        })));

        match pending.await.unwrap() {
            Err(TransportError::Protocol { class, .. }) => {
                assert_eq!(class, "javax.jms.JMSSecurityException")
            }
            other => panic!("expected protocol error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn transport_failure_fails_all_pending_waiters() {
        let inner = Loopback::new();
        let correlator = Arc::new(ResponseCorrelator::new(inner.clone()));

        let mut waiters = Vec::new();
        for _ in 0..3 {
            let correlator = correlator.clone();
            waiters.push(tokio::spawn(async move {
                correlator
                    .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_secs(5))
                    .await
            }));
        }
        while inner.sent.lock().len() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        inner.inject_failure();
        for waiter in waiters {
            match waiter.await.unwrap() {
                Err(TransportError::Io(_)) => {}
                other => panic!("expected I/O failure, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn write_failure_unregisters_the_waiter() {
        let inner = Loopback::new();
        let correlator = ResponseCorrelator::new(inner.clone());
        inner.fail_writes.store(true, Ordering::SeqCst);

        let result = correlator
            .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(TransportError::Io(_))));
        assert!(correlator.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn shared_sequence_preserves_assigned_ids() {
        let sequence = CommandIdSequence::new();
        let inner = Loopback::new();
        let correlator = ResponseCorrelator::with_sequence(inner.clone(), sequence.clone());

        let mut replayed = Command::new(CommandBody::KeepAliveInfo);
        replayed.command_id = 41;
        correlator.oneway(replayed).await.unwrap();
        correlator.oneway(Command::new(CommandBody::KeepAliveInfo)).await.unwrap();

        let sent = inner.sent.lock();
        assert_eq!(sent[0].command_id, 41);
        assert_eq!(sent[1].command_id, 1, "fresh ids come from the shared sequence");
    }

    #[tokio::test]
    async fn async_request_invokes_the_callback_with_the_response() {
        let inner = Loopback::new();
        let correlator = ResponseCorrelator::new(inner.clone());

        let (done_tx, done_rx) = oneshot::channel();
        let callback: crate::transport::ResponseCallback = Box::new(move |outcome| {
            let _ = done_tx.send(outcome);
        });
        correlator
            .async_request(
                Command::new(CommandBody::KeepAliveInfo),
                Duration::from_secs(1),
                callback,
            )
            .await
            .unwrap();

        let sent_id = loop {
            if let Some(command) = inner.sent.lock().first() {
                break command.command_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        inner.inject(Command::new(CommandBody::Response(Response { correlation_id: sent_id })));

        let outcome = done_rx.await.unwrap();
        assert_eq!(outcome.unwrap().correlation_id, sent_id);
    }

    #[tokio::test]
    async fn async_request_times_out_into_the_callback() {
        let inner = Loopback::new();
        let correlator = ResponseCorrelator::new(inner.clone());

        let (done_tx, done_rx) = oneshot::channel();
        correlator
            .async_request(
                Command::new(CommandBody::KeepAliveInfo),
                Duration::from_millis(50),
                Box::new(move |outcome| {
                    let _ = done_tx.send(outcome);
                }),
            )
            .await
            .unwrap();

        match done_rx.await.unwrap() {
            Err(TransportError::Timeout(_)) => {}
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(correlator.shared.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn request_timeout() {
        let inner = Loopback::new();
        let correlator = ResponseCorrelator::new(inner.clone());
        let result = correlator
            .request(Command::new(CommandBody::KeepAliveInfo), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
        assert!(correlator.shared.pending.lock().is_empty());
    }
}
