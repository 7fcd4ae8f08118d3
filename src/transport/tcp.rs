//! # TCP Transport
//!
//! A single TCP connection speaking the wire protocol: connects with a
//! configurable timeout, applies socket tuning, performs the WireFormatInfo
//! exchange, then runs one reader task that decodes frames into commands for
//! the installed listener while writers serialize through a writer-side
//! mutex.
//!
//! The socket is driven by the shared I/O runtime so that reader lifetime is
//! independent of whichever task created the transport. A concurrent
//! `close()` interrupts an outstanding read immediately via the close
//! notification and shuts down both halves of the stream.

use crate::commands::{Command, CommandBody, WireFormatInfo};
use crate::error::{Result, TransportError};
use crate::furi::BrokerUri;
use crate::runtime::{self, IoRuntimeGuard};
use crate::transport::{ListenerSlot, Transport, TransportListener};
use crate::wire::{self, WireFormat};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

/// Socket-level configuration, populated from URI parameters.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Connect timeout; `None` waits as long as the OS does.
    pub connect_timeout: Option<Duration>,
    pub no_delay: bool,
    pub send_buffer_size: Option<usize>,
    pub recv_buffer_size: Option<usize>,
    /// The wire parameters this side proposes during the handshake.
    pub wire_format: WireFormatInfo,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_millis(crate::defaults::SEND_TIMEOUT_MS)),
            no_delay: true,
            send_buffer_size: None,
            recv_buffer_size: None,
            wire_format: WireFormatInfo::default(),
        }
    }
}

impl TcpConfig {
    /// Builds a config from a broker URI's query parameters plus any
    /// forwarded `transport.`-prefixed options. Unknown keys are rejected.
    pub fn from_uri(
        uri: &BrokerUri,
        forwarded: &BTreeMap<String, String>,
    ) -> Result<TcpConfig> {
        let mut config = TcpConfig::default();
        for (key, value) in forwarded.iter().chain(uri.params.iter()) {
            config.apply(key, value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "soConnectTimeout" => {
                let millis: u64 = parse_number(key, value)?;
                self.connect_timeout =
                    if millis == 0 { None } else { Some(Duration::from_millis(millis)) };
            }
            "tcpNoDelay" => self.no_delay = parse_flag(key, value)?,
            "sendBufferSize" => self.send_buffer_size = Some(parse_number(key, value)? as usize),
            "receiveBufferSize" => {
                self.recv_buffer_size = Some(parse_number(key, value)? as usize)
            }
            unknown => {
                return Err(TransportError::Configuration(format!(
                    "unknown transport option '{unknown}'"
                )))
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(TransportError::Configuration(format!(
            "transport option '{key}' expects true/false, got '{other}'"
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        TransportError::Configuration(format!(
            "transport option '{key}' expects an integer, got '{value}'"
        ))
    })
}

struct Shared {
    listener: ListenerSlot,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    wire: Mutex<Option<WireFormat>>,
    remote: Mutex<Option<String>>,
    started: AtomicBool,
    closed: AtomicBool,
    exception_reported: AtomicBool,
    close_notify: Notify,
    reader_task: Mutex<Option<JoinHandle<()>>>,
    /// Keeps the shared runtime acquisition alive for the reader's lifetime.
    io_guard: Mutex<Option<IoRuntimeGuard>>,
}

/// A physical transport over one TCP connection.
pub struct TcpTransport {
    uri: BrokerUri,
    config: TcpConfig,
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new(uri: BrokerUri, config: TcpConfig) -> Self {
        Self {
            uri,
            config,
            shared: Arc::new(Shared {
                listener: ListenerSlot::empty(),
                writer: tokio::sync::Mutex::new(None),
                wire: Mutex::new(None),
                remote: Mutex::new(None),
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                exception_reported: AtomicBool::new(false),
                close_notify: Notify::new(),
                reader_task: Mutex::new(None),
                io_guard: Mutex::new(None),
            }),
        }
    }

    pub fn uri(&self) -> &BrokerUri {
        &self.uri
    }

    /// Connects, tunes the socket, and performs the handshake. Runs on the
    /// shared I/O runtime so the resulting stream is registered there.
    async fn open(
        uri: BrokerUri,
        config: TcpConfig,
    ) -> Result<(OwnedReadHalf, OwnedWriteHalf, WireFormat, String)> {
        let authority = uri.authority();
        debug!(uri = %uri, "connecting");

        let stream = match config.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(&authority))
                .await
                .map_err(|_| {
                    TransportError::Timeout(format!(
                        "connect to {authority} timed out after {limit:?}"
                    ))
                })??,
            None => TcpStream::connect(&authority).await?,
        };

        // Socket tuning happens on the std handle, as socket2 wants one.
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(config.no_delay)?;
        if let Some(size) = config.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = config.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        drop(socket);
        let stream = TcpStream::from_std(std_stream)?;
        let remote = stream.peer_addr()?.to_string();

        // Handshake: both ends send a WireFormatInfo as the very first
        // command; the effective parameters are the conservative minimum.
        let bootstrap = WireFormat::default();
        let (mut read_half, mut write_half) = stream.into_split();
        let local_info = config.wire_format.clone();
        wire::write_command(
            &mut write_half,
            &Command::new(CommandBody::WireFormatInfo(local_info.clone())),
            &bootstrap,
        )
        .await?;

        let handshake_limit = config
            .connect_timeout
            .unwrap_or(Duration::from_millis(crate::defaults::SEND_TIMEOUT_MS));
        let first = timeout(handshake_limit, wire::read_command(&mut read_half, &bootstrap))
            .await
            .map_err(|_| {
                TransportError::Negotiation(format!(
                    "no WireFormatInfo from {authority} within {handshake_limit:?}"
                ))
            })??;

        let remote_info = match first.body {
            CommandBody::WireFormatInfo(info) => info,
            other => {
                return Err(TransportError::Negotiation(format!(
                    "expected WireFormatInfo as first command, got {:?}",
                    Command::new(other).type_name()
                )))
            }
        };

        let negotiated = WireFormat::negotiate(&local_info, &remote_info)?;
        debug!(uri = %uri, version = negotiated.version, "handshake complete");
        Ok((read_half, write_half, negotiated, remote))
    }

    fn spawn_reader(&self, io: &IoRuntimeGuard, mut read_half: OwnedReadHalf, wire: WireFormat) {
        let shared = self.shared.clone();
        let task = io.spawn(async move {
            loop {
                if shared.closed.load(Ordering::Acquire) {
                    break;
                }
                tokio::select! {
                    _ = shared.close_notify.notified() => break,
                    result = wire::read_command(&mut read_half, &wire) => {
                        match result {
                            Ok(command) => {
                                trace!(command = command.type_name(), id = command.command_id, "received");
                                if let Some(listener) = shared.listener.current() {
                                    listener.on_command(command);
                                }
                            }
                            Err(error) => {
                                // Deliver the failure exactly once, and only
                                // if it was not caused by our own close().
                                if !shared.closed.load(Ordering::Acquire)
                                    && !shared.exception_reported.swap(true, Ordering::SeqCst)
                                {
                                    warn!(%error, "transport read failed");
                                    if let Some(listener) = shared.listener.current() {
                                        listener.on_exception(error);
                                    }
                                }
                                break;
                            }
                        }
                    }
                }
            }
            trace!("reader task finished");
        });
        *self.shared.reader_task.lock() = Some(task);
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn start(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed());
        }
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let io = runtime::acquire();
        let open = io.spawn(Self::open(self.uri.clone(), self.config.clone()));
        let (read_half, write_half, negotiated, remote) = open
            .await
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))??;

        *self.shared.wire.lock() = Some(negotiated.clone());
        *self.shared.remote.lock() = Some(remote);
        *self.shared.writer.lock().await = Some(write_half);
        self.spawn_reader(&io, read_half, negotiated);
        *self.shared.io_guard.lock() = Some(io);
        Ok(())
    }

    async fn oneway(&self, command: Command) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TransportError::closed());
        }
        let wire = self
            .shared
            .wire
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Closed("transport not started".to_string()))?;

        let mut guard = self.shared.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| TransportError::Closed("transport writer shut down".to_string()))?;
        wire::write_command(writer, &command, &wire).await?;
        trace!(command = command.type_name(), id = command.command_id, "sent");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(uri = %self.uri, "closing transport");
        self.shared.close_notify.notify_waiters();

        if let Some(mut writer) = self.shared.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        // The reader task observes the notification and exits on its own;
        // nothing to join from here (close may run inside its callback). Its
        // runtime acquisition is released once it is gone.
        self.shared.io_guard.lock().take();
        Ok(())
    }

    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.shared.listener.set(listener);
    }

    fn is_connected(&self) -> bool {
        self.shared.started.load(Ordering::Acquire)
            && !self.shared.closed.load(Ordering::Acquire)
            && self.shared.wire.lock().is_some()
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn remote_address(&self) -> Option<String> {
        self.shared.remote.lock().clone()
    }

    fn wire_format(&self) -> Option<WireFormat> {
        self.shared.wire.lock().clone()
    }
}
