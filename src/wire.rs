//! # OpenWire Framing and Negotiation
//!
//! Frames and unframes [`Command`]s over a byte stream and computes the
//! effective wire parameters from the two sides' proposals.
//!
//! ## Frame layout
//!
//! ```text
//! ┌────────────────┬──────────┬───────────────────────────┐
//! │ length (4B BE) │ type (1B)│ body (negotiated encoding)│
//! └────────────────┴──────────┴───────────────────────────┘
//! ```
//!
//! The length prefix covers the type byte plus the body and is omitted when
//! `size_prefix_disabled` was negotiated true (both sides must then frame by
//! other means; the TCP transport always proposes prefixing on).
//!
//! ## Handshake
//!
//! The very first frame each side writes is a WireFormatInfo: the 8-byte
//! `ActiveMQ` magic, a 4-byte big-endian version, and the property map in
//! the fixed (loose) encoding, since nothing has been negotiated yet. The
//! effective value for each boolean option is the AND of the two proposals;
//! for numerics, the minimum.
//!
//! ## Tight vs. loose encoding
//!
//! Body encoding is bincode either way; "tight" selects variable-length
//! integer encoding, "loose" fixed-width. Negotiating tight off makes frames
//! larger but trivially seekable, which some peers prefer for debugging.

use crate::commands::{Command, CommandBody, WireFormatInfo, WireFormatProperties};
use crate::error::TransportError;
use bincode::Options;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Protocol magic carried by every WireFormatInfo frame.
pub const WIRE_MAGIC: [u8; 8] = *b"ActiveMQ";

/// The negotiated parameters for one physical transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireFormat {
    pub version: u32,
    pub tight_encoding: bool,
    pub size_prefix_disabled: bool,
    pub cache_enabled: bool,
    pub stack_trace_enabled: bool,
    /// Milliseconds; zero disables inactivity monitoring.
    pub max_inactivity_duration: i64,
    pub max_inactivity_initial_delay: i64,
    pub max_frame_size: usize,
}

impl Default for WireFormat {
    /// Pre-negotiation bootstrap format: loose encoding, prefix on, local
    /// defaults for the limits. Used to read and write the handshake frames
    /// themselves.
    fn default() -> Self {
        WireFormat::from_properties(
            crate::defaults::WIRE_VERSION,
            &WireFormatProperties {
                tight_encoding_enabled: false,
                ..WireFormatProperties::default()
            },
        )
    }
}

impl WireFormat {
    fn from_properties(version: u32, props: &WireFormatProperties) -> Self {
        Self {
            version,
            tight_encoding: props.tight_encoding_enabled,
            size_prefix_disabled: props.size_prefix_disabled,
            cache_enabled: props.cache_enabled,
            stack_trace_enabled: props.stack_trace_enabled,
            max_inactivity_duration: props.max_inactivity_duration,
            max_inactivity_initial_delay: props.max_inactivity_duration_initial_delay,
            max_frame_size: props.max_frame_size.max(0) as usize,
        }
    }

    /// Computes the effective format from the two proposals: AND for
    /// booleans, minimum for numerics, minimum version.
    pub fn negotiate(
        local: &WireFormatInfo,
        remote: &WireFormatInfo,
    ) -> Result<WireFormat, TransportError> {
        if local.version == 0 || remote.version == 0 {
            return Err(TransportError::Negotiation(format!(
                "unsupported wire version (local {}, remote {})",
                local.version, remote.version
            )));
        }

        let l = &local.properties;
        let r = &remote.properties;
        let negotiated = WireFormat {
            version: local.version.min(remote.version),
            tight_encoding: l.tight_encoding_enabled && r.tight_encoding_enabled,
            size_prefix_disabled: l.size_prefix_disabled && r.size_prefix_disabled,
            cache_enabled: l.cache_enabled && r.cache_enabled,
            stack_trace_enabled: l.stack_trace_enabled && r.stack_trace_enabled,
            max_inactivity_duration: l.max_inactivity_duration.min(r.max_inactivity_duration),
            max_inactivity_initial_delay: l
                .max_inactivity_duration_initial_delay
                .min(r.max_inactivity_duration_initial_delay),
            max_frame_size: (l.max_frame_size.min(r.max_frame_size)).max(0) as usize,
        };

        if negotiated.max_frame_size == 0 {
            return Err(TransportError::Negotiation(
                "negotiated max frame size is zero".to_string(),
            ));
        }

        trace!(
            version = negotiated.version,
            tight = negotiated.tight_encoding,
            max_frame = negotiated.max_frame_size,
            "wire format negotiated"
        );
        Ok(negotiated)
    }

    fn body_options(&self) -> impl Options {
        // bincode's DefaultOptions are varint; flip to fixint for the loose
        // encoding. The limit guards decode against corrupt length fields.
        bincode::options()
            .with_limit(self.max_frame_size as u64)
            .with_varint_encoding()
    }

    fn encode_body(&self, command: &Command) -> Result<Vec<u8>, TransportError> {
        let result = if self.tight_encoding {
            self.body_options().serialize(command)
        } else {
            self.body_options().with_fixint_encoding().serialize(command)
        };
        result.map_err(|e| TransportError::Codec(format!("encode {}: {e}", command.type_name())))
    }

    fn decode_body(&self, bytes: &[u8]) -> Result<Command, TransportError> {
        let result: Result<Command, _> = if self.tight_encoding {
            self.body_options().deserialize(bytes)
        } else {
            self.body_options().with_fixint_encoding().deserialize(bytes)
        };
        result.map_err(|e| TransportError::Codec(format!("decode command: {e}")))
    }
}

/// Encodes a command into one frame (type tag plus body, without the length
/// prefix). The caller prepends the prefix when the format calls for it.
pub fn encode_frame(command: &Command, wire: &WireFormat) -> Result<Vec<u8>, TransportError> {
    let mut frame = Vec::with_capacity(64);
    frame.push(command.type_tag());

    match &command.body {
        // The handshake frame has a fixed layout independent of the
        // negotiated encoding: magic, version, then the property map.
        CommandBody::WireFormatInfo(info) => {
            frame.extend_from_slice(&WIRE_MAGIC);
            frame.extend_from_slice(&info.version.to_be_bytes());
            let props = bincode::options()
                .with_fixint_encoding()
                .serialize(&info.properties)
                .map_err(|e| TransportError::Codec(format!("encode WireFormatInfo: {e}")))?;
            frame.extend_from_slice(&props);
        }
        _ => {
            frame.extend_from_slice(&wire.encode_body(command)?);
        }
    }

    if frame.len() > wire.max_frame_size {
        return Err(TransportError::Codec(format!(
            "frame of {} bytes exceeds negotiated maximum of {}",
            frame.len(),
            wire.max_frame_size
        )));
    }
    Ok(frame)
}

/// Decodes one frame (type tag plus body, length prefix already stripped).
pub fn decode_frame(frame: &[u8], wire: &WireFormat) -> Result<Command, TransportError> {
    let (&tag, body) = frame
        .split_first()
        .ok_or_else(|| TransportError::Codec("empty frame".to_string()))?;

    if tag == 1 {
        // WireFormatInfo: validate magic before anything else.
        if body.len() < WIRE_MAGIC.len() + 4 {
            return Err(TransportError::Negotiation("truncated WireFormatInfo".to_string()));
        }
        let (magic, rest) = body.split_at(WIRE_MAGIC.len());
        if magic != WIRE_MAGIC {
            return Err(TransportError::Negotiation(format!(
                "bad protocol magic: {:02x?}",
                magic
            )));
        }
        let (version_bytes, props_bytes) = rest.split_at(4);
        let version = u32::from_be_bytes(version_bytes.try_into().expect("4 bytes"));
        let properties: WireFormatProperties = bincode::options()
            .with_fixint_encoding()
            .deserialize(props_bytes)
            .map_err(|e| TransportError::Negotiation(format!("bad WireFormatInfo: {e}")))?;
        return Ok(Command::new(CommandBody::WireFormatInfo(WireFormatInfo {
            version,
            properties,
        })));
    }

    let command = wire.decode_body(body)?;
    if command.type_tag() != tag {
        return Err(TransportError::Codec(format!(
            "frame tag {} does not match decoded {} ({})",
            tag,
            command.type_tag(),
            command.type_name()
        )));
    }
    Ok(command)
}

/// Reads one length-prefixed frame from the stream and decodes it.
pub async fn read_command<R>(reader: &mut R, wire: &WireFormat) -> Result<Command, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_be_bytes(len_bytes) as usize;

    if frame_len == 0 {
        return Err(TransportError::Codec("zero-length frame".to_string()));
    }
    if frame_len > wire.max_frame_size {
        return Err(TransportError::Codec(format!(
            "inbound frame of {} bytes exceeds negotiated maximum of {}",
            frame_len, wire.max_frame_size
        )));
    }

    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;
    decode_frame(&frame, wire)
}

/// Encodes and writes one frame, prefixed unless negotiated off.
pub async fn write_command<W>(
    writer: &mut W,
    command: &Command,
    wire: &WireFormat,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(command, wire)?;
    if !wire.size_prefix_disabled {
        writer.write_all(&(frame.len() as u32).to_be_bytes()).await?;
    }
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}
