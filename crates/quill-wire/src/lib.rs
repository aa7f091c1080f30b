// Wire format for the quill TCP protocol: length-prefixed frames, ASCII
// command lines with optional length-prefixed binary bodies, and the binary
// message envelope delivered to subscribers.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Protocol version marker sent as the first four bytes of every connection.
pub const MAGIC: &[u8; 4] = b"  V2";
/// Acknowledgement payload expected for every acked command.
pub const OK: &[u8] = b"OK";
/// Response payload used by the peer as a liveness probe.
pub const HEARTBEAT: &[u8] = b"_heartbeat_";

pub const FRAME_TYPE_RESPONSE: u32 = 0;
pub const FRAME_TYPE_ERROR: u32 = 1;
pub const FRAME_TYPE_MESSAGE: u32 = 2;

/// Message ids are a fixed-width ASCII field assigned by the peer.
pub const MESSAGE_ID_LEN: usize = 16;

// Message envelope: timestamp (8) + attempts (2) + id (16).
const MESSAGE_HEADER_LEN: usize = 8 + 2 + MESSAGE_ID_LEN;

const MAX_NAME_LEN: usize = 64;
const EPHEMERAL_SUFFIX: &str = "#ephemeral";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("incomplete frame")]
    Incomplete,
    #[error("unknown frame type {0}")]
    UnknownFrameType(u32),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("failed to serialize identify body")]
    Serialize(#[source] serde_json::Error),
}

/// One decoded wire frame from the peer.
///
/// The on-wire layout is `[u32 length][u32 frame type][payload]`, big endian,
/// where `length` counts the frame-type field plus the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Response(Bytes),
    Error(Bytes),
    Message(MessageFrame),
}

impl Frame {
    pub fn frame_type(&self) -> u32 {
        match self {
            Frame::Response(_) => FRAME_TYPE_RESPONSE,
            Frame::Error(_) => FRAME_TYPE_ERROR,
            Frame::Message(_) => FRAME_TYPE_MESSAGE,
        }
    }

    /// Decode a frame from its type tag and payload bytes.
    pub fn decode(frame_type: u32, payload: Bytes) -> Result<Self> {
        match frame_type {
            FRAME_TYPE_RESPONSE => Ok(Frame::Response(payload)),
            FRAME_TYPE_ERROR => Ok(Frame::Error(payload)),
            FRAME_TYPE_MESSAGE => Ok(Frame::Message(MessageFrame::decode(payload)?)),
            other => Err(Error::UnknownFrameType(other)),
        }
    }

    /// Encode the full frame, including the length prefix and type tag.
    pub fn encode(&self) -> Result<Bytes> {
        let payload = match self {
            Frame::Response(payload) | Frame::Error(payload) => payload.clone(),
            Frame::Message(message) => message.encode(),
        };
        let length = checked_frame_len(payload.len())?;
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u32(length);
        buf.put_u32(self.frame_type());
        buf.extend_from_slice(&payload);
        Ok(buf.freeze())
    }
}

/// Opaque peer-assigned message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub [u8; MESSAGE_ID_LEN]);

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Ids are ASCII in practice; fall back to lossy printing if not.
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl From<&[u8; MESSAGE_ID_LEN]> for MessageId {
    fn from(bytes: &[u8; MESSAGE_ID_LEN]) -> Self {
        Self(*bytes)
    }
}

/// Payload of a message frame: delivery metadata plus the opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFrame {
    /// Peer-side enqueue time, nanoseconds since the epoch.
    pub timestamp: i64,
    /// Number of delivery attempts, including this one.
    pub attempts: u16,
    pub id: MessageId,
    pub body: Bytes,
}

impl MessageFrame {
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.remaining() < MESSAGE_HEADER_LEN {
            return Err(Error::Incomplete);
        }
        let timestamp = payload.get_i64();
        let attempts = payload.get_u16();
        let mut id = [0u8; MESSAGE_ID_LEN];
        payload.copy_to_slice(&mut id);
        Ok(Self {
            timestamp,
            attempts,
            id: MessageId(id),
            body: payload,
        })
    }

    /// Encode the message envelope (payload only, no frame header).
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MESSAGE_HEADER_LEN + self.body.len());
        buf.put_i64(self.timestamp);
        buf.put_u16(self.attempts);
        buf.extend_from_slice(&self.id.0);
        buf.extend_from_slice(&self.body);
        buf.freeze()
    }
}

/// Client-to-peer commands.
///
/// Every command is an ASCII line terminated by `\n`; commands that carry a
/// body append `[u32 length][body]` after the line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Identify { body: Bytes },
    Sub { topic: String, channel: String },
    Rdy(u64),
    Fin(MessageId),
    Req { id: MessageId, delay_ms: u64 },
    Touch(MessageId),
    Cls,
    Nop,
    Pub { topic: String, body: Bytes },
    Dpub { topic: String, delay_ms: u64, body: Bytes },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Identify { .. } => "IDENTIFY",
            Command::Sub { .. } => "SUB",
            Command::Rdy(_) => "RDY",
            Command::Fin(_) => "FIN",
            Command::Req { .. } => "REQ",
            Command::Touch(_) => "TOUCH",
            Command::Cls => "CLS",
            Command::Nop => "NOP",
            Command::Pub { .. } => "PUB",
            Command::Dpub { .. } => "DPUB",
        }
    }

    /// Encode the command line plus any length-prefixed body.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            Command::Identify { body } => {
                buf.extend_from_slice(b"IDENTIFY\n");
                put_body(&mut buf, body)?;
            }
            Command::Sub { topic, channel } => {
                buf.extend_from_slice(format!("SUB {topic} {channel}\n").as_bytes());
            }
            Command::Rdy(count) => {
                buf.extend_from_slice(format!("RDY {count}\n").as_bytes());
            }
            Command::Fin(id) => {
                buf.extend_from_slice(format!("FIN {id}\n").as_bytes());
            }
            Command::Req { id, delay_ms } => {
                buf.extend_from_slice(format!("REQ {id} {delay_ms}\n").as_bytes());
            }
            Command::Touch(id) => {
                buf.extend_from_slice(format!("TOUCH {id}\n").as_bytes());
            }
            Command::Cls => buf.extend_from_slice(b"CLS\n"),
            Command::Nop => buf.extend_from_slice(b"NOP\n"),
            Command::Pub { topic, body } => {
                buf.extend_from_slice(format!("PUB {topic}\n").as_bytes());
                put_body(&mut buf, body)?;
            }
            Command::Dpub {
                topic,
                delay_ms,
                body,
            } => {
                buf.extend_from_slice(format!("DPUB {topic} {delay_ms}\n").as_bytes());
                put_body(&mut buf, body)?;
            }
        }
        Ok(buf.freeze())
    }
}

// The length fields are u32; a longer payload would truncate on the wire
// and desynchronize the stream.
fn checked_frame_len(payload_len: usize) -> Result<u32> {
    u32::try_from(payload_len + 4).map_err(|_| Error::FrameTooLarge(payload_len))
}

fn checked_body_len(body_len: usize) -> Result<u32> {
    u32::try_from(body_len).map_err(|_| Error::FrameTooLarge(body_len))
}

fn put_body(buf: &mut BytesMut, body: &Bytes) -> Result<()> {
    buf.put_u32(checked_body_len(body.len())?);
    buf.extend_from_slice(body);
    Ok(())
}

/// Capability/identity record sent as the IDENTIFY body during the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identify {
    pub client_id: String,
    pub hostname: String,
    pub user_agent: String,
    pub feature_negotiation: bool,
}

impl Identify {
    pub fn encode(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self).map_err(Error::Serialize)?;
        Ok(Bytes::from(body))
    }
}

/// Validate a topic or channel name before it hits the wire.
///
/// Names are 1..=64 characters from `[A-Za-z0-9._-]`, with an optional
/// `#ephemeral` suffix.
pub fn validate_name(name: &str) -> Result<()> {
    let base = name.strip_suffix(EPHEMERAL_SUFFIX).unwrap_or(name);
    let valid = !base.is_empty()
        && base.len() <= MAX_NAME_LEN
        && base
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(name.to_string()))
    }
}
