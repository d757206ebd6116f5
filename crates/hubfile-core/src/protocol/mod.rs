//! File sub-protocol wire format.
//!
//! Every payload on the file sub-protocol starts with a one-byte frame kind.
//!
//! ## Control frames
//!
//! ```text
//! ┌──────┬──────────────────────────────────────────────┐
//! │ 0x01 │ {"action": "read|write|read_resp|write_resp", │
//! │      │  "data": { ... }}                             │
//! └──────┴──────────────────────────────────────────────┘
//! ```
//!
//! ## Data and ack frames
//!
//! ```text
//! ┌──────┬─────────┬───────┬──────────┬────────────┬───────────┬──────────┐
//! │ Kind │ Version │ Flags │ Reserved │ Session ID │  Offset   │   Body   │
//! │  1   │    1    │   1   │    2     │     16     │ 8 (BE)    │ data only│
//! └──────┴─────────┴───────┴──────────┴────────────┴───────────┴──────────┘
//! ```
//!
//! - Kind: `0x02` data, `0x03` ack
//! - Version: `0x01`
//! - Flags: bit 0 is FIN (last data frame)
//! - Offset: byte offset of the body (data) or cumulative received bytes (ack)

mod messages;
mod session_id;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub use messages::{ReadOp, ReadReq, ReadResp, WriteReq, WriteResp, OP_OFFER};
pub use session_id::SessionId;

/// Size of the data/ack header following the kind byte.
pub const BIN_HEADER_SIZE: usize = 1 + 1 + 2 + 16 + 8;

/// Smallest valid data/ack payload.
pub const MIN_BIN_FRAME: usize = 1 + BIN_HEADER_SIZE;

/// Binary header version.
pub const BIN_VERSION: u8 = 1;

/// FIN flag: the frame carries the last byte of the file.
pub const FLAG_FIN: u8 = 1 << 0;

/// Response code for success.
pub const CODE_OK: u16 = 1;

/// Frame kinds on the file sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// JSON control envelope
    Ctrl = 0x01,
    /// File bytes at an offset
    Data = 0x02,
    /// Cumulative acknowledgement
    Ack = 0x03,
}

impl FrameKind {
    /// Parse a frame kind from a byte.
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Ctrl),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Control actions carried in the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Pull, list or read_text request
    Read,
    /// Offer request
    Write,
    /// Response to a read
    ReadResp,
    /// Response to a write
    WriteResp,
}

impl Action {
    /// Wire name of the action.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadResp => "read_resp",
            Self::WriteResp => "write_resp",
        }
    }

    /// Parse an action name, ignoring case and surrounding whitespace.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "read" => Some(Self::Read),
            "write" => Some(Self::Write),
            "read_resp" => Some(Self::ReadResp),
            "write_resp" => Some(Self::WriteResp),
            _ => None,
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON control envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Action name
    pub action: String,
    /// Action-specific body
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Parsed action, if recognised.
    pub fn action(&self) -> Option<Action> {
        Action::parse(&self.action)
    }

    /// Decode the body into a typed message.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not match `T`.
    pub fn decode_data<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        T::deserialize(&self.data).map_err(|e| Error::Serialization(e.to_string()))
    }
}

/// Header shared by data and ack frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinHeader {
    /// Header version, always [`BIN_VERSION`] on encode
    pub version: u8,
    /// Flag bits
    pub flags: u8,
    /// Transfer session
    pub session_id: SessionId,
    /// Byte offset
    pub offset: u64,
}

impl BinHeader {
    /// Whether the FIN flag is set.
    pub const fn fin(&self) -> bool {
        self.flags & FLAG_FIN != 0
    }

    /// Encode the header to bytes.
    #[must_use]
    pub fn encode(&self) -> [u8; BIN_HEADER_SIZE] {
        let mut buf = [0u8; BIN_HEADER_SIZE];
        buf[0] = self.version;
        buf[1] = self.flags;
        buf[4..20].copy_from_slice(self.session_id.as_bytes());
        buf[20..28].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Decode a header from bytes. The reserved field is ignored.
    pub fn decode(buf: &[u8; BIN_HEADER_SIZE]) -> Self {
        let mut sid = [0u8; 16];
        sid.copy_from_slice(&buf[4..20]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&buf[20..28]);
        Self {
            version: buf[0],
            flags: buf[1],
            session_id: SessionId::from_bytes(sid),
            offset: u64::from_be_bytes(offset),
        }
    }
}

/// A decoded file sub-protocol payload.
#[derive(Debug, Clone)]
pub enum Frame<'a> {
    /// Control envelope
    Ctrl(Envelope),
    /// Data frame with its body
    Data {
        /// Header
        header: BinHeader,
        /// File bytes
        body: &'a [u8],
    },
    /// Ack frame; any trailing bytes are ignored
    Ack(BinHeader),
}

/// Encode a control frame: kind byte followed by the JSON envelope.
///
/// # Errors
///
/// Returns an error if `data` cannot be serialized.
pub fn encode_ctrl<T: Serialize>(action: Action, data: &T) -> Result<Vec<u8>> {
    let data = serde_json::to_value(data).map_err(|e| Error::Serialization(e.to_string()))?;
    let envelope = Envelope {
        action: action.as_str().to_string(),
        data,
    };
    let json = serde_json::to_vec(&envelope).map_err(|e| Error::Serialization(e.to_string()))?;

    let mut buf = Vec::with_capacity(1 + json.len());
    buf.push(FrameKind::Ctrl as u8);
    buf.extend_from_slice(&json);
    Ok(buf)
}

/// Encode a data frame.
#[must_use]
pub fn encode_data(session_id: SessionId, offset: u64, fin: bool, body: &[u8]) -> Vec<u8> {
    let header = BinHeader {
        version: BIN_VERSION,
        flags: if fin { FLAG_FIN } else { 0 },
        session_id,
        offset,
    };
    let mut buf = Vec::with_capacity(MIN_BIN_FRAME + body.len());
    buf.push(FrameKind::Data as u8);
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(body);
    buf
}

/// Encode an ack frame reporting `offset` contiguous bytes received.
#[must_use]
pub fn encode_ack(session_id: SessionId, offset: u64) -> Vec<u8> {
    let header = BinHeader {
        version: BIN_VERSION,
        flags: 0,
        session_id,
        offset,
    };
    let mut buf = Vec::with_capacity(MIN_BIN_FRAME);
    buf.push(FrameKind::Ack as u8);
    buf.extend_from_slice(&header.encode());
    buf
}

/// Decode a file sub-protocol payload.
///
/// # Errors
///
/// Returns an error for an empty payload, an unknown kind, a malformed
/// envelope, a binary frame shorter than [`MIN_BIN_FRAME`], or a binary
/// header version other than [`BIN_VERSION`].
pub fn decode_frame(payload: &[u8]) -> Result<Frame<'_>> {
    let Some(&kind_byte) = payload.first() else {
        return Err(Error::ProtocolError("empty payload".to_string()));
    };
    let kind = FrameKind::from_byte(kind_byte)
        .ok_or_else(|| Error::ProtocolError(format!("unknown frame kind 0x{kind_byte:02x}")))?;

    if kind == FrameKind::Ctrl {
        let envelope: Envelope = serde_json::from_slice(&payload[1..])
            .map_err(|e| Error::Serialization(e.to_string()))?;
        return Ok(Frame::Ctrl(envelope));
    }

    if payload.len() < MIN_BIN_FRAME {
        return Err(Error::ProtocolError(format!(
            "binary frame too short: {} bytes",
            payload.len()
        )));
    }
    let mut raw = [0u8; BIN_HEADER_SIZE];
    raw.copy_from_slice(&payload[1..MIN_BIN_FRAME]);
    let header = BinHeader::decode(&raw);
    if header.version != BIN_VERSION {
        return Err(Error::ProtocolError(format!(
            "unsupported binary header version {}",
            header.version
        )));
    }

    match kind {
        FrameKind::Data => Ok(Frame::Data {
            header,
            body: &payload[MIN_BIN_FRAME..],
        }),
        _ => Ok(Frame::Ack(header)),
    }
}
