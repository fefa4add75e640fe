//! # Frame
//!
//! WebSocket frames as defined in [RFC 6455 Section 5.2](https://datatracker.ietf.org/doc/html/rfc6455#section-5.2).
//! A frame is the atomic unit on the wire; one or more frames make a message.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |         (16 or 64 bits)       |
//! |N|V|V|V|       |S|             |                               |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |        Extended payload length continued, if payload len == 127|
//! +---------------------------------------------------------------+
//! |                               |   Masking-key, if MASK set to 1|
//! +-------------------------------+-------------------------------+
//! |     Masking-key (continued)       |          Payload Data      |
//! +-----------------------------------+ - - - - - - - - - - - - - -+
//! :                     Payload Data continued ...                :
//! +---------------------------------------------------------------+
//! ```
//!
//! Frames come in two categories:
//!
//! - **Data Frames**: `Text`, `Binary` and `Continuation`.
//! - **Control Frames**: `Close`, `Ping` and `Pong`. They are never fragmented and carry at
//!   most 125 bytes of payload.
//!
//! RSV1 marks the first frame of a message compressed with permessage-deflate (RFC 7692).
use bytes::Bytes;

use crate::WebSocketError;

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Largest possible header: 2 bytes, 8 bytes of extended length and a 4 byte mask.
pub(crate) const MAX_HEAD_SIZE: usize = 14;

/// WebSocket operation code (OpCode) that determines the semantic meaning and handling of a frame.
///
/// The numeric values for each OpCode are defined in [RFC 6455, Section 11.8](https://datatracker.ietf.org/doc/html/rfc6455#section-11.8):
/// - Continuation = 0x0
/// - Text = 0x1
/// - Binary = 0x2
/// - Close = 0x8
/// - Ping = 0x9
/// - Pong = 0xA
///
/// The ranges 0x3-0x7 and 0xB-0xF are reserved and rejected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    /// Returns `true` if the `OpCode` represents a control frame (`Close`, `Ping`, or `Pong`).
    pub fn is_control(&self) -> bool {
        matches!(*self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }

    /// Returns `true` for the opcodes whose payload may be compressed.
    pub fn is_data(&self) -> bool {
        !self.is_control()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = WebSocketError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::Continuation),
            0x1 => Ok(Self::Text),
            0x2 => Ok(Self::Binary),
            0x8 => Ok(Self::Close),
            0x9 => Ok(Self::Ping),
            0xA => Ok(Self::Pong),
            _ => Err(WebSocketError::InvalidOpCode(value)),
        }
    }
}

impl From<OpCode> for u8 {
    fn from(val: OpCode) -> Self {
        match val {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }
}

/// A decoded WebSocket frame.
///
/// Frames produced by [`FrameParser`](crate::codec::FrameParser) are already unmasked and
/// validated against the header rules of RFC 6455. They are consumed right away by the
/// [`MessageAssembler`](crate::assembler::MessageAssembler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Indicates if this is the final frame in a message.
    pub fin: bool,
    /// RSV1 as received. Only the first frame of a compressed message sets it.
    pub rsv1: bool,
    /// The opcode of the frame, defining its type.
    pub opcode: OpCode,
    /// Unmasked payload.
    pub payload: Bytes,
    /// Whether the message this frame belongs to is compressed.
    ///
    /// Set for data frames, continuation frames inherit the value of the first fragment.
    /// `None` for control frames.
    pub compressed: Option<bool>,
}

impl Frame {
    /// Creates a new uncompressed frame.
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            opcode,
            payload: payload.into(),
            compressed: opcode.is_data().then_some(false),
        }
    }

    /// Whether the payload of this frame has to go through the decompressor.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed.unwrap_or(false)
    }
}

/// Formats a frame header into `head` and returns its size.
///
/// The payload length picks the smallest encoding: 7 bits below 126, 16 bits below 65536,
/// 64 bits otherwise. When `mask` is given the MASK bit is set and the key follows the length.
///
/// # Panics
/// Panics if `head` is shorter than [`MAX_HEAD_SIZE`].
pub(crate) fn fmt_head(
    head: &mut [u8],
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    len: usize,
    mask: Option<[u8; 4]>,
) -> usize {
    head[0] = (fin as u8) << 7 | (rsv1 as u8) << 6 | u8::from(opcode);

    let size = if len < 126 {
        head[1] = len as u8;
        2
    } else if len < 65536 {
        head[1] = 126;
        head[2..4].copy_from_slice(&(len as u16).to_be_bytes());
        4
    } else {
        head[1] = 127;
        head[2..10].copy_from_slice(&(len as u64).to_be_bytes());
        10
    };

    if let Some(mask) = mask {
        head[1] |= 0x80;
        head[size..size + 4].copy_from_slice(&mask);
        size + 4
    } else {
        size
    }
}
