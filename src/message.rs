use bytes::Bytes;

use crate::{close::CloseCode, OpCode, WebSocketError};

/// A complete WebSocket message.
///
/// Text messages are validated UTF-8. Control messages carry at most 125 bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// A close frame. An empty payload is reported as [`CloseCode::Normal`] without reason.
    Close { code: CloseCode, reason: String },
}

impl Message {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::Ping(data.into())
    }

    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::Pong(data.into())
    }

    pub fn close(code: CloseCode, reason: impl Into<String>) -> Self {
        Self::Close {
            code,
            reason: reason.into(),
        }
    }

    /// The opcode of the first frame carrying this message.
    pub fn opcode(&self) -> OpCode {
        match self {
            Self::Text(_) => OpCode::Text,
            Self::Binary(_) => OpCode::Binary,
            Self::Ping(_) => OpCode::Ping,
            Self::Pong(_) => OpCode::Pong,
            Self::Close { .. } => OpCode::Close,
        }
    }

    /// Length of the application data, without the status code of a close message.
    pub fn len(&self) -> usize {
        match self {
            Self::Text(text) => text.len(),
            Self::Binary(data) | Self::Ping(data) | Self::Pong(data) => data.len(),
            Self::Close { reason, .. } => reason.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// What a [`Connection`](crate::Connection) reports after consuming input.
#[derive(Debug)]
pub enum Event {
    /// A complete message. Received pings and close frames are reported too.
    Message(Message),
    /// The close handshake started: a close frame was sent and no further message may be
    /// written.
    Closing,
    /// The connection is closed. No more events follow.
    ///
    /// `code` is the code received from the peer, the code sent after a protocol error, or
    /// [`CloseCode::Abnormal`] when the transport went away first.
    Closed { code: CloseCode, reason: String },
    /// The peer violated the protocol. Always followed by [`Event::Closed`].
    Error(WebSocketError),
}
