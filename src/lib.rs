//! # wsengine
//! Sans-io implementation of the WebSocket wire protocol (RFC 6455) and the permessage-deflate
//! extension (RFC 7692).
//!
//! The crate never touches a socket. Raw bytes read from the transport are fed into a
//! [`Connection`], which hands back [`Event`]s, and outbound messages are turned into byte
//! buffers that the caller writes verbatim to the transport. The HTTP upgrade that precedes
//! the protocol is left to the caller; only the `Sec-WebSocket-Extensions` value exchanged
//! during it is handled here, see [`extensions`].
//!
//! # Layers
//!
//! ```text
//!   bytes ──► FrameParser ──► MessageAssembler ──► Event
//!                (codec)        (assembler)
//!
//!   Message ──► FrameWriter ──► bytes
//!                (writer)
//! ```
//!
//! - [`codec::FrameParser`]: incremental frame decoder, resumable at any byte boundary.
//! - [`assembler::MessageAssembler`]: reassembles fragments, inflates and validates messages.
//! - [`writer::FrameWriter`]: serializes, compresses and masks outbound frames and tracks
//!   backpressure.
//! - [`Connection`]: glues the three together and runs the close handshake.
//! - [`WebSocket`]: drives a [`Connection`] over any tokio `AsyncRead + AsyncWrite` stream.
//!
//! # Features
//!
//! - `zlib` (default): uses the zlib-rs backend of `flate2`, which allows window sizes below 15 bits
//!   (`server_max_window_bits` / `client_max_window_bits`).
//! - `logging`: enables debug logging of negotiation and connection teardown through the
//!   `log` crate.
//!
//! # Example
//! ```rust
//! use wsengine::{CompressionConfig, Connection, Event, Message, Options, Role};
//!
//! let config = CompressionConfig::disabled();
//! let mut client = Connection::new(Role::Client, Options::default(), config.clone());
//! let mut server = Connection::new(Role::Server, Options::default(), config);
//!
//! client.send(Message::text("hello")).unwrap();
//! for chunk in client.take_output() {
//!     for event in server.feed(&chunk) {
//!         if let Event::Message(Message::Text(text)) = event {
//!             assert_eq!(text, "hello");
//!         }
//!     }
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod assembler;
pub mod close;
pub mod codec;
pub mod compression;
mod connection;
pub mod extensions;
pub mod frame;
mod mask;
mod message;
mod native;
mod options;
pub mod writer;

use thiserror::Error;

pub use close::CloseCode;
pub use connection::{Connection, State};
pub use extensions::{generate, negotiate, CompressionConfig};
pub use frame::{Frame, OpCode};
pub use mask::apply_mask;
pub use message::{Event, Message};
pub use native::WebSocket;
pub use options::{CompressionLevel, DeflateOptions, Options};

/// The maximum allowed message size for reading, set to 1 MiB.
///
/// Messages larger than this limit, compressed or not, are rejected with
/// [`WebSocketError::MessageTooBig`] and the connection is closed with [`CloseCode::Size`].
pub const MAX_PAYLOAD_READ: usize = 1024 * 1024;

/// Amount of unflushed output, in bytes, after which the writer asks the caller to drain.
pub const HIGH_WATER_MARK: usize = 16 * 1024;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// The role the connection is taking.
///
/// When a server role is taken the frames will not be masked, unlike
/// the client role, in which frames are masked.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

impl Role {
    /// Whether frames written by this role carry a masking key.
    #[inline]
    pub fn masks_outbound(self) -> bool {
        self == Role::Client
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}

/// Represents errors that can occur while running the WebSocket protocol.
///
/// The errors fall in four groups:
///
/// - Protocol errors: violations by the peer of RFC 6455 or RFC 7692. Each one carries the
///   close code that must be sent back, see [`WebSocketError::close_code`].
/// - Extension errors: a permessage-deflate negotiation the client cannot accept.
/// - Write errors: attempts to write on a closing or closed connection.
/// - I/O and codec errors coming from the transport or the DEFLATE implementation.
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// Occurs when receiving a data frame while a fragmented message is still in progress.
    /// RFC 6455 requires every frame after the first fragment to use the continuation opcode.
    #[error("Invalid fragment: opcode in non-fin frame must be zero")]
    InvalidFragment,

    /// Occurs when receiving a continuation frame without a preceding initial frame.
    #[error("Invalid continuation frame: continuation for non-started message")]
    InvalidContinuationFrame,

    /// Indicates that a text message or a close reason contains invalid UTF-8 data.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// Indicates that a received close frame has a payload of exactly 1 byte.
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that must not appear on the wire.
    #[error("Invalid close code {0}")]
    InvalidCloseCode(u16),

    /// RSV2 or RSV3 was set. No extension in use defines them.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// RSV1 was set on a connection where permessage-deflate was not negotiated.
    #[error("Received compressed frame on stream that doesn't support compression")]
    CompressionNotSupported,

    /// RSV1 was set on a control frame or on a continuation frame.
    #[error("RSV1 must be clear on control and continuation frames")]
    InvalidCompressionFlag,

    /// The MASK bit does not match the sender's role: clients must mask, servers must not.
    #[error("MASK must be {}", .0.then_some("set").unwrap_or("clear"))]
    InvalidMaskBit(bool),

    /// A control frame (ping, pong, or close) was received with the FIN bit not set.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("Control frame too large ({0} bytes)")]
    ControlFrameTooLarge(usize),

    /// The opcode is one of the reserved values 0x3-0x7 or 0xB-0xF.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// The most significant bit of a 64-bit payload length was set.
    #[error("Invalid payload length")]
    InvalidPayloadLength,

    /// A message, or a single frame of it, is larger than the configured maximum.
    #[error("Message too big: {size} bytes exceeds the maximum of {max}")]
    MessageTooBig { size: usize, max: usize },

    /// Negotiation of permessage-deflate failed on the client side.
    #[error("Extension negotiation failed: {0}")]
    Extension(String),

    /// A window size outside of the range DEFLATE supports (9 to 15 bits).
    #[error("Invalid window bits {0}, expected 9..=15")]
    InvalidWindowBits(u8),

    /// A write was attempted after a close frame has been sent.
    #[error("Connection is closing")]
    ConnectionClosing,

    /// Returned when attempting to perform operations on a closed connection.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The DEFLATE codec failed, usually because the peer sent a corrupt stream.
    #[error("Compression error: {0}")]
    Compression(std::io::Error),

    /// Wraps standard I/O errors that may occur while driving a transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// Returns the close code that must be sent to the peer for this error.
    ///
    /// Only errors caused by the peer carry a code. Local write errors, negotiation errors and
    /// transport errors return `None`.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::InvalidFragment
            | Self::InvalidContinuationFrame
            | Self::InvalidCloseFrame
            | Self::InvalidCloseCode(_)
            | Self::ReservedBitsNotZero
            | Self::CompressionNotSupported
            | Self::InvalidCompressionFlag
            | Self::InvalidMaskBit(_)
            | Self::ControlFrameFragmented
            | Self::ControlFrameTooLarge(_)
            | Self::InvalidOpCode(_)
            | Self::InvalidPayloadLength => Some(CloseCode::Protocol),
            Self::InvalidUTF8 => Some(CloseCode::Invalid),
            Self::MessageTooBig { .. } => Some(CloseCode::Size),
            Self::Compression(_) => Some(CloseCode::Invalid),
            Self::Extension(_)
            | Self::InvalidWindowBits(_)
            | Self::ConnectionClosing
            | Self::ConnectionClosed
            | Self::IoError(_) => None,
        }
    }

    /// Whether the error is an inbound protocol violation that tears the connection down.
    pub fn is_protocol_error(&self) -> bool {
        self.close_code().is_some()
    }

    /// Whether the error was raised by a write on a closing or closed connection.
    pub fn is_write_error(&self) -> bool {
        matches!(self, Self::ConnectionClosing | Self::ConnectionClosed)
    }
}
