//! Close status codes (RFC 6455 section 7.4) and close frame payloads.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Result, WebSocketError};

use self::CloseCode::*;

/// Status codes representing the reasons why an endpoint is closing the WebSocket connection.
#[derive(Debug, Eq, PartialEq, Clone, Copy)]
pub enum CloseCode {
    /// Normal closure, the purpose for which the connection was established has been fulfilled.
    Normal,
    /// The endpoint is "going away", such as a server shutting down.
    Away,
    /// The endpoint is terminating the connection due to a protocol error.
    Protocol,
    /// The endpoint received a type of data it cannot accept.
    Unsupported,
    /// No status code was included in a closing frame. Never sent on the wire.
    Status,
    /// The transport dropped without a close frame. Never sent on the wire, used as the
    /// synthetic code reported to the application.
    Abnormal,
    /// A message was inconsistent with its type, for instance non-UTF-8 data in a text message.
    Invalid,
    /// Generic policy violation.
    Policy,
    /// The message is too large for the endpoint to process.
    Size,
    /// The client expected an extension the server did not negotiate.
    Extension,
    /// The server hit an unexpected condition.
    Error,
    /// The server is restarting.
    Restart,
    /// The server is overloaded, try again later.
    Again,
    /// A gateway or proxy received an invalid response from the upstream server.
    BadGateway,
    #[doc(hidden)]
    /// TLS handshake failure. Never sent on the wire.
    Tls,
    #[doc(hidden)]
    /// Codes reserved by RFC 6455 for future use.
    Reserved(u16),
    #[doc(hidden)]
    /// Codes registered with IANA (3000-3999).
    Iana(u16),
    #[doc(hidden)]
    /// Codes for private use by applications (4000-4999).
    Library(u16),
    #[doc(hidden)]
    /// Codes outside of any valid range.
    Bad(u16),
}

impl CloseCode {
    /// Whether this code may appear in a close frame on the wire.
    ///
    /// Below 3000 only 1000-1003 and 1007-1014 are allowed; 3000-4999 are open to
    /// registered and private use.
    pub fn is_allowed(self) -> bool {
        !matches!(self, Bad(_) | Reserved(_) | Status | Abnormal | Tls)
    }
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> CloseCode {
        match code {
            1000 => Normal,
            1001 => Away,
            1002 => Protocol,
            1003 => Unsupported,
            1005 => Status,
            1006 => Abnormal,
            1007 => Invalid,
            1008 => Policy,
            1009 => Size,
            1010 => Extension,
            1011 => Error,
            1012 => Restart,
            1013 => Again,
            1014 => BadGateway,
            1015 => Tls,
            1004 | 1016..=2999 => Reserved(code),
            3000..=3999 => Iana(code),
            4000..=4999 => Library(code),
            _ => Bad(code),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            Normal => 1000,
            Away => 1001,
            Protocol => 1002,
            Unsupported => 1003,
            Status => 1005,
            Abnormal => 1006,
            Invalid => 1007,
            Policy => 1008,
            Size => 1009,
            Extension => 1010,
            Error => 1011,
            Restart => 1012,
            Again => 1013,
            BadGateway => 1014,
            Tls => 1015,
            Reserved(code) => code,
            Iana(code) => code,
            Library(code) => code,
            Bad(code) => code,
        }
    }
}

impl std::fmt::Display for CloseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Decodes the payload of a received close frame.
///
/// An empty payload means a normal closure without reason. Otherwise the payload starts with a
/// big-endian status code that must be allowed on the wire, followed by a UTF-8 reason.
pub(crate) fn parse_payload(payload: &[u8]) -> Result<(CloseCode, String)> {
    match payload.len() {
        0 => Ok((Normal, String::new())),
        1 => Err(WebSocketError::InvalidCloseFrame),
        _ => {
            let raw = u16::from_be_bytes([payload[0], payload[1]]);
            let code = CloseCode::from(raw);
            if !code.is_allowed() {
                return Err(WebSocketError::InvalidCloseCode(raw));
            }

            let reason = std::str::from_utf8(&payload[2..])
                .map_err(|_| WebSocketError::InvalidUTF8)?
                .to_owned();

            Ok((code, reason))
        }
    }
}

/// Encodes a close payload: the status code in network order followed by the reason.
pub(crate) fn encode_payload(code: CloseCode, reason: &str) -> Bytes {
    let mut payload = BytesMut::with_capacity(2 + reason.len());
    payload.put_u16(code.into());
    payload.extend_from_slice(reason.as_bytes());
    payload.freeze()
}
