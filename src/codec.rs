//! Incremental frame decoding.
//!
//! [`FrameParser`] accepts input in chunks of any size, down to a single byte, and keeps
//! whatever it has not consumed yet in its [`ParserState`]. A frame is produced as soon as its
//! last payload byte arrives, so feeding a byte stream in one piece or split at arbitrary
//! boundaries yields the same frames.
use bytes::{Buf, BytesMut};

use crate::{
    apply_mask,
    frame::{Frame, MAX_CONTROL_PAYLOAD},
    OpCode, Result, Role, WebSocketError,
};

/// Upper bound of the capacity reserved ahead of a payload that has not arrived yet.
const MAX_RESERVE: usize = 64 * 1024;

/// The part of a frame the parser is waiting for.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// The first two bytes of the header.
    #[default]
    ReadHeader,
    /// The 16 or 64-bit extended payload length.
    ReadLength,
    /// The 4-byte masking key.
    ReadMask,
    /// The payload itself.
    ReadPayload,
}

/// Header fields decoded from the first two bytes.
#[derive(Debug, Clone, Copy)]
struct Header {
    fin: bool,
    rsv1: bool,
    opcode: OpCode,
    masked: bool,
    length_code: u8,
}

impl Default for Header {
    fn default() -> Self {
        Self {
            fin: false,
            rsv1: false,
            opcode: OpCode::Continuation,
            masked: false,
            length_code: 0,
        }
    }
}

/// Everything the parser remembers between two calls.
#[derive(Debug, Default)]
pub struct ParserState {
    step: ReadState,
    header: Header,
    payload_len: usize,
    mask: Option<[u8; 4]>,
    /// Input received but not consumed yet.
    buffer: BytesMut,
    /// Compression flag of the fragmented message in progress, if any.
    fragment: Option<bool>,
    /// Payload bytes received so far for the fragmented message in progress.
    fragment_len: usize,
    /// Set once a protocol error was returned.
    failed: bool,
}

impl ParserState {
    /// The part of the frame the parser is waiting for.
    pub fn step(&self) -> ReadState {
        self.step
    }

    /// Number of buffered bytes not yet returned as part of a frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Whether a fragmented message started and has not seen its final frame.
    pub fn in_fragment(&self) -> bool {
        self.fragment.is_some()
    }
}

/// A decoder for WebSocket frames.
///
/// The parser validates everything that can be checked from a single frame:
///
/// - RSV2 and RSV3 must be clear. RSV1 is only allowed on the first frame of a data message,
///   and only when permessage-deflate was negotiated.
/// - Reserved opcodes are rejected.
/// - Control frames must have FIN set and carry at most 125 bytes.
/// - Frames from a client must be masked and frames from a server must not be.
/// - The most significant bit of a 64-bit length must be zero.
/// - Data frames that would take a message past the limit are rejected before their payload
///   is buffered. Compressed frames get some slack since the limit applies once inflated.
///
/// Fragment ordering is left to the [`MessageAssembler`](crate::assembler::MessageAssembler).
///
/// Once an error was returned the parser is unusable and every further call fails with
/// [`WebSocketError::ConnectionClosed`].
#[derive(Debug)]
pub struct FrameParser {
    /// Role of the local endpoint. Frames are expected from the opposite role.
    role: Role,
    /// Whether permessage-deflate was negotiated.
    compression: bool,
    /// Maximum size of a message payload.
    max_payload: usize,
    state: ParserState,
}

impl FrameParser {
    /// Creates a parser for frames received by an endpoint playing `role`.
    pub fn new(role: Role, compression: bool, max_payload: usize) -> Self {
        Self {
            role,
            compression,
            max_payload,
            state: ParserState::default(),
        }
    }

    pub fn state(&self) -> &ParserState {
        &self.state
    }

    /// Buffers `chunk`. Frames are then pulled with [`FrameParser::next_frame`].
    pub fn push(&mut self, chunk: &[u8]) {
        if !self.state.failed {
            self.state.buffer.extend_from_slice(chunk);
        }
    }

    /// Buffers `chunk` and returns every frame it completes.
    ///
    /// Frames decoded before an error are lost with it. Use [`FrameParser::push`] and
    /// [`FrameParser::next_frame`] to handle them one at a time.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>> {
        self.push(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }

        Ok(frames)
    }

    /// Decodes the next complete frame from the buffered input.
    ///
    /// Returns `Ok(None)` when more input is needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.state.failed {
            return Err(WebSocketError::ConnectionClosed);
        }

        let result = self.advance();
        if result.is_err() {
            self.state.failed = true;
            self.state.buffer = BytesMut::new();
        }

        result
    }

    fn advance(&mut self) -> Result<Option<Frame>> {
        let Self {
            role,
            compression,
            max_payload,
            state,
        } = self;

        loop {
            match state.step {
                ReadState::ReadHeader => {
                    if state.buffer.len() < 2 {
                        return Ok(None);
                    }

                    let header = parse_header(state.buffer[0], state.buffer[1])?;
                    validate_header(&header, *role, *compression)?;
                    state.buffer.advance(2);
                    state.header = header;

                    match header.length_code {
                        126 | 127 => state.step = ReadState::ReadLength,
                        len => {
                            state.payload_len = usize::from(len);
                            check_payload_len(state, *max_payload)?;
                            state.step = next_after_length(&header);
                        }
                    }
                }
                ReadState::ReadLength => {
                    let extra = if state.header.length_code == 126 { 2 } else { 8 };
                    if state.buffer.len() < extra {
                        return Ok(None);
                    }

                    state.payload_len = if extra == 2 {
                        usize::from(state.buffer.get_u16())
                    } else {
                        let len = state.buffer.get_u64();
                        if len >> 63 != 0 {
                            return Err(WebSocketError::InvalidPayloadLength);
                        }
                        usize::try_from(len).map_err(|_| WebSocketError::MessageTooBig {
                            size: usize::MAX,
                            max: *max_payload,
                        })?
                    };

                    check_payload_len(state, *max_payload)?;
                    state.step = next_after_length(&state.header);
                }
                ReadState::ReadMask => {
                    if state.buffer.len() < 4 {
                        return Ok(None);
                    }

                    state.mask = Some(state.buffer.get_u32().to_be_bytes());
                    state.step = ReadState::ReadPayload;
                }
                ReadState::ReadPayload => {
                    if state.buffer.len() < state.payload_len {
                        let missing = state.payload_len - state.buffer.len();
                        state.buffer.reserve(missing.min(MAX_RESERVE));
                        return Ok(None);
                    }

                    let mut payload = state.buffer.split_to(state.payload_len);
                    if let Some(mask) = state.mask.take() {
                        apply_mask(&mut payload, mask);
                    }

                    let header = state.header;
                    let compressed = match header.opcode {
                        OpCode::Text | OpCode::Binary => {
                            if !header.fin {
                                state.fragment = Some(header.rsv1);
                                state.fragment_len = payload.len();
                            }
                            Some(header.rsv1)
                        }
                        OpCode::Continuation => {
                            let compressed = state.fragment.unwrap_or(false);
                            if header.fin {
                                state.fragment = None;
                                state.fragment_len = 0;
                            } else {
                                state.fragment_len += payload.len();
                            }
                            Some(compressed)
                        }
                        OpCode::Close | OpCode::Ping | OpCode::Pong => None,
                    };

                    state.step = ReadState::ReadHeader;
                    state.payload_len = 0;

                    return Ok(Some(Frame {
                        fin: header.fin,
                        rsv1: header.rsv1,
                        opcode: header.opcode,
                        payload: payload.freeze(),
                        compressed,
                    }));
                }
            }
        }
    }
}

fn parse_header(b0: u8, b1: u8) -> Result<Header> {
    // RSV2 and RSV3
    if b0 & 0b0011_0000 != 0 {
        return Err(WebSocketError::ReservedBitsNotZero);
    }

    Ok(Header {
        fin: b0 & 0b1000_0000 != 0,
        rsv1: b0 & 0b0100_0000 != 0,
        opcode: OpCode::try_from(b0 & 0b0000_1111)?,
        masked: b1 & 0b1000_0000 != 0,
        length_code: b1 & 0x7F,
    })
}

fn validate_header(header: &Header, role: Role, compression: bool) -> Result<()> {
    if header.rsv1 {
        if !compression {
            return Err(WebSocketError::CompressionNotSupported);
        }
        if header.opcode.is_control() || header.opcode == OpCode::Continuation {
            return Err(WebSocketError::InvalidCompressionFlag);
        }
    }

    if header.opcode.is_control() {
        if !header.fin {
            return Err(WebSocketError::ControlFrameFragmented);
        }
        if usize::from(header.length_code) > MAX_CONTROL_PAYLOAD {
            return Err(WebSocketError::ControlFrameTooLarge(usize::from(
                header.length_code,
            )));
        }
    }

    // a server receives from clients, which must mask
    let expect_masked = role == Role::Server;
    if header.masked != expect_masked {
        return Err(WebSocketError::InvalidMaskBit(expect_masked));
    }

    Ok(())
}

/// Rejects frames that cannot fit in a message, counting the fragments already received.
///
/// Deflate output of incompressible data is slightly larger than its input, so compressed
/// frames may exceed the limit by [`compressed_slack`]. Their exact size is checked after
/// inflating.
fn check_payload_len(state: &ParserState, max_payload: usize) -> Result<()> {
    let (compressed, received) = match state.header.opcode {
        OpCode::Continuation => (state.fragment.unwrap_or(false), state.fragment_len),
        opcode => (opcode.is_data() && state.header.rsv1, 0),
    };

    let size = received.saturating_add(state.payload_len);
    let limit = if compressed {
        max_payload.saturating_add(compressed_slack(max_payload))
    } else {
        max_payload
    };

    if size > limit {
        return Err(WebSocketError::MessageTooBig {
            size,
            max: max_payload,
        });
    }

    Ok(())
}

fn compressed_slack(max_payload: usize) -> usize {
    max_payload / 16 + 1024
}

fn next_after_length(header: &Header) -> ReadState {
    if header.masked {
        ReadState::ReadMask
    } else {
        ReadState::ReadPayload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Encodes a frame by hand, masking it when a key is given.
    fn raw_frame(b0: u8, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
        let mut out = vec![b0];
        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match payload.len() {
            len if len < 126 => out.push(mask_bit | len as u8),
            len if len < 65536 => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        let mut payload = payload.to_vec();
        if let Some(mask) = mask {
            out.extend_from_slice(&mask);
            apply_mask(&mut payload, mask);
        }
        out.extend_from_slice(&payload);
        out
    }

    fn client_parser() -> FrameParser {
        FrameParser::new(Role::Client, false, 1024)
    }

    #[test]
    fn test_single_frame() {
        let mut parser = client_parser();
        let frames = parser.feed(&raw_frame(0x81, b"Hello", None)).unwrap();

        assert_eq!(frames, vec![Frame::new(true, OpCode::Text, "Hello")]);
        assert_eq!(parser.state().step(), ReadState::ReadHeader);
        assert_eq!(parser.state().buffered(), 0);
    }

    #[test]
    fn test_masked_frame() {
        // RFC 6455 section 5.7
        let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let mut parser = FrameParser::new(Role::Server, false, 1024);
        let frames = parser.feed(&bytes).unwrap();

        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], b"Hello");
    }

    #[test]
    fn test_byte_by_byte() {
        let mask = [0x01, 0x02, 0x03, 0x04];
        let payload = vec![0x5A; 300];
        let bytes = raw_frame(0x82, &payload, Some(mask));

        let mut parser = FrameParser::new(Role::Server, false, 1024);
        let mut frames = Vec::new();
        let mut steps = Vec::new();
        for byte in &bytes {
            frames.extend(parser.feed(std::slice::from_ref(byte)).unwrap());
            steps.push(parser.state().step());
        }

        assert!(steps.contains(&ReadState::ReadLength));
        assert!(steps.contains(&ReadState::ReadMask));
        assert!(steps.contains(&ReadState::ReadPayload));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0].payload[..], &payload[..]);
    }

    #[test]
    fn test_several_frames_in_one_chunk() {
        let mut bytes = raw_frame(0x01, b"Hel", None);
        bytes.extend(raw_frame(0x89, b"ping", None));
        bytes.extend(raw_frame(0x80, b"lo", None));
        bytes.extend(raw_frame(0x82, &[], None)[..1].iter());

        let mut parser = client_parser();
        let frames = parser.feed(&bytes).unwrap();

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].opcode, OpCode::Text);
        assert!(!frames[0].fin);
        assert_eq!(frames[1].opcode, OpCode::Ping);
        assert_eq!(frames[1].compressed, None);
        assert_eq!(frames[2].opcode, OpCode::Continuation);
        assert!(!parser.state().in_fragment());
        assert_eq!(parser.state().buffered(), 1);
    }

    #[test]
    fn test_compressed_fragments_inherit_flag() {
        let mut bytes = raw_frame(0x41, b"abc", None);
        bytes.extend(raw_frame(0x00, b"def", None));
        bytes.extend(raw_frame(0x80, b"ghi", None));

        let mut parser = FrameParser::new(Role::Client, true, 1024);
        let frames = parser.feed(&bytes).unwrap();

        assert!(frames.iter().all(Frame::is_compressed));
        assert!(frames[0].rsv1);
        assert!(!frames[1].rsv1);
    }

    #[test]
    fn test_reserved_bits() {
        for b0 in [0xA1, 0x91] {
            let err = client_parser().feed(&raw_frame(b0, b"", None)).unwrap_err();
            assert!(matches!(err, WebSocketError::ReservedBitsNotZero));
        }
    }

    #[test]
    fn test_rsv1_without_compression() {
        let err = client_parser().feed(&raw_frame(0xC1, b"x", None)).unwrap_err();
        assert!(matches!(err, WebSocketError::CompressionNotSupported));
        assert_eq!(err.close_code(), Some(crate::CloseCode::Protocol));
    }

    #[test]
    fn test_rsv1_on_control_and_continuation() {
        for b0 in [0xC9, 0xC0] {
            let mut parser = FrameParser::new(Role::Client, true, 1024);
            let err = parser.feed(&raw_frame(b0, b"", None)).unwrap_err();
            assert!(matches!(err, WebSocketError::InvalidCompressionFlag));
        }
    }

    #[test]
    fn test_reserved_opcodes() {
        for opcode in [0x3, 0x7, 0xB, 0xF] {
            let err = client_parser()
                .feed(&raw_frame(0x80 | opcode, b"", None))
                .unwrap_err();
            assert!(matches!(err, WebSocketError::InvalidOpCode(op) if op == opcode));
        }
    }

    #[test]
    fn test_control_frames() {
        let err = client_parser().feed(&raw_frame(0x09, b"", None)).unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameFragmented));

        let err = client_parser()
            .feed(&raw_frame(0x89, &[0; 126], None))
            .unwrap_err();
        assert!(matches!(err, WebSocketError::ControlFrameTooLarge(126)));

        let frames = client_parser().feed(&raw_frame(0x8A, &[7; 125], None)).unwrap();
        assert_eq!(frames[0].payload.len(), 125);
    }

    #[test]
    fn test_mask_must_match_role() {
        let err = FrameParser::new(Role::Server, false, 1024)
            .feed(&raw_frame(0x81, b"hi", None))
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidMaskBit(true)));

        let err = client_parser()
            .feed(&raw_frame(0x81, b"hi", Some([1, 2, 3, 4])))
            .unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidMaskBit(false)));
    }

    #[test]
    fn test_64bit_length_msb() {
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        let err = client_parser().feed(&bytes).unwrap_err();
        assert!(matches!(err, WebSocketError::InvalidPayloadLength));
    }

    #[test]
    fn test_frame_too_big() {
        let mut parser = FrameParser::new(Role::Client, false, 4);
        // exactly the limit is fine
        assert_eq!(parser.feed(&raw_frame(0x82, b"1234", None)).unwrap().len(), 1);

        // rejected from the header alone, without waiting for the payload
        let err = parser.feed(&raw_frame(0x82, b"12345", None)[..2]).unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { size: 5, max: 4 }));

        // compressed frames may be a little larger than the limit
        let mut parser = FrameParser::new(Role::Client, true, 4);
        assert_eq!(parser.feed(&raw_frame(0xC2, b"12345", None)).unwrap().len(), 1);
    }

    #[test]
    fn test_huge_compressed_length() {
        let mut parser = FrameParser::new(Role::Client, true, 1024);
        let err = parser
            .feed(&[0xC2, 127, 0x40, 0, 0, 0, 0, 0, 0, 0])
            .unwrap_err();
        assert!(matches!(
            err,
            WebSocketError::MessageTooBig { size, max: 1024 } if size == 1 << 62
        ));
    }

    #[test]
    fn test_fragments_count_towards_limit() {
        let mut parser = FrameParser::new(Role::Client, false, 8);
        assert_eq!(parser.feed(&raw_frame(0x02, b"12345", None)).unwrap().len(), 1);
        assert_eq!(parser.state().buffered(), 0);

        // the declared length alone already overflows the message
        let err = parser.feed(&raw_frame(0x80, b"6789", None)[..2]).unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { size: 9, max: 8 }));

        let mut parser = FrameParser::new(Role::Client, true, 1024);
        let first = vec![0u8; 1024];
        assert_eq!(parser.feed(&raw_frame(0x42, &first, None)).unwrap().len(), 1);
        let mut head = vec![0x80, 127];
        head.extend_from_slice(&4096u64.to_be_bytes());
        let err = parser.feed(&head).unwrap_err();
        assert!(matches!(err, WebSocketError::MessageTooBig { size: 5120, max: 1024 }));
    }

    #[test]
    fn test_declared_length_is_not_reserved_upfront() {
        let mut parser = FrameParser::new(Role::Client, false, usize::MAX);
        let mut head = vec![0x82, 127];
        head.extend_from_slice(&(1u64 << 40).to_be_bytes());
        assert!(parser.feed(&head).unwrap().is_empty());
        assert_eq!(parser.state().step(), ReadState::ReadPayload);
        assert!(parser.state().buffer.capacity() <= 2 * MAX_RESERVE);
    }

    #[test]
    fn test_failed_parser_stays_failed() {
        let mut parser = client_parser();
        assert!(parser.feed(&[0xF1, 0x00]).is_err());
        assert!(matches!(
            parser.feed(&raw_frame(0x81, b"ok", None)),
            Err(WebSocketError::ConnectionClosed)
        ));
    }
}
