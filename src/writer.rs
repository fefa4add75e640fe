//! Serialization of outbound frames.
//!
//! [`FrameWriter`] turns payloads into wire bytes: it compresses data messages when
//! permessage-deflate is in use, masks frames written by a client and queues the result as a
//! list of buffers. The caller moves the buffers to the transport with
//! [`FrameWriter::take_output`], in order and unchanged.
use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};
use rand::{rngs::StdRng, RngCore, SeedableRng};

use crate::{
    apply_mask, close,
    close::CloseCode,
    compression::{CodecProvider, Compressor},
    extensions::{MAX_WINDOW_BITS, MIN_WINDOW_BITS},
    frame::{fmt_head, MAX_CONTROL_PAYLOAD, MAX_HEAD_SIZE},
    CompressionConfig, CompressionLevel, OpCode, Options, Result, Role, WebSocketError,
};

/// Longest close reason that fits in a control frame next to the status code.
pub const MAX_CLOSE_REASON: usize = MAX_CONTROL_PAYLOAD - 2;

/// Negotiated parameters of the local compressor.
#[derive(Debug, Clone, Copy)]
struct DeflateParams {
    level: CompressionLevel,
    window_bits: u8,
    no_context_takeover: bool,
}

/// Serializes frames for one endpoint.
///
/// # Backpressure
/// Every serialized frame is appended to an output queue. Once more than the high water mark
/// is queued, [`FrameWriter::needs_drain`] returns `true` and the caller should write the
/// queue out before sending more. Writes are never refused because of it.
///
/// # Closing
/// After a close frame was written only further close frames are accepted, anything else
/// fails with [`WebSocketError::ConnectionClosing`]. Once the writer is finished every write
/// fails with [`WebSocketError::ConnectionClosed`].
pub struct FrameWriter {
    role: Role,
    deflate_params: Option<DeflateParams>,
    codec: Arc<dyn CodecProvider>,
    /// Created on the first compressed message.
    deflate: Option<Compressor>,
    /// Compressor of the message being written with a window override.
    message_deflate: Option<Compressor>,
    /// Source of masking keys.
    rng: Box<dyn RngCore + Send>,
    /// Compression flag of the fragmented message being written, if any.
    fragment: Option<bool>,
    output: VecDeque<Bytes>,
    buffered: usize,
    high_water_mark: usize,
    split_threshold: usize,
    closing: bool,
    closed: bool,
}

impl FrameWriter {
    /// Creates the writer of an endpoint playing `role`.
    ///
    /// `config` is taken as is, only the compression level comes from `options`.
    pub fn new(role: Role, options: &Options, config: &CompressionConfig) -> Self {
        let level = options
            .compression
            .as_ref()
            .map(|compression| compression.level)
            .unwrap_or_default();

        let deflate_params = config.enabled.then(|| {
            let (window_bits, no_context_takeover) = config.deflate_params(role);
            DeflateParams {
                level,
                window_bits,
                no_context_takeover,
            }
        });

        Self {
            role,
            deflate_params,
            codec: Arc::clone(&options.codec),
            deflate: None,
            message_deflate: None,
            rng: Box::new(StdRng::from_entropy()),
            fragment: None,
            output: VecDeque::new(),
            buffered: 0,
            high_water_mark: options.high_water_mark,
            split_threshold: options.split_threshold,
            closing: false,
            closed: false,
        }
    }

    /// Replaces the source of masking keys.
    pub fn set_rng(&mut self, rng: impl RngCore + Send + 'static) {
        self.rng = Box::new(rng);
    }

    /// Writes `payload` as a single frame.
    ///
    /// `compress` overrides compression for this message: `Some(0)` sends it uncompressed and
    /// `None` follows the negotiation. Any other value up to 15 compresses it, if
    /// permessage-deflate was negotiated, with a compressor of its own. That compressor uses a
    /// window of that many bits, bounded by the negotiated window and by 9, and starts without
    /// a dictionary. Control frames are never compressed.
    ///
    /// # Errors
    /// - [`WebSocketError::ControlFrameTooLarge`] for control payloads above 125 bytes.
    /// - [`WebSocketError::InvalidWindowBits`] for an override above 15.
    /// - [`WebSocketError::ConnectionClosing`] and [`WebSocketError::ConnectionClosed`] once
    ///   the connection is closing.
    pub fn send(
        &mut self,
        payload: impl Into<Bytes>,
        opcode: OpCode,
        compress: Option<u8>,
    ) -> Result<()> {
        self.send_frame(payload, opcode, true, compress)
    }

    /// Writes one frame of a message.
    ///
    /// A fragmented message starts with a `Text` or `Binary` frame with `fin` unset and goes on
    /// with `Continuation` frames, the last one with `fin` set. Control frames may be written in
    /// between. The compression decision of the first frame applies to the whole message.
    pub fn send_frame(
        &mut self,
        payload: impl Into<Bytes>,
        opcode: OpCode,
        fin: bool,
        compress: Option<u8>,
    ) -> Result<()> {
        self.check_writable(opcode)?;
        if let Some(bits) = compress.filter(|bits| *bits > MAX_WINDOW_BITS) {
            return Err(WebSocketError::InvalidWindowBits(bits));
        }

        let payload = payload.into();
        if opcode.is_control() {
            if !fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if payload.len() > MAX_CONTROL_PAYLOAD {
                return Err(WebSocketError::ControlFrameTooLarge(payload.len()));
            }
        }

        let compressed = match opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                match (self.deflate_params, compress) {
                    (None, _) | (_, Some(0)) => false,
                    (Some(params), Some(bits)) => {
                        self.message_deflate = Some(self.message_compressor(params, bits));
                        true
                    }
                    (Some(_), None) => true,
                }
            }
            OpCode::Continuation => self
                .fragment
                .ok_or(WebSocketError::InvalidContinuationFrame)?,
            OpCode::Close | OpCode::Ping | OpCode::Pong => false,
        };

        let payload = if compressed {
            match self.compress(&payload, fin) {
                Ok(payload) => payload,
                Err(err) => {
                    // the message cannot be continued
                    self.fragment = None;
                    self.message_deflate = None;
                    return Err(err);
                }
            }
        } else {
            payload
        };

        if opcode.is_data() {
            self.fragment = (!fin).then_some(compressed);
            if fin {
                self.message_deflate = None;
            }
        }

        let rsv1 = compressed && opcode != OpCode::Continuation;
        self.write_frame(fin, rsv1, opcode, payload);

        if opcode == OpCode::Close {
            self.closing = true;
        }

        Ok(())
    }

    /// Writes `payload` as a message split in frames of at most `fragment_size` bytes.
    ///
    /// With compression enabled the size applies to the input of each frame, not to its
    /// compressed output. An empty payload is sent as a single frame.
    ///
    /// When a frame fails, the frames of the message queued before it are dropped and the
    /// writer is ready for the next message.
    pub fn send_fragmented(
        &mut self,
        payload: impl Into<Bytes>,
        opcode: OpCode,
        fragment_size: usize,
        compress: Option<u8>,
    ) -> Result<()> {
        if !matches!(opcode, OpCode::Text | OpCode::Binary) {
            return Err(WebSocketError::InvalidFragment);
        }

        let queued = self.output.len();
        let buffered = self.buffered;

        let result = self.write_fragments(payload.into(), opcode, fragment_size, compress);
        if result.is_err() {
            if self.output.len() > queued {
                // the compressor saw data the peer never will
                self.deflate = None;
            }
            self.output.truncate(queued);
            self.buffered = buffered;
            self.fragment = None;
            self.message_deflate = None;
        }

        result
    }

    fn write_fragments(
        &mut self,
        mut payload: Bytes,
        opcode: OpCode,
        fragment_size: usize,
        compress: Option<u8>,
    ) -> Result<()> {
        let fragment_size = fragment_size.max(1);
        let mut opcode = opcode;

        loop {
            let chunk = payload.split_to(fragment_size.min(payload.len()));
            let fin = payload.is_empty();
            self.send_frame(chunk, opcode, fin, compress)?;
            if fin {
                return Ok(());
            }
            opcode = OpCode::Continuation;
        }
    }

    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(payload, OpCode::Ping, None)
    }

    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.send(payload, OpCode::Pong, None)
    }

    /// Writes a close frame with `code` and `reason`.
    ///
    /// # Errors
    /// - [`WebSocketError::InvalidCloseCode`] for codes that must not appear on the wire.
    /// - [`WebSocketError::ControlFrameTooLarge`] for reasons longer than 123 bytes.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode(code.into()));
        }
        if reason.len() > MAX_CLOSE_REASON {
            return Err(WebSocketError::ControlFrameTooLarge(reason.len() + 2));
        }

        self.send(close::encode_payload(code, reason), OpCode::Close, None)
    }

    /// Whether a close frame was written.
    pub fn is_closing(&self) -> bool {
        self.closing
    }

    /// Rejects every further write. Queued output is kept for the caller to flush.
    pub fn finish(&mut self) {
        self.closed = true;
        self.fragment = None;
    }

    /// Rejects every further write and drops the queued output.
    pub fn abort(&mut self) {
        self.finish();
        self.output.clear();
        self.buffered = 0;
    }

    /// Number of bytes queued and not taken yet.
    pub fn buffered_amount(&self) -> usize {
        self.buffered
    }

    /// Whether the queued output went past the high water mark.
    pub fn needs_drain(&self) -> bool {
        self.buffered > self.high_water_mark
    }

    /// Takes every queued buffer, in the order they must be written.
    pub fn take_output(&mut self) -> Vec<Bytes> {
        self.buffered = 0;
        self.output.drain(..).collect()
    }

    fn check_writable(&self, opcode: OpCode) -> Result<()> {
        if self.closed {
            Err(WebSocketError::ConnectionClosed)
        } else if self.closing && opcode != OpCode::Close {
            Err(WebSocketError::ConnectionClosing)
        } else {
            Ok(())
        }
    }

    /// Builds the compressor of a message sent with a window override.
    ///
    /// The connection compressor is dropped too, its dictionary no longer matches what the
    /// peer inflated once this message went through.
    fn message_compressor(&mut self, params: DeflateParams, bits: u8) -> Compressor {
        self.deflate = None;
        let window_bits = bits.clamp(MIN_WINDOW_BITS, params.window_bits.max(MIN_WINDOW_BITS));
        Compressor::new(self.codec.deflater(params.level, window_bits), true)
    }

    fn compress(&mut self, payload: &[u8], fin: bool) -> Result<Bytes> {
        if let Some(deflate) = self.message_deflate.as_mut() {
            return deflate
                .compress(payload, fin)
                .map_err(WebSocketError::Compression);
        }

        let Some(params) = self.deflate_params else {
            return Err(WebSocketError::CompressionNotSupported);
        };

        let codec = &self.codec;
        let deflate = self.deflate.get_or_insert_with(|| {
            #[cfg(feature = "logging")]
            log::debug!(
                "creating compressor: window_bits={} no_context_takeover={}",
                params.window_bits,
                params.no_context_takeover
            );
            Compressor::new(
                codec.deflater(params.level, params.window_bits),
                params.no_context_takeover,
            )
        });

        deflate
            .compress(payload, fin)
            .map_err(WebSocketError::Compression)
    }

    fn write_frame(&mut self, fin: bool, rsv1: bool, opcode: OpCode, payload: Bytes) {
        let mut head = [0u8; MAX_HEAD_SIZE];

        if self.role.masks_outbound() {
            let mut key = [0u8; 4];
            self.rng.fill_bytes(&mut key);

            let size = fmt_head(&mut head, fin, rsv1, opcode, payload.len(), Some(key));
            let mut buf = BytesMut::with_capacity(size + payload.len());
            buf.extend_from_slice(&head[..size]);
            buf.extend_from_slice(&payload);
            apply_mask(&mut buf[size..], key);

            self.push(buf.freeze());
        } else {
            let size = fmt_head(&mut head, fin, rsv1, opcode, payload.len(), None);
            if payload.len() > self.split_threshold {
                self.push(Bytes::copy_from_slice(&head[..size]));
                self.push(payload);
            } else {
                let mut buf = BytesMut::with_capacity(size + payload.len());
                buf.extend_from_slice(&head[..size]);
                buf.extend_from_slice(&payload);
                self.push(buf.freeze());
            }
        }
    }

    fn push(&mut self, buf: Bytes) {
        self.buffered += buf.len();
        self.output.push_back(buf);
    }
}
