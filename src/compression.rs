//! DEFLATE compression for permessage-deflate (RFC 7692).
//!
//! The raw DEFLATE codec sits behind [`DeflateCodec`] and [`InflateCodec`], created by a
//! [`CodecProvider`]. [`Flate2`] is the default provider. [`Compressor`] and [`Decompressor`]
//! add the message framing of RFC 7692 on top of any codec: every message ends with a flush
//! whose `00 00 FF FF` trailer is stripped on the wire and appended again before inflating.
use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use flate2::{CompressError, DecompressError, Status};

use crate::{CompressionLevel, Result, WebSocketError};

/// Trailer of an empty stored block, produced by every sync flush.
pub const TRAILER: [u8; 4] = [0x00, 0x00, 0xFF, 0xFF];

/// How a [`DeflateCodec`] terminates the output of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Byte-align the output and keep the dictionary.
    Sync,
    /// Byte-align the output and forget all previous input.
    Full,
}

/// Outcome of [`InflateCodec::decompress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inflated {
    /// All the input was consumed.
    Done,
    /// The output grew past the limit. `unconsumed` bytes of input were left untouched.
    LimitExceeded { unconsumed: usize },
}

/// A raw DEFLATE encoder.
pub trait DeflateCodec: Send {
    /// Feeds `input` into the encoder, appending any output produced so far.
    fn compress(&mut self, input: &[u8], output: &mut BytesMut) -> io::Result<()>;

    /// Flushes all pending output so it ends on a byte boundary.
    fn flush(&mut self, mode: Flush, output: &mut BytesMut) -> io::Result<()>;

    /// Drops the dictionary and any pending state.
    fn reset(&mut self);
}

/// A raw DEFLATE decoder.
pub trait InflateCodec: Send {
    /// Inflates `input` into `output`, stopping early once `output` holds more than `limit`
    /// bytes.
    fn decompress(&mut self, input: &[u8], output: &mut BytesMut, limit: usize)
        -> io::Result<Inflated>;

    /// Drops the window and any pending state.
    fn reset(&mut self);
}

/// Creates the codecs of a connection.
///
/// Implementations may hand out codecs backed by another DEFLATE library. Both ends of a
/// connection only have to agree on the wire format.
pub trait CodecProvider: Send + Sync {
    /// Encoder compressing with `level` and a window of `window_bits`.
    fn deflater(&self, level: CompressionLevel, window_bits: u8) -> Box<dyn DeflateCodec>;

    /// Decoder for a stream compressed with any window size.
    fn inflater(&self) -> Box<dyn InflateCodec>;
}

/// [`CodecProvider`] backed by `flate2`.
///
/// Windows below 15 bits need the `zlib` feature, which is on by default. Without it flate2
/// falls back to miniz, which always compresses with the full window.
#[derive(Debug, Default, Clone, Copy)]
pub struct Flate2;

impl CodecProvider for Flate2 {
    fn deflater(&self, level: CompressionLevel, window_bits: u8) -> Box<dyn DeflateCodec> {
        Box::new(Deflate::new(level, window_bits))
    }

    fn inflater(&self) -> Box<dyn InflateCodec> {
        Box::new(Inflate::new())
    }
}

struct Deflate {
    compress: flate2::Compress,
}

impl Deflate {
    fn new(level: CompressionLevel, window_bits: u8) -> Self {
        #[cfg(feature = "zlib")]
        let compress = flate2::Compress::new_with_window_bits(level, false, window_bits);
        #[cfg(not(feature = "zlib"))]
        let compress = {
            let _ = window_bits;
            flate2::Compress::new(level, false)
        };

        Self { compress }
    }
}

impl DeflateCodec for Deflate {
    fn compress(&mut self, mut input: &[u8], output: &mut BytesMut) -> io::Result<()> {
        while !input.is_empty() {
            let dst = chunk(output);

            let before_out = self.compress.total_out();
            let before_in = self.compress.total_in();

            let status = self
                .compress
                .compress(input, dst, flate2::FlushCompress::None)
                .map_err(deflate_error)?;

            let written = (self.compress.total_out() - before_out) as usize;
            let consumed = (self.compress.total_in() - before_in) as usize;

            unsafe { output.advance_mut(written) };
            input = &input[consumed..];

            if status == Status::StreamEnd || (written == 0 && consumed == 0) {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "deflate stream stalled",
                ));
            }
        }

        Ok(())
    }

    fn flush(&mut self, mode: Flush, output: &mut BytesMut) -> io::Result<()> {
        let flush = match mode {
            Flush::Sync => flate2::FlushCompress::Sync,
            Flush::Full => flate2::FlushCompress::Full,
        };

        // the flush is complete once the encoder leaves room in the output
        loop {
            let dst = chunk(output);
            let available = dst.len();

            let before_out = self.compress.total_out();
            self.compress
                .compress(&[], dst, flush)
                .map_err(deflate_error)?;

            let written = (self.compress.total_out() - before_out) as usize;
            unsafe { output.advance_mut(written) };

            if written < available {
                return Ok(());
            }
        }
    }

    fn reset(&mut self) {
        self.compress.reset();
    }
}

struct Inflate {
    decompress: flate2::Decompress,
}

impl Inflate {
    fn new() -> Self {
        Self {
            decompress: flate2::Decompress::new(false),
        }
    }
}

impl InflateCodec for Inflate {
    fn decompress(
        &mut self,
        mut input: &[u8],
        output: &mut BytesMut,
        limit: usize,
    ) -> io::Result<Inflated> {
        loop {
            if output.len() > limit {
                return Ok(Inflated::LimitExceeded {
                    unconsumed: input.len(),
                });
            }

            let dst = chunk(output);
            let available = dst.len();

            let before_out = self.decompress.total_out();
            let before_in = self.decompress.total_in();

            let status = self
                .decompress
                .decompress(input, dst, flate2::FlushDecompress::None)
                .map_err(inflate_error)?;

            let written = (self.decompress.total_out() - before_out) as usize;
            let consumed = (self.decompress.total_in() - before_in) as usize;

            unsafe { output.advance_mut(written) };
            input = &input[consumed..];

            let drained = input.is_empty() && written < available;
            if status == Status::StreamEnd || drained || (written == 0 && consumed == 0) {
                break;
            }
        }

        if output.len() > limit {
            Ok(Inflated::LimitExceeded {
                unconsumed: input.len(),
            })
        } else {
            Ok(Inflated::Done)
        }
    }

    fn reset(&mut self) {
        self.decompress.reset(false);
    }
}

fn deflate_error(err: CompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("Compression error: {err}"),
    )
}

fn inflate_error(err: DecompressError) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("Decompression error: {err}"),
    )
}

/// Returns the spare capacity of `output` as a writable slice, growing it when full.
///
/// # Safety
/// The slice aliases uninitialized memory. Callers only advance `output` over the bytes the
/// codec reports as written.
fn chunk(output: &mut BytesMut) -> &mut [u8] {
    if output.len() == output.capacity() {
        // chunk_mut would only reserve 64 bytes
        output.reserve(1024);
    }

    let uninitbuf = output.spare_capacity_mut();
    unsafe { &mut *(uninitbuf as *mut [std::mem::MaybeUninit<u8>] as *mut [u8]) }
}

/// Compresses outgoing messages of one connection.
///
/// With context takeover the dictionary carries over from one message to the next and every
/// message ends with a sync flush. Without it every message ends with a full flush and the
/// encoder is reset.
pub struct Compressor {
    deflate: Box<dyn DeflateCodec>,
    no_context_takeover: bool,
    output: BytesMut,
}

impl Compressor {
    pub fn new(deflate: Box<dyn DeflateCodec>, no_context_takeover: bool) -> Self {
        Self {
            deflate,
            no_context_takeover,
            output: BytesMut::with_capacity(1024),
        }
    }

    /// Compresses one frame worth of data.
    ///
    /// `fin` marks the last frame of the message, whose trailer is stripped. Intermediate
    /// fragments keep it, it is part of the DEFLATE stream.
    pub fn compress(&mut self, input: &[u8], fin: bool) -> io::Result<Bytes> {
        let mode = if self.no_context_takeover {
            Flush::Full
        } else {
            Flush::Sync
        };

        let result = self
            .deflate
            .compress(input, &mut self.output)
            .and_then(|_| self.deflate.flush(mode, &mut self.output));
        if let Err(err) = result {
            self.output.clear();
            self.deflate.reset();
            return Err(err);
        }

        if fin {
            if self.output.ends_with(&TRAILER) {
                self.output.truncate(self.output.len() - TRAILER.len());
            }
            if self.no_context_takeover {
                self.deflate.reset();
            }
        }

        Ok(self.output.split().freeze())
    }
}

/// Inflates incoming messages of one connection.
pub struct Decompressor {
    inflate: Box<dyn InflateCodec>,
    no_context_takeover: bool,
    output: BytesMut,
}

impl Decompressor {
    pub fn new(inflate: Box<dyn InflateCodec>, no_context_takeover: bool) -> Self {
        Self {
            inflate,
            no_context_takeover,
            output: BytesMut::with_capacity(1024),
        }
    }

    /// Inflates the concatenated payload of a complete message.
    ///
    /// # Errors
    /// - [`WebSocketError::MessageTooBig`] once the output exceeds `max_size`. Inflation stops
    ///   right there.
    /// - [`WebSocketError::Compression`] when the payload is not a valid DEFLATE stream.
    pub fn decompress(&mut self, input: &[u8], max_size: usize) -> Result<Bytes> {
        let result = self.inflate_message(input, max_size);
        if result.is_err() || self.no_context_takeover {
            self.inflate.reset();
        }

        let output = self.output.split().freeze();
        result.map(|_| output)
    }

    fn inflate_message(&mut self, input: &[u8], max_size: usize) -> Result<()> {
        let too_big = |size| WebSocketError::MessageTooBig {
            size,
            max: max_size,
        };

        let status = self
            .inflate
            .decompress(input, &mut self.output, max_size)
            .map_err(WebSocketError::Compression)?;
        if let Inflated::LimitExceeded { unconsumed } = status {
            return Err(too_big(self.output.len() + unconsumed));
        }

        let status = self
            .inflate
            .decompress(&TRAILER, &mut self.output, max_size)
            .map_err(WebSocketError::Compression)?;
        if let Inflated::LimitExceeded { .. } = status {
            return Err(too_big(self.output.len()));
        }

        Ok(())
    }
}
