use std::sync::Arc;

use crate::{
    compression::{CodecProvider, Flate2},
    HIGH_WATER_MARK, MAX_PAYLOAD_READ,
};

/// Compression level used by the DEFLATE encoder (0-9).
pub type CompressionLevel = flate2::Compression;

/// Payloads above this size are written as separate header and payload buffers.
pub const SPLIT_THRESHOLD: usize = 16 * 1024;

/// Configuration options for a connection.
///
/// `Options` governs the engine once the protocol is open: size limits, the local
/// compression preferences, backpressure and control frame handling.
#[derive(Clone)]
pub struct Options {
    /// Maximum size of an incoming message, in bytes, after reassembly and decompression.
    ///
    /// Default: 1 MiB as defined in [`MAX_PAYLOAD_READ`].
    pub max_message_size: usize,

    /// Local compression preferences.
    ///
    /// Used to build the extension offer of a client ([`DeflateOptions::offer`]) and merged
    /// into the configuration a server accepts ([`CompressionConfig::merge`]). A
    /// [`Connection`](crate::Connection) compresses with this level and applies the local
    /// window and context takeover limits to its own compressor. `None` disables compression.
    ///
    /// Default: `None`
    ///
    /// [`CompressionConfig::merge`]: crate::CompressionConfig::merge
    pub compression: Option<DeflateOptions>,

    /// Unflushed output, in bytes, after which the writer signals that the caller must drain.
    ///
    /// Default: 16 KiB as defined in [`HIGH_WATER_MARK`].
    pub high_water_mark: usize,

    /// Unmasked payloads larger than this are emitted as a separate buffer from their header
    /// instead of being copied next to it.
    pub split_threshold: usize,

    /// Answer pings with a pong carrying the same payload.
    ///
    /// Default: `true`
    pub auto_pong: bool,

    /// Source of the DEFLATE codecs used once compression is negotiated.
    ///
    /// Default: [`Flate2`]
    pub codec: Arc<dyn CodecProvider>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            max_message_size: MAX_PAYLOAD_READ,
            compression: None,
            high_water_mark: HIGH_WATER_MARK,
            split_threshold: SPLIT_THRESHOLD,
            auto_pong: true,
            codec: Arc::new(Flate2),
        }
    }
}

/// Configuration options for WebSocket message compression using the Deflate algorithm.
///
/// # Context Management
/// - **Context Takeover** (default): compression state is kept between messages, giving
///   better ratios at the cost of memory.
/// - **No Context Takeover**: compression state is reset after each message.
///
/// # Memory Window Size
/// Window sizes below 15 bits need the `zlib` feature, enabled by default.
///
/// # Example
/// ```
/// use wsengine::{DeflateOptions, CompressionLevel};
///
/// let opts = DeflateOptions {
///     level: CompressionLevel::default(),
///     server_no_context_takeover: true,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct DeflateOptions {
    /// Sets the compression level (0-9), balancing compression ratio against CPU usage.
    pub level: CompressionLevel,

    /// Window size (in bits) the server compresses with. Valid range: 9-15 bits.
    pub server_max_window_bits: u8,

    /// Window size (in bits) the client compresses with. Valid range: 9-15 bits.
    pub client_max_window_bits: u8,

    /// Reset the server compressor after each message.
    pub server_no_context_takeover: bool,

    /// Reset the client compressor after each message.
    pub client_no_context_takeover: bool,
}

impl Default for DeflateOptions {
    fn default() -> Self {
        Self {
            level: CompressionLevel::default(),
            server_max_window_bits: 15,
            client_max_window_bits: 15,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
        }
    }
}

impl DeflateOptions {
    /// Builds the `Sec-WebSocket-Extensions` value a client offers.
    pub fn offer(&self) -> crate::Result<String> {
        let mut offer = crate::generate(
            self.server_max_window_bits,
            false,
            self.server_no_context_takeover,
        )?;
        if self.client_no_context_takeover {
            offer.push_str("; client_no_context_takeover");
        }
        Ok(offer)
    }
}

impl Options {
    /// Sets the compression level for outgoing messages, enabling compression.
    ///
    /// # Example
    /// ```rust
    /// use wsengine::{Options, CompressionLevel};
    ///
    /// let options = Options::default()
    ///     .with_compression_level(CompressionLevel::new(6))
    ///     .with_max_message_size(64 * 1024);
    /// ```
    pub fn with_compression_level(self, level: CompressionLevel) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.level = level;

        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Enables compression with the given preferences.
    pub fn with_compression(self, compression: DeflateOptions) -> Self {
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables compression for the connection.
    pub fn without_compression(self) -> Self {
        Self {
            compression: None,
            ..self
        }
    }

    /// Sets the maximum allowed size of an incoming message.
    pub fn with_max_message_size(self, size: usize) -> Self {
        Self {
            max_message_size: size,
            ..self
        }
    }

    /// Sets the amount of unflushed output after which the writer asks for a drain.
    pub fn with_high_water_mark(self, size: usize) -> Self {
        Self {
            high_water_mark: size,
            ..self
        }
    }

    /// Sets the payload size above which header and payload are emitted as separate buffers.
    pub fn with_split_threshold(self, size: usize) -> Self {
        Self {
            split_threshold: size,
            ..self
        }
    }

    /// Stops the connection from answering pings on its own.
    pub fn without_auto_pong(self) -> Self {
        Self {
            auto_pong: false,
            ..self
        }
    }

    /// Replaces the DEFLATE implementation.
    pub fn with_codec(self, codec: impl CodecProvider + 'static) -> Self {
        Self {
            codec: Arc::new(codec),
            ..self
        }
    }

    /// Sets the window size the server compresses with.
    pub fn with_server_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_max_window_bits = max_window_bits;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Sets the window size the client compresses with.
    pub fn with_client_max_window_bits(self, max_window_bits: u8) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_max_window_bits = max_window_bits;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for server-side compression.
    pub fn server_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.server_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }

    /// Disables context takeover for client-side compression.
    pub fn client_no_context_takeover(self) -> Self {
        let mut compression = self.compression.unwrap_or_default();
        compression.client_no_context_takeover = true;
        Self {
            compression: Some(compression),
            ..self
        }
    }
}
