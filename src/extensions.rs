//! Negotiation of the permessage-deflate extension (RFC 7692).
//!
//! The `Sec-WebSocket-Extensions` header exchanged during the HTTP upgrade lists extensions
//! separated by commas, each followed by `;`-separated parameters:
//!
//! ```text
//! permessage-deflate; client_max_window_bits; server_max_window_bits=12, permessage-deflate
//! ```
//!
//! A server picks the first permessage-deflate offer it can honor and declines compression
//! otherwise; it never fails the handshake over extension parameters. A client has dictated the
//! offer, so a response it cannot honor is an error.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{digit1, space0},
    combinator::{all_consuming, opt},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult, Parser,
};

use crate::{DeflateOptions, Result, Role, WebSocketError};

static PERMESSAGE_DEFLATE: &str = "permessage-deflate";

/// Largest LZ77 window, and the default when no window parameter is negotiated.
pub const MAX_WINDOW_BITS: u8 = 15;

/// Smallest window raw DEFLATE supports. zlib silently turns 8 into 9.
pub const MIN_WINDOW_BITS: u8 = 9;

/// The negotiated permessage-deflate parameters of a connection.
///
/// Built once from the upgrade exchange and immutable afterwards. `Display` renders the value
/// a server sends back in its `Sec-WebSocket-Extensions` response header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompressionConfig {
    /// Whether permessage-deflate is in use at all.
    pub enabled: bool,
    /// Window the server compresses with (`server_max_window_bits`).
    pub window_bits: u8,
    /// Window the client compresses with (`client_max_window_bits`).
    pub client_window_bits: u8,
    /// The server resets its compressor after every message.
    pub server_no_context_takeover: bool,
    /// The client resets its compressor after every message.
    pub client_no_context_takeover: bool,
    /// The client offered `client_max_window_bits`, so the server may answer with a value.
    client_window_offered: bool,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl CompressionConfig {
    /// Configuration of a connection that did not negotiate compression.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            window_bits: MAX_WINDOW_BITS,
            client_window_bits: MAX_WINDOW_BITS,
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            client_window_offered: false,
        }
    }

    /// Compression enabled with the largest windows and context takeover on both sides.
    pub fn enabled() -> Self {
        Self {
            enabled: true,
            ..Self::disabled()
        }
    }

    /// Compression level as exchanged by [`negotiate`]: 0 when disabled, otherwise the
    /// server window size in bits.
    pub fn compression_level(&self) -> u8 {
        if self.enabled {
            self.window_bits
        } else {
            0
        }
    }

    /// Window bits and context takeover flag of the compressor owned by `role`.
    pub(crate) fn deflate_params(&self, role: Role) -> (u8, bool) {
        match role {
            Role::Server => (self.window_bits, self.server_no_context_takeover),
            Role::Client => (self.client_window_bits, self.client_no_context_takeover),
        }
    }

    /// Whether the decompressor owned by `role` must reset after every message.
    pub(crate) fn inflate_no_context_takeover(&self, role: Role) -> bool {
        match role {
            Role::Server => self.client_no_context_takeover,
            Role::Client => self.server_no_context_takeover,
        }
    }

    /// Negotiates permessage-deflate from an extension header value.
    ///
    /// For [`Role::Server`] `header` is the client's offer and the result is the first offer
    /// that can be accepted, or a disabled configuration. For [`Role::Client`] `header` is the
    /// server's response; parameters the client cannot honor produce
    /// [`WebSocketError::Extension`].
    pub fn negotiate(header: &str, role: Role) -> Result<Self> {
        let config = match role {
            Role::Server => Self::accept_offer(header),
            Role::Client => Self::accept_response(header)?,
        };

        #[cfg(feature = "logging")]
        log::debug!(
            "negotiated permessage-deflate for {role}: enabled={} server_max_window_bits={} \
            client_max_window_bits={} server_no_context_takeover={} client_no_context_takeover={}",
            config.enabled,
            config.window_bits,
            config.client_window_bits,
            config.server_no_context_takeover,
            config.client_no_context_takeover,
        );

        Ok(config)
    }

    fn accept_offer(header: &str) -> Self {
        for element in header.split(',') {
            let Ok((name, params)) = parse_element(element) else {
                continue;
            };
            if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
                continue;
            }

            match Self::from_params(&params, Role::Server) {
                Ok(config) => return config,
                Err(_reason) => {
                    #[cfg(feature = "logging")]
                    log::debug!("declining permessage-deflate offer {element:?}: {_reason}");
                }
            }
        }

        Self::disabled()
    }

    fn accept_response(header: &str) -> Result<Self> {
        let mut accepted = None;

        for element in header.split(',') {
            let mentions_deflate = element
                .trim_start()
                .get(..PERMESSAGE_DEFLATE.len())
                .is_some_and(|name| name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE));
            if !mentions_deflate {
                continue;
            }

            let (name, params) = parse_element(element).map_err(|err| {
                WebSocketError::Extension(format!("malformed extension {element:?}: {err}"))
            })?;
            if !name.eq_ignore_ascii_case(PERMESSAGE_DEFLATE) {
                continue;
            }
            if accepted.is_some() {
                return Err(WebSocketError::Extension(
                    "permessage-deflate accepted more than once".to_owned(),
                ));
            }

            accepted =
                Some(Self::from_params(&params, Role::Client).map_err(WebSocketError::Extension)?);
        }

        Ok(accepted.unwrap_or_else(Self::disabled))
    }

    /// Validates the parameters of one permessage-deflate element.
    ///
    /// `role` is the side doing the validation: a server reads an offer, a client reads a
    /// response.
    fn from_params(
        params: &[(&str, Option<&str>)],
        role: Role,
    ) -> std::result::Result<Self, String> {
        let mut config = Self::enabled();
        let mut seen: Vec<&str> = Vec::with_capacity(params.len());

        for &(key, value) in params {
            if seen.contains(&key) {
                return Err(format!("duplicate parameter {key}"));
            }
            seen.push(key);

            match key {
                "server_no_context_takeover" | "client_no_context_takeover" => {
                    if value.is_some() {
                        return Err(format!("{key} does not take a value"));
                    }
                    if key == "server_no_context_takeover" {
                        config.server_no_context_takeover = true;
                    } else {
                        config.client_no_context_takeover = true;
                    }
                }
                "server_max_window_bits" => {
                    let value = value.ok_or("server_max_window_bits requires a value")?;
                    config.window_bits = parse_window_bits(value)?;
                }
                "client_max_window_bits" => {
                    config.client_window_offered = true;
                    match (value, role) {
                        (Some(value), _) => config.client_window_bits = parse_window_bits(value)?,
                        (None, Role::Server) => {}
                        (None, Role::Client) => {
                            return Err("client_max_window_bits requires a value".to_owned())
                        }
                    }
                }
                other => return Err(format!("unsupported parameter {other}")),
            }
        }

        // the miniz backend only compresses with the full window
        #[cfg(not(feature = "zlib"))]
        {
            let (local_bits, _) = config.deflate_params(role);
            if local_bits != MAX_WINDOW_BITS {
                return Err(format!(
                    "window size of {local_bits} bits requires the zlib feature"
                ));
            }
        }

        Ok(config)
    }

    /// Applies the local preferences of a server to an accepted offer.
    ///
    /// Context takeover is disabled if either side asks for it and window sizes take the
    /// smaller of both values. The client window is only lowered when the client offered
    /// `client_max_window_bits`.
    pub fn merge(self, local: &DeflateOptions) -> Self {
        if !self.enabled {
            return self;
        }

        #[cfg(feature = "zlib")]
        let (window_bits, client_window_bits) = (
            self.window_bits.min(local.server_max_window_bits),
            if self.client_window_offered {
                self.client_window_bits.min(local.client_max_window_bits)
            } else {
                self.client_window_bits
            },
        );
        #[cfg(not(feature = "zlib"))]
        let (window_bits, client_window_bits) = (self.window_bits, self.client_window_bits);

        Self {
            window_bits: window_bits.max(MIN_WINDOW_BITS),
            client_window_bits: client_window_bits.max(MIN_WINDOW_BITS),
            server_no_context_takeover: self.server_no_context_takeover
                || local.server_no_context_takeover,
            client_no_context_takeover: self.client_no_context_takeover
                || local.client_no_context_takeover,
            ..self
        }
    }
}

impl CompressionConfig {
    /// Applies `local` to the compressor an endpoint playing `role` owns, once negotiation is
    /// over.
    ///
    /// The window shrinks to the local maximum and context takeover is dropped when the local
    /// side asks for it. Both only change what this endpoint sends, so the peer's decoder is
    /// unaffected. Parameters of the peer's compressor are left as agreed.
    pub(crate) fn restrict_deflate(self, role: Role, local: &DeflateOptions) -> Self {
        if !self.enabled {
            return self;
        }

        match role {
            Role::Server => Self {
                #[cfg(feature = "zlib")]
                window_bits: self
                    .window_bits
                    .min(local.server_max_window_bits)
                    .max(MIN_WINDOW_BITS),
                server_no_context_takeover: self.server_no_context_takeover
                    || local.server_no_context_takeover,
                ..self
            },
            Role::Client => Self {
                #[cfg(feature = "zlib")]
                client_window_bits: self
                    .client_window_bits
                    .min(local.client_max_window_bits)
                    .max(MIN_WINDOW_BITS),
                client_no_context_takeover: self.client_no_context_takeover
                    || local.client_no_context_takeover,
                ..self
            },
        }
    }
}

impl std::fmt::Display for CompressionConfig {
    /// Formats the accepted parameters as a server response. A disabled configuration
    /// renders as an empty string.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if !self.enabled {
            return Ok(());
        }

        write!(f, "{PERMESSAGE_DEFLATE}")?;
        if self.server_no_context_takeover {
            write!(f, "; server_no_context_takeover")?;
        }
        if self.client_no_context_takeover {
            write!(f, "; client_no_context_takeover")?;
        }
        if self.window_bits < MAX_WINDOW_BITS {
            write!(f, "; server_max_window_bits={}", self.window_bits)?;
        }
        if self.client_window_offered && self.client_window_bits < MAX_WINDOW_BITS {
            write!(f, "; client_max_window_bits={}", self.client_window_bits)?;
        }

        Ok(())
    }
}

/// Negotiates permessage-deflate and returns `(compression_level, no_context_takeover)`.
///
/// `compression_level` is 0 when compression is disabled, otherwise the negotiated server
/// window in bits (15 when the header carries no window parameter). `no_context_takeover`
/// reports `server_no_context_takeover`.
///
/// A server silently degrades to level 0 on parameters it cannot accept, a client fails
/// with [`WebSocketError::Extension`].
///
/// # Example
/// ```
/// use wsengine::negotiate;
///
/// assert_eq!(negotiate("permessage-deflate", true).unwrap(), (15, false));
/// assert_eq!(negotiate("x-webkit-deflate-frame", true).unwrap(), (0, false));
/// assert_eq!(negotiate("permessage-deflate; server_max_window_bits=8", true).unwrap(), (0, false));
/// assert!(negotiate("permessage-deflate; server_max_window_bits=8", false).is_err());
/// ```
pub fn negotiate(header: &str, is_server: bool) -> Result<(u8, bool)> {
    let role = if is_server { Role::Server } else { Role::Client };
    let config = CompressionConfig::negotiate(header, role)?;
    Ok((config.compression_level(), config.server_no_context_takeover))
}

/// Builds the extension header value for the given server window size.
///
/// A server produces its response, a client produces an offer which also announces support
/// for `client_max_window_bits`.
///
/// # Errors
/// [`WebSocketError::InvalidWindowBits`] when `compression_level` is outside `9..=15`.
///
/// # Example
/// ```
/// use wsengine::generate;
///
/// assert_eq!(
///     generate(12, false, true).unwrap(),
///     "permessage-deflate; client_max_window_bits; server_max_window_bits=12; server_no_context_takeover"
/// );
/// assert!(generate(8, true, false).is_err());
/// ```
pub fn generate(
    compression_level: u8,
    is_server: bool,
    server_no_context_takeover: bool,
) -> Result<String> {
    if !(MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&compression_level) {
        return Err(WebSocketError::InvalidWindowBits(compression_level));
    }

    let mut header = String::from(PERMESSAGE_DEFLATE);
    if !is_server {
        header.push_str("; client_max_window_bits");
    }
    header.push_str(&format!("; server_max_window_bits={compression_level}"));
    if server_no_context_takeover {
        header.push_str("; server_no_context_takeover");
    }

    Ok(header)
}

fn parse_window_bits(value: &str) -> std::result::Result<u8, String> {
    value
        .parse::<u8>()
        .ok()
        .filter(|bits| (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(bits))
        .ok_or_else(|| format!("unsupported window size {value}"))
}

type Params<'a> = Vec<(&'a str, Option<&'a str>)>;

/// Parses one comma-separated element: an extension name followed by its parameters.
fn parse_element(input: &str) -> std::result::Result<(&str, Params<'_>), nom::Err<nom::error::Error<&str>>> {
    all_consuming(terminated(
        pair(preceded(space0, token), many0(parameter)),
        space0,
    ))
    .parse(input)
    .map(|(_, element)| element)
}

fn token(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-').parse(input)
}

/// `; key` or `; key=value`, where the value may be quoted.
fn parameter(input: &str) -> IResult<&str, (&str, Option<&str>)> {
    preceded(
        (space0, tag(";"), space0),
        pair(
            token,
            opt(preceded(
                (space0, tag("="), space0),
                alt((delimited(tag("\""), digit1, tag("\"")), digit1)),
            )),
        ),
    )
    .parse(input)
}
