use std::collections::VecDeque;

use bytes::Bytes;
use rand::RngCore;

use crate::{
    assembler::MessageAssembler,
    close::CloseCode,
    codec::FrameParser,
    writer::{FrameWriter, MAX_CLOSE_REASON},
    CompressionConfig, Event, Message, OpCode, Options, Result, Role, WebSocketError,
};

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Messages flow in both directions.
    Open,
    /// A close frame was sent, waiting for the peer to answer with its own.
    Closing,
    /// The close handshake completed, failed or the transport went away.
    Closed,
}

/// A WebSocket endpoint after the opening handshake.
///
/// `Connection` owns the [`FrameParser`], [`MessageAssembler`] and [`FrameWriter`] of one
/// endpoint and runs the parts of the protocol that involve both directions:
///
/// - pings are answered with a pong carrying the same payload, unless
///   [`Options::without_auto_pong`] was used;
/// - a close frame from the peer is echoed and ends the connection;
/// - a protocol error sends a close frame with the matching code, reports the error once and
///   ends the connection.
///
/// Inbound data goes through [`Connection::feed`]. Outbound data is queued and handed out by
/// [`Connection::take_output`], which the caller writes to the transport in order.
pub struct Connection {
    role: Role,
    auto_pong: bool,
    parser: FrameParser,
    assembler: MessageAssembler,
    writer: FrameWriter,
    state: State,
    events: VecDeque<Event>,
}

impl Connection {
    /// Creates a connection for `role` with the outcome of the extension negotiation.
    ///
    /// Compression is only used when `options.compression` is set. Its window size and context
    /// takeover preferences further restrict the local compressor.
    pub fn new(role: Role, options: Options, config: CompressionConfig) -> Self {
        let config = match &options.compression {
            Some(local) => config.restrict_deflate(role, local),
            None => CompressionConfig::disabled(),
        };

        Self {
            role,
            auto_pong: options.auto_pong,
            parser: FrameParser::new(role, config.enabled, options.max_message_size),
            assembler: MessageAssembler::new(role, &options, &config),
            writer: FrameWriter::new(role, &options, &config),
            state: State::Open,
            events: VecDeque::new(),
        }
    }

    /// Uses `rng` to generate masking keys.
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.writer.set_rng(rng);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// Consumes bytes received from the transport.
    ///
    /// Messages completed before a protocol error are still returned, followed by
    /// [`Event::Error`] and [`Event::Closed`]. Input received after the connection closed is
    /// ignored.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Event> {
        if self.state != State::Closed {
            self.parser.push(bytes);
        }

        while self.state != State::Closed {
            match self.parser.next_frame() {
                Ok(Some(frame)) => {
                    // nothing but control frames matter once our close frame is out
                    if self.state == State::Closing && frame.opcode.is_data() {
                        continue;
                    }
                    if let Err(err) = self.assembler.accept(frame) {
                        self.fail(err);
                        break;
                    }
                    while let Some(message) = self.assembler.next_message() {
                        self.on_message(message);
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    self.fail(err);
                    break;
                }
            }
        }

        self.events.drain(..).collect()
    }

    /// Reports that the transport was closed by the peer or failed.
    ///
    /// Unless the close handshake already completed, the connection ends with
    /// [`CloseCode::Abnormal`].
    pub fn transport_closed(&mut self) -> Vec<Event> {
        if self.state != State::Closed {
            #[cfg(feature = "logging")]
            log::debug!("{} transport closed without close handshake", self.role);

            self.state = State::Closed;
            self.assembler.reset();
            self.writer.abort();
            self.events.push_back(Event::Closed {
                code: CloseCode::Abnormal,
                reason: String::new(),
            });
        }

        self.events.drain(..).collect()
    }

    /// Queues a message.
    ///
    /// Sending [`Message::Close`] starts the close handshake like [`Connection::close`].
    pub fn send(&mut self, message: Message) -> Result<()> {
        self.send_with_compression(message, None)
    }

    /// Queues a message, overriding compression for it.
    ///
    /// `Some(0)` sends it uncompressed. Other values up to 15 compress it, when
    /// permessage-deflate was negotiated, with a fresh compressor using a window of that many
    /// bits. See [`FrameWriter::send`]. Control messages ignore the override.
    pub fn send_with_compression(&mut self, message: Message, compress: Option<u8>) -> Result<()> {
        match message {
            Message::Text(text) => self.writer.send(text, OpCode::Text, compress),
            Message::Binary(data) => self.writer.send(data, OpCode::Binary, compress),
            Message::Ping(data) => self.writer.ping(data),
            Message::Pong(data) => self.writer.pong(data),
            Message::Close { code, reason } => self.close(code, &reason),
        }
    }

    /// Queues a data message split in frames of at most `fragment_size` bytes.
    pub fn send_fragmented(&mut self, message: Message, fragment_size: usize) -> Result<()> {
        match message {
            Message::Text(text) => {
                self.writer
                    .send_fragmented(text, OpCode::Text, fragment_size, None)
            }
            Message::Binary(data) => {
                self.writer
                    .send_fragmented(data, OpCode::Binary, fragment_size, None)
            }
            _ => Err(WebSocketError::ControlFrameFragmented),
        }
    }

    pub fn ping(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.writer.ping(payload)
    }

    pub fn pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.writer.pong(payload)
    }

    /// Starts the close handshake.
    ///
    /// The message in progress is dropped and data frames received until the peer answers
    /// are discarded.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        match self.state {
            State::Open => {
                self.writer.close(code, reason)?;
                self.state = State::Closing;
                self.assembler.reset();
                self.events.push_back(Event::Closing);
                Ok(())
            }
            State::Closing => Err(WebSocketError::ConnectionClosing),
            State::Closed => Err(WebSocketError::ConnectionClosed),
        }
    }

    /// Takes the events queued by calls other than [`Connection::feed`], such as
    /// [`Event::Closing`] after [`Connection::close`].
    pub fn poll_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Takes the bytes to write to the transport, in order.
    pub fn take_output(&mut self) -> Vec<Bytes> {
        self.writer.take_output()
    }

    /// Whether the queued output went past the high water mark.
    pub fn needs_drain(&self) -> bool {
        self.writer.needs_drain()
    }

    pub fn buffered_amount(&self) -> usize {
        self.writer.buffered_amount()
    }

    fn on_message(&mut self, message: Message) {
        match message {
            Message::Ping(payload) => {
                if self.auto_pong && self.state == State::Open {
                    if let Err(err) = self.writer.pong(payload.clone()) {
                        self.fail(err);
                        return;
                    }
                }
                self.events.push_back(Event::Message(Message::Ping(payload)));
            }
            Message::Close { code, reason } => {
                self.events.push_back(Event::Message(Message::Close {
                    code,
                    reason: reason.clone(),
                }));

                match self.state {
                    State::Open => {
                        // echo the status code
                        if let Err(_err) = self.writer.close(code, "") {
                            #[cfg(feature = "logging")]
                            log::debug!("{} could not echo close frame: {_err}", self.role);
                        }
                        self.events.push_back(Event::Closing);
                        self.finish(code, reason);
                    }
                    State::Closing => self.finish(code, reason),
                    State::Closed => {}
                }
            }
            message => self.events.push_back(Event::Message(message)),
        }
    }

    fn finish(&mut self, code: CloseCode, reason: String) {
        #[cfg(feature = "logging")]
        log::debug!("{} closed with code {code}", self.role);

        self.state = State::Closed;
        self.assembler.reset();
        self.writer.finish();
        self.events.push_back(Event::Closed { code, reason });
    }

    fn fail(&mut self, err: WebSocketError) {
        let code = err.close_code().unwrap_or(CloseCode::Error);

        #[cfg(feature = "logging")]
        log::debug!("{} failing connection with code {code}: {err}", self.role);

        if self.state == State::Open {
            let mut reason = err.to_string();
            truncate_on_char_boundary(&mut reason, MAX_CLOSE_REASON);
            if let Err(_err) = self.writer.close(code, &reason) {
                #[cfg(feature = "logging")]
                log::debug!("{} could not send close frame: {_err}", self.role);
            }
        }

        self.state = State::Closed;
        self.assembler.reset();
        self.writer.finish();
        self.events.push_back(Event::Error(err));
        self.events.push_back(Event::Closed {
            code,
            reason: String::new(),
        });
    }
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() > max {
        let mut end = max;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeflateOptions;
    use rand::{rngs::StdRng, SeedableRng};

    fn pair() -> (Connection, Connection) {
        let config = CompressionConfig::disabled();
        (
            Connection::new(Role::Client, Options::default(), config.clone())
                .with_rng(StdRng::seed_from_u64(1)),
            Connection::new(Role::Server, Options::default(), config),
        )
    }

    /// Moves everything `from` has queued into `to`.
    fn transfer(from: &mut Connection, to: &mut Connection) -> Vec<Event> {
        let mut events = Vec::new();
        for buf in from.take_output() {
            events.extend(to.feed(&buf));
        }
        events
    }

    #[test]
    fn test_messages_flow_both_ways() {
        let (mut client, mut server) = pair();

        client.send(Message::text("hello")).unwrap();
        client.send(Message::binary(vec![1, 2, 3])).unwrap();
        let events = transfer(&mut client, &mut server);
        assert!(matches!(&events[0], Event::Message(Message::Text(text)) if text == "hello"));
        assert!(matches!(&events[1], Event::Message(Message::Binary(data)) if data[..] == [1, 2, 3]));

        server.send(Message::text("world")).unwrap();
        let events = transfer(&mut server, &mut client);
        assert!(matches!(&events[0], Event::Message(Message::Text(text)) if text == "world"));
    }

    #[test]
    fn test_auto_pong() {
        let (mut client, mut server) = pair();

        client.ping("are you there").unwrap();
        let events = transfer(&mut client, &mut server);
        assert!(matches!(&events[0], Event::Message(Message::Ping(data)) if data[..] == b"are you there"[..]));

        let events = transfer(&mut server, &mut client);
        assert!(matches!(&events[0], Event::Message(Message::Pong(data)) if data[..] == b"are you there"[..]));
    }

    #[test]
    fn test_without_auto_pong() {
        let config = CompressionConfig::disabled();
        let mut client = Connection::new(Role::Client, Options::default(), config.clone());
        let mut server =
            Connection::new(Role::Server, Options::default().without_auto_pong(), config);

        client.ping("").unwrap();
        transfer(&mut client, &mut server);
        assert!(server.take_output().is_empty());
    }

    #[test]
    fn test_close_handshake() {
        let (mut client, mut server) = pair();

        client.close(CloseCode::Away, "leaving").unwrap();
        assert_eq!(client.state(), State::Closing);
        assert!(matches!(&client.poll_events()[..], [Event::Closing]));
        assert!(matches!(
            client.send(Message::text("late")),
            Err(WebSocketError::ConnectionClosing)
        ));

        let events = transfer(&mut client, &mut server);
        assert!(matches!(
            &events[..],
            [
                Event::Message(Message::Close { code: CloseCode::Away, reason }),
                Event::Closing,
                Event::Closed { code: CloseCode::Away, .. },
            ] if reason == "leaving"
        ));
        assert!(server.is_closed());

        let events = transfer(&mut server, &mut client);
        assert!(matches!(
            &events[..],
            [
                Event::Message(Message::Close { code: CloseCode::Away, .. }),
                Event::Closed { code: CloseCode::Away, .. },
            ]
        ));
        assert!(client.is_closed());
        assert!(matches!(
            client.close(CloseCode::Normal, ""),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_data_after_local_close_is_dropped() {
        let (mut client, mut server) = pair();

        server.send(Message::text("in flight")).unwrap();
        let in_flight = server.take_output();
        client.close(CloseCode::Normal, "").unwrap();
        client.poll_events();

        let mut events = Vec::new();
        for buf in in_flight {
            events.extend(client.feed(&buf));
        }
        assert!(events.is_empty());
        assert_eq!(client.state(), State::Closing);
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let (_, mut server) = pair();

        // unmasked frame sent to a server
        let events = server.feed(b"\x81\x02hi");
        assert!(matches!(
            &events[..],
            [
                Event::Error(WebSocketError::InvalidMaskBit(true)),
                Event::Closed { code: CloseCode::Protocol, .. },
            ]
        ));
        assert!(server.is_closed());

        let output: Vec<u8> = server.take_output().concat();
        assert_eq!(output[0], 0x88);
        assert_eq!(&output[2..4], &1002u16.to_be_bytes());

        assert!(server.feed(b"\x81\x82").is_empty());
        assert!(server.transport_closed().is_empty());
    }

    #[test]
    fn test_messages_before_error_are_kept() {
        let (mut client, mut server) = pair();

        client.send(Message::text("first")).unwrap();
        let mut bytes: Vec<u8> = client.take_output().concat();
        bytes.extend_from_slice(&[0xF1, 0x80, 0, 0, 0, 0]);

        let events = server.feed(&bytes);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], Event::Message(Message::Text(text)) if text == "first"));
        assert!(matches!(events[1], Event::Error(WebSocketError::ReservedBitsNotZero)));
    }

    #[test]
    fn test_transport_closed() {
        let (mut client, _) = pair();
        client.send(Message::text("never sent")).unwrap();

        let events = client.transport_closed();
        assert!(matches!(
            &events[..],
            [Event::Closed { code: CloseCode::Abnormal, .. }]
        ));
        assert!(client.take_output().is_empty());
        assert!(matches!(
            client.send(Message::text("x")),
            Err(WebSocketError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_compression_follows_local_options() {
        let text = "a".repeat(100);

        let mut server = Connection::new(
            Role::Server,
            Options::default(),
            CompressionConfig::enabled(),
        );
        server.send(Message::text(text.clone())).unwrap();
        assert_eq!(server.take_output()[0][0], 0x81);

        let options = Options::default().with_compression(DeflateOptions {
            server_no_context_takeover: true,
            ..Default::default()
        });
        let mut server = Connection::new(Role::Server, options, CompressionConfig::enabled());
        let mut client = Connection::new(
            Role::Client,
            Options::default().with_compression(DeflateOptions::default()),
            CompressionConfig::enabled(),
        );
        for _ in 0..2 {
            server.send(Message::text(text.clone())).unwrap();
        }

        // without context takeover the second message is not shorter than the first
        let output = server.take_output();
        assert_eq!(output[0][0], 0xC1);
        assert_eq!(output[0].len(), output[1].len());

        let mut events = Vec::new();
        for buf in output {
            events.extend(client.feed(&buf));
        }
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| matches!(event, Event::Message(Message::Text(received)) if *received == text)));
    }

    #[test]
    fn test_compression_override() {
        let options = Options::default().with_compression(DeflateOptions::default());
        let config = CompressionConfig::enabled();
        let mut client = Connection::new(Role::Client, options.clone(), config.clone());
        let mut server = Connection::new(Role::Server, options, config);

        client
            .send_with_compression(Message::text("plain"), Some(0))
            .unwrap();
        client.send(Message::text("deflated")).unwrap();

        let output = client.take_output();
        assert_eq!(output[0][0], 0x81);
        assert_eq!(output[1][0], 0xC1);

        let mut events = Vec::new();
        for buf in output {
            events.extend(server.feed(&buf));
        }
        assert!(matches!(&events[0], Event::Message(Message::Text(text)) if text == "plain"));
        assert!(matches!(&events[1], Event::Message(Message::Text(text)) if text == "deflated"));
    }

    #[test]
    fn test_custom_codec_provider() {
        use crate::compression::{CodecProvider, DeflateCodec, Flate2, InflateCodec};
        use crate::CompressionLevel;
        use std::sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        };

        #[derive(Clone, Default)]
        struct Counting(Arc<AtomicUsize>);

        impl CodecProvider for Counting {
            fn deflater(&self, level: CompressionLevel, window_bits: u8) -> Box<dyn DeflateCodec> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Flate2.deflater(level, window_bits)
            }

            fn inflater(&self) -> Box<dyn InflateCodec> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Flate2.inflater()
            }
        }

        let provider = Counting::default();
        let options = Options::default()
            .with_compression(DeflateOptions::default())
            .with_codec(provider.clone());
        let config = CompressionConfig::enabled();
        let mut client = Connection::new(Role::Client, options.clone(), config.clone());
        let mut server = Connection::new(Role::Server, options, config);

        client.send(Message::binary(vec![9u8; 4096])).unwrap();
        let events = transfer(&mut client, &mut server);
        assert!(matches!(&events[0], Event::Message(Message::Binary(data)) if data.len() == 4096));
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_truncate_reason() {
        let mut reason = "é".repeat(100);
        truncate_on_char_boundary(&mut reason, MAX_CLOSE_REASON);
        assert_eq!(reason.len(), 122);
    }
}
