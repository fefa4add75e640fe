//! Property tests for masking, chunked parsing and compression.

use bytes::Bytes;
use proptest::prelude::*;
use rand::{rngs::StdRng, SeedableRng};
use wsengine::{
    apply_mask, codec::FrameParser, writer::FrameWriter, CompressionConfig, Connection,
    DeflateOptions, Event, Message, OpCode, Options, Role,
};

fn options(compression: bool) -> Options {
    if compression {
        Options::default().with_compression(DeflateOptions::default())
    } else {
        Options::default()
    }
}

fn init_logging() {
    let _ = simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Debug)
        .init();
}

fn arb_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        ".{0,300}".prop_map(Message::Text),
        prop::collection::vec(any::<u8>(), 0..=70_000).prop_map(Message::binary),
        prop::collection::vec(any::<u8>(), 0..=125).prop_map(Message::ping),
    ]
}

/// Serializes `messages` as a client would.
fn client_bytes(messages: &[Message], compression: bool, seed: u64) -> Vec<u8> {
    let config = if compression {
        CompressionConfig::enabled()
    } else {
        CompressionConfig::disabled()
    };
    let mut client = Connection::new(Role::Client, options(compression), config)
        .with_rng(StdRng::seed_from_u64(seed));
    for message in messages {
        client.send(message.clone()).unwrap();
    }
    client.take_output().concat()
}

fn server_messages(chunks: impl IntoIterator<Item = Vec<u8>>, compression: bool) -> Vec<Message> {
    let config = if compression {
        CompressionConfig::enabled()
    } else {
        CompressionConfig::disabled()
    };
    let mut server = Connection::new(Role::Server, options(compression), config);

    let mut messages = Vec::new();
    for chunk in chunks {
        for event in server.feed(&chunk) {
            match event {
                Event::Message(message) => messages.push(message),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }
    messages
}

/// Splits `bytes` at the given relative cut points.
fn split_at(bytes: &[u8], cuts: &[prop::sample::Index]) -> Vec<Vec<u8>> {
    let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(bytes.len() + 1)).collect();
    points.sort_unstable();

    let mut chunks = Vec::new();
    let mut start = 0;
    for point in points {
        chunks.push(bytes[start..point].to_vec());
        start = point;
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// XOR masking is self-inverse.
    #[test]
    fn mask_is_involution(data in prop::collection::vec(any::<u8>(), 0..=4096), key in any::<[u8; 4]>()) {
        let mut buf = data.clone();
        apply_mask(&mut buf, key);
        apply_mask(&mut buf, key);
        prop_assert_eq!(buf, data);
    }

    /// Feeding a byte stream in arbitrary chunks yields the same messages as feeding it at once.
    #[test]
    fn chunking_does_not_change_messages(
        messages in prop::collection::vec(arb_message(), 1..4),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..16),
        compression in any::<bool>(),
        seed in any::<u64>(),
    ) {
        init_logging();
        let bytes = client_bytes(&messages, compression, seed);

        let whole = server_messages([bytes.clone()], compression);
        let chunked = server_messages(split_at(&bytes, &cuts), compression);

        prop_assert_eq!(&whole, &messages);
        prop_assert_eq!(chunked, whole);
    }

    /// An unmasked single-frame text message parses back to itself.
    #[test]
    fn unmasked_text_round_trip(text in ".{0,1000}") {
        let mut writer = FrameWriter::new(Role::Server, &Options::default(), &CompressionConfig::disabled());
        writer.send(text.clone(), OpCode::Text, None).unwrap();
        let bytes: Vec<u8> = writer.take_output().concat();

        let mut parser = FrameParser::new(Role::Client, false, usize::MAX);
        let frames = parser.feed(&bytes).unwrap();
        prop_assert_eq!(frames.len(), 1);
        prop_assert!(frames[0].fin);
        prop_assert_eq!(frames[0].opcode, OpCode::Text);
        prop_assert_eq!(frames[0].payload.clone(), Bytes::from(text));
    }

    /// Fragmenting a message never changes what the receiver assembles.
    #[test]
    fn fragmentation_is_transparent(
        data in prop::collection::vec(any::<u8>(), 0..=5000),
        fragment_size in 1usize..2000,
        compression in any::<bool>(),
    ) {
        let config = if compression { CompressionConfig::enabled() } else { CompressionConfig::disabled() };
        let mut client = Connection::new(Role::Client, options(compression), config);
        client.send_fragmented(Message::binary(data.clone()), fragment_size).unwrap();

        let messages = server_messages([client.take_output().concat()], compression);
        prop_assert_eq!(messages, vec![Message::binary(data)]);
    }
}
