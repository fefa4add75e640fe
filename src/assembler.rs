//! Reassembly of frames into messages.
use std::{collections::VecDeque, sync::Arc};

use bytes::{Bytes, BytesMut};

use crate::{
    close,
    compression::{CodecProvider, Decompressor},
    CompressionConfig, Frame, Message, OpCode, Options, Result, Role, WebSocketError,
};

/// Data of a fragmented message whose final frame has not arrived yet.
#[derive(Debug)]
struct Fragment {
    opcode: OpCode,
    compressed: bool,
    payload: BytesMut,
}

/// Turns validated frames into complete messages.
///
/// The assembler concatenates fragments, inflates compressed messages and decodes text and
/// close payloads. Completed messages are queued in arrival order. At most one fragmented
/// message is in progress at any time, control frames may arrive between its fragments and
/// are queued immediately.
///
/// Any error discards the message in progress.
pub struct MessageAssembler {
    max_message_size: usize,
    /// Whether the peer resets its compressor after every message. `None` when
    /// permessage-deflate was not negotiated.
    inflate_no_context_takeover: Option<bool>,
    codec: Arc<dyn CodecProvider>,
    /// Created on the first compressed message.
    inflate: Option<Decompressor>,
    fragment: Option<Fragment>,
    queue: VecDeque<Message>,
}

impl MessageAssembler {
    /// Creates the assembler of an endpoint playing `role`.
    ///
    /// `config` is taken as is, [`Connection::new`](crate::Connection::new) is where
    /// [`Options::compression`] gets applied.
    pub fn new(role: Role, options: &Options, config: &CompressionConfig) -> Self {
        Self {
            max_message_size: options.max_message_size,
            inflate_no_context_takeover: config
                .enabled
                .then(|| config.inflate_no_context_takeover(role)),
            codec: Arc::clone(&options.codec),
            inflate: None,
            fragment: None,
            queue: VecDeque::new(),
        }
    }

    /// Consumes one frame, queueing the message it completes.
    pub fn accept(&mut self, frame: Frame) -> Result<()> {
        let result = self.on_frame(frame);
        if result.is_err() {
            self.fragment = None;
        }
        result
    }

    /// Pops the oldest completed message.
    pub fn next_message(&mut self) -> Option<Message> {
        self.queue.pop_front()
    }

    /// Drains every completed message in arrival order.
    pub fn drain(&mut self) -> impl Iterator<Item = Message> + '_ {
        self.queue.drain(..)
    }

    /// Whether a fragmented message is in progress.
    pub fn is_fragmented(&self) -> bool {
        self.fragment.is_some()
    }

    /// Drops the message in progress. Completed messages stay queued.
    pub fn reset(&mut self) {
        self.fragment = None;
    }

    fn on_frame(&mut self, frame: Frame) -> Result<()> {
        if frame.is_compressed() && self.inflate_no_context_takeover.is_none() {
            return Err(WebSocketError::CompressionNotSupported);
        }

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if self.fragment.is_some() {
                    return Err(WebSocketError::InvalidFragment);
                }

                let compressed = frame.is_compressed();
                if frame.fin {
                    self.complete(frame.opcode, compressed, frame.payload)
                } else {
                    self.check_partial_size(frame.payload.len())?;
                    self.fragment = Some(Fragment {
                        opcode: frame.opcode,
                        compressed,
                        payload: BytesMut::from(&frame.payload[..]),
                    });
                    Ok(())
                }
            }
            OpCode::Continuation => {
                let size = match &self.fragment {
                    Some(fragment) => fragment.payload.len() + frame.payload.len(),
                    None => return Err(WebSocketError::InvalidContinuationFrame),
                };
                if frame.fin {
                    self.check_size(size)?;
                } else {
                    self.check_partial_size(size)?;
                }

                let Some(mut fragment) = self.fragment.take() else {
                    return Err(WebSocketError::InvalidContinuationFrame);
                };
                fragment.payload.extend_from_slice(&frame.payload);

                if frame.fin {
                    self.complete(
                        fragment.opcode,
                        fragment.compressed,
                        fragment.payload.freeze(),
                    )
                } else {
                    self.fragment = Some(fragment);
                    Ok(())
                }
            }
            OpCode::Close => {
                let (code, reason) = close::parse_payload(&frame.payload)?;
                self.queue.push_back(Message::Close { code, reason });
                Ok(())
            }
            OpCode::Ping => {
                self.queue.push_back(Message::Ping(frame.payload));
                Ok(())
            }
            OpCode::Pong => {
                self.queue.push_back(Message::Pong(frame.payload));
                Ok(())
            }
        }
    }

    /// A message still waiting for frames must stay below the limit.
    fn check_partial_size(&self, size: usize) -> Result<()> {
        if size >= self.max_message_size {
            Err(WebSocketError::MessageTooBig {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// A complete message may be exactly as large as the limit.
    fn check_size(&self, size: usize) -> Result<()> {
        if size > self.max_message_size {
            Err(WebSocketError::MessageTooBig {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    fn complete(&mut self, opcode: OpCode, compressed: bool, payload: Bytes) -> Result<()> {
        let payload = if compressed {
            let no_context_takeover = self
                .inflate_no_context_takeover
                .ok_or(WebSocketError::CompressionNotSupported)?;
            let codec = &self.codec;
            self.inflate
                .get_or_insert_with(|| Decompressor::new(codec.inflater(), no_context_takeover))
                .decompress(&payload, self.max_message_size)?
        } else {
            self.check_size(payload.len())?;
            payload
        };

        let message = if opcode == OpCode::Text {
            let text = String::from_utf8(payload.to_vec()).map_err(|_| WebSocketError::InvalidUTF8)?;
            Message::Text(text)
        } else {
            Message::Binary(payload)
        };

        self.queue.push_back(message);
        Ok(())
    }
}
