//! Incremental frame parser.
//!
//! The transport hands over chunks that have nothing to do with frame
//! boundaries. [`PacketParser::feed`] consumes each chunk completely and
//! keeps whatever is left over (a partial header of 1 to 3 bytes, a partly
//! filled payload, or the leading frames of a split message) for the next
//! call.

use sqlwire_core::error::{ProtocolError, ProtocolErrorKind};
use sqlwire_core::{Error, Result};

use crate::protocol::{MAX_PACKET_SIZE, Packet, PacketHeader};

/// A frame whose payload is still being filled.
#[derive(Debug)]
struct PartialFrame {
    sequence_id: u8,
    expected: usize,
    buffer: Vec<u8>,
}

/// Frames of a message larger than one frame, waiting for the last one.
#[derive(Debug)]
struct SplitMessage {
    first_sequence_id: u8,
    last_sequence_id: u8,
    payload: Vec<u8>,
}

/// Turns an unaligned byte stream into complete [`Packet`]s.
#[derive(Debug)]
pub struct PacketParser {
    max_payload: usize,
    header: [u8; PacketHeader::SIZE],
    header_len: usize,
    frame: Option<PartialFrame>,
    split: Option<SplitMessage>,
    frames_consumed: u64,
}

impl Default for PacketParser {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketParser {
    pub fn new() -> Self {
        Self::with_max_payload(MAX_PACKET_SIZE)
    }

    /// Parser whose frames carry at most `max_payload` bytes.
    ///
    /// Must match the value the peer frames with; only tests use anything
    /// other than [`MAX_PACKET_SIZE`].
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self {
            max_payload: max_payload.clamp(1, MAX_PACKET_SIZE),
            header: [0; PacketHeader::SIZE],
            header_len: 0,
            frame: None,
            split: None,
            frames_consumed: 0,
        }
    }

    /// Total number of frames completed so far.
    pub fn frames_consumed(&self) -> u64 {
        self.frames_consumed
    }

    /// True when no partial header, frame or split message is buffered.
    pub fn is_idle(&self) -> bool {
        self.header_len == 0 && self.frame.is_none() && self.split.is_none()
    }

    /// Drop any buffered partial state.
    pub fn reset(&mut self) {
        self.header_len = 0;
        self.frame = None;
        self.split = None;
    }

    /// Consume `chunk` and return every packet it completes, in order.
    ///
    /// On error the parser is left in an unspecified state; the connection
    /// that owns it must be closed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();
        let mut input = chunk;

        loop {
            if self.frame.is_none() {
                if input.is_empty() {
                    break;
                }
                let take = (PacketHeader::SIZE - self.header_len).min(input.len());
                self.header[self.header_len..self.header_len + take]
                    .copy_from_slice(&input[..take]);
                self.header_len += take;
                input = &input[take..];

                if self.header_len < PacketHeader::SIZE {
                    tracing::trace!(buffered = self.header_len, "partial frame header");
                    break;
                }
                self.header_len = 0;
                self.start_frame(PacketHeader::from_bytes(&self.header))?;
            }

            let Some(frame) = self.frame.as_mut() else {
                continue;
            };
            let take = (frame.expected - frame.buffer.len()).min(input.len());
            frame.buffer.extend_from_slice(&input[..take]);
            input = &input[take..];

            if frame.buffer.len() < frame.expected {
                break;
            }
            if let Some(frame) = self.frame.take() {
                self.finish_frame(frame, &mut packets);
            }
        }

        Ok(packets)
    }

    fn start_frame(&mut self, header: PacketHeader) -> Result<()> {
        let expected = header.payload_length as usize;
        if expected > self.max_payload {
            return Err(invalid_packet(
                format!(
                    "declared frame length {} exceeds maximum {}",
                    expected, self.max_payload
                ),
                &self.header,
            ));
        }

        if let Some(split) = &self.split {
            let wanted = split.last_sequence_id.wrapping_add(1);
            if header.sequence_id != wanted {
                return Err(invalid_packet(
                    format!(
                        "continuation frame has sequence id {}, expected {}",
                        header.sequence_id, wanted
                    ),
                    &self.header,
                ));
            }
        }

        self.frame = Some(PartialFrame {
            sequence_id: header.sequence_id,
            expected,
            buffer: Vec::with_capacity(expected),
        });
        Ok(())
    }

    fn finish_frame(&mut self, frame: PartialFrame, packets: &mut Vec<Packet>) {
        self.frames_consumed += 1;
        let continues = frame.expected == self.max_payload;

        let mut split = match self.split.take() {
            Some(mut split) => {
                split.payload.extend_from_slice(&frame.buffer);
                split.last_sequence_id = frame.sequence_id;
                split
            }
            None => SplitMessage {
                first_sequence_id: frame.sequence_id,
                last_sequence_id: frame.sequence_id,
                payload: frame.buffer,
            },
        };

        if continues {
            self.split = Some(split);
            return;
        }

        tracing::trace!(
            sequence_id = split.first_sequence_id,
            len = split.payload.len(),
            "packet complete"
        );
        packets.push(Packet {
            sequence_id: split.first_sequence_id,
            payload: std::mem::take(&mut split.payload),
            last_sequence_id: split.last_sequence_id,
        });
    }
}

fn invalid_packet(message: String, header: &[u8]) -> Error {
    Error::Protocol(ProtocolError {
        kind: ProtocolErrorKind::InvalidPacket,
        message,
        raw_data: Some(header.to_vec()),
        source: None,
    })
}
