//! Logical packets and frame reassembly.
//!
//! The assembler is sans-IO: the blocking and async connections read frame
//! headers and payloads from their own transports and feed them in here.

use sqlwire_core::{Error, ProtocolError};

use super::{MAX_PACKET_SIZE, PacketHeader};

/// A logical packet, reassembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Concatenated frame payloads.
    pub payload: Vec<u8>,
    /// Sequence number of the first frame.
    pub sequence_id: u8,
    /// Sequence number of the last frame.
    pub last_sequence_id: u8,
}

impl Packet {
    /// Build a single-frame packet.
    pub fn new(payload: Vec<u8>, sequence_id: u8) -> Self {
        Self {
            payload,
            sequence_id,
            last_sequence_id: sequence_id,
        }
    }

    /// First payload byte, if any.
    pub fn first_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    /// OK packet: `0x00` with at least 7 bytes, or the `0xFE` long form.
    pub fn is_ok(&self) -> bool {
        match self.first_byte() {
            Some(0x00) => self.payload.len() >= 7,
            Some(0xFE) => self.payload.len() >= 9 && self.payload.len() < MAX_PACKET_SIZE,
            _ => false,
        }
    }

    /// Error packet: leading `0xFF`.
    pub fn is_error(&self) -> bool {
        self.first_byte() == Some(0xFF)
    }

    /// EOF marker: leading `0xFE` and shorter than 9 bytes.
    pub fn is_eof(&self) -> bool {
        self.first_byte() == Some(0xFE) && self.payload.len() < 9
    }

    /// Auth-switch request during the handshake (`0xFE` followed by a plugin name).
    pub fn is_auth_switch(&self) -> bool {
        self.first_byte() == Some(0xFE) && self.payload.len() > 1
    }
}

/// Reassembles frames into logical packets.
///
/// A frame whose payload is exactly [`MAX_PACKET_SIZE`] long is continued by
/// the next frame; continuation frames must be numbered consecutively.
#[derive(Debug, Default)]
pub struct PacketAssembler {
    payload: Vec<u8>,
    first_seq: Option<u8>,
    last_seq: u8,
}

impl PacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a multi-frame packet is partially assembled.
    pub fn is_partial(&self) -> bool {
        self.first_seq.is_some()
    }

    /// Feed one frame. Returns the packet once its final frame has arrived.
    pub fn push_frame(&mut self, header: PacketHeader, frame: &[u8]) -> Result<Option<Packet>, Error> {
        if frame.len() != header.payload_length as usize {
            return Err(Error::Protocol(ProtocolError {
                message: format!(
                    "frame length mismatch: header says {}, got {} bytes",
                    header.payload_length,
                    frame.len()
                ),
                code: None,
                raw_data: None,
                source: None,
            }));
        }

        match self.first_seq {
            None => self.first_seq = Some(header.sequence_id),
            Some(_) => {
                let expected = self.last_seq.wrapping_add(1);
                if header.sequence_id != expected {
                    return Err(Error::Protocol(ProtocolError {
                        message: format!(
                            "packet sequence number wrong: got {}, expected {}",
                            header.sequence_id, expected
                        ),
                        code: None,
                        raw_data: None,
                        source: None,
                    }));
                }
            }
        }
        self.last_seq = header.sequence_id;
        self.payload.extend_from_slice(frame);

        if frame.len() == MAX_PACKET_SIZE {
            tracing::trace!(
                sequence_id = header.sequence_id,
                assembled = self.payload.len(),
                "continuation frame"
            );
            return Ok(None);
        }

        let sequence_id = self.first_seq.take().unwrap_or(header.sequence_id);
        Ok(Some(Packet {
            payload: std::mem::take(&mut self.payload),
            sequence_id,
            last_sequence_id: self.last_seq,
        }))
    }
}
