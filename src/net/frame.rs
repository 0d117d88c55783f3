//! Frame codec
//!
//! Decides whether an inbound buffer holds one complete frame. Nothing is
//! consumed until the whole declared length has arrived; `take_frame` then
//! splits exactly that many bytes off the front of the buffer.
//!
//! A long-length frame declaring more than the frame cap is cut to the cap.
//! The caller throws the rest of its body away as it arrives.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::net::buffer::PacketReader;
use crate::protocol::packets::PacketSize;

/// Outcome of inspecting a buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extracted {
    /// More bytes are needed; the buffer must be kept as is
    Incomplete,
    /// A complete frame of `length` bytes sits at the start of the buffer
    Complete { opcode: u16, length: usize },
    /// The first `length` bytes of an oversize long-length frame are buffered;
    /// `discard` more body bytes follow
    Truncated {
        opcode: u16,
        length: usize,
        discard: usize,
    },
}

/// One complete protocol frame, header included
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub opcode: u16,
    data: Bytes,
    discarded: usize,
}

impl Frame {
    pub fn new(opcode: u16, data: Bytes) -> Self {
        Self {
            opcode,
            data,
            discarded: 0,
        }
    }

    /// Body bytes cut off the end of an oversize frame
    pub fn discarded(&self) -> usize {
        self.discarded
    }

    /// Total frame length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw frame bytes, opcode included
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Bounds-checked reader over the whole frame (offsets count from the opcode)
    pub fn reader(&self) -> PacketReader<'_> {
        PacketReader::new(&self.data)
    }
}

/// Inspect `buf` for one complete frame.
///
/// `size_of` returns the size class of a known opcode, or `None` for an
/// opcode absent from the dispatch table, which is a protocol violation.
pub fn try_extract<F>(buf: &[u8], size_of: F, max_frame: usize) -> Result<Extracted, ProtocolError>
where
    F: Fn(u16) -> Option<PacketSize>,
{
    if buf.len() < 2 {
        return Ok(Extracted::Incomplete);
    }

    let reader = PacketReader::new(buf);
    let opcode = reader.u16_at(0)?;
    let size = size_of(opcode).ok_or(ProtocolError::UnknownOpcode(opcode))?;

    if buf.len() < size.header_len() {
        return Ok(Extracted::Incomplete);
    }

    let length = match size {
        PacketSize::Fixed(length) => length,
        PacketSize::VariableShort => {
            let length = reader.u16_at(2)? as usize;
            if length < 4 {
                return Err(ProtocolError::InvalidLength { opcode, length });
            }
            length
        }
        PacketSize::VariableLong => {
            let header = size.header_len();
            let length = (reader.u32_at(4)? as usize).saturating_add(header);
            if length > max_frame && max_frame >= header {
                if buf.len() < max_frame {
                    return Ok(Extracted::Incomplete);
                }
                return Ok(Extracted::Truncated {
                    opcode,
                    length: max_frame,
                    discard: length - max_frame,
                });
            }
            length
        }
    };

    if length > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: max_frame,
        });
    }

    if buf.len() < length {
        return Ok(Extracted::Incomplete);
    }

    Ok(Extracted::Complete { opcode, length })
}

/// Split one complete frame off the front of `buf`, if present
pub fn take_frame<F>(
    buf: &mut BytesMut,
    size_of: F,
    max_frame: usize,
) -> Result<Option<Frame>, ProtocolError>
where
    F: Fn(u16) -> Option<PacketSize>,
{
    match try_extract(buf, size_of, max_frame)? {
        Extracted::Incomplete => Ok(None),
        Extracted::Complete { opcode, length } => {
            let data = buf.split_to(length).freeze();
            Ok(Some(Frame::new(opcode, data)))
        }
        Extracted::Truncated {
            opcode,
            length,
            discard,
        } => {
            // The kept frame declares only the body it carries
            let mut data = buf.split_to(length);
            let body = (length - 8) as u32;
            data[4..8].copy_from_slice(&body.to_le_bytes());
            Ok(Some(Frame {
                opcode,
                data: data.freeze(),
                discarded: discard,
            }))
        }
    }
}
