//! Broadcast relay
//!
//! Turns an operator message from the login server into map-server
//! broadcast frames. Text is handled as raw bytes; the client encoding is
//! not necessarily UTF-8.

use crate::error::ProtocolError;
use crate::net::buffer::PacketWriter;
use crate::protocol::packets::{to_map, BLUE_BROADCAST_MARKER};

/// Longest chunk carried by one broadcast frame
pub const SEGMENT_LEN: usize = 79;

/// Longest message accepted from the login server
pub const MAX_MESSAGE_LEN: usize = 4095;

/// Broadcast text color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastColor {
    Yellow,
    Blue,
}

impl BroadcastColor {
    /// Color flag as sent by the login server (0 = yellow)
    pub fn from_flag(flag: u16) -> Self {
        if flag == 0 {
            BroadcastColor::Yellow
        } else {
            BroadcastColor::Blue
        }
    }

    /// Offset of the text inside a broadcast frame
    fn text_offset(self) -> usize {
        match self {
            BroadcastColor::Yellow => 4,
            BroadcastColor::Blue => 8,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            BroadcastColor::Yellow => "yellow",
            BroadcastColor::Blue => "blue",
        }
    }
}

/// Cut at the first NUL, replace control bytes with `_`, drop leading spaces
pub fn sanitize(raw: &[u8]) -> Vec<u8> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let cleaned: Vec<u8> = raw[..end.min(MAX_MESSAGE_LEN)]
        .iter()
        .map(|&b| if b < b' ' || b == 0x7f { b'_' } else { b })
        .collect();
    let start = cleaned
        .iter()
        .position(|&b| b != b' ')
        .unwrap_or(cleaned.len());
    cleaned[start..].to_vec()
}

fn trim_spaces_end(mut chunk: &[u8]) -> &[u8] {
    while let [rest @ .., b' '] = chunk {
        chunk = rest;
    }
    chunk
}

/// Split text into chunks of at most `bound` bytes, breaking at spaces.
///
/// A word longer than `bound` is the only thing ever cut mid-word.
pub fn segment(text: &[u8], bound: usize) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut rest = text;

    loop {
        let start = rest.iter().position(|&b| b != b' ').unwrap_or(rest.len());
        rest = &rest[start..];
        if rest.is_empty() || bound == 0 {
            break;
        }

        if rest.len() <= bound {
            chunks.push(trim_spaces_end(rest));
            break;
        }

        // A space at `bound` ends a chunk of exactly `bound` bytes
        let cut = rest[..=bound]
            .iter()
            .rposition(|&b| b == b' ')
            .filter(|&i| i > 0)
            .unwrap_or(bound);
        chunks.push(trim_spaces_end(&rest[..cut]));
        rest = &rest[cut..];
    }

    chunks
}

/// Encode one broadcast frame: `[op][len][marker if blue][text][0]`
pub fn encode_frame(color: BroadcastColor, chunk: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let offset = color.text_offset();
    let mut writer = PacketWriter::variable_frame(to_map::BROADCAST, offset + chunk.len() + 1);
    if color == BroadcastColor::Blue {
        writer.write_u32(BLUE_BROADCAST_MARKER);
    }
    writer.write_bytes(chunk);
    writer.write_u8(0);
    writer.finish_variable()
}

/// All frames for one message, in send order; empty when there is nothing to say
pub fn build_frames(raw: &[u8], color: BroadcastColor) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let text = sanitize(raw);
    segment(&text, SEGMENT_LEN)
        .into_iter()
        .map(|chunk| encode_frame(color, chunk))
        .collect()
}
