//! Sequence-number extraction from raw datagrams.

use serde::{Deserialize, Serialize};

use super::SeqWidth;

/// Byte order of a `simple` sequence field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    #[default]
    Big,
    Little,
}

/// How to locate the sequence number inside a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "format", rename_all = "lowercase")]
pub enum PacketFormat {
    /// RTP fixed header: 16-bit big-endian sequence at bytes 2..4
    /// (RFC 3550 §5.1).
    #[default]
    Rtp,
    /// Bare counter at a fixed offset.
    Simple {
        offset: usize,
        width: SeqWidth,
        order: ByteOrder,
    },
}

impl PacketFormat {
    /// Width of the sequence-number space this format produces.
    pub fn width(&self) -> SeqWidth {
        match self {
            Self::Rtp => SeqWidth::W16,
            Self::Simple { width, .. } => *width,
        }
    }

    /// Shortest datagram this format can read a sequence number from.
    pub fn min_len(&self) -> usize {
        match self {
            Self::Rtp => 4,
            Self::Simple { offset, width, .. } => offset + width.bytes(),
        }
    }

    /// Read the sequence number, or `None` if the datagram is too short.
    pub fn extract(&self, data: &[u8]) -> Option<u64> {
        match *self {
            Self::Rtp => {
                let field = data.get(2..4)?;
                Some(u16::from_be_bytes([field[0], field[1]]) as u64)
            }
            Self::Simple {
                offset,
                width,
                order,
            } => {
                let field = data.get(offset..offset + width.bytes())?;
                let mut buf = [0u8; 8];
                let value = match order {
                    ByteOrder::Big => {
                        buf[8 - field.len()..].copy_from_slice(field);
                        u64::from_be_bytes(buf)
                    }
                    ByteOrder::Little => {
                        buf[..field.len()].copy_from_slice(field);
                        u64::from_le_bytes(buf)
                    }
                };
                Some(value)
            }
        }
    }

    /// Encode `sequence` the way [`extract`](Self::extract) reads it, into
    /// a zeroed buffer of `size` bytes (at least [`min_len`](Self::min_len)).
    /// Used by the test sender for `simple` streams.
    pub fn encode_simple(&self, sequence: u64, size: usize) -> Vec<u8> {
        let mut packet = vec![0u8; size.max(self.min_len())];
        if let Self::Simple {
            offset,
            width,
            order,
        } = *self
        {
            let n = width.bytes();
            let value = sequence & width.mask();
            let slot = &mut packet[offset..offset + n];
            match order {
                ByteOrder::Big => slot.copy_from_slice(&value.to_be_bytes()[8 - n..]),
                ByteOrder::Little => slot.copy_from_slice(&value.to_le_bytes()[..n]),
            }
        }
        packet
    }
}
