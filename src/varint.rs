//! QUIC variable-length integers (RFC 9000 §16).
//!
//! The two most-significant bits of the first byte encode the total
//! length (1, 2, 4 or 8 bytes), leaving 6, 14, 30 or 62 usable bits.

use std::fmt;

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt};

/// An integer less than 2^62, the QUIC varint value space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VarInt(u64);

/// The decoded bytes did not form a varint, or the stream ended mid-varint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unexpected end of input while decoding a varint")]
pub struct UnexpectedEnd;

impl VarInt {
    /// The largest representable value, 2^62 - 1.
    pub const MAX: Self = Self((1 << 62) - 1);

    pub const fn from_u32(v: u32) -> Self {
        Self(v as u64)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Number of bytes this value occupies on the wire.
    pub const fn size(self) -> usize {
        if self.0 <= 63 {
            1
        } else if self.0 <= 16_383 {
            2
        } else if self.0 <= 1_073_741_823 {
            4
        } else {
            8
        }
    }

    /// Append the encoded value to `buf`.
    pub fn encode(self, buf: &mut Vec<u8>) {
        let v = self.0;
        match self.size() {
            1 => buf.push(v as u8),
            2 => buf.extend_from_slice(&[0x40 | (v >> 8) as u8, v as u8]),
            4 => buf.extend_from_slice(&[
                0x80 | (v >> 24) as u8,
                (v >> 16) as u8,
                (v >> 8) as u8,
                v as u8,
            ]),
            _ => buf.extend_from_slice(&[
                0xc0 | (v >> 56) as u8,
                (v >> 48) as u8,
                (v >> 40) as u8,
                (v >> 32) as u8,
                (v >> 24) as u8,
                (v >> 16) as u8,
                (v >> 8) as u8,
                v as u8,
            ]),
        }
    }

    /// Decode one varint from the front of `buf`, advancing it.
    pub fn decode<B: Buf>(buf: &mut B) -> Result<Self, UnexpectedEnd> {
        if !buf.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let first = buf.chunk()[0];
        let len = 1usize << (first >> 6);
        if buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let mut bytes = [0u8; 8];
        buf.copy_to_slice(&mut bytes[..len]);
        bytes[0] &= 0x3f;
        let mut v = 0u64;
        for b in &bytes[..len] {
            v = (v << 8) | *b as u64;
        }
        Ok(Self(v))
    }

    /// Read one varint from an async byte stream.
    ///
    /// Fails with [`UnexpectedEnd`] mapped through `io::Error` semantics:
    /// any read error (including EOF mid-varint) is surfaced as the
    /// underlying `io::Error`.
    pub async fn read<R>(r: &mut R) -> std::io::Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut bytes = [0u8; 8];
        r.read_exact(&mut bytes[..1]).await?;
        let len = 1usize << (bytes[0] >> 6);
        if len > 1 {
            r.read_exact(&mut bytes[1..len]).await?;
        }
        bytes[0] &= 0x3f;
        let mut v = 0u64;
        for b in &bytes[..len] {
            v = (v << 8) | *b as u64;
        }
        Ok(Self(v))
    }
}

impl From<u32> for VarInt {
    fn from(v: u32) -> Self {
        Self(v as u64)
    }
}

impl TryFrom<u64> for VarInt {
    type Error = BoundsExceeded;

    fn try_from(v: u64) -> Result<Self, BoundsExceeded> {
        if v > Self::MAX.0 {
            return Err(BoundsExceeded);
        }
        Ok(Self(v))
    }
}

impl From<VarInt> for u64 {
    fn from(v: VarInt) -> u64 {
        v.0
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The value does not fit in 62 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("value too large for a varint")]
pub struct BoundsExceeded;

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(v: u64) -> usize {
        let var = VarInt::try_from(v).unwrap();
        let mut buf = Vec::new();
        var.encode(&mut buf);
        assert_eq!(buf.len(), var.size());
        let mut slice = &buf[..];
        assert_eq!(VarInt::decode(&mut slice).unwrap(), var);
        assert!(slice.is_empty());
        buf.len()
    }

    #[test]
    fn encoding_boundaries() {
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16_383), 2);
        assert_eq!(roundtrip(16_384), 4);
        assert_eq!(roundtrip(1_073_741_823), 4);
        assert_eq!(roundtrip(1_073_741_824), 8);
        assert_eq!(roundtrip((1 << 62) - 1), 8);
    }

    #[test]
    fn known_vectors() {
        // Examples from RFC 9000 appendix A.1.
        let mut buf = Vec::new();
        VarInt::try_from(151_288_809_941_952_652u64)
            .unwrap()
            .encode(&mut buf);
        assert_eq!(buf, [0xc2, 0x19, 0x7c, 0x5e, 0xff, 0x14, 0xe8, 0x8c]);

        let mut slice = &[0x9d, 0x7f, 0x3e, 0x7d][..];
        assert_eq!(
            VarInt::decode(&mut slice).unwrap().into_inner(),
            494_878_333
        );
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(VarInt::try_from(1u64 << 62), Err(BoundsExceeded));
    }

    #[test]
    fn truncated_input() {
        let mut slice = &[0x40u8][..];
        assert_eq!(VarInt::decode(&mut slice), Err(UnexpectedEnd));
        let mut empty = &[][..];
        assert_eq!(VarInt::decode(&mut empty), Err(UnexpectedEnd));
    }
}
