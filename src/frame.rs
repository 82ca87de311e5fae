//! HTTP/3 frame and unidirectional stream types, plus the WebTransport
//! stream-header codec.
//!
//! Only the handful of types this crate touches are modeled; everything
//! else is treated as unknown and skipped or declined by the driver.

use bytes::Buf;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::varint::VarInt;

/// An HTTP/3 frame type, found at the start of every frame on a request
/// or control stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameType(pub VarInt);

impl FrameType {
    pub const DATA: Self = Self(VarInt::from_u32(0x00));
    pub const HEADERS: Self = Self(VarInt::from_u32(0x01));
    pub const SETTINGS: Self = Self(VarInt::from_u32(0x04));
    pub const GOAWAY: Self = Self(VarInt::from_u32(0x07));
    /// The frame type that turns a bidirectional stream into a
    /// WebTransport stream. Unlike every other frame it has no length;
    /// the rest of the stream belongs to the application.
    pub const WEBTRANSPORT: Self = Self(VarInt::from_u32(0x41));
}

/// A unidirectional stream type, the first varint on every uni stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamType(pub VarInt);

impl StreamType {
    pub const CONTROL: Self = Self(VarInt::from_u32(0x00));
    pub const QPACK_ENCODER: Self = Self(VarInt::from_u32(0x02));
    pub const QPACK_DECODER: Self = Self(VarInt::from_u32(0x03));
    /// The stream type that marks a unidirectional WebTransport stream.
    pub const WEBTRANSPORT: Self = Self(VarInt::from_u32(0x54));
}

/// HTTP/3 `H3_FRAME_ERROR` connection error code.
pub(crate) const H3_FRAME_ERROR: quinn::VarInt = quinn::VarInt::from_u32(0x0106);
/// HTTP/3 `H3_MISSING_SETTINGS` connection error code.
pub(crate) const H3_MISSING_SETTINGS: quinn::VarInt = quinn::VarInt::from_u32(0x010a);

/// Append a `type || length || payload` frame to `buf`.
pub fn encode_frame(ty: FrameType, payload: &[u8], buf: &mut Vec<u8>) {
    ty.0.encode(buf);
    VarInt::try_from(payload.len() as u64)
        .expect("frame payload fits a varint")
        .encode(buf);
    buf.extend_from_slice(payload);
}

/// Read a frame header (type and payload length) from a stream.
pub async fn read_frame_header<R>(r: &mut R) -> std::io::Result<(FrameType, u64)>
where
    R: AsyncRead + Unpin,
{
    let ty = VarInt::read(r).await?;
    let len = VarInt::read(r).await?;
    Ok((FrameType(ty), len.into_inner()))
}

/// Read exactly `len` payload bytes of a frame.
pub async fn read_frame_payload<R>(r: &mut R, len: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    // Frames this crate reads (HEADERS, SETTINGS) are tiny; anything
    // larger is a peer misbehaving.
    const MAX_FRAME_PAYLOAD: u64 = 1 << 16;
    if len > MAX_FRAME_PAYLOAD {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame payload too large",
        ));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Encode the header written at the front of a locally-opened
/// bidirectional WebTransport stream: `WEBTRANSPORT frame type`, then the
/// session id. Buffered into one allocation so it leaves in a single
/// write.
pub fn bidi_stream_header(session_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    FrameType::WEBTRANSPORT.0.encode(&mut buf);
    VarInt::try_from(session_id)
        .expect("session id is a stream id")
        .encode(&mut buf);
    buf
}

/// As [`bidi_stream_header`], for unidirectional streams.
pub fn uni_stream_header(session_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10);
    StreamType::WEBTRANSPORT.0.encode(&mut buf);
    VarInt::try_from(session_id)
        .expect("session id is a stream id")
        .encode(&mut buf);
    buf
}

/// The session-id prefix of every outgoing datagram.
pub fn datagram_header(session_id: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8);
    VarInt::try_from(session_id)
        .expect("session id is a stream id")
        .encode(&mut buf);
    buf
}

/// Decode a stream header from a buffer, returning the leading type and
/// the session id. Used by tests; the driver reads the two varints
/// incrementally off the live stream instead.
pub fn decode_stream_header<B: Buf>(buf: &mut B) -> Result<(VarInt, u64), crate::varint::UnexpectedEnd> {
    let ty = VarInt::decode(buf)?;
    let sid = VarInt::decode(buf)?;
    Ok((ty, sid.into_inner()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_header_roundtrip() {
        for sid in [0u64, 7, 99, 16_384, (1 << 62) - 1] {
            let buf = bidi_stream_header(sid);
            let mut slice = &buf[..];
            let (ty, decoded) = decode_stream_header(&mut slice).unwrap();
            assert_eq!(FrameType(ty), FrameType::WEBTRANSPORT);
            assert_eq!(decoded, sid);
            assert!(slice.is_empty());

            let buf = uni_stream_header(sid);
            let mut slice = &buf[..];
            let (ty, decoded) = decode_stream_header(&mut slice).unwrap();
            assert_eq!(StreamType(ty), StreamType::WEBTRANSPORT);
            assert_eq!(decoded, sid);
        }
    }

    #[test]
    fn header_is_single_buffer() {
        // Frame type 0x41 needs a 2-byte varint; small session ids one byte.
        assert_eq!(bidi_stream_header(7), [0x40, 0x41, 0x07]);
        assert_eq!(uni_stream_header(7), [0x40, 0x54, 0x07]);
    }

    #[test]
    fn frame_roundtrip() {
        let mut buf = Vec::new();
        encode_frame(FrameType::SETTINGS, &[1, 2, 3], &mut buf);
        assert_eq!(buf, [0x04, 0x03, 1, 2, 3]);
    }
}
