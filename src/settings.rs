//! The HTTP/3 SETTINGS exchange.
//!
//! Each endpoint opens its control stream and sends one SETTINGS frame
//! advertising WebTransport support. The peer's control stream is parsed
//! by the connection driver; sessions may not be established until the
//! peer's SETTINGS carry `ENABLE_WEBTRANSPORT = 1`.

use thiserror::Error;

use crate::frame::{self, FrameType, StreamType};
use crate::varint::VarInt;

/// `SETTINGS_ENABLE_WEBTRANSPORT`, the draft identifier.
pub const SETTINGS_ENABLE_WEBTRANSPORT: u64 = 0x2b603742;
/// `SETTINGS_ENABLE_CONNECT_PROTOCOL` (RFC 9220).
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u64 = 0x08;
/// `SETTINGS_H3_DATAGRAM` (RFC 9297).
pub const SETTINGS_H3_DATAGRAM: u64 = 0x33;

/// An error during the HTTP/3 SETTINGS frame exchange.
#[derive(Error, Debug, Clone)]
pub enum SettingsError {
    #[error("malformed SETTINGS payload")]
    Malformed,

    #[error("WebTransport is not supported by the peer")]
    WebTransportUnsupported,

    #[error("connection error")]
    Connection(#[from] quinn::ConnectionError),

    #[error("write error")]
    Write(#[from] quinn::WriteError),
}

/// The settings advertised by the peer's control stream.
#[derive(Debug, Clone, Default)]
pub struct PeerSettings {
    pub enable_webtransport: bool,
    pub enable_connect_protocol: bool,
    pub h3_datagram: bool,
    /// Every identifier/value pair as received, unknown ones included.
    pub raw: Vec<(u64, u64)>,
}

impl PeerSettings {
    /// Decode a SETTINGS frame payload.
    pub fn decode(payload: &[u8]) -> Result<Self, SettingsError> {
        let mut settings = PeerSettings::default();
        let mut buf = payload;
        while !buf.is_empty() {
            let id = VarInt::decode(&mut buf)
                .map_err(|_| SettingsError::Malformed)?
                .into_inner();
            let value = VarInt::decode(&mut buf)
                .map_err(|_| SettingsError::Malformed)?
                .into_inner();
            match id {
                SETTINGS_ENABLE_WEBTRANSPORT => settings.enable_webtransport = value == 1,
                SETTINGS_ENABLE_CONNECT_PROTOCOL => {
                    settings.enable_connect_protocol = value == 1
                }
                SETTINGS_H3_DATAGRAM => settings.h3_datagram = value == 1,
                _ => {}
            }
            settings.raw.push((id, value));
        }
        Ok(settings)
    }

    pub fn supports_webtransport(&self) -> bool {
        self.enable_webtransport
    }
}

/// Encode the local control-stream prefix: the stream type followed by a
/// SETTINGS frame advertising WebTransport support. One buffer, one
/// write.
pub fn encode_local_settings() -> Vec<u8> {
    let mut payload = Vec::with_capacity(24);
    for (id, value) in [
        (SETTINGS_ENABLE_CONNECT_PROTOCOL, 1u64),
        (SETTINGS_H3_DATAGRAM, 1),
        (SETTINGS_ENABLE_WEBTRANSPORT, 1),
    ] {
        VarInt::try_from(id).expect("setting id fits a varint").encode(&mut payload);
        VarInt::try_from(value)
            .expect("setting value fits a varint")
            .encode(&mut payload);
    }

    let mut buf = Vec::with_capacity(payload.len() + 4);
    StreamType::CONTROL.0.encode(&mut buf);
    frame::encode_frame(FrameType::SETTINGS, &payload, &mut buf);
    buf
}

/// Open the local control stream on `conn` and send our SETTINGS.
///
/// The returned stream must be kept alive for the connection's lifetime;
/// closing the control stream is an HTTP/3 connection error.
pub(crate) async fn open_control(
    conn: &quinn::Connection,
) -> Result<quinn::SendStream, SettingsError> {
    let buf = encode_local_settings();
    let mut send = conn.open_uni().await?;
    send.write_all(&buf)
        .await
        .map_err(|e| match e {
            quinn::WriteError::ConnectionLost(e) => SettingsError::Connection(e),
            other => SettingsError::Write(other),
        })?;
    tracing::debug!("sent SETTINGS frame");
    Ok(send)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_settings_decode() {
        let buf = encode_local_settings();
        let mut slice = &buf[..];
        let ty = VarInt::decode(&mut slice).unwrap();
        assert_eq!(StreamType(ty), StreamType::CONTROL);
        let frame_ty = VarInt::decode(&mut slice).unwrap();
        assert_eq!(FrameType(frame_ty), FrameType::SETTINGS);
        let len = VarInt::decode(&mut slice).unwrap().into_inner() as usize;
        assert_eq!(len, slice.len());

        let settings = PeerSettings::decode(slice).unwrap();
        assert!(settings.supports_webtransport());
        assert!(settings.enable_connect_protocol);
        assert!(settings.h3_datagram);
    }

    #[test]
    fn missing_webtransport_setting() {
        let mut payload = Vec::new();
        VarInt::try_from(SETTINGS_H3_DATAGRAM).unwrap().encode(&mut payload);
        VarInt::from_u32(1).encode(&mut payload);
        let settings = PeerSettings::decode(&payload).unwrap();
        assert!(!settings.supports_webtransport());
    }

    #[test]
    fn truncated_payload() {
        // An id with no value.
        let mut payload = Vec::new();
        VarInt::try_from(SETTINGS_ENABLE_WEBTRANSPORT)
            .unwrap()
            .encode(&mut payload);
        assert!(matches!(
            PeerSettings::decode(&payload),
            Err(SettingsError::Malformed)
        ));
    }

    #[test]
    fn unknown_settings_are_kept_raw() {
        let mut payload = Vec::new();
        VarInt::from_u32(0x21).encode(&mut payload); // GREASE id
        VarInt::from_u32(99).encode(&mut payload);
        let settings = PeerSettings::decode(&payload).unwrap();
        assert_eq!(settings.raw, vec![(0x21, 99)]);
    }
}
