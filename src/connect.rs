use http::{HeaderMap, StatusCode};
use thiserror::Error;
use url::Url;

use crate::frame::{self, FrameType};
use crate::qpack::{self, QpackError};

/// The header a client adds to its extended CONNECT request.
pub const WEBTRANSPORT_DRAFT_OFFER_HEADER: &str = "sec-webtransport-http3-draft02";

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("expected a HEADERS frame, got {0:?}")]
    UnexpectedFrame(FrameType),

    #[error("qpack error")]
    Qpack(#[from] QpackError),

    #[error("missing or invalid {0} header")]
    InvalidHeader(&'static str),

    #[error("request is not an extended CONNECT")]
    NotConnect,

    #[error("connection error")]
    Connection(#[from] quinn::ConnectionError),

    #[error("read error")]
    Read(#[source] std::io::Error),

    #[error("write error")]
    Write(#[from] quinn::WriteError),
}

/// An extended CONNECT request: `:method = CONNECT`,
/// `:protocol = webtransport` plus the target URL and any user headers.
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

impl ConnectRequest {
    /// Encode the request as a HEADERS frame body.
    pub fn encode(&self) -> Vec<u8> {
        let authority = authority_of(&self.url);
        let mut path = self.url.path().to_string();
        if let Some(query) = self.url.query() {
            path.push('?');
            path.push_str(query);
        }

        let mut fields: Vec<(&str, &str)> = vec![
            (":method", "CONNECT"),
            (":scheme", "https"),
            (":authority", &authority),
            (":path", &path),
            (":protocol", "webtransport"),
            (WEBTRANSPORT_DRAFT_OFFER_HEADER, "1"),
        ];
        let extra: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        for (name, value) in &extra {
            fields.push((name, value));
        }
        qpack::encode_field_section(&fields)
    }

    /// Decode a request field section, validating the extended-CONNECT
    /// pseudo-headers.
    pub fn decode(fields: &[(String, String)]) -> Result<Self, ConnectError> {
        let mut method = None;
        let mut scheme = None;
        let mut authority = None;
        let mut path = None;
        let mut protocol = None;
        let mut headers = HeaderMap::new();

        for (name, value) in fields {
            match name.as_str() {
                ":method" => method = Some(value.as_str()),
                ":scheme" => scheme = Some(value.as_str()),
                ":authority" => authority = Some(value.as_str()),
                ":path" => path = Some(value.as_str()),
                ":protocol" => protocol = Some(value.as_str()),
                name if name.starts_with(':') => {}
                name => {
                    let header = http::HeaderName::try_from(name)
                        .ok()
                        .zip(http::HeaderValue::try_from(value.as_str()).ok());
                    if let Some((name, value)) = header {
                        headers.append(name, value);
                    }
                }
            }
        }

        if method != Some("CONNECT") || protocol != Some("webtransport") {
            return Err(ConnectError::NotConnect);
        }
        let scheme = scheme.unwrap_or("https");
        let authority = authority.ok_or(ConnectError::InvalidHeader(":authority"))?;
        let path = path.ok_or(ConnectError::InvalidHeader(":path"))?;
        let url: Url = format!("{scheme}://{authority}{path}")
            .parse()
            .map_err(|_| ConnectError::InvalidHeader(":path"))?;

        Ok(Self { url, headers })
    }

    /// The `origin` header, if the client sent one.
    pub fn origin(&self) -> Option<&str> {
        self.headers
            .get(http::header::ORIGIN)
            .and_then(|v| v.to_str().ok())
    }
}

/// A CONNECT response: a status code and any response headers.
#[derive(Debug, Clone)]
pub struct ConnectResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl ConnectResponse {
    pub fn encode(&self) -> Vec<u8> {
        let status = self.status.as_str().to_string();
        let mut fields: Vec<(&str, &str)> = vec![(":status", &status)];
        let extra: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).to_string(),
                )
            })
            .collect();
        for (name, value) in &extra {
            fields.push((name, value));
        }
        qpack::encode_field_section(&fields)
    }

    pub fn decode(fields: &[(String, String)]) -> Result<Self, ConnectError> {
        let mut status = None;
        let mut headers = HeaderMap::new();
        for (name, value) in fields {
            match name.as_str() {
                ":status" => {
                    status = value.parse::<u16>().ok().and_then(|s| StatusCode::from_u16(s).ok())
                }
                name if name.starts_with(':') => {}
                name => {
                    let header = http::HeaderName::try_from(name)
                        .ok()
                        .zip(http::HeaderValue::try_from(value.as_str()).ok());
                    if let Some((name, value)) = header {
                        headers.append(name, value);
                    }
                }
            }
        }
        let status = status.ok_or(ConnectError::InvalidHeader(":status"))?;
        Ok(Self { status, headers })
    }
}

/// The CONNECT stream of an established or in-progress session.
///
/// Holding it keeps the request stream open; the session id is its QUIC
/// stream id.
#[derive(Debug)]
pub(crate) struct Connect {
    send: quinn::SendStream,
    recv: quinn::RecvStream,
}

impl Connect {
    /// Client side: open the request stream, send the CONNECT, await the
    /// response.
    pub(crate) async fn open(
        conn: &quinn::Connection,
        request: &ConnectRequest,
    ) -> Result<(Self, http::Response<()>), ConnectError> {
        let (mut send, mut recv) = conn.open_bi().await?;

        tracing::debug!(url = %request.url, "sending CONNECT request");
        let mut buf = Vec::new();
        frame::encode_frame(FrameType::HEADERS, &request.encode(), &mut buf);
        send.write_all(&buf).await?;

        let response = read_headers_frame(&mut recv).await?;
        let response = ConnectResponse::decode(&response)?;
        tracing::debug!(status = %response.status, "received CONNECT response");

        let mut http_response = http::Response::builder().status(response.status);
        if let Some(headers) = http_response.headers_mut() {
            headers.extend(response.headers.clone());
        }
        let http_response = http_response
            .body(())
            .map_err(|_| ConnectError::InvalidHeader(":status"))?;

        Ok((Self { send, recv }, http_response))
    }

    /// Server side: take over an accepted request stream whose HEADERS
    /// frame the driver already consumed, and answer it.
    pub(crate) fn accepted(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self { send, recv }
    }

    pub(crate) async fn respond(&mut self, status: StatusCode) -> Result<(), ConnectError> {
        let response = ConnectResponse {
            status,
            headers: HeaderMap::new(),
        };
        tracing::debug!(%status, "sending CONNECT response");
        let mut buf = Vec::new();
        frame::encode_frame(FrameType::HEADERS, &response.encode(), &mut buf);
        self.send.write_all(&buf).await?;
        Ok(())
    }

    /// Gracefully end the request stream, flushing anything queued.
    /// Dropping an unfinished quinn stream would reset it and could
    /// discard a response still in flight.
    pub(crate) fn finish(&mut self) {
        let _ = self.send.finish();
    }

    /// The session id is the stream id of the CONNECT request stream.
    pub(crate) fn session_id(&self) -> u64 {
        quinn::VarInt::from(self.send.id()).into_inner()
    }

    pub(crate) fn into_parts(self) -> (quinn::SendStream, quinn::RecvStream) {
        (self.send, self.recv)
    }
}

/// Read one HEADERS frame and decode its field section. Unknown frames
/// ahead of it (GREASE) are skipped.
pub(crate) async fn read_headers_frame(
    recv: &mut quinn::RecvStream,
) -> Result<Vec<(String, String)>, ConnectError> {
    loop {
        let (ty, len) = frame::read_frame_header(recv)
            .await
            .map_err(ConnectError::Read)?;
        if ty != FrameType::HEADERS {
            if ty == FrameType::DATA || ty == FrameType::SETTINGS {
                return Err(ConnectError::UnexpectedFrame(ty));
            }
            // Skip reserved/GREASE frames.
            frame::read_frame_payload(recv, len)
                .await
                .map_err(ConnectError::Read)?;
            continue;
        }
        let payload = frame::read_frame_payload(recv, len)
            .await
            .map_err(ConnectError::Read)?;
        return Ok(qpack::decode_field_section(&payload)?);
    }
}

fn authority_of(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default();
    match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => format!("{host}:443"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrip() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ORIGIN, "https://example.com".parse().unwrap());
        let request = ConnectRequest {
            url: "https://example.com:4433/chat?room=1".parse().unwrap(),
            headers,
        };
        let block = request.encode();
        let fields = qpack::decode_field_section(&block).unwrap();
        let decoded = ConnectRequest::decode(&fields).unwrap();
        assert_eq!(decoded.url.as_str(), "https://example.com:4433/chat?room=1");
        assert_eq!(decoded.origin(), Some("https://example.com"));
        assert_eq!(
            decoded.headers.get(WEBTRANSPORT_DRAFT_OFFER_HEADER).unwrap(),
            "1"
        );
    }

    #[test]
    fn response_roundtrip() {
        let response = ConnectResponse {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
        };
        let block = response.encode();
        let fields = qpack::decode_field_section(&block).unwrap();
        let decoded = ConnectResponse::decode(&fields).unwrap();
        assert_eq!(decoded.status, StatusCode::OK);
    }

    #[test]
    fn rejects_plain_get() {
        let fields = vec![
            (":method".to_string(), "GET".to_string()),
            (":scheme".to_string(), "https".to_string()),
            (":authority".to_string(), "example.com".to_string()),
            (":path".to_string(), "/".to_string()),
        ];
        assert!(matches!(
            ConnectRequest::decode(&fields),
            Err(ConnectError::NotConnect)
        ));
    }
}
