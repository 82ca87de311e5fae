//! WebTransport is a protocol for client-server communication over QUIC.
//!
//! It's [available in the browser](https://caniuse.com/webtransport) as an
//! alternative to HTTP and WebSockets.
//!
//! WebTransport is layered on top of HTTP/3 which is then layered on top of
//! QUIC. This crate implements that layering over a [`quinn`] connection:
//! the SETTINGS exchange, the extended CONNECT handshake, and — the part
//! that earns its keep — multiplexing any number of concurrent sessions
//! over one connection. Incoming streams are classified by their leading
//! varint header and routed to the right session, even when a stream
//! arrives before the CONNECT response that creates its session; such
//! streams are buffered for a bounded reordering window.
//!
//! A [`Session`] hands out reliable bidirectional and unidirectional
//! streams and unreliable datagrams. Stream error codes are WebTransport
//! application codes; the translation to the HTTP/3 reset space is handled
//! by the stream adapters.
//!
//! The caller owns the [`quinn::Endpoint`] and its TLS setup; dial with a
//! [`Dialer`] or accept sessions with a [`Server`].

mod client;
mod codes;
mod connect;
mod driver;
mod error;
mod frame;
mod manager;
mod qpack;
mod recv;
mod send;
mod server;
mod session;
mod settings;
mod stream;
mod varint;
#[cfg(test)]
mod tests;

pub use client::Dialer;
pub use codes::{error_from_http3, error_to_http3, WEBTRANSPORT_BUFFERED_STREAM_REJECTED};
pub use connect::{ConnectError, ConnectRequest, ConnectResponse, WEBTRANSPORT_DRAFT_OFFER_HEADER};
pub use error::{
    ClientError, ReadError, ReadExactError, ReadToEndError, ServerError, SessionError, WriteError,
};
pub use manager::DEFAULT_REORDERING_TIMEOUT;
pub use recv::RecvStream;
pub use send::SendStream;
pub use server::{OriginCheck, Request, Server};
pub use session::Session;
pub use settings::{PeerSettings, SettingsError, SETTINGS_ENABLE_WEBTRANSPORT};
pub use stream::BidiStream;
pub use varint::VarInt;

/// The HTTP/3 ALPN is required when negotiating a QUIC connection.
pub const ALPN_H3: &str = "h3";

/// Re-export the http crate because it's in the public API.
pub use http;
/// Re-export quinn because the endpoints are configured by the caller.
pub use quinn;
/// Re-export the cancellation token taken by every blocking call.
pub use tokio_util::sync::CancellationToken;
