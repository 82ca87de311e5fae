use http::StatusCode;
use thiserror::Error;

use crate::codes::error_from_http3;
use crate::connect::ConnectError;
use crate::settings::SettingsError;

/// An error returned when dialing a WebTransport endpoint.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("failed to resolve host")]
    Resolve(#[source] std::io::Error),

    #[error("failed to connect")]
    Connect(#[from] quinn::ConnectError),

    #[error("connection failed")]
    Connection(#[from] quinn::ConnectionError),

    #[error("failed to exchange h3 settings")]
    Settings(#[from] SettingsError),

    #[error("failed to exchange h3 connect")]
    Http(#[from] ConnectError),

    /// The server answered the CONNECT with a non-2xx status. The
    /// response is attached so the caller can inspect it.
    #[error("received status {}", .0.status())]
    ErrorStatus(http::Response<()>),

    #[error("dial cancelled")]
    Cancelled,
}

/// An error returned while accepting or upgrading an incoming session.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("failed to exchange h3 connect")]
    Http(#[from] ConnectError),

    #[error("origin not allowed")]
    OriginRejected,
}

/// An error returned by [`crate::Session`] operations, split between
/// underlying QUIC failures and session lifecycle outcomes.
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// The caller-supplied cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// The session itself was closed, locally or by the peer.
    #[error("session closed")]
    SessionClosed,

    /// QUIC stream credit is exhausted; try the `_sync` variant.
    #[error("too many open streams")]
    StreamsExhausted,

    #[error("datagram too large")]
    DatagramTooLarge,

    #[error("datagram send error")]
    SendDatagram(#[from] quinn::SendDatagramError),

    #[error("failed to write the stream header")]
    StreamHeader(#[source] quinn::WriteError),

    #[error("connection error")]
    Connection(#[from] quinn::ConnectionError),
}

/// An error when writing to [`crate::SendStream`]. Mirrors
/// [`quinn::WriteError`] with the stop code translated into the
/// WebTransport space.
#[derive(Error, Debug, Clone)]
pub enum WriteError {
    /// The peer is no longer reading; carries the decoded WebTransport
    /// code.
    #[error("STOP_SENDING: {0}")]
    Stopped(u32),

    /// The peer stopped the stream with a code outside the WebTransport
    /// range; the raw HTTP/3 code is preserved.
    #[error("invalid STOP_SENDING: {0}")]
    InvalidStopped(quinn::VarInt),

    #[error("write deadline expired")]
    Timeout,

    #[error("session error")]
    Session(#[from] SessionError),

    #[error("stream closed")]
    ClosedStream,
}

impl From<quinn::WriteError> for WriteError {
    fn from(e: quinn::WriteError) -> Self {
        match e {
            quinn::WriteError::Stopped(code) => match error_from_http3(code.into_inner()) {
                Some(code) => WriteError::Stopped(code),
                None => WriteError::InvalidStopped(code),
            },
            quinn::WriteError::ClosedStream => WriteError::ClosedStream,
            quinn::WriteError::ConnectionLost(e) => WriteError::Session(e.into()),
            quinn::WriteError::ZeroRttRejected => unreachable!("0-RTT not supported"),
        }
    }
}

impl From<quinn::ClosedStream> for WriteError {
    fn from(_: quinn::ClosedStream) -> Self {
        WriteError::ClosedStream
    }
}

/// An error when reading from [`crate::RecvStream`]. Mirrors
/// [`quinn::ReadError`] with the reset code translated into the
/// WebTransport space.
#[derive(Error, Debug, Clone)]
pub enum ReadError {
    /// The peer reset the stream; carries the decoded WebTransport code.
    #[error("RESET_STREAM: {0}")]
    Reset(u32),

    /// The peer reset the stream with a code outside the WebTransport
    /// range; the raw HTTP/3 code is preserved.
    #[error("invalid RESET_STREAM: {0}")]
    InvalidReset(quinn::VarInt),

    #[error("read deadline expired")]
    Timeout,

    #[error("session error")]
    Session(#[from] SessionError),

    #[error("stream already closed")]
    ClosedStream,
}

impl From<quinn::ReadError> for ReadError {
    fn from(e: quinn::ReadError) -> Self {
        match e {
            quinn::ReadError::Reset(code) => match error_from_http3(code.into_inner()) {
                Some(code) => ReadError::Reset(code),
                None => ReadError::InvalidReset(code),
            },
            quinn::ReadError::ConnectionLost(e) => ReadError::Session(e.into()),
            quinn::ReadError::ClosedStream => ReadError::ClosedStream,
            quinn::ReadError::IllegalOrderedRead => {
                unreachable!("unordered reads are not used")
            }
            quinn::ReadError::ZeroRttRejected => unreachable!("0-RTT not supported"),
        }
    }
}

/// An error returned by [`crate::RecvStream::read_exact`].
#[derive(Error, Debug, Clone)]
pub enum ReadExactError {
    #[error("finished early ({0} bytes short)")]
    FinishedEarly(usize),

    #[error("read error")]
    Read(#[from] ReadError),
}

impl From<quinn::ReadExactError> for ReadExactError {
    fn from(e: quinn::ReadExactError) -> Self {
        match e {
            quinn::ReadExactError::FinishedEarly(n) => ReadExactError::FinishedEarly(n),
            quinn::ReadExactError::ReadError(e) => ReadExactError::Read(e.into()),
        }
    }
}

/// An error returned by [`crate::RecvStream::read_to_end`].
#[derive(Error, Debug, Clone)]
pub enum ReadToEndError {
    #[error("stream longer than the size limit")]
    TooLong,

    #[error("read error")]
    Read(#[from] ReadError),
}

impl From<quinn::ReadToEndError> for ReadToEndError {
    fn from(e: quinn::ReadToEndError) -> Self {
        match e {
            quinn::ReadToEndError::TooLong => ReadToEndError::TooLong,
            quinn::ReadToEndError::Read(e) => ReadToEndError::Read(e.into()),
        }
    }
}

pub(crate) fn status_is_success(status: StatusCode) -> bool {
    (200..300).contains(&status.as_u16())
}
