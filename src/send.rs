use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::codes::error_from_http3;
use crate::error::WriteError;
use crate::stream::Deadline;

/// A stream that can be used to send bytes. See [`quinn::SendStream`].
///
/// Error codes on this stream are WebTransport application codes; the
/// translation to and from the HTTP/3 reset space happens here.
#[derive(Debug)]
pub struct SendStream {
    inner: quinn::SendStream,
    deadline: Deadline,
}

impl SendStream {
    pub(crate) fn new(stream: quinn::SendStream) -> Self {
        Self {
            inner: stream,
            deadline: Deadline::new(),
        }
    }

    /// Abort the stream with the given WebTransport error code.
    pub fn reset(&mut self, code: u32) -> Result<(), quinn::ClosedStream> {
        let code = crate::codes::error_to_http3(code);
        let code = quinn::VarInt::try_from(code).expect("mapped codes fit a varint");
        self.inner.reset(code)
    }

    /// Arm or disarm the write deadline. Writes past the deadline fail
    /// with [`WriteError::Timeout`]; a deadline already in the past
    /// fails the pending write immediately. `None` disarms.
    pub fn set_write_deadline(&self, deadline: Option<tokio::time::Instant>) {
        self.deadline.set(deadline);
    }

    /// Write some data and return the amount accepted.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(WriteError::Timeout),
            res = self.inner.write(buf) => res.map_err(Into::into),
        }
    }

    /// Write the whole buffer.
    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(WriteError::Timeout),
            res = self.inner.write_all(buf) => res.map_err(Into::into),
        }
    }

    /// Write a chunk without copying it.
    pub async fn write_chunk(&mut self, buf: Bytes) -> Result<(), WriteError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(WriteError::Timeout),
            res = self.inner.write_chunk(buf) => res.map_err(Into::into),
        }
    }

    /// Half-close: send a FIN after all queued data. The receive side of
    /// a bidirectional stream is unaffected.
    pub fn finish(&mut self) -> Result<(), quinn::ClosedStream> {
        self.inner.finish()
    }

    /// Block until the peer sends STOP_SENDING and return the decoded
    /// code, or `None` if the stream was finished first.
    pub async fn stopped(&mut self) -> Result<Option<u32>, WriteError> {
        match self.inner.stopped().await {
            Ok(None) => Ok(None),
            Ok(Some(code)) => match error_from_http3(code.into_inner()) {
                Some(code) => Ok(Some(code)),
                None => Err(WriteError::InvalidStopped(code)),
            },
            Err(quinn::StoppedError::ConnectionLost(e)) => Err(WriteError::Session(e.into())),
            Err(quinn::StoppedError::ZeroRttRejected) => unreachable!("0-RTT not supported"),
        }
    }

    /// Set this stream's priority relative to other streams on the same
    /// connection. Higher is sent first; the default is 0.
    pub fn set_priority(&self, priority: i32) -> Result<(), quinn::ClosedStream> {
        self.inner.set_priority(priority)
    }
}

impl AsyncWrite for SendStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        <quinn::SendStream as AsyncWrite>::poll_write(Pin::new(&mut self.inner), cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <quinn::SendStream as AsyncWrite>::poll_flush(Pin::new(&mut self.inner), cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        <quinn::SendStream as AsyncWrite>::poll_shutdown(Pin::new(&mut self.inner), cx)
    }
}
