use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

use crate::codes::error_from_http3;
use crate::error::{ReadError, ReadExactError, ReadToEndError};
use crate::stream::Deadline;

/// A stream that can be used to receive bytes. See [`quinn::RecvStream`].
///
/// Error codes on this stream are WebTransport application codes; the
/// translation to and from the HTTP/3 reset space happens here.
#[derive(Debug)]
pub struct RecvStream {
    inner: quinn::RecvStream,
    deadline: Deadline,
}

impl RecvStream {
    pub(crate) fn new(stream: quinn::RecvStream) -> Self {
        Self {
            inner: stream,
            deadline: Deadline::new(),
        }
    }

    /// Tell the peer to stop sending with the given WebTransport error
    /// code.
    pub fn stop(&mut self, code: u32) -> Result<(), quinn::ClosedStream> {
        let code = crate::codes::error_to_http3(code);
        let code = quinn::VarInt::try_from(code).expect("mapped codes fit a varint");
        self.inner.stop(code)
    }

    /// Arm or disarm the read deadline. Reads past the deadline fail
    /// with [`ReadError::Timeout`]; a deadline already in the past fails
    /// the pending read immediately. `None` disarms.
    pub fn set_read_deadline(&self, deadline: Option<tokio::time::Instant>) {
        self.deadline.set(deadline);
    }

    /// Read some data into the buffer and return the amount read.
    /// `None` is the clean end of the stream.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(ReadError::Timeout),
            res = self.inner.read(buf) => res.map_err(Into::into),
        }
    }

    /// Fill the entire buffer with data.
    pub async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), ReadExactError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(ReadExactError::Read(ReadError::Timeout)),
            res = self.inner.read_exact(buf) => res.map_err(Into::into),
        }
    }

    /// Read the next chunk of data from the stream.
    pub async fn read_chunk(&mut self, max_length: usize) -> Result<Option<Bytes>, ReadError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(ReadError::Timeout),
            res = self.inner.read_chunk(max_length, true) => {
                res.map(|chunk| chunk.map(|c| c.bytes)).map_err(Into::into)
            }
        }
    }

    /// Read until the end of the stream or the size limit is hit.
    pub async fn read_to_end(&mut self, size_limit: usize) -> Result<Vec<u8>, ReadToEndError> {
        tokio::select! {
            biased;
            _ = self.deadline.expired() => Err(ReadToEndError::Read(ReadError::Timeout)),
            res = self.inner.read_to_end(size_limit) => res.map_err(Into::into),
        }
    }

    /// Block until the peer resets the stream and return the decoded
    /// code, or `None` if the stream finished cleanly first.
    pub async fn received_reset(&mut self) -> Result<Option<u32>, ReadError> {
        match self.inner.received_reset().await {
            Ok(None) => Ok(None),
            Ok(Some(code)) => match error_from_http3(code.into_inner()) {
                Some(code) => Ok(Some(code)),
                None => Err(ReadError::InvalidReset(code)),
            },
            Err(quinn::ResetError::ConnectionLost(e)) => Err(ReadError::Session(e.into())),
            Err(quinn::ResetError::ZeroRttRejected) => unreachable!("0-RTT not supported"),
        }
    }

    // The stream id is purposely not exposed: WebTransport stream ids
    // have HTTP/3-sized gaps in them.
}

impl AsyncRead for RecvStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
