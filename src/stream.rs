use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;
use tokio::time::Instant;

use crate::error::{ReadError, WriteError};
use crate::{RecvStream, SendStream};

/// A bidirectional WebTransport stream: a [`SendStream`] and a
/// [`RecvStream`] over the same QUIC stream.
#[derive(Debug)]
pub struct BidiStream {
    send: SendStream,
    recv: RecvStream,
}

impl BidiStream {
    pub(crate) fn new(send: quinn::SendStream, recv: quinn::RecvStream) -> Self {
        Self {
            send: SendStream::new(send),
            recv: RecvStream::new(recv),
        }
    }

    /// Split into independently-owned halves, e.g. to read and write
    /// from different tasks.
    pub fn split(self) -> (SendStream, RecvStream) {
        (self.send, self.recv)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<Option<usize>, ReadError> {
        self.recv.read(buf).await
    }

    pub async fn read_to_end(
        &mut self,
        size_limit: usize,
    ) -> Result<Vec<u8>, crate::error::ReadToEndError> {
        self.recv.read_to_end(size_limit).await
    }

    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, WriteError> {
        self.send.write(buf).await
    }

    pub async fn write_all(&mut self, buf: &[u8]) -> Result<(), WriteError> {
        self.send.write_all(buf).await
    }

    /// Half-close the send side; the receive side stays open until the
    /// peer finishes or [`Self::stop`] is called.
    pub fn finish(&mut self) -> Result<(), quinn::ClosedStream> {
        self.send.finish()
    }

    /// Abort the send side with a WebTransport error code.
    pub fn reset(&mut self, code: u32) -> Result<(), quinn::ClosedStream> {
        self.send.reset(code)
    }

    /// Abort the receive side with a WebTransport error code.
    pub fn stop(&mut self, code: u32) -> Result<(), quinn::ClosedStream> {
        self.recv.stop(code)
    }

    /// Arm or disarm both deadlines at once.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.send.set_write_deadline(deadline);
        self.recv.set_read_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.recv.set_read_deadline(deadline);
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.send.set_write_deadline(deadline);
    }

    pub fn send_mut(&mut self) -> &mut SendStream {
        &mut self.send
    }

    pub fn recv_mut(&mut self) -> &mut RecvStream {
        &mut self.recv
    }
}

impl AsyncRead for BidiStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for BidiStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// A rearmable wall-clock deadline shared between a stream adapter and
/// its pending operations.
///
/// Rearming interrupts an in-flight operation: setting a deadline in the
/// past fails it immediately, setting `None` lets it continue.
#[derive(Debug)]
pub(crate) struct Deadline {
    tx: watch::Sender<Option<Instant>>,
}

impl Deadline {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn set(&self, deadline: Option<Instant>) {
        self.tx.send_replace(deadline);
    }

    /// Resolves once an armed deadline has passed. Never resolves while
    /// disarmed.
    pub(crate) async fn expired(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            let deadline = *rx.borrow_and_update();
            match deadline {
                None => {
                    if rx.changed().await.is_err() {
                        std::future::pending::<()>().await;
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => return,
                        res = rx.changed() => {
                            if res.is_err() {
                                std::future::pending::<()>().await;
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_and_disarms() {
        let deadline = Deadline::new();

        // Disarmed: never fires.
        tokio::select! {
            _ = deadline.expired() => panic!("disarmed deadline fired"),
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        // Armed in the future.
        deadline.set(Some(Instant::now() + Duration::from_millis(100)));
        tokio::time::timeout(Duration::from_secs(1), deadline.expired())
            .await
            .expect("armed deadline fired");

        // Past deadlines fire immediately.
        deadline.set(Some(Instant::now() - Duration::from_secs(1)));
        tokio::time::timeout(Duration::from_millis(1), deadline.expired())
            .await
            .expect("past deadline fires immediately");

        // Disarming mid-wait parks the waiter again.
        deadline.set(Some(Instant::now() + Duration::from_millis(50)));
        let expired = deadline.expired();
        tokio::pin!(expired);
        deadline.set(None);
        tokio::select! {
            _ = &mut expired => panic!("disarmed deadline fired"),
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
}
