use std::{
    collections::VecDeque,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex, Weak},
};

use bytes::{Bytes, BytesMut};
use futures::FutureExt;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::connect::Connect;
use crate::error::SessionError;
use crate::frame;
use crate::manager::SessionManager;
use crate::{BidiStream, RecvStream, SendStream};

/// How many received datagrams a session buffers before dropping new
/// arrivals.
pub(crate) const DATAGRAM_QUEUE_LEN: usize = 128;

/// An established WebTransport session.
///
/// A session multiplexes its streams and datagrams over a shared QUIC
/// connection:
///   1. Each stream starts with a varint header naming the stream type
///      and the session it belongs to.
///   2. Stream error codes are WebTransport application codes, transposed
///      into the HTTP/3 reset space on the wire.
///   3. Stream ids have gaps in them, used by HTTP/3 transparently to
///      the application.
///
/// Cloning is cheap and all clones refer to the same session. Every
/// blocking method takes a caller-side [`CancellationToken`]; the
/// session's own lifetime is observable through [`Session::closed`].
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn new(
        conn: quinn::Connection,
        connect: Connect,
        manager: Arc<SessionManager>,
    ) -> Self {
        let session_id = connect.session_id();
        let (connect_send, connect_recv) = connect.into_parts();

        let (datagram_tx, datagram_rx) = mpsc::channel(DATAGRAM_QUEUE_LEN);
        let inner = Arc::new(SessionInner {
            session_id,
            conn: conn.clone(),
            header_bi: frame::bidi_stream_header(session_id),
            header_uni: frame::uni_stream_header(session_id),
            header_datagram: frame::datagram_header(session_id),
            cancel: CancellationToken::new(),
            bidi: AcceptQueue::default(),
            uni: AcceptQueue::default(),
            datagram_tx,
            datagram_rx: tokio::sync::Mutex::new(datagram_rx),
            connect_send: Mutex::new(Some(connect_send)),
            manager,
        });

        // Watch the CONNECT stream and the connection so the session's
        // cancellation fires when either goes away.
        let weak = Arc::downgrade(&inner);
        let cancel = inner.cancel.clone();
        tokio::spawn(async move {
            let mut connect_recv = connect_recv;
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = conn.closed() => {
                    tracing::debug!("session connection closed");
                }
                _ = drain_connect(&mut connect_recv) => {
                    tracing::debug!("peer closed the CONNECT stream");
                }
            }
            if let Some(inner) = weak.upgrade() {
                inner.shutdown();
            }
        });

        Self { inner }
    }

    /// The session id: the QUIC stream id of the CONNECT stream.
    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    /// Accept the next incoming bidirectional stream, in the order the
    /// peer's streams arrived.
    pub async fn accept_bi(&self, cancel: &CancellationToken) -> Result<BidiStream, SessionError> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(SessionError::SessionClosed);
            }
            if let Some((send, recv)) = self.inner.bidi.pop() {
                return Ok(BidiStream::new(send, recv));
            }
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(SessionError::SessionClosed),
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = self.inner.bidi.wait() => {}
            }
        }
    }

    /// Accept the next incoming unidirectional stream.
    pub async fn accept_uni(&self, cancel: &CancellationToken) -> Result<RecvStream, SessionError> {
        loop {
            if self.inner.cancel.is_cancelled() {
                return Err(SessionError::SessionClosed);
            }
            if let Some(recv) = self.inner.uni.pop() {
                return Ok(RecvStream::new(recv));
            }
            tokio::select! {
                biased;
                _ = self.inner.cancel.cancelled() => return Err(SessionError::SessionClosed),
                _ = cancel.cancelled() => return Err(SessionError::Cancelled),
                _ = self.inner.uni.wait() => {}
            }
        }
    }

    /// Open a bidirectional stream without waiting for stream credit.
    ///
    /// Fails with [`SessionError::StreamsExhausted`] when the peer's
    /// stream limit has been reached; use [`Session::open_bi_sync`] to
    /// wait instead.
    pub async fn open_bi(&self) -> Result<BidiStream, SessionError> {
        let (mut send, recv) = match self.inner.conn.open_bi().now_or_never() {
            Some(res) => res?,
            None => return Err(SessionError::StreamsExhausted),
        };
        self.inner.write_header(&mut send, true).await?;
        Ok(BidiStream::new(send, recv))
    }

    /// Open a bidirectional stream, waiting for stream credit if
    /// necessary.
    ///
    /// Once credit is granted the stream header write is no longer
    /// cancellable; cancellation is only observed while waiting.
    pub async fn open_bi_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<BidiStream, SessionError> {
        let (mut send, recv) = tokio::select! {
            res = self.inner.conn.open_bi() => res?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(SessionError::SessionClosed),
        };
        self.inner.write_header(&mut send, true).await?;
        Ok(BidiStream::new(send, recv))
    }

    /// Open a unidirectional stream without waiting for stream credit.
    pub async fn open_uni(&self) -> Result<SendStream, SessionError> {
        let mut send = match self.inner.conn.open_uni().now_or_never() {
            Some(res) => res?,
            None => return Err(SessionError::StreamsExhausted),
        };
        self.inner.write_header(&mut send, false).await?;
        Ok(SendStream::new(send))
    }

    /// Open a unidirectional stream, waiting for stream credit if
    /// necessary. See [`Session::open_bi_sync`] for cancellation
    /// caveats.
    pub async fn open_uni_sync(
        &self,
        cancel: &CancellationToken,
    ) -> Result<SendStream, SessionError> {
        let mut send = tokio::select! {
            res = self.inner.conn.open_uni() => res?,
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = self.inner.cancel.cancelled() => return Err(SessionError::SessionClosed),
        };
        self.inner.write_header(&mut send, false).await?;
        Ok(SendStream::new(send))
    }

    /// Send one datagram, prefixed with this session's id.
    ///
    /// Datagrams are unreliable and must fit within
    /// [`Session::max_datagram_size`].
    pub fn send_datagram(&self, data: Bytes) -> Result<(), SessionError> {
        if self.inner.cancel.is_cancelled() {
            return Err(SessionError::SessionClosed);
        }
        // The prefix forces a copy; quinn takes a single contiguous
        // buffer.
        let mut buf = BytesMut::with_capacity(self.inner.header_datagram.len() + data.len());
        buf.extend_from_slice(&self.inner.header_datagram);
        buf.extend_from_slice(&data);
        self.inner
            .conn
            .send_datagram(buf.freeze())
            .map_err(|e| match e {
                quinn::SendDatagramError::TooLarge => SessionError::DatagramTooLarge,
                other => SessionError::SendDatagram(other),
            })
    }

    /// Receive one datagram addressed to this session, in arrival order.
    pub async fn receive_datagram(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Bytes, SessionError> {
        tokio::select! {
            biased;
            _ = self.inner.cancel.cancelled() => Err(SessionError::SessionClosed),
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            data = async {
                let mut rx = self.inner.datagram_rx.lock().await;
                rx.recv().await
            } => data.ok_or(SessionError::SessionClosed),
        }
    }

    /// The largest datagram payload [`Session::send_datagram`] accepts.
    pub fn max_datagram_size(&self) -> usize {
        let mtu = self
            .inner
            .conn
            .max_datagram_size()
            .expect("datagram support is required");
        mtu.saturating_sub(self.inner.header_datagram.len())
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.inner.conn.remote_address()
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.inner.conn.local_ip()
    }

    /// A token that fires when the session closes; the analog of a
    /// session-scoped context.
    pub fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Wait until the session is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Close the session: fire its cancellation, close the CONNECT
    /// stream, and deregister it. Idempotent.
    ///
    /// Streams already accepted or queued are not reset; they live until
    /// the peer or the connection tears them down.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.inner.session_id)
            .field("remote", &self.inner.conn.remote_address())
            .finish()
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.inner.conn.stable_id() == other.inner.conn.stable_id()
            && self.inner.session_id == other.inner.session_id
    }
}

impl Eq for Session {}

pub(crate) struct SessionInner {
    session_id: u64,
    conn: quinn::Connection,

    // The tiny headers written in front of everything we send, cached
    // per session.
    header_bi: Vec<u8>,
    header_uni: Vec<u8>,
    header_datagram: Vec<u8>,

    cancel: CancellationToken,

    bidi: AcceptQueue<(quinn::SendStream, quinn::RecvStream)>,
    uni: AcceptQueue<quinn::RecvStream>,

    datagram_tx: mpsc::Sender<Bytes>,
    datagram_rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,

    connect_send: Mutex<Option<quinn::SendStream>>,

    manager: Arc<SessionManager>,
}

impl SessionInner {
    /// Queue an incoming bidirectional stream for [`Session::accept_bi`].
    pub(crate) fn add_stream(&self, send: quinn::SendStream, recv: quinn::RecvStream) {
        self.bidi.push((send, recv));
    }

    /// Queue an incoming unidirectional stream for
    /// [`Session::accept_uni`].
    pub(crate) fn add_uni_stream(&self, recv: quinn::RecvStream) {
        self.uni.push(recv);
    }

    /// Deliver a datagram payload (session-id prefix already stripped).
    /// New datagrams are dropped when the queue is full.
    pub(crate) fn handle_datagram(&self, data: Bytes) {
        if let Err(mpsc::error::TrySendError::Full(data)) = self.datagram_tx.try_send(data) {
            tracing::warn!(
                session_id = self.session_id,
                len = data.len(),
                "datagram queue full, discarding datagram"
            );
        }
    }

    pub(crate) fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        if let Some(mut send) = self.connect_send.lock().unwrap().take() {
            let _ = send.finish();
        }
        self.manager
            .remove_session(self.conn.stable_id(), self.session_id);
    }

    async fn write_header(
        &self,
        send: &mut quinn::SendStream,
        bidi: bool,
    ) -> Result<(), SessionError> {
        let header = if bidi { &self.header_bi } else { &self.header_uni };
        // The header is written at maximum priority so application data
        // queued right after cannot get ahead of it.
        send.set_priority(i32::MAX).ok();
        let res = match send.write_all(header).await {
            Ok(()) => Ok(()),
            Err(quinn::WriteError::ConnectionLost(e)) => Err(SessionError::Connection(e)),
            Err(e) => Err(SessionError::StreamHeader(e)),
        };
        send.set_priority(0).ok();
        res
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        // Last handle gone; make sure waiters and the manager entry are
        // released even without an explicit close().
        if !self.cancel.is_cancelled() {
            self.cancel.cancel();
            self.manager
                .remove_session(self.conn.stable_id(), self.session_id);
        }
    }
}

pub(crate) type WeakSession = Weak<SessionInner>;

/// A FIFO queue of not-yet-accepted streams.
///
/// There is no explicit bound; the length is implicitly limited by the
/// stream flow control credit we extend over QUIC.
#[derive(Debug)]
struct AcceptQueue<T> {
    queue: Mutex<VecDeque<T>>,
    // One-slot wake signal: one notify per push, waiters re-check the
    // queue and park again on a spurious wake.
    signal: Notify,
}

impl<T> Default for AcceptQueue<T> {
    fn default() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            signal: Notify::new(),
        }
    }
}

impl<T> AcceptQueue<T> {
    fn push(&self, item: T) {
        self.queue.lock().unwrap().push_back(item);
        self.signal.notify_one();
    }

    fn pop(&self) -> Option<T> {
        self.queue.lock().unwrap().pop_front()
    }

    async fn wait(&self) {
        self.signal.notified().await;
    }
}

async fn drain_connect(recv: &mut quinn::RecvStream) {
    let mut buf = [0u8; 64];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}
