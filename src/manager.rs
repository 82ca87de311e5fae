//! Routing of incoming streams and datagrams to their sessions.
//!
//! A QUIC connection can carry several WebTransport sessions at once,
//! and a stream for a session can arrive before the CONNECT exchange
//! that establishes the session has finished. The manager keeps a map
//! from `(connection, session id)` to the session (or to a pending
//! placeholder) and parks early streams until the session shows up or a
//! reordering timeout expires.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::{Buf, Bytes};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::codes::WEBTRANSPORT_BUFFERED_STREAM_REJECTED;
use crate::session::WeakSession;
use crate::varint::VarInt;

/// How long an incoming stream waits for its session before being
/// rejected.
pub const DEFAULT_REORDERING_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct SessionKey {
    conn: usize,
    id: u64,
}

/// Map entry for a session that is established, being established, or
/// merely anticipated by early streams.
struct PendingSession {
    // Signaled once a session object attaches; parked streams watch it.
    created: watch::Sender<bool>,
    // Streams currently parked against this entry. The entry may only
    // be dropped once no waiter remains and no session is attached.
    waiters: usize,
    session: Option<WeakSession>,
}

impl PendingSession {
    fn new() -> Self {
        let (created, _) = watch::channel(false);
        Self {
            created,
            waiters: 0,
            session: None,
        }
    }
}

enum Parked {
    Bidi(quinn::SendStream, quinn::RecvStream),
    Uni(quinn::RecvStream),
}

impl Parked {
    fn reject(&mut self) {
        match self {
            Parked::Bidi(send, recv) => {
                send.reset(WEBTRANSPORT_BUFFERED_STREAM_REJECTED).ok();
                recv.stop(WEBTRANSPORT_BUFFERED_STREAM_REJECTED).ok();
            }
            Parked::Uni(recv) => {
                recv.stop(WEBTRANSPORT_BUFFERED_STREAM_REJECTED).ok();
            }
        }
    }
}

pub(crate) struct SessionManager {
    timeout: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
    state: Mutex<ManagerState>,
}

struct ManagerState {
    sessions: HashMap<SessionKey, PendingSession>,
    // Connections with a running datagram pump.
    conns: HashSet<usize>,
}

impl SessionManager {
    pub(crate) fn new(timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            timeout,
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            state: Mutex::new(ManagerState {
                sessions: HashMap::new(),
                conns: HashSet::new(),
            }),
        })
    }

    /// Route an incoming bidirectional stream to the session `id` on
    /// `conn`, parking it if the session is not established yet.
    pub(crate) fn add_stream(
        self: &Arc<Self>,
        conn: &quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
        id: u64,
    ) {
        self.route(conn, Parked::Bidi(send, recv), id);
    }

    /// As [`Self::add_stream`], for unidirectional streams.
    pub(crate) fn add_uni_stream(
        self: &Arc<Self>,
        conn: &quinn::Connection,
        recv: quinn::RecvStream,
        id: u64,
    ) {
        self.route(conn, Parked::Uni(recv), id);
    }

    fn route(self: &Arc<Self>, conn: &quinn::Connection, parked: Parked, id: u64) {
        let key = SessionKey {
            conn: conn.stable_id(),
            id,
        };

        let mut state = self.state.lock().unwrap();
        let entry = state
            .sessions
            .entry(key)
            .or_insert_with(PendingSession::new);

        if let Some(session) = entry.session.as_ref().and_then(Weak::upgrade) {
            // The queue push happens outside the map lock; dropping a
            // session handle must never happen under it.
            drop(state);
            match parked {
                Parked::Bidi(send, recv) => session.add_stream(send, recv),
                Parked::Uni(recv) => session.add_uni_stream(recv),
            }
            return;
        }

        // No session yet: park the stream. Each parked stream gets its
        // own reordering timer.
        entry.waiters += 1;
        let created = entry.created.subscribe();
        drop(state);

        let manager = Arc::clone(self);
        self.tasks.spawn(manager.park(key, created, parked));
    }

    async fn park(
        self: Arc<Self>,
        key: SessionKey,
        mut created: watch::Receiver<bool>,
        mut parked: Parked,
    ) {
        // Only `created`, the timer and manager shutdown may be observed
        // here; the session (and its cancellation) is untouchable until
        // `created` fires.
        let deliver = tokio::select! {
            res = created.wait_for(|attached| *attached) => res.is_ok(),
            _ = tokio::time::sleep(self.timeout) => {
                tracing::debug!(
                    session_id = key.id,
                    "rejecting stream that waited too long for its session"
                );
                parked.reject();
                false
            }
            _ = self.cancel.cancelled() => false,
        };

        let session = {
            let mut state = self.state.lock().unwrap();
            let mut remove = false;
            let mut session = None;
            if let Some(entry) = state.sessions.get_mut(&key) {
                if deliver {
                    session = entry.session.as_ref().and_then(Weak::upgrade);
                }
                entry.waiters -= 1;
                // Once nothing waits for this session and it never
                // arrived, the entry goes away.
                remove = entry.waiters == 0 && entry.session.is_none();
            }
            if remove {
                state.sessions.remove(&key);
            }
            session
        };

        // If every user handle is already gone the stream is simply
        // dropped; the connection teardown reclaims it.
        if let Some(session) = session {
            match parked {
                Parked::Bidi(send, recv) => session.add_stream(send, recv),
                Parked::Uni(recv) => session.add_uni_stream(recv),
            }
        }
    }

    /// Attach an established session. Streams parked under its id are
    /// released to its accept queues.
    pub(crate) fn add_session(
        self: &Arc<Self>,
        conn: &quinn::Connection,
        id: u64,
        session: WeakSession,
    ) {
        let key = SessionKey {
            conn: conn.stable_id(),
            id,
        };

        let mut state = self.state.lock().unwrap();
        let entry = state
            .sessions
            .entry(key)
            .or_insert_with(PendingSession::new);
        entry.session = Some(session);
        entry.created.send_replace(true);

        // The first session on a connection starts that connection's
        // datagram pump.
        if state.conns.insert(key.conn) {
            let manager = Arc::clone(self);
            let conn = conn.clone();
            self.tasks.spawn(manager.datagram_pump(conn));
        }
    }

    /// Drop a session's map entry on explicit close.
    pub(crate) fn remove_session(&self, conn_id: usize, id: u64) {
        let mut state = self.state.lock().unwrap();
        state.sessions.remove(&SessionKey { conn: conn_id, id });
    }

    /// Receive datagrams on `conn` and dispatch them by session id.
    async fn datagram_pump(self: Arc<Self>, conn: quinn::Connection) {
        let conn_id = conn.stable_id();
        loop {
            let data = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = conn.read_datagram() => match res {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::debug!("datagram pump exiting: {e}");
                        break;
                    }
                }
            };

            let mut payload: Bytes = data;
            let sid = match VarInt::decode(&mut payload) {
                Ok(sid) => sid.into_inner(),
                Err(_) => {
                    tracing::warn!(
                        len = payload.remaining(),
                        "dropping datagram with a malformed session id"
                    );
                    continue;
                }
            };

            let session = {
                let state = self.state.lock().unwrap();
                state
                    .sessions
                    .get(&SessionKey { conn: conn_id, id: sid })
                    .and_then(|entry| entry.session.as_ref())
                    .and_then(Weak::upgrade)
            };
            match session {
                Some(session) => session.handle_datagram(payload),
                // Datagrams are unreliable; one for an unknown session
                // is silently dropped.
                None => {}
            }
        }

        let mut state = self.state.lock().unwrap();
        state.conns.remove(&conn_id);
    }

    /// Stop routing and wait for every parking task and datagram pump to
    /// finish. Established sessions are not force-closed; tearing down
    /// their QUIC connections cascades into them.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    #[cfg(test)]
    pub(crate) fn pending_entries(&self) -> usize {
        self.state.lock().unwrap().sessions.len()
    }

    #[cfg(test)]
    pub(crate) fn assert_invariant(&self) {
        let state = self.state.lock().unwrap();
        for (key, entry) in &state.sessions {
            assert!(
                entry.waiters > 0 || entry.session.is_some(),
                "dead map entry for session {}",
                key.id
            );
        }
    }
}
