use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::connect::{Connect, ConnectRequest};
use crate::driver::{self, IncomingRequest};
use crate::error::ServerError;
use crate::manager::{SessionManager, DEFAULT_REORDERING_TIMEOUT};
use crate::session::Session;

/// A predicate over the CONNECT request deciding whether its origin may
/// open a session.
pub type OriginCheck = Box<dyn Fn(&ConnectRequest) -> bool + Send + Sync>;

/// A WebTransport server that accepts new sessions.
///
/// The endpoint must be configured by the caller (server TLS config
/// advertising [`crate::ALPN_H3`], datagram support). Must be created
/// inside a tokio runtime; connection intake starts immediately.
pub struct Server {
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    check_origin: Option<OriginCheck>,
    requests: tokio::sync::Mutex<mpsc::Receiver<IncomingRequest>>,
}

impl Server {
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        Self::with_reordering_timeout(endpoint, DEFAULT_REORDERING_TIMEOUT)
    }

    /// Creates a server with a custom limit on how long an incoming
    /// stream may wait for its session.
    pub fn with_reordering_timeout(endpoint: quinn::Endpoint, timeout: Duration) -> Self {
        let manager = SessionManager::new(timeout);
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let (request_tx, request_rx) = mpsc::channel(16);

        {
            let manager = manager.clone();
            let cancel = cancel.clone();
            let tasks2 = tasks.clone();
            tasks.spawn(async move {
                loop {
                    let incoming = tokio::select! {
                        _ = cancel.cancelled() => break,
                        res = endpoint.accept() => match res {
                            Some(incoming) => incoming,
                            None => break,
                        }
                    };
                    tasks2.spawn(handle_connection(
                        incoming,
                        manager.clone(),
                        request_tx.clone(),
                        cancel.child_token(),
                        tasks2.clone(),
                    ));
                }
            });
        }

        Self {
            manager,
            cancel,
            tasks,
            check_origin: None,
            requests: tokio::sync::Mutex::new(request_rx),
        }
    }

    /// Install an origin predicate; [`Server::upgrade`] answers 403 to
    /// requests it refuses. Without one, every origin is accepted.
    pub fn with_check_origin(mut self, check: OriginCheck) -> Self {
        self.check_origin = Some(check);
        self
    }

    /// Wait for the next incoming CONNECT request. Returns `None` once
    /// the server has been closed.
    pub async fn accept(&self) -> Option<Request> {
        let mut requests = self.requests.lock().await;
        let incoming = requests.recv().await?;
        Some(Request {
            conn: incoming.conn,
            request: incoming.request,
            connect: Connect::accepted(incoming.send, incoming.recv),
        })
    }

    /// Whether `request` passes the configured origin predicate.
    pub fn check_origin(&self, request: &Request) -> bool {
        match &self.check_origin {
            Some(check) => check(&request.request),
            None => true,
        }
    }

    /// Accept the session: validate the origin, answer 200 and register
    /// the session with the stream router.
    pub async fn upgrade(&self, request: Request) -> Result<Session, ServerError> {
        if !self.check_origin(&request) {
            tracing::debug!(origin = ?request.origin(), "rejecting origin");
            let _ = request.reject(StatusCode::FORBIDDEN).await;
            return Err(ServerError::OriginRejected);
        }

        let Request {
            conn,
            request: _,
            mut connect,
        } = request;
        connect.respond(StatusCode::OK).await?;

        let session = Session::new(conn.clone(), connect, self.manager.clone());
        self.manager
            .add_session(&conn, session.session_id(), Arc::downgrade(session.inner()));
        Ok(session)
    }

    /// Stop accepting connections and wait for the background tasks.
    /// Established sessions survive until their connections close.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.manager.close().await;
    }
}

async fn handle_connection(
    incoming: quinn::Incoming,
    manager: Arc<SessionManager>,
    request_tx: mpsc::Sender<IncomingRequest>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    let conn = match incoming.await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::debug!("connection handshake failed: {e}");
            return;
        }
    };

    let h3 = match driver::establish(conn, manager, Some(request_tx), cancel.clone(), tasks).await
    {
        Ok(h3) => h3,
        Err(e) => {
            tracing::debug!("h3 handshake failed: {e}");
            return;
        }
    };

    // Keep the control stream alive until the connection goes away.
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = h3.conn.closed() => {}
    }
}

/// A CONNECT request awaiting the server's decision.
pub struct Request {
    conn: quinn::Connection,
    request: ConnectRequest,
    connect: Connect,
}

impl Request {
    /// The URL the client asked for.
    pub fn url(&self) -> &Url {
        &self.request.url
    }

    /// The request headers, pseudo-headers excluded.
    pub fn headers(&self) -> &HeaderMap {
        &self.request.headers
    }

    /// The `origin` header, if the client sent one.
    pub fn origin(&self) -> Option<&str> {
        self.request.origin()
    }

    pub fn remote_address(&self) -> std::net::SocketAddr {
        self.conn.remote_address()
    }

    /// Refuse the session with your favorite HTTP status code.
    pub async fn reject(mut self, status: StatusCode) -> Result<(), ServerError> {
        self.connect.respond(status).await?;
        self.connect.finish();
        Ok(())
    }
}
