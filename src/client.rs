use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use url::Url;

use crate::connect::{Connect, ConnectRequest};
use crate::driver::{self, H3Connection};
use crate::error::{status_is_success, ClientError};
use crate::manager::{SessionManager, DEFAULT_REORDERING_TIMEOUT};
use crate::session::Session;

/// A client for dialing WebTransport sessions.
///
/// The endpoint must be configured by the caller (client TLS config,
/// [`crate::ALPN_H3`], datagram support). Sessions to the same authority
/// share one HTTP/3 connection; a new connection is dialed when none
/// exists or the pooled one has died.
pub struct Dialer {
    endpoint: quinn::Endpoint,
    manager: Arc<SessionManager>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    conns: tokio::sync::Mutex<HashMap<String, Arc<H3Connection>>>,
}

impl Dialer {
    pub fn new(endpoint: quinn::Endpoint) -> Self {
        Self::with_reordering_timeout(endpoint, DEFAULT_REORDERING_TIMEOUT)
    }

    /// Creates a dialer with a custom limit on how long an incoming
    /// stream may wait for its session. Streams can outrun the CONNECT
    /// response that establishes their session when the response is
    /// reordered in transit.
    pub fn with_reordering_timeout(endpoint: quinn::Endpoint, timeout: Duration) -> Self {
        Self {
            endpoint,
            manager: SessionManager::new(timeout),
            cancel: CancellationToken::new(),
            tasks: TaskTracker::new(),
            conns: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Dial `url` and establish a WebTransport session on it.
    ///
    /// `headers` are added to the CONNECT request. On a non-2xx status
    /// the response is returned inside [`ClientError::ErrorStatus`].
    pub async fn dial(
        &self,
        cancel: &CancellationToken,
        url: &str,
        headers: HeaderMap,
    ) -> Result<(http::Response<()>, Session), ClientError> {
        let url: Url = url
            .parse()
            .map_err(|_| ClientError::InvalidUrl(url.to_string()))?;
        if url.scheme() != "https" {
            return Err(ClientError::InvalidUrl(format!(
                "expected an https url, got {url}"
            )));
        }

        tokio::select! {
            res = self.dial_inner(url, headers) => res,
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            _ = self.cancel.cancelled() => Err(ClientError::Cancelled),
        }
    }

    async fn dial_inner(
        &self,
        url: Url,
        headers: HeaderMap,
    ) -> Result<(http::Response<()>, Session), ClientError> {
        let conn = self.pooled_connection(&url).await?;

        let request = ConnectRequest {
            url,
            headers,
        };
        let (connect, response) = Connect::open(&conn.conn, &request).await?;
        if !status_is_success(response.status()) {
            return Err(ClientError::ErrorStatus(response));
        }

        let session = Session::new(conn.conn.clone(), connect, self.manager.clone());
        self.manager.add_session(
            &conn.conn,
            session.session_id(),
            Arc::downgrade(session.inner()),
        );
        Ok((response, session))
    }

    /// One HTTP/3 connection per authority. Dials a fresh connection on
    /// a miss or when the pooled one is already closed.
    async fn pooled_connection(&self, url: &Url) -> Result<Arc<H3Connection>, ClientError> {
        let host = url
            .host_str()
            .ok_or_else(|| ClientError::InvalidUrl(url.to_string()))?
            .to_string();
        let port = url.port().unwrap_or(443);
        let authority = format!("{host}:{port}");

        let mut conns = self.conns.lock().await;
        if let Some(existing) = conns.get(&authority) {
            if existing.conn.close_reason().is_none() {
                return Ok(existing.clone());
            }
            tracing::debug!(%authority, "pooled connection is dead, dialing a new one");
            conns.remove(&authority);
        }

        let addr = tokio::net::lookup_host(authority.as_str())
            .await
            .map_err(ClientError::Resolve)?
            .next()
            .ok_or_else(|| {
                ClientError::Resolve(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "host resolved to no addresses",
                ))
            })?;

        let conn = self.endpoint.connect(addr, &host)?.await?;
        let h3 = driver::establish(
            conn,
            self.manager.clone(),
            None,
            self.cancel.child_token(),
            self.tasks.clone(),
        )
        .await?;

        let h3 = Arc::new(h3);
        conns.insert(authority, h3.clone());
        Ok(h3)
    }

    /// Stop the dialer: cancel stream intake and routing and wait for
    /// the background tasks to finish. Established sessions survive
    /// until their connections close.
    pub async fn close(&self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.manager.close().await;
    }
}
