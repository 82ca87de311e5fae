use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use rustls::pki_types::PrivatePkcs8KeyDer;
use tokio_util::sync::CancellationToken;

use crate::connect::Connect;
use crate::manager::SessionManager;
use crate::session::Session;
use crate::{ClientError, Dialer, ReadError, Server, SessionError, WriteError};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A client endpoint trusting a server endpoint bound to localhost, both
/// speaking the h3 ALPN.
fn endpoints() -> anyhow::Result<(quinn::Endpoint, quinn::Endpoint, std::net::SocketAddr)> {
    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
    let cert_der = cert.der().clone();
    let key_der = PrivatePkcs8KeyDer::from(key_pair.serialize_der());

    let mut server_tls = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key_der.into())?;
    server_tls.alpn_protocols = vec![crate::ALPN_H3.as_bytes().to_vec()];
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(
        quinn::crypto::rustls::QuicServerConfig::try_from(server_tls)?,
    ));
    let server = quinn::Endpoint::server(server_config, "127.0.0.1:0".parse()?)?;
    let addr = server.local_addr()?;

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der)?;
    let mut client_tls = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    client_tls.alpn_protocols = vec![crate::ALPN_H3.as_bytes().to_vec()];
    let client_config = quinn::ClientConfig::new(Arc::new(
        quinn::crypto::rustls::QuicClientConfig::try_from(client_tls)?,
    ));
    let mut client = quinn::Endpoint::client("127.0.0.1:0".parse()?)?;
    client.set_default_client_config(client_config);

    Ok((client, server, addr))
}

/// A raw QUIC connection pair over the loopback endpoints, for driving
/// the session manager directly.
async fn quinn_pair() -> anyhow::Result<(
    quinn::Connection,
    quinn::Connection,
    quinn::Endpoint,
    quinn::Endpoint,
)> {
    let (client_ep, server_ep, addr) = endpoints()?;
    let connecting = client_ep.connect(addr, "127.0.0.1")?;
    let accepting = server_ep.accept();
    let (client_conn, incoming) = tokio::join!(connecting, accepting);
    let server_conn = incoming.expect("incoming connection").await?;
    Ok((client_conn?, server_conn, client_ep, server_ep))
}

/// A session over `conn` whose CONNECT stream is a stand-in bidi stream,
/// registered with `manager` under `id`.
async fn stand_in_session(
    conn: &quinn::Connection,
    manager: &Arc<SessionManager>,
    id: u64,
) -> anyhow::Result<Session> {
    let (send, recv) = conn.open_bi().await?;
    let session = Session::new(conn.clone(), Connect::accepted(send, recv), manager.clone());
    manager.add_session(conn, id, Arc::downgrade(session.inner()));
    Ok(session)
}

#[tokio::test]
async fn h3_smoke() -> anyhow::Result<()> {
    init_logging();
    let (client_ep, server_ep, addr) = endpoints()?;
    let server = Server::new(server_ep);
    let dialer = Dialer::new(client_ep);
    let url = format!("https://{addr}/echo");

    let client_task = async {
        let cancel = CancellationToken::new();
        let (response, session) = dialer.dial(&cancel, &url, HeaderMap::new()).await?;
        assert_eq!(response.status(), http::StatusCode::OK);

        let mut stream = session.open_bi().await?;
        stream.write_all(b"hello").await?;
        stream.finish()?;
        let echoed = stream.read_to_end(64).await?;
        assert_eq!(echoed, b"hello");

        session.send_datagram(Bytes::from_static(b"ping"))?;
        let pong = tokio::time::timeout(
            Duration::from_secs(5),
            session.receive_datagram(&cancel),
        )
        .await??;
        assert_eq!(&pong[..], b"pong");

        let mut uni = session.open_uni().await?;
        uni.write_all(b"one-way").await?;
        uni.finish()?;

        session.closed().await;
        anyhow::Ok(())
    };

    let server_task = async {
        let cancel = CancellationToken::new();
        let request = server.accept().await.expect("a CONNECT request");
        assert_eq!(request.url().path(), "/echo");
        let session = server.upgrade(request).await?;

        let mut stream = session.accept_bi(&cancel).await?;
        let data = stream.read_to_end(64).await?;
        stream.write_all(&data).await?;
        stream.finish()?;

        let ping = tokio::time::timeout(
            Duration::from_secs(5),
            session.receive_datagram(&cancel),
        )
        .await??;
        assert_eq!(&ping[..], b"ping");
        session.send_datagram(Bytes::from_static(b"pong"))?;

        let mut uni = session.accept_uni(&cancel).await?;
        assert_eq!(uni.read_to_end(64).await?, b"one-way");

        session.close();
        anyhow::Ok(())
    };

    let (client_res, server_res) = tokio::join!(client_task, server_task);
    client_res?;
    server_res?;
    Ok(())
}

#[tokio::test]
async fn sessions_share_a_connection() -> anyhow::Result<()> {
    init_logging();
    let (client_ep, server_ep, addr) = endpoints()?;
    let server = Server::new(server_ep);
    let dialer = Dialer::new(client_ep);
    let cancel = CancellationToken::new();

    let client_task = async {
        let (_, session_a) = dialer
            .dial(&cancel, &format!("https://{addr}/a"), HeaderMap::new())
            .await?;
        let (_, session_b) = dialer
            .dial(&cancel, &format!("https://{addr}/b"), HeaderMap::new())
            .await?;

        // The second CONNECT rides the pooled connection, so its stream
        // id cannot be the first client-initiated bidi stream.
        assert_ne!(session_a.session_id(), session_b.session_id());
        assert_ne!(session_b.session_id(), 0);

        session_a.send_datagram(Bytes::from_static(b"ping-a"))?;
        session_b.send_datagram(Bytes::from_static(b"ping-b"))?;

        let pong_a = tokio::time::timeout(
            Duration::from_secs(5),
            session_a.receive_datagram(&cancel),
        )
        .await??;
        let pong_b = tokio::time::timeout(
            Duration::from_secs(5),
            session_b.receive_datagram(&cancel),
        )
        .await??;
        assert_eq!(&pong_a[..], b"pong-a");
        assert_eq!(&pong_b[..], b"pong-b");
        anyhow::Ok(())
    };

    let server_task = async {
        for _ in 0..2 {
            let request = server.accept().await.expect("a CONNECT request");
            let tag = request.url().path().trim_start_matches('/').to_string();
            let session = server.upgrade(request).await?;
            tokio::spawn({
                let cancel = cancel.clone();
                async move {
                    let ping = session.receive_datagram(&cancel).await.unwrap();
                    assert_eq!(ping, format!("ping-{tag}"));
                    session
                        .send_datagram(Bytes::from(format!("pong-{tag}")))
                        .unwrap();
                    // Keep the session alive until the test ends.
                    session.closed().await;
                }
            });
        }
        anyhow::Ok(())
    };

    let (client_res, server_res) = tokio::join!(client_task, server_task);
    client_res?;
    server_res?;
    Ok(())
}

#[tokio::test]
async fn early_stream_waits_for_its_session() -> anyhow::Result<()> {
    init_logging();
    let (client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    // The peer's stream arrives before the session exists.
    let (mut send, _recv) = client_conn.open_bi().await?;
    send.write_all(b"early").await?;
    send.finish()?;
    let (srv_send, srv_recv) = server_conn.accept_bi().await?;
    manager.add_stream(&server_conn, srv_send, srv_recv, 7);
    assert_eq!(manager.pending_entries(), 1);
    manager.assert_invariant();

    // The CONNECT response is a second late.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let session = stand_in_session(&server_conn, &manager, 7).await?;

    let mut stream = tokio::time::timeout(
        Duration::from_secs(2),
        session.accept_bi(&cancel),
    )
    .await??;
    assert_eq!(stream.read_to_end(64).await?, b"early");
    manager.assert_invariant();
    Ok(())
}

#[tokio::test]
async fn parked_stream_times_out() -> anyhow::Result<()> {
    init_logging();
    let (client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_millis(100));

    let (mut send, mut recv) = client_conn.open_bi().await?;
    send.write_all(b"never routed").await?;
    let (srv_send, srv_recv) = server_conn.accept_bi().await?;
    manager.add_stream(&server_conn, srv_send, srv_recv, 99);
    assert_eq!(manager.pending_entries(), 1);

    // Session 99 never appears; both directions come back with the
    // buffered-stream-rejected code, raw in the HTTP/3 space.
    let stopped = tokio::time::timeout(Duration::from_secs(2), send.stopped()).await??;
    assert_eq!(stopped, Some(crate::WEBTRANSPORT_BUFFERED_STREAM_REJECTED));
    let reset = tokio::time::timeout(Duration::from_secs(2), async {
        let mut buf = [0u8; 16];
        loop {
            match recv.read(&mut buf).await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("stream finished instead of resetting"),
                Err(quinn::ReadError::Reset(code)) => return code,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
    })
    .await?;
    assert_eq!(reset, crate::WEBTRANSPORT_BUFFERED_STREAM_REJECTED);

    // The placeholder entry is gone once its last waiter gives up.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.pending_entries() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "entry leaked");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.assert_invariant();
    Ok(())
}

#[tokio::test]
async fn datagram_overflow_drops_new_arrivals() -> anyhow::Result<()> {
    init_logging();
    let (_client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let session = stand_in_session(&server_conn, &manager, 5).await?;

    for i in 0..200u32 {
        session
            .inner()
            .handle_datagram(Bytes::from(i.to_be_bytes().to_vec()));
    }

    // Exactly the first 128 survive, in order.
    for expected in 0..crate::session::DATAGRAM_QUEUE_LEN as u32 {
        let data = session.receive_datagram(&cancel).await?;
        assert_eq!(data, Bytes::from(expected.to_be_bytes().to_vec()));
    }
    let empty = tokio::time::timeout(
        Duration::from_millis(100),
        session.receive_datagram(&cancel),
    )
    .await;
    assert!(empty.is_err(), "dropped datagrams were delivered");
    Ok(())
}

#[tokio::test]
async fn reset_codes_cross_the_wire() -> anyhow::Result<()> {
    init_logging();
    let (client_ep, server_ep, addr) = endpoints()?;
    let server = Server::new(server_ep);
    let dialer = Dialer::new(client_ep);
    let cancel = CancellationToken::new();
    let url = format!("https://{addr}/reset");

    let client_task = async {
        let (_, session) = dialer.dial(&cancel, &url, HeaderMap::new()).await?;
        let mut stream = session.open_bi().await?;
        stream.write_all(b"x").await?;

        // Wait for the peer to see the stream before aborting it.
        let mut ack = [0u8; 1];
        stream.recv_mut().read_exact(&mut ack).await?;
        stream.reset(0x41)?;

        // The peer stops our second stream; the code comes back through
        // the reverse mapping.
        let mut second = session.open_bi().await?;
        second.write_all(b"y").await?;
        let stopped = second.send_mut().stopped().await?;
        assert_eq!(stopped, Some(0x17));
        anyhow::Ok(())
    };

    let server_task = async move {
        let cancel = CancellationToken::new();
        let request = server.accept().await.expect("a CONNECT request");
        let session = server.upgrade(request).await?;

        let mut stream = session.accept_bi(&cancel).await?;
        let mut buf = [0u8; 1];
        stream.recv_mut().read_exact(&mut buf).await?;
        stream.write_all(b"!").await?;
        let err = loop {
            match stream.read(&mut buf).await {
                Ok(Some(_)) => continue,
                Ok(None) => panic!("expected a reset, got a clean end"),
                Err(e) => break e,
            }
        };
        assert!(
            matches!(err, ReadError::Reset(0x41)),
            "unexpected error: {err:?}"
        );

        let mut second = session.accept_bi(&cancel).await?;
        second.recv_mut().read_exact(&mut buf).await?;
        second.stop(0x17)?;
        // Hold the session open until the client has observed the stop.
        session.closed().await;
        anyhow::Ok(())
    };

    let server_handle = tokio::spawn(server_task);
    client_task.await?;
    server_handle.abort();
    Ok(())
}

#[tokio::test]
async fn close_unblocks_accept() -> anyhow::Result<()> {
    init_logging();
    let (_client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let session = stand_in_session(&server_conn, &manager, 3).await?;

    let pending = tokio::spawn({
        let session = session.clone();
        let cancel = cancel.clone();
        async move { session.accept_bi(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    session.close();
    let res = tokio::time::timeout(Duration::from_millis(50), pending).await??;
    assert!(matches!(res, Err(SessionError::SessionClosed)));

    // Closed stays closed, immediately.
    let res = tokio::time::timeout(
        Duration::from_millis(50),
        session.accept_bi(&cancel),
    )
    .await?;
    assert!(matches!(res, Err(SessionError::SessionClosed)));

    // And the manager entry is gone.
    assert_eq!(manager.pending_entries(), 0);
    Ok(())
}

#[tokio::test]
async fn caller_cancellation_unblocks_accept() -> anyhow::Result<()> {
    init_logging();
    let (_client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_secs(5));
    let session = stand_in_session(&server_conn, &manager, 11).await?;

    let cancel = CancellationToken::new();
    let pending = tokio::spawn({
        let session = session.clone();
        let cancel = cancel.clone();
        async move { session.accept_uni(&cancel).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    cancel.cancel();
    let res = tokio::time::timeout(Duration::from_millis(50), pending).await??;
    assert!(matches!(res, Err(SessionError::Cancelled)));

    // The session itself is still usable.
    let fresh = CancellationToken::new();
    let still_open = tokio::time::timeout(
        Duration::from_millis(50),
        session.accept_uni(&fresh),
    )
    .await;
    assert!(still_open.is_err(), "accept returned without a stream");
    Ok(())
}

#[tokio::test]
async fn origin_check_rejects_with_403() -> anyhow::Result<()> {
    init_logging();
    let (client_ep, server_ep, addr) = endpoints()?;
    let server = Server::new(server_ep)
        .with_check_origin(Box::new(|request| request.origin() == Some("https://allowed")));
    let dialer = Dialer::new(client_ep);
    let cancel = CancellationToken::new();
    let url = format!("https://{addr}/guarded");

    let client_task = async {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::ORIGIN, "https://evil".parse().unwrap());
        let err = dialer
            .dial(&cancel, &url, headers)
            .await
            .expect_err("dial must fail");
        match err {
            ClientError::ErrorStatus(response) => {
                assert_eq!(response.status(), http::StatusCode::FORBIDDEN)
            }
            other => panic!("unexpected error: {other:?}"),
        }
    };

    let server_task = async {
        let request = server.accept().await.expect("a CONNECT request");
        assert!(!server.check_origin(&request));
        let err = server.upgrade(request).await.expect_err("upgrade must fail");
        assert!(matches!(err, crate::ServerError::OriginRejected));
    };

    tokio::join!(client_task, server_task);
    Ok(())
}

#[tokio::test]
async fn write_deadline_expires() -> anyhow::Result<()> {
    init_logging();
    let (client_conn, server_conn, _client_ep, _server_ep) = quinn_pair().await?;
    let manager = SessionManager::new(Duration::from_secs(5));
    let session = stand_in_session(&client_conn, &manager, 0).await?;
    let _hold = server_conn; // keep the peer alive

    // A tiny flow-control window is not needed; an already-passed
    // deadline must fail even a write that would otherwise succeed.
    let mut stream = session.open_bi().await?;
    stream.set_write_deadline(Some(tokio::time::Instant::now() - Duration::from_secs(1)));
    let err = stream.write_all(b"late").await.expect_err("deadline must fire");
    assert!(matches!(err, WriteError::Timeout), "unexpected: {err:?}");

    // Disarming lets the stream work again.
    stream.set_write_deadline(None);
    stream.write_all(b"on time").await?;
    Ok(())
}
