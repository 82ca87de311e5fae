//! Per-connection stream intake.
//!
//! Every incoming QUIC stream is classified by its leading varint.
//! WebTransport streams carry a session id next and are handed to the
//! [`SessionManager`]; the peer's control stream feeds the SETTINGS
//! exchange; CONNECT requests surface to the server; everything else is
//! declined. Accepting and decoding happen concurrently so one slow
//! stream header cannot stall the others.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::connect::ConnectRequest;
use crate::frame::{self, FrameType, StreamType};
use crate::manager::SessionManager;
use crate::qpack;
use crate::settings::{self, PeerSettings, SettingsError};
use crate::varint::VarInt;

/// A CONNECT request the driver pulled off an incoming request stream,
/// before the server has answered it.
pub(crate) struct IncomingRequest {
    pub conn: quinn::Connection,
    pub request: ConnectRequest,
    pub send: quinn::SendStream,
    pub recv: quinn::RecvStream,
}

/// An HTTP/3 connection with its SETTINGS exchanged and its stream
/// intake running.
pub(crate) struct H3Connection {
    pub conn: quinn::Connection,
    pub settings: PeerSettings,
    // Our control stream; it stays open for the connection's lifetime.
    #[allow(dead_code)]
    control_send: quinn::SendStream,
}

/// Send our SETTINGS, start the intake loops and wait for the peer's
/// SETTINGS to prove WebTransport support.
pub(crate) async fn establish(
    conn: quinn::Connection,
    manager: Arc<SessionManager>,
    requests: Option<mpsc::Sender<IncomingRequest>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) -> Result<H3Connection, SettingsError> {
    let control_send = settings::open_control(&conn).await?;
    let mut peer_settings = spawn_intake(conn.clone(), manager, requests, cancel.clone(), tasks);

    let settings = tokio::select! {
        res = peer_settings.wait_for(|s| s.is_some()) => match res {
            Ok(settings) => settings.clone().unwrap_or_default(),
            // The intake loops exited before SETTINGS arrived; the
            // connection is gone.
            Err(_) => {
                return Err(connection_error(&conn).into());
            }
        },
        _ = cancel.cancelled() => return Err(connection_error(&conn).into()),
    };

    tracing::debug!(?settings, "received SETTINGS frame");
    if !settings.supports_webtransport() {
        return Err(SettingsError::WebTransportUnsupported);
    }

    Ok(H3Connection {
        conn,
        settings,
        control_send,
    })
}

fn connection_error(conn: &quinn::Connection) -> quinn::ConnectionError {
    conn.close_reason()
        .unwrap_or(quinn::ConnectionError::LocallyClosed)
}

/// Start the bidi and uni intake loops; returns a watch that yields the
/// peer's SETTINGS once its control stream has been parsed.
fn spawn_intake(
    conn: quinn::Connection,
    manager: Arc<SessionManager>,
    requests: Option<mpsc::Sender<IncomingRequest>>,
    cancel: CancellationToken,
    tasks: TaskTracker,
) -> watch::Receiver<Option<PeerSettings>> {
    let (settings_tx, settings_rx) = watch::channel(None);

    {
        let conn = conn.clone();
        let manager = manager.clone();
        let cancel = cancel.clone();
        let tasks2 = tasks.clone();
        tasks.spawn(async move {
            loop {
                let recv = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = conn.accept_uni() => match res {
                        Ok(recv) => recv,
                        Err(e) => {
                            tracing::debug!("uni intake exiting: {e}");
                            break;
                        }
                    }
                };
                let classify = classify_uni(
                    conn.clone(),
                    manager.clone(),
                    settings_tx.clone(),
                    recv,
                );
                let cancel = cancel.clone();
                tasks2.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = classify => {}
                    }
                });
            }
        });
    }

    {
        let cancel = cancel.clone();
        let tasks2 = tasks.clone();
        tasks.spawn(async move {
            loop {
                let (send, recv) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    res = conn.accept_bi() => match res {
                        Ok(pair) => pair,
                        Err(e) => {
                            tracing::debug!("bidi intake exiting: {e}");
                            break;
                        }
                    }
                };
                let classify = classify_bidi(
                    conn.clone(),
                    manager.clone(),
                    requests.clone(),
                    send,
                    recv,
                );
                let cancel = cancel.clone();
                tasks2.spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = classify => {}
                    }
                });
            }
        });
    }

    settings_rx
}

async fn classify_uni(
    conn: quinn::Connection,
    manager: Arc<SessionManager>,
    settings_tx: watch::Sender<Option<PeerSettings>>,
    mut recv: quinn::RecvStream,
) {
    let ty = match VarInt::read(&mut recv).await {
        Ok(ty) => StreamType(ty),
        Err(e) => {
            // Probably reset before the type arrived.
            tracing::warn!("failed to decode unidirectional stream: {e}");
            return;
        }
    };

    match ty {
        StreamType::WEBTRANSPORT => {
            let id = match VarInt::read(&mut recv).await {
                Ok(id) => id.into_inner(),
                Err(e) => {
                    tracing::warn!("failed to read a session id: {e}");
                    return;
                }
            };
            manager.add_uni_stream(&conn, recv, id);
        }
        StreamType::CONTROL => {
            if settings_tx.borrow().is_some() {
                tracing::debug!("ignoring duplicate control stream");
                return;
            }
            run_control(&conn, recv, settings_tx).await;
        }
        StreamType::QPACK_ENCODER | StreamType::QPACK_DECODER => {
            // We advertise no dynamic table, but the stream must stay
            // open; drain whatever instructions arrive.
            drain(recv).await;
        }
        other => {
            tracing::debug!("ignoring unknown unidirectional stream: {other:?}");
        }
    }
}

/// Parse the SETTINGS frame off the peer's control stream, then keep the
/// stream alive, skipping frames we have no use for. A control stream
/// that violates the protocol takes the whole connection down, which
/// also unblocks anyone waiting on the SETTINGS.
async fn run_control(
    conn: &quinn::Connection,
    mut recv: quinn::RecvStream,
    settings_tx: watch::Sender<Option<PeerSettings>>,
) {
    match frame::read_frame_header(&mut recv).await {
        Ok((FrameType::SETTINGS, len)) => {
            let payload = match frame::read_frame_payload(&mut recv, len).await {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!("failed to read SETTINGS payload: {e}");
                    conn.close(frame::H3_FRAME_ERROR, b"malformed SETTINGS");
                    return;
                }
            };
            match PeerSettings::decode(&payload) {
                Ok(settings) => {
                    settings_tx.send_replace(Some(settings));
                }
                Err(e) => {
                    tracing::warn!("malformed SETTINGS frame: {e}");
                    conn.close(frame::H3_FRAME_ERROR, b"malformed SETTINGS");
                    return;
                }
            }
        }
        Ok((ty, _)) => {
            tracing::warn!("control stream did not start with SETTINGS: {ty:?}");
            conn.close(frame::H3_MISSING_SETTINGS, b"expected SETTINGS");
            return;
        }
        Err(e) => {
            tracing::debug!("control stream closed before SETTINGS: {e}");
            return;
        }
    }

    loop {
        match frame::read_frame_header(&mut recv).await {
            Ok((ty, len)) => {
                if frame::read_frame_payload(&mut recv, len).await.is_err() {
                    return;
                }
                tracing::debug!("ignoring control frame: {ty:?}");
            }
            Err(_) => return,
        }
    }
}

async fn classify_bidi(
    conn: quinn::Connection,
    manager: Arc<SessionManager>,
    requests: Option<mpsc::Sender<IncomingRequest>>,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) {
    let ty = match VarInt::read(&mut recv).await {
        Ok(ty) => FrameType(ty),
        Err(e) => {
            tracing::warn!("failed to decode bidirectional stream: {e}");
            return;
        }
    };

    match ty {
        FrameType::WEBTRANSPORT => {
            let id = match VarInt::read(&mut recv).await {
                Ok(id) => id.into_inner(),
                Err(e) => {
                    tracing::warn!("failed to read a session id: {e}");
                    return;
                }
            };
            manager.add_stream(&conn, send, recv, id);
        }
        FrameType::HEADERS => {
            let Some(requests) = requests else {
                // Servers do not send requests; nothing to do as a
                // client.
                tracing::debug!("ignoring unexpected request stream");
                return;
            };
            handle_request(conn, requests, send, recv).await;
        }
        other => {
            tracing::debug!("ignoring unknown bidirectional stream: {other:?}");
        }
    }
}

async fn handle_request(
    conn: quinn::Connection,
    requests: mpsc::Sender<IncomingRequest>,
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) {
    let fields = async {
        let len = VarInt::read(&mut recv).await.ok()?.into_inner();
        let payload = frame::read_frame_payload(&mut recv, len).await.ok()?;
        qpack::decode_field_section(&payload).ok()
    }
    .await;

    let Some(fields) = fields else {
        tracing::warn!("failed to decode a HEADERS frame");
        return;
    };

    match ConnectRequest::decode(&fields) {
        Ok(request) => {
            tracing::debug!(url = %request.url, "received CONNECT request");
            let incoming = IncomingRequest {
                conn,
                request,
                send,
                recv,
            };
            // The receiver disappearing just means the server shut down.
            let _ = requests.send(incoming).await;
        }
        Err(e) => {
            tracing::debug!("rejecting non-WebTransport request: {e}");
            let mut connect = crate::connect::Connect::accepted(send, recv);
            let _ = connect.respond(http::StatusCode::NOT_FOUND).await;
            connect.finish();
        }
    }
}

async fn drain(mut recv: quinn::RecvStream) {
    let mut buf = [0u8; 1024];
    loop {
        match recv.read(&mut buf).await {
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return,
        }
    }
}
