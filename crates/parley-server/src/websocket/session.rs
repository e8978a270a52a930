//! WebSocket session lifecycle: one device socket from upgrade to close.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge, histogram};
use parley_core::metric::{
    WS_CONNECTION_DURATION_SECONDS, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL, WS_REJECTIONS_TOTAL,
};
use parley_core::{ClientFrame, ClientFrameKind, RecorderError, ServerEvent, close_code};
use tokio::sync::mpsc;
use tracing::{Span, debug, field, info, instrument, warn};

use super::connection::{Connection, Outbound};
use crate::auth::UpgradeRequest;
use crate::context::AppContext;

/// How long the writer gets to flush its close frame after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Run one upgraded socket.
///
/// 1. Authenticates; failure closes with 4001
/// 2. Registers with the connection manager; a limit closes with 4003/4004
/// 3. Marks the device online, subscribes the user's fanout channel, joins
///    shared presence and sends `connected`
/// 4. Reads frames until the client leaves or the connection is closed
///    (liveness eviction, replacement, shutdown)
/// 5. Undoes step 3 unless a newer socket for the same device took over
#[instrument(skip_all, fields(user_id = field::Empty, device_id = field::Empty))]
pub async fn run_ws_session(ws: WebSocket, request: UpgradeRequest, ctx: Arc<AppContext>) {
    let (mut ws_tx, ws_rx) = ws.split();

    let info = match ctx.authenticator.authenticate(&request) {
        Ok(info) => info,
        Err(failure) => {
            warn!(kind = failure.kind(), error = %failure, "websocket authentication failed");
            counter!(WS_REJECTIONS_TOTAL, "reason" => "auth").increment(1);
            reject(&mut ws_tx, close_code::AUTH_FAILED, &failure.to_string()).await;
            return;
        }
    };
    let span = Span::current();
    let _ = span.record("user_id", info.user_id.as_str());
    let _ = span.record("device_id", info.device_id.as_str());

    let (tx, rx) = mpsc::channel(ctx.config.send_queue_size.max(1));
    let conn = Arc::new(Connection::new(info.user_id, info.device_id, info.claims, tx));

    match ctx.connections.add(conn.clone()) {
        Ok(Some(_replaced)) => info!("device reconnected, previous socket replaced"),
        Ok(None) => {}
        Err(limit) => {
            warn!(reason = limit.reason(), "connection refused");
            counter!(WS_REJECTIONS_TOTAL, "reason" => limit.reason()).increment(1);
            reject(&mut ws_tx, limit.close_code(), limit.reason()).await;
            return;
        }
    }

    let started = Instant::now();
    info!("client connected");
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE).increment(1.0);

    match ctx.devices.device_online(&conn.user_id, &conn.device_id).await {
        Ok(()) => {}
        Err(RecorderError::NotRegistered) => debug!("device not registered yet"),
        Err(error) => warn!(%error, "failed to record device online"),
    }
    ctx.router.ensure_user_subscription(&conn.user_id).await;
    ctx.fanout.presence_add(&conn.user_id, &conn.device_id).await;
    let _ = conn.send_event(&ServerEvent::connected(&conn.user_id, &conn.device_id));

    let mut writer = tokio::spawn(write_loop(ws_tx, rx));
    read_loop(ws_rx, &conn, &ctx).await;

    conn.close(close_code::NORMAL, "closed");
    if ctx.connections.remove_connection(&conn) {
        match ctx.devices.device_offline(&conn.user_id, &conn.device_id).await {
            Ok(()) | Err(RecorderError::NotRegistered) => {}
            Err(error) => warn!(%error, "failed to record device offline"),
        }
        ctx.fanout.presence_remove(&conn.user_id, &conn.device_id).await;
        ctx.router.release_user_subscription(&conn.user_id).await;
    } else {
        debug!("socket was replaced, leaving device state to its successor");
    }

    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }

    let (code, reason) = conn.close_reason().unwrap_or((close_code::NORMAL, String::new()));
    info!(code, reason, dropped = conn.drop_count(), "client disconnected");
    gauge!(WS_CONNECTIONS_ACTIVE).decrement(1.0);
    histogram!(WS_CONNECTION_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
}

async fn reject(ws_tx: &mut SplitSink<WebSocket, Message>, code: u16, reason: &str) {
    let _ = ws_tx.send(close_message(code, reason)).await;
    let _ = ws_tx.close().await;
}

fn close_message(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.to_owned().into(),
    }))
}

/// The socket message for a queued frame, and whether writing should stop
/// after it.
fn to_message(frame: Outbound) -> (Message, bool) {
    match frame {
        Outbound::Text(text) => (Message::Text(text.as_str().to_owned().into()), false),
        Outbound::Ping => (Message::Ping(Bytes::new()), false),
        Outbound::Close { code, reason } => (close_message(code, &reason), true),
    }
}

async fn write_loop(mut ws_tx: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Outbound>) {
    while let Some(frame) = rx.recv().await {
        let (message, last) = to_message(frame);
        if ws_tx.send(message).await.is_err() || last {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

async fn read_loop(mut ws_rx: SplitStream<WebSocket>, conn: &Connection, ctx: &AppContext) {
    let closed = conn.closed();
    loop {
        let next = tokio::select! {
            () = closed.cancelled() => break,
            next = ws_rx.next() => next,
        };
        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(error)) => {
                debug!(%error, "websocket read failed");
                break;
            }
            None => break,
        };
        let text = match message {
            Message::Text(text) => text.to_string(),
            Message::Binary(data) => match String::from_utf8(data.to_vec()) {
                Ok(text) => text,
                Err(_) => {
                    debug!(len = data.len(), "dropping non-UTF8 binary frame");
                    continue;
                }
            },
            Message::Ping(_) | Message::Pong(_) => {
                conn.mark_alive();
                continue;
            }
            Message::Close(_) => {
                debug!("client sent close frame");
                break;
            }
        };
        handle_frame(&text, conn, ctx).await;
    }
}

async fn handle_frame(text: &str, conn: &Connection, ctx: &AppContext) {
    let Some(frame) = ClientFrame::parse(text) else {
        debug!(len = text.len(), "dropping malformed frame");
        return;
    };
    match frame.kind() {
        ClientFrameKind::Ping => {
            conn.mark_alive();
            let _ = conn.send_event(&ServerEvent::pong());
        }
        ClientFrameKind::Heartbeat => {
            conn.mark_alive();
            ctx.fanout.presence_refresh(&conn.user_id).await;
        }
        ClientFrameKind::Other(frame_type) => debug!(frame_type, "ignoring client frame"),
    }
}
