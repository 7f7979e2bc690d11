use axum::extract::ws::{Message, WebSocket};
use dj_proto::protocol::{ClientFrame, ServerFrame};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::CoreHandle;
use crate::session::SessionId;

/// Frames buffered per screen before sends start failing.
pub const OUTBOUND_BUFFER: usize = 64;

/// Serve one screen websocket until it closes or is superseded.
pub async fn handle_screen(socket: WebSocket, core: CoreHandle) {
    let (ws_tx, ws_rx) = socket.split();
    run_session(ws_tx, ws_rx, core).await;
}

/// The session loop, generic over the socket halves.
pub async fn run_session<S, R>(mut ws_tx: S, mut ws_rx: R, core: CoreHandle)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
    R: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let (out_tx, mut out_rx) = mpsc::channel::<ServerFrame>(OUTBOUND_BUFFER);
    let Some(session) = core.open_session(out_tx).await else {
        warn!("core gone, screen connection refused");
        return;
    };
    info!(session, "screen connected");

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => inbound(&core, session, &text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!(session, "screen closed connection");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(session, error = %e, "screen read error");
                        break;
                    }
                }
            }

            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    // Sender dropped by the session manager: a newer screen took over.
                    info!(session, "screen superseded");
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                };
                match frame.encode() {
                    Ok(text) => {
                        if let Err(e) = ws_tx.send(Message::Text(text)).await {
                            warn!(session, error = %e, "screen write failed");
                            break;
                        }
                    }
                    Err(e) => error!(session, error = %e, "frame encode failed"),
                }
            }
        }
    }

    core.close_session(session).await;
}

async fn inbound(core: &CoreHandle, session: SessionId, text: &str) {
    match ClientFrame::decode(text) {
        Ok(frame) => {
            debug!(session, "screen frame");
            core.frame(session, frame).await;
        }
        Err(e) => warn!(session, error = %e, "undecodable screen frame"),
    }
}
