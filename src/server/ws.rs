use std::time::Duration;

use axum::{
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::api::{ApiError, SharedState};

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket handler ────────────────────────────────────────────────

/// Stream a job's output: every line produced so far, then live lines,
/// then a Close frame once the job completes.
///
/// The subscription is taken before the upgrade so lines produced while the
/// handshake completes are not missed.
pub async fn job_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<SharedState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lines = state.output.register(&job_id).await?;
    tracing::debug!(job_id = %job_id, "job output subscriber connected");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, job_id, lines)))
}

async fn handle_socket(socket: WebSocket, state: SharedState, job_id: String, lines: mpsc::Receiver<String>) {
    let (sender, receiver) = socket.split();
    let reason = run_socket_loop(sender, receiver, lines, PING_INTERVAL, PONG_TIMEOUT).await;
    // The line receiver is gone now; drop our subscription with it.
    state.output.deregister(&job_id);
    tracing::debug!(job_id = %job_id, reason = ?reason, "job output subscriber disconnected");
}

/// Why [`run_socket_loop`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopEnd {
    /// The job completed, or the handler dropped this subscriber.
    OutputClosed,
    ClientClosed,
    PongTimeout,
    SendFailed,
}

/// Core WebSocket loop with ping/pong keepalive.
///
/// Forwards job lines as Text frames until the line channel closes. If no
/// Pong arrives within `pong_timeout` of a Ping the connection is treated
/// as dead.
async fn run_socket_loop<S, R, E>(
    mut sender: S,
    mut receiver: R,
    mut lines: mpsc::Receiver<String>,
    ping_every: Duration,
    pong_timeout: Duration,
) -> LoopEnd
where
    S: Sink<Message> + Unpin,
    R: Stream<Item = Result<Message, E>> + Unpin,
{
    let mut ping_interval = tokio::time::interval(ping_every);
    // The first tick completes immediately.
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    let end = loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > pong_timeout {
                    break LoopEnd::PongTimeout;
                }
                if sender.send(Message::Ping(axum::body::Bytes::new())).await.is_err() {
                    break LoopEnd::SendFailed;
                }
                awaiting_pong = true;
            }

            line = lines.recv() => {
                match line {
                    Some(line) => {
                        if sender.send(Message::Text(line.into())).await.is_err() {
                            break LoopEnd::SendFailed;
                        }
                    }
                    None => break LoopEnd::OutputClosed,
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break LoopEnd::ClientClosed,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break LoopEnd::ClientClosed,
                }
            }
        }
    };

    let _ = sender.send(Message::Close(None)).await;
    end
}
