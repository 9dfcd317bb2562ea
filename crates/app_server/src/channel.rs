//! Downstream channel manager: per-client WebSocket with a bounded send
//! queue, reader/writer tasks, heartbeat, and reconnect rebinding.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use chrono::Utc;
use core_types::{ClientMessage, ServerMessage, SessionId, UserId};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use uuid::Uuid;

use crate::session::SessionCommand;
use crate::state::AppState;

/// Server-side close codes beyond the standard 1000/1001.
pub const SLOW_CONSUMER_CODE: u16 = 4008;
pub const SUPERSEDED_CODE: u16 = 4001;
pub const QUARANTINE_CODE: u16 = 4009;

struct Closer {
    code: AtomicU16,
    notify: Notify,
}

/// Sender half of a client channel. Held by the session loop (push path) and
/// the heartbeat task; the writer task owns the receiver.
#[derive(Clone)]
pub struct ChannelHandle {
    pub id: Uuid,
    tx: mpsc::Sender<ServerMessage>,
    closer: Arc<Closer>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PushError {
    /// Send queue hit its bound: slow consumer.
    Full,
    /// Writer is gone; the channel is already dead.
    Closed,
}

impl ChannelHandle {
    pub fn try_push(&self, frame: ServerMessage) -> Result<(), PushError> {
        self.tx.try_send(frame).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }

    /// Ask the writer to close the socket with `code`.
    pub fn close_with(&self, code: u16) {
        self.closer.code.store(code, Ordering::Relaxed);
        self.closer.notify.notify_one();
    }
}

pub struct ChannelRx {
    rx: mpsc::Receiver<ServerMessage>,
    closer: Arc<Closer>,
}

impl ChannelRx {
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.rx.recv().await
    }

    /// Close code requested so far (0 = none). Test hook.
    pub fn close_code(&self) -> u16 {
        self.closer.code.load(Ordering::Relaxed)
    }
}

pub fn open_channel(queue: usize) -> (ChannelHandle, ChannelRx) {
    let (tx, rx) = mpsc::channel(queue.max(1));
    let closer = Arc::new(Closer {
        code: AtomicU16::new(0),
        notify: Notify::new(),
    });
    (
        ChannelHandle {
            id: core_types::new_id(),
            tx,
            closer: closer.clone(),
        },
        ChannelRx { rx, closer },
    )
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub user_id: Option<UserId>,
}

/// `GET /stream/{session_id}?user_id=`: bind a fresh channel to a session,
/// rehydrating by user id when the session id is gone.
pub async fn stream_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<SessionId>,
    Query(query): Query<StreamQuery>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| client_channel(socket, state, session_id, query.user_id))
}

async fn client_channel(
    socket: WebSocket,
    state: AppState,
    session_id: SessionId,
    user_id: Option<UserId>,
) {
    let handle = match state
        .registry
        .resolve(session_id, user_id.as_deref())
        .await
    {
        Ok(handle) => handle,
        Err(err) => {
            reject_socket(socket, err.code(), &err.to_string()).await;
            return;
        }
    };

    let (channel, outbound) = open_channel(state.config.channel_send_queue);
    let channel_id = channel.id;
    let heartbeat_handle = channel.clone();
    let pong_handle = channel.clone();

    if let Err(err) = handle
        .request(|reply| SessionCommand::BindChannel { channel, reply })
        .await
    {
        reject_socket(socket, err.code(), &err.to_string()).await;
        return;
    }
    state.channels.insert(channel_id, heartbeat_handle);
    metrics::gauge!("channels.active").set(state.channels.len() as f64);

    let (ws_tx, mut ws_rx) = socket.split();
    let send_deadline = state.config.channel_send_deadline();
    let writer = tokio::spawn(write_frames(ws_tx, outbound, send_deadline));

    // Reader: pings get pongs; close codes 1000/1001 are clean, everything
    // else leaves the session warm for a rebind.
    let mut clean = false;
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Ok(ClientMessage::Ping) = serde_json::from_str::<ClientMessage>(&text) {
                    let _ = pong_handle.try_push(ServerMessage::Pong {
                        ts: Utc::now().timestamp_millis(),
                    });
                }
            }
            Ok(Message::Close(frame)) => {
                clean = matches!(frame, Some(CloseFrame { code: 1000 | 1001, .. }));
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    state.channels.remove(&channel_id);
    metrics::gauge!("channels.active").set(state.channels.len() as f64);
    let _ = handle.try_send(SessionCommand::UnbindChannel { channel_id, clean });
    writer.abort();
    tracing::debug!(%session_id, clean, "client channel ended");
}

async fn write_frames(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: ChannelRx,
    send_deadline: std::time::Duration,
) {
    let closer = outbound.closer.clone();
    loop {
        tokio::select! {
            frame = outbound.rx.recv() => {
                let Some(frame) = frame else { break };
                let Ok(text) = serde_json::to_string(&frame) else { continue };
                match timeout(send_deadline, ws_tx.send(Message::Text(text.into()))).await {
                    Ok(Ok(())) => {}
                    // Deadline breach or socket error: the channel is dead.
                    _ => break,
                }
            }
            _ = closer.notify.notified() => {
                let code = closer.code.load(Ordering::Relaxed);
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: close_reason(code).into(),
                    })))
                    .await;
                break;
            }
        }
    }
}

fn close_reason(code: u16) -> &'static str {
    match code {
        SLOW_CONSUMER_CODE => "slow consumer",
        SUPERSEDED_CODE => "superseded by new channel",
        QUARANTINE_CODE => "session quarantined",
        _ => "closing",
    }
}

async fn reject_socket(socket: WebSocket, code: &str, detail: &str) {
    let (mut ws_tx, _) = socket.split();
    let frame = ServerMessage::Error {
        code: code.to_string(),
        detail: detail.to_string(),
    };
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = ws_tx.send(Message::Text(text.into())).await;
    }
    let _ = ws_tx.close().await;
}

/// Heartbeat task: one frame per live channel every interval. A channel that
/// cannot even absorb a heartbeat is a slow consumer and gets closed.
pub fn spawn_heartbeat(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let ts = Utc::now().timestamp_millis();
            let mut dead = Vec::new();
            for entry in state.channels.iter() {
                match entry.value().try_push(ServerMessage::Heartbeat { ts }) {
                    Ok(()) => {}
                    Err(PushError::Full) => {
                        entry.value().close_with(SLOW_CONSUMER_CODE);
                        metrics::counter!("channels.slow_consumer_closes").increment(1);
                        dead.push(*entry.key());
                    }
                    Err(PushError::Closed) => dead.push(*entry.key()),
                }
            }
            for id in dead {
                state.channels.remove(&id);
            }
            metrics::gauge!("channels.active").set(state.channels.len() as f64);
        }
    });
}
