//! In-memory broker for driving the full feed client without a network.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use core_types::{BrokerTokens, Tick};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::codec::encode_ltp_packet;
use crate::transport::{FeedFrame, FeedStream, FeedTransport};

enum ServerEvent {
    Frame(FeedFrame),
    Close,
}

#[derive(Default)]
struct BrokerInner {
    connects: AtomicU64,
    reject_next_auth: AtomicBool,
    commands: Mutex<Vec<Value>>,
    conn: Mutex<Option<mpsc::UnboundedSender<ServerEvent>>>,
}

/// Fake upstream broker: accepts one connection at a time, acks auth,
/// records subscribe/unsubscribe commands and lets tests inject frames or
/// kill the transport.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<BrokerInner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    /// The next auth attempt is rejected (tests credential rotation).
    pub fn reject_next_auth(&self) {
        self.inner.reject_next_auth.store(true, Ordering::Relaxed);
    }

    /// Every subscribe/unsubscribe command seen, in arrival order.
    pub fn commands(&self) -> Vec<Value> {
        self.inner.commands.lock().clone()
    }

    pub fn commands_with_action(&self, action: i64) -> Vec<Value> {
        self.commands()
            .into_iter()
            .filter(|c| c["action"] == action)
            .collect()
    }

    /// Tokens named by commands with `action`, flattened across exchanges.
    pub fn tokens_in_commands(&self, action: i64) -> Vec<String> {
        let mut out = Vec::new();
        for command in self.commands_with_action(action) {
            let Some(list) = command["params"]["tokenList"].as_array() else {
                continue;
            };
            for group in list {
                let Some(tokens) = group["tokens"].as_array() else {
                    continue;
                };
                out.extend(
                    tokens
                        .iter()
                        .filter_map(Value::as_str)
                        .map(ToOwned::to_owned),
                );
            }
        }
        out
    }

    pub fn push_tick(&self, tick: &Tick) -> bool {
        self.push_frame(FeedFrame::Binary(encode_ltp_packet(tick)))
    }

    pub fn push_binary(&self, bytes: Vec<u8>) -> bool {
        self.push_frame(FeedFrame::Binary(bytes))
    }

    fn push_frame(&self, frame: FeedFrame) -> bool {
        let conn = self.inner.conn.lock();
        match conn.as_ref() {
            Some(tx) => tx.send(ServerEvent::Frame(frame)).is_ok(),
            None => false,
        }
    }

    /// Simulate transport loss: the client's next read observes a close.
    pub fn drop_connection(&self) {
        let mut conn = self.inner.conn.lock();
        if let Some(tx) = conn.take() {
            let _ = tx.send(ServerEvent::Close);
        }
    }
}

#[async_trait]
impl FeedTransport for MockBroker {
    async fn connect(&self, _creds: &BrokerTokens) -> Result<Box<dyn FeedStream>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.conn.lock() = Some(tx.clone());
        self.inner.connects.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MockStream {
            inner: self.inner.clone(),
            server_tx: tx,
            rx,
        }))
    }
}

struct MockStream {
    inner: Arc<BrokerInner>,
    server_tx: mpsc::UnboundedSender<ServerEvent>,
    rx: mpsc::UnboundedReceiver<ServerEvent>,
}

impl MockStream {
    fn reply_text(&self, text: String) {
        let _ = self.server_tx.send(ServerEvent::Frame(FeedFrame::Text(text)));
    }
}

#[async_trait]
impl FeedStream for MockStream {
    async fn send_text(&mut self, text: String) -> Result<()> {
        if text.trim().eq_ignore_ascii_case("ping") {
            self.reply_text("pong".to_string());
            return Ok(());
        }
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            return Ok(());
        };
        if value.get("correlationID").and_then(Value::as_str) == Some("auth") {
            let ok = !self.inner.reject_next_auth.swap(false, Ordering::Relaxed);
            self.reply_text(
                json!({"correlationID": "auth", "status": ok, "message": if ok { "authenticated" } else { "token rejected" }})
                    .to_string(),
            );
            return Ok(());
        }
        self.inner.commands.lock().push(value);
        Ok(())
    }

    async fn send_pong(&mut self, _payload: Vec<u8>) -> Result<()> {
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Option<FeedFrame>> {
        match self.rx.recv().await {
            Some(ServerEvent::Frame(frame)) => Ok(Some(frame)),
            Some(ServerEvent::Close) | None => Ok(None),
        }
    }

    async fn close(&mut self) {}
}
