//! Upstream feed client: one multiplexed connection to the broker's binary
//! tick stream on behalf of every logged-in session.

pub mod codec;
pub mod testing;
mod transport;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use core_types::{BrokerTokens, InstrumentId, SessionId, Tick};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, timeout, Instant};

use codec::{
    decode_ltp_packet, encode_auth_request, encode_subscribe, encode_unsubscribe,
    parse_control_frame, ControlFrame,
};
pub use transport::{FeedFrame, FeedStream, FeedTransport, WsTransport};

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub endpoint: String,
    pub connect_timeout: Duration,
    /// Per-frame read deadline; a silent socket past this is dead.
    pub read_deadline: Duration,
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Jitter applied to every backoff sleep, as a fraction (0.2 = ±20%).
    pub backoff_jitter: f64,
    /// Coalescing window for subscribe/unsubscribe deltas.
    pub batch_window: Duration,
    /// How long an empty ledger may linger before the connection drains.
    pub linger: Duration,
    /// Consecutive decode failures that force a reconnect.
    pub decode_error_threshold: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://smartapisocket.angelone.in/smart-stream".to_string(),
            connect_timeout: Duration::from_secs(10),
            read_deadline: Duration::from_secs(40),
            ping_interval: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            backoff_jitter: 0.2,
            batch_window: Duration::from_millis(100),
            linger: Duration::from_secs(30),
            decode_error_threshold: 25,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeedState {
    Disconnected,
    Connecting,
    Authenticating,
    Live,
    Draining,
}

impl FeedState {
    fn as_u8(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Authenticating => 2,
            Self::Live => 3,
            Self::Draining => 4,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Connecting,
            2 => Self::Authenticating,
            3 => Self::Live,
            4 => Self::Draining,
            _ => Self::Disconnected,
        }
    }
}

/// Read-only counters driving health probes.
#[derive(Default)]
pub struct FeedStats {
    frames_received: AtomicU64,
    ticks_decoded: AtomicU64,
    decode_errors: AtomicU64,
    connection_generation: AtomicU64,
    state: AtomicU8,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FeedStatsSnapshot {
    pub frames_received: u64,
    pub ticks_decoded: u64,
    pub decode_errors: u64,
    pub connection_generation: u64,
    pub state: FeedState,
}

impl FeedStats {
    fn set_state(&self, state: FeedState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }

    pub fn state(&self) -> FeedState {
        FeedState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn snapshot(&self) -> FeedStatsSnapshot {
        FeedStatsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            ticks_decoded: self.ticks_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            connection_generation: self.connection_generation.load(Ordering::Relaxed),
            state: self.state(),
        }
    }
}

/// Token → subscriber-set mapping. The upstream connection holds exactly the
/// union of all sets; a token whose set empties is unsubscribed. This is the
/// one piece of state shared across producers, guarded by a single mutex held
/// only for delta computation.
#[derive(Default)]
pub struct SubscriptionLedger {
    inner: Mutex<HashMap<InstrumentId, HashSet<SessionId>>>,
}

impl SubscriptionLedger {
    /// Returns the tokens that became newly active.
    pub fn subscribe(&self, session: SessionId, tokens: &[InstrumentId]) -> Vec<InstrumentId> {
        let mut inner = self.inner.lock();
        let mut added = Vec::new();
        for token in tokens {
            let set = inner.entry(token.clone()).or_default();
            if set.is_empty() {
                added.push(token.clone());
            }
            set.insert(session);
        }
        added
    }

    /// Returns the tokens whose subscriber set became empty.
    pub fn unsubscribe(&self, session: SessionId, tokens: &[InstrumentId]) -> Vec<InstrumentId> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        for token in tokens {
            if let Some(set) = inner.get_mut(token) {
                set.remove(&session);
                if set.is_empty() {
                    inner.remove(token);
                    removed.push(token.clone());
                }
            }
        }
        removed
    }

    pub fn drop_session(&self, session: SessionId) -> Vec<InstrumentId> {
        let mut inner = self.inner.lock();
        let mut removed = Vec::new();
        inner.retain(|token, set| {
            set.remove(&session);
            if set.is_empty() {
                removed.push(token.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn subscribers(&self, token: &InstrumentId) -> Vec<SessionId> {
        self.inner
            .lock()
            .get(token)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, token: &InstrumentId, session: SessionId) -> bool {
        self.inner
            .lock()
            .get(token)
            .is_some_and(|set| set.contains(&session))
    }

    pub fn all_tokens(&self) -> Vec<InstrumentId> {
        self.inner.lock().keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

/// Where decoded ticks go. Implementations must not block: the registry's
/// sink writes into per-session conflating mailboxes.
pub trait TickSink: Send + Sync {
    fn deliver(&self, sessions: &[SessionId], tick: &Tick);
}

enum FeedCommand {
    Delta {
        sub: Vec<InstrumentId>,
        unsub: Vec<InstrumentId>,
    },
    Delegate(BrokerTokens),
    Shutdown,
}

#[derive(Clone)]
pub struct FeedHandle {
    tx: mpsc::Sender<FeedCommand>,
    ledger: Arc<SubscriptionLedger>,
    stats: Arc<FeedStats>,
}

impl FeedHandle {
    pub async fn subscribe(&self, session: SessionId, tokens: Vec<InstrumentId>) {
        if tokens.is_empty() {
            return;
        }
        let added = self.ledger.subscribe(session, &tokens);
        // Always nudge the supervisor: the first demand wakes a disconnected
        // client even when the token was already in the ledger.
        let _ = self
            .tx
            .send(FeedCommand::Delta {
                sub: added,
                unsub: Vec::new(),
            })
            .await;
    }

    pub async fn unsubscribe(&self, session: SessionId, tokens: Vec<InstrumentId>) {
        if tokens.is_empty() {
            return;
        }
        let removed = self.ledger.unsubscribe(session, &tokens);
        if !removed.is_empty() {
            let _ = self
                .tx
                .send(FeedCommand::Delta {
                    sub: Vec::new(),
                    unsub: removed,
                })
                .await;
        }
    }

    pub async fn drop_session(&self, session: SessionId) {
        let removed = self.ledger.drop_session(session);
        if !removed.is_empty() {
            let _ = self
                .tx
                .send(FeedCommand::Delta {
                    sub: Vec::new(),
                    unsub: removed,
                })
                .await;
        }
    }

    /// Delegate a logged-in user's credentials for upstream auth.
    pub async fn delegate_credentials(&self, creds: BrokerTokens) {
        let _ = self.tx.send(FeedCommand::Delegate(creds)).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(FeedCommand::Shutdown).await;
    }

    pub fn ledger(&self) -> &Arc<SubscriptionLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> &Arc<FeedStats> {
        &self.stats
    }
}

pub struct FeedClient;

impl FeedClient {
    pub fn spawn(
        config: FeedConfig,
        transport: Arc<dyn FeedTransport>,
        sink: Arc<dyn TickSink>,
    ) -> FeedHandle {
        let (tx, rx) = mpsc::channel(64);
        let ledger = Arc::new(SubscriptionLedger::default());
        let stats = Arc::new(FeedStats::default());

        let supervisor = Supervisor {
            config,
            transport,
            sink,
            ledger: ledger.clone(),
            stats: stats.clone(),
            creds: Vec::new(),
            cred_idx: 0,
        };
        tokio::spawn(supervisor.run(rx));

        FeedHandle { tx, ledger, stats }
    }
}

enum ConnEnd {
    Shutdown,
    Drained,
}

struct Supervisor {
    config: FeedConfig,
    transport: Arc<dyn FeedTransport>,
    sink: Arc<dyn TickSink>,
    ledger: Arc<SubscriptionLedger>,
    stats: Arc<FeedStats>,
    creds: Vec<BrokerTokens>,
    cred_idx: usize,
}

impl Supervisor {
    async fn run(mut self, mut rx: mpsc::Receiver<FeedCommand>) {
        let mut backoff = self.config.backoff_base;

        loop {
            self.stats.set_state(FeedState::Disconnected);
            if !self.wait_for_demand(&mut rx).await {
                return;
            }

            match self.run_connection(&mut rx, &mut backoff).await {
                Ok(ConnEnd::Shutdown) => {
                    self.stats.set_state(FeedState::Disconnected);
                    return;
                }
                Ok(ConnEnd::Drained) => {
                    backoff = self.config.backoff_base;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "upstream connection failed, backing off");
                    self.sleep_with_jitter(backoff).await;
                    backoff = (backoff * 2).min(self.config.backoff_max);
                }
            }
        }
    }

    /// Park until the ledger is non-empty and at least one credential has
    /// been delegated. Returns false on shutdown.
    async fn wait_for_demand(&mut self, rx: &mut mpsc::Receiver<FeedCommand>) -> bool {
        loop {
            if !self.ledger.is_empty() && !self.creds.is_empty() {
                return true;
            }
            match rx.recv().await {
                Some(FeedCommand::Delegate(creds)) => self.store_credentials(creds),
                Some(FeedCommand::Delta { .. }) => {}
                Some(FeedCommand::Shutdown) | None => return false,
            }
        }
    }

    fn store_credentials(&mut self, creds: BrokerTokens) {
        if let Some(existing) = self
            .creds
            .iter_mut()
            .find(|c| c.client_code == creds.client_code)
        {
            *existing = creds;
        } else {
            self.creds.push(creds);
        }
    }

    fn rotate_credentials(&mut self) {
        if !self.creds.is_empty() {
            self.cred_idx = (self.cred_idx + 1) % self.creds.len();
        }
    }

    async fn run_connection(
        &mut self,
        rx: &mut mpsc::Receiver<FeedCommand>,
        backoff: &mut Duration,
    ) -> Result<ConnEnd> {
        self.stats.set_state(FeedState::Connecting);
        let creds = self.creds[self.cred_idx % self.creds.len()].clone();
        let mut stream = timeout(self.config.connect_timeout, self.transport.connect(&creds))
            .await
            .map_err(|_| anyhow!("connect timed out"))??;

        self.stats.set_state(FeedState::Authenticating);
        stream.send_text(encode_auth_request(&creds)).await?;
        loop {
            let frame = timeout(self.config.connect_timeout, stream.next_frame())
                .await
                .map_err(|_| anyhow!("auth ack timed out"))??
                .ok_or_else(|| anyhow!("upstream closed during auth"))?;
            match frame {
                FeedFrame::Text(text) => match parse_control_frame(&text) {
                    ControlFrame::AuthAck { ok: true, .. } => break,
                    ControlFrame::AuthAck { ok: false, message } => {
                        self.rotate_credentials();
                        return Err(anyhow!(
                            "auth rejected for {}: {}",
                            creds.client_code,
                            message.unwrap_or_default()
                        ));
                    }
                    _ => continue,
                },
                FeedFrame::Ping(payload) => stream.send_pong(payload).await?,
                FeedFrame::Binary(_) => continue,
            }
        }

        self.stats.set_state(FeedState::Live);
        let generation = self
            .stats
            .connection_generation
            .fetch_add(1, Ordering::Relaxed)
            + 1;
        metrics::gauge!("feed.connection_generation").set(generation as f64);
        *backoff = self.config.backoff_base;
        tracing::info!(generation, "upstream feed live");

        // Deltas queued while disconnected are subsumed by the full
        // re-subscribe below; drop them instead of replaying.
        loop {
            match rx.try_recv() {
                Ok(FeedCommand::Delta { .. }) => {}
                Ok(FeedCommand::Delegate(creds)) => self.store_credentials(creds),
                Ok(FeedCommand::Shutdown) => {
                    self.stats.set_state(FeedState::Draining);
                    stream.close().await;
                    return Ok(ConnEnd::Shutdown);
                }
                Err(_) => break,
            }
        }

        // Re-subscribe the whole ledger in one command.
        let all = self.ledger.all_tokens();
        if !all.is_empty() {
            stream
                .send_text(encode_subscribe(&format!("resub-{generation}"), &all))
                .await?;
        }

        let mut pending_sub: HashSet<InstrumentId> = HashSet::new();
        let mut pending_unsub: HashSet<InstrumentId> = HashSet::new();
        let mut batch_deadline: Option<Instant> = None;
        let mut empty_since = self.ledger.is_empty().then(Instant::now);
        let mut decode_run: u32 = 0;
        let mut delta_seq: u64 = 0;

        let mut ping = tokio::time::interval(self.config.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.reset();

        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    match cmd {
                        Some(FeedCommand::Delta { sub, unsub }) => {
                            for token in sub {
                                pending_unsub.remove(&token);
                                pending_sub.insert(token);
                            }
                            for token in unsub {
                                pending_sub.remove(&token);
                                pending_unsub.insert(token);
                            }
                            if (!pending_sub.is_empty() || !pending_unsub.is_empty())
                                && batch_deadline.is_none()
                            {
                                batch_deadline = Some(Instant::now() + self.config.batch_window);
                            }
                            empty_since = if self.ledger.is_empty() {
                                empty_since.or_else(|| Some(Instant::now()))
                            } else {
                                None
                            };
                        }
                        Some(FeedCommand::Delegate(creds)) => self.store_credentials(creds),
                        Some(FeedCommand::Shutdown) | None => {
                            self.stats.set_state(FeedState::Draining);
                            stream.close().await;
                            return Ok(ConnEnd::Shutdown);
                        }
                    }
                }
                frame = timeout(self.config.read_deadline, stream.next_frame()) => {
                    let frame = frame
                        .map_err(|_| anyhow!("upstream read deadline exceeded"))??
                        .ok_or_else(|| anyhow!("upstream closed"))?;
                    self.stats.frames_received.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("feed.frames_received").increment(1);
                    match frame {
                        FeedFrame::Binary(buf) => match decode_ltp_packet(&buf) {
                            Ok(tick) => {
                                decode_run = 0;
                                self.stats.ticks_decoded.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!("feed.ticks_decoded").increment(1);
                                let subscribers = self.ledger.subscribers(&tick.id());
                                if !subscribers.is_empty() {
                                    self.sink.deliver(&subscribers, &tick);
                                }
                            }
                            Err(err) => {
                                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                                metrics::counter!("feed.decode_errors").increment(1);
                                decode_run += 1;
                                if decode_run <= 3 {
                                    tracing::warn!(error = %err, "tick decode failed");
                                }
                                if decode_run >= self.config.decode_error_threshold {
                                    return Err(anyhow!(
                                        "{decode_run} consecutive decode failures"
                                    ));
                                }
                            }
                        },
                        FeedFrame::Text(text) => {
                            if parse_control_frame(&text) == ControlFrame::Other {
                                tracing::debug!(frame = %text, "unrecognized control frame");
                            }
                        }
                        FeedFrame::Ping(payload) => stream.send_pong(payload).await?,
                    }
                }
                _ = ping.tick() => {
                    stream.send_text("ping".to_string()).await?;
                }
                _ = async {
                    match batch_deadline {
                        Some(at) => sleep_until(at).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    delta_seq += 1;
                    if !pending_unsub.is_empty() {
                        let tokens: Vec<InstrumentId> = pending_unsub.drain().collect();
                        stream
                            .send_text(encode_unsubscribe(&format!("delta-{delta_seq}"), &tokens))
                            .await?;
                    }
                    if !pending_sub.is_empty() {
                        let tokens: Vec<InstrumentId> = pending_sub.drain().collect();
                        stream
                            .send_text(encode_subscribe(&format!("delta-{delta_seq}"), &tokens))
                            .await?;
                    }
                    batch_deadline = None;
                }
                _ = async {
                    match empty_since {
                        Some(at) => sleep_until(at + self.config.linger).await,
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.stats.set_state(FeedState::Draining);
                    stream.close().await;
                    tracing::info!("subscription ledger empty past linger, draining");
                    return Ok(ConnEnd::Drained);
                }
            }
        }
    }

    async fn sleep_with_jitter(&self, base: Duration) {
        let jitter = self.config.backoff_jitter.clamp(0.0, 1.0);
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);
        let millis = (base.as_millis() as f64 * factor).max(0.0) as u64;
        sleep(Duration::from_millis(millis)).await;
    }
}
