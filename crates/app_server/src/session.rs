//! Per-session command loop. One task exclusively owns all mutable session
//! state; every producer (HTTP handler, channel reader, upstream tick,
//! timer) talks to it through the bounded command queue or the conflating
//! tick mailbox. No session field is ever locked.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use core_types::{
    new_id, Alert, AlertCondition, AlertKind, AlertLogEntry, AutoLevel, BrokerTokens, DayOhlc,
    Instrument, InstrumentId, LogKind, PaperTrade, ServerMessage, SessionError, SessionId, Tick,
    TradeSide, UserId, WatchlistItem,
};
use infra_bus::Mailbox;
use infra_clock::MarketClock;
use paper_engine::{EntryOrigin, EntryOutcome, EntrySignal, PaperEngine, PaperError, PaperSummary};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::channel::{ChannelHandle, PushError, QUARANTINE_CODE, SLOW_CONSUMER_CODE, SUPERSEDED_CODE};

pub const SNAPSHOT_VERSION: u8 = 1;

/// Everything durable about a session. Ephemeral fields (bound channel, last
/// activity, per-token last-seen prices) are deliberately absent: they reseed
/// from the live feed after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u8,
    pub user_id: UserId,
    pub broker: BrokerTokens,
    pub watchlist: Vec<WatchlistItem>,
    pub alerts: Vec<Alert>,
    pub alert_log: Vec<AlertLogEntry>,
    pub paper_trades: Vec<PaperTrade>,
    pub virtual_balance: f64,
    pub auto_paper_enabled: bool,
    pub alerts_paused: bool,
    pub reference_date: Option<NaiveDate>,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub watchlist: Vec<WatchlistItem>,
    pub reference_date: Option<NaiveDate>,
    pub auto_paper_enabled: bool,
    pub alerts_paused: bool,
    pub virtual_balance: f64,
    pub active_alerts: usize,
    pub open_trades: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PaperOverview {
    pub auto_paper_enabled: bool,
    pub virtual_balance: f64,
    pub trades: Vec<PaperTrade>,
    pub summary: PaperSummary,
}

pub type Responder<T> = oneshot::Sender<Result<T, SessionError>>;

pub enum SessionCommand {
    AddToWatchlist {
        instrument: Instrument,
        reply: Responder<WatchlistItem>,
    },
    RemoveFromWatchlist {
        token: String,
        reply: Responder<()>,
    },
    Watchlist {
        reply: Responder<Vec<WatchlistItem>>,
    },
    SetReferenceDate {
        date: Option<NaiveDate>,
        reply: Responder<()>,
    },
    /// Reference-data refresh resolved off-loop; fire-and-forget.
    UpdateOhlc { token: String, ohlc: DayOhlc },
    CreateAlert {
        instrument: Instrument,
        condition: AlertCondition,
        price: f64,
        reply: Responder<Alert>,
    },
    DeleteAlert {
        alert_id: Uuid,
        reply: Responder<()>,
    },
    DeleteAlerts {
        alert_ids: Vec<Uuid>,
        reply: Responder<usize>,
    },
    ClearAlerts {
        reply: Responder<usize>,
    },
    PauseAlerts {
        paused: bool,
        reply: Responder<bool>,
    },
    Alerts {
        reply: Responder<(Vec<Alert>, bool)>,
    },
    AlertLogs {
        reply: Responder<Vec<AlertLogEntry>>,
    },
    GenerateAutoAlerts {
        token: String,
        ohlc: DayOhlc,
        levels: Option<Vec<AutoLevel>>,
        reply: Responder<Vec<Alert>>,
    },
    SetPaperEnabled {
        enabled: bool,
        reply: Responder<bool>,
    },
    SetVirtualBalance {
        balance: f64,
        reply: Responder<f64>,
    },
    SetStopLoss {
        trade_id: Uuid,
        stop_loss: Option<f64>,
        reply: Responder<()>,
    },
    SetTarget {
        trade_id: Uuid,
        target: Option<f64>,
        reply: Responder<()>,
    },
    CloseTrade {
        trade_id: Uuid,
        price: Option<f64>,
        reply: Responder<PaperTrade>,
    },
    ManualTrade {
        token: String,
        side: TradeSide,
        price: Option<f64>,
        reply: Responder<PaperTrade>,
    },
    PaperSummary {
        reply: Responder<PaperOverview>,
    },
    ClearTrades {
        reply: Responder<usize>,
    },
    ExportTradesCsv {
        reply: Responder<String>,
    },
    Describe {
        reply: Responder<SessionOverview>,
    },
    BindChannel {
        channel: ChannelHandle,
        reply: Responder<()>,
    },
    UnbindChannel { channel_id: Uuid, clean: bool },
    Shutdown {
        done: Option<oneshot::Sender<()>>,
    },
}

/// Shared collaborators handed to every session loop.
#[derive(Clone)]
pub struct SessionDeps {
    pub clock: Arc<dyn MarketClock>,
    pub feed: feed_angel::FeedHandle,
    pub flush: session_store::FlushHandle,
    pub paper: PaperEngine,
    pub auto_square_off: bool,
    pub alert_log_cap: usize,
    pub command_queue: usize,
}

#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub user_id: UserId,
    pub broker: BrokerTokens,
    cmd_tx: mpsc::Sender<SessionCommand>,
    pub mailbox: Arc<Mailbox<InstrumentId, Tick>>,
    last_active_ms: Arc<AtomicI64>,
}

impl SessionHandle {
    /// Non-blocking submit. Overflow maps to the retriable error per the
    /// producer policy; ticks never come through here.
    pub fn try_send(&self, command: SessionCommand) -> Result<(), SessionError> {
        self.cmd_tx.try_send(command).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SessionError::Overloaded,
            mpsc::error::TrySendError::Closed(_) => SessionError::SessionNotFound,
        })
    }

    /// Submit a request command and await its reply.
    pub async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.try_send(make(tx))?;
        rx.await.map_err(|_| SessionError::SessionNotFound)?
    }

    pub fn last_active(&self) -> DateTime<Utc> {
        let ms = self.last_active_ms.load(Ordering::Relaxed);
        DateTime::<Utc>::from_timestamp_millis(ms).unwrap_or_else(Utc::now)
    }
}

impl SessionSnapshot {
    pub fn watchlist_ids(&self) -> Vec<InstrumentId> {
        self.watchlist.iter().map(WatchlistItem::id).collect()
    }
}

pub fn empty_snapshot(user_id: &str, broker: BrokerTokens) -> SessionSnapshot {
    SessionSnapshot {
        version: SNAPSHOT_VERSION,
        user_id: user_id.to_string(),
        broker,
        watchlist: Vec::new(),
        alerts: Vec::new(),
        alert_log: Vec::new(),
        paper_trades: Vec::new(),
        virtual_balance: 100_000.0,
        auto_paper_enabled: false,
        alerts_paused: false,
        reference_date: None,
        saved_at: Utc::now(),
    }
}

pub fn spawn_session(
    session_id: SessionId,
    snapshot: SessionSnapshot,
    deps: SessionDeps,
) -> SessionHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(deps.command_queue.max(1));
    let mailbox = Arc::new(Mailbox::new());
    let last_active_ms = Arc::new(AtomicI64::new(deps.clock.now_wall().timestamp_millis()));

    let handle = SessionHandle {
        session_id,
        user_id: snapshot.user_id.clone(),
        broker: snapshot.broker.clone(),
        cmd_tx,
        mailbox: mailbox.clone(),
        last_active_ms: last_active_ms.clone(),
    };

    let state = SessionState {
        session_id,
        user_id: snapshot.user_id,
        broker: snapshot.broker,
        watchlist: snapshot.watchlist,
        alerts: snapshot.alerts,
        alert_log: snapshot.alert_log.into(),
        trades: snapshot.paper_trades,
        virtual_balance: snapshot.virtual_balance,
        auto_paper_enabled: snapshot.auto_paper_enabled,
        alerts_paused: snapshot.alerts_paused,
        reference_date: snapshot.reference_date,
        last_seen: HashMap::new(),
        channel: None,
        squared_off_day: None,
        quarantined: false,
        deps,
        mailbox,
        last_active_ms,
    };
    tokio::spawn(state.run(cmd_rx));

    handle
}

struct SessionState {
    session_id: SessionId,
    user_id: UserId,
    broker: BrokerTokens,
    watchlist: Vec<WatchlistItem>,
    alerts: Vec<Alert>,
    alert_log: VecDeque<AlertLogEntry>,
    trades: Vec<PaperTrade>,
    virtual_balance: f64,
    auto_paper_enabled: bool,
    alerts_paused: bool,
    reference_date: Option<NaiveDate>,
    /// Last observed price per token; seeds from PDC on first sight.
    last_seen: HashMap<InstrumentId, f64>,
    channel: Option<ChannelHandle>,
    squared_off_day: Option<NaiveDate>,
    quarantined: bool,
    deps: SessionDeps,
    mailbox: Arc<Mailbox<InstrumentId, Tick>>,
    last_active_ms: Arc<AtomicI64>,
}

enum Flow {
    Continue,
    Stop,
}

impl SessionState {
    async fn run(mut self, mut rx: mpsc::Receiver<SessionCommand>) {
        let mailbox = self.mailbox.clone();
        loop {
            tokio::select! {
                command = rx.recv() => {
                    match command {
                        Some(command) => {
                            self.touch();
                            if let Flow::Stop = self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            self.persist();
                            break;
                        }
                    }
                }
                _ = mailbox.wait() => {
                    self.touch();
                    for (_, tick) in mailbox.drain() {
                        self.on_tick(tick);
                    }
                }
            }
        }
        tracing::debug!(session_id = %self.session_id, "session loop ended");
    }

    fn touch(&self) {
        self.last_active_ms
            .store(self.deps.clock.now_wall().timestamp_millis(), Ordering::Relaxed);
    }

    async fn handle_command(&mut self, command: SessionCommand) -> Flow {
        if self.quarantined {
            return self.refuse_quarantined(command);
        }
        match command {
            SessionCommand::AddToWatchlist { instrument, reply } => {
                let result = self.add_to_watchlist(instrument).await;
                let _ = reply.send(result);
            }
            SessionCommand::RemoveFromWatchlist { token, reply } => {
                let result = self.remove_from_watchlist(&token).await;
                let _ = reply.send(result);
            }
            SessionCommand::Watchlist { reply } => {
                let _ = reply.send(Ok(self.watchlist.clone()));
            }
            SessionCommand::SetReferenceDate { date, reply } => {
                self.reference_date = date;
                self.persist();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::UpdateOhlc { token, ohlc } => {
                self.update_ohlc(&token, ohlc);
            }
            SessionCommand::CreateAlert {
                instrument,
                condition,
                price,
                reply,
            } => {
                let _ = reply.send(self.create_alert(instrument, condition, price));
            }
            SessionCommand::DeleteAlert { alert_id, reply } => {
                let before = self.alerts.len();
                self.alerts.retain(|a| a.id != alert_id);
                if self.alerts.len() == before {
                    let _ = reply.send(Err(SessionError::AlertNotFound));
                } else {
                    self.persist();
                    let _ = reply.send(Ok(()));
                }
            }
            SessionCommand::DeleteAlerts { alert_ids, reply } => {
                let before = self.alerts.len();
                self.alerts.retain(|a| !alert_ids.contains(&a.id));
                let removed = before - self.alerts.len();
                if removed > 0 {
                    self.persist();
                }
                let _ = reply.send(Ok(removed));
            }
            SessionCommand::ClearAlerts { reply } => {
                let removed = self.alerts.len();
                self.alerts.clear();
                self.persist();
                let _ = reply.send(Ok(removed));
            }
            SessionCommand::PauseAlerts { paused, reply } => {
                self.alerts_paused = paused;
                self.persist();
                let _ = reply.send(Ok(self.alerts_paused));
            }
            SessionCommand::Alerts { reply } => {
                let _ = reply.send(Ok((self.alerts.clone(), self.alerts_paused)));
            }
            SessionCommand::AlertLogs { reply } => {
                let _ = reply.send(Ok(self.alert_log.iter().cloned().collect()));
            }
            SessionCommand::GenerateAutoAlerts {
                token,
                ohlc,
                levels,
                reply,
            } => {
                let _ = reply.send(self.generate_auto_alerts(&token, ohlc, levels));
            }
            SessionCommand::SetPaperEnabled { enabled, reply } => {
                self.auto_paper_enabled = enabled;
                self.persist();
                let _ = reply.send(Ok(self.auto_paper_enabled));
            }
            SessionCommand::SetVirtualBalance { balance, reply } => {
                if !(balance >= 0.0) || !balance.is_finite() {
                    let _ = reply.send(Err(SessionError::BadRequest(
                        "balance must be non-negative".to_string(),
                    )));
                } else {
                    self.virtual_balance = balance;
                    self.persist();
                    let _ = reply.send(Ok(self.virtual_balance));
                }
            }
            SessionCommand::SetStopLoss {
                trade_id,
                stop_loss,
                reply,
            } => {
                let result = self
                    .deps
                    .paper
                    .set_stop_loss(&mut self.trades, &trade_id, stop_loss)
                    .map_err(map_paper_error);
                if result.is_ok() {
                    self.persist();
                    self.push_trade_update();
                }
                let _ = reply.send(result);
            }
            SessionCommand::SetTarget {
                trade_id,
                target,
                reply,
            } => {
                let result = self
                    .deps
                    .paper
                    .set_target(&mut self.trades, &trade_id, target)
                    .map_err(map_paper_error);
                if result.is_ok() {
                    self.persist();
                    self.push_trade_update();
                }
                let _ = reply.send(result);
            }
            SessionCommand::CloseTrade {
                trade_id,
                price,
                reply,
            } => {
                let _ = reply.send(self.close_trade(trade_id, price));
            }
            SessionCommand::ManualTrade {
                token,
                side,
                price,
                reply,
            } => {
                let _ = reply.send(self.manual_trade(&token, side, price));
            }
            SessionCommand::PaperSummary { reply } => {
                let _ = reply.send(Ok(PaperOverview {
                    auto_paper_enabled: self.auto_paper_enabled,
                    virtual_balance: self.virtual_balance,
                    trades: self.trades.clone(),
                    summary: self.deps.paper.summary(&self.trades),
                }));
            }
            SessionCommand::ClearTrades { reply } => {
                let removed = self.trades.len();
                self.trades.clear();
                self.persist();
                self.push_trade_update();
                let _ = reply.send(Ok(removed));
            }
            SessionCommand::ExportTradesCsv { reply } => {
                let _ = reply.send(Ok(self.deps.paper.export_csv(&self.trades)));
            }
            SessionCommand::Describe { reply } => {
                let _ = reply.send(Ok(self.overview()));
            }
            SessionCommand::BindChannel { channel, reply } => {
                if let Some(old) = self.channel.take() {
                    old.close_with(SUPERSEDED_CODE);
                }
                // The connected frame is pushed through the session loop so
                // it is strictly first in the channel's FIFO.
                let _ = channel.try_push(ServerMessage::Connected {
                    session_id: self.session_id,
                });
                if !self.trades.is_empty() {
                    let _ = channel.try_push(ServerMessage::TradeUpdate {
                        trades: self.trades.clone(),
                    });
                }
                self.channel = Some(channel);
                let _ = reply.send(Ok(()));
            }
            SessionCommand::UnbindChannel { channel_id, clean } => {
                if self
                    .channel
                    .as_ref()
                    .is_some_and(|c| c.id == channel_id)
                {
                    self.channel = None;
                }
                // Clean or not, the session stays warm; a non-clean close
                // just means the client will be back for a rebind.
                let _ = clean;
            }
            SessionCommand::Shutdown { done } => {
                self.persist();
                if let Some(done) = done {
                    let _ = done.send(());
                }
                return Flow::Stop;
            }
        }
        Flow::Continue
    }

    fn refuse_quarantined(&mut self, command: SessionCommand) -> Flow {
        match command {
            SessionCommand::Shutdown { done } => {
                if let Some(done) = done {
                    let _ = done.send(());
                }
                Flow::Stop
            }
            SessionCommand::AddToWatchlist { reply, .. } => refuse(reply),
            SessionCommand::RemoveFromWatchlist { reply, .. } => refuse(reply),
            SessionCommand::Watchlist { reply } => refuse(reply),
            SessionCommand::SetReferenceDate { reply, .. } => refuse(reply),
            SessionCommand::CreateAlert { reply, .. } => refuse(reply),
            SessionCommand::DeleteAlert { reply, .. } => refuse(reply),
            SessionCommand::DeleteAlerts { reply, .. } => refuse(reply),
            SessionCommand::ClearAlerts { reply } => refuse(reply),
            SessionCommand::PauseAlerts { reply, .. } => refuse(reply),
            SessionCommand::Alerts { reply } => refuse(reply),
            SessionCommand::AlertLogs { reply } => refuse(reply),
            SessionCommand::GenerateAutoAlerts { reply, .. } => refuse(reply),
            SessionCommand::SetPaperEnabled { reply, .. } => refuse(reply),
            SessionCommand::SetVirtualBalance { reply, .. } => refuse(reply),
            SessionCommand::SetStopLoss { reply, .. } => refuse(reply),
            SessionCommand::SetTarget { reply, .. } => refuse(reply),
            SessionCommand::CloseTrade { reply, .. } => refuse(reply),
            SessionCommand::ManualTrade { reply, .. } => refuse(reply),
            SessionCommand::PaperSummary { reply } => refuse(reply),
            SessionCommand::ClearTrades { reply } => refuse(reply),
            SessionCommand::ExportTradesCsv { reply } => refuse(reply),
            SessionCommand::Describe { reply } => refuse(reply),
            SessionCommand::BindChannel { channel, reply } => {
                channel.close_with(QUARANTINE_CODE);
                let _ = reply.send(Err(SessionError::Quarantined));
                Flow::Continue
            }
            SessionCommand::UnbindChannel { .. } | SessionCommand::UpdateOhlc { .. } => {
                Flow::Continue
            }
        }
    }

    async fn add_to_watchlist(
        &mut self,
        instrument: Instrument,
    ) -> Result<WatchlistItem, SessionError> {
        if self.watchlist.iter().any(|w| w.instrument.token == instrument.token) {
            return Err(SessionError::DuplicateWatchlistEntry);
        }
        let item = WatchlistItem {
            instrument,
            ohlc: None,
            ltp: None,
            added_at: self.deps.clock.now_wall(),
        };
        let id = item.id();
        self.watchlist.push(item.clone());
        self.deps.feed.subscribe(self.session_id, vec![id]).await;
        self.persist();
        Ok(item)
    }

    async fn remove_from_watchlist(&mut self, token: &str) -> Result<(), SessionError> {
        let index = self
            .watchlist
            .iter()
            .position(|w| w.instrument.token == token)
            .ok_or(SessionError::UnknownInstrument)?;
        let item = self.watchlist.remove(index);
        // Orphaned alerts go with the instrument.
        self.alerts.retain(|a| a.token != token);
        self.deps
            .feed
            .unsubscribe(self.session_id, vec![item.id()])
            .await;
        self.persist();
        Ok(())
    }

    fn update_ohlc(&mut self, token: &str, ohlc: DayOhlc) {
        let Some(item) = self
            .watchlist
            .iter_mut()
            .find(|w| w.instrument.token == token)
        else {
            return;
        };
        item.ohlc = Some(ohlc);
        let id = item.id();
        // PDC seeds the edge-trigger baseline until the first live tick.
        self.last_seen.entry(id).or_insert(ohlc.close);
        self.persist();
    }

    fn create_alert(
        &mut self,
        instrument: Instrument,
        condition: AlertCondition,
        price: f64,
    ) -> Result<Alert, SessionError> {
        if !(price > 0.0) || !price.is_finite() {
            return Err(SessionError::InvalidPrice);
        }
        let alert = Alert {
            id: new_id(),
            symbol: instrument.symbol,
            token: instrument.token,
            exchange: instrument.exchange,
            condition,
            price,
            kind: AlertKind::Manual,
            armed: true,
            created_at: self.deps.clock.now_wall(),
        };
        self.alerts.push(alert.clone());
        self.persist();
        Ok(alert)
    }

    fn generate_auto_alerts(
        &mut self,
        token: &str,
        ohlc: DayOhlc,
        levels: Option<Vec<AutoLevel>>,
    ) -> Result<Vec<Alert>, SessionError> {
        let item = self
            .watchlist
            .iter_mut()
            .find(|w| w.instrument.token == token)
            .ok_or(SessionError::UnknownInstrument)?;
        item.ohlc = Some(ohlc);
        let instrument = item.instrument.clone();
        let id = instrument.id();
        self.last_seen.entry(id.clone()).or_insert(ohlc.close);
        let anchor = self.last_seen.get(&id).copied().unwrap_or(ohlc.close);

        let fresh = alert_engine::build_auto_alerts(
            &instrument,
            &ohlc,
            anchor,
            levels.as_deref(),
            self.deps.clock.now_wall(),
        )
        .map_err(|err| SessionError::ReferenceData(err.to_string()))?;

        // Idempotent replacement: armed auto alerts for this token drop
        // before the new ladder is installed.
        self.alerts
            .retain(|a| !(a.token == token && a.kind.is_auto() && a.armed));
        // A level landing exactly on a surviving alert (same token, price,
        // condition) is skipped, not duplicated.
        let fresh: Vec<Alert> = fresh
            .into_iter()
            .filter(|candidate| {
                !self.alerts.iter().any(|a| {
                    a.token == candidate.token
                        && a.price == candidate.price
                        && a.condition == candidate.condition
                })
            })
            .collect();
        self.alerts.extend(fresh.iter().cloned());
        self.log(
            LogKind::Info,
            &instrument.symbol,
            format!("generated {} level alerts", fresh.len()),
            None,
            None,
            None,
        );
        self.persist();
        Ok(fresh)
    }

    fn close_trade(
        &mut self,
        trade_id: Uuid,
        price: Option<f64>,
    ) -> Result<PaperTrade, SessionError> {
        let price = match price {
            Some(price) => price,
            None => {
                let trade = self
                    .trades
                    .iter()
                    .find(|t| t.id == trade_id)
                    .ok_or(SessionError::TradeNotFound)?;
                self.last_seen
                    .get(&trade.instrument_id())
                    .copied()
                    .unwrap_or(trade.entry_price)
            }
        };
        let now = self.deps.clock.now_wall();
        let closed = self
            .deps
            .paper
            .close(&mut self.trades, &trade_id, price, now)
            .map_err(map_paper_error)?;
        self.settle_close(&closed);
        self.push_trade_update();
        self.persist();
        Ok(closed)
    }

    fn manual_trade(
        &mut self,
        token: &str,
        side: TradeSide,
        price: Option<f64>,
    ) -> Result<PaperTrade, SessionError> {
        let item = self
            .watchlist
            .iter()
            .find(|w| w.instrument.token == token)
            .ok_or(SessionError::UnknownInstrument)?;
        let instrument = item.instrument.clone();
        let price = price
            .or(item.ltp)
            .or_else(|| self.last_seen.get(&instrument.id()).copied())
            .ok_or_else(|| {
                SessionError::ReferenceData("no price observed for instrument yet".to_string())
            })?;

        let signal = EntrySignal {
            instrument,
            price,
            side,
            trigger_level: AlertKind::Manual.label(),
            origin: EntryOrigin::Manual,
        };
        let now = self.deps.clock.now_wall();
        let outcome = self
            .deps
            .paper
            .enter(&mut self.trades, self.virtual_balance, signal, now)
            .map_err(map_paper_error)?;
        let trade = match outcome {
            EntryOutcome::Opened(trade) | EntryOutcome::Averaged(trade) => trade,
            EntryOutcome::Reversed(trade) => trade,
        };
        self.log(
            LogKind::PaperOpen,
            &trade.symbol,
            format!("manual {} {} @ {}", trade.side, trade.symbol, price),
            Some(price),
            None,
            None,
        );
        self.push_trade_update();
        self.persist();
        Ok(trade)
    }

    fn on_tick(&mut self, tick: Tick) {
        let id = tick.id();
        let Some(item) = self
            .watchlist
            .iter_mut()
            .find(|w| w.instrument.token == tick.token)
        else {
            // Late tick for a token this session no longer watches.
            return;
        };
        item.ltp = Some(tick.ltp);
        let symbol = item.instrument.symbol.clone();
        let pdc = item.ohlc.map(|o| o.close);

        let prev = self.last_seen.get(&id).copied().or(pdc);
        let mut durable_change = false;

        // Alert evaluation. Paused sessions still update the baseline so
        // unpausing does not replay historical crossings.
        if !self.alerts_paused {
            let fired = alert_engine::scan_triggers(&self.alerts, &tick.token, prev, tick.ltp);
            let mut fired_alerts = Vec::with_capacity(fired.len());
            for index in fired.iter().rev() {
                fired_alerts.push(self.alerts.remove(*index));
            }
            // Removal walked backwards to keep indices stable; firing runs in
            // creation order.
            fired_alerts.reverse();
            for mut alert in fired_alerts {
                alert.armed = false;
                durable_change = true;
                self.fire_alert(alert, &tick);
            }
        }
        self.last_seen.insert(id, tick.ltp);

        let now = self.deps.clock.now_wall();
        let mut trades_changed = self
            .deps
            .paper
            .mark_to_market(&mut self.trades, &tick.token, tick.ltp);

        let exited = self
            .deps
            .paper
            .sweep_exits(&mut self.trades, &tick.token, tick.ltp, now);
        for closed in &exited {
            self.settle_close(closed);
        }
        if !exited.is_empty() {
            durable_change = true;
            trades_changed = true;
        }

        if self.deps.auto_square_off && self.trades.iter().any(PaperTrade::is_open) {
            let today = self.deps.clock.market_day_for(now);
            if self.squared_off_day != Some(today) && self.deps.clock.is_square_off_window(now) {
                let prices: HashMap<String, f64> = self
                    .last_seen
                    .iter()
                    .map(|(id, ltp)| (id.token.clone(), *ltp))
                    .collect();
                let squared = self
                    .deps
                    .paper
                    .square_off(&mut self.trades, &prices, now);
                for closed in &squared {
                    self.settle_close(closed);
                }
                if !squared.is_empty() {
                    durable_change = true;
                    trades_changed = true;
                }
                self.squared_off_day = Some(today);
            }
        }

        self.push_frame(ServerMessage::PriceUpdate {
            token: tick.token.clone(),
            symbol,
            ltp: tick.ltp,
        });
        if trades_changed {
            self.push_trade_update();
        }
        if durable_change {
            self.persist();
        }
    }

    /// A fired alert: log it, notify the client, and hand the paper engine
    /// its entry signal when auto trading is on.
    fn fire_alert(&mut self, alert: Alert, tick: &Tick) {
        tracing::info!(
            session_id = %self.session_id,
            symbol = %alert.symbol,
            price = alert.price,
            condition = ?alert.condition,
            ltp = tick.ltp,
            "alert triggered"
        );
        let log = AlertLogEntry {
            ts: self.deps.clock.now_wall(),
            kind: LogKind::AlertTriggered,
            symbol: alert.symbol.clone(),
            message: format!(
                "{} hit {} ({:?})",
                alert.symbol, alert.price, alert.condition
            ),
            price: Some(tick.ltp),
            alert_id: Some(alert.id),
            pnl: None,
        };
        self.push_log(log.clone());
        self.push_frame(ServerMessage::AlertTriggered {
            alert: alert.clone(),
            log,
        });

        if !self.auto_paper_enabled {
            return;
        }
        let signal = EntrySignal {
            instrument: Instrument {
                exchange: alert.exchange,
                token: alert.token.clone(),
                symbol: alert.symbol.clone(),
            },
            price: tick.ltp,
            side: alert_engine::entry_side(alert.kind, alert.condition),
            trigger_level: alert.kind.label(),
            origin: EntryOrigin::Auto,
        };
        let now = self.deps.clock.now_wall();
        match self
            .deps
            .paper
            .enter(&mut self.trades, self.virtual_balance, signal, now)
        {
            Ok(EntryOutcome::Opened(trade)) | Ok(EntryOutcome::Averaged(trade)) => {
                self.log(
                    LogKind::PaperOpen,
                    &trade.symbol,
                    format!(
                        "virtual {} {} x{} @ {} ({})",
                        trade.side, trade.symbol, trade.quantity, trade.entry_price,
                        trade.trigger_level
                    ),
                    Some(trade.entry_price),
                    None,
                    None,
                );
                self.push_trade_update();
            }
            Ok(EntryOutcome::Reversed(closed)) => {
                self.settle_close(&closed);
                self.push_trade_update();
            }
            Err(err) => {
                self.log(
                    LogKind::Info,
                    &alert.symbol,
                    format!("auto entry refused: {err}"),
                    Some(tick.ltp),
                    None,
                    None,
                );
            }
        }
    }

    /// Realized P&L is credited to the virtual balance at close.
    fn settle_close(&mut self, closed: &PaperTrade) {
        self.virtual_balance += closed.pnl;
        self.log(
            LogKind::PaperClose,
            &closed.symbol,
            format!(
                "closed {} {} @ {} pnl {:.2}",
                closed.side,
                closed.symbol,
                closed.exit_price.unwrap_or(closed.entry_price),
                closed.pnl
            ),
            closed.exit_price,
            None,
            Some(closed.pnl),
        );
    }

    fn overview(&self) -> SessionOverview {
        SessionOverview {
            session_id: self.session_id,
            user_id: self.user_id.clone(),
            watchlist: self.watchlist.clone(),
            reference_date: self.reference_date,
            auto_paper_enabled: self.auto_paper_enabled,
            alerts_paused: self.alerts_paused,
            virtual_balance: self.virtual_balance,
            active_alerts: self.alerts.len(),
            open_trades: self.trades.iter().filter(|t| t.is_open()).count(),
        }
    }

    fn log(
        &mut self,
        kind: LogKind,
        symbol: &str,
        message: String,
        price: Option<f64>,
        alert_id: Option<Uuid>,
        pnl: Option<f64>,
    ) {
        let entry = AlertLogEntry {
            ts: self.deps.clock.now_wall(),
            kind,
            symbol: symbol.to_string(),
            message,
            price,
            alert_id,
            pnl,
        };
        self.push_log(entry);
    }

    fn push_log(&mut self, entry: AlertLogEntry) {
        self.alert_log.push_front(entry);
        while self.alert_log.len() > self.deps.alert_log_cap {
            self.alert_log.pop_back();
        }
    }

    fn push_trade_update(&mut self) {
        self.push_frame(ServerMessage::TradeUpdate {
            trades: self.trades.clone(),
        });
    }

    fn push_frame(&mut self, frame: ServerMessage) {
        let Some(channel) = &self.channel else {
            return;
        };
        match channel.try_push(frame) {
            Ok(()) => {}
            Err(PushError::Full) => {
                // Slow consumer: drop the channel, keep the session.
                channel.close_with(SLOW_CONSUMER_CODE);
                metrics::counter!("channels.slow_consumer_closes").increment(1);
                self.channel = None;
            }
            Err(PushError::Closed) => {
                self.channel = None;
            }
        }
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            version: SNAPSHOT_VERSION,
            user_id: self.user_id.clone(),
            broker: self.broker.clone(),
            watchlist: self.watchlist.clone(),
            alerts: self.alerts.clone(),
            alert_log: self.alert_log.iter().cloned().collect(),
            paper_trades: self.trades.clone(),
            virtual_balance: self.virtual_balance,
            auto_paper_enabled: self.auto_paper_enabled,
            alerts_paused: self.alerts_paused,
            reference_date: self.reference_date,
            saved_at: self.deps.clock.now_wall(),
        }
    }

    /// Submit the current snapshot to the write-behind worker. Serialization
    /// failure is the fatal-programmer-error path: quarantine the session.
    fn persist(&mut self) {
        match serde_json::to_vec(&self.snapshot()) {
            Ok(bytes) => self.deps.flush.submit(self.user_id.clone(), bytes),
            Err(err) => {
                tracing::error!(
                    session_id = %self.session_id,
                    error = %err,
                    "snapshot serialization failed, quarantining session"
                );
                self.quarantined = true;
                if let Some(channel) = self.channel.take() {
                    channel.close_with(QUARANTINE_CODE);
                }
            }
        }
    }
}

fn refuse<T>(reply: Responder<T>) -> Flow {
    let _ = reply.send(Err(SessionError::Quarantined));
    Flow::Continue
}

fn map_paper_error(err: PaperError) -> SessionError {
    match err {
        PaperError::InvalidPrice => SessionError::InvalidPrice,
        PaperError::InsufficientBalance => SessionError::InsufficientBalance,
        PaperError::PositionExists => SessionError::PositionExists,
        PaperError::TradeNotFound => SessionError::TradeNotFound,
        PaperError::TradeClosed => SessionError::TradeClosed,
    }
}
