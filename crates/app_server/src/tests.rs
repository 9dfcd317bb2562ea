//! End-to-end scenarios over the real session loops: manual clock, mock
//! upstream broker, real registry/store/feed wiring. No network, no HTTP;
//! producers talk to sessions exactly the way the route handlers do.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use core_types::{
    AlertCondition, AlertKind, BrokerTokens, Exchange, Instrument, InstrumentId, ServerMessage,
    SessionError, Tick, TradeSide, TradeStatus,
};
use dashmap::DashMap;
use feed_angel::testing::MockBroker;
use feed_angel::{codec, FeedClient, FeedConfig, FeedHandle};
use infra_clock::{ManualClock, MarketClock, SquareOffWindow};
use paper_engine::{PaperConfig, PaperEngine};
use session_store::{FlushHandle, SnapshotStore};
use tokio::time::{sleep, timeout};

use crate::channel::{open_channel, ChannelRx, SLOW_CONSUMER_CODE};
use crate::registry::{RegistrySink, SessionIndex, SessionRegistry};
use crate::session::{SessionCommand, SessionDeps, SessionHandle};

struct Harness {
    clock: Arc<ManualClock>,
    broker: MockBroker,
    registry: Arc<SessionRegistry>,
    flush: FlushHandle,
    feed: FeedHandle,
}

fn window() -> SquareOffWindow {
    SquareOffWindow::parse("15:15", "15:30").expect("window")
}

/// 10:30 IST on a weekday, comfortably before the square-off window.
fn trading_morning() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 4, 5, 0, 0).unwrap()
}

fn feed_test_config() -> FeedConfig {
    FeedConfig {
        connect_timeout: Duration::from_secs(2),
        read_deadline: Duration::from_secs(5),
        ping_interval: Duration::from_secs(60),
        backoff_base: Duration::from_millis(10),
        backoff_max: Duration::from_millis(50),
        batch_window: Duration::from_millis(10),
        linger: Duration::from_secs(60),
        decode_error_threshold: 25,
        ..FeedConfig::default()
    }
}

fn build_harness(dir: &Path, clock: Arc<ManualClock>) -> Harness {
    let store = Arc::new(SnapshotStore::open(dir).expect("store"));
    let flush = session_store::spawn_flush_worker(store.clone(), Duration::from_secs(3600));

    let sessions: SessionIndex = Arc::new(DashMap::new());
    let broker = MockBroker::new();
    let feed = FeedClient::spawn(
        feed_test_config(),
        Arc::new(broker.clone()),
        Arc::new(RegistrySink::new(sessions.clone())),
    );

    let deps = SessionDeps {
        clock: clock.clone(),
        feed: feed.clone(),
        flush: flush.clone(),
        paper: PaperEngine::new(PaperConfig {
            per_trade_cap: 1.0,
            averaging_enabled: false,
        }),
        auto_square_off: true,
        alert_log_cap: 500,
        command_queue: 64,
    };
    let registry = SessionRegistry::new(sessions, store, deps);

    Harness {
        clock,
        broker,
        registry,
        flush,
        feed,
    }
}

fn creds() -> BrokerTokens {
    BrokerTokens {
        api_key: "key".to_string(),
        client_code: "A100".to_string(),
        jwt_token: "jwt".to_string(),
        feed_token: "feed".to_string(),
    }
}

fn reliance() -> Instrument {
    Instrument {
        exchange: Exchange::Nse,
        token: "2885".to_string(),
        symbol: "RELIANCE".to_string(),
    }
}

impl Harness {
    async fn login(&self) -> SessionHandle {
        self.registry.login(creds()).await.expect("login")
    }

    async fn add_reliance(&self, handle: &SessionHandle) {
        handle
            .request(|reply| SessionCommand::AddToWatchlist {
                instrument: reliance(),
                reply,
            })
            .await
            .expect("add to watchlist");
    }

    /// Inject a tick directly into the session's conflating mailbox, the same
    /// way the registry sink does.
    fn tick(&self, handle: &SessionHandle, token: &str, ltp: f64) {
        let tick = Tick {
            exchange: Exchange::Nse,
            token: token.to_string(),
            ltp,
            ts_server: self.clock.now_wall().timestamp_millis(),
        };
        handle.mailbox.publish(tick.id(), tick);
    }

    async fn tick_and_settle(&self, handle: &SessionHandle, token: &str, ltp: f64) {
        self.tick(handle, token, ltp);
        settle().await;
    }

    /// Bind a fresh channel; returns its id (for unbind commands) and the
    /// client-side receiver.
    async fn bind_channel(&self, handle: &SessionHandle, queue: usize) -> (uuid::Uuid, ChannelRx) {
        let (channel, rx) = open_channel(queue);
        let id = channel.id;
        handle
            .request(|reply| SessionCommand::BindChannel { channel, reply })
            .await
            .expect("bind channel");
        (id, rx)
    }
}

/// Let spawned session/feed tasks run.
async fn settle() {
    sleep(Duration::from_millis(20)).await;
}

async fn drain_frames(rx: &mut ChannelRx) -> Vec<ServerMessage> {
    let mut frames = Vec::new();
    while let Ok(Some(frame)) = timeout(Duration::from_millis(50), rx.recv()).await {
        frames.push(frame);
    }
    frames
}

fn price_updates(frames: &[ServerMessage]) -> Vec<f64> {
    frames
        .iter()
        .filter_map(|f| match f {
            ServerMessage::PriceUpdate { ltp, .. } => Some(*ltp),
            _ => None,
        })
        .collect()
}

fn alert_frames(frames: &[ServerMessage]) -> Vec<&ServerMessage> {
    frames
        .iter()
        .filter(|f| matches!(f, ServerMessage::AlertTriggered { .. }))
        .collect()
}

async fn create_alert(handle: &SessionHandle, price: f64, condition: AlertCondition) {
    handle
        .request(|reply| SessionCommand::CreateAlert {
            instrument: reliance(),
            condition,
            price,
            reply,
        })
        .await
        .expect("create alert");
}

#[tokio::test]
async fn add_and_subscribe_reconciles_ledger() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;

    h.add_reliance(&handle).await;
    let id = InstrumentId::new(Exchange::Nse, "2885");
    assert!(h.feed.ledger().contains(&id, handle.session_id));

    // The feed client owes the broker exactly one subscribe delta carrying
    // the token, within the coalescing horizon.
    let deadline = tokio::time::Instant::now() + Duration::from_millis(150);
    loop {
        let tokens = h.broker.tokens_in_commands(codec::SUBSCRIBE_ACTION);
        if tokens.iter().filter(|t| t.as_str() == "2885").count() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "subscribe delta not observed in time: {tokens:?}"
        );
        sleep(Duration::from_millis(5)).await;
    }

    // Removing the instrument releases the subscription: ledger and
    // watchlist stay in lockstep.
    handle
        .request(|reply| SessionCommand::RemoveFromWatchlist {
            token: "2885".to_string(),
            reply,
        })
        .await
        .expect("remove");
    assert!(!h.feed.ledger().contains(&id, handle.session_id));
    assert!(h.feed.ledger().is_empty());
}

#[tokio::test]
async fn edge_trigger_fires_exactly_once_at_level() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    let (_, mut rx) = h.bind_channel(&handle, 64).await;

    create_alert(&handle, 2500.0, AlertCondition::Above).await;

    for ltp in [2498.0, 2499.0, 2500.0, 2501.0] {
        h.tick_and_settle(&handle, "2885", ltp).await;
    }

    let frames = drain_frames(&mut rx).await;
    let fired = alert_frames(&frames);
    assert_eq!(fired.len(), 1, "exactly one trigger expected: {frames:?}");
    let ServerMessage::AlertTriggered { alert, log } = fired[0] else {
        unreachable!();
    };
    assert_eq!(alert.price, 2500.0);
    assert!(!alert.armed);
    // The crossing tick itself is the observed price.
    assert_eq!(log.price, Some(2500.0));

    let (active, _) = handle
        .request(|reply| SessionCommand::Alerts { reply })
        .await
        .expect("alerts");
    assert!(active.is_empty());
    let logs = handle
        .request(|reply| SessionCommand::AlertLogs { reply })
        .await
        .expect("logs");
    assert_eq!(logs.iter().filter(|l| l.alert_id.is_some()).count(), 1);
}

#[tokio::test]
async fn alert_does_not_fire_from_wrong_side_at_startup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    let (_, mut rx) = h.bind_channel(&handle, 64).await;

    // Quote already sits past the level: no crossing, no trigger.
    create_alert(&handle, 2500.0, AlertCondition::Above).await;
    h.tick_and_settle(&handle, "2885", 2510.0).await;
    h.tick_and_settle(&handle, "2885", 2512.0).await;

    let frames = drain_frames(&mut rx).await;
    assert!(alert_frames(&frames).is_empty());
}

#[tokio::test]
async fn conflation_delivers_only_the_latest_price()
{
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    let (_, mut rx) = h.bind_channel(&handle, 256).await;
    settle().await;
    let _ = drain_frames(&mut rx).await;

    // Fifty ticks land while the session task is not scheduled (single
    // threaded test runtime, no await between publishes): the mailbox
    // conflates them into one slot.
    for i in 0..50 {
        h.tick(&handle, "2885", 2500.0 + f64::from(i));
    }
    settle().await;

    let frames = drain_frames(&mut rx).await;
    let prices = price_updates(&frames);
    assert_eq!(prices, vec![2549.0], "only the last price may surface");

    let overview = handle
        .request(|reply| SessionCommand::Describe { reply })
        .await
        .expect("describe");
    assert_eq!(overview.watchlist[0].ltp, Some(2549.0));
    assert!(handle.mailbox.conflated() >= 49);
}

#[tokio::test]
async fn abnormal_close_rebinds_without_resubscribing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    settle().await;

    let (channel_id, mut rx1) = h.bind_channel(&handle, 64).await;
    let frames = drain_frames(&mut rx1).await;
    assert!(matches!(frames[0], ServerMessage::Connected { .. }));

    let commands_before = h.broker.commands().len();
    let ledger_before = h.feed.ledger().len();

    // Transport failure (e.g. close code 1006): the reader reports a
    // non-clean unbind and the session stays warm.
    handle
        .try_send(SessionCommand::UnbindChannel {
            channel_id,
            clean: false,
        })
        .expect("unbind");
    settle().await;

    let (_, mut rx2) = h.bind_channel(&handle, 64).await;
    let frames = drain_frames(&mut rx2).await;
    let connected: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, ServerMessage::Connected { .. }))
        .collect();
    assert_eq!(connected.len(), 1);
    let ServerMessage::Connected { session_id } = connected[0] else {
        unreachable!();
    };
    assert_eq!(*session_id, handle.session_id);

    assert_eq!(h.feed.ledger().len(), ledger_before);
    assert_eq!(h.broker.commands().len(), commands_before);
}

#[tokio::test]
async fn restart_recovery_rehydrates_from_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(trading_morning(), window()));

    // First process lifetime: watchlist entry, armed alert, open trade.
    {
        let h = build_harness(dir.path(), clock.clone());
        let handle = h.login().await;
        h.add_reliance(&handle).await;
        create_alert(&handle, 2600.0, AlertCondition::Above).await;
        handle
            .request(|reply| SessionCommand::SetVirtualBalance {
                balance: 25_000.0,
                reply,
            })
            .await
            .expect("balance");
        let trade = handle
            .request(|reply| SessionCommand::ManualTrade {
                token: "2885".to_string(),
                side: TradeSide::Buy,
                price: Some(2500.0),
                reply,
            })
            .await
            .expect("manual trade");
        assert_eq!(trade.quantity, 10);
        h.flush.flush_now().await;
    }

    // Second process lifetime over the same data dir.
    let h = build_harness(dir.path(), clock);
    let stale_session = core_types::new_id();
    let handle = h
        .registry
        .resolve(stale_session, Some("A100"))
        .await
        .expect("rehydrate by user id");
    assert_eq!(handle.user_id, "A100");

    // Recovery issues exactly one subscribe delta for the watchlist token.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let tokens = h.broker.tokens_in_commands(codec::SUBSCRIBE_ACTION);
        if tokens == vec!["2885".to_string()] {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovery subscribe delta missing or duplicated: {tokens:?}"
        );
        sleep(Duration::from_millis(5)).await;
    }

    let (_, mut rx) = h.bind_channel(&handle, 64).await;
    let frames = drain_frames(&mut rx).await;
    assert!(matches!(frames[0], ServerMessage::Connected { .. }));
    let trade_updates: Vec<_> = frames
        .iter()
        .filter_map(|f| match f {
            ServerMessage::TradeUpdate { trades } => Some(trades),
            _ => None,
        })
        .collect();
    assert_eq!(trade_updates.len(), 1);
    assert_eq!(trade_updates[0].len(), 1);
    assert_eq!(trade_updates[0][0].status, TradeStatus::Open);

    let (alerts, _) = handle
        .request(|reply| SessionCommand::Alerts { reply })
        .await
        .expect("alerts");
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].armed);

    // Live P&L recomputes from the next observed tick.
    h.tick_and_settle(&handle, "2885", 2510.0).await;
    let overview = handle
        .request(|reply| SessionCommand::PaperSummary { reply })
        .await
        .expect("paper summary");
    assert_eq!(overview.summary.floating_pnl, 100.0);
}

#[tokio::test]
async fn square_off_closes_open_trades_inside_window_only() {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock = Arc::new(ManualClock::new(trading_morning(), window()));
    let h = build_harness(dir.path(), clock.clone());
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    handle
        .request(|reply| SessionCommand::SetVirtualBalance {
            balance: 25_000.0,
            reply,
        })
        .await
        .expect("balance");
    handle
        .request(|reply| SessionCommand::ManualTrade {
            token: "2885".to_string(),
            side: TradeSide::Buy,
            price: Some(2500.0),
            reply,
        })
        .await
        .expect("manual trade");
    let (_, mut rx) = h.bind_channel(&handle, 64).await;

    // One second before the window: nothing closes.
    clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 9, 44, 59).unwrap());
    h.tick_and_settle(&handle, "2885", 2505.0).await;
    let overview = handle
        .request(|reply| SessionCommand::PaperSummary { reply })
        .await
        .expect("summary");
    assert_eq!(overview.summary.open_trades, 1);

    // 15:15:00 IST exactly: the boundary tick squares off.
    clock.set(Utc.with_ymd_and_hms(2024, 3, 4, 9, 45, 0).unwrap());
    h.tick_and_settle(&handle, "2885", 2510.0).await;

    let overview = handle
        .request(|reply| SessionCommand::PaperSummary { reply })
        .await
        .expect("summary");
    assert_eq!(overview.summary.open_trades, 0);
    assert_eq!(overview.summary.closed_trades, 1);
    let closed = &overview.trades[0];
    assert_eq!(closed.exit_price, Some(2510.0));
    assert_eq!(closed.pnl, 100.0);
    // Realized P&L lands in the balance.
    assert_eq!(overview.virtual_balance, 25_100.0);

    let frames = drain_frames(&mut rx).await;
    assert!(frames.iter().any(|f| matches!(
        f,
        ServerMessage::TradeUpdate { trades } if trades.iter().any(|t| t.status == TradeStatus::Closed)
    )));
}

#[tokio::test]
async fn pause_suppresses_triggers_but_keeps_baseline_current() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    let (_, mut rx) = h.bind_channel(&handle, 64).await;
    create_alert(&handle, 2500.0, AlertCondition::Above).await;

    h.tick_and_settle(&handle, "2885", 2498.0).await;
    handle
        .request(|reply| SessionCommand::PauseAlerts {
            paused: true,
            reply,
        })
        .await
        .expect("pause");

    // The crossing happens while paused.
    h.tick_and_settle(&handle, "2885", 2501.0).await;
    handle
        .request(|reply| SessionCommand::PauseAlerts {
            paused: false,
            reply,
        })
        .await
        .expect("unpause");

    // Unpausing must not replay the historical crossing.
    h.tick_and_settle(&handle, "2885", 2502.0).await;

    let frames = drain_frames(&mut rx).await;
    assert!(alert_frames(&frames).is_empty());
    let (alerts, _) = handle
        .request(|reply| SessionCommand::Alerts { reply })
        .await
        .expect("alerts");
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].armed);
}

#[tokio::test]
async fn auto_alert_generation_replaces_idempotently() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    create_alert(&handle, 2345.0, AlertCondition::Below).await;
    // Sits exactly on the reference day's HIGH; generation must skip that
    // level instead of doubling it.
    create_alert(&handle, 2550.0, AlertCondition::Above).await;

    let ohlc = core_types::DayOhlc {
        day: chrono::NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        open: 2450.0,
        high: 2550.0,
        low: 2430.0,
        close: 2500.0,
    };
    let generate = |levels: Option<Vec<core_types::AutoLevel>>| {
        let handle = handle.clone();
        async move {
            handle
                .request(|reply| SessionCommand::GenerateAutoAlerts {
                    token: "2885".to_string(),
                    ohlc,
                    levels,
                    reply,
                })
                .await
                .expect("generate")
        }
    };

    let first = generate(None).await;
    let second = generate(None).await;

    let key = |alerts: &[core_types::Alert]| {
        let mut keys: Vec<(String, String)> = alerts
            .iter()
            .map(|a| (a.kind.label(), format!("{:.2}", a.price)))
            .collect();
        keys.sort();
        keys
    };
    assert_eq!(key(&first), key(&second));

    // The HIGH level duplicates the manual (2550, ABOVE) alert exactly and
    // must not be generated.
    assert!(first
        .iter()
        .all(|a| a.kind != AlertKind::Auto(core_types::AutoLevel::High)));

    let (active, _) = handle
        .request(|reply| SessionCommand::Alerts { reply })
        .await
        .expect("alerts");
    let auto_count = active.iter().filter(|a| a.kind.is_auto()).count();
    assert_eq!(auto_count, second.len(), "no auto alert may survive twice");
    // Both manual alerts are untouched by replacement, and 2550 appears only
    // once in the active set.
    assert_eq!(
        active.iter().filter(|a| a.kind == AlertKind::Manual).count(),
        2
    );
    assert_eq!(active.iter().filter(|a| a.price == 2550.0).count(), 1);
}

#[tokio::test]
async fn slow_consumer_channel_closes_but_session_survives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;

    // Tiny queue, never drained: the connected frame plus one price update
    // fill it, the next push overflows.
    let (_, rx) = h.bind_channel(&handle, 2).await;
    h.tick_and_settle(&handle, "2885", 2500.0).await;
    h.tick_and_settle(&handle, "2885", 2501.0).await;
    h.tick_and_settle(&handle, "2885", 2502.0).await;

    assert_eq!(rx.close_code(), SLOW_CONSUMER_CODE);

    // Session state is fully intact and keeps consuming ticks.
    let overview = handle
        .request(|reply| SessionCommand::Describe { reply })
        .await
        .expect("describe");
    assert_eq!(overview.watchlist.len(), 1);
    assert_eq!(overview.watchlist[0].ltp, Some(2502.0));
}

#[tokio::test]
async fn command_queue_overflow_reports_retriable_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;

    // Stuff the bounded queue faster than the loop can drain on a runtime
    // that has not yielded to it yet.
    let mut saw_overload = false;
    for _ in 0..256 {
        let result = handle.try_send(SessionCommand::UnbindChannel {
            channel_id: core_types::new_id(),
            clean: true,
        });
        if matches!(result, Err(SessionError::Overloaded)) {
            saw_overload = true;
            break;
        }
    }
    assert!(saw_overload, "bounded queue must refuse, not block");

    // After the loop drains, the session answers again.
    settle().await;
    handle
        .request(|reply| SessionCommand::Describe { reply })
        .await
        .expect("describe after overflow");
}

#[tokio::test]
async fn logout_discards_session_and_snapshot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let h = build_harness(dir.path(), Arc::new(ManualClock::new(trading_morning(), window())));
    let handle = h.login().await;
    h.add_reliance(&handle).await;
    h.flush.flush_now().await;

    h.registry
        .logout(handle.session_id)
        .await
        .expect("logout");
    h.flush.flush_now().await;
    settle().await;

    assert!(h.feed.ledger().is_empty());
    assert!(matches!(
        h.registry.resolve(handle.session_id, Some("A100")).await,
        Err(SessionError::SessionNotFound)
    ));
}
