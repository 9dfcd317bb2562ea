//! HTTP surface: the command producers feeding session loops. Handlers do no
//! state mutation themselves: they resolve a session handle, submit a
//! command, and translate the reply (or a typed refusal) onto the wire.

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::NaiveDate;
use core_types::{
    AlertCondition, AutoLevel, BrokerTokens, Exchange, Instrument, SessionError, SessionId,
    TradeSide, UserId,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::session::{SessionCommand, SessionHandle};
use crate::state::AppState;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/verify/{session_id}", get(verify))
        .route("/api/watchlist/{session_id}", get(watchlist))
        .route("/api/watchlist/add", post(watchlist_add))
        .route("/api/watchlist/remove", post(watchlist_remove))
        .route("/api/watchlist/refresh", post(watchlist_refresh))
        .route("/api/watchlist/reference-date", post(set_reference_date))
        .route("/api/alerts/{session_id}", get(alerts))
        .route("/api/alerts/create", post(alert_create))
        .route("/api/alerts/generate", post(alerts_generate))
        .route("/api/alerts/generate-bulk", post(alerts_generate_bulk))
        .route("/api/alerts/delete", post(alert_delete))
        .route("/api/alerts/delete-many", post(alerts_delete_many))
        .route("/api/alerts/clear-all", post(alerts_clear))
        .route("/api/alerts/pause", post(alerts_pause))
        .route("/api/alerts/logs/{session_id}", get(alert_logs))
        .route("/api/paper/summary/{session_id}", get(paper_summary))
        .route("/api/paper/toggle", post(paper_toggle))
        .route("/api/paper/close", post(paper_close))
        .route("/api/paper/clear", post(paper_clear))
        .route("/api/paper/balance", post(paper_balance))
        .route("/api/paper/stop-loss", post(paper_stop_loss))
        .route("/api/paper/target", post(paper_target))
        .route("/api/paper/manual-trade", post(paper_manual_trade))
        .route("/api/paper/export/{session_id}", get(paper_export))
        .route("/api/scrips/search/{query}", get(scrip_search))
        .route("/health", get(health))
        .route("/metrics", get(metrics_text))
}

pub struct ApiError(SessionError);

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SessionError::SessionNotFound
            | SessionError::UnknownInstrument
            | SessionError::AlertNotFound
            | SessionError::TradeNotFound => StatusCode::NOT_FOUND,
            SessionError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Quarantined => StatusCode::INTERNAL_SERVER_ERROR,
            SessionError::ReferenceData(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::BAD_REQUEST,
        };
        let body = Json(json!({
            "code": self.0.code(),
            "detail": self.0.to_string(),
            "retriable": self.0.retriable(),
        }));
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

async fn resolve(state: &AppState, session_id: SessionId) -> Result<SessionHandle, ApiError> {
    state
        .registry
        .resolve(session_id, None)
        .await
        .map_err(ApiError)
}

// ── auth ────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginRequest {
    api_key: String,
    client_code: String,
    jwt_token: String,
    feed_token: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    session_id: SessionId,
    user_id: UserId,
    message: String,
}

/// The broker handshake (password + TOTP) happens outside; this endpoint
/// accepts the issued tokens and opens a session keyed by the client code.
async fn login(State(state): State<AppState>, Json(req): Json<LoginRequest>) -> ApiResult<LoginResponse> {
    for (field, value) in [
        ("api_key", &req.api_key),
        ("client_code", &req.client_code),
        ("jwt_token", &req.jwt_token),
        ("feed_token", &req.feed_token),
    ] {
        if value.trim().is_empty() {
            return Err(SessionError::BadRequest(format!("{field} is required")).into());
        }
    }
    let broker = BrokerTokens {
        api_key: req.api_key,
        client_code: req.client_code.trim().to_string(),
        jwt_token: req.jwt_token,
        feed_token: req.feed_token,
    };
    let handle = state.registry.login(broker).await?;
    Ok(Json(LoginResponse {
        session_id: handle.session_id,
        user_id: handle.user_id.clone(),
        message: "login successful".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
struct SessionOnly {
    session_id: SessionId,
}

async fn logout(
    State(state): State<AppState>,
    Json(req): Json<SessionOnly>,
) -> ApiResult<serde_json::Value> {
    state.registry.logout(req.session_id).await?;
    Ok(Json(json!({"success": true})))
}

async fn verify(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<crate::session::SessionOverview> {
    let handle = resolve(&state, session_id).await?;
    let overview = handle
        .request(|reply| SessionCommand::Describe { reply })
        .await?;
    Ok(Json(overview))
}

// ── watchlist ───────────────────────────────────────────────────────

async fn watchlist(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, session_id).await?;
    let items = handle
        .request(|reply| SessionCommand::Watchlist { reply })
        .await?;
    Ok(Json(json!({ "watchlist": items })))
}

#[derive(Debug, Deserialize)]
struct AddStockRequest {
    session_id: SessionId,
    symbol: String,
    token: String,
    #[serde(default)]
    exchange: Option<String>,
}

async fn watchlist_add(
    State(state): State<AppState>,
    Json(req): Json<AddStockRequest>,
) -> ApiResult<serde_json::Value> {
    let exchange: Exchange = req
        .exchange
        .as_deref()
        .unwrap_or("NSE")
        .parse()
        .map_err(SessionError::BadRequest)?;
    let instrument = Instrument {
        exchange,
        token: req.token.trim().to_string(),
        symbol: req.symbol.trim().to_uppercase(),
    };
    if instrument.token.is_empty() || instrument.symbol.is_empty() {
        return Err(SessionError::BadRequest("symbol and token are required".to_string()).into());
    }

    let handle = resolve(&state, req.session_id).await?;
    let item = handle
        .request(|reply| SessionCommand::AddToWatchlist {
            instrument: instrument.clone(),
            reply,
        })
        .await?;

    spawn_ohlc_refresh(state.clone(), handle, vec![instrument]);
    Ok(Json(json!({ "success": true, "stock": item })))
}

#[derive(Debug, Deserialize)]
struct RemoveStockRequest {
    session_id: SessionId,
    token: String,
}

async fn watchlist_remove(
    State(state): State<AppState>,
    Json(req): Json<RemoveStockRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    handle
        .request(|reply| SessionCommand::RemoveFromWatchlist {
            token: req.token.clone(),
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true})))
}

async fn watchlist_refresh(
    State(state): State<AppState>,
    Json(req): Json<SessionOnly>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let items = handle
        .request(|reply| SessionCommand::Watchlist { reply })
        .await?;
    let count = items.len();
    spawn_ohlc_refresh(
        state.clone(),
        handle,
        items.into_iter().map(|i| i.instrument).collect(),
    );
    Ok(Json(json!({"success": true, "refreshing": count})))
}

#[derive(Debug, Deserialize)]
struct ReferenceDateRequest {
    session_id: SessionId,
    /// `YYYY-MM-DD`, or absent to fall back to the previous market day.
    date: Option<NaiveDate>,
}

async fn set_reference_date(
    State(state): State<AppState>,
    Json(req): Json<ReferenceDateRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    handle
        .request(|reply| SessionCommand::SetReferenceDate {
            date: req.date,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "reference_date": req.date})))
}

/// Previous-day OHLC arrives out-of-band: fetched here, then applied through
/// the session's own command loop.
fn spawn_ohlc_refresh(state: AppState, handle: SessionHandle, instruments: Vec<Instrument>) {
    tokio::spawn(async move {
        let today = state.clock.market_today();
        for instrument in instruments {
            match state
                .ohlc
                .day_ohlc(&handle.broker, &instrument, None, today)
                .await
            {
                Ok(ohlc) => {
                    let _ = handle.try_send(SessionCommand::UpdateOhlc {
                        token: instrument.token.clone(),
                        ohlc,
                    });
                }
                Err(err) => {
                    tracing::warn!(symbol = %instrument.symbol, error = %err, "ohlc refresh failed");
                }
            }
        }
    });
}

// ── alerts ──────────────────────────────────────────────────────────

async fn alerts(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, session_id).await?;
    let (alerts, paused) = handle
        .request(|reply| SessionCommand::Alerts { reply })
        .await?;
    Ok(Json(json!({"alerts": alerts, "is_paused": paused})))
}

#[derive(Debug, Deserialize)]
struct CreateAlertRequest {
    session_id: SessionId,
    symbol: String,
    token: String,
    #[serde(default)]
    exchange: Option<String>,
    condition: AlertCondition,
    price: f64,
}

async fn alert_create(
    State(state): State<AppState>,
    Json(req): Json<CreateAlertRequest>,
) -> ApiResult<serde_json::Value> {
    let exchange: Exchange = req
        .exchange
        .as_deref()
        .unwrap_or("NSE")
        .parse()
        .map_err(SessionError::BadRequest)?;
    let handle = resolve(&state, req.session_id).await?;
    let alert = handle
        .request(|reply| SessionCommand::CreateAlert {
            instrument: Instrument {
                exchange,
                token: req.token.clone(),
                symbol: req.symbol.trim().to_uppercase(),
            },
            condition: req.condition,
            price: req.price,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "alert": alert})))
}

fn parse_levels(raw: &Option<Vec<String>>) -> Result<Option<Vec<AutoLevel>>, ApiError> {
    let Some(raw) = raw else { return Ok(None) };
    if raw.is_empty() {
        return Ok(None);
    }
    let mut levels = Vec::with_capacity(raw.len());
    for label in raw {
        let level = AutoLevel::from_label(label)
            .ok_or_else(|| SessionError::BadRequest(format!("unknown level: {label}")))?;
        levels.push(level);
    }
    Ok(Some(levels))
}

#[derive(Debug, Deserialize)]
struct GenerateAlertsRequest {
    session_id: SessionId,
    token: String,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    levels: Option<Vec<String>>,
}

async fn alerts_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateAlertsRequest>,
) -> ApiResult<serde_json::Value> {
    let levels = parse_levels(&req.levels)?;
    let handle = resolve(&state, req.session_id).await?;
    let overview = handle
        .request(|reply| SessionCommand::Describe { reply })
        .await?;
    let item = overview
        .watchlist
        .iter()
        .find(|w| w.instrument.token == req.token)
        .ok_or(SessionError::UnknownInstrument)?;

    let wanted = req.date.or(overview.reference_date);
    let today = state.clock.market_today();
    let ohlc = state
        .ohlc
        .day_ohlc(&handle.broker, &item.instrument, wanted, today)
        .await
        .map_err(|err| SessionError::ReferenceData(err.to_string()))?;

    let alerts = handle
        .request(|reply| SessionCommand::GenerateAutoAlerts {
            token: req.token.clone(),
            ohlc,
            levels: levels.clone(),
            reply,
        })
        .await?;
    Ok(Json(json!({
        "success": true,
        "count": alerts.len(),
        "alerts": alerts,
    })))
}

#[derive(Debug, Deserialize)]
struct GenerateBulkRequest {
    session_id: SessionId,
    #[serde(default)]
    date: Option<NaiveDate>,
    #[serde(default)]
    levels: Option<Vec<String>>,
}

/// Bulk generation iterates the watchlist; one instrument failing its OHLC
/// fetch must not abort the batch.
async fn alerts_generate_bulk(
    State(state): State<AppState>,
    Json(req): Json<GenerateBulkRequest>,
) -> ApiResult<serde_json::Value> {
    let levels = parse_levels(&req.levels)?;
    let handle = resolve(&state, req.session_id).await?;
    let overview = handle
        .request(|reply| SessionCommand::Describe { reply })
        .await?;
    if overview.watchlist.is_empty() {
        return Err(SessionError::BadRequest("watchlist is empty".to_string()).into());
    }

    let wanted = req.date.or(overview.reference_date);
    let today = state.clock.market_today();
    let mut total = 0usize;
    let mut results = Vec::with_capacity(overview.watchlist.len());

    for item in &overview.watchlist {
        let symbol = item.instrument.symbol.clone();
        let outcome = match state
            .ohlc
            .day_ohlc(&handle.broker, &item.instrument, wanted, today)
            .await
        {
            Ok(ohlc) => {
                handle
                    .request(|reply| SessionCommand::GenerateAutoAlerts {
                        token: item.instrument.token.clone(),
                        ohlc,
                        levels: levels.clone(),
                        reply,
                    })
                    .await
            }
            Err(err) => Err(SessionError::ReferenceData(err.to_string())),
        };
        match outcome {
            Ok(alerts) => {
                total += alerts.len();
                results.push(json!({"symbol": symbol, "success": true, "count": alerts.len()}));
            }
            Err(err) => {
                results.push(json!({"symbol": symbol, "success": false, "error": err.to_string()}));
            }
        }
    }

    Ok(Json(json!({
        "success": true,
        "total_alerts": total,
        "total_stocks": overview.watchlist.len(),
        "results": results,
    })))
}

#[derive(Debug, Deserialize)]
struct DeleteAlertRequest {
    session_id: SessionId,
    alert_id: Uuid,
}

async fn alert_delete(
    State(state): State<AppState>,
    Json(req): Json<DeleteAlertRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    handle
        .request(|reply| SessionCommand::DeleteAlert {
            alert_id: req.alert_id,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct DeleteAlertsRequest {
    session_id: SessionId,
    alert_ids: Vec<Uuid>,
}

async fn alerts_delete_many(
    State(state): State<AppState>,
    Json(req): Json<DeleteAlertsRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let removed = handle
        .request(|reply| SessionCommand::DeleteAlerts {
            alert_ids: req.alert_ids.clone(),
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "count": removed})))
}

async fn alerts_clear(
    State(state): State<AppState>,
    Json(req): Json<SessionOnly>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let removed = handle
        .request(|reply| SessionCommand::ClearAlerts { reply })
        .await?;
    Ok(Json(json!({"success": true, "count": removed})))
}

#[derive(Debug, Deserialize)]
struct PauseRequest {
    session_id: SessionId,
    paused: bool,
}

async fn alerts_pause(
    State(state): State<AppState>,
    Json(req): Json<PauseRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let paused = handle
        .request(|reply| SessionCommand::PauseAlerts {
            paused: req.paused,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "is_paused": paused})))
}

async fn alert_logs(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, session_id).await?;
    let logs = handle
        .request(|reply| SessionCommand::AlertLogs { reply })
        .await?;
    Ok(Json(json!({ "logs": logs })))
}

// ── paper trading ───────────────────────────────────────────────────

async fn paper_summary(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> ApiResult<crate::session::PaperOverview> {
    let handle = resolve(&state, session_id).await?;
    let overview = handle
        .request(|reply| SessionCommand::PaperSummary { reply })
        .await?;
    Ok(Json(overview))
}

#[derive(Debug, Deserialize)]
struct ToggleRequest {
    session_id: SessionId,
    enabled: bool,
}

async fn paper_toggle(
    State(state): State<AppState>,
    Json(req): Json<ToggleRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let enabled = handle
        .request(|reply| SessionCommand::SetPaperEnabled {
            enabled: req.enabled,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "auto_paper_trade": enabled})))
}

#[derive(Debug, Deserialize)]
struct CloseTradeRequest {
    session_id: SessionId,
    trade_id: Uuid,
    #[serde(default)]
    price: Option<f64>,
}

async fn paper_close(
    State(state): State<AppState>,
    Json(req): Json<CloseTradeRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let trade = handle
        .request(|reply| SessionCommand::CloseTrade {
            trade_id: req.trade_id,
            price: req.price,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "trade": trade})))
}

async fn paper_clear(
    State(state): State<AppState>,
    Json(req): Json<SessionOnly>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let removed = handle
        .request(|reply| SessionCommand::ClearTrades { reply })
        .await?;
    Ok(Json(json!({"success": true, "count": removed})))
}

#[derive(Debug, Deserialize)]
struct BalanceRequest {
    session_id: SessionId,
    balance: f64,
}

async fn paper_balance(
    State(state): State<AppState>,
    Json(req): Json<BalanceRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let balance = handle
        .request(|reply| SessionCommand::SetVirtualBalance {
            balance: req.balance,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "virtual_balance": balance})))
}

#[derive(Debug, Deserialize)]
struct StopLossRequest {
    session_id: SessionId,
    trade_id: Uuid,
    #[serde(default)]
    stop_loss: Option<f64>,
}

async fn paper_stop_loss(
    State(state): State<AppState>,
    Json(req): Json<StopLossRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    handle
        .request(|reply| SessionCommand::SetStopLoss {
            trade_id: req.trade_id,
            stop_loss: req.stop_loss,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct TargetRequest {
    session_id: SessionId,
    trade_id: Uuid,
    #[serde(default)]
    target: Option<f64>,
}

async fn paper_target(
    State(state): State<AppState>,
    Json(req): Json<TargetRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    handle
        .request(|reply| SessionCommand::SetTarget {
            trade_id: req.trade_id,
            target: req.target,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true})))
}

#[derive(Debug, Deserialize)]
struct ManualTradeRequest {
    session_id: SessionId,
    token: String,
    side: TradeSide,
    #[serde(default)]
    price: Option<f64>,
}

async fn paper_manual_trade(
    State(state): State<AppState>,
    Json(req): Json<ManualTradeRequest>,
) -> ApiResult<serde_json::Value> {
    let handle = resolve(&state, req.session_id).await?;
    let trade = handle
        .request(|reply| SessionCommand::ManualTrade {
            token: req.token.clone(),
            side: req.side,
            price: req.price,
            reply,
        })
        .await?;
    Ok(Json(json!({"success": true, "trade": trade})))
}

async fn paper_export(
    State(state): State<AppState>,
    Path(session_id): Path<SessionId>,
) -> Result<Response, ApiError> {
    let handle = resolve(&state, session_id).await?;
    let csv = handle
        .request(|reply| SessionCommand::ExportTradesCsv { reply })
        .await?;
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=\"paper_trades.csv\"",
            ),
        ],
        csv,
    )
        .into_response())
}

// ── scrips & ops ────────────────────────────────────────────────────

async fn scrip_search(
    State(state): State<AppState>,
    Path(query): Path<String>,
) -> ApiResult<serde_json::Value> {
    Ok(Json(json!({ "results": state.scrips.search(&query) })))
}

async fn health(State(state): State<AppState>) -> ApiResult<serde_json::Value> {
    Ok(Json(json!({
        "status": "ok",
        "sessions": state.registry.session_count(),
        "feed": state.feed.stats().snapshot(),
    })))
}

async fn metrics_text(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.prometheus.render(),
    )
}
