use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub type SessionId = Uuid;
pub type UserId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Exchange {
    Nse,
    Nfo,
    Bse,
    Mcx,
}

impl Exchange {
    /// Numeric exchange-type code used by the broker's streaming protocol.
    pub fn stream_code(self) -> u8 {
        match self {
            Self::Nse => 1,
            Self::Nfo => 2,
            Self::Bse => 3,
            Self::Mcx => 5,
        }
    }

    pub fn from_stream_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Nse),
            2 => Some(Self::Nfo),
            3 => Some(Self::Bse),
            5 => Some(Self::Mcx),
            _ => None,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            Self::Nse => "NSE",
            Self::Nfo => "NFO",
            Self::Bse => "BSE",
            Self::Mcx => "MCX",
        };
        f.write_str(value)
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NSE" => Ok(Self::Nse),
            "NFO" => Ok(Self::Nfo),
            "BSE" => Ok(Self::Bse),
            "MCX" => Ok(Self::Mcx),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

/// Stable instrument identity: `(exchange, token)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstrumentId {
    pub exchange: Exchange,
    pub token: String,
}

impl InstrumentId {
    pub fn new(exchange: Exchange, token: impl Into<String>) -> Self {
        Self {
            exchange,
            token: token.into(),
        }
    }
}

impl fmt::Display for InstrumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.token)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: Exchange,
    pub token: String,
    pub symbol: String,
}

impl Instrument {
    pub fn id(&self) -> InstrumentId {
        InstrumentId::new(self.exchange, self.token.clone())
    }
}

/// OHLC of one completed market day; seeds auto alerts and edge-trigger state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DayOhlc {
    pub day: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchlistItem {
    pub instrument: Instrument,
    #[serde(default)]
    pub ohlc: Option<DayOhlc>,
    #[serde(default)]
    pub ltp: Option<f64>,
    pub added_at: DateTime<Utc>,
}

impl WatchlistItem {
    pub fn id(&self) -> InstrumentId {
        self.instrument.id()
    }
}

/// One decoded price observation. Ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub exchange: Exchange,
    pub token: String,
    pub ltp: f64,
    /// Exchange timestamp in epoch milliseconds.
    pub ts_server: i64,
}

impl Tick {
    pub fn id(&self) -> InstrumentId {
        InstrumentId::new(self.exchange, self.token.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertCondition {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AutoLevel {
    High,
    Low,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    S1,
    S2,
    S3,
    S4,
    S5,
    S6,
}

impl AutoLevel {
    pub const ALL: [AutoLevel; 14] = [
        Self::High,
        Self::Low,
        Self::R1,
        Self::R2,
        Self::R3,
        Self::R4,
        Self::R5,
        Self::R6,
        Self::S1,
        Self::S2,
        Self::S3,
        Self::S4,
        Self::S5,
        Self::S6,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Low => "LOW",
            Self::R1 => "R1",
            Self::R2 => "R2",
            Self::R3 => "R3",
            Self::R4 => "R4",
            Self::R5 => "R5",
            Self::R6 => "R6",
            Self::S1 => "S1",
            Self::S2 => "S2",
            Self::S3 => "S3",
            Self::S4 => "S4",
            Self::S5 => "S5",
            Self::S6 => "S6",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|l| l.label().eq_ignore_ascii_case(label.trim()))
    }

    /// Support levels map to BUY-on-touch entry signals; the rest to SELL.
    pub fn is_support(self) -> bool {
        matches!(
            self,
            Self::Low | Self::S1 | Self::S2 | Self::S3 | Self::S4 | Self::S5 | Self::S6
        )
    }
}

impl fmt::Display for AutoLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Alert provenance: manual, or auto-generated from a named pivot level.
/// Serialized as `"MANUAL"` / `"AUTO_<LEVEL>"` on the wire and in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AlertKind {
    Manual,
    Auto(AutoLevel),
}

impl AlertKind {
    pub fn label(self) -> String {
        match self {
            Self::Manual => "MANUAL".to_string(),
            Self::Auto(level) => format!("AUTO_{}", level.label()),
        }
    }

    pub fn is_auto(self) -> bool {
        matches!(self, Self::Auto(_))
    }
}

impl From<AlertKind> for String {
    fn from(kind: AlertKind) -> Self {
        kind.label()
    }
}

impl TryFrom<String> for AlertKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let raw = value.trim().to_ascii_uppercase();
        if raw == "MANUAL" {
            return Ok(Self::Manual);
        }
        if let Some(level) = raw.strip_prefix("AUTO_").and_then(AutoLevel::from_label) {
            return Ok(Self::Auto(level));
        }
        Err(format!("unknown alert kind: {value}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub symbol: String,
    pub token: String,
    pub exchange: Exchange,
    pub condition: AlertCondition,
    pub price: f64,
    pub kind: AlertKind,
    pub armed: bool,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    pub fn instrument_id(&self) -> InstrumentId {
        InstrumentId::new(self.exchange, self.token.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    AlertTriggered,
    PaperOpen,
    PaperClose,
    Info,
}

/// One entry of the session's bounded activity log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLogEntry {
    pub ts: DateTime<Utc>,
    pub kind: LogKind,
    pub symbol: String,
    pub message: String,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub alert_id: Option<Uuid>,
    #[serde(default)]
    pub pnl: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl fmt::Display for TradeSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeMode {
    New,
    Averaged,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaperTrade {
    pub id: Uuid,
    pub symbol: String,
    pub token: String,
    pub exchange: Exchange,
    pub side: TradeSide,
    pub quantity: u32,
    pub entry_price: f64,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub target: Option<f64>,
    pub status: TradeStatus,
    pub mode: TradeMode,
    /// Alert kind label that opened this trade, or "MANUAL".
    pub trigger_level: String,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    /// Derived: floating while OPEN, realized once CLOSED.
    pub pnl: f64,
}

impl PaperTrade {
    pub fn instrument_id(&self) -> InstrumentId {
        InstrumentId::new(self.exchange, self.token.clone())
    }

    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    pub fn pnl_at(&self, price: f64) -> f64 {
        let per_unit = match self.side {
            TradeSide::Buy => price - self.entry_price,
            TradeSide::Sell => self.entry_price - price,
        };
        per_unit * f64::from(self.quantity)
    }
}

/// Broker-issued credentials delegated to the upstream feed client.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerTokens {
    pub api_key: String,
    pub client_code: String,
    pub jwt_token: String,
    pub feed_token: String,
}

impl fmt::Debug for BrokerTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerTokens")
            .field("client_code", &self.client_code)
            .field("api_key", &"…")
            .field("jwt_token", &"…")
            .field("feed_token", &"…")
            .finish()
    }
}

/// Frame pushed to a browser over the downstream channel.
/// Wire shape: `{"type": "...", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: SessionId,
    },
    PriceUpdate {
        token: String,
        symbol: String,
        ltp: f64,
    },
    AlertTriggered {
        alert: Alert,
        log: AlertLogEntry,
    },
    TradeUpdate {
        trades: Vec<PaperTrade>,
    },
    Heartbeat {
        ts: i64,
    },
    Pong {
        ts: i64,
    },
    Status {
        status: String,
    },
    Error {
        code: String,
        detail: String,
    },
}

/// Frame accepted from a browser. Everything except `ping` is reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    #[serde(other)]
    Unknown,
}

/// Errors carried as values in the command-reply protocol. Never crosses a
/// task boundary as a panic; the HTTP handler or channel writer turns it into
/// a user-visible frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("session not found")]
    SessionNotFound,
    #[error("instrument already in watchlist")]
    DuplicateWatchlistEntry,
    #[error("instrument not in watchlist")]
    UnknownInstrument,
    #[error("alert not found")]
    AlertNotFound,
    #[error("price must be positive")]
    InvalidPrice,
    #[error("trade not found")]
    TradeNotFound,
    #[error("trade already closed")]
    TradeClosed,
    #[error("virtual balance too low for entry")]
    InsufficientBalance,
    #[error("open position already exists for this side")]
    PositionExists,
    #[error("session overloaded, retry shortly")]
    Overloaded,
    #[error("session quarantined after an internal fault")]
    Quarantined,
    #[error("reference data unavailable: {0}")]
    ReferenceData(String),
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl SessionError {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::DuplicateWatchlistEntry => "DUPLICATE_WATCHLIST_ENTRY",
            Self::UnknownInstrument => "UNKNOWN_INSTRUMENT",
            Self::AlertNotFound => "ALERT_NOT_FOUND",
            Self::InvalidPrice => "INVALID_PRICE",
            Self::TradeNotFound => "TRADE_NOT_FOUND",
            Self::TradeClosed => "TRADE_CLOSED",
            Self::InsufficientBalance => "INSUFFICIENT_BALANCE",
            Self::PositionExists => "POSITION_EXISTS",
            Self::Overloaded => "OVERLOADED",
            Self::Quarantined => "QUARANTINED",
            Self::ReferenceData(_) => "REFERENCE_DATA",
            Self::BadRequest(_) => "BAD_REQUEST",
        }
    }

    pub fn retriable(&self) -> bool {
        matches!(self, Self::Overloaded)
    }
}

pub fn new_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_kind_labels_round_trip() {
        for level in AutoLevel::ALL {
            let kind = AlertKind::Auto(level);
            let parsed = AlertKind::try_from(kind.label()).expect("parse");
            assert_eq!(parsed, kind);
        }
        assert_eq!(
            AlertKind::try_from("MANUAL".to_string()).expect("manual"),
            AlertKind::Manual
        );
        assert!(AlertKind::try_from("AUTO_R9".to_string()).is_err());
    }

    #[test]
    fn server_message_wire_shape() {
        let frame = ServerMessage::PriceUpdate {
            token: "2885".to_string(),
            symbol: "RELIANCE".to_string(),
            ltp: 2500.5,
        };
        let wire = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(wire["type"], "price_update");
        assert_eq!(wire["data"]["token"], "2885");
        assert_eq!(wire["data"]["ltp"], 2500.5);
    }

    #[test]
    fn client_message_tolerates_unknown_types() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).expect("ping");
        assert_eq!(ping, ClientMessage::Ping);
        let other: ClientMessage =
            serde_json::from_str(r#"{"type":"resize"}"#).expect("unknown");
        assert_eq!(other, ClientMessage::Unknown);
    }

    #[test]
    fn pnl_sign_follows_side() {
        let trade = PaperTrade {
            id: new_id(),
            symbol: "RELIANCE".to_string(),
            token: "2885".to_string(),
            exchange: Exchange::Nse,
            side: TradeSide::Sell,
            quantity: 10,
            entry_price: 2500.0,
            exit_price: None,
            stop_loss: None,
            target: None,
            status: TradeStatus::Open,
            mode: TradeMode::New,
            trigger_level: "AUTO_R1".to_string(),
            opened_at: Utc::now(),
            closed_at: None,
            pnl: 0.0,
        };
        assert_eq!(trade.pnl_at(2490.0), 100.0);
        assert_eq!(trade.pnl_at(2510.0), -100.0);
    }

    #[test]
    fn broker_tokens_debug_is_redacted() {
        let tokens = BrokerTokens {
            api_key: "key".to_string(),
            client_code: "A123".to_string(),
            jwt_token: "secretvalue".to_string(),
            feed_token: "secretvalue".to_string(),
        };
        let rendered = format!("{tokens:?}");
        assert!(rendered.contains("A123"));
        assert!(!rendered.contains("secretvalue"));
    }
}
