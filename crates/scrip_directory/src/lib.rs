use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use core_types::{BrokerTokens, DayOhlc, Instrument};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};

const DEFAULT_MASTER_URL: &str =
    "https://margincalculator.angelone.in/OpenAPI_File/files/OpenAPIScripMaster.json";
const DEFAULT_CANDLE_URL: &str =
    "https://apiconnect.angelone.in/rest/secure/angelbroking/historical/v1/getCandleData";

/// One row of the broker's scrip master dump.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scrip {
    pub token: String,
    pub symbol: String,
    #[serde(default)]
    pub name: String,
    pub exch_seg: String,
}

impl Scrip {
    fn is_nse_equity(&self) -> bool {
        self.exch_seg == "NSE" && self.symbol.contains("-EQ")
    }
}

#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    pub master_url: String,
    pub cache_path: PathBuf,
    pub cache_ttl: Duration,
    pub search_limit: usize,
    pub min_prefix: usize,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            master_url: DEFAULT_MASTER_URL.to_string(),
            cache_path: PathBuf::from("data/scripmaster.json"),
            cache_ttl: Duration::from_secs(24 * 3600),
            search_limit: 15,
            min_prefix: 3,
        }
    }
}

/// Token ↔ symbol directory backed by the broker's scrip master, cached on
/// disk for a day so restarts do not re-download several megabytes.
pub struct ScripDirectory {
    http: Client,
    cfg: DirectoryConfig,
    scrips: RwLock<Vec<Scrip>>,
}

impl ScripDirectory {
    pub fn new(cfg: DirectoryConfig) -> Self {
        Self {
            http: Client::new(),
            cfg,
            scrips: RwLock::new(Vec::new()),
        }
    }

    /// Load from the disk cache when fresh, otherwise download and re-cache.
    /// Returns the number of NSE equity scrips available for search.
    pub async fn load(&self) -> Result<usize> {
        if let Some(cached) = self.read_fresh_cache() {
            let count = cached.len();
            *self.scrips.write() = cached;
            tracing::info!(count, "scrip master loaded from cache");
            return Ok(count);
        }

        let all: Vec<Scrip> = self
            .http
            .get(&self.cfg.master_url)
            .send()
            .await
            .context("scrip master request")?
            .error_for_status()
            .context("scrip master status")?
            .json()
            .await
            .context("scrip master json")?;

        let filtered: Vec<Scrip> = all.into_iter().filter(Scrip::is_nse_equity).collect();

        if let Some(parent) = self.cfg.cache_path.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match serde_json::to_vec(&filtered) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&self.cfg.cache_path, bytes) {
                    tracing::warn!(error = %err, "scrip master cache write failed");
                }
            }
            Err(err) => tracing::warn!(error = %err, "scrip master cache encode failed"),
        }

        let count = filtered.len();
        *self.scrips.write() = filtered;
        tracing::info!(count, "scrip master downloaded");
        Ok(count)
    }

    fn read_fresh_cache(&self) -> Option<Vec<Scrip>> {
        let meta = fs::metadata(&self.cfg.cache_path).ok()?;
        let age = meta
            .modified()
            .ok()
            .and_then(|m| SystemTime::now().duration_since(m).ok())?;
        if age > self.cfg.cache_ttl {
            return None;
        }
        let raw = fs::read(&self.cfg.cache_path).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Prefix search over trading symbols. Queries shorter than the minimum
    /// prefix return nothing, mirroring the front-end's debounce contract.
    pub fn search(&self, query: &str) -> Vec<Scrip> {
        let query = query.trim().to_ascii_uppercase();
        if query.len() < self.cfg.min_prefix {
            return Vec::new();
        }
        self.scrips
            .read()
            .iter()
            .filter(|s| s.symbol.starts_with(&query))
            .take(self.cfg.search_limit)
            .cloned()
            .collect()
    }

    pub fn lookup_token(&self, token: &str) -> Option<Scrip> {
        self.scrips.read().iter().find(|s| s.token == token).cloned()
    }

    pub fn len(&self) -> usize {
        self.scrips.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.scrips.read().is_empty()
    }
}

/// Daily candle as returned by the broker's historical API:
/// `[timestamp, open, high, low, close, volume]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DayCandle {
    pub day: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

impl DayCandle {
    pub fn into_ohlc(self) -> DayOhlc {
        DayOhlc {
            day: self.day,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
        }
    }
}

pub fn parse_candle_rows(rows: &[serde_json::Value]) -> Vec<DayCandle> {
    rows.iter()
        .filter_map(|row| {
            let arr = row.as_array()?;
            let ts = arr.first()?.as_str()?;
            // "2024-03-04T00:00:00+05:30"; the date prefix is all we need.
            let day = ts.split('T').next()?;
            let day = NaiveDate::parse_from_str(day, "%Y-%m-%d").ok()?;
            Some(DayCandle {
                day,
                open: arr.get(1)?.as_f64()?,
                high: arr.get(2)?.as_f64()?,
                low: arr.get(3)?.as_f64()?,
                close: arr.get(4)?.as_f64()?,
            })
        })
        .collect()
}

/// Pick the candle that seeds alerts: the requested day when given, else the
/// most recent completed day (today's half-formed candle is skipped unless it
/// is the only one available).
pub fn select_reference_candle(
    candles: &[DayCandle],
    wanted: Option<NaiveDate>,
    today: NaiveDate,
) -> Option<DayCandle> {
    if let Some(day) = wanted {
        return candles.iter().copied().find(|c| c.day == day);
    }
    candles
        .iter()
        .copied()
        .filter(|c| c.day < today)
        .next_back()
        .or_else(|| candles.last().copied())
}

/// Previous-day OHLC seam. The REST implementation talks to the broker; the
/// static one backs tests and offline runs.
#[async_trait]
pub trait OhlcProvider: Send + Sync {
    async fn day_ohlc(
        &self,
        creds: &BrokerTokens,
        instrument: &Instrument,
        wanted: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<DayOhlc>;
}

pub struct AngelRestOhlc {
    http: Client,
    endpoint: String,
}

impl AngelRestOhlc {
    pub fn new(endpoint: Option<String>) -> Self {
        Self {
            http: Client::new(),
            endpoint: endpoint.unwrap_or_else(|| DEFAULT_CANDLE_URL.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CandleResponse {
    #[serde(default)]
    status: bool,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Vec<serde_json::Value>,
}

#[async_trait]
impl OhlcProvider for AngelRestOhlc {
    async fn day_ohlc(
        &self,
        creds: &BrokerTokens,
        instrument: &Instrument,
        wanted: Option<NaiveDate>,
        today: NaiveDate,
    ) -> Result<DayOhlc> {
        // 14 calendar days of lookback rides out weekends and holiday runs.
        let from = today - chrono::Duration::days(14);
        let body = serde_json::json!({
            "exchange": instrument.exchange.to_string(),
            "symboltoken": instrument.token,
            "interval": "ONE_DAY",
            "fromdate": format!("{} 09:00", from.format("%Y-%m-%d")),
            "todate": format!("{} 15:30", today.format("%Y-%m-%d")),
        });

        let response: CandleResponse = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&creds.jwt_token)
            .header("X-PrivateKey", &creds.api_key)
            .header("X-ClientCode", &creds.client_code)
            .header("X-SourceID", "WEB")
            .header("X-UserType", "USER")
            .json(&body)
            .send()
            .await
            .context("candle request")?
            .error_for_status()
            .context("candle status")?
            .json()
            .await
            .context("candle json")?;

        if !response.status {
            return Err(anyhow!(
                "candle api rejected request: {}",
                response.message.unwrap_or_else(|| "no message".to_string())
            ));
        }

        let candles = parse_candle_rows(&response.data);
        select_reference_candle(&candles, wanted, today)
            .map(DayCandle::into_ohlc)
            .ok_or_else(|| anyhow!("no usable daily candle for {}", instrument.symbol))
    }
}

/// Test/offline provider with canned OHLC per token.
#[derive(Default)]
pub struct StaticOhlc {
    by_token: RwLock<HashMap<String, DayOhlc>>,
}

impl StaticOhlc {
    pub fn insert(&self, token: impl Into<String>, ohlc: DayOhlc) {
        self.by_token.write().insert(token.into(), ohlc);
    }
}

#[async_trait]
impl OhlcProvider for StaticOhlc {
    async fn day_ohlc(
        &self,
        _creds: &BrokerTokens,
        instrument: &Instrument,
        _wanted: Option<NaiveDate>,
        _today: NaiveDate,
    ) -> Result<DayOhlc> {
        self.by_token
            .read()
            .get(&instrument.token)
            .copied()
            .ok_or_else(|| anyhow!("no canned ohlc for token {}", instrument.token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn scrip_rows_parse_vendor_shape() {
        let raw = r#"[
            {"token":"2885","symbol":"RELIANCE-EQ","name":"RELIANCE","expiry":"","strike":"-1.0","lotsize":"1","instrumenttype":"","exch_seg":"NSE","tick_size":"5.0"},
            {"token":"3045","symbol":"SBIN-EQ","name":"SBIN","exch_seg":"NSE"},
            {"token":"99926000","symbol":"NIFTY","name":"NIFTY","exch_seg":"NSE"},
            {"token":"500325","symbol":"RELIANCE","name":"RELIANCE","exch_seg":"BSE"}
        ]"#;
        let scrips: Vec<Scrip> = serde_json::from_str(raw).expect("parse");
        let equities: Vec<Scrip> = scrips.into_iter().filter(Scrip::is_nse_equity).collect();
        assert_eq!(equities.len(), 2);
        assert_eq!(equities[0].token, "2885");
    }

    #[test]
    fn search_respects_prefix_and_limit() {
        let dir = ScripDirectory::new(DirectoryConfig {
            cache_path: PathBuf::from("/nonexistent/never.json"),
            ..DirectoryConfig::default()
        });
        *dir.scrips.write() = vec![
            Scrip {
                token: "2885".to_string(),
                symbol: "RELIANCE-EQ".to_string(),
                name: "RELIANCE".to_string(),
                exch_seg: "NSE".to_string(),
            },
            Scrip {
                token: "3045".to_string(),
                symbol: "SBIN-EQ".to_string(),
                name: "SBIN".to_string(),
                exch_seg: "NSE".to_string(),
            },
        ];

        assert!(dir.search("re").is_empty());
        let hits = dir.search("rel");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].token, "2885");
        assert!(dir.lookup_token("3045").is_some());
    }

    #[test]
    fn candle_rows_parse_and_skip_garbage() {
        let rows = vec![
            serde_json::json!(["2024-03-01T00:00:00+05:30", 95.0, 110.0, 90.0, 100.0, 1000]),
            serde_json::json!(["garbage", 1, 2, 3, 4, 5]),
            serde_json::json!(["2024-03-04T00:00:00+05:30", 100.0, 112.0, 99.0, 111.0, 900]),
        ];
        let candles = parse_candle_rows(&rows);
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[1].day, day(2024, 3, 4));
        assert_eq!(candles[1].close, 111.0);
    }

    #[test]
    fn reference_candle_skips_today() {
        let candles = vec![
            DayCandle { day: day(2024, 3, 1), open: 1.0, high: 2.0, low: 0.5, close: 1.5 },
            DayCandle { day: day(2024, 3, 4), open: 1.5, high: 2.5, low: 1.0, close: 2.0 },
            DayCandle { day: day(2024, 3, 5), open: 2.0, high: 3.0, low: 1.5, close: 2.5 },
        ];

        // Today's half-formed candle is skipped.
        let picked = select_reference_candle(&candles, None, day(2024, 3, 5)).expect("candle");
        assert_eq!(picked.day, day(2024, 3, 4));

        // Explicit reference date wins.
        let picked =
            select_reference_candle(&candles, Some(day(2024, 3, 1)), day(2024, 3, 5)).expect("candle");
        assert_eq!(picked.day, day(2024, 3, 1));

        // A single candle that is today is still usable.
        let only_today = vec![candles[2]];
        let picked = select_reference_candle(&only_today, None, day(2024, 3, 5)).expect("candle");
        assert_eq!(picked.day, day(2024, 3, 5));

        assert!(select_reference_candle(&candles, Some(day(2024, 3, 2)), day(2024, 3, 5)).is_none());
    }
}
