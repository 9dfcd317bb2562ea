use chrono::{DateTime, Utc};
use core_types::{
    new_id, Alert, AlertCondition, AlertKind, AutoLevel, DayOhlc, Instrument, TradeSide,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum AlertEngineError {
    #[error("reference day range is degenerate (high {high} <= low {low})")]
    DegenerateRange { high: f64, low: f64 },
}

/// Classic floor-pivot ladder computed from one completed market day.
/// `P = (H + L + C) / 3`; rungs beyond R3/S3 extend by the day range.
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PivotLevels {
    pub pivot: f64,
    pub high: f64,
    pub low: f64,
    pub r: [f64; 6],
    pub s: [f64; 6],
}

pub fn compute_pivots(ohlc: &DayOhlc) -> Result<PivotLevels, AlertEngineError> {
    let (high, low, close) = (ohlc.high, ohlc.low, ohlc.close);
    if !(high > low) || !high.is_finite() || !low.is_finite() || !close.is_finite() {
        return Err(AlertEngineError::DegenerateRange { high, low });
    }

    let pivot = (high + low + close) / 3.0;
    let range = high - low;

    let r1 = 2.0 * pivot - low;
    let s1 = 2.0 * pivot - high;
    let r2 = pivot + range;
    let s2 = pivot - range;
    let r3 = high + 2.0 * (pivot - low);
    let s3 = low - 2.0 * (high - pivot);

    Ok(PivotLevels {
        pivot,
        high,
        low,
        r: [r1, r2, r3, r3 + range, r3 + 2.0 * range, r3 + 3.0 * range],
        s: [s1, s2, s3, s3 - range, s3 - 2.0 * range, s3 - 3.0 * range],
    })
}

impl PivotLevels {
    pub fn price_of(&self, level: AutoLevel) -> f64 {
        match level {
            AutoLevel::High => self.high,
            AutoLevel::Low => self.low,
            AutoLevel::R1 => self.r[0],
            AutoLevel::R2 => self.r[1],
            AutoLevel::R3 => self.r[2],
            AutoLevel::R4 => self.r[3],
            AutoLevel::R5 => self.r[4],
            AutoLevel::R6 => self.r[5],
            AutoLevel::S1 => self.s[0],
            AutoLevel::S2 => self.s[1],
            AutoLevel::S3 => self.s[2],
            AutoLevel::S4 => self.s[3],
            AutoLevel::S5 => self.s[4],
            AutoLevel::S6 => self.s[5],
        }
    }
}

fn round_tick(price: f64) -> f64 {
    (price * 100.0).round() / 100.0
}

/// Build the canonical auto-alert set for one instrument. `anchor` is the
/// last observed price (PDC when no tick has been seen yet): levels above it
/// become ABOVE alerts, below it BELOW alerts; a level sitting exactly on the
/// anchor is skipped. Negative rungs of deep support ladders are dropped.
pub fn build_auto_alerts(
    instrument: &Instrument,
    ohlc: &DayOhlc,
    anchor: f64,
    levels: Option<&[AutoLevel]>,
    now: DateTime<Utc>,
) -> Result<Vec<Alert>, AlertEngineError> {
    let pivots = compute_pivots(ohlc)?;
    let mut out = Vec::new();

    for level in AutoLevel::ALL {
        if let Some(wanted) = levels {
            if !wanted.contains(&level) {
                continue;
            }
        }
        let price = round_tick(pivots.price_of(level));
        if price <= 0.0 {
            continue;
        }
        let condition = if price > anchor {
            AlertCondition::Above
        } else if price < anchor {
            AlertCondition::Below
        } else {
            continue;
        };
        out.push(Alert {
            id: new_id(),
            symbol: instrument.symbol.clone(),
            token: instrument.token.clone(),
            exchange: instrument.exchange,
            condition,
            price,
            kind: AlertKind::Auto(level),
            armed: true,
            created_at: now,
        });
    }

    Ok(out)
}

/// Edge-trigger predicate. Fires only on a true crossing: the previous
/// observation sat strictly on the far side of the level and the current tick
/// reached it. With no previous observation nothing fires: an alert already
/// on the wrong side of the quote must not trigger at startup.
pub fn crossing_fires(
    condition: AlertCondition,
    level: f64,
    prev: Option<f64>,
    ltp: f64,
) -> bool {
    let Some(prev) = prev else {
        return false;
    };
    match condition {
        AlertCondition::Above => prev < level && ltp >= level,
        AlertCondition::Below => prev > level && ltp <= level,
    }
}

/// Indices of armed alerts for `token` fired by this tick, in creation order.
pub fn scan_triggers(alerts: &[Alert], token: &str, prev: Option<f64>, ltp: f64) -> Vec<usize> {
    alerts
        .iter()
        .enumerate()
        .filter(|(_, alert)| {
            alert.armed
                && alert.token == token
                && crossing_fires(alert.condition, alert.price, prev, ltp)
        })
        .map(|(idx, _)| idx)
        .collect()
}

/// Entry direction for the paper engine when an alert fires. Support levels
/// buy the touch, resistance levels sell it; HIGH/LOW and manual alerts
/// follow the same mean-reversion convention.
pub fn entry_side(kind: AlertKind, condition: AlertCondition) -> TradeSide {
    match kind {
        AlertKind::Auto(level) => {
            if level.is_support() {
                TradeSide::Buy
            } else {
                TradeSide::Sell
            }
        }
        AlertKind::Manual => match condition {
            AlertCondition::Above => TradeSide::Sell,
            AlertCondition::Below => TradeSide::Buy,
        },
    }
}
