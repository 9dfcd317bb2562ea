use std::collections::HashMap;

use chrono::{DateTime, Utc};
use core_types::{
    new_id, Instrument, PaperTrade, TradeMode, TradeSide, TradeStatus,
};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PaperError {
    #[error("price must be positive")]
    InvalidPrice,
    #[error("virtual balance too low for entry")]
    InsufficientBalance,
    #[error("open position already exists for this side")]
    PositionExists,
    #[error("trade not found")]
    TradeNotFound,
    #[error("trade already closed")]
    TradeClosed,
}

#[derive(Debug, Clone, Copy)]
pub struct PaperConfig {
    /// Fraction of the virtual balance a single entry may consume.
    pub per_trade_cap: f64,
    /// Whether a same-side entry averages into the open position.
    pub averaging_enabled: bool,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            per_trade_cap: 1.0,
            averaging_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Triggered by an alert; opposing open positions are stopped-and-reversed.
    Auto,
    /// Operator action; opposing open positions are refused instead.
    Manual,
}

#[derive(Debug, Clone)]
pub struct EntrySignal {
    pub instrument: Instrument,
    pub price: f64,
    pub side: TradeSide,
    pub trigger_level: String,
    pub origin: EntryOrigin,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EntryOutcome {
    Opened(PaperTrade),
    Averaged(PaperTrade),
    /// Stop-and-reverse closed the opposing trade; no new position was opened.
    Reversed(PaperTrade),
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PaperSummary {
    pub realized_pnl: f64,
    pub floating_pnl: f64,
    pub total_pnl: f64,
    pub open_trades: usize,
    pub closed_trades: usize,
    pub wins: usize,
    pub losses: usize,
}

/// Pure book logic over a session's trade list. The session command loop owns
/// the `Vec<PaperTrade>` and the virtual balance; this engine never does I/O.
#[derive(Debug, Clone, Default)]
pub struct PaperEngine {
    cfg: PaperConfig,
}

impl PaperEngine {
    pub fn new(cfg: PaperConfig) -> Self {
        Self { cfg }
    }

    fn size_for(&self, balance: f64, price: f64) -> u32 {
        let budget = balance * self.cfg.per_trade_cap.clamp(0.0, 1.0);
        let qty = (budget / price).floor();
        if qty.is_finite() && qty > 0.0 {
            qty.min(f64::from(u32::MAX)) as u32
        } else {
            0
        }
    }

    pub fn enter(
        &self,
        trades: &mut Vec<PaperTrade>,
        balance: f64,
        signal: EntrySignal,
        now: DateTime<Utc>,
    ) -> Result<EntryOutcome, PaperError> {
        if !(signal.price > 0.0) || !signal.price.is_finite() {
            return Err(PaperError::InvalidPrice);
        }

        let token = &signal.instrument.token;

        if let Some(opposing) = trades
            .iter()
            .position(|t| t.is_open() && &t.token == token && t.side == signal.side.opposite())
        {
            match signal.origin {
                EntryOrigin::Auto => {
                    let closed = close_at(&mut trades[opposing], signal.price, now);
                    return Ok(EntryOutcome::Reversed(closed));
                }
                EntryOrigin::Manual => return Err(PaperError::PositionExists),
            }
        }

        if balance <= 0.0 {
            return Err(PaperError::InsufficientBalance);
        }
        let quantity = self.size_for(balance, signal.price);
        if quantity == 0 {
            return Err(PaperError::InsufficientBalance);
        }

        if let Some(existing) = trades
            .iter()
            .position(|t| t.is_open() && &t.token == token && t.side == signal.side)
        {
            if !self.cfg.averaging_enabled {
                return Err(PaperError::PositionExists);
            }
            let trade = &mut trades[existing];
            let prev_qty = f64::from(trade.quantity);
            let add_qty = f64::from(quantity);
            trade.entry_price =
                (trade.entry_price * prev_qty + signal.price * add_qty) / (prev_qty + add_qty);
            trade.quantity += quantity;
            trade.mode = TradeMode::Averaged;
            trade.pnl = trade.pnl_at(signal.price);
            return Ok(EntryOutcome::Averaged(trade.clone()));
        }

        let trade = PaperTrade {
            id: new_id(),
            symbol: signal.instrument.symbol.clone(),
            token: signal.instrument.token.clone(),
            exchange: signal.instrument.exchange,
            side: signal.side,
            quantity,
            entry_price: signal.price,
            exit_price: None,
            stop_loss: None,
            target: None,
            status: TradeStatus::Open,
            mode: TradeMode::New,
            trigger_level: signal.trigger_level,
            opened_at: now,
            closed_at: None,
            pnl: 0.0,
        };
        trades.insert(0, trade.clone());
        Ok(EntryOutcome::Opened(trade))
    }

    pub fn close(
        &self,
        trades: &mut [PaperTrade],
        trade_id: &Uuid,
        price: f64,
        now: DateTime<Utc>,
    ) -> Result<PaperTrade, PaperError> {
        if !(price > 0.0) || !price.is_finite() {
            return Err(PaperError::InvalidPrice);
        }
        let trade = trades
            .iter_mut()
            .find(|t| &t.id == trade_id)
            .ok_or(PaperError::TradeNotFound)?;
        if !trade.is_open() {
            return Err(PaperError::TradeClosed);
        }
        Ok(close_at(trade, price, now))
    }

    pub fn set_stop_loss(
        &self,
        trades: &mut [PaperTrade],
        trade_id: &Uuid,
        stop_loss: Option<f64>,
    ) -> Result<(), PaperError> {
        let trade = open_trade_mut(trades, trade_id)?;
        if let Some(price) = stop_loss {
            if !(price > 0.0) || !price.is_finite() {
                return Err(PaperError::InvalidPrice);
            }
        }
        trade.stop_loss = stop_loss;
        Ok(())
    }

    pub fn set_target(
        &self,
        trades: &mut [PaperTrade],
        trade_id: &Uuid,
        target: Option<f64>,
    ) -> Result<(), PaperError> {
        let trade = open_trade_mut(trades, trade_id)?;
        if let Some(price) = target {
            if !(price > 0.0) || !price.is_finite() {
                return Err(PaperError::InvalidPrice);
            }
        }
        trade.target = target;
        Ok(())
    }

    /// Refresh floating P&L for open trades on `token`. Returns true when any
    /// position moved.
    pub fn mark_to_market(&self, trades: &mut [PaperTrade], token: &str, ltp: f64) -> bool {
        let mut moved = false;
        for trade in trades.iter_mut().filter(|t| t.is_open() && t.token == token) {
            let pnl = trade.pnl_at(ltp);
            if (pnl - trade.pnl).abs() > f64::EPSILON {
                trade.pnl = pnl;
                moved = true;
            }
        }
        moved
    }

    /// Close open trades on `token` whose stop-loss or target is reached by
    /// this tick. Stop-loss wins when both sit on the same tick.
    pub fn sweep_exits(
        &self,
        trades: &mut [PaperTrade],
        token: &str,
        ltp: f64,
        now: DateTime<Utc>,
    ) -> Vec<PaperTrade> {
        let mut closed = Vec::new();
        for trade in trades.iter_mut().filter(|t| t.is_open() && t.token == token) {
            let stop_hit = trade.stop_loss.is_some_and(|sl| match trade.side {
                TradeSide::Buy => ltp <= sl,
                TradeSide::Sell => ltp >= sl,
            });
            let target_hit = trade.target.is_some_and(|tp| match trade.side {
                TradeSide::Buy => ltp >= tp,
                TradeSide::Sell => ltp <= tp,
            });
            if stop_hit || target_hit {
                closed.push(close_at(trade, ltp, now));
            }
        }
        closed
    }

    /// End-of-day square-off: close every open trade at its token's last seen
    /// price (entry price when no tick was ever observed).
    pub fn square_off(
        &self,
        trades: &mut [PaperTrade],
        last_prices: &HashMap<String, f64>,
        now: DateTime<Utc>,
    ) -> Vec<PaperTrade> {
        let mut closed = Vec::new();
        for trade in trades.iter_mut().filter(|t| t.is_open()) {
            let price = last_prices
                .get(&trade.token)
                .copied()
                .unwrap_or(trade.entry_price);
            closed.push(close_at(trade, price, now));
        }
        closed
    }

    pub fn summary(&self, trades: &[PaperTrade]) -> PaperSummary {
        let mut summary = PaperSummary {
            realized_pnl: 0.0,
            floating_pnl: 0.0,
            total_pnl: 0.0,
            open_trades: 0,
            closed_trades: 0,
            wins: 0,
            losses: 0,
        };
        for trade in trades {
            match trade.status {
                TradeStatus::Open => {
                    summary.open_trades += 1;
                    summary.floating_pnl += trade.pnl;
                }
                TradeStatus::Closed => {
                    summary.closed_trades += 1;
                    summary.realized_pnl += trade.pnl;
                    if trade.pnl >= 0.0 {
                        summary.wins += 1;
                    } else {
                        summary.losses += 1;
                    }
                }
            }
        }
        summary.total_pnl = summary.realized_pnl + summary.floating_pnl;
        summary
    }

    pub fn export_csv(&self, trades: &[PaperTrade]) -> String {
        let mut out = String::from(
            "id,symbol,token,exchange,side,quantity,entry_price,exit_price,stop_loss,target,status,mode,trigger_level,opened_at,closed_at,pnl\n",
        );
        for t in trades {
            let opt = |v: Option<f64>| v.map(|p| p.to_string()).unwrap_or_default();
            // Enum columns use the same UPPERCASE spellings as the wire.
            let status = match t.status {
                TradeStatus::Open => "OPEN",
                TradeStatus::Closed => "CLOSED",
            };
            let mode = match t.mode {
                TradeMode::New => "NEW",
                TradeMode::Averaged => "AVERAGED",
            };
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{:.2}\n",
                t.id,
                t.symbol,
                t.token,
                t.exchange,
                t.side,
                t.quantity,
                t.entry_price,
                opt(t.exit_price),
                opt(t.stop_loss),
                opt(t.target),
                status,
                mode,
                t.trigger_level,
                t.opened_at.to_rfc3339(),
                t.closed_at.map(|ts| ts.to_rfc3339()).unwrap_or_default(),
                t.pnl,
            ));
        }
        out
    }
}

fn open_trade_mut<'a>(
    trades: &'a mut [PaperTrade],
    trade_id: &Uuid,
) -> Result<&'a mut PaperTrade, PaperError> {
    let trade = trades
        .iter_mut()
        .find(|t| &t.id == trade_id)
        .ok_or(PaperError::TradeNotFound)?;
    if !trade.is_open() {
        return Err(PaperError::TradeClosed);
    }
    Ok(trade)
}

fn close_at(trade: &mut PaperTrade, price: f64, now: DateTime<Utc>) -> PaperTrade {
    trade.pnl = trade.pnl_at(price);
    trade.exit_price = Some(price);
    trade.status = TradeStatus::Closed;
    trade.closed_at = Some(now);
    trade.clone()
}
