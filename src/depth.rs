//! Market depth: aggregated resting quantity per price level plus recent trades.
//!
//! The order books report deltas through `DepthSink`. `MarketDepth` is the
//! in-memory sink: it keeps the full levels for snapshots, the pending diffs
//! since the last `take_update()`, and a bounded list of the latest trades.
//! Market-class orders never appear in depth.

use crate::types::{InstrumentId, Price, Quantity, Side, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tracing::error;

/// Receiver of depth deltas. Best effort: never fails the matching path.
pub trait DepthSink: Send + Sync {
    fn add_order(&self, is_market: bool, side: Side, price: Price, quantity: Quantity);
    fn close_order(&self, is_market: bool, side: Side, price: Price, quantity: Quantity);
    fn add_trade(&self, price: Price, quantity: Quantity, at: Timestamp);
}

/// Hands out the sink each instrument's book reports to.
pub trait DepthProvider: Send + Sync {
    fn depth_for(&self, instrument_id: InstrumentId) -> Arc<dyn DepthSink>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeTick {
    pub price: Price,
    pub quantity: Quantity,
    pub at: Timestamp,
}

/// Full view of one instrument's depth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub instrument_id: InstrumentId,
    /// Best (lowest) ask first.
    pub asks: Vec<(Price, Quantity)>,
    /// Best (highest) bid first.
    pub bids: Vec<(Price, Quantity)>,
    /// Newest first.
    pub latest_trades: Vec<TradeTick>,
}

/// Changes since the previous `take_update()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepthUpdate {
    pub ask_diff: BTreeMap<Price, i64>,
    pub bid_diff: BTreeMap<Price, i64>,
    /// Oldest first.
    pub trades: Vec<TradeTick>,
}

impl DepthUpdate {
    pub fn is_empty(&self) -> bool {
        self.ask_diff.is_empty() && self.bid_diff.is_empty() && self.trades.is_empty()
    }
}

#[derive(Debug, Default)]
struct Levels {
    depth: BTreeMap<Price, Quantity>,
    diff: BTreeMap<Price, i64>,
}

impl Levels {
    fn record_diff(&mut self, price: Price, delta: i64) {
        let entry = self.diff.entry(price).or_insert(0);
        *entry += delta;
        if *entry == 0 {
            self.diff.remove(&price);
        }
    }

    fn add(&mut self, price: Price, quantity: Quantity) {
        *self.depth.entry(price).or_default() += quantity;
        self.record_diff(price, quantity.value() as i64);
    }

    // Err carries what the level held when the close overran it
    fn remove(&mut self, price: Price, quantity: Quantity) -> Result<(), Quantity> {
        let current = self.depth.get(&price).copied().unwrap_or_default();
        match current.checked_sub(quantity) {
            Some(rest) => {
                if rest.is_zero() {
                    self.depth.remove(&price);
                } else {
                    self.depth.insert(price, rest);
                }
                self.record_diff(price, -(quantity.value() as i64));
                Ok(())
            }
            None => {
                self.depth.remove(&price);
                if !current.is_zero() {
                    self.record_diff(price, -(current.value() as i64));
                }
                Err(current)
            }
        }
    }
}

#[derive(Debug, Default)]
struct DepthState {
    asks: Levels,
    bids: Levels,
    latest_trades: VecDeque<TradeTick>,
    new_trades: Vec<TradeTick>,
}

impl DepthState {
    fn levels(&mut self, side: Side) -> &mut Levels {
        match side {
            Side::Ask => &mut self.asks,
            Side::Bid => &mut self.bids,
        }
    }
}

/// In-memory depth for one instrument.
#[derive(Debug)]
pub struct MarketDepth {
    instrument_id: InstrumentId,
    trade_history: usize,
    state: Mutex<DepthState>,
}

impl MarketDepth {
    pub fn new(instrument_id: InstrumentId, trade_history: usize) -> Self {
        Self {
            instrument_id,
            trade_history,
            state: Mutex::new(DepthState::default()),
        }
    }

    pub fn instrument_id(&self) -> InstrumentId {
        self.instrument_id
    }

    pub fn snapshot(&self) -> DepthSnapshot {
        let state = self.state.lock();
        DepthSnapshot {
            instrument_id: self.instrument_id,
            asks: state.asks.depth.iter().map(|(p, q)| (*p, *q)).collect(),
            bids: state.bids.depth.iter().rev().map(|(p, q)| (*p, *q)).collect(),
            latest_trades: state.latest_trades.iter().copied().collect(),
        }
    }

    /// Drains the pending diffs.
    pub fn take_update(&self) -> DepthUpdate {
        let mut state = self.state.lock();
        DepthUpdate {
            ask_diff: std::mem::take(&mut state.asks.diff),
            bid_diff: std::mem::take(&mut state.bids.diff),
            trades: std::mem::take(&mut state.new_trades),
        }
    }

    pub fn quantity_at(&self, side: Side, price: Price) -> Quantity {
        let mut state = self.state.lock();
        state.levels(side).depth.get(&price).copied().unwrap_or_default()
    }

    pub fn best_ask(&self) -> Option<Price> {
        self.state.lock().asks.depth.keys().next().copied()
    }

    pub fn best_bid(&self) -> Option<Price> {
        self.state.lock().bids.depth.keys().next_back().copied()
    }

    /// Total resting quantity on one side.
    pub fn total(&self, side: Side) -> Quantity {
        let mut state = self.state.lock();
        state
            .levels(side)
            .depth
            .values()
            .fold(Quantity::ZERO, |acc, q| acc + *q)
    }
}

impl DepthSink for MarketDepth {
    fn add_order(&self, is_market: bool, side: Side, price: Price, quantity: Quantity) {
        if is_market || quantity.is_zero() {
            return;
        }
        self.state.lock().levels(side).add(price, quantity);
    }

    fn close_order(&self, is_market: bool, side: Side, price: Price, quantity: Quantity) {
        if is_market || quantity.is_zero() {
            return;
        }
        let removed = self.state.lock().levels(side).remove(price, quantity);
        if let Err(available) = removed {
            error!(
                instrument = %self.instrument_id,
                %side,
                %price,
                %quantity,
                %available,
                "depth level underflow, level dropped"
            );
        }
    }

    fn add_trade(&self, price: Price, quantity: Quantity, at: Timestamp) {
        let tick = TradeTick { price, quantity, at };
        let mut state = self.state.lock();
        state.latest_trades.push_front(tick);
        state.latest_trades.truncate(self.trade_history);
        state.new_trades.push(tick);
    }
}

/// One `MarketDepth` per instrument, created on first use.
#[derive(Debug)]
pub struct MarketDepthRegistry {
    trade_history: usize,
    depths: RwLock<HashMap<InstrumentId, Arc<MarketDepth>>>,
}

impl MarketDepthRegistry {
    pub fn new(trade_history: usize) -> Self {
        Self {
            trade_history,
            depths: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, instrument_id: InstrumentId) -> Option<Arc<MarketDepth>> {
        self.depths.read().get(&instrument_id).cloned()
    }

    pub fn get_or_create(&self, instrument_id: InstrumentId) -> Arc<MarketDepth> {
        if let Some(depth) = self.get(instrument_id) {
            return depth;
        }
        let mut depths = self.depths.write();
        Arc::clone(
            depths
                .entry(instrument_id)
                .or_insert_with(|| Arc::new(MarketDepth::new(instrument_id, self.trade_history))),
        )
    }
}

impl DepthProvider for MarketDepthRegistry {
    fn depth_for(&self, instrument_id: InstrumentId) -> Arc<dyn DepthSink> {
        self.get_or_create(instrument_id)
    }
}
