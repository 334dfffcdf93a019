//! Bootstrap data source.
//!
//! At startup the engine reads every instrument, all still-open orders and the
//! most recent trades of each instrument. `InMemorySource` serves the same data
//! from memory for the simulation binary and the tests.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::order::{OrderHandle, Trade};
use crate::types::{InstrumentId, Price, Side};

/// A tradable instrument and its last known price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub id: InstrumentId,
    pub current_price: Price,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to load {what}: {reason}")]
    Load { what: &'static str, reason: String },
}

#[async_trait]
pub trait OrderSource: Send + Sync {
    async fn load_instruments(&self) -> Result<Vec<Instrument>, SourceError>;
    async fn load_open_asks(&self) -> Result<Vec<OrderHandle>, SourceError>;
    async fn load_open_bids(&self) -> Result<Vec<OrderHandle>, SourceError>;
    /// Up to `count` most recent trades of one instrument.
    async fn load_recent_trades(&self, instrument_id: InstrumentId, count: usize) -> Result<Vec<Trade>, SourceError>;
}

#[derive(Debug, Default)]
struct SourceData {
    instruments: Vec<Instrument>,
    asks: Vec<OrderHandle>,
    bids: Vec<OrderHandle>,
    trades: HashMap<InstrumentId, Vec<Trade>>,
}

#[derive(Debug, Default)]
pub struct InMemorySource {
    data: RwLock<SourceData>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_instrument(&self, instrument: Instrument) {
        self.data.write().instruments.push(instrument);
    }

    pub fn add_order(&self, order: OrderHandle) {
        let mut data = self.data.write();
        match order.side() {
            Side::Ask => data.asks.push(order),
            Side::Bid => data.bids.push(order),
        }
    }

    pub fn add_trade(&self, instrument_id: InstrumentId, trade: Trade) {
        self.data.write().trades.entry(instrument_id).or_default().push(trade);
    }
}

fn open_only(orders: &[OrderHandle]) -> Vec<OrderHandle> {
    orders.iter().filter(|o| !o.is_closed()).cloned().collect()
}

#[async_trait]
impl OrderSource for InMemorySource {
    async fn load_instruments(&self) -> Result<Vec<Instrument>, SourceError> {
        Ok(self.data.read().instruments.clone())
    }

    async fn load_open_asks(&self) -> Result<Vec<OrderHandle>, SourceError> {
        Ok(open_only(&self.data.read().asks))
    }

    async fn load_open_bids(&self) -> Result<Vec<OrderHandle>, SourceError> {
        Ok(open_only(&self.data.read().bids))
    }

    async fn load_recent_trades(&self, instrument_id: InstrumentId, count: usize) -> Result<Vec<Trade>, SourceError> {
        let data = self.data.read();
        let mut trades = data.trades.get(&instrument_id).cloned().unwrap_or_default();
        trades.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        trades.truncate(count);
        Ok(trades)
    }
}
