//! Per-order record of what each resting order contributes to market depth.
//!
//! Depth deltas are derived from this record only: an order is shown once with
//! its unfulfilled quantity, trades reduce exactly what was shown, and closing or
//! cancelling withdraws whatever is left. A withdrawal for an order that is not
//! shown is a no-op, so cancellation and settlement may both withdraw the same
//! order without double-counting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::error;

use crate::depth::DepthSink;
use crate::order::{OrderHandle, Trade};
use crate::types::{OrderId, Price, Quantity, Side};

#[derive(Debug, Clone, Copy)]
struct Shown {
    side: Side,
    is_market: bool,
    price: Price,
    quantity: Quantity,
}

pub struct DepthLedger {
    sink: Arc<dyn DepthSink>,
    shown: Mutex<HashMap<OrderId, Shown>>,
}

impl std::fmt::Debug for DepthLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepthLedger")
            .field("shown", &self.shown.lock().len())
            .finish()
    }
}

impl DepthLedger {
    pub fn new(sink: Arc<dyn DepthSink>) -> Self {
        Self {
            sink,
            shown: Mutex::new(HashMap::new()),
        }
    }

    /// Shows the order's unfulfilled quantity. Closed or already shown orders are skipped.
    pub fn show(&self, order: &OrderHandle) {
        let mut shown = self.shown.lock();
        // checked under the ledger lock so a concurrent cancel either sees the entry or
        // this call sees the closed flag
        let o = order.read();
        if !o.is_open() || shown.contains_key(&o.id) {
            return;
        }

        let entry = Shown {
            side: o.side,
            is_market: o.is_market(),
            price: o.price,
            quantity: o.unfulfilled(),
        };
        shown.insert(o.id, entry);
        self.sink.add_order(entry.is_market, entry.side, entry.price, entry.quantity);
    }

    /// Takes a traded quantity off a shown order. Returns the part of the trade
    /// that exceeded what the order showed, which is zero unless depth has drifted.
    pub fn reduce(&self, order_id: OrderId, quantity: Quantity) -> Quantity {
        let mut shown = self.shown.lock();
        let Some(entry) = shown.get_mut(&order_id) else {
            return Quantity::ZERO;
        };

        let traded = quantity.min(entry.quantity);
        let excess = quantity - traded;
        if !excess.is_zero() {
            error!(
                %order_id,
                side = %entry.side,
                price = %entry.price,
                %quantity,
                shown = %entry.quantity,
                "trade exceeds shown depth, reduced to what was shown"
            );
        }
        entry.quantity -= traded;
        let entry = *entry;
        if entry.quantity.is_zero() {
            shown.remove(&order_id);
        }
        self.sink.close_order(entry.is_market, entry.side, entry.price, traded);
        excess
    }

    /// Removes whatever is left of a shown order.
    pub fn withdraw(&self, order_id: OrderId) {
        if let Some(entry) = self.shown.lock().remove(&order_id) {
            self.sink.close_order(entry.is_market, entry.side, entry.price, entry.quantity);
        }
    }

    pub fn record_trade(&self, trade: &Trade) {
        self.sink.add_trade(trade.price, trade.quantity, trade.created_at);
    }

    pub fn shown_quantity(&self, order_id: OrderId) -> Option<Quantity> {
        self.shown.lock().get(&order_id).map(|entry| entry.quantity)
    }
}
