// 9.1 settlement.rs: the fill primitive the order books call after choosing a match.
// MOCKED. SimulatedSettlement keeps everything in memory; a real deployment
// would debit/credit users and persist the trade in one db transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, info};

use crate::order::{OrderHandle, Trade};
use crate::types::{OrderId, Price, Quantity, Timestamp, UserId};

/// Per-side result of a settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    /// Side is still open and should stay in (or return to) the book.
    Undone,
    /// Side is finished: fully filled, or closed because it could not settle.
    Done,
    /// Side was already closed by a cancellation before this fill.
    AlreadyClosed,
}

impl FillStatus {
    pub fn is_done(&self) -> bool {
        matches!(self, FillStatus::Done | FillStatus::AlreadyClosed)
    }
}

/// What `fill_order` did to each side. `trade` is set iff quantity changed hands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FillOutcome {
    pub ask_status: FillStatus,
    pub bid_status: FillStatus,
    pub trade: Option<Trade>,
}

impl FillOutcome {
    pub fn no_trade(ask_status: FillStatus, bid_status: FillStatus) -> Self {
        Self {
            ask_status,
            bid_status,
            trade: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettlementError {
    #[error("Order {0} is already closed")]
    AlreadyClosed(OrderId),
}

/// Atomic, strongly ordered settlement of a single match.
///
/// Implementations must update `quantity_fulfilled`/`is_closed` on both orders
/// and must order fills and cancellations of the same order strictly, one
/// before the other.
#[async_trait]
pub trait Settlement: Send + Sync {
    async fn fill_order(
        &self,
        ask: &OrderHandle,
        bid: &OrderHandle,
        price: Price,
        quantity: Quantity,
    ) -> FillOutcome;

    /// Called once when a parked stop-loss becomes active.
    async fn stop_loss_triggered(&self, _order: &OrderHandle) {}
}

#[derive(Debug, Default)]
struct SettlementState {
    trades: Vec<Trade>,
    rejected_users: HashSet<UserId>,
    activated_stop_losses: Vec<OrderId>,
}

/// In-memory settlement. Users flagged with `reject_user` fail to settle
/// and have their order closed, the way an order with insufficient funds is.
#[derive(Debug, Default)]
pub struct SimulatedSettlement {
    // one lock orders every fill and cancel
    state: Mutex<SettlementState>,
}

impl SimulatedSettlement {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_user(&self, user_id: UserId) {
        self.state.lock().rejected_users.insert(user_id);
    }

    pub fn trades(&self) -> Vec<Trade> {
        self.state.lock().trades.clone()
    }

    pub fn trade_count(&self) -> usize {
        self.state.lock().trades.len()
    }

    pub fn activated_stop_losses(&self) -> Vec<OrderId> {
        self.state.lock().activated_stop_losses.clone()
    }

    /// Closes an open order. Strongly ordered with `fill_order`.
    pub fn cancel(&self, order: &OrderHandle) -> Result<(), SettlementError> {
        let _state = self.state.lock();
        let mut o = order.write();
        if o.is_closed {
            return Err(SettlementError::AlreadyClosed(o.id));
        }
        o.is_closed = true;
        debug!(order_id = %o.id, side = %o.side, "order cancelled");
        Ok(())
    }

    fn settle(
        state: &mut SettlementState,
        ask: &OrderHandle,
        bid: &OrderHandle,
        price: Price,
        quantity: Quantity,
    ) -> FillOutcome {
        let mut a = ask.write();
        let mut b = bid.write();

        match (a.is_closed, b.is_closed) {
            (true, true) => return FillOutcome::no_trade(FillStatus::AlreadyClosed, FillStatus::AlreadyClosed),
            (true, false) => return FillOutcome::no_trade(FillStatus::AlreadyClosed, FillStatus::Undone),
            (false, true) => return FillOutcome::no_trade(FillStatus::Undone, FillStatus::AlreadyClosed),
            (false, false) => {}
        }

        // a side that cannot settle is closed, the other side keeps waiting
        let ask_rejected = state.rejected_users.contains(&a.user_id);
        let bid_rejected = state.rejected_users.contains(&b.user_id);
        if ask_rejected || bid_rejected {
            if ask_rejected {
                a.is_closed = true;
            }
            if bid_rejected {
                b.is_closed = true;
            }
            let status = |rejected| if rejected { FillStatus::Done } else { FillStatus::Undone };
            return FillOutcome::no_trade(status(ask_rejected), status(bid_rejected));
        }

        let quantity = quantity.min(a.unfulfilled()).min(b.unfulfilled());
        a.fill(quantity);
        b.fill(quantity);

        let trade = Trade {
            ask_id: a.id,
            bid_id: b.id,
            price,
            quantity,
            created_at: Timestamp::now(),
        };
        state.trades.push(trade.clone());

        let status = |closed| if closed { FillStatus::Done } else { FillStatus::Undone };
        FillOutcome {
            ask_status: status(a.is_closed),
            bid_status: status(b.is_closed),
            trade: Some(trade),
        }
    }
}

#[async_trait]
impl Settlement for SimulatedSettlement {
    async fn fill_order(
        &self,
        ask: &OrderHandle,
        bid: &OrderHandle,
        price: Price,
        quantity: Quantity,
    ) -> FillOutcome {
        let mut state = self.state.lock();
        Self::settle(&mut state, ask, bid, price, quantity)
    }

    async fn stop_loss_triggered(&self, order: &OrderHandle) {
        let id = order.id();
        self.state.lock().activated_stop_losses.push(id);
        info!(order_id = %id, "stop-loss persisted as active");
    }
}
