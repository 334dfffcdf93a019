//! Stop-loss trigger rules.
//!
//! Stop-loss orders are parked in their own queues and only join the active book
//! once a trade reaches their trigger price. An ask stop-loss sells when the price
//! falls to the trigger, a bid stop-loss buys when the price rises to it.

use crate::order::Order;
use crate::pqueue::HeapOrder;
use crate::types::{Price, Side};
use serde::{Deserialize, Serialize};

/// How the trade price is compared against the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerCondition {
    /// Triggers when a trade prints at or above the trigger.
    Above,
    /// Triggers when a trade prints at or below the trigger.
    Below,
}

impl TriggerCondition {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Ask => TriggerCondition::Below,
            Side::Bid => TriggerCondition::Above,
        }
    }

    pub fn is_met(&self, trigger_price: Price, trade_price: Price) -> bool {
        match self {
            TriggerCondition::Above => trade_price >= trigger_price,
            TriggerCondition::Below => trade_price <= trigger_price,
        }
    }
}

/// Heap ordering for a stop-loss queue of the given side.
///
/// Stop-losses trigger in the opposite direction of resting limits, so the ask
/// stop-loss queue keeps the highest trigger on top and the bid stop-loss queue
/// the lowest.
pub fn stop_loss_heap_order(side: Side) -> HeapOrder {
    match side {
        Side::Ask => HeapOrder::Bid,
        Side::Bid => HeapOrder::Ask,
    }
}

/// Whether a parked stop-loss should fire after a trade at `trade_price`.
pub fn should_trigger(order: &Order, trade_price: Price) -> bool {
    TriggerCondition::for_side(order.side).is_met(order.price, trade_price)
}
