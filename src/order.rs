//! Order types shared between the API layer, the settlement layer and the order books.
//!
//! An order is created once by the API layer and handed to the engine once. From then
//! on the same `OrderHandle` is seen by the priority queues, the matching loop and the
//! settlement collaborator, which is the only party that writes `quantity_fulfilled`
//! and `is_closed`.

use crate::types::{InstrumentId, OrderId, Price, Quantity, Side, Timestamp, UserId};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    /// Rests at its limit price.
    Limit,
    /// Crosses any opposing price.
    Market,
    /// Dormant until a trade reaches the trigger price.
    StopLoss,
    /// A triggered stop-loss. Trades with market semantics.
    StopLossActive,
}

impl OrderType {
    /// Market and triggered stop-loss orders always cross and carry no resting price.
    pub fn is_market(&self) -> bool {
        matches!(self, OrderType::Market | OrderType::StopLossActive)
    }
}

/// A single ask or bid for one instrument
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub instrument_id: InstrumentId,
    pub side: Side,
    pub order_type: OrderType,
    /// Limit or trigger price. `Price::MARKET` for market orders.
    pub price: Price,
    pub quantity: Quantity,
    pub quantity_fulfilled: Quantity,
    pub is_closed: bool,
    pub created_at: Timestamp,
}

impl Order {
    pub fn new_limit(
        id: OrderId,
        user_id: UserId,
        instrument_id: InstrumentId,
        side: Side,
        price: Price,
        quantity: Quantity,
        created_at: Timestamp,
    ) -> Self {
        Self::new(id, user_id, instrument_id, side, OrderType::Limit, price, quantity, created_at)
    }

    pub fn new_market(
        id: OrderId,
        user_id: UserId,
        instrument_id: InstrumentId,
        side: Side,
        quantity: Quantity,
        created_at: Timestamp,
    ) -> Self {
        Self::new(id, user_id, instrument_id, side, OrderType::Market, Price::MARKET, quantity, created_at)
    }

    pub fn new_stop_loss(
        id: OrderId,
        user_id: UserId,
        instrument_id: InstrumentId,
        side: Side,
        trigger_price: Price,
        quantity: Quantity,
        created_at: Timestamp,
    ) -> Self {
        Self::new(id, user_id, instrument_id, side, OrderType::StopLoss, trigger_price, quantity, created_at)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: OrderId,
        user_id: UserId,
        instrument_id: InstrumentId,
        side: Side,
        order_type: OrderType,
        price: Price,
        quantity: Quantity,
        created_at: Timestamp,
    ) -> Self {
        Self {
            id,
            user_id,
            instrument_id,
            side,
            order_type,
            price,
            quantity,
            quantity_fulfilled: Quantity::ZERO,
            is_closed: false,
            created_at,
        }
    }

    pub fn unfulfilled(&self) -> Quantity {
        self.quantity.saturating_sub(self.quantity_fulfilled)
    }

    pub fn is_market(&self) -> bool {
        self.order_type.is_market()
    }

    /// Still eligible to trade: not closed and something left to fill.
    pub fn is_open(&self) -> bool {
        !self.is_closed && !self.unfulfilled().is_zero()
    }

    /// Records a fill. Closes the order once nothing is left.
    pub fn fill(&mut self, quantity: Quantity) {
        debug_assert!(quantity <= self.unfulfilled(), "cannot fill more than remaining");
        self.quantity_fulfilled += quantity;
        if self.quantity_fulfilled == self.quantity {
            self.is_closed = true;
        }
    }

    /// StopLoss -> StopLossActive. Any other type is left untouched.
    pub fn activate_stop_loss(&mut self) -> bool {
        if self.order_type == OrderType::StopLoss {
            self.order_type = OrderType::StopLossActive;
            true
        } else {
            false
        }
    }

    pub fn into_handle(self) -> OrderHandle {
        OrderHandle::new(self)
    }
}

/// Shared, lock-protected order. Cloning clones the handle, not the order.
#[derive(Debug, Clone)]
pub struct OrderHandle(Arc<RwLock<Order>>);

impl OrderHandle {
    pub fn new(order: Order) -> Self {
        Self(Arc::new(RwLock::new(order)))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Order> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Order> {
        self.0.write()
    }

    /// Copy of the current order state.
    pub fn snapshot(&self) -> Order {
        self.0.read().clone()
    }

    pub fn id(&self) -> OrderId {
        self.0.read().id
    }

    pub fn user_id(&self) -> UserId {
        self.0.read().user_id
    }

    pub fn side(&self) -> Side {
        self.0.read().side
    }

    pub fn is_open(&self) -> bool {
        self.0.read().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.0.read().is_closed
    }

    pub fn ptr_eq(&self, other: &OrderHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Order> for OrderHandle {
    fn from(order: Order) -> Self {
        OrderHandle::new(order)
    }
}

/// Immutable record of a settled match. Owned and persisted by the settlement layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub ask_id: OrderId,
    pub bid_id: OrderId,
    pub price: Price,
    pub quantity: Quantity,
    pub created_at: Timestamp,
}
