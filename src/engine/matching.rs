// 8.2 engine/matching.rs: the matching state machine of one instrument.
// only ever driven by that instrument's book task, one order at a time.

use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::ledger::DepthLedger;
use super::results::{MatchFault, MatchStep};
use crate::conditional::{should_trigger, stop_loss_heap_order};
use crate::depth::DepthSink;
use crate::order::{Order, OrderHandle, OrderType, Trade};
use crate::pqueue::{HeapOrder, PriorityQueue, QueueItem};
use crate::settlement::Settlement;
use crate::source::Instrument;
use crate::types::{InstrumentId, Price, Quantity, Side, UserId};

/** 8.2.1: queues, depth ledger and settlement handle of one instrument */
pub(super) struct BookCore {
    pub(super) instrument_id: InstrumentId,
    pub(super) asks: PriorityQueue,
    pub(super) bids: PriorityQueue,
    pub(super) ask_stop_losses: PriorityQueue,
    pub(super) bid_stop_losses: PriorityQueue,
    pub(super) ledger: DepthLedger,
    settlement: Arc<dyn Settlement>,
    last_price: Mutex<Price>,
}

/// Market-class orders cross anything; limits cross when the bid reaches the ask.
pub(super) fn crosses(ask: &Order, bid: &Order) -> bool {
    ask.is_market() || bid.is_market() || bid.price >= ask.price
}

/// Price and quantity a crossing pair trades at.
///
/// Two market-class orders trade at the last traded price. A market-class order
/// takes the other side's limit. Two limits trade at the earlier order's price.
pub(super) fn trade_terms(ask: &Order, bid: &Order, last_price: Price) -> (Price, Quantity) {
    let price = match (ask.is_market(), bid.is_market()) {
        (true, true) => last_price,
        (true, false) => bid.price,
        (false, true) => ask.price,
        (false, false) => {
            if ask.created_at < bid.created_at {
                ask.price
            } else {
                bid.price
            }
        }
    };

    (price, ask.unfulfilled().min(bid.unfulfilled()))
}

impl BookCore {
    pub(super) fn new(instrument: Instrument, settlement: Arc<dyn Settlement>, depth: Arc<dyn DepthSink>) -> Self {
        Self {
            instrument_id: instrument.id,
            asks: PriorityQueue::new(HeapOrder::Ask),
            bids: PriorityQueue::new(HeapOrder::Bid),
            ask_stop_losses: PriorityQueue::new(stop_loss_heap_order(Side::Ask)),
            bid_stop_losses: PriorityQueue::new(stop_loss_heap_order(Side::Bid)),
            ledger: DepthLedger::new(depth),
            settlement,
            last_price: Mutex::new(instrument.current_price),
        }
    }

    pub(super) fn queue(&self, side: Side) -> &PriorityQueue {
        match side {
            Side::Ask => &self.asks,
            Side::Bid => &self.bids,
        }
    }

    pub(super) fn stop_loss_queue(&self, side: Side) -> &PriorityQueue {
        match side {
            Side::Ask => &self.ask_stop_losses,
            Side::Bid => &self.bid_stop_losses,
        }
    }

    pub(super) fn last_price(&self) -> Price {
        *self.last_price.lock()
    }

    pub(super) fn park_stop_loss(&self, order: OrderHandle) {
        let (id, side, trigger) = {
            let o = order.read();
            (o.id, o.side, o.price)
        };
        self.stop_loss_queue(side).push(order);
        debug!(instrument = %self.instrument_id, order_id = %id, %side, %trigger, "stop-loss parked");
    }

    /// Re-inserts an order that was open before a restart.
    pub(super) fn load_old(&self, order: OrderHandle) {
        let (side, order_type) = {
            let o = order.read();
            (o.side, o.order_type)
        };

        if order_type == OrderType::StopLoss {
            self.park_stop_loss(order);
            return;
        }

        self.queue(side).push(order.clone());
        self.ledger.show(&order);
    }

    pub(super) fn load_old_transactions(&self, mut trades: Vec<Trade>) {
        trades.sort_by_key(|t| t.created_at);
        for trade in &trades {
            self.ledger.record_trade(trade);
        }
        if let Some(latest) = trades.last() {
            *self.last_price.lock() = latest.price;
        }
    }

    /// Matches one submitted order against the book, rests what is left,
    /// then lets any activated stop-losses trade.
    pub(super) async fn process_order(&self, incoming: OrderHandle) {
        let side = incoming.side();
        let activated = self.match_incoming(&incoming, side).await;

        if incoming.is_open() {
            self.queue(side).push(incoming.clone());
            self.ledger.show(&incoming);
        }

        if activated {
            self.clear_existing_orders().await;
        }
    }

    // returns whether any stop-loss was activated
    async fn match_incoming(&self, incoming: &OrderHandle, side: Side) -> bool {
        let resting_side = side.opposite();
        let user_id = incoming.user_id();
        let mut activated = false;

        while incoming.is_open() {
            let mut set_aside = Vec::new();
            let Some(resting) = self.top_matching(resting_side, Some(user_id), &mut set_aside) else {
                self.restore(resting_side, set_aside);
                break;
            };

            let (ask, bid) = match side {
                Side::Ask => (incoming, &resting),
                Side::Bid => (&resting, incoming),
            };
            if !crosses(&ask.read(), &bid.read()) {
                self.restore(resting_side, set_aside);
                break;
            }

            match self.make_trade(ask, bid, side == Side::Ask, side == Side::Bid).await {
                Ok(step) => {
                    let resting_done = match side {
                        Side::Ask => step.bid_done,
                        Side::Bid => step.ask_done,
                    };
                    if resting_done {
                        self.pop_resting(resting_side, &resting);
                    }
                    self.restore(resting_side, set_aside);

                    if let Some(trade) = step.trade {
                        activated |= self.trigger_stop_losses(trade.price).await;
                    }
                }
                Err(fault) => {
                    error!(instrument = %self.instrument_id, %fault, "match step abandoned");
                    self.restore(resting_side, set_aside);
                    if let Some(trade) = fault.trade() {
                        activated |= self.trigger_stop_losses(trade.price).await;
                    }
                    break;
                }
            }
        }

        activated
    }

    /// Matches whatever crosses among orders already resting in the book.
    ///
    /// Runs before the matching loop starts, to resolve a book left crossed by a
    /// previous run, and again after stop-loss activations. Both sides are
    /// already shown in depth here.
    pub(super) async fn clear_existing_orders(&self) {
        loop {
            let Some(ask) = self.top_matching(Side::Ask, None, &mut Vec::new()) else {
                break;
            };

            let mut set_aside = Vec::new();
            let Some(bid) = self.top_matching(Side::Bid, Some(ask.user_id()), &mut set_aside) else {
                self.restore(Side::Bid, set_aside);
                break;
            };

            if !crosses(&ask.read(), &bid.read()) {
                self.restore(Side::Bid, set_aside);
                break;
            }

            match self.make_trade(&ask, &bid, false, false).await {
                Ok(step) => {
                    if step.ask_done {
                        self.pop_resting(Side::Ask, &ask);
                    }
                    if step.bid_done {
                        self.pop_resting(Side::Bid, &bid);
                    }
                    self.restore(Side::Bid, set_aside);

                    if let Some(trade) = step.trade {
                        self.trigger_stop_losses(trade.price).await;
                    }
                }
                Err(fault) => {
                    error!(instrument = %self.instrument_id, %fault, "reconciliation step abandoned");
                    self.restore(Side::Bid, set_aside);
                    if let Some(trade) = fault.trade() {
                        self.trigger_stop_losses(trade.price).await;
                    }
                    break;
                }
            }
        }
    }

    /// Best live order on `side`, skipping orders of `exclude_user` into `set_aside`.
    ///
    /// Closed orders found on top are dropped for good: this is where a
    /// cancellation finally leaves the queue.
    fn top_matching(
        &self,
        side: Side,
        exclude_user: Option<UserId>,
        set_aside: &mut Vec<QueueItem>,
    ) -> Option<OrderHandle> {
        let queue = self.queue(side);
        loop {
            let head = queue.head()?;
            let (order_id, is_open, user_id) = {
                let o = head.read();
                (o.id, o.is_open(), o.user_id)
            };

            if !is_open {
                queue.pop();
                self.ledger.withdraw(order_id);
                debug!(instrument = %self.instrument_id, %order_id, %side, "dropped closed order");
                continue;
            }

            if exclude_user == Some(user_id) {
                if let Some(item) = queue.pop() {
                    set_aside.push(item);
                }
                continue;
            }

            return Some(head);
        }
    }

    // set-aside orders never left depth, so only the queue is touched
    fn restore(&self, side: Side, set_aside: Vec<QueueItem>) {
        let queue = self.queue(side);
        for item in set_aside {
            queue.push_item(item);
        }
    }

    fn pop_resting(&self, side: Side, order: &OrderHandle) {
        let queue = self.queue(side);
        match queue.head() {
            Some(head) if head.ptr_eq(order) => {
                queue.pop();
            }
            _ => {
                // left in place; it is closed and gets dropped on a later pass
                error!(instrument = %self.instrument_id, order_id = %order.id(), %side, "finished order is no longer on top");
            }
        }
    }

    /// Settles one crossing pair and brings depth in line with the outcome.
    ///
    /// `incoming_ask`/`incoming_bid` mark the side that is being submitted and
    /// is not shown in depth yet.
    pub(super) async fn make_trade(
        &self,
        ask: &OrderHandle,
        bid: &OrderHandle,
        incoming_ask: bool,
        incoming_bid: bool,
    ) -> Result<MatchStep, MatchFault> {
        let (price, quantity, ask_id, bid_id) = {
            let (a, b) = (ask.read(), bid.read());
            let (price, quantity) = trade_terms(&a, &b, self.last_price());
            (price, quantity, a.id, b.id)
        };

        let outcome = self.settlement.fill_order(ask, bid, price, quantity).await;

        if let Some(trade) = &outcome.trade {
            info!(
                instrument = %self.instrument_id,
                %ask_id,
                %bid_id,
                price = %trade.price,
                quantity = %trade.quantity,
                "trade"
            );
            self.ledger.record_trade(trade);
            *self.last_price.lock() = trade.price;
        }

        for (order_id, status, incoming) in [
            (ask_id, outcome.ask_status, incoming_ask),
            (bid_id, outcome.bid_status, incoming_bid),
        ] {
            if incoming {
                continue;
            }
            if let Some(trade) = &outcome.trade {
                self.ledger.reduce(order_id, trade.quantity);
            }
            // AlreadyClosed was withdrawn by the cancel; withdraw is a no-op then
            if status.is_done() {
                self.ledger.withdraw(order_id);
            }
        }

        let (ask_done, bid_done) = (outcome.ask_status.is_done(), outcome.bid_status.is_done());
        if !ask_done && !bid_done {
            return Err(MatchFault::NoProgress {
                ask_id,
                bid_id,
                ask_status: outcome.ask_status,
                bid_status: outcome.bid_status,
                trade: outcome.trade,
            });
        }

        Ok(MatchStep {
            ask_done,
            bid_done,
            trade: outcome.trade,
        })
    }

    /// Promotes every parked stop-loss the trade price reaches. Returns whether any fired.
    pub(super) async fn trigger_stop_losses(&self, trade_price: Price) -> bool {
        let mut activated = Vec::new();

        for side in [Side::Ask, Side::Bid] {
            let queue = self.stop_loss_queue(side);
            // stop-losses are parked from outside the book task, so check and pop as one step
            while let Some(item) = queue.pop_if(|head| {
                let o = head.read();
                o.is_closed || should_trigger(&o, trade_price)
            }) {
                let order = item.into_order();
                if order.is_closed() {
                    debug!(instrument = %self.instrument_id, order_id = %order.id(), "dropped cancelled stop-loss");
                    continue;
                }
                order.write().activate_stop_loss();
                activated.push(order);
            }
        }

        for order in &activated {
            let (order_id, side, trigger) = {
                let o = order.read();
                (o.id, o.side, o.price)
            };
            info!(instrument = %self.instrument_id, %order_id, %side, %trigger, %trade_price, "stop-loss triggered");
            self.settlement.stop_loss_triggered(order).await;
            // active stop-losses trade as market orders and are never shown in depth
            self.queue(side).push(order.clone());
        }

        !activated.is_empty()
    }
}
