//! Per-instrument order book actor.
//!
//! Each book owns one tokio task that takes submitted orders off a channel and
//! matches them one at a time, so no two matches of the same instrument ever
//! overlap. A submitter is released once the task has taken its order, not once
//! the order has been matched. Stop-loss orders and cancellations never go
//! through the task.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::config::EngineConfig;
use super::matching::BookCore;
use super::results::EngineError;
use crate::depth::DepthSink;
use crate::order::{OrderHandle, OrderType, Trade};
use crate::settlement::Settlement;
use crate::source::Instrument;
use crate::types::{InstrumentId, Price, Side};

enum Command {
    Match {
        order: OrderHandle,
        accepted: oneshot::Sender<()>,
    },
    // acknowledged once every earlier submission has been matched
    Flush(oneshot::Sender<()>),
    Stop,
}

pub struct OrderBook {
    instrument_id: InstrumentId,
    core: Arc<BookCore>,
    submissions: mpsc::Sender<Command>,
    receiver: Mutex<Option<mpsc::Receiver<Command>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for OrderBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderBook")
            .field("instrument_id", &self.instrument_id)
            .field("asks", &self.core.asks.size())
            .field("bids", &self.core.bids.size())
            .finish()
    }
}

impl OrderBook {
    pub fn new(
        instrument: Instrument,
        settlement: Arc<dyn Settlement>,
        depth: Arc<dyn DepthSink>,
        config: &EngineConfig,
    ) -> Self {
        let (submissions, receiver) = mpsc::channel(config.submission_buffer.max(1));
        Self {
            instrument_id: instrument.id,
            core: Arc::new(BookCore::new(instrument, settlement, depth)),
            submissions,
            receiver: Mutex::new(Some(receiver)),
            task: Mutex::new(None),
        }
    }

    pub fn instrument_id(&self) -> InstrumentId {
        self.instrument_id
    }

    /// Last traded price, or the instrument's price before any trade.
    pub fn last_price(&self) -> Price {
        self.core.last_price()
    }

    pub fn best_ask(&self) -> Option<OrderHandle> {
        self.core.asks.head()
    }

    pub fn best_bid(&self) -> Option<OrderHandle> {
        self.core.bids.head()
    }

    /// Orders in the active queue of `side`, including not yet dropped closed ones.
    pub fn resting_count(&self, side: Side) -> usize {
        self.core.queue(side).size()
    }

    pub fn stop_loss_count(&self, side: Side) -> usize {
        self.core.stop_loss_queue(side).size()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    pub async fn add_ask_order(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.add_order(Side::Ask, order).await
    }

    pub async fn add_bid_order(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.add_order(Side::Bid, order).await
    }

    /// Withdraws the order's depth. The order itself leaves the queue when it is next
    /// found on top; by then settlement has closed it.
    pub fn cancel_ask_order(&self, order: &OrderHandle) -> Result<(), EngineError> {
        self.cancel_order(Side::Ask, order)
    }

    pub fn cancel_bid_order(&self, order: &OrderHandle) -> Result<(), EngineError> {
        self.cancel_order(Side::Bid, order)
    }

    /// Bootstrap only, before `start_stock_matching`.
    pub fn load_old_ask(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.load_old(Side::Ask, order)
    }

    /// Bootstrap only, before `start_stock_matching`.
    pub fn load_old_bid(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.load_old(Side::Bid, order)
    }

    /// Bootstrap only. Replays recent trades into depth.
    pub fn load_old_transactions(&self, trades: Vec<Trade>) {
        debug!(instrument = %self.instrument_id, count = trades.len(), "loading old trades");
        self.core.load_old_transactions(trades);
    }

    /// Resolves any crossed book left by a previous run, then starts the matching
    /// task. Submissions made before this returns wait until the task is running.
    pub async fn start_stock_matching(&self) -> Result<(), EngineError> {
        let receiver = self
            .receiver
            .lock()
            .take()
            .ok_or(EngineError::AlreadyStarted(self.instrument_id))?;

        self.core.clear_existing_orders().await;

        let core = Arc::clone(&self.core);
        let task = tokio::spawn(run(core, receiver));
        *self.task.lock() = Some(task);

        info!(instrument = %self.instrument_id, "matching started");
        Ok(())
    }

    /// Waits until every order submitted before this call has been matched.
    pub async fn flush(&self) -> Result<(), EngineError> {
        let (done, wait) = oneshot::channel();
        self.submissions
            .send(Command::Flush(done))
            .await
            .map_err(|_| EngineError::BookStopped(self.instrument_id))?;
        wait.await.map_err(|_| EngineError::BookStopped(self.instrument_id))
    }

    /// Stops the task once every submission queued ahead of the stop has been matched.
    /// Submissions sent after that are refused with `BookStopped`.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let task = self.task.lock().take();
        let Some(task) = task else {
            return Ok(());
        };

        if self.submissions.send(Command::Stop).await.is_err() {
            debug!(instrument = %self.instrument_id, "matching task already gone");
        }
        task.await.map_err(|e| EngineError::Task(e.to_string()))
    }

    async fn add_order(&self, side: Side, order: OrderHandle) -> Result<(), EngineError> {
        self.check_side(side, &order)?;

        let (order_id, order_type, is_closed) = {
            let o = order.read();
            (o.id, o.order_type, o.is_closed)
        };
        if is_closed {
            debug!(instrument = %self.instrument_id, %order_id, "ignoring closed order");
            return Ok(());
        }

        if order_type == OrderType::StopLoss {
            self.core.park_stop_loss(order);
            return Ok(());
        }

        let (accepted, taken) = oneshot::channel();
        self.submissions
            .send(Command::Match { order, accepted })
            .await
            .map_err(|_| EngineError::BookStopped(self.instrument_id))?;
        taken.await.map_err(|_| EngineError::BookStopped(self.instrument_id))
    }

    fn cancel_order(&self, side: Side, order: &OrderHandle) -> Result<(), EngineError> {
        self.check_side(side, order)?;
        let order_id = order.id();
        self.core.ledger.withdraw(order_id);
        debug!(instrument = %self.instrument_id, %order_id, %side, "order withdrawn from depth");
        Ok(())
    }

    fn load_old(&self, side: Side, order: OrderHandle) -> Result<(), EngineError> {
        self.check_side(side, &order)?;
        if order.is_closed() {
            debug!(instrument = %self.instrument_id, order_id = %order.id(), "skipping closed order");
            return Ok(());
        }
        self.core.load_old(order);
        Ok(())
    }

    fn check_side(&self, expected: Side, order: &OrderHandle) -> Result<(), EngineError> {
        let (order_id, actual) = {
            let o = order.read();
            (o.id, o.side)
        };
        if actual != expected {
            return Err(EngineError::SideMismatch {
                order_id,
                expected,
                actual,
            });
        }
        Ok(())
    }
}

async fn run(core: Arc<BookCore>, mut receiver: mpsc::Receiver<Command>) {
    while let Some(command) = receiver.recv().await {
        match command {
            Command::Match { order, accepted } => {
                if accepted.send(()).is_err() {
                    warn!(instrument = %core.instrument_id, order_id = %order.id(), "submitter went away, matching anyway");
                }
                core.process_order(order).await;
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
            Command::Stop => break,
        }
    }
    info!(instrument = %core.instrument_id, "matching stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::MarketDepth;
    use crate::order::Order;
    use crate::settlement::SimulatedSettlement;
    use crate::types::{OrderId, Quantity, Timestamp, UserId};
    use std::time::Duration;

    fn book() -> (OrderBook, Arc<MarketDepth>, Arc<SimulatedSettlement>) {
        let depth = Arc::new(MarketDepth::new(InstrumentId(1), 10));
        let settlement = Arc::new(SimulatedSettlement::new());
        let instrument = Instrument {
            id: InstrumentId(1),
            current_price: Price::from_u64(100),
        };
        let book = OrderBook::new(instrument, settlement.clone(), depth.clone(), &EngineConfig::default());
        (book, depth, settlement)
    }

    fn limit(id: u64, user: u32, side: Side, price: u64, qty: u64) -> OrderHandle {
        Order::new_limit(
            OrderId(id),
            UserId(user),
            InstrumentId(1),
            side,
            Price::from_u64(price),
            Quantity(qty),
            Timestamp::from_millis(id as i64),
        )
        .into_handle()
    }

    #[tokio::test]
    async fn wrong_side_is_rejected() {
        let (book, _, _) = book();
        let err = book.load_old_ask(limit(1, 1, Side::Bid, 10, 1)).unwrap_err();
        assert!(matches!(err, EngineError::SideMismatch { expected: Side::Ask, .. }));
        assert!(book.cancel_bid_order(&limit(2, 1, Side::Ask, 10, 1)).is_err());
    }

    #[tokio::test]
    async fn start_twice_fails() {
        let (book, _, _) = book();
        book.start_stock_matching().await.unwrap();
        assert!(book.is_running());
        assert!(matches!(book.start_stock_matching().await, Err(EngineError::AlreadyStarted(_))));
        book.shutdown().await.unwrap();
        assert!(!book.is_running());
    }

    #[tokio::test]
    async fn submitted_orders_match() {
        let (book, depth, settlement) = book();
        book.start_stock_matching().await.unwrap();

        book.add_ask_order(limit(1, 1, Side::Ask, 100, 5)).await.unwrap();
        book.add_bid_order(limit(2, 2, Side::Bid, 100, 3)).await.unwrap();
        book.flush().await.unwrap();

        assert_eq!(settlement.trade_count(), 1);
        assert_eq!(depth.quantity_at(Side::Ask, Price::from_u64(100)), Quantity(2));
        assert_eq!(book.resting_count(Side::Bid), 0);
        book.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn stop_loss_is_parked_without_the_task() {
        let (book, depth, _) = book();
        let stop = Order::new_stop_loss(
            OrderId(1),
            UserId(1),
            InstrumentId(1),
            Side::Bid,
            Price::from_u64(120),
            Quantity(2),
            Timestamp::from_millis(1),
        )
        .into_handle();

        // the task is not running, so this would hang for any other order type
        book.add_bid_order(stop).await.unwrap();
        assert_eq!(book.stop_loss_count(Side::Bid), 1);
        assert_eq!(depth.total(Side::Bid), Quantity::ZERO);
    }

    #[tokio::test]
    async fn submissions_wait_for_start() {
        let (book, _, settlement) = book();
        let book = Arc::new(book);
        book.load_old_ask(limit(1, 1, Side::Ask, 100, 5)).unwrap();
        book.load_old_bid(limit(2, 2, Side::Bid, 101, 5)).unwrap();

        let submitter = {
            let book = Arc::clone(&book);
            tokio::spawn(async move { book.add_bid_order(limit(3, 3, Side::Bid, 100, 5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!submitter.is_finished());

        book.start_stock_matching().await.unwrap();
        submitter.await.unwrap().unwrap();
        book.flush().await.unwrap();

        // the crossed pair from before the restart settles first
        let trades = settlement.trades();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].bid_id, OrderId(2));
        assert_eq!(book.resting_count(Side::Bid), 1);
        book.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_matches_queued_orders_then_refuses_new_ones() {
        let (book, _, settlement) = book();
        book.start_stock_matching().await.unwrap();

        // no flush: the bid is still being matched when the stop is sent
        book.add_ask_order(limit(1, 1, Side::Ask, 100, 1)).await.unwrap();
        book.add_bid_order(limit(2, 2, Side::Bid, 100, 1)).await.unwrap();
        book.shutdown().await.unwrap();
        assert_eq!(settlement.trade_count(), 1);

        let err = book.add_ask_order(limit(3, 1, Side::Ask, 100, 1)).await.unwrap_err();
        assert!(matches!(err, EngineError::BookStopped(_)));
    }
}
