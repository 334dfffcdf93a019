// 8.0 engine/core.rs: main engine. one order book per instrument, bootstrap and routing.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use super::book::OrderBook;
use super::config::EngineConfig;
use super::results::EngineError;
use crate::depth::DepthProvider;
use crate::order::OrderHandle;
use crate::settlement::Settlement;
use crate::source::OrderSource;
use crate::types::{InstrumentId, Side};

/** 8.1: main engine struct. books are fixed after bootstrap */
#[derive(Debug)]
pub struct MatchingEngine {
    config: EngineConfig,
    books: HashMap<InstrumentId, Arc<OrderBook>>,
}

impl MatchingEngine {
    /// Loads instruments, open orders and recent trades, reconciles every book
    /// and starts matching. Returns only once all books are running.
    pub async fn bootstrap(
        source: &dyn OrderSource,
        settlement: Arc<dyn Settlement>,
        depths: Arc<dyn DepthProvider>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let instruments = source.load_instruments().await?;
        let mut books = HashMap::with_capacity(instruments.len());
        for instrument in instruments {
            let depth = depths.depth_for(instrument.id);
            let book = OrderBook::new(instrument, Arc::clone(&settlement), depth, &config);
            books.insert(instrument.id, Arc::new(book));
        }
        let engine = Self { config, books };

        let asks = source.load_open_asks().await?;
        let bids = source.load_open_bids().await?;
        info!(instruments = engine.books.len(), asks = asks.len(), bids = bids.len(), "loading open orders");

        for order in asks.into_iter().chain(bids) {
            let (instrument_id, side) = {
                let o = order.read();
                (o.instrument_id, o.side)
            };
            let Some(book) = engine.books.get(&instrument_id) else {
                warn!(%instrument_id, order_id = %order.id(), "open order for unknown instrument skipped");
                continue;
            };
            match side {
                Side::Ask => book.load_old_ask(order)?,
                Side::Bid => book.load_old_bid(order)?,
            }
        }

        for (instrument_id, book) in &engine.books {
            let trades = source
                .load_recent_trades(*instrument_id, engine.config.recent_trade_count)
                .await?;
            book.load_old_transactions(trades);
        }

        let mut starting = JoinSet::new();
        for book in engine.books.values() {
            let book = Arc::clone(book);
            starting.spawn(async move { book.start_stock_matching().await });
        }
        let mut failure = None;
        while let Some(started) = starting.join_next().await {
            let result = started.map_err(|e| EngineError::Task(e.to_string())).and_then(|r| r);
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }
        if let Some(e) = failure {
            warn!(error = %e, "bootstrap failed, stopping started books");
            engine.shutdown().await?;
            return Err(e);
        }

        info!(instruments = engine.books.len(), "matching engine ready");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn order_book(&self, instrument_id: InstrumentId) -> Option<Arc<OrderBook>> {
        self.books.get(&instrument_id).cloned()
    }

    pub fn instruments(&self) -> impl Iterator<Item = InstrumentId> + '_ {
        self.books.keys().copied()
    }

    pub async fn add_ask_order(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.book_for(&order)?.add_ask_order(order).await
    }

    pub async fn add_bid_order(&self, order: OrderHandle) -> Result<(), EngineError> {
        self.book_for(&order)?.add_bid_order(order).await
    }

    pub fn cancel_ask_order(&self, order: &OrderHandle) -> Result<(), EngineError> {
        self.book_for(order)?.cancel_ask_order(order)
    }

    pub fn cancel_bid_order(&self, order: &OrderHandle) -> Result<(), EngineError> {
        self.book_for(order)?.cancel_bid_order(order)
    }

    /// Waits until every book has matched all orders submitted so far.
    pub async fn flush(&self) -> Result<(), EngineError> {
        for book in self.books.values() {
            book.flush().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), EngineError> {
        for book in self.books.values() {
            book.shutdown().await?;
        }
        info!("matching engine stopped");
        Ok(())
    }

    fn book_for(&self, order: &OrderHandle) -> Result<&OrderBook, EngineError> {
        let instrument_id = order.read().instrument_id;
        self.books
            .get(&instrument_id)
            .map(|book| book.as_ref())
            .ok_or(EngineError::UnknownInstrument(instrument_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::MarketDepthRegistry;
    use crate::order::{Order, Trade};
    use crate::settlement::{FillOutcome, FillStatus, SimulatedSettlement};
    use crate::source::{InMemorySource, Instrument, SourceError};
    use crate::types::{OrderId, Price, Quantity, Timestamp, UserId};
    use async_trait::async_trait;

    fn limit(id: u64, instrument: u32, side: Side, price: u64, qty: u64) -> OrderHandle {
        Order::new_limit(
            OrderId(id),
            UserId(id as u32),
            InstrumentId(instrument),
            side,
            Price::from_u64(price),
            Quantity(qty),
            Timestamp::from_millis(id as i64),
        )
        .into_handle()
    }

    fn source() -> InMemorySource {
        let source = InMemorySource::new();
        for id in [1, 2] {
            source.add_instrument(Instrument {
                id: InstrumentId(id),
                current_price: Price::from_u64(100),
            });
        }
        source
    }

    #[tokio::test]
    async fn bootstrap_loads_and_routes() {
        let source = source();
        source.add_order(limit(1, 1, Side::Ask, 100, 5));
        source.add_order(limit(2, 2, Side::Bid, 90, 5));
        source.add_order(limit(3, 9, Side::Bid, 90, 5));
        source.add_trade(
            InstrumentId(2),
            Trade {
                ask_id: OrderId(10),
                bid_id: OrderId(11),
                price: Price::from_u64(93),
                quantity: Quantity(1),
                created_at: Timestamp::from_millis(5),
            },
        );

        let settlement = Arc::new(SimulatedSettlement::new());
        let depths = Arc::new(MarketDepthRegistry::new(10));
        let engine = MatchingEngine::bootstrap(&source, settlement.clone(), depths.clone(), EngineConfig::default())
            .await
            .unwrap();

        assert_eq!(engine.instruments().count(), 2);
        assert_eq!(engine.order_book(InstrumentId(2)).unwrap().last_price(), Price::from_u64(93));
        assert_eq!(depths.get(InstrumentId(1)).unwrap().total(Side::Ask), Quantity(5));

        engine.add_bid_order(limit(4, 1, Side::Bid, 100, 5)).await.unwrap();
        engine.flush().await.unwrap();
        assert_eq!(settlement.trade_count(), 1);
        assert_eq!(depths.get(InstrumentId(1)).unwrap().total(Side::Ask), Quantity::ZERO);

        let err = engine.add_ask_order(limit(5, 9, Side::Ask, 100, 5)).await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownInstrument(InstrumentId(9))));

        engine.shutdown().await.unwrap();
    }

    struct BrokenSource;

    #[async_trait]
    impl OrderSource for BrokenSource {
        async fn load_instruments(&self) -> Result<Vec<Instrument>, SourceError> {
            Err(SourceError::Load {
                what: "instruments",
                reason: "connection refused".to_string(),
            })
        }

        async fn load_open_asks(&self) -> Result<Vec<OrderHandle>, SourceError> {
            Ok(Vec::new())
        }

        async fn load_open_bids(&self) -> Result<Vec<OrderHandle>, SourceError> {
            Ok(Vec::new())
        }

        async fn load_recent_trades(&self, _: InstrumentId, _: usize) -> Result<Vec<Trade>, SourceError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn bootstrap_surfaces_source_errors() {
        let result = MatchingEngine::bootstrap(
            &BrokenSource,
            Arc::new(SimulatedSettlement::new()),
            Arc::new(MarketDepthRegistry::new(10)),
            EngineConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(EngineError::Source(SourceError::Load { .. }))));
    }

    /// Crashes on any fill for instrument 2.
    struct CrashingSettlement;

    #[async_trait]
    impl Settlement for CrashingSettlement {
        async fn fill_order(&self, ask: &OrderHandle, _: &OrderHandle, _: Price, _: Quantity) -> FillOutcome {
            let instrument_id = ask.read().instrument_id;
            assert_ne!(instrument_id, InstrumentId(2), "settlement backend crashed");
            FillOutcome::no_trade(FillStatus::Undone, FillStatus::Undone)
        }
    }

    #[tokio::test]
    async fn failed_start_stops_books_already_running() {
        let source = source();
        source.add_order(limit(1, 1, Side::Ask, 100, 5));
        // crossed book on instrument 2 makes its reconciliation call settlement
        source.add_order(limit(2, 2, Side::Ask, 100, 5));
        source.add_order(limit(3, 2, Side::Bid, 105, 5));

        let settlement: Arc<dyn Settlement> = Arc::new(CrashingSettlement);
        let result = MatchingEngine::bootstrap(
            &source,
            Arc::clone(&settlement),
            Arc::new(MarketDepthRegistry::new(10)),
            EngineConfig::default(),
        )
        .await;

        assert!(matches!(result, Err(EngineError::Task(_))));
        // every book task has been joined, so nothing else holds the settlement
        assert_eq!(Arc::strong_count(&settlement), 1);
    }
}
