//! Stock exchange matching simulation.
//!
//! Bootstraps an in-memory exchange and walks through plain matching, self-trade
//! prevention, stop-loss cascades, lazy cancellation and market-vs-market trades.

use exchange_core::*;
use rust_decimal_macros::dec;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const ACME: InstrumentId = InstrumentId(1);
const GLOBEX: InstrumentId = InstrumentId(2);

struct Sim {
    engine: MatchingEngine,
    settlement: Arc<SimulatedSettlement>,
    depths: Arc<MarketDepthRegistry>,
    next_id: u64,
}

impl Sim {
    async fn start(config: &ExchangeConfig, source: InMemorySource) -> Result<Self, EngineError> {
        let settlement = Arc::new(SimulatedSettlement::new());
        let depths = Arc::new(MarketDepthRegistry::new(config.depth_trade_history));
        let engine = MatchingEngine::bootstrap(&source, settlement.clone(), depths.clone(), config.engine.clone()).await?;
        Ok(Self {
            engine,
            settlement,
            depths,
            next_id: 1000,
        })
    }

    fn order(&mut self, user: u32, instrument: InstrumentId, side: Side, order_type: OrderType, price: Price, qty: u64) -> OrderHandle {
        self.next_id += 1;
        Order::new(
            OrderId(self.next_id),
            UserId(user),
            instrument,
            side,
            order_type,
            price,
            Quantity(qty),
            Timestamp::now(),
        )
        .into_handle()
    }

    async fn submit(&self, order: &OrderHandle) -> Result<(), EngineError> {
        match order.side() {
            Side::Ask => self.engine.add_ask_order(order.clone()).await?,
            Side::Bid => self.engine.add_bid_order(order.clone()).await?,
        }
        self.engine.flush().await
    }

    fn print_depth(&self, instrument: InstrumentId) {
        let Some(depth) = self.depths.get(instrument) else {
            return;
        };
        let snapshot = depth.snapshot();
        println!("    asks: {}", levels(&snapshot.asks));
        println!("    bids: {}", levels(&snapshot.bids));
        if let Some(last) = snapshot.latest_trades.first() {
            println!("    last trade: {} @ {}", last.quantity, last.price);
        }
    }
}

fn levels(levels: &[(Price, Quantity)]) -> String {
    if levels.is_empty() {
        return "-".to_string();
    }
    levels
        .iter()
        .map(|(price, qty)| format!("{qty}@{price}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn price(value: rust_decimal::Decimal) -> Result<Price, Box<dyn Error>> {
    Price::new(value).ok_or_else(|| format!("invalid price {value}").into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = ExchangeConfig::from_env()?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    println!("Stock Exchange Matching Simulation\n");

    let source = InMemorySource::new();
    source.add_instrument(Instrument { id: ACME, current_price: price(dec!(100))? });
    source.add_instrument(Instrument { id: GLOBEX, current_price: price(dec!(250))? });

    // left crossed by a previous run, settled during bootstrap
    let stale_ask = Order::new_limit(OrderId(1), UserId(90), ACME, Side::Ask, price(dec!(99))?, Quantity(3), Timestamp::from_millis(1));
    let stale_bid = Order::new_limit(OrderId(2), UserId(91), ACME, Side::Bid, price(dec!(100))?, Quantity(2), Timestamp::from_millis(2));
    source.add_order(stale_ask.into_handle());
    source.add_order(stale_bid.into_handle());

    let mut sim = Sim::start(&config, source).await?;
    println!("Bootstrap: stale crossed book settled with {} trade(s)", sim.settlement.trade_count());
    sim.print_depth(ACME);

    scenario_1_basic_matching(&mut sim).await?;
    scenario_2_self_trade_prevention(&mut sim).await?;
    scenario_3_stop_loss_cascade(&mut sim).await?;
    scenario_4_lazy_cancellation(&mut sim).await?;
    scenario_5_market_vs_market(&mut sim).await?;

    sim.engine.shutdown().await?;
    println!("\nAll simulations completed. {} trades settled.", sim.settlement.trade_count());
    Ok(())
}

/// A bid sweeps two ask levels and rests the remainder.
async fn scenario_1_basic_matching(sim: &mut Sim) -> Result<(), Box<dyn Error>> {
    println!("\nScenario 1: Basic Matching\n");

    let a1 = sim.order(1, GLOBEX, Side::Ask, OrderType::Limit, price(dec!(251))?, 10);
    let a2 = sim.order(2, GLOBEX, Side::Ask, OrderType::Limit, price(dec!(252))?, 10);
    sim.submit(&a1).await?;
    sim.submit(&a2).await?;
    println!("  Two makers offer 10 @ 251 and 10 @ 252");
    sim.print_depth(GLOBEX);

    let bid = sim.order(3, GLOBEX, Side::Bid, OrderType::Limit, price(dec!(252))?, 25);
    sim.submit(&bid).await?;
    println!("  Taker bids 25 @ 252, filled {}", bid.read().quantity_fulfilled);
    sim.print_depth(GLOBEX);
    Ok(())
}

/// A user's bid skips that user's own ask.
async fn scenario_2_self_trade_prevention(sim: &mut Sim) -> Result<(), Box<dyn Error>> {
    println!("\nScenario 2: Self-Trade Prevention\n");

    let own = sim.order(10, ACME, Side::Ask, OrderType::Limit, price(dec!(101))?, 5);
    let other = sim.order(11, ACME, Side::Ask, OrderType::Limit, price(dec!(102))?, 5);
    sim.submit(&own).await?;
    sim.submit(&other).await?;

    let bid = sim.order(10, ACME, Side::Bid, OrderType::Limit, price(dec!(102))?, 5);
    sim.submit(&bid).await?;
    println!("  User 10 bids 102 against its own ask at 101 and user 11's at 102");
    println!("  own ask filled: {}, other ask filled: {}", own.read().quantity_fulfilled, other.read().quantity_fulfilled);
    sim.print_depth(ACME);
    Ok(())
}

/// A falling trade triggers stop-losses that sell into the bids.
async fn scenario_3_stop_loss_cascade(sim: &mut Sim) -> Result<(), Box<dyn Error>> {
    println!("\nScenario 3: Stop-Loss Cascade\n");

    let support = sim.order(20, GLOBEX, Side::Bid, OrderType::Limit, price(dec!(240))?, 20);
    sim.submit(&support).await?;

    let stop_high = sim.order(21, GLOBEX, Side::Ask, OrderType::StopLoss, price(dec!(249))?, 4);
    let stop_low = sim.order(22, GLOBEX, Side::Ask, OrderType::StopLoss, price(dec!(240))?, 4);
    sim.submit(&stop_high).await?;
    sim.submit(&stop_low).await?;
    println!("  Stop-losses parked at 249 and 240");

    let seller = sim.order(23, GLOBEX, Side::Ask, OrderType::Market, Price::MARKET, 8);
    sim.submit(&seller).await?;
    println!("  A market sell of 8 takes the 252 bid, then trades down at 240");
    for stop in [&stop_high, &stop_low] {
        let s = stop.snapshot();
        println!("  stop @{}: {:?}, filled {}", s.price, s.order_type, s.quantity_fulfilled);
    }
    sim.print_depth(GLOBEX);
    Ok(())
}

/// Cancellation withdraws depth at once; the order leaves the queue later.
async fn scenario_4_lazy_cancellation(sim: &mut Sim) -> Result<(), Box<dyn Error>> {
    println!("\nScenario 4: Lazy Cancellation\n");

    let ask = sim.order(30, ACME, Side::Ask, OrderType::Limit, price(dec!(105))?, 8);
    sim.submit(&ask).await?;
    sim.settlement.cancel(&ask)?;
    sim.engine.cancel_ask_order(&ask)?;
    println!("  Ask 8 @ 105 cancelled, depth updated immediately");
    sim.print_depth(ACME);

    let bid = sim.order(31, ACME, Side::Bid, OrderType::Limit, price(dec!(105))?, 8);
    sim.submit(&bid).await?;
    println!("  Bid 8 @ 105 skips the cancelled ask: filled {}", bid.read().quantity_fulfilled);
    sim.print_depth(ACME);
    Ok(())
}

/// Two market orders trade at the last traded price.
async fn scenario_5_market_vs_market(sim: &mut Sim) -> Result<(), Box<dyn Error>> {
    println!("\nScenario 5: Market vs Market\n");

    let ask = sim.order(40, ACME, Side::Ask, OrderType::Market, Price::MARKET, 3);
    sim.submit(&ask).await?;
    let resting_bids = sim
        .engine
        .order_book(ACME)
        .map(|book| book.resting_count(Side::Bid))
        .unwrap_or_default();
    println!("  Market ask 3 fills {}, {} bid(s) left resting", ask.read().quantity_fulfilled, resting_bids);

    let ask = sim.order(41, ACME, Side::Ask, OrderType::Market, Price::MARKET, 2);
    let bid = sim.order(42, ACME, Side::Bid, OrderType::Market, Price::MARKET, 2);
    sim.submit(&ask).await?;
    sim.submit(&bid).await?;

    let last = sim.engine.order_book(ACME).map(|book| book.last_price());
    if let Some(last) = last {
        println!("  Market ask 2 and market bid 2 trade at last price {last}");
    }
    sim.print_depth(ACME);
    Ok(())
}
