//! Property-based tests for queue ordering and matching invariants.
//!
//! These tests verify invariants hold under random inputs.

use exchange_core::*;
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
struct Draft {
    side: Side,
    order_type: OrderType,
    price: u64,
    qty: u64,
    user: u32,
}

// Strategies for generating test data
fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Ask), Just(Side::Bid)]
}

fn queue_type_strategy() -> impl Strategy<Value = OrderType> {
    prop_oneof![
        6 => Just(OrderType::Limit),
        1 => Just(OrderType::Market),
        1 => Just(OrderType::StopLossActive),
    ]
}

fn submit_type_strategy() -> impl Strategy<Value = OrderType> {
    prop_oneof![
        8 => Just(OrderType::Limit),
        1 => Just(OrderType::Market),
        1 => Just(OrderType::StopLoss),
    ]
}

fn draft_strategy(types: BoxedStrategy<OrderType>) -> impl Strategy<Value = Draft> {
    (side_strategy(), types, 90u64..=110, 1u64..=20, 1u32..=4).prop_map(|(side, order_type, price, qty, user)| Draft {
        side,
        order_type,
        price,
        qty,
        user,
    })
}

fn build(id: u64, draft: &Draft) -> OrderHandle {
    let price = match draft.order_type {
        OrderType::Market => Price::MARKET,
        _ => Price::from_u64(draft.price),
    };
    Order::new(
        OrderId(id),
        UserId(draft.user),
        InstrumentId(1),
        draft.side,
        draft.order_type,
        price,
        Quantity(draft.qty),
        Timestamp::from_millis(1_000 + id as i64 % 7),
    )
    .into_handle()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Final state of one random session through a single book.
struct Session {
    orders: Vec<OrderHandle>,
    trades: Vec<Trade>,
    depth: DepthSnapshot,
}

fn run_session(drafts: &[Draft]) -> Session {
    runtime().block_on(async {
        let source = InMemorySource::new();
        source.add_instrument(Instrument {
            id: InstrumentId(1),
            current_price: Price::from_u64(100),
        });
        let settlement = Arc::new(SimulatedSettlement::new());
        let depths = Arc::new(MarketDepthRegistry::new(10));
        let engine = MatchingEngine::bootstrap(&source, settlement.clone(), depths.clone(), EngineConfig::default())
            .await
            .unwrap();

        let mut orders = Vec::new();
        for (i, draft) in drafts.iter().enumerate() {
            let order = build(i as u64 + 1, draft);
            match draft.side {
                Side::Ask => engine.add_ask_order(order.clone()).await.unwrap(),
                Side::Bid => engine.add_bid_order(order.clone()).await.unwrap(),
            }
            orders.push(order);
        }
        engine.flush().await.unwrap();
        engine.shutdown().await.unwrap();

        Session {
            orders,
            trades: settlement.trades(),
            depth: depths.get(InstrumentId(1)).unwrap().snapshot(),
        }
    })
}

proptest! {
    /// Popping always yields items in non-increasing rank
    #[test]
    fn heap_pops_in_rank_order(
        heap_order in prop_oneof![Just(HeapOrder::Ask), Just(HeapOrder::Bid)],
        drafts in prop::collection::vec(draft_strategy(queue_type_strategy().boxed()), 1..40),
    ) {
        let queue = PriorityQueue::new(heap_order);
        for (i, draft) in drafts.iter().enumerate() {
            queue.push(build(i as u64 + 1, draft));
        }
        prop_assert_eq!(queue.size(), drafts.len());

        let mut popped = Vec::new();
        while let Some(item) = queue.pop() {
            popped.push(item);
        }
        prop_assert_eq!(popped.len(), drafts.len());
        for pair in popped.windows(2) {
            prop_assert_ne!(rank(heap_order, &pair[0], &pair[1]), std::cmp::Ordering::Less);
        }
    }

    /// Market-class items always come out before limit items
    #[test]
    fn market_class_served_first(
        drafts in prop::collection::vec(draft_strategy(queue_type_strategy().boxed()), 1..40),
    ) {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        for (i, draft) in drafts.iter().enumerate() {
            queue.push(build(i as u64 + 1, draft));
        }

        let mut seen_limit = false;
        while let Some(item) = queue.pop() {
            let is_market = item.order().read().is_market();
            prop_assert!(!(seen_limit && is_market), "market-class item after a limit item");
            seen_limit |= !is_market;
        }
    }

    /// Stop-loss trigger direction follows the side
    #[test]
    fn stop_loss_trigger_direction(
        trigger in 1u64..1_000,
        trade in 1u64..1_000,
        side in side_strategy(),
    ) {
        let order = Order::new_stop_loss(
            OrderId(1),
            UserId(1),
            InstrumentId(1),
            side,
            Price::from_u64(trigger),
            Quantity(1),
            Timestamp::from_millis(0),
        );
        let fires = should_trigger(&order, Price::from_u64(trade));
        match side {
            Side::Ask => prop_assert_eq!(fires, trade <= trigger),
            Side::Bid => prop_assert_eq!(fires, trade >= trigger),
        }
    }

    /// Every trade moves the same quantity on both sides and never overfills
    #[test]
    fn matching_conserves_quantity(
        drafts in prop::collection::vec(draft_strategy(submit_type_strategy().boxed()), 1..30),
    ) {
        let session = run_session(&drafts);

        let mut traded = std::collections::HashMap::<OrderId, u64>::new();
        for trade in &session.trades {
            prop_assert!(trade.quantity.value() > 0);
            *traded.entry(trade.ask_id).or_default() += trade.quantity.value();
            *traded.entry(trade.bid_id).or_default() += trade.quantity.value();
        }

        for order in &session.orders {
            let o = order.read();
            prop_assert!(o.quantity_fulfilled <= o.quantity);
            prop_assert_eq!(o.quantity_fulfilled.value(), traded.get(&o.id).copied().unwrap_or(0));
        }

        let ask_fills: u64 = session.orders.iter().filter(|o| o.side() == Side::Ask).map(|o| o.read().quantity_fulfilled.value()).sum();
        let bid_fills: u64 = session.orders.iter().filter(|o| o.side() == Side::Bid).map(|o| o.read().quantity_fulfilled.value()).sum();
        prop_assert_eq!(ask_fills, bid_fills);
    }

    /// No trade is ever between two orders of the same user
    #[test]
    fn no_self_trades(
        drafts in prop::collection::vec(draft_strategy(submit_type_strategy().boxed()), 1..30),
    ) {
        let session = run_session(&drafts);
        let users: std::collections::HashMap<OrderId, UserId> =
            session.orders.iter().map(|o| (o.id(), o.user_id())).collect();

        for trade in &session.trades {
            prop_assert_ne!(users[&trade.ask_id], users[&trade.bid_id]);
        }
    }

    /// Depth shows exactly the unfulfilled quantity of open resting limit orders
    #[test]
    fn depth_matches_open_limit_orders(
        drafts in prop::collection::vec(draft_strategy(submit_type_strategy().boxed()), 1..30),
    ) {
        let session = run_session(&drafts);

        let expected = |side: Side| -> u64 {
            session
                .orders
                .iter()
                .map(|o| o.snapshot())
                .filter(|o| o.side == side && o.order_type == OrderType::Limit && o.is_open())
                .map(|o| o.unfulfilled().value())
                .sum()
        };
        let shown = |levels: &[(Price, Quantity)]| -> u64 { levels.iter().map(|(_, q)| q.value()).sum() };

        prop_assert_eq!(shown(&session.depth.asks), expected(Side::Ask));
        prop_assert_eq!(shown(&session.depth.bids), expected(Side::Bid));
    }
}
