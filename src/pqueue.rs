//! Array-backed binary heap of resting orders.
//!
//! Every order book owns four of these: the active ask and bid queues and the two
//! stop-loss queues. Ranking is computed from a snapshot taken when the order is
//! pushed (price, unfulfilled quantity, type, time). The snapshot is not refreshed
//! while the order is partially filled, so a resting order keeps its position.
//!
//! The heap is 1-indexed: the parent of `k` is `k / 2`, its children `2k` and `2k + 1`.
//! All operations are synchronized. `head` and `size` take the shared lock,
//! `push` and `pop` the exclusive one.

use crate::order::{OrderHandle, OrderType};
use crate::types::{OrderId, Price, Quantity, Timestamp};
use parking_lot::RwLock;
use std::cmp::Ordering;

/// Which end of the price range wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapOrder {
    /// Lowest price first. Used by the active ask queue and the bid stop-loss queue.
    Ask,
    /// Highest price first. Used by the active bid queue and the ask stop-loss queue.
    Bid,
}

/// An order plus the ranking snapshot taken at insertion.
#[derive(Debug, Clone)]
pub struct QueueItem {
    order: OrderHandle,
    order_id: OrderId,
    order_type: OrderType,
    price: Price,
    quantity: Quantity,
    created_at: Timestamp,
}

impl QueueItem {
    pub fn new(order: OrderHandle) -> Self {
        let (order_id, order_type, price, quantity, created_at) = {
            let o = order.read();
            (o.id, o.order_type, o.price, o.unfulfilled(), o.created_at)
        };

        Self {
            order,
            order_id,
            order_type,
            price,
            quantity,
            created_at,
        }
    }

    pub fn order(&self) -> &OrderHandle {
        &self.order
    }

    pub fn into_order(self) -> OrderHandle {
        self.order
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn price(&self) -> Price {
        self.price
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    fn is_market(&self) -> bool {
        self.order_type.is_market()
    }
}

/// Ranks `a` against `b`. `Greater` means `a` should be served first.
///
/// Market-class orders beat limit-class ones and are served oldest first.
/// Limit-class orders compare by price in the heap's direction, then by
/// larger snapshot quantity, then by age.
pub fn rank(heap_order: HeapOrder, a: &QueueItem, b: &QueueItem) -> Ordering {
    let ordering = match (a.is_market(), b.is_market()) {
        (true, true) => b.created_at.cmp(&a.created_at),
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => {
            let by_price = match heap_order {
                HeapOrder::Ask => b.price.cmp(&a.price),
                HeapOrder::Bid => a.price.cmp(&b.price),
            };
            by_price
                .then(a.quantity.cmp(&b.quantity))
                .then(b.created_at.cmp(&a.created_at))
        }
    };

    // ids are assigned in arrival order, lower id wins a full tie
    ordering.then(b.order_id.cmp(&a.order_id))
}

/// Thread-safe binary heap over `QueueItem`s.
#[derive(Debug)]
pub struct PriorityQueue {
    heap_order: HeapOrder,
    items: RwLock<Vec<QueueItem>>,
}

impl PriorityQueue {
    pub fn new(heap_order: HeapOrder) -> Self {
        Self {
            heap_order,
            items: RwLock::new(Vec::new()),
        }
    }

    pub fn heap_order(&self) -> HeapOrder {
        self.heap_order
    }

    /// Snapshots the order and inserts it. O(log n).
    pub fn push(&self, order: OrderHandle) {
        // snapshot first: no order lock may be held while the heap lock is taken
        self.push_item(QueueItem::new(order));
    }

    /// Re-inserts an item with its original snapshot, restoring its old rank.
    pub fn push_item(&self, item: QueueItem) {
        let mut items = self.items.write();
        items.push(item);
        let n = items.len();
        swim(self.heap_order, &mut items, n);
    }

    /// Removes and returns the best item. O(log n).
    pub fn pop(&self) -> Option<QueueItem> {
        self.pop_if(|_| true)
    }

    /// Removes the best item only if `take` accepts its order. The check and the
    /// removal happen under one lock, so a concurrent push cannot slip in between.
    pub fn pop_if(&self, take: impl FnOnce(&OrderHandle) -> bool) -> Option<QueueItem> {
        let mut items = self.items.write();
        let n = items.len();
        if n == 0 || !take(&items[0].order) {
            return None;
        }

        items.swap(0, n - 1);
        let top = items.pop();
        sink(self.heap_order, &mut items, 1);
        top
    }

    /// Best order without removing it. O(1).
    pub fn head(&self) -> Option<OrderHandle> {
        self.items.read().first().map(|item| item.order.clone())
    }

    /// Best item, snapshot included, without removing it.
    pub fn head_item(&self) -> Option<QueueItem> {
        self.items.read().first().cloned()
    }

    pub fn size(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }
}

// k, i and j below are 1-based heap positions
fn outranks(heap_order: HeapOrder, items: &[QueueItem], i: usize, j: usize) -> bool {
    rank(heap_order, &items[i - 1], &items[j - 1]) == Ordering::Greater
}

fn swim(heap_order: HeapOrder, items: &mut [QueueItem], mut k: usize) {
    while k > 1 && outranks(heap_order, items, k, k / 2) {
        items.swap(k - 1, k / 2 - 1);
        k /= 2;
    }
}

fn sink(heap_order: HeapOrder, items: &mut [QueueItem], mut k: usize) {
    let n = items.len();
    while 2 * k <= n {
        let mut j = 2 * k;
        if j < n && outranks(heap_order, items, j + 1, j) {
            j += 1;
        }
        if !outranks(heap_order, items, j, k) {
            break;
        }
        items.swap(k - 1, j - 1);
        k = j;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::Order;
    use crate::types::{InstrumentId, Side, UserId};
    use std::sync::Arc;

    // 2017-12-29T01:00:00Z
    const BASE_MS: i64 = 1_514_509_200_000;
    const HOUR_MS: i64 = 3_600_000;

    fn make_order(id: u64, side: Side, order_type: OrderType, qty: u64, price: u64, hour: i64) -> OrderHandle {
        Order::new(
            OrderId(id),
            UserId(2),
            InstrumentId(1),
            side,
            order_type,
            Price::from_u64(price),
            Quantity(qty),
            Timestamp::from_millis(BASE_MS + hour * HOUR_MS),
        )
        .into_handle()
    }

    fn fixture(side: Side) -> Vec<OrderHandle> {
        vec![
            make_order(1, side, OrderType::Limit, 5, 100, 0),
            make_order(2, side, OrderType::Limit, 2, 800, 1),
            make_order(3, side, OrderType::Market, 3, 500, 2),
            make_order(4, side, OrderType::StopLossActive, 11, 400, 3),
            make_order(5, side, OrderType::Limit, 10, 100, 4),
        ]
    }

    fn drain(queue: &PriorityQueue) -> Vec<(u64, u64)> {
        std::iter::from_fn(|| queue.pop())
            .map(|item| {
                let o = item.order().read();
                (o.price.value().try_into().unwrap(), o.quantity.value())
            })
            .collect()
    }

    #[test]
    fn empty_queue() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
        assert!(queue.head().is_none());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn bid_queue_pops_highest_first() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        for order in fixture(Side::Bid) {
            queue.push(order);
        }

        assert_eq!(
            drain(&queue),
            vec![(500, 3), (400, 11), (800, 2), (100, 10), (100, 5)]
        );
    }

    #[test]
    fn ask_queue_pops_lowest_first() {
        let queue = PriorityQueue::new(HeapOrder::Ask);
        for order in fixture(Side::Ask) {
            queue.push(order);
        }

        assert_eq!(
            drain(&queue),
            vec![(500, 3), (400, 11), (100, 10), (100, 5), (800, 2)]
        );
    }

    #[test]
    fn concurrent_pushes_keep_ordering() {
        let queue = Arc::new(PriorityQueue::new(HeapOrder::Bid));

        std::thread::scope(|s| {
            for order in fixture(Side::Bid) {
                let queue = Arc::clone(&queue);
                s.spawn(move || queue.push(order));
            }
        });

        assert_eq!(queue.size(), 5);
        assert_eq!(
            drain(&queue),
            vec![(500, 3), (400, 11), (800, 2), (100, 10), (100, 5)]
        );
    }

    #[test]
    fn head_peeks_without_removing() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        queue.push(make_order(1, Side::Bid, OrderType::Limit, 5, 100, 0));
        queue.push(make_order(2, Side::Bid, OrderType::Limit, 11, 400, 1));

        let head = queue.head().unwrap();
        assert_eq!(head.id(), OrderId(2));
        assert_eq!(queue.size(), 2);

        let ask_queue = PriorityQueue::new(HeapOrder::Ask);
        ask_queue.push(make_order(3, Side::Ask, OrderType::Limit, 5, 100, 0));
        ask_queue.push(make_order(4, Side::Ask, OrderType::Limit, 11, 400, 1));
        assert_eq!(ask_queue.head().unwrap().id(), OrderId(3));
    }

    #[test]
    fn snapshot_is_not_refreshed_by_fills() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        let big = make_order(1, Side::Bid, OrderType::Limit, 10, 100, 0);
        let small = make_order(2, Side::Bid, OrderType::Limit, 6, 100, 1);
        queue.push(big.clone());
        queue.push(small);

        // partial fill leaves 2 unfulfilled but the queued snapshot still says 10
        big.write().fill(Quantity(8));
        let item = queue.pop().unwrap();
        assert_eq!(item.order_id(), OrderId(1));
        assert_eq!(item.quantity(), Quantity(10));
    }

    #[test]
    fn reinserted_item_regains_its_rank() {
        let queue = PriorityQueue::new(HeapOrder::Ask);
        queue.push(make_order(1, Side::Ask, OrderType::Limit, 5, 100, 0));
        queue.push(make_order(2, Side::Ask, OrderType::Limit, 5, 110, 1));

        let first = queue.pop().unwrap();
        first.order().write().fill(Quantity(4));
        queue.push_item(first);

        assert_eq!(queue.head().unwrap().id(), OrderId(1));
    }

    #[test]
    fn limit_ties_fall_back_to_age() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        queue.push(make_order(7, Side::Bid, OrderType::Limit, 5, 100, 3));
        queue.push(make_order(8, Side::Bid, OrderType::Limit, 5, 100, 1));

        assert_eq!(queue.pop().unwrap().order_id(), OrderId(8));
        assert_eq!(queue.pop().unwrap().order_id(), OrderId(7));
    }

    #[test]
    fn pop_if_only_takes_an_accepted_head() {
        let queue = PriorityQueue::new(HeapOrder::Bid);
        queue.push(make_order(1, Side::Bid, OrderType::Limit, 5, 100, 0));
        queue.push(make_order(2, Side::Bid, OrderType::Limit, 5, 120, 1));

        // the check sees the current head, not the one a caller looked at earlier
        assert!(queue.pop_if(|head| head.id() == OrderId(1)).is_none());
        assert_eq!(queue.size(), 2);

        let taken = queue.pop_if(|head| head.id() == OrderId(2)).unwrap();
        assert_eq!(taken.order_id(), OrderId(2));
        assert_eq!(queue.head().unwrap().id(), OrderId(1));
        assert!(PriorityQueue::new(HeapOrder::Ask).pop_if(|_| true).is_none());
    }
}
