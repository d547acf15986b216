// =============================================================================
// Paper Fill Engine — pessimistic maker-fill simulation
// =============================================================================
//
// No touch-fills. A resting paper limit fills only after the book trades
// through the order's price by at least one venue tick AND stays through
// for three seconds. The applied fee is max(actual fee, 10 bps) doubled,
// so paper results understate live performance rather than flatter it.
//
// Paper orders never reach the WAL or the venue.
// =============================================================================

use std::collections::HashMap;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::event_store::EventStore;
use crate::snapshot::Snapshot;
use crate::types::{micros_to_price, Cents, Order, OrderStatus, Side};

/// Trade-through must persist this long before a fill.
const TRADE_THROUGH_HOLD_MS: i64 = 3_000;
/// Paper fee floor in payout-share units (10 bps).
const PAPER_FEE_FLOOR: f64 = 0.001;
/// Paper fee multiplier.
const PAPER_FEE_MULT: f64 = 2.0;

/// A filled paper order with the applied fee.
#[derive(Debug, Clone)]
pub struct PaperFill {
    pub order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_cents: Cents,
    pub fee_cents: Cents,
    pub filled_at_ms: i64,
}

struct RestingOrder {
    order: Order,
    fee_rate: f64,
    trade_through_since_ms: Option<i64>,
}

/// Tracks resting paper orders and applies the pessimistic fill rule on
/// each new snapshot.
pub struct PaperEngine {
    tick: f64,
    resting: Mutex<HashMap<String, RestingOrder>>,
}

impl PaperEngine {
    /// `tick` is the venue's quoted price increment, pinned in the signed
    /// manifest.
    pub fn new(tick: f64) -> Self {
        Self {
            tick,
            resting: Mutex::new(HashMap::new()),
        }
    }

    /// Rest a new paper order. `fee_rate` is the venue's actual fee for
    /// this market; the floor and multiplier are applied at fill time.
    pub fn place(&self, order: Order, fee_rate: f64) {
        debug!(order_id = %order.id, market = %order.market_id, "paper order resting");
        self.resting.lock().insert(
            order.id.clone(),
            RestingOrder {
                order,
                fee_rate,
                trade_through_since_ms: None,
            },
        );
    }

    pub fn resting_count(&self) -> usize {
        self.resting.lock().len()
    }

    /// Drop a resting order (candidate discarded or residual aged out).
    pub fn cancel(&self, order_id: &str) -> Option<Order> {
        self.resting.lock().remove(order_id).map(|r| r.order)
    }

    /// Apply one snapshot: fills mature where the book has traded through
    /// the order price by >= 1 tick for >= 3 s. Matured fills are persisted
    /// and returned.
    pub fn on_snapshot(&self, snap: &Snapshot, now_ms: i64, store: &EventStore) -> Vec<PaperFill> {
        let mut fills = Vec::new();
        let mut resting = self.resting.lock();

        let matured: Vec<String> = resting
            .iter_mut()
            .filter(|(_, r)| r.order.market_id == snap.market_id)
            .filter_map(|(id, r)| {
                let price = micros_to_price(r.order.price_micros);
                let book = snap.book(r.order.side);

                // A resting buy fills once sellers trade through it: the
                // best ask drops at least one tick below our limit.
                let through = book
                    .best_ask
                    .is_some_and(|ask| ask <= price - self.tick + 1e-12);

                if !through {
                    r.trade_through_since_ms = None;
                    return None;
                }

                let since = *r.trade_through_since_ms.get_or_insert(now_ms);
                (now_ms - since >= TRADE_THROUGH_HOLD_MS).then(|| id.clone())
            })
            .collect();

        for id in matured {
            let Some(mut r) = resting.remove(&id) else {
                continue;
            };
            let price = micros_to_price(r.order.price_micros);
            let fee_rate = r.fee_rate.max(PAPER_FEE_FLOOR) * PAPER_FEE_MULT;
            let fee_cents = (r.order.size_cents as f64 * fee_rate).ceil() as Cents;

            r.order.status = OrderStatus::Filled;
            r.order.filled_cents = r.order.size_cents;
            r.order.residual_cents = 0;
            r.order.updated_at_ms = now_ms;
            if let Err(e) = store.upsert_order(&r.order) {
                tracing::warn!(order_id = %r.order.id, error = %e, "paper fill persist failed");
            }
            let _ = store.append_event(
                "PAPER_FILL",
                Some(&r.order.decision_id),
                &serde_json::json!({
                    "order_id": r.order.id,
                    "market": r.order.market_id,
                    "price": price,
                    "size_cents": r.order.size_cents,
                    "fee_cents": fee_cents,
                }),
                now_ms,
            );

            info!(
                order_id = %r.order.id,
                market = %r.order.market_id,
                price,
                fee_cents,
                "paper order filled"
            );
            fills.push(PaperFill {
                order_id: r.order.id.clone(),
                market_id: r.order.market_id.clone(),
                side: r.order.side,
                price,
                size_cents: r.order.size_cents,
                fee_cents,
                filled_at_ms: now_ms,
            });
        }

        fills
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{BookLevel, SideBook, SnapshotSource};
    use crate::types::price_to_micros;

    const TICK: f64 = 0.001;

    fn order(price: f64) -> Order {
        Order {
            id: "ord-1".into(),
            decision_id: "dec-1".into(),
            market_id: "mkt-1".into(),
            side: Side::Yes,
            status: OrderStatus::Open,
            client_order_id: "c1".into(),
            exchange_order_id: None,
            price_micros: price_to_micros(price),
            size_cents: 2_000,
            filled_cents: 0,
            residual_cents: 2_000,
            pending_unknown_since_ms: None,
            created_at_ms: 0,
            updated_at_ms: 0,
            paper: true,
        }
    }

    fn snap_with_ask(ask_yes: f64, at_ms: i64) -> Snapshot {
        let yes = SideBook {
            best_bid: Some(ask_yes - 0.01),
            best_ask: Some(ask_yes),
            bids: vec![BookLevel {
                price: ask_yes - 0.01,
                size_usd: 100.0,
            }],
            asks: vec![BookLevel {
                price: ask_yes,
                size_usd: 100.0,
            }],
        };
        let no = SideBook {
            best_bid: Some(0.50),
            best_ask: Some(0.52),
            bids: vec![],
            asks: vec![],
        };
        Snapshot::new(
            format!("s-{at_ms}"),
            "mkt-1".into(),
            at_ms,
            SnapshotSource::Ws,
            1,
            at_ms,
            at_ms,
            at_ms,
            yes,
            no,
        )
    }

    #[test]
    fn no_touch_fill() {
        let store = EventStore::open_in_memory().unwrap();
        let engine = PaperEngine::new(TICK);
        engine.place(order(0.43), 0.0005);

        // Ask exactly at our price: a touch, not a trade-through.
        let fills = engine.on_snapshot(&snap_with_ask(0.43, 1_000), 1_000, &store);
        assert!(fills.is_empty());
        let fills = engine.on_snapshot(&snap_with_ask(0.43, 10_000), 10_000, &store);
        assert!(fills.is_empty());
        assert_eq!(engine.resting_count(), 1);
    }

    #[test]
    fn trade_through_must_hold_three_seconds() {
        let store = EventStore::open_in_memory().unwrap();
        let engine = PaperEngine::new(TICK);
        engine.place(order(0.43), 0.0005);

        // Through by one tick at t=0: timer starts.
        assert!(engine
            .on_snapshot(&snap_with_ask(0.429, 0), 0, &store)
            .is_empty());
        // Still through at t=2.9s: not yet.
        assert!(engine
            .on_snapshot(&snap_with_ask(0.429, 2_900), 2_900, &store)
            .is_empty());
        // Held at t=3s: fill at our limit price.
        let fills = engine.on_snapshot(&snap_with_ask(0.429, 3_000), 3_000, &store);
        assert_eq!(fills.len(), 1);
        assert!((fills[0].price - 0.43).abs() < 1e-9);
        assert_eq!(engine.resting_count(), 0);

        // Persisted as FILLED.
        let persisted = store.get_order_by_client_id("c1").unwrap().unwrap();
        assert_eq!(persisted.status, OrderStatus::Filled);
        assert_eq!(persisted.residual_cents, 0);
    }

    #[test]
    fn bounce_back_resets_the_hold_timer() {
        let store = EventStore::open_in_memory().unwrap();
        let engine = PaperEngine::new(TICK);
        engine.place(order(0.43), 0.0005);

        assert!(engine
            .on_snapshot(&snap_with_ask(0.429, 0), 0, &store)
            .is_empty());
        // Book bounces back above the trade-through level.
        assert!(engine
            .on_snapshot(&snap_with_ask(0.431, 1_000), 1_000, &store)
            .is_empty());
        // Through again: the 3 s clock restarts.
        assert!(engine
            .on_snapshot(&snap_with_ask(0.429, 2_000), 2_000, &store)
            .is_empty());
        assert!(engine
            .on_snapshot(&snap_with_ask(0.429, 4_900), 4_900, &store)
            .is_empty());
        assert_eq!(
            engine
                .on_snapshot(&snap_with_ask(0.429, 5_000), 5_000, &store)
                .len(),
            1
        );
    }

    #[test]
    fn fee_is_floored_and_doubled() {
        let store = EventStore::open_in_memory().unwrap();
        let engine = PaperEngine::new(TICK);
        // Actual fee 5 bps, below the 10 bps floor.
        engine.place(order(0.43), 0.0005);

        engine.on_snapshot(&snap_with_ask(0.429, 0), 0, &store);
        let fills = engine.on_snapshot(&snap_with_ask(0.429, 3_000), 3_000, &store);
        // 2000c * 10bps * 2 = 4c.
        assert_eq!(fills[0].fee_cents, 4);

        // Actual fee above the floor: 30 bps doubled = 60 bps.
        let engine = PaperEngine::new(TICK);
        let mut o = order(0.43);
        o.id = "ord-2".into();
        o.client_order_id = "c2".into();
        engine.place(o, 0.003);
        engine.on_snapshot(&snap_with_ask(0.429, 0), 0, &store);
        let fills = engine.on_snapshot(&snap_with_ask(0.429, 3_000), 3_000, &store);
        // 2000c * 60bps = 12c.
        assert_eq!(fills[0].fee_cents, 12);
    }

    #[test]
    fn cancel_removes_resting_order() {
        let engine = PaperEngine::new(TICK);
        engine.place(order(0.43), 0.0);
        assert!(engine.cancel("ord-1").is_some());
        assert!(engine.cancel("ord-1").is_none());
        assert_eq!(engine.resting_count(), 0);
    }

    #[test]
    fn other_markets_are_untouched() {
        let store = EventStore::open_in_memory().unwrap();
        let engine = PaperEngine::new(TICK);
        let mut o = order(0.43);
        o.market_id = "mkt-other".into();
        engine.place(o, 0.0);

        let fills = engine.on_snapshot(&snap_with_ask(0.40, 3_000), 3_000, &store);
        assert!(fills.is_empty());
        assert_eq!(engine.resting_count(), 1);
    }
}
