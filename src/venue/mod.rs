// =============================================================================
// Venue Interface — injected transport boundary
// =============================================================================
//
// The venue client is a pure transport: it moves requests and frames, and
// every policy (gating, idempotency, reconciliation) is enforced above it.
// Submit and cancel return a tagged Outcome so that an ambiguous result
// (timeout, 5xx, unknown) can never masquerade as success or failure.
// =============================================================================

pub mod rest;
pub mod ws;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Cents, Outcome, Side};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// An order as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrder {
    pub client_order_id: String,
    pub exchange_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_cents: Cents,
    pub filled_cents: Cents,
    pub status: String,
}

/// A fill as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueFill {
    pub exchange_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_cents: Cents,
    pub ts_ms: i64,
}

/// A position as the venue reports it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenuePosition {
    pub market_id: String,
    pub side: Side,
    pub size_cents: Cents,
    pub avg_price: f64,
}

/// A limit-order submission. Post-only is the default; a marketable limit
/// is only ever requested under the taker conditions checked upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_cents: Cents,
    pub client_order_id: String,
    pub post_only: bool,
    pub marketable_limit: bool,
}

/// The venue's acknowledgment of an accepted submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedOrder {
    pub exchange_order_id: String,
    pub status: String,
    pub filled_cents: Cents,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// Injected venue transport. REST reads are authoritative for
/// reconciliation only; they never drive pricing decisions.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Server-time probe for the startup clock-drift check.
    async fn server_time_ms(&self) -> Result<i64>;

    /// Available balance in USD cents.
    async fn balance_cents(&self) -> Result<Cents>;

    /// All open orders for this account.
    async fn open_orders(&self) -> Result<Vec<VenueOrder>>;

    /// Fills since `since_ms`.
    async fn fills_since(&self, since_ms: i64) -> Result<Vec<VenueFill>>;

    /// Current positions.
    async fn positions(&self) -> Result<Vec<VenuePosition>>;

    /// Look up one order by client id (the PENDING_UNKNOWN resolver).
    /// Ok(None) means the venue authoritatively reports no such order.
    async fn find_order(&self, client_order_id: &str) -> Result<Option<VenueOrder>>;

    /// Submit a limit order. Ambiguity (timeout, 5xx) is a first-class
    /// outcome, never an error the caller might retry.
    async fn submit_limit_order(&self, req: &SubmitRequest) -> Outcome<SubmittedOrder>;

    /// Cancel an order. AbsentConfirmed means the venue authoritatively
    /// reports the order gone.
    async fn cancel_order(&self, market_id: &str, exchange_order_id: &str) -> Outcome<()>;
}

// ---------------------------------------------------------------------------
// Scripted venue for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod testkit {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;

    /// A fully scriptable in-memory venue. Tests enqueue outcomes and then
    /// inspect what the engine sent.
    #[derive(Default)]
    pub struct ScriptedVenue {
        pub server_time: Mutex<i64>,
        pub balance: Mutex<Cents>,
        pub orders: Mutex<Vec<VenueOrder>>,
        /// Orders visible to the by-id lookup but not (yet) in the
        /// open-orders listing — the venue-side lag during an ambiguous
        /// submit window.
        pub lookup_orders: Mutex<Vec<VenueOrder>>,
        pub fills: Mutex<Vec<VenueFill>>,
        pub position_rows: Mutex<Vec<VenuePosition>>,
        pub submit_outcomes: Mutex<VecDeque<Outcome<SubmittedOrder>>>,
        pub cancel_outcomes: Mutex<VecDeque<Outcome<()>>>,
        pub submitted: Mutex<Vec<SubmitRequest>>,
        pub cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedVenue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_submit_outcome(&self, outcome: Outcome<SubmittedOrder>) {
            self.submit_outcomes.lock().push_back(outcome);
        }

        pub fn push_cancel_outcome(&self, outcome: Outcome<()>) {
            self.cancel_outcomes.lock().push_back(outcome);
        }

        pub fn add_open_order(&self, order: VenueOrder) {
            self.orders.lock().push(order);
        }

        pub fn add_lookup_order(&self, order: VenueOrder) {
            self.lookup_orders.lock().push(order);
        }
    }

    #[async_trait]
    impl VenueClient for ScriptedVenue {
        async fn server_time_ms(&self) -> Result<i64> {
            Ok(*self.server_time.lock())
        }

        async fn balance_cents(&self) -> Result<Cents> {
            Ok(*self.balance.lock())
        }

        async fn open_orders(&self) -> Result<Vec<VenueOrder>> {
            Ok(self.orders.lock().clone())
        }

        async fn fills_since(&self, since_ms: i64) -> Result<Vec<VenueFill>> {
            Ok(self
                .fills
                .lock()
                .iter()
                .filter(|f| f.ts_ms >= since_ms)
                .cloned()
                .collect())
        }

        async fn positions(&self) -> Result<Vec<VenuePosition>> {
            Ok(self.position_rows.lock().clone())
        }

        async fn find_order(&self, client_order_id: &str) -> Result<Option<VenueOrder>> {
            let listed = self
                .orders
                .lock()
                .iter()
                .find(|o| o.client_order_id == client_order_id)
                .cloned();
            Ok(listed.or_else(|| {
                self.lookup_orders
                    .lock()
                    .iter()
                    .find(|o| o.client_order_id == client_order_id)
                    .cloned()
            }))
        }

        async fn submit_limit_order(&self, req: &SubmitRequest) -> Outcome<SubmittedOrder> {
            self.submitted.lock().push(req.clone());
            self.submit_outcomes
                .lock()
                .pop_front()
                .unwrap_or(Outcome::Ambiguous("no scripted outcome".to_string()))
        }

        async fn cancel_order(&self, _market_id: &str, exchange_order_id: &str) -> Outcome<()> {
            self.cancelled.lock().push(exchange_order_id.to_string());
            self.cancel_outcomes
                .lock()
                .pop_front()
                .unwrap_or(Outcome::Ambiguous("no scripted outcome".to_string()))
        }
    }
}
