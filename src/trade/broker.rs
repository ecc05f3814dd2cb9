//! Broker adapter port: the reference's `ServiceAdapter` (withdraw/deposit/
//! rollback/commit) generalized from fund transfer to order submission.
//! All methods must be idempotent with respect to `client_order_id` — the
//! bus/coordinator may call `submit` more than once for the same order
//! while it is in `SUBMITTING`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::types::Order;

/// What the broker said about a submit attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    /// Broker acknowledged the order under this id.
    Acked { broker_order_id: String },
    /// Broker explicitly rejected the order.
    Rejected { reason: String },
    /// Send timed out or the connection dropped — ambiguous, not a reject.
    Unknown,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    Acked,
    Failed(String),
}

/// One broker-reported open order, used by the reconciler to match against
/// a `SUBMIT_UNKNOWN` intent.
#[derive(Debug, Clone)]
pub struct BrokerOpenOrder {
    pub broker_order_id: String,
    /// Echoed back if the broker's remark/tag field carried it.
    pub request_hash: Option<String>,
    pub intent_id_remark: Option<String>,
    pub cum_qty: f64,
    pub target_qty: f64,
}

/// One broker-reported fill, used both by the reconciler's match pass and
/// by its fill-backfill sweep.
#[derive(Debug, Clone)]
pub struct BrokerFillReport {
    pub broker_fill_id: Option<String>,
    pub broker_order_id: String,
    pub qty: f64,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// Broker port: submit/cancel/query-open-orders/query-fills, generalized
/// from the reference's withdraw/deposit/rollback/commit adapter shape.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    async fn submit(&self, order: &Order, intent_id: &str) -> SubmitOutcome;

    async fn cancel(&self, broker_order_id: &str) -> CancelOutcome;

    /// Today's open orders, used to find a matching broker order for an
    /// intent stuck in `SUBMIT_UNKNOWN`.
    async fn query_open_orders(&self) -> Vec<BrokerOpenOrder>;

    /// Today's fills, used both for reconciliation matching and for the
    /// sweep that backfills missing fill events.
    async fn query_fills_today(&self) -> Vec<BrokerFillReport>;
}

/// Deterministic, fully in-process broker double: scripted submit/cancel
/// outcomes plus a settable open-orders/fills snapshot, mirroring the
/// reference's `MockAdapter`. No real broker wire protocol ships in this
/// crate — a deployment supplies its own `BrokerAdapter`; this one is what
/// the crate's own tests run against.
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    pub struct MockBrokerAdapter {
        submit_outcomes: Mutex<Vec<SubmitOutcome>>,
        cancel_outcomes: Mutex<Vec<CancelOutcome>>,
        open_orders: Mutex<Vec<BrokerOpenOrder>>,
        fills: Mutex<Vec<BrokerFillReport>>,
        submit_calls: Mutex<Vec<String>>,
    }

    impl MockBrokerAdapter {
        pub fn new() -> Self {
            Self {
                submit_outcomes: Mutex::new(Vec::new()),
                cancel_outcomes: Mutex::new(Vec::new()),
                open_orders: Mutex::new(Vec::new()),
                fills: Mutex::new(Vec::new()),
                submit_calls: Mutex::new(Vec::new()),
            }
        }

        pub fn script_submit(&self, outcomes: Vec<SubmitOutcome>) {
            *self.submit_outcomes.lock().unwrap() = outcomes;
        }

        pub fn script_cancel(&self, outcomes: Vec<CancelOutcome>) {
            *self.cancel_outcomes.lock().unwrap() = outcomes;
        }

        pub fn set_open_orders(&self, orders: Vec<BrokerOpenOrder>) {
            *self.open_orders.lock().unwrap() = orders;
        }

        pub fn set_fills(&self, fills: Vec<BrokerFillReport>) {
            *self.fills.lock().unwrap() = fills;
        }

        pub fn submit_call_count(&self) -> usize {
            self.submit_calls.lock().unwrap().len()
        }
    }

    impl Default for MockBrokerAdapter {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl BrokerAdapter for MockBrokerAdapter {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn submit(&self, order: &Order, _intent_id: &str) -> SubmitOutcome {
            self.submit_calls.lock().unwrap().push(order.order_id.clone());
            let mut outcomes = self.submit_outcomes.lock().unwrap();
            if outcomes.is_empty() {
                SubmitOutcome::Acked {
                    broker_order_id: format!("BRK-{}", order.order_id),
                }
            } else {
                outcomes.remove(0)
            }
        }

        async fn cancel(&self, _broker_order_id: &str) -> CancelOutcome {
            let mut outcomes = self.cancel_outcomes.lock().unwrap();
            if outcomes.is_empty() {
                CancelOutcome::Acked
            } else {
                outcomes.remove(0)
            }
        }

        async fn query_open_orders(&self) -> Vec<BrokerOpenOrder> {
            self.open_orders.lock().unwrap().clone()
        }

        async fn query_fills_today(&self) -> Vec<BrokerFillReport> {
            self.fills.lock().unwrap().clone()
        }
    }
}
