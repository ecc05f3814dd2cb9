//! Transactional persistence port for the submission state machine — the
//! reference's `TransferDb` over `sqlx::PgPool`, generalized to an
//! in-process `MemoryTradeStore`. Every operation below is one transaction:
//! state write, outbox write, and inbox update land together or not at all.
//! No cross-intent transactions.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::error::TradeError;
use super::state::IntentState;
use super::types::{Fill, FillNaturalKey, InboxRecord, Intent, Order, OutboxRecord};

/// What recording an approval event against the inbox decided.
#[derive(Debug, Clone)]
pub enum InboxOutcome {
    /// First time this `intent_id` has been seen; the intent now exists in
    /// `RiskApproved` (approved) or `Rejected` (not approved).
    FirstTime(Intent),
    /// Already recorded; the bus must not re-enter the state machine.
    AlreadySeen(InboxRecord),
}

/// Outcome of attempting to persist one fill against its natural key.
#[derive(Debug, Clone, PartialEq)]
pub enum FillOutcome {
    Inserted,
    DuplicateDiscarded,
    /// Same natural key, conflicting `(qty, price)` — halts the intent.
    Conflict,
}

#[async_trait]
pub trait TradeStore: Send + Sync {
    /// Atomic inbox-gated intent creation. Returns `AlreadySeen` on a
    /// repeated delivery rather than re-entering the state machine —
    /// idempotency enforced at the storage boundary.
    async fn record_approval(
        &self,
        intent_id: &str,
        trace_id: &str,
        approved: bool,
        rejection_reasons: Vec<String>,
        snapshot: Value,
        digest: &str,
    ) -> Result<InboxOutcome, TradeError>;

    async fn get_intent(&self, intent_id: &str) -> Option<Intent>;

    async fn get_inbox(&self, intent_id: &str) -> Option<InboxRecord>;

    /// Conditional lease acquisition: succeeds if unheld, expired, or
    /// already held by `owner`.
    async fn acquire_lease(&self, intent_id: &str, owner: &str, ttl: Duration) -> Result<bool, TradeError>;

    /// Compare-and-swap the intent's state, checking `lease_owner` first.
    /// Returns `Ok(false)` if `from` no longer matches (another worker
    /// already advanced it); never mutates in that case.
    async fn compare_and_swap_state(
        &self,
        intent_id: &str,
        owner: &str,
        from: IntentState,
        to: IntentState,
    ) -> Result<bool, TradeError>;

    async fn create_order(&self, order: Order) -> Result<(), TradeError>;

    async fn get_order_by_intent(&self, intent_id: &str) -> Option<Order>;

    async fn set_broker_order_id(&self, order_id: &str, broker_order_id: &str) -> Result<(), TradeError>;

    async fn find_order_by_broker_order_id(&self, broker_order_id: &str) -> Option<Order>;

    /// Dedups on the fill's natural key; advances `cum_qty` on a genuine
    /// insert only.
    async fn record_fill(&self, fill: Fill) -> Result<FillOutcome, TradeError>;

    async fn intents_in_state(&self, state: IntentState) -> Vec<Intent>;

    /// Every intent record carries its own `trace_id`, propagated unchanged
    /// into emitted events.
    async fn intent_trace_id(&self, intent_id: &str) -> Option<String>;

    /// Persists one pending outbound event alongside the state transition
    /// that produced it, before anything is handed to the bus. A crash
    /// between "decided" and "published" leaves the record here for
    /// `pending_outbox` to pick back up rather than losing the event.
    async fn append_outbox(&self, record: OutboxRecord) -> Result<(), TradeError>;

    /// Unpublished outbox entries, oldest first, up to `limit`.
    async fn pending_outbox(&self, limit: usize) -> Vec<OutboxRecord>;

    async fn mark_outbox_published(&self, outbox_id: &str) -> Result<(), TradeError>;
}

#[derive(Clone)]
struct OrderRow {
    order: Order,
}

struct Inner {
    intents: HashMap<String, Intent>,
    inbox: HashMap<String, InboxRecord>,
    orders_by_id: HashMap<String, OrderRow>,
    order_by_intent: HashMap<String, String>,
    order_by_broker_id: HashMap<String, String>,
    fills_by_key: HashMap<FillNaturalKey, Fill>,
    lease_expires_at: HashMap<String, chrono::DateTime<Utc>>,
    outbox: Vec<OutboxRecord>,
}

/// In-process reference implementation. One process-wide mutex stands in
/// for the reference's Postgres transaction boundary — every public method
/// here is the unit of atomicity.
pub struct MemoryTradeStore {
    inner: Mutex<Inner>,
}

impl MemoryTradeStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                intents: HashMap::new(),
                inbox: HashMap::new(),
                orders_by_id: HashMap::new(),
                order_by_intent: HashMap::new(),
                order_by_broker_id: HashMap::new(),
                fills_by_key: HashMap::new(),
                lease_expires_at: HashMap::new(),
                outbox: Vec::new(),
            }),
        }
    }
}

impl Default for MemoryTradeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TradeStore for MemoryTradeStore {
    async fn record_approval(
        &self,
        intent_id: &str,
        trace_id: &str,
        approved: bool,
        rejection_reasons: Vec<String>,
        snapshot: Value,
        digest: &str,
    ) -> Result<InboxOutcome, TradeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.inbox.get(intent_id) {
            return Ok(InboxOutcome::AlreadySeen(existing.clone()));
        }

        let state = if approved { IntentState::RiskApproved } else { IntentState::Rejected };
        let mut intent = Intent::new(intent_id, trace_id, snapshot);
        intent.state = state;
        if !approved {
            intent.approval_snapshot = serde_json::json!({
                "reasons": rejection_reasons,
            });
        }
        inner.intents.insert(intent_id.to_string(), intent.clone());
        inner.inbox.insert(
            intent_id.to_string(),
            InboxRecord {
                intent_id: intent_id.to_string(),
                status: state,
                result_digest: digest.to_string(),
            },
        );
        Ok(InboxOutcome::FirstTime(intent))
    }

    async fn get_intent(&self, intent_id: &str) -> Option<Intent> {
        self.inner.lock().unwrap().intents.get(intent_id).cloned()
    }

    async fn get_inbox(&self, intent_id: &str) -> Option<InboxRecord> {
        self.inner.lock().unwrap().inbox.get(intent_id).cloned()
    }

    async fn acquire_lease(&self, intent_id: &str, owner: &str, ttl: Duration) -> Result<bool, TradeError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(intent) = inner.intents.get(intent_id) else {
            return Err(TradeError::IntentNotFound(intent_id.to_string()));
        };
        if !intent.lease_available_to(owner, now) {
            return Ok(false);
        }
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(10));
        inner.lease_expires_at.insert(intent_id.to_string(), expires_at);
        if let Some(intent) = inner.intents.get_mut(intent_id) {
            intent.lease_owner = Some(owner.to_string());
            intent.lease_expires_at = Some(expires_at);
        }
        Ok(true)
    }

    async fn compare_and_swap_state(
        &self,
        intent_id: &str,
        owner: &str,
        from: IntentState,
        to: IntentState,
    ) -> Result<bool, TradeError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let Some(intent) = inner.intents.get_mut(intent_id) else {
            return Err(TradeError::IntentNotFound(intent_id.to_string()));
        };
        if let Some(held_by) = &intent.lease_owner {
            if held_by != owner && intent.lease_expires_at.is_some_and(|exp| exp >= now) {
                return Err(TradeError::LeaseLost {
                    intent_id: intent_id.to_string(),
                    held_by: held_by.clone(),
                });
            }
        }
        if intent.state != from {
            return Ok(false);
        }
        intent.state = to;
        Ok(true)
    }

    async fn create_order(&self, order: Order) -> Result<(), TradeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.order_by_intent.insert(order.intent_id.clone(), order.order_id.clone());
        inner.orders_by_id.insert(order.order_id.clone(), OrderRow { order });
        Ok(())
    }

    async fn get_order_by_intent(&self, intent_id: &str) -> Option<Order> {
        let inner = self.inner.lock().unwrap();
        let order_id = inner.order_by_intent.get(intent_id)?;
        inner.orders_by_id.get(order_id).map(|row| row.order.clone())
    }

    async fn set_broker_order_id(&self, order_id: &str, broker_order_id: &str) -> Result<(), TradeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing_order_id) = inner.order_by_broker_id.get(broker_order_id) {
            if existing_order_id != order_id {
                return Err(TradeError::DuplicateBrokerOrderId(broker_order_id.to_string()));
            }
        }
        inner.order_by_broker_id.insert(broker_order_id.to_string(), order_id.to_string());
        let row = inner
            .orders_by_id
            .get_mut(order_id)
            .ok_or_else(|| TradeError::OrderNotFound(order_id.to_string()))?;
        row.order.broker_order_id = Some(broker_order_id.to_string());
        Ok(())
    }

    async fn find_order_by_broker_order_id(&self, broker_order_id: &str) -> Option<Order> {
        let inner = self.inner.lock().unwrap();
        let order_id = inner.order_by_broker_id.get(broker_order_id)?;
        inner.orders_by_id.get(order_id).map(|row| row.order.clone())
    }

    async fn record_fill(&self, fill: Fill) -> Result<FillOutcome, TradeError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.fills_by_key.get(&fill.natural_key) {
            return if existing.qty == fill.qty && existing.price == fill.price {
                Ok(FillOutcome::DuplicateDiscarded)
            } else {
                Ok(FillOutcome::Conflict)
            };
        }
        let order_id = fill.order_id.clone();
        inner.fills_by_key.insert(fill.natural_key.clone(), fill.clone());
        if let Some(row) = inner.orders_by_id.get_mut(&order_id) {
            row.order.cum_qty += fill.qty;
        } else {
            return Err(TradeError::OrderNotFound(order_id));
        }
        Ok(FillOutcome::Inserted)
    }

    async fn intents_in_state(&self, state: IntentState) -> Vec<Intent> {
        self.inner
            .lock()
            .unwrap()
            .intents
            .values()
            .filter(|i| i.state == state)
            .cloned()
            .collect()
    }

    async fn intent_trace_id(&self, intent_id: &str) -> Option<String> {
        self.inner.lock().unwrap().intents.get(intent_id).map(|i| i.trace_id.clone())
    }

    async fn append_outbox(&self, record: OutboxRecord) -> Result<(), TradeError> {
        self.inner.lock().unwrap().outbox.push(record);
        Ok(())
    }

    async fn pending_outbox(&self, limit: usize) -> Vec<OutboxRecord> {
        self.inner.lock().unwrap().outbox.iter().filter(|r| !r.published).take(limit).cloned().collect()
    }

    async fn mark_outbox_published(&self, outbox_id: &str) -> Result<(), TradeError> {
        let mut inner = self.inner.lock().unwrap();
        let record = inner
            .outbox
            .iter_mut()
            .find(|r| r.outbox_id == outbox_id)
            .ok_or_else(|| TradeError::OrderNotFound(outbox_id.to_string()))?;
        record.published = true;
        Ok(())
    }
}
