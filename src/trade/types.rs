//! The execution-domain entity triple: `Intent`, `Order`, `Fill`, plus the
//! inbox/outbox rows that make reception and emission exactly reflect
//! persisted state. Entities are rows keyed by stable IDs — no in-memory
//! graph of mutually pointing records.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::state::IntentState;

/// `{intent_id, approval_snapshot, state, attempt_counter, lease_owner, lease_expires_at}`
#[derive(Debug, Clone)]
pub struct Intent {
    pub intent_id: String,
    pub trace_id: String,
    pub approval_snapshot: Value,
    pub state: IntentState,
    pub attempt_counter: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl Intent {
    pub fn new(intent_id: impl Into<String>, trace_id: impl Into<String>, approval_snapshot: Value) -> Self {
        Self {
            intent_id: intent_id.into(),
            trace_id: trace_id.into(),
            approval_snapshot,
            state: IntentState::New,
            attempt_counter: 0,
            lease_owner: None,
            lease_expires_at: None,
        }
    }

    /// A lease may be acquired if it has never been held, has expired, or is
    /// already held by `owner` (re-entrant for the same worker).
    pub fn lease_available_to(&self, owner: &str, now: DateTime<Utc>) -> bool {
        match (&self.lease_owner, self.lease_expires_at) {
            (None, _) => true,
            (Some(held_by), Some(expires_at)) => held_by == owner || expires_at < now,
            (Some(held_by), None) => held_by == owner,
        }
    }
}

/// `{order_id, intent_id, broker_order_id?, request_hash, state, cum_qty, target_qty}`
#[derive(Debug, Clone)]
pub struct Order {
    pub order_id: String,
    pub intent_id: String,
    pub broker_order_id: Option<String>,
    pub request_hash: String,
    pub state: IntentState,
    pub cum_qty: f64,
    pub target_qty: f64,
}

impl Order {
    pub fn is_filled(&self) -> bool {
        self.cum_qty >= self.target_qty
    }
}

/// Natural key for fill dedup: broker-assigned fill id when present, else
/// the `(broker_order_id, ts, px, qty)` fallback tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FillNaturalKey {
    BrokerFillId(String),
    Fallback {
        broker_order_id: String,
        ts: String,
        px_bits: u64,
        qty_bits: u64,
    },
}

impl FillNaturalKey {
    pub fn from_broker_fill_id(id: impl Into<String>) -> Self {
        Self::BrokerFillId(id.into())
    }

    pub fn fallback(broker_order_id: impl Into<String>, ts: DateTime<Utc>, price: f64, qty: f64) -> Self {
        Self::Fallback {
            broker_order_id: broker_order_id.into(),
            ts: ts.to_rfc3339(),
            px_bits: price.to_bits(),
            qty_bits: qty.to_bits(),
        }
    }
}

/// `{fill_natural_key, order_id, qty, price, ts}`
#[derive(Debug, Clone)]
pub struct Fill {
    pub natural_key: FillNaturalKey,
    pub order_id: String,
    pub qty: f64,
    pub price: f64,
    pub ts: DateTime<Utc>,
}

/// Every externally observable outcome for an `intent_id` derives from
/// exactly one `InboxRecord`.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub intent_id: String,
    pub status: IntentState,
    pub result_digest: String,
}

/// A pending outbound event awaiting reliable append to the bus. Persisted
/// in the same transaction as the state transition that produced it so a
/// crash between "decided" and "published" never loses the event.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub outbox_id: String,
    pub stream: String,
    pub envelope_bytes: Vec<u8>,
    pub published: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn lease_available_when_never_held() {
        let intent = Intent::new("I1", "T1", serde_json::json!({}));
        assert!(intent.lease_available_to("worker-a", Utc::now()));
    }

    #[test]
    fn lease_unavailable_to_others_while_unexpired() {
        let mut intent = Intent::new("I1", "T1", serde_json::json!({}));
        intent.lease_owner = Some("worker-a".to_string());
        intent.lease_expires_at = Some(Utc::now() + Duration::seconds(30));
        assert!(!intent.lease_available_to("worker-b", Utc::now()));
        assert!(intent.lease_available_to("worker-a", Utc::now()));
    }

    #[test]
    fn lease_available_once_expired() {
        let mut intent = Intent::new("I1", "T1", serde_json::json!({}));
        intent.lease_owner = Some("worker-a".to_string());
        intent.lease_expires_at = Some(Utc::now() - Duration::seconds(1));
        assert!(intent.lease_available_to("worker-b", Utc::now()));
    }

    #[test]
    fn fallback_key_distinguishes_on_price_and_qty() {
        let ts = Utc::now();
        let a = FillNaturalKey::fallback("B1", ts, 10.0, 100.0);
        let b = FillNaturalKey::fallback("B1", ts, 10.5, 100.0);
        assert_ne!(a, b);
    }
}
