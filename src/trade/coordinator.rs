//! The submission state machine's single entry point: `step`-style methods
//! that load current state, attempt one transition, persist it, and emit
//! the matching lifecycle event — the reference's `TransferCoordinator`
//! generalized from a two-party transfer to order submission.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::bus::Producer;
use crate::envelope::Envelope;

use super::broker::{BrokerAdapter, SubmitOutcome};
use super::error::TradeError;
use super::state::IntentState;
use super::store::{FillOutcome, InboxOutcome, TradeStore};
use super::types::{Fill, FillNaturalKey, Order, OutboxRecord};

/// Lease time-to-live for a worker's exclusive hold on one intent while it
/// drives a transition. Re-acquirable by the same owner, never by another
/// while unexpired — a single-writer lease per intent.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_millis(10_000);

pub struct SubmissionCoordinator {
    store: Arc<dyn TradeStore>,
    broker: Arc<dyn BrokerAdapter>,
    producer: Producer,
    lease_ttl: Duration,
}

impl SubmissionCoordinator {
    pub fn new(store: Arc<dyn TradeStore>, broker: Arc<dyn BrokerAdapter>, producer: Producer) -> Self {
        Self {
            store,
            broker,
            producer,
            lease_ttl: DEFAULT_LEASE_TTL,
        }
    }

    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = ttl;
        self
    }

    /// Records the event in the outbox before attempting to publish it, so a
    /// publish failure leaves a durable pending entry rather than silently
    /// dropping the outcome of the transition that just landed.
    async fn emit(&self, stream: &str, trace_id: &str, payload: Value) -> Result<(), TradeError> {
        let envelope = Envelope::new(Uuid::new_v4().to_string(), trace_id, Utc::now().into(), stream, payload)
            .map_err(|e| TradeError::Bus(crate::bus::BusError::ContractViolation(e)))?;
        let outbox_id = envelope.event_id.clone();
        self.store
            .append_outbox(OutboxRecord {
                outbox_id: outbox_id.clone(),
                stream: stream.to_string(),
                envelope_bytes: envelope.encode(),
                published: false,
            })
            .await?;
        self.producer.publish(stream, &envelope).await?;
        self.store.mark_outbox_published(&outbox_id).await?;
        Ok(())
    }

    /// Re-publishes any outbox entry left pending by a prior `emit` whose
    /// publish step failed, decoding each entry's stored envelope rather
    /// than reconstructing it. Intended to be driven periodically by the
    /// same worker that runs reconciliation.
    pub async fn drain_pending_outbox(&self, limit: usize) -> Result<usize, TradeError> {
        let mut drained = 0;
        for record in self.store.pending_outbox(limit).await {
            let envelope = Envelope::decode(&record.envelope_bytes).map_err(|e| TradeError::Bus(crate::bus::BusError::ContractViolation(e)))?;
            self.producer.publish(&record.stream, &envelope).await?;
            self.store.mark_outbox_published(&record.outbox_id).await?;
            drained += 1;
        }
        Ok(drained)
    }

    /// `risk.order.approved.v1` -> `RISK_APPROVED` or `REJECTED`, inbox-gated
    /// so a redelivered approval never re-enters the machine.
    pub async fn on_approval(&self, envelope: &Envelope) -> Result<IntentState, TradeError> {
        let intent_id = envelope.payload["intent_id"]
            .as_str()
            .ok_or_else(|| TradeError::IntentNotFound("<missing intent_id in payload>".to_string()))?;
        let approved = envelope.payload["approved"].as_bool().unwrap_or(false);
        let reasons: Vec<String> = envelope.payload["rejection_reasons"]
            .as_array()
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();
        let digest = envelope.event_id.clone();

        let outcome = self
            .store
            .record_approval(intent_id, &envelope.trace_id, approved, reasons.clone(), envelope.payload.clone(), &digest)
            .await?;

        match outcome {
            InboxOutcome::AlreadySeen(inbox) => Ok(inbox.status),
            InboxOutcome::FirstTime(intent) => {
                if approved {
                    self.emit(
                        "trade.intent.approved.v1",
                        &envelope.trace_id,
                        json!({"intent_id": intent_id}),
                    )
                    .await?;
                } else {
                    self.emit(
                        "trade.intent.rejected.v1",
                        &envelope.trace_id,
                        json!({"intent_id": intent_id, "reasons": reasons}),
                    )
                    .await?;
                    self.emit(
                        "execution.order.failed.v1",
                        &envelope.trace_id,
                        json!({"intent_id": intent_id, "reasons": reasons}),
                    )
                    .await?;
                }
                Ok(intent.state)
            }
        }
    }

    /// `RISK_APPROVED` -> `SUBMITTING` -> (`SUBMITTED` | `REJECTED` |
    /// `SUBMIT_UNKNOWN`), driven by one worker holding the intent's lease.
    pub async fn submit(&self, intent_id: &str, worker: &str) -> Result<IntentState, TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        if !self.store.acquire_lease(intent_id, worker, self.lease_ttl).await? {
            return Ok(intent.state);
        }
        if !self
            .store
            .compare_and_swap_state(intent_id, worker, IntentState::RiskApproved, IntentState::Submitting)
            .await?
        {
            return Ok(self.store.get_intent(intent_id).await.map(|i| i.state).unwrap_or(intent.state));
        }
        self.emit("trade.order.submit_started.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;

        let order_id = format!("ORD-{intent_id}");
        let target_qty = intent.approval_snapshot["payload"]["qty"]
            .as_f64()
            .or_else(|| intent.approval_snapshot["qty"].as_f64())
            .unwrap_or(0.0);
        let order = Order {
            order_id: order_id.clone(),
            intent_id: intent_id.to_string(),
            broker_order_id: None,
            request_hash: intent_id.to_string(),
            state: IntentState::Submitting,
            cum_qty: 0.0,
            target_qty,
        };
        self.store.create_order(order.clone()).await?;

        match self.broker.submit(&order, intent_id).await {
            SubmitOutcome::Acked { broker_order_id } => {
                self.store.set_broker_order_id(&order_id, &broker_order_id).await?;
                self.store
                    .compare_and_swap_state(intent_id, worker, IntentState::Submitting, IntentState::Submitted)
                    .await?;
                self.emit(
                    "trade.order.submitted.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id, "broker_order_id": broker_order_id}),
                )
                .await?;
                Ok(IntentState::Submitted)
            }
            SubmitOutcome::Rejected { reason } => {
                self.store
                    .compare_and_swap_state(intent_id, worker, IntentState::Submitting, IntentState::Rejected)
                    .await?;
                self.emit(
                    "trade.order.rejected.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id, "reason": reason}),
                )
                .await?;
                self.emit(
                    "execution.order.failed.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id, "reason": reason}),
                )
                .await?;
                Ok(IntentState::Rejected)
            }
            SubmitOutcome::Unknown => {
                self.store
                    .compare_and_swap_state(intent_id, worker, IntentState::Submitting, IntentState::SubmitUnknown)
                    .await?;
                self.emit(
                    "trade.order.submit_unknown.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id}),
                )
                .await?;
                Ok(IntentState::SubmitUnknown)
            }
        }
    }

    /// Applies one broker fill report. Dedups on its natural key; a genuine
    /// conflict (same key, different qty/price) halts the intent rather
    /// than silently picking a side.
    pub async fn record_fill(
        &self,
        intent_id: &str,
        natural_key: FillNaturalKey,
        qty: f64,
        price: f64,
        ts: chrono::DateTime<Utc>,
    ) -> Result<IntentState, TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        let order = self
            .store
            .get_order_by_intent(intent_id)
            .await
            .ok_or_else(|| TradeError::OrderNotFound(intent_id.to_string()))?;

        let outcome = self
            .store
            .record_fill(Fill {
                natural_key,
                order_id: order.order_id.clone(),
                qty,
                price,
                ts,
            })
            .await?;

        match outcome {
            FillOutcome::DuplicateDiscarded => Ok(intent.state),
            FillOutcome::Conflict => {
                self.emit(
                    "trade.order.reconcile_ambiguous.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id, "reason": "fill_conflict"}),
                )
                .await?;
                Err(TradeError::FillConflict { order_id: order.order_id })
            }
            FillOutcome::Inserted => {
                let updated = self
                    .store
                    .get_order_by_intent(intent_id)
                    .await
                    .ok_or_else(|| TradeError::OrderNotFound(intent_id.to_string()))?;
                let next_state = if updated.is_filled() { IntentState::Filled } else { IntentState::PartiallyFilled };
                self.store.compare_and_swap_state(intent_id, "reconciler", intent.state, next_state).await?;
                self.emit(
                    "trade.fill.recorded.v1",
                    &intent.trace_id,
                    json!({"intent_id": intent_id, "qty": qty, "price": price, "cum_qty": updated.cum_qty}),
                )
                .await?;
                if next_state == IntentState::Filled {
                    self.emit("trade.order.filled.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;
                    self.emit(
                        "execution.order.executed.v1",
                        &intent.trace_id,
                        json!({"intent_id": intent_id, "cum_qty": updated.cum_qty}),
                    )
                    .await?;
                }
                Ok(next_state)
            }
        }
    }

    /// `SUBMITTED`/`PARTIALLY_FILLED` -> `CANCEL_PENDING` -> `CANCELLED`.
    pub async fn request_cancel(&self, intent_id: &str, worker: &str) -> Result<IntentState, TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        let from = intent.state;
        if from != IntentState::Submitted && from != IntentState::PartiallyFilled {
            return Ok(from);
        }
        if !self.store.compare_and_swap_state(intent_id, worker, from, IntentState::CancelPending).await? {
            return Ok(self.store.get_intent(intent_id).await.map(|i| i.state).unwrap_or(from));
        }
        self.emit("trade.order.cancel_requested.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;

        let order = self
            .store
            .get_order_by_intent(intent_id)
            .await
            .ok_or_else(|| TradeError::OrderNotFound(intent_id.to_string()))?;
        let Some(broker_order_id) = order.broker_order_id else {
            return Ok(IntentState::CancelPending);
        };

        match self.broker.cancel(&broker_order_id).await {
            super::broker::CancelOutcome::Acked => {
                self.store
                    .compare_and_swap_state(intent_id, worker, IntentState::CancelPending, IntentState::Cancelled)
                    .await?;
                self.emit("trade.order.cancelled.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;
                Ok(IntentState::Cancelled)
            }
            super::broker::CancelOutcome::Failed(_reason) => Ok(IntentState::CancelPending),
        }
    }

    /// A `SUBMIT_UNKNOWN` intent matched a live broker order: adopt its
    /// reported fill progress directly rather than replaying every fill
    /// individually.
    pub async fn reconcile_found(&self, intent_id: &str, broker_order_id: &str, cum_qty: f64, target_qty: f64) -> Result<IntentState, TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        if intent.state != IntentState::SubmitUnknown {
            return Ok(intent.state);
        }
        if let Some(order) = self.store.get_order_by_intent(intent_id).await {
            if order.broker_order_id.is_none() {
                self.store.set_broker_order_id(&order.order_id, broker_order_id).await?;
            }
        }
        let next_state = if cum_qty >= target_qty {
            IntentState::Filled
        } else if cum_qty > 0.0 {
            IntentState::PartiallyFilled
        } else {
            IntentState::Submitted
        };
        self.store
            .compare_and_swap_state(intent_id, "reconciler", IntentState::SubmitUnknown, next_state)
            .await?;
        self.emit(
            "trade.order.reconciled.v1",
            &intent.trace_id,
            json!({"intent_id": intent_id, "broker_order_id": broker_order_id, "cum_qty": cum_qty}),
        )
        .await?;
        if next_state == IntentState::Filled {
            self.emit("trade.order.filled.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;
            self.emit(
                "execution.order.executed.v1",
                &intent.trace_id,
                json!({"intent_id": intent_id, "cum_qty": cum_qty}),
            )
            .await?;
        }
        Ok(next_state)
    }

    /// The broker confirms no such order was ever received: safe to retry
    /// the original submit.
    pub async fn reconcile_confirmed_absent(&self, intent_id: &str) -> Result<IntentState, TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        if intent.state != IntentState::SubmitUnknown {
            return Ok(intent.state);
        }
        self.store
            .compare_and_swap_state(intent_id, "reconciler", IntentState::SubmitUnknown, IntentState::RiskApproved)
            .await?;
        self.emit("trade.order.submit_retry.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;
        Ok(IntentState::RiskApproved)
    }

    /// Neither a confident match nor a confident absence: surface to a
    /// human rather than guess.
    pub async fn mark_reconcile_ambiguous(&self, intent_id: &str) -> Result<(), TradeError> {
        let intent = self.store.get_intent(intent_id).await.ok_or_else(|| TradeError::IntentNotFound(intent_id.to_string()))?;
        self.emit("trade.order.reconcile_ambiguous.v1", &intent.trace_id, json!({"intent_id": intent_id})).await?;
        Ok(())
    }
}
