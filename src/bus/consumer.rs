//! At-least-once, idempotency-gated consumer with bounded retry and DLQ
//! routing — the bus side that every stage processor is built from.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::envelope::{validate_envelope_shape, Envelope, SchemaDescriptor};
use crate::schema_registry::SchemaRegistry;
use crate::shutdown::ShutdownSignal;
use crate::store::{EventStore, GroupStart};

use super::BusError;

/// What a handler decided about one delivery. Never an exception — the bus
/// dispatches purely on this value.
#[derive(Debug, Clone)]
pub enum HandlerOutcome {
    Ok,
    Retryable(String),
    Fatal(String),
}

/// A stage's business logic. Implementations are injected, never looked up
/// through a global registry.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome;
}

/// Whether attempts exhausted under `RetryableError`/`FatalError` are routed
/// to `dlq.<stream>` or simply dropped after being ACKed. `Disabled` exists
/// for harnesses that want to observe raw handler failures without DLQ
/// traffic; production consumers use `Enabled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DlqPolicy {
    Enabled,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub group: String,
    pub stream: String,
    pub consumer_name: String,
    pub max_attempts: u32,
    pub visibility_timeout: Duration,
    pub dlq_policy: DlqPolicy,
    pub concurrency: usize,
    pub block: Duration,
    pub batch_size: usize,
    pub backoff_base: Duration,
    pub backoff_factor: u32,
    pub backoff_cap: Duration,
}

impl ConsumerConfig {
    /// Defaults taken straight from the configuration table: `max_attempts`
    /// 5, backoff base 1s / factor 2 / cap 60s.
    pub fn new(group: impl Into<String>, stream: impl Into<String>, consumer_name: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            stream: stream.into(),
            consumer_name: consumer_name.into(),
            max_attempts: 5,
            visibility_timeout: Duration::from_secs(30),
            dlq_policy: DlqPolicy::Enabled,
            concurrency: 1,
            block: Duration::from_secs(5),
            batch_size: 10,
            backoff_base: Duration::from_secs(1),
            backoff_factor: 2,
            backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Drives one consumer group against one stream. Constructed with an
/// explicitly injected store, registry, idempotency cache, and handler — no
/// process-wide default of any of them.
pub struct Consumer {
    config: ConsumerConfig,
    store: Arc<dyn EventStore>,
    registry: Arc<SchemaRegistry>,
    idempotency: Arc<dyn super::IdempotencyCache>,
    handler: Arc<dyn Handler>,
    attempts: DashMap<String, u32>,
}

impl Consumer {
    pub fn new(
        config: ConsumerConfig,
        store: Arc<dyn EventStore>,
        registry: Arc<SchemaRegistry>,
        idempotency: Arc<dyn super::IdempotencyCache>,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            idempotency,
            handler,
            attempts: DashMap::new(),
        }
    }

    pub async fn ensure_group(&self, start: GroupStart) -> Result<(), BusError> {
        self.store
            .create_group(&self.config.stream, &self.config.group, start)
            .await?;
        Ok(())
    }

    /// Spawns `config.concurrency` worker tasks and returns their join
    /// handles. Every worker stops taking new `group_read` calls once
    /// `shutdown` is requested; in-flight handlers are allowed to finish.
    pub fn spawn(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency.max(1))
            .map(|worker_id| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.worker_loop(worker_id, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, worker_id: usize, shutdown: Arc<ShutdownSignal>) {
        let mut backoff = self.config.backoff_base;
        loop {
            if shutdown.is_shutdown_requested() {
                debug!(group = %self.config.group, stream = %self.config.stream, worker_id, "worker stopping");
                return;
            }

            let fresh = match self
                .store
                .group_read(
                    &self.config.stream,
                    &self.config.group,
                    &format!("{}-{worker_id}", self.config.consumer_name),
                    self.config.batch_size,
                    self.config.block,
                )
                .await
            {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, "group_read failed, backing off");
                    tokio::time::sleep(self.config.backoff_base).await;
                    continue;
                }
            };

            if fresh.is_empty() {
                tokio::time::sleep(backoff).await;
                let stale = self
                    .store
                    .claim_stale(&self.config.stream, &self.config.group, self.config.visibility_timeout)
                    .await
                    .unwrap_or_default();
                if stale.is_empty() {
                    backoff = (backoff * self.config.backoff_factor).min(self.config.backoff_cap);
                } else {
                    backoff = self.config.backoff_base;
                    for (offset, bytes) in stale {
                        self.process_one(offset.0, bytes).await;
                    }
                }
                continue;
            }

            backoff = self.config.backoff_base;
            for (offset, bytes) in fresh {
                self.process_one(offset.0, bytes).await;
            }
        }
    }

    async fn process_one(&self, offset: u64, bytes: Vec<u8>) {
        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                self.route_invalid_to_dlq(offset, None, "unknown", "JsonParseError", &e.to_string()).await;
                return;
            }
        };
        if let Err(kind) = validate_envelope_shape(&value) {
            let trace_id = value.get("trace_id").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
            self.route_invalid_to_dlq(offset, Some(&value), &trace_id, kind.kind_name(), &kind.to_string()).await;
            return;
        }
        let envelope: Envelope = serde_json::from_value(value).expect("shape-valid implies typed-decodable");

        if let Some(_digest) = self.idempotency.check(&self.config.group, &envelope.event_id).await {
            let _ = self.store.ack(&self.config.stream, &self.config.group, crate::store::Offset(offset)).await;
            return;
        }

        // `check` alone only guards sequential redelivery: two overlapping
        // workers (this pool's own concurrency, or a `claim_stale` steal
        // racing a still-running original) could both observe a miss. The
        // claim is the atomic compare-and-set that makes "at most one
        // handler invocation per event_id" hold under concurrency too.
        if !self.idempotency.try_claim(&self.config.group, &envelope.event_id).await {
            debug!(event_id = %envelope.event_id, "lost the idempotency claim race, leaving pending for the other delivery to finish");
            return;
        }

        let attempt = {
            let mut entry = self.attempts.entry(envelope.event_id.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        let outcome = self.handler.handle(&envelope).await;
        match outcome {
            HandlerOutcome::Ok => {
                let _ = self.store.ack(&self.config.stream, &self.config.group, crate::store::Offset(offset)).await;
                if let Err(e) = self.idempotency.record(&self.config.group, &envelope.event_id, "ok").await {
                    error!(error = %e, "idempotency record conflict after successful handling");
                }
                self.attempts.remove(&envelope.event_id);
            }
            HandlerOutcome::Retryable(reason) if attempt < self.config.max_attempts => {
                debug!(event_id = %envelope.event_id, attempt, reason, "retryable, leaving pending for redelivery");
                self.idempotency.release_claim(&self.config.group, &envelope.event_id).await;
            }
            HandlerOutcome::Retryable(reason) => {
                self.route_to_dlq(offset, &envelope, "HandlerRetryable", &reason, attempt).await;
            }
            HandlerOutcome::Fatal(reason) => {
                self.route_to_dlq(offset, &envelope, "HandlerFatal", &reason, attempt).await;
            }
        }
    }

    async fn route_to_dlq(&self, offset: u64, envelope: &Envelope, error_kind: &str, error_detail: &str, attempts: u32) {
        if self.config.dlq_policy == DlqPolicy::Enabled {
            let dlq_envelope = build_dlq_envelope(envelope, &self.config.stream, offset, error_kind, error_detail, attempts);
            let dlq_stream = SchemaDescriptor::dlq_name(&self.config.stream);
            if let Err(e) = self.registry.validate(&dlq_envelope.to_value()) {
                error!(error = %e, "DLQ envelope failed its own shape validation, dropping");
            } else if let Err(e) = self.store.append(&dlq_stream, dlq_envelope.encode()).await {
                error!(error = %e, stream = %dlq_stream, "failed to append to DLQ stream, leaving original pending");
                return;
            } else {
                info!(event_id = %envelope.event_id, error_kind, dlq_stream = %dlq_stream, "routed to DLQ");
            }
        }
        let _ = self.store.ack(&self.config.stream, &self.config.group, crate::store::Offset(offset)).await;
        if let Err(e) = self
            .idempotency
            .record(&self.config.group, &envelope.event_id, &format!("dlq:{error_kind}"))
            .await
        {
            error!(error = %e, "idempotency record conflict after DLQ routing");
        }
        self.attempts.remove(&envelope.event_id);
    }

    /// DLQs bytes that never became a valid envelope at all: unparsable
    /// JSON, or JSON missing/mistyping a required top-level field. There is
    /// no `event_id` to key idempotency on, so this bypasses that bookkeeping
    /// entirely and simply acks after the DLQ append succeeds.
    async fn route_invalid_to_dlq(&self, offset: u64, raw_value: Option<&serde_json::Value>, trace_id: &str, error_kind: &str, error_detail: &str) {
        if self.config.dlq_policy == DlqPolicy::Enabled {
            let dlq_stream = SchemaDescriptor::dlq_name(&self.config.stream);
            let payload = json!({
                "original_stream": self.config.stream,
                "original_offset": offset,
                "original_envelope": raw_value.cloned().unwrap_or(serde_json::Value::Null),
                "error_kind": error_kind,
                "error_detail": error_detail,
                "attempts": 1,
            });
            match Envelope::new(Uuid::new_v4().to_string(), trace_id, Utc::now().into(), dlq_stream.clone(), payload) {
                Ok(dlq_envelope) => {
                    if let Err(e) = self.registry.validate(&dlq_envelope.to_value()) {
                        error!(error = %e, "DLQ envelope for invalid input failed its own shape validation, dropping");
                    } else if let Err(e) = self.store.append(&dlq_stream, dlq_envelope.encode()).await {
                        error!(error = %e, stream = %dlq_stream, "failed to append invalid-input DLQ entry, leaving original pending");
                        return;
                    } else {
                        info!(error_kind, dlq_stream = %dlq_stream, "routed invalid input to DLQ");
                    }
                }
                Err(e) => error!(error = %e, "failed to construct DLQ envelope for invalid input"),
            }
        } else {
            warn!(error_kind, "invalid input and DLQ disabled, acking without a DLQ record");
        }
        let _ = self.store.ack(&self.config.stream, &self.config.group, crate::store::Offset(offset)).await;
    }
}

/// Builds the DLQ wrapper envelope per the fixed shape: new `event_id`,
/// inherited `trace_id`, `schema = "dlq.<orig_schema>"`.
fn build_dlq_envelope(
    original: &Envelope,
    original_stream: &str,
    original_offset: u64,
    error_kind: &str,
    error_detail: &str,
    attempts: u32,
) -> Envelope {
    let schema = SchemaDescriptor::dlq_name(&original.schema);
    let payload = json!({
        "original_stream": original_stream,
        "original_offset": original_offset,
        "original_envelope": original.to_value(),
        "error_kind": error_kind,
        "error_detail": error_detail,
        "attempts": attempts,
    });
    Envelope::new(Uuid::new_v4().to_string(), original.trace_id.clone(), Utc::now().into(), schema, payload)
        .expect("dlq schema is always well-formed by construction")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::idempotency::MemoryIdempotencyCache;
    use crate::store::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingHandler {
        calls: AtomicUsize,
        outcomes: Mutex<Vec<HandlerOutcome>>,
    }

    impl CountingHandler {
        fn always_ok() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(vec![]),
            })
        }

        fn scripted(outcomes: Vec<HandlerOutcome>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcomes: Mutex::new(outcomes),
            })
        }
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _envelope: &Envelope) -> HandlerOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                HandlerOutcome::Ok
            } else {
                outcomes.remove(0)
            }
        }
    }

    fn envelope(event_id: &str) -> Envelope {
        Envelope::new(
            event_id,
            "T1",
            Utc::now().into(),
            "risk.order.approved.v1",
            json!({"a": 1}),
        )
        .unwrap()
    }

    async fn consumer_over(store: Arc<MemoryStore>, handler: Arc<dyn Handler>) -> Consumer {
        let mut config = ConsumerConfig::new("g", "risk.order.approved.v1", "c1");
        config.block = Duration::from_millis(0);
        let consumer = Consumer::new(
            config,
            store,
            Arc::new(SchemaRegistry::new()),
            Arc::new(MemoryIdempotencyCache::with_default_ttl()),
            handler,
        );
        consumer.ensure_group(GroupStart::Beginning).await.unwrap();
        consumer
    }

    #[tokio::test]
    async fn duplicate_delivery_invokes_handler_once() {
        let store = Arc::new(MemoryStore::new());
        store.append("risk.order.approved.v1", envelope("E1").encode()).await.unwrap();
        let handler = CountingHandler::always_ok();
        let consumer = consumer_over(store.clone(), handler.clone()).await;

        let batch = store
            .group_read("risk.order.approved.v1", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;
        // Redeliver the same offset as if claim_stale handed it back again.
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fatal_outcome_routes_to_dlq_and_acks() {
        let store = Arc::new(MemoryStore::new());
        store.append("risk.order.approved.v1", envelope("E1").encode()).await.unwrap();
        let handler = CountingHandler::scripted(vec![HandlerOutcome::Fatal("bad payload".to_string())]);
        let consumer = consumer_over(store.clone(), handler).await;

        let batch = store
            .group_read("risk.order.approved.v1", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;

        let dlq = store.read_range("dlq.risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        let dlq_envelope = Envelope::decode(&dlq[0].1).unwrap();
        assert_eq!(dlq_envelope.schema, "dlq.risk.order.approved.v1");
        assert_eq!(dlq_envelope.trace_id, "T1");
        assert_eq!(dlq_envelope.payload["error_kind"], json!("HandlerFatal"));

        let reclaimed = store.claim_stale("risk.order.approved.v1", "g", Duration::from_millis(0)).await.unwrap();
        assert!(reclaimed.is_empty(), "the original must be acked, not left pending");
    }

    #[tokio::test]
    async fn envelope_missing_required_field_is_dlqd_with_missing_field_kind() {
        let store = Arc::new(MemoryStore::new());
        let mut bad = serde_json::to_value(envelope("E1")).unwrap();
        bad.as_object_mut().unwrap().remove("trace_id");
        store.append("risk.order.approved.v1", serde_json::to_vec(&bad).unwrap()).await.unwrap();
        let handler = CountingHandler::always_ok();
        let consumer = consumer_over(store.clone(), handler.clone()).await;

        let batch = store
            .group_read("risk.order.approved.v1", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0, "a shape-invalid envelope never reaches the handler");
        let dlq = store.read_range("dlq.risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
        let dlq_envelope = Envelope::decode(&dlq[0].1).unwrap();
        assert_eq!(dlq_envelope.payload["error_kind"], json!("MissingField"));
        assert!(dlq_envelope.payload["error_detail"].as_str().unwrap().contains("trace_id"));

        let reclaimed = store.claim_stale("risk.order.approved.v1", "g", Duration::from_millis(0)).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn retryable_under_max_attempts_leaves_entry_pending_for_redelivery() {
        let store = Arc::new(MemoryStore::new());
        store.append("risk.order.approved.v1", envelope("E1").encode()).await.unwrap();
        let handler = CountingHandler::scripted(vec![HandlerOutcome::Retryable("transient".to_string())]);
        let consumer = consumer_over(store.clone(), handler).await;

        let batch = store
            .group_read("risk.order.approved.v1", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;

        let reclaimed = store.claim_stale("risk.order.approved.v1", "g", Duration::from_millis(0)).await.unwrap();
        assert_eq!(reclaimed.len(), 1, "retryable-under-attempts must stay pending, not be acked");
    }

    #[tokio::test]
    async fn retryable_exhausted_at_max_attempts_routes_to_dlq() {
        let store = Arc::new(MemoryStore::new());
        store.append("risk.order.approved.v1", envelope("E1").encode()).await.unwrap();
        let handler = CountingHandler::scripted(vec![HandlerOutcome::Retryable("still failing".to_string())]);
        let mut config = ConsumerConfig::new("g", "risk.order.approved.v1", "c1");
        config.max_attempts = 1;
        let consumer = Consumer::new(
            config,
            store.clone(),
            Arc::new(SchemaRegistry::new()),
            Arc::new(MemoryIdempotencyCache::with_default_ttl()),
            handler,
        );
        consumer.ensure_group(GroupStart::Beginning).await.unwrap();

        let batch = store
            .group_read("risk.order.approved.v1", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        consumer.process_one(batch[0].0.0, batch[0].1.clone()).await;

        let dlq = store.read_range("dlq.risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
    }
}
