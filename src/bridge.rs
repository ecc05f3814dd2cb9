//! The one-way, whitelist-only forwarder between the compute plane and
//! the trade plane. Two distinct `EventStore` instances are physically
//! isolated from each other; this is the only code permitted to hold a
//! handle to both. Grounded on the reference's
//! `TransferCoordinator` two-adapter wiring (a source and a target side
//! joined by one compare-and-swap-guarded step), here simplified to a
//! single re-validate-then-forward hop with no intermediate state to
//! persist.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::envelope::Envelope;
use crate::schema_registry::SchemaRegistry;
use crate::shutdown::ShutdownSignal;
use crate::store::{EventStore, GroupStart, StoreError};

const BRIDGE_GROUP: &str = "trade-bridge";

#[derive(Debug, Error, Clone)]
pub enum BridgeError {
    #[error("stream '{0}' is not in the bridge's configured whitelist")]
    UnauthorizedStream(String),
    #[error("compute-plane store error: {0}")]
    ComputeStore(#[from] StoreError),
}

/// Counters surfaced to a health/metrics endpoint. Plain atomics rather than
/// a metrics-crate dependency — ambient observability stays at the
/// `tracing` layer this crate already uses; a deployment wiring Prometheus
/// reads these through its own exporter.
#[derive(Debug, Default)]
pub struct BridgeMetrics {
    pub forwarded: AtomicU64,
    pub rejected_non_whitelisted: AtomicU64,
    pub dlq_routed: AtomicU64,
}

/// Reads a whitelisted set of compute-plane streams, re-validates each
/// event, and appends it verbatim (same `event_id`) onto the identically
/// named trade-plane stream. Never holds trade-plane read access and never
/// exposes the compute-plane store to trade-plane code — the two `Arc<dyn
/// EventStore>` handles here are the only bridge between the planes.
pub struct TradeBridge {
    compute_store: Arc<dyn EventStore>,
    trade_store: Arc<dyn EventStore>,
    registry: Arc<SchemaRegistry>,
    whitelist: HashSet<String>,
    max_attempts: u32,
    block: Duration,
    pub metrics: Arc<BridgeMetrics>,
}

impl TradeBridge {
    /// Rejects any whitelist entry other than the default
    /// (`risk.order.approved.v1`) unless `allow_override` is set: any
    /// attempt to configure a non-approval stream is rejected at startup,
    /// not discovered later as a silent forwarding gap.
    pub fn new(
        compute_store: Arc<dyn EventStore>,
        trade_store: Arc<dyn EventStore>,
        registry: Arc<SchemaRegistry>,
        whitelist: Vec<String>,
        allow_override: bool,
    ) -> Result<Self, BridgeError> {
        if !allow_override {
            for stream in &whitelist {
                if stream != "risk.order.approved.v1" {
                    return Err(BridgeError::UnauthorizedStream(stream.clone()));
                }
            }
        }
        if !allow_override {
            info!(whitelist = ?whitelist, "trade bridge using default whitelist");
        } else {
            warn!(whitelist = ?whitelist, "trade bridge whitelist overridden from default");
        }
        Ok(Self {
            compute_store,
            trade_store,
            registry,
            whitelist: whitelist.into_iter().collect(),
            max_attempts: 5,
            block: Duration::from_secs(5),
            metrics: Arc::new(BridgeMetrics::default()),
        })
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    async fn ensure_groups(&self) -> Result<(), BridgeError> {
        for stream in &self.whitelist {
            self.compute_store.create_group(stream, BRIDGE_GROUP, GroupStart::Beginning).await?;
        }
        Ok(())
    }

    /// Spawns one worker task per whitelisted stream.
    pub async fn spawn(self: Arc<Self>, shutdown: Arc<ShutdownSignal>) -> Result<Vec<JoinHandle<()>>, BridgeError> {
        self.ensure_groups().await?;
        let streams: Vec<String> = self.whitelist.iter().cloned().collect();
        Ok(streams
            .into_iter()
            .map(|stream| {
                let this = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { this.forward_loop(stream, shutdown).await })
            })
            .collect())
    }

    async fn forward_loop(&self, stream: String, shutdown: Arc<ShutdownSignal>) {
        loop {
            if shutdown.is_shutdown_requested() {
                return;
            }
            let batch = match self.compute_store.group_read(&stream, BRIDGE_GROUP, "bridge-0", 10, self.block).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(error = %e, stream, "bridge group_read failed, backing off");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            for (offset, bytes) in batch {
                self.forward_one(&stream, offset.0, bytes).await;
            }
        }
    }

    async fn forward_one(&self, stream: &str, offset: u64, bytes: Vec<u8>) {
        let envelope = match Envelope::decode(&bytes) {
            Ok(e) => e,
            Err(e) => {
                self.dlq_and_ack(stream, offset, &bytes, "DecodeError", &e.to_string()).await;
                return;
            }
        };
        if let Err(e) = self.registry.validate(&envelope.to_value()) {
            self.dlq_and_ack(stream, offset, &bytes, e.kind_name(), &e.to_string()).await;
            return;
        }
        if let Err(e) = self.forward_with_retry(stream, &envelope).await {
            error!(error = %e, stream, event_id = %envelope.event_id, "trade-plane append exhausted retries, routing to DLQ");
            self.dlq_and_ack(stream, offset, &envelope.encode(), "TradePlaneAppendFailed", &e.to_string()).await;
            return;
        }
        let _ = self.compute_store.ack(stream, BRIDGE_GROUP, crate::store::Offset(offset)).await;
        self.metrics.forwarded.fetch_add(1, Ordering::Relaxed);
        info!(stream, event_id = %envelope.event_id, "forwarded to trade plane");
    }

    async fn forward_with_retry(&self, stream: &str, envelope: &Envelope) -> Result<(), StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.trade_store.append(stream, envelope.encode()).await {
                Ok(_) => return Ok(()),
                Err(e) if attempt < self.max_attempts => {
                    warn!(error = %e, attempt, stream, "trade-plane append failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn dlq_and_ack(&self, stream: &str, offset: u64, bytes: &[u8], error_kind: &str, error_detail: &str) {
        use crate::envelope::SchemaDescriptor;
        use chrono::Utc;
        use serde_json::json;
        use uuid::Uuid;

        let original_value: serde_json::Value = serde_json::from_slice(bytes).unwrap_or(serde_json::Value::Null);
        let dlq_schema = SchemaDescriptor::dlq_name(stream);
        let payload = json!({
            "original_stream": stream,
            "original_offset": offset,
            "original_envelope": original_value,
            "error_kind": error_kind,
            "error_detail": error_detail,
            "attempts": 1,
        });
        if let Ok(dlq_envelope) = Envelope::new(Uuid::new_v4().to_string(), "bridge", Utc::now().into(), dlq_schema.clone(), payload) {
            if let Err(e) = self.compute_store.append(&dlq_schema, dlq_envelope.encode()).await {
                error!(error = %e, stream = %dlq_schema, "failed to append bridge DLQ entry");
            } else {
                self.metrics.dlq_routed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let _ = self.compute_store.ack(stream, BRIDGE_GROUP, crate::store::Offset(offset)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn registry_with_approved_schema() -> SchemaRegistry {
        SchemaRegistry::new()
    }

    #[test]
    fn rejects_non_default_whitelist_without_override() {
        let compute = Arc::new(MemoryStore::new());
        let trade = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry_with_approved_schema());
        let err = TradeBridge::new(compute, trade, registry, vec!["strategy.candidate_action.generated.v1".to_string()], false).unwrap_err();
        assert!(matches!(err, BridgeError::UnauthorizedStream(_)));
    }

    #[test]
    fn accepts_default_whitelist() {
        let compute = Arc::new(MemoryStore::new());
        let trade = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry_with_approved_schema());
        assert!(TradeBridge::new(compute, trade, registry, vec!["risk.order.approved.v1".to_string()], false).is_ok());
    }

    #[tokio::test]
    async fn forwards_a_valid_event_onto_the_identically_named_trade_stream() {
        let compute = Arc::new(MemoryStore::new());
        let trade = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry_with_approved_schema());
        let bridge = TradeBridge::new(compute.clone(), trade.clone(), registry, vec!["risk.order.approved.v1".to_string()], false).unwrap();
        bridge.ensure_groups().await.unwrap();

        let envelope = Envelope::new("E1", "T1", Utc::now().into(), "risk.order.approved.v1", json!({"intent_id": "I1", "approved": true})).unwrap();
        compute.append("risk.order.approved.v1", envelope.encode()).await.unwrap();

        let batch = compute.group_read("risk.order.approved.v1", BRIDGE_GROUP, "bridge-0", 10, Duration::from_millis(0)).await.unwrap();
        bridge.forward_one("risk.order.approved.v1", batch[0].0.0, batch[0].1.clone()).await;

        let forwarded = trade.read_range("risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert_eq!(forwarded.len(), 1);
        assert_eq!(bridge.metrics.forwarded.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn corrupt_envelope_is_dlqd_on_compute_plane_and_never_forwarded() {
        let compute = Arc::new(MemoryStore::new());
        let trade = Arc::new(MemoryStore::new());
        let registry = Arc::new(registry_with_approved_schema());
        let bridge = TradeBridge::new(compute.clone(), trade.clone(), registry, vec!["risk.order.approved.v1".to_string()], false).unwrap();
        bridge.ensure_groups().await.unwrap();

        compute.append("risk.order.approved.v1", b"{not json".to_vec()).await.unwrap();
        let batch = compute.group_read("risk.order.approved.v1", BRIDGE_GROUP, "bridge-0", 10, Duration::from_millis(0)).await.unwrap();
        bridge.forward_one("risk.order.approved.v1", batch[0].0.0, batch[0].1.clone()).await;

        let forwarded = trade.read_range("risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert!(forwarded.is_empty());
        let dlq = compute.read_range("dlq.risk.order.approved.v1", crate::store::Offset::ZERO, 10).await.unwrap();
        assert_eq!(dlq.len(), 1);
    }
}
