//! Reconciliation worker: the reference's `RecoveryWorker` retargeted from
//! scanning stuck transfers to scanning `SUBMIT_UNKNOWN` intents against the
//! broker's own view of the world.
//!
//! Two passes per scan:
//! - match every `SUBMIT_UNKNOWN` intent against `query_open_orders`, by
//!   `request_hash` first and the intent-id remark as fallback;
//! - backfill fills for `SUBMITTED`/`PARTIALLY_FILLED` intents whose order
//!   the broker reports further progress on than the store has recorded.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::broker::BrokerAdapter;
use super::coordinator::SubmissionCoordinator;
use super::error::TradeError;
use super::state::IntentState;
use super::store::TradeStore;
use super::types::FillNaturalKey;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub scan_interval: Duration,
    pub batch_size: usize,
    /// Minimum gap between two `trade.order.reconcile_ambiguous.v1` emits
    /// for the same intent, so a worker stuck ambiguous for hours pages
    /// once, not once per scan.
    pub ambiguous_alert_cooldown: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scan_interval: Duration::from_secs(30),
            batch_size: 100,
            ambiguous_alert_cooldown: Duration::from_secs(300),
        }
    }
}

/// Periodically reconciles `SUBMIT_UNKNOWN` intents and backfills missing
/// fills against the broker's reported state.
pub struct ReconciliationWorker {
    coordinator: Arc<SubmissionCoordinator>,
    store: Arc<dyn TradeStore>,
    broker: Arc<dyn BrokerAdapter>,
    config: WorkerConfig,
    last_ambiguous_alert: DashMap<String, Instant>,
}

impl ReconciliationWorker {
    pub fn new(coordinator: Arc<SubmissionCoordinator>, store: Arc<dyn TradeStore>, broker: Arc<dyn BrokerAdapter>, config: WorkerConfig) -> Self {
        Self {
            coordinator,
            store,
            broker,
            config,
            last_ambiguous_alert: DashMap::new(),
        }
    }

    pub fn with_defaults(coordinator: Arc<SubmissionCoordinator>, store: Arc<dyn TradeStore>, broker: Arc<dyn BrokerAdapter>) -> Self {
        Self::new(coordinator, store, broker, WorkerConfig::default())
    }

    /// Runs scans on `scan_interval` until `shutdown` is requested, checked
    /// both before each scan and after each sleep so a signal raised while
    /// sleeping is not missed for a full extra interval.
    pub async fn run(&self, shutdown: Arc<ShutdownSignal>) {
        info!(scan_interval_secs = self.config.scan_interval.as_secs(), "starting reconciliation worker");
        while !shutdown.is_shutdown_requested() {
            if let Err(e) = self.scan_once().await {
                error!(error = %e, "reconciliation scan failed");
            }
            tokio::time::sleep(self.config.scan_interval).await;
        }
        info!("reconciliation worker stopped");
    }

    /// Runs one reconcile pass plus one fill-backfill pass. Returns the
    /// number of intents whose state advanced.
    pub async fn scan_once(&self) -> Result<usize, TradeError> {
        let advanced = self.reconcile_submit_unknown().await?;
        self.backfill_fills().await?;
        match self.coordinator.drain_pending_outbox(self.config.batch_size).await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "drained pending outbox entries"),
            Err(e) => error!(error = %e, "outbox drain failed"),
        }
        Ok(advanced)
    }

    async fn reconcile_submit_unknown(&self) -> Result<usize, TradeError> {
        let stuck = self.store.intents_in_state(IntentState::SubmitUnknown).await;
        if stuck.is_empty() {
            debug!("no SUBMIT_UNKNOWN intents to reconcile");
            return Ok(0);
        }
        info!(count = stuck.len(), "reconciling SUBMIT_UNKNOWN intents");

        let open_orders = self.broker.query_open_orders().await;
        let mut advanced = 0;

        for intent in stuck.iter().take(self.config.batch_size) {
            let order = self.store.get_order_by_intent(&intent.intent_id).await;
            let Some(order) = order else { continue };

            let matches: Vec<_> = open_orders
                .iter()
                .filter(|o| {
                    o.request_hash.as_deref() == Some(order.request_hash.as_str())
                        || o.intent_id_remark.as_deref() == Some(intent.intent_id.as_str())
                })
                .collect();

            match matches.as_slice() {
                [] => {
                    // Confident absence requires the broker to have reported
                    // its full open-order snapshot; an empty overall
                    // snapshot is itself ambiguous (could mean "none of
                    // ours", could mean "query failed upstream").
                    if open_orders.is_empty() {
                        self.raise_ambiguous(&intent.intent_id).await?;
                        continue;
                    }
                    self.coordinator.reconcile_confirmed_absent(&intent.intent_id).await?;
                    advanced += 1;
                }
                [found] => {
                    self.coordinator
                        .reconcile_found(&intent.intent_id, &found.broker_order_id, found.cum_qty, found.target_qty)
                        .await?;
                    advanced += 1;
                }
                _ => {
                    warn!(intent_id = %intent.intent_id, matches = matches.len(), "reconciliation matched more than one broker order");
                    self.raise_ambiguous(&intent.intent_id).await?;
                }
            }
        }

        Ok(advanced)
    }

    async fn raise_ambiguous(&self, intent_id: &str) -> Result<(), TradeError> {
        let now = Instant::now();
        if let Some(last) = self.last_ambiguous_alert.get(intent_id) {
            if now.duration_since(*last) < self.config.ambiguous_alert_cooldown {
                return Ok(());
            }
        }
        self.last_ambiguous_alert.insert(intent_id.to_string(), now);
        self.coordinator.mark_reconcile_ambiguous(intent_id).await
    }

    /// For intents the store already believes are `SUBMITTED` or
    /// `PARTIALLY_FILLED`, replay any broker fill the store hasn't recorded
    /// yet. Fill dedup inside `record_fill` makes this pass idempotent.
    async fn backfill_fills(&self) -> Result<(), TradeError> {
        let submitted = self.store.intents_in_state(IntentState::Submitted).await;
        let partially_filled = self.store.intents_in_state(IntentState::PartiallyFilled).await;
        let candidates: Vec<_> = submitted.into_iter().chain(partially_filled).collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let fills = self.broker.query_fills_today().await;
        for intent in candidates.iter().take(self.config.batch_size) {
            let Some(order) = self.store.get_order_by_intent(&intent.intent_id).await else { continue };
            let Some(broker_order_id) = order.broker_order_id.clone() else { continue };

            for fill in fills.iter().filter(|f| f.broker_order_id == broker_order_id) {
                let natural_key = match &fill.broker_fill_id {
                    Some(id) => FillNaturalKey::from_broker_fill_id(id.clone()),
                    None => FillNaturalKey::fallback(&fill.broker_order_id, fill.ts, fill.price, fill.qty),
                };
                self.coordinator
                    .record_fill(&intent.intent_id, natural_key, fill.qty, fill.price, fill.ts)
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Producer;
    use crate::schema_registry::SchemaRegistry;
    use crate::store::memory::MemoryStore;
    use crate::trade::broker::mock::MockBrokerAdapter;
    use crate::trade::broker::{BrokerOpenOrder, SubmitOutcome};
    use crate::trade::store::MemoryTradeStore;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::HashSet;

    fn streams() -> HashSet<String> {
        [
            "trade.intent.approved.v1",
            "trade.intent.rejected.v1",
            "trade.order.submit_started.v1",
            "trade.order.submitted.v1",
            "trade.order.rejected.v1",
            "trade.order.submit_unknown.v1",
            "trade.order.reconciled.v1",
            "trade.order.submit_retry.v1",
            "trade.fill.recorded.v1",
            "trade.order.filled.v1",
            "trade.order.cancel_requested.v1",
            "trade.order.cancelled.v1",
            "trade.order.reconcile_ambiguous.v1",
            "execution.order.executed.v1",
            "execution.order.failed.v1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    #[tokio::test]
    async fn reconciler_advances_submit_unknown_when_broker_has_a_match() {
        let broker = Arc::new(MockBrokerAdapter::new());
        broker.script_submit(vec![SubmitOutcome::Unknown]);
        let trade_store = Arc::new(MemoryTradeStore::new());
        let producer = Producer::new(Arc::new(SchemaRegistry::new()), Arc::new(MemoryStore::new()), streams());
        let coordinator = Arc::new(SubmissionCoordinator::new(trade_store.clone(), broker.clone(), producer));

        let approval = crate::envelope::Envelope::new(
            "E1",
            "T1",
            Utc::now().into(),
            "risk.order.approved.v1",
            json!({"intent_id": "I1", "approved": true, "qty": 100.0}),
        )
        .unwrap();
        coordinator.on_approval(&approval).await.unwrap();
        coordinator.submit("I1", "worker-a").await.unwrap();
        assert_eq!(trade_store.get_intent("I1").await.unwrap().state, IntentState::SubmitUnknown);

        broker.set_open_orders(vec![BrokerOpenOrder {
            broker_order_id: "BRK-ORD-I1".to_string(),
            request_hash: Some("I1".to_string()),
            intent_id_remark: Some("I1".to_string()),
            cum_qty: 100.0,
            target_qty: 100.0,
        }]);

        let reconciler = ReconciliationWorker::with_defaults(coordinator, trade_store.clone(), broker);
        let advanced = reconciler.scan_once().await.unwrap();
        assert_eq!(advanced, 1);
        assert_eq!(trade_store.get_intent("I1").await.unwrap().state, IntentState::Filled);
    }

    #[tokio::test]
    async fn ambiguous_alert_respects_cooldown() {
        let broker = Arc::new(MockBrokerAdapter::new());
        broker.script_submit(vec![SubmitOutcome::Unknown]);
        let trade_store = Arc::new(MemoryTradeStore::new());
        let producer = Producer::new(Arc::new(SchemaRegistry::new()), Arc::new(MemoryStore::new()), streams());
        let coordinator = Arc::new(SubmissionCoordinator::new(trade_store.clone(), broker.clone(), producer));

        let approval = crate::envelope::Envelope::new(
            "E1",
            "T1",
            Utc::now().into(),
            "risk.order.approved.v1",
            json!({"intent_id": "I1", "approved": true, "qty": 100.0}),
        )
        .unwrap();
        coordinator.on_approval(&approval).await.unwrap();
        coordinator.submit("I1", "worker-a").await.unwrap();

        broker.set_open_orders(vec![
            BrokerOpenOrder {
                broker_order_id: "BRK-A".to_string(),
                request_hash: Some("I1".to_string()),
                intent_id_remark: Some("I1".to_string()),
                cum_qty: 0.0,
                target_qty: 100.0,
            },
            BrokerOpenOrder {
                broker_order_id: "BRK-B".to_string(),
                request_hash: Some("I1".to_string()),
                intent_id_remark: Some("I1".to_string()),
                cum_qty: 0.0,
                target_qty: 100.0,
            },
        ]);

        let mut config = WorkerConfig::default();
        config.ambiguous_alert_cooldown = Duration::from_secs(3600);
        let reconciler = ReconciliationWorker::new(coordinator, trade_store.clone(), broker, config);

        reconciler.scan_once().await.unwrap();
        reconciler.scan_once().await.unwrap();
        assert_eq!(reconciler.last_ambiguous_alert.len(), 1, "second scan should hit the cooldown, not reinsert");
        assert_eq!(trade_store.get_intent("I1").await.unwrap().state, IntentState::SubmitUnknown, "ambiguous intents stay put");
    }
}
