//! The submission state machine. Consumes `risk.order.approved.v1` on
//! the trade plane, drives `Intent`/`Order`/`Fill` through the states of
//! `IntentState` via `SubmissionCoordinator`, and reconciles `SUBMIT_UNKNOWN`
//! intents against the broker through `ReconciliationWorker`. Grounded on
//! the reference's fund-transfer subsystem: same persist-before-call,
//! lease-guarded, CAS-driven shape, retargeted from moving money between two
//! ledgers to moving an order between NEW and a terminal fill/cancel/reject.

pub mod broker;
pub mod coordinator;
pub mod error;
pub mod reconcile;
pub mod state;
pub mod store;
pub mod types;

pub use broker::{BrokerAdapter, CancelOutcome, SubmitOutcome};
pub use coordinator::SubmissionCoordinator;
pub use error::TradeError;
pub use reconcile::{ReconciliationWorker, WorkerConfig as ReconcileWorkerConfig};
pub use state::IntentState;
pub use store::{MemoryTradeStore, TradeStore};
pub use types::{Fill, FillNaturalKey, InboxRecord, Intent, Order};
