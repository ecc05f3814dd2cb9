//! The message bus: a validating producer plus an at-least-once,
//! idempotency-gated consumer built on top of [`crate::store::EventStore`].

pub mod consumer;
pub mod idempotency;
pub mod producer;

pub use consumer::{Consumer, ConsumerConfig, DlqPolicy, Handler, HandlerOutcome};
pub use idempotency::{IdempotencyCache, IdempotencyError, MemoryIdempotencyCache};
pub use producer::Producer;

use thiserror::Error;

use crate::envelope::ValidationKind;
use crate::store::StoreError;

/// Errors that cross the bus's public boundary. Handler-level retry/DLQ
/// outcomes never appear here — they are modeled by `HandlerOutcome` and
/// resolved internally by the consumer loop, never by exception.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    #[error("contract violation: {0}")]
    ContractViolation(#[from] ValidationKind),
    #[error("stream '{0}' is not in this producer's declared set")]
    UnauthorizedStream(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),
}
