//! The stage-processor skeleton every pipeline stage reuses. Declares
//! input streams, output streams, a handler, and a retry policy; builds the
//! consumer binding and enforces output-stream whitelisting so a
//! handler's `emit` can never reach a stream the processor wasn't
//! configured to own. Grounded on the reference's dependency-injection
//! style in `transfer/coordinator.rs` (constructed with its adapters and
//! store rather than looking them up) generalized to the bus's
//! `Consumer`/`Producer` pair.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::instrument;

use crate::bus::{Consumer, ConsumerConfig, HandlerOutcome, IdempotencyCache, Producer};
use crate::envelope::Envelope;
use crate::schema_registry::SchemaRegistry;
use crate::shutdown::ShutdownSignal;
use crate::store::{EventStore, GroupStart, Offset, StoreError};

/// The minimal surface a stage's business logic needs: the inbound event,
/// its `trace_id` (propagated, never regenerated), and a way to emit to any
/// of the processor's declared output streams.
pub struct ProcessorContext<'a> {
    pub event: &'a Envelope,
    pub trace_id: &'a str,
    producer: &'a Producer,
}

impl<'a> ProcessorContext<'a> {
    /// Emits onto `stream`. Rejected at the `Producer` layer (not here) if
    /// `stream` was never declared as one of this processor's outputs.
    pub async fn emit(&self, stream: &str, envelope: &Envelope) -> Result<Offset, crate::bus::BusError> {
        self.producer.publish(stream, envelope).await
    }
}

/// A stage's business logic, expressed against [`ProcessorContext`] rather
/// than the raw envelope — every handler this crate ships implements this,
/// not [`crate::bus::Handler`] directly.
#[async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, ctx: ProcessorContext<'_>) -> HandlerOutcome;
}

struct Bridged {
    handler: Arc<dyn StageHandler>,
    producer: Producer,
}

#[async_trait]
impl crate::bus::Handler for Bridged {
    async fn handle(&self, envelope: &Envelope) -> HandlerOutcome {
        let ctx = ProcessorContext {
            event: envelope,
            trace_id: &envelope.trace_id,
            producer: &self.producer,
        };
        self.handler.handle(ctx).await
    }
}

/// Generic host for one pipeline stage: one input stream, one consumer
/// group, a fixed set of output streams, and a [`StageHandler`]. A worker
/// pool of fixed width per stream, handlers run synchronously to
/// completion, the only routinely blocking call is `group_read`.
pub struct StageProcessor {
    consumer: Arc<Consumer>,
    output_streams: HashSet<String>,
}

impl StageProcessor {
    pub fn new(
        config: ConsumerConfig,
        input_store: Arc<dyn EventStore>,
        output_store: Arc<dyn EventStore>,
        registry: Arc<SchemaRegistry>,
        idempotency: Arc<dyn IdempotencyCache>,
        output_streams: HashSet<String>,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        let producer = Producer::new(registry.clone(), output_store, output_streams.clone());
        let bridged: Arc<dyn crate::bus::Handler> = Arc::new(Bridged { handler, producer });
        let consumer = Arc::new(Consumer::new(config, input_store, registry, idempotency, bridged));
        Self { consumer, output_streams }
    }

    pub fn output_streams(&self) -> &HashSet<String> {
        &self.output_streams
    }

    #[instrument(skip(self))]
    pub async fn ensure_group(&self, start: GroupStart) -> Result<(), StoreError> {
        self.consumer.ensure_group(start).await.map_err(|e| match e {
            crate::bus::BusError::StoreUnavailable(inner) => inner,
            other => StoreError::Unavailable(other.to_string()),
        })
    }

    /// Spawns the worker pool and runs until `shutdown` is requested.
    pub fn spawn(&self, shutdown: Arc<ShutdownSignal>) -> Vec<tokio::task::JoinHandle<()>> {
        self.consumer.clone().spawn(shutdown)
    }
}
