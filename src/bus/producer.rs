//! Validating producer: the only sanctioned path onto a declared stream.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{instrument, warn};

use crate::envelope::Envelope;
use crate::schema_registry::SchemaRegistry;
use crate::store::{EventStore, Offset};

use super::BusError;

/// Validates every envelope against the shared [`SchemaRegistry`] before
/// appending it through [`EventStore`]. A producer only ever writes to the
/// streams it declared at construction — publishing anywhere else is a
/// configuration bug caught synchronously, never a silent drop.
pub struct Producer {
    registry: Arc<SchemaRegistry>,
    store: Arc<dyn EventStore>,
    declared_streams: HashSet<String>,
}

impl Producer {
    pub fn new(registry: Arc<SchemaRegistry>, store: Arc<dyn EventStore>, declared_streams: HashSet<String>) -> Self {
        Self {
            registry,
            store,
            declared_streams,
        }
    }

    fn check_declared(&self, stream: &str) -> Result<(), BusError> {
        if self.declared_streams.contains(stream) {
            Ok(())
        } else {
            Err(BusError::UnauthorizedStream(stream.to_string()))
        }
    }

    /// Validates via the registry; on success, appends the encoded envelope.
    /// An invalid envelope never reaches the store — `ContractViolation`
    /// surfaces synchronously to the caller instead.
    #[instrument(skip(self, envelope), fields(stream, event_id = %envelope.event_id))]
    pub async fn publish(&self, stream: &str, envelope: &Envelope) -> Result<Offset, BusError> {
        self.check_declared(stream)?;
        self.registry.validate(&envelope.to_value())?;
        let offset = self.store.append(stream, envelope.encode()).await?;
        Ok(offset)
    }

    /// Publishes each envelope independently. All-or-nothing is *not*
    /// promised for the batch: a failure partway through leaves prior
    /// appends in place. Each outcome is reported individually so a caller
    /// can retry only the failures.
    pub async fn publish_batch(&self, stream: &str, envelopes: &[Envelope]) -> Vec<Result<Offset, BusError>> {
        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            let result = self.publish(stream, envelope).await;
            if let Err(ref e) = result {
                warn!(stream, event_id = %envelope.event_id, error = %e, "publish_batch: one envelope failed");
            }
            results.push(result);
        }
        results
    }
}
