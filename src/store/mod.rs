//! Stream log abstraction — a narrow port over a log-structured store with
//! consumer-group semantics. This hides the concrete backing store from
//! everything above it; `memory` is the only implementation this crate
//! ships, matching "the abstraction hides the concrete backing store."

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryStore;

/// Opaque, per-stream orderable position. Only comparisons and ordering are
/// guaranteed across implementations — never arithmetic on the raw value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(pub u64);

impl Offset {
    pub const ZERO: Offset = Offset(0);
}

/// Where a newly created consumer group should start reading from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    Beginning,
    End,
    Specific(Offset),
}

#[derive(Debug, Error, Clone)]
pub enum StoreError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),
    #[error("consumer group '{group}' not found on stream '{stream}'")]
    GroupNotFound { stream: String, group: String },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// The only primitives a stage processor, the bus, or the bridge may use to
/// talk to a stream log. No other operation is required.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durable single-entry append; returns the assigned offset.
    async fn append(&self, stream: &str, bytes: Vec<u8>) -> Result<Offset, StoreError>;

    /// Replay read; does not touch consumer-group state.
    async fn read_range(
        &self,
        stream: &str,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError>;

    /// Idempotent. `start` only matters the first time a group is created.
    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> Result<(), StoreError>;

    /// Reads new entries (never previously delivered to this group) and
    /// marks them pending for `consumer`. Blocks up to `block` if nothing is
    /// available yet; `Duration::ZERO` means "return immediately."
    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError>;

    /// Removes an offset from the group's pending list.
    async fn ack(&self, stream: &str, group: &str, offset: Offset) -> Result<(), StoreError>;

    /// Steals entries whose owning consumer's pending entry has been idle
    /// beyond `min_idle`, reassigning them to the caller.
    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError>;
}
