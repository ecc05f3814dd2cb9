//! In-process reference implementation of [`EventStore`].
//!
//! Every other component in this crate, and every test, runs against this
//! implementation. A deployment wanting a real external log (Kafka, Redis
//! Streams, NATS JetStream) wires it in by implementing the same trait;
//! none ships here.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{EventStore, GroupStart, Offset, StoreError};

struct StreamLog {
    entries: Vec<Vec<u8>>,
}

impl StreamLog {
    fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Offsets are 1-based so `Offset::ZERO` means "before the first entry."
    fn next_offset(&self) -> Offset {
        Offset(self.entries.len() as u64 + 1)
    }

    fn get(&self, offset: Offset) -> Option<&[u8]> {
        self.entries.get((offset.0 - 1) as usize).map(Vec::as_slice)
    }
}

/// A stream's log plus its wake signal. `notify` lives outside the mutex so
/// a blocked reader can await it without holding (or re-acquiring) the log
/// lock — awaiting while holding a lock taken from a cloned `Arc` would
/// otherwise stall every other task waiting on the same shard.
struct StreamHandle {
    log: Mutex<StreamLog>,
    notify: Notify,
}

impl StreamHandle {
    fn new() -> Self {
        Self {
            log: Mutex::new(StreamLog::new()),
            notify: Notify::new(),
        }
    }
}

struct PendingEntry {
    offset: Offset,
    delivered_at: Instant,
}

struct GroupState {
    cursor: Offset,
    pending: HashMap<u64, PendingEntry>,
}

impl GroupState {
    fn new(cursor: Offset) -> Self {
        Self {
            cursor,
            pending: HashMap::new(),
        }
    }
}

/// An in-memory, log-structured stream store with consumer-group semantics.
pub struct MemoryStore {
    streams: DashMap<String, Arc<StreamHandle>>,
    groups: DashMap<(String, String), Arc<Mutex<GroupState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            streams: DashMap::new(),
            groups: DashMap::new(),
        }
    }

    /// Clones the `Arc` out and drops the shard guard immediately — nothing
    /// here may be held across an `.await`, or a blocked `group_read` on one
    /// stream would wedge every other operation on the same shard.
    fn stream_entry(&self, stream: &str) -> Arc<StreamHandle> {
        self.streams
            .entry(stream.to_string())
            .or_insert_with(|| Arc::new(StreamHandle::new()))
            .clone()
    }

    fn group_entry(&self, stream: &str, group: &str) -> Option<Arc<Mutex<GroupState>>> {
        self.groups.get(&(stream.to_string(), group.to_string())).map(|e| e.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn append(&self, stream: &str, bytes: Vec<u8>) -> Result<Offset, StoreError> {
        let handle = self.stream_entry(stream);
        let offset = {
            let mut log = handle.log.lock().await;
            let offset = log.next_offset();
            log.entries.push(bytes);
            offset
        };
        handle.notify.notify_waiters();
        Ok(offset)
    }

    async fn read_range(
        &self,
        stream: &str,
        from: Offset,
        limit: usize,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError> {
        let Some(handle) = self.streams.get(stream).map(|e| e.clone()) else {
            return Ok(Vec::new());
        };
        let log = handle.log.lock().await;
        let start = from.0.max(1);
        let out = (start..)
            .take(limit)
            .take_while(|&o| o as usize <= log.entries.len())
            .map(|o| (Offset(o), log.entries[(o - 1) as usize].clone()))
            .collect();
        Ok(out)
    }

    async fn create_group(&self, stream: &str, group: &str, start: GroupStart) -> Result<(), StoreError> {
        let handle = self.stream_entry(stream);
        let log = handle.log.lock().await;
        let start_offset = match start {
            GroupStart::Beginning => Offset::ZERO,
            GroupStart::End => Offset(log.entries.len() as u64),
            GroupStart::Specific(o) => o,
        };
        drop(log);
        self.groups
            .entry((stream.to_string(), group.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(GroupState::new(start_offset))));
        Ok(())
    }

    async fn group_read(
        &self,
        stream: &str,
        group: &str,
        _consumer: &str,
        count: usize,
        block: Duration,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError> {
        let handle = self.stream_entry(stream);
        let Some(group_lock) = self.group_entry(stream, group) else {
            return Err(StoreError::GroupNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };

        let deadline = Instant::now() + block;
        loop {
            {
                let log = handle.log.lock().await;
                let mut group_state = group_lock.lock().await;
                let mut out = Vec::new();
                let mut cursor = group_state.cursor;
                while out.len() < count && (cursor.0 as usize) < log.entries.len() {
                    cursor = Offset(cursor.0 + 1);
                    let bytes = log.entries[(cursor.0 - 1) as usize].clone();
                    group_state.pending.insert(
                        cursor.0,
                        PendingEntry {
                            offset: cursor,
                            delivered_at: Instant::now(),
                        },
                    );
                    out.push((cursor, bytes));
                }
                group_state.cursor = cursor;
                if !out.is_empty() || block.is_zero() || Instant::now() >= deadline {
                    return Ok(out);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            // `notify` lives outside the log mutex, so waiting on it here
            // holds no lock — a concurrent append is never blocked by us.
            let notified = handle.notify.notified();
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, offset: Offset) -> Result<(), StoreError> {
        let Some(group_lock) = self.group_entry(stream, group) else {
            return Err(StoreError::GroupNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };
        let mut group_state = group_lock.lock().await;
        group_state.pending.remove(&offset.0);
        Ok(())
    }

    async fn claim_stale(
        &self,
        stream: &str,
        group: &str,
        min_idle: Duration,
    ) -> Result<Vec<(Offset, Vec<u8>)>, StoreError> {
        let handle = self.stream_entry(stream);
        let Some(group_lock) = self.group_entry(stream, group) else {
            return Err(StoreError::GroupNotFound {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        };
        let log = handle.log.lock().await;
        let mut group_state = group_lock.lock().await;
        let now = Instant::now();
        let mut reclaimed = Vec::new();
        for entry in group_state.pending.values_mut() {
            if now.saturating_duration_since(entry.delivered_at) >= min_idle {
                entry.delivered_at = now;
                if let Some(bytes) = log.get(entry.offset) {
                    reclaimed.push((entry.offset, bytes.to_vec()));
                }
            }
        }
        Ok(reclaimed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_assigns_monotonic_offsets() {
        let store = MemoryStore::new();
        let o1 = store.append("s", b"a".to_vec()).await.unwrap();
        let o2 = store.append("s", b"b".to_vec()).await.unwrap();
        assert_eq!(o1, Offset(1));
        assert_eq!(o2, Offset(2));
    }

    #[tokio::test]
    async fn group_read_delivers_in_append_order_and_marks_pending() {
        let store = MemoryStore::new();
        store.append("s", b"a".to_vec()).await.unwrap();
        store.append("s", b"b".to_vec()).await.unwrap();
        store.create_group("s", "g", GroupStart::Beginning).await.unwrap();

        let batch = store
            .group_read("s", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].1, b"a");
        assert_eq!(batch[1].1, b"b");

        // Nothing new until another append.
        let empty = store
            .group_read("s", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn ack_removes_from_pending_and_claim_stale_leaves_it_alone() {
        let store = MemoryStore::new();
        store.append("s", b"a".to_vec()).await.unwrap();
        store.create_group("s", "g", GroupStart::Beginning).await.unwrap();
        let batch = store
            .group_read("s", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        store.ack("s", "g", batch[0].0).await.unwrap();

        let reclaimed = store.claim_stale("s", "g", Duration::from_millis(0)).await.unwrap();
        assert!(reclaimed.is_empty());
    }

    #[tokio::test]
    async fn claim_stale_reclaims_idle_pending_entries() {
        let store = MemoryStore::new();
        store.append("s", b"a".to_vec()).await.unwrap();
        store.create_group("s", "g", GroupStart::Beginning).await.unwrap();
        store
            .group_read("s", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();

        // min_idle of zero means "immediately eligible".
        let reclaimed = store.claim_stale("s", "g", Duration::from_millis(0)).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].1, b"a");
    }

    #[tokio::test]
    async fn read_range_does_not_touch_consumer_group_state() {
        let store = MemoryStore::new();
        store.append("s", b"a".to_vec()).await.unwrap();
        store.create_group("s", "g", GroupStart::Beginning).await.unwrap();
        store.read_range("s", Offset::ZERO, 100).await.unwrap();

        let batch = store
            .group_read("s", "g", "c1", 10, Duration::from_millis(0))
            .await
            .unwrap();
        assert_eq!(batch.len(), 1, "read_range must not advance the group cursor");
    }

    #[tokio::test]
    async fn group_read_blocks_until_append_then_returns() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.create_group("s", "g", GroupStart::Beginning).await.unwrap();

        let reader_store = store.clone();
        let reader = tokio::spawn(async move {
            reader_store
                .group_read("s", "g", "c1", 10, Duration::from_secs(5))
                .await
                .unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.append("s", b"late".to_vec()).await.unwrap();

        let batch = reader.await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].1, b"late");
    }
}
