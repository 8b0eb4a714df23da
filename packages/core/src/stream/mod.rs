//! Append-only, length-bounded event stream.
//!
//! Eventizer jobs publish events to a named stream; archivist consumers
//! drain it with competing-consumer semantics: each entry is delivered to
//! exactly one consumer of a group and stays pending until acknowledged.
//! Unacknowledged entries can be reclaimed later, which is how a consumer
//! picks up work a crashed sibling left behind.
//!
//! [`MemoryEventStream`] is the in-process implementation; the trait is the
//! seam where an external log (Redis streams, JetStream) would plug in.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

/// An entry delivered to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Stream-assigned identifier, used for acknowledgement.
    pub message_id: String,
    /// The JSON-serialized event.
    pub event: Value,
}

#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append events to the stream, evicting the oldest entries beyond
    /// `max_length`.
    async fn publish(&self, stream: &str, events: &[Value], max_length: usize) -> anyhow::Result<()>;

    /// Deliver up to `count` new entries to `consumer` of `group`.
    ///
    /// Delivered entries become pending for the group until acknowledged.
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>>;

    /// Acknowledge processed entries. Returns how many were pending.
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> anyhow::Result<u64>;

    /// Reclaim pending (delivered but unacknowledged) entries for
    /// reprocessing, oldest first.
    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>>;

    /// Number of entries currently retained.
    async fn len(&self, stream: &str) -> anyhow::Result<usize>;
}

#[derive(Debug, Clone)]
struct PendingEntry {
    consumer: String,
    event: Value,
}

#[derive(Default)]
struct GroupState {
    /// Sequence number of the last entry delivered to this group.
    last_delivered: u64,
    /// Delivered-but-unacked entries, keyed by message id.
    pending: HashMap<u64, PendingEntry>,
}

#[derive(Default)]
struct StreamState {
    next_seq: u64,
    entries: VecDeque<(u64, Value)>,
    groups: HashMap<String, GroupState>,
}

/// In-process event stream.
#[derive(Default)]
pub struct MemoryEventStream {
    streams: RwLock<HashMap<String, StreamState>>,
}

impl MemoryEventStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// All retained events of a stream, oldest first. Test helper.
    pub fn events(&self, stream: &str) -> Vec<Value> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        streams
            .get(stream)
            .map(|s| s.entries.iter().map(|(_, e)| e.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStream for MemoryEventStream {
    async fn publish(
        &self,
        stream: &str,
        events: &[Value],
        max_length: usize,
    ) -> anyhow::Result<()> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let state = streams.entry(stream.to_string()).or_default();

        for event in events {
            state.next_seq += 1;
            state.entries.push_back((state.next_seq, event.clone()));
        }
        while state.entries.len() > max_length {
            state.entries.pop_front();
        }
        Ok(())
    }

    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let state = match streams.get_mut(stream) {
            Some(state) => state,
            None => return Ok(Vec::new()),
        };

        let group_state = state.groups.entry(group.to_string()).or_default();
        let mut delivered = Vec::new();

        for (seq, event) in state.entries.iter() {
            if delivered.len() >= count {
                break;
            }
            if *seq <= group_state.last_delivered {
                continue;
            }
            group_state.last_delivered = *seq;
            group_state.pending.insert(
                *seq,
                PendingEntry {
                    consumer: consumer.to_string(),
                    event: event.clone(),
                },
            );
            delivered.push(Entry {
                message_id: seq.to_string(),
                event: event.clone(),
            });
        }

        Ok(delivered)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> anyhow::Result<u64> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let Some(state) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(0);
        };

        let mut acked = 0;
        for id in ids {
            if let Ok(seq) = id.parse::<u64>() {
                if group_state.pending.remove(&seq).is_some() {
                    acked += 1;
                }
            }
        }
        Ok(acked)
    }

    async fn pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> anyhow::Result<Vec<Entry>> {
        let mut streams = self.streams.write().unwrap_or_else(|e| e.into_inner());
        let Some(state) = streams.get_mut(stream) else {
            return Ok(Vec::new());
        };
        let Some(group_state) = state.groups.get_mut(group) else {
            return Ok(Vec::new());
        };

        let mut seqs: Vec<u64> = group_state.pending.keys().copied().collect();
        seqs.sort_unstable();
        seqs.truncate(count);

        let mut entries = Vec::with_capacity(seqs.len());
        for seq in seqs {
            if let Some(pending) = group_state.pending.get_mut(&seq) {
                // Claimed entries move to the reclaiming consumer.
                pending.consumer = consumer.to_string();
                entries.push(Entry {
                    message_id: seq.to_string(),
                    event: pending.event.clone(),
                });
            }
        }
        Ok(entries)
    }

    async fn len(&self, stream: &str) -> anyhow::Result<usize> {
        let streams = self.streams.read().unwrap_or_else(|e| e.into_inner());
        Ok(streams.get(stream).map(|s| s.entries.len()).unwrap_or(0))
    }
}
