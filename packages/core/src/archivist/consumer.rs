//! Stream consumers.
//!
//! Consumers drain the events stream in batches with competing-consumer
//! semantics: each entry goes to one consumer of the group and is
//! acknowledged only once it was durably processed. On startup each consumer
//! first reclaims pending entries a crashed sibling may have left behind and
//! reprocesses them in recovery mode.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::stream::{Entry, EventStream};

/// Acknowledgement handle scoped to one stream and group.
pub struct StreamAcker {
    stream: Arc<dyn EventStream>,
    stream_key: String,
    group: String,
}

impl StreamAcker {
    pub fn new(stream: Arc<dyn EventStream>, stream_key: &str, group: &str) -> Self {
        Self {
            stream,
            stream_key: stream_key.to_string(),
            group: group.to_string(),
        }
    }

    pub async fn ack(&self, ids: &[String]) -> Result<u64> {
        self.stream.ack(&self.stream_key, &self.group, ids).await
    }
}

/// Processing side of a stream consumer.
///
/// Implementations ack exactly the entries they durably processed; entries
/// left unacked are redelivered later. `recovery` marks reclaimed entries,
/// which are processed one at a time to isolate poison entries.
#[async_trait]
pub trait Consumer: Send + Sync {
    async fn process_entries(
        &self,
        entries: Vec<Entry>,
        recovery: bool,
        acker: &StreamAcker,
    ) -> Result<()>;
}

/// Configuration for a consumer pool.
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    /// Stream to drain.
    pub stream: String,
    /// Consumer group name; competing consumers share it.
    pub group: String,
    /// Number of consumers to spawn.
    pub consumers: usize,
    /// Entries fetched per read.
    pub batch_size: usize,
    /// Sleep when the stream is idle.
    pub poll_interval: Duration,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            stream: "events".to_string(),
            group: "archivists".to_string(),
            consumers: 10,
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Pool of competing consumers over one stream.
pub struct ConsumerPool {
    stream: Arc<dyn EventStream>,
    consumer: Arc<dyn Consumer>,
    config: ConsumerPoolConfig,
}

impl ConsumerPool {
    pub fn new(
        stream: Arc<dyn EventStream>,
        consumer: Arc<dyn Consumer>,
        config: ConsumerPoolConfig,
    ) -> Self {
        Self {
            stream,
            consumer,
            config,
        }
    }

    /// Run all consumers until the token is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!(
            stream = %self.config.stream,
            group = %self.config.group,
            consumers = self.config.consumers,
            "consumer pool starting"
        );

        let mut handles = Vec::with_capacity(self.config.consumers);
        for n in 0..self.config.consumers {
            let name = format!("{}-{}", self.config.group, n);
            handles.push(tokio::spawn(consumer_loop(
                self.stream.clone(),
                self.consumer.clone(),
                self.config.clone(),
                name,
                shutdown.clone(),
            )));
        }

        for handle in handles {
            let _ = handle.await;
        }

        info!(group = %self.config.group, "consumer pool stopped");
        Ok(())
    }
}

async fn consumer_loop(
    stream: Arc<dyn EventStream>,
    consumer: Arc<dyn Consumer>,
    config: ConsumerPoolConfig,
    name: String,
    shutdown: CancellationToken,
) {
    let acker = StreamAcker::new(stream.clone(), &config.stream, &config.group);

    // Reprocess whatever a previous consumer left pending.
    match stream
        .pending(&config.stream, &config.group, &name, config.batch_size)
        .await
    {
        Ok(entries) if !entries.is_empty() => {
            debug!(consumer = %name, count = entries.len(), "recovering pending entries");
            if let Err(e) = consumer.process_entries(entries, true, &acker).await {
                error!(consumer = %name, error = %e, "recovery processing failed");
            }
        }
        Ok(_) => {}
        Err(e) => error!(consumer = %name, error = %e, "failed to read pending entries"),
    }

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        let entries = match stream
            .read(&config.stream, &config.group, &name, config.batch_size)
            .await
        {
            Ok(entries) => entries,
            Err(e) => {
                error!(consumer = %name, error = %e, "failed to read entries");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        if entries.is_empty() {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(config.poll_interval) => {}
            }
            continue;
        }

        debug!(consumer = %name, count = entries.len(), "processing entries");
        if let Err(e) = consumer.process_entries(entries, false, &acker).await {
            // Entries stay pending and will be reclaimed in recovery mode.
            error!(consumer = %name, error = %e, "processing failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::MemoryEventStream;
    use serde_json::json;
    use std::sync::Mutex;

    /// Consumer that collects events and acks everything it sees.
    struct CollectingConsumer {
        seen: Mutex<Vec<(String, bool)>>,
    }

    impl CollectingConsumer {
        fn new() -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Consumer for CollectingConsumer {
        async fn process_entries(
            &self,
            entries: Vec<Entry>,
            recovery: bool,
            acker: &StreamAcker,
        ) -> Result<()> {
            let ids: Vec<String> = entries.iter().map(|e| e.message_id.clone()).collect();
            {
                let mut seen = self.seen.lock().unwrap();
                for entry in &entries {
                    seen.push((entry.event["id"].as_str().unwrap().to_string(), recovery));
                }
            }
            acker.ack(&ids).await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn pool_drains_the_stream_and_acks() {
        let stream = MemoryEventStream::shared();
        let events: Vec<_> = (0..25).map(|n| json!({"id": format!("e{n}")})).collect();
        stream.publish("events", &events, 1000).await.unwrap();

        let consumer = Arc::new(CollectingConsumer::new());
        let pool = ConsumerPool::new(
            stream.clone(),
            consumer.clone(),
            ConsumerPoolConfig {
                consumers: 3,
                batch_size: 10,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let handle = tokio::spawn(pool.run(shutdown));

        tokio::time::sleep(Duration::from_millis(200)).await;
        stopper.cancel();
        handle.await.unwrap().unwrap();

        let seen = consumer.seen.lock().unwrap();
        assert_eq!(seen.len(), 25);

        // Everything acked: no pending entries left for the group.
        let pending = stream.pending("events", "archivists", "x", 100).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pending_entries_are_recovered_on_start() {
        let stream = MemoryEventStream::shared();
        stream
            .publish("events", &[json!({"id": "e1"})], 1000)
            .await
            .unwrap();

        // A previous consumer read the entry but never acked it.
        stream.read("events", "archivists", "dead", 10).await.unwrap();

        let consumer = Arc::new(CollectingConsumer::new());
        let pool = ConsumerPool::new(
            stream.clone(),
            consumer.clone(),
            ConsumerPoolConfig {
                consumers: 1,
                poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
        );

        let shutdown = CancellationToken::new();
        let stopper = shutdown.clone();
        let handle = tokio::spawn(pool.run(shutdown));

        tokio::time::sleep(Duration::from_millis(100)).await;
        stopper.cancel();
        handle.await.unwrap().unwrap();

        let seen = consumer.seen.lock().unwrap();
        assert_eq!(seen.as_slice(), &[("e1".to_string(), true)]);
    }
}
