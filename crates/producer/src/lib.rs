//! Block producer (C12): polls the node's chain tip and publishes
//! `BlockDetected` on each new height, optionally detecting reorgs by
//! comparing a new block's `prevHash` against the hash previously observed
//! at `height - 1` (§4.12).

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use domain::{DomainEvent, EventKind};
use eventbus::Bus;
use rpcclient::RpcClient;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Error)]
pub enum ProducerError {
    #[error(transparent)]
    Rpc(#[from] rpcclient::RpcError),
}

struct DetectedBlock {
    height: u32,
    hash: String,
    prev_hash: Option<String>,
}

pub struct BlockProducer {
    bus: Bus,
    rpc: RpcClient,
    poll_interval: Duration,
    last_height: Mutex<Option<u32>>,
    seen_hash_by_height: Mutex<HashMap<u32, String>>,
}

impl BlockProducer {
    pub fn new(bus: Bus, rpc: RpcClient, poll_interval: Duration) -> Self {
        BlockProducer {
            bus,
            rpc,
            poll_interval,
            last_height: Mutex::new(None),
            seen_hash_by_height: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the poll loop described in §4.12 until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.tick() => {
                    if let Err(err) = result {
                        warn!(target: "producer", error = %err, "producer.tick_failed");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
        }
    }

    async fn tick(&self) -> Result<(), ProducerError> {
        self.bus.wait_for_capacity(EventKind::BlockDetected, None).await;

        let since = *self.last_height.lock().await;
        let detected = self.await_new_block(since).await?;

        self.maybe_publish_reorg(&detected).await;

        *self.last_height.lock().await = Some(detected.height);
        self.bus
            .publish(DomainEvent::BlockDetected {
                height: detected.height,
                hash: detected.hash.clone(),
                timestamp: Utc::now(),
                dedupe_key: format!("BlockDetected:{}:{}", detected.height, detected.hash),
                event_id: None,
            })
            .await;
        Ok(())
    }

    async fn await_new_block(&self, since: Option<u32>) -> Result<DetectedBlock, ProducerError> {
        let current = match since {
            Some(height) => height as u64,
            None => self.rpc.get_block_count().await?,
        };

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            let tip = self.rpc.get_block_count().await?;
            if tip > current {
                let hash = self.rpc.get_block_hash(tip).await?;
                let prev_hash = self.fetch_prev_hash(&hash).await?;
                return Ok(DetectedBlock {
                    height: tip as u32,
                    hash,
                    prev_hash,
                });
            }
        }
    }

    async fn fetch_prev_hash(&self, hash: &str) -> Result<Option<String>, ProducerError> {
        let header = self.rpc.get_block_header(hash).await?;
        Ok(header
            .get("previousblockhash")
            .and_then(|v| v.as_str())
            .map(str::to_string))
    }

    async fn maybe_publish_reorg(&self, detected: &DetectedBlock) {
        let mut seen = self.seen_hash_by_height.lock().await;
        if detected.height > 0 {
            if let (Some(prev_hash), Some(old_hash)) =
                (&detected.prev_hash, seen.get(&(detected.height - 1)))
            {
                if old_hash != prev_hash {
                    let old_hash = old_hash.clone();
                    drop(seen);
                    self.bus
                        .publish(DomainEvent::BlockReorg {
                            height: detected.height,
                            old_hash: old_hash.clone(),
                            new_hash: detected.hash.clone(),
                            timestamp: Utc::now(),
                            dedupe_key: format!("BlockReorg:{}:{}", detected.height, detected.hash),
                            event_id: None,
                        })
                        .await;
                    seen = self.seen_hash_by_height.lock().await;
                }
            }
        }
        seen.insert(detected.height, detected.hash.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use eventbus::{Handler, HandlerError, Subscription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CapturingHandler {
        count: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for CapturingHandler {
        async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_exits_promptly_once_cancelled() {
        let server = mockito::Server::new_async().await;
        let rpc = RpcClient::new(server.url());
        let bus = Bus::new(4);
        bus.start().await;

        let producer = BlockProducer::new(bus.clone(), rpc, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        producer.run(cancel).await;
        bus.shutdown().await;
    }

    /// A block whose `prevHash` disagrees with the hash we already recorded
    /// at `height - 1` publishes a `BlockReorg` (§4.12, MAY clause).
    #[tokio::test]
    async fn reorg_detected_when_prev_hash_disagrees_with_seen_height() {
        let server = mockito::Server::new_async().await;
        let rpc = RpcClient::new(server.url());
        let bus = Bus::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Subscription::new(
            EventKind::BlockReorg,
            "capture",
            1,
            0,
            |_| Duration::from_millis(0),
            Arc::new(CapturingHandler { count: count.clone() }),
        ))
        .await;
        bus.start().await;

        let producer = BlockProducer::new(bus.clone(), rpc, Duration::from_millis(5));
        producer
            .maybe_publish_reorg(&DetectedBlock {
                height: 100,
                hash: "H100".to_string(),
                prev_hash: Some("H99".to_string()),
            })
            .await;
        producer
            .maybe_publish_reorg(&DetectedBlock {
                height: 101,
                hash: "H101-alt".to_string(),
                prev_hash: Some("H100-wrong".to_string()),
            })
            .await;

        bus.wait_for_capacity(EventKind::BlockReorg, Some(0)).await;
        bus.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_reorg_when_prev_hash_matches_seen_height() {
        let server = mockito::Server::new_async().await;
        let rpc = RpcClient::new(server.url());
        let bus = Bus::new(4);
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(Subscription::new(
            EventKind::BlockReorg,
            "capture",
            1,
            0,
            |_| Duration::from_millis(0),
            Arc::new(CapturingHandler { count: count.clone() }),
        ))
        .await;
        bus.start().await;

        let producer = BlockProducer::new(bus.clone(), rpc, Duration::from_millis(5));
        producer
            .maybe_publish_reorg(&DetectedBlock {
                height: 100,
                hash: "H100".to_string(),
                prev_hash: Some("H99".to_string()),
            })
            .await;
        producer
            .maybe_publish_reorg(&DetectedBlock {
                height: 101,
                hash: "H101".to_string(),
                prev_hash: Some("H100".to_string()),
            })
            .await;

        bus.wait_for_capacity(EventKind::BlockReorg, Some(0)).await;
        bus.shutdown().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
