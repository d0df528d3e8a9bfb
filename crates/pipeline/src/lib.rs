//! Pipeline (C10): registers the event bus's three dispatch stages —
//! fetch/parse the block a producer detected, run the match engine against
//! the current watch snapshot, and fan matched activity out to sinks —
//! publishing one event per stage as described in §4.10.

use std::sync::Arc;
use std::time::Duration;

use address::Network;
use async_trait::async_trait;
use chrono::Utc;
use domain::{AddressActivity, DomainEvent, Direction, EventKind, FeatureFlags, ParsedBlock};
use eventbus::{Bus, Handler, HandlerError, Subscription};
use flags::FeatureFlagHandle;
use matchengine::compute_activities;
use ratecache::RateCache;
use rpcclient::RpcClient;
use rust_decimal::{Decimal, RoundingStrategy};
use sinks::SinkRegistry;
use tracing::{info, warn};
use watch::WatchIndexHandle;

/// OP_RETURN payload bytes kept in a block-summary log line before the rest
/// is redacted (§4.10 step 2).
const OP_RETURN_LOG_CAP_BYTES: usize = 80;

pub struct Pipeline {
    bus: Bus,
    rpc: RpcClient,
    watch: Arc<WatchIndexHandle>,
    flags: Arc<FeatureFlagHandle>,
    ratecache: Arc<RateCache>,
    sinks: Arc<SinkRegistry>,
    network: Network,
}

impl Pipeline {
    pub fn new(
        bus: Bus,
        rpc: RpcClient,
        watch: Arc<WatchIndexHandle>,
        flags: Arc<FeatureFlagHandle>,
        ratecache: Arc<RateCache>,
        sinks: Arc<SinkRegistry>,
        network: Network,
    ) -> Self {
        Pipeline {
            bus,
            rpc,
            watch,
            flags,
            ratecache,
            sinks,
            network,
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    /// Registers the three subscriptions of §4.10 on `self`'s bus.
    pub async fn register(self: &Arc<Self>) {
        self.bus
            .subscribe(Subscription::new(
                EventKind::BlockDetected,
                "parse-block",
                1,
                3,
                |attempt| Duration::from_millis((100u64 * (attempt as u64).pow(2)).min(2000)),
                Arc::new(ParseBlockHandler {
                    pipeline: self.clone(),
                }),
            ))
            .await;
        self.bus
            .subscribe(Subscription::new(
                EventKind::BlockParsed,
                "compute-activities",
                1,
                2,
                |attempt| Duration::from_millis(100 * attempt as u64),
                Arc::new(ComputeActivitiesHandler {
                    pipeline: self.clone(),
                }),
            ))
            .await;
        self.bus
            .subscribe(Subscription::new(
                EventKind::AddressActivityFound,
                "log-activity",
                4,
                1,
                |_attempt| Duration::from_millis(0),
                Arc::new(LogActivityHandler {
                    pipeline: self.clone(),
                }),
            ))
            .await;
    }
}

fn direction_str(direction: Direction) -> &'static str {
    match direction {
        Direction::In => "in",
        Direction::Out => "out",
    }
}

struct ParseBlockHandler {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl Handler for ParseBlockHandler {
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::BlockDetected { height, hash, .. } = event else {
            return Ok(());
        };
        let flags = self.pipeline.flags.current();
        let block = fetch_and_parse_block(&self.pipeline.rpc, self.pipeline.network, height, &hash, flags)
            .await
            .map_err(|e| HandlerError::new(e.to_string()))?;

        self.pipeline
            .bus
            .publish(DomainEvent::BlockParsed {
                block,
                timestamp: Utc::now(),
                dedupe_key: format!("BlockParsed:{height}:{hash}"),
                event_id: None,
            })
            .await;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error(transparent)]
    Rpc(#[from] rpcclient::RpcError),
    #[error(transparent)]
    Parse(#[from] block::BlockParseError),
}

async fn fetch_and_parse_block(
    rpc: &RpcClient,
    network: Network,
    height: u32,
    hash: &str,
    flags: FeatureFlags,
) -> Result<ParsedBlock, FetchError> {
    if flags.parse_raw_blocks {
        let raw = rpc.get_block_raw(hash).await?;
        Ok(block::parse_raw_block(&raw, network, height)?)
    } else {
        let verbose = rpc.get_block_verbose(hash, 2).await?;
        Ok(block::parse_verbose_block(&verbose, flags.resolve_input_addresses)?)
    }
}

struct ComputeActivitiesHandler {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl Handler for ComputeActivitiesHandler {
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::BlockParsed { block, .. } = event else {
            return Ok(());
        };

        // §4.10 step 2: never skip, just delay, when BlockDetected is backed up.
        self.pipeline.bus.wait_for_capacity(EventKind::BlockDetected, None).await;

        let rate = self.pipeline.ratecache.get_usd_rate_or_zero("BTC").await;
        let watch = self.pipeline.watch.load();
        let mut activities = compute_activities(&block, &watch);
        if rate > Decimal::ZERO {
            for activity in &mut activities {
                activity.value_usd =
                    Some((activity.value_btc * rate).round_dp_with_strategy(2, RoundingStrategy::ToZero));
            }
        }

        log_block_summary(&block, &activities);

        for activity in activities {
            let dedupe_key = format!(
                "AddressActivity:{}:{}:{}:{}:{}",
                block.height,
                block.hash,
                activity.address,
                activity.txid,
                direction_str(activity.direction)
            );
            self.pipeline
                .bus
                .publish(DomainEvent::AddressActivityFound {
                    activity,
                    height: block.height,
                    hash: block.hash.clone(),
                    timestamp: Utc::now(),
                    dedupe_key,
                    event_id: None,
                })
                .await;
        }
        Ok(())
    }
}

fn log_block_summary(block: &ParsedBlock, activities: &[AddressActivity]) {
    info!(
        target: "pipeline",
        height = block.height,
        hash = %block.hash,
        tx_count = block.transactions.len(),
        activity_count = activities.len(),
        "pipeline.block_summary"
    );
    for tx in &block.transactions {
        for output in &tx.outputs {
            if let Some(hex) = &output.op_return_hex {
                let (redacted, op_return_redacted) = redact_op_return(hex);
                info!(
                    target: "pipeline",
                    height = block.height,
                    hash = %block.hash,
                    txid = %tx.txid,
                    op_return_hex = %redacted,
                    op_return_redacted,
                    "pipeline.op_return"
                );
            }
        }
    }
}

/// Caps a logged OP_RETURN hex string at `OP_RETURN_LOG_CAP_BYTES` payload
/// bytes (2 hex chars per byte), flagging when it truncated.
fn redact_op_return(hex: &str) -> (String, bool) {
    let cap_chars = OP_RETURN_LOG_CAP_BYTES * 2;
    if hex.len() > cap_chars {
        (hex[..cap_chars].to_string(), true)
    } else {
        (hex.to_string(), false)
    }
}

struct LogActivityHandler {
    pipeline: Arc<Pipeline>,
}

#[async_trait]
impl Handler for LogActivityHandler {
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let DomainEvent::AddressActivityFound { activity, height, hash, .. } = event else {
            return Ok(());
        };

        let outcomes = self.pipeline.sinks.dispatch_all(&activity).await;
        for (kind, outcome) in &outcomes {
            if !outcome.ok {
                warn!(target: "pipeline", sink = %kind, error = ?outcome.error, "pipeline.sink_delivery_failed");
            }
        }

        let dedupe_key = format!(
            "Notification:{}:{}:{}:{}:{}",
            height,
            hash,
            activity.address,
            activity.txid,
            direction_str(activity.direction)
        );
        self.pipeline
            .bus
            .publish(DomainEvent::NotificationEmitted {
                channel: self.pipeline.sinks.primary_channel().to_string(),
                ok: true,
                timestamp: Utc::now(),
                dedupe_key,
                event_id: None,
            })
            .await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_op_return_caps_at_eighty_bytes() {
        let hex: String = std::iter::repeat("ab").take(100).collect();
        let (redacted, was_redacted) = redact_op_return(&hex);
        assert_eq!(redacted.len(), 160);
        assert!(was_redacted);
    }

    #[test]
    fn redact_op_return_leaves_short_payload_untouched() {
        let (redacted, was_redacted) = redact_op_return("deadbeef");
        assert_eq!(redacted, "deadbeef");
        assert!(!was_redacted);
    }

    #[test]
    fn direction_str_matches_lowercase_tokens() {
        assert_eq!(direction_str(Direction::In), "in");
        assert_eq!(direction_str(Direction::Out), "out");
    }
}
