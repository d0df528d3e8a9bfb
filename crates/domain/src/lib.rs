//! Shared domain types: the watch-list input, the match engine's output,
//! the event-bus's tagged-union payload, and the currency/feature-flag
//! records that flow between components.

pub use block::{ParsedBlock, ParsedInput, ParsedOutput, ParsedTx};
pub use chainscript::ScriptType;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One entry in the configured watch list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedAddress {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    In,
    Out,
}

/// A single directional balance change for a watched address within one
/// transaction, optionally enriched with fiat value and OP_RETURN context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressActivity {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub txid: String,
    pub direction: Direction,
    pub value_btc: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_usd: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_return_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_return_utf8: Option<String>,
}

/// A persisted/fetched fiat exchange rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRate {
    pub base: String,
    pub quote: String,
    pub rate: f64,
    pub time: DateTime<Utc>,
    pub source: String,
    pub cached_at: DateTime<Utc>,
}

/// Typed, hot-reloadable feature flags (C13).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub parse_raw_blocks: bool,
    pub resolve_input_addresses: bool,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        FeatureFlags {
            parse_raw_blocks: false,
            resolve_input_addresses: false,
        }
    }
}

/// The four-stage pipeline's tagged-union event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum DomainEvent {
    BlockDetected {
        height: u32,
        hash: String,
        timestamp: DateTime<Utc>,
        dedupe_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    BlockParsed {
        block: ParsedBlock,
        timestamp: DateTime<Utc>,
        dedupe_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    AddressActivityFound {
        activity: AddressActivity,
        height: u32,
        hash: String,
        timestamp: DateTime<Utc>,
        dedupe_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    NotificationEmitted {
        channel: String,
        ok: bool,
        timestamp: DateTime<Utc>,
        dedupe_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
    BlockReorg {
        height: u32,
        old_hash: String,
        new_hash: String,
        timestamp: DateTime<Utc>,
        dedupe_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event_id: Option<String>,
    },
}

impl DomainEvent {
    /// The tag used to route events to per-kind queues in the event bus.
    pub fn kind(&self) -> EventKind {
        match self {
            DomainEvent::BlockDetected { .. } => EventKind::BlockDetected,
            DomainEvent::BlockParsed { .. } => EventKind::BlockParsed,
            DomainEvent::AddressActivityFound { .. } => EventKind::AddressActivityFound,
            DomainEvent::NotificationEmitted { .. } => EventKind::NotificationEmitted,
            DomainEvent::BlockReorg { .. } => EventKind::BlockReorg,
        }
    }

    pub fn dedupe_key(&self) -> &str {
        match self {
            DomainEvent::BlockDetected { dedupe_key, .. }
            | DomainEvent::BlockParsed { dedupe_key, .. }
            | DomainEvent::AddressActivityFound { dedupe_key, .. }
            | DomainEvent::NotificationEmitted { dedupe_key, .. }
            | DomainEvent::BlockReorg { dedupe_key, .. } => dedupe_key,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    BlockDetected,
    BlockParsed,
    AddressActivityFound,
    NotificationEmitted,
    BlockReorg,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BlockDetected => "BlockDetected",
            EventKind::BlockParsed => "BlockParsed",
            EventKind::AddressActivityFound => "AddressActivityFound",
            EventKind::NotificationEmitted => "NotificationEmitted",
            EventKind::BlockReorg => "BlockReorg",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_routes_to_the_right_tag() {
        let event = DomainEvent::BlockDetected {
            height: 1,
            hash: "h".into(),
            timestamp: Utc::now(),
            dedupe_key: "k".into(),
            event_id: None,
        };
        assert_eq!(event.kind(), EventKind::BlockDetected);
        assert_eq!(event.dedupe_key(), "k");
    }
}
