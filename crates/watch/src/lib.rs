//! Watch index (C6): builds the `address -> label` map, the
//! `label -> [WatchedAddress]` index used for OP_RETURN label matching, and
//! the Bloom pre-filter (§4.6), then publishes it atomically so in-flight
//! handlers keep using the snapshot they observed at dispatch start (§3
//! "Lifecycles").

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bloom::BloomFilter;
use domain::WatchedAddress;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::warn;

/// No env-configured cadence is specified for watch-file hot reload in the
/// design (only feature flags name one); this mirrors the feature-flags
/// default rather than inventing a new tunable.
pub const DEFAULT_WATCH_RELOAD_MS: u64 = 2000;

/// False-positive target the design fixes for the watch-list Bloom filter.
const BLOOM_FP_RATE: f64 = 0.01;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("failed to read watch addresses file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse watch addresses file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// An immutable snapshot of the configured watch set. Built once per reload
/// cycle; never mutated in place.
pub struct WatchIndex {
    watch_set: HashMap<String, Option<String>>,
    label_index: HashMap<String, Vec<WatchedAddress>>,
    bloom: BloomFilter,
}

impl WatchIndex {
    /// Build a fresh index from a watch list. Label keys are lowercased and
    /// trimmed; empty labels are not indexed (§4.6).
    pub fn build(addresses: &[WatchedAddress]) -> Self {
        let mut watch_set = HashMap::with_capacity(addresses.len());
        let mut label_index: HashMap<String, Vec<WatchedAddress>> = HashMap::new();

        for entry in addresses {
            watch_set.insert(entry.address.clone(), entry.label.clone());
            if let Some(label) = &entry.label {
                let key = label.trim().to_lowercase();
                if !key.is_empty() {
                    label_index.entry(key).or_default().push(entry.clone());
                }
            }
        }

        let bloom = BloomFilter::with_fp_rate(
            addresses.iter().map(|a| a.address.as_bytes()),
            addresses.len(),
            BLOOM_FP_RATE,
        );

        WatchIndex {
            watch_set,
            label_index,
            bloom,
        }
    }

    pub fn empty() -> Self {
        Self::build(&[])
    }

    /// Bloom-gated, exact-confirmed membership test (I3 / Testable property 3).
    pub fn contains(&self, address: &str) -> bool {
        self.bloom.might_contain(address.as_bytes()) && self.watch_set.contains_key(address)
    }

    pub fn label_for(&self, address: &str) -> Option<String> {
        self.watch_set.get(address).cloned().flatten()
    }

    pub fn len(&self) -> usize {
        self.watch_set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watch_set.is_empty()
    }

    /// Watched addresses whose label (case-insensitively) is `label_key`,
    /// which must already be lowercased/trimmed by the caller.
    pub fn addresses_for_label_key(&self, label_key: &str) -> &[WatchedAddress] {
        self.label_index
            .get(label_key)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// All label keys currently indexed, for the match engine's substring
    /// scan over an OP_RETURN payload (§4.7 step 6).
    pub fn label_keys(&self) -> impl Iterator<Item = &str> {
        self.label_index.keys().map(|s| s.as_str())
    }
}

/// An atomically-swappable handle to the current `WatchIndex` snapshot.
/// Readers call `load()` once per block and use the returned `Arc` for the
/// rest of that dispatch; a concurrent `store()` never blocks them and never
/// mutates the snapshot they're holding.
pub struct WatchIndexHandle {
    inner: ArcSwap<WatchIndex>,
}

impl WatchIndexHandle {
    pub fn new(initial: WatchIndex) -> Self {
        WatchIndexHandle {
            inner: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<WatchIndex> {
        self.inner.load_full()
    }

    /// Atomically replace the snapshot. The previous `Arc` remains valid and
    /// usable by any handler still holding it.
    pub fn store(&self, new_index: WatchIndex) {
        self.inner.store(Arc::new(new_index));
    }
}

impl Default for WatchIndexHandle {
    fn default() -> Self {
        WatchIndexHandle::new(WatchIndex::empty())
    }
}

/// Parse the JSON-array watch file format (`WATCH_ADDRESSES_FILE`, §6).
pub fn parse_watch_file_contents(contents: &str) -> Result<Vec<WatchedAddress>, serde_json::Error> {
    serde_json::from_str(contents)
}

pub fn load_watch_file(path: &str) -> Result<Vec<WatchedAddress>, WatchError> {
    let contents = std::fs::read_to_string(path).map_err(|source| WatchError::Read {
        path: path.to_string(),
        source,
    })?;
    parse_watch_file_contents(&contents).map_err(|source| WatchError::Parse {
        path: path.to_string(),
        source,
    })
}

/// Parse the `WATCH_ADDRESSES` CSV fallback: `addr[:label],addr[:label],…`.
pub fn parse_watch_csv(csv: &str) -> Vec<WatchedAddress> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((addr, label)) => WatchedAddress {
                address: addr.trim().to_string(),
                label: Some(label.trim().to_string()).filter(|l| !l.is_empty()),
            },
            None => WatchedAddress {
                address: entry.to_string(),
                label: None,
            },
        })
        .collect()
}

/// Spawn the background poller that hot-reloads `WATCH_ADDRESSES_FILE`
/// (§3 "Lifecycles"): every `reload_interval`, re-read `path`; if its
/// content changed since the last poll, re-parse and atomically swap the
/// snapshot via `build` (which applies the caller's sharder filter, if
/// any, before constructing the new `WatchIndex`). Read/parse failures are
/// logged `watch.reload_failed` and never disturb the previous snapshot
/// (§7 "Watch-list reload error").
pub fn spawn_reload_task(
    handle: Arc<WatchIndexHandle>,
    path: String,
    reload_interval: Duration,
    build: impl Fn(Vec<WatchedAddress>) -> WatchIndex + Send + Sync + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut last_contents: Option<String> = None;
        let mut interval = tokio::time::interval(reload_interval);
        loop {
            interval.tick().await;
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(err) => {
                    warn!(target: "watch", path = %path, error = %err, "watch.reload_failed");
                    continue;
                }
            };
            if last_contents.as_deref() == Some(contents.as_str()) {
                continue;
            }
            match parse_watch_file_contents(&contents) {
                Ok(addresses) => {
                    handle.store(build(addresses));
                    last_contents = Some(contents);
                }
                Err(err) => {
                    warn!(target: "watch", path = %path, error = %err, "watch.reload_failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(a: &str, label: Option<&str>) -> WatchedAddress {
        WatchedAddress {
            address: a.to_string(),
            label: label.map(str::to_string),
        }
    }

    #[test]
    fn exact_membership_requires_bloom_and_watch_set() {
        let idx = WatchIndex::build(&[addr("addrA", Some("Wallet A"))]);
        assert!(idx.contains("addrA"));
        assert!(!idx.contains("addrB"));
    }

    #[test]
    fn label_index_is_case_insensitive_and_trimmed() {
        let idx = WatchIndex::build(&[addr("addrB", Some("  Wallet-A  "))]);
        let found = idx.addresses_for_label_key("wallet-a");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].address, "addrB");
    }

    #[test]
    fn empty_labels_are_not_indexed() {
        let idx = WatchIndex::build(&[addr("addrC", Some("  ")), addr("addrD", None)]);
        assert_eq!(idx.label_keys().count(), 0);
    }

    #[test]
    fn handle_swap_does_not_disturb_a_held_snapshot() {
        let handle = WatchIndexHandle::new(WatchIndex::build(&[addr("addrA", None)]));
        let held = handle.load();
        handle.store(WatchIndex::build(&[addr("addrB", None)]));
        assert!(held.contains("addrA"));
        assert!(!held.contains("addrB"));
        assert!(handle.load().contains("addrB"));
    }

    #[test]
    fn csv_fallback_parses_address_and_optional_label() {
        let parsed = parse_watch_csv("addr1:Label One, addr2 ,addr3:");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[0].address, "addr1");
        assert_eq!(parsed[0].label.as_deref(), Some("Label One"));
        assert_eq!(parsed[1].address, "addr2");
        assert_eq!(parsed[1].label, None);
        assert_eq!(parsed[2].label, None);
    }

    #[test]
    fn watch_file_parses_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("addresses.json");
        std::fs::write(&path, r#"[{"address":"addrA","label":"Wallet A"}]"#).unwrap();
        let loaded = load_watch_file(path.to_str().unwrap()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].address, "addrA");
    }
}
