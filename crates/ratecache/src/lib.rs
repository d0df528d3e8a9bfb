//! Currency rate cache (C11): layered memory/file TTL cache with negative
//! caching, single-flight de-duplication, and a failure circuit breaker
//! (§4.11). Goal: minimise provider calls, survive outages.

mod provider;
mod store;

pub use provider::{CoinMarketCapProvider, ProviderError, RateProvider};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use domain::ExchangeRate;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OnceCell};
use tracing::warn;

#[derive(Debug, Clone)]
pub struct RateCacheConfig {
    pub base_ttl: Duration,
    pub ttl_jitter: f64,
    pub negative_ttl: Duration,
    pub cb_failure_threshold: u32,
    pub cb_open_window: Duration,
    pub cache_file: PathBuf,
    pub default_base: String,
    pub default_quote: String,
}

impl Default for RateCacheConfig {
    fn default() -> Self {
        RateCacheConfig {
            base_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.10,
            negative_ttl: Duration::from_secs(120),
            cb_failure_threshold: 3,
            cb_open_window: Duration::from_millis(30_000),
            cache_file: PathBuf::from("cache/currency_rates.json"),
            default_base: "BTC".to_string(),
            default_quote: "USD".to_string(),
        }
    }
}

#[derive(Debug, Error, Clone)]
pub enum RateCacheError {
    #[error("rate unavailable for {base}/{quote}: {message}")]
    Unavailable {
        base: String,
        quote: String,
        message: String,
    },
    #[error("circuit open for {base}/{quote}")]
    CircuitOpen { base: String, quote: String },
}

fn pair_code(base: &str, quote: &str) -> String {
    format!("{base}_{quote}")
}

#[derive(Clone)]
struct MemEntry {
    rate: ExchangeRate,
    cached_at: Instant,
}

#[derive(Clone)]
struct NegativeMemEntry {
    error_message: String,
    status_code: Option<u16>,
    cached_at: Instant,
    ttl: Duration,
}

#[derive(Clone, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

#[derive(Serialize, Deserialize, Clone)]
struct FileNegative {
    error_message: String,
    status_code: Option<u16>,
    cached_at: chrono::DateTime<Utc>,
    ttl_seconds: u64,
}

type SingleFlightMap = Mutex<HashMap<String, Arc<OnceCell<Result<ExchangeRate, RateCacheError>>>>>;

pub struct RateCache {
    config: RateCacheConfig,
    provider: Arc<dyn RateProvider>,
    memory: Mutex<HashMap<String, MemEntry>>,
    negative_memory: Mutex<HashMap<String, NegativeMemEntry>>,
    circuit: Mutex<HashMap<String, CircuitState>>,
    inflight: SingleFlightMap,
    file_write_lock: Mutex<()>,
}

impl RateCache {
    pub fn new(config: RateCacheConfig, provider: Arc<dyn RateProvider>) -> Self {
        RateCache {
            config,
            provider,
            memory: Mutex::new(HashMap::new()),
            negative_memory: Mutex::new(HashMap::new()),
            circuit: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            file_write_lock: Mutex::new(()),
        }
    }

    /// `effectiveTTL = max(1, floor(baseTTL * uniform(1-jitter, 1+jitter)))`
    /// (§4.11) — computed fresh per call to spread refreshes out in time.
    fn effective_ttl(&self) -> Duration {
        let jitter = self.config.ttl_jitter.clamp(0.0, 0.5);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        let secs = (self.config.base_ttl.as_secs_f64() * factor).floor().max(1.0);
        Duration::from_secs_f64(secs)
    }

    pub async fn get_pair(&self, base: Option<&str>, quote: Option<&str>) -> Result<ExchangeRate, RateCacheError> {
        let base = base.unwrap_or(&self.config.default_base).to_string();
        let quote = quote.unwrap_or(&self.config.default_quote).to_string();
        self.get_rate(&base, &quote).await
    }

    /// Convenience wrapper matching §7's "getUsdRate helper downgrades to 0":
    /// never errors, returns `0` when no rate can be obtained so callers can
    /// unconditionally skip USD enrichment.
    pub async fn get_usd_rate_or_zero(&self, base: &str) -> Decimal {
        match self.get_rate(base, "USD").await {
            Ok(rate) => Decimal::try_from(rate.rate).unwrap_or(Decimal::ZERO),
            Err(_) => Decimal::ZERO,
        }
    }

    pub async fn ping(&self) -> Result<(), ProviderError> {
        self.provider.ping().await
    }

    /// The full §4.11 `getRate` algorithm.
    pub async fn get_rate(&self, base: &str, quote: &str) -> Result<ExchangeRate, RateCacheError> {
        let code = pair_code(base, quote);

        if let Some(rate) = self.fresh_memory(&code).await {
            return Ok(rate);
        }
        if let Some(rate) = self.fresh_file(&code).await {
            return Ok(rate);
        }
        if let Some(negative) = self.active_negative(&code).await {
            if let Some(stale) = self.stale_file_entry(base, quote).await {
                return Ok(stale);
            }
            return Err(RateCacheError::Unavailable {
                base: base.to_string(),
                quote: quote.to_string(),
                message: negative.error_message,
            });
        }
        if self.circuit_is_open(&code).await {
            if let Some(stale) = self.stale_file_entry(base, quote).await {
                return Ok(stale);
            }
            return Err(RateCacheError::CircuitOpen {
                base: base.to_string(),
                quote: quote.to_string(),
            });
        }

        self.fetch_single_flight(base, quote, &code).await
    }

    async fn fresh_memory(&self, code: &str) -> Option<ExchangeRate> {
        let memory = self.memory.lock().await;
        let entry = memory.get(code)?;
        if entry.cached_at.elapsed() <= self.effective_ttl() {
            Some(entry.rate.clone())
        } else {
            None
        }
    }

    async fn fresh_file(&self, code: &str) -> Option<ExchangeRate> {
        let entry = self.file_entry(code)?;
        let age = Utc::now().signed_duration_since(entry.cached_at);
        if age.num_seconds() >= 0 && (age.num_seconds() as u64) <= self.effective_ttl().as_secs() {
            self.memory.lock().await.insert(
                code.to_string(),
                MemEntry {
                    rate: entry.clone(),
                    cached_at: Instant::now(),
                },
            );
            Some(entry)
        } else {
            None
        }
    }

    fn file_entry(&self, code: &str) -> Option<ExchangeRate> {
        let root = store::read(&self.config.cache_file);
        root.pointer(&format!("/{}/{}", self.provider.name(), code))
            .and_then(|v| serde_json::from_value::<ExchangeRate>(v.clone()).ok())
    }

    async fn stale_file_entry(&self, base: &str, quote: &str) -> Option<ExchangeRate> {
        self.file_entry(&pair_code(base, quote))
    }

    async fn active_negative(&self, code: &str) -> Option<NegativeMemEntry> {
        let negatives = self.negative_memory.lock().await;
        let entry = negatives.get(code)?;
        if entry.cached_at.elapsed() <= entry.ttl {
            Some(entry.clone())
        } else {
            None
        }
    }

    async fn circuit_is_open(&self, code: &str) -> bool {
        let circuit = self.circuit.lock().await;
        match circuit.get(code) {
            Some(state) => state.open_until.map(|until| Instant::now() < until).unwrap_or(false),
            None => false,
        }
    }

    async fn fetch_single_flight(
        &self,
        base: &str,
        quote: &str,
        code: &str,
    ) -> Result<ExchangeRate, RateCacheError> {
        let cell = {
            let mut inflight = self.inflight.lock().await;
            inflight
                .entry(code.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| async { self.fetch_and_record(base, quote, code).await })
            .await
            .clone();

        let mut inflight = self.inflight.lock().await;
        if let Some(current) = inflight.get(code) {
            if Arc::ptr_eq(current, &cell) {
                inflight.remove(code);
            }
        }
        result
    }

    async fn fetch_and_record(
        &self,
        base: &str,
        quote: &str,
        code: &str,
    ) -> Result<ExchangeRate, RateCacheError> {
        match self.provider.fetch(base, quote).await {
            Ok(rate) => {
                self.circuit.lock().await.remove(code);
                self.negative_memory.lock().await.remove(code);
                self.memory.lock().await.insert(
                    code.to_string(),
                    MemEntry {
                        rate: rate.clone(),
                        cached_at: Instant::now(),
                    },
                );
                self.persist(&rate).await;
                Ok(rate)
            }
            Err(err) => {
                let message = err.to_string();
                self.negative_memory.lock().await.insert(
                    code.to_string(),
                    NegativeMemEntry {
                        error_message: message.clone(),
                        status_code: None,
                        cached_at: Instant::now(),
                        ttl: self.config.negative_ttl,
                    },
                );
                self.persist_negative(code, &message).await;

                let open = self.record_failure(code).await;
                if open {
                    warn!(target: "ratecache", pair = %code, "rate_cache.circuit_opened");
                }

                if let Some(stale) = self.stale_file_entry(base, quote).await {
                    return Ok(stale);
                }
                Err(RateCacheError::Unavailable {
                    base: base.to_string(),
                    quote: quote.to_string(),
                    message,
                })
            }
        }
    }

    /// Returns `true` if this failure opened the circuit.
    async fn record_failure(&self, code: &str) -> bool {
        let mut circuit = self.circuit.lock().await;
        let state = circuit.entry(code.to_string()).or_default();
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.config.cb_failure_threshold {
            state.open_until = Some(Instant::now() + self.config.cb_open_window);
            state.consecutive_failures = 0;
            true
        } else {
            false
        }
    }

    async fn persist(&self, rate: &ExchangeRate) {
        let _guard = self.file_write_lock.lock().await;
        let mut root = store::read(&self.config.cache_file);
        let provider_key = self.provider.name().to_string();
        let code = pair_code(&rate.base, &rate.quote);
        let entry = root
            .as_object_mut()
            .expect("cache root is an object")
            .entry(provider_key)
            .or_insert_with(|| serde_json::json!({}));
        entry[code] = serde_json::to_value(rate).expect("exchange rate serializes");
        if let Err(err) = store::write(&self.config.cache_file, &root) {
            warn!(target: "ratecache", error = %err, "rate_cache.persist_failed");
        }
    }

    async fn persist_negative(&self, code: &str, message: &str) {
        let _guard = self.file_write_lock.lock().await;
        let mut root = store::read(&self.config.cache_file);
        let provider_key = self.provider.name().to_string();
        let negative = FileNegative {
            error_message: message.to_string(),
            status_code: None,
            cached_at: Utc::now(),
            ttl_seconds: self.config.negative_ttl.as_secs(),
        };
        let entry = root
            .as_object_mut()
            .expect("cache root is an object")
            .entry(provider_key)
            .or_insert_with(|| serde_json::json!({}));
        entry["_negatives"][code] = serde_json::to_value(&negative).expect("negative entry serializes");
        if let Err(err) = store::write(&self.config.cache_file, &root) {
            warn!(target: "ratecache", error = %err, "rate_cache.persist_failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyProvider {
        calls: AtomicU32,
        fail_first_n: u32,
    }

    #[async_trait]
    impl RateProvider for FlakyProvider {
        fn name(&self) -> &str {
            "flaky"
        }
        async fn fetch(&self, base: &str, quote: &str) -> Result<ExchangeRate, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first_n {
                Err(ProviderError::Http {
                    status: Some(503),
                    message: "unavailable".to_string(),
                })
            } else {
                Ok(ExchangeRate {
                    base: base.to_string(),
                    quote: quote.to_string(),
                    rate: 50000.0,
                    time: Utc::now(),
                    source: "flaky".to_string(),
                    cached_at: Utc::now(),
                })
            }
        }
        async fn ping(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn cache_with(provider: FlakyProvider, dir: &tempfile::TempDir) -> RateCache {
        let mut config = RateCacheConfig::default();
        config.cache_file = dir.path().join("currency_rates.json");
        config.cb_failure_threshold = 3;
        config.negative_ttl = Duration::from_millis(50);
        config.cb_open_window = Duration::from_millis(200);
        RateCache::new(config, Arc::new(provider))
    }

    #[tokio::test]
    async fn successful_fetch_is_cached_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = cache_with(FlakyProvider { calls: AtomicU32::new(0), fail_first_n: 0 }, &dir);
        let rate = cache.get_rate("BTC", "USD").await.unwrap();
        assert_eq!(rate.rate, 50000.0);
        assert!(dir.path().join("currency_rates.json").exists());
    }

    /// S5: after enough consecutive failures, the circuit opens and returns
    /// the stale file entry without contacting the provider again.
    #[tokio::test]
    async fn circuit_opens_after_threshold_failures_and_serves_stale() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FlakyProvider { calls: AtomicU32::new(0), fail_first_n: 100 };
        let cache = cache_with(provider, &dir);

        // seed a stale file entry from a prior success.
        let stale = ExchangeRate {
            base: "BTC".to_string(),
            quote: "USD".to_string(),
            rate: 40000.0,
            time: Utc::now(),
            source: "flaky".to_string(),
            cached_at: Utc::now() - chrono::Duration::hours(5),
        };
        cache.persist(&stale).await;

        for _ in 0..3 {
            let _ = cache.get_rate("BTC", "USD").await;
        }
        // circuit should now be open; next call is served from the stale
        // file entry without another provider round-trip.
        let result = cache.get_rate("BTC", "USD").await.unwrap();
        assert_eq!(result.rate, 40000.0);
    }

    #[tokio::test]
    async fn get_usd_rate_or_zero_downgrades_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FlakyProvider { calls: AtomicU32::new(0), fail_first_n: 100 };
        let cache = cache_with(provider, &dir);
        let rate = cache.get_usd_rate_or_zero("BTC").await;
        assert_eq!(rate, Decimal::ZERO);
    }
}
