//! Sinks (§6 "Outbound: Sinks", §4.14): the notification fan-out targets
//! `AddressActivityFound` events are dispatched to. Built-in kinds are
//! `stdout`, `file`, `webhook`, plus stubbed `kafka`/`nats` extension
//! points.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{AddressActivity, Direction};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

#[derive(Debug, Error, Clone)]
pub enum SinkError {
    #[error("sink {kind} failed: {message}")]
    Failed { kind: String, message: String },
}

#[derive(Debug, Clone)]
pub struct SinkOutcome {
    pub ok: bool,
    pub error: Option<String>,
}

impl SinkOutcome {
    pub fn ok() -> Self {
        SinkOutcome { ok: true, error: None }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        SinkOutcome {
            ok: false,
            error: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Sink: Send + Sync {
    fn kind(&self) -> &str;
    async fn send(&self, activity: &AddressActivity) -> Result<SinkOutcome, SinkError>;
}

fn signed(value: Decimal, direction: Direction) -> Decimal {
    match direction {
        Direction::In => value,
        Direction::Out => -value,
    }
}

#[derive(Serialize)]
struct ActivityLine<'a> {
    address: &'a str,
    label: &'a Option<String>,
    txid: &'a str,
    direction: Direction,
    diff_btc: Decimal,
    diff_usd: Option<Decimal>,
    op_return_hex: &'a Option<String>,
    op_return_utf8: &'a Option<String>,
}

fn activity_line(activity: &AddressActivity) -> ActivityLine<'_> {
    ActivityLine {
        address: &activity.address,
        label: &activity.label,
        txid: &activity.txid,
        direction: activity.direction,
        diff_btc: signed(activity.value_btc, activity.direction),
        diff_usd: activity.value_usd.map(|v| signed(v, activity.direction)),
        op_return_hex: &activity.op_return_hex,
        op_return_utf8: &activity.op_return_utf8,
    }
}

/// Writes one structured JSON line per activity to stdout.
pub struct StdoutSink;

#[async_trait]
impl Sink for StdoutSink {
    fn kind(&self) -> &str {
        "stdout"
    }

    async fn send(&self, activity: &AddressActivity) -> Result<SinkOutcome, SinkError> {
        let line = serde_json::to_string(&activity_line(activity)).map_err(|e| SinkError::Failed {
            kind: self.kind().to_string(),
            message: e.to_string(),
        })?;
        println!("{line}");
        Ok(SinkOutcome::ok())
    }
}

/// Appends newline-delimited JSON to a configured file, serializing
/// concurrent writers through a mutex around the open handle.
pub struct FileSink {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    async fn open(&self) -> std::io::Result<tokio::fs::File> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
    }
}

#[async_trait]
impl Sink for FileSink {
    fn kind(&self) -> &str {
        "file"
    }

    async fn send(&self, activity: &AddressActivity) -> Result<SinkOutcome, SinkError> {
        let mut guard = self.file.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await.map_err(|e| SinkError::Failed {
                kind: self.kind().to_string(),
                message: e.to_string(),
            })?);
        }
        let file = guard.as_mut().unwrap();
        let mut line = serde_json::to_string(&activity_line(activity)).map_err(|e| SinkError::Failed {
            kind: self.kind().to_string(),
            message: e.to_string(),
        })?;
        line.push('\n');
        file.write_all(line.as_bytes()).await.map_err(|e| SinkError::Failed {
            kind: self.kind().to_string(),
            message: e.to_string(),
        })?;
        Ok(SinkOutcome::ok())
    }
}

/// POSTs each activity as JSON, retrying on 5xx responses or network
/// errors with `min(2000, 250*n) ms` backoff (§6).
pub struct WebhookSink {
    client: Client,
    url: String,
    headers: Vec<(String, String)>,
    max_retries: u32,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, headers: Vec<(String, String)>, max_retries: u32) -> Self {
        WebhookSink {
            client: Client::new(),
            url: url.into(),
            headers,
            max_retries,
        }
    }

    fn backoff(attempt: u32) -> Duration {
        Duration::from_millis((250 * attempt as u64).min(2000))
    }
}

#[async_trait]
impl Sink for WebhookSink {
    fn kind(&self) -> &str {
        "webhook"
    }

    async fn send(&self, activity: &AddressActivity) -> Result<SinkOutcome, SinkError> {
        let body = activity_line_value(activity);
        let mut last_error = String::new();

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(Self::backoff(attempt)).await;
            }
            let mut req = self.client.post(&self.url).json(&body);
            for (k, v) in &self.headers {
                req = req.header(k, v);
            }
            match req.send().await {
                Ok(resp) if resp.status().is_success() => return Ok(SinkOutcome::ok()),
                Ok(resp) if resp.status().is_server_error() => {
                    last_error = format!("HTTP {}", resp.status());
                }
                Ok(resp) => {
                    return Ok(SinkOutcome::failed(format!("HTTP {}", resp.status())));
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }
        Ok(SinkOutcome::failed(last_error))
    }
}

fn activity_line_value(activity: &AddressActivity) -> serde_json::Value {
    serde_json::to_value(activity_line(activity)).expect("activity line serializes")
}

/// Stub: logs `sink.unavailable` and reports success, exactly as specified;
/// a real client is a documented extension point.
pub struct KafkaSink {
    pub brokers: String,
    pub topic: String,
}

#[async_trait]
impl Sink for KafkaSink {
    fn kind(&self) -> &str {
        "kafka"
    }

    async fn send(&self, _activity: &AddressActivity) -> Result<SinkOutcome, SinkError> {
        warn!(target: "sinks", brokers = %self.brokers, topic = %self.topic, "sink.unavailable");
        Ok(SinkOutcome::ok())
    }
}

pub struct NatsSink {
    pub url: String,
    pub subject: String,
}

#[async_trait]
impl Sink for NatsSink {
    fn kind(&self) -> &str {
        "nats"
    }

    async fn send(&self, _activity: &AddressActivity) -> Result<SinkOutcome, SinkError> {
        warn!(target: "sinks", url = %self.url, subject = %self.subject, "sink.unavailable");
        Ok(SinkOutcome::ok())
    }
}

/// The configured set of enabled sinks (`SINKS_ENABLED`, §6), dispatched
/// concurrently, tolerating partial failure (§7 "Sink delivery error").
pub struct SinkRegistry {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new(sinks: Vec<Box<dyn Sink>>) -> Self {
        SinkRegistry {
            sinks: sinks.into_iter().map(Arc::from).collect(),
        }
    }

    /// Ordered kinds, as configured.
    pub fn enabled_kinds(&self) -> Vec<&str> {
        self.sinks.iter().map(|s| s.kind()).collect()
    }

    /// The first enabled sink kind, or `"stdout"` if none are configured
    /// (§9 Open Question: current behavior reflects the first sink only).
    pub fn primary_channel(&self) -> &str {
        self.sinks.first().map(|s| s.kind()).unwrap_or("stdout")
    }

    /// Spawn each sink's `send` as its own task and join all of them, so a
    /// slow `WebhookSink` round-trip never blocks the next sink from
    /// starting (mirrors `eventbus::deliver_to_all`'s per-subscription
    /// `tokio::spawn`). Any individual failure is tolerated.
    pub async fn dispatch_all(&self, activity: &AddressActivity) -> Vec<(String, SinkOutcome)> {
        let mut handles = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            let sink = sink.clone();
            let activity = activity.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match sink.send(&activity).await {
                    Ok(outcome) => outcome,
                    Err(e) => SinkOutcome::failed(e.to_string()),
                };
                (sink.kind().to_string(), outcome)
            }));
        }
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => out.push(result),
                Err(e) => out.push(("unknown".to_string(), SinkOutcome::failed(e.to_string()))),
            }
        }
        out
    }
}
