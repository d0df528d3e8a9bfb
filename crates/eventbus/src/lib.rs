//! In-process event bus (§4.9): per-kind FIFO queues, cooperative
//! backpressure, per-subscription concurrency caps, and a retry loop that
//! never re-enqueues a failed delivery.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{DomainEvent, EventKind};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::warn;

#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError>;
}

/// A registered consumer of one event kind (§4.9).
pub struct Subscription {
    pub kind: EventKind,
    pub name: String,
    pub max_retries: u32,
    pub backoff: Arc<dyn Fn(u32) -> Duration + Send + Sync>,
    pub handler: Arc<dyn Handler>,
    concurrency: Arc<Semaphore>,
}

impl Subscription {
    pub fn new(
        kind: EventKind,
        name: impl Into<String>,
        concurrency: usize,
        max_retries: u32,
        backoff: impl Fn(u32) -> Duration + Send + Sync + 'static,
        handler: Arc<dyn Handler>,
    ) -> Self {
        Subscription {
            kind,
            name: name.into(),
            max_retries,
            backoff: Arc::new(backoff),
            handler,
            concurrency: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }
}

struct KindState {
    queue: Mutex<VecDeque<(DomainEvent, OwnedSemaphorePermit)>>,
    capacity: Arc<Semaphore>,
    subscriptions: Mutex<Vec<Arc<Subscription>>>,
    inflight: AtomicUsize,
    notify_dispatch: Notify,
    notify_drain: Notify,
}

struct Inner {
    max_queue_size: usize,
    kinds: HashMap<EventKind, Arc<KindState>>,
    stopped: AtomicBool,
    dispatchers: Mutex<Vec<JoinHandle<()>>>,
}

const ALL_KINDS: [EventKind; 5] = [
    EventKind::BlockDetected,
    EventKind::BlockParsed,
    EventKind::AddressActivityFound,
    EventKind::NotificationEmitted,
    EventKind::BlockReorg,
];

/// The per-kind queue/dispatcher/subscription bus described in §4.9.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<Inner>,
}

impl Bus {
    pub fn new(max_queue_size: usize) -> Self {
        let kinds = ALL_KINDS
            .into_iter()
            .map(|kind| {
                let state = KindState {
                    queue: Mutex::new(VecDeque::new()),
                    capacity: Arc::new(Semaphore::new(max_queue_size)),
                    subscriptions: Mutex::new(Vec::new()),
                    inflight: AtomicUsize::new(0),
                    notify_dispatch: Notify::new(),
                    notify_drain: Notify::new(),
                };
                (kind, Arc::new(state))
            })
            .collect();
        Bus {
            inner: Arc::new(Inner {
                max_queue_size,
                kinds,
                stopped: AtomicBool::new(false),
                dispatchers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub async fn subscribe(&self, subscription: Subscription) {
        let state = &self.inner.kinds[&subscription.kind];
        state.subscriptions.lock().await.push(Arc::new(subscription));
    }

    /// Spawns one dispatcher task per event kind (Design Note: explicitly
    /// started, joined on shutdown — not fire-and-forget on first publish).
    pub async fn start(&self) {
        let mut handles = self.inner.dispatchers.lock().await;
        for kind in ALL_KINDS {
            let state = self.inner.kinds[&kind].clone();
            let stopped = self.inner.clone();
            handles.push(tokio::spawn(async move {
                run_dispatcher(state, stopped).await;
            }));
        }
    }

    /// Marks the bus stopped, wakes idle dispatchers so they observe the
    /// empty+stopped condition, and joins every dispatcher task.
    pub async fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for kind in ALL_KINDS {
            self.inner.kinds[&kind].notify_dispatch.notify_waiters();
        }
        let mut handles = self.inner.dispatchers.lock().await;
        for handle in handles.drain(..) {
            let _ = handle.await;
        }
    }

    pub async fn publish(&self, event: DomainEvent) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        let kind = event.kind();
        let state = self.inner.kinds[&kind].clone();
        let permit = match state.capacity.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        state.queue.lock().await.push_back((event, permit));
        state.notify_dispatch.notify_one();
    }

    pub fn backlog_depth(&self, kind: EventKind) -> usize {
        let state = &self.inner.kinds[&kind];
        self.inner.max_queue_size - state.capacity.available_permits()
    }

    pub async fn wait_for_capacity(&self, kind: EventKind, threshold: Option<usize>) {
        let threshold = threshold.unwrap_or(self.inner.max_queue_size / 2);
        let state = self.inner.kinds[&kind].clone();
        loop {
            if self.backlog_depth(kind) <= threshold {
                return;
            }
            state.notify_drain.notified().await;
        }
    }

    pub async fn wait_until_idle(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        for kind in ALL_KINDS {
            let state = self.inner.kinds[&kind].clone();
            loop {
                if self.backlog_depth(kind) == 0 {
                    break;
                }
                state.notify_drain.notified().await;
            }
        }
    }
}

async fn run_dispatcher(state: Arc<KindState>, inner: Arc<Inner>) {
    loop {
        let item = state.queue.lock().await.pop_front();
        match item {
            Some((event, permit)) => {
                state.inflight.fetch_add(1, Ordering::SeqCst);
                let subs = state.subscriptions.lock().await.clone();
                deliver_to_all(&subs, &event).await;
                state.inflight.fetch_sub(1, Ordering::SeqCst);
                drop(permit);
                state.notify_drain.notify_waiters();
            }
            None => {
                if inner.stopped.load(Ordering::SeqCst) {
                    return;
                }
                state.notify_dispatch.notified().await;
            }
        }
    }
}

async fn deliver_to_all(subs: &[Arc<Subscription>], event: &DomainEvent) {
    if subs.is_empty() {
        return;
    }
    let mut handles = Vec::with_capacity(subs.len());
    for sub in subs {
        let sub = sub.clone();
        let event = event.clone();
        handles.push(tokio::spawn(async move {
            deliver_with_retry(&sub, event).await;
        }));
    }
    for handle in handles {
        let _ = handle.await;
    }
}

async fn deliver_with_retry(sub: &Subscription, event: DomainEvent) {
    let _permit = sub.concurrency.acquire().await.expect("subscription semaphore not closed");
    for attempt in 0..=sub.max_retries {
        match sub.handler.handle(event.clone()).await {
            Ok(()) => return,
            Err(err) => {
                if attempt == sub.max_retries {
                    warn!(
                        target: "eventbus",
                        subscription = %sub.name,
                        kind = ?sub.kind,
                        error = %err,
                        "event.handler.failed"
                    );
                    return;
                }
                tokio::time::sleep((sub.backoff)(attempt + 1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize as Counter;

    fn sample_event(height: u32) -> DomainEvent {
        DomainEvent::BlockDetected {
            height,
            hash: format!("h{height}"),
            timestamp: Utc::now(),
            dedupe_key: format!("BlockDetected:{height}"),
            event_id: None,
        }
    }

    struct CountingHandler {
        calls: Arc<Counter>,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct AlwaysFailHandler {
        calls: Arc<Counter>,
    }

    #[async_trait]
    impl Handler for AlwaysFailHandler {
        async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("boom"))
        }
    }

    #[tokio::test]
    async fn publish_without_subscribers_drains_immediately() {
        let bus = Bus::new(4);
        bus.start().await;
        bus.publish(sample_event(1)).await;
        bus.wait_for_capacity(EventKind::BlockDetected, Some(0)).await;
        assert_eq!(bus.backlog_depth(EventKind::BlockDetected), 0);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = Bus::new(4);
        let calls = Arc::new(Counter::new(0));
        bus.subscribe(Subscription::new(
            EventKind::BlockDetected,
            "counter",
            1,
            0,
            |_attempt| Duration::from_millis(0),
            Arc::new(CountingHandler { calls: calls.clone() }),
        ))
        .await;
        bus.start().await;
        bus.publish(sample_event(1)).await;
        bus.wait_for_capacity(EventKind::BlockDetected, Some(0)).await;
        bus.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_runs_initial_attempt_plus_max_retries() {
        let bus = Bus::new(10);
        let calls = Arc::new(Counter::new(0));
        bus.subscribe(Subscription::new(
            EventKind::BlockDetected,
            "always-fail",
            2,
            2,
            |_attempt| Duration::from_millis(1),
            Arc::new(AlwaysFailHandler { calls: calls.clone() }),
        ))
        .await;
        bus.start().await;
        bus.publish(sample_event(1)).await;
        bus.wait_for_capacity(EventKind::BlockDetected, Some(0)).await;
        bus.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backpressure_suspends_second_publish_until_first_drains() {
        let bus = Bus::new(1);
        let calls = Arc::new(Counter::new(0));
        struct SlowHandler {
            calls: Arc<Counter>,
        }
        #[async_trait]
        impl Handler for SlowHandler {
            async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
                tokio::time::sleep(Duration::from_millis(30)).await;
                self.calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }
        bus.subscribe(Subscription::new(
            EventKind::BlockDetected,
            "slow",
            1,
            0,
            |_attempt| Duration::from_millis(0),
            Arc::new(SlowHandler { calls: calls.clone() }),
        ))
        .await;
        bus.start().await;

        let start = tokio::time::Instant::now();
        bus.publish(sample_event(1)).await;
        bus.publish(sample_event(2)).await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(25), "elapsed={elapsed:?}");

        bus.wait_for_capacity(EventKind::BlockDetected, Some(0)).await;
        bus.shutdown().await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
