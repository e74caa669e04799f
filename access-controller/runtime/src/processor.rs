//! A single-worker event processor.
//!
//! Watches enqueue the kind and key of every resource that changes. One
//! worker pops changes off a shared queue and hands them to a [`Handler`],
//! which always reloads the current state of the resource by key. A change
//! that is already pending is coalesced, and a change that arrives while the
//! same change is being handled is queued again once the handler returns.

use crate::{
    core::ResourceKey,
    watch::{Cache, WatchSource},
    Error,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Mutex, RwLock};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge, histogram::Histogram},
    registry::{Registry, Unit},
};
use std::{collections::VecDeque, fmt, sync::Arc};
use tokio::{
    sync::{watch, Notify},
    task::JoinSet,
    time::{self, Duration, Instant},
};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);
const MAX_REQUEUES: u32 = 5;

/// The watch source a change came from.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Certificate,
    Secret,
    SecuredAccess,
    Service,
    Route,
    Ingress,
    HttpProxy,
    TlsRoute,
    Gateway,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResourceChange {
    pub kind: Kind,
    pub key: ResourceKey,
}

/// Reconciles one change at a time.
#[async_trait::async_trait]
pub trait Handler: Send {
    async fn handle(&mut self, change: &ResourceChange) -> Result<(), Error>;
}

#[derive(Clone, Debug)]
pub struct Metrics {
    queued: Family<KindLabels, Counter>,
    depth: Family<KindLabels, Gauge>,
    queue_delay: Family<KindLabels, Histogram>,
    handle_duration: Family<KindLabels, Histogram>,
    retries: Family<KindLabels, Counter>,
    failures: Family<KindLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KindLabels {
    kind: &'static str,
}

/// A handle for adding changes to the shared queue.
#[derive(Clone)]
pub struct Enqueue(Arc<Queue>);

pub struct Processor {
    queue: Arc<Queue>,
    synced: Vec<(Kind, watch::Receiver<bool>)>,
}

struct Queue {
    state: Mutex<State>,
    notify: Notify,
    metrics: Metrics,
}

#[derive(Default)]
struct State {
    queue: VecDeque<ResourceChange>,
    dirty: AHashMap<ResourceChange, Instant>,
    processing: AHashSet<ResourceChange>,
}

// === impl Kind ===

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Certificate => "Certificate",
            Self::Secret => "Secret",
            Self::SecuredAccess => "SecuredAccess",
            Self::Service => "Service",
            Self::Route => "Route",
            Self::Ingress => "Ingress",
            Self::HttpProxy => "HTTPProxy",
            Self::TlsRoute => "TLSRoute",
            Self::Gateway => "Gateway",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ResourceChange ===

impl ResourceChange {
    pub fn new(kind: Kind, key: ResourceKey) -> Self {
        Self { kind, key }
    }
}

impl fmt::Display for ResourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.key)
    }
}

// === impl Metrics ===

impl Metrics {
    pub fn register(reg: &mut Registry) -> Self {
        let queued = Family::<KindLabels, Counter>::default();
        reg.register(
            "queued",
            "The number of resource changes added to the queue",
            queued.clone(),
        );

        let depth = Family::<KindLabels, Gauge>::default();
        reg.register(
            "depth",
            "The number of resource changes waiting to be handled",
            depth.clone(),
        );

        let queue_delay = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0, 60.0])
        });
        reg.register_with_unit(
            "queue_delay",
            "Time a resource change waits in the queue before it is handled",
            Unit::Seconds,
            queue_delay.clone(),
        );

        let handle_duration = Family::<KindLabels, Histogram>::new_with_constructor(|| {
            Histogram::new([0.001, 0.01, 0.1, 1.0, 10.0])
        });
        reg.register_with_unit(
            "handle_duration",
            "Time spent handling a resource change",
            Unit::Seconds,
            handle_duration.clone(),
        );

        let retries = Family::<KindLabels, Counter>::default();
        reg.register(
            "retries",
            "The number of resource changes scheduled for retry",
            retries.clone(),
        );

        let failures = Family::<KindLabels, Counter>::default();
        reg.register(
            "failures",
            "The number of resource changes dropped after an error",
            failures.clone(),
        );

        Self {
            queued,
            depth,
            queue_delay,
            handle_duration,
            retries,
            failures,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::register(&mut Registry::default())
    }
}

fn labels(kind: Kind) -> KindLabels {
    KindLabels {
        kind: kind.as_str(),
    }
}

// === impl Enqueue ===

impl Enqueue {
    pub fn add(&self, change: ResourceChange) {
        self.0.add(change)
    }
}

impl fmt::Debug for Enqueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enqueue").finish_non_exhaustive()
    }
}

// === impl Queue ===

impl Queue {
    fn new(metrics: Metrics) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            metrics,
        }
    }

    fn add(&self, change: ResourceChange) {
        let mut state = self.state.lock();
        if state.dirty.contains_key(&change) {
            return;
        }
        self.metrics.queued.get_or_create(&labels(change.kind)).inc();
        state.dirty.insert(change.clone(), Instant::now());
        if state.processing.contains(&change) {
            return;
        }
        self.metrics.depth.get_or_create(&labels(change.kind)).inc();
        state.queue.push_back(change);
        drop(state);
        self.notify.notify_one();
    }

    async fn pop(&self) -> ResourceChange {
        loop {
            if let Some(change) = self.try_pop() {
                return change;
            }
            self.notify.notified().await;
        }
    }

    fn try_pop(&self) -> Option<ResourceChange> {
        let mut state = self.state.lock();
        let change = state.queue.pop_front()?;
        let kind = labels(change.kind);
        self.metrics.depth.get_or_create(&kind).dec();
        if let Some(added) = state.dirty.remove(&change) {
            self.metrics
                .queue_delay
                .get_or_create(&kind)
                .observe(added.elapsed().as_secs_f64());
        }
        state.processing.insert(change.clone());
        Some(change)
    }

    fn done(&self, change: &ResourceChange) {
        let mut state = self.state.lock();
        state.processing.remove(change);
        if state.dirty.contains_key(change) {
            self.metrics.depth.get_or_create(&labels(change.kind)).inc();
            state.queue.push_back(change.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.state.lock().queue.len()
    }
}

// === impl Processor ===

impl Processor {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            queue: Arc::new(Queue::new(metrics)),
            synced: Vec::new(),
        }
    }

    /// Creates a watch source that feeds the queue, along with a read handle
    /// on the resources it has observed.
    pub fn register<K>(&mut self, kind: Kind) -> (Arc<RwLock<WatchSource<K>>>, Cache<K>) {
        let (synced_tx, synced_rx) = watch::channel(false);
        let cache = Cache::new(synced_rx.clone());
        let source = WatchSource::new(kind, cache.clone(), self.enqueue(), synced_tx);
        self.synced.push((kind, synced_rx));
        (Arc::new(RwLock::new(source)), cache)
    }

    pub fn enqueue(&self) -> Enqueue {
        Enqueue(self.queue.clone())
    }

    /// Waits until every registered source has delivered its initial list.
    pub async fn wait_for_sync(&mut self) {
        for (kind, synced) in &mut self.synced {
            if synced.wait_for(|synced| *synced).await.is_err() {
                tracing::warn!(%kind, "Watch ended before it was synced");
            }
        }
        tracing::info!("Watches synced");
    }

    /// Handles changes until `shutdown` is signaled.
    pub async fn run<H: Handler>(self, mut handler: H, shutdown: drain::Watch) {
        let Self { queue, .. } = self;
        let mut requeues = AHashMap::<ResourceChange, u32>::new();
        let mut delayed = JoinSet::new();

        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        loop {
            let change = tokio::select! {
                biased;
                _release = &mut shutdown => {
                    tracing::debug!("Shutting down");
                    return;
                }
                Some(_) = delayed.join_next(), if !delayed.is_empty() => continue,
                change = queue.pop() => change,
            };

            let kind = labels(change.kind);
            let start = Instant::now();
            let result = handler.handle(&change).await;
            queue
                .metrics
                .handle_duration
                .get_or_create(&kind)
                .observe(start.elapsed().as_secs_f64());

            match result {
                Ok(()) => {
                    requeues.remove(&change);
                }
                Err(error) if error.is_retryable() => {
                    let attempts = requeues.entry(change.clone()).or_default();
                    if *attempts < MAX_REQUEUES {
                        let delay = backoff(*attempts);
                        *attempts += 1;
                        queue.metrics.retries.get_or_create(&kind).inc();
                        tracing::debug!(%change, %error, ?delay, "Retrying");
                        let queue = queue.clone();
                        let retry = change.clone();
                        delayed.spawn(async move {
                            time::sleep(delay).await;
                            queue.add(retry);
                        });
                    } else {
                        requeues.remove(&change);
                        queue.metrics.failures.get_or_create(&kind).inc();
                        tracing::error!(%change, %error, "Error while handling event");
                    }
                }
                Err(error) => {
                    requeues.remove(&change);
                    queue.metrics.failures.get_or_create(&kind).inc();
                    tracing::error!(%change, %error, "Error while handling event");
                }
            }
            queue.done(&change);
        }
    }
}

fn backoff(attempts: u32) -> Duration {
    BASE_DELAY
        .checked_mul(2u32.saturating_pow(attempts))
        .map(|d| d.min(MAX_DELAY))
        .unwrap_or(MAX_DELAY)
}
