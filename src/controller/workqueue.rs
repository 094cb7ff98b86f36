//! Work Queue
//!
//! Keys flow through a channel into a fixed set of workers. A key is
//! queued at most once; a key being processed is never handed to a second
//! worker. Adding a key while it is processing marks it dirty, and it is
//! queued again once the current pass finishes. The channel is unbounded: the
//! queued set caps it at one entry per distinct key, and `add` never waits.
//!
//! ```text
//!   watch event ──add──▶ [queued] ──get──▶ [processing] ──done──▶ (gone)
//!                                              │   ▲
//!                                   add ──▶ [dirty]│
//!                                              └───┘ requeue on done
//! ```

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use crate::error::{ErrorCategory, Result};
use crate::metrics;

// =============================================================================
// Keys
// =============================================================================

/// `namespace/name` of a queued object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse `namespace/name`.
    pub fn parse(key: &str) -> Option<Self> {
        match key.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Some(Self::new(ns, name))
            }
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures);
        self.base.saturating_mul(factor).min(self.max)
    }
}

// =============================================================================
// Queue
// =============================================================================

#[derive(Debug, Default)]
struct QueueState {
    queued: HashSet<ObjectKey>,
    processing: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
}

/// Deduplicating, rate-limited work queue.
pub struct WorkQueue {
    name: &'static str,
    tx: mpsc::UnboundedSender<ObjectKey>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ObjectKey>>,
    state: Mutex<QueueState>,
    failures: DashMap<ObjectKey, u32>,
    backoff: Backoff,
    shutdown: CancellationToken,
}

impl WorkQueue {
    pub fn new(name: &'static str, backoff: Backoff, shutdown: CancellationToken) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            name,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Mutex::new(QueueState::default()),
            failures: DashMap::new(),
            backoff,
            shutdown,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queue `key` unless it is already queued. A key being processed is
    /// marked dirty instead.
    pub fn add(&self, key: ObjectKey) {
        if self.shutdown.is_cancelled() {
            return;
        }
        {
            let mut state = self.state.lock();
            if state.queued.contains(&key) {
                return;
            }
            if state.processing.contains(&key) {
                state.dirty.insert(key);
                return;
            }
            state.queued.insert(key.clone());
        }
        metrics::QUEUE_ADDS.with_label_values(&[self.name]).inc();
        if self.tx.send(key.clone()).is_err() {
            self.state.lock().queued.remove(&key);
        }
    }

    /// Queue `key` after its backoff delay and count the failure.
    pub fn add_rate_limited(self: &Arc<Self>, key: ObjectKey) {
        let failures = {
            let mut entry = self.failures.entry(key.clone()).or_insert(0);
            let current = *entry;
            *entry = current.saturating_add(1);
            current
        };
        let delay = self.backoff.delay(failures);
        metrics::QUEUE_RETRIES.with_label_values(&[self.name]).inc();
        debug!(queue = self.name, %key, ?delay, failures, "Requeueing with backoff");
        self.add_after(key, delay);
    }

    /// Queue `key` once `delay` has passed.
    pub fn add_after(self: &Arc<Self>, key: ObjectKey, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(key),
            }
        });
    }

    /// Wait for the next key. `None` once the queue is shut down.
    pub async fn get(&self) -> Option<ObjectKey> {
        let mut rx = self.rx.lock().await;
        let key = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            key = rx.recv() => key,
        }?;
        let mut state = self.state.lock();
        state.queued.remove(&key);
        state.processing.insert(key.clone());
        Some(key)
    }

    /// Finish processing `key`, queueing it again when it went dirty.
    pub fn done(&self, key: &ObjectKey) {
        let requeue = {
            let mut state = self.state.lock();
            state.processing.remove(key);
            state.dirty.remove(key)
        };
        if requeue {
            self.add(key.clone());
        }
    }

    /// Reset the failure count of `key`.
    pub fn forget(&self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    pub fn failures(&self, key: &ObjectKey) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }

    /// Keys waiting to be processed.
    pub fn len(&self) -> usize {
        self.state.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

// =============================================================================
// Workers
// =============================================================================

/// A convergence loop driven by a work queue.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Converge the object behind `key` once.
    async fn reconcile(&self, key: &ObjectKey) -> Result<()>;
}

/// Start `workers` tasks pulling from `queue` into `reconciler`.
pub fn spawn_workers<R: Reconciler>(
    queue: Arc<WorkQueue>,
    reconciler: Arc<R>,
    workers: usize,
) -> Vec<JoinHandle<()>> {
    (0..workers.max(1))
        .map(|id| {
            let queue = Arc::clone(&queue);
            let reconciler = Arc::clone(&reconciler);
            let span = tracing::info_span!("worker", controller = reconciler.name(), id);
            tokio::spawn(worker_loop(queue, reconciler).instrument(span))
        })
        .collect()
}

async fn worker_loop<R: Reconciler>(queue: Arc<WorkQueue>, reconciler: Arc<R>) {
    debug!("Worker started");
    while let Some(key) = queue.get().await {
        process(&queue, reconciler.as_ref(), key).await;
    }
    info!("Worker stopped");
}

/// Run one pass for `key` and settle it in the queue.
pub async fn process<R: Reconciler + ?Sized>(queue: &Arc<WorkQueue>, reconciler: &R, key: ObjectKey) {
    let started = Instant::now();
    let result = reconciler.reconcile(&key).await;
    let elapsed = started.elapsed();
    metrics::RECONCILE_DURATION
        .with_label_values(&[reconciler.name()])
        .observe(elapsed.as_secs_f64());

    match result {
        Ok(()) => {
            metrics::RECONCILES
                .with_label_values(&[reconciler.name(), "success"])
                .inc();
            queue.forget(&key);
            queue.done(&key);
        }
        Err(e) => {
            let category = e.category();
            metrics::RECONCILES
                .with_label_values(&[reconciler.name(), &category.to_string()])
                .inc();
            match category {
                ErrorCategory::Invariant => error!(%key, %category, error = %e, "Reconcile failed"),
                _ => warn!(%key, %category, error = %e, "Reconcile failed"),
            }
            queue.done(&key);
            if category.should_requeue() {
                queue.add_rate_limited(key);
            } else {
                queue.forget(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn queue() -> Arc<WorkQueue> {
        WorkQueue::new(
            "test",
            Backoff {
                base: Duration::from_millis(1),
                max: Duration::from_millis(20),
            },
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_object_key_parse() {
        assert_eq!(ObjectKey::parse("openebs/c1"), Some(ObjectKey::new("openebs", "c1")));
        assert_eq!(ObjectKey::new("a", "b").to_string(), "a/b");
        assert!(ObjectKey::parse("nocolon").is_none());
        assert!(ObjectKey::parse("/x").is_none());
        assert!(ObjectKey::parse("a/b/c").is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let b = Backoff {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1),
        };
        assert_eq!(b.delay(0), Duration::from_millis(5));
        assert_eq!(b.delay(1), Duration::from_millis(10));
        assert_eq!(b.delay(3), Duration::from_millis(40));
        assert_eq!(b.delay(20), Duration::from_secs(1));
        assert_eq!(b.delay(u32::MAX), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_add_deduplicates() {
        let q = queue();
        let key = ObjectKey::new("ns", "a");
        q.add(key.clone());
        q.add(key.clone());
        assert_eq!(q.len(), 1);

        assert_eq!(q.get().await, Some(key.clone()));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_processing_key_goes_dirty_and_requeues_on_done() {
        let q = queue();
        let key = ObjectKey::new("ns", "a");
        q.add(key.clone());
        let got = q.get().await.unwrap();

        // Re-adding while in flight must not queue a second copy
        q.add(key.clone());
        assert!(q.is_empty());

        q.done(&got);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some(key));
    }

    #[tokio::test]
    async fn test_done_on_dirty_key_does_not_wait_behind_a_long_queue() {
        let q = queue();
        for i in 0..2048 {
            q.add(ObjectKey::new("ns", format!("k{}", i)));
        }
        let busy = q.get().await.unwrap();
        q.add(busy.clone());
        q.add(ObjectKey::new("ns", "late"));

        q.done(&busy);
        assert_eq!(q.len(), 2049);

        let mut seen = HashSet::new();
        while let Ok(Some(key)) =
            tokio::time::timeout(Duration::from_millis(50), q.get()).await
        {
            seen.insert(key.clone());
            q.done(&key);
        }
        assert_eq!(seen.len(), 2049);
        assert!(seen.contains(&busy));
    }

    #[tokio::test]
    async fn test_shutdown_stops_get() {
        let q = queue();
        q.shutdown();
        assert!(q.get().await.is_none());
        q.add(ObjectKey::new("ns", "late"));
        assert!(q.is_empty());
    }

    struct Flaky {
        calls: AtomicUsize,
        fail_first: usize,
        category: fn() -> Error,
    }

    #[async_trait]
    impl Reconciler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn reconcile(&self, _key: &ObjectKey) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err((self.category)())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_until_success() {
        let q = queue();
        let r = Arc::new(Flaky {
            calls: AtomicUsize::new(0),
            fail_first: 2,
            category: || Error::Conflict {
                kind: "CStorPoolCluster".into(),
                name: "c1".into(),
            },
        });
        let handles = spawn_workers(Arc::clone(&q), Arc::clone(&r), 2);
        q.add(ObjectKey::new("ns", "c1"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while r.calls.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();

        q.shutdown();
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(q.failures(&ObjectKey::new("ns", "c1")), 0);
    }

    #[tokio::test]
    async fn test_validation_failure_is_not_retried() {
        let q = queue();
        let r = Flaky {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            category: || Error::Validation("bad spec".into()),
        };
        let key = ObjectKey::new("ns", "bad");
        q.add(key.clone());
        let got = q.get().await.unwrap();
        process(&q, &r, got).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(q.is_empty());
        assert_eq!(q.failures(&key), 0);
        assert_eq!(r.calls.load(Ordering::SeqCst), 1);
    }
}
