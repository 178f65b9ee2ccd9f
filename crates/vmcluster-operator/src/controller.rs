//! Event dispatcher and worker pool for VMCluster reconciliation.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kube::Resource;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::constants::{defaults, API_GROUP};
use crate::crds::cluster::VMCluster;
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::resources::TierBuilder;
use crate::store::{EventStream, Notification, ObjectKey, ResourceStore};

/// Controller tunables.
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    pub workers: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            workers: defaults::WORKERS,
            backoff_base: Duration::from_secs(defaults::BACKOFF_BASE_SECS),
            backoff_max: Duration::from_secs(defaults::BACKOFF_MAX_SECS),
        }
    }
}

/// Per-cluster exponential retry delay.
pub struct Backoff {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<ObjectKey, u32>>,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure for `key` and return the delay before the retry.
    pub fn next_delay(&self, key: &ObjectKey) -> Duration {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let count = failures.entry(key.clone()).or_insert(0);
        let factor = 1u32.checked_shl(*count).unwrap_or(u32::MAX);
        *count = count.saturating_add(1);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }

    pub fn reset(&self, key: &ObjectKey) {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

/// Generation and labels of the last cluster notification that was routed.
type Seen = (i64, BTreeMap<String, String>);

/// Maps change notifications to the cluster that has to be reconciled.
pub struct Dispatcher {
    queue: Arc<WorkQueue<ObjectKey>>,
    seen: HashMap<ObjectKey, Seen>,
}

impl Dispatcher {
    pub fn new(queue: Arc<WorkQueue<ObjectKey>>) -> Self {
        Self {
            queue,
            seen: HashMap::new(),
        }
    }

    /// Cluster identity a notification belongs to, if any.
    ///
    /// Cluster notifications with an already seen generation and label set
    /// are dropped: status writes change neither. Label edits pass because
    /// the cluster's labels are copied onto every object it owns.
    ///
    /// Workload notifications route to their controlling owner only. A
    /// cluster that failed over an object owned by someone else is not
    /// re-queued when that object goes away; the next edit of the cluster
    /// or the next notification for one of its own objects picks it up.
    pub fn route(&mut self, notification: &Notification) -> Option<ObjectKey> {
        match notification {
            Notification::Cluster { key, deleted: true, .. } => {
                self.seen.remove(key);
                Some(key.clone())
            }
            Notification::Cluster {
                key,
                generation: Some(generation),
                labels,
                ..
            } => {
                let next = (*generation, labels.clone());
                match self.seen.insert(key.clone(), next.clone()) {
                    Some(seen) if seen == next => None,
                    _ => Some(key.clone()),
                }
            }
            Notification::Cluster { key, .. } => Some(key.clone()),
            Notification::Workload { key, owner, .. } => {
                let owner = owner.as_ref()?;
                let group = owner.api_version.split('/').next().unwrap_or_default();
                if owner.kind != VMCluster::kind(&()) || group != API_GROUP {
                    return None;
                }
                Some(ObjectKey::new(key.namespace.clone(), owner.name.clone()))
            }
        }
    }

    pub fn dispatch(&mut self, notification: Notification) {
        match self.route(&notification) {
            Some(key) => {
                debug!(cluster = %key, "enqueue");
                self.queue.enqueue(key);
            }
            None => debug!(?notification, "dropped notification"),
        }
    }
}

async fn worker<S, B>(
    id: usize,
    queue: Arc<WorkQueue<ObjectKey>>,
    reconciler: Arc<Reconciler<S, B>>,
    backoff: Arc<Backoff>,
) where
    S: ResourceStore,
    B: TierBuilder,
{
    debug!(worker = id, "worker started");
    while let Some(key) = queue.dequeue().await {
        match reconciler.reconcile(&key).await {
            Ok(action) => {
                backoff.reset(&key);
                if let Some(after) = action.requeue_after() {
                    queue.enqueue_after(key.clone(), after);
                }
            }
            Err(e) => {
                let delay = backoff.next_delay(&key);
                warn!(cluster = %key, error = %e, retry_in = ?delay, "reconcile failed");
                queue.enqueue_after(key.clone(), delay);
            }
        }
        queue.release(&key);
    }
    debug!(worker = id, "worker stopped");
}

/// Run the dispatcher and worker pool until `shutdown` resolves or the event
/// stream closes. In-flight passes finish before this returns.
pub async fn run<S, B, F>(
    reconciler: Arc<Reconciler<S, B>>,
    mut events: EventStream,
    settings: ControllerSettings,
    shutdown: F,
) where
    S: ResourceStore + 'static,
    B: TierBuilder + 'static,
    F: Future<Output = ()>,
{
    let queue = Arc::new(WorkQueue::new());
    let backoff = Arc::new(Backoff::new(settings.backoff_base, settings.backoff_max));
    let workers = settings.workers.max(1);
    info!(workers, "starting VMCluster controller");

    let mut pool = JoinSet::new();
    for id in 0..workers {
        pool.spawn(worker(id, queue.clone(), reconciler.clone(), backoff.clone()));
    }

    let mut dispatcher = Dispatcher::new(queue.clone());
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("shutdown requested");
                break;
            }
            event = events.recv() => match event {
                Some(notification) => dispatcher.dispatch(notification),
                None => {
                    warn!("event stream closed");
                    break;
                }
            },
        }
    }

    queue.shutdown();
    while let Some(joined) = pool.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker panicked");
        }
    }
    info!("controller stopped");
}
