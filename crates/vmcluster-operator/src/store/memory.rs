//! In-memory [`ResourceStore`] with versioned writes and watch notifications.
//!
//! Besides the store contract it plays the platform's part for tests: it
//! assigns uids, generations and resource versions, defaults a few fields the
//! way an API server would, simulates rollout progress and cascades cluster
//! deletion to owned objects.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DeploymentStatus, StatefulSetStatus};
use serde_json::Value;
use tracing::debug;

use super::{EventBus, Notification, ObjectKey, ResourceStore, Workload, WorkloadKind};
use crate::crds::cluster::{VMCluster, VMClusterStatus};
use crate::error::{OperatorError, Result};

/// Store operations, for fault injection and the write log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreOp {
    GetCluster,
    UpdateStatus,
    GetWorkload,
    CreateWorkload,
    UpdateWorkload,
}

/// Failure injected into the next matching operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Connection refused, 5xx and friends.
    Unavailable,
    /// Stale resource version.
    Conflict,
    /// Object rejected by validation (HTTP 422).
    Invalid,
}

impl Fault {
    fn into_error(self, op: StoreOp) -> OperatorError {
        match self {
            Fault::Unavailable => OperatorError::Store(format!("injected failure on {op:?}")),
            Fault::Conflict => OperatorError::Conflict(format!("injected conflict on {op:?}")),
            Fault::Invalid => OperatorError::Invalid(format!("injected rejection on {op:?}")),
        }
    }
}

/// A successful write, in the order it happened.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    pub op: StoreOp,
    pub kind: Option<WorkloadKind>,
    pub key: ObjectKey,
}

#[derive(Default)]
struct Inner {
    version: u64,
    uid: u64,
    clusters: BTreeMap<ObjectKey, VMCluster>,
    workloads: BTreeMap<(WorkloadKind, ObjectKey), Workload>,
    writes: Vec<WriteRecord>,
    cluster_reads: usize,
    faults: VecDeque<(StoreOp, Fault)>,
}

impl Inner {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn next_uid(&mut self) -> String {
        self.uid += 1;
        format!("00000000-0000-0000-0000-{:012}", self.uid)
    }

    fn take_fault(&mut self, op: StoreOp) -> Result<()> {
        match self.faults.iter().position(|(o, _)| *o == op) {
            Some(idx) => match self.faults.remove(idx) {
                Some((_, fault)) => Err(fault.into_error(op)),
                None => Ok(()),
            },
            None => Ok(()),
        }
    }

    fn record(&mut self, op: StoreOp, kind: Option<WorkloadKind>, key: ObjectKey) {
        self.writes.push(WriteRecord { op, kind, key });
    }
}

/// Versioned in-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    inner: Mutex<Inner>,
    bus: Option<EventBus>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes every change onto `bus`.
    pub fn with_events(bus: EventBus) -> Self {
        Self {
            inner: Mutex::default(),
            bus: Some(bus),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, notification: Notification) {
        if let Some(bus) = &self.bus {
            bus.publish(notification);
        }
    }

    /// Create or edit a cluster the way a user would.
    ///
    /// Spec changes bump the generation; the status subtree of an existing
    /// cluster is kept.
    pub fn apply_cluster(&self, mut cluster: VMCluster) -> VMCluster {
        if cluster.metadata.namespace.is_none() {
            cluster.metadata.namespace = Some("default".into());
        }
        let key = cluster.key();

        let stored = {
            let mut inner = self.lock();
            match inner.clusters.get(&key).cloned() {
                Some(existing) => {
                    let generation = existing.metadata.generation.unwrap_or(1);
                    cluster.metadata.uid = existing.metadata.uid.clone();
                    cluster.metadata.generation = Some(if existing.spec != cluster.spec {
                        generation + 1
                    } else {
                        generation
                    });
                    cluster.status = existing.status.clone();
                }
                None => {
                    cluster.metadata.uid = Some(inner.next_uid());
                    cluster.metadata.generation = Some(1);
                }
            }
            cluster.metadata.resource_version = Some(inner.next_version());
            inner.clusters.insert(key, cluster.clone());
            cluster
        };

        self.publish(Notification::cluster(&stored, false));
        stored
    }

    /// Delete a cluster and, like the platform's garbage collector, every
    /// object it controls.
    pub fn delete_cluster(&self, key: &ObjectKey) -> bool {
        let (cluster, removed) = {
            let mut inner = self.lock();
            let Some(cluster) = inner.clusters.remove(key) else {
                return false;
            };
            let uid = cluster.metadata.uid.clone().unwrap_or_default();
            let owned: Vec<_> = inner
                .workloads
                .iter()
                .filter(|(_, w)| w.controller_owner().is_some_and(|o| o.uid == uid))
                .map(|(k, _)| k.clone())
                .collect();
            let removed: Vec<Workload> = owned
                .iter()
                .filter_map(|k| inner.workloads.remove(k))
                .collect();
            (cluster, removed)
        };

        debug!(cluster = %key, cascaded = removed.len(), "deleted cluster");
        self.publish(Notification::cluster(&cluster, true));
        for obj in &removed {
            self.publish(Notification::workload(obj, true));
        }
        true
    }

    /// Delete a single workload out of band.
    pub fn delete_workload(&self, kind: WorkloadKind, key: &ObjectKey) -> bool {
        let removed = self.lock().workloads.remove(&(kind, key.clone()));
        match removed {
            Some(obj) => {
                self.publish(Notification::workload(&obj, true));
                true
            }
            None => false,
        }
    }

    /// Rewrite a live workload the way the platform does, for example when
    /// it normalizes quantities. The generation is left alone.
    pub fn rewrite_workload<F>(&self, kind: WorkloadKind, key: &ObjectKey, edit: F) -> bool
    where
        F: FnOnce(&mut Workload),
    {
        let updated = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let Some(obj) = inner.workloads.get_mut(&(kind, key.clone())) else {
                return false;
            };
            edit(obj);
            obj.metadata_mut().resource_version = Some(version);
            obj.clone()
        };

        self.publish(Notification::workload(&updated, false));
        true
    }

    /// Number of `get_cluster` calls that reached the store.
    pub fn cluster_reads(&self) -> usize {
        self.lock().cluster_reads
    }

    /// Current cluster, without going through fault injection.
    pub fn cluster(&self, key: &ObjectKey) -> Option<VMCluster> {
        self.lock().clusters.get(key).cloned()
    }

    pub fn workload(&self, kind: WorkloadKind, key: &ObjectKey) -> Option<Workload> {
        self.lock().workloads.get(&(kind, key.clone())).cloned()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.lock().workloads.values().cloned().collect()
    }

    /// Every successful write since creation or the last [`clear_writes`](Self::clear_writes).
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }

    /// Fail the next `op` with `fault`. Faults queue up in order.
    pub fn inject_fault(&self, op: StoreOp, fault: Fault) {
        self.lock().faults.push_back((op, fault));
    }

    /// Simulate rollout progress: `ready` pods are up and the controller has
    /// observed the current generation.
    pub fn set_ready_replicas(&self, kind: WorkloadKind, key: &ObjectKey, ready: i32) -> bool {
        let updated = {
            let mut inner = self.lock();
            let version = inner.next_version();
            let Some(obj) = inner.workloads.get_mut(&(kind, key.clone())) else {
                return false;
            };
            let generation = obj.metadata().generation;
            match obj {
                Workload::StatefulSet(sts) => {
                    let replicas = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    sts.status = Some(StatefulSetStatus {
                        replicas,
                        ready_replicas: Some(ready),
                        current_replicas: Some(ready),
                        updated_replicas: Some(ready),
                        observed_generation: generation,
                        ..Default::default()
                    });
                }
                Workload::Deployment(deploy) => {
                    let replicas = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                    deploy.status = Some(DeploymentStatus {
                        replicas: Some(replicas),
                        ready_replicas: Some(ready),
                        available_replicas: Some(ready),
                        updated_replicas: Some(ready),
                        observed_generation: generation,
                        ..Default::default()
                    });
                }
                Workload::Service(_) => {}
            }
            obj.metadata_mut().resource_version = Some(version);
            obj.clone()
        };

        self.publish(Notification::workload(&updated, false));
        true
    }

    /// Roll out one workload completely.
    pub fn mark_ready(&self, kind: WorkloadKind, key: &ObjectKey) -> bool {
        let desired = match self.workload(kind, key) {
            Some(Workload::StatefulSet(sts)) => sts.spec.and_then(|s| s.replicas).unwrap_or(1),
            Some(Workload::Deployment(d)) => d.spec.and_then(|s| s.replicas).unwrap_or(1),
            Some(Workload::Service(_)) => return true,
            None => return false,
        };
        self.set_ready_replicas(kind, key, desired)
    }

    /// Roll out every workload in the store completely.
    pub fn mark_all_ready(&self) {
        let keys: Vec<_> = self.lock().workloads.keys().cloned().collect();
        for (kind, key) in keys {
            self.mark_ready(kind, &key);
        }
    }
}

/// Fields an API server fills in on write.
fn apply_platform_defaults(obj: &mut Workload, ordinal: u64) {
    match obj {
        Workload::StatefulSet(sts) => {
            if let Some(spec) = sts.spec.as_mut() {
                spec.revision_history_limit.get_or_insert(10);
                spec.replicas.get_or_insert(1);
            }
        }
        Workload::Deployment(deploy) => {
            if let Some(spec) = deploy.spec.as_mut() {
                spec.progress_deadline_seconds.get_or_insert(600);
                spec.revision_history_limit.get_or_insert(10);
                spec.replicas.get_or_insert(1);
            }
        }
        Workload::Service(svc) => {
            if let Some(spec) = svc.spec.as_mut() {
                spec.session_affinity.get_or_insert_with(|| "None".into());
                spec.cluster_ip
                    .get_or_insert_with(|| format!("10.96.{}.{}", ordinal / 250, ordinal % 250 + 1));
            }
        }
    }
}

fn spec_of(obj: &Workload) -> Option<Value> {
    obj.to_value().ok().map(|v| v["spec"].clone())
}

fn carry_status(target: &mut Workload, source: Option<&Workload>) {
    match (target, source) {
        (Workload::StatefulSet(t), Some(Workload::StatefulSet(s))) => t.status = s.status.clone(),
        (Workload::Deployment(t), Some(Workload::Deployment(s))) => t.status = s.status.clone(),
        (Workload::Service(t), Some(Workload::Service(s))) => t.status = s.status.clone(),
        (Workload::StatefulSet(t), _) => t.status = None,
        (Workload::Deployment(t), _) => t.status = None,
        (Workload::Service(t), _) => t.status = None,
    }
}

#[async_trait]
impl ResourceStore for InMemoryStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<VMCluster>> {
        let mut inner = self.lock();
        inner.cluster_reads += 1;
        inner.take_fault(StoreOp::GetCluster)?;
        Ok(inner.clusters.get(key).cloned())
    }

    async fn update_cluster_status(
        &self,
        cluster: &VMCluster,
        status: &VMClusterStatus,
    ) -> Result<VMCluster> {
        let key = cluster.key();
        let updated = {
            let mut inner = self.lock();
            inner.take_fault(StoreOp::UpdateStatus)?;
            let version = inner.next_version();
            let stored = inner
                .clusters
                .get_mut(&key)
                .ok_or_else(|| OperatorError::NotFound(format!("vmcluster {key}")))?;
            if stored.metadata.resource_version != cluster.metadata.resource_version {
                return Err(OperatorError::Conflict(format!(
                    "vmcluster {key} was modified (have {:?}, got {:?})",
                    stored.metadata.resource_version, cluster.metadata.resource_version
                )));
            }
            stored.status = Some(status.clone());
            stored.metadata.resource_version = Some(version);
            let updated = stored.clone();
            inner.record(StoreOp::UpdateStatus, None, key);
            updated
        };

        self.publish(Notification::cluster(&updated, false));
        Ok(updated)
    }

    async fn get_workload(&self, kind: WorkloadKind, key: &ObjectKey) -> Result<Option<Workload>> {
        let mut inner = self.lock();
        inner.take_fault(StoreOp::GetWorkload)?;
        Ok(inner.workloads.get(&(kind, key.clone())).cloned())
    }

    async fn create_workload(&self, obj: &Workload) -> Result<Workload> {
        let kind = obj.kind();
        let key = obj.key();
        let created = {
            let mut inner = self.lock();
            inner.take_fault(StoreOp::CreateWorkload)?;
            if inner.workloads.contains_key(&(kind, key.clone())) {
                return Err(OperatorError::Conflict(format!("{kind} {key} already exists")));
            }

            let mut created = obj.clone();
            let version = inner.next_version();
            let uid = inner.next_uid();
            let meta = created.metadata_mut();
            meta.uid = Some(uid);
            meta.generation = Some(1);
            meta.resource_version = Some(version);
            carry_status(&mut created, None);
            apply_platform_defaults(&mut created, inner.uid);

            inner.workloads.insert((kind, key.clone()), created.clone());
            inner.record(StoreOp::CreateWorkload, Some(kind), key);
            created
        };

        self.publish(Notification::workload(&created, false));
        Ok(created)
    }

    async fn update_workload(&self, obj: &Workload) -> Result<Workload> {
        let kind = obj.kind();
        let key = obj.key();
        let updated = {
            let mut inner = self.lock();
            inner.take_fault(StoreOp::UpdateWorkload)?;
            let existing = inner
                .workloads
                .get(&(kind, key.clone()))
                .cloned()
                .ok_or_else(|| OperatorError::NotFound(format!("{kind} {key}")))?;
            if existing.metadata().resource_version != obj.metadata().resource_version {
                return Err(OperatorError::Conflict(format!(
                    "{kind} {key} was modified (have {:?}, got {:?})",
                    existing.metadata().resource_version,
                    obj.metadata().resource_version
                )));
            }

            let mut updated = obj.clone();
            carry_status(&mut updated, Some(&existing));
            apply_platform_defaults(&mut updated, inner.uid);

            let generation = existing.metadata().generation.unwrap_or(1);
            let bump = spec_of(&existing) != spec_of(&updated);
            let version = inner.next_version();
            let meta = updated.metadata_mut();
            meta.uid = existing.metadata().uid.clone();
            meta.generation = Some(if bump { generation + 1 } else { generation });
            meta.resource_version = Some(version);

            inner.workloads.insert((kind, key.clone()), updated.clone());
            inner.record(StoreOp::UpdateWorkload, Some(kind), key);
            updated
        };

        debug!(kind = %kind, name = %updated.key(), generation = ?updated.metadata().generation, "stored update");
        self.publish(Notification::workload(&updated, false));
        Ok(updated)
    }
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("InMemoryStore")
            .field("clusters", &inner.clusters.keys().map(ToString::to_string).collect::<Vec<_>>())
            .field("workloads", &inner.workloads.len())
            .field("version", &inner.version)
            .finish()
    }
}
