//! Versioned object store the convergence engine reads from and writes to.
//!
//! [`ResourceStore`] is the only seam between the control loop and the
//! platform API. [`KubeStore`] talks to a real API server, [`InMemoryStore`]
//! backs tests and local runs.

pub mod kubernetes;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::crds::cluster::{VMCluster, VMClusterStatus};
use crate::error::Result;

pub use self::kubernetes::KubeStore;
pub use self::memory::InMemoryStore;

/// Namespace-qualified object name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

    /// Key of any namespaced object.
    pub fn of<K: Resource>(obj: &K) -> Self {
        Self::new(obj.namespace().unwrap_or_default(), obj.name_any())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object types produced for a cluster tier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WorkloadKind {
    StatefulSet,
    Deployment,
    Service,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::Service => "Service",
        };
        f.write_str(s)
    }
}

/// A concrete workload object owned by a cluster.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    StatefulSet(StatefulSet),
    Deployment(Deployment),
    Service(Service),
}

impl Workload {
    pub fn kind(&self) -> WorkloadKind {
        match self {
            Workload::StatefulSet(_) => WorkloadKind::StatefulSet,
            Workload::Deployment(_) => WorkloadKind::Deployment,
            Workload::Service(_) => WorkloadKind::Service,
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Workload::StatefulSet(o) => &o.metadata,
            Workload::Deployment(o) => &o.metadata,
            Workload::Service(o) => &o.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut ObjectMeta {
        match self {
            Workload::StatefulSet(o) => &mut o.metadata,
            Workload::Deployment(o) => &mut o.metadata,
            Workload::Service(o) => &mut o.metadata,
        }
    }

    pub fn key(&self) -> ObjectKey {
        let meta = self.metadata();
        ObjectKey::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }

    /// The controller owner reference, if any.
    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        controller_owner(self.metadata())
    }

    /// Whether the platform has fully rolled out the current generation.
    ///
    /// Services have no rollout and are ready as soon as they exist.
    pub fn is_ready(&self) -> bool {
        let generation = self.metadata().generation.unwrap_or(0);
        match self {
            Workload::StatefulSet(sts) => {
                let desired = sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let status = sts.status.as_ref();
                let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
                let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
                ready >= desired && observed >= generation
            }
            Workload::Deployment(deploy) => {
                let desired = deploy.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
                let status = deploy.status.as_ref();
                let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
                let observed = status.and_then(|s| s.observed_generation).unwrap_or(0);
                ready >= desired && observed >= generation
            }
            Workload::Service(_) => true,
        }
    }

    pub fn to_value(&self) -> Result<Value> {
        let value = match self {
            Workload::StatefulSet(o) => serde_json::to_value(o)?,
            Workload::Deployment(o) => serde_json::to_value(o)?,
            Workload::Service(o) => serde_json::to_value(o)?,
        };
        Ok(value)
    }

    pub fn from_value(kind: WorkloadKind, value: Value) -> Result<Self> {
        let obj = match kind {
            WorkloadKind::StatefulSet => Workload::StatefulSet(serde_json::from_value(value)?),
            WorkloadKind::Deployment => Workload::Deployment(serde_json::from_value(value)?),
            WorkloadKind::Service => Workload::Service(serde_json::from_value(value)?),
        };
        Ok(obj)
    }
}

pub(crate) fn controller_owner(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|o| o.controller == Some(true))
}

/// Read and write access to clusters and the workloads they own.
///
/// Every update is conditional on the `resourceVersion` carried by the
/// object passed in; a stale version fails with
/// [`OperatorError::Conflict`](crate::error::OperatorError::Conflict).
/// There is no delete operation.
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch a cluster; `None` when it does not exist.
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<VMCluster>>;

    /// Replace the status subtree of `cluster`, conditional on its version.
    async fn update_cluster_status(
        &self,
        cluster: &VMCluster,
        status: &VMClusterStatus,
    ) -> Result<VMCluster>;

    /// Fetch a workload; `None` when it does not exist.
    async fn get_workload(&self, kind: WorkloadKind, key: &ObjectKey) -> Result<Option<Workload>>;

    /// Create a workload. Fails with a conflict if it already exists.
    async fn create_workload(&self, obj: &Workload) -> Result<Workload>;

    /// Replace a workload, conditional on its version.
    async fn update_workload(&self, obj: &Workload) -> Result<Workload>;
}

/// A change observed on a watched object.
#[derive(Clone, Debug, PartialEq)]
pub enum Notification {
    Cluster {
        key: ObjectKey,
        generation: Option<i64>,
        labels: BTreeMap<String, String>,
        deleted: bool,
    },
    Workload {
        kind: WorkloadKind,
        key: ObjectKey,
        owner: Option<OwnerReference>,
        deleted: bool,
    },
}

impl Notification {
    pub fn cluster(cluster: &VMCluster, deleted: bool) -> Self {
        Notification::Cluster {
            key: cluster.key(),
            generation: cluster.metadata.generation,
            labels: cluster.labels().clone(),
            deleted,
        }
    }

    pub fn workload(obj: &Workload, deleted: bool) -> Self {
        Notification::Workload {
            kind: obj.kind(),
            key: obj.key(),
            owner: obj.controller_owner().cloned(),
            deleted,
        }
    }
}

/// In-process fan-in of watch notifications.
#[derive(Clone, Debug)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<Notification>,
}

/// Receiving half of an [`EventBus`].
pub type EventStream = mpsc::UnboundedReceiver<Notification>;

impl EventBus {
    pub fn channel() -> (EventBus, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (EventBus { tx }, rx)
    }

    /// Publish a notification. Dropped silently once the dispatcher is gone.
    pub fn publish(&self, notification: Notification) {
        let _ = self.tx.send(notification);
    }
}
