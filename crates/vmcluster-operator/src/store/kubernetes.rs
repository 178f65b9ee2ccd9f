//! [`ResourceStore`] backed by the Kubernetes API, plus the watch sources
//! that feed the [`EventBus`].

use std::fmt::Debug;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, PostParams};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{
    controller_owner, EventBus, Notification, ObjectKey, ResourceStore, Workload, WorkloadKind,
};
use crate::constants::managed_selector;
use crate::crds::cluster::{VMCluster, VMClusterStatus};
use crate::error::{OperatorError, Result};

/// Store that reads and writes through the API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn post_params(&self) -> PostParams {
        PostParams {
            dry_run: false,
            field_manager: Some(self.field_manager.clone()),
        }
    }

    async fn get<K>(&self, key: &ObjectKey) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        self.api::<K>(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(OperatorError::from_kube)
    }

    async fn create<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let namespace = obj.namespace().unwrap_or_default();
        self.api::<K>(&namespace)
            .create(&self.post_params(), obj)
            .await
            .map_err(OperatorError::from_kube)
    }

    async fn replace<K>(&self, obj: &K) -> Result<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let namespace = obj.namespace().unwrap_or_default();
        self.api::<K>(&namespace)
            .replace(&obj.name_any(), &self.post_params(), obj)
            .await
            .map_err(OperatorError::from_kube)
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, key: &ObjectKey) -> Result<Option<VMCluster>> {
        self.get::<VMCluster>(key).await
    }

    async fn update_cluster_status(
        &self,
        cluster: &VMCluster,
        status: &VMClusterStatus,
    ) -> Result<VMCluster> {
        let key = cluster.key();
        // The body keeps metadata.resourceVersion, which makes the write conditional.
        let mut body = cluster.clone();
        body.status = Some(status.clone());
        let data = serde_json::to_vec(&body)?;

        self.api::<VMCluster>(&key.namespace)
            .replace_status(&key.name, &self.post_params(), data)
            .await
            .map_err(OperatorError::from_kube)
    }

    async fn get_workload(&self, kind: WorkloadKind, key: &ObjectKey) -> Result<Option<Workload>> {
        let obj = match kind {
            WorkloadKind::StatefulSet => self.get::<StatefulSet>(key).await?.map(Workload::StatefulSet),
            WorkloadKind::Deployment => self.get::<Deployment>(key).await?.map(Workload::Deployment),
            WorkloadKind::Service => self.get::<Service>(key).await?.map(Workload::Service),
        };
        Ok(obj)
    }

    async fn create_workload(&self, obj: &Workload) -> Result<Workload> {
        let created = match obj {
            Workload::StatefulSet(o) => Workload::StatefulSet(self.create(o).await?),
            Workload::Deployment(o) => Workload::Deployment(self.create(o).await?),
            Workload::Service(o) => Workload::Service(self.create(o).await?),
        };
        Ok(created)
    }

    async fn update_workload(&self, obj: &Workload) -> Result<Workload> {
        let updated = match obj {
            Workload::StatefulSet(o) => Workload::StatefulSet(self.replace(o).await?),
            Workload::Deployment(o) => Workload::Deployment(self.replace(o).await?),
            Workload::Service(o) => Workload::Service(self.replace(o).await?),
        };
        Ok(updated)
    }
}

fn workload_notification(kind: WorkloadKind, meta: &ObjectMeta, deleted: bool) -> Notification {
    Notification::Workload {
        kind,
        key: ObjectKey::new(
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        ),
        owner: controller_owner(meta).cloned(),
        deleted,
    }
}

async fn forward<K, S, F>(what: &'static str, stream: S, bus: EventBus, notify: F)
where
    S: Stream<Item = std::result::Result<watcher::Event<K>, watcher::Error>>,
    F: Fn(&K, bool) -> Notification,
{
    let mut stream = std::pin::pin!(stream);
    while let Some(event) = stream.next().await {
        match event {
            Ok(watcher::Event::Applied(obj)) => bus.publish(notify(&obj, false)),
            Ok(watcher::Event::Deleted(obj)) => bus.publish(notify(&obj, true)),
            Ok(watcher::Event::Restarted(objs)) => {
                debug!(kind = what, count = objs.len(), "watch relisted");
                for obj in &objs {
                    bus.publish(notify(obj, false));
                }
            }
            Err(e) => warn!(kind = what, error = %e, "watch stream error"),
        }
    }
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Watch clusters and every owned workload type until the streams end.
///
/// Workload watches are narrowed to objects carrying the managed-by label.
pub async fn run_watchers(client: Client, namespace: Option<String>, bus: EventBus) {
    let ns = namespace.as_deref();
    info!(namespace = ?ns, "starting watch sources");

    let owned = || watcher::Config::default().labels(&managed_selector());

    let clusters = forward(
        "VMCluster",
        watcher(scoped::<VMCluster>(&client, ns), watcher::Config::default()).default_backoff(),
        bus.clone(),
        |c: &VMCluster, deleted| Notification::cluster(c, deleted),
    );
    let statefulsets = forward(
        "StatefulSet",
        watcher(scoped::<StatefulSet>(&client, ns), owned()).default_backoff(),
        bus.clone(),
        |o: &StatefulSet, deleted| workload_notification(WorkloadKind::StatefulSet, &o.metadata, deleted),
    );
    let deployments = forward(
        "Deployment",
        watcher(scoped::<Deployment>(&client, ns), owned()).default_backoff(),
        bus.clone(),
        |o: &Deployment, deleted| workload_notification(WorkloadKind::Deployment, &o.metadata, deleted),
    );
    let services = forward(
        "Service",
        watcher(scoped::<Service>(&client, ns), owned()).default_backoff(),
        bus,
        |o: &Service, deleted| workload_notification(WorkloadKind::Service, &o.metadata, deleted),
    );

    tokio::join!(clusters, statefulsets, deployments, services);
    warn!("watch sources stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    #[test]
    fn test_workload_notification_carries_controller_owner() {
        let meta = ObjectMeta {
            name: Some("vminsert-main".into()),
            namespace: Some("monitoring".into()),
            owner_references: Some(vec![
                OwnerReference {
                    kind: "ReplicaSet".into(),
                    name: "other".into(),
                    ..Default::default()
                },
                OwnerReference {
                    kind: "VMCluster".into(),
                    name: "main".into(),
                    controller: Some(true),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        };

        match workload_notification(WorkloadKind::Deployment, &meta, false) {
            Notification::Workload { kind, key, owner, deleted } => {
                assert_eq!(kind, WorkloadKind::Deployment);
                assert_eq!(key, ObjectKey::new("monitoring", "vminsert-main"));
                assert_eq!(owner.map(|o| o.name), Some("main".to_string()));
                assert!(!deleted);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
