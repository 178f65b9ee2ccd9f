//! Per-tier workload objects derived from a VMCluster.
//!
//! Builders are pure: the same cluster always yields the same objects, and
//! nothing here talks to the store.

pub mod pod_builder;
pub mod pvc_builder;
pub mod service_builder;
pub mod workload_builder;

use std::collections::BTreeMap;

use kube::ResourceExt;
use thiserror::Error;

use crate::constants::{defaults, labels, values};
use crate::crds::cluster::{Tier, VMCluster};
use crate::store::Workload;

/// Why a tier's objects could not be produced.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("{0}: image repository must not be empty")]
    MissingImage(String),

    #[error("{tier}: invalid {field} quantity {value:?}")]
    InvalidQuantity {
        tier: String,
        field: String,
        value: String,
    },

    #[error("{0} is not declared in the cluster spec")]
    NotDeclared(Tier),

    #[error("{0} requires vmstorage to be declared")]
    MissingStorage(Tier),
}

/// Objects of one tier, in the order they are applied.
#[derive(Clone, Debug, PartialEq)]
pub struct TierObjects {
    pub tier: Tier,
    pub service: Workload,
    pub workload: Workload,
}

impl TierObjects {
    /// Service first so pods get stable DNS before they start.
    pub fn ordered(&self) -> [&Workload; 2] {
        [&self.service, &self.workload]
    }
}

/// Produces the concrete objects of a tier.
pub trait TierBuilder: Send + Sync {
    fn build(&self, cluster: &VMCluster, tier: Tier) -> Result<TierObjects, BuildError>;
}

/// Builder for the vmstorage / vmselect / vminsert tiers.
#[derive(Clone, Debug)]
pub struct ClusterBuilder {
    /// Image tag used when a tier does not pin one; `-cluster` is appended.
    pub default_image_tag: String,
}

impl Default for ClusterBuilder {
    fn default() -> Self {
        Self {
            default_image_tag: defaults::IMAGE_TAG.to_string(),
        }
    }
}

impl ClusterBuilder {
    pub fn new(default_image_tag: impl Into<String>) -> Self {
        Self {
            default_image_tag: default_image_tag.into(),
        }
    }
}

impl TierBuilder for ClusterBuilder {
    fn build(&self, cluster: &VMCluster, tier: Tier) -> Result<TierObjects, BuildError> {
        if cluster.component(tier).is_none() {
            return Err(BuildError::NotDeclared(tier));
        }
        if tier != Tier::Storage && cluster.spec.vmstorage.is_none() {
            return Err(BuildError::MissingStorage(tier));
        }

        let service = service_builder::build_tier_service(cluster, tier);
        let workload = match tier {
            Tier::Storage => Workload::StatefulSet(workload_builder::build_storage(cluster, self)?),
            Tier::Select => Workload::StatefulSet(workload_builder::build_select(cluster, self)?),
            Tier::Insert => Workload::Deployment(workload_builder::build_insert(cluster, self)?),
        };

        Ok(TierObjects {
            tier,
            service: Workload::Service(service),
            workload,
        })
    }
}

/// Labels that select the pods of a tier. Never change once created.
pub fn selector_labels(cluster: &VMCluster, tier: Tier) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::NAME.into(), tier.prefix().into()),
        (labels::INSTANCE.into(), cluster.name_any()),
        (labels::COMPONENT.into(), values::COMPONENT.into()),
        (labels::MANAGED_BY.into(), values::MANAGED_BY.into()),
    ])
}

/// Labels on the objects themselves: the cluster's labels plus the selector.
pub fn object_labels(cluster: &VMCluster, tier: Tier) -> BTreeMap<String, String> {
    let mut all = cluster.labels().clone();
    all.extend(selector_labels(cluster, tier));
    all
}

/// Pod labels: user pod labels, never overriding the selector.
pub fn pod_labels(cluster: &VMCluster, tier: Tier) -> BTreeMap<String, String> {
    let mut all = cluster
        .component(tier)
        .and_then(|c| c.pod_metadata.as_ref())
        .map(|m| m.labels.clone())
        .unwrap_or_default();
    all.extend(selector_labels(cluster, tier));
    all
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::cluster::VMClusterSpec;
    use crate::store::WorkloadKind;

    fn cluster(spec_json: &str) -> VMCluster {
        let spec: VMClusterSpec = serde_json::from_str(spec_json).unwrap();
        let mut c = VMCluster::new("main", spec);
        c.metadata.namespace = Some("monitoring".into());
        c.metadata.uid = Some("uid-1".into());
        c.metadata.labels = Some(BTreeMap::from([("team".into(), "obs".into())]));
        c
    }

    #[test]
    fn test_selector_labels() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#);
        let sel = selector_labels(&c, Tier::Storage);
        assert_eq!(sel.get(labels::NAME).map(String::as_str), Some("vmstorage"));
        assert_eq!(sel.get(labels::INSTANCE).map(String::as_str), Some("main"));
        assert_eq!(sel.get(labels::MANAGED_BY).map(String::as_str), Some("vm-operator"));
        assert_eq!(sel.len(), 4);
    }

    #[test]
    fn test_pod_labels_cannot_override_selector() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"podMetadata": {"labels": {"app.kubernetes.io/name": "hijack", "zone": "a"}}}}"#,
        );
        let pod = pod_labels(&c, Tier::Storage);
        assert_eq!(pod.get(labels::NAME).map(String::as_str), Some("vmstorage"));
        assert_eq!(pod.get("zone").map(String::as_str), Some("a"));
    }

    #[test]
    fn test_object_labels_inherit_cluster_labels() {
        let c = cluster(r#"{"retentionPeriod": "1", "vminsert": {}, "vmstorage": {}}"#);
        let obj = object_labels(&c, Tier::Insert);
        assert_eq!(obj.get("team").map(String::as_str), Some("obs"));
        assert_eq!(obj.get(labels::NAME).map(String::as_str), Some("vminsert"));
    }

    #[test]
    fn test_build_each_tier_kind() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}, "vmselect": {}, "vminsert": {}}"#);
        let builder = ClusterBuilder::default();

        let storage = builder.build(&c, Tier::Storage).unwrap();
        assert_eq!(storage.workload.kind(), WorkloadKind::StatefulSet);
        assert_eq!(storage.service.kind(), WorkloadKind::Service);
        assert_eq!(storage.ordered()[0].kind(), WorkloadKind::Service);

        let select = builder.build(&c, Tier::Select).unwrap();
        assert_eq!(select.workload.kind(), WorkloadKind::StatefulSet);

        let insert = builder.build(&c, Tier::Insert).unwrap();
        assert_eq!(insert.workload.kind(), WorkloadKind::Deployment);
        assert_eq!(insert.workload.key().name, "vminsert-main");
    }

    #[test]
    fn test_undeclared_tier_is_an_error() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#);
        let err = ClusterBuilder::default().build(&c, Tier::Select).unwrap_err();
        assert_eq!(err, BuildError::NotDeclared(Tier::Select));
    }

    #[test]
    fn test_every_object_is_owned_by_the_cluster() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#);
        let objs = ClusterBuilder::default().build(&c, Tier::Storage).unwrap();
        for obj in objs.ordered() {
            let owner = obj.controller_owner().unwrap();
            assert_eq!(owner.uid, "uid-1");
            assert_eq!(owner.block_owner_deletion, Some(true));
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"extraArgs": {"b": "2", "a": "1"}}}"#,
        );
        let builder = ClusterBuilder::default();
        assert_eq!(builder.build(&c, Tier::Storage), builder.build(&c, Tier::Storage));
    }
}
