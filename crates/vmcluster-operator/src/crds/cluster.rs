use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::common::{ComponentSpec, ImagePullSecret, StorageSpec};
use crate::constants::prefixes;
use crate::status::ClusterStatus;
use crate::store::ObjectKey;

/// Spec for a VictoriaMetrics cluster: vmstorage, vmselect and vminsert tiers.
#[derive(CustomResource, Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "operator.victoriametrics.com",
    version = "v1beta1",
    kind = "VMCluster",
    namespaced,
    status = "VMClusterStatus",
    shortname = "vmc",
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.clusterStatus"}"#,
    printcolumn = r#"{"name":"Insert Replicas","type":"integer","jsonPath":".spec.vminsert.replicaCount"}"#,
    printcolumn = r#"{"name":"Storage Replicas","type":"integer","jsonPath":".spec.vmstorage.replicaCount"}"#,
    printcolumn = r#"{"name":"Select Replicas","type":"integer","jsonPath":".spec.vmselect.replicaCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VMClusterSpec {
    /// Retention period in months.
    pub retention_period: String,

    /// How many copies of each sample vminsert writes among distinct storage nodes.
    #[serde(default)]
    pub replication_factor: Option<i32>,

    /// Image pull secrets for every tier.
    #[serde(default)]
    pub image_pull_secrets: Vec<ImagePullSecret>,

    #[serde(default)]
    pub vmstorage: Option<VMStorageSpec>,

    #[serde(default)]
    pub vmselect: Option<VMSelectSpec>,

    #[serde(default)]
    pub vminsert: Option<VMInsertSpec>,
}

/// vmstorage tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VMStorageSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,

    /// Persistent volume for the data path. `emptyDir` when unset.
    #[serde(default)]
    pub storage: Option<StorageSpec>,

    #[serde(default = "super::defaults::storage_data_path")]
    pub storage_data_path: String,

    /// Port vminsert nodes connect to.
    #[serde(default = "super::defaults::vminsert_port")]
    pub vm_insert_port: i32,

    /// Port vmselect nodes connect to.
    #[serde(default = "super::defaults::vmselect_port")]
    pub vm_select_port: i32,
}

/// vmselect tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VMSelectSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,

    /// Directory for the persistent query cache.
    #[serde(default)]
    pub cache_mount_path: Option<String>,

    /// Persistent volume backing `cacheMountPath`.
    #[serde(default)]
    pub persistent_volume: Option<StorageSpec>,
}

/// vminsert tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VMInsertSpec {
    #[serde(flatten)]
    pub component: ComponentSpec,
}

/// Observed state of a VMCluster. Derived from the live workload objects.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VMClusterStatus {
    /// Consecutive failed convergence passes.
    #[serde(default)]
    pub update_fail_count: i32,

    /// Time of the last pass that found the cluster operational (RFC 3339).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<String>,

    #[serde(default)]
    pub cluster_status: ClusterStatus,

    /// Set only when the cluster is failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default)]
    pub storage_status: TierStatus,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TierStatus {
    #[serde(default)]
    pub status: ClusterStatus,
}

/// One of the three cooperating roles of a cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tier {
    Storage,
    Select,
    Insert,
}

impl Tier {
    /// Convergence order. Select and Insert depend on Storage.
    pub const ORDER: [Tier; 3] = [Tier::Storage, Tier::Select, Tier::Insert];

    pub fn prefix(self) -> &'static str {
        match self {
            Tier::Storage => prefixes::STORAGE,
            Tier::Select => prefixes::SELECT,
            Tier::Insert => prefixes::INSERT,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl VMCluster {
    /// Namespace-qualified identity of this cluster.
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_else(|| "default".into()), self.name_any())
    }

    /// Shared settings of a declared tier.
    pub fn component(&self, tier: Tier) -> Option<&ComponentSpec> {
        match tier {
            Tier::Storage => self.spec.vmstorage.as_ref().map(|s| &s.component),
            Tier::Select => self.spec.vmselect.as_ref().map(|s| &s.component),
            Tier::Insert => self.spec.vminsert.as_ref().map(|s| &s.component),
        }
    }

    /// Tiers present in the spec, in convergence order.
    pub fn declared_tiers(&self) -> Vec<Tier> {
        Tier::ORDER
            .into_iter()
            .filter(|tier| self.component(*tier).is_some())
            .collect()
    }

    /// Stable name of every object derived for `tier`.
    pub fn tier_name(&self, tier: Tier) -> String {
        self.component(tier)
            .and_then(|c| c.name.clone())
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| format!("{}-{}", tier.prefix(), self.name_any()))
    }

    /// Desired replicas of a tier; zero when the tier is not declared.
    pub fn tier_replicas(&self, tier: Tier) -> i32 {
        self.component(tier).map(ComponentSpec::replicas).unwrap_or(0)
    }

    /// Status as persisted, or the implicit initial status.
    pub fn current_status(&self) -> VMClusterStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Controller owner reference placed on every derived object.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: VMCluster::api_version(&()).to_string(),
            kind: VMCluster::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.metadata.uid.clone().unwrap_or_default(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}
