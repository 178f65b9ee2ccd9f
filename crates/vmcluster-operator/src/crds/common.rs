use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, Container, PodSecurityContext, Volume as K8sVolume, VolumeMount as K8sVolumeMount,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Persistent volume request for a tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageSpec {
    /// Kubernetes StorageClass name. Cluster default when unset.
    #[serde(default)]
    pub storage_class: Option<String>,

    /// Storage size (e.g., "10Gi", "500Gi").
    #[serde(default = "super::defaults::storage_size")]
    pub size: String,

    /// Access modes. Defaults to `["ReadWriteOnce"]`.
    #[serde(default = "super::defaults::access_modes")]
    pub access_modes: Vec<String>,

    /// Annotations for the claim template.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Pre-provisioned claim mounted by every pod instead of per-pod claims.
    #[serde(default)]
    pub existing_claim: Option<String>,

    /// Sub-path of the volume to mount.
    #[serde(default)]
    pub sub_path: Option<String>,
}

impl StorageSpec {
    /// Name of the pre-provisioned claim, ignoring an empty string.
    pub fn existing_claim(&self) -> Option<&str> {
        self.existing_claim.as_deref().filter(|c| !c.is_empty())
    }

    pub fn sub_path(&self) -> Option<String> {
        self.sub_path.clone().filter(|p| !p.is_empty())
    }
}

/// Container image settings.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Image name including registry, e.g. `victoriametrics/vmstorage`.
    #[serde(default)]
    pub repository: Option<String>,

    /// Image tag.
    #[serde(default)]
    pub tag: Option<String>,

    /// Image pull policy.
    #[serde(default)]
    pub pull_policy: Option<String>,
}

/// Labels and annotations propagated to the pods of a tier.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EmbeddedObjectMetadata {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

/// Reference to a key within a Kubernetes Secret.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SecretKeyRef {
    /// Secret name.
    pub name: String,

    /// Key within the Secret.
    pub key: String,
}

/// Environment variable definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EnvVar {
    /// Variable name.
    pub name: String,

    /// Variable value (plain text).
    #[serde(default)]
    pub value: Option<String>,

    /// Value from a Secret key reference.
    #[serde(default)]
    pub value_from_secret: Option<SecretKeyRef>,
}

/// Resource requirements (requests and limits).
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceRequirements {
    /// Resource requests.
    #[serde(default)]
    pub requests: Option<ResourceValues>,

    /// Resource limits.
    #[serde(default)]
    pub limits: Option<ResourceValues>,
}

/// CPU and memory values.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceValues {
    /// CPU (e.g., "500m", "2").
    #[serde(default)]
    pub cpu: Option<String>,

    /// Memory (e.g., "1Gi", "4Gi").
    #[serde(default)]
    pub memory: Option<String>,
}

/// Toleration for Pod scheduling.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Toleration {
    pub key: Option<String>,
    pub operator: Option<String>,
    pub value: Option<String>,
    pub effect: Option<String>,
    #[serde(default)]
    pub toleration_seconds: Option<i64>,
}

/// Image pull secret reference.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ImagePullSecret {
    pub name: String,
}

/// Settings shared by every tier: replica count, image, pod template overrides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSpec {
    /// Explicit object name. Overrides `<prefix>-<clusterName>`.
    #[serde(default)]
    pub name: Option<String>,

    /// Desired number of pods.
    #[serde(default)]
    pub replica_count: Option<i32>,

    /// Container image settings.
    #[serde(default)]
    pub image: Image,

    /// Labels and annotations for the pods.
    #[serde(default)]
    pub pod_metadata: Option<EmbeddedObjectMetadata>,

    /// Resource requests and limits.
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,

    /// Extra command line flags, rendered as `-key=value`.
    #[serde(default)]
    pub extra_args: BTreeMap<String, String>,

    /// Extra environment variables.
    #[serde(default)]
    pub extra_envs: Vec<EnvVar>,

    /// Log level flag (INFO, WARN, ERROR, FATAL, PANIC).
    #[serde(default)]
    pub log_level: Option<String>,

    /// Log format flag (default or json).
    #[serde(default)]
    pub log_format: Option<String>,

    /// Node selector for Pod scheduling.
    #[serde(default)]
    pub node_selector: Option<BTreeMap<String, String>>,

    /// Pod tolerations.
    #[serde(default)]
    pub tolerations: Vec<Toleration>,

    /// Pod affinity, anti-affinity and node affinity rules.
    #[serde(default)]
    pub affinity: Option<Affinity>,

    /// Secrets in the cluster namespace, mounted at `/etc/vm/secrets/<name>`.
    #[serde(default)]
    pub secrets: Vec<String>,

    /// ConfigMaps in the cluster namespace, mounted at `/etc/vm/configmaps/<name>`.
    #[serde(default)]
    pub config_maps: Vec<String>,

    /// Extra pod volumes, appended after the ones the operator generates.
    #[serde(default)]
    pub volumes: Vec<K8sVolume>,

    /// Extra mounts for the main container.
    #[serde(default)]
    pub volume_mounts: Vec<K8sVolumeMount>,

    /// Sidecar containers, appended after the main container.
    #[serde(default)]
    pub containers: Vec<Container>,

    #[serde(default)]
    pub init_containers: Vec<Container>,

    /// Pod-level security attributes.
    #[serde(default)]
    pub security_context: Option<PodSecurityContext>,

    /// Run the pods in the node network namespace.
    #[serde(default)]
    pub host_network: bool,

    #[serde(default)]
    pub dns_policy: Option<String>,

    #[serde(default)]
    pub service_account_name: Option<String>,

    #[serde(default)]
    pub priority_class_name: Option<String>,

    #[serde(default)]
    pub scheduler_name: Option<String>,

    #[serde(default)]
    pub termination_grace_period_seconds: Option<i64>,

    /// HTTP listen port. Tier default when unset.
    #[serde(default)]
    pub port: Option<i32>,
}

impl ComponentSpec {
    /// Desired replicas, defaulting to one.
    pub fn replicas(&self) -> i32 {
        self.replica_count.unwrap_or(crate::constants::defaults::REPLICAS)
    }
}
