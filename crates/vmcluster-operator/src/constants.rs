/// Kubernetes label keys following the app.kubernetes.io convention.
pub mod labels {
    pub const NAME: &str = "app.kubernetes.io/name";
    pub const INSTANCE: &str = "app.kubernetes.io/instance";
    pub const COMPONENT: &str = "app.kubernetes.io/component";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
}

/// Label values.
pub mod values {
    pub const COMPONENT: &str = "monitoring";
    pub const MANAGED_BY: &str = "vm-operator";
}

/// Name prefixes of the per-tier objects.
pub mod prefixes {
    pub const STORAGE: &str = "vmstorage";
    pub const SELECT: &str = "vmselect";
    pub const INSERT: &str = "vminsert";
}

/// Default listen ports.
pub mod ports {
    pub const STORAGE_HTTP: i32 = 8482;
    pub const STORAGE_VMINSERT: i32 = 8400;
    pub const STORAGE_VMSELECT: i32 = 8401;
    pub const SELECT_HTTP: i32 = 8481;
    pub const INSERT_HTTP: i32 = 8480;
}

/// Mount roots for referenced Secrets and ConfigMaps.
pub mod mounts {
    pub const SECRETS_DIR: &str = "/etc/vm/secrets";
    pub const CONFIG_MAPS_DIR: &str = "/etc/vm/configmaps";
}

/// Default values for the builder and the control loop.
pub mod defaults {
    pub const IMAGE_TAG: &str = "v1.93.4";
    pub const IMAGE_PULL_POLICY: &str = "IfNotPresent";
    pub const STORAGE_DATA_PATH: &str = "/vmstorage-data";
    pub const STORAGE_VOLUME_NAME: &str = "vmstorage-db";
    pub const SELECT_CACHE_VOLUME_NAME: &str = "vmselect-cachedir";
    pub const STORAGE_CLASS: &str = "standard";
    pub const STORAGE_SIZE: &str = "10Gi";
    pub const REPLICAS: i32 = 1;

    /// Re-check delay while a tier is rolling out.
    pub const REQUEUE_EXPANDING_SECS: u64 = 10;
    /// Retry backoff for transient errors.
    pub const BACKOFF_BASE_SECS: u64 = 5;
    pub const BACKOFF_MAX_SECS: u64 = 300;

    pub const WORKERS: usize = 4;
    pub const FIELD_MANAGER: &str = "vm-operator";
}

/// CRD API group.
pub const API_GROUP: &str = "operator.victoriametrics.com";

/// Label selector matching every object this operator manages.
pub fn managed_selector() -> String {
    format!("{}={}", labels::MANAGED_BY, values::MANAGED_BY)
}
