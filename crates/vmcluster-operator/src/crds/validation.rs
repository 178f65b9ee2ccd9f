//! Structural validation of a VMCluster spec.
//!
//! Runs at the start of every convergence pass. A failure is reported on the
//! resource status and no workload object is touched.

use super::cluster::{Tier, VMCluster};
use super::common::{ComponentSpec, StorageSpec};

const ACCESS_MODES: [&str; 4] = ["ReadWriteOnce", "ReadOnlyMany", "ReadWriteMany", "ReadWriteOncePod"];

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 9] = [
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a Kubernetes resource quantity ("10Gi", "500m", "1e3") into its value.
pub fn parse_quantity(input: &str) -> Result<f64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty quantity".into());
    }

    let split = s
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.' || *c == '+' || *c == '-'))
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let base: f64 = number
        .parse()
        .map_err(|_| format!("{input:?} is not a valid quantity"))?;
    if !number.chars().any(|c| c.is_ascii_digit()) {
        return Err(format!("{input:?} is not a valid quantity"));
    }

    let multiplier = if suffix.is_empty() {
        1.0
    } else if let Some((_, m)) = BINARY_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        *m
    } else if let Some((_, m)) = DECIMAL_SUFFIXES.iter().find(|(sfx, _)| *sfx == suffix) {
        *m
    } else if let Some(exp) = suffix.strip_prefix(&['e', 'E'][..]) {
        let exp: i32 = exp
            .parse()
            .map_err(|_| format!("{input:?} is not a valid quantity"))?;
        10f64.powi(exp)
    } else {
        return Err(format!("{input:?} has unknown suffix {suffix:?}"));
    };

    Ok(base * multiplier)
}

/// Validate a persistent volume request.
pub fn validate_storage(storage: &StorageSpec) -> Result<(), String> {
    let size = parse_quantity(&storage.size).map_err(|e| format!("size {e}"))?;
    if size <= 0.0 {
        return Err(format!("size {:?} must be positive", storage.size));
    }
    if storage.access_modes.is_empty() {
        return Err("accessModes must not be empty".into());
    }
    if let Some(mode) = storage
        .access_modes
        .iter()
        .find(|m| !ACCESS_MODES.contains(&m.as_str()))
    {
        return Err(format!("unknown access mode {mode:?}"));
    }
    if storage.storage_class.as_deref() == Some("") {
        return Err("storageClass must not be empty when set".into());
    }
    Ok(())
}

fn validate_component(name: &str, component: &ComponentSpec) -> Result<(), String> {
    if let Some(replicas) = component.replica_count {
        if replicas < 0 {
            return Err(format!("{name}: replicaCount must not be negative, got {replicas}"));
        }
    }
    if component.extra_args.keys().any(|k| k.is_empty()) {
        return Err(format!("{name}: extraArgs keys must not be empty"));
    }
    if component.secrets.iter().any(|s| s.is_empty()) {
        return Err(format!("{name}: secrets entries must not be empty"));
    }
    if component.config_maps.iter().any(|c| c.is_empty()) {
        return Err(format!("{name}: configMaps entries must not be empty"));
    }
    Ok(())
}

fn validate_sidecars(tier: Tier, name: &str, component: &ComponentSpec) -> Result<(), String> {
    if let Some(clash) = component
        .containers
        .iter()
        .chain(&component.init_containers)
        .find(|c| c.name == tier.prefix())
    {
        return Err(format!(
            "{name}: container name {:?} is reserved for the main container",
            clash.name
        ));
    }
    Ok(())
}

/// Validate the whole cluster spec.
pub fn validate(cluster: &VMCluster) -> Result<(), String> {
    let spec = &cluster.spec;

    let retention = spec.retention_period.trim();
    if retention.is_empty() || !retention.chars().all(|c| c.is_ascii_digit()) {
        return Err(format!(
            "retentionPeriod must be a number of months, got {:?}",
            spec.retention_period
        ));
    }
    if retention.chars().all(|c| c == '0') {
        return Err("retentionPeriod must be greater than zero".into());
    }

    if spec.vmstorage.is_none() && (spec.vmselect.is_some() || spec.vminsert.is_some()) {
        return Err("vmselect and vminsert require vmstorage to be declared".into());
    }

    for tier in cluster.declared_tiers() {
        if let Some(component) = cluster.component(tier) {
            let name = cluster.tier_name(tier);
            validate_component(&name, component)?;
            validate_sidecars(tier, &name, component)?;
        }
    }

    if let Some(storage) = &spec.vmstorage {
        if let Some(pv) = &storage.storage {
            validate_storage(pv).map_err(|e| {
                format!(
                    "invalid persistent volume spec for {}: {e}",
                    cluster.tier_name(Tier::Storage)
                )
            })?;
        }
        if storage.storage_data_path.is_empty() {
            return Err("vmstorage.storageDataPath must not be empty".into());
        }
    }

    if let Some(select) = &spec.vmselect {
        if let Some(pv) = &select.persistent_volume {
            validate_storage(pv).map_err(|e| {
                format!(
                    "invalid persistent volume spec for {}: {e}",
                    cluster.tier_name(Tier::Select)
                )
            })?;
            if select.cache_mount_path.as_deref().unwrap_or("").is_empty() {
                return Err("vmselect.persistentVolume requires cacheMountPath".into());
            }
        }
    }

    if let Some(rf) = spec.replication_factor {
        if rf < 1 {
            return Err(format!("replicationFactor must be at least 1, got {rf}"));
        }
        let storage_replicas = cluster.tier_replicas(Tier::Storage);
        if spec.vmstorage.is_some() && rf > storage_replicas {
            return Err(format!(
                "replicationFactor {rf} exceeds vmstorage replicaCount {storage_replicas}"
            ));
        }
    }

    Ok(())
}
