//! StatefulSets and Deployments of the three tiers.

use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, StatefulSet, StatefulSetSpec,
    StatefulSetUpdateStrategy,
};
use k8s_openapi::api::core::v1::{
    ContainerPort, EmptyDirVolumeSource, PersistentVolumeClaim, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use super::pod_builder::{build_pod_template, common_args, PodParts};
use super::pvc_builder::{build_data_volume, DataVolume};
use super::service_builder::http_port;
use super::{object_labels, selector_labels, BuildError, ClusterBuilder};
use crate::constants::defaults;
use crate::crds::cluster::{Tier, VMCluster};

/// DNS names of every vmstorage pod, pointing at `port`.
///
/// vmselect and vminsert address storage nodes individually through the
/// headless Service, so they can only be configured once the storage tier
/// has its stable network identity.
pub fn storage_nodes(cluster: &VMCluster, port: i32) -> Vec<String> {
    let sts = cluster.tier_name(Tier::Storage);
    let namespace = cluster.namespace().unwrap_or_default();
    (0..cluster.tier_replicas(Tier::Storage))
        .map(|i| format!("{sts}-{i}.{sts}.{namespace}.svc:{port}"))
        .collect()
}

fn metadata(cluster: &VMCluster, tier: Tier) -> ObjectMeta {
    ObjectMeta {
        name: Some(cluster.tier_name(tier)),
        namespace: cluster.namespace(),
        labels: Some(object_labels(cluster, tier)),
        owner_references: Some(vec![cluster.owner_reference()]),
        ..Default::default()
    }
}

fn selector(cluster: &VMCluster, tier: Tier) -> LabelSelector {
    LabelSelector {
        match_labels: Some(selector_labels(cluster, tier)),
        ..Default::default()
    }
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.into()),
        container_port: port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.into(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

/// vmstorage: StatefulSet with a data volume per pod.
pub fn build_storage(cluster: &VMCluster, builder: &ClusterBuilder) -> Result<StatefulSet, BuildError> {
    let tier = Tier::Storage;
    let spec = cluster
        .spec
        .vmstorage
        .as_ref()
        .ok_or(BuildError::NotDeclared(tier))?;
    let name = cluster.tier_name(tier);
    let port = http_port(cluster, tier);

    let mut args = vec![
        format!("-retentionPeriod={}", cluster.spec.retention_period),
        format!("-storageDataPath={}", spec.storage_data_path),
        format!("-httpListenAddr=:{port}"),
        format!("-vminsertAddr=:{}", spec.vm_insert_port),
        format!("-vmselectAddr=:{}", spec.vm_select_port),
    ];
    args.extend(common_args(&spec.component));

    let volume = defaults::STORAGE_VOLUME_NAME;
    let mounts = vec![VolumeMount {
        name: volume.into(),
        mount_path: spec.storage_data_path.clone(),
        sub_path: spec.storage.as_ref().and_then(|s| s.sub_path()),
        ..Default::default()
    }];

    // A claim provides the volume; otherwise fall back to emptyDir.
    let (volumes, claims): (Vec<Volume>, Option<Vec<PersistentVolumeClaim>>) = match &spec.storage {
        Some(storage) => {
            match build_data_volume(volume, &name, storage, selector_labels(cluster, tier))? {
                DataVolume::Template(claim) => (vec![], Some(vec![claim])),
                DataVolume::Existing(existing) => (vec![existing], None),
            }
        }
        None => (vec![empty_dir(volume)], None),
    };

    let template = build_pod_template(
        cluster,
        tier,
        &spec.component,
        builder,
        port,
        PodParts {
            args,
            ports: vec![
                container_port("vminsert", spec.vm_insert_port),
                container_port("vmselect", spec.vm_select_port),
            ],
            volumes,
            mounts,
        },
    )?;

    Ok(StatefulSet {
        metadata: metadata(cluster, tier),
        spec: Some(StatefulSetSpec {
            service_name: name,
            replicas: Some(spec.component.replicas()),
            selector: selector(cluster, tier),
            pod_management_policy: Some("Parallel".into()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".into()),
                ..Default::default()
            }),
            template,
            volume_claim_templates: claims,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// vmselect: StatefulSet querying every storage node.
pub fn build_select(cluster: &VMCluster, builder: &ClusterBuilder) -> Result<StatefulSet, BuildError> {
    let tier = Tier::Select;
    let spec = cluster
        .spec
        .vmselect
        .as_ref()
        .ok_or(BuildError::NotDeclared(tier))?;
    let storage = cluster
        .spec
        .vmstorage
        .as_ref()
        .ok_or(BuildError::MissingStorage(tier))?;
    let name = cluster.tier_name(tier);
    let port = http_port(cluster, tier);

    let mut args = vec![format!("-httpListenAddr=:{port}")];
    args.extend(
        storage_nodes(cluster, storage.vm_select_port)
            .into_iter()
            .map(|node| format!("-storageNode={node}")),
    );
    if cluster.spec.replication_factor.unwrap_or(1) > 1 {
        // Replicated samples would otherwise be returned once per copy.
        args.push("-dedup.minScrapeInterval=1ms".into());
    }

    let volume = defaults::SELECT_CACHE_VOLUME_NAME;
    let mut mounts = vec![];
    let mut volumes = vec![];
    let mut claims = None;
    if let Some(path) = spec.cache_mount_path.as_deref().filter(|p| !p.is_empty()) {
        args.push(format!("-cacheDataPath={path}"));
        mounts.push(VolumeMount {
            name: volume.into(),
            mount_path: path.into(),
            sub_path: spec.persistent_volume.as_ref().and_then(|pv| pv.sub_path()),
            ..Default::default()
        });
        match &spec.persistent_volume {
            Some(pv) => match build_data_volume(volume, &name, pv, selector_labels(cluster, tier))? {
                DataVolume::Template(claim) => claims = Some(vec![claim]),
                DataVolume::Existing(existing) => volumes.push(existing),
            },
            None => volumes.push(empty_dir(volume)),
        }
    }
    args.extend(common_args(&spec.component));

    let template = build_pod_template(
        cluster,
        tier,
        &spec.component,
        builder,
        port,
        PodParts {
            args,
            ports: vec![],
            volumes,
            mounts,
        },
    )?;

    Ok(StatefulSet {
        metadata: metadata(cluster, tier),
        spec: Some(StatefulSetSpec {
            service_name: name,
            replicas: Some(spec.component.replicas()),
            selector: selector(cluster, tier),
            pod_management_policy: Some("Parallel".into()),
            update_strategy: Some(StatefulSetUpdateStrategy {
                type_: Some("RollingUpdate".into()),
                ..Default::default()
            }),
            template,
            volume_claim_templates: claims,
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// vminsert: stateless Deployment writing to every storage node.
pub fn build_insert(cluster: &VMCluster, builder: &ClusterBuilder) -> Result<Deployment, BuildError> {
    let tier = Tier::Insert;
    let spec = cluster
        .spec
        .vminsert
        .as_ref()
        .ok_or(BuildError::NotDeclared(tier))?;
    let storage = cluster
        .spec
        .vmstorage
        .as_ref()
        .ok_or(BuildError::MissingStorage(tier))?;
    let port = http_port(cluster, tier);

    let mut args = vec![format!("-httpListenAddr=:{port}")];
    args.extend(
        storage_nodes(cluster, storage.vm_insert_port)
            .into_iter()
            .map(|node| format!("-storageNode={node}")),
    );
    if let Some(rf) = cluster.spec.replication_factor {
        args.push(format!("-replicationFactor={rf}"));
    }
    args.extend(common_args(&spec.component));

    let template = build_pod_template(
        cluster,
        tier,
        &spec.component,
        builder,
        port,
        PodParts {
            args,
            ports: vec![],
            volumes: vec![],
            mounts: vec![],
        },
    )?;

    Ok(Deployment {
        metadata: metadata(cluster, tier),
        spec: Some(DeploymentSpec {
            replicas: Some(spec.component.replicas()),
            selector: selector(cluster, tier),
            strategy: Some(DeploymentStrategy {
                type_: Some("RollingUpdate".into()),
                ..Default::default()
            }),
            template,
            ..Default::default()
        }),
        ..Default::default()
    })
}
