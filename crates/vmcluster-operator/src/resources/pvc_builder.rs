use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec as K8sPvcSpec,
    PersistentVolumeClaimVolumeSource, ResourceRequirements, Volume,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use super::BuildError;
use crate::crds::common::StorageSpec;
use crate::crds::validation::parse_quantity;

/// Where a tier's data volume comes from.
#[derive(Debug)]
pub enum DataVolume {
    /// One claim per pod, created from the StatefulSet's claim template.
    Template(PersistentVolumeClaim),
    /// A pre-provisioned claim shared by every pod.
    Existing(Volume),
}

/// Resolve the data volume for `storage`: its `existingClaim` when set,
/// otherwise a claim template.
pub fn build_data_volume(
    volume: &str,
    tier: &str,
    storage: &StorageSpec,
    labels: BTreeMap<String, String>,
) -> Result<DataVolume, BuildError> {
    match storage.existing_claim() {
        Some(claim) => Ok(DataVolume::Existing(Volume {
            name: volume.into(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: claim.into(),
                ..Default::default()
            }),
            ..Default::default()
        })),
        None => build_claim_template(volume, tier, storage, labels).map(DataVolume::Template),
    }
}

/// Build a volume claim template for a StatefulSet.
///
/// The claim for pod `N` is named `{volume}-{statefulset}-{N}` by the platform.
pub fn build_claim_template(
    volume: &str,
    tier: &str,
    storage: &StorageSpec,
    labels: BTreeMap<String, String>,
) -> Result<PersistentVolumeClaim, BuildError> {
    if parse_quantity(&storage.size).map_or(true, |v| v <= 0.0) {
        return Err(BuildError::InvalidQuantity {
            tier: tier.into(),
            field: "storage size".into(),
            value: storage.size.clone(),
        });
    }

    Ok(PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(volume.into()),
            labels: Some(labels),
            annotations: (!storage.annotations.is_empty()).then(|| storage.annotations.clone()),
            ..Default::default()
        },
        spec: Some(K8sPvcSpec {
            storage_class_name: storage.storage_class.clone(),
            access_modes: Some(storage.access_modes.clone()),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".into(),
                    Quantity(storage.size.clone()),
                )])),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}
