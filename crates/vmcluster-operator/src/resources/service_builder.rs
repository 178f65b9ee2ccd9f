use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use super::{object_labels, selector_labels};
use crate::constants::ports;
use crate::crds::cluster::{Tier, VMCluster};

/// HTTP port of a tier, honoring the per-tier override.
pub fn http_port(cluster: &VMCluster, tier: Tier) -> i32 {
    let default = match tier {
        Tier::Storage => ports::STORAGE_HTTP,
        Tier::Select => ports::SELECT_HTTP,
        Tier::Insert => ports::INSERT_HTTP,
    };
    cluster.component(tier).and_then(|c| c.port).unwrap_or(default)
}

fn port(name: &str, number: i32) -> ServicePort {
    ServicePort {
        name: Some(name.into()),
        port: number,
        target_port: Some(IntOrString::Int(number)),
        protocol: Some("TCP".into()),
        ..Default::default()
    }
}

/// Service ports of a tier.
pub fn service_ports(cluster: &VMCluster, tier: Tier) -> Vec<ServicePort> {
    let mut out = vec![port("http", http_port(cluster, tier))];
    if let (Tier::Storage, Some(storage)) = (tier, cluster.spec.vmstorage.as_ref()) {
        out.push(port("vminsert", storage.vm_insert_port));
        out.push(port("vmselect", storage.vm_select_port));
    }
    out
}

/// Build the Service in front of a tier.
///
/// vmstorage and vmselect get a headless Service so every pod has a stable
/// DNS record: `{pod}.{service}.{namespace}.svc`. vminsert is stateless and
/// gets a regular ClusterIP Service.
pub fn build_tier_service(cluster: &VMCluster, tier: Tier) -> Service {
    let headless = matches!(tier, Tier::Storage | Tier::Select);

    Service {
        metadata: ObjectMeta {
            name: Some(cluster.tier_name(tier)),
            namespace: cluster.namespace(),
            labels: Some(object_labels(cluster, tier)),
            owner_references: Some(vec![cluster.owner_reference()]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".into()),
            cluster_ip: headless.then(|| "None".to_string()),
            selector: Some(selector_labels(cluster, tier)),
            ports: Some(service_ports(cluster, tier)),
            publish_not_ready_addresses: headless.then_some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}
