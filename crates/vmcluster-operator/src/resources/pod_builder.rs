use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, EnvVarSource, HTTPGetAction,
    LocalObjectReference, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecretVolumeSource, TCPSocketAction, Toleration, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{pod_labels, BuildError, ClusterBuilder};
use crate::constants::{defaults, mounts};
use crate::crds::cluster::{Tier, VMCluster};
use crate::crds::common::{ComponentSpec, ResourceValues};
use crate::crds::validation::parse_quantity;

/// Tier-specific parts of a pod template.
pub struct PodParts {
    pub args: Vec<String>,
    pub ports: Vec<ContainerPort>,
    pub volumes: Vec<Volume>,
    pub mounts: Vec<VolumeMount>,
}

/// Resolve `repository:tag` for a tier.
///
/// Defaults to `victoriametrics/<tier>:<defaultTag>-cluster`.
pub fn image(
    component: &ComponentSpec,
    tier: Tier,
    builder: &ClusterBuilder,
) -> Result<String, BuildError> {
    let repository = match component.image.repository.as_deref() {
        Some(repo) => repo.trim().to_string(),
        None => format!("victoriametrics/{}", tier.prefix()),
    };
    if repository.is_empty() {
        return Err(BuildError::MissingImage(tier.prefix().into()));
    }
    let tag = match component.image.tag.as_deref() {
        Some(tag) if !tag.is_empty() => tag.to_string(),
        _ => format!("{}-cluster", builder.default_image_tag),
    };
    Ok(format!("{repository}:{tag}"))
}

/// Render `extraArgs` and the logger flags as `-key=value`, sorted by key.
pub fn common_args(component: &ComponentSpec) -> Vec<String> {
    let mut flags: BTreeMap<&str, &str> = component
        .extra_args
        .iter()
        .map(|(k, v)| (k.trim_start_matches('-'), v.as_str()))
        .collect();
    if let Some(level) = component.log_level.as_deref() {
        flags.entry("loggerLevel").or_insert(level);
    }
    if let Some(format) = component.log_format.as_deref() {
        flags.entry("loggerFormat").or_insert(format);
    }
    flags.into_iter().map(|(k, v)| format!("-{k}={v}")).collect()
}

fn quantities(
    values: &ResourceValues,
    tier: &str,
    kind: &str,
) -> Result<BTreeMap<String, Quantity>, BuildError> {
    let mut map = BTreeMap::new();
    for (name, value) in [("cpu", &values.cpu), ("memory", &values.memory)] {
        if let Some(value) = value {
            if parse_quantity(value).is_err() {
                return Err(BuildError::InvalidQuantity {
                    tier: tier.into(),
                    field: format!("{kind}.{name}"),
                    value: value.clone(),
                });
            }
            map.insert(name.into(), Quantity(value.clone()));
        }
    }
    Ok(map)
}

fn resources(component: &ComponentSpec, tier: &str) -> Result<Option<ResourceRequirements>, BuildError> {
    let Some(r) = component.resources.as_ref() else {
        return Ok(None);
    };
    let mut k8s_resources = ResourceRequirements::default();
    if let Some(ref req) = r.requests {
        k8s_resources.requests = Some(quantities(req, tier, "requests")?);
    }
    if let Some(ref lim) = r.limits {
        k8s_resources.limits = Some(quantities(lim, tier, "limits")?);
    }
    Ok(Some(k8s_resources))
}

fn env(component: &ComponentSpec) -> Option<Vec<EnvVar>> {
    if component.extra_envs.is_empty() {
        return None;
    }
    let vars = component
        .extra_envs
        .iter()
        .map(|user_env| match (&user_env.value, &user_env.value_from_secret) {
            (None, Some(secret_ref)) => EnvVar {
                name: user_env.name.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: Some(secret_ref.name.clone()),
                        key: secret_ref.key.clone(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
            (value, _) => EnvVar {
                name: user_env.name.clone(),
                value: value.clone(),
                ..Default::default()
            },
        })
        .collect();
    Some(vars)
}

fn tolerations(component: &ComponentSpec) -> Option<Vec<Toleration>> {
    if component.tolerations.is_empty() {
        return None;
    }
    Some(
        component
            .tolerations
            .iter()
            .map(|t| Toleration {
                key: t.key.clone(),
                operator: t.operator.clone(),
                value: t.value.clone(),
                effect: t.effect.clone(),
                toleration_seconds: t.toleration_seconds,
            })
            .collect(),
    )
}

/// Volumes and read-only mounts for the Secrets and ConfigMaps a tier asks for.
fn referenced_volumes(component: &ComponentSpec) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes = vec![];
    let mut volume_mounts = vec![];
    for secret in &component.secrets {
        let name = format!("secret-{secret}");
        volumes.push(Volume {
            name: name.clone(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name,
            mount_path: format!("{}/{secret}", mounts::SECRETS_DIR),
            read_only: Some(true),
            ..Default::default()
        });
    }
    for config_map in &component.config_maps {
        let name = format!("configmap-{config_map}");
        volumes.push(Volume {
            name: name.clone(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(config_map.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name,
            mount_path: format!("{}/{config_map}", mounts::CONFIG_MAPS_DIR),
            read_only: Some(true),
            ..Default::default()
        });
    }
    (volumes, volume_mounts)
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

fn image_pull_secrets(cluster: &VMCluster) -> Option<Vec<LocalObjectReference>> {
    if cluster.spec.image_pull_secrets.is_empty() {
        return None;
    }
    Some(
        cluster
            .spec
            .image_pull_secrets
            .iter()
            .map(|s| LocalObjectReference {
                name: Some(s.name.clone()),
            })
            .collect(),
    )
}

/// Build the pod template shared by every replica of a tier.
pub fn build_pod_template(
    cluster: &VMCluster,
    tier: Tier,
    component: &ComponentSpec,
    builder: &ClusterBuilder,
    http_port: i32,
    parts: PodParts,
) -> Result<PodTemplateSpec, BuildError> {
    let name = cluster.tier_name(tier);

    let liveness_probe = Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String("http".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        timeout_seconds: Some(5),
        failure_threshold: Some(10),
        ..Default::default()
    };

    let readiness_probe = Probe {
        http_get: Some(HTTPGetAction {
            path: Some("/health".into()),
            port: IntOrString::String("http".into()),
            scheme: Some("HTTP".into()),
            ..Default::default()
        }),
        initial_delay_seconds: Some(5),
        period_seconds: Some(5),
        timeout_seconds: Some(5),
        failure_threshold: Some(10),
        ..Default::default()
    };

    let (referenced, referenced_mounts) = referenced_volumes(component);
    let mut volume_mounts = parts.mounts;
    volume_mounts.extend(referenced_mounts);
    volume_mounts.extend(component.volume_mounts.iter().cloned());
    let mut volumes = parts.volumes;
    volumes.extend(referenced);
    volumes.extend(component.volumes.iter().cloned());

    let mut ports = vec![ContainerPort {
        name: Some("http".into()),
        container_port: http_port,
        protocol: Some("TCP".into()),
        ..Default::default()
    }];
    ports.extend(parts.ports);

    let container = Container {
        name: tier.prefix().into(),
        image: Some(image(component, tier, builder)?),
        image_pull_policy: Some(
            component
                .image
                .pull_policy
                .clone()
                .unwrap_or_else(|| defaults::IMAGE_PULL_POLICY.into()),
        ),
        args: Some(parts.args),
        ports: Some(ports),
        env: env(component),
        resources: resources(component, &name)?,
        liveness_probe: Some(liveness_probe),
        readiness_probe: Some(readiness_probe),
        volume_mounts: non_empty(volume_mounts),
        termination_message_policy: Some("FallbackToLogsOnError".into()),
        ..Default::default()
    };

    let mut containers = vec![container];
    containers.extend(component.containers.iter().cloned());

    let annotations = component
        .pod_metadata
        .as_ref()
        .map(|m| m.annotations.clone())
        .filter(|a| !a.is_empty());

    Ok(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(pod_labels(cluster, tier)),
            annotations,
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            init_containers: non_empty(component.init_containers.clone()),
            volumes: non_empty(volumes),
            node_selector: component.node_selector.clone().filter(|n| !n.is_empty()),
            tolerations: tolerations(component),
            affinity: component.affinity.clone(),
            security_context: component.security_context.clone(),
            host_network: component.host_network.then_some(true),
            dns_policy: component.dns_policy.clone().filter(|p| !p.is_empty()),
            image_pull_secrets: image_pull_secrets(cluster),
            service_account_name: component.service_account_name.clone(),
            priority_class_name: component.priority_class_name.clone(),
            scheduler_name: component.scheduler_name.clone(),
            termination_grace_period_seconds: component.termination_grace_period_seconds,
            ..Default::default()
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::cluster::VMClusterSpec;

    fn cluster(spec_json: &str) -> VMCluster {
        let spec: VMClusterSpec = serde_json::from_str(spec_json).unwrap();
        let mut c = VMCluster::new("main", spec);
        c.metadata.namespace = Some("monitoring".into());
        c
    }

    fn template(c: &VMCluster, tier: Tier) -> Result<PodTemplateSpec, BuildError> {
        let component = c.component(tier).unwrap().clone();
        build_pod_template(
            c,
            tier,
            &component,
            &ClusterBuilder::default(),
            8482,
            PodParts {
                args: vec!["-a=1".into()],
                ports: vec![],
                volumes: vec![],
                mounts: vec![],
            },
        )
    }

    #[test]
    fn test_default_image() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#);
        let component = c.component(Tier::Storage).unwrap();
        assert_eq!(
            image(component, Tier::Storage, &ClusterBuilder::new("v1.2.3")).unwrap(),
            "victoriametrics/vmstorage:v1.2.3-cluster"
        );
    }

    #[test]
    fn test_pinned_image() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"image": {"repository": "registry/vmstorage", "tag": "custom"}}}"#,
        );
        let component = c.component(Tier::Storage).unwrap();
        assert_eq!(
            image(component, Tier::Storage, &ClusterBuilder::default()).unwrap(),
            "registry/vmstorage:custom"
        );
    }

    #[test]
    fn test_empty_repository_is_rejected() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {"image": {"repository": " "}}}"#);
        assert_eq!(
            template(&c, Tier::Storage).unwrap_err(),
            BuildError::MissingImage("vmstorage".into())
        );
    }

    #[test]
    fn test_common_args_sorted_with_logger_flags() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"extraArgs": {"search.maxUniqueTimeseries": "100", "-dedup.minScrapeInterval": "1s"}, "logLevel": "WARN"}}"#,
        );
        assert_eq!(
            common_args(c.component(Tier::Storage).unwrap()),
            vec![
                "-dedup.minScrapeInterval=1s",
                "-loggerLevel=WARN",
                "-search.maxUniqueTimeseries=100",
            ]
        );
    }

    #[test]
    fn test_resources_are_validated() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"resources": {"requests": {"cpu": "500m", "memory": "1Gi"}, "limits": {"memory": "lots"}}}}"#,
        );
        match template(&c, Tier::Storage).unwrap_err() {
            BuildError::InvalidQuantity { field, value, .. } => {
                assert_eq!(field, "limits.memory");
                assert_eq!(value, "lots");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_template_carries_scheduling_constraints() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "imagePullSecrets": [{"name": "regcred"}],
                "vmstorage": {"nodeSelector": {"disk": "ssd"},
                               "affinity": {"podAntiAffinity": {"requiredDuringSchedulingIgnoredDuringExecution": [
                                   {"labelSelector": {"matchLabels": {"app.kubernetes.io/name": "vmstorage"}},
                                    "topologyKey": "kubernetes.io/hostname"}]}},
                               "tolerations": [{"key": "dedicated", "operator": "Exists", "effect": "NoSchedule"}],
                               "priorityClassName": "high",
                               "extraEnvs": [{"name": "A", "value": "1"}, {"name": "B", "valueFromSecret": {"name": "s", "key": "k"}}]}}"#,
        );
        let tpl = template(&c, Tier::Storage).unwrap();
        let spec = tpl.spec.unwrap();

        assert_eq!(spec.node_selector.unwrap().get("disk").map(String::as_str), Some("ssd"));
        assert_eq!(spec.tolerations.unwrap().len(), 1);
        assert_eq!(spec.priority_class_name.as_deref(), Some("high"));
        assert_eq!(spec.image_pull_secrets.unwrap()[0].name.as_deref(), Some("regcred"));

        let anti = spec.affinity.unwrap().pod_anti_affinity.unwrap();
        let required = anti.required_during_scheduling_ignored_during_execution.unwrap();
        assert_eq!(required[0].topology_key, "kubernetes.io/hostname");

        let env = spec.containers[0].env.clone().unwrap();
        assert_eq!(env[0].value.as_deref(), Some("1"));
        assert!(env[1].value_from.is_some());
    }

    #[test]
    fn test_empty_node_selector_is_omitted() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {"nodeSelector": {}}}"#);
        let spec = template(&c, Tier::Storage).unwrap().spec.unwrap();
        assert_eq!(spec.node_selector, None);
        assert_eq!(spec.affinity, None);
        assert_eq!(spec.host_network, None);
        assert_eq!(spec.init_containers, None);
    }

    #[test]
    fn test_secrets_and_config_maps_are_mounted() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {"secrets": ["tls"], "configMaps": ["relabel"],
                "volumes": [{"name": "extra", "emptyDir": {}}],
                "volumeMounts": [{"name": "extra", "mountPath": "/extra"}]}}"#,
        );
        let spec = template(&c, Tier::Storage).unwrap().spec.unwrap();

        let volumes: Vec<_> = spec.volumes.unwrap().into_iter().map(|v| v.name).collect();
        assert_eq!(volumes, vec!["secret-tls", "configmap-relabel", "extra"]);

        let mounts: Vec<_> = spec.containers[0]
            .volume_mounts
            .clone()
            .unwrap()
            .into_iter()
            .map(|m| (m.mount_path, m.read_only))
            .collect();
        assert_eq!(
            mounts,
            vec![
                ("/etc/vm/secrets/tls".to_string(), Some(true)),
                ("/etc/vm/configmaps/relabel".to_string(), Some(true)),
                ("/extra".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_pod_overrides_are_applied() {
        let c = cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {
                "containers": [{"name": "backup", "image": "victoriametrics/vmbackup"}],
                "initContainers": [{"name": "fetch-secrets", "image": "busybox"}],
                "securityContext": {"runAsNonRoot": true, "fsGroup": 2000},
                "hostNetwork": true, "dnsPolicy": "ClusterFirstWithHostNet"}}"#,
        );
        let spec = template(&c, Tier::Storage).unwrap().spec.unwrap();

        let names: Vec<_> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["vmstorage", "backup"]);
        assert_eq!(spec.init_containers.unwrap()[0].name, "fetch-secrets");
        let security = spec.security_context.unwrap();
        assert_eq!(security.run_as_non_root, Some(true));
        assert_eq!(security.fs_group, Some(2000));
        assert_eq!(spec.host_network, Some(true));
        assert_eq!(spec.dns_policy.as_deref(), Some("ClusterFirstWithHostNet"));
    }

    #[test]
    fn test_container_probes_use_named_http_port() {
        let c = cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#);
        let tpl = template(&c, Tier::Storage).unwrap();
        let container = &tpl.spec.unwrap().containers[0];
        assert_eq!(container.name, "vmstorage");
        assert_eq!(container.args.as_deref(), Some(&["-a=1".to_string()][..]));
        let readiness = container.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.http_get.as_ref().unwrap().path.as_deref(), Some("/health"));
        assert_eq!(container.ports.as_ref().unwrap()[0].container_port, 8482);
    }
}
