//! Convergence scenarios against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use vmcluster_operator::resources::ClusterBuilder;
use vmcluster_operator::store::memory::{Fault, StoreOp};
use vmcluster_operator::store::{Workload, WorkloadKind};
use vmcluster_operator::{
    Action, ClusterStatus, InMemoryStore, ObjectKey, Reconciler, ReconcilerSettings, VMCluster,
    VMClusterSpec,
};

const NS: &str = "monitoring";

fn reconciler() -> Reconciler<InMemoryStore, ClusterBuilder> {
    Reconciler::new(
        Arc::new(InMemoryStore::new()),
        ClusterBuilder::default(),
        ReconcilerSettings::default(),
    )
}

fn cluster(name: &str, spec: serde_json::Value) -> VMCluster {
    let spec: VMClusterSpec = serde_json::from_value(spec).unwrap();
    let mut c = VMCluster::new(name, spec);
    c.metadata.namespace = Some(NS.into());
    c
}

fn three_node_storage() -> serde_json::Value {
    serde_json::json!({
        "retentionPeriod": "1",
        "vmstorage": {"replicaCount": 3},
        "vmselect": {"replicaCount": 2},
        "vminsert": {"replicaCount": 2}
    })
}

fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NS, name)
}

fn kinds_of(store: &InMemoryStore, prefix: &str) -> Vec<WorkloadKind> {
    store
        .workloads()
        .iter()
        .filter(|w| w.key().name.starts_with(prefix))
        .map(Workload::kind)
        .collect()
}

#[tokio::test]
async fn test_storage_partially_ready_stays_expanding() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));

    r.reconcile(&c.key()).await.unwrap();
    assert!(r
        .store()
        .set_ready_replicas(WorkloadKind::StatefulSet, &key("vmstorage-main"), 2));

    let action = r.reconcile(&c.key()).await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(10)));

    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Expanding);
    assert_eq!(status.storage_status.status, ClusterStatus::Expanding);
    assert!(kinds_of(r.store(), "vmselect").is_empty());
    assert!(kinds_of(r.store(), "vminsert").is_empty());
}

#[tokio::test]
async fn test_storage_ready_makes_cluster_operational() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster(
        "main",
        serde_json::json!({"retentionPeriod": "1", "vmstorage": {"replicaCount": 3}}),
    ));

    r.reconcile(&c.key()).await.unwrap();
    r.store()
        .set_ready_replicas(WorkloadKind::StatefulSet, &key("vmstorage-main"), 3);

    let action = r.reconcile(&c.key()).await.unwrap();
    assert_eq!(action, Action::AwaitChange);

    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Operational);
    assert_eq!(status.storage_status.status, ClusterStatus::Operational);
    assert_eq!(status.update_fail_count, 0);
    assert_eq!(status.reason, None);
    let last_sync = status.last_sync.expect("lastSync is stamped");
    assert!(DateTime::parse_from_rfc3339(&last_sync).is_ok());
}

#[tokio::test]
async fn test_invalid_volume_size_fails_without_objects() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster(
        "main",
        serde_json::json!({
            "retentionPeriod": "1",
            "vmstorage": {"replicaCount": 3, "storage": {"size": "lots"}}
        }),
    ));

    let action = r.reconcile(&c.key()).await.unwrap();
    assert_eq!(action, Action::AwaitChange);

    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Failed);
    assert!(status
        .reason
        .unwrap()
        .starts_with("invalid persistent volume spec for vmstorage-main"));
    assert_eq!(status.last_sync, None);
    assert!(r.store().workloads().is_empty());
}

#[tokio::test]
async fn test_full_rollout_in_tier_order() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));

    r.reconcile(&c.key()).await.unwrap();
    assert_eq!(
        kinds_of(r.store(), "vmstorage"),
        vec![WorkloadKind::StatefulSet, WorkloadKind::Service]
    );

    r.store().mark_all_ready();
    r.reconcile(&c.key()).await.unwrap();
    assert_eq!(
        kinds_of(r.store(), "vmselect"),
        vec![WorkloadKind::StatefulSet, WorkloadKind::Service]
    );
    assert!(kinds_of(r.store(), "vminsert").is_empty());

    r.store().mark_all_ready();
    r.reconcile(&c.key()).await.unwrap();
    assert_eq!(
        kinds_of(r.store(), "vminsert"),
        vec![WorkloadKind::Deployment, WorkloadKind::Service]
    );

    r.store().mark_all_ready();
    assert_eq!(r.reconcile(&c.key()).await.unwrap(), Action::AwaitChange);
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Operational);
}

#[tokio::test]
async fn test_objects_are_owned_by_cluster() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));
    r.reconcile(&c.key()).await.unwrap();

    for w in r.store().workloads() {
        let owner = w.controller_owner().expect("controller owner");
        assert_eq!(owner.kind, "VMCluster");
        assert_eq!(owner.name, "main");
        assert_eq!(Some(&owner.uid), c.metadata.uid.as_ref());
    }
}

#[tokio::test]
async fn test_select_lists_every_storage_node() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));
    r.reconcile(&c.key()).await.unwrap();
    r.store().mark_all_ready();
    r.reconcile(&c.key()).await.unwrap();

    let Some(Workload::StatefulSet(select)) =
        r.store().workload(WorkloadKind::StatefulSet, &key("vmselect-main"))
    else {
        panic!("vmselect statefulset missing");
    };
    let args = select.spec.unwrap().template.spec.unwrap().containers[0]
        .args
        .clone()
        .unwrap();
    let nodes: Vec<_> = args.iter().filter(|a| a.starts_with("-storageNode=")).collect();
    assert_eq!(
        nodes,
        vec![
            "-storageNode=vmstorage-main-0.vmstorage-main.monitoring.svc:8401",
            "-storageNode=vmstorage-main-1.vmstorage-main.monitoring.svc:8401",
            "-storageNode=vmstorage-main-2.vmstorage-main.monitoring.svc:8401",
        ]
    );
}

#[tokio::test]
async fn test_scale_up_updates_live_workload() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster(
        "main",
        serde_json::json!({"retentionPeriod": "1", "vmstorage": {"replicaCount": 1}}),
    ));
    r.reconcile(&c.key()).await.unwrap();
    r.store().mark_all_ready();
    r.reconcile(&c.key()).await.unwrap();

    let mut edited = r.store().cluster(&c.key()).unwrap();
    if let Some(storage) = edited.spec.vmstorage.as_mut() {
        storage.component.replica_count = Some(3);
    }
    r.store().apply_cluster(edited);

    let action = r.reconcile(&c.key()).await.unwrap();
    assert_eq!(action, Action::Requeue(Duration::from_secs(10)));
    let Some(Workload::StatefulSet(sts)) =
        r.store().workload(WorkloadKind::StatefulSet, &key("vmstorage-main"))
    else {
        panic!("vmstorage statefulset missing");
    };
    assert_eq!(sts.spec.unwrap().replicas, Some(3));
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Expanding);
}

#[tokio::test]
async fn test_transient_failure_counts_then_recovers() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));
    r.store().inject_fault(StoreOp::CreateWorkload, Fault::Unavailable);

    assert!(r.reconcile(&c.key()).await.is_err());
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.update_fail_count, 1);
    assert_eq!(status.cluster_status, ClusterStatus::Expanding);

    r.store().inject_fault(StoreOp::GetWorkload, Fault::Unavailable);
    assert!(r.reconcile(&c.key()).await.is_err());
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.update_fail_count, 2);

    r.reconcile(&c.key()).await.unwrap();
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.update_fail_count, 0);
    assert_eq!(kinds_of(r.store(), "vmstorage").len(), 2);
}

#[tokio::test]
async fn test_status_conflict_is_retried() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster(
        "main",
        serde_json::json!({"retentionPeriod": "1", "vmstorage": {}}),
    ));
    r.reconcile(&c.key()).await.unwrap();
    r.store().mark_all_ready();

    r.store().inject_fault(StoreOp::UpdateStatus, Fault::Conflict);
    let err = r.reconcile(&c.key()).await.unwrap_err();
    assert!(err.is_transient());

    r.reconcile(&c.key()).await.unwrap();
    let status = r.store().cluster(&c.key()).unwrap().current_status();
    assert_eq!(status.cluster_status, ClusterStatus::Operational);
    assert_eq!(status.update_fail_count, 0);
}

#[tokio::test]
async fn test_deleted_cluster_is_nothing_to_do() {
    let r = reconciler();
    let c = r.store().apply_cluster(cluster("main", three_node_storage()));
    r.reconcile(&c.key()).await.unwrap();

    assert!(r.store().delete_cluster(&c.key()));
    assert!(r.store().workloads().is_empty());

    r.store().clear_writes();
    assert_eq!(r.reconcile(&c.key()).await.unwrap(), Action::AwaitChange);
    assert!(r.store().writes().is_empty());
}
