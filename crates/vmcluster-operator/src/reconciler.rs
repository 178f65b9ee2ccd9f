//! Convergence engine for VMCluster resources.
//!
//! One pass reads the cluster fresh, validates it, then walks the tiers in
//! dependency order: vmstorage first, vmselect and vminsert only once storage
//! reports ready. Every decision comes from live objects, so a pass can be
//! replayed at any point with the same outcome.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use crate::constants::defaults;
use crate::crds::cluster::VMCluster;
use crate::crds::validation;
use crate::error::{OperatorError, Result};
use crate::merge;
use crate::resources::{TierBuilder, TierObjects};
use crate::status::{self, ClusterStatus, Observation};
use crate::store::{ObjectKey, ResourceStore, Workload};

/// What the dispatcher should do after a pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run again after this delay.
    Requeue(Duration),
    /// Wait for the next change notification.
    AwaitChange,
}

impl Action {
    pub fn requeue(after: Duration) -> Self {
        Action::Requeue(after)
    }

    pub fn await_change() -> Self {
        Action::AwaitChange
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        match self {
            Action::Requeue(d) => Some(*d),
            Action::AwaitChange => None,
        }
    }
}

/// Outcome of a convergence pass over one cluster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Convergence {
    pub observation: Observation,
    pub requeue_after: Option<Duration>,
}

impl Convergence {
    fn new(observation: Observation, recheck: Duration) -> Self {
        let requeue_after = observation.requeue_after(recheck);
        Self {
            observation,
            requeue_after,
        }
    }

    pub fn status(&self) -> ClusterStatus {
        self.observation.target()
    }

    pub fn reason(&self) -> Option<&str> {
        match &self.observation {
            Observation::Invalid(reason) => Some(reason),
            _ => None,
        }
    }

    fn action(&self) -> Action {
        match self.requeue_after {
            Some(d) => Action::requeue(d),
            None => Action::await_change(),
        }
    }
}

/// Tunables of the convergence engine.
#[derive(Clone, Debug)]
pub struct ReconcilerSettings {
    /// Re-check delay while a tier is rolling out.
    pub recheck: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            recheck: Duration::from_secs(defaults::REQUEUE_EXPANDING_SECS),
        }
    }
}

/// Reconciler for VMCluster.
pub struct Reconciler<S, B> {
    store: Arc<S>,
    builder: B,
    settings: ReconcilerSettings,
}

impl<S, B> Reconciler<S, B>
where
    S: ResourceStore,
    B: TierBuilder,
{
    pub fn new(store: Arc<S>, builder: B, settings: ReconcilerSettings) -> Self {
        Self {
            store,
            builder,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Main reconciliation entry point, invoked by the dispatcher.
    ///
    /// Validation and build failures are reported on the status and end the
    /// pass successfully; only transient store errors come back as `Err`.
    #[instrument(skip(self, key), fields(cluster = %key))]
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Action> {
        let Some(cluster) = self.store.get_cluster(key).await? else {
            debug!("cluster is gone, nothing to do");
            return Ok(Action::await_change());
        };

        if cluster.metadata.deletion_timestamp.is_some() {
            debug!("cluster is being deleted, owned objects are collected by the platform");
            return Ok(Action::await_change());
        }

        let convergence = match self.converge(&cluster).await {
            Ok(c) => c,
            Err(e) if e.is_user_correctable() => {
                Convergence::new(Observation::Invalid(e.to_string()), self.settings.recheck)
            }
            Err(OperatorError::NotFound(what)) => {
                debug!(%what, "object vanished mid-pass, nothing to do");
                return Ok(Action::await_change());
            }
            Err(e) => {
                self.record_failure(key).await;
                return Err(e);
            }
        };

        match self.persist_status(&cluster, &convergence.observation).await {
            Ok(()) => {}
            Err(OperatorError::NotFound(_)) => return Ok(Action::await_change()),
            Err(e) => {
                self.record_failure(key).await;
                return Err(e);
            }
        }

        Ok(convergence.action())
    }

    /// Drive the cluster's tiers one step closer to the declared state.
    pub async fn converge(&self, cluster: &VMCluster) -> Result<Convergence> {
        let recheck = self.settings.recheck;

        if let Err(reason) = validation::validate(cluster) {
            warn!(name = %cluster.name_any(), %reason, "cluster spec is invalid");
            return Ok(Convergence::new(Observation::Invalid(reason), recheck));
        }

        // Build every tier up front so a broken dependent tier fails the
        // cluster before anything is written.
        let mut planned: Vec<TierObjects> = Vec::new();
        for tier in cluster.declared_tiers() {
            match self.builder.build(cluster, tier) {
                Ok(objects) => planned.push(objects),
                Err(e) => {
                    let reason = e.to_string();
                    warn!(name = %cluster.name_any(), %tier, %reason, "cannot build tier");
                    return Ok(Convergence::new(Observation::Invalid(reason), recheck));
                }
            }
        }

        for objects in &planned {
            let tier = objects.tier;
            if !self.converge_tier(cluster, objects).await? {
                info!(name = %cluster.name_any(), %tier, "tier is not ready yet");
                return Ok(Convergence::new(Observation::Pending(tier), recheck));
            }
            debug!(name = %cluster.name_any(), %tier, "tier is ready");
        }

        Ok(Convergence::new(Observation::Ready, recheck))
    }

    /// Apply a tier's objects; returns whether its workload is ready.
    async fn converge_tier(&self, cluster: &VMCluster, objects: &TierObjects) -> Result<bool> {
        let mut ready = true;
        for desired in objects.ordered() {
            let live = self.apply(cluster, desired).await?;
            ready &= live.is_ready();
        }
        Ok(ready)
    }

    /// Create the object if absent, otherwise update it when a managed field
    /// differs. Returns the live object after the call.
    async fn apply(&self, cluster: &VMCluster, desired: &Workload) -> Result<Workload> {
        let kind = desired.kind();
        let key = desired.key();

        let Some(live) = self.store.get_workload(kind, &key).await? else {
            info!(kind = %kind, name = %key, "creating");
            return self.store.create_workload(desired).await;
        };

        if let Some(owner) = live.controller_owner() {
            if Some(&owner.uid) != cluster.metadata.uid.as_ref() {
                return Err(OperatorError::Ownership(format!(
                    "{kind} {key} is controlled by {} {}",
                    owner.kind, owner.name
                )));
            }
        }

        let live_value = live.to_value()?;
        let mut desired_value = desired.to_value()?;
        merge::preserve_immutable(kind, &mut desired_value, &live_value);

        if merge::is_subset(&desired_value, &live_value) {
            debug!(kind = %kind, name = %key, "up to date");
            return Ok(live);
        }

        let changed = merge::changed_fields(&desired_value, &live_value);
        info!(kind = %kind, name = %key, ?changed, "updating");
        let merged = Workload::from_value(kind, merge::merge(&live_value, &desired_value))?;
        self.store.update_workload(&merged).await
    }

    /// Write the derived status, only if it differs from the persisted one.
    async fn persist_status(&self, cluster: &VMCluster, observation: &Observation) -> Result<()> {
        let previous = cluster.current_status();
        let next = status::next_status(&previous, observation, Utc::now());
        if !status::needs_write(&previous, &next) {
            return Ok(());
        }

        info!(
            name = %cluster.name_any(),
            from = %previous.cluster_status,
            to = %next.cluster_status,
            reason = next.reason.as_deref().unwrap_or(""),
            "updating cluster status"
        );
        self.store.update_cluster_status(cluster, &next).await?;
        Ok(())
    }

    /// Best-effort bump of `updateFailCount` after a transient failure.
    async fn record_failure(&self, key: &ObjectKey) {
        let cluster = match self.store.get_cluster(key).await {
            Ok(Some(c)) => c,
            Ok(None) => return,
            Err(e) => {
                debug!(error = %e, "cannot read cluster to record failure");
                return;
            }
        };
        let next = status::record_failure(&cluster.current_status());
        if let Err(e) = self.store.update_cluster_status(&cluster, &next).await {
            debug!(error = %e, "cannot record failure on status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::cluster::VMClusterSpec;
    use crate::resources::ClusterBuilder;
    use crate::store::memory::{Fault, StoreOp};
    use crate::store::{InMemoryStore, WorkloadKind};

    fn cluster(spec_json: &str) -> VMCluster {
        let spec: VMClusterSpec = serde_json::from_str(spec_json).unwrap();
        let mut c = VMCluster::new("main", spec);
        c.metadata.namespace = Some("monitoring".into());
        c
    }

    fn reconciler() -> Reconciler<InMemoryStore, ClusterBuilder> {
        Reconciler::new(
            Arc::new(InMemoryStore::new()),
            ClusterBuilder::default(),
            ReconcilerSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_missing_cluster_is_nothing_to_do() {
        let r = reconciler();
        let action = r.reconcile(&ObjectKey::new("monitoring", "ghost")).await.unwrap();
        assert_eq!(action, Action::AwaitChange);
        assert!(r.store().writes().is_empty());
    }

    #[tokio::test]
    async fn test_first_pass_creates_storage_and_waits() {
        let r = reconciler();
        let c = r.store().apply_cluster(cluster(
            r#"{"retentionPeriod": "1", "vmstorage": {}, "vminsert": {}}"#,
        ));

        let action = r.reconcile(&c.key()).await.unwrap();
        assert_eq!(action, Action::Requeue(Duration::from_secs(10)));

        let names: Vec<_> = r.store().workloads().iter().map(|w| w.key().name).collect();
        assert_eq!(names, vec!["vmstorage-main", "vmstorage-main"]);
        let status = r.store().cluster(&c.key()).unwrap().current_status();
        assert_eq!(status.cluster_status, ClusterStatus::Expanding);
    }

    #[tokio::test]
    async fn test_converge_reports_invalid_without_writes() {
        let r = reconciler();
        let c = r.store().apply_cluster(cluster(r#"{"retentionPeriod": "forever"}"#));
        let conv = r.converge(&c).await.unwrap();
        assert_eq!(conv.status(), ClusterStatus::Failed);
        assert!(conv.reason().unwrap().contains("retentionPeriod"));
        assert_eq!(conv.requeue_after, None);
        assert!(r.store().workloads().is_empty());
    }

    #[tokio::test]
    async fn test_store_rejection_marks_cluster_failed() {
        let r = reconciler();
        let c = r.store().apply_cluster(cluster(r#"{"retentionPeriod": "1", "vmstorage": {}}"#));
        r.store().inject_fault(StoreOp::CreateWorkload, Fault::Invalid);

        assert_eq!(r.reconcile(&c.key()).await.unwrap(), Action::AwaitChange);
        let status = r.store().cluster(&c.key()).unwrap().current_status();
        assert_eq!(status.cluster_status, ClusterStatus::Failed);
        assert!(status.reason.unwrap().contains("rejected"));
    }

    #[tokio::test]
    async fn test_foreign_owner_is_not_taken_over() {
        let r = reconciler();
        let spec = r#"{"retentionPeriod": "1", "vmstorage": {"name": "shared"}}"#;
        let mut other = VMCluster::new("other", serde_json::from_str(spec).unwrap());
        other.metadata.namespace = Some("monitoring".into());
        let other = r.store().apply_cluster(other);
        let main = r.store().apply_cluster(cluster(spec));

        r.reconcile(&other.key()).await.unwrap();
        r.reconcile(&main.key()).await.unwrap();

        let status = r.store().cluster(&main.key()).unwrap().current_status();
        assert_eq!(status.cluster_status, ClusterStatus::Failed);
        assert!(status.reason.unwrap().contains("controlled by VMCluster other"));
        let svc = r
            .store()
            .workload(WorkloadKind::Service, &ObjectKey::new("monitoring", "shared"))
            .unwrap();
        assert_eq!(svc.controller_owner().unwrap().name, "other");
    }
}
