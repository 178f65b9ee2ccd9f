//! Lease-based leader election (coordination.k8s.io/v1 `Lease`).
//!
//! Only the replica holding the lease runs reconcile workers. The holder
//! refreshes `renewTime` every renew interval; any replica may take the lease
//! over once `renewTime + leaseDurationSeconds` has passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use crate::error::{OperatorError, Result};

/// Lease settings for one operator replica.
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    /// Identity written to `holderIdentity`, normally the pod name.
    pub holder_id: String,
    pub lease_duration_secs: i32,
    pub renew_interval_secs: u64,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        let holder_id = std::env::var("POD_NAME")
            .unwrap_or_else(|_| format!("vm-operator-{}", uuid::Uuid::new_v4()));
        let namespace = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".into());

        Self {
            lease_name: "vm-operator-leader".into(),
            namespace,
            holder_id,
            lease_duration_secs: 15,
            renew_interval_secs: 5,
        }
    }
}

/// Leadership flag shared between the election loop and the controller.
#[derive(Clone, Default)]
pub struct LeaderStatus {
    is_leader: Arc<AtomicBool>,
}

impl LeaderStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    /// Used when leader election is disabled.
    pub fn force_leader(&self) {
        self.is_leader.store(true, Ordering::Relaxed);
    }

    fn set_leader(&self, v: bool) {
        self.is_leader.store(v, Ordering::Relaxed);
    }

    /// Resolve once this replica holds the lease.
    pub async fn acquired(&self, poll: Duration) {
        while !self.is_leader() {
            tokio::time::sleep(poll).await;
        }
    }

    /// Resolve once this replica no longer holds the lease.
    pub async fn lost(&self, poll: Duration) {
        while self.is_leader() {
            tokio::time::sleep(poll).await;
        }
    }
}

/// What to do with an existing lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LeaseDecision {
    Renew,
    TakeOver,
    Wait,
}

fn decide(lease: &Lease, config: &LeaderElectionConfig, now: DateTime<Utc>) -> LeaseDecision {
    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());
    if holder == Some(config.holder_id.as_str()) {
        return LeaseDecision::Renew;
    }
    if holder.is_none() {
        return LeaseDecision::TakeOver;
    }

    let duration = spec
        .and_then(|s| s.lease_duration_seconds)
        .unwrap_or(config.lease_duration_secs);
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(renewed)) if *renewed + chrono::Duration::seconds(duration.into()) > now => {
            LeaseDecision::Wait
        }
        _ => LeaseDecision::TakeOver,
    }
}

fn claimed(mut lease: Lease, config: &LeaderElectionConfig, now: DateTime<Utc>) -> Lease {
    let spec = lease.spec.get_or_insert_with(LeaseSpec::default);
    if spec.holder_identity.as_deref() != Some(config.holder_id.as_str()) {
        spec.holder_identity = Some(config.holder_id.clone());
        spec.acquire_time = Some(MicroTime(now));
        spec.lease_transitions = Some(spec.lease_transitions.unwrap_or(0) + 1);
    }
    spec.lease_duration_seconds = Some(config.lease_duration_secs);
    spec.renew_time = Some(MicroTime(now));
    lease
}

fn fresh_lease(config: &LeaderElectionConfig, now: DateTime<Utc>) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(config.holder_id.clone()),
            lease_duration_seconds: Some(config.lease_duration_secs),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(0),
        }),
    }
}

async fn try_acquire_or_renew(api: &Api<Lease>, config: &LeaderElectionConfig) -> Result<bool> {
    let now = Utc::now();
    let written = match api.get_opt(&config.lease_name).await? {
        None => api
            .create(&PostParams::default(), &fresh_lease(config, now))
            .await
            .map(|_| ()),
        Some(existing) => match decide(&existing, config, now) {
            LeaseDecision::Wait => {
                debug!(lease = %config.lease_name, "lease held by another replica");
                return Ok(false);
            }
            LeaseDecision::Renew | LeaseDecision::TakeOver => api
                .replace(&config.lease_name, &PostParams::default(), &claimed(existing, config, now))
                .await
                .map(|_| ()),
        },
    };

    match written.map_err(OperatorError::from_kube) {
        Ok(()) => Ok(true),
        Err(OperatorError::Conflict(_)) => {
            debug!(lease = %config.lease_name, "lost the race for the lease");
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

/// Keep acquiring or renewing the lease. Never returns.
pub async fn run(client: Client, config: LeaderElectionConfig, status: LeaderStatus) {
    let api: Api<Lease> = Api::namespaced(client, &config.namespace);
    let interval = Duration::from_secs(config.renew_interval_secs.max(1));

    loop {
        let held = match try_acquire_or_renew(&api, &config).await {
            Ok(held) => held,
            Err(e) => {
                warn!(error = %e, "leader election failed");
                false
            }
        };
        if held && !status.is_leader() {
            info!(holder = %config.holder_id, lease = %config.lease_name, "acquired leadership");
        } else if !held && status.is_leader() {
            warn!(holder = %config.holder_id, "lost leadership");
        }
        status.set_leader(held);

        tokio::time::sleep(interval).await;
    }
}

/// Hand the lease back on shutdown so another replica can take over at once.
pub async fn step_down(client: &Client, config: &LeaderElectionConfig) {
    let api: Api<Lease> = Api::namespaced(client.clone(), &config.namespace);
    let existing = match api.get_opt(&config.lease_name).await {
        Ok(Some(lease)) => lease,
        Ok(None) => return,
        Err(e) => {
            debug!(error = %e, "cannot read lease for step-down");
            return;
        }
    };

    let holder = existing.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
    if holder != Some(config.holder_id.as_str()) {
        return;
    }
    let mut released = existing.clone();
    if let Some(spec) = released.spec.as_mut() {
        spec.holder_identity = None;
        spec.renew_time = None;
    }
    match api.replace(&config.lease_name, &PostParams::default(), &released).await {
        Ok(_) => info!("stepped down from leadership"),
        Err(e) => warn!(error = %e, "failed to step down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(holder: &str) -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_name: "vm-operator-leader".into(),
            namespace: "ops".into(),
            holder_id: holder.into(),
            lease_duration_secs: 15,
            renew_interval_secs: 5,
        }
    }

    fn held_by(holder: &str, renewed: DateTime<Utc>) -> Lease {
        fresh_lease(&config(holder), renewed)
    }

    #[test]
    fn test_status_clone_shares_state() {
        let status = LeaderStatus::new();
        let clone = status.clone();
        assert!(!clone.is_leader());
        status.force_leader();
        assert!(clone.is_leader());
    }

    #[test]
    fn test_own_lease_is_renewed() {
        let now = Utc::now();
        assert_eq!(decide(&held_by("a", now), &config("a"), now), LeaseDecision::Renew);
    }

    #[test]
    fn test_live_foreign_lease_is_respected() {
        let now = Utc::now();
        let lease = held_by("b", now - chrono::Duration::seconds(10));
        assert_eq!(decide(&lease, &config("a"), now), LeaseDecision::Wait);
    }

    #[test]
    fn test_expired_or_released_lease_is_taken_over() {
        let now = Utc::now();
        let expired = held_by("b", now - chrono::Duration::seconds(16));
        assert_eq!(decide(&expired, &config("a"), now), LeaseDecision::TakeOver);

        let mut released = held_by("b", now);
        if let Some(spec) = released.spec.as_mut() {
            spec.holder_identity = None;
        }
        assert_eq!(decide(&released, &config("a"), now), LeaseDecision::TakeOver);
    }

    #[test]
    fn test_take_over_counts_transition() {
        let now = Utc::now();
        let lease = claimed(held_by("b", now - chrono::Duration::seconds(60)), &config("a"), now);
        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("a"));
        assert_eq!(spec.lease_transitions, Some(1));
        assert_eq!(spec.renew_time, Some(MicroTime(now)));

        let renewed = claimed(held_by("a", now), &config("a"), now);
        assert_eq!(renewed.spec.unwrap().lease_transitions, Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquired_resolves_after_flag_flips() {
        let status = LeaderStatus::new();
        let waiter = {
            let status = status.clone();
            tokio::spawn(async move { status.acquired(Duration::from_secs(1)).await })
        };
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!waiter.is_finished());
        status.force_leader();
        waiter.await.unwrap();
    }
}
