//! Cluster status state machine.
//!
//! The persisted status is a cache derived from the live workload objects.
//! Every pass recomputes it from an [`Observation`] and only writes it back
//! when something other than `lastSync` changed. `lastSync` records the last
//! pass that left the cluster operational.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crds::cluster::{Tier, TierStatus, VMClusterStatus};

/// Operator-visible state of a cluster. Absent status means `Expanding`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ClusterStatus {
    #[default]
    Expanding,
    Operational,
    Failed,
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClusterStatus::Expanding => "expanding",
            ClusterStatus::Operational => "operational",
            ClusterStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// What a convergence pass found.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Observation {
    /// The spec is invalid or cannot be turned into workload objects.
    Invalid(String),
    /// This tier is still rolling out.
    Pending(Tier),
    /// Every declared tier is ready.
    Ready,
}

impl Observation {
    /// Target state for this observation.
    pub fn target(&self) -> ClusterStatus {
        match self {
            Observation::Invalid(_) => ClusterStatus::Failed,
            Observation::Pending(_) => ClusterStatus::Expanding,
            Observation::Ready => ClusterStatus::Operational,
        }
    }

    /// Delay before the next pass; `None` waits for a notification.
    pub fn requeue_after(&self, recheck: Duration) -> Option<Duration> {
        match self {
            Observation::Pending(_) => Some(recheck),
            Observation::Invalid(_) | Observation::Ready => None,
        }
    }

    fn storage_status(&self) -> ClusterStatus {
        match self {
            Observation::Invalid(_) => ClusterStatus::Failed,
            Observation::Pending(Tier::Storage) => ClusterStatus::Expanding,
            Observation::Pending(_) | Observation::Ready => ClusterStatus::Operational,
        }
    }
}

/// Compute the status a completed pass leaves behind.
///
/// Transient failures never reach this function; they only bump the fail
/// counter through [`record_failure`].
pub fn next_status(
    previous: &VMClusterStatus,
    observation: &Observation,
    now: DateTime<Utc>,
) -> VMClusterStatus {
    let cluster_status = observation.target();

    let mut next = VMClusterStatus {
        update_fail_count: match cluster_status {
            ClusterStatus::Failed => previous.update_fail_count,
            _ => 0,
        },
        last_sync: previous.last_sync.clone(),
        cluster_status,
        reason: match observation {
            Observation::Invalid(reason) => Some(reason.clone()),
            _ => None,
        },
        storage_status: TierStatus {
            status: observation.storage_status(),
        },
    };

    if cluster_status == ClusterStatus::Operational && needs_write(previous, &next) {
        next.last_sync = Some(timestamp(now));
    }
    next
}

/// Status after a pass that hit a transient store error.
pub fn record_failure(previous: &VMClusterStatus) -> VMClusterStatus {
    VMClusterStatus {
        update_fail_count: previous.update_fail_count.saturating_add(1),
        ..previous.clone()
    }
}

/// Whether `next` differs from `previous` on anything but `lastSync`.
pub fn needs_write(previous: &VMClusterStatus, next: &VMClusterStatus) -> bool {
    previous.update_fail_count != next.update_fail_count
        || previous.cluster_status != next.cluster_status
        || previous.reason != next.reason
        || previous.storage_status != next.storage_status
}

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}
