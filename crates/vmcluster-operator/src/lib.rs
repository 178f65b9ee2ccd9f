//! VictoriaMetrics cluster operator.
//!
//! Converges `VMCluster` resources into their vmstorage, vmselect and
//! vminsert tiers, reporting progress on the cluster's status.

pub mod config;
pub mod constants;
pub mod controller;
pub mod crds;
pub mod error;
pub mod leader_election;
pub mod merge;
pub mod queue;
pub mod reconciler;
pub mod resources;
pub mod status;
pub mod store;
pub mod telemetry;

pub use crds::cluster::{VMCluster, VMClusterSpec, VMClusterStatus};
pub use error::{OperatorError, Result};
pub use reconciler::{Action, Reconciler, ReconcilerSettings};
pub use status::ClusterStatus;
pub use store::{InMemoryStore, KubeStore, ObjectKey, ResourceStore};
