pub mod cluster;
pub mod common;
pub mod defaults;
pub mod validation;

pub use cluster::{
    Tier, TierStatus, VMCluster, VMClusterSpec, VMClusterStatus, VMInsertSpec, VMSelectSpec,
    VMStorageSpec,
};
