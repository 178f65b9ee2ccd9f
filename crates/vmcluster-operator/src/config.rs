//! Command line and environment configuration.

use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::constants::defaults;
use crate::controller::ControllerSettings;
use crate::leader_election::LeaderElectionConfig;
use crate::reconciler::ReconcilerSettings;
use crate::resources::ClusterBuilder;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "vmcluster-operator",
    about = "Kubernetes operator for VictoriaMetrics clusters",
    version
)]
pub struct OperatorConfig {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Number of concurrent reconcile workers
    #[arg(short = 'w', long, env = "VM_OPERATOR_WORKERS", default_value_t = defaults::WORKERS)]
    pub workers: usize,

    /// Only watch this namespace (all namespaces when unset)
    #[arg(long, env = "VM_OPERATOR_WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Re-check delay while a tier is rolling out, in seconds
    #[arg(long, env = "VM_OPERATOR_RECHECK_SECS", default_value_t = defaults::REQUEUE_EXPANDING_SECS)]
    pub recheck_secs: u64,

    /// First retry delay after a transient error, in seconds
    #[arg(long, env = "VM_OPERATOR_BACKOFF_BASE_SECS", default_value_t = defaults::BACKOFF_BASE_SECS)]
    pub backoff_base_secs: u64,

    /// Upper bound of the retry delay, in seconds
    #[arg(long, env = "VM_OPERATOR_BACKOFF_MAX_SECS", default_value_t = defaults::BACKOFF_MAX_SECS)]
    pub backoff_max_secs: u64,

    /// Image tag used when a tier does not set one
    #[arg(long, env = "VM_OPERATOR_DEFAULT_IMAGE_TAG", default_value = defaults::IMAGE_TAG)]
    pub default_image_tag: String,

    /// Log level (error, warn, info, debug, trace); RUST_LOG takes precedence
    #[arg(short = 'l', long, env = "VM_OPERATOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Field manager recorded on every write
    #[arg(long, env = "VM_OPERATOR_FIELD_MANAGER", default_value = defaults::FIELD_MANAGER)]
    pub field_manager: String,

    /// Run workers only while holding the leader lease
    #[arg(long, env = "VM_OPERATOR_LEADER_ELECTION", default_value = "false")]
    pub leader_election: bool,

    /// Name of the leader Lease object
    #[arg(long, env = "VM_OPERATOR_LEASE_NAME", default_value = "vm-operator-leader")]
    pub lease_name: String,

    /// Namespace of the leader Lease (POD_NAMESPACE, then "default")
    #[arg(long, env = "VM_OPERATOR_LEASE_NAMESPACE")]
    pub lease_namespace: Option<String>,

    /// Lease validity, in seconds
    #[arg(long, env = "VM_OPERATOR_LEASE_DURATION_SECS", default_value = "15")]
    pub lease_duration_secs: i32,

    /// Lease renewal interval, in seconds
    #[arg(long, env = "VM_OPERATOR_LEASE_RENEW_SECS", default_value = "5")]
    pub lease_renew_secs: u64,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    #[command(about = "Run the operator (default)")]
    Run,

    #[command(about = "Print the VMCluster CRD as YAML")]
    Crd,
}

impl OperatorConfig {
    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Run)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            recheck: Duration::from_secs(self.recheck_secs),
        }
    }

    pub fn controller_settings(&self) -> ControllerSettings {
        ControllerSettings {
            workers: self.workers,
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs.max(self.backoff_base_secs)),
        }
    }

    pub fn builder(&self) -> ClusterBuilder {
        ClusterBuilder::new(self.default_image_tag.clone())
    }

    pub fn leader_election_config(&self) -> LeaderElectionConfig {
        let mut config = LeaderElectionConfig {
            lease_name: self.lease_name.clone(),
            lease_duration_secs: self.lease_duration_secs,
            renew_interval_secs: self.lease_renew_secs,
            ..Default::default()
        };
        if let Some(ns) = &self.lease_namespace {
            config.namespace = ns.clone();
        }
        config
    }
}
