//! VictoriaMetrics cluster operator binary.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::CustomResourceExt;
use tokio::signal;
use tracing::{info, warn};

use vmcluster_operator::config::{Command, OperatorConfig};
use vmcluster_operator::leader_election::{self, LeaderStatus};
use vmcluster_operator::store::kubernetes::run_watchers;
use vmcluster_operator::store::{EventBus, KubeStore};
use vmcluster_operator::{controller, telemetry, Reconciler, VMCluster};

const LEADER_POLL: Duration = Duration::from_secs(1);

/// Wait for SIGTERM or SIGINT.
async fn termination() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
            _ = sigint.recv() => info!("Received SIGINT, shutting down"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = OperatorConfig::parse();

    if config.command() == Command::Crd {
        print!("{}", serde_yaml::to_string(&VMCluster::crd())?);
        return Ok(());
    }

    telemetry::init(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "Starting VMCluster operator");

    let client = kube::Client::try_default()
        .await
        .context("cannot create Kubernetes client")?;

    let store = Arc::new(KubeStore::new(client.clone(), config.field_manager.clone()));
    let reconciler = Arc::new(Reconciler::new(
        store,
        config.builder(),
        config.reconciler_settings(),
    ));

    let (bus, events) = EventBus::channel();
    let watchers = tokio::spawn(run_watchers(
        client.clone(),
        config.watch_namespace.clone(),
        bus,
    ));

    let leader = LeaderStatus::new();
    let lease = config.leader_election_config();
    let terminated = termination();
    tokio::pin!(terminated);

    if config.leader_election {
        tokio::spawn(leader_election::run(client.clone(), lease.clone(), leader.clone()));
        info!(lease = %lease.lease_name, holder = %lease.holder_id, "Waiting for leadership");
        tokio::select! {
            _ = leader.acquired(LEADER_POLL) => {}
            res = &mut terminated => {
                watchers.abort();
                return res;
            }
        }
    } else {
        leader.force_leader();
    }

    let shutdown = async {
        tokio::select! {
            res = &mut terminated => {
                if let Err(e) = res {
                    warn!(error = %e, "signal handler failed");
                }
            }
            _ = leader.lost(LEADER_POLL) => warn!("Leadership lost, stopping workers"),
        }
    };
    controller::run(reconciler, events, config.controller_settings(), shutdown).await;

    watchers.abort();
    if config.leader_election {
        leader_election::step_down(&client, &lease).await;
    }
    info!("VMCluster operator stopped");
    Ok(())
}
