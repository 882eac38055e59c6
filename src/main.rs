// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mhc_operator::config::Config;
use mhc_operator::leader::{LeaderElectionConfig, LeaderElector};
use mhc_operator::operator::run_operator;

/// Keeps the machine health check controller scaled to the MachineHealthCheck feature toggle
#[derive(Parser, Debug)]
#[command(name = "machine-health-check-operator")]
#[command(version)]
struct Args {
    /// Path to a kubeconfig. Defaults to in-cluster config or $KUBECONFIG
    #[arg(long)]
    kubeconfig: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "Starting machine health check operator");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        namespace = %config.namespace,
        identity = %config.identity,
        workers = config.workers,
        "Configuration loaded"
    );

    // Create Kubernetes client
    let client = create_client(args.kubeconfig.as_deref())
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let elector = LeaderElector::new(client.clone(), LeaderElectionConfig::from_config(&config));
    elector
        .run(shutdown, |leading| run_operator(client, config, leading))
        .await
        .context("Operator stopped with an error")?;

    info!("Machine health check operator stopped");
    Ok(())
}

async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let Some(path) = kubeconfig else {
        return Ok(Client::try_default().await?);
    };

    let kubeconfig = Kubeconfig::read_from(path)
        .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .context("Failed to load kubeconfig")?;
    Ok(Client::try_from(config)?)
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
        }
    }

    shutdown.cancel();
}
