// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Shared watch caches started once per leadership term.

use crate::cache::{cache_pair, CacheSync, WatchedCache};
use crate::constants::labels::managed_by_selector;
use crate::notify::{NotificationSender, WatchedKind};
use crate::types::FeatureGate;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use kube_runtime::watcher::Config as WatcherConfig;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub struct ControllerContext {
    pub config_maps: WatchedCache<ConfigMap>,
    pub feature_gates: WatchedCache<FeatureGate>,
    pub deployments: WatchedCache<Deployment>,
    feeders: Vec<JoinHandle<()>>,
}

impl ControllerContext {
    /// Start watching the inputs and the managed Deployment in `namespace`.
    /// Every observed change is reported on `notifications`.
    pub fn start(
        client: Client,
        namespace: &str,
        notifications: NotificationSender,
        shutdown: &CancellationToken,
    ) -> Self {
        let (config_maps, config_map_feeder) =
            cache_pair::<ConfigMap>(WatchedKind::ConfigMap, notifications.clone());
        let (feature_gates, feature_gate_feeder) =
            cache_pair::<FeatureGate>(WatchedKind::FeatureGate, notifications.clone());
        let (deployments, deployment_feeder) =
            cache_pair::<Deployment>(WatchedKind::Deployment, notifications);

        let feeders = vec![
            tokio::spawn(config_map_feeder.run(
                Api::namespaced(client.clone(), namespace),
                WatcherConfig::default(),
                shutdown.clone(),
            )),
            // FeatureGate is cluster scoped
            tokio::spawn(feature_gate_feeder.run(
                Api::all(client.clone()),
                WatcherConfig::default(),
                shutdown.clone(),
            )),
            tokio::spawn(deployment_feeder.run(
                Api::namespaced(client, namespace),
                WatcherConfig::default().labels(&managed_by_selector()),
                shutdown.clone(),
            )),
        ];

        info!(namespace = %namespace, "Started watching ConfigMaps, FeatureGates and Deployments");

        Self {
            config_maps,
            feature_gates,
            deployments,
            feeders,
        }
    }

    /// Readiness handles for the startup barrier
    pub fn sync_sources(&self) -> Vec<Box<dyn CacheSync>> {
        vec![
            Box::new(self.config_maps.clone()),
            Box::new(self.feature_gates.clone()),
            Box::new(self.deployments.clone()),
        ]
    }

    /// Wait for the feeders to exit after shutdown
    pub async fn join(self) {
        for feeder in self.feeders {
            if let Err(e) = feeder.await {
                error!("Cache feeder task failed: {}", e);
            }
        }
    }
}
