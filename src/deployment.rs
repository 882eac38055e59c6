// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Builds the controller Deployment, applies replica changes and waits for rollouts.

use crate::constants::controller::{
    ARGS, COMMAND, CONTAINER_NAME, CPU_REQUEST, DEPLOYMENT_NAME, MASTER_NODE_LABEL,
    MEMORY_REQUEST, NODE_FAILURE_TOLERATION_SECS, PRIORITY_CLASS, RUN_AS_USER, SERVICE_ACCOUNT,
};
use crate::constants::labels::{MANAGED_BY, MANAGED_BY_OPERATOR};
use crate::error::{OperatorError, Result};
use crate::resolver::DesiredConfig;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, PodSecurityContext, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{ObjectMeta, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, instrument};

fn managed_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(MANAGED_BY.to_string(), MANAGED_BY_OPERATOR.to_string())])
}

/// Tolerations letting a critical pod land on, and stay on, control plane nodes
pub fn critical_pod_tolerations() -> Vec<Toleration> {
    vec![
        Toleration {
            key: Some(MASTER_NODE_LABEL.to_string()),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("CriticalAddonsOnly".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        },
        Toleration {
            key: Some("node.kubernetes.io/not-ready".to_string()),
            effect: Some("NoExecute".to_string()),
            operator: Some("Exists".to_string()),
            toleration_seconds: Some(NODE_FAILURE_TOLERATION_SECS),
            ..Default::default()
        },
        Toleration {
            key: Some("node.kubernetes.io/unreachable".to_string()),
            effect: Some("NoExecute".to_string()),
            operator: Some("Exists".to_string()),
            toleration_seconds: Some(NODE_FAILURE_TOLERATION_SECS),
            ..Default::default()
        },
    ]
}

/// The full target Deployment, or `None` when there is nothing to run
pub fn new_deployment(config: &DesiredConfig) -> Option<Deployment> {
    let template = new_pod_template_spec(config)?;

    Some(Deployment {
        metadata: ObjectMeta {
            name: Some(DEPLOYMENT_NAME.to_string()),
            namespace: Some(config.target_namespace.clone()),
            labels: Some(managed_labels()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(config.replicas()),
            selector: LabelSelector {
                match_labels: Some(managed_labels()),
                ..Default::default()
            },
            template,
            ..Default::default()
        }),
        status: None,
    })
}

fn new_pod_template_spec(config: &DesiredConfig) -> Option<PodTemplateSpec> {
    let containers = new_containers(config);

    // Never create a Deployment without a workload
    if containers.is_empty() {
        return None;
    }

    Some(PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(managed_labels()),
            ..Default::default()
        }),
        spec: Some(PodSpec {
            containers,
            priority_class_name: Some(PRIORITY_CLASS.to_string()),
            node_selector: Some(BTreeMap::from([(
                MASTER_NODE_LABEL.to_string(),
                String::new(),
            )])),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(RUN_AS_USER),
                ..Default::default()
            }),
            service_account_name: Some(SERVICE_ACCOUNT.to_string()),
            tolerations: Some(critical_pod_tolerations()),
            ..Default::default()
        }),
    })
}

fn new_containers(config: &DesiredConfig) -> Vec<Container> {
    if config.image.is_empty() {
        return vec![];
    }

    let requests = BTreeMap::from([
        ("memory".to_string(), Quantity(MEMORY_REQUEST.to_string())),
        ("cpu".to_string(), Quantity(CPU_REQUEST.to_string())),
    ]);

    vec![Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image.clone()),
        command: Some(vec![COMMAND.to_string()]),
        args: Some(ARGS.iter().map(|a| a.to_string()).collect()),
        resources: Some(ResourceRequirements {
            requests: Some(requests),
            ..Default::default()
        }),
        ..Default::default()
    }]
}

fn replicas_of(deployment: &Deployment) -> Option<i32> {
    deployment.spec.as_ref().and_then(|s| s.replicas)
}

/// Create the Deployment if missing, or correct its replica count.
///
/// Only the replica count is enforced on an existing Deployment; every other
/// field is left as found. Returns the object as written by the API server, or
/// `None` when nothing needed to change.
#[instrument(skip(api, desired), fields(deployment = %desired.name_any()))]
pub async fn apply_deployment_replicas(
    api: &Api<Deployment>,
    desired: &Deployment,
) -> Result<Option<Deployment>> {
    let name = desired.name_any();

    let existing = match api.get(&name).await {
        Ok(existing) => existing,
        Err(kube::Error::Api(err)) if err.code == 404 => {
            info!("Creating deployment {}", name);
            let created = api.create(&PostParams::default(), desired).await?;
            return Ok(Some(created));
        }
        Err(e) => return Err(e.into()),
    };

    let wanted = replicas_of(desired);
    if replicas_of(&existing) == wanted {
        debug!("Deployment {} already has the desired replicas", name);
        return Ok(None);
    }

    // Carries the observed resourceVersion, so a concurrent writer causes a conflict
    let mut updated = existing;
    match updated.spec.as_mut() {
        Some(spec) => spec.replicas = wanted,
        None => updated.spec = desired.spec.clone(),
    }

    info!("Updating deployment {} replicas to {:?}", name, wanted);
    let replaced = api.replace(&name, &PostParams::default(), &updated).await?;
    Ok(Some(replaced))
}

/// What the cached Deployment has to show before a write counts as seen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RolloutTarget {
    pub generation: i64,
    pub replicas: Option<i32>,
}

impl RolloutTarget {
    /// Target for `written`, the object returned by the create or replace
    pub fn after_write(written: &Deployment, replicas: Option<i32>) -> Self {
        Self {
            generation: written.metadata.generation.unwrap_or(0),
            replicas,
        }
    }
}

/// Where a rollout stands on a given poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RolloutState {
    Polling,
    Converged,
    ResourceDeleted,
}

pub fn rollout_state(deployment: Option<&Deployment>, target: RolloutTarget) -> RolloutState {
    // The write may not be visible in the cache yet
    let Some(deployment) = deployment else {
        return RolloutState::Polling;
    };

    if deployment.metadata.deletion_timestamp.is_some() {
        return RolloutState::ResourceDeleted;
    }

    let generation = deployment.metadata.generation.unwrap_or(0);
    if generation < target.generation || replicas_of(deployment) != target.replicas {
        debug!(
            "Cache still holds deployment {:?} from before the write (generation {}, replicas {:?})",
            deployment.name_any(),
            generation,
            replicas_of(deployment)
        );
        return RolloutState::Polling;
    }

    let status = deployment.status.as_ref();
    let observed_generation = status.and_then(|s| s.observed_generation).unwrap_or(0);
    let replicas = status.and_then(|s| s.replicas).unwrap_or(0);
    let updated = status.and_then(|s| s.updated_replicas).unwrap_or(0);
    let ready = status.and_then(|s| s.ready_replicas).unwrap_or(0);
    let unavailable = status.and_then(|s| s.unavailable_replicas).unwrap_or(0);

    if generation <= observed_generation && updated == replicas && unavailable == 0 {
        return RolloutState::Converged;
    }

    debug!(
        "Deployment {:?} is not ready. status: (replicas: {}, updated: {}, ready: {}, unavailable: {})",
        deployment.name_any(),
        replicas,
        updated,
        ready,
        unavailable
    );
    RolloutState::Polling
}

/// Poll the cached Deployment until it reaches `target` and converges, is
/// deleted, or `timeout` elapses. The first poll happens one interval after
/// the call.
pub async fn wait_for_rollout(
    deployments: &Store<Deployment>,
    namespace: &str,
    name: &str,
    target: RolloutTarget,
    poll_interval: Duration,
    timeout: Duration,
) -> Result<()> {
    let key = ObjectRef::new(name).within(namespace);
    let mut ticker = interval_at(Instant::now() + poll_interval, poll_interval);

    let poll = async {
        loop {
            ticker.tick().await;
            match rollout_state(deployments.get(&key).as_deref(), target) {
                RolloutState::Polling => continue,
                RolloutState::Converged => return Ok(()),
                RolloutState::ResourceDeleted => {
                    return Err(OperatorError::DeploymentDeleted(name.to_string()))
                }
            }
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| OperatorError::RolloutTimeout {
            name: name.to_string(),
            timeout_secs: timeout.as_secs(),
        })?
}

/// Diffs desired against observed state and drives the controller Deployment to it
#[derive(Clone)]
pub struct Converger {
    client: kube::Client,
    deployments: Store<Deployment>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Converger {
    pub fn new(
        client: kube::Client,
        deployments: Store<Deployment>,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            deployments,
            poll_interval,
            timeout,
        }
    }

    /// Apply `desired`; when a write happened, wait for it to roll out.
    /// Returns whether the Deployment was mutated.
    pub async fn converge(&self, desired: &DesiredConfig) -> Result<bool> {
        let Some(deployment) = new_deployment(desired) else {
            debug!("No containers to deploy, skipping");
            return Ok(false);
        };

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), &desired.target_namespace);
        let Some(written) = apply_deployment_replicas(&api, &deployment).await? else {
            return Ok(false);
        };
        let target = RolloutTarget::after_write(&written, replicas_of(&deployment));

        info!(
            "Updated deployment {} with replicas {}, waiting for rollout",
            DEPLOYMENT_NAME,
            desired.replicas()
        );
        wait_for_rollout(
            &self.deployments,
            &desired.target_namespace,
            DEPLOYMENT_NAME,
            target,
            self.poll_interval,
            self.timeout,
        )
        .await?;

        Ok(true)
    }
}
