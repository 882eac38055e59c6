// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Install manifests for the operator itself.

use crate::constants::controller::{MASTER_NODE_LABEL, PRIORITY_CLASS, RUN_AS_USER, SERVICE_ACCOUNT};
use crate::constants::OPERATOR_NAME;
use crate::deployment::critical_pod_tolerations;
use anyhow::{bail, Context, Result};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::ObjectMeta;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Kinds of resource the generator can emit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    OperatorDeployment,
}

impl FromStr for ResourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "machine-health-check-operator" => Ok(ResourceType::OperatorDeployment),
            other => bail!("unknown resource type {}", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ManifestParams {
    pub namespace: String,
    pub repository: String,
    pub version: String,
    pub pull_policy: String,
    pub verbosity: String,
}

fn field_ref(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The Deployment that runs the operator
pub fn operator_deployment(params: &ManifestParams) -> Deployment {
    let labels = BTreeMap::from([("k8s-app".to_string(), OPERATOR_NAME.to_string())]);
    let image = format!("{}/{}:{}", params.repository, OPERATOR_NAME, params.version);

    let container = Container {
        name: OPERATOR_NAME.to_string(),
        image: Some(image),
        image_pull_policy: Some(params.pull_policy.clone()),
        command: Some(vec![format!("/{}", OPERATOR_NAME)]),
        env: Some(vec![
            field_ref("COMPONENT_NAMESPACE", "metadata.namespace"),
            field_ref("POD_NAME", "metadata.name"),
            EnvVar {
                name: "RUST_LOG".to_string(),
                value: Some(log_filter(&params.verbosity)),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(BTreeMap::from([
                ("memory".to_string(), Quantity("20Mi".to_string())),
                ("cpu".to_string(), Quantity("10m".to_string())),
            ])),
            ..Default::default()
        }),
        ..Default::default()
    };

    Deployment {
        metadata: ObjectMeta {
            name: Some(OPERATOR_NAME.to_string()),
            namespace: Some(params.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    priority_class_name: Some(PRIORITY_CLASS.to_string()),
                    service_account_name: Some(SERVICE_ACCOUNT.to_string()),
                    node_selector: Some(BTreeMap::from([(
                        MASTER_NODE_LABEL.to_string(),
                        String::new(),
                    )])),
                    security_context: Some(PodSecurityContext {
                        run_as_non_root: Some(true),
                        run_as_user: Some(RUN_AS_USER),
                        ..Default::default()
                    }),
                    tolerations: Some(critical_pod_tolerations()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Map a numeric verbosity onto a tracing filter
fn log_filter(verbosity: &str) -> String {
    match verbosity.parse::<u8>() {
        Ok(0) => "error",
        Ok(1) => "warn",
        Ok(2) => "info",
        Ok(3) => "debug",
        Ok(_) => "trace",
        Err(_) => verbosity,
    }
    .to_string()
}

/// Render the requested resource as YAML
pub fn generate(resource: ResourceType, params: &ManifestParams) -> Result<String> {
    match resource {
        ResourceType::OperatorDeployment => serde_yaml::to_string(&operator_deployment(params))
            .context("error generating machine-health-check-operator deployment"),
    }
}
