// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OperatorError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("ConfigMap {namespace}/{name} not found")]
    ConfigMapNotFound { namespace: String, name: String },

    #[error("ConfigMap {name} does not have data with key {key}")]
    MissingImagesKey { name: String, key: String },

    #[error("Failed to parse images document: {0}")]
    ImagesParse(#[from] serde_json::Error),

    #[error("Machine API operator image is empty")]
    EmptyImage,

    #[error("Unknown feature set: {0}")]
    UnknownFeatureSet(String),

    #[error("Deployment {0} is being deleted")]
    DeploymentDeleted(String),

    #[error("Timed out after {timeout_secs}s waiting for deployment {name} to roll out")]
    RolloutTimeout { name: String, timeout_secs: u64 },

    #[error("Failed to sync caches: {0}")]
    CacheSync(String),

    #[error("Leader election lost: {0}")]
    LeadershipLost(String),

    #[error("Invalid leader election configuration: {0}")]
    InvalidLeaderElection(String),
}

pub type Result<T> = std::result::Result<T, OperatorError>;
