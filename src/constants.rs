// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

/// Label keys and values stamped on everything the operator owns
pub mod labels {
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_OPERATOR: &str = "machine-health-check-operator";

    /// Label selector restricting the Deployment watch to managed objects
    pub fn managed_by_selector() -> String {
        format!("{}={}", MANAGED_BY, MANAGED_BY_OPERATOR)
    }
}

/// Inputs the desired state is computed from
pub mod inputs {
    /// ConfigMap carrying the image references
    pub const IMAGES_CONFIG_MAP: &str = "machine-api-operator-images";
    /// Key inside the ConfigMap holding the JSON image document
    pub const IMAGES_JSON_KEY: &str = "images.json";
    /// Cluster-scoped FeatureGate object consulted for the toggle
    pub const FEATURE_GATE_NAME: &str = "cluster";
    /// Toggle that scales the controller down when enabled
    pub const MACHINE_HEALTH_CHECK_FEATURE: &str = "MachineHealthCheck";
}

/// The managed Deployment and its fixed pod template
pub mod controller {
    pub const DEPLOYMENT_NAME: &str = "machine-health-check-controller";
    pub const CONTAINER_NAME: &str = "machine-health-check-controller";
    pub const COMMAND: &str = "/machine-healthcheck";
    pub const ARGS: [&str; 2] = ["--logtostderr=true", "--v=3"];
    pub const MEMORY_REQUEST: &str = "20Mi";
    pub const CPU_REQUEST: &str = "10m";
    pub const PRIORITY_CLASS: &str = "system-node-critical";
    pub const SERVICE_ACCOUNT: &str = "machine-api-controllers";
    pub const MASTER_NODE_LABEL: &str = "node-role.kubernetes.io/master";
    pub const RUN_AS_USER: i64 = 65534;
    pub const NODE_FAILURE_TOLERATION_SECS: i64 = 120;
}

/// Work queue tuning
pub mod queue {
    /// Number of times a key is retried before it is dropped out of the queue.
    ///
    /// With a 5ms base doubling per failure the requeue delays run
    /// 5ms, 10ms, 20ms, ... 41s, 82s.
    pub const MAX_RETRIES: u32 = 15;
    pub const BASE_DELAY_MS: u64 = 5;
    pub const MAX_DELAY_SECS: u64 = 1000;
}

/// Rollout confirmation after a mutation
pub mod rollout {
    pub const POLL_INTERVAL_SECS: u64 = 1;
    pub const TIMEOUT_SECS: u64 = 300;
}

/// Leader election lease timings
pub mod leader {
    pub const LEASE_DURATION_SECS: u64 = 90;
    pub const RENEW_DEADLINE_SECS: u64 = 60;
    pub const RETRY_PERIOD_SECS: u64 = 30;
    /// Multiplier applied to the retry period when jittering
    pub const JITTER_FACTOR: f64 = 1.2;
}

/// Interval at which the cache barrier re-checks readiness
pub const CACHE_SYNC_POLL_MILLIS: u64 = 100;

/// Default namespace the operator and its controller live in
pub const DEFAULT_NAMESPACE: &str = "openshift-machine-api";

/// The operator name, used as lease name and work queue key suffix
pub const OPERATOR_NAME: &str = "machine-health-check-operator";

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 2;
