// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Derives the desired controller configuration from the image ConfigMap and the FeatureGate.

use crate::constants::inputs::{
    FEATURE_GATE_NAME, IMAGES_CONFIG_MAP, IMAGES_JSON_KEY, MACHINE_HEALTH_CHECK_FEATURE,
};
use crate::error::{OperatorError, Result};
use crate::types::feature_gate::{feature_map, FeatureGate};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;
use serde::Deserialize;
use tracing::{debug, info, instrument};

/// Desired state for one reconcile pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredConfig {
    pub target_namespace: String,
    /// Image for the machine health check controller
    pub image: String,
    pub machine_health_check_enabled: bool,
}

impl DesiredConfig {
    /// The controller is scaled to zero while the feature is enabled
    pub fn replicas(&self) -> i32 {
        if self.machine_health_check_enabled {
            0
        } else {
            1
        }
    }
}

/// Image references published in the images ConfigMap
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Images {
    #[serde(rename = "machineAPIOperator")]
    pub machine_api_operator: String,
    #[serde(rename = "clusterAPIControllerAWS")]
    pub cluster_api_controller_aws: String,
    #[serde(rename = "clusterAPIControllerOpenStack")]
    pub cluster_api_controller_openstack: String,
    #[serde(rename = "clusterAPIControllerLibvirt")]
    pub cluster_api_controller_libvirt: String,
    #[serde(rename = "clusterAPIControllerBareMetal")]
    pub cluster_api_controller_bare_metal: String,
    #[serde(rename = "clusterAPIControllerAzure")]
    pub cluster_api_controller_azure: String,
}

pub fn images_from_config_map(config_map: &ConfigMap) -> Result<Images> {
    let data = config_map
        .data
        .as_ref()
        .and_then(|d| d.get(IMAGES_JSON_KEY))
        .ok_or_else(|| OperatorError::MissingImagesKey {
            name: config_map.name_any(),
            key: IMAGES_JSON_KEY.to_string(),
        })?;

    Ok(serde_json::from_str(data)?)
}

/// Extract the required machine API operator image
pub fn machine_api_operator_image(config_map: &ConfigMap) -> Result<String> {
    let images = images_from_config_map(config_map)?;
    if images.machine_api_operator.is_empty() {
        return Err(OperatorError::EmptyImage);
    }
    Ok(images.machine_api_operator)
}

/// Reads the inputs from the watched caches
#[derive(Clone)]
pub struct DesiredStateResolver {
    namespace: String,
    config_maps: Store<ConfigMap>,
    feature_gates: Store<FeatureGate>,
}

impl DesiredStateResolver {
    pub fn new(
        namespace: impl Into<String>,
        config_maps: Store<ConfigMap>,
        feature_gates: Store<FeatureGate>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            config_maps,
            feature_gates,
        }
    }

    #[instrument(skip(self), fields(namespace = %self.namespace))]
    pub fn resolve(&self) -> Result<DesiredConfig> {
        let images = self
            .config_maps
            .get(&ObjectRef::new(IMAGES_CONFIG_MAP).within(&self.namespace))
            .ok_or_else(|| OperatorError::ConfigMapNotFound {
                namespace: self.namespace.clone(),
                name: IMAGES_CONFIG_MAP.to_string(),
            })?;

        let image = machine_api_operator_image(&images)?;
        debug!("machine API operator image {}", image);

        let enabled = self.is_machine_health_check_enabled()?;
        debug!("machine health check feature enabled: {}", enabled);

        Ok(DesiredConfig {
            target_namespace: self.namespace.clone(),
            image,
            machine_health_check_enabled: enabled,
        })
    }

    /// True only when the resolved toggle set explicitly enables the feature
    pub fn is_machine_health_check_enabled(&self) -> Result<bool> {
        let gate = self.feature_gates.get(&ObjectRef::new(FEATURE_GATE_NAME));
        if gate.is_none() {
            info!(
                "Failed to find feature gate {:?}, will use default feature set",
                FEATURE_GATE_NAME
            );
        }

        let features = feature_map(gate.as_deref())?;
        Ok(features
            .get(MACHINE_HEALTH_CHECK_FEATURE)
            .copied()
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{images_config_map, store_with, IMAGES_JSON, TEST_IMAGE};
    use crate::types::feature_gate::{CustomFeatureGates, FeatureGateSpec};
    use std::collections::BTreeMap;

    const NAMESPACE: &str = "test-namespace";

    fn feature_gate(feature_set: &str, custom: Option<CustomFeatureGates>) -> FeatureGate {
        FeatureGate::new(
            FEATURE_GATE_NAME,
            FeatureGateSpec {
                feature_set: Some(feature_set.to_string()),
                custom_no_upgrade: custom,
            },
        )
    }

    fn resolver(config_maps: Vec<ConfigMap>, gates: Vec<FeatureGate>) -> DesiredStateResolver {
        DesiredStateResolver::new(NAMESPACE, store_with(config_maps), store_with(gates))
    }

    #[test]
    fn test_machine_api_operator_image_from_config_map() {
        let cm = images_config_map(NAMESPACE, IMAGES_JSON);
        assert_eq!(machine_api_operator_image(&cm).unwrap(), TEST_IMAGE);
    }

    #[test]
    fn test_images_missing_key() {
        let mut cm = images_config_map(NAMESPACE, IMAGES_JSON);
        cm.data = Some(BTreeMap::new());
        assert!(matches!(
            machine_api_operator_image(&cm),
            Err(OperatorError::MissingImagesKey { .. })
        ));
    }

    #[test]
    fn test_images_invalid_json() {
        let cm = images_config_map(NAMESPACE, "{not json");
        assert!(matches!(
            machine_api_operator_image(&cm),
            Err(OperatorError::ImagesParse(_))
        ));
    }

    #[test]
    fn test_images_empty_operator_image() {
        let cm = images_config_map(NAMESPACE, r#"{"clusterAPIControllerAWS": "aws:v1"}"#);
        assert!(matches!(
            machine_api_operator_image(&cm),
            Err(OperatorError::EmptyImage)
        ));
    }

    #[test]
    fn test_resolve_without_config_map_fails() {
        let r = resolver(vec![], vec![]);
        assert!(matches!(
            r.resolve(),
            Err(OperatorError::ConfigMapNotFound { .. })
        ));
    }

    #[test]
    fn test_resolve_config_map_in_other_namespace_is_ignored() {
        let r = resolver(vec![images_config_map("elsewhere", IMAGES_JSON)], vec![]);
        assert!(r.resolve().is_err());
    }

    #[test]
    fn test_resolve_without_feature_gate_uses_default() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, r#"{"machineAPIOperator": "registry/img:v1"}"#)],
            vec![],
        );
        let desired = r.resolve().unwrap();
        assert_eq!(
            desired,
            DesiredConfig {
                target_namespace: NAMESPACE.to_string(),
                image: "registry/img:v1".to_string(),
                machine_health_check_enabled: false,
            }
        );
        assert_eq!(desired.replicas(), 1);
    }

    #[test]
    fn test_resolve_tech_preview_scales_to_zero() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, IMAGES_JSON)],
            vec![feature_gate("TechPreviewNoUpgrade", None)],
        );
        let desired = r.resolve().unwrap();
        assert!(desired.machine_health_check_enabled);
        assert_eq!(desired.replicas(), 0);
    }

    #[test]
    fn test_resolve_toggle_absent_from_set_is_disabled() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, IMAGES_JSON)],
            vec![feature_gate(
                "CustomNoUpgrade",
                Some(CustomFeatureGates {
                    enabled: vec!["Other".to_string()],
                    disabled: vec![],
                }),
            )],
        );
        assert_eq!(r.resolve().unwrap().replicas(), 1);
    }

    #[test]
    fn test_resolve_toggle_explicitly_disabled() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, IMAGES_JSON)],
            vec![feature_gate(
                "CustomNoUpgrade",
                Some(CustomFeatureGates {
                    enabled: vec![],
                    disabled: vec![MACHINE_HEALTH_CHECK_FEATURE.to_string()],
                }),
            )],
        );
        assert_eq!(r.resolve().unwrap().replicas(), 1);
    }

    #[test]
    fn test_resolve_toggle_custom_enabled() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, IMAGES_JSON)],
            vec![feature_gate(
                "CustomNoUpgrade",
                Some(CustomFeatureGates {
                    enabled: vec![MACHINE_HEALTH_CHECK_FEATURE.to_string()],
                    disabled: vec![],
                }),
            )],
        );
        assert_eq!(r.resolve().unwrap().replicas(), 0);
    }

    #[test]
    fn test_resolve_unknown_feature_set_fails() {
        let r = resolver(
            vec![images_config_map(NAMESPACE, IMAGES_JSON)],
            vec![feature_gate("Bogus", None)],
        );
        assert!(matches!(
            r.resolve(),
            Err(OperatorError::UnknownFeatureSet(_))
        ));
    }
}
