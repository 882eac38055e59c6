// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use crate::constants::inputs::MACHINE_HEALTH_CHECK_FEATURE;
use crate::error::{OperatorError, Result};
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[kube(group = "config.openshift.io", version = "v1", kind = "FeatureGate")]
#[serde(rename_all = "camelCase")]
pub struct FeatureGateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_no_upgrade: Option<CustomFeatureGates>,
}

/// Explicit toggle lists used with the `CustomNoUpgrade` feature set
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CustomFeatureGates {
    #[serde(default)]
    pub enabled: Vec<String>,
    #[serde(default)]
    pub disabled: Vec<String>,
}

/// Named toggle sets a FeatureGate can select
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureSet {
    Default,
    TechPreviewNoUpgrade,
    CustomNoUpgrade,
}

impl FeatureSet {
    pub fn parse(value: Option<&str>) -> Result<Self> {
        match value.unwrap_or_default() {
            "" => Ok(FeatureSet::Default),
            "TechPreviewNoUpgrade" => Ok(FeatureSet::TechPreviewNoUpgrade),
            "CustomNoUpgrade" => Ok(FeatureSet::CustomNoUpgrade),
            other => Err(OperatorError::UnknownFeatureSet(other.to_string())),
        }
    }
}

impl FeatureGate {
    pub fn feature_set(&self) -> Result<FeatureSet> {
        FeatureSet::parse(self.spec.feature_set.as_deref())
    }
}

/// Resolve the toggle map declared by `gate`, or the default set when there is none
pub fn feature_map(gate: Option<&FeatureGate>) -> Result<BTreeMap<String, bool>> {
    let feature_set = match gate {
        Some(gate) => gate.feature_set()?,
        None => FeatureSet::Default,
    };

    let (enabled, disabled): (Vec<String>, Vec<String>) = match feature_set {
        FeatureSet::Default => (vec![], vec![MACHINE_HEALTH_CHECK_FEATURE.to_string()]),
        FeatureSet::TechPreviewNoUpgrade => (vec![MACHINE_HEALTH_CHECK_FEATURE.to_string()], vec![]),
        FeatureSet::CustomNoUpgrade => {
            let custom = gate
                .and_then(|g| g.spec.custom_no_upgrade.clone())
                .unwrap_or_default();
            (custom.enabled, custom.disabled)
        }
    };

    let mut features = BTreeMap::new();
    features.extend(disabled.into_iter().map(|f| (f, false)));
    features.extend(enabled.into_iter().map(|f| (f, true)));
    Ok(features)
}
