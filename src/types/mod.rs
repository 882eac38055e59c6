// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Third-party resource types the operator reads.

pub mod feature_gate;

pub use feature_gate::{CustomFeatureGates, FeatureGate, FeatureGateSpec, FeatureSet};
