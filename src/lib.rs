// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
pub mod cache;
pub mod config;
pub mod constants;
pub mod context;
pub mod deployment;
pub mod error;
pub mod leader;
pub mod manifests;
pub mod notify;
pub mod operator;
pub mod queue;
pub mod resolver;
pub mod types;

#[cfg(test)]
pub mod test_utils;
