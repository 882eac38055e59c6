// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0
use anyhow::Result;
use clap::Parser;

use mhc_operator::manifests::{generate, ManifestParams, ResourceType};

/// Print the install manifests of the machine health check operator
#[derive(Parser, Debug)]
#[command(name = "resource-generator")]
struct Args {
    /// Type of resource to generate: machine-health-check-operator
    #[arg(long = "type")]
    resource_type: String,

    /// Namespace to use
    #[arg(long, default_value = "kube-system")]
    namespace: String,

    /// Image repository to use
    #[arg(long, default_value = "quay.io/openshift")]
    repository: String,

    /// Image version to use
    #[arg(long, default_value = "latest")]
    version: String,

    /// ImagePullPolicy to use
    #[arg(long, default_value = "IfNotPresent")]
    pull_policy: String,

    /// Verbosity level to use
    #[arg(long, default_value = "2")]
    verbosity: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let resource: ResourceType = args.resource_type.parse()?;
    let params = ManifestParams {
        namespace: args.namespace,
        repository: args.repository,
        version: args.version,
        pull_policy: args.pull_policy,
        verbosity: args.verbosity,
    };

    print!("{}", generate(resource, &params)?);
    Ok(())
}
