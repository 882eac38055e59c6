// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Lease based leader election gating the reconcile workers.
//!
//! Only the holder of the Lease runs the operator. The holder renews the
//! Lease every retry period; once no renewal has succeeded for the renew
//! deadline the leading scope is cancelled and
//! [`OperatorError::LeadershipLost`] is returned. The deadline is shorter
//! than the lease duration, so the old leader stops before anyone can take over.

use crate::config::Config;
use crate::constants::leader::JITTER_FACTOR;
use crate::error::{OperatorError, Result};
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{ObjectMeta, PostParams};
use kube::Api;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    pub lease_name: String,
    pub namespace: String,
    pub identity: String,
    pub lease_duration: Duration,
    pub renew_deadline: Duration,
    pub retry_period: Duration,
}

impl LeaderElectionConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            lease_name: config.name.clone(),
            namespace: config.namespace.clone(),
            identity: config.identity.clone(),
            lease_duration: config.lease_duration,
            renew_deadline: config.renew_deadline,
            retry_period: config.retry_period,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.identity.is_empty() {
            return Err(OperatorError::InvalidLeaderElection(
                "identity must not be empty".to_string(),
            ));
        }
        if self.lease_duration <= self.renew_deadline {
            return Err(OperatorError::InvalidLeaderElection(
                "lease duration must be greater than renew deadline".to_string(),
            ));
        }
        if self.renew_deadline.as_secs_f64() <= JITTER_FACTOR * self.retry_period.as_secs_f64() {
            return Err(OperatorError::InvalidLeaderElection(format!(
                "renew deadline must be greater than retry period * {}",
                JITTER_FACTOR
            )));
        }
        Ok(())
    }
}

/// True when somebody other than `identity` holds the lease
pub fn is_held_by_other(spec: &LeaseSpec, identity: &str) -> bool {
    spec.holder_identity
        .as_deref()
        .is_some_and(|holder| !holder.is_empty() && holder != identity)
}

/// The record to write when `identity` acquires or renews a lease currently holding `current`
pub fn next_lease_spec(
    current: &LeaseSpec,
    identity: &str,
    now: MicroTime,
    lease_duration: Duration,
) -> LeaseSpec {
    let renewing = current.holder_identity.as_deref() == Some(identity);
    let transitions = current.lease_transitions.unwrap_or(0);

    LeaseSpec {
        holder_identity: Some(identity.to_string()),
        lease_duration_seconds: Some(lease_duration.as_secs() as i32),
        acquire_time: if renewing {
            current.acquire_time.clone().or_else(|| Some(now.clone()))
        } else {
            Some(now.clone())
        },
        renew_time: Some(now),
        lease_transitions: Some(if renewing { transitions } else { transitions + 1 }),
        ..Default::default()
    }
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(e) if e.code == 409)
}

pub struct LeaderElector {
    api: Api<Lease>,
    config: LeaderElectionConfig,
    /// Last lease record seen and when it was first seen on the local clock
    observed: Mutex<Option<(LeaseSpec, Instant)>>,
}

impl LeaderElector {
    pub fn new(client: kube::Client, config: LeaderElectionConfig) -> Self {
        Self {
            api: Api::namespaced(client, &config.namespace),
            config,
            observed: Mutex::new(None),
        }
    }

    fn observe(&self, spec: &LeaseSpec) -> Instant {
        let mut observed = self.observed.lock().unwrap_or_else(PoisonError::into_inner);
        match observed.as_ref() {
            Some((seen, at)) if seen == spec => *at,
            _ => {
                let now = Instant::now();
                *observed = Some((spec.clone(), now));
                now
            }
        }
    }

    /// One acquisition or renewal attempt. Returns whether we hold the lease afterwards.
    pub async fn try_acquire_or_renew(&self) -> Result<bool> {
        let lease = match self.api.get(&self.config.lease_name).await {
            Ok(lease) => lease,
            Err(kube::Error::Api(err)) if err.code == 404 => return self.create_lease().await,
            Err(e) => return Err(e.into()),
        };

        let current = lease.spec.clone().unwrap_or_default();
        let observed_at = self.observe(&current);

        if current.holder_identity.as_deref() == Some(self.config.identity.as_str()) {
            return self.renew_lease(lease, &current).await;
        }

        if is_held_by_other(&current, &self.config.identity)
            && observed_at.elapsed() < self.config.lease_duration
        {
            debug!(
                holder = current.holder_identity.as_deref().unwrap_or_default(),
                "Lease is held by another candidate"
            );
            return Ok(false);
        }

        self.take_over_lease(lease, &current).await
    }

    async fn create_lease(&self) -> Result<bool> {
        let spec = next_lease_spec(
            &LeaseSpec::default(),
            &self.config.identity,
            MicroTime(Utc::now()),
            self.config.lease_duration,
        );
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(spec.clone()),
        };

        match self.api.create(&PostParams::default(), &lease).await {
            Ok(_) => {
                info!(lease = %self.config.lease_name, "Created leader lease");
                self.observe(&spec);
                Ok(true)
            }
            // Another candidate created it first
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn renew_lease(&self, lease: Lease, current: &LeaseSpec) -> Result<bool> {
        let renewed = self.write_lease(lease, current).await?;
        if renewed {
            debug!(identity = %self.config.identity, "Renewed lease");
        } else {
            debug!(identity = %self.config.identity, "Lease changed underneath us, renewal rejected");
        }
        Ok(renewed)
    }

    async fn take_over_lease(&self, lease: Lease, current: &LeaseSpec) -> Result<bool> {
        let taken = self.write_lease(lease, current).await?;
        if taken {
            info!(
                identity = %self.config.identity,
                previous = current.holder_identity.as_deref().unwrap_or_default(),
                "Took over lease"
            );
        }
        Ok(taken)
    }

    /// Write our next record over `lease`. The resourceVersion from the GET
    /// turns a concurrent write into a conflict, which reads as not holding.
    async fn write_lease(&self, mut lease: Lease, current: &LeaseSpec) -> Result<bool> {
        let spec = next_lease_spec(
            current,
            &self.config.identity,
            MicroTime(Utc::now()),
            self.config.lease_duration,
        );
        lease.spec = Some(spec.clone());

        match self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                self.observe(&spec);
                Ok(true)
            }
            Err(e) if is_conflict(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn jittered_retry_period(&self) -> Duration {
        let jitter = rand::random::<f64>() * JITTER_FACTOR;
        self.config.retry_period.mul_f64(1.0 + jitter)
    }

    /// Block until the lease is acquired. Returns false when shutdown fires first.
    pub async fn acquire(&self, shutdown: &CancellationToken) -> bool {
        info!(
            lease = %self.config.lease_name,
            identity = %self.config.identity,
            "Attempting to acquire leader lease"
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.config.identity, "Successfully acquired lease");
                    return true;
                }
                Ok(false) => debug!("Lease not acquired, retrying"),
                Err(e) => warn!("Error acquiring lease: {}", e),
            }

            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(self.jittered_retry_period()) => {}
            }
        }
    }

    fn leadership_lost(&self) -> OperatorError {
        OperatorError::LeadershipLost(format!(
            "failed to renew lease {}/{} within {:?}",
            self.config.namespace, self.config.lease_name, self.config.renew_deadline
        ))
    }

    /// Renew every retry period until `leading` is cancelled. Fails once no
    /// renewal has succeeded for the renew deadline, counted from `last_renew`.
    async fn renew_loop(&self, leading: &CancellationToken, mut last_renew: Instant) -> Result<()> {
        let deadline = self.config.renew_deadline;

        loop {
            let wait = self
                .config
                .retry_period
                .min(deadline.saturating_sub(last_renew.elapsed()));
            tokio::select! {
                _ = leading.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }

            let remaining = deadline.saturating_sub(last_renew.elapsed());
            if remaining.is_zero() {
                return Err(self.leadership_lost());
            }

            // A hanging request must not outlive the deadline
            let attempt = tokio::time::timeout(remaining, self.try_acquire_or_renew());
            tokio::select! {
                _ = leading.cancelled() => return Ok(()),
                result = attempt => match result {
                    Ok(Ok(true)) => last_renew = Instant::now(),
                    Ok(Ok(false)) => warn!(
                        since_last_renew = ?last_renew.elapsed(),
                        "Lease renewal rejected"
                    ),
                    Ok(Err(e)) => warn!("Error renewing lease: {}", e),
                    Err(_) => warn!("Lease renewal timed out"),
                },
            }
        }
    }

    /// Clear the holder so a successor does not have to wait for expiry
    pub async fn release(&self) {
        let mut lease = match self.api.get(&self.config.lease_name).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!("Failed to fetch lease for release: {}", e);
                return;
            }
        };

        let current = lease.spec.clone().unwrap_or_default();
        if current.holder_identity.as_deref() != Some(self.config.identity.as_str()) {
            return;
        }

        let now = MicroTime(Utc::now());
        lease.spec = Some(LeaseSpec {
            holder_identity: None,
            lease_duration_seconds: Some(1),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            lease_transitions: current.lease_transitions,
            ..Default::default()
        });

        match self
            .api
            .replace(&self.config.lease_name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => info!(lease = %self.config.lease_name, "Released leader lease"),
            Err(e) => warn!("Failed to release lease: {}", e),
        }
    }

    /// Acquire the lease, then run `on_started_leading` with a token that is
    /// cancelled on shutdown or when leadership is lost.
    pub async fn run<F, Fut>(&self, shutdown: CancellationToken, on_started_leading: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.config.validate()?;

        if !self.acquire(&shutdown).await {
            info!("Shutdown requested before acquiring the lease");
            return Ok(());
        }

        let acquired_at = Instant::now();
        let leading = shutdown.child_token();
        let work = on_started_leading(leading.clone());
        tokio::pin!(work);

        tokio::select! {
            result = &mut work => {
                leading.cancel();
                self.release().await;
                result
            }
            renewal = self.renew_loop(&leading, acquired_at) => {
                leading.cancel();
                let result = work.await;
                match renewal {
                    Ok(()) => {
                        self.release().await;
                        result
                    }
                    Err(e) => {
                        error!("{}", e);
                        Err(e)
                    }
                }
            }
        }
    }
}
