// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! The reconcile loop: cache barrier, worker pool and retry handling.

use crate::cache::{wait_for_cache_sync, CacheSync};
use crate::config::Config;
use crate::context::ControllerContext;
use crate::deployment::Converger;
use crate::error::{OperatorError, Result};
use crate::notify::{notification_channel, run_notification_adapter};
use crate::queue::WorkQueue;
use crate::resolver::DesiredStateResolver;
use kube::Client;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

pub struct Operator {
    key: String,
    queue: WorkQueue<String>,
    resolver: DesiredStateResolver,
    converger: Converger,
    caches: Vec<Box<dyn CacheSync>>,
}

impl Operator {
    pub fn new(
        key: impl Into<String>,
        queue: WorkQueue<String>,
        resolver: DesiredStateResolver,
        converger: Converger,
        caches: Vec<Box<dyn CacheSync>>,
    ) -> Self {
        Self {
            key: key.into(),
            queue,
            resolver,
            converger,
            caches,
        }
    }

    pub fn from_context(
        client: Client,
        config: &Config,
        queue: WorkQueue<String>,
        context: &ControllerContext,
    ) -> Self {
        let resolver = DesiredStateResolver::new(
            config.namespace.clone(),
            context.config_maps.store().clone(),
            context.feature_gates.store().clone(),
        );
        let converger = Converger::new(
            client,
            context.deployments.store().clone(),
            config.rollout_poll_interval,
            config.rollout_timeout,
        );
        Self::new(
            config.work_queue_key(),
            queue,
            resolver,
            converger,
            context.sync_sources(),
        )
    }

    #[cfg(test)]
    pub fn queue(&self) -> &WorkQueue<String> {
        &self.queue
    }

    /// Wait for the caches, start `workers` workers and block until `shutdown` fires
    pub async fn run(self: Arc<Self>, workers: usize, shutdown: CancellationToken) -> Result<()> {
        info!(key = %self.key, "Starting machine health check operator");

        let caches: Vec<&dyn CacheSync> = self.caches.iter().map(|c| c.as_ref()).collect();
        if !wait_for_cache_sync(&caches, &shutdown).await {
            let pending: Vec<String> = caches
                .iter()
                .filter(|c| !c.is_ready())
                .map(|c| c.name())
                .collect();
            return Err(OperatorError::CacheSync(format!(
                "caches not synced before shutdown: {}",
                pending.join(", ")
            )));
        }
        info!("Caches synced, starting {} workers", workers);

        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let operator = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { operator.worker(id, shutdown).await })
            })
            .collect();

        shutdown.cancelled().await;
        info!("Shutting down machine health check operator");
        self.queue.shut_down();

        for handle in handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        Ok(())
    }

    async fn worker(&self, id: usize, shutdown: CancellationToken) {
        debug!(worker = id, "Worker started");
        while self.process_next_work_item(&shutdown).await {}
        debug!(worker = id, "Worker stopped");
    }

    /// Handle one key. Returns false once the queue is shut down.
    pub async fn process_next_work_item(&self, shutdown: &CancellationToken) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                self.queue.done(&key);
                return false;
            }
            result = self.sync(&key) => result,
        };

        match result {
            Ok(()) => self.queue.ack_success(&key),
            Err(e) => {
                self.queue.ack_failure(key.clone(), &e);
            }
        }
        self.queue.done(&key);
        true
    }

    #[instrument(skip(self))]
    async fn sync(&self, key: &str) -> Result<()> {
        let start = tokio::time::Instant::now();
        debug!("Started syncing operator");

        let desired = self.resolver.resolve()?;
        let mutated = self.converger.converge(&desired).await?;
        if mutated {
            info!(
                replicas = desired.replicas(),
                "Machine health check controller converged"
            );
        }

        debug!("Finished syncing operator ({:?})", start.elapsed());
        Ok(())
    }
}

/// Watch, reconcile and converge until `shutdown` fires
pub async fn run_operator(client: Client, config: Config, shutdown: CancellationToken) -> Result<()> {
    let queue: WorkQueue<String> = WorkQueue::new(config.name.clone());
    let (tx, rx) = notification_channel();

    let context = ControllerContext::start(client.clone(), &config.namespace, tx, &shutdown);
    let adapter = tokio::spawn(run_notification_adapter(
        rx,
        queue.clone(),
        config.work_queue_key(),
        shutdown.clone(),
    ));

    let operator = Arc::new(Operator::from_context(client, &config, queue.clone(), &context));
    let result = operator.run(config.workers, shutdown.clone()).await;

    // A failed barrier returns before shutdown fired; stop the watchers either way
    shutdown.cancel();
    queue.shut_down();
    if let Err(e) = adapter.await {
        error!("Notification adapter failed: {}", e);
    }
    context.join().await;

    result
}
