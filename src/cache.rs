// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Read-through caches for the watched kinds and the startup sync barrier.

use crate::constants::CACHE_SYNC_POLL_MILLIS;
use crate::notify::{ChangeAction, ChangeNotification, NotificationSender, WatchedKind};
use futures::StreamExt;
use kube::runtime::reflector::{store::Writer, ObjectRef, Store};
use kube::{Api, Resource, ResourceExt};
use kube_runtime::{watcher, WatchStreamExt};
use serde::de::DeserializeOwned;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Anything that can report whether its initial full listing has completed
pub trait CacheSync: Send + Sync {
    fn name(&self) -> String;
    fn is_ready(&self) -> bool;
}

/// Read side of a watched cache
pub struct WatchedCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: WatchedKind,
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> Clone for WatchedCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            store: self.store.clone(),
            synced: self.synced.clone(),
        }
    }
}

impl<K> WatchedCache<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    pub fn store(&self) -> &Store<K> {
        &self.store
    }
}

impl<K> CacheSync for WatchedCache<K>
where
    K: Resource + Clone + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Send + Sync,
{
    fn name(&self) -> String {
        self.kind.to_string()
    }

    fn is_ready(&self) -> bool {
        self.synced.load(Ordering::SeqCst)
    }
}

/// Write side of a watched cache: applies watch events and emits notifications
pub struct CacheFeeder<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone,
{
    kind: WatchedKind,
    writer: Writer<K>,
    synced: Arc<AtomicBool>,
    notifications: NotificationSender,
}

/// Create a cache and the feeder that populates it
pub fn cache_pair<K>(
    kind: WatchedKind,
    notifications: NotificationSender,
) -> (WatchedCache<K>, CacheFeeder<K>)
where
    K: Resource + Clone + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    let writer = Writer::default();
    let synced = Arc::new(AtomicBool::new(false));
    let cache = WatchedCache {
        kind,
        store: writer.as_reader(),
        synced: synced.clone(),
    };
    let feeder = CacheFeeder {
        kind,
        writer,
        synced,
        notifications,
    };
    (cache, feeder)
}

impl<K> CacheFeeder<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Eq + Hash + Clone + Default,
{
    /// Apply a single watch event to the store
    pub fn apply(&mut self, event: watcher::Event<K>) {
        let change = match &event {
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                let known = self.writer.as_reader().get(&ObjectRef::from_obj(obj)).is_some();
                let action = if known {
                    ChangeAction::Updated
                } else {
                    ChangeAction::Added
                };
                Some((action, obj.name_any()))
            }
            watcher::Event::Delete(obj) => Some((ChangeAction::Deleted, obj.name_any())),
            watcher::Event::Init | watcher::Event::InitDone => None,
        };

        self.writer.apply_watcher_event(&event);

        if matches!(event, watcher::Event::InitDone) && !self.synced.swap(true, Ordering::SeqCst)
        {
            info!(kind = %self.kind, "Cache synced");
        }

        if let Some((action, name)) = change {
            let notification = ChangeNotification {
                kind: self.kind,
                action,
                name,
            };
            if self.notifications.send(notification).is_err() {
                debug!(kind = %self.kind, "No notification receiver, dropping change");
            }
        }
    }

    /// Watch `api` and feed the store until shutdown
    pub async fn run(mut self, api: Api<K>, config: watcher::Config, shutdown: CancellationToken) {
        let mut stream = std::pin::pin!(watcher(api, config).default_backoff());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => warn!(kind = %self.kind, "Watch error: {}", e),
                    None => break,
                },
            }
        }

        debug!(kind = %self.kind, "Cache feeder stopped");
    }
}

/// Block until every cache reports synced. Returns false if shutdown fires first.
pub async fn wait_for_cache_sync(caches: &[&dyn CacheSync], shutdown: &CancellationToken) -> bool {
    let mut ticker = tokio::time::interval(Duration::from_millis(CACHE_SYNC_POLL_MILLIS));

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return false,
            _ = ticker.tick() => {}
        }

        let pending: Vec<String> = caches
            .iter()
            .filter(|c| !c.is_ready())
            .map(|c| c.name())
            .collect();

        if pending.is_empty() {
            return true;
        }
        debug!(?pending, "Waiting for caches to sync");
    }
}
