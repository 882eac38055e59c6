// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Change notifications from the watched caches, coalesced into reconcile requests.

use crate::queue::WorkQueue;
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// The resource kinds whose changes can affect the desired state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchedKind {
    ConfigMap,
    FeatureGate,
    Deployment,
}

impl fmt::Display for WatchedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchedKind::ConfigMap => write!(f, "ConfigMap"),
            WatchedKind::FeatureGate => write!(f, "FeatureGate"),
            WatchedKind::Deployment => write!(f, "Deployment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Added,
    Updated,
    Deleted,
}

/// A single add/update/delete observed on a watched kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub kind: WatchedKind,
    pub action: ChangeAction,
    pub name: String,
}

pub type NotificationSender = mpsc::UnboundedSender<ChangeNotification>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<ChangeNotification>;

/// Unbounded so that cache feeders never block on delivery
pub fn notification_channel() -> (NotificationSender, NotificationReceiver) {
    mpsc::unbounded_channel()
}

/// Translate every notification, whatever its kind or payload, into the one
/// fixed reconcile key. Runs until all senders are gone or shutdown fires.
pub async fn run_notification_adapter(
    mut notifications: NotificationReceiver,
    queue: WorkQueue<String>,
    key: String,
    shutdown: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = notifications.recv() => match next {
                Some(n) => n,
                None => break,
            },
        };

        debug!(
            kind = %notification.kind,
            action = ?notification.action,
            name = %notification.name,
            "Change observed, requesting reconcile"
        );
        queue.add(key.clone());
    }

    info!("Change notification adapter stopped");
}
