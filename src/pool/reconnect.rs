// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{sync::{Arc, Weak}, time::Duration};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    pool::manager::ConnectionManager,
    transport::events::{ConnectionEvent, ConnectionEventKind, ConnectionEventProcessor},
};

/// Fixed gap between reconnect attempts for one address.
const RECONNECT_GAP: Duration = Duration::from_secs(1);

/// Background restoration of dropped addresses.
///
/// Close events for addresses that were not explicitly disabled queue a
/// reconnect task; at most one attempt per address is in flight and failed
/// attempts re-queue after the fixed gap.
pub struct Reconnector {
    manager: Weak<ConnectionManager>,
    disabled: DashMap<String, ()>,
    in_flight: DashMap<String, ()>,
    tx: mpsc::Sender<String>,
    cancel: CancellationToken,
}

impl Reconnector {
    pub fn start(manager: &Arc<ConnectionManager>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::channel::<String>(256);
        let reconnector = Arc::new(Self {
            manager: Arc::downgrade(manager),
            disabled: DashMap::new(),
            in_flight: DashMap::new(),
            tx,
            cancel: CancellationToken::new(),
        });

        let worker = Arc::clone(&reconnector);
        tokio::spawn(async move {
            loop {
                let key = tokio::select! {
                    _ = worker.cancel.cancelled() => return,
                    key = rx.recv() => {
                        let Some(key) = key else { return };
                        key
                    },
                };
                if worker.disabled.contains_key(&key) {
                    continue;
                }
                if worker.in_flight.insert(key.clone(), ()).is_some() {
                    continue;
                }
                let task = Arc::clone(&worker);
                tokio::spawn(async move {
                    task.attempt(key).await;
                });
            }
        });

        reconnector
    }

    async fn attempt(self: Arc<Self>, key: String) {
        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.in_flight.remove(&key);
                return;
            },
            _ = tokio::time::sleep(RECONNECT_GAP) => {},
        }

        let outcome = async {
            let manager = self.manager.upgrade()?;
            let url = manager.pool_url(&key).or_else(|| key.parse().ok())?;
            Some(manager.get_and_create_if_absent(&url).await)
        }
        .await;

        self.in_flight.remove(&key);

        match outcome {
            None => {},
            Some(Ok(conn)) => {
                debug!("reconnected {key}");
                conn.announce_reconnect();
            },
            Some(Err(e)) => {
                warn!("reconnect of {key} failed, re-queueing: {e}");
                self.schedule(key);
            },
        }
    }

    /// Queues a reconnect unless the address is disabled.
    pub fn schedule(&self, key: impl Into<String>) {
        let key = key.into();
        if self.disabled.contains_key(&key) {
            return;
        }
        if self.tx.try_send(key).is_err() {
            debug!("reconnect queue full");
        }
    }

    /// Suppresses reconnection for the address until re-enabled.
    pub fn disable(&self, key: &str) {
        self.disabled.insert(key.to_owned(), ());
    }

    pub fn enable(&self, key: &str) {
        self.disabled.remove(key);
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn event_listener(self: &Arc<Self>) -> Arc<dyn ConnectionEventProcessor> {
        Arc::new(ReconnectListener {
            reconnector: Arc::downgrade(self),
        })
    }
}

struct ReconnectListener {
    reconnector: Weak<Reconnector>,
}

impl ConnectionEventProcessor for ReconnectListener {
    fn on_event(&self, event: &ConnectionEvent) {
        if event.kind == ConnectionEventKind::Close
            && let Some(r) = self.reconnector.upgrade()
        {
            r.schedule(event.remote.clone());
        }
    }
}
