// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Lifecycle signals surfaced to user-registered event processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEventKind {
    Connect,
    Close,
    Exception,
    ConnectFailed,
    Reconnect,
}

#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    /// Unique key of the remote address (`ip:port`).
    pub remote: String,
    pub detail: Option<String>,
}

/// User hook invoked on the dedicated event task, never on an I/O task.
pub trait ConnectionEventProcessor: Send + Sync + 'static {
    fn on_event(&self, event: &ConnectionEvent);
}

/// Cheap handle connections use to publish events.
#[derive(Debug, Clone, Default)]
pub struct EventBus {
    tx: Option<mpsc::Sender<ConnectionEvent>>,
}

impl EventBus {
    /// A bus that drops everything; used before startup and in tests.
    pub fn noop() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, kind: ConnectionEventKind, remote: &str, detail: Option<String>) {
        if let Some(tx) = &self.tx {
            let event = ConnectionEvent {
                kind,
                remote: remote.to_owned(),
                detail,
            };
            if tx.try_send(event).is_err() {
                debug!("event bus full, dropping {kind:?} for {remote}");
            }
        }
    }
}

/// Owns the event channel and fans events out to subscribed processors.
pub struct EventHub {
    processors: DashMap<ConnectionEventKind, Vec<Arc<dyn ConnectionEventProcessor>>>,
    tx: mpsc::Sender<ConnectionEvent>,
    rx: Mutex<Option<mpsc::Receiver<ConnectionEvent>>>,
    cancel: CancellationToken,
}

impl EventHub {
    pub fn new() -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1024);
        Arc::new(Self {
            processors: DashMap::new(),
            tx,
            rx: Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(
        &self,
        kind: ConnectionEventKind,
        processor: Arc<dyn ConnectionEventProcessor>,
    ) {
        self.processors.entry(kind).or_default().push(processor);
    }

    pub fn bus(&self) -> EventBus {
        EventBus {
            tx: Some(self.tx.clone()),
        }
    }

    /// Spawns the dispatch task. Subsequent calls are no-ops.
    pub fn start(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut rx) = hub.rx.lock().await.take() else {
                return;
            };
            loop {
                tokio::select! {
                    _ = hub.cancel.cancelled() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        let subscribed = hub
                            .processors
                            .get(&event.kind)
                            .map(|v| v.value().clone())
                            .unwrap_or_default();
                        for p in subscribed {
                            p.on_event(&event);
                        }
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }
}
