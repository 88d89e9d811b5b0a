// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{error::RemotingError, protocol::command::ResponseCommand};

pub type InvokeResult = Result<ResponseCommand, RemotingError>;

/// Completion hook for callback-style invokes; dispatched on a spawned task,
/// never on the I/O path that completed the future.
pub type InvokeCallback = Box<dyn FnOnce(InvokeResult) + Send + 'static>;

/// Per-invoke attributes travelling alongside a request locally.
#[derive(Debug, Default, Clone)]
pub struct InvokeContext {
    values: Arc<DashMap<String, String>>,
}

impl InvokeContext {
    pub fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }
}

/// Shared completion state of one outstanding request.
///
/// Exactly one of {response, timeout, connection-closed, local cancel} wins
/// the `completed` flag; later completions are no-ops.
pub(crate) struct InvokeShared {
    id: u32,
    deadline: Instant,
    timeout_ms: u64,
    completed: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<InvokeResult>>>,
    callback: Mutex<Option<InvokeCallback>>,
}

impl InvokeShared {
    /// Returns whether this call won the completion race.
    pub(crate) fn complete(&self, result: InvokeResult) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        let callback = self
            .callback
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(cb) = callback {
            tokio::spawn(async move { cb(result) });
            return true;
        }
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
        true
    }

    #[inline]
    pub(crate) fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Completion object handed to the caller of a response-expecting invoke.
pub struct InvokeFuture {
    shared: Arc<InvokeShared>,
    rx: oneshot::Receiver<InvokeResult>,
}

impl InvokeFuture {
    #[inline]
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    #[inline]
    pub fn is_done(&self) -> bool {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Local cancellation; completes the future with a timeout status.
    pub fn cancel(&self) {
        self.shared.complete(Err(RemotingError::Timeout {
            id: self.shared.id,
            timeout_ms: self.shared.timeout_ms,
        }));
    }

    /// Waits for the completion; the per-request timer bounds this wait.
    pub async fn await_response(self) -> InvokeResult {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(RemotingError::ConnectionClosed(
                "invoke abandoned before completion".into(),
            )),
        }
    }
}

/// Pending-request table of one connection, keyed by request id.
pub struct PendingTable {
    entries: DashMap<u32, Arc<InvokeShared>>,
    dropped: AtomicU64,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Inserts a fresh pending entry. A colliding id would mean the
    /// per-connection counter wrapped onto a still-pending request.
    pub fn register(
        &self,
        id: u32,
        timeout: Duration,
        callback: Option<InvokeCallback>,
    ) -> InvokeFuture {
        let (tx, rx) = oneshot::channel();
        let shared = Arc::new(InvokeShared {
            id,
            deadline: Instant::now() + timeout,
            timeout_ms: timeout.as_millis() as u64,
            completed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            callback: Mutex::new(callback),
        });
        let prev = self.entries.insert(id, Arc::clone(&shared));
        debug_assert!(prev.is_none(), "pending id {id} collided");
        InvokeFuture { shared, rx }
    }

    fn remove(&self, id: u32) -> Option<Arc<InvokeShared>> {
        self.entries.remove(&id).map(|(_, shared)| shared)
    }

    /// Drops a registration without completing it; the rollback path when a
    /// send never made it onto the wire.
    pub fn discard(&self, id: u32) {
        self.entries.remove(&id);
    }

    /// Completes the matching entry with a response. A response without a
    /// pending entry (late after timeout, or never ours) is dropped silently
    /// beyond a counter.
    pub fn complete_response(&self, response: ResponseCommand) -> bool {
        let id = response.id;
        match self.remove(id) {
            Some(shared) => {
                shared.complete(Ok(response));
                true
            },
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("dropping response for unknown request id {id}");
                false
            },
        }
    }

    /// Fails the matching entry, if still pending.
    pub fn fail(&self, id: u32, error: RemotingError) {
        if let Some(shared) = self.remove(id) {
            shared.complete(Err(error));
        }
    }

    /// Fails every pending entry; used when the connection goes down.
    pub fn drain(&self, reason: &str) {
        let ids: Vec<u32> = self.entries.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.fail(id, RemotingError::ConnectionClosed(reason.to_owned()));
        }
    }

    /// Reaper sweep: times out entries whose deadline passed but whose exact
    /// timer never fired. A safety net against leaks, not the primary timer.
    pub fn scan(&self, now: Instant) {
        let expired: Vec<(u32, u64)> = self
            .entries
            .iter()
            .filter(|e| e.value().deadline() <= now)
            .map(|e| (*e.key(), e.value().timeout_ms))
            .collect();
        for (id, timeout_ms) in expired {
            self.fail(id, RemotingError::Timeout { id, timeout_ms });
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Responses discarded for want of a pending entry.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
