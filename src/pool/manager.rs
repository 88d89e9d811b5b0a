// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::{Arc, PoisonError, RwLock, Weak},
    time::Instant,
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use rand::RngExt;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    error::RemotingError,
    pool::{reconnect::Reconnector, url::Url},
    transport::{
        connection::Connection,
        dispatcher::Dispatcher,
        events::{ConnectionEvent, ConnectionEventKind, ConnectionEventProcessor, EventBus},
    },
};

/// Picks one live connection out of a pool snapshot.
pub trait ConnectionSelectStrategy: Send + Sync + 'static {
    fn select(&self, conns: &[Arc<Connection>]) -> Option<Arc<Connection>>;
}

/// Uniform random pick, the default strategy.
pub struct RandomSelectStrategy;

impl ConnectionSelectStrategy for RandomSelectStrategy {
    fn select(&self, conns: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if conns.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..conns.len());
        Some(Arc::clone(&conns[idx]))
    }
}

/// Append-only list of connections sharing one unique key.
pub struct ConnectionPool {
    pub url: Url,
    conns: RwLock<Vec<Arc<Connection>>>,
    /// Single-flight gate: concurrent creators for the same key line up here.
    build_gate: Mutex<()>,
}

impl ConnectionPool {
    fn new(url: Url) -> Arc<Self> {
        Arc::new(Self {
            url,
            conns: RwLock::new(Vec::new()),
            build_gate: Mutex::new(()),
        })
    }

    fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.conns
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn live(&self) -> Vec<Arc<Connection>> {
        self.snapshot()
            .into_iter()
            .filter(|c| c.is_active())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    fn select(&self, strategy: &dyn ConnectionSelectStrategy) -> Option<Arc<Connection>> {
        strategy.select(&self.live())
    }

    fn add(&self, conn: &Arc<Connection>, key: &str) {
        self.conns
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(conn));
        conn.add_pool_key(key);
    }

    /// Drops dead connections, unlinking this alias from each.
    fn prune(&self, key: &str) {
        let mut guard = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|c| {
            if c.is_active() {
                true
            } else {
                c.remove_pool_key(key);
                false
            }
        });
    }

    fn remove_by_id(&self, conn_id: u64, key: &str) {
        let mut guard = self.conns.write().unwrap_or_else(PoisonError::into_inner);
        guard.retain(|c| {
            if c.conn_id() == conn_id {
                c.remove_pool_key(key);
                false
            } else {
                true
            }
        });
    }
}

/// Owns every outbound connection: address → pool, creation, selection,
/// liveness scanning and removal. Connections acquired here stay owned by
/// the manager until their channel goes inactive.
pub struct ConnectionManager {
    pools: DashMap<String, Arc<ConnectionPool>>,
    cfg: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    events: EventBus,
    strategy: Arc<dyn ConnectionSelectStrategy>,
    reconnector: OnceCell<Arc<Reconnector>>,
    cancel: CancellationToken,
}

impl ConnectionManager {
    pub fn new(cfg: Arc<Config>, dispatcher: Arc<Dispatcher>, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            pools: DashMap::new(),
            cfg,
            dispatcher,
            events,
            strategy: Arc::new(RandomSelectStrategy),
            reconnector: OnceCell::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub(crate) fn attach_reconnector(&self, reconnector: Arc<Reconnector>) {
        let _ = self.reconnector.set(reconnector);
    }

    pub fn reconnector(&self) -> Option<&Arc<Reconnector>> {
        self.reconnector.get()
    }

    /// Spawns the background pool scanner.
    pub fn start_scanner(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let period = self.cfg.connections.scan_interval;
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { return };
                        manager.scan();
                    }
                }
            }
        });
    }

    /// Returns a connection for `url`, building the pool when it has no
    /// live member. The first successful connect unblocks the caller;
    /// remaining builds keep filling the pool in the background. Warmup
    /// addresses wait for the whole pool instead.
    pub async fn get_and_create_if_absent(
        &self,
        url: &Url,
    ) -> Result<Arc<Connection>, RemotingError> {
        let key = url.unique_key();
        let pool = self
            .pools
            .entry(key.clone())
            .or_insert_with(|| ConnectionPool::new(url.clone()))
            .clone();

        if let Some(conn) = pool.select(&*self.strategy) {
            return Ok(conn);
        }

        let _gate = pool.build_gate.lock().await;
        // A follower that waited on the gate finds the pool already built.
        if let Some(conn) = pool.select(&*self.strategy) {
            return Ok(conn);
        }
        self.build_pool(&pool, &key, url).await?;
        pool.select(&*self.strategy)
            .ok_or_else(|| RemotingError::ConnectFailed {
                addr: key,
                detail: "pool empty after build".into(),
            })
    }

    async fn build_pool(
        &self,
        pool: &Arc<ConnectionPool>,
        key: &str,
        url: &Url,
    ) -> Result<(), RemotingError> {
        let target = url.conn_num.unwrap_or(self.cfg.connections.conn_num);
        let need = target.saturating_sub(pool.live_count());
        if need == 0 {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Result<(), RemotingError>>(need);
        for _ in 0..need {
            let url = url.clone();
            let cfg = Arc::clone(&self.cfg);
            let dispatcher = Arc::clone(&self.dispatcher);
            let events = self.events.clone();
            let pool = Arc::clone(pool);
            let key = key.to_owned();
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = Connection::connect(&url, cfg, dispatcher, events.clone()).await;
                let outcome = match res {
                    Ok(conn) => {
                        pool.add(&conn, &key);
                        Ok(())
                    },
                    Err(e) => {
                        events.emit(
                            ConnectionEventKind::ConnectFailed,
                            &key,
                            Some(e.to_string()),
                        );
                        Err(e)
                    },
                };
                let _ = tx.send(outcome).await;
            });
        }
        drop(tx);

        if url.warmup {
            let mut succeeded = 0usize;
            let mut last_err = None;
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(()) => succeeded += 1,
                    Err(e) => last_err = Some(e),
                }
            }
            if succeeded == 0 {
                return Err(last_err.unwrap_or_else(|| RemotingError::ConnectFailed {
                    addr: key.to_owned(),
                    detail: "warmup built no connection".into(),
                }));
            }
            Ok(())
        } else {
            let mut failures = 0usize;
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(()) => return Ok(()),
                    Err(e) => {
                        failures += 1;
                        if failures == need {
                            return Err(e);
                        }
                    },
                }
            }
            Err(RemotingError::ConnectFailed {
                addr: key.to_owned(),
                detail: "no connection could be established".into(),
            })
        }
    }

    /// Selected connection for an existing pool, if any.
    pub fn get(&self, key: &str) -> Option<Arc<Connection>> {
        self.pools
            .get(key)
            .and_then(|p| p.select(&*self.strategy))
    }

    /// Appends `conn` to the pool of `key`, recording the alias on the
    /// connection.
    pub fn add(&self, conn: &Arc<Connection>, key: &str) {
        let pool = self
            .pools
            .entry(key.to_owned())
            .or_insert_with(|| {
                let url = key
                    .parse()
                    .unwrap_or_else(|_| Url::new(conn.peer_addr().ip().to_string(), conn.peer_addr().port()));
                ConnectionPool::new(url)
            })
            .clone();
        pool.add(conn, key);
    }

    /// Drops the whole pool: reconnect is disabled for the address and every
    /// member is closed, which also unlinks it from any other alias.
    pub fn remove(&self, key: &str) {
        if let Some(r) = self.reconnector.get() {
            r.disable(key);
        }
        let Some((_, pool)) = self.pools.remove(key) else {
            return;
        };
        for conn in pool.snapshot() {
            for alias in conn.pool_keys() {
                if alias != key
                    && let Some(other) = self.pools.get(&alias).map(|p| Arc::clone(&p))
                {
                    other.remove_by_id(conn.conn_id(), &alias);
                }
            }
            conn.remove_pool_key(key);
            conn.close("removed from pool");
        }
    }

    /// Guard used by the invoke entry points.
    pub fn check(conn: Option<&Arc<Connection>>) -> Result<(), RemotingError> {
        match conn {
            None => Err(RemotingError::ConnectionClosed(
                "no connection available".into(),
            )),
            Some(c) if !c.is_active() => Err(RemotingError::ConnectionClosed(format!(
                "connection to {} is closed",
                c.remote_key()
            ))),
            Some(_) => Ok(()),
        }
    }

    pub fn connection_count(&self, key: &str) -> usize {
        self.pools.get(key).map(|p| p.live_count()).unwrap_or(0)
    }

    pub(crate) fn pool_url(&self, key: &str) -> Option<Url> {
        self.pools.get(key).map(|p| p.url.clone())
    }

    /// Unlinks dead members of the pool for `key`.
    pub(crate) fn prune_key(&self, key: &str) {
        if let Some(pool) = self.pools.get(key).map(|p| Arc::clone(&p)) {
            pool.prune(key);
        }
    }

    fn scan(&self) {
        let now = Instant::now();
        let keys: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(pool) = self.pools.get(&key).map(|p| Arc::clone(&p)) else {
                continue;
            };
            for conn in pool.snapshot() {
                if conn.is_active()
                    && conn.heartbeat_missed() >= self.cfg.heartbeat.max_miss
                {
                    warn!(
                        "scanner evicting {} after {} missed heartbeats",
                        conn.remote_key(),
                        conn.heartbeat_missed()
                    );
                    conn.close("heartbeat threshold exceeded");
                }
                if conn.is_active() {
                    conn.scan_pending(now);
                }
            }
            pool.prune(&key);
            if pool.is_empty() && !pool.url.warmup {
                debug!("removing empty pool for {key}");
                self.pools.remove_if(&key, |_, p| p.is_empty());
            }
        }
    }

    /// Closes everything; the manager is unusable afterwards.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(r) = self.reconnector.get() {
            r.stop();
        }
        let keys: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, pool)) = self.pools.remove(&key) {
                for conn in pool.snapshot() {
                    conn.close("manager shutdown");
                }
            }
        }
    }

    /// Event hook pruning pools as soon as a close is announced, ahead of
    /// the periodic scanner.
    pub(crate) fn event_listener(self: &Arc<Self>) -> Arc<dyn ConnectionEventProcessor> {
        Arc::new(ManagerEventListener {
            manager: Arc::downgrade(self),
        })
    }
}

struct ManagerEventListener {
    manager: Weak<ConnectionManager>,
}

impl ConnectionEventProcessor for ManagerEventListener {
    fn on_event(&self, event: &ConnectionEvent) {
        if event.kind == ConnectionEventKind::Close
            && let Some(manager) = self.manager.upgrade()
        {
            manager.prune_key(&event.remote);
        }
    }
}
