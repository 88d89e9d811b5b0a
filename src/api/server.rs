// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use dashmap::DashMap;
use once_cell::sync::OnceCell;
use serde::{Serialize, de::DeserializeOwned};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    api::{InvokeTarget, Lifecycle, build_request, decode_typed, processor::UserProcessor},
    cfg::config::Config,
    error::RemotingError,
    pool::{manager::ConnectionManager, url::Url},
    protocol::command::ResponseCommand,
    serialize::{JSON_CODEC, Serializer, SerializerRegistry},
    transport::{
        connection::Connection,
        dispatcher::Dispatcher,
        events::{ConnectionEventKind, ConnectionEventProcessor, EventHub},
        invoke::{InvokeFuture, InvokeResult},
    },
};

/// Server facade: accept loop, per-connection pipelines and the same four
/// invoke styles as the client, restricted to connection targets unless
/// server-side connection management is switched on.
pub struct RpcServer {
    bind_addr: String,
    cfg: Arc<Config>,
    serializers: Arc<SerializerRegistry>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    manager: OnceCell<Arc<ConnectionManager>>,
    conns: Arc<DashMap<u64, Arc<Connection>>>,
    local_addr: OnceCell<SocketAddr>,
    cancel: CancellationToken,
    default_codec: u8,
    state: Mutex<Lifecycle>,
}

impl RpcServer {
    pub fn new(cfg: Config, bind_addr: impl Into<String>) -> Self {
        let serializers = Arc::new(SerializerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&serializers));
        Self {
            bind_addr: bind_addr.into(),
            cfg: Arc::new(cfg),
            serializers,
            dispatcher,
            hub: EventHub::new(),
            manager: OnceCell::new(),
            conns: Arc::new(DashMap::new()),
            local_addr: OnceCell::new(),
            cancel: CancellationToken::new(),
            default_codec: JSON_CODEC,
            state: Mutex::new(Lifecycle::Fresh),
        }
    }

    pub fn register_serializer(&self, serializer: Arc<dyn Serializer>) -> Result<(), RemotingError> {
        self.serializers.register(serializer)
    }

    pub fn register_processor(&self, processor: Arc<dyn UserProcessor>) -> Result<(), RemotingError> {
        self.dispatcher.register(processor)
    }

    pub fn register_default_processor(
        &self,
        processor: Arc<dyn UserProcessor>,
    ) -> Result<(), RemotingError> {
        self.dispatcher.register_default(processor)
    }

    pub fn subscribe_event(
        &self,
        kind: ConnectionEventKind,
        processor: Arc<dyn ConnectionEventProcessor>,
    ) {
        self.hub.subscribe(kind, processor);
    }

    /// Binds and starts accepting. The caller suspends only for the bind;
    /// a second startup without shutdown is a lifecycle error.
    pub async fn startup(&self) -> Result<(), RemotingError> {
        {
            let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state {
                Lifecycle::Fresh => {},
                Lifecycle::Running => {
                    return Err(RemotingError::Lifecycle("server already started".into()));
                },
                Lifecycle::Stopped => {
                    return Err(RemotingError::Lifecycle("server already shut down".into()));
                },
            }
        }

        self.hub.start();
        if self.cfg.switches.server_manage {
            let manager = ConnectionManager::new(
                Arc::clone(&self.cfg),
                Arc::clone(&self.dispatcher),
                self.hub.bus(),
            );
            self.hub
                .subscribe(ConnectionEventKind::Close, manager.event_listener());
            manager.start_scanner();
            let _ = self.manager.set(manager);
        }

        let listener = TcpListener::bind(&self.bind_addr).await?;
        let local = listener.local_addr()?;
        let _ = self.local_addr.set(local);

        let cfg = Arc::clone(&self.cfg);
        let dispatcher = Arc::clone(&self.dispatcher);
        let bus = self.hub.bus();
        let conns = Arc::clone(&self.conns);
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                match Connection::accept(
                                    stream,
                                    Arc::clone(&cfg),
                                    Arc::clone(&dispatcher),
                                    bus.clone(),
                                ) {
                                    Ok(conn) => {
                                        conns.retain(|_, c| c.is_active());
                                        conns.insert(conn.conn_id(), conn);
                                    },
                                    Err(e) => warn!("failed to accept {peer}: {e}"),
                                }
                            },
                            Err(e) => {
                                warn!("accept failed: {e}");
                            },
                        }
                    }
                }
            }
        });

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Lifecycle::Running;
        info!("rpc server listening on {local}");
        Ok(())
    }

    /// Actual bound address; useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Snapshot of the live accepted connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.conns
            .iter()
            .filter(|e| e.value().is_active())
            .map(|e| Arc::clone(e.value()))
            .collect()
    }

    /// Safe to call repeatedly; the server is unusable afterwards.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == Lifecycle::Running {
            self.cancel.cancel();
            self.dispatcher.shutdown();
            for entry in self.conns.iter() {
                entry.value().close("server shutdown");
            }
            self.conns.clear();
            if let Some(manager) = self.manager.get() {
                manager.shutdown();
            }
            self.hub.stop();
            info!("rpc server shut down");
        }
        *state = Lifecycle::Stopped;
    }

    /// Fire-and-forget towards a connected peer.
    pub async fn oneway<'a, T: Serialize>(
        &self,
        target: impl Into<InvokeTarget<'a>>,
        class_name: &str,
        payload: &T,
    ) -> Result<(), RemotingError> {
        let conn = self.resolve(target.into()).await?;
        let req = build_request(&self.serializers, self.default_codec, class_name, payload, 0, true)?;
        conn.send(req)?;
        Ok(())
    }

    pub async fn invoke_sync<'a, Req, Resp>(
        &self,
        target: impl Into<InvokeTarget<'a>>,
        class_name: &str,
        payload: &Req,
        timeout_ms: u64,
    ) -> Result<Resp, RemotingError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let future = self
            .invoke_with_future(target, class_name, payload, timeout_ms)
            .await?;
        let resp = future.await_response().await?;
        decode_typed(&self.serializers, &resp)
    }

    pub async fn invoke_with_future<'a, Req: Serialize>(
        &self,
        target: impl Into<InvokeTarget<'a>>,
        class_name: &str,
        payload: &Req,
        timeout_ms: u64,
    ) -> Result<InvokeFuture, RemotingError> {
        let conn = self.resolve(target.into()).await?;
        let req = build_request(
            &self.serializers,
            self.default_codec,
            class_name,
            payload,
            timeout_ms,
            false,
        )?;
        conn.send(req)?
            .ok_or_else(|| RemotingError::SendFailed("request registered no future".into()))
    }

    pub async fn invoke_with_callback<'a, Req, F>(
        &self,
        target: impl Into<InvokeTarget<'a>>,
        class_name: &str,
        payload: &Req,
        timeout_ms: u64,
        callback: F,
    ) -> Result<(), RemotingError>
    where
        Req: Serialize,
        F: FnOnce(InvokeResult) + Send + 'static,
    {
        let conn = self.resolve(target.into()).await?;
        let req = build_request(
            &self.serializers,
            self.default_codec,
            class_name,
            payload,
            timeout_ms,
            false,
        )?;
        conn.send_with_callback(req, Some(Box::new(callback)))?;
        Ok(())
    }

    pub fn decode_response<Resp: DeserializeOwned>(
        &self,
        resp: &ResponseCommand,
    ) -> Result<Resp, RemotingError> {
        decode_typed(&self.serializers, resp)
    }

    async fn resolve(&self, target: InvokeTarget<'_>) -> Result<Arc<Connection>, RemotingError> {
        match target {
            InvokeTarget::Connection(conn) => {
                ConnectionManager::check(Some(conn))?;
                Ok(Arc::clone(conn))
            },
            InvokeTarget::Addr(addr) => {
                let url: Url = addr.parse()?;
                self.managed()?.get_and_create_if_absent(&url).await
            },
            InvokeTarget::Url(url) => self.managed()?.get_and_create_if_absent(url).await,
        }
    }

    fn managed(&self) -> Result<&Arc<ConnectionManager>, RemotingError> {
        self.manager.get().ok_or_else(|| {
            RemotingError::Lifecycle(
                "address targets need server-side connection management".into(),
            )
        })
    }
}
