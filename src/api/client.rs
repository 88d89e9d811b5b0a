// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::OnceCell;
use serde::{Serialize, de::DeserializeOwned};
use tracing::info;

use crate::{
    api::{InvokeTarget, Lifecycle, build_request, decode_typed, processor::UserProcessor},
    cfg::config::Config,
    error::RemotingError,
    pool::{manager::ConnectionManager, reconnect::Reconnector, url::Url},
    protocol::command::ResponseCommand,
    serialize::{JSON_CODEC, Serializer, SerializerRegistry},
    transport::{
        connection::Connection,
        dispatcher::Dispatcher,
        events::{ConnectionEventKind, ConnectionEventProcessor, EventHub},
        invoke::{InvokeFuture, InvokeResult},
    },
};

/// Client facade: owns the connection manager and exposes the four invoke
/// styles, all built on one send-on-connection primitive.
///
/// Connections are managed; user code must not close them other than via
/// [`RpcClient::close_connection`].
pub struct RpcClient {
    cfg: Arc<Config>,
    serializers: Arc<SerializerRegistry>,
    dispatcher: Arc<Dispatcher>,
    hub: Arc<EventHub>,
    manager: OnceCell<Arc<ConnectionManager>>,
    default_codec: u8,
    state: Mutex<Lifecycle>,
}

impl RpcClient {
    pub fn new(cfg: Config) -> Self {
        let serializers = Arc::new(SerializerRegistry::new());
        let dispatcher = Dispatcher::new(Arc::clone(&serializers));
        Self {
            cfg: Arc::new(cfg),
            serializers,
            dispatcher,
            hub: EventHub::new(),
            manager: OnceCell::new(),
            default_codec: JSON_CODEC,
            state: Mutex::new(Lifecycle::Fresh),
        }
    }

    /// Codec byte stamped on requests built by the typed entry points.
    pub fn set_default_codec(&mut self, codec: u8) {
        self.default_codec = codec;
    }

    pub fn register_serializer(&self, serializer: Arc<dyn Serializer>) -> Result<(), RemotingError> {
        self.serializers.register(serializer)
    }

    /// Registers a processor for inbound requests on client-held
    /// connections; the wire is fully bidirectional.
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

    /// Starts scanners and the event task. A second call without an
    /// intervening shutdown is a lifecycle error, as is any call after
    /// shutdown.
    pub fn startup(&self) -> Result<(), RemotingError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match *state {
            Lifecycle::Fresh => {},
            Lifecycle::Running => {
                return Err(RemotingError::Lifecycle("client already started".into()));
            },
            Lifecycle::Stopped => {
                return Err(RemotingError::Lifecycle("client already shut down".into()));
            },
        }

        self.hub.start();
        let manager = ConnectionManager::new(
            Arc::clone(&self.cfg),
            Arc::clone(&self.dispatcher),
            self.hub.bus(),
        );
        self.hub
            .subscribe(ConnectionEventKind::Close, manager.event_listener());
        if self.cfg.switches.reconnect {
            let reconnector = Reconnector::start(&manager);
            self.hub
                .subscribe(ConnectionEventKind::Close, reconnector.event_listener());
            manager.attach_reconnector(reconnector);
        }
        manager.start_scanner();
        let _ = self.manager.set(manager);

        *state = Lifecycle::Running;
        info!("rpc client started");
        Ok(())
    }

    /// Safe to call repeatedly; the client is unusable afterwards. Every
    /// pending future resolves and no user processor runs again.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == Lifecycle::Running {
            self.dispatcher.shutdown();
            if let Some(manager) = self.manager.get() {
                manager.shutdown();
            }
            self.hub.stop();
            info!("rpc client shut down");
        }
        *state = Lifecycle::Stopped;
    }

    /// Fire-and-forget; nothing is registered and no response ever comes.
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

    /// Blocks the caller on the future's completion and decodes the result.
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
        let resp = self
            .invoke_sync_command(target, class_name, payload, timeout_ms)
            .await?;
        decode_typed(&self.serializers, &resp)
    }

    /// Sync invoke returning the raw response command.
    pub async fn invoke_sync_command<'a, Req: Serialize>(
        &self,
        target: impl Into<InvokeTarget<'a>>,
        class_name: &str,
        payload: &Req,
        timeout_ms: u64,
    ) -> Result<ResponseCommand, RemotingError> {
        let future = self
            .invoke_with_future(target, class_name, payload, timeout_ms)
            .await?;
        future.await_response().await
    }

    /// Returns the future to the caller; completion is driven by the
    /// response, the per-request timer or a connection close.
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
        self.send_on_connection(&conn, req, None)
    }

    /// Callback style: `callback` runs on the runtime when the future
    /// completes, whoever completes it.
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
        self.send_on_connection(&conn, req, Some(Box::new(callback)))?;
        Ok(())
    }

    /// Typed view over a raw response command.
    pub fn decode_response<Resp: DeserializeOwned>(
        &self,
        resp: &ResponseCommand,
    ) -> Result<Resp, RemotingError> {
        decode_typed(&self.serializers, resp)
    }

    /// Pre-establishes the pool for an address (honouring warmup).
    pub async fn connect(&self, url: &Url) -> Result<Arc<Connection>, RemotingError> {
        self.manager()?.get_and_create_if_absent(url).await
    }

    /// Closes every connection of the address and disables its reconnect.
    pub fn close_connection(&self, addr: &str) -> Result<(), RemotingError> {
        let url: Url = addr.parse()?;
        self.manager()?.remove(&url.unique_key());
        Ok(())
    }

    pub fn connection_count(&self, addr: &str) -> Result<usize, RemotingError> {
        let url: Url = addr.parse()?;
        Ok(self.manager()?.connection_count(&url.unique_key()))
    }

    fn send_on_connection(
        &self,
        conn: &Arc<Connection>,
        req: crate::protocol::command::RequestCommand,
        callback: Option<Box<dyn FnOnce(InvokeResult) + Send + 'static>>,
    ) -> Result<InvokeFuture, RemotingError> {
        conn.send_with_callback(req, callback)?
            .ok_or_else(|| RemotingError::SendFailed("request registered no future".into()))
    }

    fn manager(&self) -> Result<&Arc<ConnectionManager>, RemotingError> {
        let state = *self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state != Lifecycle::Running {
            return Err(RemotingError::Lifecycle("client is not running".into()));
        }
        self.manager
            .get()
            .ok_or_else(|| RemotingError::Lifecycle("client is not running".into()))
    }

    async fn resolve(&self, target: InvokeTarget<'_>) -> Result<Arc<Connection>, RemotingError> {
        match target {
            InvokeTarget::Addr(addr) => {
                let url: Url = addr.parse()?;
                self.manager()?.get_and_create_if_absent(&url).await
            },
            InvokeTarget::Url(url) => self.manager()?.get_and_create_if_absent(url).await,
            InvokeTarget::Connection(conn) => {
                ConnectionManager::check(Some(conn))?;
                Ok(Arc::clone(conn))
            },
        }
    }
}
