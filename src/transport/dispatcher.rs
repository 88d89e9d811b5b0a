// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::{
    Arc, PoisonError, RwLock,
    atomic::{AtomicUsize, Ordering},
};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    api::processor::{AsyncResponder, BizContext, UserProcessor},
    error::RemotingError,
    protocol::{
        ProtocolManager,
        codec::FrameError,
        command::{
            Command, CommandCode, CommandKind, RemotingCommand, RequestCommand,
            ResponseCommand,
        },
        status::ResponseStatus,
    },
    serialize::SerializerRegistry,
    transport::connection::Connection,
};

#[derive(Clone)]
struct Registered {
    processor: Arc<dyn UserProcessor>,
    /// Executor permits; absent processors run unbounded on the runtime.
    permits: Option<Arc<Semaphore>>,
    queue_capacity: usize,
    queued: Arc<AtomicUsize>,
}

impl Registered {
    fn new(processor: Arc<dyn UserProcessor>) -> Self {
        let permits = processor
            .concurrency()
            .map(|n| Arc::new(Semaphore::new(n)));
        let queue_capacity = processor.queue_capacity();
        Self {
            processor,
            permits,
            queue_capacity,
            queued: Arc::new(AtomicUsize::new(0)),
        }
    }
}

/// Inbound pipeline shared by every connection of a client or server:
/// response correlation, inline heartbeat answers and user-processor
/// execution off the reader task.
pub struct Dispatcher {
    processors: DashMap<String, Registered>,
    default_processor: RwLock<Option<Registered>>,
    serializers: Arc<SerializerRegistry>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(serializers: Arc<SerializerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            processors: DashMap::new(),
            default_processor: RwLock::new(None),
            serializers,
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers a processor under every class name it declares.
    /// Duplicate interest registration is a startup error.
    pub fn register(&self, processor: Arc<dyn UserProcessor>) -> Result<(), RemotingError> {
        let interests = processor.interests();
        if interests.is_empty() {
            return Err(RemotingError::Lifecycle(
                "processor declares no interest".into(),
            ));
        }
        for class in &interests {
            if self.processors.contains_key(class) {
                return Err(RemotingError::Lifecycle(format!(
                    "processor for `{class}` already registered"
                )));
            }
        }
        let registered = Registered::new(processor);
        for class in interests {
            self.processors.insert(class, registered.clone());
        }
        Ok(())
    }

    /// Fallback processor for classes with no dedicated registration.
    pub fn register_default(
        &self,
        processor: Arc<dyn UserProcessor>,
    ) -> Result<(), RemotingError> {
        let mut slot = self
            .default_processor
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(RemotingError::Lifecycle(
                "default processor already registered".into(),
            ));
        }
        *slot = Some(Registered::new(processor));
        Ok(())
    }

    /// After shutdown no user processor is invoked again.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Inbound routing: the connection's protocol is resolved through the
    /// global protocol table, the command handler for that framing branches
    /// on the command code, and RPC requests then resolve their processor
    /// by class name. Both registered framings share one command handler.
    pub(crate) fn dispatch(self: &Arc<Self>, conn: &Arc<Connection>, cmd: Command) {
        if !ProtocolManager::global().is_known(conn.protocol()) {
            warn!(
                "dropping command {} from {}: protocol {:#04x} is not registered",
                cmd.id(),
                conn.remote_key(),
                conn.protocol().0
            );
            return;
        }
        match cmd.code() {
            CommandCode::Heartbeat => self.handle_heartbeat(conn, cmd),
            CommandCode::RpcResponse | CommandCode::RpcRequest => match cmd {
                Command::Response(resp) => {
                    conn.complete_pending(resp);
                },
                Command::Request(req) => self.handle_request(conn, req),
            },
        }
    }

    /// Heartbeats are answered inline on the reader task, never through a
    /// user processor.
    fn handle_heartbeat(&self, conn: &Arc<Connection>, cmd: Command) {
        match cmd {
            Command::Request(req) => {
                if req.kind != CommandKind::Oneway
                    && let Err(e) =
                        conn.send_response(ResponseCommand::heartbeat_ack(req.id))
                {
                    debug!("heartbeat ack to {} failed: {e}", conn.remote_key());
                }
            },
            Command::Response(resp) => {
                conn.complete_pending(resp);
            },
        }
    }

    /// One frame was consumed but unusable; recover at the frame boundary.
    pub(crate) fn on_rejected(self: &Arc<Self>, conn: &Arc<Connection>, fe: FrameError) {
        warn!("rejected frame id {} from {}: {}", fe.id, conn.remote_key(), fe.cause);
        match fe.kind {
            CommandKind::Response => {
                conn.fail_pending(fe.id, fe.cause);
            },
            CommandKind::Request => {
                let resp = ResponseCommand::failure(
                    fe.id,
                    0,
                    ResponseStatus::CodecException,
                    fe.cause.to_string(),
                );
                if let Err(e) = conn.send_response(resp) {
                    debug!("codec-failure response for id {} failed: {e}", fe.id);
                }
            },
            CommandKind::Oneway => {},
        }
    }

    fn handle_request(self: &Arc<Self>, conn: &Arc<Connection>, req: RequestCommand) {
        let oneway = req.kind == CommandKind::Oneway;
        let responder = AsyncResponder::new(
            Arc::downgrade(conn),
            req.id,
            req.codec,
            req.class_name.clone(),
            oneway,
            Arc::clone(&self.serializers),
        );

        let registered = self
            .processors
            .get(&req.class_name)
            .map(|e| e.value().clone())
            .or_else(|| {
                self.default_processor
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone()
            });
        let Some(registered) = registered else {
            responder.reply_error(RemotingError::NoProcessor(req.class_name));
            return;
        };

        // Fast path takes a free permit; otherwise the request queues up to
        // the processor's queue capacity and anything beyond is rejected the
        // way a saturated executor rejects a task.
        let permit = if let Some(sem) = registered.permits.clone() {
            match Arc::clone(&sem).try_acquire_owned() {
                Ok(p) => Some(p),
                Err(_) => {
                    if registered.queued.fetch_add(1, Ordering::AcqRel)
                        >= registered.queue_capacity
                    {
                        registered.queued.fetch_sub(1, Ordering::AcqRel);
                        responder.reply_error(RemotingError::ThreadpoolBusy);
                        return;
                    }
                    let this = Arc::clone(self);
                    let conn = Arc::clone(conn);
                    tokio::spawn(async move {
                        let permit = sem.acquire_owned().await;
                        registered.queued.fetch_sub(1, Ordering::AcqRel);
                        let Ok(_permit) = permit else { return };
                        this.run_request(conn, req, registered, responder).await;
                    });
                    return;
                },
            }
        } else {
            None
        };

        if self.shutdown.is_cancelled() {
            return;
        }

        let this = Arc::clone(self);
        let conn = Arc::clone(conn);
        tokio::spawn(async move {
            let _permit = permit;
            this.run_request(conn, req, registered, responder).await;
        });
    }

    async fn run_request(
        &self,
        conn: Arc<Connection>,
        req: RequestCommand,
        registered: Registered,
        responder: AsyncResponder,
    ) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let payload = if req.content.is_empty() {
            Ok(Value::Null)
        } else {
            self.serializers
                .get(req.codec)
                .and_then(|s| s.decode(&req.content))
        };
        let payload = match payload {
            Ok(v) => v,
            Err(e) => {
                responder.reply_error(e);
                return;
            },
        };

        let ctx = BizContext::new(
            conn.peer_addr(),
            req.class_name.clone(),
            req.arrive_at,
            req.timeout_ms,
            responder.clone(),
        );
        match registered.processor.process(ctx, payload).await {
            Ok(Some(value)) => responder.reply_value(value),
            // The async responder owns the reply.
            Ok(None) => {},
            Err(e) => responder.reply_error(e),
        }
    }
}
