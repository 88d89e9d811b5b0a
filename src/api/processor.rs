// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{Arc, Weak},
    time::Instant,
};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use tracing::warn;

use crate::{
    error::RemotingError,
    protocol::{command::ResponseCommand, status::ResponseStatus},
    serialize::SerializerRegistry,
    transport::{connection::Connection, invoke::InvokeContext},
};

pub type ProcessorFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Option<Value>, RemotingError>> + Send + 'a>>;

/// User-provided handler bound to one or more class names.
///
/// `process` runs off the I/O task. Returning `Ok(Some(value))` answers the
/// request immediately; returning `Ok(None)` hands responsibility to the
/// [`AsyncResponder`] taken from the context, which may answer later from
/// any task. Errors become failure responses with the matching status.
pub trait UserProcessor: Send + Sync + 'static {
    /// Class names this processor answers to.
    fn interests(&self) -> Vec<String>;

    /// Concurrent-request bound; standing in for a dedicated executor.
    /// `None` runs unbounded on the shared runtime.
    fn concurrency(&self) -> Option<usize> {
        None
    }

    /// Requests allowed to queue for a permit once `concurrency` is
    /// saturated; anything beyond answers thread-pool-busy.
    fn queue_capacity(&self) -> usize {
        1024
    }

    fn process(&self, ctx: BizContext, payload: Value) -> ProcessorFuture<'_>;
}

/// Request-scoped context handed to a user processor.
pub struct BizContext {
    pub remote_addr: SocketAddr,
    pub class_name: String,
    /// When the frame was decoded on this side.
    pub arrive_at: Option<Instant>,
    pub timeout_ms: u32,
    pub invoke: InvokeContext,
    responder: AsyncResponder,
}

impl BizContext {
    pub(crate) fn new(
        remote_addr: SocketAddr,
        class_name: String,
        arrive_at: Option<Instant>,
        timeout_ms: u32,
        responder: AsyncResponder,
    ) -> Self {
        Self {
            remote_addr,
            class_name,
            arrive_at,
            timeout_ms,
            invoke: InvokeContext::default(),
            responder,
        }
    }

    /// Detachable responder for answering after `process` has returned.
    pub fn async_responder(&self) -> AsyncResponder {
        self.responder.clone()
    }
}

/// Writes the response for one request, at most once, from any task.
#[derive(Clone)]
pub struct AsyncResponder {
    conn: Weak<Connection>,
    id: u32,
    codec: u8,
    class_name: String,
    oneway: bool,
    serializers: Arc<SerializerRegistry>,
}

impl AsyncResponder {
    pub(crate) fn new(
        conn: Weak<Connection>,
        id: u32,
        codec: u8,
        class_name: String,
        oneway: bool,
        serializers: Arc<SerializerRegistry>,
    ) -> Self {
        Self {
            conn,
            id,
            codec,
            class_name,
            oneway,
            serializers,
        }
    }

    /// Answers with a typed payload or an error status.
    pub fn send_response<T: Serialize>(&self, result: Result<T, RemotingError>) {
        match result {
            Ok(v) => match serde_json::to_value(v) {
                Ok(value) => self.reply_value(value),
                Err(e) => self.reply_error(RemotingError::Serialization {
                    class_name: self.class_name.clone(),
                    detail: e.to_string(),
                }),
            },
            Err(e) => self.reply_error(e),
        }
    }

    pub(crate) fn reply_value(&self, value: Value) {
        if self.oneway {
            return;
        }
        let resp = match self
            .serializers
            .get(self.codec)
            .and_then(|s| s.encode(&value))
        {
            Ok(content) => {
                ResponseCommand::success(self.id, self.codec, self.class_name.clone(), content)
            },
            Err(e) => ResponseCommand::failure(
                self.id,
                self.codec,
                ResponseStatus::ServerSerialException,
                e.to_string(),
            ),
        };
        self.write(resp);
    }

    pub(crate) fn reply_error(&self, error: RemotingError) {
        if self.oneway {
            warn!(
                "oneway request `{}` (id {}) failed: {error}",
                self.class_name, self.id
            );
            return;
        }
        let status = match &error {
            RemotingError::Deserialization { .. }
            | RemotingError::UnknownCodec(_)
            | RemotingError::Serialization { .. }
            | RemotingError::NoProcessor(_)
            | RemotingError::ThreadpoolBusy => error.status(),
            _ => ResponseStatus::ServerException,
        };
        self.write(ResponseCommand::failure(
            self.id,
            self.codec,
            status,
            error.to_string(),
        ));
    }

    fn write(&self, resp: ResponseCommand) {
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if let Err(e) = conn.send_response(resp) {
            warn!("failed to write response for id {}: {e}", self.id);
        }
    }
}

struct SyncFnProcessor<F, Req, Resp> {
    interest: String,
    f: F,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F> UserProcessor for SyncFnProcessor<F, Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(&BizContext, Req) -> Result<Resp, RemotingError> + Send + Sync + 'static,
{
    fn interests(&self) -> Vec<String> {
        vec![self.interest.clone()]
    }

    fn process(&self, ctx: BizContext, payload: Value) -> ProcessorFuture<'_> {
        Box::pin(async move {
            let req: Req =
                serde_json::from_value(payload).map_err(|e| RemotingError::Deserialization {
                    class_name: ctx.class_name.clone(),
                    detail: e.to_string(),
                })?;
            let resp = (self.f)(&ctx, req)?;
            let value =
                serde_json::to_value(resp).map_err(|e| RemotingError::Serialization {
                    class_name: ctx.class_name.clone(),
                    detail: e.to_string(),
                })?;
            Ok(Some(value))
        })
    }
}

/// Wraps a plain function as a synchronous-style processor for one class.
pub fn sync_processor<Req, Resp, F>(
    interest: impl Into<String>,
    f: F,
) -> Arc<dyn UserProcessor>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(&BizContext, Req) -> Result<Resp, RemotingError> + Send + Sync + 'static,
{
    Arc::new(SyncFnProcessor {
        interest: interest.into(),
        f,
        _marker: std::marker::PhantomData,
    })
}

struct AsyncFnProcessor<F, Req, Resp> {
    interest: String,
    f: F,
    _marker: std::marker::PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp, F, Fut> UserProcessor for AsyncFnProcessor<F, Req, Resp>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(BizContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RemotingError>> + Send + 'static,
{
    fn interests(&self) -> Vec<String> {
        vec![self.interest.clone()]
    }

    fn process(&self, ctx: BizContext, payload: Value) -> ProcessorFuture<'_> {
        Box::pin(async move {
            let class_name = ctx.class_name.clone();
            let req: Req =
                serde_json::from_value(payload).map_err(|e| RemotingError::Deserialization {
                    class_name: class_name.clone(),
                    detail: e.to_string(),
                })?;
            let resp = (self.f)(ctx, req).await?;
            let value = serde_json::to_value(resp).map_err(|e| RemotingError::Serialization {
                class_name,
                detail: e.to_string(),
            })?;
            Ok(Some(value))
        })
    }
}

/// Wraps an async function as a processor for one class.
pub fn async_processor<Req, Resp, F, Fut>(
    interest: impl Into<String>,
    f: F,
) -> Arc<dyn UserProcessor>
where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(BizContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Resp, RemotingError>> + Send + 'static,
{
    Arc::new(AsyncFnProcessor {
        interest: interest.into(),
        f,
        _marker: std::marker::PhantomData,
    })
}

struct BoundedProcessor {
    inner: Arc<dyn UserProcessor>,
    limit: usize,
    queue: usize,
}

impl UserProcessor for BoundedProcessor {
    fn interests(&self) -> Vec<String> {
        self.inner.interests()
    }

    fn concurrency(&self) -> Option<usize> {
        Some(self.limit)
    }

    fn queue_capacity(&self) -> usize {
        self.queue
    }

    fn process(&self, ctx: BizContext, payload: Value) -> ProcessorFuture<'_> {
        self.inner.process(ctx, payload)
    }
}

/// Caps a processor at `limit` concurrent requests with the default queue.
pub fn with_concurrency(inner: Arc<dyn UserProcessor>, limit: usize) -> Arc<dyn UserProcessor> {
    with_concurrency_and_queue(inner, limit, 1024)
}

/// Caps a processor at `limit` concurrent requests and `queue` waiters;
/// anything beyond answers with a thread-pool-busy status.
pub fn with_concurrency_and_queue(
    inner: Arc<dyn UserProcessor>,
    limit: usize,
    queue: usize,
) -> Arc<dyn UserProcessor> {
    Arc::new(BoundedProcessor {
        inner,
        limit,
        queue,
    })
}
