// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    cfg::config::Config,
    error::RemotingError,
    pool::url::Url,
    protocol::{
        ProtocolCode, ProtocolManager,
        codec::{Decoded, FrameCodec},
        command::{Command, RequestCommand, ResponseCommand},
    },
    transport::{
        dispatcher::Dispatcher,
        events::{ConnectionEventKind, EventBus},
        heartbeat,
        invoke::{InvokeCallback, InvokeFuture, PendingTable},
    },
};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-start anchor for the millisecond read/write stamps.
static EPOCH: OnceCell<Instant> = OnceCell::new();

fn now_ms() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// One TCP channel plus its per-connection state: pending invokes,
/// attributes, pool aliases and heartbeat counters.
///
/// The reader and writer tasks own the socket halves; the Connection owns
/// the send queue and the cancellation token, so dropping the channel tasks
/// never keeps a closed Connection alive.
pub struct Connection {
    conn_id: u64,
    remote: String,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    cfg: Arc<Config>,
    protocol: AtomicU8,
    /// Minor protocol version stamped into outbound frames.
    ver2: u8,
    pending: PendingTable,
    attributes: DashMap<String, String>,
    pool_keys: Mutex<HashSet<String>>,
    heartbeat_missed: AtomicU32,
    heartbeat_enabled: AtomicBool,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    next_id: AtomicU32,
    out_tx: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    closed: AtomicBool,
    events: EventBus,
    self_weak: OnceCell<Weak<Connection>>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("conn_id", &self.conn_id)
            .field("remote", &self.remote)
            .field("active", &self.is_active())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Connection {
    /// Dials `url` and spins up the full pipeline. The client-side idle
    /// monitor starts with the connection.
    pub(crate) async fn connect(
        url: &Url,
        cfg: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
    ) -> Result<Arc<Self>, RemotingError> {
        let connect_timeout = url.connect_timeout.unwrap_or(cfg.connections.connect_timeout);
        let addr = url.socket_addr();
        let stream = timeout(connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| RemotingError::ConnectFailed {
                addr: addr.clone(),
                detail: format!("connect timed out after {connect_timeout:?}"),
            })?
            .map_err(|e| RemotingError::ConnectFailed {
                addr: addr.clone(),
                detail: e.to_string(),
            })?;

        let conn = Self::spawn_pipeline(
            stream,
            url.unique_key(),
            url.protocol,
            url.version,
            cfg,
            dispatcher,
            &events,
        )?;

        let idle = url.idle_timeout.unwrap_or(conn.cfg.heartbeat.interval);
        heartbeat::spawn_client_monitor(&conn, idle);

        events.emit(ConnectionEventKind::Connect, &conn.remote, None);
        Ok(conn)
    }

    /// Wraps an accepted socket. The server-side idle watchdog starts with
    /// the connection.
    pub(crate) fn accept(
        stream: TcpStream,
        cfg: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        events: EventBus,
    ) -> Result<Arc<Self>, RemotingError> {
        let peer = stream.peer_addr()?;
        let protocol = cfg.protocol_code();
        let conn = Self::spawn_pipeline(
            stream,
            format!("{}:{}", peer.ip(), peer.port()),
            protocol,
            1,
            cfg,
            dispatcher,
            &events,
        )?;

        heartbeat::spawn_server_watchdog(&conn, conn.cfg.heartbeat.server_idle);

        events.emit(ConnectionEventKind::Connect, &conn.remote, None);
        Ok(conn)
    }

    /// Builds the Connection and spawns its reader and writer tasks. The
    /// handle is fully wired before either loop starts, so inbound events
    /// always find the connection state.
    fn spawn_pipeline(
        stream: TcpStream,
        remote: String,
        protocol: ProtocolCode,
        ver2: u8,
        cfg: Arc<Config>,
        dispatcher: Arc<Dispatcher>,
        events: &EventBus,
    ) -> Result<Arc<Self>, RemotingError> {
        stream.set_nodelay(true)?;
        stream.set_linger(None)?;
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (r, w) = stream.into_split();

        let (out_tx, out_rx) = mpsc::channel(cfg.buffer.high_watermark);
        let started = now_ms();
        let conn = Arc::new(Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            peer_addr,
            local_addr,
            cfg,
            protocol: AtomicU8::new(protocol.0),
            ver2,
            pending: PendingTable::new(),
            attributes: DashMap::new(),
            pool_keys: Mutex::new(HashSet::new()),
            heartbeat_missed: AtomicU32::new(0),
            heartbeat_enabled: AtomicBool::new(true),
            last_read_ms: AtomicU64::new(started),
            last_write_ms: AtomicU64::new(started),
            next_id: AtomicU32::new(1),
            out_tx,
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
            events: events.clone(),
            self_weak: OnceCell::new(),
        });
        let _ = conn.self_weak.set(Arc::downgrade(&conn));

        let reader = Arc::clone(&conn);
        tokio::spawn(async move {
            reader.read_loop(r, dispatcher).await;
        });

        let writer = Arc::downgrade(&conn);
        let cancel = conn.cancel.clone();
        tokio::spawn(async move {
            write_loop(writer, w, out_rx, cancel).await;
        });

        Ok(conn)
    }

    /// Sends a request. Returns a future iff the request expects a response.
    pub fn send(&self, req: RequestCommand) -> Result<Option<InvokeFuture>, RemotingError> {
        self.send_with_callback(req, None)
    }

    /// Same as [`Connection::send`] with a completion callback attached to
    /// the future before it can possibly complete.
    pub fn send_with_callback(
        &self,
        mut req: RequestCommand,
        callback: Option<InvokeCallback>,
    ) -> Result<Option<InvokeFuture>, RemotingError> {
        if !self.is_active() {
            return Err(RemotingError::ConnectionClosed(format!(
                "connection to {} is closed",
                self.remote
            )));
        }

        req.id = self.next_request_id();
        req.ver2 = self.ver2;
        let id = req.id;
        let expects = req.kind.expects_response();
        let timeout = Duration::from_millis(u64::from(req.timeout_ms));

        let mut frame = BytesMut::with_capacity(
            64 + req.class_name.len() + req.header.len() + req.content.len(),
        );
        let cmd = Command::Request(req);
        self.codec().encode(&cmd, &mut frame)?;

        let future = expects.then(|| self.pending.register(id, timeout, callback));

        match self.out_tx.try_send(frame.freeze()) {
            Ok(()) => {
                self.touch_write();
                if future.is_some() {
                    self.arm_timeout(id, timeout);
                }
                Ok(future)
            },
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.pending.discard(id);
                Err(RemotingError::Overload {
                    capacity: self.cfg.buffer.high_watermark,
                })
            },
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.pending.discard(id);
                Err(RemotingError::ConnectionClosed(format!(
                    "connection to {} is closed",
                    self.remote
                )))
            },
        }
    }

    /// Writes a response frame; used by the inbound dispatch path.
    pub(crate) fn send_response(&self, resp: ResponseCommand) -> Result<(), RemotingError> {
        let mut frame = BytesMut::with_capacity(
            64 + resp.class_name.len() + resp.header.len() + resp.content.len(),
        );
        let cmd = Command::Response(resp);
        self.codec().encode(&cmd, &mut frame)?;
        match self.out_tx.try_send(frame.freeze()) {
            Ok(()) => {
                self.touch_write();
                Ok(())
            },
            Err(mpsc::error::TrySendError::Full(_)) => Err(RemotingError::Overload {
                capacity: self.cfg.buffer.high_watermark,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(RemotingError::ConnectionClosed(
                format!("connection to {} is closed", self.remote),
            )),
        }
    }

    /// Exact per-request timer; the reaper sweep only backs this up. The
    /// timer holds a weak handle so it never keeps a closed connection
    /// alive for the duration of a long timeout.
    fn arm_timeout(&self, id: u32, after: Duration) {
        let cancel = self.cancel.clone();
        let weak = self.self_weak.get().cloned();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {},
                _ = tokio::time::sleep(after) => {
                    if let Some(conn) = weak.and_then(|w| w.upgrade()) {
                        conn.fail_pending(id, RemotingError::Timeout {
                            id,
                            timeout_ms: after.as_millis() as u64,
                        });
                    }
                },
            }
        });
    }

    /// Closing completes every pending invoke, tears down both I/O tasks
    /// and announces the close on the event bus.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing connection to {}: {reason}", self.remote);
        self.pending.drain(reason);
        self.cancel.cancel();
        self.events
            .emit(ConnectionEventKind::Close, &self.remote, Some(reason.to_owned()));
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }

    #[inline]
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub(crate) fn config(&self) -> &Arc<Config> {
        &self.cfg
    }

    /// Unique key of the remote address.
    pub fn remote_key(&self) -> &str {
        &self.remote
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_protocol(&self, code: ProtocolCode) {
        self.protocol.store(code.0, Ordering::Relaxed);
    }

    pub fn protocol(&self) -> ProtocolCode {
        ProtocolCode(self.protocol.load(Ordering::Relaxed))
    }

    pub fn attr(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(|v| v.clone())
    }

    pub fn set_attr(&self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn remove_attr(&self, key: &str) -> Option<String> {
        self.attributes.remove(key).map(|(_, v)| v)
    }

    pub fn set_heartbeat_enabled(&self, enabled: bool) {
        self.heartbeat_enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn heartbeat_enabled(&self) -> bool {
        self.heartbeat_enabled.load(Ordering::Relaxed)
    }

    pub(crate) fn heartbeat_missed(&self) -> u32 {
        self.heartbeat_missed.load(Ordering::Relaxed)
    }

    pub(crate) fn record_heartbeat_miss(&self) -> u32 {
        self.heartbeat_missed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn reset_heartbeat_missed(&self) {
        self.heartbeat_missed.store(0, Ordering::Relaxed);
    }

    pub(crate) fn add_pool_key(&self, key: &str) {
        self.pool_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_owned());
    }

    pub(crate) fn remove_pool_key(&self, key: &str) {
        self.pool_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Every pool alias this connection is reachable through.
    pub fn pool_keys(&self) -> Vec<String> {
        self.pool_keys
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn read_idle(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_read_ms.load(Ordering::Relaxed)))
    }

    pub fn write_idle(&self) -> Duration {
        Duration::from_millis(now_ms().saturating_sub(self.last_write_ms.load(Ordering::Relaxed)))
    }

    /// Number of requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Responses discarded because no pending entry matched.
    pub fn dropped_responses(&self) -> u64 {
        self.pending.dropped()
    }

    pub(crate) fn announce_reconnect(&self) {
        self.events
            .emit(ConnectionEventKind::Reconnect, &self.remote, None);
    }

    pub(crate) fn complete_pending(&self, resp: ResponseCommand) -> bool {
        self.pending.complete_response(resp)
    }

    pub(crate) fn fail_pending(&self, id: u32, error: RemotingError) {
        self.pending.fail(id, error);
    }

    pub(crate) fn scan_pending(&self, now: Instant) {
        self.pending.scan(now);
    }

    fn next_request_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.protocol(), self.cfg.switches.crc_check)
            .with_max_frame_len(self.cfg.wire.max_frame_len)
    }

    fn touch_read(&self) {
        self.last_read_ms.store(now_ms(), Ordering::Relaxed);
    }

    fn touch_write(&self) {
        self.last_write_ms.store(now_ms(), Ordering::Relaxed);
    }

    async fn read_loop(self: Arc<Self>, mut r: OwnedReadHalf, dispatcher: Arc<Dispatcher>) {
        let mut buf = BytesMut::with_capacity(64 * 1024);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                res = r.read_buf(&mut buf) => {
                    match res {
                        Ok(0) => {
                            self.close("peer closed the connection");
                            return;
                        },
                        Ok(_) => {
                            self.touch_read();
                            loop {
                                // The retained tail always starts at a frame
                                // boundary, so the first byte is the peer's
                                // protocol code; outbound frames mirror it.
                                if let Some(&proto) = buf.first()
                                    && ProtocolManager::global().is_known(ProtocolCode(proto))
                                {
                                    self.set_protocol(ProtocolCode(proto));
                                }
                                match self.codec().decode(&mut buf) {
                                    Ok(Decoded::Incomplete) => break,
                                    Ok(Decoded::Frame(cmd)) => {
                                        dispatcher.dispatch(&self, cmd);
                                    },
                                    Ok(Decoded::Rejected(fe)) => {
                                        dispatcher.on_rejected(&self, fe);
                                    },
                                    Err(e) => {
                                        warn!("stream torn on {}: {e}", self.remote);
                                        self.events.emit(
                                            ConnectionEventKind::Exception,
                                            &self.remote,
                                            Some(e.to_string()),
                                        );
                                        self.close("unrecoverable codec failure");
                                        return;
                                    },
                                }
                            }
                        },
                        Err(e) => {
                            self.events.emit(
                                ConnectionEventKind::Exception,
                                &self.remote,
                                Some(e.to_string()),
                            );
                            self.close("read failed");
                            return;
                        },
                    }
                }
            }
        }
    }
}

async fn write_loop(
    conn: Weak<Connection>,
    mut w: OwnedWriteHalf,
    mut out_rx: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = w.shutdown().await;
                return;
            },
            frame = out_rx.recv() => {
                let Some(frame) = frame else { return };
                if let Err(e) = w.write_all(&frame).await {
                    warn!("write failed: {e}");
                    if let Some(conn) = conn.upgrade() {
                        conn.events.emit(
                            ConnectionEventKind::Exception,
                            &conn.remote,
                            Some(e.to_string()),
                        );
                        conn.close("write failed");
                    }
                    return;
                }
            }
        }
    }
}
