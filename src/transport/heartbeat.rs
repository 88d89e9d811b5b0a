// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::{
    error::RemotingError,
    protocol::command::RequestCommand,
    transport::connection::Connection,
};

/// Client-side idle monitor: pings over the normal invoke plumbing once
/// both directions have been quiet for `idle`, and evicts the connection
/// after `max_miss` consecutive failures.
pub(crate) fn spawn_client_monitor(conn: &Arc<Connection>, idle: Duration) {
    let weak = Arc::downgrade(conn);
    let max_miss = conn.config().heartbeat.max_miss;
    let enabled = conn.config().heartbeat.enabled;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(idle);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(conn) = weak.upgrade() else { return };
            if !conn.is_active() {
                return;
            }
            conn.scan_pending(Instant::now());
            if !enabled || !conn.heartbeat_enabled() {
                continue;
            }
            if conn.read_idle() < idle || conn.write_idle() < idle {
                continue;
            }
            match ping(&conn).await {
                Ok(()) => conn.reset_heartbeat_missed(),
                Err(e) => {
                    let missed = conn.record_heartbeat_miss();
                    debug!(
                        "heartbeat to {} failed ({missed}/{max_miss}): {e}",
                        conn.remote_key()
                    );
                    if missed >= max_miss {
                        warn!(
                            "evicting {} after {missed} missed heartbeats",
                            conn.remote_key()
                        );
                        conn.close("heartbeat threshold exceeded");
                        return;
                    }
                },
            }
        }
    });
}

/// Server-side watchdog: a connection that stays read-idle past the window
/// is closed. Doubles as the pending-table reaper for server-initiated
/// invokes.
pub(crate) fn spawn_server_watchdog(conn: &Arc<Connection>, idle: Duration) {
    let weak = Arc::downgrade(conn);
    let period = conn.config().connections.scan_interval.min(idle);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(conn) = weak.upgrade() else { return };
            if !conn.is_active() {
                return;
            }
            conn.scan_pending(Instant::now());
            if conn.read_idle() >= idle {
                warn!("closing {} after read idle of {idle:?}", conn.remote_key());
                conn.close("server idle timeout");
                return;
            }
        }
    });
}

async fn ping(conn: &Arc<Connection>) -> Result<(), RemotingError> {
    let future = conn
        .send(RequestCommand::heartbeat())?
        .ok_or_else(|| RemotingError::SendFailed("heartbeat expects a response".into()))?;
    let resp = future.await_response().await?;
    if resp.status.is_success() {
        Ok(())
    } else {
        Err(RemotingError::Remote {
            status: resp.status,
            detail: resp.cause_text(),
        })
    }
}
