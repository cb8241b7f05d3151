// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]

pub mod action;
pub mod backend;
pub mod pool;
pub mod session;

#[cfg(test)]
mod tests;

use std::fmt;
use std::sync::Arc;

use tokio::time::{sleep, Duration};

use crate::action::{ActionTable, GroupKey};
use crate::backend::{apply_action, ApplyOutcome, CloudBackend};
use crate::pool::WorkerPool;
use crate::session::{Role, SessionTable};

/// Why a telemetry stream ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    ClosedByPeer,
    TransportLost,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClosedByPeer => write!(f, "closed-by-peer"),
            DisconnectReason::TransportLost => write!(f, "transport-lost"),
        }
    }
}

/// Consumer of decoded VRRP role observations and telemetry stream lifecycle
/// events. Implemented by `Engine`; the telemetry receiver only sees this
/// trait.
pub trait RoleObserver: Send + Sync + 'static {
    /// Delivered once per reported virtual router, in wire order. Must not
    /// block.
    fn observe(&self, key: &GroupKey, role: Role);

    fn on_connect(&self, peer: &str);

    /// Delivered exactly once per stream, after which no further
    /// observations from that stream arrive.
    fn on_disconnect(&self, peer: &str, reason: DisconnectReason);
}

/// The state-and-action engine.
///
/// Tracks the last-known role of every configured VRRP group, dispatches
/// go-active tasks to the worker pool on rising edges (edge-triggered, no
/// precheck), and periodically re-asserts the cloud side for every group
/// currently believed active (level-triggered, precheck first).
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    actions: Arc<ActionTable>,
    sessions: SessionTable,
    cloud: Arc<dyn CloudBackend>,
    pool: WorkerPool,
    reconcile_interval: Duration,
}

impl Engine {
    pub fn new(
        actions: Arc<ActionTable>,
        cloud: Arc<dyn CloudBackend>,
        pool: WorkerPool,
        reconcile_interval: Duration,
    ) -> Engine {
        let sessions = SessionTable::new(&actions);
        Engine {
            inner: Arc::new(EngineInner {
                actions,
                sessions,
                cloud,
                pool,
                reconcile_interval,
            }),
        }
    }

    /// Runs the level-triggered reconciliation sweep forever. Must run
    /// outside the worker pool so a long sweep cannot starve edge-triggered
    /// promotion.
    pub async fn run_reconcile_loop(&self) {
        log::info!(
            "reconcile loop running every {:?} over {} group(s)",
            self.inner.reconcile_interval,
            self.inner.actions.len()
        );
        loop {
            self.reconcile_once().await;
            sleep(self.inner.reconcile_interval).await;
        }
    }

    /// One reconciliation sweep: re-assert the cloud side, precheck first,
    /// for every entry currently believed Active. Errors are logged and the
    /// sweep continues; the next tick retries.
    pub async fn reconcile_once(&self) {
        for (key, role) in self.inner.sessions.snapshot() {
            if role != Role::Active {
                continue;
            }
            let Some(action) = self.inner.actions.get(&key) else {
                continue;
            };
            match apply_action(self.inner.cloud.as_ref(), action, true).await {
                Ok(ApplyOutcome::AlreadyCurrent) => {
                    log::debug!("[{key}] reconcile: cloud state already in place");
                }
                Ok(ApplyOutcome::Applied) => {
                    metrics::increment_counter!("ha_app_reconcile_repairs_total");
                    log::info!("[{key}] reconcile re-applied action after drift");
                }
                Err(err) => {
                    metrics::increment_counter!("ha_app_reconcile_failures_total");
                    log::error!("[{key}] reconcile failed: {err}");
                }
            }
        }
    }

    /// Refresh gauge metrics; invoked before each metrics scrape.
    pub fn update_gauges(&self) {
        metrics::gauge!(
            "ha_app_active_sessions",
            self.inner.sessions.active_count() as f64
        );
    }

    #[cfg(test)]
    pub(crate) fn sessions(&self) -> &SessionTable {
        &self.inner.sessions
    }

    fn dispatch_go_active(&self, key: &GroupKey) {
        let Some(action) = self.inner.actions.get(key) else {
            return;
        };
        let action = action.clone();
        let key_for_task = key.clone();
        let key = key.clone();
        let cloud = self.inner.cloud.clone();

        metrics::increment_counter!("ha_app_go_active_dispatch_total");
        let accepted = self.inner.pool.submit(async move {
            let key = key_for_task;
            // No precheck on the edge: the peer just told us it promoted, so
            // the cloud side is assumed stale and the mutation is issued
            // unconditionally.
            match apply_action(cloud.as_ref(), &action, false).await {
                Ok(_) => log::info!("[{key}] successful go-active"),
                Err(err) => {
                    // Not re-enqueued and the session entry is untouched; the
                    // reconcile loop observes the discrepancy while the group
                    // is still believed Active.
                    metrics::increment_counter!("ha_app_go_active_failures_total");
                    log::error!("[{key}] go-active failed: {err}");
                }
            }
        });
        if !accepted {
            metrics::increment_counter!("ha_app_go_active_overflow_total");
            log::warn!("[{key}] go-active queue full, task dropped; reconcile will recover");
        }
    }
}

impl RoleObserver for Engine {
    fn observe(&self, key: &GroupKey, role: Role) {
        metrics::increment_counter!("ha_app_observations_total");

        if !self.inner.actions.contains(key) {
            log::debug!("[{key}] observation for unconfigured group dropped ({role:?})");
            return;
        }

        // The key is configured, so the session entry exists.
        let prior = self
            .inner
            .sessions
            .replace(key, role)
            .unwrap_or(Role::Inactive);
        log::info!("[{key}] role {prior:?} -> {role:?}");

        if role == Role::Active && prior == Role::Inactive {
            self.dispatch_go_active(key);
        }
    }

    fn on_connect(&self, peer: &str) {
        log::info!("telemetry peer connected: {peer}");
    }

    fn on_disconnect(&self, peer: &str, reason: DisconnectReason) {
        // With the peer gone the local view of which side is active is
        // stale; the partner may have promoted the other router. Reset so
        // the reconcile loop cannot fight the now-active side. The peer
        // re-sends current state on reconnect.
        log::warn!("telemetry peer {peer} disconnected ({reason}); resetting sessions to inactive");
        self.inner.sessions.reset_all();
    }
}
