//! Backend connection pools
//!
//! One fixed-length pool per backend kind (TKS, CA, DRM). Connections are
//! handed out round-robin; a connection-level fault fails over to the next
//! slot, at most one full pass per logical call.
//!
//! Pool state (rotation cursor, outstanding leases) lives behind one mutex
//! per pool. Callers see a single linear sequence of cursor advances, which
//! spreads load evenly but gives no per-caller affinity.

pub mod lease;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::backend::{BackendKind, BackendTransport};
use crate::diagnostics::{Diagnostics, LogLevel};
use crate::types::{RaError, Result};

pub use lease::{ConnectionLease, FailoverBudget, Served};

struct PoolState {
    /// Next slot to hand out; always < slot count when the pool is non-empty
    cursor: usize,
    /// Leases currently out, per slot
    in_use: Vec<usize>,
    failovers: u64,
}

/// Fixed-length, ordered pool of connections to one backend kind.
pub struct ConnectionPool {
    kind: BackendKind,
    slots: Vec<Arc<dyn BackendTransport>>,
    state: Mutex<PoolState>,
    diagnostics: Diagnostics,
}

impl ConnectionPool {
    /// Create a pool over `slots`. The length is fixed from here on.
    pub fn new(kind: BackendKind, slots: Vec<Arc<dyn BackendTransport>>) -> Self {
        Self::with_diagnostics(kind, slots, Diagnostics::default())
    }

    pub fn with_diagnostics(
        kind: BackendKind,
        slots: Vec<Arc<dyn BackendTransport>>,
        diagnostics: Diagnostics,
    ) -> Self {
        let len = slots.len();
        Self {
            kind,
            slots,
            state: Mutex::new(PoolState {
                cursor: 0,
                in_use: vec![0; len],
                failovers: 0,
            }),
            diagnostics,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Endpoint identities in slot order
    pub fn endpoints(&self) -> Vec<String> {
        self.slots.iter().map(|s| s.endpoint().to_string()).collect()
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        // State is plain counters; a panic elsewhere can't leave it torn
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn exhausted(&self, attempts: usize) -> RaError {
        RaError::BackendExhausted {
            kind: self.kind,
            attempts,
        }
    }

    fn lease_slot(self: &Arc<Self>, state: &mut PoolState, index: usize) -> ConnectionLease {
        state.in_use[index] += 1;
        ConnectionLease::new(Arc::clone(self), index, Arc::clone(&self.slots[index]))
    }

    /// Hand out the next connection in round-robin order.
    ///
    /// `affinity` names the endpoint that served this caller before. It is
    /// only reported, never used to pin the choice.
    pub fn acquire(self: &Arc<Self>, affinity: Option<&str>) -> Result<ConnectionLease> {
        if self.slots.is_empty() {
            return Err(self.exhausted(0));
        }
        let lease = {
            let mut state = self.state();
            let index = state.cursor;
            state.cursor = (index + 1) % self.slots.len();
            self.lease_slot(&mut state, index)
        };

        if let Some(previous) = affinity {
            let previous_index = self.index_of(previous);
            self.diagnostics.debug(
                LogLevel::PerPdu,
                "ConnectionPool::acquire",
                "Connection acquired",
                &[
                    ("kind", &self.kind),
                    ("slot", &lease.index()),
                    ("previous", &previous_index.map_or(-1, |i| i as i64)),
                ],
            );
        } else {
            self.diagnostics.debug(
                LogLevel::PerPdu,
                "ConnectionPool::acquire",
                "Connection acquired",
                &[("kind", &self.kind), ("slot", &lease.index())],
            );
        }
        Ok(lease)
    }

    /// Return a connection to availability. Never blocks beyond the pool lock.
    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    pub(crate) fn release_slot(&self, index: usize) {
        let mut state = self.state();
        if let Some(count) = state.in_use.get_mut(index) {
            *count = count.saturating_sub(1);
        }
    }

    /// A budget allowing one full pass over this pool.
    pub fn failover_budget(&self) -> FailoverBudget {
        FailoverBudget::new(self.slots.len())
    }

    /// Replace a failed connection with the next slot in the pool.
    ///
    /// The failed lease is released. Fails with `BackendExhausted` once
    /// `budget` has covered every slot in this logical call.
    pub fn failover(
        self: &Arc<Self>,
        failed: ConnectionLease,
        budget: &mut FailoverBudget,
    ) -> Result<ConnectionLease> {
        let failed_index = failed.index();
        let failed_endpoint = failed.endpoint().to_string();
        drop(failed);

        if !budget.try_consume() {
            self.diagnostics.error(
                LogLevel::PerServer,
                "ConnectionPool::failover",
                "Every connection in pool failed",
                &[("kind", &self.kind), ("attempts", &budget.attempts())],
            );
            return Err(self.exhausted(budget.attempts()));
        }

        let next = {
            let mut state = self.state();
            let len = self.slots.len();
            let next_index = (failed_index + 1) % len;
            // Steer other callers away from the slot that just failed
            if state.cursor == failed_index {
                state.cursor = next_index;
            }
            state.failovers += 1;
            self.lease_slot(&mut state, next_index)
        };

        self.diagnostics.error(
            LogLevel::PerServer,
            "ConnectionPool::failover",
            "Failing over to next connection",
            &[
                ("kind", &self.kind),
                ("failed", &failed_endpoint),
                ("next", &next.endpoint()),
                ("attempt", &budget.attempts()),
            ],
        );
        Ok(next)
    }

    /// Run one logical call against this pool.
    ///
    /// Connection-level faults fail over to the next slot, bounded by one
    /// pass over the pool; any other error is returned as-is on first sight.
    pub async fn call_with_failover<T, F, Fut>(self: &Arc<Self>, mut op: F) -> Result<Served<T>>
    where
        F: FnMut(Arc<dyn BackendTransport>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut budget = self.failover_budget();
        let mut lease = self.acquire(None)?;
        budget.try_consume();

        loop {
            match op(lease.transport()).await {
                Ok(value) => {
                    let served = Served {
                        value,
                        index: lease.index(),
                        endpoint: lease.endpoint().to_string(),
                        attempts: budget.attempts(),
                    };
                    self.release(lease);
                    return Ok(served);
                }
                Err(e) if e.is_connection_level() => {
                    self.diagnostics.error(
                        LogLevel::PerConnection,
                        "ConnectionPool::call_with_failover",
                        "Connection fault",
                        &[
                            ("kind", &self.kind),
                            ("slot", &lease.index()),
                            ("error", &e),
                        ],
                    );
                    lease = self.failover(lease, &mut budget)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Slot index of the connection with this endpoint identity.
    pub fn index_of(&self, endpoint: &str) -> Option<usize> {
        self.slots.iter().position(|s| s.endpoint() == endpoint)
    }

    /// Slot the next acquire will hand out.
    pub fn current_index(&self) -> usize {
        self.state().cursor
    }

    /// Pin the rotation cursor to `index`.
    pub fn set_current_index(&self, index: usize) -> Result<()> {
        if index >= self.slots.len() {
            return Err(RaError::Configuration(format!(
                "{} pool index {} out of range (pool length {})",
                self.kind,
                index,
                self.slots.len()
            )));
        }
        self.state().cursor = index;
        Ok(())
    }

    /// Leases handed out and not yet released
    pub fn outstanding(&self) -> usize {
        self.state().in_use.iter().sum()
    }

    pub fn in_use_at(&self, index: usize) -> usize {
        self.state().in_use.get(index).copied().unwrap_or(0)
    }

    /// Failovers performed since the pool was created
    pub fn failover_count(&self) -> u64 {
        self.state().failovers
    }
}

/// The three backend pools of one RA instance.
#[derive(Clone)]
pub struct BackendPools {
    tks: Arc<ConnectionPool>,
    ca: Arc<ConnectionPool>,
    drm: Arc<ConnectionPool>,
}

impl BackendPools {
    pub fn new(tks: ConnectionPool, ca: ConnectionPool, drm: ConnectionPool) -> Result<Self> {
        for (expected, pool) in [
            (BackendKind::Tks, &tks),
            (BackendKind::Ca, &ca),
            (BackendKind::Drm, &drm),
        ] {
            if pool.kind() != expected {
                return Err(RaError::Configuration(format!(
                    "{} pool supplied where {} pool expected",
                    pool.kind(),
                    expected
                )));
            }
        }
        Ok(Self {
            tks: Arc::new(tks),
            ca: Arc::new(ca),
            drm: Arc::new(drm),
        })
    }

    pub fn pool(&self, kind: BackendKind) -> &Arc<ConnectionPool> {
        match kind {
            BackendKind::Tks => &self.tks,
            BackendKind::Ca => &self.ca,
            BackendKind::Drm => &self.drm,
        }
    }

    pub fn acquire(&self, kind: BackendKind, affinity: Option<&str>) -> Result<ConnectionLease> {
        self.pool(kind).acquire(affinity)
    }

    pub fn release(&self, lease: ConnectionLease) {
        drop(lease);
    }

    pub fn failover(&self, failed: ConnectionLease, budget: &mut FailoverBudget) -> Result<ConnectionLease> {
        let pool = Arc::clone(failed.pool());
        pool.failover(failed, budget)
    }

    /// Current slot of the pool the endpoint belongs to, if any.
    pub fn current_index(&self, endpoint: &str) -> Option<(BackendKind, usize)> {
        BackendKind::ALL.into_iter().find_map(|kind| {
            let pool = self.pool(kind);
            pool.index_of(endpoint).map(|_| (kind, pool.current_index()))
        })
    }
}
