/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - PATNET Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

//! Per-address admission: one outstanding pooled connection per client address.
//!
//! A lease owns two things with different lifetimes:
//! - the admission claim in the lock table, freed when the lease is dropped or
//!   when the forced-expiry timer fires, whichever comes first;
//! - the pooled connection itself, which only goes back to the pool when the
//!   lease is dropped. Forced expiry never touches the connection, so a query
//!   still running on it cannot race with the pool recycling it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::db::{Connection, ConnectionPool};
use crate::error::{ForumError, ForumResult};
use crate::query::QueryRecord;

struct LockEntry {
    lease_id: u64,
    acquired_at: Instant,
    expiry: Option<AbortHandle>,
}

#[derive(Default)]
pub(crate) struct LockTable {
    entries: Mutex<HashMap<String, LockEntry>>,
}

impl LockTable {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, LockEntry>> {
        // A poisoned table is still structurally valid.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_claim(&self, address: &str, lease_id: u64) -> bool {
        let mut map = self.entries();
        if map.contains_key(address) {
            return false;
        }
        map.insert(
            address.to_string(),
            LockEntry {
                lease_id,
                acquired_at: Instant::now(),
                expiry: None,
            },
        );
        true
    }

    fn arm(&self, address: &str, lease_id: u64, expiry: AbortHandle) {
        let mut map = self.entries();
        match map.get_mut(address) {
            Some(entry) if entry.lease_id == lease_id => entry.expiry = Some(expiry),
            _ => expiry.abort(),
        }
    }

    /// Frees the claim if it still belongs to `lease_id`. Returns whether anything was freed;
    /// releasing twice, or releasing a claim that already expired, is a no-op.
    pub(crate) fn release(&self, address: &str, lease_id: u64) -> bool {
        let mut map = self.entries();
        match map.get(address) {
            Some(entry) if entry.lease_id == lease_id => {
                if let Some(entry) = map.remove(address) {
                    if let Some(expiry) = entry.expiry {
                        expiry.abort();
                    }
                }
                true
            }
            _ => false,
        }
    }

    fn expire(&self, address: &str, lease_id: u64) -> Option<Duration> {
        let mut map = self.entries();
        match map.get(address) {
            Some(entry) if entry.lease_id == lease_id => {
                map.remove(address).map(|entry| entry.acquired_at.elapsed())
            }
            _ => None,
        }
    }

    fn holds(&self, address: &str) -> bool {
        self.entries().contains_key(address)
    }

    fn len(&self) -> usize {
        self.entries().len()
    }
}

/// Frees the admission claim on drop.
struct LockToken {
    table: Arc<LockTable>,
    address: String,
    lease_id: u64,
}

impl Drop for LockToken {
    fn drop(&mut self) {
        if self.table.release(&self.address, self.lease_id) {
            debug!(ip = %self.address, lease_id = self.lease_id, "lease released");
        }
    }
}

/// Exclusive claim on one pooled connection, tagged with the address that holds it.
///
/// Dropping the lease is the release: it runs on normal return, early return,
/// `?` propagation and unwinding alike.
pub struct ConnectionLease {
    // Field order is drop order: the connection goes back to the pool before the claim is freed.
    pub(crate) conn: Box<dyn Connection>,
    pub(crate) log: Vec<QueryRecord>,
    token: LockToken,
    acquired_at: Instant,
}

impl ConnectionLease {
    pub fn address(&self) -> &str {
        &self.token.address
    }

    pub fn lease_id(&self) -> u64 {
        self.token.lease_id
    }

    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Explicit release; equivalent to dropping the lease.
    pub fn release(self) {}
}

pub struct AdmissionGate {
    pool: Arc<dyn ConnectionPool>,
    locks: Arc<LockTable>,
    next_lease_id: AtomicU64,
    max_hold: Duration,
}

impl AdmissionGate {
    pub fn new(pool: Arc<dyn ConnectionPool>, max_hold: Duration) -> Self {
        Self {
            pool,
            locks: Arc::new(LockTable::default()),
            next_lease_id: AtomicU64::new(1),
            max_hold,
        }
    }

    pub async fn acquire(&self, address: &str) -> ForumResult<ConnectionLease> {
        let lease_id = self.next_lease_id.fetch_add(1, Ordering::Relaxed);
        if !self.locks.try_claim(address, lease_id) {
            debug!(ip = %address, "admission refused: lease already outstanding");
            return Err(ForumError::RateLimited);
        }
        // From here every exit path, including cancellation of this future, frees the claim.
        let token = LockToken {
            table: self.locks.clone(),
            address: address.to_string(),
            lease_id,
        };

        let conn = self.pool.get().await.map_err(|e| {
            error!(ip = %address, "failed to get connection from pool: {e:#}");
            ForumError::Query(format!("failed to get connection from pool: {e:#}"))
        })?;

        let table = self.locks.clone();
        let holder = address.to_string();
        let max_hold = self.max_hold;
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(max_hold).await;
            if let Some(held) = table.expire(&holder, lease_id) {
                warn!(
                    ip = %holder,
                    lease_id,
                    held_ms = held.as_millis() as u64,
                    "lease not released in time; admission claim force-released"
                );
            }
        });
        self.locks.arm(address, lease_id, expiry.abort_handle());

        Ok(ConnectionLease {
            conn,
            log: Vec::new(),
            token,
            acquired_at: Instant::now(),
        })
    }

    pub fn release(&self, lease: ConnectionLease) {
        lease.release();
    }

    pub fn is_held(&self, address: &str) -> bool {
        self.locks.holds(address)
    }

    pub fn live_leases(&self) -> usize {
        self.locks.len()
    }

    pub fn max_hold(&self) -> Duration {
        self.max_hold
    }
}
