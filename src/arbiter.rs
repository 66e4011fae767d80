use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

use crate::clock::Clock;
use crate::hub::BroadcastHub;
use crate::protocol::ServerEvent;

pub const MIN_LOCK_TTL_SECS: u64 = 10;
pub const MAX_LOCK_TTL_SECS: u64 = 180;
pub const DEFAULT_LOCK_TTL_SECS: u64 = 30;

/// Exclusive short-lived claim of one display on a hero item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeroLock {
    pub item_id: String,
    pub holder_id: String,
    /// Epoch ms after which the lock no longer counts
    pub expires_at: u64,
}

impl HeroLock {
    pub fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at > now_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No live lock existed; the claimant now holds it
    Granted { expires_at: u64 },
    /// The claimant already held the lock and extended it
    Refreshed { expires_at: u64 },
    /// Another display holds a live lock; the claim is ignored
    Rejected { holder_id: String },
    /// Empty item or holder id
    Invalid,
}

impl ClaimOutcome {
    pub fn is_held(&self) -> bool {
        matches!(self, ClaimOutcome::Granted { .. } | ClaimOutcome::Refreshed { .. })
    }
}

pub fn clamp_ttl(ttl_secs: Option<u64>) -> u64 {
    ttl_secs
        .filter(|ttl| *ttl > 0)
        .unwrap_or(DEFAULT_LOCK_TTL_SECS)
        .clamp(MIN_LOCK_TTL_SECS, MAX_LOCK_TTL_SECS)
}

/// Lock table keyed by item id. Holds at most one entry per item.
#[derive(Debug, Default, Clone)]
pub struct LockTable {
    locks: HashMap<String, HeroLock>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Grant, refresh or ignore a claim
    pub fn claim(&mut self, item_id: &str, holder_id: &str, ttl_secs: Option<u64>, now_ms: u64) -> ClaimOutcome {
        if item_id.is_empty() || holder_id.is_empty() {
            return ClaimOutcome::Invalid;
        }

        let expires_at = now_ms + clamp_ttl(ttl_secs) * 1000;
        let outcome = match self.locks.get(item_id) {
            Some(existing) if existing.is_live(now_ms) && existing.holder_id != holder_id => {
                return ClaimOutcome::Rejected {
                    holder_id: existing.holder_id.clone(),
                };
            }
            Some(existing) if existing.is_live(now_ms) => ClaimOutcome::Refreshed { expires_at },
            _ => ClaimOutcome::Granted { expires_at },
        };

        self.locks.insert(
            item_id.to_string(),
            HeroLock {
                item_id: item_id.to_string(),
                holder_id: holder_id.to_string(),
                expires_at,
            },
        );
        outcome
    }

    /// Drop expired locks; returns how many went away
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| lock.is_live(now_ms));
        before - self.locks.len()
    }

    /// Live locks sorted by item id
    pub fn live(&self, now_ms: u64) -> Vec<HeroLock> {
        let mut locks: Vec<HeroLock> = self
            .locks
            .values()
            .filter(|lock| lock.is_live(now_ms))
            .cloned()
            .collect();
        locks.sort_by(|a, b| a.item_id.cmp(&b.item_id));
        locks
    }

    pub fn holder_of(&self, item_id: &str, now_ms: u64) -> Option<&str> {
        self.locks
            .get(item_id)
            .filter(|lock| lock.is_live(now_ms))
            .map(|lock| lock.holder_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Server-side hero lock service.
///
/// Claims never block: they are resolved against the table and answered
/// immediately. Every change to the set of live locks is announced to all
/// clients as a full `hero_locks` snapshot.
pub struct HeroLockArbiter {
    table: Mutex<LockTable>,
    hub: BroadcastHub,
    clock: Arc<dyn Clock>,
}

impl HeroLockArbiter {
    pub fn new(hub: BroadcastHub, clock: Arc<dyn Clock>) -> Self {
        Self {
            table: Mutex::new(LockTable::new()),
            hub,
            clock,
        }
    }

    fn table(&self) -> MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn claim(&self, item_id: &str, holder_id: &str, ttl_secs: Option<u64>) -> ClaimOutcome {
        let now = self.clock.now_ms();
        let (outcome, swept, locks) = {
            let mut table = self.table();
            let swept = table.sweep(now);
            let outcome = table.claim(item_id, holder_id, ttl_secs, now);
            (outcome, swept, table.live(now))
        };

        match &outcome {
            ClaimOutcome::Rejected { holder_id: owner } => {
                debug!("Hero claim on {} by {} ignored, held by {}", item_id, holder_id, owner);
            }
            ClaimOutcome::Invalid => debug!("Ignoring hero claim with empty id"),
            _ => debug!("Hero lock on {} held by {}", item_id, holder_id),
        }

        if outcome.is_held() || swept > 0 {
            self.hub.publish(ServerEvent::HeroLocks { locks });
        }
        outcome
    }

    /// Current live locks; expired entries are pruned on the way
    pub fn snapshot(&self) -> Vec<HeroLock> {
        let now = self.clock.now_ms();
        let (swept, locks) = {
            let mut table = self.table();
            (table.sweep(now), table.live(now))
        };
        if swept > 0 {
            self.hub.publish(ServerEvent::HeroLocks { locks: locks.clone() });
        }
        locks
    }

    /// Periodic expiry; returns true if anything changed
    pub fn sweep(&self) -> bool {
        let now = self.clock.now_ms();
        let (swept, locks) = {
            let mut table = self.table();
            (table.sweep(now), table.live(now))
        };
        if swept > 0 {
            debug!("Expired {} hero lock(s)", swept);
            self.hub.publish(ServerEvent::HeroLocks { locks });
        }
        swept > 0
    }

    pub fn holder_of(&self, item_id: &str) -> Option<String> {
        let now = self.clock.now_ms();
        self.table().holder_of(item_id, now).map(str::to_string)
    }

    pub fn live_count(&self) -> usize {
        let now = self.clock.now_ms();
        self.table().live(now).len()
    }
}
