use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::ingest::MetricsSnapshot;
use crate::media::ItemCounts;
use crate::protocol::Heartbeat;

/// Most visible ids kept per heartbeat
pub const MAX_VISIBLE_IDS: usize = 24;

/// What the server knows about one display
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayHealth {
    pub display_id: String,
    pub connected: bool,
    pub reconnects: u32,
    pub last_seen_at: u64,
    pub last_cycle_at: u64,
    pub last_cycle_duration_ms: Option<u64>,
    pub layout: Option<String>,
    pub group: Option<String>,
    pub visible_ids: Vec<String>,
    /// Milliseconds since the last heartbeat, filled in when stats are built
    #[serde(default)]
    pub heartbeat_age_ms: u64,
}

/// Rendition cache and pipeline figures
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub coverage_pct: u8,
    pub queue_depth: usize,
    pub active_workers: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_ingest_at: Option<u64>,
    pub last_scan_at: Option<u64>,
}

impl CacheStats {
    pub fn new(counts: &ItemCounts, metrics: &MetricsSnapshot) -> Self {
        Self {
            coverage_pct: counts.coverage_pct(),
            queue_depth: metrics.queue_depth,
            active_workers: metrics.active_workers,
            enqueued: metrics.enqueued,
            completed: metrics.completed,
            failed: metrics.failed,
            last_ingest_at: metrics.last_ingest_at,
            last_scan_at: metrics.last_scan_at,
        }
    }
}

/// Payload of `health_update` and `/api/stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthStats {
    pub generated_at: u64,
    pub items: ItemCounts,
    pub cache: CacheStats,
    pub displays: Vec<DisplayHealth>,
    pub hero_locks: usize,
    pub pending_barriers: usize,
    pub connections: usize,
}

impl HealthStats {
    /// Ids visible on connected displays other than `display_id`
    pub fn visible_elsewhere(&self, display_id: &str) -> BTreeSet<String> {
        self.displays
            .iter()
            .filter(|d| d.connected && d.display_id != display_id)
            .flat_map(|d| d.visible_ids.iter().cloned())
            .collect()
    }
}

/// Heartbeat bookkeeping per display id
#[derive(Debug, Default, Clone)]
pub struct HealthRegistry {
    displays: BTreeMap<String, DisplayHealth>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat; returns true if it came from a display that was offline
    pub fn record_heartbeat(&mut self, heartbeat: &Heartbeat, now_ms: u64) -> bool {
        let entry = self
            .displays
            .entry(heartbeat.display_id.clone())
            .or_insert_with(|| DisplayHealth {
                display_id: heartbeat.display_id.clone(),
                ..DisplayHealth::default()
            });

        let came_back = !entry.connected;
        if came_back {
            entry.reconnects += 1;
        }
        entry.connected = true;
        entry.last_seen_at = now_ms;
        entry.last_cycle_at = heartbeat.last_cycle_at;
        entry.last_cycle_duration_ms = heartbeat.last_cycle_duration_ms;
        entry.layout = heartbeat.layout.clone();
        entry.group = heartbeat.group.clone();
        entry.visible_ids = heartbeat.visible_ids.iter().take(MAX_VISIBLE_IDS).cloned().collect();
        came_back
    }

    pub fn mark_disconnected(&mut self, display_id: &str, now_ms: u64) {
        if let Some(entry) = self.displays.get_mut(display_id) {
            entry.connected = false;
            entry.last_seen_at = now_ms;
        }
    }

    pub fn get(&self, display_id: &str) -> Option<&DisplayHealth> {
        self.displays.get(display_id)
    }

    /// All known displays with heartbeat ages relative to `now_ms`
    pub fn snapshot(&self, now_ms: u64) -> Vec<DisplayHealth> {
        self.displays
            .values()
            .map(|d| DisplayHealth {
                heartbeat_age_ms: now_ms.saturating_sub(d.last_seen_at),
                ..d.clone()
            })
            .collect()
    }
}
