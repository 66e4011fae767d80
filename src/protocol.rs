//! Messages exchanged over the display/admin channel.
//!
//! Both directions are JSON objects tagged by a `type` field.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::arbiter::HeroLock;
use crate::config::WallConfig;
use crate::error::Result;
use crate::health::HealthStats;
use crate::media::Item;

/// Delay displays wait before reloading after an admin request
pub const RELOAD_DELAY_MS: u64 = 1500;

/// Identifies a full-state snapshot.
///
/// `epoch` changes every time the server process starts, `seq` grows with
/// every snapshot the process emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotVersion {
    pub epoch: Uuid,
    pub seq: u64,
}

impl SnapshotVersion {
    /// Whether a replica holding `current` should replace its state with `self`
    pub fn supersedes(&self, current: &SnapshotVersion) -> bool {
        self.epoch != current.epoch || self.seq > current.seq
    }
}

/// Everything a client needs to rebuild its replica
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: SnapshotVersion,
    pub items: Vec<Item>,
    pub config: WallConfig,
    pub locks: Vec<HeroLock>,
}

/// Server → client events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Init(Snapshot),
    ItemAdded { item: Item },
    ItemRemoved { id: String },
    ItemUpdated { item: Item },
    ConfigChanged { config: WallConfig },
    HeroLocks { locks: Vec<HeroLock> },
    HealthUpdate { stats: HealthStats },
    SequenceAdvance { sequence_id: String, step_id: String },
    Reload { delay_ms: u64 },
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::Init(_) => "init",
            ServerEvent::ItemAdded { .. } => "item_added",
            ServerEvent::ItemRemoved { .. } => "item_removed",
            ServerEvent::ItemUpdated { .. } => "item_updated",
            ServerEvent::ConfigChanged { .. } => "config_changed",
            ServerEvent::HeroLocks { .. } => "hero_locks",
            ServerEvent::HealthUpdate { .. } => "health_update",
            ServerEvent::SequenceAdvance { .. } => "sequence_advance",
            ServerEvent::Reload { .. } => "reload",
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Periodic state report from a display
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub display_id: String,
    #[serde(default)]
    pub layout: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub visible_ids: Vec<String>,
    #[serde(default)]
    pub last_cycle_at: u64,
    #[serde(default)]
    pub last_cycle_duration_ms: Option<u64>,
}

/// Client → server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    DisplayHeartbeat(Heartbeat),
    HeroClaim {
        item_id: String,
        #[serde(default)]
        ttl_sec: Option<u64>,
        #[serde(default)]
        display_id: Option<String>,
    },
    StepReady {
        sequence_id: String,
        step_id: String,
        #[serde(default)]
        display_id: Option<String>,
    },
    StepEnded {
        #[serde(default)]
        sequence_id: Option<String>,
        step_id: String,
        #[serde(default)]
        display_id: Option<String>,
    },
    AdminReloadDisplays {
        #[serde(default)]
        delay_ms: Option<u64>,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_messages_parse_from_wire() {
        let msg = ClientMessage::parse(
            r#"{"type":"display_heartbeat","display_id":"2","visible_ids":["a.jpg"],"last_cycle_at":5}"#,
        )
        .unwrap();
        match msg {
            ClientMessage::DisplayHeartbeat(hb) => {
                assert_eq!(hb.display_id, "2");
                assert_eq!(hb.visible_ids, vec!["a.jpg".to_string()]);
                assert_eq!(hb.layout, None);
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let claim = ClientMessage::parse(r#"{"type":"hero_claim","item_id":"p1","ttl_sec":30}"#).unwrap();
        assert_eq!(
            claim,
            ClientMessage::HeroClaim {
                item_id: "p1".into(),
                ttl_sec: Some(30),
                display_id: None
            }
        );

        assert!(ClientMessage::parse(r#"{"type":"unknown"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_events_are_tagged() {
        let json = ServerEvent::SequenceAdvance {
            sequence_id: "intro".into(),
            step_id: "s2".into(),
        }
        .to_json()
        .unwrap();
        assert!(json.contains(r#""type":"sequence_advance""#));

        let reload = ServerEvent::Reload { delay_ms: RELOAD_DELAY_MS };
        assert_eq!(reload.kind(), "reload");
    }

    #[test]
    fn test_snapshot_versions() {
        let epoch = Uuid::new_v4();
        let v1 = SnapshotVersion { epoch, seq: 1 };
        let v2 = SnapshotVersion { epoch, seq: 2 };
        let restarted = SnapshotVersion {
            epoch: Uuid::new_v4(),
            seq: 0,
        };

        assert!(v2.supersedes(&v1));
        assert!(!v1.supersedes(&v2));
        assert!(!v1.supersedes(&v1));
        assert!(restarted.supersedes(&v2));
    }
}
