use std::collections::{BTreeMap, BTreeSet};

use crate::arbiter::HeroLock;
use crate::config::WallConfig;
use crate::media::Item;
use crate::protocol::{ServerEvent, SnapshotVersion};

/// What applying one server event did to a replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicaChange {
    /// The whole state was replaced from a snapshot
    Replaced,
    /// A snapshot older than (or equal to) the current one was dropped
    StaleSnapshot,
    ItemUpserted(String),
    ItemRemoved(String),
    Config,
    Locks,
    Visibility,
    /// The event does not touch replicated state
    Unchanged,
}

/// A display's local copy of the shared state, rebuilt from broadcasts.
///
/// Item updates are last-write-wins per id. Only ready items are kept.
#[derive(Debug, Default, Clone)]
pub struct Replica {
    items: BTreeMap<String, Item>,
    locks: Vec<HeroLock>,
    config: WallConfig,
    visible_elsewhere: BTreeSet<String>,
    version: Option<SnapshotVersion>,
}

impl Replica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &ServerEvent, display_id: &str) -> ReplicaChange {
        match event {
            ServerEvent::Init(snapshot) => {
                if let Some(current) = &self.version {
                    if !snapshot.version.supersedes(current) {
                        return ReplicaChange::StaleSnapshot;
                    }
                }
                self.items = snapshot
                    .items
                    .iter()
                    .filter(|item| item.is_ready())
                    .map(|item| (item.id.clone(), item.clone()))
                    .collect();
                self.locks = snapshot.locks.clone();
                self.config = snapshot.config.clone();
                self.visible_elsewhere.clear();
                self.version = Some(snapshot.version);
                ReplicaChange::Replaced
            }
            ServerEvent::ItemAdded { item } | ServerEvent::ItemUpdated { item } => {
                if item.is_ready() {
                    self.items.insert(item.id.clone(), item.clone());
                    ReplicaChange::ItemUpserted(item.id.clone())
                } else if self.items.remove(&item.id).is_some() {
                    ReplicaChange::ItemRemoved(item.id.clone())
                } else {
                    ReplicaChange::Unchanged
                }
            }
            ServerEvent::ItemRemoved { id } => {
                self.items.remove(id);
                ReplicaChange::ItemRemoved(id.clone())
            }
            ServerEvent::ConfigChanged { config } => {
                self.config = config.clone();
                ReplicaChange::Config
            }
            ServerEvent::HeroLocks { locks } => {
                self.locks = locks.clone();
                ReplicaChange::Locks
            }
            ServerEvent::HealthUpdate { stats } => {
                self.visible_elsewhere = stats.visible_elsewhere(display_id);
                ReplicaChange::Visibility
            }
            ServerEvent::SequenceAdvance { .. } | ServerEvent::Reload { .. } => ReplicaChange::Unchanged,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Ready items, newest first
    pub fn ready_items(&self) -> Vec<&Item> {
        let mut items: Vec<&Item> = self.items.values().collect();
        items.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn config(&self) -> &WallConfig {
        &self.config
    }

    pub fn version(&self) -> Option<SnapshotVersion> {
        self.version
    }

    pub fn locks(&self) -> &[HeroLock] {
        &self.locks
    }

    /// Holder of a live lock on `item_id` other than `display_id`
    pub fn foreign_lock_holder(&self, item_id: &str, display_id: &str, now_ms: u64) -> Option<&str> {
        self.locks
            .iter()
            .find(|lock| lock.item_id == item_id && lock.holder_id != display_id && lock.is_live(now_ms))
            .map(|lock| lock.holder_id.as_str())
    }

    pub fn is_visible_elsewhere(&self, item_id: &str) -> bool {
        self.visible_elsewhere.contains(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::ItemStatus;
    use crate::protocol::Snapshot;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn item(id: &str, added_at: u64, status: ItemStatus) -> Item {
        let mut item = Item::queued(id.to_string(), PathBuf::from(id), added_at);
        item.status = status;
        item
    }

    fn init(epoch: Uuid, seq: u64, items: Vec<Item>) -> ServerEvent {
        ServerEvent::Init(Snapshot {
            version: SnapshotVersion { epoch, seq },
            items,
            config: WallConfig::default(),
            locks: vec![],
        })
    }

    #[test]
    fn test_stale_snapshots_are_ignored() {
        let epoch = Uuid::new_v4();
        let mut replica = Replica::new();

        let fresh = init(epoch, 2, vec![item("a.jpg", 1, ItemStatus::Ready)]);
        assert_eq!(replica.apply(&fresh, "1"), ReplicaChange::Replaced);

        let old = init(epoch, 1, vec![]);
        assert_eq!(replica.apply(&old, "1"), ReplicaChange::StaleSnapshot);
        assert_eq!(replica.apply(&fresh, "1"), ReplicaChange::StaleSnapshot);
        assert_eq!(replica.len(), 1);

        // A restarted server starts a new epoch with a low seq
        let restarted = init(Uuid::new_v4(), 1, vec![]);
        assert_eq!(replica.apply(&restarted, "1"), ReplicaChange::Replaced);
        assert!(replica.is_empty());
    }

    #[test]
    fn test_only_ready_items_are_kept() {
        let mut replica = Replica::new();
        replica.apply(
            &ServerEvent::ItemAdded {
                item: item("a.jpg", 1, ItemStatus::Ready),
            },
            "1",
        );
        replica.apply(
            &ServerEvent::ItemAdded {
                item: item("b.jpg", 2, ItemStatus::Ready),
            },
            "1",
        );
        let failed = replica.apply(
            &ServerEvent::ItemUpdated {
                item: item("a.jpg", 1, ItemStatus::Failed),
            },
            "1",
        );
        assert_eq!(failed, ReplicaChange::ItemRemoved("a.jpg".into()));
        let ids: Vec<_> = replica.ready_items().iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids, vec!["b.jpg"]);
    }

    #[test]
    fn test_foreign_lock_lookup() {
        let mut replica = Replica::new();
        replica.apply(
            &ServerEvent::HeroLocks {
                locks: vec![HeroLock {
                    item_id: "p1".into(),
                    holder_id: "2".into(),
                    expires_at: 10_000,
                }],
            },
            "1",
        );
        assert_eq!(replica.foreign_lock_holder("p1", "1", 5_000), Some("2"));
        assert_eq!(replica.foreign_lock_holder("p1", "2", 5_000), None);
        assert_eq!(replica.foreign_lock_holder("p1", "1", 10_000), None);
    }
}
