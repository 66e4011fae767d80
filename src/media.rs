use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Group assigned to items that sit directly in the photos root
pub const DEFAULT_GROUP: &str = "ungrouped";

/// Lifecycle of an item on its way to the display pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Queued,
    Processing,
    Ready,
    Failed,
}

/// A photo known to the wall
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Path relative to the photos root, `/`-separated
    pub id: String,
    pub name: String,
    pub group: String,
    pub status: ItemStatus,
    /// Arrival time in epoch ms, used for recency ranking
    pub added_at: u64,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub display_width: Option<u32>,
    pub display_height: Option<u32>,
    #[serde(default)]
    pub hero_candidate: bool,
    pub display_url: Option<String>,
    pub error: Option<String>,
    #[serde(skip)]
    pub source_path: PathBuf,
    #[serde(skip)]
    pub cache_path: Option<PathBuf>,
}

impl Item {
    /// A freshly discovered item waiting for its rendition
    pub fn queued(id: String, source_path: PathBuf, added_at: u64) -> Self {
        let name = id.rsplit('/').next().unwrap_or(&id).to_string();
        let group = group_for(&id);
        Self {
            id,
            name,
            group,
            status: ItemStatus::Queued,
            added_at,
            width: None,
            height: None,
            display_width: None,
            display_height: None,
            hero_candidate: false,
            display_url: None,
            error: None,
            source_path,
            cache_path: None,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.status == ItemStatus::Ready
    }
}

/// Per-status counts for health reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ItemCounts {
    pub total: usize,
    pub ready: usize,
    pub processing: usize,
    pub queued: usize,
    pub failed: usize,
    pub added_last_hour: usize,
    pub groups: BTreeMap<String, usize>,
}

impl ItemCounts {
    /// Share of known items that have a display rendition
    pub fn coverage_pct(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.ready as f64 / self.total as f64) * 100.0).round() as u8
        }
    }
}

/// Canonical set of known items, owned by the server
#[derive(Debug, Default, Clone)]
pub struct MediaStore {
    items: HashMap<String, Item>,
}

pub type SharedStore = Arc<RwLock<MediaStore>>;

impl MediaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(RwLock::new(self))
    }

    pub fn get(&self, id: &str) -> Option<&Item> {
        self.items.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Item> {
        self.items.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// Insert or replace an item, returning the previous entry
    pub fn upsert(&mut self, item: Item) -> Option<Item> {
        self.items.insert(item.id.clone(), item)
    }

    pub fn remove(&mut self, id: &str) -> Option<Item> {
        self.items.remove(id)
    }

    /// Remove every item below a directory id (`party` removes `party/a.jpg`)
    pub fn remove_under(&mut self, dir_id: &str) -> Vec<Item> {
        let prefix = format!("{}/", dir_id.trim_end_matches('/'));
        let ids: Vec<String> = self
            .items
            .keys()
            .filter(|id| id.starts_with(&prefix))
            .cloned()
            .collect();
        ids.iter().filter_map(|id| self.items.remove(id)).collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn added_at(&self, id: &str) -> Option<u64> {
        self.items.get(id).map(|i| i.added_at)
    }

    /// Ready items, newest first
    pub fn ready_items(&self) -> Vec<Item> {
        let mut ready: Vec<Item> = self.items.values().filter(|i| i.is_ready()).cloned().collect();
        ready.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.id.cmp(&b.id)));
        ready
    }

    pub fn counts(&self, now_ms: u64) -> ItemCounts {
        let hour_ago = now_ms.saturating_sub(3_600_000);
        let mut counts = ItemCounts {
            total: self.items.len(),
            ..ItemCounts::default()
        };
        for item in self.items.values() {
            match item.status {
                ItemStatus::Ready => counts.ready += 1,
                ItemStatus::Processing => counts.processing += 1,
                ItemStatus::Queued => counts.queued += 1,
                ItemStatus::Failed => counts.failed += 1,
            }
            if item.added_at > hour_ago {
                counts.added_last_hour += 1;
            }
            *counts.groups.entry(item.group.clone()).or_insert(0) += 1;
        }
        counts
    }
}

/// Stable item id for a file below the photos root
pub fn item_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// First path segment of an id, or [`DEFAULT_GROUP`] for root-level files
pub fn group_for(id: &str) -> String {
    match id.split_once('/') {
        Some((group, _)) if !group.is_empty() => group.to_string(),
        _ => DEFAULT_GROUP.to_string(),
    }
}

/// Whether the file extension is one the wall can show
pub fn is_supported(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|ext| extensions.iter().any(|s| s.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

fn strip_extension(id: &str) -> &str {
    match id.rfind('.') {
        Some(dot) if dot > id.rfind('/').map(|s| s + 1).unwrap_or(0) => &id[..dot],
        _ => id,
    }
}

/// Location of the JPEG rendition for an item
pub fn cache_path_for(cache_dir: &Path, id: &str) -> PathBuf {
    let mut path = cache_dir.to_path_buf();
    for part in format!("{}.jpg", strip_extension(id)).split('/') {
        path.push(part);
    }
    path
}

/// URL under which displays fetch the rendition; `version` busts browser caches
pub fn display_url_for(id: &str, version: u64) -> String {
    format!("/photos/{}.jpg?v={}", strip_extension(id), version)
}
