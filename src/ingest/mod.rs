//! Ingestion pipeline: turns files under the photos root into ready items.
//!
//! Discovery events upsert items into the [`MediaStore`](crate::media::MediaStore)
//! and queue them; [`IngestionPipeline::drain`] starts workers newest-first up
//! to the configured ceiling. Every ready/failed transition and every removal
//! is published through the hub.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::clock::Clock;
use crate::config::{AppConfig, ConfigSource};
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::media::{self, Item, ItemStatus, SharedStore};
use crate::protocol::ServerEvent;

pub mod queue;
pub mod render;

pub use queue::WorkQueue;
pub use render::{ImageRenderer, IngestError, Rendition, Renderer};

/// Discovery notifications consumed by the pipeline; all are safe to repeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestEvent {
    FileAdded(PathBuf),
    FileChanged(PathBuf),
    FileRemoved(PathBuf),
    RescanAll,
}

/// Where files come from and where renditions go
#[derive(Debug, Clone)]
pub struct IngestSettings {
    pub photos_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub supported_extensions: Vec<String>,
    pub max_workers: usize,
}

impl IngestSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            photos_dir: config.media.photos_dir.clone(),
            cache_dir: config.media.cache_dir.clone(),
            supported_extensions: config.media.supported_extensions.clone(),
            max_workers: config.ingest.max_workers,
        }
    }
}

/// Pipeline counters; timestamps are epoch ms with 0 meaning "never"
#[derive(Debug, Default)]
pub struct IngestMetrics {
    enqueued: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    last_ingest_at: AtomicU64,
    last_scan_at: AtomicU64,
}

/// Point-in-time copy of the pipeline counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub queue_depth: usize,
    pub active_workers: usize,
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    pub last_ingest_at: Option<u64>,
    pub last_scan_at: Option<u64>,
}

fn nonzero(value: u64) -> Option<u64> {
    (value > 0).then_some(value)
}

/// Outcome of a full reconciliation against the photos root
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    pub found: usize,
    pub queued: usize,
    pub removed: usize,
}

struct PipelineInner {
    settings: IngestSettings,
    store: SharedStore,
    hub: BroadcastHub,
    renderer: Arc<dyn Renderer>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    queue: Mutex<WorkQueue>,
    metrics: IngestMetrics,
    idle: Notify,
}

/// Bounded-concurrency ingestion pipeline. Cheap to clone.
#[derive(Clone)]
pub struct IngestionPipeline {
    inner: Arc<PipelineInner>,
}

/// Releases a worker slot even if the processing task panics
struct SlotGuard {
    pipeline: IngestionPipeline,
    id: String,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let idle = {
            let mut queue = self.pipeline.queue();
            queue.finish(&self.id);
            queue.is_idle()
        };
        if idle {
            self.pipeline.inner.idle.notify_waiters();
        }
    }
}

impl IngestionPipeline {
    pub fn new(
        settings: IngestSettings,
        store: SharedStore,
        hub: BroadcastHub,
        renderer: Arc<dyn Renderer>,
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queue = Mutex::new(WorkQueue::new(settings.max_workers));
        Self {
            inner: Arc::new(PipelineInner {
                settings,
                store,
                hub,
                renderer,
                config,
                clock,
                queue,
                metrics: IngestMetrics::default(),
                idle: Notify::new(),
            }),
        }
    }

    fn queue(&self) -> MutexGuard<'_, WorkQueue> {
        self.inner.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.inner.settings
    }

    pub fn store(&self) -> &SharedStore {
        &self.inner.store
    }

    /// Dispatch one discovery event
    pub async fn handle_event(&self, event: IngestEvent) -> Result<Option<RescanReport>> {
        match event {
            IngestEvent::FileAdded(path) => self.on_file_added(&path).await.map(|_| None),
            IngestEvent::FileChanged(path) => self.on_file_changed(&path).await.map(|_| None),
            IngestEvent::FileRemoved(path) => self.on_file_removed(&path).await.map(|_| None),
            IngestEvent::RescanAll => self.rescan_all().await.map(Some),
        }
    }

    /// A file or directory appeared under the photos root
    pub async fn on_file_added(&self, path: &Path) -> Result<()> {
        if tokio::fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false) {
            let files = self.walk(path.to_path_buf()).await?;
            info!("New directory {:?} holds {} photo(s)", path, files.len());
            for file in files {
                self.upsert_from_path(&file).await;
            }
        } else {
            self.upsert_from_path(path).await;
        }
        self.drain();
        Ok(())
    }

    /// A file changed; re-render it, or drop it if it is gone
    pub async fn on_file_changed(&self, path: &Path) -> Result<()> {
        if tokio::fs::metadata(path).await.is_err() {
            return self.on_file_removed(path).await;
        }
        self.on_file_added(path).await
    }

    /// A file or a whole directory went away
    pub async fn on_file_removed(&self, path: &Path) -> Result<()> {
        let Some(id) = media::item_id_for(&self.inner.settings.photos_dir, path) else {
            debug!("Ignoring removal outside the photos root: {:?}", path);
            return Ok(());
        };

        let removed = {
            let mut store = self.inner.store.write().await;
            let mut removed = store.remove_under(&id);
            removed.extend(store.remove(&id));
            removed
        };
        {
            let mut queue = self.queue();
            queue.remove(&id);
            queue.remove_under(&id);
        }

        for item in &removed {
            self.unlink_cache(item).await;
            self.inner.hub.publish(ServerEvent::ItemRemoved { id: item.id.clone() });
        }
        if !removed.is_empty() {
            info!("Removed {} item(s) for {}", removed.len(), id);
        }
        Ok(())
    }

    /// Reconcile the on-disk set with the store.
    ///
    /// New files are queued, files whose source is newer than their rendition
    /// are re-queued, and entries with no file behind them are dropped.
    pub async fn rescan_all(&self) -> Result<RescanReport> {
        let root = self.inner.settings.photos_dir.clone();
        let files = self.walk(root).await?;
        let mut report = RescanReport {
            found: files.len(),
            ..RescanReport::default()
        };

        let mut alive = HashSet::with_capacity(files.len());
        for file in &files {
            let Some(id) = media::item_id_for(&self.inner.settings.photos_dir, file) else {
                continue;
            };
            alive.insert(id.clone());

            let known = self.inner.store.read().await.get(&id).cloned();
            let needs_render = match &known {
                None => true,
                Some(item) => self.is_stale(item).await,
            };
            if needs_render && self.upsert_from_path(file).await {
                report.queued += 1;
            }
        }

        let stale: Vec<Item> = {
            let mut store = self.inner.store.write().await;
            let ids: Vec<String> = store.ids().into_iter().filter(|id| !alive.contains(id)).collect();
            ids.iter().filter_map(|id| store.remove(id)).collect()
        };
        {
            let mut queue = self.queue();
            for item in &stale {
                queue.remove(&item.id);
            }
        }
        for item in &stale {
            self.unlink_cache(item).await;
            self.inner.hub.publish(ServerEvent::ItemRemoved { id: item.id.clone() });
        }
        report.removed = stale.len();

        self.inner
            .metrics
            .last_scan_at
            .store(self.inner.clock.now_ms(), Ordering::Relaxed);
        info!(
            "Scanned {} photo(s): {} queued, {} removed",
            report.found, report.queued, report.removed
        );

        self.drain();
        Ok(report)
    }

    /// Queue an item for processing; false if unknown or already queued
    pub async fn enqueue(&self, id: &str) -> bool {
        let Some(added_at) = self.inner.store.read().await.added_at(id) else {
            return false;
        };
        let pushed = self.queue().push(id, added_at);
        if pushed {
            self.inner.metrics.enqueued.fetch_add(1, Ordering::Relaxed);
        }
        pushed
    }

    /// Start workers for the newest pending items until every slot is busy.
    ///
    /// Returns how many workers were started.
    pub fn drain(&self) -> usize {
        let mut started = 0;
        loop {
            let Some(id) = self.queue().start_next() else {
                break;
            };
            started += 1;

            let pipeline = self.clone();
            tokio::spawn(async move {
                let guard = SlotGuard {
                    pipeline: pipeline.clone(),
                    id: id.clone(),
                };
                pipeline.process(&id).await;
                drop(guard);
                pipeline.drain();
            });
        }
        started
    }

    async fn process(&self, id: &str) {
        let source = {
            let mut store = self.inner.store.write().await;
            let Some(item) = store.get_mut(id) else {
                return;
            };
            item.status = ItemStatus::Processing;
            item.error = None;
            item.source_path.clone()
        };

        let target = media::cache_path_for(&self.inner.settings.cache_dir, id);
        debug!("Rendering {} -> {:?}", id, target);
        let result = self.inner.renderer.render(&source, &target).await;
        let now = self.inner.clock.now_ms();

        let rendered = result.is_ok();
        let event = {
            let mut store = self.inner.store.write().await;
            store.get_mut(id).map(|item| match result {
                Ok(rendition) => {
                    let first_publish = item.display_url.is_none();
                    item.status = ItemStatus::Ready;
                    item.width = Some(rendition.width);
                    item.height = Some(rendition.height);
                    item.display_width = Some(rendition.display_width);
                    item.display_height = Some(rendition.display_height);
                    item.display_url = Some(media::display_url_for(id, now));
                    item.cache_path = Some(target.clone());
                    item.error = None;

                    self.inner.metrics.completed.fetch_add(1, Ordering::Relaxed);
                    self.inner.metrics.last_ingest_at.store(now, Ordering::Relaxed);

                    if first_publish {
                        ServerEvent::ItemAdded { item: item.clone() }
                    } else {
                        ServerEvent::ItemUpdated { item: item.clone() }
                    }
                }
                Err(e) => {
                    warn!("Rendition failed for {}: {}", id, e);
                    item.status = ItemStatus::Failed;
                    item.error = Some(e.to_string());
                    self.inner.metrics.failed.fetch_add(1, Ordering::Relaxed);
                    ServerEvent::ItemUpdated { item: item.clone() }
                }
            })
        };

        let Some(event) = event else {
            // Removed while rendering
            if rendered {
                match tokio::fs::remove_file(&target).await {
                    Ok(()) => debug!("Dropped rendition of removed item {:?}", target),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove rendition {:?}: {}", target, e),
                }
            }
            return;
        };
        self.inner.hub.publish(event);
    }

    /// Re-apply operator hero flags; returns how many items changed
    pub async fn apply_hero_overrides(&self) -> usize {
        let changed: Vec<Item> = {
            let mut store = self.inner.store.write().await;
            let ids = store.ids();
            ids.iter()
                .filter_map(|id| {
                    let flag = self.inner.config.is_hero_candidate(id);
                    let item = store.get_mut(id)?;
                    if item.hero_candidate == flag {
                        return None;
                    }
                    item.hero_candidate = flag;
                    Some(item.clone())
                })
                .collect()
        };

        for item in changed.iter().filter(|item| item.is_ready()) {
            self.inner.hub.publish(ServerEvent::ItemUpdated { item: item.clone() });
        }
        changed.len()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let (queue_depth, active_workers) = {
            let queue = self.queue();
            (queue.len(), queue.active())
        };
        let m = &self.inner.metrics;
        MetricsSnapshot {
            queue_depth,
            active_workers,
            enqueued: m.enqueued.load(Ordering::Relaxed),
            completed: m.completed.load(Ordering::Relaxed),
            failed: m.failed.load(Ordering::Relaxed),
            last_ingest_at: nonzero(m.last_ingest_at.load(Ordering::Relaxed)),
            last_scan_at: nonzero(m.last_scan_at.load(Ordering::Relaxed)),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.queue().is_idle()
    }

    /// Resolve once nothing is queued or processing
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Create or refresh the item for a file and queue it; true if queued
    async fn upsert_from_path(&self, path: &Path) -> bool {
        let settings = &self.inner.settings;
        if !media::is_supported(path, &settings.supported_extensions) {
            debug!("Not a supported photo, skipping: {:?}", path);
            return false;
        }
        let Some(id) = media::item_id_for(&settings.photos_dir, path) else {
            return false;
        };

        let known = self.inner.store.read().await.contains(&id);
        let added_at = if known {
            0
        } else {
            self.arrival_time(&id).await
        };

        {
            let mut store = self.inner.store.write().await;
            match store.get_mut(&id) {
                Some(item) => item.source_path = path.to_path_buf(),
                None => {
                    let mut item = Item::queued(id.clone(), path.to_path_buf(), added_at);
                    item.hero_candidate = self.inner.config.is_hero_candidate(&id);
                    store.upsert(item);
                }
            }
        }

        self.enqueue(&id).await
    }

    /// Arrival time for an item seen for the first time in this process.
    ///
    /// A rendition left over from a previous run dates the item by its mtime.
    async fn arrival_time(&self, id: &str) -> u64 {
        let cached = media::cache_path_for(&self.inner.settings.cache_dir, id);
        tokio::fs::metadata(&cached)
            .await
            .ok()
            .and_then(|m| m.modified().ok())
            .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis().max(0) as u64)
            .unwrap_or_else(|| self.inner.clock.now_ms())
    }

    /// Whether a known item's rendition is missing or older than its source
    async fn is_stale(&self, item: &Item) -> bool {
        if item.status != ItemStatus::Ready {
            return false;
        }
        let Some(cache_path) = &item.cache_path else {
            return true;
        };
        let source = tokio::fs::metadata(&item.source_path).await.and_then(|m| m.modified());
        let cache = tokio::fs::metadata(cache_path).await.and_then(|m| m.modified());
        match (source, cache) {
            (Ok(source), Ok(cache)) => source > cache,
            _ => true,
        }
    }

    async fn unlink_cache(&self, item: &Item) {
        let path = item
            .cache_path
            .clone()
            .unwrap_or_else(|| media::cache_path_for(&self.inner.settings.cache_dir, &item.id));
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!("Removed rendition {:?}", path),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove rendition {:?}: {}", path, e),
        }
    }

    /// Supported files below `dir`, walked off the async runtime
    async fn walk(&self, dir: PathBuf) -> Result<Vec<PathBuf>> {
        let extensions = self.inner.settings.supported_extensions.clone();
        let files = tokio::task::spawn_blocking(move || {
            WalkDir::new(&dir)
                .follow_links(true)
                .into_iter()
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("Skipping unreadable path during scan: {}", e);
                        None
                    }
                })
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| media::is_supported(path, &extensions))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(anyhow::Error::from)?;
        Ok(files)
    }
}
