use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::ingest::IngestEvent;
use crate::server::{InboundEvent, RescanTrigger};
use crate::watcher::{FileSystemEvent, FileSystemWatcher};

/// Forwards file system changes into the server's dispatcher as ingest events
pub struct WatcherIngestBridge<W>
where
    W: FileSystemWatcher,
{
    watcher: Arc<W>,
    sender: mpsc::Sender<InboundEvent>,
    rescan: RescanTrigger,
    is_running: Arc<AtomicBool>,
}

impl<W> WatcherIngestBridge<W>
where
    W: FileSystemWatcher + 'static,
{
    pub fn new(watcher: Arc<W>, sender: mpsc::Sender<InboundEvent>, rescan: RescanTrigger) -> Self {
        Self {
            watcher,
            sender,
            rescan,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Watch `root` and start forwarding. Fails if the watcher's receiver was already taken.
    pub async fn start(&self, root: PathBuf) -> Result<JoinHandle<()>> {
        info!("Starting watcher bridge for {:?}", root);
        self.watcher.start_watching(&[root]).await?;

        let mut receiver = self.watcher.take_event_receiver().ok_or_else(|| {
            crate::error::AppError::Internal(anyhow::anyhow!("watcher event receiver already taken"))
        })?;

        self.is_running.store(true, Ordering::SeqCst);
        let sender = self.sender.clone();
        let rescan = self.rescan.clone();
        let is_running = self.is_running.clone();

        Ok(tokio::spawn(async move {
            while let Some(fs_event) = receiver.recv().await {
                if !is_running.load(Ordering::SeqCst) {
                    break;
                }
                if let FileSystemEvent::WatchError(message) = &fs_event {
                    warn!("Watcher reported an error, scheduling a full rescan: {}", message);
                    rescan.request();
                    continue;
                }
                for event in map_event(fs_event) {
                    debug!("Forwarding {:?}", event);
                    if sender.send(InboundEvent::Ingest(event)).await.is_err() {
                        info!("Dispatcher closed, watcher bridge stopping");
                        return;
                    }
                }
            }
            debug!("Watcher bridge loop ended");
        }))
    }

    pub async fn stop(&self) -> Result<()> {
        self.is_running.store(false, Ordering::SeqCst);
        self.watcher.stop_watching().await
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

/// Ingest events for one file system event. Watch errors map to nothing;
/// the bridge answers them with a delayed rescan instead.
pub fn map_event(event: FileSystemEvent) -> Vec<IngestEvent> {
    match event {
        FileSystemEvent::Created(path) => vec![IngestEvent::FileAdded(path)],
        FileSystemEvent::Modified(path) => vec![IngestEvent::FileChanged(path)],
        FileSystemEvent::Deleted(path) => vec![IngestEvent::FileRemoved(path)],
        FileSystemEvent::Renamed { from, to } => {
            vec![IngestEvent::FileRemoved(from), IngestEvent::FileAdded(to)]
        }
        FileSystemEvent::WatchError(_) => Vec::new(),
    }
}
