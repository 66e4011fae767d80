use async_trait::async_trait;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer, FileIdMap};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::media;

pub mod integration;

/// Events that can occur below a watched photos root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSystemEvent {
    /// A photo or a directory appeared
    Created(PathBuf),
    /// A photo's content changed
    Modified(PathBuf),
    /// A path disappeared; it may have been a file or a directory
    Deleted(PathBuf),
    /// A path moved within the watched tree
    Renamed { from: PathBuf, to: PathBuf },
    /// The backend reported an error; events may have been lost
    WatchError(String),
}

/// Trait for cross-platform file system watching
#[async_trait]
pub trait FileSystemWatcher: Send + Sync {
    /// Start watching the specified directories for changes
    async fn start_watching(&self, directories: &[PathBuf]) -> Result<()>;

    /// Stop watching all directories
    async fn stop_watching(&self) -> Result<()>;

    /// Take the receiver for file system events; only the first call gets it
    fn take_event_receiver(&self) -> Option<mpsc::Receiver<FileSystemEvent>>;

    /// Check if a path is currently being watched
    async fn is_watching(&self, path: &Path) -> bool;
}

/// notify-backed watcher with debouncing
pub struct CrossPlatformWatcher {
    debouncer: Arc<RwLock<Option<Debouncer<RecommendedWatcher, FileIdMap>>>>,
    event_sender: mpsc::Sender<FileSystemEvent>,
    event_receiver: std::sync::Mutex<Option<mpsc::Receiver<FileSystemEvent>>>,
    watched_paths: Arc<RwLock<HashSet<PathBuf>>>,
    extensions: Arc<[String]>,
    debounce_duration: Duration,
}

impl CrossPlatformWatcher {
    /// Create a watcher reporting files with the given extensions
    pub fn new(extensions: &[String], debounce_duration: Duration) -> Self {
        let (event_sender, event_receiver) = mpsc::channel(1000);

        Self {
            debouncer: Arc::new(RwLock::new(None)),
            event_sender,
            event_receiver: std::sync::Mutex::new(Some(event_receiver)),
            watched_paths: Arc::new(RwLock::new(HashSet::new())),
            extensions: extensions.into(),
            debounce_duration,
        }
    }

    async fn initialize_watcher(&self) -> Result<()> {
        let event_sender = self.event_sender.clone();
        let extensions = self.extensions.clone();

        let debouncer = new_debouncer(self.debounce_duration, None, move |result: DebounceEventResult| {
            let fs_events = match result {
                Ok(events) => {
                    if !events.is_empty() {
                        debug!("Watcher callback triggered with {} events", events.len());
                    }
                    convert_events(events, &extensions)
                }
                Err(errors) => errors
                    .into_iter()
                    .map(|e| {
                        error!("File watcher error: {:?}", e);
                        FileSystemEvent::WatchError(e.to_string())
                    })
                    .collect(),
            };

            for fs_event in fs_events {
                if let Err(e) = event_sender.try_send(fs_event) {
                    error!("Failed to send file system event: {}", e);
                }
            }
        })?;

        *self.debouncer.write().await = Some(debouncer);
        info!(
            "File system watcher initialized with {}ms debounce",
            self.debounce_duration.as_millis()
        );
        Ok(())
    }
}

/// Directories always pass: a new album shows up as one create event
fn is_relevant(path: &Path, extensions: &[String]) -> bool {
    path.is_dir() || media::is_supported(path, extensions)
}

/// Translate debounced notify events into [`FileSystemEvent`]s
fn convert_events(events: Vec<DebouncedEvent>, extensions: &[String]) -> Vec<FileSystemEvent> {
    let mut fs_events = Vec::new();

    for event in events {
        let paths = &event.event.paths;
        match event.event.kind {
            EventKind::Create(_) | EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                for path in paths.iter().filter(|p| is_relevant(p, extensions)) {
                    debug!("Appeared: {:?}", path);
                    fs_events.push(FileSystemEvent::Created(path.clone()));
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if paths.len() == 2 => {
                fs_events.push(FileSystemEvent::Renamed {
                    from: paths[0].clone(),
                    to: paths[1].clone(),
                });
            }
            // The path is gone, so whether it was a directory is unknowable
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                fs_events.extend(paths.iter().cloned().map(FileSystemEvent::Deleted));
            }
            EventKind::Access(_) => {}
            _ => {
                for path in paths.iter().filter(|p| media::is_supported(p, extensions)) {
                    debug!("Modified: {:?}", path);
                    fs_events.push(FileSystemEvent::Modified(path.clone()));
                }
            }
        }
    }

    fs_events
}

#[async_trait]
impl FileSystemWatcher for CrossPlatformWatcher {
    async fn start_watching(&self, directories: &[PathBuf]) -> Result<()> {
        info!("Starting file system watcher for {} directories", directories.len());

        if self.debouncer.read().await.is_none() {
            self.initialize_watcher().await?;
        }

        let mut debouncer_guard = self.debouncer.write().await;
        if let Some(ref mut debouncer) = *debouncer_guard {
            let mut watched_paths = self.watched_paths.write().await;

            for directory in directories {
                if !directory.is_dir() {
                    warn!("Not a directory, skipping: {:?}", directory);
                    continue;
                }

                if let Err(e) = debouncer.watcher().watch(directory, RecursiveMode::Recursive) {
                    error!("Failed to watch directory {:?}: {}", directory, e);
                    return Err(e.into());
                }
                watched_paths.insert(directory.clone());
                info!("Started watching directory: {:?}", directory);
            }
        }

        Ok(())
    }

    async fn stop_watching(&self) -> Result<()> {
        info!("Stopping file system watcher");

        // Dropping the debouncer stops the backend
        self.debouncer.write().await.take();
        self.watched_paths.write().await.clear();

        Ok(())
    }

    fn take_event_receiver(&self) -> Option<mpsc::Receiver<FileSystemEvent>> {
        self.event_receiver
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }

    async fn is_watching(&self, path: &Path) -> bool {
        self.watched_paths.read().await.contains(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};
    use notify::Event;
    use std::time::Instant;
    use tempfile::TempDir;

    fn extensions() -> Vec<String> {
        vec!["jpg".to_string(), "png".to_string()]
    }

    fn debounced(kind: EventKind, paths: &[&str]) -> DebouncedEvent {
        let mut event = Event::new(kind);
        for path in paths {
            event = event.add_path(PathBuf::from(path));
        }
        DebouncedEvent::new(event, Instant::now())
    }

    #[test]
    fn test_convert_filters_non_photos() {
        let events = vec![
            debounced(EventKind::Create(CreateKind::File), &["/p/a.JPG"]),
            debounced(EventKind::Create(CreateKind::File), &["/p/notes.txt"]),
            debounced(EventKind::Modify(ModifyKind::Data(DataChange::Content)), &["/p/b.png"]),
            debounced(EventKind::Remove(RemoveKind::Any), &["/p/party"]),
        ];

        let converted = convert_events(events, &extensions());
        assert_eq!(
            converted,
            vec![
                FileSystemEvent::Created(PathBuf::from("/p/a.JPG")),
                FileSystemEvent::Modified(PathBuf::from("/p/b.png")),
                FileSystemEvent::Deleted(PathBuf::from("/p/party")),
            ]
        );
    }

    #[test]
    fn test_convert_renames() {
        let events = vec![debounced(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/p/a.jpg", "/p/b.jpg"],
        )];
        assert_eq!(
            convert_events(events, &extensions()),
            vec![FileSystemEvent::Renamed {
                from: PathBuf::from("/p/a.jpg"),
                to: PathBuf::from("/p/b.jpg"),
            }]
        );
    }

    #[tokio::test]
    async fn test_receiver_is_taken_once() {
        let watcher = CrossPlatformWatcher::new(&["jpg".to_string()], Duration::from_millis(100));
        assert!(watcher.take_event_receiver().is_some());
        assert!(watcher.take_event_receiver().is_none());
    }

    #[tokio::test]
    async fn test_watch_and_unwatch() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = CrossPlatformWatcher::new(&["jpg".to_string()], Duration::from_millis(100));

        watcher.start_watching(&[temp_dir.path().to_path_buf()]).await.unwrap();
        assert!(watcher.is_watching(temp_dir.path()).await);

        watcher.stop_watching().await.unwrap();
        assert!(!watcher.is_watching(temp_dir.path()).await);
    }

    #[tokio::test]
    async fn test_watch_nonexistent_directory() {
        let watcher = CrossPlatformWatcher::new(&["jpg".to_string()], Duration::from_millis(100));
        let result = watcher.start_watching(&[PathBuf::from("/nonexistent/path")]).await;
        assert!(result.is_ok());
        assert!(!watcher.is_watching(Path::new("/nonexistent/path")).await);
    }
}
