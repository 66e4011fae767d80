use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard},
    time::Duration,
};
use tokio::sync::broadcast;

pub mod validation;

use validation::{sanitize_wall_config, ConfigValidator};

/// Highest screen id a wall can be configured with
pub const MAX_SCREENS: u8 = 4;

/// Main application configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub media: MediaConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub coordination: CoordinationConfig,
    #[serde(default)]
    pub wall: WallConfig,
}

/// Server configuration settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    pub interface: String,
}

/// Where photos come from and how their display renditions are produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub photos_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub supported_extensions: Vec<String>,
    pub display_width: u32,
    pub display_height: u32,
    pub jpeg_quality: u8,
}

/// Ingestion pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub max_workers: usize,
    pub watch_for_changes: bool,
    pub debounce_ms: u64,
    pub rescan_delay_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_workers: 3,
            watch_for_changes: true,
            debounce_ms: 500,
            rescan_delay_ms: 1200,
        }
    }
}

/// Timers for the arbitration services and connection upkeep
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub step_timeout_secs: u64,
    pub lock_sweep_secs: u64,
    pub health_interval_secs: u64,
    pub keepalive_secs: u64,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: 15,
            lock_sweep_secs: 5,
            health_interval_secs: 3,
            keepalive_secs: 10,
        }
    }
}

impl CoordinationConfig {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// How a screen builds its candidate pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupMode {
    /// Every ready item is eligible
    #[default]
    Auto,
    /// The active group plus a sampled share of other groups
    Manual,
}

/// Per-screen selection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenConfig {
    pub layout_duration_ms: u64,
    pub group_mode: GroupMode,
    pub active_group: String,
    pub group_mix_pct: u32,
    pub recency_bias: u32,
    pub hero_cooldown_sec: u64,
    pub cross_screen_lock_sec: u64,
    pub tile_candidate_boost: f64,
    pub hero_candidate_boost: f64,
    pub tiles_per_cycle: usize,
    pub sequence_id: Option<String>,
}

impl Default for ScreenConfig {
    fn default() -> Self {
        Self {
            layout_duration_ms: 8000,
            group_mode: GroupMode::Auto,
            active_group: "ungrouped".to_string(),
            group_mix_pct: 20,
            recency_bias: 60,
            hero_cooldown_sec: 30,
            cross_screen_lock_sec: 30,
            tile_candidate_boost: 2.0,
            hero_candidate_boost: 3.0,
            tiles_per_cycle: 4,
            sequence_id: None,
        }
    }
}

/// An ordered list of interstitial steps shown between photo cycles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceConfig {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub step_ids: Vec<String>,
    #[serde(default = "default_interleave_every")]
    pub interleave_every: u32,
    #[serde(default)]
    pub coordinated: bool,
}

fn default_interleave_every() -> u32 {
    5
}

/// Wall layout: which screens exist, what they show, operator flags
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WallConfig {
    pub screen_count: u8,
    pub screens: BTreeMap<String, ScreenConfig>,
    pub sequences: Vec<SequenceConfig>,
    pub hero_overrides: BTreeMap<String, bool>,
}

impl Default for WallConfig {
    fn default() -> Self {
        let screens = (1..=2u8)
            .map(|id| (id.to_string(), ScreenConfig::default()))
            .collect();
        Self {
            screen_count: 2,
            screens,
            sequences: Vec::new(),
            hero_overrides: BTreeMap::new(),
        }
    }
}

impl WallConfig {
    /// Config for a screen, falling back to defaults for unknown ids
    pub fn screen(&self, screen_id: &str) -> ScreenConfig {
        self.screens.get(screen_id).cloned().unwrap_or_default()
    }

    pub fn sequence(&self, sequence_id: &str) -> Option<&SequenceConfig> {
        self.sequences.iter().find(|s| s.id == sequence_id)
    }

    /// Screen ids whose configuration points at `sequence_id`
    pub fn screens_on_sequence(&self, sequence_id: &str) -> Vec<String> {
        self.screens
            .iter()
            .filter(|(_, cfg)| cfg.sequence_id.as_deref() == Some(sequence_id))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_hero_candidate(&self, item_id: &str) -> bool {
        self.hero_overrides.get(item_id).copied().unwrap_or(false)
    }
}

/// Read-only view of the wall configuration consumed by the core services
pub trait ConfigSource: Send + Sync {
    fn wall(&self) -> WallConfig;

    fn screen_config(&self, screen_id: &str) -> ScreenConfig {
        self.wall().screen(screen_id)
    }

    fn screens_on_sequence(&self, sequence_id: &str) -> Vec<String> {
        self.wall().screens_on_sequence(sequence_id)
    }

    fn is_hero_candidate(&self, item_id: &str) -> bool {
        self.wall().is_hero_candidate(item_id)
    }
}

impl ConfigSource for WallConfig {
    fn wall(&self) -> WallConfig {
        self.clone()
    }

    fn screen_config(&self, screen_id: &str) -> ScreenConfig {
        self.screen(screen_id)
    }

    fn screens_on_sequence(&self, sequence_id: &str) -> Vec<String> {
        WallConfig::screens_on_sequence(self, sequence_id)
    }

    fn is_hero_candidate(&self, item_id: &str) -> bool {
        WallConfig::is_hero_candidate(self, item_id)
    }
}

impl AppConfig {
    /// Load configuration from file or create with defaults
    pub fn load_or_create<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config_path = config_path.as_ref();

        if config_path.exists() {
            Self::load_from_file(config_path)
        } else {
            let default_config = Self::default();
            default_config.save_to_file(config_path).with_context(|| {
                format!("Failed to create default configuration file at: {}", config_path.display())
            })?;

            tracing::info!("Created default configuration file at: {}", config_path.display());
            Ok(default_config)
        }
    }

    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let content = std::fs::read_to_string(config_path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", config_path.as_ref().display()))?;

        let mut config: AppConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.as_ref().display()))?;

        sanitize_wall_config(&mut config.wall);
        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a TOML file, writing through a temp file
    pub fn save_to_file<P: AsRef<Path>>(&self, config_path: P) -> Result<()> {
        let config_path = config_path.as_ref();

        if let Some(parent) = config_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create config directory: {}", parent.display()))?;
            }
        }

        let mut content = String::from("# screenpool configuration\n\n");
        content.push_str(&toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?);

        let tmp = config_path.with_extension("toml.tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("Failed to write config file: {}", tmp.display()))?;
        std::fs::rename(&tmp, config_path)
            .with_context(|| format!("Failed to replace config file: {}", config_path.display()))?;

        Ok(())
    }

    /// Default location of the configuration file
    pub fn default_config_file_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("screenpool")
            .join("screenpool.toml")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.interface, self.server.port)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let base = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            server: ServerConfig {
                port: 3000,
                interface: "0.0.0.0".to_string(),
            },
            media: MediaConfig {
                photos_dir: base.join("photos"),
                cache_dir: base.join("cache").join("display"),
                supported_extensions: ["jpg", "jpeg", "png", "webp", "gif"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                display_width: 1920,
                display_height: 1080,
                jpeg_quality: 84,
            },
            ingest: IngestConfig::default(),
            coordination: CoordinationConfig::default(),
            wall: WallConfig::default(),
        }
    }
}

/// Configuration change event
#[derive(Debug, Clone)]
pub enum ConfigChangeEvent {
    /// The whole configuration was replaced
    Reloaded(Box<AppConfig>),
    /// Screen, sequence or override settings changed
    WallChanged(WallConfig),
    /// Photo or cache directory moved; only picked up on restart
    MediaDirsChanged { old: PathBuf, new: PathBuf },
}

/// Owns the live configuration and announces changes to it
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    config_path: PathBuf,
    change_sender: broadcast::Sender<ConfigChangeEvent>,
    _watcher: Option<notify::RecommendedWatcher>,
}

impl ConfigManager {
    /// Wrap an already-loaded configuration
    pub fn from_config(config: AppConfig, config_path: PathBuf) -> Self {
        let (change_sender, _) = broadcast::channel(100);
        Self {
            config: Arc::new(RwLock::new(config)),
            config_path,
            change_sender,
            _watcher: None,
        }
    }

    /// Start reloading this manager's file when it changes on disk
    pub fn watch(mut self) -> Result<Self> {
        let watcher = Self::setup_file_watcher(
            self.config_path.clone(),
            self.config.clone(),
            self.change_sender.clone(),
        )?;
        self._watcher = Some(watcher);
        Ok(self)
    }

    fn setup_file_watcher(
        config_path: PathBuf,
        config: Arc<RwLock<AppConfig>>,
        sender: broadcast::Sender<ConfigChangeEvent>,
    ) -> Result<notify::RecommendedWatcher> {
        use notify::{Event, EventKind, Watcher};
        use tokio::sync::mpsc;

        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            if let Ok(event) = res {
                let _ = tx.try_send(event);
            }
        })?;

        if let Some(parent) = config_path.parent() {
            watcher.watch(parent, notify::RecursiveMode::NonRecursive)?;
        }

        tokio::spawn(async move {
            let mut last_reload = std::time::Instant::now();
            const DEBOUNCE_DURATION: Duration = Duration::from_millis(500);

            while let Some(event) = rx.recv().await {
                if !event.paths.iter().any(|path| path == &config_path) {
                    continue;
                }

                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    continue;
                }

                let now = std::time::Instant::now();
                if now.duration_since(last_reload) < DEBOUNCE_DURATION {
                    continue;
                }
                last_reload = now;

                match AppConfig::load_from_file(&config_path) {
                    Ok(new_config) => {
                        let old_config = {
                            let mut guard = config.write().unwrap_or_else(PoisonError::into_inner);
                            std::mem::replace(&mut *guard, new_config.clone())
                        };
                        if old_config != new_config {
                            Self::send_change_notifications(&sender, &old_config, &new_config);
                            tracing::info!("Configuration reloaded from file");
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to reload configuration, keeping previous: {}", e);
                    }
                }
            }
        });

        Ok(watcher)
    }

    fn send_change_notifications(
        sender: &broadcast::Sender<ConfigChangeEvent>,
        old_config: &AppConfig,
        new_config: &AppConfig,
    ) {
        let _ = sender.send(ConfigChangeEvent::Reloaded(Box::new(new_config.clone())));

        if old_config.wall != new_config.wall {
            let _ = sender.send(ConfigChangeEvent::WallChanged(new_config.wall.clone()));
        }

        if old_config.media.photos_dir != new_config.media.photos_dir {
            let _ = sender.send(ConfigChangeEvent::MediaDirsChanged {
                old: old_config.media.photos_dir.clone(),
                new: new_config.media.photos_dir.clone(),
            });
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current configuration
    pub fn get_config(&self) -> AppConfig {
        self.read().clone()
    }

    /// Replace the configuration, persist it and announce the change
    pub fn update_config(&self, mut new_config: AppConfig) -> Result<()> {
        sanitize_wall_config(&mut new_config.wall);
        ConfigValidator::validate(&new_config)?;
        new_config.save_to_file(&self.config_path)?;

        let old_config = {
            let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *guard, new_config.clone())
        };

        Self::send_change_notifications(&self.change_sender, &old_config, &new_config);
        Ok(())
    }

    /// Replace one screen's settings
    pub fn update_screen_config(&self, screen_id: &str, screen: ScreenConfig) -> Result<ScreenConfig> {
        let mut config = self.get_config();
        config.wall.screens.insert(screen_id.to_string(), screen);
        self.update_config(config)?;
        Ok(self.screen_config(screen_id))
    }

    /// Flag or unflag an item as a hero candidate
    pub fn set_hero_candidate(&self, item_id: &str, hero_candidate: bool) -> Result<()> {
        let mut config = self.get_config();
        if hero_candidate {
            config.wall.hero_overrides.insert(item_id.to_string(), true);
        } else {
            config.wall.hero_overrides.remove(item_id);
        }
        self.update_config(config)
    }

    /// Subscribe to configuration change events
    pub fn subscribe_to_changes(&self) -> broadcast::Receiver<ConfigChangeEvent> {
        self.change_sender.subscribe()
    }
}

impl ConfigSource for ConfigManager {
    fn wall(&self) -> WallConfig {
        self.read().wall.clone()
    }

    fn screen_config(&self, screen_id: &str) -> ScreenConfig {
        self.read().wall.screen(screen_id)
    }

    fn screens_on_sequence(&self, sequence_id: &str) -> Vec<String> {
        self.read().wall.screens_on_sequence(sequence_id)
    }

    fn is_hero_candidate(&self, item_id: &str) -> bool {
        self.read().wall.is_hero_candidate(item_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> AppConfig {
        let mut config = AppConfig::default();
        config.media.photos_dir = dir.path().join("photos");
        config.media.cache_dir = dir.path().join("cache");
        config
    }

    #[test]
    fn test_default_config_creation() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.ingest.max_workers, 3);
        assert_eq!(config.coordination.step_timeout_secs, 15);
        assert_eq!(config.wall.screen_count, 2);
        assert!(config.wall.screens.contains_key("1"));
        assert!(config.wall.screens.contains_key("2"));
    }

    #[test]
    fn test_config_serialization() -> Result<()> {
        let config = AppConfig::default();

        let toml_str = toml::to_string_pretty(&config)?;
        assert!(toml_str.contains("[server]"));
        assert!(toml_str.contains("[media]"));
        assert!(toml_str.contains("[wall.screens.1]"));

        let parsed: AppConfig = toml::from_str(&toml_str)?;
        assert_eq!(parsed, config);
        Ok(())
    }

    #[test]
    fn test_config_file_operations() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("nested").join("screenpool.toml");

        let created = AppConfig::load_or_create(&config_path)?;
        assert!(config_path.exists());

        let loaded = AppConfig::load_from_file(&config_path)?;
        assert_eq!(created, loaded);
        Ok(())
    }

    #[test]
    fn test_partial_file_gets_section_defaults() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("screenpool.toml");
        std::fs::write(
            &config_path,
            r#"
[server]
port = 4000
interface = "127.0.0.1"

[media]
photos_dir = "/srv/photos"
cache_dir = "/srv/cache"
supported_extensions = ["jpg"]
display_width = 1280
display_height = 720
jpeg_quality = 80

[wall.screens.1]
recency_bias = 500
sequence_id = "intro"
"#,
        )?;

        let config = AppConfig::load_from_file(&config_path)?;
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.ingest, IngestConfig::default());
        // Out-of-range values are clamped, missing screens are filled in
        assert_eq!(config.wall.screen("1").recency_bias, 100);
        assert!(config.wall.screens.contains_key("2"));
        assert_eq!(config.wall.screens_on_sequence("intro"), vec!["1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_config_manager_updates_and_notifies() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let config_path = temp_dir.path().join("screenpool.toml");
        let manager = ConfigManager::from_config(config_in(&temp_dir), config_path.clone());
        let mut changes = manager.subscribe_to_changes();

        let mut screen = manager.screen_config("2");
        screen.sequence_id = Some("intro".into());
        screen.hero_cooldown_sec = 1;
        let stored = manager.update_screen_config("2", screen)?;

        assert_eq!(stored.hero_cooldown_sec, 10);
        assert_eq!(manager.screens_on_sequence("intro"), vec!["2".to_string()]);
        assert!(config_path.exists());

        assert!(matches!(changes.recv().await?, ConfigChangeEvent::Reloaded(_)));
        match changes.recv().await? {
            ConfigChangeEvent::WallChanged(wall) => {
                assert_eq!(wall.screen("2").sequence_id.as_deref(), Some("intro"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn test_hero_overrides() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let manager =
            ConfigManager::from_config(config_in(&temp_dir), temp_dir.path().join("screenpool.toml"));

        assert!(!manager.is_hero_candidate("party/a.jpg"));
        manager.set_hero_candidate("party/a.jpg", true)?;
        assert!(manager.is_hero_candidate("party/a.jpg"));
        manager.set_hero_candidate("party/a.jpg", false)?;
        assert!(!manager.is_hero_candidate("party/a.jpg"));
        Ok(())
    }
}
