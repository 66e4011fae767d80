use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::net::IpAddr;

use super::{AppConfig, ScreenConfig, WallConfig, MAX_SCREENS};

/// Configuration validator for ensuring configuration integrity
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire application configuration
    pub fn validate(config: &AppConfig) -> Result<()> {
        Self::validate_server_config(config)?;
        Self::validate_media_config(config)?;
        Self::validate_ingest_config(config)?;
        Self::validate_coordination_config(config)?;
        Self::validate_wall_config(&config.wall)?;
        Ok(())
    }

    fn validate_server_config(config: &AppConfig) -> Result<()> {
        if config.server.port == 0 {
            return Err(anyhow!("Server port cannot be 0"));
        }

        if config.server.interface != "0.0.0.0" && config.server.interface != "::" {
            config
                .server
                .interface
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid server interface address: {}", config.server.interface))?;
        }

        Ok(())
    }

    fn validate_media_config(config: &AppConfig) -> Result<()> {
        let media = &config.media;

        if media.photos_dir.as_os_str().is_empty() {
            return Err(anyhow!("Photos directory cannot be empty"));
        }

        if media.cache_dir.as_os_str().is_empty() {
            return Err(anyhow!("Cache directory cannot be empty"));
        }

        // Renditions written into the watched tree would be ingested again
        if media.cache_dir.starts_with(&media.photos_dir) {
            return Err(anyhow!(
                "Cache directory {} must not live inside the photos directory {}",
                media.cache_dir.display(),
                media.photos_dir.display()
            ));
        }

        if media.supported_extensions.is_empty() {
            return Err(anyhow!("At least one supported file extension must be configured"));
        }

        let mut seen = HashSet::new();
        for ext in &media.supported_extensions {
            if ext.trim().is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(anyhow!("Invalid extension format: {:?}", ext));
            }
            if !seen.insert(ext.to_lowercase()) {
                return Err(anyhow!("Duplicate file extension in supported_extensions: {}", ext));
            }
        }

        if media.display_width < 320 || media.display_height < 240 {
            return Err(anyhow!(
                "Display size {}x{} is below the 320x240 minimum",
                media.display_width,
                media.display_height
            ));
        }

        if media.jpeg_quality == 0 || media.jpeg_quality > 100 {
            return Err(anyhow!("JPEG quality must be between 1 and 100"));
        }

        Ok(())
    }

    fn validate_ingest_config(config: &AppConfig) -> Result<()> {
        if config.ingest.max_workers == 0 {
            return Err(anyhow!("Ingest needs at least one worker"));
        }
        Ok(())
    }

    fn validate_coordination_config(config: &AppConfig) -> Result<()> {
        let c = &config.coordination;
        for (name, value) in [
            ("step_timeout_secs", c.step_timeout_secs),
            ("lock_sweep_secs", c.lock_sweep_secs),
            ("health_interval_secs", c.health_interval_secs),
            ("keepalive_secs", c.keepalive_secs),
        ] {
            if value == 0 {
                return Err(anyhow!("{} must be greater than 0", name));
            }
        }
        Ok(())
    }

    fn validate_wall_config(wall: &WallConfig) -> Result<()> {
        if wall.screen_count == 0 || wall.screen_count > MAX_SCREENS {
            return Err(anyhow!("Screen count must be between 1 and {}", MAX_SCREENS));
        }

        for id in wall.screens.keys() {
            if !is_valid_screen_id(id) {
                return Err(anyhow!("Invalid screen id: {:?}", id));
            }
        }

        let mut ids = HashSet::new();
        for sequence in &wall.sequences {
            if sequence.id.trim().is_empty() {
                return Err(anyhow!("Sequence id cannot be empty"));
            }
            if !ids.insert(sequence.id.as_str()) {
                return Err(anyhow!("Duplicate sequence id: {}", sequence.id));
            }
        }

        for (screen_id, screen) in &wall.screens {
            if let Some(sequence_id) = &screen.sequence_id {
                if !ids.contains(sequence_id.as_str()) {
                    tracing::warn!("Screen {} references unknown sequence {}", screen_id, sequence_id);
                }
            }
        }

        Ok(())
    }
}

pub fn is_valid_screen_id(id: &str) -> bool {
    matches!(id.parse::<u8>(), Ok(n) if (1..=MAX_SCREENS).contains(&n)) && !id.starts_with('0')
}

/// Clamp every numeric screen setting into its supported range
pub fn sanitize_screen_config(screen: &mut ScreenConfig) {
    screen.layout_duration_ms = screen.layout_duration_ms.clamp(3_000, 45_000);
    screen.group_mix_pct = screen.group_mix_pct.min(80);
    screen.recency_bias = screen.recency_bias.min(100);
    screen.hero_cooldown_sec = screen.hero_cooldown_sec.clamp(10, 240);
    screen.cross_screen_lock_sec = screen.cross_screen_lock_sec.clamp(10, 180);
    screen.tiles_per_cycle = screen.tiles_per_cycle.min(12);
    screen.tile_candidate_boost = clamp_boost(screen.tile_candidate_boost, 2.0);
    screen.hero_candidate_boost = clamp_boost(screen.hero_candidate_boost, 3.0);
    if screen.active_group.trim().is_empty() {
        screen.active_group = "ungrouped".to_string();
    }
    if screen.sequence_id.as_deref().is_some_and(|s| s.trim().is_empty()) {
        screen.sequence_id = None;
    }
}

fn clamp_boost(value: f64, fallback: f64) -> f64 {
    if value.is_finite() {
        value.clamp(1.0, 10.0)
    } else {
        fallback
    }
}

/// Clamp the wall and make sure every active screen has a config entry
pub fn sanitize_wall_config(wall: &mut WallConfig) {
    wall.screen_count = wall.screen_count.clamp(1, MAX_SCREENS);
    wall.screens.retain(|id, _| is_valid_screen_id(id));
    for id in 1..=wall.screen_count.max(2) {
        wall.screens.entry(id.to_string()).or_default();
    }
    for screen in wall.screens.values_mut() {
        sanitize_screen_config(screen);
    }
    for sequence in &mut wall.sequences {
        sequence.interleave_every = sequence.interleave_every.max(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SequenceConfig;

    #[test]
    fn test_valid_default_config() {
        let config = AppConfig::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_server_config() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        config.server.port = 3000;
        config.server.interface = "not-an-ip".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_invalid_media_config() {
        let mut config = AppConfig::default();
        config.media.cache_dir = config.media.photos_dir.join("cache");
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.media.supported_extensions = vec!["jpg".into(), "JPG".into()];
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = AppConfig::default();
        config.media.jpeg_quality = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_duplicate_sequences_rejected() {
        let mut config = AppConfig::default();
        let sequence = SequenceConfig {
            id: "intro".into(),
            name: String::new(),
            step_ids: vec!["a".into()],
            interleave_every: 3,
            coordinated: true,
        };
        config.wall.sequences = vec![sequence.clone(), sequence];
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_screen_ids() {
        assert!(is_valid_screen_id("1"));
        assert!(is_valid_screen_id("4"));
        assert!(!is_valid_screen_id("0"));
        assert!(!is_valid_screen_id("5"));
        assert!(!is_valid_screen_id("01"));
        assert!(!is_valid_screen_id("lobby"));
    }

    #[test]
    fn test_sanitize_clamps_screen_values() {
        let mut screen = ScreenConfig {
            layout_duration_ms: 100,
            group_mix_pct: 95,
            recency_bias: 250,
            hero_cooldown_sec: 1_000,
            cross_screen_lock_sec: 1,
            tile_candidate_boost: f64::NAN,
            hero_candidate_boost: 0.2,
            active_group: "  ".into(),
            sequence_id: Some(String::new()),
            ..ScreenConfig::default()
        };
        sanitize_screen_config(&mut screen);

        assert_eq!(screen.layout_duration_ms, 3_000);
        assert_eq!(screen.group_mix_pct, 80);
        assert_eq!(screen.recency_bias, 100);
        assert_eq!(screen.hero_cooldown_sec, 240);
        assert_eq!(screen.cross_screen_lock_sec, 10);
        assert_eq!(screen.tile_candidate_boost, 2.0);
        assert_eq!(screen.hero_candidate_boost, 1.0);
        assert_eq!(screen.active_group, "ungrouped");
        assert_eq!(screen.sequence_id, None);
    }

    #[test]
    fn test_sanitize_wall_fills_screens() {
        let mut wall = WallConfig {
            screen_count: 9,
            screens: Default::default(),
            sequences: Vec::new(),
            hero_overrides: Default::default(),
        };
        wall.screens.insert("7".into(), ScreenConfig::default());
        sanitize_wall_config(&mut wall);

        assert_eq!(wall.screen_count, MAX_SCREENS);
        assert_eq!(wall.screens.len(), 4);
        assert!(!wall.screens.contains_key("7"));
    }
}
