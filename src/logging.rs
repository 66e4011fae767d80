use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::AppConfig;
use crate::health::HealthStats;

/// Initialize logging at `info`
pub fn init_logging() -> anyhow::Result<()> {
    init_logging_with_options(None, false)
}

/// Initialize logging with debug flag
pub fn init_logging_with_debug(debug: bool) -> anyhow::Result<()> {
    let log_level = if debug { "debug" } else { "info" };
    init_logging_with_options(Some(log_level), debug)
}

/// Initialize logging. `RUST_LOG` wins over `log_level` when set.
pub fn init_logging_with_options(log_level: Option<&str>, debug: bool) -> anyhow::Result<()> {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level.unwrap_or(default_level)))
        .map_err(|e| anyhow::anyhow!("Invalid log level: {}", e))?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Logging already initialized: {}", e))?;

    info!("Logging initialized with level: {}", log_level.unwrap_or(default_level));
    Ok(())
}

/// Log the effective configuration at startup
pub fn log_startup_info(config: &AppConfig, config_path: &Path) {
    info!("=== screenpool starting ===");
    info!("Configuration file: {}", config_path.display());
    info!("Listening address: {}", config.bind_address());
    info!("Photos directory: {}", config.media.photos_dir.display());
    info!("Rendition cache: {}", config.media.cache_dir.display());
    info!(
        "Renditions bounded to {}x{} at quality {}",
        config.media.display_width, config.media.display_height, config.media.jpeg_quality
    );
    info!(
        "Ingest workers: {}, file watching: {}",
        config.ingest.max_workers, config.ingest.watch_for_changes
    );
    info!("Screens configured: {}", config.wall.screen_count);
    for (id, screen) in &config.wall.screens {
        debug!(
            "  screen {}: {:?} mode, group '{}', sequence {:?}",
            id, screen.group_mode, screen.active_group, screen.sequence_id
        );
    }
    for sequence in &config.wall.sequences {
        let mode = if sequence.coordinated { "coordinated" } else { "free-running" };
        info!(
            "  sequence {} ({} steps, every {} cycles, {})",
            sequence.id,
            sequence.step_ids.len(),
            sequence.interleave_every,
            mode
        );
    }
}

/// Log file system watcher status
pub fn log_file_watcher_status(watched_directories: &[PathBuf], watcher_active: bool) {
    info!("=== File System Watcher Status ===");

    if watcher_active {
        info!("File system watcher is active");
    } else {
        warn!("File system watcher is not active - new photos are only picked up by rescans");
    }

    for (i, dir) in watched_directories.iter().enumerate() {
        let status = if dir.is_dir() { "accessible" } else { "inaccessible" };
        info!("  {}. {} [{}]", i + 1, dir.display(), status);
    }
}

/// Log system resource information
pub fn log_system_resources() {
    info!("=== System Resources ===");
    info!("CPU cores: {}", num_cpus::get());
    info!("Process ID: {}", std::process::id());
}

/// One-line pipeline and wall summary
pub fn log_periodic_status(stats: &HealthStats) {
    let connected = stats.displays.iter().filter(|d| d.connected).count();
    info!(
        "Pool: {} ready / {} known ({}% cached), queue {}, {} worker(s) busy, {} display(s) online, {} hero lock(s)",
        stats.items.ready,
        stats.items.total,
        stats.cache.coverage_pct,
        stats.cache.queue_depth,
        stats.cache.active_workers,
        connected,
        stats.hero_locks
    );
    if stats.cache.failed > 0 {
        warn!("Renditions failed since startup: {}", stats.cache.failed);
    }
}

/// Log shutdown information
pub fn log_shutdown_info(graceful: bool, uptime_seconds: u64) {
    info!("=== screenpool shutting down ===");

    let shutdown_type = if graceful { "Graceful" } else { "Forced" };
    info!("Shutdown type: {}", shutdown_type);
    info!("Total uptime: {}h {}m", uptime_seconds / 3600, (uptime_seconds % 3600) / 60);
}
