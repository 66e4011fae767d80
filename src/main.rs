use anyhow::Context;
use clap::Parser;
use std::{path::PathBuf, sync::Arc, time::Duration, time::Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use screenpool::{
    clock::{Clock, SystemClock},
    config::{AppConfig, ConfigChangeEvent, ConfigManager, ConfigSource},
    display::{spawn_local_display, DisplayAgent},
    ingest::{ImageRenderer, IngestEvent, IngestSettings},
    logging,
    selection::SelectionEngine,
    server::{self, InboundEvent, RescanTrigger, WallServer},
    state::AppState,
    watcher::{integration::WatcherIngestBridge, CrossPlatformWatcher},
    web,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Shared-pool photo wall server", long_about = None)]
struct Args {
    /// Configuration file (created with defaults if missing)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory to watch for photos
    #[arg(long)]
    photos_dir: Option<PathBuf>,

    /// Directory for display renditions
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// The network port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Run this many in-process displays (ids 1..=N) against the server
    #[arg(long, default_value_t = 0)]
    simulate_displays: u8,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init_logging_with_debug(args.debug)?;
    let started = Instant::now();

    let config_path = args.config.clone().unwrap_or_else(AppConfig::default_config_file_path);
    let mut config = AppConfig::load_or_create(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;
    if let Some(dir) = args.photos_dir {
        config.media.photos_dir = dir;
    }
    if let Some(dir) = args.cache_dir {
        config.media.cache_dir = dir;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    logging::log_startup_info(&config, &config_path);
    logging::log_system_resources();

    tokio::fs::create_dir_all(&config.media.photos_dir)
        .await
        .with_context(|| format!("Failed to create photos directory {}", config.media.photos_dir.display()))?;
    tokio::fs::create_dir_all(&config.media.cache_dir)
        .await
        .with_context(|| format!("Failed to create cache directory {}", config.media.cache_dir.display()))?;

    let config_manager = Arc::new(ConfigManager::from_config(config.clone(), config_path.clone()).watch()?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let wall_server = Arc::new(WallServer::new(
        IngestSettings::from_config(&config),
        &config.coordination,
        Arc::new(ImageRenderer::from_config(&config.media)),
        config_manager.clone() as Arc<dyn ConfigSource>,
        clock.clone(),
    ));

    let (inbound_tx, inbound_rx) = mpsc::channel::<InboundEvent>(1024);
    let rescan = RescanTrigger::new(
        inbound_tx.clone(),
        Duration::from_millis(config.ingest.rescan_delay_ms),
    );
    let dispatcher = server::spawn_dispatcher(wall_server.clone(), inbound_rx, rescan.clone());

    inbound_tx
        .send(InboundEvent::Ingest(IngestEvent::RescanAll))
        .await
        .context("Dispatcher stopped before the initial scan")?;

    let watched = vec![config.media.photos_dir.clone()];
    let _bridge = if config.ingest.watch_for_changes {
        let watcher = CrossPlatformWatcher::new(
            &config.media.supported_extensions,
            Duration::from_millis(config.ingest.debounce_ms),
        );
        let bridge = WatcherIngestBridge::new(Arc::new(watcher), inbound_tx.clone(), rescan.clone());
        match bridge.start(config.media.photos_dir.clone()).await {
            Ok(_) => {
                logging::log_file_watcher_status(&watched, true);
                Some(bridge)
            }
            Err(e) => {
                error!("Failed to start file watcher: {}", e);
                logging::log_file_watcher_status(&watched, false);
                None
            }
        }
    } else {
        logging::log_file_watcher_status(&watched, false);
        None
    };

    spawn_config_forwarder(config_manager.subscribe_to_changes(), inbound_tx.clone());

    server::spawn_scheduler(
        server::server_scheduler(&config.coordination, clock.now_ms()),
        clock.clone(),
        inbound_tx.clone(),
    );
    spawn_status_logger(wall_server.clone());

    for id in 1..=args.simulate_displays {
        let agent = DisplayAgent::new(
            SelectionEngine::new(id.to_string()),
            clock.clone(),
            config.coordination.step_timeout(),
        );
        let (conn, _) = spawn_local_display(agent, inbound_tx.clone());
        info!("Simulated display {} attached as connection {}", id, conn);
    }

    let app_state = AppState {
        config: config_manager.clone(),
        server: wall_server.clone(),
        inbound: inbound_tx.clone(),
    };
    let app = web::create_router(app_state);

    let addr = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("Listening on http://{}", addr);

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server failed")?;

    dispatcher.abort();
    logging::log_shutdown_info(true, started.elapsed().as_secs());
    Ok(())
}

/// Turn configuration file changes into dispatcher events
fn spawn_config_forwarder(
    mut changes: broadcast::Receiver<ConfigChangeEvent>,
    inbound: mpsc::Sender<InboundEvent>,
) {
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(ConfigChangeEvent::WallChanged(wall)) => {
                    if inbound.send(InboundEvent::ConfigChanged(wall)).await.is_err() {
                        break;
                    }
                }
                Ok(ConfigChangeEvent::MediaDirsChanged { old, new }) => {
                    warn!(
                        "Photos directory changed from {} to {}; restart to pick it up",
                        old.display(),
                        new.display()
                    );
                }
                Ok(ConfigChangeEvent::Reloaded(_)) => debug!("Configuration reloaded"),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!("Missed {} configuration change(s)", missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

fn spawn_status_logger(server: Arc<WallServer>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        interval.tick().await;
        loop {
            interval.tick().await;
            logging::log_periodic_status(&server.stats().await);
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
