//! The server core: one owned state structure and one event handler.
//!
//! Transports (websocket tasks, the file watcher, HTTP handlers, the
//! scheduler loop) never touch the services directly. They turn what they
//! observe into an [`InboundEvent`] and push it onto the dispatcher channel,
//! where [`WallServer::handle`] applies it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arbiter::HeroLockArbiter;
use crate::clock::Clock;
use crate::config::{ConfigSource, CoordinationConfig, WallConfig};
use crate::coordinator::PlaylistAdvanceCoordinator;
use crate::error::Result;
use crate::health::{CacheStats, HealthRegistry, HealthStats};
use crate::hub::{BroadcastHub, ClientRole, ConnectionId, Outbound};
use crate::ingest::{IngestEvent, IngestSettings, IngestionPipeline, Renderer};
use crate::media::{MediaStore, SharedStore};
use crate::protocol::{ClientMessage, Heartbeat, ServerEvent, Snapshot, SnapshotVersion, RELOAD_DELAY_MS};
use crate::scheduler::{Scheduler, TickKind};

/// Everything the server reacts to
#[derive(Debug)]
pub enum InboundEvent {
    Connected {
        conn: ConnectionId,
        sender: mpsc::UnboundedSender<Outbound>,
    },
    Disconnected {
        conn: ConnectionId,
    },
    Message {
        conn: ConnectionId,
        message: ClientMessage,
    },
    Pong {
        conn: ConnectionId,
    },
    Ingest(IngestEvent),
    Tick(TickKind),
    ConfigChanged(WallConfig),
    ReloadDisplays {
        delay_ms: Option<u64>,
    },
}

pub struct WallServer {
    store: SharedStore,
    pipeline: IngestionPipeline,
    hub: BroadcastHub,
    arbiter: HeroLockArbiter,
    coordinator: PlaylistAdvanceCoordinator,
    health: Mutex<HealthRegistry>,
    config: Arc<dyn ConfigSource>,
    clock: Arc<dyn Clock>,
    epoch: Uuid,
    snapshot_seq: AtomicU64,
}

impl WallServer {
    pub fn new(
        settings: IngestSettings,
        coordination: &CoordinationConfig,
        renderer: Arc<dyn Renderer>,
        config: Arc<dyn ConfigSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = MediaStore::new().shared();
        let hub = BroadcastHub::new();
        let pipeline = IngestionPipeline::new(
            settings,
            store.clone(),
            hub.clone(),
            renderer,
            config.clone(),
            clock.clone(),
        );
        let arbiter = HeroLockArbiter::new(hub.clone(), clock.clone());
        let coordinator = PlaylistAdvanceCoordinator::new(
            hub.clone(),
            config.clone(),
            clock.clone(),
            coordination.step_timeout(),
        );

        Self {
            store,
            pipeline,
            hub,
            arbiter,
            coordinator,
            health: Mutex::new(HealthRegistry::new()),
            config,
            clock,
            epoch: Uuid::new_v4(),
            snapshot_seq: AtomicU64::new(0),
        }
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn arbiter(&self) -> &HeroLockArbiter {
        &self.arbiter
    }

    pub fn coordinator(&self) -> &PlaylistAdvanceCoordinator {
        &self.coordinator
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn epoch(&self) -> Uuid {
        self.epoch
    }

    fn health(&self) -> MutexGuard<'_, HealthRegistry> {
        self.health.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Apply one inbound event
    pub async fn handle(&self, event: InboundEvent) -> Result<()> {
        match event {
            InboundEvent::Connected { conn, sender } => {
                self.hub.register_with_id(conn, sender);
                let snapshot = self.snapshot().await;
                self.hub.send_to(conn, ServerEvent::Init(snapshot));
            }
            InboundEvent::Disconnected { conn } => self.on_disconnect(conn),
            InboundEvent::Pong { conn } => self.hub.mark_alive(conn),
            InboundEvent::Message { conn, message } => {
                self.hub.mark_alive(conn);
                self.on_message(conn, message);
            }
            InboundEvent::Ingest(event) => {
                if let Some(report) = self.pipeline.handle_event(event).await? {
                    debug!("Rescan finished: {:?}", report);
                    let snapshot = self.snapshot().await;
                    self.hub.publish(ServerEvent::Init(snapshot));
                }
            }
            InboundEvent::Tick(kind) => self.on_tick(kind).await,
            InboundEvent::ConfigChanged(wall) => {
                self.hub.publish(ServerEvent::ConfigChanged { config: wall });
                let changed = self.pipeline.apply_hero_overrides().await;
                if changed > 0 {
                    info!("Hero flags changed on {} item(s)", changed);
                }
                self.coordinator.reevaluate();
            }
            InboundEvent::ReloadDisplays { delay_ms } => {
                self.reload_displays(delay_ms);
            }
        }
        Ok(())
    }

    fn on_message(&self, conn: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::DisplayHeartbeat(heartbeat) => self.on_heartbeat(conn, heartbeat),
            ClientMessage::HeroClaim {
                item_id,
                ttl_sec,
                display_id,
            } => match self.holder_for(conn, display_id) {
                Some(holder) => {
                    self.arbiter.claim(&item_id, &holder, ttl_sec);
                }
                None => debug!("Hero claim from unidentified connection {}", conn),
            },
            ClientMessage::StepReady {
                sequence_id,
                step_id,
                display_id,
            } => match self.holder_for(conn, display_id) {
                Some(holder) => {
                    self.coordinator.report_ready(&sequence_id, &step_id, &holder);
                }
                None => debug!("step_ready from unidentified connection {}", conn),
            },
            ClientMessage::StepEnded {
                sequence_id,
                step_id,
                display_id,
            } => {
                debug!(
                    "Display {} finished step {} of {}",
                    display_id.as_deref().unwrap_or("?"),
                    step_id,
                    sequence_id.as_deref().unwrap_or("-")
                );
            }
            ClientMessage::AdminReloadDisplays { delay_ms } => {
                self.reload_displays(delay_ms);
            }
        }
    }

    fn on_heartbeat(&self, conn: ConnectionId, heartbeat: Heartbeat) {
        if heartbeat.display_id.is_empty() {
            return;
        }
        self.hub.identify(conn, &heartbeat.display_id);
        let now = self.clock.now_ms();
        if self.health().record_heartbeat(&heartbeat, now) {
            info!("Display {} is online", heartbeat.display_id);
        }
    }

    /// Holder id for a claim or report: the connection's identity, else the id it names
    fn holder_for(&self, conn: ConnectionId, named: Option<String>) -> Option<String> {
        self.hub
            .role(conn)
            .and_then(|role| role.display_id().map(str::to_string))
            .or(named)
            .filter(|id| !id.is_empty())
    }

    fn on_disconnect(&self, conn: ConnectionId) {
        if let Some(ClientRole::Display(display_id)) = self.hub.unregister(conn) {
            self.display_gone(&display_id);
            self.coordinator.reevaluate();
        }
    }

    fn display_gone(&self, display_id: &str) {
        if !self.hub.is_display_connected(display_id) {
            info!("Display {} went offline", display_id);
            self.health().mark_disconnected(display_id, self.clock.now_ms());
        }
    }

    async fn on_tick(&self, kind: TickKind) {
        match kind {
            TickKind::SweepLocks => {
                self.arbiter.sweep();
            }
            TickKind::BroadcastHealth => {
                let stats = self.stats().await;
                self.hub.publish(ServerEvent::HealthUpdate { stats });
            }
            TickKind::Keepalive => {
                let dead = self.hub.keepalive_sweep();
                let mut lost_display = false;
                for (_, role) in dead {
                    if let ClientRole::Display(display_id) = role {
                        self.display_gone(&display_id);
                        lost_display = true;
                    }
                }
                if lost_display {
                    self.coordinator.reevaluate();
                }
            }
            TickKind::CoordinationDeadlines => {
                self.coordinator.fire_due();
            }
            TickKind::DecaySelection | TickKind::Heartbeat => {}
        }
    }

    /// Send `reload` to display connections only
    pub fn reload_displays(&self, delay_ms: Option<u64>) -> usize {
        let delay_ms = delay_ms.unwrap_or(RELOAD_DELAY_MS);
        let reached = self
            .hub
            .publish_filtered(ServerEvent::Reload { delay_ms }, ClientRole::is_display);
        info!("Asked {} display connection(s) to reload in {}ms", reached, delay_ms);
        reached
    }

    /// Next versioned full-state snapshot
    pub async fn snapshot(&self) -> Snapshot {
        let items = self.store.read().await.ready_items();
        Snapshot {
            version: SnapshotVersion {
                epoch: self.epoch,
                seq: self.snapshot_seq.fetch_add(1, Ordering::SeqCst) + 1,
            },
            items,
            config: self.config.wall(),
            locks: self.arbiter.snapshot(),
        }
    }

    pub async fn stats(&self) -> HealthStats {
        let now = self.clock.now_ms();
        let items = self.store.read().await.counts(now);
        let metrics = self.pipeline.metrics();
        HealthStats {
            generated_at: now,
            cache: CacheStats::new(&items, &metrics),
            items,
            displays: self.health().snapshot(now),
            hero_locks: self.arbiter.live_count(),
            pending_barriers: self.coordinator.pending_count(),
            connections: self.hub.len(),
        }
    }
}

/// Requests a full rescan after a quiet period, collapsing repeated requests
#[derive(Clone)]
pub struct RescanTrigger {
    pending: Arc<AtomicBool>,
    delay: Duration,
    sender: mpsc::Sender<InboundEvent>,
}

impl RescanTrigger {
    pub fn new(sender: mpsc::Sender<InboundEvent>, delay: Duration) -> Self {
        Self {
            pending: Arc::new(AtomicBool::new(false)),
            delay,
            sender,
        }
    }

    /// Schedule a rescan; false if one is already pending
    pub fn request(&self) -> bool {
        if self.pending.swap(true, Ordering::SeqCst) {
            return false;
        }
        let pending = self.pending.clone();
        let sender = self.sender.clone();
        let delay = self.delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pending.store(false, Ordering::SeqCst);
            if sender.send(InboundEvent::Ingest(IngestEvent::RescanAll)).await.is_err() {
                debug!("Dispatcher gone, dropping scheduled rescan");
            }
        });
        info!("Full rescan scheduled in {}ms", delay.as_millis());
        true
    }
}

/// Periodic server jobs at the configured cadences
pub fn server_scheduler(coordination: &CoordinationConfig, now_ms: u64) -> Scheduler {
    Scheduler::new()
        .every(TickKind::SweepLocks, Duration::from_secs(coordination.lock_sweep_secs), now_ms)
        .every(
            TickKind::BroadcastHealth,
            Duration::from_secs(coordination.health_interval_secs),
            now_ms,
        )
        .every(TickKind::Keepalive, Duration::from_secs(coordination.keepalive_secs), now_ms)
        .every(TickKind::CoordinationDeadlines, Duration::from_millis(500), now_ms)
}

/// Run the single dispatcher loop until every sender is gone
pub fn spawn_dispatcher(
    server: Arc<WallServer>,
    mut receiver: mpsc::Receiver<InboundEvent>,
    rescan: RescanTrigger,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            let from_ingest = matches!(event, InboundEvent::Ingest(_));
            if let Err(e) = server.handle(event).await {
                warn!("Event handling failed: {}", e);
                if from_ingest {
                    rescan.request();
                }
            }
        }
        info!("Dispatcher stopped");
    })
}

/// Feed due scheduler ticks into the dispatcher
pub fn spawn_scheduler(
    mut scheduler: Scheduler,
    clock: Arc<dyn Clock>,
    sender: mpsc::Sender<InboundEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(scheduler.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            for kind in scheduler.due(clock.now_ms()) {
                if sender.send(InboundEvent::Tick(kind)).await.is_err() {
                    return;
                }
            }
        }
    })
}
