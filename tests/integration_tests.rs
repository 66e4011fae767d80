//! Integration tests for the wall server
//!
//! These tests drive the public server surface the way transports do: by
//! feeding inbound events and reading what connections receive.

use async_trait::async_trait;
use screenpool::clock::{Clock, ManualClock};
use screenpool::config::{CoordinationConfig, ScreenConfig, SequenceConfig, WallConfig};
use screenpool::display::{spawn_local_display, DisplayAgent};
use screenpool::hub::{ConnectionId, Outbound};
use screenpool::ingest::{IngestError, IngestEvent, IngestSettings, Rendition, Renderer};
use screenpool::media::{Item, ItemStatus};
use screenpool::protocol::{ClientMessage, Heartbeat, ServerEvent, Snapshot, SnapshotVersion};
use screenpool::scheduler::TickKind;
use screenpool::selection::{weights, SelectionEngine};
use screenpool::server::{self, InboundEvent, RescanTrigger, WallServer};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_test::assert_ok;
use uuid::Uuid;

/// Writes a placeholder rendition and records peak concurrency
#[derive(Default)]
struct FakeRenderer {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl Renderer for FakeRenderer {
    async fn render(&self, _source: &Path, target: &Path) -> Result<Rendition, IngestError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        sleep(Duration::from_millis(15)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);

        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, b"jpeg").await?;
        Ok(Rendition {
            width: 3000,
            height: 2000,
            display_width: 1620,
            display_height: 1080,
        })
    }
}

struct Wall {
    _dir: TempDir,
    photos: PathBuf,
    cache: PathBuf,
    clock: ManualClock,
    renderer: Arc<FakeRenderer>,
    server: Arc<WallServer>,
}

fn wall_with(config: WallConfig) -> Wall {
    let dir = TempDir::new().unwrap();
    let photos = dir.path().join("photos");
    let cache = dir.path().join("cache");
    std::fs::create_dir_all(&photos).unwrap();

    let clock = ManualClock::new(1_000_000);
    let renderer = Arc::new(FakeRenderer::default());
    let settings = IngestSettings {
        photos_dir: photos.clone(),
        cache_dir: cache.clone(),
        supported_extensions: vec!["jpg".into()],
        max_workers: 3,
    };
    let server = Arc::new(WallServer::new(
        settings,
        &CoordinationConfig::default(),
        renderer.clone(),
        Arc::new(config),
        Arc::new(clock.clone()),
    ));
    Wall {
        _dir: dir,
        photos,
        cache,
        clock,
        renderer,
        server,
    }
}

fn coordinated_wall() -> WallConfig {
    let mut config = WallConfig::default();
    config.sequences.push(SequenceConfig {
        id: "s1".into(),
        name: "Welcome".into(),
        step_ids: vec!["intro".into(), "outro".into()],
        interleave_every: 3,
        coordinated: true,
    });
    for screen in config.screens.values_mut() {
        screen.sequence_id = Some("s1".into());
    }
    config
}

/// Connect and identify a display, discarding its init
async fn display(server: &WallServer, display_id: &str) -> (ConnectionId, mpsc::UnboundedReceiver<Outbound>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let conn = Uuid::new_v4();
    assert_ok!(server.handle(InboundEvent::Connected { conn, sender: tx }).await);
    send(
        server,
        conn,
        ClientMessage::DisplayHeartbeat(Heartbeat {
            display_id: display_id.into(),
            layout: None,
            group: None,
            visible_ids: vec![],
            last_cycle_at: 0,
            last_cycle_duration_ms: None,
        }),
    )
    .await;
    drain(&mut rx);
    (conn, rx)
}

async fn send(server: &WallServer, conn: ConnectionId, message: ClientMessage) {
    assert_ok!(server.handle(InboundEvent::Message { conn, message }).await);
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(out) = rx.try_recv() {
        if let Outbound::Event(event) = out {
            events.push((*event).clone());
        }
    }
    events
}

fn advances(events: &[ServerEvent]) -> Vec<(String, String)> {
    events
        .iter()
        .filter_map(|event| match event {
            ServerEvent::SequenceAdvance { sequence_id, step_id } => Some((sequence_id.clone(), step_id.clone())),
            _ => None,
        })
        .collect()
}

fn step_ready(step_id: &str) -> ClientMessage {
    ClientMessage::StepReady {
        sequence_id: "s1".into(),
        step_id: step_id.into(),
        display_id: None,
    }
}

fn ready(id: &str, added_at: u64) -> Item {
    let mut item = Item::queued(id.to_string(), PathBuf::from(id), added_at);
    item.status = ItemStatus::Ready;
    item
}

fn engine_with(display_id: &str, items: Vec<Item>) -> SelectionEngine {
    let mut engine = SelectionEngine::with_seed(display_id, 42);
    engine.apply_event(&ServerEvent::Init(Snapshot {
        version: SnapshotVersion {
            epoch: Uuid::new_v4(),
            seq: 1,
        },
        items,
        config: WallConfig::default(),
        locks: vec![],
    }));
    engine
}

async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    timeout(Duration::from_secs(5), async {
        while !condition().await {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[cfg(test)]
mod hero_lock_tests {
    use super::*;

    #[tokio::test]
    async fn test_first_claim_stands_until_expiry() {
        let wall = wall_with(WallConfig::default());
        let (a, mut a_rx) = display(&wall.server, "1").await;
        let (b, _b_rx) = display(&wall.server, "2").await;

        let claim = |ttl| ClientMessage::HeroClaim {
            item_id: "p1.jpg".into(),
            ttl_sec: Some(ttl),
            display_id: None,
        };
        send(&wall.server, a, claim(30)).await;
        send(&wall.server, b, claim(30)).await;

        let locks = wall.server.arbiter().snapshot();
        assert_eq!(locks.len(), 1);
        assert_eq!(locks[0].holder_id, "1");
        assert_eq!(locks[0].expires_at, 1_000_000 + 30_000);
        assert_eq!(wall.server.snapshot().await.locks, locks);

        let announced: Vec<_> = drain(&mut a_rx)
            .into_iter()
            .filter(|e| matches!(e, ServerEvent::HeroLocks { .. }))
            .collect();
        assert_eq!(announced.len(), 1);

        wall.clock.advance_secs(31);
        wall.server.handle(InboundEvent::Tick(TickKind::SweepLocks)).await.unwrap();
        assert!(wall.server.arbiter().snapshot().is_empty());

        send(&wall.server, b, claim(30)).await;
        assert_eq!(wall.server.arbiter().holder_of("p1.jpg").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_ttl_is_clamped() {
        let wall = wall_with(WallConfig::default());
        let (a, _rx) = display(&wall.server, "1").await;
        send(
            &wall.server,
            a,
            ClientMessage::HeroClaim {
                item_id: "p2.jpg".into(),
                ttl_sec: Some(1),
                display_id: None,
            },
        )
        .await;
        let locks = wall.server.arbiter().snapshot();
        assert_eq!(locks[0].expires_at, 1_000_000 + 10_000);
    }
}

#[cfg(test)]
mod coordination_tests {
    use super::*;

    #[tokio::test]
    async fn test_barrier_advances_once_all_holders_report() {
        let wall = wall_with(coordinated_wall());
        let (one, mut one_rx) = display(&wall.server, "1").await;
        let (two, mut two_rx) = display(&wall.server, "2").await;

        send(&wall.server, one, step_ready("intro")).await;
        assert!(advances(&drain(&mut one_rx)).is_empty());
        assert_eq!(wall.server.coordinator().pending_count(), 1);

        send(&wall.server, two, step_ready("intro")).await;
        let expected = vec![("s1".to_string(), "intro".to_string())];
        assert_eq!(advances(&drain(&mut one_rx)), expected);
        assert_eq!(advances(&drain(&mut two_rx)), expected);

        assert_eq!(wall.server.coordinator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_single_step_sequence_advances_every_round() {
        let mut config = coordinated_wall();
        config.sequences[0].step_ids = vec!["intro".into()];
        let wall = wall_with(config);
        let (one, mut one_rx) = display(&wall.server, "1").await;
        let (two, _two_rx) = display(&wall.server, "2").await;
        let expected = vec![("s1".to_string(), "intro".to_string())];

        for _round in 0..3 {
            send(&wall.server, one, step_ready("intro")).await;
            assert_eq!(wall.server.coordinator().pending_count(), 1);
            send(&wall.server, two, step_ready("intro")).await;
            assert_eq!(advances(&drain(&mut one_rx)), expected);
            wall.clock.advance_secs(2);
        }
        assert_eq!(wall.server.coordinator().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_barrier_deadline_advances_without_quorum() {
        let wall = wall_with(coordinated_wall());
        let (one, mut one_rx) = display(&wall.server, "1").await;
        let (_two, _two_rx) = display(&wall.server, "2").await;

        send(&wall.server, one, step_ready("intro")).await;
        wall.clock.advance_secs(14);
        wall.server
            .handle(InboundEvent::Tick(TickKind::CoordinationDeadlines))
            .await
            .unwrap();
        assert!(advances(&drain(&mut one_rx)).is_empty());

        wall.clock.advance_secs(1);
        wall.server
            .handle(InboundEvent::Tick(TickKind::CoordinationDeadlines))
            .await
            .unwrap();
        assert_eq!(
            advances(&drain(&mut one_rx)),
            vec![("s1".to_string(), "intro".to_string())]
        );
    }

    #[tokio::test]
    async fn test_disconnect_completes_quorum() {
        let wall = wall_with(coordinated_wall());
        let (one, mut one_rx) = display(&wall.server, "1").await;
        let (two, _two_rx) = display(&wall.server, "2").await;

        send(&wall.server, one, step_ready("outro")).await;
        wall.server
            .handle(InboundEvent::Disconnected { conn: two })
            .await
            .unwrap();

        assert_eq!(
            advances(&drain(&mut one_rx)),
            vec![("s1".to_string(), "outro".to_string())]
        );
    }
}

#[cfg(test)]
mod ingest_tests {
    use super::*;

    #[tokio::test]
    async fn test_ten_files_through_dispatcher_respect_worker_cap() {
        let wall = wall_with(WallConfig::default());
        for i in 0..10 {
            std::fs::write(wall.photos.join(format!("{:02}.jpg", i)), b"x").unwrap();
        }

        let (tx, rx) = mpsc::channel(64);
        let rescan = RescanTrigger::new(tx.clone(), Duration::from_millis(50));
        let dispatcher = server::spawn_dispatcher(wall.server.clone(), rx, rescan);
        tx.send(InboundEvent::Ingest(IngestEvent::RescanAll)).await.unwrap();

        let server = wall.server.clone();
        wait_until(|| {
            let server = server.clone();
            async move { server.store().read().await.ready_items().len() == 10 }
        })
        .await;

        assert!(wall.renderer.peak.load(Ordering::SeqCst) <= 3);
        let stats = wall.server.stats().await;
        assert_eq!(stats.items.ready, 10);
        assert_eq!(stats.cache.coverage_pct, 100);
        dispatcher.abort();
    }

    #[tokio::test]
    async fn test_removed_file_leaves_cache_and_snapshot() {
        let wall = wall_with(WallConfig::default());
        let keep = wall.photos.join("keep.jpg");
        let gone = wall.photos.join("gone.jpg");
        std::fs::write(&keep, b"x").unwrap();
        std::fs::write(&gone, b"x").unwrap();

        wall.server
            .handle(InboundEvent::Ingest(IngestEvent::RescanAll))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), wall.server.pipeline().wait_idle())
            .await
            .unwrap();
        assert!(wall.cache.join("gone.jpg").exists());

        let (_conn, mut rx) = display(&wall.server, "1").await;
        std::fs::remove_file(&gone).unwrap();
        wall.server
            .handle(InboundEvent::Ingest(IngestEvent::FileRemoved(gone.clone())))
            .await
            .unwrap();

        assert!(!wall.cache.join("gone.jpg").exists());
        assert!(drain(&mut rx).contains(&ServerEvent::ItemRemoved { id: "gone.jpg".into() }));
        let ids: Vec<String> = wall.server.snapshot().await.items.into_iter().map(|i| i.id).collect();
        assert_eq!(ids, vec!["keep.jpg".to_string()]);
    }

    #[tokio::test]
    async fn test_init_snapshot_only_carries_ready_items() {
        let wall = wall_with(WallConfig::default());
        std::fs::write(wall.photos.join("a.jpg"), b"x").unwrap();
        wall.server
            .handle(InboundEvent::Ingest(IngestEvent::FileAdded(wall.photos.join("a.jpg"))))
            .await
            .unwrap();
        timeout(Duration::from_secs(5), wall.server.pipeline().wait_idle())
            .await
            .unwrap();

        let snapshot = wall.server.snapshot().await;
        assert_eq!(snapshot.items.len(), 1);
        assert!(snapshot.items[0].is_ready());
        assert_eq!(
            snapshot.items[0].display_url.as_deref(),
            Some(format!("/photos/a.jpg?v={}", wall.clock.now_ms()).as_str())
        );
    }
}

#[cfg(test)]
mod selection_tests {
    use super::*;

    #[test]
    fn test_single_item_hero_pool_repeats() {
        let mut engine = engine_with("1", vec![ready("only.jpg", 10)]);
        let cfg = ScreenConfig::default();
        let first = engine.pick_hero_photo(&cfg, 1_000).unwrap();
        let second = engine.pick_hero_photo(&cfg, 1_001).unwrap();
        assert_eq!(first.item.id, "only.jpg");
        assert_eq!(second.item.id, "only.jpg");
    }

    #[test]
    fn test_pick_photos_distinct() {
        let items: Vec<Item> = (0..6).map(|i| ready(&format!("p{}.jpg", i), i * 100)).collect();
        let mut engine = engine_with("1", items);
        let cfg = ScreenConfig::default();
        for round in 0..20 {
            let picked = engine.pick_photos(4, &cfg, &[], 10_000 + round * 1_000);
            let ids: HashSet<_> = picked.iter().map(|i| i.id.as_str()).collect();
            assert_eq!(picked.len(), 4);
            assert_eq!(ids.len(), 4);
        }
    }

    #[test]
    fn test_fairness_never_rewards_repeats() {
        let mut previous = weights::fairness_multiplier(0);
        for count in 1..50 {
            let current = weights::fairness_multiplier(count);
            assert!(current <= previous);
            assert!(current > 0.0);
            previous = current;
        }
    }
}

#[cfg(test)]
mod end_to_end_tests {
    use super::*;

    #[tokio::test]
    async fn test_local_display_heartbeats_and_claims_heroes() {
        let wall = wall_with(WallConfig::default());
        for name in ["a.jpg", "b.jpg", "c.jpg"] {
            std::fs::write(wall.photos.join(name), b"x").unwrap();
        }

        let (tx, rx) = mpsc::channel(256);
        let rescan = RescanTrigger::new(tx.clone(), Duration::from_millis(50));
        let dispatcher = server::spawn_dispatcher(wall.server.clone(), rx, rescan);
        tx.send(InboundEvent::Ingest(IngestEvent::RescanAll)).await.unwrap();

        let server = wall.server.clone();
        wait_until(|| {
            let server = server.clone();
            async move { server.store().read().await.ready_items().len() == 3 }
        })
        .await;

        let agent = DisplayAgent::new(
            SelectionEngine::with_seed("1", 3),
            Arc::new(wall.clock.clone()),
            Duration::from_secs(15),
        );
        let (_conn, handle) = spawn_local_display(agent, tx.clone());

        let server = wall.server.clone();
        let clock = wall.clock.clone();
        wait_until(|| {
            let server = server.clone();
            let clock = clock.clone();
            async move {
                clock.advance_secs(9);
                sleep(Duration::from_millis(120)).await;
                let stats = server.stats().await;
                let online = stats.displays.iter().any(|d| d.display_id == "1" && d.connected);
                online && stats.hero_locks > 0
            }
        })
        .await;

        let locks = wall.server.arbiter().snapshot();
        assert!(locks.iter().all(|lock| lock.holder_id == "1"));

        handle.abort();
        dispatcher.abort();
    }
}
