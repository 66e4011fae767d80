//! A display client's cycle loop.
//!
//! [`DisplayAgent`] owns a [`SelectionEngine`] and decides, once per layout
//! duration, what the screen shows next: a hero plus tiles, or a step of the
//! screen's sequence. It never blocks on the server; a coordinated step whose
//! advance does not arrive is abandoned after twice the server deadline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{GroupMode, ScreenConfig};
use crate::hub::{ConnectionId, Outbound};
use crate::media::Item;
use crate::protocol::{ClientMessage, Heartbeat, ServerEvent};
use crate::scheduler::{Scheduler, TickKind};
use crate::selection::SelectionEngine;
use crate::server::InboundEvent;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1800);
pub const DECAY_INTERVAL: Duration = Duration::from_secs(60);
/// Retry delay while a cycle is held at a barrier
const HOLD_RECHECK_MS: u64 = 500;

/// What the screen shows for one cycle
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Photos { hero: Option<Item>, tiles: Vec<Item> },
    Step { sequence_id: String, step_id: String },
}

impl Frame {
    pub fn layout(&self) -> &'static str {
        match self {
            Frame::Photos { hero: Some(_), .. } => "hero_tiles",
            Frame::Photos { hero: None, .. } => "tiles",
            Frame::Step { .. } => "step",
        }
    }

    pub fn visible_ids(&self) -> Vec<String> {
        match self {
            Frame::Photos { hero, tiles } => hero.iter().chain(tiles).map(|item| item.id.clone()).collect(),
            Frame::Step { .. } => Vec::new(),
        }
    }
}

/// Result of one cycle: the new frame (None keeps the current one) and messages to send
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Cycle {
    pub frame: Option<Frame>,
    pub outgoing: Vec<ClientMessage>,
}

/// How the agent wants its driver to react to a server event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentSignal {
    Idle,
    /// Run the next cycle now instead of waiting out the layout duration
    CycleNow,
    Reload { delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StepState {
    Idle,
    Showing { sequence_id: String, step_id: String },
    Awaiting { sequence_id: String, step_id: String, reported_at: u64 },
}

pub struct DisplayAgent {
    engine: SelectionEngine,
    clock: Arc<dyn Clock>,
    step_timeout: Duration,
    step_state: StepState,
    step_cursor: HashMap<String, usize>,
    cycles_since_step: u32,
    current: Option<Frame>,
    last_cycle_at: u64,
    last_cycle_duration_ms: Option<u64>,
}

impl DisplayAgent {
    pub fn new(engine: SelectionEngine, clock: Arc<dyn Clock>, step_timeout: Duration) -> Self {
        Self {
            engine,
            clock,
            step_timeout,
            step_state: StepState::Idle,
            step_cursor: HashMap::new(),
            cycles_since_step: 0,
            current: None,
            last_cycle_at: 0,
            last_cycle_duration_ms: None,
        }
    }

    pub fn display_id(&self) -> &str {
        self.engine.display_id()
    }

    pub fn engine(&self) -> &SelectionEngine {
        &self.engine
    }

    pub fn current(&self) -> Option<&Frame> {
        self.current.as_ref()
    }

    pub fn is_awaiting_advance(&self) -> bool {
        matches!(self.step_state, StepState::Awaiting { .. })
    }

    /// Display-side periodic jobs
    pub fn scheduler(&self, now_ms: u64) -> Scheduler {
        Scheduler::new()
            .every(TickKind::Heartbeat, HEARTBEAT_INTERVAL, now_ms)
            .every(TickKind::DecaySelection, DECAY_INTERVAL, now_ms)
    }

    pub fn on_tick(&mut self, kind: TickKind) -> Option<ClientMessage> {
        match kind {
            TickKind::Heartbeat => Some(self.heartbeat()),
            TickKind::DecaySelection => {
                if self.engine.decay(self.clock.now_ms()) {
                    debug!("Display {} halved its show counters", self.display_id());
                }
                None
            }
            _ => None,
        }
    }

    pub fn heartbeat(&self) -> ClientMessage {
        let cfg = self.engine.screen_config();
        ClientMessage::DisplayHeartbeat(Heartbeat {
            display_id: self.display_id().to_string(),
            layout: self.current.as_ref().map(|f| f.layout().to_string()),
            group: (cfg.group_mode == GroupMode::Manual).then(|| cfg.active_group.clone()),
            visible_ids: self.current.as_ref().map(Frame::visible_ids).unwrap_or_default(),
            last_cycle_at: self.last_cycle_at,
            last_cycle_duration_ms: self.last_cycle_duration_ms,
        })
    }

    pub fn handle_event(&mut self, event: &ServerEvent) -> AgentSignal {
        match event {
            ServerEvent::SequenceAdvance { sequence_id, step_id } => self.on_advance(sequence_id, step_id),
            ServerEvent::Reload { delay_ms } => AgentSignal::Reload { delay_ms: *delay_ms },
            event => {
                self.engine.apply_event(event);
                AgentSignal::Idle
            }
        }
    }

    fn on_advance(&mut self, sequence_id: &str, step_id: &str) -> AgentSignal {
        if self.engine.screen_config().sequence_id.as_deref() != Some(sequence_id) {
            return AgentSignal::Idle;
        }
        self.advance_cursor(sequence_id, step_id);

        match &self.step_state {
            StepState::Awaiting { sequence_id: seq, .. } if seq == sequence_id => {
                self.step_state = StepState::Idle;
                AgentSignal::CycleNow
            }
            StepState::Showing { sequence_id: seq, step_id: step } if seq == sequence_id && step == step_id => {
                // Advanced without us; finish showing, then move on without reporting
                self.step_state = StepState::Idle;
                AgentSignal::Idle
            }
            _ => AgentSignal::Idle,
        }
    }

    fn advance_cursor(&mut self, sequence_id: &str, step_id: &str) {
        let Some(sequence) = self.engine.replica().config().sequence(sequence_id) else {
            return;
        };
        let len = sequence.step_ids.len().max(1);
        let cursor = self.step_cursor.entry(sequence_id.to_string()).or_insert(0);
        *cursor = match sequence.step_ids.iter().position(|s| s == step_id) {
            Some(pos) => (pos + 1) % len,
            None => (*cursor + 1) % len,
        };
    }

    /// The step to interleave now, if the screen has a sequence and it is due
    fn due_step(&self, cfg: &ScreenConfig) -> Option<(String, String, bool)> {
        let sequence_id = cfg.sequence_id.as_deref()?;
        let sequence = self.engine.replica().config().sequence(sequence_id)?;
        if sequence.step_ids.is_empty() || self.cycles_since_step < sequence.interleave_every.max(1) {
            return None;
        }
        let cursor = self.step_cursor.get(sequence_id).copied().unwrap_or(0);
        let step_id = sequence.step_ids[cursor % sequence.step_ids.len()].clone();
        Some((sequence_id.to_string(), step_id, sequence.coordinated))
    }

    fn is_coordinated(&self, sequence_id: &str) -> bool {
        self.engine
            .replica()
            .config()
            .sequence(sequence_id)
            .map(|s| s.coordinated)
            .unwrap_or(false)
    }

    /// Finish the current frame and choose the next one
    pub fn cycle(&mut self) -> Cycle {
        let now = self.clock.now_ms();
        let mut outgoing = Vec::new();

        match std::mem::replace(&mut self.step_state, StepState::Idle) {
            StepState::Idle => {}
            StepState::Showing { sequence_id, step_id } => {
                if self.is_coordinated(&sequence_id) {
                    outgoing.push(ClientMessage::StepReady {
                        sequence_id: sequence_id.clone(),
                        step_id: step_id.clone(),
                        display_id: Some(self.display_id().to_string()),
                    });
                    self.step_state = StepState::Awaiting {
                        sequence_id,
                        step_id,
                        reported_at: now,
                    };
                    return Cycle { frame: None, outgoing };
                }
                outgoing.push(ClientMessage::StepEnded {
                    sequence_id: Some(sequence_id.clone()),
                    step_id: step_id.clone(),
                    display_id: Some(self.display_id().to_string()),
                });
                self.advance_cursor(&sequence_id, &step_id);
            }
            StepState::Awaiting {
                sequence_id,
                step_id,
                reported_at,
            } => {
                let fallback_ms = self.step_timeout.as_millis() as u64 * 2;
                if now.saturating_sub(reported_at) < fallback_ms {
                    self.step_state = StepState::Awaiting {
                        sequence_id,
                        step_id,
                        reported_at,
                    };
                    return Cycle::default();
                }
                warn!(
                    "Display {}: no advance for step {} of {}, moving on locally",
                    self.display_id(),
                    step_id,
                    sequence_id
                );
                self.advance_cursor(&sequence_id, &step_id);
            }
        }

        let cfg = self.engine.screen_config();
        let frame = match self.due_step(&cfg) {
            Some((sequence_id, step_id, _)) => {
                self.cycles_since_step = 0;
                self.step_state = StepState::Showing {
                    sequence_id: sequence_id.clone(),
                    step_id: step_id.clone(),
                };
                Frame::Step { sequence_id, step_id }
            }
            None => {
                self.cycles_since_step += 1;
                let hero = self.engine.pick_hero_photo(&cfg, now);
                let exclude: Vec<String> = hero.iter().map(|pick| pick.item.id.clone()).collect();
                let tiles = self.engine.pick_photos(cfg.tiles_per_cycle, &cfg, &exclude, now);
                let hero = hero.map(|pick| {
                    outgoing.push(pick.claim);
                    pick.item
                });
                Frame::Photos { hero, tiles }
            }
        };

        if self.last_cycle_at > 0 {
            self.last_cycle_duration_ms = Some(now.saturating_sub(self.last_cycle_at));
        }
        self.last_cycle_at = now;
        self.current = Some(frame.clone());
        Cycle {
            frame: Some(frame),
            outgoing,
        }
    }

    /// Drive the agent from a hub connection until it closes
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<Outbound>, outbound: mpsc::UnboundedSender<ClientMessage>) {
        let mut scheduler = self.scheduler(self.clock.now_ms());
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut next_cycle_at = 0u64;

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Some(Outbound::Event(event)) => match self.handle_event(&event) {
                        AgentSignal::CycleNow => next_cycle_at = 0,
                        AgentSignal::Reload { delay_ms } => {
                            info!("Display {} asked to reload in {}ms", self.display_id(), delay_ms);
                        }
                        AgentSignal::Idle => {}
                    },
                    Some(Outbound::Ping) => {}
                    Some(Outbound::Close) | None => break,
                },
                _ = ticker.tick() => {
                    let now = self.clock.now_ms();
                    for kind in scheduler.due(now) {
                        if let Some(message) = self.on_tick(kind) {
                            let _ = outbound.send(message);
                        }
                    }
                    if now >= next_cycle_at {
                        let cycle = self.cycle();
                        next_cycle_at = match cycle.frame {
                            Some(_) => now + self.engine.screen_config().layout_duration_ms,
                            None => now + HOLD_RECHECK_MS,
                        };
                        for message in cycle.outgoing {
                            if outbound.send(message).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
        debug!("Display {} stopped", self.display_id());
    }
}

/// Run an agent as an in-process display attached to the server dispatcher
pub fn spawn_local_display(agent: DisplayAgent, inbound: mpsc::Sender<InboundEvent>) -> (ConnectionId, JoinHandle<()>) {
    let conn = uuid::Uuid::new_v4();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (message_tx, mut message_rx) = mpsc::unbounded_channel::<ClientMessage>();

    let handle = tokio::spawn(async move {
        if inbound
            .send(InboundEvent::Connected { conn, sender: event_tx })
            .await
            .is_err()
        {
            return;
        }

        let forward = {
            let inbound = inbound.clone();
            tokio::spawn(async move {
                while let Some(message) = message_rx.recv().await {
                    if inbound.send(InboundEvent::Message { conn, message }).await.is_err() {
                        break;
                    }
                }
            })
        };

        agent.run(event_rx, message_tx).await;
        forward.abort();
        let _ = inbound.send(InboundEvent::Disconnected { conn }).await;
    });

    (conn, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{SequenceConfig, WallConfig};
    use crate::media::ItemStatus;
    use crate::protocol::{Snapshot, SnapshotVersion};
    use std::collections::HashSet;
    use std::path::PathBuf;
    use uuid::Uuid;

    fn ready(id: &str, added_at: u64) -> Item {
        let mut item = Item::queued(id.to_string(), PathBuf::from(id), added_at);
        item.status = ItemStatus::Ready;
        item
    }

    fn wall(coordinated: bool) -> WallConfig {
        let mut wall = WallConfig::default();
        if let Some(screen) = wall.screens.get_mut("1") {
            screen.sequence_id = Some("intro".into());
            screen.tiles_per_cycle = 3;
        }
        wall.sequences.push(SequenceConfig {
            id: "intro".into(),
            name: "Intro".into(),
            step_ids: vec!["s1".into(), "s2".into()],
            interleave_every: 2,
            coordinated,
        });
        wall
    }

    fn agent(clock: &ManualClock, wall: WallConfig) -> DisplayAgent {
        let mut agent = DisplayAgent::new(
            SelectionEngine::with_seed("1", 3),
            Arc::new(clock.clone()),
            Duration::from_secs(15),
        );
        agent.handle_event(&ServerEvent::Init(Snapshot {
            version: SnapshotVersion {
                epoch: Uuid::new_v4(),
                seq: 1,
            },
            items: (0..6).map(|i| ready(&format!("p{}.jpg", i), i * 10)).collect(),
            config: wall,
            locks: vec![],
        }));
        agent
    }

    fn step_of(cycle: &Cycle) -> Option<&str> {
        match &cycle.frame {
            Some(Frame::Step { step_id, .. }) => Some(step_id),
            _ => None,
        }
    }

    #[test]
    fn test_photo_cycle_claims_hero() {
        let clock = ManualClock::new(1_000_000);
        let mut agent = agent(&clock, WallConfig::default());

        let cycle = agent.cycle();
        let Some(Frame::Photos { hero: Some(hero), tiles }) = &cycle.frame else {
            panic!("expected a hero frame, got {:?}", cycle.frame);
        };
        let ids: HashSet<_> = tiles.iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids.len(), tiles.len());
        assert!(!ids.contains(&hero.id));
        assert!(matches!(
            &cycle.outgoing[..],
            [ClientMessage::HeroClaim { item_id, .. }] if item_id == &hero.id
        ));

        match agent.heartbeat() {
            ClientMessage::DisplayHeartbeat(hb) => {
                assert_eq!(hb.display_id, "1");
                assert_eq!(hb.visible_ids.len(), tiles.len() + 1);
                assert_eq!(hb.layout.as_deref(), Some("hero_tiles"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_uncoordinated_steps_interleave() {
        let clock = ManualClock::new(1_000_000);
        let mut agent = agent(&clock, wall(false));

        assert!(step_of(&agent.cycle()).is_none());
        assert!(step_of(&agent.cycle()).is_none());
        assert_eq!(step_of(&agent.cycle()), Some("s1"));

        let after = agent.cycle();
        assert!(after.outgoing.iter().any(|m| matches!(
            m,
            ClientMessage::StepEnded { step_id, .. } if step_id == "s1"
        )));
        assert!(step_of(&after).is_none());
        agent.cycle();
        assert_eq!(step_of(&agent.cycle()), Some("s2"));
    }

    #[test]
    fn test_coordinated_step_waits_for_advance() {
        let clock = ManualClock::new(1_000_000);
        let mut agent = agent(&clock, wall(true));
        agent.cycle();
        agent.cycle();
        assert_eq!(step_of(&agent.cycle()), Some("s1"));

        let report = agent.cycle();
        assert!(report.frame.is_none());
        assert_eq!(
            report.outgoing,
            vec![ClientMessage::StepReady {
                sequence_id: "intro".into(),
                step_id: "s1".into(),
                display_id: Some("1".into()),
            }]
        );
        assert!(agent.is_awaiting_advance());

        clock.advance_secs(5);
        assert_eq!(agent.cycle(), Cycle::default());

        let signal = agent.handle_event(&ServerEvent::SequenceAdvance {
            sequence_id: "intro".into(),
            step_id: "s1".into(),
        });
        assert_eq!(signal, AgentSignal::CycleNow);
        assert!(step_of(&agent.cycle()).is_none());
        agent.cycle();
        assert_eq!(step_of(&agent.cycle()), Some("s2"));
    }

    #[test]
    fn test_missing_advance_falls_back_locally() {
        let clock = ManualClock::new(1_000_000);
        let mut agent = agent(&clock, wall(true));
        agent.cycle();
        agent.cycle();
        agent.cycle();
        agent.cycle();
        assert!(agent.is_awaiting_advance());

        clock.advance_secs(29);
        assert!(agent.cycle().frame.is_none());
        clock.advance_secs(1);
        assert!(agent.cycle().frame.is_some());
        assert!(!agent.is_awaiting_advance());
    }

    #[test]
    fn test_advance_for_other_sequence_is_ignored() {
        let clock = ManualClock::new(1_000_000);
        let mut agent = agent(&clock, wall(true));
        let signal = agent.handle_event(&ServerEvent::SequenceAdvance {
            sequence_id: "other".into(),
            step_id: "x".into(),
        });
        assert_eq!(signal, AgentSignal::Idle);
    }

    #[test]
    fn test_display_scheduler() {
        let clock = ManualClock::new(0);
        let agent = agent(&clock, WallConfig::default());
        let mut scheduler = agent.scheduler(0);
        assert_eq!(scheduler.due(1_800), vec![TickKind::Heartbeat]);
        assert!(scheduler.due(60_000).contains(&TickKind::DecaySelection));
    }
}
