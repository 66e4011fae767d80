//! Per-display content selection.
//!
//! Every display runs its own [`SelectionEngine`] against a [`Replica`] of
//! the shared state. Decisions are local; the only cross-display effects go
//! through hero claims and step reports sent back to the server.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashSet;
use tracing::debug;

use crate::arbiter::clamp_ttl;
use crate::config::{GroupMode, ScreenConfig};
use crate::media::Item;
use crate::protocol::{ClientMessage, ServerEvent};

pub mod bookkeeping;
pub mod replica;
pub mod weights;

pub use bookkeeping::Bookkeeping;
pub use replica::{Replica, ReplicaChange};

/// A hero choice plus the claim the display should send for it
#[derive(Debug, Clone, PartialEq)]
pub struct HeroPick {
    pub item: Item,
    pub claim: ClientMessage,
}

pub struct SelectionEngine {
    display_id: String,
    rng: StdRng,
    replica: Replica,
    bookkeeping: Bookkeeping,
}

impl SelectionEngine {
    pub fn new(display_id: impl Into<String>) -> Self {
        Self::with_rng(display_id, StdRng::from_rng(&mut rand::rng()))
    }

    /// Deterministic engine for tests and replays
    pub fn with_seed(display_id: impl Into<String>, seed: u64) -> Self {
        Self::with_rng(display_id, StdRng::seed_from_u64(seed))
    }

    fn with_rng(display_id: impl Into<String>, rng: StdRng) -> Self {
        Self {
            display_id: display_id.into(),
            rng,
            replica: Replica::new(),
            bookkeeping: Bookkeeping::new(),
        }
    }

    pub fn display_id(&self) -> &str {
        &self.display_id
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    pub fn bookkeeping(&self) -> &Bookkeeping {
        &self.bookkeeping
    }

    /// This display's settings from the replicated wall config
    pub fn screen_config(&self) -> ScreenConfig {
        self.replica.config().screen(&self.display_id)
    }

    /// Fold a server event into the replica, keeping bookkeeping in step.
    ///
    /// A snapshot from the same server run only forgets items that left the
    /// pool; a new epoch means a restarted server and starts over.
    pub fn apply_event(&mut self, event: &ServerEvent) -> ReplicaChange {
        let previous_epoch = self.replica.version().map(|v| v.epoch);
        let change = self.replica.apply(event, &self.display_id);
        match &change {
            ReplicaChange::Replaced => {
                let same_run = previous_epoch.is_some() && previous_epoch == self.replica.version().map(|v| v.epoch);
                if same_run {
                    let replica = &self.replica;
                    self.bookkeeping.retain(|id| replica.get(id).is_some());
                } else {
                    self.bookkeeping.clear();
                }
            }
            ReplicaChange::ItemRemoved(id) => self.bookkeeping.forget(id),
            _ => {}
        }
        change
    }

    /// Items this screen may draw from under its group settings
    fn candidate_pool(&mut self, cfg: &ScreenConfig) -> Vec<Item> {
        let all = self.replica.ready_items();
        if cfg.group_mode == GroupMode::Auto {
            return all.into_iter().cloned().collect();
        }

        let (in_group, mut out_group): (Vec<&Item>, Vec<&Item>) =
            all.iter().copied().partition(|item| item.group == cfg.active_group);
        if in_group.is_empty() {
            return all.into_iter().cloned().collect();
        }

        let mix_count = (all.len() as f64 * f64::from(cfg.group_mix_pct) / 100.0).round() as usize;
        out_group.shuffle(&mut self.rng);
        in_group
            .into_iter()
            .chain(out_group.into_iter().take(mix_count))
            .cloned()
            .collect()
    }

    fn weigh(&self, pool: &[Item], cfg: &ScreenConfig, hero: bool, now_ms: u64) -> Vec<f64> {
        let mut order: Vec<usize> = (0..pool.len()).collect();
        order.sort_by(|a, b| {
            pool[*b]
                .added_at
                .cmp(&pool[*a].added_at)
                .then_with(|| pool[*a].id.cmp(&pool[*b].id))
        });
        let mut ranks = vec![0; pool.len()];
        for (rank, index) in order.into_iter().enumerate() {
            ranks[index] = rank;
        }

        let boost = if hero {
            cfg.hero_candidate_boost
        } else {
            cfg.tile_candidate_boost
        };

        pool.iter()
            .zip(ranks)
            .map(|(item, rank)| {
                weights::recency_multiplier(rank, pool.len(), cfg.recency_bias)
                    * weights::fairness_multiplier(self.bookkeeping.show_count(&item.id))
                    * weights::recent_shown_multiplier(self.bookkeeping.last_shown(&item.id), now_ms)
                    * weights::hero_boost(item.hero_candidate, boost)
            })
            .collect()
    }

    /// Draw one index from `candidates`, preferring ones not visible elsewhere
    fn draw(&mut self, pool: &[Item], scores: &[f64], candidates: Vec<usize>) -> Option<usize> {
        let (preferred, elsewhere): (Vec<usize>, Vec<usize>) = candidates
            .into_iter()
            .partition(|i| !self.replica.is_visible_elsewhere(&pool[*i].id));
        let candidates = if preferred.is_empty() { elsewhere } else { preferred };

        let candidate_weights: Vec<f64> = candidates.iter().map(|i| scores[*i]).collect();
        weights::weighted_index(&mut self.rng, &candidate_weights).map(|choice| candidates[choice])
    }

    /// Up to `count` distinct items by weighted draw without replacement
    pub fn pick_photos(&mut self, count: usize, cfg: &ScreenConfig, exclude: &[String], now_ms: u64) -> Vec<Item> {
        let pool = self.candidate_pool(cfg);
        if pool.is_empty() || count == 0 {
            return Vec::new();
        }
        let scores = self.weigh(&pool, cfg, false, now_ms);
        let exclude: HashSet<&str> = exclude.iter().map(String::as_str).collect();

        let mut picked: Vec<usize> = Vec::with_capacity(count);
        while picked.len() < count {
            let candidates: Vec<usize> = (0..pool.len())
                .filter(|i| !picked.contains(i) && !exclude.contains(pool[*i].id.as_str()))
                .collect();
            let Some(index) = self.draw(&pool, &scores, candidates) else {
                break;
            };
            picked.push(index);
        }

        for index in &picked {
            self.bookkeeping.mark_shown(&pool[*index].id, now_ms);
        }
        picked.into_iter().map(|index| pool[index].clone()).collect()
    }

    /// Choose this cycle's hero.
    ///
    /// Items under a live lock held by another display are never returned.
    /// The chosen item is marked as hero-shown and comes with the claim to send.
    pub fn pick_hero_photo(&mut self, cfg: &ScreenConfig, now_ms: u64) -> Option<HeroPick> {
        let pool = self.candidate_pool(cfg);
        if pool.is_empty() {
            return None;
        }
        let cooldown_ms = weights::hero_cooldown_ms(cfg.hero_cooldown_sec, pool.len());
        let scores = self.weigh(&pool, cfg, true, now_ms);

        let eligible: Vec<usize> = (0..pool.len())
            .filter(|i| {
                let item = &pool[*i];
                if let Some(holder) = self.replica.foreign_lock_holder(&item.id, &self.display_id, now_ms) {
                    debug!("Skipping hero {}: locked by display {}", item.id, holder);
                    return false;
                }
                self.bookkeeping
                    .last_hero_shown(&item.id)
                    .map_or(true, |at| now_ms.saturating_sub(at) >= cooldown_ms)
            })
            .collect();

        let index = self.draw(&pool, &scores, eligible)?;
        let item = pool[index].clone();
        self.mark_hero_shown(&item.id, now_ms);

        let claim = ClientMessage::HeroClaim {
            item_id: item.id.clone(),
            ttl_sec: Some(clamp_ttl(Some(cfg.cross_screen_lock_sec))),
            display_id: Some(self.display_id.clone()),
        };
        Some(HeroPick { item, claim })
    }

    pub fn mark_hero_shown(&mut self, item_id: &str, now_ms: u64) {
        self.bookkeeping.mark_hero_shown(item_id, now_ms);
    }

    /// The `count` newest items not in `exclude`, for recent-strip slots
    pub fn pick_newest(&mut self, count: usize, cfg: &ScreenConfig, exclude: &[String], now_ms: u64) -> Vec<Item> {
        let mut pool = self.candidate_pool(cfg);
        pool.sort_by(|a, b| b.added_at.cmp(&a.added_at).then_with(|| a.id.cmp(&b.id)));
        let picked: Vec<Item> = pool
            .into_iter()
            .filter(|item| !exclude.contains(&item.id))
            .take(count)
            .collect();
        for item in &picked {
            self.bookkeeping.mark_shown(&item.id, now_ms);
        }
        picked
    }

    pub fn decay(&mut self, now_ms: u64) -> bool {
        self.bookkeeping.decay(now_ms)
    }
}
