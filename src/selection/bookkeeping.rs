use std::collections::HashMap;

/// Plain shows older than this are forgotten on decay
pub const SHOW_MEMORY_MS: u64 = 10 * 60 * 1000;
/// Hero shows older than this are forgotten on decay
pub const HERO_MEMORY_MS: u64 = 15 * 60 * 1000;
/// Counters are halved once any of them passes this
pub const SHOW_COUNT_CEILING: u32 = 200;

/// Per-display memory of what was shown and when
#[derive(Debug, Default, Clone)]
pub struct Bookkeeping {
    last_shown: HashMap<String, u64>,
    hero_shown_at: HashMap<String, u64>,
    show_counts: HashMap<String, u32>,
}

impl Bookkeeping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_shown(&mut self, id: &str, now_ms: u64) {
        self.last_shown.insert(id.to_string(), now_ms);
        *self.show_counts.entry(id.to_string()).or_insert(0) += 1;
    }

    /// A hero show also counts as a regular show
    pub fn mark_hero_shown(&mut self, id: &str, now_ms: u64) {
        self.hero_shown_at.insert(id.to_string(), now_ms);
        self.mark_shown(id, now_ms);
    }

    pub fn last_shown(&self, id: &str) -> Option<u64> {
        self.last_shown.get(id).copied()
    }

    pub fn last_hero_shown(&self, id: &str) -> Option<u64> {
        self.hero_shown_at.get(id).copied()
    }

    pub fn show_count(&self, id: &str) -> u32 {
        self.show_counts.get(id).copied().unwrap_or(0)
    }

    pub fn forget(&mut self, id: &str) {
        self.last_shown.remove(id);
        self.hero_shown_at.remove(id);
        self.show_counts.remove(id);
    }

    /// Drop everything recorded for ids that fail `keep`
    pub fn retain<F>(&mut self, keep: F)
    where
        F: Fn(&str) -> bool,
    {
        self.last_shown.retain(|id, _| keep(id));
        self.hero_shown_at.retain(|id, _| keep(id));
        self.show_counts.retain(|id, _| keep(id));
    }

    pub fn clear(&mut self) {
        self.last_shown.clear();
        self.hero_shown_at.clear();
        self.show_counts.clear();
    }

    /// Evict stale timestamps and halve counters past the ceiling.
    /// Returns true if the counters were halved.
    pub fn decay(&mut self, now_ms: u64) -> bool {
        self.last_shown
            .retain(|_, at| now_ms.saturating_sub(*at) <= SHOW_MEMORY_MS);
        self.hero_shown_at
            .retain(|_, at| now_ms.saturating_sub(*at) <= HERO_MEMORY_MS);

        let max = self.show_counts.values().copied().max().unwrap_or(0);
        if max > SHOW_COUNT_CEILING {
            for count in self.show_counts.values_mut() {
                *count /= 2;
            }
            true
        } else {
            false
        }
    }
}
