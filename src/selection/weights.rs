//! Pure weight arithmetic for the selection engine.

use rand::Rng;

/// Shows younger than this are penalized
pub const RECENT_WINDOW_MS: u64 = 90_000;
/// Multiplier applied inside the recent window
pub const RECENT_PENALTY: f64 = 0.05;
/// Weight of the oldest item at recency bias 100
pub const MIN_RECENCY_FLOOR: f64 = 0.05;
const FAIRNESS_STEP: f64 = 0.5;
/// Pools at least this large use the configured hero cooldown unscaled
pub const FULL_COOLDOWN_POOL: usize = 10;
const MIN_SCALED_COOLDOWN_SECS: u64 = 5;

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Weight of the oldest item in the pool for a recency bias in 0..=100
pub fn recency_floor(recency_bias: u32) -> f64 {
    lerp(1.0, MIN_RECENCY_FLOOR, f64::from(recency_bias.min(100)) / 100.0)
}

/// Multiplier for the item at `rank` (0 = newest) in a pool of `pool_len`
pub fn recency_multiplier(rank: usize, pool_len: usize, recency_bias: u32) -> f64 {
    if pool_len <= 1 {
        return 1.0;
    }
    let t = rank.min(pool_len - 1) as f64 / (pool_len - 1) as f64;
    lerp(1.0, recency_floor(recency_bias), t)
}

/// `1 / (1 + shows × 0.5)`: strictly decreasing, never zero
pub fn fairness_multiplier(show_count: u32) -> f64 {
    1.0 / (1.0 + f64::from(show_count) * FAIRNESS_STEP)
}

pub fn recent_shown_multiplier(last_shown_at: Option<u64>, now_ms: u64) -> f64 {
    match last_shown_at {
        Some(at) if now_ms.saturating_sub(at) < RECENT_WINDOW_MS => RECENT_PENALTY,
        _ => 1.0,
    }
}

pub fn hero_boost(hero_candidate: bool, boost: f64) -> f64 {
    if hero_candidate && boost.is_finite() && boost > 0.0 {
        boost
    } else {
        1.0
    }
}

/// Hero cooldown for a pool of `pool_len` candidates.
///
/// A single item has no cooldown at all; small pools scale the base down
/// linearly with a floor so a screen never runs out of heroes.
pub fn hero_cooldown_ms(base_secs: u64, pool_len: usize) -> u64 {
    let secs = match pool_len {
        0 | 1 => 0,
        n if n >= FULL_COOLDOWN_POOL => base_secs,
        n => {
            let scaled = (base_secs as f64 * n as f64 / FULL_COOLDOWN_POOL as f64).round() as u64;
            scaled.max(MIN_SCALED_COOLDOWN_SECS).min(base_secs)
        }
    };
    secs * 1000
}

/// Index of one weighted-random draw, or `None` for an empty slice.
///
/// Non-positive or non-finite totals degrade to a uniform draw.
pub fn weighted_index<R: Rng + ?Sized>(rng: &mut R, weights: &[f64]) -> Option<usize> {
    if weights.is_empty() {
        return None;
    }
    let total: f64 = weights.iter().filter(|w| w.is_finite() && **w > 0.0).sum();
    if !(total.is_finite() && total > 0.0) {
        return Some(rng.random_range(0..weights.len()));
    }

    let mut remaining = rng.random::<f64>() * total;
    for (i, w) in weights.iter().enumerate() {
        if !(w.is_finite() && *w > 0.0) {
            continue;
        }
        remaining -= w;
        if remaining <= 0.0 {
            return Some(i);
        }
    }
    weights.iter().rposition(|w| w.is_finite() && *w > 0.0)
}
