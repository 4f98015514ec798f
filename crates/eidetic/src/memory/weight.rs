//! Weight dynamics: access boost, time decay and consolidation blending
//!
//! Weight is a continuous retrievability score in [0, 1]. It never causes
//! deletion. Access raises it by a fixed boost; consolidation blends it
//! toward normalized importance and then applies half-life decay for the
//! time elapsed since the record was last touched.

use chrono::{DateTime, Utc};

use crate::config::WeightConfig;
use crate::memory::types::{MemoryRecord, clamp_unit};

/// Decay multiplier for `elapsed_hours` under a half-life of `half_life_hours`.
///
/// Always within (0, 1]; a non-positive elapsed time yields 1.0.
pub fn decay_factor(elapsed_hours: f32, half_life_hours: f32) -> f32 {
    if elapsed_hours <= 0.0 || !elapsed_hours.is_finite() {
        return 1.0;
    }
    if half_life_hours <= 0.0 {
        return 0.0;
    }
    0.5f32.powf(elapsed_hours / half_life_hours)
}

/// Weight after one access
pub fn boosted_weight(weight: f32, boost: f32) -> f32 {
    clamp_unit(weight + boost)
}

/// The instant decay is measured from: the later of last access and last
/// consolidation, so successive cycles never charge the same interval twice.
pub fn decay_anchor(record: &MemoryRecord) -> DateTime<Utc> {
    match record.consolidated_at {
        Some(consolidated) if consolidated > record.last_accessed => consolidated,
        _ => record.last_accessed,
    }
}

/// Hours of decay owed by `record` at `now`
pub fn elapsed_hours(record: &MemoryRecord, now: DateTime<Utc>) -> f32 {
    let millis = (now - decay_anchor(record)).num_milliseconds();
    (millis as f32 / 3_600_000.0).max(0.0)
}

/// A single consolidation step for one record: blend toward the target
/// importance, then decay.
///
/// With `blend_alpha`, `target` and `weight` in [0, 1] and a decay factor in
/// [0, 1], the result stays in [0, 1]; it is clamped anyway.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WeightTransform {
    pub blend_alpha: f32,
    pub target: f32,
    pub decay_factor: f32,
}

impl WeightTransform {
    pub fn apply(&self, weight: f32) -> f32 {
        let alpha = clamp_unit(self.blend_alpha);
        let blended = (1.0 - alpha) * clamp_unit(weight) + alpha * clamp_unit(self.target);
        clamp_unit(blended * clamp_unit(self.decay_factor))
    }
}

/// Applies the configured weight dynamics
#[derive(Debug, Clone, Copy)]
pub struct WeightEngine {
    config: WeightConfig,
    blend_alpha: f32,
}

impl WeightEngine {
    pub fn new(config: WeightConfig, blend_alpha: f32) -> Self {
        Self {
            config,
            blend_alpha,
        }
    }

    pub fn config(&self) -> &WeightConfig {
        &self.config
    }

    pub fn frequency_boost(&self) -> f32 {
        self.config.frequency_boost
    }

    pub fn initial_weight(&self) -> f32 {
        clamp_unit(self.config.initial_weight)
    }

    /// Build the consolidation transform for `record` toward `importance`
    /// (normalized, in [0, 1]) as of `now`
    pub fn consolidation_transform(
        &self,
        record: &MemoryRecord,
        importance: f32,
        now: DateTime<Utc>,
    ) -> WeightTransform {
        WeightTransform {
            blend_alpha: self.blend_alpha,
            target: importance,
            decay_factor: decay_factor(
                elapsed_hours(record, now),
                self.config.decay_half_life_hours,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Category;
    use chrono::Duration;

    fn record() -> MemoryRecord {
        MemoryRecord::new("note", "n", "content", vec![0.0; 4], Category::Semantic)
    }

    #[test]
    fn test_decay_factor_half_life() {
        assert_eq!(decay_factor(0.0, 24.0), 1.0);
        assert!((decay_factor(24.0, 24.0) - 0.5).abs() < 1e-6);
        assert!((decay_factor(48.0, 24.0) - 0.25).abs() < 1e-6);
        assert_eq!(decay_factor(-5.0, 24.0), 1.0);
        assert_eq!(decay_factor(5.0, 0.0), 0.0);
    }

    #[test]
    fn test_boosted_weight_caps_at_one() {
        assert!((boosted_weight(0.5, 0.1) - 0.6).abs() < 1e-6);
        assert_eq!(boosted_weight(0.95, 0.1), 1.0);
    }

    #[test]
    fn test_decay_anchor_prefers_latest() {
        let mut r = record();
        let now = Utc::now();
        r.last_accessed = now - Duration::hours(10);
        assert_eq!(decay_anchor(&r), r.last_accessed);

        r.consolidated_at = Some(now - Duration::hours(2));
        assert_eq!(decay_anchor(&r), now - Duration::hours(2));

        r.last_accessed = now - Duration::hours(1);
        assert_eq!(decay_anchor(&r), r.last_accessed);
    }

    #[test]
    fn test_transform_blend_then_decay() {
        let t = WeightTransform {
            blend_alpha: 0.3,
            target: 1.0,
            decay_factor: 1.0,
        };
        assert!((t.apply(0.5) - 0.65).abs() < 1e-6);

        let t = WeightTransform {
            blend_alpha: 0.3,
            target: 0.0,
            decay_factor: 0.5,
        };
        assert!((t.apply(1.0) - 0.35).abs() < 1e-6);
    }

    #[test]
    fn test_transform_stays_in_range() {
        let t = WeightTransform {
            blend_alpha: 2.0,
            target: 7.0,
            decay_factor: 3.0,
        };
        let w = t.apply(1.5);
        assert!((0.0..=1.0).contains(&w));
    }

    #[test]
    fn test_consolidation_transform_uses_elapsed_since_anchor() {
        let engine = WeightEngine::new(WeightConfig::default(), 0.3);
        let now = Utc::now();
        let mut r = record();
        r.last_accessed = now - Duration::hours(24);

        let t = engine.consolidation_transform(&r, 0.0, now);
        assert!((t.decay_factor - 0.5).abs() < 1e-3);

        r.consolidated_at = Some(now);
        let t = engine.consolidation_transform(&r, 0.0, now);
        assert_eq!(t.decay_factor, 1.0);
    }
}
