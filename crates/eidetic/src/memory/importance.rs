//! Multi-factor importance scoring
//!
//! The composite importance of a record is a weighted average of seven
//! factors:
//! - recency: `exp(-age_hours / recency_half_life_hours)`
//! - frequency: `ln(access_count + 1)`
//! - emotional: `emotional_significance * emotional_multiplier`
//! - semantic: `associations * semantic_density`
//! - explicit: `user_rating * explicit_multiplier`
//! - procedural: `skill_relevance`
//! - contextual: the caller's relevance boost
//!
//! The composite is never negative but is not bounded above; use
//! [`ImportanceComponents::normalized`] where a value in [0, 1] is needed.

use chrono::{DateTime, Utc};

use crate::config::ImportanceConfig;
use crate::memory::types::{
    ImportanceComponents, META_EMOTIONAL_SIGNIFICANCE, MemoryRecord, clamp_unit, metadata_number,
};

/// Lexicon hits at which emotional significance saturates at 1.0
const EMOTIONAL_SATURATION_HITS: f32 = 4.0;

/// Per-call context for importance evaluation
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImportanceContext {
    /// Extra relevance contributed by the current query
    pub relevance_boost: f32,
}

impl ImportanceContext {
    pub fn with_relevance(relevance_boost: f32) -> Self {
        Self { relevance_boost }
    }
}

/// Computes importance components for records
#[derive(Debug, Clone)]
pub struct ImportanceEvaluator {
    config: ImportanceConfig,
    lexicon: Vec<String>,
}

impl ImportanceEvaluator {
    pub fn new(config: ImportanceConfig) -> Self {
        let lexicon = config
            .emotional_lexicon
            .iter()
            .map(|w| w.trim().to_lowercase())
            .filter(|w| !w.is_empty())
            .collect();
        Self { config, lexicon }
    }

    pub fn config(&self) -> &ImportanceConfig {
        &self.config
    }

    /// Evaluate every factor for `record` as of `now`
    pub fn evaluate(
        &self,
        record: &MemoryRecord,
        context: Option<&ImportanceContext>,
        now: DateTime<Utc>,
    ) -> ImportanceComponents {
        let cfg = &self.config;

        // Clock skew can put created_at slightly in the future
        let age_hours = ((now - record.created_at).num_milliseconds() as f32 / 3_600_000.0).max(0.0);

        let mut components = ImportanceComponents {
            recency: (-age_hours / cfg.recency_half_life_hours).exp(),
            frequency: ((record.access_count as f64) + 1.0).ln() as f32,
            emotional: clamp_unit(record.emotional_significance) * cfg.emotional_multiplier,
            semantic: record.associations.len() as f32 * cfg.semantic_density,
            explicit: record.user_rating() * cfg.explicit_multiplier,
            procedural: record.skill_relevance(),
            contextual: context.map(|c| c.relevance_boost).unwrap_or(0.0),
            composite: 0.0,
        };
        components.composite = self.combine(&components);
        components
    }

    fn combine(&self, c: &ImportanceComponents) -> f32 {
        let values = [
            c.recency,
            c.frequency,
            c.emotional,
            c.semantic,
            c.explicit,
            c.procedural,
            c.contextual,
        ];
        let weights = self.config.factor_weights.as_array();

        let total_weight: f32 = weights.iter().sum();
        if total_weight <= 0.0 {
            return 0.0;
        }

        let weighted: f32 = values
            .iter()
            .zip(weights.iter())
            .map(|(v, w)| if v.is_finite() { v * w } else { 0.0 })
            .sum();

        (weighted / total_weight).max(0.0)
    }

    /// Emotional significance for new content: the caller's metadata value
    /// when present, otherwise a lexicon estimate.
    pub fn emotional_significance(
        &self,
        content: &str,
        metadata: &serde_json::Map<String, serde_json::Value>,
    ) -> f32 {
        match metadata_number(metadata, META_EMOTIONAL_SIGNIFICANCE) {
            Some(value) => clamp_unit(value),
            None => self.estimate_emotional_significance(content),
        }
    }

    /// Distinct lexicon words present in `content`, scaled into [0, 1]
    pub fn estimate_emotional_significance(&self, content: &str) -> f32 {
        let words: Vec<String> = content
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .map(str::to_lowercase)
            .collect();

        let hits = self
            .lexicon
            .iter()
            .filter(|entry| words.iter().any(|w| w.starts_with(entry.as_str())))
            .count() as f32;

        (hits / EMOTIONAL_SATURATION_HITS).min(1.0)
    }
}

impl Default for ImportanceEvaluator {
    fn default() -> Self {
        Self::new(ImportanceConfig::default())
    }
}
