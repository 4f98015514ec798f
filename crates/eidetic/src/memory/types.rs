//! Memory types for the Eidetic engine
//!
//! Defines the persisted record, its importance components, observations,
//! relationships and the storage categories a record can be routed to.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::EideticError;

/// Metadata key holding an explicit user rating (number)
pub const META_USER_RATING: &str = "user_rating";
/// Metadata key holding a caller-supplied emotional significance in [0, 1]
pub const META_EMOTIONAL_SIGNIFICANCE: &str = "emotional_significance";
/// Metadata key holding procedural/skill relevance (number)
pub const META_SKILL_RELEVANCE: &str = "skill_relevance";

/// Storage category a record is routed to.
///
/// Each category maps to a backend capability class: scratch key-value,
/// durable structured storage, a typed-edge graph, flexible documents, a
/// nearest-neighbour index or an append-only event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    /// What happened (events, conversations)
    Episodic,
    /// Facts and knowledge
    Semantic,
    /// How to do things
    Procedural,
    /// Feelings and affect-laden content
    Emotional,
    /// Urgent or salient items
    Attention,
    /// Actions and commands
    Motor,
}

impl Category {
    pub const ALL: [Category; 6] = [
        Category::Episodic,
        Category::Semantic,
        Category::Procedural,
        Category::Emotional,
        Category::Attention,
        Category::Motor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Episodic => "episodic",
            Category::Semantic => "semantic",
            Category::Procedural => "procedural",
            Category::Emotional => "emotional",
            Category::Attention => "attention",
            Category::Motor => "motor",
        }
    }
}

impl Default for Category {
    fn default() -> Self {
        Category::Semantic
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = EideticError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "episodic" => Ok(Category::Episodic),
            "semantic" => Ok(Category::Semantic),
            "procedural" => Ok(Category::Procedural),
            "emotional" => Ok(Category::Emotional),
            "attention" => Ok(Category::Attention),
            "motor" => Ok(Category::Motor),
            other => Err(EideticError::Validation(format!("Unknown category: {other}"))),
        }
    }
}

/// Named reference points on the weight spectrum. Used for reporting only;
/// the weight itself is continuous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightBand {
    Dormant,
    DeepStorage,
    Subconscious,
    Effort,
    EasyRecall,
    Conscious,
}

impl WeightBand {
    /// Bands from highest to lowest
    pub const DESCENDING: [WeightBand; 6] = [
        WeightBand::Conscious,
        WeightBand::EasyRecall,
        WeightBand::Effort,
        WeightBand::Subconscious,
        WeightBand::DeepStorage,
        WeightBand::Dormant,
    ];

    pub fn value(&self) -> f32 {
        match self {
            WeightBand::Conscious => 1.0,
            WeightBand::EasyRecall => 0.8,
            WeightBand::Effort => 0.5,
            WeightBand::Subconscious => 0.2,
            WeightBand::DeepStorage => 0.05,
            WeightBand::Dormant => 0.0,
        }
    }

    /// The nearest band at or below `weight`
    pub fn for_weight(weight: f32) -> WeightBand {
        Self::DESCENDING
            .into_iter()
            .find(|band| weight >= band.value())
            .unwrap_or(WeightBand::Dormant)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WeightBand::Conscious => "conscious",
            WeightBand::EasyRecall => "easy_recall",
            WeightBand::Effort => "effort",
            WeightBand::Subconscious => "subconscious",
            WeightBand::DeepStorage => "deep_storage",
            WeightBand::Dormant => "dormant",
        }
    }
}

/// Per-factor importance scores plus the derived composite.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ImportanceComponents {
    pub recency: f32,
    pub frequency: f32,
    pub emotional: f32,
    pub semantic: f32,
    pub explicit: f32,
    pub procedural: f32,
    pub contextual: f32,
    /// Weighted average of the factors, always >= 0
    pub composite: f32,
}

impl ImportanceComponents {
    /// Composite importance mapped into [0, 1]
    pub fn normalized(&self) -> f32 {
        if self.composite.is_nan() {
            return 0.0;
        }
        self.composite.clamp(0.0, 1.0)
    }
}

/// A single memory record. Records are never deleted; a weight near zero
/// means dormant, not gone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Stable identifier, unchanged across updates
    pub id: Uuid,
    pub entity_type: String,
    pub name: String,
    pub content: String,
    pub content_type: String,
    pub embedding: Vec<f32>,
    /// Set at creation, changed only through an audited re-route
    pub category: Category,
    weight: f32,
    /// Cached importance, refreshed on access and before ranking
    pub importance: ImportanceComponents,
    pub emotional_significance: f32,
    pub access_count: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub consolidated_at: Option<DateTime<Utc>>,
    pub created_by: String,
    /// Related record id -> cached relationship strength
    pub associations: BTreeMap<Uuid, f32>,
    pub metadata: Map<String, Value>,
}

impl MemoryRecord {
    /// Create a new record at full weight
    pub fn new(
        entity_type: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
        embedding: Vec<f32>,
        category: Category,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            entity_type: entity_type.into(),
            name: name.into(),
            content: content.into(),
            content_type: "text".to_string(),
            embedding,
            category,
            weight: 1.0,
            importance: ImportanceComponents::default(),
            emotional_significance: 0.0,
            access_count: 0,
            created_at: now,
            updated_at: now,
            last_accessed: now,
            consolidated_at: None,
            created_by: "system".to_string(),
            associations: BTreeMap::new(),
            metadata: Map::new(),
        }
    }

    pub fn weight(&self) -> f32 {
        self.weight
    }

    /// Set the weight, clamped to [0, 1]. NaN collapses to 0.
    pub fn set_weight(&mut self, weight: f32) {
        self.weight = if weight.is_nan() {
            0.0
        } else {
            weight.clamp(0.0, 1.0)
        };
    }

    pub fn band(&self) -> WeightBand {
        WeightBand::for_weight(self.weight)
    }

    pub fn is_dormant(&self) -> bool {
        self.band() == WeightBand::Dormant
    }

    /// Count one access: bump the counter, stamp the time and boost the weight
    pub fn register_access(&mut self, boost: f32, at: DateTime<Utc>) {
        self.access_count = self.access_count.saturating_add(1);
        self.last_accessed = at;
        self.set_weight(self.weight + boost);
    }

    /// Text used to embed this record
    pub fn embedding_text(&self) -> String {
        format!("{}: {}", self.name, self.content)
    }

    pub fn user_rating(&self) -> f32 {
        metadata_number(&self.metadata, META_USER_RATING).unwrap_or(0.0)
    }

    pub fn skill_relevance(&self) -> f32 {
        metadata_number(&self.metadata, META_SKILL_RELEVANCE).unwrap_or(0.0)
    }
}

pub(crate) fn metadata_number(metadata: &Map<String, Value>, key: &str) -> Option<f32> {
    metadata.get(key).and_then(Value::as_f64).map(|v| v as f32)
}

/// An append-only note attached to a record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub text: String,
    pub embedding: Vec<f32>,
    pub category: Category,
    pub source: String,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    pub fn new(
        entity_id: Uuid,
        text: impl Into<String>,
        embedding: Vec<f32>,
        category: Category,
        source: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id,
            text: text.into(),
            embedding,
            category,
            source: source.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A typed, strength-weighted directed edge between two records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: Uuid,
    pub from_id: Uuid,
    pub to_id: Uuid,
    pub relation_type: String,
    /// In [0, 1]; only the deep consolidation cycle reinforces it
    pub strength: f32,
    pub properties: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(
        from_id: Uuid,
        to_id: Uuid,
        relation_type: impl Into<String>,
        strength: f32,
        properties: Map<String, Value>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from_id,
            to_id,
            relation_type: relation_type.into(),
            strength: clamp_unit(strength),
            properties,
            created_at: Utc::now(),
        }
    }

    /// Whether this edge has the same `(from, to, type)` identity
    pub fn same_edge(&self, from_id: Uuid, to_id: Uuid, relation_type: &str) -> bool {
        self.from_id == from_id && self.to_id == to_id && self.relation_type == relation_type
    }
}

pub(crate) fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}
