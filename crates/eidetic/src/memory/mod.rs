//! Memory types and operations
//!
//! Records and their importance, weight dynamics, hybrid recall, pattern
//! finding and the consolidation cycles.

pub mod consolidation;
pub mod importance;
pub mod patterns;
pub mod recall;
pub mod types;
pub mod weight;

pub use consolidation::{
    CoRecallTracker, ConsolidationReport, ConsolidationScheduler, Consolidator, CycleKind,
};
pub use importance::{ImportanceContext, ImportanceEvaluator};
pub use patterns::{Cluster, ClusterMember, ClusterMethod, PatternFinder, PatternRequest, PatternResponse};
pub use recall::{MatchType, RecallPipeline, RecallRequest, RecallResponse, RecallResult};
pub use types::{
    Category, ImportanceComponents, MemoryRecord, Observation, Relationship, WeightBand,
};
pub use weight::{WeightEngine, WeightTransform, decay_factor};
