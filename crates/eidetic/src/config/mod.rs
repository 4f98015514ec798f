use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{EideticError, Result};
use crate::memory::types::Category;

/// Main configuration structure for Eidetic
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Backend selection and data directory
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Importance scoring parameters
    #[serde(default)]
    pub importance: ImportanceConfig,
    /// Keyword routing table
    #[serde(default)]
    pub router: RouterConfig,
    /// Weight boost and decay parameters
    #[serde(default)]
    pub weight: WeightConfig,
    /// Background consolidation cycles
    #[serde(default)]
    pub consolidation: ConsolidationConfig,
    /// Hybrid recall parameters
    #[serde(default)]
    pub recall: RecallConfig,
    /// Relationship defaults
    #[serde(default)]
    pub relationships: RelationshipConfig,
    /// Pattern finder parameters
    #[serde(default)]
    pub patterns: PatternConfig,
    /// HTTP API configuration
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from `path`, or from the first default location
    /// that exists: `~/.eidetic/config.toml`, `<config_dir>/eidetic/config.toml`,
    /// `./config.toml`. Falls back to defaults when none is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_paths = [
                    dirs::home_dir().map(|h| h.join(".eidetic").join("config.toml")),
                    dirs::config_dir().map(|c| c.join("eidetic").join("config.toml")),
                    Some(PathBuf::from("config.toml")),
                ];

                match default_paths.iter().flatten().find(|p| p.exists()) {
                    Some(found) => Self::from_file(found)?,
                    None => {
                        tracing::info!("No config file found, using defaults");
                        Config::default()
                    }
                }
            }
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            EideticError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| EideticError::Config(format!("Failed to parse config: {e}")))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| EideticError::Config(format!("Failed to serialize config: {e}")))
    }

    /// Reject values that would break the engine's invariants
    pub fn validate(&self) -> Result<()> {
        fn unit(name: &str, value: f32) -> Result<()> {
            if (0.0..=1.0).contains(&value) {
                Ok(())
            } else {
                Err(EideticError::Config(format!(
                    "{name} must be within [0, 1], got {value}"
                )))
            }
        }

        fn positive(name: &str, value: f64) -> Result<()> {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(EideticError::Config(format!(
                    "{name} must be positive, got {value}"
                )))
            }
        }

        if self.embedding.dimension == 0 {
            return Err(EideticError::Config(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.embedding.provider == EmbeddingProviderKind::Remote
            && self.embedding.remote.api_url.trim().is_empty()
        {
            return Err(EideticError::Config(
                "embedding.remote.api_url is required when provider = \"remote\"".to_string(),
            ));
        }

        positive(
            "importance.recency_half_life_hours",
            self.importance.recency_half_life_hours as f64,
        )?;
        let weights = &self.importance.factor_weights;
        let factor_values = weights.as_array();
        if factor_values.iter().any(|w| *w < 0.0 || w.is_nan()) {
            return Err(EideticError::Config(
                "importance.factor_weights must be non-negative".to_string(),
            ));
        }
        if factor_values.iter().sum::<f32>() <= 0.0 {
            return Err(EideticError::Config(
                "importance.factor_weights must not all be zero".to_string(),
            ));
        }

        for rule in &self.router.rules {
            if rule.keywords.iter().all(|k| k.trim().is_empty()) {
                return Err(EideticError::Config(format!(
                    "router rule for {} has no keywords",
                    rule.category
                )));
            }
        }

        unit("weight.frequency_boost", self.weight.frequency_boost)?;
        unit("weight.initial_weight", self.weight.initial_weight)?;
        positive(
            "weight.decay_half_life_hours",
            self.weight.decay_half_life_hours as f64,
        )?;

        unit("consolidation.blend_alpha", self.consolidation.blend_alpha)?;
        unit("consolidation.reinforcement", self.consolidation.reinforcement)?;
        positive(
            "consolidation.sws_interval_secs",
            self.consolidation.sws_interval_secs as f64,
        )?;
        positive(
            "consolidation.rem_interval_secs",
            self.consolidation.rem_interval_secs as f64,
        )?;

        unit("recall.similarity_weight", self.recall.similarity_weight)?;
        unit("recall.importance_weight", self.recall.importance_weight)?;
        unit("recall.graph_threshold", self.recall.graph_threshold)?;
        if self.recall.max_results_limit == 0
            || self.recall.default_max_results == 0
            || self.recall.default_max_results > self.recall.max_results_limit
        {
            return Err(EideticError::Config(
                "recall.default_max_results must be within 1..=recall.max_results_limit"
                    .to_string(),
            ));
        }
        if self.recall.cache_capacity == 0 || self.embedding.cache_capacity == 0 {
            return Err(EideticError::Config(
                "cache capacities must be greater than zero".to_string(),
            ));
        }

        unit(
            "relationships.default_strength",
            self.relationships.default_strength,
        )?;
        unit(
            "patterns.similarity_threshold",
            self.patterns.similarity_threshold,
        )?;

        if self.storage.scratch_capacity == 0 {
            return Err(EideticError::Config(
                "storage.scratch_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Which implementation holds the authoritative records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PrimaryBackend {
    /// LanceDB tables under `data_dir`
    #[default]
    Lance,
    /// Process-local maps, lost on exit
    Memory,
}

/// Storage backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory for all storage data
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Authoritative store implementation
    #[serde(default)]
    pub primary: PrimaryBackend,
    /// Maintain a nearest-neighbour index next to the primary store
    #[serde(default = "default_true")]
    pub vector_index: bool,
    /// Episodic scratch backend (LRU with TTL)
    #[serde(default = "default_true")]
    pub scratch: bool,
    /// Procedural graph backend
    #[serde(default = "default_true")]
    pub graph: bool,
    /// Emotional document backend
    #[serde(default = "default_true")]
    pub documents: bool,
    /// Motor event log
    #[serde(default = "default_true")]
    pub event_log: bool,
    /// Maximum entries held by the scratch backend
    #[serde(default = "default_scratch_capacity")]
    pub scratch_capacity: usize,
    /// Scratch entry lifetime in seconds
    #[serde(default = "default_scratch_ttl_secs")]
    pub scratch_ttl_secs: u64,
    /// Maximum events retained by the event log
    #[serde(default = "default_event_log_capacity")]
    pub event_log_capacity: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            primary: PrimaryBackend::default(),
            vector_index: true,
            scratch: true,
            graph: true,
            documents: true,
            event_log: true,
            scratch_capacity: default_scratch_capacity(),
            scratch_ttl_secs: default_scratch_ttl_secs(),
            event_log_capacity: default_event_log_capacity(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".eidetic"))
        .unwrap_or_else(|| PathBuf::from(".eidetic"))
}

fn default_true() -> bool {
    true
}

fn default_scratch_capacity() -> usize {
    1024
}

fn default_scratch_ttl_secs() -> u64 {
    3600
}

fn default_event_log_capacity() -> usize {
    10_000
}

/// Embedding provider selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Deterministic fallback vectors only
    #[default]
    None,
    /// OpenAI-compatible HTTP endpoint
    Remote,
    /// Local ONNX model (requires the `local-embeddings` feature)
    Local,
}

/// Embedding model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub provider: EmbeddingProviderKind,
    /// Vector length produced by every source, including the fallback
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Number of provider results kept in the in-process cache
    #[serde(default = "default_embedding_cache_capacity")]
    pub cache_capacity: usize,
    /// Upper bound on a single provider call before falling back
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub remote: RemoteEmbeddingConfig,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::default(),
            dimension: default_embedding_dimension(),
            cache_capacity: default_embedding_cache_capacity(),
            timeout_ms: default_embedding_timeout_ms(),
            remote: RemoteEmbeddingConfig::default(),
        }
    }
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_cache_capacity() -> usize {
    4096
}

fn default_embedding_timeout_ms() -> u64 {
    5000
}

/// Remote embedding API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteEmbeddingConfig {
    /// Base URL; `/embeddings` is appended
    #[serde(default = "default_remote_api_url")]
    pub api_url: String,
    /// Environment variable name for the API key
    #[serde(default = "default_remote_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_remote_model")]
    pub model: String,
    /// Request timeout in seconds
    #[serde(default = "default_remote_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries on connection errors and 5xx responses
    #[serde(default = "default_remote_max_retries")]
    pub max_retries: u32,
}

impl Default for RemoteEmbeddingConfig {
    fn default() -> Self {
        Self {
            api_url: default_remote_api_url(),
            api_key_env: default_remote_api_key_env(),
            model: default_remote_model(),
            timeout_secs: default_remote_timeout_secs(),
            max_retries: default_remote_max_retries(),
        }
    }
}

fn default_remote_api_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_remote_api_key_env() -> String {
    "EIDETIC_EMBEDDING_API_KEY".to_string()
}

fn default_remote_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_remote_timeout_secs() -> u64 {
    30
}

fn default_remote_max_retries() -> u32 {
    2
}

/// Importance evaluator parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportanceConfig {
    /// e-folding time for the recency factor, in hours
    #[serde(default = "default_recency_half_life_hours")]
    pub recency_half_life_hours: f32,
    #[serde(default = "default_emotional_multiplier")]
    pub emotional_multiplier: f32,
    /// Contribution of each association to the semantic factor
    #[serde(default = "default_semantic_density")]
    pub semantic_density: f32,
    #[serde(default = "default_explicit_multiplier")]
    pub explicit_multiplier: f32,
    /// Weights of the averaged factors
    #[serde(default)]
    pub factor_weights: FactorWeights,
    /// Words that mark content as emotionally significant
    #[serde(default = "default_emotional_lexicon")]
    pub emotional_lexicon: Vec<String>,
}

impl Default for ImportanceConfig {
    fn default() -> Self {
        Self {
            recency_half_life_hours: default_recency_half_life_hours(),
            emotional_multiplier: default_emotional_multiplier(),
            semantic_density: default_semantic_density(),
            explicit_multiplier: default_explicit_multiplier(),
            factor_weights: FactorWeights::default(),
            emotional_lexicon: default_emotional_lexicon(),
        }
    }
}

fn default_recency_half_life_hours() -> f32 {
    24.0
}

fn default_emotional_multiplier() -> f32 {
    2.0
}

fn default_semantic_density() -> f32 {
    0.1
}

fn default_explicit_multiplier() -> f32 {
    3.0
}

fn default_emotional_lexicon() -> Vec<String> {
    [
        "love", "hate", "happy", "sad", "angry", "afraid", "fear", "excited", "joy", "grief",
        "anxious", "proud", "ashamed", "grateful", "lonely", "furious", "thrilled", "upset",
        "worried", "delighted", "heartbroken", "terrified", "amazing", "awful",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Relative weights of the importance factors (unweighted mean by default)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeights {
    #[serde(default = "default_factor_weight")]
    pub recency: f32,
    #[serde(default = "default_factor_weight")]
    pub frequency: f32,
    #[serde(default = "default_factor_weight")]
    pub emotional: f32,
    #[serde(default = "default_factor_weight")]
    pub semantic: f32,
    #[serde(default = "default_factor_weight")]
    pub explicit: f32,
    #[serde(default = "default_factor_weight")]
    pub procedural: f32,
    #[serde(default = "default_factor_weight")]
    pub contextual: f32,
}

impl FactorWeights {
    /// Weights in factor order: recency, frequency, emotional, semantic,
    /// explicit, procedural, contextual
    pub fn as_array(&self) -> [f32; 7] {
        [
            self.recency,
            self.frequency,
            self.emotional,
            self.semantic,
            self.explicit,
            self.procedural,
            self.contextual,
        ]
    }
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            recency: default_factor_weight(),
            frequency: default_factor_weight(),
            emotional: default_factor_weight(),
            semantic: default_factor_weight(),
            explicit: default_factor_weight(),
            procedural: default_factor_weight(),
            contextual: default_factor_weight(),
        }
    }
}

fn default_factor_weight() -> f32 {
    1.0
}

/// One ordered routing rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRule {
    pub category: Category,
    pub keywords: Vec<String>,
}

impl RouterRule {
    pub fn new(category: Category, keywords: &[&str]) -> Self {
        Self {
            category,
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Keyword routing table; the first rule with a matching keyword wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Category used when no rule matches
    #[serde(default)]
    pub default_category: Category,
    #[serde(default = "default_router_rules")]
    pub rules: Vec<RouterRule>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_category: Category::default(),
            rules: default_router_rules(),
        }
    }
}

fn default_router_rules() -> Vec<RouterRule> {
    vec![
        RouterRule::new(
            Category::Emotional,
            &[
                "happy", "sad", "excited", "angry", "afraid", "fear", "love", "hate", "felt",
                "feel", "joy", "anxious", "upset", "grateful", "frustrated", "worried", "proud",
                "lonely",
            ],
        ),
        RouterRule::new(
            Category::Procedural,
            &[
                "how to",
                "step",
                "workflow",
                "algorithm",
                "procedure",
                "recipe",
                "install",
                "configure",
                "process",
            ],
        ),
        RouterRule::new(
            Category::Episodic,
            &[
                "yesterday",
                "today",
                "last week",
                "remember when",
                "meeting",
                "happened",
                "this morning",
                "tonight",
            ],
        ),
        RouterRule::new(
            Category::Attention,
            &[
                "urgent", "important", "priority", "asap", "deadline", "alert", "focus",
            ],
        ),
        RouterRule::new(
            Category::Motor,
            &[
                "execute", "run the", "deploy", "trigger", "command", "click", "press",
            ],
        ),
    ]
}

/// Weight boost and decay parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightConfig {
    /// Added to the weight on every access
    #[serde(default = "default_frequency_boost")]
    pub frequency_boost: f32,
    /// Weight halves after this many hours without access or consolidation
    #[serde(default = "default_decay_half_life_hours")]
    pub decay_half_life_hours: f32,
    /// Weight of a newly stored record
    #[serde(default = "default_initial_weight")]
    pub initial_weight: f32,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            frequency_boost: default_frequency_boost(),
            decay_half_life_hours: default_decay_half_life_hours(),
            initial_weight: default_initial_weight(),
        }
    }
}

fn default_frequency_boost() -> f32 {
    0.1
}

fn default_decay_half_life_hours() -> f32 {
    24.0
}

fn default_initial_weight() -> f32 {
    1.0
}

/// Background consolidation cycles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidationConfig {
    /// Start the scheduler with the daemon
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Consolidation (SWS) interval in seconds
    #[serde(default = "default_sws_interval_secs")]
    pub sws_interval_secs: u64,
    /// Deep consolidation (REM) interval in seconds
    #[serde(default = "default_rem_interval_secs")]
    pub rem_interval_secs: u64,
    /// Fraction of normalized importance blended into the weight per cycle
    #[serde(default = "default_blend_alpha")]
    pub blend_alpha: f32,
    /// Strength added to co-recalled relationships by the deep cycle
    #[serde(default = "default_reinforcement")]
    pub reinforcement: f32,
    /// Let the deep cycle re-classify records and move changed ones
    #[serde(default)]
    pub reroute_enabled: bool,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sws_interval_secs: default_sws_interval_secs(),
            rem_interval_secs: default_rem_interval_secs(),
            blend_alpha: default_blend_alpha(),
            reinforcement: default_reinforcement(),
            reroute_enabled: false,
        }
    }
}

fn default_sws_interval_secs() -> u64 {
    90 * 60
}

fn default_rem_interval_secs() -> u64 {
    6 * 60 * 60
}

fn default_blend_alpha() -> f32 {
    0.3
}

fn default_reinforcement() -> f32 {
    0.05
}

/// Hybrid recall parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallConfig {
    /// Weight for similarity in the fused score (0.0-1.0)
    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f32,
    /// Weight for importance in the fused score (0.0-1.0)
    #[serde(default = "default_importance_weight")]
    pub importance_weight: f32,
    #[serde(default = "default_max_results")]
    pub default_max_results: usize,
    /// Largest accepted `max_results`
    #[serde(default = "default_max_results_limit")]
    pub max_results_limit: usize,
    /// Minimum strength for a relationship to be expanded
    #[serde(default = "default_graph_threshold")]
    pub graph_threshold: f32,
    /// Bound on each optional fan-out branch, in milliseconds
    #[serde(default = "default_branch_timeout_ms")]
    pub branch_timeout_ms: u64,
    /// Most recent observations attached to each hit
    #[serde(default = "default_observations_per_result")]
    pub observations_per_result: usize,
    #[serde(default = "default_recall_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_recall_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
    /// Top results whose pairs count as co-recalled
    #[serde(default = "default_co_recall_window")]
    pub co_recall_window: usize,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            similarity_weight: default_similarity_weight(),
            importance_weight: default_importance_weight(),
            default_max_results: default_max_results(),
            max_results_limit: default_max_results_limit(),
            graph_threshold: default_graph_threshold(),
            branch_timeout_ms: default_branch_timeout_ms(),
            observations_per_result: default_observations_per_result(),
            cache_capacity: default_recall_cache_capacity(),
            cache_ttl_secs: default_recall_cache_ttl_secs(),
            co_recall_window: default_co_recall_window(),
        }
    }
}

fn default_similarity_weight() -> f32 {
    0.7
}

fn default_importance_weight() -> f32 {
    0.3
}

fn default_max_results() -> usize {
    20
}

fn default_max_results_limit() -> usize {
    200
}

fn default_graph_threshold() -> f32 {
    0.5
}

fn default_branch_timeout_ms() -> u64 {
    2000
}

fn default_observations_per_result() -> usize {
    5
}

fn default_recall_cache_capacity() -> usize {
    512
}

fn default_recall_cache_ttl_secs() -> u64 {
    300
}

fn default_co_recall_window() -> usize {
    10
}

/// Relationship defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationshipConfig {
    #[serde(default = "default_relationship_strength")]
    pub default_strength: f32,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            default_strength: default_relationship_strength(),
        }
    }
}

fn default_relationship_strength() -> f32 {
    0.7
}

/// Pattern finder parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Minimum pairwise cosine similarity inside a cluster
    #[serde(default = "default_pattern_similarity")]
    pub similarity_threshold: f32,
    /// Records examined per call
    #[serde(default = "default_pattern_max_scan")]
    pub max_scan: usize,
    /// Clusters returned per call
    #[serde(default = "default_pattern_max_clusters")]
    pub max_clusters: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_pattern_similarity(),
            max_scan: default_pattern_max_scan(),
            max_clusters: default_pattern_max_clusters(),
        }
    }
}

fn default_pattern_similarity() -> f32 {
    0.85
}

fn default_pattern_max_scan() -> usize {
    500
}

fn default_pattern_max_clusters() -> usize {
    10
}

/// HTTP API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:7777")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:7777".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.storage.primary, PrimaryBackend::Lance);
        assert!(config.storage.vector_index);
        assert_eq!(config.embedding.provider, EmbeddingProviderKind::None);
        assert_eq!(config.embedding.dimension, 384);
        assert_eq!(config.importance.recency_half_life_hours, 24.0);
        assert_eq!(config.importance.emotional_multiplier, 2.0);
        assert_eq!(config.importance.explicit_multiplier, 3.0);
        assert_eq!(config.router.default_category, Category::Semantic);
        assert_eq!(config.router.rules.len(), 5);
        assert_eq!(config.router.rules[0].category, Category::Emotional);
        assert!((config.weight.frequency_boost - 0.1).abs() < f32::EPSILON);
        assert_eq!(config.weight.initial_weight, 1.0);
        assert_eq!(config.consolidation.sws_interval_secs, 5400);
        assert_eq!(config.consolidation.rem_interval_secs, 21600);
        assert!(!config.consolidation.reroute_enabled);
        assert_eq!(config.recall.default_max_results, 20);
        assert_eq!(config.recall.max_results_limit, 200);
        assert!((config.relationships.default_strength - 0.7).abs() < f32::EPSILON);
        assert!((config.patterns.similarity_threshold - 0.85).abs() < f32::EPSILON);
        assert_eq!(config.server.listen_addr, "127.0.0.1:7777");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[storage]
data_dir = "/tmp/eidetic"
primary = "memory"
vector_index = false
scratch_ttl_secs = 60

[embedding]
provider = "remote"
dimension = 256

[embedding.remote]
api_url = "http://localhost:8080/v1"
model = "nomic-embed-text"

[weight]
frequency_boost = 0.2

[consolidation]
enabled = false
blend_alpha = 0.5

[recall]
graph_threshold = 0.6

[server]
listen_addr = "0.0.0.0:8080"
"#;

        let config = Config::from_toml(toml_str).expect("Failed to parse TOML");

        assert_eq!(config.storage.data_dir, PathBuf::from("/tmp/eidetic"));
        assert_eq!(config.storage.primary, PrimaryBackend::Memory);
        assert!(!config.storage.vector_index);
        assert!(config.storage.graph);
        assert_eq!(config.storage.scratch_ttl_secs, 60);

        assert_eq!(config.embedding.provider, EmbeddingProviderKind::Remote);
        assert_eq!(config.embedding.dimension, 256);
        assert_eq!(config.embedding.remote.api_url, "http://localhost:8080/v1");
        assert_eq!(config.embedding.remote.model, "nomic-embed-text");
        assert_eq!(
            config.embedding.remote.api_key_env,
            "EIDETIC_EMBEDDING_API_KEY"
        );

        assert!((config.weight.frequency_boost - 0.2).abs() < f32::EPSILON);
        assert!(!config.consolidation.enabled);
        assert!((config.consolidation.blend_alpha - 0.5).abs() < f32::EPSILON);
        assert!((config.recall.graph_threshold - 0.6).abs() < f32::EPSILON);
        assert_eq!(config.server.listen_addr, "0.0.0.0:8080");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_router_rules_from_toml() {
        let toml_str = r#"
[router]
default_category = "episodic"

[[router.rules]]
category = "motor"
keywords = ["reboot"]

[[router.rules]]
category = "emotional"
keywords = ["sigh"]
"#;

        let config = Config::from_toml(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.router.default_category, Category::Episodic);
        assert_eq!(config.router.rules.len(), 2);
        assert_eq!(config.router.rules[0].category, Category::Motor);
        assert_eq!(config.router.rules[1].keywords, vec!["sigh".to_string()]);
    }

    #[test]
    fn test_partial_factor_weights() {
        let toml_str = r#"
[importance.factor_weights]
recency = 2.0
"#;

        let config = Config::from_toml(toml_str).expect("Failed to parse TOML");
        assert_eq!(config.importance.factor_weights.recency, 2.0);
        assert_eq!(config.importance.factor_weights.contextual, 1.0);
        assert!(!config.importance.emotional_lexicon.is_empty());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.consolidation.blend_alpha = 1.5;
        assert!(matches!(config.validate(), Err(EideticError::Config(_))));

        let mut config = Config::default();
        config.embedding.dimension = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.recall.default_max_results = 500;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.embedding.provider = EmbeddingProviderKind::Remote;
        config.embedding.remote.api_url = String::new();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.importance.factor_weights = FactorWeights {
            recency: 0.0,
            frequency: 0.0,
            emotional: 0.0,
            semantic: 0.0,
            explicit: 0.0,
            procedural: 0.0,
            contextual: 0.0,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_toml_is_config_error() {
        let result = Config::from_toml("[storage\nprimary = ");
        assert!(matches!(result, Err(EideticError::Config(_))));

        let result = Config::from_toml("[storage]\nprimary = \"postgres\"");
        assert!(matches!(result, Err(EideticError::Config(_))));
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \"127.0.0.1:9000\"\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_load_missing_path_fails() {
        let result = Config::load(Some(Path::new("/nonexistent/eidetic/config.toml")));
        assert!(matches!(result, Err(EideticError::Config(_))));
    }

    #[test]
    fn test_to_toml_round_trip() {
        let config = Config::default();
        let text = config.to_toml().unwrap();
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.router.rules, config.router.rules);
        assert_eq!(back.embedding.dimension, config.embedding.dimension);
    }
}
