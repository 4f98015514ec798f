//! Category routing
//!
//! Decides which storage category new content belongs to. The
//! [`KeywordRouter`] walks an ordered rule table and picks the first rule
//! with a keyword appearing in the content (case-insensitive substring);
//! anything else goes to the default category. Other classifiers plug in
//! through [`CategoryClassifier`].

use crate::config::RouterConfig;
use crate::memory::types::Category;

/// Anything that can assign a category to content
pub trait CategoryClassifier: Send + Sync {
    fn classify(&self, content_type: &str, content: &str) -> Category;

    /// Classifier name for logs and stats
    fn name(&self) -> &'static str;
}

/// Outcome of routing, including the keyword that decided it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub category: Category,
    /// `None` when the default category was used
    pub matched_keyword: Option<String>,
}

#[derive(Debug, Clone)]
struct CompiledRule {
    category: Category,
    keywords: Vec<String>,
}

/// First-match keyword router
#[derive(Debug, Clone)]
pub struct KeywordRouter {
    rules: Vec<CompiledRule>,
    default_category: Category,
}

impl KeywordRouter {
    pub fn new(config: &RouterConfig) -> Self {
        let rules = config
            .rules
            .iter()
            .map(|rule| CompiledRule {
                category: rule.category,
                keywords: rule
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
            })
            .collect();

        Self {
            rules,
            default_category: config.default_category,
        }
    }

    pub fn default_category(&self) -> Category {
        self.default_category
    }

    pub fn route(&self, content: &str) -> RouteDecision {
        let lowered = content.to_lowercase();

        for rule in &self.rules {
            if let Some(keyword) = rule.keywords.iter().find(|k| lowered.contains(k.as_str())) {
                return RouteDecision {
                    category: rule.category,
                    matched_keyword: Some(keyword.clone()),
                };
            }
        }

        RouteDecision {
            category: self.default_category,
            matched_keyword: None,
        }
    }
}

impl Default for KeywordRouter {
    fn default() -> Self {
        Self::new(&RouterConfig::default())
    }
}

impl CategoryClassifier for KeywordRouter {
    fn classify(&self, _content_type: &str, content: &str) -> Category {
        let decision = self.route(content);
        tracing::debug!(
            category = %decision.category,
            keyword = decision.matched_keyword.as_deref().unwrap_or("-"),
            "Routed content"
        );
        decision.category
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}
