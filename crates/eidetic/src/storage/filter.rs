//! Filter types for record queries
//!
//! Narrows queries by entity type, category, minimum weight and text. The
//! same filter is evaluated in-process ([`RecordFilter::matches`]) and
//! rendered to SQL for LanceDB ([`RecordFilter::to_sql_clause`]).

use crate::memory::types::{Category, MemoryRecord};

/// Filter criteria for record queries.
///
/// All fields are optional - when `None`, that filter is not applied.
/// Multiple filters are combined with AND logic.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub entity_type: Option<String>,
    pub category: Option<Category>,
    /// Minimum weight threshold (inclusive)
    pub min_weight: Option<f32>,
    /// Case-insensitive substring of name or content
    pub text: Option<String>,
    /// Maximum number of records returned
    pub limit: Option<usize>,
}

impl RecordFilter {
    /// Create a new empty filter (no filtering applied)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_min_weight(mut self, min_weight: f32) -> Self {
        self.min_weight = Some(min_weight);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Filter on entity type and category only
    pub fn scope(entity_type: Option<&str>, category: Option<Category>) -> Self {
        Self {
            entity_type: entity_type.map(str::to_string),
            category,
            ..Self::default()
        }
    }

    /// Whether `record` passes every predicate (the limit is not a predicate)
    pub fn matches(&self, record: &MemoryRecord) -> bool {
        if let Some(entity_type) = &self.entity_type {
            if &record.entity_type != entity_type {
                return false;
            }
        }

        if let Some(category) = self.category {
            if record.category != category {
                return false;
            }
        }

        if let Some(min_weight) = self.min_weight {
            if record.weight() < min_weight {
                return false;
            }
        }

        if let Some(text) = &self.text {
            let needle = text.to_lowercase();
            if !record.content.to_lowercase().contains(&needle)
                && !record.name.to_lowercase().contains(&needle)
            {
                return false;
            }
        }

        true
    }

    /// Build a SQL WHERE clause from this filter.
    /// Returns `None` if no predicates are set.
    pub fn to_sql_clause(&self) -> Option<String> {
        let mut conditions = Vec::new();

        if let Some(entity_type) = &self.entity_type {
            conditions.push(format!("entity_type = '{}'", escape_sql(entity_type)));
        }

        if let Some(category) = self.category {
            conditions.push(format!("category = '{}'", category.as_str()));
        }

        if let Some(min_weight) = self.min_weight {
            conditions.push(format!("weight >= {min_weight}"));
        }

        if let Some(text) = &self.text {
            let pattern = escape_like(&text.to_lowercase());
            conditions.push(format!(
                "(lower(content) LIKE '%{pattern}%' OR lower(name) LIKE '%{pattern}%')"
            ));
        }

        if conditions.is_empty() {
            None
        } else {
            Some(conditions.join(" AND "))
        }
    }
}

/// Escape a string literal for a single-quoted SQL string
pub(crate) fn escape_sql(value: &str) -> String {
    value.replace('\'', "''")
}

/// Escape a string for use inside a LIKE pattern. LIKE wildcards in user
/// text are dropped rather than escaped.
fn escape_like(value: &str) -> String {
    escape_sql(value).replace(['%', '_'], "")
}
