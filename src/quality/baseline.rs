//! Field-coverage heuristics used when no model-backed collaborators are configured.
//!
//! The evaluator scores three dimensions:
//! - `completeness`: share of recommended top-level keys that are present and non-empty
//! - `patterns`: number of pattern entries relative to a target count
//! - `documentation`: length of the `description` relative to a target length

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::domain::DomainConfig;
use crate::error::CollaboratorError;

use super::collaborators::{Evaluator, Refiner};
use super::score::{Feedback, QualityScore, Suggestion};

/// Keys a well-formed domain configuration is expected to carry.
pub const RECOMMENDED_KEYS: &[&str] = &["domain", "description", "patterns", "entities", "constraints"];

/// Default number of patterns for a full `patterns` score.
const DEFAULT_TARGET_PATTERNS: usize = 3;

/// Default description length (characters) for a full `documentation` score.
const DEFAULT_TARGET_DESCRIPTION_LEN: usize = 120;

fn is_non_empty(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        _ => true,
    }
}

/// Scores configurations by how many recommended fields they fill in.
#[derive(Debug, Clone)]
pub struct CoverageEvaluator {
    target_patterns: usize,
    target_description_len: usize,
}

impl Default for CoverageEvaluator {
    fn default() -> Self {
        Self {
            target_patterns: DEFAULT_TARGET_PATTERNS,
            target_description_len: DEFAULT_TARGET_DESCRIPTION_LEN,
        }
    }
}

impl CoverageEvaluator {
    /// Creates an evaluator with default targets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of patterns needed for a full `patterns` score.
    pub fn with_target_patterns(mut self, count: usize) -> Self {
        self.target_patterns = count.max(1);
        self
    }

    fn pattern_count(config: &DomainConfig) -> usize {
        config
            .get("patterns")
            .and_then(Value::as_array)
            .map_or(0, Vec::len)
    }

    fn description_len(config: &DomainConfig) -> usize {
        config
            .get("description")
            .and_then(Value::as_str)
            .map_or(0, |s| s.trim().chars().count())
    }

    fn score(&self, config: &DomainConfig) -> QualityScore {
        let filled = RECOMMENDED_KEYS
            .iter()
            .filter(|key| config.get(key).is_some_and(is_non_empty))
            .count();
        let completeness = filled as f64 / RECOMMENDED_KEYS.len() as f64;
        let patterns =
            (Self::pattern_count(config) as f64 / self.target_patterns as f64).min(1.0);
        let documentation = (Self::description_len(config) as f64
            / self.target_description_len as f64)
            .min(1.0);

        let overall = (completeness + patterns + documentation) / 3.0;

        QualityScore::new(overall)
            .with_dimension("completeness", completeness)
            .with_dimension("patterns", patterns)
            .with_dimension("documentation", documentation)
    }
}

#[async_trait]
impl Evaluator for CoverageEvaluator {
    async fn evaluate(&self, config: &DomainConfig) -> Result<QualityScore, CollaboratorError> {
        Ok(self.score(config))
    }

    async fn generate_feedback(&self, config: &DomainConfig) -> Result<Feedback, CollaboratorError> {
        let mut suggestions = Vec::new();

        for key in RECOMMENDED_KEYS {
            if !config.get(key).is_some_and(is_non_empty) {
                suggestions.push(
                    Suggestion::actionable("completeness", format!("Fill in the '{key}' field"))
                        .for_field(*key),
                );
            }
        }

        let patterns = Self::pattern_count(config);
        if patterns > 0 && patterns < self.target_patterns {
            suggestions.push(
                Suggestion::actionable(
                    "patterns",
                    format!(
                        "Add {} more pattern(s) to reach {}",
                        self.target_patterns - patterns,
                        self.target_patterns
                    ),
                )
                .for_field("patterns"),
            );
        }

        let description_len = Self::description_len(config);
        if description_len > 0 && description_len < self.target_description_len {
            suggestions.push(
                Suggestion::actionable("documentation", "Expand the description")
                    .for_field("description"),
            );
        }

        Ok(Feedback::new(suggestions))
    }
}

/// Fills in fields named by actionable suggestions with editable templates.
#[derive(Debug, Clone, Default)]
pub struct TemplateRefiner;

impl TemplateRefiner {
    /// Creates a refiner.
    pub fn new() -> Self {
        Self
    }

    fn refine_field(config: &mut DomainConfig, field: &str) {
        let domain = config.domain_name().unwrap_or("this").to_string();
        match field {
            "description" => {
                let current = config
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .trim()
                    .to_string();
                let addition = format!(
                    "Configuration for the {domain} domain. Lists the recognised patterns, \
                     the entities they operate on and the constraints every output must respect."
                );
                let description = if current.is_empty() {
                    addition
                } else {
                    format!("{current} {addition}")
                };
                config.insert("description", Value::String(description));
            }
            "patterns" => {
                let mut patterns = config
                    .get("patterns")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let index = patterns.len() + 1;
                patterns.push(json!({
                    "name": format!("{domain}_pattern_{index}"),
                    "description": "Describe when this pattern applies",
                }));
                config.insert("patterns", Value::Array(patterns));
            }
            "entities" | "constraints" => {
                if !config.get(field).is_some_and(is_non_empty) {
                    config.insert(field, json!([format!("{domain}_{field}_placeholder")]));
                }
            }
            "domain" => {
                if !config.get("domain").is_some_and(is_non_empty) {
                    config.insert("domain", Value::String("unnamed".to_string()));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Refiner for TemplateRefiner {
    async fn apply_improvements(
        &self,
        config: &DomainConfig,
        feedback: &Feedback,
    ) -> Result<DomainConfig, CollaboratorError> {
        let mut refined = config.clone();
        let mut seen = Vec::new();

        for suggestion in feedback.actionable() {
            let Some(field) = suggestion.field.as_deref() else {
                continue;
            };
            if seen.contains(&field) {
                continue;
            }
            seen.push(field);
            Self::refine_field(&mut refined, field);
        }

        Ok(refined)
    }
}
