//! Quality scores, feedback and validation reports.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Dimension deltas smaller than this are treated as unchanged.
const DIMENSION_EPSILON: f64 = 1e-9;

/// Multi-dimensional quality assessment of a configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityScore {
    /// Overall score in `0.0..=1.0`.
    pub overall: f64,
    /// Per-dimension scores keyed by dimension name.
    #[serde(default)]
    pub dimensions: BTreeMap<String, f64>,
}

impl QualityScore {
    /// Creates a score with no per-dimension breakdown.
    pub fn new(overall: f64) -> Self {
        Self {
            overall,
            dimensions: BTreeMap::new(),
        }
    }

    /// Adds a dimension score.
    pub fn with_dimension(mut self, name: impl Into<String>, score: f64) -> Self {
        self.dimensions.insert(name.into(), score);
        self
    }

    /// Returns the score for one dimension.
    pub fn dimension(&self, name: &str) -> Option<f64> {
        self.dimensions.get(name).copied()
    }

    /// Dimensions whose score is higher here than in `baseline`.
    ///
    /// Dimensions missing from `baseline` count as improved.
    pub fn improved_over(&self, baseline: &QualityScore) -> Vec<String> {
        self.dimensions
            .iter()
            .filter(|(name, score)| match baseline.dimensions.get(*name) {
                Some(before) => **score - before > DIMENSION_EPSILON,
                None => true,
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Dimensions whose score is lower here than in `baseline`.
    pub fn degraded_from(&self, baseline: &QualityScore) -> Vec<String> {
        self.dimensions
            .iter()
            .filter(|(name, score)| {
                baseline
                    .dimensions
                    .get(*name)
                    .is_some_and(|before| before - **score > DIMENSION_EPSILON)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// A single improvement suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Quality dimension the suggestion targets.
    pub dimension: String,
    /// Top-level configuration field the suggestion concerns, if any.
    #[serde(default)]
    pub field: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// Whether a refiner can act on the suggestion.
    pub actionable: bool,
}

impl Suggestion {
    /// Creates an actionable suggestion.
    pub fn actionable(dimension: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            dimension: dimension.into(),
            field: None,
            message: message.into(),
            actionable: true,
        }
    }

    /// Creates an informational suggestion that a refiner cannot act on.
    pub fn informational(dimension: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            actionable: false,
            ..Self::actionable(dimension, message)
        }
    }

    /// Associates the suggestion with a configuration field.
    pub fn for_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

/// Feedback produced by an evaluator.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
    pub suggestions: Vec<Suggestion>,
}

impl Feedback {
    /// Creates feedback from a list of suggestions.
    pub fn new(suggestions: Vec<Suggestion>) -> Self {
        Self { suggestions }
    }

    /// Feedback with no suggestions at all.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns true if at least one suggestion can be acted on.
    pub fn has_actionable_suggestions(&self) -> bool {
        self.suggestions.iter().any(|s| s.actionable)
    }

    /// Iterates over the actionable suggestions.
    pub fn actionable(&self) -> impl Iterator<Item = &Suggestion> {
        self.suggestions.iter().filter(|s| s.actionable)
    }
}

/// Validator verdict on a refinement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Accept,
    Reject,
    Neutral,
}

impl std::fmt::Display for Recommendation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recommendation::Accept => write!(f, "accept"),
            Recommendation::Reject => write!(f, "reject"),
            Recommendation::Neutral => write!(f, "neutral"),
        }
    }
}

/// Result of comparing a configuration before and after refinement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub recommendation: Recommendation,
    /// Change in overall quality (new minus old).
    pub quality_change: f64,
    #[serde(default)]
    pub improved_dimensions: Vec<String>,
    #[serde(default)]
    pub degraded_dimensions: Vec<String>,
}

impl ValidationReport {
    /// An accepting report with the given overall change.
    pub fn accept(quality_change: f64) -> Self {
        Self {
            recommendation: Recommendation::Accept,
            quality_change,
            improved_dimensions: Vec::new(),
            degraded_dimensions: Vec::new(),
        }
    }

    /// A rejecting report with the given overall change.
    pub fn reject(quality_change: f64) -> Self {
        Self {
            recommendation: Recommendation::Reject,
            ..Self::accept(quality_change)
        }
    }

    /// Sets the improved dimensions.
    pub fn with_improved(mut self, dimensions: Vec<String>) -> Self {
        self.improved_dimensions = dimensions;
        self
    }

    /// Sets the degraded dimensions.
    pub fn with_degraded(mut self, dimensions: Vec<String>) -> Self {
        self.degraded_dimensions = dimensions;
        self
    }

    /// Only an explicit `accept` keeps the refinement.
    pub fn is_accepted(&self) -> bool {
        self.recommendation == Recommendation::Accept
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_improved_and_degraded_dimensions() {
        let before = QualityScore::new(0.5)
            .with_dimension("completeness", 0.4)
            .with_dimension("patterns", 0.6)
            .with_dimension("documentation", 0.5);
        let after = QualityScore::new(0.6)
            .with_dimension("completeness", 0.8)
            .with_dimension("patterns", 0.5)
            .with_dimension("documentation", 0.5)
            .with_dimension("examples", 0.2);

        assert_eq!(
            after.improved_over(&before),
            vec!["completeness".to_string(), "examples".to_string()]
        );
        assert_eq!(after.degraded_from(&before), vec!["patterns".to_string()]);
    }

    #[test]
    fn test_feedback_actionable() {
        assert!(!Feedback::empty().has_actionable_suggestions());

        let info_only = Feedback::new(vec![Suggestion::informational("style", "looks fine")]);
        assert!(!info_only.has_actionable_suggestions());

        let mixed = Feedback::new(vec![
            Suggestion::informational("style", "looks fine"),
            Suggestion::actionable("completeness", "add a description").for_field("description"),
        ]);
        assert!(mixed.has_actionable_suggestions());
        assert_eq!(mixed.actionable().count(), 1);
    }

    #[test]
    fn test_validation_report_acceptance() {
        assert!(ValidationReport::accept(0.1).is_accepted());
        assert!(!ValidationReport::reject(-0.1).is_accepted());

        let neutral = ValidationReport {
            recommendation: Recommendation::Neutral,
            ..ValidationReport::accept(0.0)
        };
        assert!(!neutral.is_accepted());
    }

    #[test]
    fn test_recommendation_serde() {
        let json = serde_json::to_string(&Recommendation::Accept).expect("serialize");
        assert_eq!(json, "\"accept\"");
    }
}
