//! Ranking policy
//!
//! Weights are configuration; the engine only computes the four components.

use crate::error::{KnowledgeError, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingPolicy {
    #[serde(default = "default_specificity_weight")]
    pub specificity_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_similarity_weight")]
    pub similarity_weight: f64,

    #[serde(default = "default_confidence_weight")]
    pub confidence_weight: f64,

    /// Age of the newest fact on a path at which its recency score halves
    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,
}

fn default_specificity_weight() -> f64 { 0.3 }
fn default_recency_weight() -> f64 { 0.2 }
fn default_similarity_weight() -> f64 { 0.2 }
fn default_confidence_weight() -> f64 { 0.3 }
fn default_recency_half_life_days() -> f64 { 365.0 }

impl Default for RankingPolicy {
    fn default() -> Self {
        Self {
            specificity_weight: default_specificity_weight(),
            recency_weight: default_recency_weight(),
            similarity_weight: default_similarity_weight(),
            confidence_weight: default_confidence_weight(),
            recency_half_life_days: default_recency_half_life_days(),
        }
    }
}

/// Per-match ranking components, each in [0, 1]
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub specificity: f64,
    pub recency: f64,
    pub similarity: f64,
    pub confidence: f64,
}

impl RankingPolicy {
    pub fn validate(&self) -> Result<()> {
        let weights = [
            self.specificity_weight,
            self.recency_weight,
            self.similarity_weight,
            self.confidence_weight,
        ];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(KnowledgeError::Configuration(
                "ranking weights must be finite and non-negative".to_string(),
            ));
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            return Err(KnowledgeError::Configuration(
                "at least one ranking weight must be positive".to_string(),
            ));
        }
        if !(self.recency_half_life_days > 0.0) {
            return Err(KnowledgeError::Configuration(
                "recency_half_life_days must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Recency for a fact that became valid `age_days` before the query time
    pub fn recency(&self, age_days: f64) -> f64 {
        0.5f64.powf(age_days.max(0.0) / self.recency_half_life_days)
    }

    /// Weighted mean of the components
    pub fn total(&self, breakdown: &ScoreBreakdown) -> f64 {
        let weight_sum = self.specificity_weight
            + self.recency_weight
            + self.similarity_weight
            + self.confidence_weight;
        if weight_sum <= 0.0 {
            return 0.0;
        }
        (breakdown.specificity * self.specificity_weight
            + breakdown.recency * self.recency_weight
            + breakdown.similarity * self.similarity_weight
            + breakdown.confidence * self.confidence_weight)
            / weight_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        assert!(RankingPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_negative_weight_rejected() {
        let policy = RankingPolicy {
            recency_weight: -0.1,
            ..RankingPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_weights_drive_total() {
        let breakdown = ScoreBreakdown {
            specificity: 1.0,
            recency: 0.0,
            similarity: 0.0,
            confidence: 0.0,
        };
        let only_specificity = RankingPolicy {
            specificity_weight: 1.0,
            recency_weight: 0.0,
            similarity_weight: 0.0,
            confidence_weight: 0.0,
            ..RankingPolicy::default()
        };
        assert_eq!(only_specificity.total(&breakdown), 1.0);
        assert!((RankingPolicy::default().total(&breakdown) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_recency_half_life() {
        let policy = RankingPolicy::default();
        assert_eq!(policy.recency(0.0), 1.0);
        assert!((policy.recency(365.0) - 0.5).abs() < 1e-9);
    }
}
