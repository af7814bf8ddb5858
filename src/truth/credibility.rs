//! Credibility scoring for competing facts
//!
//! Source reliability comes from outside (a registry or a learned model
//! behind [`SourceReliability`]); the core only combines it with recency
//! and corroboration using configured weights.

use crate::config::TruthConfig;
use crate::facts::Provenance;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// External reliability score for a source, in [0, 1]
pub trait SourceReliability: Send + Sync {
    fn reliability(&self, source: &str) -> Option<f64>;
}

/// Fixed per-source scores
#[derive(Debug, Default)]
pub struct StaticReliability {
    scores: DashMap<String, f64>,
}

impl StaticReliability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, source: impl Into<String>, score: f64) -> Self {
        self.set(source, score);
        self
    }

    pub fn set(&self, source: impl Into<String>, score: f64) {
        self.scores.insert(source.into(), score.clamp(0.0, 1.0));
    }
}

impl SourceReliability for StaticReliability {
    fn reliability(&self, source: &str) -> Option<f64> {
        self.scores.get(source).map(|s| *s)
    }
}

/// Credibility components and their weighted total
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CredibilityScore {
    pub reliability: f64,
    pub recency: f64,
    pub corroboration: f64,
    pub total: f64,
}

pub struct CredibilityModel {
    reliability_weight: f64,
    recency_weight: f64,
    corroboration_weight: f64,
    half_life_days: f64,
    default_reliability: f64,
    sources: Arc<dyn SourceReliability>,
}

impl CredibilityModel {
    pub fn new(config: &TruthConfig, sources: Arc<dyn SourceReliability>) -> Self {
        Self {
            reliability_weight: config.reliability_weight,
            recency_weight: config.recency_weight,
            corroboration_weight: config.corroboration_weight,
            half_life_days: config.recency_half_life_days,
            default_reliability: config.default_source_reliability,
            sources,
        }
    }

    fn source_reliability(&self, provenance: &Provenance) -> f64 {
        provenance
            .credibility_hint
            .or_else(|| self.sources.reliability(&provenance.source))
            .unwrap_or(self.default_reliability)
            .clamp(0.0, 1.0)
    }

    /// Score the evidence behind one fact at time `now`
    pub fn score(&self, provenance: &[Provenance], now: DateTime<Utc>) -> CredibilityScore {
        let reliability = provenance
            .iter()
            .map(|p| self.source_reliability(p))
            .fold(0.0, f64::max);

        let recency = provenance
            .iter()
            .map(|p| p.observed_at)
            .max()
            .map(|latest| {
                let age_days = (now - latest).num_seconds().max(0) as f64 / 86_400.0;
                if self.half_life_days > 0.0 {
                    0.5f64.powf(age_days / self.half_life_days)
                } else {
                    1.0
                }
            })
            .unwrap_or(0.0);

        let sources: HashSet<&str> = provenance.iter().map(|p| p.source.as_str()).collect();
        let corroboration = 1.0 - 1.0 / (1.0 + sources.len() as f64);

        let weight_sum = self.reliability_weight + self.recency_weight + self.corroboration_weight;
        let total = if weight_sum > 0.0 {
            (reliability * self.reliability_weight
                + recency * self.recency_weight
                + corroboration * self.corroboration_weight)
                / weight_sum
        } else {
            0.0
        };

        CredibilityScore {
            reliability,
            recency,
            corroboration,
            total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn model() -> CredibilityModel {
        let registry = StaticReliability::new().with("Reuters", 0.95);
        CredibilityModel::new(&TruthConfig::default(), Arc::new(registry))
    }

    #[test]
    fn test_hint_beats_registry() {
        let now = Utc::now();
        let hinted = model().score(&[Provenance::new("Reuters", now).with_credibility(0.2)], now);
        assert!((hinted.reliability - 0.2).abs() < 1e-9);

        let registered = model().score(&[Provenance::new("Reuters", now)], now);
        assert!((registered.reliability - 0.95).abs() < 1e-9);

        let unknown = model().score(&[Provenance::new("blog", now)], now);
        assert!((unknown.reliability - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_recency_halves_after_half_life() {
        let now = Utc::now();
        let old = model().score(&[Provenance::new("S", now - Duration::days(365))], now);
        assert!((old.recency - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_corroboration_grows_with_distinct_sources() {
        let now = Utc::now();
        let one = model().score(&[Provenance::new("A", now)], now);
        let two = model().score(&[Provenance::new("A", now), Provenance::new("B", now)], now);
        let same = model().score(&[Provenance::new("A", now), Provenance::new("A", now)], now);
        assert!(two.corroboration > one.corroboration);
        assert_eq!(same.corroboration, one.corroboration);
        assert!(two.total > one.total);
    }
}
