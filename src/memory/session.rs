//! Bounded, decaying working set for one reasoning session
//!
//! Capacity is a hard bound: a new item only gets in by evicting the
//! weakest resident, and only if it starts out stronger than that resident.

use super::item::{ItemPhase, WorkingMemoryItem};
use crate::clock::Clock;
use crate::config::WorkingMemoryConfig;
use crate::facts::NodeRef;
use crate::metrics::METRICS;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

/// Item offered to `stage`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRequest {
    pub node: NodeRef,
    /// Initial activation; the configured default when unset
    #[serde(default)]
    pub activation: Option<f64>,
    /// Retrieval confidence, for the bottom-up boost
    #[serde(default)]
    pub confidence: Option<f64>,
    /// Externally scored novelty, for the bottom-up boost
    #[serde(default)]
    pub novelty: Option<f64>,
}

impl StageRequest {
    pub fn new(node: NodeRef) -> Self {
        Self {
            node,
            activation: None,
            confidence: None,
            novelty: None,
        }
    }

    pub fn with_activation(mut self, activation: f64) -> Self {
        self.activation = Some(activation);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn with_novelty(mut self, novelty: f64) -> Self {
        self.novelty = Some(novelty);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StageOutcome {
    Inserted {
        node: NodeRef,
        activation: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evicted: Option<NodeRef>,
    },
    Refreshed {
        node: NodeRef,
        activation: f64,
    },
    /// Full, and the incoming item was not stronger than the weakest resident
    CapacityRejected {
        node: NodeRef,
        activation: f64,
        weakest: f64,
    },
}

impl StageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Inserted { .. } => "inserted",
            StageOutcome::Refreshed { .. } => "refreshed",
            StageOutcome::CapacityRejected { .. } => "capacity_rejected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoalTarget {
    pub node: NodeRef,
    /// Relevance to the goal, in [0, 1]
    pub relevance: f64,
}

/// Top-down attention signal
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalContext {
    #[serde(default)]
    pub targets: Vec<GoalTarget>,
    /// Relevance assumed for items not listed
    #[serde(default)]
    pub default_relevance: f64,
    /// Overrides the configured focus weight
    #[serde(default)]
    pub weight: Option<f64>,
}

impl GoalContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn target(mut self, node: NodeRef, relevance: f64) -> Self {
        self.targets.push(GoalTarget { node, relevance });
        self
    }

    fn relevance(&self, node: &NodeRef) -> f64 {
        self.targets
            .iter()
            .find(|t| t.node == *node)
            .map_or(self.default_relevance, |t| t.relevance)
            .clamp(0.0, 1.0)
    }
}

pub struct WorkingMemory {
    config: WorkingMemoryConfig,
    clock: Arc<dyn Clock>,
    items: IndexMap<NodeRef, WorkingMemoryItem>,
}

impl WorkingMemory {
    pub fn new(config: WorkingMemoryConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            items: IndexMap::with_capacity(config.capacity),
            config,
            clock,
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Initial activation including bottom-up boosts
    fn initial_activation(&self, request: &StageRequest) -> f64 {
        let mut activation = request
            .activation
            .unwrap_or(self.config.default_activation);
        if request
            .confidence
            .map_or(false, |c| c >= self.config.high_confidence_threshold)
        {
            activation += self.config.confidence_boost;
        }
        if request
            .novelty
            .map_or(false, |n| n >= self.config.novelty_threshold)
        {
            activation += self.config.novelty_boost;
        }
        activation.clamp(0.0, 1.0)
    }

    fn weakest(&self, now: chrono::DateTime<chrono::Utc>) -> Option<(NodeRef, f64)> {
        let half_life = self.config.half_life_secs;
        self.items
            .values()
            .map(|item| (item.node, item.activation_at(now, half_life)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal))
    }

    /// Insert or refresh items, in order
    pub fn stage(&mut self, requests: Vec<StageRequest>, source_tag: &str) -> Vec<StageOutcome> {
        let now = self.clock.now();
        let half_life = self.config.half_life_secs;
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let incoming = self.initial_activation(&request);
            let node = request.node;

            let outcome = if let Some(item) = self.items.get_mut(&node) {
                item.refresh(incoming, source_tag, now, half_life);
                StageOutcome::Refreshed {
                    node,
                    activation: item.activation,
                }
            } else if self.items.len() < self.config.capacity {
                self.items
                    .insert(node, WorkingMemoryItem::new(node, incoming, source_tag, now));
                StageOutcome::Inserted {
                    node,
                    activation: incoming,
                    evicted: None,
                }
            } else {
                match self.weakest(now) {
                    Some((victim, weakest)) if incoming > weakest => {
                        self.items.shift_remove(&victim);
                        debug!("Evicted {} (activation {:.3}) for {}", victim, weakest, node);
                        self.items
                            .insert(node, WorkingMemoryItem::new(node, incoming, source_tag, now));
                        StageOutcome::Inserted {
                            node,
                            activation: incoming,
                            evicted: Some(victim),
                        }
                    }
                    weakest => {
                        let weakest = weakest.map_or(0.0, |(_, a)| a);
                        warn!(
                            "Working memory full: rejected {} (activation {:.3} <= {:.3})",
                            node, incoming, weakest
                        );
                        StageOutcome::CapacityRejected {
                            node,
                            activation: incoming,
                            weakest,
                        }
                    }
                }
            };

            let evicted = match &outcome {
                StageOutcome::Inserted {
                    evicted: Some(_), ..
                } => 1,
                _ => 0,
            };
            METRICS.record_stage(outcome.label(), evicted);
            outcomes.push(outcome);
        }
        outcomes
    }

    /// Blend every activation toward its goal relevance
    pub fn focus(&mut self, goal: &GoalContext) {
        let now = self.clock.now();
        let half_life = self.config.half_life_secs;
        let weight = goal.weight.unwrap_or(self.config.focus_weight).clamp(0.0, 1.0);

        for item in self.items.values_mut() {
            let current = item.activation_at(now, half_life);
            let relevance = goal.relevance(&item.node);
            item.reweight((1.0 - weight) * current + weight * relevance, now, half_life);
        }
        debug!("Focus applied to {} items with weight {:.2}", self.items.len(), weight);
    }

    /// Current items with decayed activations, strongest first
    pub fn snapshot(&self) -> Vec<WorkingMemoryItem> {
        let now = self.clock.now();
        let half_life = self.config.half_life_secs;
        let mut items: Vec<WorkingMemoryItem> = self
            .items
            .values()
            .map(|item| {
                let mut view = item.clone();
                view.settle(now, half_life);
                view
            })
            .collect();
        items.sort_by(|a, b| b.activation.partial_cmp(&a.activation).unwrap_or(Ordering::Equal));
        items
    }

    /// Explicitly evict an item
    pub fn release(&mut self, node: &NodeRef) -> Option<WorkingMemoryItem> {
        let mut item = self.items.shift_remove(node)?;
        item.settle(self.clock.now(), self.config.half_life_secs);
        item.phase = ItemPhase::Evicted;
        METRICS.memory_evictions.inc();
        debug!("Released {}", node);
        Some(item)
    }

    pub fn activation(&self, node: &NodeRef) -> Option<f64> {
        self.items
            .get(node)
            .map(|item| item.activation_at(self.clock.now(), self.config.half_life_secs))
    }

    pub fn contains(&self, node: &NodeRef) -> bool {
        self.items.contains_key(node)
    }
}
