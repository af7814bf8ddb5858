//! Working memory items and their activation decay

use crate::facts::NodeRef;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of an item; `Evicted` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemPhase {
    Inserted,
    Active,
    Refreshed,
    Evicted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemoryItem {
    pub node: NodeRef,
    /// Activation as of `updated_at`
    pub activation: f64,
    pub source_tag: String,
    pub phase: ItemPhase,
    pub inserted_at: DateTime<Utc>,
    pub last_access: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub refreshes: u32,
}

/// Exponential decay with the given half-life
pub fn decay(activation: f64, elapsed_secs: f64, half_life_secs: f64) -> f64 {
    if half_life_secs <= 0.0 || elapsed_secs <= 0.0 {
        return activation;
    }
    activation * 0.5f64.powf(elapsed_secs / half_life_secs)
}

impl WorkingMemoryItem {
    pub fn new(node: NodeRef, activation: f64, source_tag: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            node,
            activation: activation.clamp(0.0, 1.0),
            source_tag: source_tag.into(),
            phase: ItemPhase::Inserted,
            inserted_at: now,
            last_access: now,
            updated_at: now,
            refreshes: 0,
        }
    }

    /// Decayed activation at `now`
    pub fn activation_at(&self, now: DateTime<Utc>, half_life_secs: f64) -> f64 {
        let elapsed = (now - self.updated_at).num_milliseconds() as f64 / 1000.0;
        decay(self.activation, elapsed, half_life_secs)
    }

    /// Fold elapsed decay into the stored activation
    pub fn settle(&mut self, now: DateTime<Utc>, half_life_secs: f64) {
        if now <= self.updated_at {
            return;
        }
        self.activation = self.activation_at(now, half_life_secs);
        self.updated_at = now;
        if matches!(self.phase, ItemPhase::Inserted | ItemPhase::Refreshed) {
            self.phase = ItemPhase::Active;
        }
    }

    /// Raise activation to at least `incoming` and restart decay from now
    pub fn refresh(&mut self, incoming: f64, source_tag: &str, now: DateTime<Utc>, half_life_secs: f64) {
        self.settle(now, half_life_secs);
        self.activation = self.activation.max(incoming).clamp(0.0, 1.0);
        self.updated_at = now;
        self.last_access = now;
        self.source_tag = source_tag.to_string();
        self.phase = ItemPhase::Refreshed;
        self.refreshes += 1;
    }

    /// Set activation directly at `now`
    pub fn reweight(&mut self, activation: f64, now: DateTime<Utc>, half_life_secs: f64) {
        self.settle(now, half_life_secs);
        self.activation = activation.clamp(0.0, 1.0);
        self.updated_at = now;
    }
}
