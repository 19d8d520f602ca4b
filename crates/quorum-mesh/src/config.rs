//! Simulation configuration.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// How envelopes travel between nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Depth-first direct delivery, each send completes before the next.
    #[default]
    Synchronous,
    /// Per-node inboxes drained by a [`Scheduler`](crate::Scheduler).
    Queued,
    /// One tokio task per node, see [`ActorMesh`](crate::ActorMesh).
    Actors,
}

impl FromStr for DeliveryMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "synchronous" | "sync" => Ok(DeliveryMode::Synchronous),
            "queued" | "queue" => Ok(DeliveryMode::Queued),
            "actors" | "actor" => Ok(DeliveryMode::Actors),
            other => Err(Error::Config(format!("unknown delivery mode '{}'", other))),
        }
    }
}

/// Which inbox the queued scheduler drains next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Cycle through nodes in id order.
    #[default]
    RoundRobin,
    /// Pick a random non-empty inbox from a seeded generator.
    Seeded,
}

impl FromStr for QueueOrder {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round_robin" | "round-robin" | "rr" => Ok(QueueOrder::RoundRobin),
            "seeded" | "random" => Ok(QueueOrder::Seeded),
            other => Err(Error::Config(format!("unknown queue order '{}'", other))),
        }
    }
}

/// Configuration for running a mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Delivery driver
    pub delivery: DeliveryMode,
    /// Inbox selection for the queued driver
    pub order: QueueOrder,
    /// Seed for deterministic inbox selection
    pub seed: u64,
    /// Upper bound on queued deliveries per run
    pub max_steps: usize,
    /// Whether to keep a [`MeshEvent`](crate::MeshEvent) timeline
    pub record_events: bool,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            delivery: DeliveryMode::Synchronous,
            order: QueueOrder::RoundRobin,
            seed: 42,
            max_steps: 10_000,
            record_events: true,
        }
    }
}

impl SimulationConfig {
    /// Create config from `QUORUM_*` environment variables with defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create config from an arbitrary key lookup with defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("QUORUM_DELIVERY") {
            config.delivery = v.parse()?;
        }
        if let Some(v) = lookup("QUORUM_ORDER") {
            config.order = v.parse()?;
        }
        if let Some(v) = lookup("QUORUM_SEED") {
            config.seed = parse_value("QUORUM_SEED", &v)?;
        }
        if let Some(v) = lookup("QUORUM_MAX_STEPS") {
            config.max_steps = parse_value("QUORUM_MAX_STEPS", &v)?;
        }
        if let Some(v) = lookup("QUORUM_RECORD_EVENTS") {
            config.record_events = parse_value("QUORUM_RECORD_EVENTS", &v)?;
        }

        Ok(config)
    }

    /// Set the delivery driver.
    #[must_use]
    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    /// Set the queued inbox order.
    #[must_use]
    pub fn with_order(mut self, order: QueueOrder) -> Self {
        self.order = order;
        self
    }

    /// Set the seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Set the queued step budget.
    #[must_use]
    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Disable the event timeline.
    #[must_use]
    pub fn without_events(mut self) -> Self {
        self.record_events = false;
        self
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{}: cannot parse '{}'", key, value)))
}
