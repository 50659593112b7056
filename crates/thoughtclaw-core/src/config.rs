//! Runtime configuration
//!
//! All tunable parameters in one place. Loaded from TOML at startup,
//! falls back to defaults if no config file exists. Unlike a missing file,
//! a malformed file or an out-of-range value fails construction.

use crate::error::{Error, Result};
use crate::types::Stage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Cycle cadence and replanning.
    pub heartbeat: HeartbeatConfig,
    /// Per-stage limits.
    pub stages: StagesConfig,
    /// Tier retention and promotion.
    pub memory: MemoryConfig,
    /// Surprise scoring and reinforcement.
    pub inference: InferenceConfig,
    /// Attractor clustering.
    pub basin: BasinConfig,
    /// Session continuity and semantic persistence.
    pub persistence: PersistenceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Every Nth cycle is a full replan.
    pub planning_interval: u64,
    /// Cycle period in milliseconds. 0 runs cycles back to back.
    pub tick_ms: u64,
    /// Consecutive abandoned cycles before the runtime reports degraded.
    pub degraded_after: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagesConfig {
    pub perception: StageLimits,
    pub reasoning: StageLimits,
    pub metacognition: StageLimits,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageLimits {
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Concurrently active particles in the working tier.
    pub working_capacity: usize,
    /// Fast-schedule decay rate given to new particles.
    pub working_decay_rate: f64,
    /// Cycles a working particle may go without activation before demotion.
    pub working_recency_cycles: u64,
    /// Slow decay rate assigned on entry to the episodic tier.
    pub episodic_decay_rate: f64,
    /// Episodic particles not activated within this window are dropped.
    pub episodic_window_days: i64,
    /// Relevance decay for the semantic tier.
    pub semantic_relevance_decay: f64,
    /// Relevance below which a semantic particle is flagged low-relevance.
    pub semantic_relevance_floor: f64,
    /// Activation treated as zero for pruning.
    pub prune_epsilon: f64,
    /// Cycles a particle may sit below the epsilon before it is pruned.
    pub prune_grace_cycles: u32,
    /// Working -> Episodic activation threshold, also the equivalence bar.
    pub promotion_threshold: f64,
    /// K: distinct prior sessions required for Episodic -> Semantic.
    pub semantic_promotion_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Resonance at or above this reinforces instead of spawning.
    pub reinforcement_threshold: f64,
    /// Activation added on reinforcement (before gain).
    pub reinforcement_increment: f64,
    /// Minimum resonance recorded as a link on a spawned particle.
    pub link_threshold: f64,
    /// Default affect gain for new particles.
    pub gain: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BasinConfig {
    /// Cumulative activation a new cluster needs to become a basin.
    pub basin_formation_threshold: f64,
    /// Resonance edges at or above this join particles into one cluster.
    pub similarity_threshold: f64,
    /// A basin below this cumulative activation dissolves.
    pub dissolution_floor: f64,
    /// Smallest cluster that can form a basin.
    pub min_members: usize,
    /// Episodic particles at or above this activation count as active.
    pub active_floor: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Directory holding the session continuity file.
    pub session_dir: Option<PathBuf>,
    /// JSON-lines file that receives promoted semantic particles.
    pub semantic_log: Option<PathBuf>,
}

// ============================================================
// Defaults
// ============================================================

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { planning_interval: 3, tick_ms: 1_000, degraded_after: 3 }
    }
}

impl Default for StageLimits {
    fn default() -> Self {
        Self { timeout_ms: 500 }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            working_capacity: 7,
            working_decay_rate: 0.15,
            working_recency_cycles: 8,
            episodic_decay_rate: 0.01,
            episodic_window_days: 30,
            semantic_relevance_decay: 0.001,
            semantic_relevance_floor: 0.05,
            prune_epsilon: 0.01,
            prune_grace_cycles: 3,
            promotion_threshold: 0.6,
            semantic_promotion_count: 3,
        }
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            reinforcement_threshold: 0.5,
            reinforcement_increment: 0.25,
            link_threshold: 0.2,
            gain: 1.0,
        }
    }
}

impl Default for BasinConfig {
    fn default() -> Self {
        Self {
            basin_formation_threshold: 1.5,
            similarity_threshold: 0.3,
            dissolution_floor: 0.5,
            min_members: 2,
            active_floor: 0.1,
        }
    }
}

// ============================================================
// Loading
// ============================================================

impl RuntimeConfig {
    /// Load config from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = Self::from_toml(&content)
                    .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;
                tracing::info!("Loaded config from {}", path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config at {} - using defaults", path.display());
                Self::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(e.to_string()))
    }

    /// Write the current config as TOML (for generating a default config file).
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Check every option. Called before the first cycle runs.
    pub fn validate(&self) -> Result<()> {
        let m = &self.memory;
        let i = &self.inference;
        let b = &self.basin;

        positive("heartbeat.planning_interval", self.heartbeat.planning_interval as f64)?;
        positive("heartbeat.degraded_after", self.heartbeat.degraded_after as f64)?;
        for stage in [Stage::Perception, Stage::Reasoning, Stage::Metacognition] {
            if self.stages.limits(stage).timeout_ms == 0 {
                return Err(Error::config(format!("stages.{}.timeout_ms must be positive", stage)));
            }
        }

        positive("memory.working_capacity", m.working_capacity as f64)?;
        rate("memory.working_decay_rate", m.working_decay_rate)?;
        positive("memory.working_recency_cycles", m.working_recency_cycles as f64)?;
        rate("memory.episodic_decay_rate", m.episodic_decay_rate)?;
        positive("memory.episodic_window_days", m.episodic_window_days as f64)?;
        rate("memory.semantic_relevance_decay", m.semantic_relevance_decay)?;
        unit("memory.semantic_relevance_floor", m.semantic_relevance_floor)?;
        unit("memory.prune_epsilon", m.prune_epsilon)?;
        unit("memory.promotion_threshold", m.promotion_threshold)?;
        positive("memory.semantic_promotion_count", m.semantic_promotion_count as f64)?;

        unit("inference.reinforcement_threshold", i.reinforcement_threshold)?;
        unit("inference.reinforcement_increment", i.reinforcement_increment)?;
        unit("inference.link_threshold", i.link_threshold)?;
        positive("inference.gain", i.gain)?;

        positive("basin.basin_formation_threshold", b.basin_formation_threshold)?;
        unit("basin.similarity_threshold", b.similarity_threshold)?;
        unit("basin.active_floor", b.active_floor)?;
        positive("basin.min_members", b.min_members as f64)?;
        if !(b.dissolution_floor >= 0.0) || b.dissolution_floor > b.basin_formation_threshold {
            return Err(Error::config(format!(
                "basin.dissolution_floor must be within [0, {}], got {}",
                b.basin_formation_threshold, b.dissolution_floor
            )));
        }
        Ok(())
    }
}

impl StagesConfig {
    pub fn limits(&self, stage: Stage) -> &StageLimits {
        match stage {
            Stage::Perception => &self.perception,
            Stage::Reasoning => &self.reasoning,
            Stage::Metacognition => &self.metacognition,
        }
    }

    pub fn timeout(&self, stage: Stage) -> Duration {
        Duration::from_millis(self.limits(stage).timeout_ms)
    }
}

fn positive(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(Error::config(format!("{} must be positive, got {}", name, value)))
    }
}

/// Decay-style rates live in (0, 1).
fn rate(name: &str, value: f64) -> Result<()> {
    if value > 0.0 && value < 1.0 {
        Ok(())
    } else {
        Err(Error::config(format!("{} must be within (0, 1), got {}", name, value)))
    }
}

fn unit(name: &str, value: f64) -> Result<()> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(Error::config(format!("{} must be within [0, 1], got {}", name, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = RuntimeConfig::default();
        assert_eq!(config.heartbeat.planning_interval, 3);
        assert_eq!(config.memory.working_capacity, 7);
        assert_eq!(config.memory.promotion_threshold, 0.6);
        assert_eq!(config.memory.semantic_promotion_count, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = RuntimeConfig::from_toml(
            "[memory]\nworking_capacity = 2\n\n[heartbeat]\nplanning_interval = 5\n",
        )
        .unwrap();
        assert_eq!(config.memory.working_capacity, 2);
        assert_eq!(config.heartbeat.planning_interval, 5);
        assert_eq!(config.memory.promotion_threshold, 0.6);
        assert_eq!(config.stages.reasoning.timeout_ms, 500);
    }

    #[test]
    fn rejects_negative_decay_rate() {
        let mut config = RuntimeConfig::default();
        config.memory.working_decay_rate = -0.2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("working_decay_rate"));
    }

    #[test]
    fn rejects_zero_capacity_and_interval() {
        let mut config = RuntimeConfig::default();
        config.memory.working_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.heartbeat.planning_interval = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_threshold_out_of_unit_range() {
        let mut config = RuntimeConfig::default();
        config.memory.promotion_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_stage_timeout() {
        let mut config = RuntimeConfig::default();
        config.stages.metacognition.timeout_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("metacognition"));
    }

    #[test]
    fn rejects_floor_above_formation() {
        let mut config = RuntimeConfig::default();
        config.basin.dissolution_floor = 3.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_of_defaults() {
        let text = RuntimeConfig::default().to_toml();
        let parsed = RuntimeConfig::from_toml(&text).unwrap();
        assert_eq!(parsed.memory.working_capacity, 7);
        assert_eq!(parsed.basin.min_members, 2);
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = RuntimeConfig::load(&tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.heartbeat.planning_interval, 3);
    }

    #[test]
    fn load_malformed_file_fails_fast() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("thoughtclaw.toml");
        std::fs::write(&path, "[memory\nworking_capacity = ").unwrap();
        assert!(matches!(RuntimeConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn load_invalid_value_fails_fast() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("thoughtclaw.toml");
        std::fs::write(&path, "[inference]\ngain = 0.0\n").unwrap();
        assert!(matches!(RuntimeConfig::load(&path), Err(Error::Config(_))));
    }
}
