//! Stage agents
//!
//! Perception, Reasoning and Metacognition are stateless handlers invoked in
//! that order once per cycle. Each is a trait so callers can swap in their
//! own; the defaults below are what the runtime uses otherwise.

use crate::tools::{ReadContext, StageContext};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thoughtclaw_core::{
    Basin, BasinId, ContentKey, Error, Observation, ParticleId, ParticleSummary, Result, Tier,
};
use thoughtclaw_inference::{ObservationResult, Outcome};
use thoughtclaw_memory::ParticleQuery;
use tracing::info;

// ============================================================
// Stage outputs
// ============================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerceptionReport {
    pub observed: Vec<ObservationResult>,
    /// Working tier after observation, most active first.
    pub focus: Vec<ParticleSummary>,
    pub peak_surprise: f64,
    pub mean_surprise: f64,
}

impl PerceptionReport {
    pub fn new(observed: Vec<ObservationResult>, focus: Vec<ParticleSummary>) -> Self {
        let peak_surprise = observed.iter().map(|r| r.surprise).fold(0.0, f64::max);
        let mean_surprise = if observed.is_empty() {
            0.0
        } else {
            observed.iter().map(|r| r.surprise).sum::<f64>() / observed.len() as f64
        };
        Self {
            observed,
            focus,
            peak_surprise,
            mean_surprise,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub particle: ParticleId,
    pub key: ContentKey,
    pub weight: f64,
}

/// Ordered focus steps. Extended cycle to cycle, rebuilt on replans.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
    /// Cycle the plan was last rebuilt from scratch.
    pub rebuilt_at: u64,
    /// Extensions since the last rebuild.
    pub revision: u32,
}

impl Plan {
    pub fn contains(&self, id: ParticleId) -> bool {
        self.steps.iter().any(|s| s.particle == id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReasoningReport {
    pub plan: Plan,
    /// Neighbours raised by spreading activation.
    pub activated: Vec<ParticleId>,
    pub beliefs: Vec<ParticleSummary>,
    pub basins: Vec<Basin>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Idle,
    /// Keep a working particle fresh.
    Attend { particle: ParticleId },
    /// Pull an episodic particle back into working memory.
    Recall { particle: ParticleId },
    /// Keep every working member of a basin fresh.
    Consolidate { basin: BasinId },
    /// Surface novel content to the caller.
    Explore { particle: ParticleId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: Action,
    pub rationale: String,
    pub confidence: f64,
    pub cycle: u64,
}

// ============================================================
// Stage traits
// ============================================================

#[async_trait::async_trait]
pub trait Perception: Send + Sync {
    async fn perceive(&self, ctx: &mut StageContext<'_>, input: Vec<Observation>) -> Result<PerceptionReport>;
}

#[async_trait::async_trait]
pub trait Reasoning: Send + Sync {
    /// `previous` is `None` on the first cycle and on every replan.
    async fn reason(
        &self,
        ctx: &mut StageContext<'_>,
        perception: &PerceptionReport,
        previous: Option<&Plan>,
    ) -> Result<ReasoningReport>;
}

#[async_trait::async_trait]
pub trait Metacognition: Send + Sync {
    async fn decide(
        &self,
        ctx: &ReadContext<'_>,
        perception: &PerceptionReport,
        reasoning: &ReasoningReport,
    ) -> Result<Decision>;
}

/// Carries a decision out into the world. Runs after the heartbeat has
/// applied the decision's effect on memory.
#[async_trait::async_trait]
pub trait Actuator: Send + Sync {
    async fn act(&self, decision: &Decision) -> Result<()>;
}

/// The handlers one heartbeat runs.
#[derive(Clone)]
pub struct Stages {
    pub perception: Arc<dyn Perception>,
    pub reasoning: Arc<dyn Reasoning>,
    pub metacognition: Arc<dyn Metacognition>,
    pub actuator: Arc<dyn Actuator>,
}

impl Default for Stages {
    fn default() -> Self {
        Self {
            perception: Arc::new(DefaultPerception),
            reasoning: Arc::new(DefaultReasoning::default()),
            metacognition: Arc::new(DefaultMetacognition::default()),
            actuator: Arc::new(LogActuator),
        }
    }
}

// ============================================================
// Default handlers
// ============================================================

/// Feeds every pending observation through the inference engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultPerception;

#[async_trait::async_trait]
impl Perception for DefaultPerception {
    async fn perceive(&self, ctx: &mut StageContext<'_>, input: Vec<Observation>) -> Result<PerceptionReport> {
        let mut observed = Vec::with_capacity(input.len());
        for observation in input {
            observed.push(ctx.observe(observation)?);
        }
        let focus = ctx.query(Tier::Working, &ParticleQuery::all())?;
        Ok(PerceptionReport::new(observed, focus))
    }
}

/// Spreads activation from recognised content, then extends or rebuilds
/// the plan from the working focus.
#[derive(Debug, Clone)]
pub struct DefaultReasoning {
    /// Activation spread from each reinforced particle.
    pub spread: f64,
    /// Maximum plan length.
    pub width: usize,
}

impl Default for DefaultReasoning {
    fn default() -> Self {
        Self { spread: 0.1, width: 5 }
    }
}

impl DefaultReasoning {
    fn step(summary: &ParticleSummary) -> PlanStep {
        PlanStep {
            particle: summary.id,
            key: summary.key.clone(),
            weight: summary.activation,
        }
    }

    fn rebuild(&self, focus: &[ParticleSummary], cycle: u64) -> Plan {
        Plan {
            steps: focus.iter().take(self.width).map(Self::step).collect(),
            rebuilt_at: cycle,
            revision: 0,
        }
    }

    /// Keep surviving steps in their order, re-weighted, then append new focus.
    fn extend(&self, previous: &Plan, focus: &[ParticleSummary]) -> Plan {
        let mut steps: Vec<PlanStep> = previous
            .steps
            .iter()
            .filter_map(|s| focus.iter().find(|f| f.id == s.particle).map(Self::step))
            .collect();
        for summary in focus {
            if !steps.iter().any(|s| s.particle == summary.id) {
                steps.push(Self::step(summary));
            }
        }
        steps.truncate(self.width);
        Plan {
            steps,
            rebuilt_at: previous.rebuilt_at,
            revision: previous.revision + 1,
        }
    }
}

#[async_trait::async_trait]
impl Reasoning for DefaultReasoning {
    async fn reason(
        &self,
        ctx: &mut StageContext<'_>,
        perception: &PerceptionReport,
        previous: Option<&Plan>,
    ) -> Result<ReasoningReport> {
        let mut activated = Vec::new();
        for result in perception
            .observed
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Reinforced | Outcome::Recalled))
        {
            match ctx.activate(result.particle, self.spread) {
                Ok(raised) => activated.extend(raised),
                Err(Error::ParticleNotFound(_)) => continue,
                Err(e) => return Err(e),
            }
        }

        let focus = ctx.query(Tier::Working, &ParticleQuery::all())?;
        let plan = match previous {
            Some(previous) => self.extend(previous, &focus),
            None => self.rebuild(&focus, ctx.cycle()),
        };
        Ok(ReasoningReport {
            plan,
            activated,
            beliefs: ctx.query(Tier::Semantic, &ParticleQuery::all().limit(self.width))?,
            basins: ctx.basins()?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DefaultMetacognition {
    /// Peak surprise at or above which novel content is explored.
    pub explore_surprise: f64,
    /// Episodic activation worth recalling into an idle working tier.
    pub recall_floor: f64,
}

impl Default for DefaultMetacognition {
    fn default() -> Self {
        Self {
            explore_surprise: 0.75,
            recall_floor: 0.6,
        }
    }
}

#[async_trait::async_trait]
impl Metacognition for DefaultMetacognition {
    async fn decide(
        &self,
        ctx: &ReadContext<'_>,
        perception: &PerceptionReport,
        reasoning: &ReasoningReport,
    ) -> Result<Decision> {
        let novel = perception
            .observed
            .iter()
            .filter(|r| r.outcome == Outcome::Spawned && r.surprise >= self.explore_surprise)
            .fold(None, |best: Option<&ObservationResult>, r| match best {
                Some(b) if b.surprise >= r.surprise => best,
                _ => Some(r),
            });
        if let Some(result) = novel {
            return ctx.decide(
                Action::Explore { particle: result.particle },
                format!("surprise {:.2} on new content", result.surprise),
                result.surprise,
            );
        }

        let strongest = reasoning.basins.iter().fold(None, |best: Option<&Basin>, b| match best {
            Some(top) if top.cumulative_activation >= b.cumulative_activation => best,
            _ => Some(b),
        });
        if let Some(basin) = strongest {
            return ctx.decide(
                Action::Consolidate { basin: basin.id },
                format!("basin around '{}' is dominant", basin.centroid_key),
                (basin.cumulative_activation / basin.members.len().max(1) as f64).min(1.0),
            );
        }

        if let Some(step) = reasoning.plan.steps.first() {
            return ctx.decide(
                Action::Attend { particle: step.particle },
                format!("plan leads with '{}'", step.key),
                step.weight,
            );
        }

        let recall = ctx.query(
            Tier::Episodic,
            &ParticleQuery::all().min_activation(self.recall_floor).limit(1),
        )?;
        if let Some(summary) = recall.first() {
            return ctx.decide(
                Action::Recall { particle: summary.id },
                format!("working tier idle, recalling '{}'", summary.key),
                summary.activation,
            );
        }

        ctx.decide(Action::Idle, "nothing to attend to", 1.0)
    }
}

/// Logs each decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogActuator;

#[async_trait::async_trait]
impl Actuator for LogActuator {
    async fn act(&self, decision: &Decision) -> Result<()> {
        info!(
            "Cycle {} action {:?} (confidence {:.2}): {}",
            decision.cycle, decision.action, decision.confidence, decision.rationale
        );
        Ok(())
    }
}
