//! Stage tool sets
//!
//! A stage only touches runtime state through its context, and every call
//! on a context is checked against the capabilities granted to that stage.
//! Metacognition gets a `ReadContext`, which has no mutating calls at all.

use crate::stages::{Action, Decision};
use crate::state::CycleState;
use std::collections::HashSet;
use thoughtclaw_core::{
    Basin, Capability, Error, Observation, ParticleId, ParticleSummary, Result, Stage, Tier,
};
use thoughtclaw_inference::ObservationResult;
use thoughtclaw_memory::ParticleQuery;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ToolSet {
    stage: Stage,
    granted: HashSet<Capability>,
}

impl ToolSet {
    pub fn new(stage: Stage, granted: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            stage,
            granted: granted.into_iter().collect(),
        }
    }

    /// The standard grant for each stage. Each stage gets the previous
    /// stage's queries plus its own tools.
    pub fn for_stage(stage: Stage) -> Self {
        use Capability::*;
        match stage {
            Stage::Perception => Self::new(stage, [Observe, QueryWorking, QueryEpisodic]),
            Stage::Reasoning => Self::new(
                stage,
                [Observe, QueryWorking, QueryEpisodic, QuerySemantic, QueryBasins, Activate],
            ),
            Stage::Metacognition => Self::new(
                stage,
                [QueryWorking, QueryEpisodic, QuerySemantic, QueryBasins, SelectAction],
            ),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn grants(&self, capability: Capability) -> bool {
        self.granted.contains(&capability)
    }

    pub fn check(&self, capability: Capability) -> Result<()> {
        if self.grants(capability) {
            Ok(())
        } else {
            warn!("{} attempted '{}' without the capability", self.stage, capability);
            Err(Error::CapabilityDenied {
                stage: self.stage,
                capability,
            })
        }
    }
}

// ============================================================
// Read-only context
// ============================================================

pub struct ReadContext<'a> {
    tools: &'a ToolSet,
    state: &'a CycleState,
    cycle: u64,
    replan: bool,
}

impl<'a> ReadContext<'a> {
    pub fn new(tools: &'a ToolSet, state: &'a CycleState, cycle: u64, replan: bool) -> Self {
        Self { tools, state, cycle, replan }
    }

    pub fn stage(&self) -> Stage {
        self.tools.stage()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// True on the cycles where the plan is rebuilt from scratch.
    pub fn is_replan(&self) -> bool {
        self.replan
    }

    pub fn query(&self, tier: Tier, query: &ParticleQuery) -> Result<Vec<ParticleSummary>> {
        self.tools.check(Capability::query(tier))?;
        Ok(query
            .select(self.state.tiers.iter(tier))
            .into_iter()
            .map(|p| p.summary())
            .collect())
    }

    pub fn particle(&self, tier: Tier, id: ParticleId) -> Result<Option<ParticleSummary>> {
        self.tools.check(Capability::query(tier))?;
        Ok(self
            .state
            .tiers
            .get(id)
            .filter(|p| p.tier == tier)
            .map(|p| p.summary()))
    }

    pub fn basins(&self) -> Result<Vec<Basin>> {
        self.tools.check(Capability::QueryBasins)?;
        Ok(self.state.basins.basins().cloned().collect())
    }

    pub fn decide(
        &self,
        action: Action,
        rationale: impl Into<String>,
        confidence: f64,
    ) -> Result<Decision> {
        self.tools.check(Capability::SelectAction)?;
        Ok(Decision {
            action,
            rationale: rationale.into(),
            confidence: confidence.clamp(0.0, 1.0),
            cycle: self.cycle,
        })
    }
}

// ============================================================
// Mutable context
// ============================================================

pub struct StageContext<'a> {
    tools: &'a ToolSet,
    state: &'a mut CycleState,
    cycle: u64,
    replan: bool,
}

impl<'a> StageContext<'a> {
    pub fn new(tools: &'a ToolSet, state: &'a mut CycleState, cycle: u64, replan: bool) -> Self {
        Self { tools, state, cycle, replan }
    }

    /// Borrow the read-only half of this context.
    pub fn read(&self) -> ReadContext<'_> {
        ReadContext::new(self.tools, &*self.state, self.cycle, self.replan)
    }

    pub fn stage(&self) -> Stage {
        self.tools.stage()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn is_replan(&self) -> bool {
        self.replan
    }

    pub fn query(&self, tier: Tier, query: &ParticleQuery) -> Result<Vec<ParticleSummary>> {
        self.read().query(tier, query)
    }

    pub fn basins(&self) -> Result<Vec<Basin>> {
        self.read().basins()
    }

    /// Score an observation and reinforce or spawn.
    pub fn observe(&mut self, observation: Observation) -> Result<ObservationResult> {
        self.tools.check(Capability::Observe)?;
        let state = &mut *self.state;
        Ok(state.engine.observe(&mut state.tiers, observation, self.cycle))
    }

    /// Reinforce a specific particle; spawns if it has been pruned.
    pub fn reinforce(&mut self, target: ParticleId, observation: Observation) -> Result<ObservationResult> {
        self.tools.check(Capability::Observe)?;
        let state = &mut *self.state;
        Ok(state
            .engine
            .reinforce_or_spawn(&mut state.tiers, target, observation, self.cycle))
    }

    /// Spread `amount` from a particle to its resonant neighbours, scaled by
    /// edge weight and each neighbour's gain. Semantic neighbours are
    /// skipped. Returns the neighbours that were raised.
    pub fn activate(&mut self, source: ParticleId, amount: f64) -> Result<Vec<ParticleId>> {
        self.tools.check(Capability::Activate)?;
        let tiers = &mut self.state.tiers;
        let neighbours: Vec<(ParticleId, f64)> = match tiers.get(source) {
            Some(p) => p.resonance.iter().map(|(id, w)| (*id, *w)).collect(),
            None => return Err(Error::ParticleNotFound(source)),
        };
        let at = tiers.now();
        let mut raised = Vec::new();
        for (id, weight) in neighbours {
            if tiers.tier_of(id) == Some(Tier::Semantic) {
                continue;
            }
            if let Some(p) = tiers.get_mut(id) {
                p.reinforce(amount * weight, at, self.cycle);
                raised.push(id);
            }
        }
        debug!("{} spread {:.3} to {} neighbours", source, amount, raised.len());
        Ok(raised)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::sync::Arc;
    use thoughtclaw_core::{ExactKey, IdAllocator, RuntimeConfig, SessionId, SharedSimilarity};
    use thoughtclaw_inference::{BasinTracker, InferenceEngine};
    use thoughtclaw_memory::TierSet;

    fn state() -> CycleState {
        let config = RuntimeConfig::default();
        let similarity: SharedSimilarity = Arc::new(ExactKey);
        CycleState::new(
            TierSet::new(config.memory, similarity.clone(), SessionId(1)),
            InferenceEngine::new(config.inference, similarity, IdAllocator::starting_at(1)),
            BasinTracker::new(config.basin, IdAllocator::starting_at(1)),
        )
    }

    fn obs(key: &str) -> Observation {
        Observation::new(key, "", DateTime::<Utc>::UNIX_EPOCH)
    }

    #[test]
    fn perception_cannot_query_semantic_or_activate() {
        let tools = ToolSet::for_stage(Stage::Perception);
        let mut st = state();
        let mut ctx = StageContext::new(&tools, &mut st, 1, false);
        let id = ctx.observe(obs("a")).unwrap().particle;
        assert!(ctx.query(Tier::Working, &ParticleQuery::all()).is_ok());
        let err = ctx.query(Tier::Semantic, &ParticleQuery::all()).unwrap_err();
        assert!(matches!(
            err,
            Error::CapabilityDenied { stage: Stage::Perception, capability: Capability::QuerySemantic }
        ));
        assert!(ctx.activate(id, 0.1).is_err());
        assert!(ctx.basins().is_err());
    }

    #[test]
    fn metacognition_decides_but_cannot_observe() {
        let tools = ToolSet::for_stage(Stage::Metacognition);
        let mut st = state();
        {
            let mut ctx = StageContext::new(&tools, &mut st, 1, false);
            assert!(ctx.observe(obs("a")).is_err());
        }
        let ctx = ReadContext::new(&tools, &st, 4, true);
        let decision = ctx.decide(Action::Idle, "nothing to do", 1.5).unwrap();
        assert_eq!(decision.cycle, 4);
        assert_eq!(decision.confidence, 1.0);
        assert!(ctx.is_replan());
    }

    #[test]
    fn reasoning_cannot_select_actions() {
        let tools = ToolSet::for_stage(Stage::Reasoning);
        let st = state();
        let ctx = ReadContext::new(&tools, &st, 1, false);
        assert!(ctx.decide(Action::Idle, "", 0.5).is_err());
        assert!(ctx.basins().is_ok());
    }

    #[test]
    fn activation_spreads_along_resonance() {
        let tools = ToolSet::for_stage(Stage::Reasoning);
        let mut st = state();
        let mut ctx = StageContext::new(&tools, &mut st, 1, false);
        let a = ctx.observe(obs("a")).unwrap().particle;
        let b = ctx.observe(obs("b")).unwrap().particle;
        let c = ctx.observe(obs("c")).unwrap().particle;
        drop(ctx);
        st.tiers.link(a, b, 0.5);
        st.tiers.decay_all();

        let mut ctx = StageContext::new(&tools, &mut st, 2, false);
        let raised = ctx.activate(a, 0.2).unwrap();
        assert_eq!(raised, vec![b]);
        let before = 1.0 - RuntimeConfig::default().memory.working_decay_rate;
        let b_now = st.tiers.get(b).unwrap().activation();
        assert!((b_now - (before + 0.1)).abs() < 1e-9);
        assert!((st.tiers.get(c).unwrap().activation() - before).abs() < 1e-9);
    }

    #[test]
    fn activating_missing_particle_fails() {
        let tools = ToolSet::for_stage(Stage::Reasoning);
        let mut st = state();
        let mut ctx = StageContext::new(&tools, &mut st, 1, false);
        assert!(matches!(ctx.activate(ParticleId(7), 0.1), Err(Error::ParticleNotFound(_))));
    }
}
