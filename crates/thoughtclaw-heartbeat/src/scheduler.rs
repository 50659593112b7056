//! Heartbeat scheduler
//!
//! Each cycle: decay every tier, check for cancellation, Perception, basin
//! update, Reasoning, Metacognition, act, commit. All of it happens on a
//! clone of the committed state, so an error or timeout in any stage leaves
//! the committed state exactly as it was. Every `planning_interval`th cycle
//! Reasoning gets no previous plan and rebuilds from the fresh Perception
//! report.

use crate::stages::{Action, Decision, Plan, Stages};
use crate::state::{CycleState, RuntimeEvent, RuntimeSnapshot, SchedulerCounters};
use crate::tools::{ReadContext, StageContext, ToolSet};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thoughtclaw_core::{
    BasinTransition, Error, Observation, Particle, ParticleId, Result, RuntimeConfig, Stage, Tier,
};
use thoughtclaw_inference::ObservationResult;
use thoughtclaw_memory::{spawn_persist, SemanticSink, TierEvent};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Committed {
        cycle: u64,
        replanned: bool,
        transitions: usize,
    },
    /// A stage failed or timed out; nothing from the cycle was kept.
    Abandoned { cycle: u64, stage: Stage },
    /// Cancellation arrived after decay; the decay-only cycle was committed.
    Cancelled { cycle: u64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub committed: u64,
    pub abandoned: u64,
    pub cancelled: bool,
    pub last_cycle: u64,
}

/// Externally supplied stop condition, checked before every cycle.
pub trait Termination: Send {
    fn should_stop(&mut self, snapshot: &RuntimeSnapshot) -> bool;
}

impl<F> Termination for F
where
    F: FnMut(&RuntimeSnapshot) -> bool + Send,
{
    fn should_stop(&mut self, snapshot: &RuntimeSnapshot) -> bool {
        self(snapshot)
    }
}

/// Stop after this many committed cycles in the current run.
#[derive(Debug, Clone, Copy)]
pub struct Cycles {
    limit: u64,
    start: Option<u64>,
}

impl Cycles {
    pub fn new(limit: u64) -> Self {
        Self { limit, start: None }
    }
}

impl Termination for Cycles {
    fn should_stop(&mut self, snapshot: &RuntimeSnapshot) -> bool {
        let start = *self.start.get_or_insert(snapshot.cycle);
        snapshot.cycle.saturating_sub(start) >= self.limit
    }
}

/// Where a heartbeat publishes what it commits.
pub struct Outputs {
    pub snapshots: watch::Sender<Arc<RuntimeSnapshot>>,
    pub basins: broadcast::Sender<BasinTransition>,
    pub events: broadcast::Sender<RuntimeEvent>,
}

struct StageTools {
    perception: ToolSet,
    reasoning: ToolSet,
    metacognition: ToolSet,
}

pub struct Heartbeat {
    config: RuntimeConfig,
    stages: Stages,
    tools: StageTools,
    inbox: mpsc::UnboundedReceiver<Observation>,
    pending: VecDeque<Observation>,
    committed: CycleState,
    cycle: u64,
    plan: Option<Plan>,
    decision: Option<Decision>,
    last_replanned: bool,
    last_observed: usize,
    counters: SchedulerCounters,
    consecutive_failures: u32,
    /// Working -> Episodic promotions this session.
    promoted: Vec<ParticleId>,
    sink: Option<Arc<dyn SemanticSink>>,
    persisting: Vec<JoinHandle<()>>,
    outputs: Outputs,
}

impl Heartbeat {
    pub fn new(
        config: RuntimeConfig,
        stages: Stages,
        state: CycleState,
        inbox: mpsc::UnboundedReceiver<Observation>,
        outputs: Outputs,
        sink: Option<Arc<dyn SemanticSink>>,
    ) -> Self {
        let mut heartbeat = Self {
            config,
            stages,
            tools: StageTools {
                perception: ToolSet::for_stage(Stage::Perception),
                reasoning: ToolSet::for_stage(Stage::Reasoning),
                metacognition: ToolSet::for_stage(Stage::Metacognition),
            },
            inbox,
            pending: VecDeque::new(),
            committed: state,
            cycle: 0,
            plan: None,
            decision: None,
            last_replanned: false,
            last_observed: 0,
            counters: SchedulerCounters::default(),
            consecutive_failures: 0,
            promoted: Vec::new(),
            sink,
            persisting: Vec::new(),
            outputs,
        };
        heartbeat.publish();
        heartbeat
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn state(&self) -> &CycleState {
        &self.committed
    }

    pub fn plan(&self) -> Option<&Plan> {
        self.plan.as_ref()
    }

    pub fn promoted(&self) -> &[ParticleId] {
        &self.promoted
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    // ============================================================
    // Run loop
    // ============================================================

    /// Beat until `task` says stop, cancellation commits a final cycle, or
    /// too many consecutive cycles are abandoned.
    pub async fn run<T: Termination>(&mut self, mut task: T, cancel: &CancellationToken) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        let mut ticker = match self.config.heartbeat.tick_ms {
            0 => None,
            ms => {
                let mut interval = tokio::time::interval(Duration::from_millis(ms));
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                Some(interval)
            }
        };
        info!(
            "Heartbeat running from cycle {} (session {}, tick {}ms)",
            self.cycle,
            self.committed.tiers.session(),
            self.config.heartbeat.tick_ms
        );

        loop {
            let snapshot = self.outputs.snapshots.borrow().clone();
            if task.should_stop(&snapshot) {
                break;
            }
            match ticker.as_mut() {
                Some(interval) => {
                    tokio::select! {
                        _ = interval.tick() => {}
                        _ = cancel.cancelled() => {}
                    }
                }
                None => tokio::task::yield_now().await,
            }
            match self.beat(cancel).await? {
                CycleOutcome::Committed { .. } => summary.committed += 1,
                CycleOutcome::Abandoned { .. } => summary.abandoned += 1,
                CycleOutcome::Cancelled { .. } => {
                    summary.committed += 1;
                    summary.cancelled = true;
                    break;
                }
            }
        }

        summary.last_cycle = self.cycle;
        info!(
            "Heartbeat stopped at cycle {} ({} committed, {} abandoned{})",
            summary.last_cycle,
            summary.committed,
            summary.abandoned,
            if summary.cancelled { ", cancelled" } else { "" }
        );
        Ok(summary)
    }

    /// One full cycle.
    pub async fn beat(&mut self, cancel: &CancellationToken) -> Result<CycleOutcome> {
        let cycle = self.cycle + 1;
        let replan = cycle % self.config.heartbeat.planning_interval == 0;
        self.drain_inbox();
        let input: Vec<Observation> = self.pending.drain(..).collect();
        let stages = self.stages.clone();
        let mut work = self.committed.clone();

        // (1) decay
        work.tiers.decay_all();

        if cancel.is_cancelled() {
            info!("Cancellation requested, committing decay-only cycle {}", cycle);
            self.requeue(input);
            let transitions = settle_basins(&mut work, cycle);
            self.commit(work, cycle, false, None, None, transitions, Vec::new());
            self.emit(RuntimeEvent::Cancelled { cycle });
            return Ok(CycleOutcome::Cancelled { cycle });
        }

        // (2) perception
        let perception = {
            let mut ctx = StageContext::new(&self.tools.perception, &mut work, cycle, replan);
            timed(
                Stage::Perception,
                self.config.stages.timeout(Stage::Perception),
                stages.perception.perceive(&mut ctx, input.clone()),
            )
            .await
        };
        let perception = match perception {
            Ok(report) => report,
            Err(e) => return self.abandon(cycle, Stage::Perception, e, input),
        };
        let transitions = settle_basins(&mut work, cycle);

        // (3) reasoning
        if replan {
            info!("Cycle {}: full replan from {} fresh observations", cycle, perception.observed.len());
        }
        let previous = if replan { None } else { self.plan.clone() };
        let reasoning = {
            let mut ctx = StageContext::new(&self.tools.reasoning, &mut work, cycle, replan);
            timed(
                Stage::Reasoning,
                self.config.stages.timeout(Stage::Reasoning),
                stages.reasoning.reason(&mut ctx, &perception, previous.as_ref()),
            )
            .await
        };
        let reasoning = match reasoning {
            Ok(report) => report,
            Err(e) => return self.abandon(cycle, Stage::Reasoning, e, input),
        };

        // (4) metacognition
        let decision = {
            let ctx = ReadContext::new(&self.tools.metacognition, &work, cycle, replan);
            timed(
                Stage::Metacognition,
                self.config.stages.timeout(Stage::Metacognition),
                stages.metacognition.decide(&ctx, &perception, &reasoning),
            )
            .await
        };
        let decision = match decision {
            Ok(decision) => decision,
            Err(e) => return self.abandon(cycle, Stage::Metacognition, e, input),
        };

        // (5) act
        apply(&mut work, &decision.action, cycle);
        if let Err(e) = stages.actuator.act(&decision).await {
            warn!("Actuator failed on cycle {}: {}", cycle, e);
        }

        // (6) commit, (7) advance
        let count = transitions.len();
        self.commit(
            work,
            cycle,
            replan,
            Some(reasoning.plan),
            Some(decision),
            transitions,
            perception.observed,
        );
        Ok(CycleOutcome::Committed {
            cycle,
            replanned: replan,
            transitions: count,
        })
    }

    /// Demote working memory into episodic as at session close, hand any
    /// resulting beliefs to the sink and wait for outstanding writes.
    pub async fn wind_down(&mut self) -> Vec<ParticleId> {
        let released = self.committed.tiers.release_working();
        self.absorb_journal();
        self.flush().await;
        self.publish();
        released
    }

    /// Wait for every in-flight semantic write.
    pub async fn flush(&mut self) {
        for handle in self.persisting.drain(..) {
            if let Err(e) = handle.await {
                warn!("Semantic persistence task failed: {}", e);
            }
        }
    }

    // ============================================================
    // Internals
    // ============================================================

    #[allow(clippy::too_many_arguments)]
    fn commit(
        &mut self,
        mut work: CycleState,
        cycle: u64,
        replanned: bool,
        plan: Option<Plan>,
        decision: Option<Decision>,
        transitions: Vec<BasinTransition>,
        observed: Vec<ObservationResult>,
    ) {
        work.tiers.end_cycle(cycle);
        self.committed = work;
        self.cycle = cycle;
        if plan.is_some() {
            self.plan = plan;
        }
        if decision.is_some() {
            self.decision = decision;
        }
        self.consecutive_failures = 0;
        self.counters.cycles += 1;
        if replanned {
            self.counters.replans += 1;
        }
        self.counters.transitions += transitions.len() as u64;
        self.last_replanned = replanned;
        self.last_observed = observed.len();
        self.absorb_journal();
        self.publish();

        debug!(
            "Cycle {} committed: {} observed, {} working, {} episodic, {} semantic, {} basins",
            cycle,
            observed.len(),
            self.committed.tiers.len(Tier::Working),
            self.committed.tiers.len(Tier::Episodic),
            self.committed.tiers.len(Tier::Semantic),
            self.committed.basins.len()
        );

        for result in observed {
            self.emit(RuntimeEvent::Observed {
                ticket: result.ticket,
                particle: result.particle,
                outcome: result.outcome,
                surprise: result.surprise,
            });
        }
        let count = transitions.len();
        for transition in transitions {
            // No subscribers is fine.
            let _ = self.outputs.basins.send(transition);
        }
        self.emit(RuntimeEvent::Committed {
            cycle,
            replanned,
            transitions: count,
        });
    }

    fn abandon(&mut self, cycle: u64, stage: Stage, error: Error, input: Vec<Observation>) -> Result<CycleOutcome> {
        self.requeue(input);
        self.consecutive_failures += 1;
        self.counters.stage_failures += 1;
        warn!(
            "Cycle {} abandoned in {}: {} ({} consecutive)",
            cycle, stage, error, self.consecutive_failures
        );
        self.emit(RuntimeEvent::Abandoned {
            cycle,
            stage,
            reason: error.to_string(),
        });
        self.publish();

        let consecutive = self.consecutive_failures;
        if consecutive >= self.config.heartbeat.degraded_after {
            error!("Runtime degraded: {} consecutive cycles abandoned", consecutive);
            self.emit(RuntimeEvent::Degraded { consecutive });
            return Err(Error::RuntimeDegraded { consecutive });
        }
        Ok(CycleOutcome::Abandoned { cycle, stage })
    }

    /// Record promotions and ship new beliefs to the sink.
    fn absorb_journal(&mut self) {
        let journal = self.committed.tiers.take_journal();
        let mut beliefs: Vec<Particle> = Vec::new();
        for event in journal {
            match event {
                TierEvent::Promoted { id, from: Tier::Working, .. } => self.promoted.push(id),
                TierEvent::Promoted { id, to: Tier::Semantic, .. } => {
                    if let Some(p) = self.committed.tiers.semantic().get(id) {
                        beliefs.push(p.clone());
                    }
                }
                _ => {}
            }
        }
        self.persisting.retain(|h| !h.is_finished());
        if let Some(sink) = &self.sink {
            if let Some(handle) = spawn_persist(sink.clone(), beliefs) {
                self.persisting.push(handle);
            }
        }
    }

    fn drain_inbox(&mut self) {
        while let Ok(observation) = self.inbox.try_recv() {
            self.pending.push_back(observation);
        }
    }

    /// Put unprocessed observations back ahead of anything newer.
    fn requeue(&mut self, input: Vec<Observation>) {
        for observation in input.into_iter().rev() {
            self.pending.push_front(observation);
        }
    }

    fn publish(&mut self) {
        self.drain_inbox();
        let mut snapshot = RuntimeSnapshot::capture(
            &self.committed,
            self.counters,
            self.cycle,
            self.plan.clone(),
            self.decision.clone(),
        );
        snapshot.replanned = self.last_replanned;
        snapshot.observed = self.last_observed;
        snapshot.pending = self.pending.len();
        self.outputs.snapshots.send_replace(Arc::new(snapshot));
    }

    fn emit(&self, event: RuntimeEvent) {
        let _ = self.outputs.events.send(event);
    }
}

fn settle_basins(state: &mut CycleState, cycle: u64) -> Vec<BasinTransition> {
    let floor = state.basins.config().active_floor;
    let active = state.tiers.active_particles(floor);
    state.basins.update(&active, cycle)
}

/// Memory side of a decision. The actuator handles the outside world.
fn apply(state: &mut CycleState, action: &Action, cycle: u64) {
    let at = state.tiers.now();
    match action {
        Action::Attend { particle } => {
            if let Some(p) = state.tiers.working_mut().get_mut(*particle) {
                p.touch(at, cycle);
            }
        }
        Action::Recall { particle } => {
            if state.tiers.tier_of(*particle) == Some(Tier::Episodic) {
                if let Err(e) = state.tiers.recall(*particle, cycle) {
                    warn!("Recall of {} failed: {}", particle, e);
                }
            }
        }
        Action::Consolidate { basin } => {
            let members = state
                .basins
                .get(*basin)
                .map(|b| b.members.clone())
                .unwrap_or_default();
            for id in members {
                if let Some(p) = state.tiers.working_mut().get_mut(id) {
                    p.touch(at, cycle);
                }
            }
        }
        Action::Explore { .. } | Action::Idle => {}
    }
}

/// Bound a stage call. Timeouts and foreign errors become stage failures.
async fn timed<T, F>(stage: Stage, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) if e.is_stage_failure() => Err(e),
        Ok(Err(e)) => Err(Error::stage_failed(stage, e.to_string())),
        Err(_) => Err(Error::StageTimeout {
            stage,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}
