//! CognitiveRuntime - one owned runtime instance per session
//!
//! Wraps a heartbeat with the external surface: ingest, snapshot queries,
//! the basin feed, and session continuity. Committed state is only reachable
//! through published snapshots, never by reference into a running cycle.

use crate::scheduler::{CycleOutcome, Heartbeat, Outputs, RunSummary, Termination};
use crate::stages::{Actuator, Metacognition, Perception, Reasoning, Stages};
use crate::state::{CycleState, RuntimeEvent, RuntimeSnapshot, SchedulerCounters};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thoughtclaw_core::{
    BasinTransition, ContentKey, IdAllocator, Observation, ParticleId, ParticleSummary, Result,
    RuntimeConfig, SessionId, SharedSimilarity, Similarity, Tier,
};
use thoughtclaw_inference::{BasinTracker, InferenceEngine, TokenJaccard};
use thoughtclaw_memory::{
    Continuity, JsonlSink, ParticleQuery, SemanticSink, SessionRecord, SessionStore, TierSet,
    CONTINUITY_VERSION,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const FEED_CAPACITY: usize = 256;

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    similarity: SharedSimilarity,
    stages: Stages,
    session_dir: Option<PathBuf>,
    sink: Option<Arc<dyn SemanticSink>>,
    cancel: CancellationToken,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            session_dir: config.persistence.session_dir.clone(),
            config,
            similarity: Arc::new(TokenJaccard),
            stages: Stages::default(),
            sink: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn similarity(mut self, similarity: impl Similarity + 'static) -> Self {
        self.similarity = Arc::new(similarity);
        self
    }

    pub fn perception(mut self, stage: impl Perception + 'static) -> Self {
        self.stages.perception = Arc::new(stage);
        self
    }

    pub fn reasoning(mut self, stage: impl Reasoning + 'static) -> Self {
        self.stages.reasoning = Arc::new(stage);
        self
    }

    pub fn metacognition(mut self, stage: impl Metacognition + 'static) -> Self {
        self.stages.metacognition = Arc::new(stage);
        self
    }

    pub fn actuator(mut self, actuator: impl Actuator + 'static) -> Self {
        self.stages.actuator = Arc::new(actuator);
        self
    }

    /// Directory holding `session.json`. Overrides `persistence.session_dir`.
    pub fn session_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.session_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Overrides `persistence.semantic_log`.
    pub fn semantic_sink(mut self, sink: Arc<dyn SemanticSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Validate config, hydrate the previous session and seed working memory.
    pub fn build(self) -> Result<CognitiveRuntime> {
        let config = self.config;
        config.validate()?;

        let store = self.session_dir.map(SessionStore::new);
        let continuity = store.as_ref().map(SessionStore::load).transpose()?.unwrap_or_default();
        let session = continuity.next_session();
        let particle_ids = IdAllocator::starting_at(continuity.next_particle_id.max(1));
        let basin_ids = IdAllocator::starting_at(continuity.next_basin_id.max(1));

        let mut tiers = TierSet::new(config.memory.clone(), self.similarity.clone(), session);
        tiers.restore(
            continuity.episodic.clone(),
            continuity.semantic.clone(),
            continuity.arrivals.clone(),
        );
        if let Some(max) = Tier::ALL.iter().flat_map(|t| tiers.iter(*t)).map(|p| p.id.0).max() {
            particle_ids.advance_to(max + 1);
        }

        let mut basins = BasinTracker::new(config.basin.clone(), basin_ids.clone());
        let mut seeded = 0;
        if let Some(last) = continuity.last_session() {
            seeded = seed_working(&mut tiers, last)?;
            basins.restore(last.basins.clone());
        }
        tiers.take_journal();

        let engine = InferenceEngine::new(config.inference.clone(), self.similarity, particle_ids.clone());
        let state = CycleState::new(tiers, engine, basins);

        let sink = self.sink.or_else(|| {
            config
                .persistence
                .semantic_log
                .as_ref()
                .map(|path| Arc::new(JsonlSink::new(path)) as Arc<dyn SemanticSink>)
        });

        let (snapshot_tx, snapshots) = watch::channel(Arc::new(RuntimeSnapshot::capture(
            &state,
            SchedulerCounters::default(),
            0,
            None,
            None,
        )));
        let (basin_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (event_tx, _) = broadcast::channel(FEED_CAPACITY);
        let (inbox, inbox_rx) = mpsc::unbounded_channel();

        info!(
            "Opened session {} ({} episodic, {} semantic, {} seeded into working)",
            session,
            state.tiers.len(Tier::Episodic),
            state.tiers.len(Tier::Semantic),
            seeded
        );

        let outputs = Outputs {
            snapshots: snapshot_tx,
            basins: basin_tx.clone(),
            events: event_tx.clone(),
        };
        let heartbeat = Heartbeat::new(config.clone(), self.stages, state, inbox_rx, outputs, sink);

        Ok(CognitiveRuntime {
            config,
            session,
            started_at: Utc::now(),
            history: continuity.sessions,
            store,
            heartbeat: Mutex::new(heartbeat),
            inbox,
            particle_ids,
            basin_ids,
            snapshots,
            basin_tx,
            event_tx,
            cancel: self.cancel,
        })
    }
}

/// Move the previous session's promoted particles that are still episodic
/// back into working memory, strongest first, up to capacity.
fn seed_working(tiers: &mut TierSet, last: &SessionRecord) -> Result<usize> {
    let promoted: BTreeSet<ParticleId> = last.promoted.iter().copied().collect();
    let mut candidates: Vec<(ParticleId, f64)> = promoted
        .into_iter()
        .filter_map(|id| tiers.episodic().get(id).map(|p| (id, p.activation())))
        .collect();
    candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    });
    candidates.truncate(tiers.working().capacity());
    for (id, _) in &candidates {
        tiers.recall(*id, 0)?;
    }
    debug!("Seeded {} particles from session {}", candidates.len(), last.session);
    Ok(candidates.len())
}

pub struct CognitiveRuntime {
    config: RuntimeConfig,
    session: SessionId,
    started_at: DateTime<Utc>,
    history: Vec<SessionRecord>,
    store: Option<SessionStore>,
    heartbeat: Mutex<Heartbeat>,
    inbox: mpsc::UnboundedSender<Observation>,
    particle_ids: IdAllocator,
    basin_ids: IdAllocator,
    snapshots: watch::Receiver<Arc<RuntimeSnapshot>>,
    basin_tx: broadcast::Sender<BasinTransition>,
    event_tx: broadcast::Sender<RuntimeEvent>,
    cancel: CancellationToken,
}

impl CognitiveRuntime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Sessions recorded before this one.
    pub fn history(&self) -> &[SessionRecord] {
        &self.history
    }

    // ============================================================
    // Ingest
    // ============================================================

    /// Queue input for the next cycle's Perception. The returned id is the
    /// one a spawned particle will carry; if the observation reinforces an
    /// existing particle instead, `RuntimeEvent::Observed` names that one.
    pub fn observe(
        &self,
        key: impl Into<ContentKey>,
        payload: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> ParticleId {
        self.ingest(Observation::new(key, payload, timestamp))
    }

    pub fn ingest(&self, observation: Observation) -> ParticleId {
        let ticket = ParticleId(self.particle_ids.next());
        debug!("Queued '{}' as {}", observation.key, ticket);
        if self.inbox.send(observation.with_ticket(ticket)).is_err() {
            warn!("Heartbeat inbox closed, dropping {}", ticket);
        }
        ticket
    }

    // ============================================================
    // Read side
    // ============================================================

    pub fn snapshot(&self) -> Arc<RuntimeSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Arc<RuntimeSnapshot>> {
        self.snapshots.clone()
    }

    /// Glob over content keys in one tier of the latest snapshot.
    pub fn query(&self, tier: Tier, pattern: &str) -> Result<Vec<ParticleSummary>> {
        let query = ParticleQuery::pattern(pattern)?;
        Ok(self.snapshot().query(tier, &query))
    }

    pub fn query_with(&self, tier: Tier, query: &ParticleQuery) -> Vec<ParticleSummary> {
        self.snapshot().query(tier, query)
    }

    pub fn basin_feed(&self) -> BroadcastStream<BasinTransition> {
        BroadcastStream::new(self.basin_tx.subscribe())
    }

    pub fn events(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.event_tx.subscribe()
    }

    // ============================================================
    // Driving
    // ============================================================

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cooperative stop. The running cycle commits its decay step and the
    /// loop returns. A cancelled runtime stays cancelled.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn run<T: Termination>(&self, task: T) -> Result<RunSummary> {
        let mut heartbeat = self.heartbeat.lock().await;
        heartbeat.run(task, &self.cancel).await
    }

    /// A single cycle, for callers that drive the cadence themselves.
    pub async fn beat(&self) -> Result<CycleOutcome> {
        let mut heartbeat = self.heartbeat.lock().await;
        heartbeat.beat(&self.cancel).await
    }

    /// End the session: working memory is demoted to episodic, outstanding
    /// semantic writes finish, and the session record is persisted.
    pub async fn close(self) -> Result<SessionRecord> {
        let mut heartbeat = self.heartbeat.into_inner();
        let released = heartbeat.wind_down().await;

        let state = heartbeat.state();
        let record = SessionRecord {
            session: self.session,
            started_at: self.started_at,
            ended_at: Some(Utc::now()),
            cycles: heartbeat.cycle(),
            basins: state.basins.basins().cloned().collect(),
            promoted: heartbeat.promoted().to_vec(),
        };

        if let Some(store) = &self.store {
            let (episodic, semantic, arrivals) = state.tiers.export();
            let mut sessions = self.history;
            sessions.push(record.clone());
            let continuity = Continuity {
                version: CONTINUITY_VERSION,
                sessions,
                episodic,
                semantic,
                arrivals,
                next_particle_id: self.particle_ids.peek(),
                next_basin_id: self.basin_ids.peek(),
            };
            store.save(&continuity)?;
            info!("Saved session {} to {}", self.session, store.path().display());
        }

        info!(
            "Closed session {} after {} cycles ({} released to episodic, {} promoted)",
            record.session,
            record.cycles,
            released.len(),
            record.promoted.len()
        );
        let _ = self.event_tx.send(RuntimeEvent::SessionClosed {
            session: record.session,
            cycles: record.cycles,
        });
        Ok(record)
    }
}
