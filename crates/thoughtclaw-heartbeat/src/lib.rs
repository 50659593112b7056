//! Thoughtclaw Heartbeat - stage agents, the cycle scheduler and the runtime facade
//!
//! One heartbeat drives one runtime instance. Each cycle decays every tier,
//! runs Perception, Reasoning and Metacognition in order against a private
//! copy of the committed state, executes the chosen action and swaps the copy
//! in. A failed or timed-out stage throws the copy away.

pub mod runtime;
pub mod scheduler;
pub mod stages;
pub mod state;
pub mod tools;

pub use runtime::{CognitiveRuntime, RuntimeBuilder};
pub use scheduler::{CycleOutcome, Cycles, Heartbeat, Outputs, RunSummary, Termination};
pub use stages::{
    Action, Actuator, Decision, DefaultMetacognition, DefaultPerception, DefaultReasoning,
    LogActuator, Metacognition, Perception, PerceptionReport, Plan, PlanStep, Reasoning,
    ReasoningReport, Stages,
};
pub use state::{CycleState, RuntimeEvent, RuntimeSnapshot, RuntimeStats, SchedulerCounters};
pub use tools::{ReadContext, StageContext, ToolSet};
