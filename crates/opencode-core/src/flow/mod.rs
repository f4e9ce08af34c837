//! Declarative multi-step flows run by agents.
//!
//! A flow is a YAML document describing steps and the rules that route
//! between them. The engine persists one [`FlowState`] per step session so
//! a run can be resumed or inspected later.

mod definition;
mod engine;
mod expr;
mod state;

pub use definition::{Fallback, Flow, FlowRegistry, MAX_FLOW_FILE_BYTES, Rule, Step, StepOutput, StepSession, is_kebab_case};
pub use engine::FlowEngine;
pub use expr::{Predicate, PredicateError, substitute};
pub use state::FlowStateService;

use async_trait::async_trait;
use opencode_types::{AgentEvent, FlowState};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::agent::RunOutcome;

/// An agent event produced while running `step_id`.
#[derive(Debug, Clone, PartialEq)]
pub struct StepEvent {
    pub step_id: String,
    pub event: AgentEvent,
}

/// Streams of a started flow. Both close when every step has finished.
pub struct FlowRun {
    pub root_session_id: String,
    pub agent_events: mpsc::Receiver<StepEvent>,
    pub states: mpsc::Receiver<FlowState>,
    pub handle: JoinHandle<()>,
}

/// Runs one step's agent on its session.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
        session_id: &str,
        prompt: &str,
        output_schema: Option<Value>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome>;
}
