//! Flow scheduling: a work queue of steps, each run as its own task.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use opencode_types::{AgentEvent, FlowState, FlowStatus, new_id, now_unix};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::definition::{Flow, FlowRegistry, Step};
use super::expr::substitute;
use super::state::FlowStateService;
use super::{FlowRun, StepEvent, StepExecutor};
use crate::agent::RunOutcome;
use crate::permission::PermissionGate;
use crate::retry::sleep_cancelable;
use crate::session::SessionService;
use crate::sync::lock_unpoisoned;
use crate::{CoreError, Result};

const CHANNEL_BUFFER: usize = 1024;
const GENERATED_PREFIX_LEN: usize = 8;

/// Steps already started under one root, shared by concurrent runs.
struct StartedSteps {
    steps: Arc<DashSet<String>>,
    runs: usize,
}

/// Releases a root's started set when its last run ends.
struct StartedGuard {
    engine: Arc<FlowEngine>,
    root_session_id: String,
}

impl Drop for StartedGuard {
    fn drop(&mut self) {
        let mut started = lock_unpoisoned(&self.engine.started);
        if let Some(entry) = started.get_mut(&self.root_session_id) {
            entry.runs = entry.runs.saturating_sub(1);
            if entry.runs == 0 {
                started.remove(&self.root_session_id);
            }
        }
    }
}

#[derive(Debug, Clone)]
struct Upstream {
    session_id: String,
    output: String,
}

#[derive(Debug, Clone)]
struct WorkItem {
    step_id: String,
    args: Map<String, Value>,
    upstream: Option<Upstream>,
}

pub struct FlowEngine {
    flows: FlowRegistry,
    sessions: Arc<SessionService>,
    permissions: Arc<PermissionGate>,
    states: Arc<FlowStateService>,
    executor: Arc<dyn StepExecutor>,
    started: Mutex<HashMap<String, StartedSteps>>,
}

impl FlowEngine {
    pub fn new(
        flows: FlowRegistry,
        sessions: Arc<SessionService>,
        permissions: Arc<PermissionGate>,
        states: Arc<FlowStateService>,
        executor: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            flows,
            sessions,
            permissions,
            states,
            executor,
            started: Mutex::new(HashMap::new()),
        }
    }

    pub fn flows(&self) -> &FlowRegistry {
        &self.flows
    }

    pub fn states(&self) -> &Arc<FlowStateService> {
        &self.states
    }

    /// Start a flow. Unknown or disabled flows and invalid args fail here;
    /// step outcomes arrive on the returned streams.
    ///
    /// When the root already has running steps the run only replays their
    /// persisted states. `fresh` discards earlier states and step sessions
    /// first.
    pub async fn run(
        self: &Arc<Self>,
        cancel: &CancellationToken,
        session_prefix: &str,
        flow_id: &str,
        args: Map<String, Value>,
        fresh: bool,
    ) -> Result<FlowRun> {
        let flow = self.flows.get(flow_id)?.clone();
        if flow.disabled {
            return Err(CoreError::FlowDisabled(flow_id.to_string()));
        }
        flow.validate_args(&args)?;

        let prefix = resolve_prefix(session_prefix, &flow, &args);
        let root_session_id = format!("{prefix}-{}-{}", flow.id, flow.first_step().id);
        let (state_tx, states) = mpsc::channel(CHANNEL_BUFFER);
        let (event_tx, agent_events) = mpsc::channel(CHANNEL_BUFFER);

        if fresh {
            self.reset(&root_session_id).await?;
        } else {
            let existing = self.states.list(&root_session_id).await?;
            if existing.iter().any(|s| s.status == FlowStatus::Running) {
                info!(
                    target: "opencode::flow",
                    flow = %flow.id,
                    root = %root_session_id,
                    steps = existing.len(),
                    "Flow already running, replaying states"
                );
                let handle = tokio::spawn(async move {
                    for state in existing {
                        if state_tx.send(state).await.is_err() {
                            break;
                        }
                    }
                });
                return Ok(FlowRun {
                    root_session_id,
                    agent_events,
                    states,
                    handle,
                });
            }
        }

        let started = self.acquire_started(&root_session_id);
        info!(target: "opencode::flow", flow = %flow.id, root = %root_session_id, "Flow started");
        let runner = StepRunner {
            engine: self.clone(),
            flow: Arc::new(flow),
            prefix,
            root_session_id: root_session_id.clone(),
            cancel: cancel.child_token(),
            state_tx,
            event_tx,
        };
        let handle: JoinHandle<()> = tokio::spawn(runner.drive(args, started));
        Ok(FlowRun {
            root_session_id,
            agent_events,
            states,
            handle,
        })
    }

    async fn reset(&self, root_session_id: &str) -> Result<()> {
        let deleted = self.states.delete_root(root_session_id).await?;
        if self.sessions.find(root_session_id).await?.is_some() {
            self.sessions.delete(root_session_id).await?;
        }
        debug!(target: "opencode::flow", root = %root_session_id, states = deleted, "Flow reset");
        Ok(())
    }

    fn acquire_started(self: &Arc<Self>, root_session_id: &str) -> (Arc<DashSet<String>>, StartedGuard) {
        let mut started = lock_unpoisoned(&self.started);
        let entry = started
            .entry(root_session_id.to_string())
            .or_insert_with(|| StartedSteps {
                steps: Arc::new(DashSet::new()),
                runs: 0,
            });
        entry.runs += 1;
        let guard = StartedGuard {
            engine: self.clone(),
            root_session_id: root_session_id.to_string(),
        };
        (entry.steps.clone(), guard)
    }
}

/// Explicit prefix, else the flow's own prefix template, else a random one.
fn resolve_prefix(explicit: &str, flow: &Flow, args: &Map<String, Value>) -> String {
    if !explicit.trim().is_empty() {
        return explicit.trim().to_string();
    }
    if let Some(template) = &flow.session_prefix {
        let rendered = substitute(template, args);
        if !rendered.trim().is_empty() {
            return rendered.trim().to_string();
        }
    }
    new_id().chars().take(GENERATED_PREFIX_LEN).collect()
}

fn retry_delay(seconds: f64) -> Duration {
    if seconds.is_finite() && seconds > 0.0 {
        Duration::from_secs_f64(seconds)
    } else {
        Duration::ZERO
    }
}

/// Everything a step task needs from its run.
#[derive(Clone)]
struct StepRunner {
    engine: Arc<FlowEngine>,
    flow: Arc<Flow>,
    prefix: String,
    root_session_id: String,
    cancel: CancellationToken,
    state_tx: mpsc::Sender<FlowState>,
    event_tx: mpsc::Sender<StepEvent>,
}

impl StepRunner {
    async fn drive(self, args: Map<String, Value>, started: (Arc<DashSet<String>>, StartedGuard)) {
        let (started, _guard) = started;
        let mut queue = VecDeque::from([WorkItem {
            step_id: self.flow.first_step().id.clone(),
            args,
            upstream: None,
        }]);
        let mut tasks = JoinSet::new();

        loop {
            while let Some(item) = queue.pop_front() {
                if self.cancel.is_cancelled() {
                    queue.clear();
                    break;
                }
                if !started.insert(item.step_id.clone()) {
                    debug!(
                        target: "opencode::flow",
                        root = %self.root_session_id,
                        step = %item.step_id,
                        "Step already started, dropping"
                    );
                    continue;
                }
                let runner = self.clone();
                tasks.spawn(async move { runner.run_step(item).await });
            }
            match tasks.join_next().await {
                Some(Ok(next)) => queue.extend(next),
                Some(Err(e)) => error!(target: "opencode::flow", root = %self.root_session_id, "Step task failed: {}", e),
                None => break,
            }
        }
        info!(target: "opencode::flow", flow = %self.flow.id, root = %self.root_session_id, "Flow finished");
    }

    fn step_session_id(&self, step: &Step) -> String {
        if step.id == self.flow.first_step().id {
            self.root_session_id.clone()
        } else {
            format!("{}-{}-{}", self.prefix, self.flow.id, step.id)
        }
    }

    async fn ensure_session(&self, step: &Step, session_id: &str, upstream: Option<&Upstream>) -> Result<()> {
        let sessions = &self.engine.sessions;
        if sessions.find(session_id).await?.is_some() {
            return Ok(());
        }
        let title = format!("{}: {}", self.flow.name, step.id);
        match upstream {
            Some(up) if session_id != self.root_session_id => {
                sessions.create_child(Some(session_id), &up.session_id, &title).await?;
            }
            _ if session_id == self.root_session_id => {
                sessions.create_with_id(session_id, &title).await?;
            }
            _ => {
                sessions
                    .create_child(Some(session_id), &self.root_session_id, &title)
                    .await?;
            }
        }
        Ok(())
    }

    async fn save(&self, state: &FlowState) -> Result<()> {
        self.engine.states.save(state).await?;
        let _ = self.state_tx.send(state.clone()).await;
        Ok(())
    }

    /// Run one step and return the steps it routes to.
    async fn run_step(self, item: WorkItem) -> Vec<WorkItem> {
        let step_id = item.step_id.clone();
        match self.try_run_step(item).await {
            Ok(next) => next,
            Err(e) => {
                error!(target: "opencode::flow", root = %self.root_session_id, step = %step_id, "Step could not run: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_run_step(&self, item: WorkItem) -> Result<Vec<WorkItem>> {
        let Some(step) = self.flow.step(&item.step_id).cloned() else {
            return Err(CoreError::FlowStepFailed {
                step: item.step_id,
                reason: "unknown step".into(),
            });
        };
        let session_id = self.step_session_id(&step);
        self.ensure_session(&step, &session_id, item.upstream.as_ref()).await?;

        let mut args = item.args;
        let now = now_unix();
        let mut state = FlowState {
            session_id: session_id.clone(),
            root_session_id: self.root_session_id.clone(),
            flow_id: self.flow.id.clone(),
            step_id: step.id.clone(),
            status: FlowStatus::Running,
            args: args.clone(),
            output: String::new(),
            is_struct_output: false,
            created_at: now,
            updated_at: now,
        };
        self.save(&state).await?;
        info!(target: "opencode::flow", step = %step.id, session_id = %session_id, agent = %step.agent, "Step running");

        let prompt = self.build_prompt(&step, &args, item.upstream.as_ref());
        self.engine.permissions.auto_approve_session(&session_id);
        let result = self.execute(&step, &session_id, &prompt).await;

        state.updated_at = now_unix();
        let mut next = Vec::new();
        match result {
            Ok(outcome) => {
                match outcome.structured_output {
                    Some(value) => {
                        if let Value::Object(fields) = &value {
                            for (key, field) in fields {
                                args.insert(key.clone(), field.clone());
                            }
                        }
                        state.output = value.to_string();
                        state.is_struct_output = true;
                    }
                    None => state.output = outcome.message.content(),
                }
                state.status = FlowStatus::Completed;
                state.args = args.clone();
                self.save(&state).await?;
                info!(target: "opencode::flow", step = %step.id, "Step completed");

                for rule in &step.rules {
                    if rule.predicate.eval(&args) {
                        debug!(target: "opencode::flow", step = %step.id, rule = %rule.predicate, then = %rule.then, "Rule matched");
                        next.push(WorkItem {
                            step_id: rule.then.clone(),
                            args: args.clone(),
                            upstream: Some(Upstream {
                                session_id: session_id.clone(),
                                output: state.output.clone(),
                            }),
                        });
                    }
                }
            }
            Err(e) => {
                state.status = FlowStatus::Failed;
                state.output = e.to_string();
                self.save(&state).await?;
                warn!(target: "opencode::flow", step = %step.id, "Step failed: {}", e);
                if let Some(to) = step.fallback.as_ref().and_then(|f| f.to.clone()) {
                    if !self.cancel.is_cancelled() {
                        next.push(WorkItem {
                            step_id: to,
                            args,
                            upstream: Some(Upstream {
                                session_id,
                                output: state.output.clone(),
                            }),
                        });
                    }
                }
            }
        }
        Ok(next)
    }

    fn build_prompt(&self, step: &Step, args: &Map<String, Value>, upstream: Option<&Upstream>) -> String {
        let mut prompt = substitute(&step.prompt, args);
        if prompt.trim().is_empty() {
            if let Some(Value::String(p)) = args.get("prompt") {
                prompt = p.clone();
            }
        }
        match upstream {
            Some(up) if !step.session.fork && !up.output.is_empty() => {
                format!("Output of the previous step:\n{}\n\n{}", up.output, prompt)
            }
            _ => prompt,
        }
    }

    /// Run the step's agent, retrying per its fallback. Agent events are
    /// forwarded tagged with the step id.
    async fn execute(&self, step: &Step, session_id: &str, prompt: &str) -> Result<RunOutcome> {
        let (tx, mut rx) = mpsc::channel::<AgentEvent>(CHANNEL_BUFFER);
        let event_tx = self.event_tx.clone();
        let step_id = step.id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let tagged = StepEvent {
                    step_id: step_id.clone(),
                    event,
                };
                let _ = event_tx.send(tagged).await;
            }
        });

        let fallback = step.fallback.clone().unwrap_or_default();
        let schema = step.output.as_ref().map(|o| o.schema.clone());
        let mut attempt = 0;
        let result = loop {
            let run = self
                .engine
                .executor
                .run_step(&self.cancel, &step.agent, session_id, prompt, schema.clone(), &tx)
                .await;
            match run {
                Ok(outcome) => break Ok(outcome),
                Err(e) if e.is_canceled() || self.cancel.is_cancelled() => break Err(e),
                Err(e) if attempt < fallback.retry => {
                    attempt += 1;
                    warn!(
                        target: "opencode::flow",
                        step = %step.id,
                        attempt,
                        max = fallback.retry,
                        "Step attempt failed, retrying: {}",
                        e
                    );
                    if !sleep_cancelable(&self.cancel, retry_delay(fallback.delay)).await {
                        break Err(CoreError::Canceled);
                    }
                }
                Err(e) => break Err(e),
            }
        };
        drop(tx);
        let _ = forwarder.await;
        result
    }
}
