use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;
use opencode_types::AgentEvent;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::runtime::{AgentRuntime, RunOutcome, collect_run};
use super::{AgentServices, RunOptions};
use crate::flow::StepExecutor;
use crate::sync::lock_unpoisoned;
use crate::tools::{SubagentRunner, ToolContext};
use crate::{CoreError, Result};

const TASK_TITLE_LEN: usize = 50;

/// Resolves agent ids to runtimes.
///
/// Primary agents are built up front. Subagents are built the first time
/// they are asked for and kept for the life of the provider.
pub struct AgentProvider {
    services: AgentServices,
    primary: HashMap<String, Arc<AgentRuntime>>,
    subagents: Mutex<HashMap<String, Arc<AgentRuntime>>>,
}

impl AgentProvider {
    /// Build the primary runtimes and connect the `task` tool to this provider.
    pub fn new(services: AgentServices) -> Arc<Self> {
        let primary = services
            .registry
            .primary()
            .map(|info| {
                (
                    info.id.clone(),
                    Arc::new(AgentRuntime::new(info.clone(), services.clone())),
                )
            })
            .collect::<HashMap<_, _>>();
        debug!(target: "opencode::agent", count = primary.len(), "Primary agents ready");
        let provider = Arc::new(Self {
            services,
            primary,
            subagents: Mutex::new(HashMap::new()),
        });
        let runner: Weak<dyn SubagentRunner> = Arc::downgrade(&provider) as Weak<dyn SubagentRunner>;
        provider.services.tools.bind_subagent_runner(runner);
        provider
    }

    pub fn services(&self) -> &AgentServices {
        &self.services
    }

    /// Runtime for `agent_id`. Unknown and disabled agents are errors.
    pub fn get(&self, agent_id: &str) -> Result<Arc<AgentRuntime>> {
        if let Some(runtime) = self.primary.get(agent_id) {
            return Ok(runtime.clone());
        }
        let info = self.services.registry.get_enabled(agent_id)?;
        let mut subagents = lock_unpoisoned(&self.subagents);
        let runtime = subagents.entry(agent_id.to_string()).or_insert_with(|| {
            debug!(target: "opencode::agent", agent = %agent_id, "Building agent");
            Arc::new(AgentRuntime::new(info.clone(), self.services.clone()))
        });
        Ok(runtime.clone())
    }

    /// Ids of the preconstructed agents, sorted.
    pub fn primary_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.primary.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Cancel every run and close the agents' event streams.
    pub fn shutdown(&self) {
        self.services.runs.cancel_all();
        for runtime in self.primary.values() {
            runtime.shutdown();
        }
        for runtime in lock_unpoisoned(&self.subagents).values() {
            runtime.shutdown();
        }
    }
}

#[async_trait]
impl SubagentRunner for AgentProvider {
    async fn run_subagent(
        &self,
        ctx: &ToolContext,
        tool_call_id: &str,
        agent_id: &str,
        prompt: &str,
    ) -> Result<(String, String)> {
        let runtime = self.get(agent_id)?;
        if runtime.info().is_primary() {
            return Err(CoreError::InvalidArgs(format!("{agent_id} is not a subagent")));
        }
        let sessions = &self.services.sessions;
        let session = match sessions.find(tool_call_id).await? {
            Some(session) => session,
            None => {
                let title: String = prompt.chars().take(TASK_TITLE_LEN).collect();
                sessions
                    .create_task_session(tool_call_id, &ctx.session_id, &title)
                    .await?
            }
        };
        if let Some(policy) = self.services.permissions.session_policy(&ctx.session_id) {
            self.services.permissions.set_session_policy(&session.id, policy);
        }
        info!(target: "opencode::agent", agent = %agent_id, parent = %ctx.session_id, session_id = %session.id, "Running subagent");

        let events = runtime
            .run(&ctx.cancel, &session.id, prompt, RunOptions::default())
            .await?;
        let outcome = collect_run(events, None).await?;

        let child = sessions.get(&session.id).await?;
        sessions.add_usage(&ctx.session_id, 0, 0, child.cost).await?;
        Ok((session.id, outcome.message.content()))
    }
}

#[async_trait]
impl StepExecutor for AgentProvider {
    async fn run_step(
        &self,
        cancel: &CancellationToken,
        agent_id: &str,
        session_id: &str,
        prompt: &str,
        output_schema: Option<Value>,
        events: &mpsc::Sender<AgentEvent>,
    ) -> Result<RunOutcome> {
        let runtime = self.get(agent_id)?;
        let options = RunOptions {
            output_schema,
            ..Default::default()
        };
        let run = runtime.run(cancel, session_id, prompt, options).await?;
        collect_run(run, Some(events)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::test_support::Harness;
    use crate::agent::{CODER_AGENT, SUMMARIZER_AGENT, TASK_AGENT};
    use crate::config::AgentConfig;
    use crate::llm::ScriptedTurn;
    use serde_json::json;

    #[tokio::test]
    async fn test_primary_prebuilt_and_subagents_cached() {
        let harness = Harness::new().await;
        let provider = AgentProvider::new(harness.services.clone());
        assert!(provider.primary_ids().contains(&CODER_AGENT.to_string()));

        let first = provider.get(TASK_AGENT).unwrap();
        let second = provider.get(TASK_AGENT).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&provider.get(CODER_AGENT).unwrap(), &provider.get(CODER_AGENT).unwrap()));
        assert!(provider.get(SUMMARIZER_AGENT).is_ok());
    }

    #[tokio::test]
    async fn test_unknown_and_disabled_agents_error() {
        let harness = Harness::with_config(|c| {
            c.agents.insert(
                "reviewer".into(),
                AgentConfig {
                    disabled: Some(true),
                    ..Default::default()
                },
            );
        })
        .await;
        let provider = AgentProvider::new(harness.services.clone());
        assert!(matches!(provider.get("nope"), Err(CoreError::AgentNotFound(_))));
        assert!(matches!(provider.get("reviewer"), Err(CoreError::AgentDisabled(_))));
    }

    #[tokio::test]
    async fn test_task_tool_runs_subagent_in_child_session() {
        let harness = Harness::new().await;
        let provider = AgentProvider::new(harness.services.clone());
        harness.provider.push(
            CODER_AGENT,
            ScriptedTurn::tool_call("call_task", "task", json!({"prompt": "find the config loader"})),
        );
        harness.provider.push(TASK_AGENT, ScriptedTurn::text("config.rs loads it"));
        harness.provider.push(CODER_AGENT, ScriptedTurn::text("Found it"));

        let parent = harness.session("Parent").await;
        let runtime = provider.get(CODER_AGENT).unwrap();
        let events = runtime
            .run(&CancellationToken::new(), &parent, "where is config loaded?", RunOptions::default())
            .await
            .unwrap();
        let outcome = collect_run(events, None).await.unwrap();
        assert_eq!(outcome.message.content(), "Found it");

        let child = harness.services.sessions.get("call_task").await.unwrap();
        assert_eq!(child.parent_session_id.as_deref(), Some(parent.as_str()));
        let results: Vec<_> = harness
            .services
            .messages
            .list(&parent)
            .await
            .unwrap()
            .iter()
            .flat_map(|m| m.tool_results().into_iter().cloned().collect::<Vec<_>>())
            .collect();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "config.rs loads it");
        assert!(!results[0].is_error);
    }
}
