//! Wiring of every core service for one working directory.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{ActiveRuns, AgentProvider, AgentRegistry, AgentServices};
use crate::config::Config;
use crate::db::{self, Storage};
use crate::discovery::{CommandRegistry, SkillRegistry};
use crate::flow::{FlowEngine, FlowRegistry, FlowStateService, StepExecutor};
use crate::history::FileHistoryService;
use crate::llm::{ConfigProviderFactory, ProviderFactory};
use crate::lsp::LspService;
use crate::message::MessageService;
use crate::permission::PermissionGate;
use crate::project::project_id;
use crate::retry::Backoff;
use crate::session::SessionService;
use crate::tools::{FileTracker, OutputSpool, ToolDeps, ToolRegistry};
use crate::Result;

/// Time given to in-flight runs to write their cancellation before the
/// language servers are stopped.
const RUN_DRAIN: Duration = Duration::from_millis(200);

pub struct App {
    pub config: Arc<Config>,
    pub storage: Arc<dyn Storage>,
    pub sessions: Arc<SessionService>,
    pub messages: Arc<MessageService>,
    pub history: Arc<FileHistoryService>,
    pub permissions: Arc<PermissionGate>,
    pub lsp: Arc<LspService>,
    pub agents: Arc<AgentProvider>,
    pub flows: Arc<FlowEngine>,
    pub flow_states: Arc<FlowStateService>,
    pub skills: Arc<SkillRegistry>,
    pub commands: CommandRegistry,
    spool: Arc<OutputSpool>,
    cancel: CancellationToken,
}

impl App {
    /// Open storage from config and serve models from the configured providers.
    pub async fn new(config: Config) -> Result<Self> {
        let providers: Arc<dyn ProviderFactory> = Arc::new(ConfigProviderFactory::new(&config));
        let storage = db::open(&config).await?;
        Self::with_parts(config, storage, providers)
    }

    pub fn with_parts(
        config: Config,
        storage: Arc<dyn Storage>,
        providers: Arc<dyn ProviderFactory>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let cancel = CancellationToken::new();
        let project = project_id(&config.working_dir).to_string();
        debug!(target: "opencode::startup", project_id = %project, "Wiring services");

        let sessions = Arc::new(SessionService::new(storage.clone(), project));
        let messages = Arc::new(MessageService::new(storage.clone()));
        let history = Arc::new(FileHistoryService::new(storage.clone()));
        let permissions = Arc::new(PermissionGate::new());
        let flow_states = Arc::new(FlowStateService::new(storage.clone()));
        let lsp = Arc::new(LspService::new(config.clone(), cancel.child_token()));
        let skills = Arc::new(SkillRegistry::discover(&config));
        let commands = CommandRegistry::discover(&config);
        let spool = Arc::new(OutputSpool::new());

        let tools = ToolRegistry::builtin(&ToolDeps {
            config: config.clone(),
            sessions: sessions.clone(),
            history: history.clone(),
            tracker: Arc::new(FileTracker::new()),
            lsp: lsp.clone(),
            spool: spool.clone(),
            skills: skills.clone(),
        });
        let agents = AgentProvider::new(AgentServices {
            config: config.clone(),
            sessions: sessions.clone(),
            messages: messages.clone(),
            permissions: permissions.clone(),
            registry: Arc::new(AgentRegistry::load(&config)),
            tools,
            providers,
            skills: skills.clone(),
            backoff: Backoff::default(),
            runs: Arc::new(ActiveRuns::new()),
        });
        let executor: Arc<dyn StepExecutor> = agents.clone();
        let flows = Arc::new(FlowEngine::new(
            FlowRegistry::discover(&config),
            sessions.clone(),
            permissions.clone(),
            flow_states.clone(),
            executor,
        ));

        info!(
            target: "opencode::startup",
            working_dir = %config.working_dir.display(),
            agents = agents.primary_ids().len(),
            flows = flows.flows().list().count(),
            skills = skills.list().count(),
            "App initialized"
        );
        Ok(Self {
            config,
            storage,
            sessions,
            messages,
            history,
            permissions,
            lsp,
            agents,
            flows,
            flow_states,
            skills,
            commands,
            spool,
            cancel,
        })
    }

    /// Root token every app-owned task derives from.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Start language servers in the background.
    pub fn start_lsp(&self) {
        let lsp = self.lsp.clone();
        tokio::spawn(async move { lsp.start().await });
    }

    /// Stop everything: subscribers, then agent runs, then language servers,
    /// then the output spool.
    pub async fn shutdown(&self) {
        info!(target: "opencode::startup", "Shutting down");
        self.sessions.shutdown();
        self.messages.shutdown();
        self.history.shutdown();
        self.permissions.shutdown();
        self.flow_states.shutdown();

        self.agents.shutdown();
        tokio::time::sleep(RUN_DRAIN).await;
        self.cancel.cancel();

        if tokio::time::timeout(Duration::from_secs(6), self.lsp.shutdown())
            .await
            .is_err()
        {
            warn!(target: "opencode::startup", "Language servers did not stop in time, killing");
            self.lsp.force_shutdown().await;
        }
        self.spool.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteStorage;
    use crate::llm::{ScriptedProvider, StaticProviderFactory};

    #[tokio::test]
    async fn test_app_wires_primary_agents_and_shuts_down() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.working_dir = dir.path().to_path_buf();
        let app = App::with_parts(
            config,
            Arc::new(SqliteStorage::open_in_memory().unwrap()),
            Arc::new(StaticProviderFactory::new(Arc::new(ScriptedProvider::new()))),
        )
        .unwrap();
        assert!(app.agents.get(crate::agent::CODER_AGENT).is_ok());
        assert_eq!(app.flows.flows().list().count(), 0);
        app.shutdown().await;
        assert!(app.cancel_token().is_cancelled());
    }
}
