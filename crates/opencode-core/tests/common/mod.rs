//! Shared setup for opencode-core integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use opencode_core::agent::{RunOptions, collect_run};
use opencode_core::db::SqliteStorage;
use opencode_core::llm::{ScriptedProvider, StaticProviderFactory};
use opencode_core::{App, Config, Result};
use opencode_types::Message;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub struct TestApp {
    pub app: App,
    pub provider: Arc<ScriptedProvider>,
    pub dir: TempDir,
}

/// App over an in-memory database and a scripted model. `flows` are written
/// to the project's `.opencode/flows` before the app starts.
pub fn create_test_app(flows: &[(&str, &str)], configure: impl FnOnce(&mut Config)) -> TestApp {
    let dir = TempDir::new().unwrap();
    let flow_dir = dir.path().join(".opencode").join("flows");
    std::fs::create_dir_all(&flow_dir).unwrap();
    for (id, yaml) in flows {
        std::fs::write(flow_dir.join(format!("{id}.yaml")), yaml).unwrap();
    }

    let mut config = Config::default();
    config.working_dir = dir.path().to_path_buf();
    config.auto_compact = false;
    configure(&mut config);

    let provider = Arc::new(ScriptedProvider::new());
    let app = App::with_parts(
        config,
        Arc::new(SqliteStorage::open_in_memory().unwrap()),
        Arc::new(StaticProviderFactory::new(provider.clone())),
    )
    .unwrap();
    TestApp { app, provider, dir }
}

impl TestApp {
    /// Run `prompt` on `session_id` with the coder agent and wait for the end.
    pub async fn run_coder(&self, session_id: &str, prompt: &str) -> Result<Message> {
        let runtime = self.app.agents.get(opencode_core::agent::CODER_AGENT)?;
        let events = runtime
            .run(&CancellationToken::new(), session_id, prompt, RunOptions::default())
            .await?;
        Ok(collect_run(events, None).await?.message)
    }
}
