//! Non-interactive runs against a scripted model.

use std::sync::Arc;

use opencode_cli::OutputFormat;
use opencode_cli::runner::{Request, run_non_interactive};
use opencode_core::agent::{CODER_AGENT, TASK_AGENT};
use opencode_core::db::SqliteStorage;
use opencode_core::llm::{ScriptedProvider, ScriptedTurn, StaticProviderFactory};
use opencode_core::tools::STRUCT_OUTPUT_TOOL;
use opencode_core::{App, Config};
use serde_json::{Value, json};
use tempfile::TempDir;

fn test_app(dir: &TempDir) -> (App, Arc<ScriptedProvider>) {
    let mut config = Config::default();
    config.working_dir = dir.path().to_path_buf();
    config.auto_compact = false;
    let provider = Arc::new(ScriptedProvider::new());
    let app = App::with_parts(
        config,
        Arc::new(SqliteStorage::open_in_memory().unwrap()),
        Arc::new(StaticProviderFactory::new(provider.clone())),
    )
    .unwrap();
    (app, provider)
}

fn request<'a>(prompt: &'a str, session: Option<&'a str>, format: &'a OutputFormat) -> Request<'a> {
    Request {
        agent: CODER_AGENT,
        session_id: session,
        prompt,
        format,
        quiet: true,
    }
}

#[tokio::test]
async fn test_creates_named_session_and_prints_text() {
    let dir = TempDir::new().unwrap();
    let (app, provider) = test_app(&dir);
    provider.push(CODER_AGENT, ScriptedTurn::text("Hi there"));

    let mut out = Vec::new();
    run_non_interactive(&app, request("hello", Some("abc123"), &OutputFormat::Text), &mut out)
        .await
        .unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "Hi there\n");

    let session = app.sessions.get("abc123").await.unwrap();
    assert_eq!(session.title, "Non-interactive: hello");

    // A second run resumes the same session.
    provider.push(CODER_AGENT, ScriptedTurn::text("Again"));
    let mut out = Vec::new();
    run_non_interactive(&app, request("more", Some("abc123"), &OutputFormat::Text), &mut out)
        .await
        .unwrap();
    let messages = app.messages.list("abc123").await.unwrap();
    assert_eq!(messages.len(), 4);
    app.shutdown().await;
}

#[tokio::test]
async fn test_json_schema_output_uses_struct_output_tool() {
    let dir = TempDir::new().unwrap();
    let (app, provider) = test_app(&dir);
    let format: OutputFormat = r#"json_schema={"type":"object","properties":{"name":{"type":"string"},"age":{"type":"integer"}},"required":["name","age"]}"#
        .parse()
        .unwrap();
    provider.push(
        CODER_AGENT,
        ScriptedTurn::tool_call("call_out", STRUCT_OUTPUT_TOOL, json!({"name": "Ada", "age": 36})),
    );

    let mut out = Vec::new();
    run_non_interactive(&app, request("return {name, age}", None, &format), &mut out)
        .await
        .unwrap();
    let printed: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(printed, json!({"name": "Ada", "age": 36}));

    let requests = provider.requests();
    assert!(requests[0].tools.iter().any(|t| t.name == STRUCT_OUTPUT_TOOL));
    app.shutdown().await;
}

#[tokio::test]
async fn test_json_format_wraps_response() {
    let dir = TempDir::new().unwrap();
    let (app, provider) = test_app(&dir);
    provider.push(CODER_AGENT, ScriptedTurn::text("ok"));
    let mut out = Vec::new();
    run_non_interactive(&app, request("ping", None, &OutputFormat::Json), &mut out)
        .await
        .unwrap();
    let printed: Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(printed, json!({"response": "ok"}));
}

#[tokio::test]
async fn test_subagent_and_failed_runs_are_errors() {
    let dir = TempDir::new().unwrap();
    let (app, provider) = test_app(&dir);
    let mut out = Vec::new();
    let mut req = request("hi", None, &OutputFormat::Text);
    req.agent = TASK_AGENT;
    assert!(run_non_interactive(&app, req, &mut out).await.is_err());

    let mut req = request("hi", None, &OutputFormat::Text);
    req.agent = "missing";
    assert!(run_non_interactive(&app, req, &mut out).await.is_err());

    provider.push(
        CODER_AGENT,
        ScriptedTurn::error(opencode_core::llm::ProviderError::Auth("bad key".into())),
    );
    assert!(
        run_non_interactive(&app, request("hi", None, &OutputFormat::Text), &mut out)
            .await
            .is_err()
    );
    assert!(out.is_empty());
}
