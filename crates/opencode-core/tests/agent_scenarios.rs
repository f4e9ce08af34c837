//! End-to-end agent runs over the real tool set and a scripted model.

mod common;

use common::create_test_app;
use opencode_core::agent::{CODER_AGENT, RunOptions, collect_run};
use opencode_core::llm::ScriptedTurn;
use opencode_types::{AgentEvent, ContentPart, FinishReason, PermissionAction, Role};
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_denied_bash_is_error_result_and_turn_continues() {
    let t = create_test_app(&[], |c| c.permission.set("bash", PermissionAction::Deny));
    t.provider.push(
        CODER_AGENT,
        ScriptedTurn::tool_call("call_1", "bash", json!({"command": "touch spawned.txt"})),
    );
    t.provider.push(CODER_AGENT, ScriptedTurn::text("Could not run it"));
    let session = t.app.sessions.create("Deny").await.unwrap();

    let message = t.run_coder(&session.id, "create a file").await.unwrap();
    assert_eq!(message.content(), "Could not run it");
    assert!(!t.dir.path().join("spawned.txt").exists());

    let messages = t.app.messages.list(&session.id).await.unwrap();
    let result = messages
        .iter()
        .find(|m| m.role == Role::Tool)
        .and_then(|m| m.tool_results().into_iter().next().cloned())
        .unwrap();
    assert!(result.is_error);
    assert_eq!(result.content, "permission denied");
    assert_eq!(result.tool_call_id, "call_1");
}

#[tokio::test]
async fn test_large_bash_output_is_spooled() {
    let t = create_test_app(&[], |c| c.permission.set("bash", PermissionAction::Allow));
    t.provider.push(
        CODER_AGENT,
        ScriptedTurn::tool_call("call_seq", "bash", json!({"command": "seq 1 3000"})),
    );
    let session = t.app.sessions.create("Spool").await.unwrap();
    t.run_coder(&session.id, "count").await.unwrap();

    let messages = t.app.messages.list(&session.id).await.unwrap();
    let result = messages
        .iter()
        .flat_map(|m| m.tool_results().into_iter().cloned().collect::<Vec<_>>())
        .next()
        .unwrap();
    assert!(!result.is_error);
    assert!(result.content.contains("<stdout truncated: 3000 lines total>"));

    let saved_line = result
        .content
        .lines()
        .find_map(|l| l.strip_prefix("Full output saved to: "))
        .unwrap();
    assert!(saved_line.contains("opencode-output-"));
    let saved = std::path::Path::new(saved_line);
    let expected: String = (1..=3000).map(|n| format!("{n}\n")).collect();
    assert_eq!(std::fs::read_to_string(saved).unwrap(), expected);

    let lines: Vec<&str> = result.content.lines().collect();
    assert!(lines.contains(&"500"));
    assert!(!lines.contains(&"501"));
    assert!(lines.contains(&"2501"));
    assert!(!lines.contains(&"2500"));
    assert!(lines.contains(&"3000"));
}

#[tokio::test]
async fn test_message_count_and_finish_invariants() {
    let t = create_test_app(&[], |c| c.permission.set("bash", PermissionAction::Allow));
    t.provider.push(
        CODER_AGENT,
        ScriptedTurn::tool_calls(vec![
            ("c1", "bash", json!({"command": "echo one"})),
            ("c2", "bash", json!({"command": "echo two"})),
        ]),
    );
    t.provider.push(CODER_AGENT, ScriptedTurn::text("both ran"));
    let session = t.app.sessions.create("Invariants").await.unwrap();
    t.run_coder(&session.id, "run two commands").await.unwrap();
    t.run_coder(&session.id, "and again").await.unwrap();

    let stored = t.app.sessions.get(&session.id).await.unwrap();
    let messages = t.app.messages.list(&session.id).await.unwrap();
    assert_eq!(stored.message_count as usize, messages.len());

    for message in messages.iter().filter(|m| m.role == Role::Assistant) {
        let finishes: Vec<usize> = message
            .parts
            .iter()
            .enumerate()
            .filter(|(_, p)| matches!(p, ContentPart::Finish(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(finishes, vec![message.parts.len() - 1]);
    }

    let results: Vec<String> = messages
        .iter()
        .flat_map(|m| m.tool_results().into_iter().map(|r| r.tool_call_id.clone()).collect::<Vec<_>>())
        .collect();
    for call in messages.iter().flat_map(|m| m.tool_calls()) {
        assert!(call.finished);
        assert!(results.contains(&call.id), "missing result for {}", call.id);
    }
}

#[tokio::test]
async fn test_event_stream_order() {
    let t = create_test_app(&[], |_| {});
    t.provider.push(CODER_AGENT, ScriptedTurn::text("hi"));
    let session = t.app.sessions.create("Events").await.unwrap();
    let runtime = t.app.agents.get(CODER_AGENT).unwrap();
    let cancel = CancellationToken::new();
    let mut broadcast = runtime.subscribe(&cancel);

    let (tx, mut forwarded) = tokio::sync::mpsc::channel(64);
    let events = runtime
        .run(&cancel, &session.id, "hello", RunOptions::default())
        .await
        .unwrap();
    collect_run(events, Some(&tx)).await.unwrap();
    drop(tx);

    let mut kinds = Vec::new();
    while let Some(event) = forwarded.recv().await {
        assert_eq!(event.session_id(), session.id);
        kinds.push(event);
    }
    assert!(matches!(kinds.first(), Some(AgentEvent::Started { .. })));
    assert!(matches!(kinds.last(), Some(AgentEvent::Done { .. })));
    assert!(kinds.iter().any(|e| matches!(e, AgentEvent::ContentDelta { delta, .. } if delta == "hi")));

    let first = broadcast.recv().await.unwrap();
    assert!(matches!(first.payload, AgentEvent::Started { .. }));

    let messages = t.app.messages.list(&session.id).await.unwrap();
    assert_eq!(messages.last().unwrap().finish_reason(), Some(FinishReason::EndTurn));
}
