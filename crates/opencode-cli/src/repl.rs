//! Line-oriented interactive loop.
//!
//! Each line is a prompt for the current session. Lines starting with `/`
//! are commands; `/help` lists them.

use std::io::Write;

use anyhow::Context;
use opencode_core::App;
use opencode_core::agent::RunOptions;
use opencode_core::flow::FlowRun;
use opencode_types::{AgentEvent, DEFAULT_SESSION_TITLE, FlowStatus};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

use crate::runner::{primary_agent, resolve_session};

const HELP: &str = "\
/new                 start a new session
/sessions            list sessions of this project
/flows               list flows
/flow <id> [prompt]  run a flow with `prompt` as its argument
/exit                quit";

enum Command<'a> {
    Prompt(&'a str),
    New,
    Sessions,
    Flows,
    Flow { id: &'a str, prompt: &'a str },
    Help,
    Exit,
    Unknown(&'a str),
}

fn parse(line: &str) -> Command<'_> {
    let Some(rest) = line.strip_prefix('/') else {
        return Command::Prompt(line);
    };
    let (name, arg) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
    match name {
        "new" => Command::New,
        "sessions" => Command::Sessions,
        "flows" => Command::Flows,
        "flow" => {
            let (id, prompt) = arg.trim().split_once(char::is_whitespace).unwrap_or((arg.trim(), ""));
            Command::Flow { id, prompt: prompt.trim() }
        }
        "help" => Command::Help,
        "exit" | "quit" => Command::Exit,
        _ => Command::Unknown(name),
    }
}

/// Read prompts from `input` until EOF or `/exit`. Responses stream to `out`.
pub async fn run<R, W>(app: &App, agent: &str, session_id: Option<&str>, input: R, out: &mut W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: Write,
{
    let runtime = primary_agent(app, agent)?;
    let mut session = resolve_session(app, session_id, DEFAULT_SESSION_TITLE).await?;
    writeln!(out, "Session {} ({}). /help for commands.", session.id, runtime.info().name)?;

    let mut lines = input.lines();
    loop {
        write!(out, "> ")?;
        out.flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse(line) {
            Command::Exit => break,
            Command::Help => writeln!(out, "{HELP}")?,
            Command::Unknown(name) => writeln!(out, "Unknown command /{name}")?,
            Command::New => {
                session = app.sessions.create(DEFAULT_SESSION_TITLE).await?;
                writeln!(out, "Session {}", session.id)?;
            }
            Command::Sessions => {
                for s in app.sessions.list().await? {
                    writeln!(out, "{}  {}  {} messages", s.id, s.title, s.message_count)?;
                }
            }
            Command::Flows => {
                for flow in app.flows.flows().list() {
                    let state = if flow.disabled { " (disabled)" } else { "" };
                    writeln!(out, "{}  {}{}", flow.id, flow.name, state)?;
                }
            }
            Command::Flow { id, prompt } => {
                if let Err(e) = run_flow(app, id, prompt, out).await {
                    writeln!(out, "Error: {e:#}")?;
                }
            }
            Command::Prompt(prompt) => {
                if let Err(e) = run_prompt(app, agent, &session.id, prompt, out).await {
                    writeln!(out, "Error: {e:#}")?;
                }
            }
        }
    }
    Ok(())
}

async fn run_prompt<W: Write>(app: &App, agent: &str, session_id: &str, prompt: &str, out: &mut W) -> anyhow::Result<()> {
    let runtime = primary_agent(app, agent)?;
    let cancel = app.cancel_token().child_token();
    let mut events = runtime.run(&cancel, session_id, prompt, RunOptions::default()).await?;
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::ContentDelta { delta, .. } => {
                write!(out, "{delta}")?;
                out.flush()?;
            }
            AgentEvent::ToolCall { call, .. } => writeln!(out, "\n[{}]", call.name)?,
            AgentEvent::ToolResult { result, .. } if result.is_error => {
                writeln!(out, "[{} failed: {}]", result.name, first_line(&result.content))?;
            }
            AgentEvent::Done { .. } => {
                writeln!(out)?;
                break;
            }
            AgentEvent::Error { error, .. } => {
                writeln!(out, "\nError: {error}")?;
                break;
            }
            AgentEvent::Canceled { .. } => {
                writeln!(out, "\nCanceled")?;
                break;
            }
            _ => {}
        }
    }
    Ok(())
}

async fn run_flow<W: Write>(app: &App, flow_id: &str, prompt: &str, out: &mut W) -> anyhow::Result<()> {
    let mut args = Map::new();
    if !prompt.is_empty() {
        args.insert("prompt".into(), Value::String(prompt.to_string()));
    }
    let cancel = app.cancel_token().child_token();
    let FlowRun {
        root_session_id,
        mut agent_events,
        mut states,
        handle,
    } = app
        .flows
        .run(&cancel, "", flow_id, args, false)
        .await
        .with_context(|| format!("flow {flow_id}"))?;
    writeln!(out, "Flow {flow_id} on {root_session_id}")?;

    // Agent deltas are drained so the step runners never block on a full channel.
    let drainer = tokio::spawn(async move { while agent_events.recv().await.is_some() {} });
    while let Some(state) = states.recv().await {
        writeln!(out, "  {} {}", state.step_id, state.status.as_str())?;
        if state.status == FlowStatus::Failed {
            writeln!(out, "    {}", first_line(&state.output))?;
        }
    }
    if let Err(e) = handle.await {
        warn!(target: "opencode::flow", "Flow task ended abnormally: {}", e);
    }
    drainer.abort();
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_commands() {
        assert!(matches!(parse("hello there"), Command::Prompt("hello there")));
        assert!(matches!(parse("/new"), Command::New));
        assert!(matches!(parse("/quit"), Command::Exit));
        assert!(matches!(parse("/bogus x"), Command::Unknown("bogus")));
        match parse("/flow release ship it now") {
            Command::Flow { id, prompt } => {
                assert_eq!(id, "release");
                assert_eq!(prompt, "ship it now");
            }
            _ => panic!("expected flow command"),
        }
        assert!(matches!(parse("/flow release"), Command::Flow { id: "release", prompt: "" }));
    }
}
