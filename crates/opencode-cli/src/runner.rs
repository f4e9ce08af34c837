//! Non-interactive mode: one prompt, one answer on stdout.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use anyhow::{Context, bail};
use opencode_core::App;
use opencode_core::agent::{AgentRuntime, RunOptions, collect_run};
use opencode_types::Session;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::format::OutputFormat;

const NON_INTERACTIVE_TITLE: &str = "Non-interactive: ";
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

pub struct Request<'a> {
    pub agent: &'a str,
    pub session_id: Option<&'a str>,
    pub prompt: &'a str,
    pub format: &'a OutputFormat,
    pub quiet: bool,
}

/// Run `request.prompt` to completion and write the rendered answer to `out`.
///
/// Tools are auto-approved for the session since nobody is there to answer.
pub async fn run_non_interactive<W: Write>(app: &App, request: Request<'_>, out: &mut W) -> anyhow::Result<()> {
    let runtime = primary_agent(app, request.agent)?;
    let title = format!("{NON_INTERACTIVE_TITLE}{}", request.prompt);
    let session = resolve_session(app, request.session_id, &title).await?;
    app.permissions.auto_approve_session(&session.id);
    info!(target: "opencode::startup", session_id = %session.id, agent = %request.agent, "Running non-interactive prompt");

    let options = RunOptions {
        output_schema: request.format.schema().cloned(),
        ..Default::default()
    };
    let cancel = app.cancel_token().child_token();
    let spinner = (!request.quiet && std::io::stderr().is_terminal()).then(|| spawn_spinner(&cancel));

    let result = async {
        let events = runtime.run(&cancel, &session.id, request.prompt, options).await?;
        collect_run(events, None).await
    }
    .await;
    if let Some(spinner) = spinner {
        spinner.cancel();
    }

    let outcome = result.context("agent run failed")?;
    let rendered = request
        .format
        .render(&outcome.message.content(), outcome.structured_output.as_ref())?;
    writeln!(out, "{rendered}")?;
    out.flush()?;
    Ok(())
}

/// Runtime for `agent_id`, which must be a primary agent.
pub fn primary_agent(app: &App, agent_id: &str) -> anyhow::Result<std::sync::Arc<AgentRuntime>> {
    let runtime = app.agents.get(agent_id)?;
    if !runtime.info().is_primary() {
        bail!("agent '{agent_id}' is a subagent and cannot be run directly");
    }
    Ok(runtime)
}

/// The session with `id`, created with that id and `title` when missing.
/// Without an id a new session is created.
pub async fn resolve_session(app: &App, id: Option<&str>, title: &str) -> anyhow::Result<Session> {
    let Some(id) = id else {
        return Ok(app.sessions.create(title).await?);
    };
    match app.sessions.find(id).await? {
        Some(session) => Ok(session),
        None => Ok(app.sessions.create_with_id(id, title).await?),
    }
}

/// Braille spinner on stderr until the returned token is canceled or the run
/// token fires.
fn spawn_spinner(run: &CancellationToken) -> CancellationToken {
    let stop = run.child_token();
    let token = stop.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_millis(100));
        let mut frame = 0usize;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tick.tick() => {
                    eprint!("\r{} Working...", SPINNER_FRAMES[frame % SPINNER_FRAMES.len()]);
                    let _ = std::io::stderr().flush();
                    frame += 1;
                }
            }
        }
        eprint!("\r\x1b[2K");
        let _ = std::io::stderr().flush();
    });
    stop
}
