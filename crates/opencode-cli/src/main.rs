use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use opencode_cli::logging::{self, LogPreset};
use opencode_cli::runner::{self, Request};
use opencode_cli::{OutputFormat, repl};
use opencode_core::agent::CODER_AGENT;
use opencode_core::{App, Config};
use tokio::io::BufReader;
use tracing::{info, warn};

/// Terminal AI coding agent.
#[derive(Parser, Debug)]
#[command(name = "opencode")]
#[command(version, disable_version_flag = true)]
struct Cli {
    /// Print version
    #[arg(short = 'v', long, action = clap::ArgAction::Version)]
    #[allow(dead_code)]
    version: Option<bool>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Working directory
    #[arg(short, long, value_name = "PATH")]
    cwd: Option<PathBuf>,

    /// Run one prompt non-interactively and exit
    #[arg(short, long, value_name = "TEXT")]
    prompt: Option<String>,

    /// Primary agent to use
    #[arg(short, long, value_name = "ID", default_value = CODER_AGENT)]
    agent: String,

    /// Resume the session with this id, creating it when missing
    #[arg(short, long, value_name = "ID")]
    session: Option<String>,

    /// Delete the --session id before starting
    #[arg(short = 'D', long, requires = "session")]
    delete: bool,

    /// Output format: text, json, or json_schema=<inline JSON | path | {"$ref":path}>
    #[arg(short = 'f', long, value_name = "FORMAT", default_value = "text")]
    output_format: OutputFormat,

    /// Hide the spinner
    #[arg(short, long)]
    quiet: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            // Help and version go to stdout and are not failures.
            let code = if e.use_stderr() { ExitCode::FAILURE } else { ExitCode::SUCCESS };
            let _ = e.print();
            return code;
        }
    };
    logging::init(LogPreset::from_flags(cli.debug, |k| std::env::var(k).ok()));

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    if let Some(dir) = &cli.cwd {
        std::env::set_current_dir(dir).with_context(|| format!("cannot change to {}", dir.display()))?;
    }
    let working_dir = std::env::current_dir().context("cannot resolve working directory")?;
    let config = Config::load(&working_dir, cli.debug)?;
    let app = App::new(config).await?;
    info!(target: "opencode::startup", working_dir = %working_dir.display(), "Started");

    let result = drive(&app, &cli).await;
    app.shutdown().await;
    result
}

async fn drive(app: &App, cli: &Cli) -> Result<()> {
    if cli.delete {
        if let Some(id) = &cli.session {
            match app.sessions.find(id).await? {
                Some(_) => app.sessions.delete(id).await?,
                None => warn!(target: "opencode::startup", session_id = %id, "Nothing to delete"),
            }
        }
    }
    app.start_lsp();

    let cancel = app.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let mut stdout = std::io::stdout();
    match &cli.prompt {
        Some(prompt) => {
            let request = Request {
                agent: &cli.agent,
                session_id: cli.session.as_deref(),
                prompt,
                format: &cli.output_format,
                quiet: cli.quiet,
            };
            runner::run_non_interactive(app, request, &mut stdout).await
        }
        None => {
            let input = BufReader::new(tokio::io::stdin());
            repl::run(app, &cli.agent, cli.session.as_deref(), input, &mut stdout).await
        }
    }
}
