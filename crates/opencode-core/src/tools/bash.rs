use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{OutputSpool, PermissionSpec, Tool, ToolContext, ToolDeps, ToolInfo, ToolInvocation, ToolResponse, parse_input};
use crate::Result;
use crate::config::Config;

const DEFAULT_TIMEOUT_MS: u64 = 60_000;
const MAX_TIMEOUT_MS: u64 = 600_000;

/// Network clients and browsers the shell may not run.
pub const BANNED_COMMANDS: &[&str] = &[
    "alias", "curl", "curlie", "wget", "axel", "aria2c", "nc", "telnet", "lynx", "w3m", "links",
    "httpie", "xh", "http-prompt", "chrome", "firefox", "safari",
];

/// Commands that only read state; an `ask` verdict is treated as allow.
const READ_ONLY_COMMANDS: &[&str] = &[
    "ls", "echo", "pwd", "date", "cal", "uptime", "whoami", "id", "groups", "env", "printenv",
    "which", "type", "whereis", "whatis", "uname", "hostname", "df", "du", "free", "ps",
    "git status", "git log", "git diff", "git show", "git branch", "git tag", "git remote",
    "git ls-files", "git rev-parse", "git describe", "git blame", "git grep", "git shortlog",
    "cargo metadata", "go version", "go env", "go list",
];

#[derive(Debug, Deserialize)]
struct BashParams {
    command: String,
    /// Milliseconds.
    timeout: Option<u64>,
}

pub struct BashTool {
    config: Arc<Config>,
    spool: Arc<OutputSpool>,
}

impl BashTool {
    pub fn new(deps: &ToolDeps) -> Self {
        Self {
            config: deps.config.clone(),
            spool: deps.spool.clone(),
        }
    }
}

fn is_read_only(command: &str) -> bool {
    let command = command.trim();
    READ_ONLY_COMMANDS.iter().any(|safe| {
        command == *safe
            || command
                .strip_prefix(safe)
                .is_some_and(|rest| rest.starts_with(' '))
    }) && !command.contains(['>', ';', '&', '|', '`', '$'])
}

fn banned_command(command: &str) -> Option<&'static str> {
    command
        .split(|c: char| c == '|' || c == ';' || c == '&' || c == '\n')
        .filter_map(|segment| segment.split_whitespace().next())
        .find_map(|base| BANNED_COMMANDS.iter().find(|b| base.eq_ignore_ascii_case(b)).copied())
}

#[derive(Debug)]
enum Outcome {
    Exited(Option<i32>),
    TimedOut,
    Canceled,
}

#[async_trait]
impl Tool for BashTool {
    fn info(&self) -> ToolInfo {
        ToolInfo {
            name: "bash".into(),
            description: format!(
                "Run a command in the user's shell ({}) from the working directory. Output over {} lines is saved to a file and previewed. Network tools are not allowed: {}.",
                self.config.shell.resolve().0,
                super::MAX_OUTPUT_LINES,
                BANNED_COMMANDS.join(", ")
            ),
            parameters: json!({
                "command": {"type": "string", "description": "The command to execute"},
                "timeout": {"type": "number", "description": "Optional timeout in milliseconds (max 600000)"},
            }),
            required: vec!["command".into()],
        }
    }

    fn permission(&self, ctx: &ToolContext, input: &Value) -> Option<PermissionSpec> {
        let command = input.get("command").and_then(Value::as_str).unwrap_or_default();
        Some(PermissionSpec {
            action: "execute".into(),
            path: ctx.working_dir.to_string_lossy().to_string(),
            description: format!("Execute command: {command}"),
            pattern: command.to_string(),
            params: json!({"command": command}),
            read_only: is_read_only(command),
        })
    }

    async fn run(&self, ctx: &ToolContext, call: &ToolInvocation) -> Result<ToolResponse> {
        let params: BashParams = match parse_input(call) {
            Ok(p) => p,
            Err(resp) => return Ok(resp),
        };
        if params.command.trim().is_empty() {
            return Ok(ToolResponse::error("missing command"));
        }
        if let Some(banned) = banned_command(&params.command) {
            return Ok(ToolResponse::error(format!("command '{banned}' is not allowed")));
        }
        let timeout = Duration::from_millis(params.timeout.unwrap_or(DEFAULT_TIMEOUT_MS).clamp(1, MAX_TIMEOUT_MS));

        let (shell, args) = self.config.shell.resolve();
        let mut command = Command::new(&shell);
        command
            .args(&args)
            .arg("-c")
            .arg(&params.command)
            .current_dir(&ctx.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let started = chrono::Utc::now().timestamp_millis();
        let mut child = command.spawn()?;
        let pid = child.id();
        debug!(target: "opencode::tools", pid = ?pid, command = %params.command, "Spawned shell command");

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let stdout_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(out) = stdout.as_mut() {
                let _ = out.read_to_end(&mut buf).await;
            }
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(err) = stderr.as_mut() {
                let _ = err.read_to_end(&mut buf).await;
            }
            buf
        });

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?.code()),
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = ctx.cancel.cancelled() => Outcome::Canceled,
        };
        if !matches!(outcome, Outcome::Exited(_)) {
            kill_process_group(pid);
            if let Err(e) = child.kill().await {
                warn!(target: "opencode::tools", "Failed to kill shell command: {}", e);
            }
        }

        let stdout = String::from_utf8_lossy(&stdout_task.await.unwrap_or_default()).to_string();
        let stderr = String::from_utf8_lossy(&stderr_task.await.unwrap_or_default()).to_string();

        let mut content = self.spool.spool("stdout", &stdout);
        let stderr = self.spool.spool("stderr", &stderr);
        if !stderr.is_empty() {
            if !content.is_empty() && !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str(&stderr);
        }

        let exit_code = match outcome {
            Outcome::Exited(code) => {
                if let Some(code) = code.filter(|c| *c != 0) {
                    content.push_str(&format!("\nExit code {code}"));
                }
                code
            }
            Outcome::TimedOut => {
                content.push_str(&format!("\nCommand timed out after {}ms", timeout.as_millis()));
                None
            }
            Outcome::Canceled => {
                content.push_str("\nCommand was aborted before completion");
                None
            }
        };
        if content.is_empty() {
            content = "no output".to_string();
        }

        let metadata = json!({
            "start_time": started,
            "end_time": chrono::Utc::now().timestamp_millis(),
            "exit_code": exit_code,
        });
        Ok(ToolResponse::text(content).with_metadata(metadata))
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; a stale pgid yields ESRCH.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::test_support::{Fixture, call};

    #[test]
    fn test_banned_commands() {
        assert_eq!(banned_command("curl https://x"), Some("curl"));
        assert_eq!(banned_command("ls && wget x"), Some("wget"));
        assert_eq!(banned_command("cargo build"), None);
    }

    #[test]
    fn test_read_only_detection() {
        assert!(is_read_only("git status"));
        assert!(is_read_only("ls -la"));
        assert!(!is_read_only("lsof"));
        assert!(!is_read_only("ls > out.txt"));
        assert!(!is_read_only("rm -rf /"));
    }

    #[tokio::test]
    async fn test_runs_command_in_working_dir() {
        let fx = Fixture::new().await;
        std::fs::write(fx.dir.path().join("marker.txt"), "").unwrap();
        let tool = BashTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("bash", json!({"command": "ls"})))
            .await
            .unwrap();
        assert!(!resp.is_error);
        assert!(resp.content.contains("marker.txt"));
    }

    #[tokio::test]
    async fn test_exit_code_and_stderr() {
        let fx = Fixture::new().await;
        let tool = BashTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("bash", json!({"command": "echo oops >&2; exit 3"})))
            .await
            .unwrap();
        assert!(resp.content.contains("oops"));
        assert!(resp.content.contains("Exit code 3"));
    }

    #[tokio::test]
    async fn test_timeout_kills_command() {
        let fx = Fixture::new().await;
        let tool = BashTool::new(&fx.deps);
        let resp = tool
            .run(&fx.ctx(), &call("bash", json!({"command": "sleep 30", "timeout": 100})))
            .await
            .unwrap();
        assert!(resp.content.contains("timed out"));
    }
}
