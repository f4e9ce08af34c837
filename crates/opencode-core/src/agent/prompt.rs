//! Built-in agent prompts and system prompt assembly.

use std::path::Path;

use crate::discovery::SkillRegistry;

pub const CODER_PROMPT: &str = "You are OpenCode, an interactive CLI coding assistant. \
Use the available tools to read, search and modify the user's project. \
Read a file before editing it. Keep answers short and direct; \
do not explain code you did not change unless asked. \
When a task is finished, state briefly what you did.";

pub const TASK_PROMPT: &str = "You are a research agent working for another agent. \
Use the read-only tools to answer the request below. \
Your final message is returned verbatim to the caller, so make it a complete, \
self-contained report. You cannot modify files.";

pub const SUMMARIZER_PROMPT: &str = "You summarize coding conversations. \
Write a concise summary of the conversation so far that another agent can continue from: \
what was asked, what was done, which files were touched, and what remains. \
Do not call tools.";

pub const DESCRIPTOR_PROMPT: &str = "Write a title for the conversation that starts with the user's message below. \
Reply with the title only: at most 50 characters, one line, no quotes or trailing punctuation.";

/// Project instruction files appended to every agent's system prompt.
pub const CONTEXT_FILES: &[&str] = &[
    ".github/copilot-instructions.md",
    ".cursorrules",
    "CLAUDE.md",
    "CLAUDE.local.md",
    "opencode.md",
    "opencode.local.md",
    "OpenCode.md",
    "OpenCode.local.md",
    "OPENCODE.md",
    "OPENCODE.local.md",
    "AGENTS.md",
];

/// Concatenate the context files present in `working_dir`. Files that are
/// the same on a case-insensitive filesystem are read once.
pub fn load_context_files(working_dir: &Path) -> Option<String> {
    let mut seen = std::collections::HashSet::new();
    let mut sections = Vec::new();
    for name in CONTEXT_FILES {
        let path = working_dir.join(name);
        let Ok(canonical) = path.canonicalize() else { continue };
        if !seen.insert(canonical) {
            continue;
        }
        if let Ok(content) = std::fs::read_to_string(&path) {
            let content = content.trim();
            if !content.is_empty() {
                sections.push(format!("# From {name}\n{content}"));
            }
        }
    }
    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

fn environment_section(working_dir: &Path) -> String {
    let is_git = working_dir.join(".git").exists();
    format!(
        "<env>\nWorking directory: {}\nIs directory a git repo: {}\nPlatform: {}\nToday's date: {}\n</env>",
        working_dir.display(),
        if is_git { "yes" } else { "no" },
        std::env::consts::OS,
        chrono::Local::now().format("%Y-%m-%d"),
    )
}

/// Agent prompt, environment, project context and available skills.
pub fn build_system_prompt(
    agent_prompt: &str,
    working_dir: &Path,
    skills: Option<&SkillRegistry>,
    with_context: bool,
) -> String {
    let mut prompt = agent_prompt.trim().to_string();
    if !with_context {
        return prompt;
    }
    prompt.push_str("\n\n");
    prompt.push_str(&environment_section(working_dir));
    if let Some(context) = load_context_files(working_dir) {
        prompt.push_str("\n\n# Project-specific context\nFollow these instructions.\n\n");
        prompt.push_str(&context);
    }
    if let Some(section) = skills.and_then(SkillRegistry::prompt_section) {
        prompt.push_str("\n\n");
        prompt.push_str(&section);
    }
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_files_loaded() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("AGENTS.md"), "Use tabs.").unwrap();
        let context = load_context_files(dir.path()).unwrap();
        assert!(context.contains("# From AGENTS.md"));
        assert!(context.contains("Use tabs."));
    }

    #[test]
    fn test_no_context_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_context_files(dir.path()).is_none());
    }

    #[test]
    fn test_build_system_prompt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("OpenCode.md"), "Run make test.").unwrap();
        let prompt = build_system_prompt("Base prompt", dir.path(), None, true);
        assert!(prompt.starts_with("Base prompt"));
        assert!(prompt.contains("<env>"));
        assert!(prompt.contains("Run make test."));

        let bare = build_system_prompt("Base prompt", dir.path(), None, false);
        assert_eq!(bare, "Base prompt");
    }
}
