//! Discovery of skills and custom commands from markdown files.
//!
//! Both are markdown documents with optional YAML frontmatter. Skills live in
//! `<root>/<name>/SKILL.md`; commands are `<root>/**/*.md`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::Config;

/// Environment variable that disables `~/.claude/skills` discovery.
pub const DISABLE_CLAUDE_SKILLS_ENV: &str = "OPENCODE_DISABLE_CLAUDE_SKILLS";

const MAX_DESCRIPTION_LEN: usize = 100;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct DocFrontmatter {
    name: Option<String>,
    description: Option<String>,
    agent: Option<String>,
}

/// A skill the agent may load on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub path: PathBuf,
    pub body: String,
}

/// Skills keyed by name. The first root to define a name wins.
#[derive(Debug, Clone, Default)]
pub struct SkillRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillRegistry {
    /// Discover skills from `skills.paths`, the project, and the user's Claude skills.
    pub fn discover(config: &Config) -> Self {
        let mut roots: Vec<PathBuf> = config
            .skills
            .paths
            .iter()
            .map(|p| expand_home(p, &config.working_dir))
            .collect();
        roots.push(config.working_dir.join(".opencode").join("skills"));
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".config").join("opencode").join("skills"));
            let claude_disabled = std::env::var(DISABLE_CLAUDE_SKILLS_ENV)
                .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false);
            if !claude_disabled {
                roots.push(home.join(".claude").join("skills"));
            }
        }
        Self::from_roots(&roots)
    }

    pub fn from_roots(roots: &[PathBuf]) -> Self {
        let mut registry = Self::default();
        for root in roots {
            registry.scan_root(root);
        }
        debug!(target: "opencode::startup", skills = registry.skills.len(), "Skills discovered");
        registry
    }

    fn scan_root(&mut self, root: &Path) {
        let Ok(entries) = fs::read_dir(root) else {
            return;
        };
        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        for dir in dirs {
            let skill_file = dir.join("SKILL.md");
            let Ok(content) = fs::read_to_string(&skill_file) else {
                continue;
            };
            let (frontmatter, body) = parse_frontmatter::<DocFrontmatter>(&content);
            let name = frontmatter
                .name
                .or_else(|| dir.file_name().and_then(|n| n.to_str()).map(String::from))
                .unwrap_or_else(|| "unknown".to_string());
            if self.skills.contains_key(&name) {
                continue;
            }
            let description = frontmatter
                .description
                .or_else(|| first_content_line(body))
                .unwrap_or_else(|| "No description".to_string());
            self.skills.insert(
                name.clone(),
                Skill {
                    name,
                    description: truncate_description(description),
                    path: skill_file,
                    body: body.trim().to_string(),
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &Skill> {
        self.skills.values()
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// Section appended to system prompts listing the available skills.
    pub fn prompt_section(&self) -> Option<String> {
        if self.skills.is_empty() {
            return None;
        }
        let mut section = String::from(
            "# Skills\n\nLoad a skill with the `skill` tool when the task matches its description.\n\n",
        );
        for skill in self.skills.values() {
            section.push_str(&format!("- {}: {}\n", skill.name, skill.description));
        }
        Some(section)
    }
}

/// A user-defined prompt template invoked as `/name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomCommand {
    pub name: String,
    pub description: String,
    pub agent: Option<String>,
    pub template: String,
    pub source: PathBuf,
}

impl CustomCommand {
    /// Render the template, replacing `$ARGUMENTS` with `args`.
    pub fn render(&self, args: &str) -> String {
        if self.template.contains("$ARGUMENTS") {
            self.template.replace("$ARGUMENTS", args)
        } else if args.trim().is_empty() {
            self.template.clone()
        } else {
            format!("{}\n\n{}", self.template, args)
        }
    }
}

/// Custom commands keyed by name. Project commands override user commands.
#[derive(Debug, Clone, Default)]
pub struct CommandRegistry {
    commands: BTreeMap<String, CustomCommand>,
}

impl CommandRegistry {
    pub fn discover(config: &Config) -> Self {
        let mut roots = Vec::new();
        if let Some(home) = dirs::home_dir() {
            roots.push(home.join(".config").join("opencode").join("commands"));
        }
        roots.push(config.working_dir.join(".opencode").join("commands"));
        Self::from_roots(&roots)
    }

    /// Later roots override earlier ones.
    pub fn from_roots(roots: &[PathBuf]) -> Self {
        let mut registry = Self::default();
        for root in roots {
            registry.scan_dir(root, root);
        }
        registry
    }

    fn scan_dir(&mut self, root: &Path, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                // Recurse into subdirectories (for namespaced commands)
                self.scan_dir(root, &path);
                continue;
            }
            if path.extension().is_none_or(|e| e != "md") {
                continue;
            }
            let content = match fs::read_to_string(&path) {
                Ok(c) => c,
                Err(e) => {
                    debug!(
                        target: "opencode::startup",
                        "Failed to read command {}: {}",
                        path.display(),
                        e
                    );
                    continue;
                }
            };
            let (frontmatter, body) = parse_frontmatter::<DocFrontmatter>(&content);
            let name = frontmatter.name.unwrap_or_else(|| namespaced_name(root, &path));
            let description = frontmatter
                .description
                .or_else(|| first_content_line(body))
                .unwrap_or_else(|| "No description".to_string());
            self.commands.insert(
                name.clone(),
                CustomCommand {
                    name,
                    description: truncate_description(description),
                    agent: frontmatter.agent,
                    template: body.trim().to_string(),
                    source: path,
                },
            );
        }
    }

    pub fn get(&self, name: &str) -> Option<&CustomCommand> {
        self.commands.get(name.trim_start_matches('/'))
    }

    pub fn list(&self) -> impl Iterator<Item = &CustomCommand> {
        self.commands.values()
    }
}

/// `root/git/commit.md` becomes `git:commit`.
fn namespaced_name(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path).with_extension("");
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(":")
}

/// Parse YAML frontmatter from markdown content.
///
/// Returns the default value and the whole content when there is no
/// frontmatter or it does not parse.
pub fn parse_frontmatter<T>(content: &str) -> (T, &str)
where
    T: DeserializeOwned + Default,
{
    let content = content.trim_start();

    if !content.starts_with("---") {
        return (T::default(), content);
    }

    let rest = &content[3..];
    let Some(end_idx) = rest.find("\n---") else {
        return (T::default(), content);
    };
    let yaml_content = &rest[..end_idx];
    let remaining = rest[end_idx + 4..].trim_start_matches('-');

    if yaml_content.trim().is_empty() {
        return (T::default(), remaining);
    }
    match serde_yaml::from_str::<T>(yaml_content) {
        Ok(fm) => (fm, remaining),
        Err(e) => {
            debug!(target: "opencode::startup", "Failed to parse YAML frontmatter: {}", e);
            (T::default(), content)
        }
    }
}

fn first_content_line(body: &str) -> Option<String> {
    body.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

fn truncate_description(description: String) -> String {
    if description.chars().count() > MAX_DESCRIPTION_LEN {
        let cut: String = description.chars().take(MAX_DESCRIPTION_LEN - 3).collect();
        format!("{cut}...")
    } else {
        description
    }
}

/// Expand a leading `~` and resolve relative paths against `base`.
pub fn expand_home(path: &str, base: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    let p = PathBuf::from(path);
    if p.is_absolute() { p } else { base.join(p) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_frontmatter_with_yaml() {
        let content = r#"---
name: test-command
description: A test command
---

# Test Command

This is the body.
"#;
        let (fm, remaining) = parse_frontmatter::<DocFrontmatter>(content);
        assert_eq!(fm.name, Some("test-command".to_string()));
        assert_eq!(fm.description, Some("A test command".to_string()));
        assert!(remaining.contains("# Test Command"));
    }

    #[test]
    fn test_parse_frontmatter_without_yaml() {
        let content = "# Just a heading\n\nSome content.";
        let (fm, remaining) = parse_frontmatter::<DocFrontmatter>(content);
        assert_eq!(fm.name, None);
        assert_eq!(remaining, content);
    }

    #[test]
    fn test_skill_discovery_first_root_wins() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        for (root, desc) in [(a.path(), "from a"), (b.path(), "from b")] {
            let dir = root.join("review");
            fs::create_dir_all(&dir).unwrap();
            fs::write(
                dir.join("SKILL.md"),
                format!("---\ndescription: {desc}\n---\nDo the review."),
            )
            .unwrap();
        }
        let registry = SkillRegistry::from_roots(&[a.path().to_path_buf(), b.path().to_path_buf()]);
        let skill = registry.get("review").unwrap();
        assert_eq!(skill.description, "from a");
        assert_eq!(skill.body, "Do the review.");
        assert!(registry.prompt_section().unwrap().contains("- review: from a"));
    }

    #[test]
    fn test_commands_namespaced_and_rendered() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("git");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("commit.md"), "Write a commit message for $ARGUMENTS").unwrap();

        let registry = CommandRegistry::from_roots(&[root.path().to_path_buf()]);
        let cmd = registry.get("/git:commit").unwrap();
        assert_eq!(cmd.render("the parser fix"), "Write a commit message for the parser fix");
    }
}
