//! Configuration loading.
//!
//! Configuration is JSON, merged from the global locations and then the
//! project-local `.opencode.json`. Unknown keys are accepted and ignored.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use opencode_types::{AgentMode, PermissionAction, PermissionRule};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::{CoreError, Result};

pub const CONFIG_FILE_NAME: &str = ".opencode.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub data: DataConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub lsp: BTreeMap<String, LspServerConfig>,
    pub agents: BTreeMap<String, AgentConfig>,
    /// Accepted so existing config files parse; MCP servers are not started.
    pub mcp_servers: BTreeMap<String, Value>,
    pub tui: TuiConfig,
    pub shell: ShellConfig,
    #[serde(default = "default_auto_compact")]
    pub auto_compact: bool,
    #[serde(default = "default_auto_compact_threshold")]
    pub auto_compact_threshold: f64,
    #[serde(rename = "disableLSPDownload")]
    pub disable_lsp_download: bool,
    pub session_provider: SessionProviderConfig,
    pub skills: SkillsConfig,
    pub permission: PermissionConfig,

    #[serde(skip)]
    pub working_dir: PathBuf,
    #[serde(skip)]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data: DataConfig::default(),
            providers: BTreeMap::new(),
            lsp: BTreeMap::new(),
            agents: BTreeMap::new(),
            mcp_servers: BTreeMap::new(),
            tui: TuiConfig::default(),
            shell: ShellConfig::default(),
            auto_compact: default_auto_compact(),
            auto_compact_threshold: default_auto_compact_threshold(),
            disable_lsp_download: false,
            session_provider: SessionProviderConfig::default(),
            skills: SkillsConfig::default(),
            permission: PermissionConfig::default(),
            working_dir: PathBuf::from("."),
            debug: false,
        }
    }
}

fn default_auto_compact() -> bool {
    true
}

fn default_auto_compact_threshold() -> f64 {
    0.5
}

fn default_data_directory() -> String {
    ".opencode".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DataConfig {
    pub directory: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            directory: default_data_directory(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProviderConfig {
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    #[serde(rename = "baseURL")]
    pub base_url: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub disabled: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LspServerConfig {
    pub command: String,
    pub args: Vec<String>,
    pub extensions: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub initialization: Option<Value>,
    pub disabled: bool,
}

/// Per-agent overrides from `agents.<id>`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AgentConfig {
    pub model: Option<String>,
    pub max_tokens: Option<i64>,
    pub reasoning_effort: Option<String>,
    pub permission: BTreeMap<String, PermissionRule>,
    pub tools: BTreeMap<String, bool>,
    pub mode: Option<AgentMode>,
    pub name: Option<String>,
    pub prompt: Option<String>,
    pub description: Option<String>,
    pub color: Option<String>,
    pub hidden: Option<bool>,
    pub disabled: Option<bool>,
    pub output: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TuiConfig {
    pub theme: String,
}

impl Default for TuiConfig {
    fn default() -> Self {
        Self {
            theme: "opencode".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShellConfig {
    pub path: Option<String>,
    pub args: Vec<String>,
}

impl ShellConfig {
    /// The shell to run commands with: config, then `$SHELL`, then `/bin/bash`.
    pub fn resolve(&self) -> (String, Vec<String>) {
        let path = self
            .path
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var("SHELL").ok().filter(|p| !p.is_empty()))
            .unwrap_or_else(|| "/bin/bash".to_string());
        let args = if self.args.is_empty() {
            vec!["-l".to_string()]
        } else {
            self.args.clone()
        };
        (path, args)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionProviderType {
    #[default]
    Sqlite,
    Mysql,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionProviderConfig {
    #[serde(rename = "type")]
    pub kind: SessionProviderType,
    pub mysql: MysqlConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MysqlConfig {
    pub dsn: Option<String>,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub max_connections: u32,
    pub max_idle_connections: u32,
    /// Seconds.
    pub connection_timeout: u64,
}

impl Default for MysqlConfig {
    fn default() -> Self {
        Self {
            dsn: None,
            host: "localhost".to_string(),
            port: 3306,
            database: "opencode".to_string(),
            username: String::new(),
            password: String::new(),
            max_connections: 10,
            max_idle_connections: 5,
            connection_timeout: 30,
        }
    }
}

impl MysqlConfig {
    /// Connection URL, preferring an explicit DSN.
    pub fn url(&self) -> String {
        if let Some(dsn) = self.dsn.as_ref().filter(|d| !d.is_empty()) {
            if dsn.starts_with("mysql://") {
                return dsn.clone();
            }
            // `user:pass@tcp(host:port)/db?opts` style DSNs.
            if let Some((creds, rest)) = dsn.split_once("@tcp(") {
                if let Some((addr, tail)) = rest.split_once(')') {
                    return format!("mysql://{creds}@{addr}{tail}");
                }
            }
            return format!("mysql://{dsn}");
        }
        if self.password.is_empty() {
            format!(
                "mysql://{}@{}:{}/{}",
                self.username, self.host, self.port, self.database
            )
        } else {
            format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username, self.password, self.host, self.port, self.database
            )
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkillsConfig {
    pub paths: Vec<String>,
}

/// Global permission rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermissionConfig {
    /// Rule for the `skill` tool.
    pub skill: Option<PermissionRule>,
    pub rules: BTreeMap<String, PermissionRule>,
}

impl PermissionConfig {
    /// Rules with `skill` folded in as the entry for tool `skill`.
    pub fn effective_rules(&self) -> BTreeMap<String, PermissionRule> {
        let mut rules = self.rules.clone();
        if let Some(skill) = &self.skill {
            rules.insert("skill".to_string(), skill.clone());
        }
        rules
    }

    pub fn set(&mut self, tool: &str, action: PermissionAction) {
        self.rules
            .insert(tool.to_string(), PermissionRule::Action(action));
    }
}

impl Config {
    /// Load and merge the global and project config files, then apply
    /// environment overrides.
    pub fn load(working_dir: &Path, debug: bool) -> Result<Self> {
        let mut merged = Value::Object(Default::default());
        for path in Self::search_paths(working_dir) {
            if !path.is_file() {
                continue;
            }
            let content = std::fs::read_to_string(&path)?;
            let value: Value = serde_json::from_str(&content).map_err(|e| {
                CoreError::Config(format!("failed to parse {}: {}", path.display(), e))
            })?;
            debug!(target: "opencode::startup", path = %path.display(), "Loaded config file");
            merge_json(&mut merged, value);
        }

        let mut config: Config = serde_json::from_value(merged)
            .map_err(|e| CoreError::Config(format!("invalid configuration: {e}")))?;
        config.working_dir = working_dir.to_path_buf();
        config.debug = debug;
        config.apply_env(|key| std::env::var(key).ok());

        info!(
            target: "opencode::startup",
            working_dir = %working_dir.display(),
            providers = config.providers.len(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Global locations in precedence order, then the project file.
    pub fn search_paths(working_dir: &Path) -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(CONFIG_FILE_NAME));
        }
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            if !xdg.is_empty() {
                paths.push(PathBuf::from(xdg).join("opencode").join(CONFIG_FILE_NAME));
            }
        }
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("opencode").join(CONFIG_FILE_NAME));
        }
        paths.push(working_dir.join(CONFIG_FILE_NAME));
        paths.dedup();
        paths
    }

    /// Apply environment overrides using the supplied lookup.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for (provider, var) in [
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("openai", "OPENAI_API_KEY"),
            ("gemini", "GEMINI_API_KEY"),
        ] {
            if let Some(key) = env(var).filter(|k| !k.is_empty()) {
                let entry = self.providers.entry(provider.to_string()).or_default();
                if entry.api_key.as_deref().is_none_or(str::is_empty) {
                    entry.api_key = Some(key);
                }
            }
        }

        if env_flag(&env, "OPENCODE_DISABLE_LSP_DOWNLOAD") {
            self.disable_lsp_download = true;
        }
        if let Some(kind) = env("OPENCODE_SESSION_PROVIDER_TYPE") {
            match kind.to_lowercase().as_str() {
                "mysql" => self.session_provider.kind = SessionProviderType::Mysql,
                "sqlite" => self.session_provider.kind = SessionProviderType::Sqlite,
                _ => {}
            }
        }
        if let Some(dsn) = env("OPENCODE_MYSQL_DSN").filter(|d| !d.is_empty()) {
            self.session_provider.mysql.dsn = Some(dsn);
        }
        if env_flag(&env, "OPENCODE_DEV_DEBUG") {
            self.debug = true;
        }
    }

    /// Absolute data directory.
    pub fn data_dir(&self) -> PathBuf {
        let dir = PathBuf::from(&self.data.directory);
        if dir.is_absolute() {
            dir
        } else {
            self.working_dir.join(dir)
        }
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name).filter(|p| !p.disabled)
    }
}

fn env_flag<F>(env: &F, key: &str) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    env(key)
        .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

/// Deep merge `overlay` into `base`. Objects merge key by key; anything else replaces.
pub fn merge_json(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.auto_compact);
        assert_eq!(config.auto_compact_threshold, 0.5);
        assert_eq!(config.data.directory, ".opencode");
        assert_eq!(config.session_provider.kind, SessionProviderType::Sqlite);
    }

    #[test]
    fn test_merge_json_is_deep() {
        let mut base = json!({"providers": {"openai": {"apiKey": "a", "disabled": false}}, "autoCompact": true});
        merge_json(
            &mut base,
            json!({"providers": {"openai": {"disabled": true}}, "autoCompact": false}),
        );
        assert_eq!(base["providers"]["openai"]["apiKey"], "a");
        assert_eq!(base["providers"]["openai"]["disabled"], true);
        assert_eq!(base["autoCompact"], false);
    }

    #[test]
    fn test_parse_full_shape() {
        let config: Config = serde_json::from_value(json!({
            "data": {"directory": "/tmp/oc"},
            "providers": {"anthropic": {"apiKey": "k", "baseURL": "http://x"}},
            "lsp": {"go": {"command": "gopls", "extensions": [".go"]}},
            "agents": {"coder": {"model": "gpt-4o", "maxTokens": 1000, "permission": {"bash": {"git *": "allow"}}}},
            "mcpServers": {"fs": {"command": "mcp-fs", "type": "stdio"}},
            "shell": {"path": "/bin/zsh", "args": ["-c"]},
            "disableLSPDownload": true,
            "sessionProvider": {"type": "mysql", "mysql": {"host": "db", "maxConnections": 4}},
            "skills": {"paths": ["~/skills"]},
            "permission": {"skill": "deny", "rules": {"bash": "ask"}},
            "somethingUnknown": 1
        }))
        .unwrap();

        assert_eq!(config.data.directory, "/tmp/oc");
        assert_eq!(
            config.providers["anthropic"].base_url.as_deref(),
            Some("http://x")
        );
        assert_eq!(config.lsp["go"].extensions, vec![".go".to_string()]);
        assert_eq!(config.agents["coder"].max_tokens, Some(1000));
        assert!(config.disable_lsp_download);
        assert_eq!(config.session_provider.kind, SessionProviderType::Mysql);
        assert_eq!(config.session_provider.mysql.max_connections, 4);
        assert_eq!(config.session_provider.mysql.port, 3306);
        let rules = config.permission.effective_rules();
        assert_eq!(
            rules["skill"],
            PermissionRule::Action(PermissionAction::Deny)
        );
        assert_eq!(rules["bash"], PermissionRule::Action(PermissionAction::Ask));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("OPENAI_API_KEY", "sk-test"),
            ("OPENCODE_DISABLE_LSP_DOWNLOAD", "true"),
            ("OPENCODE_SESSION_PROVIDER_TYPE", "mysql"),
            ("OPENCODE_MYSQL_DSN", "user:pw@tcp(db:3306)/oc"),
        ]);
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.providers["openai"].api_key.as_deref(), Some("sk-test"));
        assert!(config.disable_lsp_download);
        assert_eq!(config.session_provider.kind, SessionProviderType::Mysql);
        assert_eq!(
            config.session_provider.mysql.url(),
            "mysql://user:pw@db:3306/oc"
        );
    }

    #[test]
    fn test_api_key_not_serialized() {
        let mut config = Config::default();
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("secret".into()),
                ..Default::default()
            },
        );
        let out = serde_json::to_string(&config).unwrap();
        assert!(!out.contains("secret"));
    }

    #[test]
    fn test_load_project_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"autoCompact": false, "autoCompactThreshold": 0.8}"#,
        )
        .unwrap();
        let config = Config::load(dir.path(), false).unwrap();
        assert!(!config.auto_compact);
        assert_eq!(config.auto_compact_threshold, 0.8);
        assert_eq!(config.data_dir(), dir.path().join(".opencode"));
    }
}
