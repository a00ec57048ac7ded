use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Map, Value};

pub const TEMPLATE_ENV: &str = "SANDBOX_RELAY_TEMPLATE";
pub const GITHUB_PAT_ENV: &str = "GITHUB_PAT";
pub const GROQ_API_KEY_ENV: &str = "GROQ_API_KEY";

const DEFAULT_SANDBOX_TEMPLATE: &str = "claude-code-dev";
const DEFAULT_CAPABILITY_TEMPLATE: &str = "mcp-gateway";
const DEFAULT_SANDBOX_TIMEOUT: Duration = Duration::from_secs(60 * 60);
const DEFAULT_TEMPLATE_REPO: &str = "https://github.com/AmaruEscalante/template";
const DEFAULT_TEMPLATE_DIR: &str = "template";
const DEFAULT_INSTALL_COMMAND: &str = "pnpm install";
const DEFAULT_PROBE_PORTS: [u16; 5] = [3000, 5173, 8000, 8080, 4200];
const DEFAULT_AGENT_COMMAND: &str = "ccr code";
const DIRECT_AGENT_COMMAND: &str = "claude";
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_SETUP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_EXECUTION_POLL: Duration = Duration::from_millis(100);

const ROUTER_PACKAGE: &str = "@musistudio/claude-code-router";
const ROUTER_PORT: u16 = 3456;
const ROUTER_CONFIG_TEMPLATE: &str = include_str!("../templates/router-config.json");
pub const ROUTER_API_KEY_PLACEHOLDER: &str = "$GROQ_API_KEY";

/// `{template_path}` is replaced with the absolute template directory.
const SYSTEM_INSTRUCTIONS: &str = r#"
WORKING DIRECTORY:
The starter project has been cloned to `{template_path}` and its dependencies are installed. Work from there unless asked otherwise.

A GitHub token is available in the GITHUB_PAT environment variable.

BEFORE CHANGING CODE:
1. Start the dev server in the background:
   cd {template_path} && nohup pnpm dev --host --port 5173 > vite.log 2>&1 &
2. Give it a few seconds, then check it answers:
   sleep 3 && curl http://localhost:5173
3. `--host` binds 0.0.0.0, which makes the app reachable through the sandbox preview URL on port 5173.

TOOLS:
- There is no tool called 'LS'. List files with `ls` through Bash, or with Glob.
- Only call tools that are present in your toolset.

When asked to upload or push code, use the GitHub MCP tools, preferably pushing to a new repository.
"#;

#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub enabled: bool,
    pub package: String,
    pub install_strategies: Vec<String>,
    pub install_timeout: Duration,
    /// Directory, relative to the sandbox home, holding `config.json`.
    pub config_dir: String,
    pub config_template: String,
    pub api_key: Option<String>,
    pub port: u16,
    pub log_path: String,
    pub start_timeout: Duration,
    pub settle_delay: Duration,
    pub verify_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            package: ROUTER_PACKAGE.to_string(),
            install_strategies: vec![
                format!("sudo npm install -g {ROUTER_PACKAGE}"),
                format!("npm install -g {ROUTER_PACKAGE}"),
                format!("bun add -g {ROUTER_PACKAGE}"),
            ],
            install_timeout: Duration::from_secs(120),
            config_dir: ".claude-code-router".to_string(),
            config_template: ROUTER_CONFIG_TEMPLATE.to_string(),
            api_key: None,
            port: ROUTER_PORT,
            log_path: "/tmp/router.log".to_string(),
            start_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(3),
            verify_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl RouterSettings {
    pub fn url(&self) -> String {
        format!("http://localhost:{}", self.port)
    }

    pub fn render_config(&self) -> String {
        self.config_template.replace(
            ROUTER_API_KEY_PLACEHOLDER,
            self.api_key.as_deref().unwrap_or(""),
        )
    }
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub sandbox_template: String,
    pub capability_template: String,
    pub sandbox_timeout: Duration,
    pub template_repo: String,
    pub template_dir: String,
    pub install_command: String,
    pub probe_ports: Vec<u16>,
    /// Overrides the agent command derived from the router setting.
    pub agent_command: Option<String>,
    pub system_instructions: String,
    pub setup_timeout: Duration,
    pub execution_timeout: Duration,
    pub execution_poll: Duration,
    pub github_pat: Option<String>,
    pub router: RouterSettings,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            sandbox_template: DEFAULT_SANDBOX_TEMPLATE.to_string(),
            capability_template: DEFAULT_CAPABILITY_TEMPLATE.to_string(),
            sandbox_timeout: DEFAULT_SANDBOX_TIMEOUT,
            template_repo: DEFAULT_TEMPLATE_REPO.to_string(),
            template_dir: DEFAULT_TEMPLATE_DIR.to_string(),
            install_command: DEFAULT_INSTALL_COMMAND.to_string(),
            probe_ports: DEFAULT_PROBE_PORTS.to_vec(),
            agent_command: None,
            system_instructions: SYSTEM_INSTRUCTIONS.to_string(),
            setup_timeout: DEFAULT_SETUP_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            execution_poll: DEFAULT_EXECUTION_POLL,
            github_pat: None,
            router: RouterSettings::default(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(template) = non_empty_env(TEMPLATE_ENV) {
            config.sandbox_template = template;
        }
        config.github_pat = non_empty_env(GITHUB_PAT_ENV);
        config.router.api_key = non_empty_env(GROQ_API_KEY_ENV);
        config
    }

    /// Capability servers to expose through the sandbox gateway, keyed by name.
    pub fn capabilities(&self) -> Map<String, Value> {
        let mut capabilities = Map::new();
        if let Some(token) = &self.github_pat {
            capabilities.insert(
                "githubOfficial".to_string(),
                json!({ "personalAccessToken": token }),
            );
        }
        capabilities
    }

    pub fn agent_command(&self) -> &str {
        match &self.agent_command {
            Some(command) => command.as_str(),
            None if self.router.enabled => DEFAULT_AGENT_COMMAND,
            None => DIRECT_AGENT_COMMAND,
        }
    }

    pub fn sandbox_envs(&self) -> BTreeMap<String, String> {
        let mut envs = BTreeMap::new();
        if let Some(token) = &self.github_pat {
            envs.insert(GITHUB_PAT_ENV.to_string(), token.clone());
        }
        if self.router.enabled {
            // The router holds the real provider key; the agent only needs a placeholder.
            envs.insert("ANTHROPIC_API_KEY".to_string(), "sk-ant-router".to_string());
            envs.insert("ANTHROPIC_BASE_URL".to_string(), self.router.url());
            envs.insert("DISABLE_TELEMETRY".to_string(), "true".to_string());
            envs.insert("DISABLE_COST_WARNINGS".to_string(), "true".to_string());
        }
        envs
    }

    pub fn instructions_for(&self, template_path: &str) -> String {
        self.system_instructions
            .replace("{template_path}", template_path)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
