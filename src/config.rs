use crate::pool::PoolConfig;
use crate::routes::RouteMatcher;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Options for the functions plugin
///
/// Field names follow Rust conventions; the camelCase names used by JavaScript dev
/// server configs are accepted as aliases so existing configs can be reused.
#[derive(Debug, Deserialize, Clone)]
pub struct PluginOptions {
    /// Regular expression(s) selecting the routes handled by the functions runtime
    ///
    /// Example: `match_routes = "^/api/"` only handles requests to `/api/...` routes
    #[serde(alias = "matchRoutes")]
    pub match_routes: MatchRoutes,

    /// Trigger a full page reload in connected clients when the runtime restarts
    /// after its functions changed (default: true)
    #[serde(
        default = "default_reload_on_changes",
        alias = "reloadOnPagesFunctionsChanges"
    )]
    pub reload_on_functions_changes: bool,

    /// Relay the runtime's stdout/stderr to the host's streams (default: false)
    #[serde(default, alias = "displayWranglerLogs")]
    pub display_runtime_logs: bool,

    /// How to start the functions runtime
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Connection pool settings for forwarding requests
    #[serde(default)]
    pub proxy: ProxyConfig,
}

/// One route pattern or an ordered list of them
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum MatchRoutes {
    One(String),
    Many(Vec<String>),
}

impl MatchRoutes {
    /// The configured patterns, a single pattern behaving as a one-element list
    pub fn patterns(&self) -> &[String] {
        match self {
            MatchRoutes::One(pattern) => std::slice::from_ref(pattern),
            MatchRoutes::Many(patterns) => patterns,
        }
    }
}

impl From<&str> for MatchRoutes {
    fn from(pattern: &str) -> Self {
        MatchRoutes::One(pattern.to_string())
    }
}

impl From<String> for MatchRoutes {
    fn from(pattern: String) -> Self {
        MatchRoutes::One(pattern)
    }
}

impl From<Vec<String>> for MatchRoutes {
    fn from(patterns: Vec<String>) -> Self {
        MatchRoutes::Many(patterns)
    }
}

impl From<&[&str]> for MatchRoutes {
    fn from(patterns: &[&str]) -> Self {
        MatchRoutes::Many(patterns.iter().map(|p| p.to_string()).collect())
    }
}

/// Command line and startup settings for the functions runtime
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Program to run, split like a shell would (default: the local wrangler install
    /// run through node)
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments appended after the command
    /// (default: serve the current directory on an OS-assigned port)
    #[serde(default = "default_args")]
    pub args: Vec<String>,

    /// Working directory for the runtime (default: the host's working directory)
    pub working_dir: Option<String>,

    /// Extra environment variables for the runtime
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// How long to wait for the readiness message, in milliseconds
    #[serde(default = "default_start_timeout")]
    pub start_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: None,
            env: HashMap::new(),
            start_timeout_ms: default_start_timeout(),
        }
    }
}

impl RuntimeConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    /// Split `command` into the program and its leading arguments, then append `args`
    pub fn program_and_args(&self) -> Result<(String, Vec<String>), String> {
        let mut words = shell_words::split(&self.command)
            .map_err(|e| format!("'command' could not be parsed: {}", e))?;
        if words.is_empty() {
            return Err("'command' must not be empty".to_string());
        }
        let program = words.remove(0);
        words.extend(self.args.iter().cloned());
        Ok((program, words))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Maximum idle connections kept open to the runtime (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ProxyConfig {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_idle_per_host: self.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(self.pool_idle_timeout_secs),
        }
    }
}

fn default_reload_on_changes() -> bool {
    true
}

fn default_command() -> String {
    "node node_modules/wrangler/bin/wrangler.js".to_string()
}

fn default_args() -> Vec<String> {
    ["pages", "dev", ".", "--port=0"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_start_timeout() -> u64 {
    3000
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl PluginOptions {
    /// Options with the given routes and everything else at its default
    pub fn new(match_routes: impl Into<MatchRoutes>) -> Self {
        Self {
            match_routes: match_routes.into(),
            reload_on_functions_changes: default_reload_on_changes(),
            display_runtime_logs: false,
            runtime: RuntimeConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }

    pub fn with_runtime(mut self, runtime: RuntimeConfig) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn with_reload_on_functions_changes(mut self, enabled: bool) -> Self {
        self.reload_on_functions_changes = enabled;
        self
    }

    pub fn with_runtime_logs(mut self, enabled: bool) -> Self {
        self.display_runtime_logs = enabled;
        self
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let options: PluginOptions = toml::from_str(&content)?;
        options.validate()?;
        Ok(options)
    }

    /// Validate all options, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        let patterns = self.match_routes.patterns();
        if patterns.is_empty() {
            errors.push("'match_routes' must contain at least one pattern".to_string());
        }
        for pattern in patterns {
            if let Err(e) = RouteMatcher::new([pattern.as_str()]) {
                errors.push(format!("Route pattern '{}' is invalid: {}", pattern, e));
            }
        }

        if let Err(e) = self.runtime.program_and_args() {
            errors.push(format!("Runtime: {}", e));
        }

        if self.runtime.start_timeout_ms == 0 {
            errors.push("Runtime: 'start_timeout_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
