//! Runner and agent configuration.
//!
//! `RunnerConfig` carries process-wide tunables (engine command, timeouts,
//! output limits). `AgentConfig` describes one decision agent and is the unit
//! the benchmark matrix multiplies over. Both are TOML on disk; benchmark
//! configs embed `AgentConfig` values verbatim in YAML.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Process-wide runner tunables, read from `runner.toml` when one exists.
///
/// Every field has a workable default; a config file is only needed to point
/// at a different interpreter build, switch quest language, or tighten the
/// time limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RunnerConfig {
    /// Command that starts the quest interpreter. The quest file path and
    /// language are appended as the final two arguments.
    pub engine_command: Vec<String>,

    /// Quest language passed to the interpreter (`rus` or `eng`).
    pub language: String,

    /// Wall-clock limit on a whole run; once it passes, TIMEOUT is committed
    /// and the interpreter is torn down.
    pub run_timeout_secs: u64,

    /// Upper bound for a single agent decision (LLM call included).
    pub step_timeout_secs: u64,

    /// Maximum number of quest steps before the run is abandoned.
    pub max_steps: u32,

    /// How long one bridge exchange may take between sending a command and
    /// receiving a schema-matching state line.
    pub read_budget_secs: u64,

    /// Cap on interpreter stderr kept in memory for error reports.
    pub stderr_limit_bytes: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            engine_command: vec!["node".to_string(), "consoleplayer.js".to_string()],
            language: "rus".to_string(),
            run_timeout_secs: 120,
            step_timeout_secs: 60,
            max_steps: 100,
            read_budget_secs: 10,
            stderr_limit_bytes: 100_000,
        }
    }
}

impl RunnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.engine_command.is_empty() || self.engine_command[0].trim().is_empty() {
            return Err(anyhow!("engine_command must be a non-empty array"));
        }
        if self.language != "rus" && self.language != "eng" {
            return Err(anyhow!("language must be 'rus' or 'eng'"));
        }
        if self.run_timeout_secs == 0 {
            return Err(anyhow!("run_timeout_secs must be > 0"));
        }
        if self.step_timeout_secs == 0 {
            return Err(anyhow!("step_timeout_secs must be > 0"));
        }
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.read_budget_secs == 0 {
            return Err(anyhow!("read_budget_secs must be > 0"));
        }
        Ok(())
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }

    pub fn read_budget(&self) -> Duration {
        Duration::from_secs(self.read_budget_secs)
    }
}

/// Memory strategy for a decision agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    None,
    MessageHistory,
    Summary,
}

/// Memory configuration block of an [`AgentConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    /// Maximum number of recent step tuples kept verbatim.
    #[serde(default = "default_max_history")]
    pub max_history: usize,
}

fn default_max_history() -> usize {
    10
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            kind: MemoryKind::None,
            max_history: default_max_history(),
        }
    }
}

/// Tools an agent may be granted. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Calculator,
}

/// One decision agent: model, templates, sampling, memory, and tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Unique identifier; used in artifact paths and persistence.
    pub agent_id: String,
    /// Model identifier, `provider:model` or a published alias.
    pub model: String,
    /// Inline system prompt template (minijinja). `None` uses the default.
    #[serde(default)]
    pub system_template: Option<String>,
    /// Inline action prompt template (minijinja). `None` uses the default.
    #[serde(default)]
    pub action_template: Option<String>,
    /// Sampling temperature. `None` uses the provider default.
    #[serde(default)]
    pub temperature: Option<f32>,
    #[serde(default)]
    pub memory: Option<MemoryConfig>,
    #[serde(default)]
    pub tools: Vec<Tool>,
    /// Auto-select when only one choice exists, without calling the model.
    #[serde(default)]
    pub skip_single: bool,
}

impl AgentConfig {
    /// Load and validate an agent config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            fs::read_to_string(path).with_context(|| format!("read agent {}", path.display()))?;
        let config: AgentConfig =
            toml::from_str(&contents).with_context(|| format!("parse agent {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("validate agent {}", path.display()))?;
        Ok(config)
    }

    /// Resolve a CLI `--agent` argument: a TOML path or a built-in id.
    ///
    /// Built-ins: `random` (unseeded baseline), `random_<seed>` (seeded),
    /// `default` (the default LLM agent).
    pub fn resolve(arg: &str) -> Result<Self> {
        let path = Path::new(arg);
        if path.extension().and_then(|ext| ext.to_str()) == Some("toml") {
            return Self::load(path);
        }
        if let Some(config) = Self::builtin(arg) {
            return Ok(config);
        }
        Err(anyhow!(
            "unknown agent '{arg}' (expected a .toml path, 'random', 'random_<seed>', or 'default')"
        ))
    }

    fn builtin(id: &str) -> Option<Self> {
        if id == "random" || id.starts_with("random_") {
            return Some(Self {
                agent_id: id.to_string(),
                model: id.to_string(),
                system_template: None,
                action_template: None,
                temperature: None,
                memory: None,
                tools: Vec::new(),
                skip_single: true,
            });
        }
        if id == "default" {
            return Some(Self {
                agent_id: "default".to_string(),
                model: "gpt-4o".to_string(),
                system_template: None,
                action_template: None,
                temperature: Some(0.4),
                memory: Some(MemoryConfig {
                    kind: MemoryKind::MessageHistory,
                    max_history: default_max_history(),
                }),
                tools: Vec::new(),
                skip_single: false,
            });
        }
        None
    }

    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(anyhow!("agent_id must be non-empty"));
        }
        if self.agent_id.contains('/') || self.agent_id.contains('\\') {
            return Err(anyhow!("agent_id must not contain path separators"));
        }
        if self.model.trim().is_empty() {
            return Err(anyhow!("model must be non-empty"));
        }
        if let Some(temperature) = self.temperature
            && !(0.0..=2.0).contains(&temperature)
        {
            return Err(anyhow!("temperature must be within [0.0, 2.0]"));
        }
        if let Some(memory) = &self.memory
            && memory.max_history == 0
        {
            return Err(anyhow!("memory.max_history must be > 0"));
        }
        Ok(())
    }
}

/// Load runner config from a TOML file; missing file yields defaults.
pub fn load_runner_config(path: &Path) -> Result<RunnerConfig> {
    if !path.exists() {
        let config = RunnerConfig::default();
        config.validate()?;
        return Ok(config);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let config: RunnerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_runner_config_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let config = load_runner_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn agent_config_round_trips_through_toml() {
        let input = r#"
agent_id = "sonnet-history"
model = "anthropic:claude-3-5-sonnet-latest"
temperature = 0.4
skip_single = true
tools = ["calculator"]

[memory]
type = "message_history"
max_history = 5
"#;
        let config: AgentConfig = toml::from_str(input).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.agent_id, "sonnet-history");
        assert_eq!(config.tools, vec![Tool::Calculator]);
        let memory = config.memory.as_ref().expect("memory");
        assert_eq!(memory.kind, MemoryKind::MessageHistory);
        assert_eq!(memory.max_history, 5);
    }

    #[test]
    fn resolve_builtin_random_keeps_seed_suffix() {
        let config = AgentConfig::resolve("random_42").expect("resolve");
        assert_eq!(config.agent_id, "random_42");
        assert_eq!(config.model, "random_42");
        assert!(config.skip_single);
    }

    #[test]
    fn resolve_rejects_unknown_id() {
        let err = AgentConfig::resolve("nope").expect_err("unknown");
        assert!(err.to_string().contains("unknown agent"));
    }

    #[test]
    fn validate_rejects_out_of_range_temperature() {
        let mut config = AgentConfig::resolve("default").expect("resolve");
        config.temperature = Some(3.0);
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("temperature"));
    }

    #[test]
    fn validate_rejects_agent_id_with_separator() {
        let mut config = AgentConfig::resolve("default").expect("resolve");
        config.agent_id = "bad/id".to_string();
        let err = config.validate().expect_err("invalid");
        assert!(err.to_string().contains("path separators"));
    }
}
