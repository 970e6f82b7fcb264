//! Prompt rendering for the decision agent.
//!
//! Templates are minijinja. Defaults are embedded; an [`AgentConfig`] may
//! carry inline overrides. The agent only supplies variables — template
//! content is opaque to the rest of the system.

use anyhow::{Context, Result};
use minijinja::{Environment, context};

use crate::config::AgentConfig;

const SYSTEM_TEMPLATE: &str = include_str!("../prompts/system.md");
const ACTION_TEMPLATE: &str = include_str!("../prompts/action.md");

/// Variables available to the action template.
#[derive(Debug, Clone)]
pub struct PromptVars<'a> {
    /// Narrative text of the current location.
    pub observation: &'a str,
    /// Choice labels in presentation order; rendered 1-based.
    pub choices: &'a [String],
    pub params_state: &'a [String],
    /// Rendered memory block, if the agent carries memory.
    pub memory: Option<String>,
    /// Loop-escape hint, present only when loop detection fires.
    pub loop_hint: Option<String>,
    /// Whether the calculator invitation is included.
    pub calculator: bool,
}

/// Template engine holding the agent's system and action templates.
pub struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let mut env = Environment::new();
        let system = config
            .system_template
            .clone()
            .unwrap_or_else(|| SYSTEM_TEMPLATE.to_string());
        let action = config
            .action_template
            .clone()
            .unwrap_or_else(|| ACTION_TEMPLATE.to_string());
        env.add_template_owned("system".to_string(), system)
            .context("parse system template")?;
        env.add_template_owned("action".to_string(), action)
            .context("parse action template")?;
        Ok(Self { env })
    }

    pub fn render_system(&self) -> Result<String> {
        let template = self.env.get_template("system")?;
        let rendered = template.render(context! {}).context("render system")?;
        Ok(rendered)
    }

    pub fn render_action(&self, vars: &PromptVars<'_>) -> Result<String> {
        let template = self.env.get_template("action")?;
        let rendered = template
            .render(context! {
                observation => vars.observation,
                choices => vars.choices,
                params_state => vars.params_state,
                memory => vars.memory.as_deref(),
                loop_hint => vars.loop_hint.as_deref(),
                calculator => vars.calculator,
            })
            .context("render action")?;
        Ok(rendered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn vars<'a>(choices: &'a [String]) -> PromptVars<'a> {
        PromptVars {
            observation: "You stand at a crossroads.",
            choices,
            params_state: &[],
            memory: None,
            loop_hint: None,
            calculator: false,
        }
    }

    #[test]
    fn default_action_template_numbers_choices() {
        let config = AgentConfig::resolve("default").expect("config");
        let engine = PromptEngine::new(&config).expect("engine");
        let choices = vec!["go left".to_string(), "go right".to_string()];

        let prompt = engine.render_action(&vars(&choices)).expect("render");
        assert!(prompt.contains("1. go left"));
        assert!(prompt.contains("2. go right"));
        assert!(prompt.contains("crossroads"));
        assert!(!prompt.contains("Calculate:"));
    }

    #[test]
    fn loop_hint_and_memory_are_rendered_when_present() {
        let config = AgentConfig::resolve("default").expect("config");
        let engine = PromptEngine::new(&config).expect("engine");
        let choices = vec!["wait".to_string()];
        let mut vars = vars(&choices);
        vars.memory = Some("step 1: chose 1".to_string());
        vars.loop_hint = Some("You have repeated this state.".to_string());

        let prompt = engine.render_action(&vars).expect("render");
        assert!(prompt.contains("Recent history:"));
        assert!(prompt.contains("repeated this state"));
    }

    #[test]
    fn custom_action_template_replaces_default() {
        let mut config = AgentConfig::resolve("default").expect("config");
        config.action_template = Some("OBS={{ observation }} N={{ choices | length }}".to_string());
        let engine = PromptEngine::new(&config).expect("engine");
        let choices = vec!["a".to_string(), "b".to_string()];

        let prompt = engine.render_action(&vars(&choices)).expect("render");
        assert_eq!(prompt, "OBS=You stand at a crossroads. N=2");
    }
}
