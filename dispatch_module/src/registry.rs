use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;
use tracing::info;

use crate::automation::{Automation, AutomationError};
use crate::automations::{EasyIssueAssigner, LabelNotifier};
use crate::config::{AutomationConfig, ConfigError};

pub type AutomationConstructor = fn(&Value) -> Result<Box<dyn Automation>, AutomationError>;

/// Built-in automations addressable from `[automations.<name>]`.
const BUILTIN_AUTOMATIONS: &[(&str, AutomationConstructor)] = &[
    (EasyIssueAssigner::NAME, EasyIssueAssigner::from_settings),
    (LabelNotifier::NAME, LabelNotifier::from_settings),
];

pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    BUILTIN_AUTOMATIONS.iter().map(|(name, _)| *name)
}

pub struct RegisteredAutomation {
    name: String,
    active: bool,
    allowed_repos: Vec<Regex>,
    automation: Box<dyn Automation>,
}

impl RegisteredAutomation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn automation(&self) -> &dyn Automation {
        self.automation.as_ref()
    }

    /// An empty allow-list admits every repository. Otherwise any pattern
    /// found in `owner/repo` admits it; an unknown repository is rejected.
    pub fn allows_repo(&self, full_repo_name: Option<&str>) -> bool {
        if self.allowed_repos.is_empty() {
            return true;
        }
        match full_repo_name {
            Some(name) => self.allowed_repos.iter().any(|pattern| pattern.is_match(name)),
            None => false,
        }
    }
}

impl std::fmt::Debug for RegisteredAutomation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAutomation")
            .field("name", &self.name)
            .field("active", &self.active)
            .field(
                "allowed_repos",
                &self
                    .allowed_repos
                    .iter()
                    .map(Regex::as_str)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Fixed set of automations, in registration order.
#[derive(Debug, Default)]
pub struct Registry {
    entries: Vec<RegisteredAutomation>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(
        automations: &BTreeMap<String, AutomationConfig>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Registry::new();
        for (name, config) in automations {
            let constructor = BUILTIN_AUTOMATIONS
                .iter()
                .find(|(builtin, _)| *builtin == name.as_str())
                .map(|(_, constructor)| *constructor)
                .ok_or_else(|| {
                    ConfigError::invalid(
                        format!("automations.{}", name),
                        format!(
                            "unknown automation (expected one of: {})",
                            builtin_names().collect::<Vec<_>>().join(", ")
                        ),
                    )
                })?;
            let automation = constructor(&config.settings).map_err(|err| {
                ConfigError::invalid(format!("automations.{}.settings", name), err)
            })?;
            registry.register(name, automation, config)?;
        }
        info!(
            "registered {} automation(s): {}",
            registry.len(),
            registry
                .iter()
                .map(RegisteredAutomation::name)
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(registry)
    }

    pub fn register(
        &mut self,
        name: &str,
        automation: Box<dyn Automation>,
        config: &AutomationConfig,
    ) -> Result<(), ConfigError> {
        let allowed_repos = config
            .allowed_repos
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|err| {
                    ConfigError::invalid(format!("automations.{}.allowed_repos", name), err)
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.entries.push(RegisteredAutomation {
            name: name.to_string(),
            active: config.active,
            allowed_repos,
            automation,
        });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredAutomation> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
