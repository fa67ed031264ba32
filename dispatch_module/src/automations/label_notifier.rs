use std::collections::BTreeMap;

use platform_api_module::{GithubApi, PacedRequester};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{issue_ref, parse_settings};
use crate::automation::{Automation, AutomationError, AutomationResult};
use crate::context::EventContext;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LabelNotifierSettings {
    /// login -> labels they watch. An empty list watches every label.
    pub watchers: BTreeMap<String, Vec<String>>,
}

/// Pings watchers when one of their labels lands on an issue. Stateless.
pub struct LabelNotifier {
    watchers: Vec<(String, Vec<String>)>,
}

impl LabelNotifier {
    pub const NAME: &'static str = "label_notifier";

    pub fn new(settings: LabelNotifierSettings) -> Self {
        let watchers = settings
            .watchers
            .into_iter()
            .map(|(login, labels)| {
                (
                    login.to_lowercase(),
                    labels.iter().map(|label| label.to_lowercase()).collect(),
                )
            })
            .collect();
        Self { watchers }
    }

    pub fn from_settings(settings: &Value) -> Result<Box<dyn Automation>, AutomationError> {
        Ok(Box::new(Self::new(parse_settings(settings)?)))
    }

    fn watchers_to_notify(&self, cx: &EventContext, new_label: &str) -> Vec<&str> {
        let existing: Vec<&str> = cx
            .labels
            .iter()
            .map(String::as_str)
            .filter(|label| *label != new_label)
            .collect();

        self.watchers
            .iter()
            .filter(|(login, _)| {
                cx.sender.as_deref() != Some(login.as_str())
                    && cx.creator.as_deref() != Some(login.as_str())
            })
            // already notified through an earlier label
            .filter(|(_, labels)| !labels.iter().any(|label| existing.contains(&label.as_str())))
            .filter(|(_, labels)| {
                (labels.is_empty() && !cx.labels.is_empty())
                    || labels.iter().any(|label| label == new_label)
            })
            .map(|(login, _)| login.as_str())
            .collect()
    }
}

impl Automation for LabelNotifier {
    fn on_label_add(
        &self,
        cx: &EventContext,
        _state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        if cx.is_pull {
            return Ok(());
        }
        let Some(new_label) = cx.current_label.as_deref() else {
            return Ok(());
        };

        let watchers = self.watchers_to_notify(cx, new_label);
        if watchers.is_empty() {
            return Ok(());
        }
        let mentions: Vec<String> = watchers.iter().map(|login| format!("@{}", login)).collect();
        let target = issue_ref(cx)?;
        debug!(
            "notifying {} watcher(s) of {} on #{}",
            watchers.len(),
            new_label,
            target.number
        );
        GithubApi::new(api).post_comment(&target, &format!("cc {}", mentions.join(" ")))?;
        Ok(())
    }
}
