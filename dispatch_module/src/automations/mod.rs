//! Built-in automations.

mod easy_issue;
mod label_notifier;

pub use easy_issue::{EasyIssueAssigner, EasyIssueSettings};
pub use label_notifier::LabelNotifier;

use platform_api_module::{GithubApi, IssueRef};
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::automation::{AutomationError, AutomationResult};
use crate::context::EventContext;

/// Picks one of several phrasings at random.
fn choose(options: &[String]) -> Option<&str> {
    options
        .choose(&mut rand::thread_rng())
        .map(String::as_str)
}

/// Fills `{name}` placeholders.
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    vars.iter().fold(template.to_string(), |text, (name, value)| {
        text.replace(&format!("{{{}}}", name), value)
    })
}

/// Posts one randomly chosen template, if any are configured.
fn post_choice(
    github: &GithubApi<'_>,
    issue: &IssueRef<'_>,
    options: &[String],
    vars: &[(&str, &str)],
) -> AutomationResult {
    if let Some(template) = choose(options) {
        github.post_comment(issue, &render(template, vars))?;
    }
    Ok(())
}

fn issue_ref(cx: &EventContext) -> Result<IssueRef<'_>, AutomationError> {
    cx.issue_ref()
        .ok_or_else(|| AutomationError::State("event has no issue or pull request".into()))
}

fn parse_settings<T: DeserializeOwned + Default>(settings: &Value) -> Result<T, AutomationError> {
    if settings.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(settings.clone())
        .map_err(|err| AutomationError::Settings(err.to_string()))
}
