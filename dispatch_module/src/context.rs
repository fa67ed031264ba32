use std::sync::Arc;

use platform_api_module::IssueRef;

use crate::automation::TICK_ACTION;
use crate::payload::WebhookPayload;

/// Read-only projection of one payload, built once per event.
///
/// Logins and labels are lowercased. Issue and pull request numbers are kept
/// as strings since they double as keys in automation state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventContext {
    pub bot_name: String,
    pub action: Option<String>,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub sender: Option<String>,
    pub number: Option<String>,
    pub current_label: Option<String>,
    pub comment: Option<String>,
    pub creator: Option<String>,
    pub assignee: Option<String>,
    pub labels: Vec<String>,
    pub last_updated: Option<String>,
    pub is_pull: bool,
    pub is_open: bool,
    pub(crate) payload: Arc<WebhookPayload>,
}

impl EventContext {
    pub fn from_payload(bot_name: &str, payload: WebhookPayload) -> Self {
        let mut cx = EventContext {
            bot_name: bot_name.to_lowercase(),
            action: payload.action.clone(),
            ..EventContext::default()
        };

        if let Some(repository) = &payload.repository {
            cx.owner = Some(repository.owner.login.clone());
            cx.repo = Some(repository.name.clone());
        }
        cx.sender = payload.sender.as_ref().map(|user| user.login.to_lowercase());
        cx.current_label = payload.label.as_ref().map(|label| label.name.to_lowercase());

        if let Some(pull) = &payload.pull_request {
            cx.is_pull = true;
            cx.number = Some(pull.number.to_string());
            cx.creator = Some(pull.user.login.to_lowercase());
            cx.assignee = pull.assignee.as_ref().map(|user| user.login.to_lowercase());
            cx.is_open = pull.state.eq_ignore_ascii_case("open");
            cx.last_updated = pull.updated_at.clone();
            cx.labels = lowercase_labels(pull.labels.iter().map(|label| label.name.as_str()));
        } else if let Some(issue) = &payload.issue {
            cx.number = Some(issue.number.to_string());
            cx.creator = Some(issue.user.login.to_lowercase());
            cx.assignee = issue.assignee.as_ref().map(|user| user.login.to_lowercase());
            cx.is_open = issue.state.eq_ignore_ascii_case("open");
            cx.last_updated = issue.updated_at.clone();
            cx.labels = lowercase_labels(issue.labels.iter().map(|label| label.name.as_str()));
        }

        if let Some(comment) = &payload.comment {
            cx.comment = Some(comment.body.clone());
            // comments on pull requests still arrive as issue comments
            cx.is_pull = payload
                .issue
                .as_ref()
                .map(|issue| issue.pull_request.is_some())
                .unwrap_or(cx.is_pull);
        }

        cx.payload = Arc::new(payload);
        cx
    }

    pub fn tick(bot_name: &str) -> Self {
        Self::from_payload(bot_name, WebhookPayload::tick())
    }

    pub fn payload(&self) -> &WebhookPayload {
        &self.payload
    }

    pub fn is_tick(&self) -> bool {
        self.action.as_deref() == Some(TICK_ACTION)
    }

    /// `owner/repo`, when both are known.
    pub fn full_repo_name(&self) -> Option<String> {
        match (&self.owner, &self.repo) {
            (Some(owner), Some(repo)) => Some(format!("{}/{}", owner, repo)),
            _ => None,
        }
    }

    pub fn issue_ref(&self) -> Option<IssueRef<'_>> {
        Some(IssueRef::new(
            self.owner.as_deref()?,
            self.repo.as_deref()?,
            self.number.as_deref()?,
        ))
    }

    pub fn with_repo(&self, owner: &str, repo: &str) -> Self {
        Self {
            owner: Some(owner.to_string()),
            repo: Some(repo.to_string()),
            ..self.clone()
        }
    }

    pub fn with_number(&self, number: &str) -> Self {
        Self {
            number: Some(number.to_string()),
            ..self.clone()
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        let label = label.to_lowercase();
        self.labels.iter().any(|existing| *existing == label)
    }

    pub fn comment_updated_at(&self) -> Option<&str> {
        self.payload
            .comment
            .as_ref()
            .and_then(|comment| comment.updated_at.as_deref())
    }

    pub fn issue_updated_at(&self) -> Option<&str> {
        self.payload
            .issue
            .as_ref()
            .and_then(|issue| issue.updated_at.as_deref())
    }

    pub fn pull_updated_at(&self) -> Option<&str> {
        self.payload
            .pull_request
            .as_ref()
            .and_then(|pull| pull.updated_at.as_deref())
    }

    pub fn pull_body(&self) -> Option<&str> {
        self.payload
            .pull_request
            .as_ref()
            .and_then(|pull| pull.body.as_deref())
    }
}

fn lowercase_labels<'a>(labels: impl Iterator<Item = &'a str>) -> Vec<String> {
    labels.map(str::to_lowercase).collect()
}
