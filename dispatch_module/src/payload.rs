//! Typed view of the webhook bodies the steward reacts to. Only the fields
//! automations read are modelled; everything else is ignored by serde.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::automation::TICK_ACTION;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub installation: Option<InstallationRef>,
    pub repository: Option<Repository>,
    pub sender: Option<User>,
    pub issue: Option<Issue>,
    pub pull_request: Option<PullRequest>,
    pub comment: Option<Comment>,
    pub label: Option<Label>,
    pub assignee: Option<User>,
}

impl WebhookPayload {
    /// Synthetic payload carrying only the reserved tick action.
    pub fn tick() -> Self {
        Self {
            action: Some(TICK_ACTION.to_string()),
            ..Self::default()
        }
    }

    pub fn installation_id(&self) -> Option<u64> {
        self.installation.as_ref().map(|installation| installation.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallationRef {
    pub id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub owner: User,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub number: u64,
    pub user: User,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub updated_at: Option<String>,
    pub assignee: Option<User>,
    pub body: Option<String>,
    /// Present (as an object of links) when the issue is really a pull request.
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub user: User,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    pub updated_at: Option<String>,
    pub assignee: Option<User>,
    pub body: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Option<u64>,
    pub body: String,
    pub user: Option<User>,
    pub updated_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_issue_comment_payload() {
        let payload: WebhookPayload = serde_json::from_value(json!({
            "action": "created",
            "installation": {"id": 5127},
            "repository": {"name": "servo", "owner": {"login": "servo"}, "private": false},
            "sender": {"login": "Alice"},
            "issue": {
                "number": 42,
                "user": {"login": "bob"},
                "state": "open",
                "labels": [{"name": "E-easy", "color": "02e10c"}],
                "updated_at": "2024-02-01T10:00:00Z",
                "pull_request": {"url": "https://api.github.com/repos/servo/servo/pulls/42"}
            },
            "comment": {"id": 9, "body": "hi", "updated_at": "2024-02-01T10:00:00Z"}
        }))
        .unwrap();

        assert_eq!(payload.installation_id(), Some(5127));
        let issue = payload.issue.unwrap();
        assert_eq!(issue.number, 42);
        assert_eq!(issue.labels[0].name, "E-easy");
        assert!(issue.pull_request.is_some());
        assert_eq!(payload.comment.unwrap().body, "hi");
    }

    #[test]
    fn tick_payload_has_only_the_action() {
        let tick = WebhookPayload::tick();
        assert_eq!(tick.action.as_deref(), Some(TICK_ACTION));
        assert!(tick.installation.is_none());
        assert!(tick.repository.is_none());
    }
}
