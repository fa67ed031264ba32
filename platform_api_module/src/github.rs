//! Typed helpers over the issue and pull request endpoints automations use.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tracing::debug;

use crate::installation::{ApiError, PacedRequester};
use crate::response::ApiResponse;
use crate::transport::Method;

/// An issue or pull request within a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IssueRef<'a> {
    pub owner: &'a str,
    pub repo: &'a str,
    pub number: &'a str,
}

impl<'a> IssueRef<'a> {
    pub fn new(owner: &'a str, repo: &'a str, number: &'a str) -> Self {
        Self {
            owner,
            repo,
            number,
        }
    }
}

pub struct GithubApi<'a> {
    requester: &'a dyn PacedRequester,
}

impl<'a> GithubApi<'a> {
    pub fn new(requester: &'a dyn PacedRequester) -> Self {
        Self { requester }
    }

    fn repo_url(&self, owner: &str, repo: &str) -> String {
        format!("{}/repos/{}/{}", self.requester.api_base_url(), owner, repo)
    }

    fn issue_url(&self, issue: &IssueRef<'_>) -> String {
        format!(
            "{}/issues/{}",
            self.repo_url(issue.owner, issue.repo),
            issue.number
        )
    }

    pub fn post_comment(&self, issue: &IssueRef<'_>, body: &str) -> Result<Value, ApiError> {
        debug!(
            "commenting on {}/{}#{}",
            issue.owner, issue.repo, issue.number
        );
        let url = format!("{}/comments", self.issue_url(issue));
        let response =
            self.requester
                .paced_request(Method::Post, &url, Some(&json!({ "body": body })))?;
        Ok(json_or_null(response))
    }

    pub fn edit_comment(
        &self,
        owner: &str,
        repo: &str,
        comment_id: u64,
        body: &str,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/issues/comments/{}",
            self.repo_url(owner, repo),
            comment_id
        );
        self.requester
            .paced_request(Method::Patch, &url, Some(&json!({ "body": body })))?;
        Ok(())
    }

    /// Label names, lowercased.
    pub fn get_labels(&self, issue: &IssueRef<'_>) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/labels", self.issue_url(issue));
        let response = self.requester.paced_request(Method::Get, &url, None)?;
        let labels = response
            .json()
            .and_then(Value::as_array)
            .ok_or_else(|| ApiError::InvalidResponse("labels response is not a list".into()))?
            .iter()
            .filter_map(|label| label.get("name").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect();
        Ok(labels)
    }

    pub fn replace_labels(&self, issue: &IssueRef<'_>, labels: &[String]) -> Result<(), ApiError> {
        let url = format!("{}/labels", self.issue_url(issue));
        self.requester
            .paced_request(Method::Put, &url, Some(&json!({ "labels": labels })))?;
        Ok(())
    }

    /// Adds and removes labels case-insensitively, issuing a write only when
    /// the resulting set differs from the current one.
    pub fn update_labels(
        &self,
        issue: &IssueRef<'_>,
        add: &[&str],
        remove: &[&str],
    ) -> Result<Vec<String>, ApiError> {
        let current: BTreeSet<String> = self.get_labels(issue)?.into_iter().collect();
        let mut updated = current.clone();
        for label in remove {
            updated.remove(&label.to_lowercase());
        }
        for label in add {
            updated.insert(label.to_lowercase());
        }
        let updated: Vec<String> = updated.into_iter().collect();
        if updated.len() != current.len() || !updated.iter().all(|l| current.contains(l)) {
            self.replace_labels(issue, &updated)?;
        }
        Ok(updated)
    }

    pub fn set_assignees(
        &self,
        issue: &IssueRef<'_>,
        assignees: &[&str],
    ) -> Result<(), ApiError> {
        let url = self.issue_url(issue);
        self.requester.paced_request(
            Method::Patch,
            &url,
            Some(&json!({ "assignees": assignees })),
        )?;
        Ok(())
    }

    pub fn close_issue(&self, issue: &IssueRef<'_>) -> Result<(), ApiError> {
        let url = self.issue_url(issue);
        self.requester
            .paced_request(Method::Patch, &url, Some(&json!({ "state": "closed" })))?;
        Ok(())
    }

    pub fn get_pull(&self, issue: &IssueRef<'_>) -> Result<Value, ApiError> {
        let url = format!(
            "{}/pulls/{}",
            self.repo_url(issue.owner, issue.repo),
            issue.number
        );
        let response = self.requester.paced_request(Method::Get, &url, None)?;
        response
            .into_json()
            .ok_or_else(|| ApiError::InvalidResponse("pull response is not JSON".into()))
    }

    /// Unified diff of a pull request, fetched from the pull's `diff_url`.
    pub fn get_diff(&self, issue: &IssueRef<'_>) -> Result<String, ApiError> {
        let pull = self.get_pull(issue)?;
        let diff_url = pull
            .get("diff_url")
            .and_then(Value::as_str)
            .ok_or_else(|| ApiError::InvalidResponse("pull has no diff_url".into()))?;
        let response = self.requester.paced_request(Method::Get, diff_url, None)?;
        Ok(match response.body {
            crate::response::ResponseBody::Text(text) => text,
            crate::response::ResponseBody::Json(value) => value.to_string(),
        })
    }

    /// SHA of the commit at the tip of `branch`.
    pub fn get_branch_head(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
    ) -> Result<String, ApiError> {
        let url = format!("{}/branches/{}", self.repo_url(owner, repo), branch);
        let response = self.requester.paced_request(Method::Get, &url, None)?;
        response
            .json()
            .and_then(|branch| branch.pointer("/commit/sha"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ApiError::InvalidResponse("branch has no head commit".into()))
    }
}

fn json_or_null(response: ApiResponse) -> Value {
    response.into_json().unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ResponseBody;
    use std::sync::Mutex;

    struct ScriptedRequester {
        calls: Mutex<Vec<(Method, String, Option<Value>)>>,
        responses: Mutex<Vec<ResponseBody>>,
    }

    impl ScriptedRequester {
        fn new(responses: Vec<ResponseBody>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }

        fn calls(&self) -> Vec<(Method, String, Option<Value>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl PacedRequester for ScriptedRequester {
        fn api_base_url(&self) -> &str {
            "https://api.test"
        }

        fn paced_request(
            &self,
            method: Method,
            url: &str,
            body: Option<&Value>,
        ) -> Result<ApiResponse, ApiError> {
            self.calls
                .lock()
                .unwrap()
                .push((method, url.to_string(), body.cloned()));
            let mut responses = self.responses.lock().unwrap();
            let body = if responses.is_empty() {
                ResponseBody::Json(json!({}))
            } else {
                responses.remove(0)
            };
            Ok(ApiResponse {
                status: 200,
                headers: Vec::new(),
                body,
            })
        }
    }

    const ISSUE: IssueRef<'static> = IssueRef {
        owner: "servo",
        repo: "servo",
        number: "7",
    };

    #[test]
    fn post_comment_targets_issue_comments() {
        let requester = ScriptedRequester::new(vec![]);
        GithubApi::new(&requester)
            .post_comment(&ISSUE, "hello")
            .unwrap();

        let calls = requester.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, Method::Post);
        assert_eq!(
            calls[0].1,
            "https://api.test/repos/servo/servo/issues/7/comments"
        );
        assert_eq!(calls[0].2, Some(json!({"body": "hello"})));
    }

    #[test]
    fn update_labels_is_case_insensitive() {
        let requester = ScriptedRequester::new(vec![ResponseBody::Json(json!([
            {"name": "S-awaiting-review"},
            {"name": "E-Easy"}
        ]))]);
        let labels = GithubApi::new(&requester)
            .update_labels(&ISSUE, &["S-Needs-Rebase"], &["s-AWAITING-review"])
            .unwrap();

        assert_eq!(labels, vec!["e-easy", "s-needs-rebase"]);
        let calls = requester.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, Method::Put);
        assert_eq!(
            calls[1].2,
            Some(json!({"labels": ["e-easy", "s-needs-rebase"]}))
        );
    }

    #[test]
    fn update_labels_skips_write_when_unchanged() {
        let requester =
            ScriptedRequester::new(vec![ResponseBody::Json(json!([{"name": "E-Easy"}]))]);
        GithubApi::new(&requester)
            .update_labels(&ISSUE, &["e-easy"], &["missing"])
            .unwrap();
        assert_eq!(requester.calls().len(), 1);
    }

    #[test]
    fn get_diff_follows_diff_url() {
        let requester = ScriptedRequester::new(vec![
            ResponseBody::Json(json!({"diff_url": "https://web.test/servo/servo/pull/7.diff"})),
            ResponseBody::Text("diff --git a/x b/x\n".to_string()),
        ]);
        let diff = GithubApi::new(&requester).get_diff(&ISSUE).unwrap();

        assert_eq!(diff, "diff --git a/x b/x\n");
        assert_eq!(
            requester.calls()[1].1,
            "https://web.test/servo/servo/pull/7.diff"
        );
    }

    #[test]
    fn get_branch_head_reads_commit_sha() {
        let requester = ScriptedRequester::new(vec![ResponseBody::Json(
            json!({"name": "main", "commit": {"sha": "abc123"}}),
        )]);
        let sha = GithubApi::new(&requester)
            .get_branch_head("servo", "servo", "main")
            .unwrap();
        assert_eq!(sha, "abc123");
        assert_eq!(
            requester.calls()[0].1,
            "https://api.test/repos/servo/servo/branches/main"
        );
    }
}
