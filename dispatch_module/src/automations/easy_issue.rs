//! Tracks newcomer-friendly issues: hands them out on request, follows the
//! pull requests that address them, and frees them again once the assignee
//! has gone quiet for longer than the grace period.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime, Utc};
use platform_api_module::{Clock, GithubApi, IssueRef, PacedRequester, SystemClock};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::{issue_ref, parse_settings, post_choice};
use crate::automation::{Automation, AutomationError, AutomationResult};
use crate::context::EventContext;

/// Assignee recorded when a collaborator assigned the issue by label alone.
const ANONYMOUS_ASSIGNEE: &str = "__deadbeef__";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EasyIssueSettings {
    pub easy_label: String,
    pub assign_label: String,
    pub grace_period_days: i64,
    /// Logins allowed to assign issues to other people.
    pub reviewers: Vec<String>,
    pub issue_assign: Vec<String>,
    pub assign_success: Vec<String>,
    pub assign_fail: Vec<String>,
    pub known_ping: Vec<String>,
    pub unknown_ping: Vec<String>,
    pub issue_unassign: Vec<String>,
    pub dup_effort: Vec<String>,
    pub possible_dup: Vec<String>,
    pub previous_work: Vec<String>,
    pub non_reviewer_ack: Vec<String>,
}

impl Default for EasyIssueSettings {
    fn default() -> Self {
        let one = |text: &str| vec![text.to_string()];
        Self {
            easy_label: "e-easy".to_string(),
            assign_label: "c-assigned".to_string(),
            grace_period_days: 4,
            reviewers: Vec::new(),
            issue_assign: one(
                "Hi! If you have any questions regarding this issue, feel free to make a \
                 comment here. If you intend to work on this issue, then add \
                 `@{bot}: assign me` to your comment, and I'll assign this to you.",
            ),
            assign_success: one(
                "Hey @{assignee}! Thanks for your interest in working on this issue. \
                 It's now assigned to you!",
            ),
            assign_fail: one(
                "It looks like this has already been assigned to someone. \
                 I'll leave the decision to a core contributor.",
            ),
            known_ping: one("Hey @{assignee}! Did you look into this? You got any questions for us?"),
            unknown_ping: one("Hey there! Is anyone still working on this?"),
            issue_unassign: one("This is now open for anyone to jump in!"),
            dup_effort: one(
                "Hello there! Thanks for picking up this issue! In the future, please get the \
                 issue assigned to yourself before working on it, so that we can avoid \
                 duplicate efforts.",
            ),
            possible_dup: one(
                "**Note:** The assignee in #{issue} doesn't match with the author of this \
                 pull request.",
            ),
            previous_work: one("Previous work by @{author} in #{pull}."),
            non_reviewer_ack: one(
                "Only reviewers can assign issues to other people. A reviewer will take a look.",
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum IssueStatus {
    Assigned,
    Pull,
    Commented,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct TrackedIssue {
    assignee: Option<String>,
    status: Option<IssueStatus>,
    last_active: Option<String>,
    pr_number: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tracker {
    #[serde(default)]
    issues: BTreeMap<String, TrackedIssue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    repo: Option<String>,
}

impl Tracker {
    fn load(state: &Value, cx: &EventContext) -> Result<Self, AutomationError> {
        let mut tracker: Tracker = if state.is_null() {
            Tracker::default()
        } else {
            serde_json::from_value(state.clone())
                .map_err(|err| AutomationError::State(err.to_string()))?
        };
        if tracker.owner.is_none() {
            tracker.owner = cx.owner.clone();
        }
        if tracker.repo.is_none() {
            tracker.repo = cx.repo.clone();
        }
        Ok(tracker)
    }

    fn tracks(&self, number: Option<&str>) -> bool {
        number.is_some_and(|number| self.issues.contains_key(number))
    }

    fn entry(&mut self, number: &str) -> &mut TrackedIssue {
        self.issues.entry(number.to_string()).or_default()
    }
}

pub struct EasyIssueAssigner {
    settings: EasyIssueSettings,
    pull_fixes: Regex,
    clock: Arc<dyn Clock>,
}

impl EasyIssueAssigner {
    pub const NAME: &'static str = "easy_issue_assigner";

    pub fn new(settings: EasyIssueSettings) -> Result<Self, AutomationError> {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    /// Grace periods are measured against `clock`.
    pub fn with_clock(
        mut settings: EasyIssueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, AutomationError> {
        settings.easy_label = settings.easy_label.to_lowercase();
        settings.assign_label = settings.assign_label.to_lowercase();
        settings.reviewers = settings
            .reviewers
            .iter()
            .map(|login| login.to_lowercase())
            .collect();
        let pull_fixes = Regex::new(r"(?i)(?:fixe?|close|resolve)[sd]? #([0-9]+)")
            .map_err(|err| AutomationError::Settings(err.to_string()))?;
        Ok(Self {
            settings,
            pull_fixes,
            clock,
        })
    }

    pub fn from_settings(settings: &Value) -> Result<Box<dyn Automation>, AutomationError> {
        Ok(Box::new(Self::new(parse_settings(settings)?)?))
    }

    fn with_tracker<F>(&self, cx: &EventContext, state: &mut Value, apply: F) -> AutomationResult
    where
        F: FnOnce(&mut Tracker) -> AutomationResult,
    {
        let mut tracker = Tracker::load(state, cx)?;
        let result = apply(&mut tracker);
        *state = serde_json::to_value(&tracker)?;
        result
    }

    fn on_open_or_reopen(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        self.with_tracker(cx, state, |tracker| {
            if cx.is_pull {
                self.pull_opened(cx, tracker, api)
            } else {
                self.issue_opened(cx, tracker);
                Ok(())
            }
        })
    }

    fn issue_opened(&self, cx: &EventContext, tracker: &mut Tracker) {
        let Some(number) = cx.number.as_deref() else {
            return;
        };
        if !cx.has_label(&self.settings.easy_label) {
            return;
        }
        let issue = tracker.entry(number);
        *issue = TrackedIssue::default();
        if cx.has_label(&self.settings.assign_label) {
            info!("issue #{} was opened already assigned", number);
            issue.assignee = Some(ANONYMOUS_ASSIGNEE.to_string());
            issue.status = Some(IssueStatus::Assigned);
            issue.last_active = cx.issue_updated_at().map(str::to_string);
        } else {
            info!("issue #{} was opened as easy", number);
        }
    }

    fn pull_opened(
        &self,
        cx: &EventContext,
        tracker: &mut Tracker,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        let Some(issue_number) = cx
            .pull_body()
            .and_then(|body| self.pull_fixes.captures(body))
            .map(|captures| captures[1].to_string())
        else {
            return Ok(());
        };
        if !tracker.tracks(Some(&issue_number)) {
            return Ok(());
        }
        let pull = issue_ref(cx)?;
        let creator = cx.creator.clone().unwrap_or_default();
        info!("PR #{} addresses issue #{}", pull.number, issue_number);

        let issue = tracker.entry(&issue_number);
        let previous = match issue.assignee.take() {
            Some(assignee) if assignee == ANONYMOUS_ASSIGNEE => Some(creator.clone()),
            other => other,
        };
        issue.assignee = Some(creator.clone());
        issue.pr_number = Some(pull.number.to_string());
        issue.status = Some(IssueStatus::Pull);
        issue.last_active = cx.pull_updated_at().map(str::to_string);

        let github = GithubApi::new(api);
        match previous {
            None => {
                info!("issue #{} was never claimed, marking it assigned", issue_number);
                post_choice(&github, &pull, &self.settings.dup_effort, &[])?;
                let issue = IssueRef::new(pull.owner, pull.repo, &issue_number);
                github.update_labels(&issue, &[self.settings.assign_label.as_str()], &[])?;
            }
            Some(assignee) if assignee != creator => {
                info!(
                    "assignee collision on #{}: expected {} but PR author is {}",
                    issue_number, assignee, creator
                );
                post_choice(
                    &github,
                    &pull,
                    &self.settings.possible_dup,
                    &[("issue", issue_number.as_str())],
                )?;
            }
            Some(_) => {}
        }
        Ok(())
    }

    fn self_assign(
        &self,
        cx: &EventContext,
        tracker: &mut Tracker,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        let target = issue_ref(cx)?;
        let github = GithubApi::new(api);
        let in_store = tracker.tracks(Some(target.number));
        let last_active = cx.comment_updated_at().map(str::to_string);

        if cx.has_label(&self.settings.assign_label) {
            let issue = tracker.entry(target.number);
            if !in_store {
                *issue = TrackedIssue {
                    assignee: Some(ANONYMOUS_ASSIGNEE.to_string()),
                    ..TrackedIssue::default()
                };
            }
            issue.status = Some(IssueStatus::Assigned);
            issue.last_active = last_active;
            debug!("issue #{} is already assigned", target.number);
            return post_choice(&github, &target, &self.settings.assign_fail, &[]);
        }

        let sender = cx.sender.clone().unwrap_or_default();
        let issue = tracker.entry(target.number);
        if !in_store {
            *issue = TrackedIssue::default();
        }
        issue.assignee = Some(sender.clone());
        issue.status = Some(IssueStatus::Assigned);
        issue.last_active = last_active;
        info!("assigning issue #{} to {}", target.number, sender);

        github.update_labels(&target, &[self.settings.assign_label.as_str()], &[])?;
        post_choice(
            &github,
            &target,
            &self.settings.assign_success,
            &[("assignee", sender.as_str())],
        )
    }

    fn assign_other(
        &self,
        cx: &EventContext,
        tracker: &mut Tracker,
        api: &dyn PacedRequester,
        assignee: &str,
    ) -> AutomationResult {
        let target = issue_ref(cx)?;
        let github = GithubApi::new(api);
        let sender = cx.sender.as_deref().unwrap_or_default();
        if !self.settings.reviewers.iter().any(|reviewer| reviewer == sender) {
            return post_choice(&github, &target, &self.settings.non_reviewer_ack, &[]);
        }

        info!(
            "reviewer {} assigned issue #{} to {}",
            sender, target.number, assignee
        );
        *tracker.entry(target.number) = TrackedIssue {
            assignee: Some(assignee.to_string()),
            status: Some(IssueStatus::Assigned),
            last_active: cx.comment_updated_at().map(str::to_string),
            pr_number: None,
        };
        github.update_labels(&target, &[self.settings.assign_label.as_str()], &[])?;
        post_choice(
            &github,
            &target,
            &self.settings.assign_success,
            &[("assignee", assignee)],
        )
    }

    fn check_idle_issues(
        &self,
        cx: &EventContext,
        tracker: &mut Tracker,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        let github = GithubApi::new(api);
        let (Some(owner), Some(repo)) = (cx.owner.as_deref(), cx.repo.as_deref()) else {
            return Ok(());
        };
        let now = self.clock.now();

        for (number, issue) in tracker.issues.iter_mut() {
            let Some(last_active) = issue.last_active.as_deref().and_then(parse_timestamp)
            else {
                continue;
            };
            if (now - last_active).num_days() <= self.settings.grace_period_days {
                debug!("issue #{} is still in its grace period", number);
                continue;
            }
            if issue.status == Some(IssueStatus::Pull) {
                continue;
            }

            info!("issue #{} has been idle past its grace period", number);
            issue.last_active = Some(now.to_rfc3339());
            let target = IssueRef::new(owner, repo, number);
            match issue.status {
                Some(IssueStatus::Assigned) => {
                    let assignee = issue.assignee.clone().unwrap_or_default();
                    if assignee == ANONYMOUS_ASSIGNEE {
                        post_choice(&github, &target, &self.settings.unknown_ping, &[])?;
                    } else {
                        post_choice(
                            &github,
                            &target,
                            &self.settings.known_ping,
                            &[("assignee", assignee.as_str())],
                        )?;
                    }
                    issue.status = Some(IssueStatus::Commented);
                }
                Some(IssueStatus::Commented) => {
                    info!("unassigning issue #{}", number);
                    github.update_labels(&target, &[], &[self.settings.assign_label.as_str()])?;
                    post_choice(&github, &target, &self.settings.issue_unassign, &[])?;
                    *issue = TrackedIssue::default();
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl Automation for EasyIssueAssigner {
    fn on_open(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        self.on_open_or_reopen(cx, state, api)
    }

    fn on_reopen(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        self.on_open_or_reopen(cx, state, api)
    }

    fn on_new_comment(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        if cx.is_pull {
            return Ok(());
        }
        let message = cx.comment.as_deref().unwrap_or_default().to_lowercase();
        let command = Regex::new(&format!(
            r"@{}(?:\[bot\])?[: ]*assign @?(.*)",
            regex::escape(&cx.bot_name)
        ))
        .map_err(|err| AutomationError::Settings(err.to_string()))?;
        let requested = command.captures(&message).map(|captures| {
            captures[1]
                .split_whitespace()
                .next()
                .unwrap_or_default()
                .to_string()
        });

        self.with_tracker(cx, state, |tracker| match requested.as_deref() {
            Some("me") => self.self_assign(cx, tracker, api),
            Some(name) if !name.is_empty() => self.assign_other(cx, tracker, api, name),
            _ => {
                let Some(number) = cx.number.as_deref() else {
                    return Ok(());
                };
                if let Some(issue) = tracker.issues.get_mut(number) {
                    issue.last_active = cx.comment_updated_at().map(str::to_string);
                    if issue.status == Some(IssueStatus::Commented) {
                        issue.status = Some(IssueStatus::Assigned);
                    }
                }
                Ok(())
            }
        })
    }

    fn on_close(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        self.with_tracker(cx, state, |tracker| {
            let Some(number) = cx.number.clone() else {
                return Ok(());
            };
            if tracker.issues.remove(&number).is_some() {
                info!("issue #{} closed, forgetting it", number);
                return Ok(());
            }
            if !cx.is_pull {
                return Ok(());
            }

            let Some(issue_number) = tracker
                .issues
                .iter()
                .find(|(_, issue)| issue.pr_number.as_deref() == Some(number.as_str()))
                .map(|(issue_number, _)| issue_number.clone())
            else {
                return Ok(());
            };

            if cx.sender.is_some() && cx.sender == cx.creator {
                info!(
                    "PR #{} closed by its author, keeping #{} assigned",
                    number, issue_number
                );
                let issue = tracker.entry(&issue_number);
                issue.status = Some(IssueStatus::Assigned);
                issue.last_active = cx.pull_updated_at().map(str::to_string);
                issue.pr_number = None;
                return Ok(());
            }

            info!(
                "PR #{} closed by a collaborator, freeing issue #{}",
                number, issue_number
            );
            *tracker.entry(&issue_number) = TrackedIssue::default();
            let issue_cx = cx.with_number(&issue_number);
            let target = issue_ref(&issue_cx)?;
            let github = GithubApi::new(api);
            let author = cx.creator.clone().unwrap_or_default();
            let comment = [
                super::choose(&self.settings.previous_work),
                super::choose(&self.settings.issue_unassign),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");
            if !comment.is_empty() {
                let comment = super::render(
                    &comment,
                    &[("author", author.as_str()), ("pull", number.as_str())],
                );
                github.post_comment(&target, &comment)?;
            }
            github.update_labels(&target, &[], &[self.settings.assign_label.as_str()])?;
            Ok(())
        })
    }

    fn on_label_add(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        if cx.is_pull {
            return Ok(());
        }
        self.with_tracker(cx, state, |tracker| {
            let (Some(number), Some(label)) = (cx.number.as_deref(), cx.current_label.as_deref())
            else {
                return Ok(());
            };
            let in_store = tracker.tracks(Some(number));

            if label == self.settings.easy_label && !in_store {
                debug!("issue #{} marked easy, welcoming contributors", number);
                tracker.entry(number);
                let target = issue_ref(cx)?;
                post_choice(
                    &GithubApi::new(api),
                    &target,
                    &self.settings.issue_assign,
                    &[("bot", cx.bot_name.as_str())],
                )?;
            } else if label == self.settings.assign_label {
                debug!("issue #{} was assigned by label", number);
                let issue = tracker.entry(number);
                issue.assignee = Some(ANONYMOUS_ASSIGNEE.to_string());
                issue.status = Some(IssueStatus::Assigned);
                issue.last_active = cx.issue_updated_at().map(str::to_string);
            }
            Ok(())
        })
    }

    fn on_label_remove(
        &self,
        cx: &EventContext,
        state: &mut Value,
        _api: &dyn PacedRequester,
    ) -> AutomationResult {
        if cx.is_pull {
            return Ok(());
        }
        self.with_tracker(cx, state, |tracker| {
            let (Some(number), Some(label)) = (cx.number.as_deref(), cx.current_label.as_deref())
            else {
                return Ok(());
            };
            if label == self.settings.easy_label && tracker.tracks(Some(number)) {
                debug!("issue #{} is no longer easy", number);
                tracker.issues.remove(number);
            } else if label == self.settings.assign_label {
                debug!("issue #{} was unassigned", number);
                *tracker.entry(number) = TrackedIssue::default();
            }
            Ok(())
        })
    }

    fn on_tick(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        self.with_tracker(cx, state, |tracker| {
            self.check_idle_issues(cx, tracker, api)
        })
    }
}

/// Accepts RFC 3339 as sent by the platform, and the naive
/// `YYYY-MM-DD HH:MM:SS[.ffffff]` form older state files carry.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
