use platform_api_module::{ApiError, PacedRequester};
use serde_json::Value;

use crate::context::EventContext;

/// Action name of the synthetic, payload-less tick event.
pub const TICK_ACTION: &str = "__tick";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Assign,
    Unassign,
    Open,
    Close,
    Reopen,
    Update,
    NewComment,
    LabelAdd,
    LabelRemove,
    Tick,
}

impl Action {
    /// Maps a webhook `action` value; unknown actions yield `None`.
    pub fn from_action(action: &str) -> Option<Self> {
        let action = match action {
            "assigned" => Action::Assign,
            "unassigned" => Action::Unassign,
            "opened" => Action::Open,
            "closed" => Action::Close,
            "reopened" => Action::Reopen,
            "synchronize" => Action::Update,
            "created" => Action::NewComment,
            "labeled" => Action::LabelAdd,
            "unlabeled" => Action::LabelRemove,
            TICK_ACTION => Action::Tick,
            _ => return None,
        };
        Some(action)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AutomationError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid state: {0}")]
    State(String),
    #[error("invalid settings: {0}")]
    Settings(String),
}

pub type AutomationResult = Result<(), AutomationError>;

/// A stateful reaction to repository events.
///
/// Every hook receives the event context, the automation's own persisted
/// state (mutate it in place; the engine writes it back when it changed) and
/// the paced requester for the event's installation. Hooks default to no-ops.
#[allow(unused_variables)]
pub trait Automation: Send + Sync {
    fn on_assign(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_unassign(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_open(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_close(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_reopen(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_update(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_new_comment(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_label_add(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_label_remove(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }

    fn on_tick(
        &self,
        cx: &EventContext,
        state: &mut Value,
        api: &dyn PacedRequester,
    ) -> AutomationResult {
        Ok(())
    }
}

pub fn invoke(
    automation: &dyn Automation,
    action: Action,
    cx: &EventContext,
    state: &mut Value,
    api: &dyn PacedRequester,
) -> AutomationResult {
    match action {
        Action::Assign => automation.on_assign(cx, state, api),
        Action::Unassign => automation.on_unassign(cx, state, api),
        Action::Open => automation.on_open(cx, state, api),
        Action::Close => automation.on_close(cx, state, api),
        Action::Reopen => automation.on_reopen(cx, state, api),
        Action::Update => automation.on_update(cx, state, api),
        Action::NewComment => automation.on_new_comment(cx, state, api),
        Action::LabelAdd => automation.on_label_add(cx, state, api),
        Action::LabelRemove => automation.on_label_remove(cx, state, api),
        Action::Tick => automation.on_tick(cx, state, api),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_table_covers_known_actions() {
        let table = [
            ("assigned", Action::Assign),
            ("unassigned", Action::Unassign),
            ("opened", Action::Open),
            ("closed", Action::Close),
            ("reopened", Action::Reopen),
            ("synchronize", Action::Update),
            ("created", Action::NewComment),
            ("labeled", Action::LabelAdd),
            ("unlabeled", Action::LabelRemove),
            ("__tick", Action::Tick),
        ];
        for (name, action) in table {
            assert_eq!(Action::from_action(name), Some(action));
        }
    }

    #[test]
    fn unknown_actions_are_ignored() {
        assert_eq!(Action::from_action("edited"), None);
        assert_eq!(Action::from_action("review_requested"), None);
        assert_eq!(Action::from_action(""), None);
    }
}
