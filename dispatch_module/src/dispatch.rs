use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use platform_api_module::PacedRequester;
use serde_json::Value;
use store_module::InstallationStore;
use tracing::{debug, error, info};

use crate::automation::{invoke, Action};
use crate::config::PartialFailurePolicy;
use crate::context::EventContext;
use crate::registry::{RegisteredAutomation, Registry};

/// What happened to each registered automation for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub invoked: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub written: Vec<String>,
}

pub struct DispatchEngine {
    registry: Arc<Registry>,
    policy: PartialFailurePolicy,
}

impl DispatchEngine {
    pub fn new(registry: Arc<Registry>, policy: PartialFailurePolicy) -> Self {
        Self { registry, policy }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Runs every matching automation for one event. Failures are logged and
    /// isolated; they never stop the remaining automations.
    pub fn dispatch(
        &self,
        cx: &EventContext,
        store: &InstallationStore,
        api: &dyn PacedRequester,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        let Some(action) = cx.action.as_deref().and_then(Action::from_action) else {
            debug!(
                "installation {} ignoring action {:?}",
                store.installation(),
                cx.action
            );
            return report;
        };

        for entry in self.registry.iter() {
            self.run_one(entry, action, cx, store, api, &mut report);
        }
        report
    }

    fn run_one(
        &self,
        entry: &RegisteredAutomation,
        action: Action,
        cx: &EventContext,
        store: &InstallationStore,
        api: &dyn PacedRequester,
        report: &mut DispatchReport,
    ) {
        let name = entry.name();
        if !entry.is_active() {
            report.skipped.push(name.to_string());
            return;
        }

        let mut state = match store.get(name) {
            Ok(state) => state,
            Err(err) => {
                error!(
                    "installation {} failed to load state for {}: {}",
                    store.installation(),
                    name,
                    err
                );
                report.failed.push(name.to_string());
                return;
            }
        };

        let derived;
        let scoped = if action == Action::Tick {
            let owner = state.get("owner").and_then(Value::as_str);
            let repo = state.get("repo").and_then(Value::as_str);
            let (Some(owner), Some(repo)) = (owner, repo) else {
                debug!(
                    "installation {} has no owner/repo for {}, skipping tick",
                    store.installation(),
                    name
                );
                report.skipped.push(name.to_string());
                return;
            };
            derived = cx.with_repo(owner, repo);
            &derived
        } else {
            cx
        };

        if !entry.allows_repo(scoped.full_repo_name().as_deref()) {
            report.skipped.push(name.to_string());
            return;
        }

        let snapshot = state.clone();
        report.invoked.push(name.to_string());
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            invoke(entry.automation(), action, scoped, &mut state, api)
        }));
        let succeeded = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                error!(
                    "automation {} failed on installation {}: {}",
                    name,
                    store.installation(),
                    err
                );
                false
            }
            Err(panic) => {
                error!(
                    "automation {} panicked on installation {}: {}",
                    name,
                    store.installation(),
                    panic_message(panic.as_ref())
                );
                false
            }
        };

        if !succeeded {
            report.failed.push(name.to_string());
            if self.policy == PartialFailurePolicy::Discard {
                return;
            }
        }

        if state == snapshot {
            return;
        }
        match store.write(name, &state) {
            Ok(()) => {
                info!(
                    "installation {} saved state for {}",
                    store.installation(),
                    name
                );
                report.written.push(name.to_string());
            }
            Err(err) => {
                error!(
                    "installation {} failed to save state for {}: {}",
                    store.installation(),
                    name,
                    err
                );
                if succeeded {
                    report.failed.push(name.to_string());
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
