pub mod automation;
pub mod automations;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod payload;
pub mod registry;
pub mod runner;
pub mod service;
pub mod verify;

pub use automation::{Action, Automation, AutomationError, AutomationResult, TICK_ACTION};
pub use config::{AutomationConfig, ConfigError, PartialFailurePolicy, StewardConfig};
pub use context::EventContext;
pub use dispatch::{DispatchEngine, DispatchReport};
pub use payload::WebhookPayload;
pub use registry::Registry;
pub use runner::{HandleOutcome, RequesterFactory, Runner, RunnerError, RunnerSettings, TickControl};
pub use service::run_server;
pub use verify::VerifyError;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
