use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use platform_api_module::DEFAULT_API_BASE_URL;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use store_module::StoreBackend;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 9200;
const DEFAULT_TICK_INTERVAL_SECS: u64 = 3600;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_QUEUE_CAPACITY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("STEWARD_CONFIG_PATH not set and steward.toml not found")]
    NotFound,
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid setting {key}: {reason}")]
    Invalid { key: String, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl fmt::Display) -> Self {
        ConfigError::Invalid {
            key: key.into(),
            reason: reason.to_string(),
        }
    }
}

/// What happens to an automation's state when it fails halfway through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartialFailurePolicy {
    /// Persist whatever the automation mutated before failing.
    #[default]
    Commit,
    Discard,
}

#[derive(Debug, Deserialize)]
pub struct StewardConfigFile {
    pub name: Option<String>,
    #[serde(default, deserialize_with = "string_or_number")]
    pub integration_id: Option<String>,
    pub pem_key_path: Option<PathBuf>,
    pub secret: Option<String>,
    pub enabled_events: Option<Vec<String>>,
    pub api_base_url: Option<String>,
    pub tick_interval_secs: Option<u64>,
    pub request_timeout_secs: Option<u64>,
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub partial_failure: PartialFailurePolicy,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub automations: BTreeMap<String, AutomationConfig>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct StoreConfig {
    pub dump_path: Option<PathBuf>,
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub allowed_repos: Vec<String>,
    #[serde(default = "empty_settings")]
    pub settings: Value,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            active: true,
            allowed_repos: Vec::new(),
            settings: empty_settings(),
        }
    }
}

fn default_active() -> bool {
    true
}

fn empty_settings() -> Value {
    Value::Object(Default::default())
}

fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }
    Ok(Option::<Raw>::deserialize(deserializer)?.map(|raw| match raw {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    }))
}

/// Fully resolved daemon settings: file values with env overrides applied
/// and the app key already read.
#[derive(Clone)]
pub struct StewardConfig {
    pub name: String,
    pub integration_id: String,
    pub pem_key: Vec<u8>,
    pub secret: Option<String>,
    pub enabled_events: Vec<String>,
    pub api_base_url: String,
    pub tick_interval: Duration,
    pub request_timeout: Duration,
    pub queue_capacity: usize,
    pub partial_failure: PartialFailurePolicy,
    pub host: String,
    pub port: u16,
    pub store: StoreBackend,
    pub automations: BTreeMap<String, AutomationConfig>,
}

impl fmt::Debug for StewardConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StewardConfig")
            .field("name", &self.name)
            .field("integration_id", &self.integration_id)
            .field("secret", &self.secret.as_ref().map(|_| "***"))
            .field("enabled_events", &self.enabled_events)
            .field("api_base_url", &self.api_base_url)
            .field("tick_interval", &self.tick_interval)
            .field("request_timeout", &self.request_timeout)
            .field("queue_capacity", &self.queue_capacity)
            .field("partial_failure", &self.partial_failure)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("automations", &self.automations.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl StewardConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let path = resolve_config_path()?;
        let file = load_config_file(&path)?;
        Self::from_file(file)
    }

    pub fn from_file(file: StewardConfigFile) -> Result<Self, ConfigError> {
        let name = file
            .name
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing("name"))?;
        let integration_id = file
            .integration_id
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::Missing("integration_id"))?;

        let pem_key_path = env_override("STEWARD_PEM_KEY_PATH")
            .map(PathBuf::from)
            .or(file.pem_key_path)
            .ok_or(ConfigError::Missing("pem_key_path"))?;
        let pem_key_path = resolve_path(pem_key_path)?;
        let pem_key = std::fs::read(&pem_key_path).map_err(|source| ConfigError::Read {
            path: pem_key_path.clone(),
            source,
        })?;

        let secret = env_override("STEWARD_WEBHOOK_SECRET")
            .or(file.secret)
            .filter(|value| !value.is_empty());

        let enabled_events = file
            .enabled_events
            .unwrap_or_else(|| {
                vec![
                    "issues".to_string(),
                    "issue_comment".to_string(),
                    "pull_request".to_string(),
                ]
            })
            .into_iter()
            .map(|event| event.trim().to_string())
            .filter(|event| !event.is_empty())
            .collect();

        let api_base_url = file
            .api_base_url
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());

        let tick_interval_secs = file
            .tick_interval_secs
            .unwrap_or(DEFAULT_TICK_INTERVAL_SECS);
        if tick_interval_secs == 0 {
            return Err(ConfigError::invalid("tick_interval_secs", "must be positive"));
        }
        let request_timeout_secs = file
            .request_timeout_secs
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
        if request_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "request_timeout_secs",
                "must be positive",
            ));
        }
        let queue_capacity = file.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);
        if queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be positive"));
        }

        let host = env_override("STEWARD_HOST")
            .or(file.server.host)
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match env_override("STEWARD_PORT") {
            Some(value) => value
                .parse::<u16>()
                .map_err(|err| ConfigError::invalid("STEWARD_PORT", err))?,
            None => file.server.port.unwrap_or(DEFAULT_PORT),
        };

        let store = resolve_store(file.store)?;

        Ok(Self {
            name,
            integration_id,
            pem_key,
            secret,
            enabled_events,
            api_base_url,
            tick_interval: Duration::from_secs(tick_interval_secs),
            request_timeout: Duration::from_secs(request_timeout_secs),
            queue_capacity,
            partial_failure: file.partial_failure,
            host,
            port,
            store,
            automations: file.automations,
        })
    }
}

fn resolve_store(store: StoreConfig) -> Result<StoreBackend, ConfigError> {
    let dump_path = env_override("STEWARD_DUMP_PATH")
        .map(PathBuf::from)
        .or(store.dump_path);
    let database_url = env_override("DATABASE_URL").or(store.database_url);
    match (dump_path, database_url) {
        (Some(_), Some(_)) => Err(ConfigError::invalid(
            "store",
            "set either dump_path or database_url, not both",
        )),
        (Some(dump_path), None) => Ok(StoreBackend::JsonFiles {
            dump_path: resolve_path(dump_path)?,
        }),
        (None, Some(database_url)) => Ok(StoreBackend::Postgres { database_url }),
        (None, None) => Err(ConfigError::Missing("store.dump_path or store.database_url")),
    }
}

pub fn resolve_config_path() -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_override("STEWARD_CONFIG_PATH") {
        return Ok(PathBuf::from(path));
    }

    let cwd = env::current_dir().map_err(|source| ConfigError::Read {
        path: PathBuf::from("."),
        source,
    })?;
    let direct = cwd.join("steward.toml");
    if direct.exists() {
        return Ok(direct);
    }
    Err(ConfigError::NotFound)
}

pub fn load_config_file(path: &Path) -> Result<StewardConfigFile, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str::<StewardConfigFile>(&content)?)
}

fn env_override(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn resolve_path(path: PathBuf) -> Result<PathBuf, ConfigError> {
    if path.is_absolute() {
        return Ok(path);
    }
    let cwd = env::current_dir().map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    Ok(cwd.join(path))
}
