//! Per-installation API gateway.
//!
//! Each installation owns one access token and one rate-limit budget. The
//! token is exchanged for a short-lived app JWT whenever it has expired, and
//! every paced call first waits long enough to spread the remaining budget
//! evenly across what is left of the current window.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::response::{decode_response, ApiResponse};
use crate::transport::{Method, Transport, TransportError};

pub const DEFAULT_API_BASE_URL: &str = "https://api.github.com";
const ACCEPT_HEADER: &str = "application/vnd.github.machine-man-preview+json";
const JWT_LIFETIME_SECS: i64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: Method,
        url: String,
        status: u16,
        body: String,
    },
    #[error("jwt error: {0}")]
    Jwt(#[from] jsonwebtoken::errors::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("installation {0} has no access token")]
    MissingToken(u64),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// App-level identity shared by every installation.
#[derive(Clone)]
pub struct AppCredentials {
    integration_id: String,
    key: EncodingKey,
}

impl AppCredentials {
    pub fn from_pem(integration_id: impl Into<String>, pem: &[u8]) -> Result<Self, ApiError> {
        Ok(Self {
            integration_id: integration_id.into(),
            key: EncodingKey::from_rsa_pem(pem)?,
        })
    }

    pub fn from_pem_file(
        integration_id: impl Into<String>,
        path: &Path,
    ) -> Result<Self, ApiError> {
        let pem = std::fs::read(path)?;
        Self::from_pem(integration_id, &pem)
    }

    pub fn integration_id(&self) -> &str {
        &self.integration_id
    }

    /// Signs a JWT valid for ten minutes starting at `now`.
    pub fn app_jwt(&self, now: DateTime<Utc>) -> Result<String, ApiError> {
        let iat = now.timestamp();
        let claims = AppClaims {
            iat,
            exp: iat + JWT_LIFETIME_SECS,
            iss: self.integration_id.clone(),
        };
        Ok(jsonwebtoken::encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &self.key,
        )?)
    }
}

impl fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppCredentials")
            .field("integration_id", &self.integration_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppClaims {
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
}

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub base_url: String,
    /// Sent as `User-Agent`; the bot's login.
    pub user_agent: String,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            user_agent: "repo-steward".to_string(),
        }
    }
}

/// How the `Authorization` header is filled for a single request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    /// `token <installation token>`
    Installation,
    /// Sent verbatim, e.g. `Bearer <jwt>`.
    Custom(String),
    None,
}

/// What automations get to talk to the platform. Every call is paced
/// against the installation's rate budget.
pub trait PacedRequester: Send + Sync {
    fn api_base_url(&self) -> &str;

    fn paced_request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError>;
}

struct ManagerState {
    /// Current installation access token
    token: Option<String>,
    /// Token expiration time; the token is refreshed once `now` reaches it
    token_expires_at: DateTime<Utc>,
    /// Requests left in the current window
    remaining: u64,
    /// Window reset, unix seconds
    reset_at: i64,
}

pub struct InstallationManager {
    installation_id: u64,
    credentials: Arc<AppCredentials>,
    options: ManagerOptions,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    state: Mutex<ManagerState>,
}

impl fmt::Debug for InstallationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("InstallationManager")
            .field("installation_id", &self.installation_id)
            .field("base_url", &self.options.base_url)
            .field("has_token", &state.token.is_some())
            .field("token_expires_at", &state.token_expires_at)
            .field("remaining", &state.remaining)
            .field("reset_at", &state.reset_at)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    rate: RateWindow,
}

#[derive(Debug, Deserialize)]
struct RateWindow {
    remaining: u64,
    reset: i64,
}

impl InstallationManager {
    pub fn new(
        installation_id: u64,
        credentials: Arc<AppCredentials>,
        options: ManagerOptions,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let now = clock.now();
        Self {
            installation_id,
            credentials,
            options,
            transport,
            clock,
            state: Mutex::new(ManagerState {
                token: None,
                token_expires_at: now,
                remaining: 0,
                reset_at: now.timestamp(),
            }),
        }
    }

    pub fn installation_id(&self) -> u64 {
        self.installation_id
    }

    pub fn base_url(&self) -> &str {
        &self.options.base_url
    }

    pub fn remaining(&self) -> u64 {
        self.lock_state().remaining
    }

    pub fn reset_at(&self) -> i64 {
        self.lock_state().reset_at
    }

    pub fn token_expires_at(&self) -> DateTime<Utc> {
        self.lock_state().token_expires_at
    }

    /// Exchanges a fresh app JWT for an installation token once the cached
    /// one has expired. A no-op while the token is still valid.
    pub fn sync_token(&self) -> Result<(), ApiError> {
        let now = self.clock.now();
        {
            let state = self.lock_state();
            if state.token.is_some() && now < state.token_expires_at {
                return Ok(());
            }
        }

        debug!(
            "refreshing access token for installation {}",
            self.installation_id
        );
        let jwt = self.credentials.app_jwt(now)?;
        let url = format!(
            "{}/installations/{}/access_tokens",
            self.options.base_url, self.installation_id
        );
        let response = self.request(
            Method::Post,
            &url,
            None,
            Auth::Custom(format!("Bearer {}", jwt)),
        )?;
        let json = response.into_json().ok_or_else(|| {
            ApiError::InvalidResponse("access token response is not JSON".to_string())
        })?;
        let token: AccessTokenResponse = serde_json::from_value(json)?;

        let mut state = self.lock_state();
        state.token = Some(token.token);
        state.token_expires_at = token.expires_at;
        info!(
            "installation {} token valid until {}",
            self.installation_id, token.expires_at
        );
        Ok(())
    }

    /// Time to wait before the next call so the remaining budget lasts until
    /// the window resets. Refreshes the budget first if the window is over.
    pub fn wait_interval(&self) -> Result<Duration, ApiError> {
        let now = self.clock.now().timestamp();
        let expired = self.lock_state().reset_at <= now;
        if expired {
            let url = format!("{}/rate_limit", self.options.base_url);
            let response = self.request(Method::Get, &url, None, Auth::Installation)?;
            let json = response.into_json().ok_or_else(|| {
                ApiError::InvalidResponse("rate limit response is not JSON".to_string())
            })?;
            let limit: RateLimitResponse = serde_json::from_value(json)?;

            let mut state = self.lock_state();
            // the status query itself is charged against the window
            state.remaining = limit.rate.remaining.saturating_sub(1);
            state.reset_at = limit.rate.reset;
            debug!(
                "installation {} rate window: {} remaining until {}",
                self.installation_id,
                state.remaining,
                format_reset(state.reset_at)
            );
        }

        let state = self.lock_state();
        let window = (state.reset_at - now).max(0) as f64;
        let wait = if state.remaining == 0 {
            window
        } else {
            window / state.remaining as f64
        };
        Ok(Duration::from_secs_f64(wait))
    }

    /// One unpaced call. Any status outside `[200, 300)` is an error.
    pub fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        auth: Auth,
    ) -> Result<ApiResponse, ApiError> {
        let mut headers = vec![
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), ACCEPT_HEADER.to_string()),
            ("Accept-Encoding".to_string(), "gzip, deflate".to_string()),
            ("User-Agent".to_string(), self.options.user_agent.clone()),
        ];
        match auth {
            Auth::Installation => {
                let token = self
                    .lock_state()
                    .token
                    .clone()
                    .ok_or(ApiError::MissingToken(self.installation_id))?;
                headers.push(("Authorization".to_string(), format!("token {}", token)));
            }
            Auth::Custom(value) => headers.push(("Authorization".to_string(), value)),
            Auth::None => {}
        }
        let payload = body.map(serde_json::to_vec).transpose()?;

        debug!("{} {}", method, url);
        let raw = self
            .transport
            .send(method, url, payload.as_deref(), &headers)?;
        if !(200..300).contains(&raw.status) {
            let body = String::from_utf8_lossy(&raw.body).into_owned();
            warn!("{} {} failed with status {}", method, url, raw.status);
            return Err(ApiError::Status {
                method,
                url: url.to_string(),
                status: raw.status,
                body,
            });
        }
        Ok(decode_response(raw)?)
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl PacedRequester for InstallationManager {
    fn api_base_url(&self) -> &str {
        &self.options.base_url
    }

    fn paced_request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        self.sync_token()?;
        let wait = self.wait_interval()?;
        if !wait.is_zero() {
            debug!(
                "installation {} pacing for {:?}",
                self.installation_id, wait
            );
            self.clock.sleep(wait);
            // a long wait can outlive the token
            self.sync_token()?;
        }
        {
            let mut state = self.lock_state();
            state.remaining = state.remaining.saturating_sub(1);
        }
        self.request(method, url, body, Auth::Installation)
    }
}

fn format_reset(reset_at: i64) -> String {
    match Utc.timestamp_opt(reset_at, 0).single() {
        Some(at) => at.to_rfc3339(),
        None => reset_at.to_string(),
    }
}
