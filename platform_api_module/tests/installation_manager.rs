use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use platform_api_module::installation::AppClaims;
use platform_api_module::{
    ApiError, AppCredentials, Auth, Clock, InstallationManager, ManagerOptions, Method,
    PacedRequester, RawResponse, Transport, TransportError,
};
use serde_json::{json, Value};

const BASE: &str = "https://api.test";
const PRIVATE_KEY: &[u8] = include_bytes!("fixtures/test_app_key.pem");
const PUBLIC_KEY: &[u8] = include_bytes!("fixtures/test_app_key.pub.pem");

struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl ManualClock {
    fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
            sleeps: Mutex::new(Vec::new()),
        }
    }

    fn advance(&self, duration: Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + chrono::Duration::from_std(duration).unwrap();
    }

    fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(duration);
    }
}

#[derive(Debug, Clone)]
struct RecordedCall {
    method: Method,
    url: String,
    headers: Vec<(String, String)>,
}

impl RecordedCall {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Scripted responses per (method, url). The last response for a route is
/// repeated once the queue is down to one entry.
#[derive(Default)]
struct FakeTransport {
    routes: Mutex<HashMap<(Method, String), VecDeque<RawResponse>>>,
    calls: Mutex<Vec<RecordedCall>>,
}

impl FakeTransport {
    fn route(&self, method: Method, path: &str, status: u16, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, format!("{}{}", BASE, path)))
            .or_default()
            .push_back(RawResponse {
                status,
                headers: vec![("Content-Type".into(), "application/json".into())],
                body: serde_json::to_vec(&body).unwrap(),
            });
    }

    fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_to(&self, path: &str) -> usize {
        let url = format!("{}{}", BASE, path);
        self.calls().iter().filter(|call| call.url == url).count()
    }
}

impl Transport for FakeTransport {
    fn send(
        &self,
        method: Method,
        url: &str,
        _body: Option<&[u8]>,
        headers: &[(String, String)],
    ) -> Result<RawResponse, TransportError> {
        self.calls.lock().unwrap().push(RecordedCall {
            method,
            url: url.to_string(),
            headers: headers.to_vec(),
        });
        let mut routes = self.routes.lock().unwrap();
        let Some(queue) = routes.get_mut(&(method, url.to_string())) else {
            return Ok(RawResponse {
                status: 404,
                headers: Vec::new(),
                body: b"not found".to_vec(),
            });
        };
        let response = if queue.len() > 1 {
            queue.pop_front().unwrap()
        } else {
            queue.front().cloned().unwrap()
        };
        Ok(response)
    }
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn setup() -> (InstallationManager, Arc<FakeTransport>, Arc<ManualClock>) {
    let transport = Arc::new(FakeTransport::default());
    let clock = Arc::new(ManualClock::new(start()));
    let credentials = Arc::new(AppCredentials::from_pem("666", PRIVATE_KEY).unwrap());
    let manager = InstallationManager::new(
        255,
        credentials,
        ManagerOptions {
            base_url: BASE.to_string(),
            user_agent: "steward-bot".to_string(),
        },
        transport.clone(),
        clock.clone(),
    );
    (manager, transport, clock)
}

fn token_route(transport: &FakeTransport, expires_in_secs: i64) {
    let expires_at = start() + chrono::Duration::seconds(expires_in_secs);
    transport.route(
        Method::Post,
        "/installations/255/access_tokens",
        201,
        json!({"token": "v1.installation", "expires_at": expires_at.to_rfc3339()}),
    );
}

fn rate_route(transport: &FakeTransport, remaining: u64, reset_in_secs: i64) {
    transport.route(
        Method::Get,
        "/rate_limit",
        200,
        json!({"rate": {"limit": 5000, "remaining": remaining, "reset": start().timestamp() + reset_in_secs}}),
    );
}

#[test]
fn sync_token_exchanges_once_per_validity_window() {
    let (manager, transport, _clock) = setup();
    token_route(&transport, 3600);

    manager.sync_token().unwrap();
    manager.sync_token().unwrap();

    assert_eq!(transport.calls_to("/installations/255/access_tokens"), 1);
    let call = &transport.calls()[0];
    assert_eq!(call.method, Method::Post);
    let jwt = call
        .header("Authorization")
        .and_then(|value| value.strip_prefix("Bearer "))
        .expect("bearer jwt");

    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    let decoded = jsonwebtoken::decode::<AppClaims>(
        jwt,
        &DecodingKey::from_rsa_pem(PUBLIC_KEY).unwrap(),
        &validation,
    )
    .unwrap();
    assert_eq!(decoded.claims.iss, "666");
    assert_eq!(decoded.claims.iat, start().timestamp());
    assert_eq!(decoded.claims.exp - decoded.claims.iat, 600);
    assert_eq!(
        manager.token_expires_at(),
        start() + chrono::Duration::seconds(3600)
    );
}

#[test]
fn expired_token_is_exchanged_again() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 60);

    manager.sync_token().unwrap();
    clock.advance(Duration::from_secs(30));
    manager.sync_token().unwrap();
    assert_eq!(transport.calls_to("/installations/255/access_tokens"), 1);

    clock.advance(Duration::from_secs(31));
    manager.sync_token().unwrap();
    assert_eq!(transport.calls_to("/installations/255/access_tokens"), 2);
}

#[test]
fn failed_token_exchange_is_fatal() {
    let (manager, transport, _clock) = setup();
    transport.route(
        Method::Post,
        "/installations/255/access_tokens",
        401,
        json!({"message": "Bad credentials"}),
    );

    let err = manager.sync_token().unwrap_err();
    assert_eq!(err.status(), Some(401));
}

#[test]
fn wait_interval_spreads_budget_over_window() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 5001, 5000);
    manager.sync_token().unwrap();

    // 5001 reported, one charged for the status query itself
    assert_eq!(manager.wait_interval().unwrap(), Duration::from_secs(1));
    assert_eq!(manager.remaining(), 5000);
    assert_eq!(manager.reset_at(), start().timestamp() + 5000);

    clock.advance(Duration::from_secs(2500));
    assert_eq!(
        manager.wait_interval().unwrap(),
        Duration::from_millis(500)
    );
    assert_eq!(transport.calls_to("/rate_limit"), 1);

    let rate_call = transport
        .calls()
        .into_iter()
        .find(|call| call.url.ends_with("/rate_limit"))
        .unwrap();
    assert_eq!(
        rate_call.header("Authorization"),
        Some("token v1.installation")
    );
}

#[test]
fn exhausted_budget_waits_until_reset() {
    let (manager, transport, _clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 1, 120);
    manager.sync_token().unwrap();

    assert_eq!(manager.wait_interval().unwrap(), Duration::from_secs(120));
    assert_eq!(manager.remaining(), 0);
}

#[test]
fn reset_in_the_past_never_yields_negative_wait() {
    let (manager, transport, _clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 10, -30);
    manager.sync_token().unwrap();

    assert_eq!(manager.wait_interval().unwrap(), Duration::ZERO);
}

#[test]
fn paced_request_syncs_waits_then_sends() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 5001, 5000);
    transport.route(
        Method::Get,
        "/repos/servo/servo/issues/1",
        200,
        json!({"number": 1}),
    );

    let response = manager
        .paced_request(Method::Get, &format!("{}/repos/servo/servo/issues/1", BASE), None)
        .unwrap();

    assert_eq!(response.json(), Some(&json!({"number": 1})));
    let urls: Vec<String> = transport.calls().into_iter().map(|call| call.url).collect();
    assert_eq!(
        urls,
        vec![
            format!("{}/installations/255/access_tokens", BASE),
            format!("{}/rate_limit", BASE),
            format!("{}/repos/servo/servo/issues/1", BASE),
        ]
    );
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    assert_eq!(manager.remaining(), 4999);
}

#[test]
fn pacing_refreshes_window_and_never_underflows() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 86_400);
    rate_route(&transport, 3, 10);
    rate_route(&transport, 3, 20);
    transport.route(Method::Get, "/user", 200, json!({}));
    let url = format!("{}/user", BASE);

    for _ in 0..3 {
        manager.paced_request(Method::Get, &url, None).unwrap();
    }

    // window 1: 2 usable calls over 10s; window 2 refreshed at t=10
    assert_eq!(
        clock.sleeps(),
        vec![
            Duration::from_secs(5),
            Duration::from_secs(5),
            Duration::from_secs(5)
        ]
    );
    assert_eq!(transport.calls_to("/rate_limit"), 2);
    assert_eq!(manager.remaining(), 1);
}

#[test]
fn paced_request_with_empty_budget_stays_at_zero() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 0, 60);
    transport.route(Method::Get, "/user", 200, json!({}));

    manager
        .paced_request(Method::Get, &format!("{}/user", BASE), None)
        .unwrap();

    assert_eq!(manager.remaining(), 0);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(60)]);
}

#[test]
fn token_expiring_during_pacing_wait_is_refreshed() {
    let (manager, transport, clock) = setup();
    token_route(&transport, 60);
    transport.route(
        Method::Post,
        "/installations/255/access_tokens",
        201,
        json!({
            "token": "v2.installation",
            "expires_at": (start() + chrono::Duration::seconds(3600)).to_rfc3339()
        }),
    );
    rate_route(&transport, 1, 120);
    transport.route(Method::Get, "/user", 200, json!({}));

    manager
        .paced_request(Method::Get, &format!("{}/user", BASE), None)
        .unwrap();

    assert_eq!(clock.sleeps(), vec![Duration::from_secs(120)]);
    assert_eq!(transport.calls_to("/installations/255/access_tokens"), 2);
    let calls = transport.calls();
    let sent = calls.last().unwrap();
    assert!(sent.url.ends_with("/user"));
    assert_eq!(sent.header("Authorization"), Some("token v2.installation"));
}

#[test]
fn non_success_status_is_fatal() {
    let (manager, transport, _clock) = setup();
    token_route(&transport, 3600);
    rate_route(&transport, 100, 3600);
    transport.route(
        Method::Post,
        "/repos/servo/servo/issues/1/comments",
        422,
        json!({"message": "Validation Failed"}),
    );

    let err = manager
        .paced_request(
            Method::Post,
            &format!("{}/repos/servo/servo/issues/1/comments", BASE),
            Some(&json!({"body": "hi"})),
        )
        .unwrap_err();

    match err {
        ApiError::Status { status, body, .. } => {
            assert_eq!(status, 422);
            assert!(body.contains("Validation Failed"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn request_auth_modes_and_default_headers() {
    let (manager, transport, _clock) = setup();
    transport.route(Method::Get, "/meta", 200, json!({}));
    let url = format!("{}/meta", BASE);

    let err = manager
        .request(Method::Get, &url, None, Auth::Installation)
        .unwrap_err();
    assert!(matches!(err, ApiError::MissingToken(255)));

    manager.request(Method::Get, &url, None, Auth::None).unwrap();
    manager
        .request(Method::Get, &url, None, Auth::Custom("Bearer abc".into()))
        .unwrap();

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].header("Authorization"), None);
    assert_eq!(calls[1].header("Authorization"), Some("Bearer abc"));
    for call in &calls {
        assert_eq!(call.header("Content-Type"), Some("application/json"));
        assert_eq!(
            call.header("Accept"),
            Some("application/vnd.github.machine-man-preview+json")
        );
        assert_eq!(call.header("Accept-Encoding"), Some("gzip, deflate"));
        assert_eq!(call.header("User-Agent"), Some("steward-bot"));
    }
}

#[test]
fn invalid_pem_is_rejected() {
    assert!(AppCredentials::from_pem("666", b"not a key").is_err());
}
