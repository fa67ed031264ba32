#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use dispatch_module::{EventContext, WebhookPayload};
use platform_api_module::{ApiError, ApiResponse, Method, PacedRequester, ResponseBody};
use serde_json::{json, Value};
use store_module::{
    InstallationId, InstallationStore, IntegrationStore, JsonFileStore, StoreError,
};
use tempfile::TempDir;

pub const BOT: &str = "steward-bot";

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub method: Method,
    pub url: String,
    pub body: Option<Value>,
}

/// Records every call; answers from routes matched by method and URL suffix.
#[derive(Default)]
pub struct FakeRequester {
    calls: Mutex<Vec<Call>>,
    routes: Mutex<Vec<(Method, String, Value)>>,
}

impl FakeRequester {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn route(&self, method: Method, suffix: &str, body: Value) {
        self.routes
            .lock()
            .unwrap()
            .push((method, suffix.to_string(), body));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn comments(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == Method::Post && call.url.ends_with("/comments"))
            .map(|call| {
                let body = call
                    .body
                    .as_ref()
                    .and_then(|body| body.get("body"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                (call.url, body)
            })
            .collect()
    }

    pub fn label_writes(&self) -> Vec<(String, Value)> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == Method::Put && call.url.ends_with("/labels"))
            .map(|call| (call.url, call.body.unwrap_or(Value::Null)))
            .collect()
    }
}

impl PacedRequester for FakeRequester {
    fn api_base_url(&self) -> &str {
        "https://api.test"
    }

    fn paced_request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> Result<ApiResponse, ApiError> {
        self.calls.lock().unwrap().push(Call {
            method,
            url: url.to_string(),
            body: body.cloned(),
        });
        let routed = self
            .routes
            .lock()
            .unwrap()
            .iter()
            .find(|(route_method, suffix, _)| *route_method == method && url.ends_with(suffix))
            .map(|(_, _, body)| body.clone());
        let body = routed.unwrap_or_else(|| {
            if method == Method::Get && url.ends_with("/labels") {
                json!([])
            } else {
                json!({})
            }
        });
        Ok(ApiResponse {
            status: 200,
            headers: Vec::new(),
            body: ResponseBody::Json(body),
        })
    }
}

/// File store wrapper that counts writes.
pub struct CountingStore {
    inner: JsonFileStore,
    writes: AtomicUsize,
}

impl CountingStore {
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl IntegrationStore for CountingStore {
    fn list_installations(
        &self,
    ) -> Result<Box<dyn Iterator<Item = InstallationId> + '_>, StoreError> {
        self.inner.list_installations()
    }

    fn get(&self, installation: InstallationId, key: &str) -> Result<Value, StoreError> {
        self.inner.get(installation, key)
    }

    fn write(&self, installation: InstallationId, key: &str, data: &Value) -> Result<(), StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(installation, key, data)
    }

    fn remove(&self, installation: InstallationId, key: &str) -> Result<(), StoreError> {
        self.inner.remove(installation, key)
    }
}

pub struct TestStore {
    pub dir: TempDir,
    pub backend: Arc<CountingStore>,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let inner = JsonFileStore::new(dir.path()).expect("json store");
        Self {
            dir,
            backend: Arc::new(CountingStore {
                inner,
                writes: AtomicUsize::new(0),
            }),
        }
    }

    pub fn shared(&self) -> Arc<dyn IntegrationStore> {
        self.backend.clone()
    }

    pub fn installation(&self, installation: InstallationId) -> InstallationStore {
        InstallationStore::new(self.shared(), installation)
    }
}

pub fn context(payload: Value) -> EventContext {
    let payload: WebhookPayload = serde_json::from_value(payload).expect("payload");
    EventContext::from_payload(BOT, payload)
}

pub fn issue_event(action: &str, number: u64, labels: &[&str], extra: Value) -> Value {
    let mut payload = json!({
        "action": action,
        "installation": {"id": 5127},
        "repository": {"name": "servo", "owner": {"login": "servo"}},
        "sender": {"login": "alice"},
        "issue": {
            "number": number,
            "user": {"login": "carol"},
            "state": "open",
            "labels": labels.iter().map(|name| json!({"name": name})).collect::<Vec<_>>(),
            "updated_at": "2024-02-01T10:00:00Z"
        }
    });
    merge(&mut payload, extra);
    payload
}

pub fn pull_event(action: &str, number: u64, author: &str, body: &str, extra: Value) -> Value {
    let mut payload = json!({
        "action": action,
        "installation": {"id": 5127},
        "repository": {"name": "servo", "owner": {"login": "servo"}},
        "sender": {"login": author},
        "pull_request": {
            "number": number,
            "user": {"login": author},
            "state": "open",
            "body": body,
            "updated_at": "2024-02-02T10:00:00Z"
        }
    });
    merge(&mut payload, extra);
    payload
}

fn merge(target: &mut Value, extra: Value) {
    if let (Some(target), Value::Object(extra)) = (target.as_object_mut(), extra) {
        for (key, value) in extra {
            match (target.get_mut(&key), value) {
                (Some(Value::Object(existing)), Value::Object(value)) => {
                    existing.extend(value);
                }
                (_, value) => {
                    target.insert(key, value);
                }
            }
        }
    }
}
