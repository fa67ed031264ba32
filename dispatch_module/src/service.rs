use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use platform_api_module::{
    AppCredentials, InstallationManager, ManagerOptions, PacedRequester, ReqwestTransport,
    SystemClock, Transport,
};
use serde_json::json;
use store_module::open_store;
use tokio::task;
use tracing::{error, info};

use crate::config::StewardConfig;
use crate::dispatch::DispatchEngine;
use crate::registry::Registry;
use crate::runner::{start_tick_loop, HandleOutcome, RequesterFactory, Runner, RunnerSettings};
use crate::BoxError;

const MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<Runner>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", post(receive_webhook))
        .route("/webhook", post(receive_webhook))
        .route("/health", get(health))
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn receive_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    let Some(event_name) = header("x-github-event") else {
        return (StatusCode::BAD_REQUEST, Json(json!({"status": "missing_event"})));
    };
    let signature = header("x-hub-signature-256").or_else(|| header("x-hub-signature"));

    let payload = match state.runner.verify_payload(signature.as_deref(), &body) {
        Ok(payload) => payload,
        Err(err) => {
            let status =
                StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, Json(json!({"status": err.reason()})));
        }
    };

    let runner = state.runner.clone();
    let outcome =
        task::spawn_blocking(move || runner.handle_payload(&event_name, payload)).await;
    match outcome {
        Ok(Ok(outcome)) => {
            let status = match outcome {
                HandleOutcome::QueueFull => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::OK,
            };
            (status, Json(json!({"status": outcome.status()})))
        }
        Ok(Err(err)) => {
            error!("failed to handle payload: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "runner_error"})),
            )
        }
        Err(err) => {
            error!("payload handler task failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"status": "runner_error"})),
            )
        }
    }
}

/// Wires the store, API gateway, registry and runner together and serves
/// webhooks until `shutdown` resolves.
pub async fn run_server(
    config: StewardConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), BoxError> {
    let host: std::net::IpAddr = config
        .host
        .parse()
        .map_err(|_| format!("invalid host: {}", config.host))?;
    let addr = SocketAddr::new(host, config.port);
    let tick_interval = config.tick_interval;

    // The blocking HTTP client must be built and dropped off the async threads.
    let runner = task::spawn_blocking(move || build_runner(&config))
        .await
        .map_err(|err| -> BoxError { err.into() })??;
    let mut tick_control = start_tick_loop(runner.clone(), tick_interval);

    let app = router(AppState {
        runner: runner.clone(),
    });
    let serve_result = async {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("steward listening on {}", addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok::<(), BoxError>(())
    }
    .await;

    task::spawn_blocking(move || {
        tick_control.stop_and_join();
        runner.shutdown();
    })
    .await
    .map_err(|err| -> BoxError { err.into() })?;
    serve_result
}

fn build_runner(config: &StewardConfig) -> Result<Arc<Runner>, BoxError> {
    let store = open_store(&config.store)?;
    let credentials = Arc::new(AppCredentials::from_pem(
        config.integration_id.clone(),
        &config.pem_key,
    )?);
    let transport: Arc<dyn Transport> = Arc::new(ReqwestTransport::new(config.request_timeout)?);
    let options = ManagerOptions {
        base_url: config.api_base_url.clone(),
        user_agent: config.name.clone(),
    };
    let requesters: RequesterFactory = Arc::new(move |installation| {
        Arc::new(InstallationManager::new(
            installation,
            credentials.clone(),
            options.clone(),
            transport.clone(),
            Arc::new(SystemClock),
        )) as Arc<dyn PacedRequester>
    });

    let registry = Arc::new(Registry::from_config(&config.automations)?);
    let engine = Arc::new(DispatchEngine::new(registry, config.partial_failure));
    let runner = Arc::new(Runner::new(
        RunnerSettings::from_config(config),
        store,
        engine,
        requesters,
    ));
    runner.bootstrap()?;
    Ok(runner)
}
