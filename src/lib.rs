//! Turnstile: one request pipeline shared by an RPC service and an HTTP API.
//!
//! Every request, whichever transport it arrives on, passes the same ordered
//! stages: panic recovery, metrics timing, sliding-window admission control
//! keyed on the client address, and authorization against an external
//! oracle keyed on the caller identity.  The transports only differ in how
//! they read identity and how they encode the outcome; see
//! [`pipeline::http`] and [`pipeline::rpc`].

pub mod admission;
pub mod authz;
mod config;
pub mod context;
pub mod metrics;
pub mod outcome;
pub mod pipeline;
pub mod telemetry;

pub use config::AppConfig;

use std::sync::Arc;

use anyhow::Context as _;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionController;
use crate::authz::{AuthorizationOracle, HttpOracle, PermissionChecker, StaticOracle};
use crate::context::RequestContext;
use crate::metrics::{PrometheusRecorder, Recorders, TracingRecorder};
use crate::pipeline::http::{guard_router, HttpGate};
use crate::pipeline::rpc::{RpcInterceptor, RpcLayer};
use crate::pipeline::Pipeline;
use crate::telemetry::ObservationLog;

/// Shared application state.  Cheap to clone; everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub prometheus: Arc<PrometheusRecorder>,
    pub observation_log: ObservationLog,
    pub trust_forwarded: bool,
    pub max_request_bytes: usize,
}

impl AppState {
    pub fn http_gate(&self) -> HttpGate {
        HttpGate::new(self.pipeline.clone(), self.trust_forwarded)
    }

    pub fn rpc_interceptor(&self) -> RpcInterceptor {
        RpcInterceptor::new(self.pipeline.clone(), self.trust_forwarded)
    }

    /// Tower layer for `tonic::transport::Server::builder().layer(..)`.
    pub fn rpc_layer(&self) -> RpcLayer {
        RpcLayer::new(self.pipeline.clone(), self.trust_forwarded)
    }
}

/// Assemble the pipeline from a parsed configuration and an oracle.
pub fn build_state(
    config: &AppConfig,
    oracle: Arc<dyn AuthorizationOracle>,
) -> anyhow::Result<AppState> {
    let admission = AdmissionController::new(config.rate_limit, config.rate_window)
        .context("invalid admission quota")?;

    let prometheus = Arc::new(PrometheusRecorder::new());
    let observation_log =
        ObservationLog::from_path(config.log_file.as_deref(), config.rotation.clone());
    let mut recorders = Recorders::new()
        .with(prometheus.clone())
        .with(Arc::new(observation_log.clone()));
    if config.log_stdout {
        recorders = recorders.with(Arc::new(TracingRecorder::new(config.log_sample_n)));
    }

    let checker = PermissionChecker::new(oracle);
    tracing::info!(
        limit = config.rate_limit,
        window_ms = config.rate_window.as_millis() as u64,
        oracle = checker.oracle_name(),
        trust_forwarded = config.trust_forwarded,
        access_log = config.log_stdout,
        "request pipeline ready"
    );

    let pipeline = Pipeline::new(Arc::new(admission), checker, Arc::new(recorders));
    Ok(AppState {
        pipeline: Arc::new(pipeline),
        prometheus,
        observation_log,
        trust_forwarded: config.trust_forwarded,
        max_request_bytes: config.max_request_bytes,
    })
}

/// Build state from environment variables: an [`HttpOracle`] when
/// `TURNSTILE_AUTHZ_CONFIG` is set, the [`StaticOracle`] otherwise.
pub async fn build_state_from_env() -> anyhow::Result<AppState> {
    let config = AppConfig::from_env()?;
    let oracle: Arc<dyn AuthorizationOracle> = match config.authz.clone() {
        Some(def) => Arc::new(
            HttpOracle::new(def).context("failed to construct HTTP authorization oracle")?,
        ),
        None => match config.allowed_subjects.clone() {
            Some(allowed) => Arc::new(StaticOracle::with_allowlist(allowed)),
            None => {
                tracing::warn!("no TURNSTILE_AUTHZ_CONFIG; every identified caller is allowed");
                Arc::new(StaticOracle::allow_all())
            }
        },
    };
    build_state(&config, oracle)
}

/// Build the router.  Business routes and every unmatched path sit behind
/// the gate; `/healthz` and `/metrics` do not.
pub fn app(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/v1/hello", post(hello_handler))
        .fallback(not_found_handler);
    let api = guard_router(api, state.http_gate());

    Router::new()
        .merge(api)
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(DefaultBodyLimit::max(state.max_request_bytes))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct HelloRequest {
    #[serde(default)]
    name: String,
}

/// Success envelope used by the API routes.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HelloReply {
    pub message: String,
}

fn api_error(status: StatusCode, msg: String) -> Response {
    let body: ApiResponse<HelloReply> = ApiResponse {
        code: status.as_u16() as i32,
        msg,
        data: None,
    };
    (status, Json(body)).into_response()
}

async fn hello_handler(
    Extension(ctx): Extension<RequestContext>,
    payload: Result<Json<HelloRequest>, JsonRejection>,
) -> Response {
    let req = match payload {
        Ok(Json(req)) => req,
        Err(rejection) => {
            return api_error(
                StatusCode::BAD_REQUEST,
                format!("invalid request: {}", rejection.body_text()),
            )
        }
    };
    let name = req.name.trim();
    if name.is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "invalid request: name is required".into());
    }
    let subject = ctx.subject().map(|s| s.as_str()).unwrap_or_default();
    tracing::info!(name = %name, subject = %subject, "SayHello called");
    let body = ApiResponse {
        code: 0,
        msg: "success".into(),
        data: Some(HelloReply {
            message: format!("Hello, {}! Welcome to turnstile!", name),
        }),
    };
    (StatusCode::OK, Json(body)).into_response()
}

async fn not_found_handler(uri: axum::http::Uri) -> Response {
    api_error(StatusCode::NOT_FOUND, format!("no route for {}", uri.path()))
}

/// Simple health endpoint for container readiness / liveness checks.
async fn healthz_handler(State(state): State<AppState>) -> Response {
    let admission = state.pipeline.admission();
    let json = serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "rateLimit": admission.limit(),
        "rateWindowMs": admission.window().as_millis() as u64,
    });
    (StatusCode::OK, Json(json)).into_response()
}

/// Prometheus text exposition.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let mut body = state
        .prometheus
        .render(state.pipeline.admission().tracked_clients());
    use std::fmt::Write as _;
    writeln!(
        &mut body,
        "# HELP turnstile_observation_lines_total Observation log lines written\n# TYPE turnstile_observation_lines_total counter\nturnstile_observation_lines_total {}",
        state.observation_log.lines_total()
    )
    .ok();
    writeln!(
        &mut body,
        "# HELP turnstile_observation_write_errors_total Observation log write failures\n# TYPE turnstile_observation_write_errors_total counter\nturnstile_observation_write_errors_total {}",
        state.observation_log.write_errors_total()
    )
    .ok();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
        .into_response()
}
