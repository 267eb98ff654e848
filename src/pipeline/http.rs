//! axum binding for the pipeline.
//!
//! [`gate`] is a `from_fn_with_state` middleware: it builds a
//! [`RequestContext`] from the request, runs the pipeline with the rest of the
//! router as the terminal handler, and renders rejections as JSON error
//! bodies.  Downstream handlers can read the context through
//! `Extension<RequestContext>`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, MatchedPath, Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::Pipeline;
use crate::context::{resolve_client_key, RequestContext, Subject, Transport, HTTP_IDENTITY_HEADER};
use crate::outcome::{Fault, OutcomeClass, PipelineOutcome, Rejection};

/// JSON body returned for every response the pipeline produces itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    pub http_status: u16,
}

impl ErrorResponse {
    fn new(class: OutcomeClass, message: impl Into<String>) -> Self {
        Self {
            code: class.machine_code().to_string(),
            message: message.into(),
            http_status: class.http_status().as_u16(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.http_status)
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self)).into_response()
    }
}

/// Middleware state: the shared pipeline plus how to derive client keys.
#[derive(Clone)]
pub struct HttpGate {
    pipeline: Arc<Pipeline>,
    trust_forwarded: bool,
}

impl HttpGate {
    pub fn new(pipeline: Arc<Pipeline>, trust_forwarded: bool) -> Self {
        Self {
            pipeline,
            trust_forwarded,
        }
    }

    fn context_for(&self, req: &Request) -> RequestContext {
        let path = req
            .extensions()
            .get::<MatchedPath>()
            .map(|p| p.as_str().to_owned())
            .unwrap_or_else(|| req.uri().path().to_owned());
        let method = format!("{} {}", req.method(), path);

        let headers = req.headers();
        let peer = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        let client_key = resolve_client_key(
            header_str(headers, "x-forwarded-for"),
            header_str(headers, "x-real-ip"),
            peer,
            self.trust_forwarded,
        );
        let subject = header_str(headers, HTTP_IDENTITY_HEADER).and_then(Subject::parse);

        RequestContext::new(Transport::Http, method, client_key).with_subject(subject)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Run the request through the pipeline.  Handler responses with a 4xx/5xx
/// status count as handler errors in metrics but reach the client unchanged.
pub async fn gate(State(gate): State<HttpGate>, req: Request, next: Next) -> Response {
    let ctx = gate.context_for(&req);
    let outcome = gate
        .pipeline
        .run(ctx, move |ctx| async move {
            let mut req = req;
            req.extensions_mut().insert(ctx);
            let response = next.run(req).await;
            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                Err(response)
            } else {
                Ok(response)
            }
        })
        .await;
    render(outcome)
}

fn render(outcome: PipelineOutcome<Response, Response>) -> Response {
    match outcome {
        PipelineOutcome::Success(response) | PipelineOutcome::HandlerFailed(response) => response,
        PipelineOutcome::Rejected(rejection) => rejection_response(&rejection),
        PipelineOutcome::Faulted(_) => {
            ErrorResponse::new(OutcomeClass::Fault, Fault::PUBLIC_MESSAGE).into_response()
        }
        PipelineOutcome::Canceled => {
            ErrorResponse::new(OutcomeClass::Canceled, "request canceled").into_response()
        }
    }
}

fn rejection_response(rejection: &Rejection) -> Response {
    let mut response = ErrorResponse::new(rejection.class(), rejection.to_string()).into_response();
    if let Rejection::RateLimited {
        retry_after: Some(wait),
    } = rejection
    {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs(*wait)));
    }
    response
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

/// Put every route of `router` and its fallback behind the gate.  Requests
/// for unknown paths spend quota like any other request.
///
/// When the guarded router is merged into another one, give it an explicit
/// `fallback` first: `Router::merge` keeps a custom fallback but replaces a
/// default one with the outer router's ungated default.
pub fn guard_router<S>(router: Router<S>, gate_state: HttpGate) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router.layer(middleware::from_fn_with_state(gate_state, gate))
}
