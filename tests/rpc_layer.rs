mod common;

use std::convert::Infallible;
use std::future::{ready, Ready};
use std::net::SocketAddr;
use std::task::{Context, Poll};

use axum::http::{self, HeaderValue};
use axum::BoxError;
use common::{state_with, test_config, ScriptedOracle};
use tonic::body::{empty_body, BoxBody};
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic::transport::server::TcpConnectInfo;
use tonic::{Code, Status};
use tower::{Service, ServiceBuilder, ServiceExt};
use turnstile::authz::OracleError;
use turnstile::context::{RequestContext, Transport};
use turnstile::outcome::OutcomeClass;
use turnstile::{build_state, AppState};

const SAY_HELLO: &str = "/adhoc.v1.AdhocService/SayHello";
const MISSING: &str = "/adhoc.v1.AdhocService/Missing";

/// Minimal generated-style service: answers `SayHello` with the caller's
/// subject and `NotFound` for anything else.
#[derive(Clone)]
struct Greeter;

impl NamedService for Greeter {
    const NAME: &'static str = "adhoc.v1.AdhocService";
}

impl Service<http::Request<BoxBody>> for Greeter {
    type Response = http::Response<BoxBody>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Infallible>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Infallible>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<BoxBody>) -> Self::Future {
        if req.uri().path() != SAY_HELLO {
            return ready(Ok(Status::not_found("no such greeting").into_http()));
        }
        let subject = req
            .extensions()
            .get::<RequestContext>()
            .and_then(|ctx| ctx.subject())
            .map(|s| s.to_string())
            .unwrap_or_default();
        let mut response = http::Response::new(empty_body());
        let headers = response.headers_mut();
        headers.insert("content-type", HeaderValue::from_static("application/grpc"));
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        headers.insert("x-subject", HeaderValue::from_str(&subject).unwrap());
        ready(Ok(response))
    }
}

fn server(
    state: &AppState,
) -> impl Service<http::Request<BoxBody>, Response = http::Response<BoxBody>, Error = BoxError> + Clone
{
    ServiceBuilder::new()
        .layer(state.rpc_layer())
        .service(Routes::new(Greeter))
}

fn call(path: &str, client_ip: &str, user: Option<&str>) -> http::Request<BoxBody> {
    let mut builder = http::Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/grpc")
        .header("x-forwarded-for", client_ip);
    if let Some(user) = user {
        builder = builder.header("user-id", user);
    }
    builder.body(empty_body()).unwrap()
}

fn code_of(response: &http::Response<BoxBody>) -> Code {
    Status::from_header_map(response.headers())
        .map(|status| status.code())
        .unwrap_or(Code::Ok)
}

#[tokio::test]
async fn identified_call_reaches_service_with_context() {
    let state = state_with(5, ScriptedOracle::allowing());
    let resp = server(&state)
        .oneshot(call(SAY_HELLO, "10.6.0.1", Some("alice")))
        .await
        .unwrap();
    assert_eq!(code_of(&resp), Code::Ok);
    assert_eq!(resp.headers()["x-subject"], "alice");
    assert_eq!(
        state
            .prometheus
            .requests_total(Transport::Rpc, SAY_HELLO, OutcomeClass::Success),
        1
    );
}

#[tokio::test]
async fn missing_user_id_is_unauthenticated() {
    let oracle = ScriptedOracle::allowing();
    let state = state_with(5, oracle.clone());
    let resp = server(&state)
        .oneshot(call(SAY_HELLO, "10.6.0.2", None))
        .await
        .unwrap();
    assert_eq!(code_of(&resp), Code::Unauthenticated);
    assert_eq!(oracle.calls(), 0);
}

#[tokio::test]
async fn oracle_outcomes_map_to_codes() {
    let denied = state_with(5, ScriptedOracle::denying());
    let resp = server(&denied)
        .oneshot(call(SAY_HELLO, "10.6.0.3", Some("eve")))
        .await
        .unwrap();
    assert_eq!(code_of(&resp), Code::PermissionDenied);

    let broken = state_with(5, ScriptedOracle::failing(OracleError::Timeout));
    let resp = server(&broken)
        .oneshot(call(SAY_HELLO, "10.6.0.3", Some("eve")))
        .await
        .unwrap();
    assert_eq!(code_of(&resp), Code::Unavailable);
}

#[tokio::test]
async fn quota_exhaustion_is_resource_exhausted() {
    let state = state_with(1, ScriptedOracle::allowing());
    let svc = server(&state);
    let first = svc
        .clone()
        .oneshot(call(SAY_HELLO, "10.6.0.4", Some("alice")))
        .await
        .unwrap();
    assert_eq!(code_of(&first), Code::Ok);
    let second = svc
        .oneshot(call(SAY_HELLO, "10.6.0.4", Some("alice")))
        .await
        .unwrap();
    assert_eq!(code_of(&second), Code::ResourceExhausted);
}

#[tokio::test]
async fn service_errors_pass_through_and_count_as_handler_errors() {
    let state = state_with(5, ScriptedOracle::allowing());
    let resp = server(&state)
        .oneshot(call(MISSING, "10.6.0.5", Some("alice")))
        .await
        .unwrap();
    let status = Status::from_header_map(resp.headers()).unwrap();
    assert_eq!(status.code(), Code::NotFound);
    assert_eq!(status.message(), "no such greeting");
    assert_eq!(
        state
            .prometheus
            .requests_total(Transport::Rpc, MISSING, OutcomeClass::HandlerError),
        1
    );
}

#[tokio::test]
async fn connection_peer_keys_admission_when_forwarding_untrusted() {
    let mut config = test_config(1);
    config.trust_forwarded = false;
    let state = build_state(&config, ScriptedOracle::allowing()).unwrap();
    let svc = server(&state);
    let from = |peer: &str, spoofed: &str| {
        let mut req = call(SAY_HELLO, spoofed, Some("alice"));
        req.extensions_mut().insert(TcpConnectInfo {
            local_addr: None,
            remote_addr: Some(peer.parse::<SocketAddr>().unwrap()),
        });
        req
    };

    let first = svc.clone().oneshot(from("192.0.2.1:5000", "10.6.0.6")).await.unwrap();
    assert_eq!(code_of(&first), Code::Ok);
    // A different forwarded address does not buy a fresh quota.
    let same_peer = svc.clone().oneshot(from("192.0.2.1:5001", "10.6.0.7")).await.unwrap();
    assert_eq!(code_of(&same_peer), Code::ResourceExhausted);
    let other_peer = svc.oneshot(from("192.0.2.2:5000", "10.6.0.6")).await.unwrap();
    assert_eq!(code_of(&other_peer), Code::Ok);
}
