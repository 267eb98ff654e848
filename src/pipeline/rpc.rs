//! tonic binding for the pipeline.
//!
//! There are two ways in.  [`RpcLayer`] wraps a whole server and gates every
//! method, reading the method from the request path:
//!
//! ```ignore
//! Server::builder()
//!     .layer(state.rpc_layer())
//!     .add_service(AdhocServiceServer::new(service))
//!     .serve(addr)
//!     .await?;
//! ```
//!
//! Services that want the gate on selected methods only call
//! [`RpcInterceptor::unary`] from those methods instead:
//!
//! ```ignore
//! async fn say_hello(&self, req: Request<HelloRequest>) -> Result<Response<HelloReply>, Status> {
//!     self.interceptor
//!         .unary("/adhoc.v1.AdhocService/SayHello", req, |req| async move { ... })
//!         .await
//! }
//! ```

use std::future::Future;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::{Bytes, HttpBody};
use axum::http::{self, HeaderMap};
use axum::BoxError;
use futures::future::BoxFuture;
use tonic::body::BoxBody;
use tonic::metadata::MetadataMap;
use tonic::transport::server::TcpConnectInfo;
use tonic::{Request, Response, Status};
use tower::{Layer, Service};

use super::Pipeline;
use crate::context::{resolve_client_key, RequestContext, Subject, Transport, RPC_IDENTITY_KEY};
use crate::outcome::{Fault, PipelineOutcome};

#[derive(Clone)]
pub struct RpcInterceptor {
    pipeline: Arc<Pipeline>,
    trust_forwarded: bool,
}

impl RpcInterceptor {
    pub fn new(pipeline: Arc<Pipeline>, trust_forwarded: bool) -> Self {
        Self {
            pipeline,
            trust_forwarded,
        }
    }

    fn context_for<T>(&self, method: &str, request: &Request<T>) -> RequestContext {
        let metadata = request.metadata();
        let client_key = resolve_client_key(
            metadata_str(metadata, "x-forwarded-for"),
            metadata_str(metadata, "x-real-ip"),
            request.remote_addr(),
            self.trust_forwarded,
        );
        let subject = metadata_str(metadata, RPC_IDENTITY_KEY).and_then(Subject::parse);
        RequestContext::new(Transport::Rpc, method, client_key).with_subject(subject)
    }

    /// Gate one unary call.  The handler sees the request with the
    /// [`RequestContext`] in its extensions; its own `Status` errors are
    /// returned unchanged.
    pub async fn unary<T, R, F, Fut>(
        &self,
        method: &str,
        request: Request<T>,
        handler: F,
    ) -> Result<Response<R>, Status>
    where
        F: FnOnce(Request<T>) -> Fut,
        Fut: Future<Output = Result<Response<R>, Status>>,
    {
        let ctx = self.context_for(method, &request);
        let outcome = self
            .pipeline
            .run(ctx, move |ctx| {
                let mut request = request;
                request.extensions_mut().insert(ctx);
                handler(request)
            })
            .await;
        handled(outcome).and_then(|result| result)
    }
}

fn metadata_str<'a>(metadata: &'a MetadataMap, key: &str) -> Option<&'a str> {
    metadata.get(key).and_then(|v| v.to_str().ok())
}

/// Separate what the handler produced from what the pipeline decided itself.
fn handled<R, E>(outcome: PipelineOutcome<R, E>) -> Result<Result<R, E>, Status> {
    match outcome {
        PipelineOutcome::Success(response) => Ok(Ok(response)),
        PipelineOutcome::HandlerFailed(err) => Ok(Err(err)),
        PipelineOutcome::Rejected(rejection) => Err(Status::new(
            rejection.class().rpc_code(),
            rejection.to_string(),
        )),
        PipelineOutcome::Faulted(_) => Err(Status::internal(Fault::PUBLIC_MESSAGE)),
        PipelineOutcome::Canceled => Err(Status::cancelled("request canceled")),
    }
}

/// Tower layer gating every call of a tonic server.
#[derive(Clone)]
pub struct RpcLayer {
    pipeline: Arc<Pipeline>,
    trust_forwarded: bool,
}

impl RpcLayer {
    pub fn new(pipeline: Arc<Pipeline>, trust_forwarded: bool) -> Self {
        Self {
            pipeline,
            trust_forwarded,
        }
    }
}

impl<S> Layer<S> for RpcLayer {
    type Service = RpcService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcService {
            inner,
            pipeline: self.pipeline.clone(),
            trust_forwarded: self.trust_forwarded,
        }
    }
}

#[derive(Clone)]
pub struct RpcService<S> {
    inner: S,
    pipeline: Arc<Pipeline>,
    trust_forwarded: bool,
}

impl<S> RpcService<S> {
    fn context_for<B>(&self, req: &http::Request<B>) -> RequestContext {
        let headers = req.headers();
        let peer = req
            .extensions()
            .get::<TcpConnectInfo>()
            .and_then(|info| info.remote_addr());
        let client_key = resolve_client_key(
            header_str(headers, "x-forwarded-for"),
            header_str(headers, "x-real-ip"),
            peer,
            self.trust_forwarded,
        );
        let subject = header_str(headers, RPC_IDENTITY_KEY).and_then(Subject::parse);
        RequestContext::new(Transport::Rpc, req.uri().path(), client_key).with_subject(subject)
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// A unary error is sent trailers-only, so its code is in the headers.
/// Errors raised mid-stream travel in trailers and are not seen here.
fn carries_error_status<B>(response: &http::Response<B>) -> bool {
    response
        .headers()
        .get("grpc-status")
        .is_some_and(|code| code.as_bytes() != b"0")
}

enum Failed<E, B> {
    Status(http::Response<B>),
    Inner(E),
}

impl<S, ReqBody, ResBody> Service<http::Request<ReqBody>> for RpcService<S>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: HttpBody<Data = Bytes> + Send + 'static,
    ResBody::Error: Into<BoxError>,
{
    type Response = http::Response<BoxBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: http::Request<ReqBody>) -> Self::Future {
        // Keep the instance that was driven to ready.
        let clone = self.inner.clone();
        let inner = std::mem::replace(&mut self.inner, clone);
        let pipeline = self.pipeline.clone();
        let ctx = self.context_for(&req);

        Box::pin(async move {
            let outcome = pipeline
                .run(ctx, move |ctx| async move {
                    let (mut req, mut inner) = (req, inner);
                    req.extensions_mut().insert(ctx);
                    match inner.call(req).await {
                        Ok(response) if carries_error_status(&response) => {
                            Err(Failed::Status(response))
                        }
                        Ok(response) => Ok(response),
                        Err(err) => Err(Failed::Inner(err)),
                    }
                })
                .await;
            match handled(outcome) {
                Ok(Ok(response)) | Ok(Err(Failed::Status(response))) => {
                    Ok(response.map(tonic::body::boxed))
                }
                Ok(Err(Failed::Inner(err))) => Err(err),
                Err(status) => Ok(status.into_http()),
            }
        })
    }
}
