//! The transport-agnostic request pipeline.
//!
//! Stage order is fixed and total:
//!
//! 1. recovery guard: panics anywhere below become a `Faulted` outcome;
//! 2. metrics timing: exactly one observation per request, whatever happens;
//! 3. admission: sliding-window quota keyed on the client address;
//! 4. authorization: oracle check keyed on the caller subject;
//! 5. the terminal handler.
//!
//! Admission runs before authorization so over-quota traffic never costs an
//! oracle round trip.  The transports only differ at the boundary: `http`
//! and `rpc` decode the identity and client key and encode the outcome.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;

use crate::admission::AdmissionController;
use crate::authz::{PermissionChecker, PolicyDecision};
use crate::context::RequestContext;
use crate::metrics::MetricsRecorder;
use crate::outcome::{PipelineOutcome, Rejection, StageKind};

pub mod http;
mod recovery;
pub mod rpc;

use self::recovery::{fault_from_panic, InFlight};

/// A gate stage.  Returning `Err` short-circuits the pipeline.
#[async_trait::async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;
    async fn check(&self, ctx: &RequestContext) -> Result<(), Rejection>;
}

pub struct AdmissionStage {
    controller: Arc<AdmissionController>,
}

#[async_trait::async_trait]
impl Stage for AdmissionStage {
    fn kind(&self) -> StageKind {
        StageKind::Admission
    }

    async fn check(&self, ctx: &RequestContext) -> Result<(), Rejection> {
        let admission = self.controller.admit(ctx.client_key(), ctx.received_at());
        if admission.admitted {
            Ok(())
        } else {
            Err(Rejection::RateLimited {
                retry_after: admission.retry_after,
            })
        }
    }
}

pub struct AuthorizationStage {
    checker: PermissionChecker,
}

#[async_trait::async_trait]
impl Stage for AuthorizationStage {
    fn kind(&self) -> StageKind {
        StageKind::Authorization
    }

    async fn check(&self, ctx: &RequestContext) -> Result<(), Rejection> {
        let Some(subject) = ctx.subject() else {
            return Err(Rejection::Unauthenticated);
        };
        let transport = ctx.transport();
        match self
            .checker
            .decide(subject.as_str(), transport.resource(), transport.action())
            .await
        {
            PolicyDecision::Allowed => Ok(()),
            PolicyDecision::Denied(reason) => Err(Rejection::PermissionDenied { reason }),
            PolicyDecision::CheckFailed(err) => Err(Rejection::AuthorizationUnavailable(err)),
        }
    }
}

pub struct Pipeline {
    admission: Arc<AdmissionController>,
    stages: Vec<Box<dyn Stage>>,
    recorder: Arc<dyn MetricsRecorder>,
}

impl Pipeline {
    pub fn new(
        admission: Arc<AdmissionController>,
        checker: PermissionChecker,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Self {
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(AdmissionStage {
                controller: admission.clone(),
            }),
            Box::new(AuthorizationStage { checker }),
        ];
        Self {
            admission,
            stages,
            recorder,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Stage kinds in execution order.
    pub fn stage_order(&self) -> Vec<StageKind> {
        self.stages.iter().map(|s| s.kind()).collect()
    }

    /// Run one request through every stage and, if all pass, `handler`.
    ///
    /// Always resolves to exactly one outcome and records exactly one
    /// observation.  If the returned future is dropped early, the in-flight
    /// guard records `canceled` and cancels the context's token.
    pub async fn run<R, E, F, Fut>(&self, ctx: RequestContext, handler: F) -> PipelineOutcome<R, E>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let transport = ctx.transport();
        let method = ctx.method().to_owned();
        let client_key = ctx.client_key().to_owned();
        let subject = ctx.subject().map(|s| s.to_string());
        let cancel = ctx.cancellation().clone();

        let flight = InFlight::arm(
            self.recorder.as_ref(),
            transport,
            &method,
            ctx.received_wall(),
            cancel.clone(),
        );
        let guarded = AssertUnwindSafe(self.gate_then_call(ctx, handler)).catch_unwind();
        let outcome = tokio::select! {
            biased;
            result = guarded => match result {
                Ok(outcome) => outcome,
                Err(payload) => {
                    let fault = fault_from_panic(payload);
                    tracing::error!(
                        transport = %transport,
                        method = %method,
                        client_key = %client_key,
                        subject = ?subject,
                        panic = %fault.message,
                        "panic recovered in request pipeline"
                    );
                    PipelineOutcome::Faulted(fault)
                }
            },
            _ = cancel.cancelled() => PipelineOutcome::Canceled,
        };
        flight.finish(outcome.class());
        outcome
    }

    async fn gate_then_call<R, E, F, Fut>(&self, ctx: RequestContext, handler: F) -> PipelineOutcome<R, E>
    where
        F: FnOnce(RequestContext) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        for stage in &self.stages {
            if ctx.is_cancelled() {
                return PipelineOutcome::Canceled;
            }
            if let Err(rejection) = stage.check(&ctx).await {
                tracing::debug!(
                    stage = stage.kind().as_str(),
                    transport = %ctx.transport(),
                    method = %ctx.method(),
                    client_key = %ctx.client_key(),
                    reason = %rejection,
                    "request rejected"
                );
                return PipelineOutcome::Rejected(rejection);
            }
        }
        if ctx.is_cancelled() {
            return PipelineOutcome::Canceled;
        }
        match handler(ctx).await {
            Ok(response) => PipelineOutcome::Success(response),
            Err(err) => PipelineOutcome::HandlerFailed(err),
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("admission", &self.admission)
            .field("stages", &self.stage_order())
            .finish()
    }
}
