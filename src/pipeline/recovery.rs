//! Panic isolation and guaranteed outcome recording.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::context::Transport;
use crate::metrics::{MetricsRecorder, Observation};
use crate::outcome::{Fault, OutcomeClass};

/// Turn a panic payload into a [`Fault`].
pub(crate) fn fault_from_panic(payload: Box<dyn Any + Send>) -> Fault {
    let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    };
    Fault { message }
}

/// A request in flight.  Exactly one observation is recorded per guard:
/// by [`finish`](Self::finish) on normal completion, or by `Drop` with the
/// `canceled` class when the request future is dropped before completing.
pub(crate) struct InFlight<'a> {
    recorder: &'a dyn MetricsRecorder,
    transport: Transport,
    method: &'a str,
    received: DateTime<Utc>,
    started: Instant,
    cancel: CancellationToken,
    finished: bool,
}

impl<'a> InFlight<'a> {
    pub(crate) fn arm(
        recorder: &'a dyn MetricsRecorder,
        transport: Transport,
        method: &'a str,
        received: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            recorder,
            transport,
            method,
            received,
            started: Instant::now(),
            cancel,
            finished: false,
        }
    }

    pub(crate) fn finish(mut self, outcome: OutcomeClass) {
        self.finished = true;
        self.record(outcome);
    }

    fn record(&self, outcome: OutcomeClass) {
        let observation = Observation {
            transport: self.transport,
            method: self.method,
            outcome,
            latency: self.started.elapsed(),
            received: self.received,
        };
        // A broken recorder must not change the request's outcome.
        if panic::catch_unwind(AssertUnwindSafe(|| self.recorder.observe(&observation))).is_err() {
            tracing::warn!(
                transport = %self.transport,
                method = %self.method,
                "metrics recorder panicked; observation dropped"
            );
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Caller went away mid-pipeline: stop any work tied to the context.
        self.cancel.cancel();
        tracing::debug!(transport = %self.transport, method = %self.method, "request dropped before completion");
        self.record(OutcomeClass::Canceled);
    }
}
