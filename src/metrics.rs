//! Request metrics.
//!
//! The pipeline reports one [`Observation`] per request to a
//! [`MetricsRecorder`].  Recorders are side-effect only: nothing they return
//! is consulted, and the pipeline contains panics raised inside them.

use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::context::Transport;
use crate::outcome::OutcomeClass;

/// Latency histogram bucket upper bounds in milliseconds.
pub const LATENCY_BUCKETS_MS: [u64; 11] = [1, 2, 5, 10, 20, 50, 100, 200, 500, 1000, 2000];

#[derive(Clone, Debug)]
pub struct Observation<'a> {
    pub transport: Transport,
    pub method: &'a str,
    pub outcome: OutcomeClass,
    pub latency: Duration,
    /// Wall-clock time the request arrived.
    pub received: DateTime<Utc>,
}

pub trait MetricsRecorder: Send + Sync {
    fn observe(&self, observation: &Observation<'_>);
}

/// Fans a single observation out to several recorders in order.
#[derive(Clone, Default)]
pub struct Recorders {
    recorders: Vec<Arc<dyn MetricsRecorder>>,
}

impl Recorders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, recorder: Arc<dyn MetricsRecorder>) -> Self {
        self.recorders.push(recorder);
        self
    }
}

impl MetricsRecorder for Recorders {
    /// A panicking recorder loses this observation; the rest still see it.
    fn observe(&self, observation: &Observation<'_>) {
        for (idx, recorder) in self.recorders.iter().enumerate() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| recorder.observe(observation)));
            if result.is_err() {
                tracing::warn!(
                    recorder = idx,
                    method = %observation.method,
                    "Metrics recorder panicked; observation dropped for it"
                );
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct SeriesKey {
    transport: Transport,
    method: String,
    outcome: OutcomeClass,
}

struct Histogram {
    counts: Vec<AtomicU64>,
    sum_ms: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            counts: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    fn record(&self, latency_ms: u64) {
        self.sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        // find first bucket >= value
        for (idx, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
            if latency_ms <= *ub {
                self.counts[idx].fetch_add(1, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// In-memory recorder rendered in the Prometheus text format by `/metrics`.
pub struct PrometheusRecorder {
    requests: DashMap<SeriesKey, AtomicU64>,
    latency: DashMap<Transport, Histogram>,
    process_start_epoch: f64,
    process_start_instant: Instant,
}

impl Default for PrometheusRecorder {
    fn default() -> Self {
        Self::new()
    }
}

impl PrometheusRecorder {
    pub fn new() -> Self {
        let start_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            requests: DashMap::new(),
            latency: DashMap::new(),
            process_start_epoch: start_time.as_secs_f64(),
            process_start_instant: Instant::now(),
        }
    }

    /// Requests observed for one (transport, method, outcome) series.
    pub fn requests_total(&self, transport: Transport, method: &str, outcome: OutcomeClass) -> u64 {
        let key = SeriesKey {
            transport,
            method: method.to_string(),
            outcome,
        };
        self.requests
            .get(&key)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Requests observed across every series.
    pub fn observations_total(&self) -> u64 {
        self.requests
            .iter()
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Requests observed with the given outcome, across transports and methods.
    pub fn outcome_total(&self, outcome: OutcomeClass) -> u64 {
        self.requests
            .iter()
            .filter(|entry| entry.key().outcome == outcome)
            .map(|entry| entry.value().load(Ordering::Relaxed))
            .sum()
    }

    /// Prometheus text exposition.  `tracked_clients` is the admission
    /// controller's current key count.
    pub fn render(&self, tracked_clients: usize) -> String {
        let mut buf = String::new();
        writeln!(
            &mut buf,
            "# HELP turnstile_requests_total Requests completed by transport, method and outcome"
        )
        .ok();
        writeln!(&mut buf, "# TYPE turnstile_requests_total counter").ok();
        let mut series: Vec<(SeriesKey, u64)> = self
            .requests
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        series.sort_by(|a, b| {
            (a.0.transport.as_str(), &a.0.method, a.0.outcome.as_str())
                .cmp(&(b.0.transport.as_str(), &b.0.method, b.0.outcome.as_str()))
        });
        for (key, value) in series {
            writeln!(
                &mut buf,
                "turnstile_requests_total{{transport=\"{}\",method=\"{}\",outcome=\"{}\"}} {}",
                key.transport,
                escape_label(&key.method),
                key.outcome,
                value
            )
            .ok();
        }

        writeln!(
            &mut buf,
            "# HELP turnstile_request_latency_ms Request latency histogram milliseconds\n# TYPE turnstile_request_latency_ms histogram"
        )
        .ok();
        for transport in [Transport::Rpc, Transport::Http] {
            let Some(hist) = self.latency.get(&transport) else {
                continue;
            };
            let mut cumulative: u64 = 0;
            for (i, ub) in LATENCY_BUCKETS_MS.iter().enumerate() {
                cumulative += hist.counts[i].load(Ordering::Relaxed);
                writeln!(
                    &mut buf,
                    "turnstile_request_latency_ms_bucket{{transport=\"{}\",le=\"{}\"}} {}",
                    transport, ub, cumulative
                )
                .ok();
            }
            let count = hist.count.load(Ordering::Relaxed);
            writeln!(
                &mut buf,
                "turnstile_request_latency_ms_bucket{{transport=\"{}\",le=\"+Inf\"}} {}",
                transport, count
            )
            .ok();
            writeln!(
                &mut buf,
                "turnstile_request_latency_ms_sum{{transport=\"{}\"}} {}",
                transport,
                hist.sum_ms.load(Ordering::Relaxed)
            )
            .ok();
            writeln!(
                &mut buf,
                "turnstile_request_latency_ms_count{{transport=\"{}\"}} {}",
                transport, count
            )
            .ok();
        }

        writeln!(
            &mut buf,
            "# HELP turnstile_admission_tracked_clients Client keys held by the admission controller\n# TYPE turnstile_admission_tracked_clients gauge"
        )
        .ok();
        writeln!(&mut buf, "turnstile_admission_tracked_clients {}", tracked_clients).ok();
        writeln!(
            &mut buf,
            "# HELP turnstile_build_info Build information\n# TYPE turnstile_build_info gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "turnstile_build_info{{version=\"{}\"}} 1",
            env!("CARGO_PKG_VERSION")
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP turnstile_process_start_time_seconds Process start time (Unix epoch seconds)\n# TYPE turnstile_process_start_time_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "turnstile_process_start_time_seconds {}",
            self.process_start_epoch
        )
        .ok();
        writeln!(
            &mut buf,
            "# HELP turnstile_process_uptime_seconds Process uptime seconds\n# TYPE turnstile_process_uptime_seconds gauge"
        )
        .ok();
        writeln!(
            &mut buf,
            "turnstile_process_uptime_seconds {}",
            self.process_start_instant.elapsed().as_secs_f64()
        )
        .ok();
        buf
    }
}

impl MetricsRecorder for PrometheusRecorder {
    fn observe(&self, observation: &Observation<'_>) {
        let key = SeriesKey {
            transport: observation.transport,
            method: observation.method.to_string(),
            outcome: observation.outcome,
        };
        self.requests
            .entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed);
        self.latency
            .entry(observation.transport)
            .or_insert_with(Histogram::new)
            .record(observation.latency.as_millis() as u64);
    }
}

/// Logs observations as structured events, optionally only every Nth one.
#[derive(Debug, Default)]
pub struct TracingRecorder {
    sample_n: Option<u64>,
    seen: AtomicU64,
}

impl TracingRecorder {
    /// `sample_n` of `None`, 0 or 1 logs every request.
    pub fn new(sample_n: Option<u64>) -> Self {
        Self {
            sample_n: sample_n.filter(|n| *n > 1),
            seen: AtomicU64::new(0),
        }
    }

    fn should_log(&self) -> bool {
        let seen = self.seen.fetch_add(1, Ordering::Relaxed);
        match self.sample_n {
            Some(n) => seen % n == 0,
            None => true,
        }
    }
}

impl MetricsRecorder for TracingRecorder {
    fn observe(&self, observation: &Observation<'_>) {
        if !self.should_log() {
            return;
        }
        tracing::info!(
            target: "turnstile::access",
            transport = %observation.transport,
            method = %observation.method,
            outcome = %observation.outcome,
            latency_ms = observation.latency.as_millis() as u64,
            "request completed"
        );
    }
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}
