//! Sliding-window admission control.
//!
//! Each client key owns a queue of the instants at which its requests were
//! admitted.  On every call the queue is pruned of entries that have slid out
//! of the trailing window; the request is admitted only if fewer than `limit`
//! entries remain.  Pruning is lazy: a key whose history has fully expired
//! keeps its (empty) slot until the client shows up again.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use ahash::AHashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdmissionConfigError {
    #[error("admission limit must be greater than zero")]
    ZeroLimit,
    #[error("admission window must be greater than zero")]
    ZeroWindow,
}

/// Result of a single admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Admission {
    pub admitted: bool,
    /// Slots left in the window after this decision.
    pub remaining: usize,
    /// On rejection, how long until the oldest admitted entry expires.
    pub retry_after: Option<Duration>,
}

#[derive(Debug)]
pub struct AdmissionController {
    limit: usize,
    window: Duration,
    clients: Mutex<AHashMap<String, VecDeque<Instant>>>,
}

impl AdmissionController {
    pub fn new(limit: usize, window: Duration) -> Result<Self, AdmissionConfigError> {
        if limit == 0 {
            return Err(AdmissionConfigError::ZeroLimit);
        }
        if window.is_zero() {
            return Err(AdmissionConfigError::ZeroWindow);
        }
        Ok(Self {
            limit,
            window,
            clients: Mutex::new(AHashMap::new()),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Check and, if admitted, record a request from `client_key` at `now`.
    ///
    /// Prune, count and append happen under one lock acquisition, so two
    /// concurrent requests from the same key can never both take the last slot.
    pub fn admit(&self, client_key: &str, now: Instant) -> Admission {
        // Every mutation leaves the map consistent, so a poisoned lock is safe to reuse.
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        let window = clients.entry(client_key.to_owned()).or_default();

        while let Some(oldest) = window.front() {
            if now.saturating_duration_since(*oldest) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() < self.limit {
            // Keep the queue non-decreasing even if callers race on `now`.
            let stamp = match window.back() {
                Some(last) if *last > now => *last,
                _ => now,
            };
            window.push_back(stamp);
            Admission {
                admitted: true,
                remaining: self.limit - window.len(),
                retry_after: None,
            }
        } else {
            let retry_after = window
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now));
            Admission {
                admitted: false,
                remaining: 0,
                retry_after,
            }
        }
    }

    /// Number of client keys currently holding a slot in the map.
    pub fn tracked_clients(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Admitted entries still inside the window for `client_key` as of `now`.
    /// Does not prune.
    pub fn in_window(&self, client_key: &str, now: Instant) -> usize {
        let clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        clients
            .get(client_key)
            .map(|window| {
                window
                    .iter()
                    .filter(|t| now.saturating_duration_since(**t) <= self.window)
                    .count()
            })
            .unwrap_or(0)
    }
}
