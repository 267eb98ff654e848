#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use turnstile::authz::{AuthorizationOracle, OracleError};
use turnstile::{build_state, AppConfig, AppState};

/// Tracks environment variable mutations and restores originals on drop.
pub struct EnvGuard {
    originals: HashMap<String, Option<String>>,
}

impl EnvGuard {
    pub fn new() -> Self {
        Self {
            originals: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.capture(key);
        std::env::set_var(key, value);
    }

    pub fn remove(&mut self, key: &str) {
        self.capture(key);
        std::env::remove_var(key);
    }

    fn capture(&mut self, key: &str) {
        if self.originals.contains_key(key) {
            return;
        }
        let original = std::env::var(key).ok();
        self.originals.insert(key.to_string(), original);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

/// Oracle with a fixed answer that counts how often it is consulted.
pub struct ScriptedOracle {
    answer: Result<bool, OracleError>,
    calls: AtomicUsize,
}

impl ScriptedOracle {
    pub fn allowing() -> Arc<Self> {
        Self::answering(Ok(true))
    }

    pub fn denying() -> Arc<Self> {
        Self::answering(Ok(false))
    }

    pub fn failing(err: OracleError) -> Arc<Self> {
        Self::answering(Err(err))
    }

    fn answering(answer: Result<bool, OracleError>) -> Arc<Self> {
        Arc::new(Self {
            answer,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AuthorizationOracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn check_permission(&self, _: &str, _: &str, _: &str) -> Result<bool, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer.clone()
    }
}

/// Config with a small quota and forwarded headers trusted, so each test can
/// pick its own client key.
pub fn test_config(limit: usize) -> AppConfig {
    AppConfig {
        rate_limit: limit,
        rate_window: Duration::from_secs(60),
        trust_forwarded: true,
        ..AppConfig::default()
    }
}

pub fn state_with(limit: usize, oracle: Arc<ScriptedOracle>) -> AppState {
    build_state(&test_config(limit), oracle).unwrap()
}

/// Serve `app` on an ephemeral port with peer addresses available.
pub async fn spawn(app: Router) -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    (format!("http://{}", addr), handle)
}
