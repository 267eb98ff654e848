//! Authorization for the gateway pipeline.
//!
//! The `PermissionChecker` sits in front of an external authorization oracle
//! and keeps two failure kinds strictly apart: the oracle saying *no*
//! (a legitimate denial) and the oracle being unreachable or broken (an
//! upstream error).  Transports map the former to a permission-denied status
//! and the latter to an unavailable one.

use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

pub mod http_oracle;
pub mod static_oracle;

pub use self::http_oracle::{HttpOracle, HttpOracleDefinition};
pub use self::static_oracle::StaticOracle;

/// Failure of the authorization system itself, as opposed to a denial.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OracleError {
    #[error("authorization oracle unreachable: {0}")]
    Transport(String),
    #[error("authorization oracle timed out")]
    Timeout,
    #[error("authorization oracle returned status {0}")]
    Status(u16),
    #[error("authorization oracle response invalid: {0}")]
    InvalidResponse(String),
    #[error("authorization request rejected by oracle: {0}")]
    InvalidRequest(String),
}

/// Capability to answer "may `subject` perform `action` on `resource`?".
#[async_trait::async_trait]
pub trait AuthorizationOracle: Send + Sync {
    fn name(&self) -> &str;
    async fn check_permission(
        &self,
        subject: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, OracleError>;
}

/// Outcome of one authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allowed,
    Denied(String),
    CheckFailed(OracleError),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessError {
    #[error("permission denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Upstream(#[from] OracleError),
}

/// Oracle calls slower than this are logged.
const SLOW_CHECK_MS: u128 = 250;

#[derive(Clone)]
pub struct PermissionChecker {
    oracle: Arc<dyn AuthorizationOracle>,
}

impl PermissionChecker {
    pub fn new(oracle: Arc<dyn AuthorizationOracle>) -> Self {
        Self { oracle }
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    /// Ask the oracle for a decision.  A blank subject is denied without
    /// consulting the oracle.
    pub async fn decide(&self, subject: &str, resource: &str, action: &str) -> PolicyDecision {
        if subject.trim().is_empty() {
            return PolicyDecision::Denied("missing subject identity".into());
        }
        let start = Instant::now();
        let result = self.oracle.check_permission(subject, resource, action).await;
        let elapsed_ms = start.elapsed().as_millis();
        if elapsed_ms > SLOW_CHECK_MS {
            tracing::warn!(
                oracle = %self.oracle.name(),
                elapsed_ms,
                "authorization check exceeded warn threshold"
            );
        }
        match result {
            Ok(true) => PolicyDecision::Allowed,
            Ok(false) => PolicyDecision::Denied(format!(
                "{} may not {} {}",
                subject, action, resource
            )),
            Err(err) => {
                tracing::warn!(oracle = %self.oracle.name(), error = %err, "authorization check failed");
                PolicyDecision::CheckFailed(err)
            }
        }
    }

    pub async fn check_access(
        &self,
        subject: &str,
        resource: &str,
        action: &str,
    ) -> Result<(), AccessError> {
        match self.decide(subject, resource, action).await {
            PolicyDecision::Allowed => Ok(()),
            PolicyDecision::Denied(reason) => Err(AccessError::Denied(reason)),
            PolicyDecision::CheckFailed(err) => Err(AccessError::Upstream(err)),
        }
    }
}

impl std::fmt::Debug for PermissionChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PermissionChecker")
            .field("oracle", &self.oracle.name())
            .finish()
    }
}
