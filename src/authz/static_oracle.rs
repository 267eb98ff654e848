use std::collections::HashSet;

use super::{AuthorizationOracle, OracleError};

/// In-process oracle for development and single-tenant deployments.  Any
/// non-empty subject is allowed unless an allowlist is configured, in which
/// case only listed subjects are.
#[derive(Debug, Clone, Default)]
pub struct StaticOracle {
    allowed: Option<HashSet<String>>,
}

impl StaticOracle {
    pub fn allow_all() -> Self {
        Self { allowed: None }
    }

    pub fn with_allowlist(allowed: HashSet<String>) -> Self {
        Self {
            allowed: Some(allowed),
        }
    }
}

#[async_trait::async_trait]
impl AuthorizationOracle for StaticOracle {
    fn name(&self) -> &str {
        "static"
    }

    async fn check_permission(
        &self,
        subject: &str,
        _resource: &str,
        _action: &str,
    ) -> Result<bool, OracleError> {
        if subject.is_empty() {
            return Err(OracleError::InvalidRequest("subject is required".into()));
        }
        Ok(match &self.allowed {
            Some(list) => list.contains(subject),
            None => true,
        })
    }
}
