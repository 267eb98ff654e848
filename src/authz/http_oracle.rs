use super::{AuthorizationOracle, OracleError};

/// Definition for a remote authorization service reached over HTTP.  Loaded
/// from the JSON file named by `TURNSTILE_AUTHZ_CONFIG`.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpOracleDefinition {
    #[serde(default = "http_oracle_default_name")]
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "http_oracle_default_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub request_template: Option<String>,
    /// Where the decision lives in the response: `allowed`/`allow` (true means
    /// permit), `denied`/`deny` (true means refuse) or a JSON pointer such as
    /// `/result/allow`.
    #[serde(default = "http_oracle_default_decision_field")]
    pub decision_field: String,
}

fn http_oracle_default_name() -> String {
    "http".to_string()
}
fn http_oracle_default_timeout() -> u64 {
    500
}
fn http_oracle_default_decision_field() -> String {
    "allowed".to_string()
}

/// Oracle that POSTs the (subject, resource, action) triple to an external
/// service and reads a boolean decision back.
pub struct HttpOracle {
    def: HttpOracleDefinition,
    client: reqwest::Client,
}

impl HttpOracle {
    pub fn new(def: HttpOracleDefinition) -> Result<Self, OracleError> {
        let timeout = std::time::Duration::from_millis(def.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| OracleError::Transport(err.to_string()))?;
        Ok(Self { def, client })
    }

    fn render_body(&self, subject: &str, resource: &str, action: &str) -> String {
        const DEFAULT_TEMPLATE: &str = r#"{
  "subject": "${subject}",
  "resource": "${resource}",
  "action": "${action}"
}"#;
        let template = self
            .def
            .request_template
            .as_deref()
            .unwrap_or(DEFAULT_TEMPLATE);
        template
            .replace("${subject}", &escape_json_string(subject))
            .replace("${resource}", &escape_json_string(resource))
            .replace("${action}", &escape_json_string(action))
    }

    fn extract_decision(&self, val: &serde_json::Value) -> Option<bool> {
        let field = self.def.decision_field.as_str();
        match field {
            "allowed" | "allow" => val.get(field).and_then(|v| v.as_bool()),
            "denied" | "deny" => val.get(field).and_then(|v| v.as_bool()).map(|d| !d),
            pointer if pointer.starts_with('/') => val.pointer(pointer).and_then(|v| v.as_bool()),
            other => val.get(other).and_then(|v| v.as_bool()),
        }
    }
}

fn escape_json_string(value: &str) -> String {
    match serde_json::to_string(value) {
        Ok(mut json) => {
            if json.len() >= 2 {
                json.remove(0);
                json.pop();
            }
            json
        }
        Err(_) => String::new(),
    }
}

#[async_trait::async_trait]
impl AuthorizationOracle for HttpOracle {
    fn name(&self) -> &str {
        &self.def.name
    }

    async fn check_permission(
        &self,
        subject: &str,
        resource: &str,
        action: &str,
    ) -> Result<bool, OracleError> {
        let body = self.render_body(subject, resource, action);
        let mut rb = self
            .client
            .post(&self.def.url)
            .header("content-type", "application/json");
        if let Some(tok) = &self.def.bearer_token {
            rb = rb.bearer_auth(tok);
        }
        let resp = rb.body(body).send().await.map_err(|err| {
            if err.is_timeout() {
                OracleError::Timeout
            } else {
                OracleError::Transport(err.to_string())
            }
        })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(OracleError::Status(status.as_u16()));
        }
        let json: serde_json::Value = resp
            .json()
            .await
            .map_err(|err| OracleError::InvalidResponse(err.to_string()))?;
        // An answer we cannot read is a broken oracle, never an implicit allow.
        self.extract_decision(&json).ok_or_else(|| {
            OracleError::InvalidResponse(format!(
                "decision field '{}' missing or not a boolean",
                self.def.decision_field
            ))
        })
    }
}
