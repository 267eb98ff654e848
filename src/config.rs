use std::collections::HashSet;
use std::env;
use std::fs;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};

use crate::authz::HttpOracleDefinition;
use crate::telemetry::RotationConfig;

pub const DEFAULT_RATE_LIMIT: usize = 100;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_REQUEST_BYTES: usize = 4 * 1024 * 1024;
pub const DEFAULT_PORT: u16 = 6789;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub rate_limit: usize,
    pub rate_window: Duration,
    pub trust_forwarded: bool,
    /// HTTP authorization oracle; `None` selects the built-in static oracle.
    pub authz: Option<HttpOracleDefinition>,
    pub allowed_subjects: Option<HashSet<String>>,
    pub log_file: Option<String>,
    pub rotation: RotationConfig,
    pub log_stdout: bool,
    pub log_sample_n: Option<u64>,
    pub max_request_bytes: usize,
    pub port: u16,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            trust_forwarded: false,
            authz: None,
            allowed_subjects: None,
            log_file: None,
            rotation: RotationConfig::default(),
            log_stdout: false,
            log_sample_n: None,
            max_request_bytes: DEFAULT_MAX_REQUEST_BYTES,
            port: DEFAULT_PORT,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let rate_limit = parse_optional_u64("TURNSTILE_RATE_LIMIT")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_RATE_LIMIT);
        if rate_limit == 0 {
            bail!("TURNSTILE_RATE_LIMIT must be greater than zero");
        }
        let rate_window = parse_optional_u64("TURNSTILE_RATE_WINDOW_MS")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_RATE_WINDOW);
        if rate_window.is_zero() {
            bail!("TURNSTILE_RATE_WINDOW_MS must be greater than zero");
        }

        let trust_forwarded = parse_bool_env("TURNSTILE_TRUST_FORWARDED")?.unwrap_or(false);

        let authz = if let Ok(path) = env::var("TURNSTILE_AUTHZ_CONFIG") {
            let content = fs::read_to_string(&path).with_context(|| {
                format!(
                    "Failed to read TURNSTILE_AUTHZ_CONFIG '{}': file unreadable",
                    path
                )
            })?;
            let def = serde_json::from_str::<HttpOracleDefinition>(&content).with_context(|| {
                format!(
                    "Failed to parse TURNSTILE_AUTHZ_CONFIG '{}': invalid JSON configuration",
                    path
                )
            })?;
            Some(def)
        } else {
            None
        };

        let allowed_subjects = env::var("TURNSTILE_ALLOWED_SUBJECTS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let max_request_bytes = parse_optional_u64("TURNSTILE_MAX_REQUEST_BYTES")?
            .map(|v| v as usize)
            .unwrap_or(DEFAULT_MAX_REQUEST_BYTES);
        let port = match parse_optional_u64("PORT")? {
            Some(v) => u16::try_from(v).map_err(|_| anyhow!("PORT must be at most 65535"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self {
            rate_limit,
            rate_window,
            trust_forwarded,
            authz,
            allowed_subjects,
            log_file: env::var("LOG_FILE").ok(),
            rotation,
            log_stdout: parse_bool_env("TURNSTILE_LOG_STDOUT")?.unwrap_or(false),
            log_sample_n: parse_optional_u64("TURNSTILE_LOG_SAMPLE_N")?.filter(|n| *n > 1),
            max_request_bytes,
            port,
        })
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a non-negative integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: [&str; 13] = [
        "TURNSTILE_RATE_LIMIT",
        "TURNSTILE_RATE_WINDOW_MS",
        "TURNSTILE_TRUST_FORWARDED",
        "TURNSTILE_AUTHZ_CONFIG",
        "TURNSTILE_ALLOWED_SUBJECTS",
        "LOG_FILE",
        "LOG_MAX_BYTES",
        "LOG_ROTATE_KEEP",
        "LOG_ROTATE_COMPRESS",
        "TURNSTILE_LOG_STDOUT",
        "TURNSTILE_LOG_SAMPLE_N",
        "TURNSTILE_MAX_REQUEST_BYTES",
        "PORT",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn parses_environment_defaults() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.rate_limit, 100);
        assert_eq!(cfg.rate_window, Duration::from_secs(60));
        assert!(!cfg.trust_forwarded);
        assert!(cfg.authz.is_none());
        assert!(cfg.allowed_subjects.is_none());
        assert!(cfg.log_file.is_none());
        assert_eq!(cfg.rotation.keep, 1);
        assert_eq!(cfg.max_request_bytes, 4 * 1024 * 1024);
        assert_eq!(cfg.port, 6789);
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        let mut temp = NamedTempFile::new().unwrap();
        let oracle = serde_json::json!({
            "name": "policy-svc",
            "url": "http://127.0.0.1:9/check",
            "timeoutMs": 150,
            "decisionField": "/result/allow"
        });
        use std::io::Write;
        write!(temp, "{}", oracle).unwrap();

        std::env::set_var("TURNSTILE_RATE_LIMIT", "5");
        std::env::set_var("TURNSTILE_RATE_WINDOW_MS", "1500");
        std::env::set_var("TURNSTILE_TRUST_FORWARDED", "yes");
        std::env::set_var("TURNSTILE_AUTHZ_CONFIG", temp.path());
        std::env::set_var("TURNSTILE_ALLOWED_SUBJECTS", "alice, bob,,");
        std::env::set_var("LOG_FILE", "/tmp/observations.log");
        std::env::set_var("LOG_MAX_BYTES", "1024");
        std::env::set_var("LOG_ROTATE_KEEP", "3");
        std::env::set_var("LOG_ROTATE_COMPRESS", "on");
        std::env::set_var("TURNSTILE_LOG_STDOUT", "1");
        std::env::set_var("TURNSTILE_LOG_SAMPLE_N", "4");
        std::env::set_var("TURNSTILE_MAX_REQUEST_BYTES", "2048");
        std::env::set_var("PORT", "7000");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.rate_limit, 5);
        assert_eq!(cfg.rate_window, Duration::from_millis(1500));
        assert!(cfg.trust_forwarded);
        let authz = cfg.authz.unwrap();
        assert_eq!(authz.name, "policy-svc");
        assert_eq!(authz.timeout_ms, 150);
        let subjects = cfg.allowed_subjects.unwrap();
        assert_eq!(subjects.len(), 2);
        assert!(subjects.contains("alice") && subjects.contains("bob"));
        assert_eq!(cfg.log_file.as_deref(), Some("/tmp/observations.log"));
        assert_eq!(cfg.rotation.max_bytes, Some(1024));
        assert_eq!(cfg.rotation.keep, 3);
        assert!(cfg.rotation.compress);
        assert!(cfg.log_stdout);
        assert_eq!(cfg.log_sample_n, Some(4));
        assert_eq!(cfg.max_request_bytes, 2048);
        assert_eq!(cfg.port, 7000);

        clear();
    }

    #[test]
    fn rejects_zero_quota() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("TURNSTILE_RATE_LIMIT", "0");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("TURNSTILE_RATE_LIMIT"));
        clear();

        std::env::set_var("TURNSTILE_RATE_WINDOW_MS", "0");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("TURNSTILE_RATE_WINDOW_MS"));
        clear();
    }

    #[test]
    fn rejects_unreadable_authz_config() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();
        std::env::set_var("TURNSTILE_AUTHZ_CONFIG", "/nonexistent/turnstile-authz.json");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("TURNSTILE_AUTHZ_CONFIG"));
        clear();
    }
}
