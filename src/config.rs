//! Process configuration read from the environment.
//!
//! Every value has a default except the provider credentials, of which at
//! least one must be present. Malformed numbers are rejected at start-up
//! rather than silently replaced.

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::sandbox::SandboxConfig;

pub const DEFAULT_PORT: u16 = 4000;
pub const DEFAULT_CLIENT_ORIGIN: &str = "http://localhost:5173";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Credentials for the language-model providers.
#[derive(Clone, Default)]
pub struct ProviderKeys {
    pub anthropic: Option<String>,
    pub openai: Option<String>,
}

impl ProviderKeys {
    pub fn any(&self) -> bool {
        self.anthropic.is_some() || self.openai.is_some()
    }
}

impl std::fmt::Debug for ProviderKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderKeys")
            .field("anthropic", &self.anthropic.as_deref().map(redact))
            .field("openai", &self.openai.as_deref().map(redact))
            .finish()
    }
}

/// Show only the last four characters of a secret.
pub fn redact(secret: &str) -> String {
    let tail: String = secret
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    if secret.chars().count() <= 8 {
        "****".to_string()
    } else {
        format!("****{}", tail)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub client_origin: String,
    pub keys: ProviderKeys,
    pub database_path: PathBuf,
    pub sandbox_root: PathBuf,
    pub templates_dir: PathBuf,
    pub max_concurrent_containers: usize,
    pub max_concurrent_sessions: usize,
    pub stuck_threshold: Duration,
    pub stuck_sweep_interval: Duration,
    pub generation_timeout: Duration,
    pub default_model: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub log_dir: Option<PathBuf>,
    pub save_file_burst: u32,
    pub save_file_refill: Duration,
    pub sandbox: SandboxConfig,
}

impl AppConfig {
    /// Load `.env` (if present) and read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let keys = ProviderKeys {
            anthropic: get("ANTHROPIC_API_KEY"),
            openai: get("OPENAI_API_KEY"),
        };
        if !keys.any() {
            return Err(ConfigError::NoProvider);
        }

        let database_path = get("DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("data/appforge.db"));

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") | Some("pretty") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    key: "LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected 'text' or 'json'".to_string(),
                });
            }
        };

        let sandbox_toml = database_path
            .parent()
            .map(|p| p.join("sandbox.toml"))
            .unwrap_or_else(|| PathBuf::from("sandbox.toml"));
        let sandbox = SandboxConfig::load(&sandbox_toml)?;

        let max_concurrent_containers = parse_number(&get, "MAX_CONCURRENT_CONTAINERS", 5usize)?;
        if max_concurrent_containers == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_CONTAINERS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        let max_concurrent_sessions = parse_number(&get, "MAX_CONCURRENT_SESSIONS", 10usize)?;
        if max_concurrent_sessions == 0 {
            return Err(ConfigError::InvalidValue {
                key: "MAX_CONCURRENT_SESSIONS",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            port: parse_number(&get, "PORT", DEFAULT_PORT)?,
            client_origin: get("CLIENT_ORIGIN").unwrap_or_else(|| DEFAULT_CLIENT_ORIGIN.to_string()),
            keys,
            database_path,
            sandbox_root: get("SANDBOX_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data/sandboxes")),
            templates_dir: get("TEMPLATES_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("templates")),
            max_concurrent_containers,
            max_concurrent_sessions,
            stuck_threshold: Duration::from_millis(parse_number(
                &get,
                "STUCK_SESSION_THRESHOLD_MS",
                30 * 60 * 1000u64,
            )?),
            stuck_sweep_interval: Duration::from_millis(parse_number(
                &get,
                "STUCK_SWEEP_INTERVAL_MS",
                5 * 60 * 1000u64,
            )?),
            generation_timeout: Duration::from_millis(parse_number(
                &get,
                "GENERATION_TIMEOUT_MS",
                30 * 60 * 1000u64,
            )?),
            default_model: get("DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            log_level: get("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format,
            log_dir: get("LOG_DIR").map(PathBuf::from),
            save_file_burst: parse_number(&get, "SAVE_FILE_BURST", 10u32)?,
            save_file_refill: Duration::from_millis(parse_number(&get, "SAVE_FILE_REFILL_MS", 1000u64)?),
            sandbox,
        })
    }

    /// One line per setting with secrets redacted, for `check-config`.
    pub fn summary(&self) -> Vec<(String, String)> {
        let key_or_none = |k: &Option<String>| k.as_deref().map(redact).unwrap_or_else(|| "(not set)".into());
        vec![
            ("PORT".into(), self.port.to_string()),
            ("CLIENT_ORIGIN".into(), self.client_origin.clone()),
            ("ANTHROPIC_API_KEY".into(), key_or_none(&self.keys.anthropic)),
            ("OPENAI_API_KEY".into(), key_or_none(&self.keys.openai)),
            ("DATABASE_PATH".into(), self.database_path.display().to_string()),
            ("SANDBOX_ROOT".into(), self.sandbox_root.display().to_string()),
            ("TEMPLATES_DIR".into(), self.templates_dir.display().to_string()),
            ("MAX_CONCURRENT_CONTAINERS".into(), self.max_concurrent_containers.to_string()),
            ("MAX_CONCURRENT_SESSIONS".into(), self.max_concurrent_sessions.to_string()),
            ("STUCK_SESSION_THRESHOLD_MS".into(), self.stuck_threshold.as_millis().to_string()),
            ("GENERATION_TIMEOUT_MS".into(), self.generation_timeout.as_millis().to_string()),
            ("DEFAULT_MODEL".into(), self.default_model.clone()),
            ("LOG_LEVEL".into(), self.log_level.clone()),
            ("SANDBOX_IMAGE".into(), self.sandbox.image.clone()),
        ]
    }
}

fn parse_number<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}
