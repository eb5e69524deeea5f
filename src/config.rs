use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_AUTH_SERVICE_URL: &str = "http://pac-authentication:8001";
const DEFAULT_RESEND_API_BASE: &str = "https://api.resend.com";
const DEFAULT_FROM_ADDRESS: &str = "hugo@onboarding.phishward.com";
const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";
const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub peer: Duration,
    pub provider: Duration,
    pub llm: Duration,
    pub clock: Duration,
}

#[derive(Debug, Clone)]
pub struct ClockConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub monitoring_url: String,
    pub agentic_url: String,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub from_address: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub model: String,
}

/// PostgREST endpoint; absent means the in-memory store.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub auth_service_url: String,
    pub super_clock_token: Option<String>,
    pub clock: ClockConfig,
    pub mail: MailConfig,
    pub llm: LlmConfig,
    pub database: Option<DatabaseConfig>,
    pub timeouts: TimeoutConfig,
    pub max_request_bytes: Option<usize>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let port = match parse_optional_u64("PORT")? {
            Some(p) => u16::try_from(p).map_err(|_| anyhow!("PORT must be a valid TCP port"))?,
            None => DEFAULT_PORT,
        };
        let local = format!("http://127.0.0.1:{port}");

        let interval_secs = parse_optional_u64("POLLING_INTERVAL_SECONDS")?.unwrap_or(600);
        if interval_secs == 0 {
            return Err(anyhow!("POLLING_INTERVAL_SECONDS must be at least 1"));
        }
        let clock = ClockConfig {
            enabled: parse_bool_env("PAC_CLOCK_ENABLED")?.unwrap_or(false),
            interval: Duration::from_secs(interval_secs),
            monitoring_url: optional_string("MONITORING_SERVICE_URL").unwrap_or_else(|| local.clone()),
            agentic_url: optional_string("AGENTIC_SERVICE_URL").unwrap_or(local),
        };

        let mail = MailConfig {
            api_key: optional_string("RESEND_API_KEY"),
            api_base: optional_string("RESEND_API_BASE")
                .unwrap_or_else(|| DEFAULT_RESEND_API_BASE.to_string()),
            from_address: optional_string("PAC_FROM_ADDRESS")
                .unwrap_or_else(|| DEFAULT_FROM_ADDRESS.to_string()),
        };

        let llm = LlmConfig {
            api_key: optional_string("OPENAI_API_KEY"),
            api_base: optional_string("OPENAI_API_BASE")
                .unwrap_or_else(|| DEFAULT_OPENAI_API_BASE.to_string()),
            model: optional_string("OPENAI_MODEL").unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
        };

        let database = match (optional_string("SUPABASE_URL"), optional_string("SUPABASE_KEY")) {
            (Some(url), Some(key)) => Some(DatabaseConfig { url, key }),
            (None, None) => None,
            (Some(_), None) => return Err(anyhow!("SUPABASE_KEY must be set when SUPABASE_URL is")),
            (None, Some(_)) => return Err(anyhow!("SUPABASE_URL must be set when SUPABASE_KEY is")),
        };

        let timeouts = TimeoutConfig {
            peer: parse_millis("PAC_PEER_TIMEOUT_MS", 5_000)?,
            provider: parse_millis("PAC_PROVIDER_TIMEOUT_MS", 30_000)?,
            llm: parse_millis("PAC_LLM_TIMEOUT_MS", 60_000)?,
            clock: parse_millis("PAC_CLOCK_TIMEOUT_MS", 600_000)?,
        };

        let max_request_bytes = parse_optional_u64("PAC_MAX_REQUEST_BYTES")?.map(|v| v as usize);

        Ok(Self {
            port,
            auth_service_url: optional_string("AUTH_SERVICE_URL")
                .unwrap_or_else(|| DEFAULT_AUTH_SERVICE_URL.to_string()),
            super_clock_token: optional_string("SUPER_CLOCK_TOKEN"),
            clock,
            mail,
            llm,
            database,
            timeouts,
            max_request_bytes,
        })
    }
}

fn optional_string(var: &str) -> Option<String> {
    env::var(var)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_millis(var: &str, default_ms: u64) -> Result<Duration> {
    let ms = parse_optional_u64(var)
        .with_context(|| format!("invalid timeout in {var}"))?
        .unwrap_or(default_ms);
    if ms == 0 {
        return Err(anyhow!("{} must be greater than zero", var));
    }
    Ok(Duration::from_millis(ms))
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
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

    static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "PORT",
        "AUTH_SERVICE_URL",
        "MONITORING_SERVICE_URL",
        "AGENTIC_SERVICE_URL",
        "POLLING_INTERVAL_SECONDS",
        "SUPER_CLOCK_TOKEN",
        "PAC_CLOCK_ENABLED",
        "RESEND_API_KEY",
        "RESEND_API_BASE",
        "PAC_FROM_ADDRESS",
        "OPENAI_API_KEY",
        "OPENAI_API_BASE",
        "OPENAI_MODEL",
        "SUPABASE_URL",
        "SUPABASE_KEY",
        "PAC_PEER_TIMEOUT_MS",
        "PAC_PROVIDER_TIMEOUT_MS",
        "PAC_LLM_TIMEOUT_MS",
        "PAC_CLOCK_TIMEOUT_MS",
        "PAC_MAX_REQUEST_BYTES",
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
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.auth_service_url, DEFAULT_AUTH_SERVICE_URL);
        assert_eq!(cfg.clock.monitoring_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.clock.interval, Duration::from_secs(600));
        assert!(!cfg.clock.enabled);
        assert!(cfg.super_clock_token.is_none());
        assert!(cfg.database.is_none());
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.timeouts.peer, Duration::from_millis(5_000));
        assert_eq!(cfg.timeouts.clock, Duration::from_millis(600_000));
        assert!(cfg.max_request_bytes.is_none());
    }

    #[test]
    fn parses_full_configuration() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        std::env::set_var("PORT", "9000");
        std::env::set_var("AGENTIC_SERVICE_URL", "http://agentic:8003");
        std::env::set_var("POLLING_INTERVAL_SECONDS", "30");
        std::env::set_var("SUPER_CLOCK_TOKEN", "tick");
        std::env::set_var("PAC_CLOCK_ENABLED", "yes");
        std::env::set_var("RESEND_API_KEY", "re_123");
        std::env::set_var("SUPABASE_URL", "https://db.example.test");
        std::env::set_var("SUPABASE_KEY", "service-key");
        std::env::set_var("PAC_LLM_TIMEOUT_MS", "1500");
        std::env::set_var("PAC_MAX_REQUEST_BYTES", "2048");

        let cfg = AppConfig::from_env().unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.clock.monitoring_url, "http://127.0.0.1:9000");
        assert_eq!(cfg.clock.agentic_url, "http://agentic:8003");
        assert_eq!(cfg.clock.interval, Duration::from_secs(30));
        assert!(cfg.clock.enabled);
        assert_eq!(cfg.super_clock_token.as_deref(), Some("tick"));
        assert_eq!(cfg.mail.api_key.as_deref(), Some("re_123"));
        assert_eq!(cfg.database.unwrap().key, "service-key");
        assert_eq!(cfg.timeouts.llm, Duration::from_millis(1500));
        assert_eq!(cfg.max_request_bytes, Some(2048));

        clear();
    }

    #[test]
    fn rejects_bad_values() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear();

        std::env::set_var("POLLING_INTERVAL_SECONDS", "0");
        assert!(AppConfig::from_env().is_err());
        clear();

        std::env::set_var("PAC_CLOCK_ENABLED", "sometimes");
        let err = AppConfig::from_env().unwrap_err();
        assert!(err.to_string().contains("PAC_CLOCK_ENABLED"));
        clear();

        std::env::set_var("SUPABASE_URL", "https://db.example.test");
        assert!(AppConfig::from_env().is_err());
        clear();

        std::env::set_var("SUPER_CLOCK_TOKEN", "   ");
        assert!(AppConfig::from_env().unwrap().super_clock_token.is_none());
        clear();
    }
}
