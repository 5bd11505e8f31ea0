use std::env;
use std::time::Duration;
use tracing::warn;

/// Thresholds steering the interview toward closure. All tunable via
/// environment so the caps are policy, not code.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Turn count at which the assistant starts steering toward a summary.
    pub soft_cap: i32,
    /// Turn count at which open-ended questions stop and the assistant must
    /// offer to generate the plan.
    pub hard_cap: i32,
    /// Minimum completed turns before plan generation may be triggered.
    pub min_turns_for_plan: i32,
    /// Maximum accepted user message length in characters.
    pub max_message_len: usize,
    pub model: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            soft_cap: 10,
            hard_cap: 12,
            min_turns_for_plan: 3,
            max_message_len: 5000,
            model: "llama-3.3-70b".to_string(),
        }
    }
}

/// Retry policy for the plan generation worker.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionsConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub resend_api_key: Option<String>,
    pub from_address: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub engine: EngineConfig,
    pub retry: RetryPolicy,
    pub completions: CompletionsConfig,
    pub email: EmailConfig,
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Could not parse {}, falling back to default", key);
            default
        }),
        Err(_) => default,
    }
}

impl AppConfig {
    /// Reads configuration from the environment once at startup. Only
    /// DATABASE_URL is required; everything else has a sensible default.
    pub fn from_env() -> Self {
        let engine_defaults = EngineConfig::default();
        let retry_defaults = RetryPolicy::default();

        Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            engine: EngineConfig {
                soft_cap: env_parsed("ENGINE_SOFT_CAP", engine_defaults.soft_cap),
                hard_cap: env_parsed("ENGINE_HARD_CAP", engine_defaults.hard_cap),
                min_turns_for_plan: env_parsed(
                    "ENGINE_MIN_TURNS_FOR_PLAN",
                    engine_defaults.min_turns_for_plan,
                ),
                max_message_len: env_parsed("ENGINE_MAX_MESSAGE_LEN", engine_defaults.max_message_len),
                model: env::var("COMPLETIONS_MODEL").unwrap_or(engine_defaults.model),
            },
            retry: RetryPolicy {
                max_attempts: env_parsed("PLAN_MAX_ATTEMPTS", retry_defaults.max_attempts),
                attempt_timeout: Duration::from_secs(env_parsed(
                    "PLAN_ATTEMPT_TIMEOUT_SECS",
                    retry_defaults.attempt_timeout.as_secs(),
                )),
            },
            completions: CompletionsConfig {
                base_url: env::var("COMPLETIONS_BASE_URL")
                    .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
                api_key: env::var("COMPLETIONS_API_KEY").ok(),
                request_timeout: Duration::from_secs(env_parsed("COMPLETIONS_TIMEOUT_SECS", 120u64)),
            },
            email: EmailConfig {
                resend_api_key: env::var("RESEND_API_KEY").ok(),
                from_address: env::var("EMAIL_FROM")
                    .unwrap_or_else(|_| "discovery@email.example.com".to_string()),
            },
        }
    }
}
