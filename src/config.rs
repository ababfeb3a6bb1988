//! Pipeline configuration, read from environment variables.
//!
//! Every setting has a default except the primary provider's API key.
//! List settings are comma-separated and replace the built-in list.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::channels::EmailConfig;
use crate::error::ConfigError;
use crate::llm::{LlmBackend, LlmConfig, RetryConfig};
use crate::pipeline::normalizer::NormalizerConfig;
use crate::pipeline::processor::{DegradedPolicy, ProcessorConfig};
use crate::pipeline::rules::FilterConfig;

pub const DEFAULT_PRIMARY_MODEL: &str = "qwen-3-coder-480b";
pub const DEFAULT_SECONDARY_MODEL: &str = "z-ai/glm-4.5-air:free";
const DEFAULT_LLM_TIMEOUT_SECS: u64 = 60;

/// Where newsletters are persisted.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    Notion {
        token: SecretString,
        database_id: String,
    },
    LibSql {
        path: PathBuf,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub primary: LlmConfig,
    pub secondary: Option<LlmConfig>,
    pub retry: RetryConfig,
    pub filter: FilterConfig,
    pub normalizer: NormalizerConfig,
    pub processor: ProcessorConfig,
    /// Directory holding `summarize.md`, `classify.md`, `score.md`.
    pub prompt_dir: Option<PathBuf>,
    pub store: StoreConfig,
    /// `None` means the mailbox is not configured.
    pub email: Option<EmailConfig>,
    /// Cron expression; `None` runs the batch once.
    pub schedule: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. `from_env` passes `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let timeout = Duration::from_secs(parse_or(
            &get,
            "LLM_TIMEOUT_SECS",
            DEFAULT_LLM_TIMEOUT_SECS,
        )?);

        let primary_backend: LlmBackend = parse_or(&get, "LLM_PRIMARY_BACKEND", LlmBackend::Cerebras)?;
        let primary_key = get("LLM_PRIMARY_API_KEY")
            .or_else(|| get(default_key_var(primary_backend)))
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "LLM_PRIMARY_API_KEY".into(),
                hint: format!(
                    "set it or {} for the {} backend",
                    default_key_var(primary_backend),
                    primary_backend.as_str()
                ),
            })?;
        let primary = LlmConfig {
            backend: primary_backend,
            api_key: SecretString::from(primary_key),
            model: get("LLM_PRIMARY_MODEL").unwrap_or_else(|| DEFAULT_PRIMARY_MODEL.into()),
            endpoint: get("LLM_PRIMARY_ENDPOINT"),
            timeout,
        };

        let secondary_backend: LlmBackend =
            parse_or(&get, "LLM_SECONDARY_BACKEND", LlmBackend::OpenRouter)?;
        let secondary = get("LLM_SECONDARY_API_KEY")
            .or_else(|| get(default_key_var(secondary_backend)))
            .map(|key| LlmConfig {
                backend: secondary_backend,
                api_key: SecretString::from(key),
                model: get("LLM_SECONDARY_MODEL").unwrap_or_else(|| DEFAULT_SECONDARY_MODEL.into()),
                endpoint: get("LLM_SECONDARY_ENDPOINT"),
                timeout,
            });

        let retry_defaults = RetryConfig::default();
        let retry = RetryConfig {
            max_retries: parse_or(&get, "LLM_MAX_RETRIES", retry_defaults.max_retries)?,
            base_backoff: Duration::from_millis(parse_or(
                &get,
                "LLM_BACKOFF_BASE_MS",
                millis(retry_defaults.base_backoff),
            )?),
            max_backoff: Duration::from_millis(parse_or(
                &get,
                "LLM_BACKOFF_MAX_MS",
                millis(retry_defaults.max_backoff),
            )?),
            jitter: retry_defaults.jitter,
        };
        if retry.base_backoff > retry.max_backoff {
            return Err(ConfigError::InvalidValue {
                key: "LLM_BACKOFF_BASE_MS".into(),
                message: "must not exceed LLM_BACKOFF_MAX_MS".into(),
            });
        }

        let filter_defaults = FilterConfig::default();
        let filter = FilterConfig {
            newsletter_keywords: list_or(&get, "FILTER_KEYWORDS", filter_defaults.newsletter_keywords),
            newsletter_domains: list_or(&get, "FILTER_DOMAINS", filter_defaults.newsletter_domains),
            transactional_phrases: list_or(
                &get,
                "FILTER_TRANSACTIONAL_PHRASES",
                filter_defaults.transactional_phrases,
            ),
            transactional_body_patterns: list_or(
                &get,
                "FILTER_TRANSACTIONAL_BODY_PATTERNS",
                filter_defaults.transactional_body_patterns,
            ),
            blocked_domains: list_or(&get, "FILTER_BLOCKED_DOMAINS", filter_defaults.blocked_domains),
            min_body_chars: parse_or(&get, "FILTER_MIN_BODY_CHARS", filter_defaults.min_body_chars)?,
        };

        let normalizer_defaults = NormalizerConfig::default();
        let normalizer = NormalizerConfig {
            marker_patterns: list_or(&get, "NORMALIZER_MARKERS", normalizer_defaults.marker_patterns),
            min_line_chars: parse_or(
                &get,
                "NORMALIZER_MIN_LINE_CHARS",
                normalizer_defaults.min_line_chars,
            )?,
        };

        let min_importance: u8 = parse_or(&get, "MIN_IMPORTANCE", 1)?;
        if !(1..=5).contains(&min_importance) {
            return Err(ConfigError::InvalidValue {
                key: "MIN_IMPORTANCE".into(),
                message: format!("{min_importance} is outside 1-5"),
            });
        }
        let processor = ProcessorConfig {
            min_importance,
            degraded_policy: parse_or(&get, "DEGRADED_POLICY", DegradedPolicy::Persist)?,
        };

        let store = match (get("NOTION_TOKEN"), get("NOTION_DATABASE_ID")) {
            (Some(token), Some(database_id)) => StoreConfig::Notion {
                token: SecretString::from(token),
                database_id,
            },
            (Some(_), None) => {
                return Err(ConfigError::MissingRequired {
                    key: "NOTION_DATABASE_ID".into(),
                    hint: "NOTION_TOKEN is set but the database id is not".into(),
                });
            }
            _ => StoreConfig::LibSql {
                path: get("NEWSLETTER_DB_PATH")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("./data/newsletters.db")),
            },
        };

        let schedule = get("NEWSLETTER_SCHEDULE");
        if let Some(expr) = &schedule {
            cron::Schedule::from_str(expr).map_err(|e| ConfigError::InvalidValue {
                key: "NEWSLETTER_SCHEDULE".into(),
                message: e.to_string(),
            })?;
        }

        Ok(Self {
            primary,
            secondary,
            retry,
            filter,
            normalizer,
            processor,
            prompt_dir: get("PROMPT_DIR").map(PathBuf::from),
            store,
            email: EmailConfig::from_env(),
            schedule,
            log_dir: get("LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Conventional API-key variable for a backend.
fn default_key_var(backend: LlmBackend) -> &'static str {
    match backend {
        LlmBackend::Cerebras => "CEREBRAS_API_KEY",
        LlmBackend::OpenRouter => "OPENROUTER_API_KEY",
        LlmBackend::OpenAiCompat => "OPENAI_COMPAT_API_KEY",
        LlmBackend::Anthropic => "ANTHROPIC_API_KEY",
        LlmBackend::OpenAi => "OPENAI_API_KEY",
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
        None => Ok(default),
    }
}

fn list_or<G>(get: &G, key: &str, default: Vec<String>) -> Vec<String>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default,
    }
}
