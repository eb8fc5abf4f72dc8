//! Configuration types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::cache::{CachePolicy, CacheTtl, CacheType};
use crate::error::ConfigError;
use crate::jobs::{JobType, RetryPolicy};
use crate::llm::{LlmBackend, LlmConfig};
use crate::memory::MemoryConfig;
use crate::worker::WorkerConfig;

/// Deployment label reported by health checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Staging,
    Production,
    Test,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            "test" => Ok(Self::Test),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Pipeline configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub environment: Environment,
    pub db_path: PathBuf,
    /// Rolling log file directory. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub worker: WorkerConfig,
    pub retry: RetryPolicy,
    pub cache: CachePolicy,
    pub memory: MemoryConfig,
    /// Processing jobs older than this are recovered by the maintenance sweep.
    pub max_processing: Duration,
    pub recovery_interval: Duration,
    /// `None` disables the model-backed handlers.
    pub llm: Option<LlmConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            environment: Environment::Development,
            db_path: PathBuf::from("./data/enrich.db"),
            log_dir: None,
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            cache: CachePolicy::default(),
            memory: MemoryConfig::default(),
            max_processing: Duration::from_secs(300), // 5 minutes
            recovery_interval: Duration::from_secs(60),
            llm: None,
        }
    }
}

impl PipelineConfig {
    /// Build config from environment variables, defaulting what is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Vars(&lookup);
        let defaults = Self::default();

        let environment = env.parse("ENVIRONMENT")?.unwrap_or(defaults.environment);
        let db_path = env.get("ENRICH_DB_PATH").map(PathBuf::from).unwrap_or(defaults.db_path);
        let log_dir = env.get("ENRICH_LOG_DIR").map(PathBuf::from);

        let mut worker = defaults.worker;
        if let Some(n) = env.parse::<usize>("ENRICH_WORKERS")? {
            worker.workers = positive("ENRICH_WORKERS", n)?;
        }
        if let Some(n) = env.parse::<usize>("ENRICH_HANDLER_CONCURRENCY")? {
            worker.handler_concurrency = positive("ENRICH_HANDLER_CONCURRENCY", n)?;
        }
        for job_type in JobType::ALL {
            let key = format!(
                "ENRICH_HANDLER_CONCURRENCY_{}",
                job_type.as_str().to_ascii_uppercase()
            );
            if let Some(n) = env.parse::<usize>(&key)? {
                worker
                    .handler_concurrency_overrides
                    .insert(job_type, positive(&key, n)?);
            }
        }
        if let Some(secs) = env.parse::<u64>("ENRICH_HANDLER_TIMEOUT_SECS")? {
            worker.handler_timeout = Duration::from_secs(positive("ENRICH_HANDLER_TIMEOUT_SECS", secs)?);
        }
        if let Some(ms) = env.parse::<u64>("ENRICH_POLL_INTERVAL_MS")? {
            worker.poll_interval = Duration::from_millis(positive("ENRICH_POLL_INTERVAL_MS", ms)?);
        }

        let mut retry = defaults.retry;
        if let Some(n) = env.parse::<u32>("ENRICH_MAX_RETRIES")? {
            retry.max_retries = n;
        }
        if let Some(ms) = env.parse::<u64>("ENRICH_BACKOFF_BASE_MS")? {
            retry.backoff_base = Duration::from_millis(ms);
        }

        let mut cache = defaults.cache;
        for cache_type in CacheType::ALL {
            let key = format!("ENRICH_CACHE_TTL_{}", cache_type.as_str().to_ascii_uppercase());
            if let Some(secs) = env.parse::<u64>(&key)? {
                cache = cache.with_ttl(cache_type, CacheTtl::from_secs(secs));
            }
        }

        let mut memory = defaults.memory;
        if let Some(secs) = env.parse::<u64>("ENRICH_SESSION_TTL_SECS")? {
            memory.session_ttl = Duration::from_secs(positive("ENRICH_SESSION_TTL_SECS", secs)?);
        }
        if let Some(k) = env.parse::<f64>("ENRICH_CONFIDENCE_SATURATION")? {
            if !(k.is_finite() && k > 0.0) {
                return Err(invalid("ENRICH_CONFIDENCE_SATURATION", "must be a positive number"));
            }
            memory.confidence_saturation = k;
        }

        let max_processing = env
            .parse::<u64>("ENRICH_MAX_PROCESSING_SECS")?
            .map(|s| positive("ENRICH_MAX_PROCESSING_SECS", s).map(Duration::from_secs))
            .transpose()?
            .unwrap_or(defaults.max_processing);
        let recovery_interval = env
            .parse::<u64>("ENRICH_RECOVERY_INTERVAL_SECS")?
            .map(|s| positive("ENRICH_RECOVERY_INTERVAL_SECS", s).map(Duration::from_secs))
            .transpose()?
            .unwrap_or(defaults.recovery_interval);

        Ok(Self {
            environment,
            db_path,
            log_dir,
            worker,
            retry,
            cache,
            memory,
            max_processing,
            recovery_interval,
            llm: llm_config(&env)?,
        })
    }
}

/// `ENRICH_LLM_BACKEND=none` disables the model. Without an explicit backend
/// a missing API key also disables it; naming a backend makes the key
/// required.
fn llm_config<F>(env: &Vars<'_, F>) -> Result<Option<LlmConfig>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let (backend, explicit) = match env.get("ENRICH_LLM_BACKEND").as_deref() {
        None => (LlmBackend::OpenAi, false),
        Some(s) if s.eq_ignore_ascii_case("none") => return Ok(None),
        Some(s) => (
            s.parse::<LlmBackend>()
                .map_err(|e| invalid("ENRICH_LLM_BACKEND", &e))?,
            true,
        ),
    };

    let api_key = match env.get("ENRICH_LLM_API_KEY") {
        Some(key) => key,
        None if explicit => {
            return Err(ConfigError::MissingEnvVar("ENRICH_LLM_API_KEY".into()));
        }
        None => return Ok(None),
    };

    Ok(Some(LlmConfig {
        backend,
        api_key: SecretString::from(api_key),
        base_url: env
            .get("ENRICH_LLM_BASE_URL")
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
        model: env
            .get("ENRICH_LLM_MODEL")
            .unwrap_or_else(|| "gpt-4o-mini".to_string()),
        embedding_model: env
            .get("ENRICH_EMBEDDING_MODEL")
            .unwrap_or_else(|| "text-embedding-3-small".to_string()),
    }))
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Non-blank value, trimmed.
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        self.get(key)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|e| invalid(key, &format!("'{raw}': {e}")))
            })
            .transpose()
    }
}

fn invalid(key: &str, message: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn positive<T: PartialEq + Default>(key: &str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(invalid(key, "must be greater than zero"));
    }
    Ok(value)
}
