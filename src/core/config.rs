use crate::core::errors::{ConfigError, ConfigResult};
use crate::core::types::TranslationProfile;
use crate::middleware::circuit_breaker::CircuitBreakerConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::Level;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub log_level: Level,
}

/// Page store configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// sqlx connection string, or "memory" for the in-process store
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn is_memory(&self) -> bool {
        self.url.eq_ignore_ascii_case("memory")
    }
}

/// External translation service configuration
#[derive(Debug, Clone)]
pub struct TranslatorConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

/// Source image fetch configuration
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub timeout: Duration,
}

/// Where rendered pages are published
#[derive(Debug, Clone)]
pub enum PublisherConfig {
    Local {
        root_dir: PathBuf,
        public_base_url: String,
    },
    Http {
        endpoint: String,
        bucket: String,
        public_base_url: String,
        token: Option<String>,
        timeout: Duration,
    },
}

/// Job orchestration configuration
#[derive(Debug, Clone)]
pub struct JobConfig {
    pub max_concurrent_jobs: usize,
    pub job_timeout: Duration,
    pub claim_lease: Duration,
    pub reconcile_interval: Duration,
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub translator: TranslatorConfig,
    pub fetcher: FetcherConfig,
    pub publisher: PublisherConfig,
    pub jobs: JobConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub profile: TranslationProfile,
}

impl Config {
    pub fn new() -> ConfigResult<Self> {
        // Load .env file if it exists
        let _ = dotenvy::dotenv();

        Self::load_from_env()
    }

    fn load_from_env() -> ConfigResult<Self> {
        Self::from_vars(|name| env::var(name).ok())
    }

    /// Build and validate a config from an arbitrary variable source
    pub fn from_vars<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let log_level = vars
            .string("LOG_LEVEL")
            .and_then(|s| match s.to_lowercase().as_str() {
                "trace" => Some(Level::TRACE),
                "debug" => Some(Level::DEBUG),
                "info" => Some(Level::INFO),
                "warn" | "warning" => Some(Level::WARN),
                "error" => Some(Level::ERROR),
                _ => None,
            })
            .unwrap_or(Level::INFO);

        let backend = vars
            .string("PUBLISHER_BACKEND")
            .unwrap_or_else(|| "local".to_string());
        let public_base_url = vars
            .string("PUBLIC_BASE_URL")
            .unwrap_or_else(|| "http://127.0.0.1:8080/static".to_string());
        let publisher = match backend.to_lowercase().as_str() {
            "local" => PublisherConfig::Local {
                root_dir: PathBuf::from(
                    vars.string("PUBLISH_ROOT_DIR")
                        .unwrap_or_else(|| "published".to_string()),
                ),
                public_base_url,
            },
            "http" => PublisherConfig::Http {
                endpoint: vars
                    .string("STORAGE_ENDPOINT")
                    .ok_or(ConfigError::Missing("STORAGE_ENDPOINT"))?,
                bucket: vars
                    .string("STORAGE_BUCKET")
                    .ok_or(ConfigError::Missing("STORAGE_BUCKET"))?,
                public_base_url,
                token: vars.string("STORAGE_TOKEN"),
                timeout: vars.seconds("STORAGE_TIMEOUT_SECONDS", 60)?,
            },
            other => return Err(ConfigError::UnknownPublisherBackend(other.to_string())),
        };

        let defaults = TranslationProfile::default();
        let profile = TranslationProfile {
            detector: vars.string("PROFILE_DETECTOR").unwrap_or(defaults.detector),
            ocr: vars.string("PROFILE_OCR").unwrap_or(defaults.ocr),
            translator: vars
                .string("PROFILE_TRANSLATOR")
                .unwrap_or(defaults.translator),
            inpainter: vars.string("PROFILE_INPAINTER").unwrap_or(defaults.inpainter),
            inpainting_size: vars.parse("PROFILE_INPAINTING_SIZE", defaults.inpainting_size)?,
            font_size: vars.parse("PROFILE_FONT_SIZE", defaults.font_size)?,
            font_size_minimum: vars
                .parse("PROFILE_FONT_SIZE_MINIMUM", defaults.font_size_minimum)?,
            box_expansion_ratio: vars
                .parse("PROFILE_BOX_EXPANSION_RATIO", defaults.box_expansion_ratio)?,
            include_inpainted: vars
                .parse("PROFILE_INCLUDE_INPAINTED", defaults.include_inpainted)?,
            render_text: vars.parse("PROFILE_RENDER_TEXT", defaults.render_text)?,
        };

        let config = Self {
            server: ServerConfig {
                port: vars.parse("SERVER_PORT", 8080)?,
                host: vars
                    .string("SERVER_HOST")
                    .unwrap_or_else(|| "0.0.0.0".to_string()),
                log_level,
            },
            database: DatabaseConfig {
                url: vars
                    .string("DATABASE_URL")
                    .unwrap_or_else(|| "sqlite://pages.db".to_string()),
                max_connections: vars.parse("DATABASE_MAX_CONNECTIONS", 5)?,
            },
            translator: TranslatorConfig {
                endpoint: vars.string("TRANSLATOR_URL").unwrap_or_else(|| {
                    "http://127.0.0.1:5003/translate/with-form/json".to_string()
                }),
                api_key: vars.string("TRANSLATOR_API_KEY"),
                timeout: vars.seconds("TRANSLATOR_TIMEOUT_SECONDS", 300)?,
                connect_timeout: vars.seconds("TRANSLATOR_CONNECT_TIMEOUT_SECONDS", 10)?,
            },
            fetcher: FetcherConfig {
                timeout: vars.seconds("FETCH_TIMEOUT_SECONDS", 30)?,
            },
            publisher,
            jobs: JobConfig {
                max_concurrent_jobs: vars.parse("MAX_CONCURRENT_JOBS", 4)?,
                job_timeout: vars.seconds("JOB_TIMEOUT_SECONDS", 600)?,
                claim_lease: vars.seconds("CLAIM_LEASE_SECONDS", 900)?,
                reconcile_interval: vars.seconds("RECONCILE_INTERVAL_SECONDS", 60)?,
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: vars.parse("CIRCUIT_FAILURE_THRESHOLD", 5)?,
                open_duration: vars.seconds("CIRCUIT_OPEN_SECONDS", 60)?,
                success_threshold: vars.parse("CIRCUIT_SUCCESS_THRESHOLD", 2)?,
            },
            profile,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> ConfigResult<()> {
        if self.translator.endpoint.trim().is_empty() {
            return Err(ConfigError::Missing("TRANSLATOR_URL"));
        }

        for (name, value) in [
            ("TRANSLATOR_TIMEOUT_SECONDS", self.translator.timeout),
            ("FETCH_TIMEOUT_SECONDS", self.fetcher.timeout),
            ("JOB_TIMEOUT_SECONDS", self.jobs.job_timeout),
            ("CLAIM_LEASE_SECONDS", self.jobs.claim_lease),
            ("RECONCILE_INTERVAL_SECONDS", self.jobs.reconcile_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid {
                    name,
                    reason: "must be > 0".to_string(),
                });
            }
        }

        if self.jobs.max_concurrent_jobs == 0 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONCURRENT_JOBS",
                reason: "must be > 0".to_string(),
            });
        }

        if self.database.max_connections == 0 {
            return Err(ConfigError::Invalid {
                name: "DATABASE_MAX_CONNECTIONS",
                reason: "must be > 0".to_string(),
            });
        }

        // A lease shorter than the job timeout could expire under a live job
        if self.jobs.claim_lease <= self.jobs.job_timeout {
            return Err(ConfigError::LeaseTooShort {
                lease: self.jobs.claim_lease,
                job_timeout: self.jobs.job_timeout,
            });
        }

        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
        {
            return Err(ConfigError::Invalid {
                name: "CIRCUIT_FAILURE_THRESHOLD",
                reason: "circuit breaker thresholds must be > 0".to_string(),
            });
        }

        if self.profile.font_size_minimum > self.profile.font_size {
            return Err(ConfigError::Invalid {
                name: "PROFILE_FONT_SIZE_MINIMUM",
                reason: format!(
                    "minimum font size {} exceeds initial font size {}",
                    self.profile.font_size_minimum, self.profile.font_size
                ),
            });
        }

        if !(self.profile.box_expansion_ratio > 0.0) {
            return Err(ConfigError::Invalid {
                name: "PROFILE_BOX_EXPANSION_RATIO",
                reason: format!("must be > 0, got {}", self.profile.box_expansion_ratio),
            });
        }

        let public_base_url = match &self.publisher {
            PublisherConfig::Local {
                public_base_url, ..
            } => public_base_url,
            PublisherConfig::Http {
                public_base_url, ..
            } => public_base_url,
        };
        if public_base_url.trim().is_empty() {
            return Err(ConfigError::Missing("PUBLIC_BASE_URL"));
        }

        Ok(())
    }

    pub fn server_port(&self) -> u16 {
        self.server.port
    }

    pub fn server_host(&self) -> &str {
        &self.server.host
    }

    pub fn log_level(&self) -> Level {
        self.server.log_level
    }
}

/// Typed access over a variable lookup
struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn parse<T>(&self, name: &'static str, default: T) -> ConfigResult<T>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match self.string(name) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                name,
                reason: format!("'{}': {}", raw, e),
            }),
            None => Ok(default),
        }
    }

    fn seconds(&self, name: &'static str, default: u64) -> ConfigResult<Duration> {
        self.parse(name, default).map(Duration::from_secs)
    }
}
