//! TOML configuration.
//!
//! Configuration is loaded with the following resolution order:
//! 1. An explicit path (e.g. `heim --config <path>`)
//! 2. `~/.heimdall/config.toml` (user)
//! 3. `/etc/heimdall/config.toml` (system)
//!
//! ```toml
//! default_provider = "openai"
//! fallback_provider = "ollama"
//! enabled_providers = ["openai", "ollama"]
//!
//! [switcher]
//! max_retries = 3
//! attempt_timeout_secs = 30
//!
//! [rate_limits.openai]
//! max_tokens = 60
//! refill_rate = 1.0
//!
//! [providers.ollama]
//! base_url = "http://localhost:11434"
//! model = "llama3"
//! ```
//!
//! API keys missing from `[providers.<name>]` fall back to the provider's
//! environment variable (`OPENAI_API_KEY`, ...).

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::cache::CacheConfig;
use crate::health::HealthConfig;
use crate::ratelimit::RateLimitConfig;
use crate::switcher::RetryConfig;
use crate::types::ProviderId;
use crate::{HeimdallError, Result};

/// Gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Config {
    /// Active provider at startup. Defaults to the first enabled provider.
    #[serde(default)]
    pub default_provider: Option<ProviderId>,
    #[serde(default)]
    pub fallback_provider: Option<ProviderId>,
    /// Ordered set of providers that may be routed to. Empty means every
    /// provider with a `[providers.<name>]` section.
    #[serde(default)]
    pub enabled_providers: Vec<ProviderId>,
    #[serde(default)]
    pub switcher: SwitcherSection,
    #[serde(default)]
    pub health: HealthSection,
    #[serde(default)]
    pub cache: CacheSection,
    /// Keyed by provider name.
    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
    /// Keyed by provider name.
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderSection>,
}

/// `[switcher]`: retry, backoff and timeout policy.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SwitcherSection {
    pub max_retries: u32,
    pub backoff_base: f64,
    pub backoff_unit_ms: u64,
    pub max_delay_secs: u64,
    pub attempt_timeout_secs: u64,
    pub rate_limit_wait: bool,
    pub rate_limit_max_wait_secs: u64,
}

impl Default for SwitcherSection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: 2.0,
            backoff_unit_ms: 1000,
            max_delay_secs: 60,
            attempt_timeout_secs: 30,
            rate_limit_wait: false,
            rate_limit_max_wait_secs: 30,
        }
    }
}

/// `[health]`: monitor schedule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub check_timeout_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            check_timeout_secs: 10,
        }
    }
}

/// `[cache]`: response cache.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: u64,
    /// Shared tier, used with the `redis` feature.
    pub redis_url: Option<String>,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            max_entries: 10_000,
            redis_url: None,
        }
    }
}

/// `[providers.<name>]`: adapter settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProviderSection {
    #[serde(default)]
    pub base_url: Option<String>,
    /// Default model when a request names none.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Overrides `[switcher] max_retries` for this provider.
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl Config {
    /// Load configuration from the standard locations.
    pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
        let path = Self::resolve_config_path(explicit_path)?;
        let content = fs::read_to_string(&path).map_err(|e| {
            HeimdallError::InvalidConfiguration(format!(
                "Failed to read config file {path:?}: {e}"
            ))
        })?;
        Self::parse(&content).map_err(|e| match e {
            HeimdallError::InvalidConfiguration(msg) => {
                HeimdallError::InvalidConfiguration(format!("{path:?}: {msg}"))
            }
            other => other,
        })
    }

    /// Parse and validate TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).map_err(|e| {
            HeimdallError::InvalidConfiguration(format!("Failed to parse config: {e}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_config_path(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.exists() {
                return Ok(path.to_path_buf());
            }
            return Err(HeimdallError::InvalidConfiguration(format!(
                "Config file not found: {path:?}"
            )));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".heimdall").join("config.toml");
            if user_config.exists() {
                return Ok(user_config);
            }
        }

        let system_config = PathBuf::from("/etc/heimdall/config.toml");
        if system_config.exists() {
            return Ok(system_config);
        }

        Err(HeimdallError::InvalidConfiguration(
            "No config file found. Create ~/.heimdall/config.toml or /etc/heimdall/config.toml"
                .to_string(),
        ))
    }

    /// Check cross-field consistency.
    pub fn validate(&self) -> Result<()> {
        let rate_limits = self.rate_limits()?;
        for (provider, limit) in &rate_limits {
            limit.validate().map_err(|e| {
                HeimdallError::InvalidConfiguration(format!("rate_limits.{provider}: {e}"))
            })?;
        }
        for name in self.providers.keys() {
            name.parse::<ProviderId>()?;
        }

        let enabled = self.enabled();
        if let Some(default) = self.default_provider
            && !enabled.contains(&default)
        {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "default_provider {default} is not in enabled_providers"
            )));
        }
        if let Some(fallback) = self.fallback_provider
            && !enabled.contains(&fallback)
        {
            return Err(HeimdallError::InvalidConfiguration(format!(
                "fallback_provider {fallback} is not in enabled_providers"
            )));
        }

        let s = &self.switcher;
        if s.max_retries == 0 {
            return Err(invalid("switcher.max_retries must be >= 1"));
        }
        if !s.backoff_base.is_finite() || s.backoff_base <= 0.0 {
            return Err(invalid("switcher.backoff_base must be > 0"));
        }
        if s.attempt_timeout_secs == 0 {
            return Err(invalid("switcher.attempt_timeout_secs must be > 0"));
        }
        if self.health.interval_secs == 0 || self.health.check_timeout_secs == 0 {
            return Err(invalid(
                "health.interval_secs and health.check_timeout_secs must be > 0",
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(invalid("cache.ttl_secs must be > 0"));
        }
        Ok(())
    }

    /// Effective enabled set, in preference order.
    pub fn enabled(&self) -> Vec<ProviderId> {
        if !self.enabled_providers.is_empty() {
            let mut out = Vec::with_capacity(self.enabled_providers.len());
            for p in &self.enabled_providers {
                if !out.contains(p) {
                    out.push(*p);
                }
            }
            return out;
        }
        let mut out: Vec<ProviderId> = self
            .providers
            .keys()
            .filter_map(|name| name.parse().ok())
            .collect();
        for p in self.default_provider.iter().chain(self.fallback_provider.iter()) {
            if !out.contains(p) {
                out.push(*p);
            }
        }
        out
    }

    /// Per-provider rate limits keyed by id.
    pub fn rate_limits(&self) -> Result<HashMap<ProviderId, RateLimitConfig>> {
        self.rate_limits
            .iter()
            .map(|(name, limit)| Ok((name.parse::<ProviderId>()?, *limit)))
            .collect()
    }

    pub fn provider(&self, provider: ProviderId) -> Option<&ProviderSection> {
        self.providers.get(provider.as_str())
    }

    /// API key from `[providers.<name>]`, else the provider's env var.
    pub fn api_key(&self, provider: ProviderId) -> Option<String> {
        self.provider(provider)
            .and_then(|p| p.api_key.clone())
            .or_else(|| std::env::var(provider.api_key_env()).ok())
            .filter(|k| !k.is_empty())
    }

    pub fn retry_config(&self) -> RetryConfig {
        let s = &self.switcher;
        let mut retry = RetryConfig::new()
            .max_retries(s.max_retries)
            .backoff_base(s.backoff_base)
            .backoff_unit(Duration::from_millis(s.backoff_unit_ms))
            .max_delay(Duration::from_secs(s.max_delay_secs))
            .attempt_timeout(Duration::from_secs(s.attempt_timeout_secs))
            .rate_limit_wait(
                s.rate_limit_wait,
                Duration::from_secs(s.rate_limit_max_wait_secs),
            );
        for (name, section) in &self.providers {
            if let (Ok(provider), Some(n)) = (name.parse::<ProviderId>(), section.max_retries) {
                retry = retry.provider_max_retries(provider, n);
            }
        }
        retry
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig::new()
            .interval(Duration::from_secs(self.health.interval_secs))
            .check_timeout(Duration::from_secs(self.health.check_timeout_secs))
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig::new()
            .enabled(self.cache.enabled)
            .ttl(Duration::from_secs(self.cache.ttl_secs))
            .max_entries(self.cache.max_entries)
    }
}

fn invalid(msg: &str) -> HeimdallError {
    HeimdallError::InvalidConfiguration(msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.switcher, SwitcherSection::default());
        assert_eq!(config.health.interval_secs, 60);
        assert_eq!(config.cache.ttl_secs, 3600);
        assert!(config.enabled().is_empty());

        let retry = config.retry_config();
        assert_eq!(retry.max_retries, 3);
        assert_eq!(retry.attempt_timeout, Duration::from_secs(30));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn parse_full_config() {
        let toml = r#"
            default_provider = "openai"
            fallback_provider = "ollama"
            enabled_providers = ["openai", "ollama", "qwen"]

            [switcher]
            max_retries = 5
            backoff_unit_ms = 250

            [health]
            interval_secs = 15

            [cache]
            enabled = false
            redis_url = "redis://localhost:6379"

            [rate_limits.openai]
            max_tokens = 10
            refill_rate = 0.5

            [rate_limits.ollama]
            max_tokens = 0
            refill_rate = 0
            enabled = false

            [providers.ollama]
            base_url = "http://gpu-box:11434"
            model = "mistral"
        "#;
        let config = Config::parse(toml).unwrap();
        assert_eq!(config.default_provider, Some(ProviderId::OpenAi));
        assert_eq!(
            config.enabled(),
            vec![ProviderId::OpenAi, ProviderId::Ollama, ProviderId::Qwen]
        );
        assert_eq!(config.switcher.max_retries, 5);
        assert_eq!(config.health_config().interval, Duration::from_secs(15));
        assert!(!config.cache_config().enabled);

        let limits = config.rate_limits().unwrap();
        assert_eq!(limits[&ProviderId::OpenAi].max_tokens, 10.0);
        assert_eq!(limits[&ProviderId::OpenAi].tokens_per_request, 1.0);
        assert!(!limits[&ProviderId::Ollama].enabled);

        let ollama = config.provider(ProviderId::Ollama).unwrap();
        assert_eq!(ollama.model.as_deref(), Some("mistral"));
    }

    #[test]
    fn rejects_unknown_provider_names() {
        let err = Config::parse(
            r#"
            [rate_limits.skynet]
            max_tokens = 1
            refill_rate = 1
        "#,
        )
        .unwrap_err();
        assert_eq!(err.code(), "INVALID_CONFIGURATION");
        assert!(Config::parse(r#"default_provider = "skynet""#).is_err());
    }

    #[test]
    fn rejects_default_outside_enabled_set() {
        let err = Config::parse(
            r#"
            default_provider = "gemini"
            enabled_providers = ["openai"]
        "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("gemini"));
    }

    #[test]
    fn rejects_zero_intervals_and_invalid_limits() {
        assert!(Config::parse("[health]\ninterval_secs = 0").is_err());
        assert!(Config::parse("[switcher]\nmax_retries = 0").is_err());
        assert!(
            Config::parse("[rate_limits.openai]\nmax_tokens = -1\nrefill_rate = 1").is_err()
        );
    }

    #[test]
    fn enabled_defaults_to_provider_sections() {
        let config = Config::parse(
            r#"
            default_provider = "anthropic"
            [providers.ollama]
            [providers.openai]
        "#,
        )
        .unwrap();
        assert_eq!(
            config.enabled(),
            vec![ProviderId::Ollama, ProviderId::OpenAi, ProviderId::Anthropic]
        );
    }

    #[test]
    fn api_key_prefers_config_over_env() {
        let config = Config::parse(
            r#"
            [providers.gemini]
            api_key = "from-file"
        "#,
        )
        .unwrap();
        assert_eq!(
            config.api_key(ProviderId::Gemini),
            Some("from-file".to_string())
        );
    }
}
