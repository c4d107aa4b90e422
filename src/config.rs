use std::time::Duration;

use serde::Deserialize;

/// Storage backend for cache entries and limiter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Memory,
    Redis,
}

impl BackendKind {
    fn parse(value: &str) -> Result<Self, config::ConfigError> {
        match value.trim().to_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "redis" => Ok(BackendKind::Redis),
            other => Err(config::ConfigError::Message(format!(
                "unknown backend '{}', expected 'memory' or 'redis'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Backend for both the cache and the limiter state.
    pub backend: BackendKind,
    /// Connection URL for the redis backend (e.g. "redis://localhost:6379").
    pub redis_url: Option<String>,
    /// Prefix applied to every key stored in the shared backend.
    pub key_prefix: String,

    pub domain_ttl_seconds: u64,
    pub nameserver_ttl_seconds: u64,
    pub ip_registrant_ttl_seconds: u64,

    pub rate_per_second: f64,
    pub burst: f64,
    pub default_block_seconds: u64,
    pub limiter_state_ttl_seconds: u64,

    pub whois_bootstrap_host: String,
    pub rdap_bootstrap_dns_url: String,
    pub rdap_bootstrap_ipv4_url: String,
    pub rdap_bootstrap_ipv6_url: String,

    pub whois_timeout_seconds: u64,
    pub rdap_timeout_seconds: u64,
    pub max_response_size: usize,
    pub concurrent_whois_queries: usize,
}

#[derive(Debug, Clone, Deserialize)]
struct ConfigData {
    backend: String,
    redis_url: Option<String>,
    key_prefix: String,
    domain_ttl_seconds: u64,
    nameserver_ttl_seconds: u64,
    ip_registrant_ttl_seconds: u64,
    rate_per_second: f64,
    burst: f64,
    default_block_seconds: u64,
    limiter_state_ttl_seconds: u64,
    whois_bootstrap_host: String,
    rdap_bootstrap_dns_url: String,
    rdap_bootstrap_ipv4_url: String,
    rdap_bootstrap_ipv6_url: String,
    whois_timeout_seconds: u64,
    rdap_timeout_seconds: u64,
    max_response_size: usize,
    concurrent_whois_queries: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: BackendKind::Memory,
            redis_url: None,
            key_prefix: String::new(),
            domain_ttl_seconds: 15 * 60,
            nameserver_ttl_seconds: 5 * 60,
            ip_registrant_ttl_seconds: 6 * 60 * 60,
            rate_per_second: 1.0,
            burst: 5.0,
            default_block_seconds: 2,
            limiter_state_ttl_seconds: 30 * 60,
            whois_bootstrap_host: "whois.iana.org".to_string(),
            rdap_bootstrap_dns_url: "https://data.iana.org/rdap/dns.json".to_string(),
            rdap_bootstrap_ipv4_url: "https://data.iana.org/rdap/ipv4.json".to_string(),
            rdap_bootstrap_ipv6_url: "https://data.iana.org/rdap/ipv6.json".to_string(),
            whois_timeout_seconds: 15,
            rdap_timeout_seconds: 15,
            max_response_size: 1024 * 1024,
            concurrent_whois_queries: 8,
        }
    }
}

impl Config {
    /// Loads defaults and applies environment-variable overrides.
    pub fn load() -> Result<Self, config::ConfigError> {
        let defaults = Config::default();

        let mut settings = config::Config::builder()
            .set_default("backend", "memory")?
            .set_default("key_prefix", defaults.key_prefix.clone())?
            .set_default("domain_ttl_seconds", defaults.domain_ttl_seconds as i64)?
            .set_default(
                "nameserver_ttl_seconds",
                defaults.nameserver_ttl_seconds as i64,
            )?
            .set_default(
                "ip_registrant_ttl_seconds",
                defaults.ip_registrant_ttl_seconds as i64,
            )?
            .set_default("rate_per_second", defaults.rate_per_second)?
            .set_default("burst", defaults.burst)?
            .set_default("default_block_seconds", defaults.default_block_seconds as i64)?
            .set_default(
                "limiter_state_ttl_seconds",
                defaults.limiter_state_ttl_seconds as i64,
            )?
            .set_default("whois_bootstrap_host", defaults.whois_bootstrap_host.clone())?
            .set_default(
                "rdap_bootstrap_dns_url",
                defaults.rdap_bootstrap_dns_url.clone(),
            )?
            .set_default(
                "rdap_bootstrap_ipv4_url",
                defaults.rdap_bootstrap_ipv4_url.clone(),
            )?
            .set_default(
                "rdap_bootstrap_ipv6_url",
                defaults.rdap_bootstrap_ipv6_url.clone(),
            )?
            .set_default("whois_timeout_seconds", defaults.whois_timeout_seconds as i64)?
            .set_default("rdap_timeout_seconds", defaults.rdap_timeout_seconds as i64)?
            .set_default("max_response_size", defaults.max_response_size as i64)?
            .set_default(
                "concurrent_whois_queries",
                defaults.concurrent_whois_queries as i64,
            )?;

        settings = Self::apply_env_overrides(settings)?;

        let data: ConfigData = settings.build()?.try_deserialize()?;
        Self::from_data(data)
    }

    fn from_data(data: ConfigData) -> Result<Self, config::ConfigError> {
        Ok(Config {
            backend: BackendKind::parse(&data.backend)?,
            redis_url: data.redis_url,
            key_prefix: data.key_prefix,
            domain_ttl_seconds: data.domain_ttl_seconds,
            nameserver_ttl_seconds: data.nameserver_ttl_seconds,
            ip_registrant_ttl_seconds: data.ip_registrant_ttl_seconds,
            rate_per_second: data.rate_per_second,
            burst: data.burst,
            default_block_seconds: data.default_block_seconds,
            limiter_state_ttl_seconds: data.limiter_state_ttl_seconds,
            whois_bootstrap_host: data.whois_bootstrap_host,
            rdap_bootstrap_dns_url: data.rdap_bootstrap_dns_url,
            rdap_bootstrap_ipv4_url: data.rdap_bootstrap_ipv4_url,
            rdap_bootstrap_ipv6_url: data.rdap_bootstrap_ipv6_url,
            whois_timeout_seconds: data.whois_timeout_seconds,
            rdap_timeout_seconds: data.rdap_timeout_seconds,
            max_response_size: data.max_response_size,
            concurrent_whois_queries: data.concurrent_whois_queries,
        })
    }

    fn apply_env_overrides(
        mut settings: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, config::ConfigError> {
        let env_mappings = [
            ("REGISTRY_LOOKUP_BACKEND", "backend"),
            ("REGISTRY_LOOKUP_REDIS_URL", "redis_url"),
            ("REGISTRY_LOOKUP_KEY_PREFIX", "key_prefix"),
            ("REGISTRY_LOOKUP_DOMAIN_TTL_SECONDS", "domain_ttl_seconds"),
            (
                "REGISTRY_LOOKUP_NAMESERVER_TTL_SECONDS",
                "nameserver_ttl_seconds",
            ),
            (
                "REGISTRY_LOOKUP_IP_REGISTRANT_TTL_SECONDS",
                "ip_registrant_ttl_seconds",
            ),
            ("REGISTRY_LOOKUP_RATE_PER_SECOND", "rate_per_second"),
            ("REGISTRY_LOOKUP_BURST", "burst"),
            (
                "REGISTRY_LOOKUP_DEFAULT_BLOCK_SECONDS",
                "default_block_seconds",
            ),
            (
                "REGISTRY_LOOKUP_LIMITER_STATE_TTL_SECONDS",
                "limiter_state_ttl_seconds",
            ),
            (
                "REGISTRY_LOOKUP_WHOIS_BOOTSTRAP_HOST",
                "whois_bootstrap_host",
            ),
            (
                "REGISTRY_LOOKUP_RDAP_BOOTSTRAP_DNS_URL",
                "rdap_bootstrap_dns_url",
            ),
            (
                "REGISTRY_LOOKUP_RDAP_BOOTSTRAP_IPV4_URL",
                "rdap_bootstrap_ipv4_url",
            ),
            (
                "REGISTRY_LOOKUP_RDAP_BOOTSTRAP_IPV6_URL",
                "rdap_bootstrap_ipv6_url",
            ),
            (
                "REGISTRY_LOOKUP_WHOIS_TIMEOUT_SECONDS",
                "whois_timeout_seconds",
            ),
            (
                "REGISTRY_LOOKUP_RDAP_TIMEOUT_SECONDS",
                "rdap_timeout_seconds",
            ),
            ("REGISTRY_LOOKUP_MAX_RESPONSE_SIZE", "max_response_size"),
            (
                "REGISTRY_LOOKUP_CONCURRENT_WHOIS_QUERIES",
                "concurrent_whois_queries",
            ),
        ];

        for (env_var, config_key) in env_mappings {
            if let Ok(value) = std::env::var(env_var) {
                settings = settings.set_override(config_key, value)?;
            }
        }

        Ok(settings)
    }

    pub fn domain_ttl(&self) -> Duration {
        Duration::from_secs(self.domain_ttl_seconds)
    }

    pub fn nameserver_ttl(&self) -> Duration {
        Duration::from_secs(self.nameserver_ttl_seconds)
    }

    pub fn ip_registrant_ttl(&self) -> Duration {
        Duration::from_secs(self.ip_registrant_ttl_seconds)
    }

    pub fn default_block(&self) -> Duration {
        Duration::from_secs(self.default_block_seconds)
    }

    pub fn limiter_state_ttl(&self) -> Duration {
        Duration::from_secs(self.limiter_state_ttl_seconds)
    }

    pub fn whois_timeout(&self) -> Duration {
        Duration::from_secs(self.whois_timeout_seconds)
    }

    pub fn rdap_timeout(&self) -> Duration {
        Duration::from_secs(self.rdap_timeout_seconds)
    }
}
