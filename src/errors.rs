use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::DomainResult;

/// A provider denied the request, either locally (token bucket empty, block
/// window active) or upstream (HTTP 429, or 503 carrying `Retry-After`).
///
/// `partial` carries whatever `lookup_domain` had assembled before the denial;
/// it is populated only when a sub-step of a domain lookup was rate limited.
#[derive(Debug, Clone, Default)]
pub struct RateLimited {
    /// Host key the limit applies to (empty when unknown).
    pub provider: String,
    /// Suggested wait before retrying; zero means "no hint".
    pub retry_after: Duration,
    /// Partial domain result gathered before the denial.
    pub partial: Option<Box<DomainResult>>,
}

impl RateLimited {
    pub fn new(provider: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            provider: provider.into(),
            retry_after,
            partial: None,
        }
    }
}

impl fmt::Display for RateLimited {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.provider.is_empty() && !self.retry_after.is_zero() {
            write!(
                f,
                "rate limited by {}; retry after {:?}",
                self.provider, self.retry_after
            )
        } else if !self.provider.is_empty() {
            write!(f, "rate limited by {}", self.provider)
        } else {
            write!(f, "rate limited")
        }
    }
}

impl std::error::Error for RateLimited {}

/// Errors produced by the lookup client.
///
/// The enum is `Clone` so a single-flight leader's outcome can be delivered to
/// every waiter; non-clonable sources are held behind `Arc`.
#[derive(Error, Debug, Clone)]
pub enum LookupError {
    #[error(transparent)]
    RateLimited(#[from] RateLimited),

    #[error("no RDAP bootstrap match for {0}")]
    BootstrapNoMatch(String),

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("invalid IP address: {0}")]
    InvalidIp(String),

    #[error("no WHOIS registry body for {0}")]
    NoWhoisBody(String),

    #[error("upstream returned HTTP {0}")]
    UpstreamStatus(u16),

    #[error("network timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    Http(Arc<reqwest::Error>),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("DNS error: {0}")]
    Dns(Arc<trust_dns_resolver::error::ResolveError>),

    #[error("response too large")]
    ResponseTooLarge,

    #[error("invalid UTF-8 in response")]
    InvalidUtf8,

    #[error("storage backend error: {0}")]
    Storage(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl LookupError {
    /// Returns the rate-limit details when this error is a denial.
    pub fn rate_limit(&self) -> Option<&RateLimited> {
        match self {
            LookupError::RateLimited(rl) => Some(rl),
            _ => None,
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.rate_limit().is_some()
    }
}

impl From<reqwest::Error> for LookupError {
    fn from(err: reqwest::Error) -> Self {
        LookupError::Http(Arc::new(err))
    }
}

impl From<std::io::Error> for LookupError {
    fn from(err: std::io::Error) -> Self {
        LookupError::Io(Arc::new(err))
    }
}

impl From<trust_dns_resolver::error::ResolveError> for LookupError {
    fn from(err: trust_dns_resolver::error::ResolveError) -> Self {
        LookupError::Dns(Arc::new(err))
    }
}

impl From<redis::RedisError> for LookupError {
    fn from(err: redis::RedisError) -> Self {
        LookupError::Storage(err.to_string())
    }
}

impl From<config::ConfigError> for LookupError {
    fn from(err: config::ConfigError) -> Self {
        LookupError::Config(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for LookupError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        LookupError::Timeout
    }
}
