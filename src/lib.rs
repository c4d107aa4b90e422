//! # Registry Lookup Library
//!
//! A registry-data lookup client for Rust: resolves domain-registration facts
//! (registrar, registry, lifecycle timestamps, DNSSEC state, contacts, status
//! codes), authoritative nameservers, nameserver IP addresses, and per-IP
//! registrant organizations.
//!
//! ## Features
//!
//! - RDAP first, selected through the IANA bootstrap registries
//! - WHOIS fallback (TCP 43) with IANA referral discovery
//! - DNS delegation discovery and A/AAAA expansion
//! - Multi-granularity caching (domain / nameserver / IP registrant) on a
//!   memory or redis backend
//! - Per-provider token-bucket rate limiting honoring upstream `Retry-After`
//! - Single-flight deduplication of concurrent lookups
//! - Partial results when a sub-step is rate limited mid-flight
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use registry_lookup::{Config, LookupOptions, RegistryClient};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = RegistryClient::new(Config::default())?;
//!     let result = client
//!         .lookup_domain("example.com", &LookupOptions::default())
//!         .await?;
//!
//!     if let Some(registration) = &result.registration {
//!         println!("registrar: {}", registration.registrar.name);
//!     }
//!     for ns in &result.nameservers {
//!         println!("ns: {} ({} addresses)", ns.hostname, ns.ips.len());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod clock;
pub mod config;
pub mod dns;
pub mod errors;
pub mod limiter;
pub mod lookup;
pub mod parser;
pub mod rdap;
pub mod retry_after;
mod singleflight;
pub mod whois;

pub use cache::{CacheStore, LookupCache, MemoryStore, RedisStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{BackendKind, Config};
pub use dns::{NameResolver, SystemResolver};
pub use errors::{LookupError, RateLimited};
pub use limiter::{Admission, LimiterSettings, MemoryLimiter, ProviderLimiter, RedisLimiter};
pub use lookup::{RegistryClient, RegistryClientBuilder};

use std::net::IpAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a registration record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rdap,
    Whois,
}

impl Default for Source {
    fn default() -> Self {
        Source::Rdap
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Source::Rdap => write!(f, "rdap"),
            Source::Whois => write!(f, "whois"),
        }
    }
}

/// Per-call options for the lookup operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct LookupOptions {
    /// Skip the cache read (the result is still written back).
    pub force_refresh: bool,
}

/// Registrar identity attached to a registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registrar {
    pub name: String,
    pub iana_id: String,
    pub url: String,
}

/// Registry identity; for RDAP sources the name is the provider key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryIdentity {
    pub name: String,
    pub url: String,
}

/// A single registration contact. Redacted fields are empty, never the
/// literal "REDACTED".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    pub email: String,
    pub phone: String,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.name.is_empty() && self.email.is_empty() && self.phone.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Contacts {
    pub registrant: Option<Contact>,
    pub admin: Option<Contact>,
    pub tech: Option<Contact>,
}

/// Abuse contact; carries reachability only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbuseContact {
    pub email: String,
    pub phone: String,
}

/// A DS record surfaced from the registry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DsRecord {
    pub key_tag: u16,
    pub algorithm: u8,
    pub digest_type: u8,
    pub digest: String,
}

/// DNSSEC state as reported by the registry; `enabled` is absent when the
/// source did not state it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dnssec {
    pub enabled: Option<bool>,
    pub ds: Vec<DsRecord>,
}

/// Registration facts for a domain. Timestamps are absent (not zero) when the
/// source did not provide them; `statuses` preserves the source order and may
/// contain duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub domain: String,
    pub handle: String,
    pub registry_domain_id: String,
    pub registrar: Registrar,
    pub registry: RegistryIdentity,
    pub statuses: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub dnssec: Dnssec,
    pub contacts: Contacts,
    pub abuse: AbuseContact,
    pub source: Source,
}

/// One resolved address of a nameserver, annotated with the registrant
/// organization of the network it belongs to (empty when unknown).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpInfo {
    pub address: String,
    pub registrant_name: String,
}

/// A nameserver within a [`DomainResult`], in delegation order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NameserverInfo {
    pub hostname: String,
    pub ips: Vec<IpInfo>,
}

/// Final artifact of `lookup_domain`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainResult {
    pub registration: Option<Registration>,
    pub nameservers: Vec<NameserverInfo>,
    pub source: Source,
    /// Host of the authoritative upstream actually consulted.
    pub provider_key: String,
    /// Largest `Retry-After` seen by a sub-step; zero when none.
    pub suggested_delay: Duration,
}

/// Result of `lookup_nameserver`.
#[derive(Debug, Clone, PartialEq)]
pub struct NameserverResult {
    pub hostname: String,
    pub ips: Vec<IpAddr>,
    pub ttl: Duration,
}

/// Result of `lookup_ip_registrant`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IpRegistrantResult {
    pub ip: String,
    /// Registrant organization; may be empty.
    pub registrant: String,
    pub provider_key: String,
}
