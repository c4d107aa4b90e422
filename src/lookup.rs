//! The lookup engine: cache → single-flight → bootstrap → limiter → upstream
//! → cache, with partial-result semantics when a sub-step is rate limited.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use psl::Psl;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::{CacheStore, LookupCache, RedisStore};
use crate::clock::{Clock, SystemClock};
use crate::config::{BackendKind, Config};
use crate::dns::{NameResolver, SystemResolver};
use crate::errors::{LookupError, RateLimited};
use crate::limiter::{Admission, LimiterSettings, MemoryLimiter, ProviderLimiter, RedisLimiter};
use crate::parser;
use crate::rdap::{DomainRdap, RdapClient};
use crate::singleflight::FlightGroup;
use crate::whois::{self, WhoisFetcher};
use crate::{
    DomainResult, IpInfo, IpRegistrantResult, LookupOptions, NameserverInfo, NameserverResult,
    Registration, Source,
};

static PSL: psl::List = psl::List;

/// Strips the trailing dot, trims whitespace, lowercases. Applied to every
/// domain and hostname before any cache or single-flight key is formed.
pub(crate) fn normalize_domain(input: &str) -> String {
    input.trim().trim_end_matches('.').to_lowercase()
}

pub(crate) fn normalize_hostname(input: &str) -> String {
    normalize_domain(input)
}

/// The registrable apex (eTLD+1) of a normalized domain.
pub(crate) fn registrable_apex(domain: &str) -> Option<String> {
    let parsed = PSL.domain(domain.as_bytes())?;
    std::str::from_utf8(parsed.as_bytes()).ok().map(str::to_string)
}

// Cached form of a nameserver lookup: addresses are stored as strings and
// reconstructed on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedNameserver {
    hostname: String,
    ips: Vec<String>,
}

impl CachedNameserver {
    fn into_result(self, ttl: Duration) -> NameserverResult {
        let ips = self.ips.iter().filter_map(|ip| ip.parse().ok()).collect();
        NameserverResult {
            hostname: self.hostname,
            ips,
            ttl,
        }
    }
}

struct ClientInner {
    config: Config,
    cache: LookupCache,
    limiter: Arc<dyn ProviderLimiter>,
    rdap: RdapClient,
    whois: WhoisFetcher,
    resolver: Arc<dyn NameResolver>,
    domain_flights: FlightGroup<DomainResult>,
    ns_flights: FlightGroup<NameserverResult>,
    ip_flights: FlightGroup<IpRegistrantResult>,
}

/// Registry-data lookup client. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryClient").finish_non_exhaustive()
    }
}

/// Constructs a [`RegistryClient`], optionally overriding individual
/// capabilities (resolver, clock, limiter, cache store, redis client).
pub struct RegistryClientBuilder {
    config: Config,
    clock: Option<Arc<dyn Clock>>,
    resolver: Option<Arc<dyn NameResolver>>,
    limiter: Option<Arc<dyn ProviderLimiter>>,
    cache_store: Option<Arc<dyn CacheStore>>,
    redis_client: Option<redis::Client>,
}

impl RegistryClientBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            clock: None,
            resolver: None,
            limiter: None,
            cache_store: None,
            redis_client: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn limiter(mut self, limiter: Arc<dyn ProviderLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache_store = Some(store);
        self
    }

    pub fn redis_client(mut self, client: redis::Client) -> Self {
        self.redis_client = Some(client);
        self
    }

    pub fn build(self) -> Result<RegistryClient, LookupError> {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let settings = LimiterSettings::from_config(&self.config);

        let (cache, limiter) = match self.config.backend {
            BackendKind::Memory => {
                let cache = match self.cache_store {
                    Some(store) => LookupCache::new(store),
                    None => LookupCache::memory(clock.clone()),
                };
                let limiter = self.limiter.unwrap_or_else(|| {
                    Arc::new(MemoryLimiter::new(settings, clock.clone())) as Arc<dyn ProviderLimiter>
                });
                (cache, limiter)
            }
            BackendKind::Redis => {
                let client = match (self.cache_store.is_some() && self.limiter.is_some(),
                                    self.redis_client) {
                    (true, _) => None,
                    (false, Some(client)) => Some(client),
                    (false, None) => match &self.config.redis_url {
                        Some(url) => Some(redis::Client::open(url.as_str()).map_err(|err| {
                            LookupError::Config(format!("invalid redis url: {}", err))
                        })?),
                        None => {
                            return Err(LookupError::Config(
                                "redis backend selected but no client or redis_url configured"
                                    .to_string(),
                            ))
                        }
                    },
                };

                let prefix = self.config.key_prefix.clone();
                let cache = match (self.cache_store, &client) {
                    (Some(store), _) => LookupCache::new(store),
                    (None, Some(client)) => LookupCache::new(Arc::new(RedisStore::new(
                        client.clone(),
                        prefix.clone(),
                    ))),
                    (None, None) => unreachable!("redis client resolved above"),
                };
                let limiter = match (self.limiter, client) {
                    (Some(limiter), _) => limiter,
                    (None, Some(client)) => Arc::new(RedisLimiter::new(
                        client,
                        prefix,
                        settings,
                        clock.clone(),
                    )) as Arc<dyn ProviderLimiter>,
                    (None, None) => unreachable!("redis client resolved above"),
                };
                (cache, limiter)
            }
        };

        let resolver = match self.resolver {
            Some(resolver) => resolver,
            None => Arc::new(SystemResolver::new()?) as Arc<dyn NameResolver>,
        };

        let rdap = RdapClient::new(&self.config, limiter.clone(), clock.clone())?;
        let whois = WhoisFetcher::new(
            self.config.whois_timeout(),
            self.config.max_response_size,
            self.config.concurrent_whois_queries,
        );

        info!(backend = ?self.config.backend, "registry lookup client initialized");

        Ok(RegistryClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                cache,
                limiter,
                rdap,
                whois,
                resolver,
                domain_flights: FlightGroup::new(),
                ns_flights: FlightGroup::new(),
                ip_flights: FlightGroup::new(),
            }),
        })
    }
}

impl RegistryClient {
    pub fn new(config: Config) -> Result<Self, LookupError> {
        Self::builder(config).build()
    }

    pub fn builder(config: Config) -> RegistryClientBuilder {
        RegistryClientBuilder::new(config)
    }

    /// Resolves registration facts, nameservers, and per-IP registrants for a
    /// domain.
    ///
    /// When a sub-step is rate limited mid-flight, the returned
    /// [`RateLimited`] error carries the partial [`DomainResult`] assembled so
    /// far. Results are cached per apex only on full success.
    pub async fn lookup_domain(
        &self,
        domain: &str,
        opts: &LookupOptions,
    ) -> Result<DomainResult, LookupError> {
        let name = normalize_domain(domain);
        let apex = registrable_apex(&name)
            .ok_or_else(|| LookupError::InvalidDomain(domain.to_string()))?;
        let key = format!("domain:{}", apex);

        if !opts.force_refresh {
            if let Some(hit) = self.cache_get::<DomainResult>(&key).await {
                return Ok(hit);
            }
        }

        let client = self.clone();
        let flight_name = name.clone();
        let flight_apex = apex.clone();
        let flight_key = key.clone();
        let force = opts.force_refresh;
        self.inner
            .domain_flights
            .run(&key, move || {
                async move {
                    client
                        .domain_lookup_leader(flight_name, flight_apex, flight_key, force)
                        .await
                }
                .boxed()
            })
            .await
    }

    /// Resolves the A/AAAA addresses of a nameserver.
    ///
    /// The result is cached on successful resolution even when an enclosing
    /// domain lookup later fails.
    pub async fn lookup_nameserver(
        &self,
        hostname: &str,
        opts: &LookupOptions,
    ) -> Result<NameserverResult, LookupError> {
        let hostname = normalize_hostname(hostname);
        if hostname.is_empty() {
            return Err(LookupError::InvalidDomain(hostname));
        }
        let key = format!("ns:{}", hostname);
        let ttl = self.inner.config.nameserver_ttl();

        if !opts.force_refresh {
            if let Some(cached) = self.cache_get::<CachedNameserver>(&key).await {
                return Ok(cached.into_result(ttl));
            }
        }

        let client = self.clone();
        let flight_host = hostname.clone();
        let flight_key = key.clone();
        let force = opts.force_refresh;
        self.inner
            .ns_flights
            .run(&key, move || {
                async move {
                    let ttl = client.inner.config.nameserver_ttl();
                    if !force {
                        if let Some(cached) =
                            client.cache_get::<CachedNameserver>(&flight_key).await
                        {
                            return Ok(cached.into_result(ttl));
                        }
                    }

                    let ips = client.inner.resolver.ip_records(&flight_host).await?;
                    let cached = CachedNameserver {
                        hostname: flight_host.clone(),
                        ips: ips.iter().map(|ip| ip.to_string()).collect(),
                    };
                    client.cache_set(&flight_key, &cached, ttl).await;

                    Ok(NameserverResult {
                        hostname: flight_host,
                        ips,
                        ttl,
                    })
                }
                .boxed()
            })
            .await
    }

    /// Resolves the registrant organization for an IP address via RDAP.
    pub async fn lookup_ip_registrant(
        &self,
        ip: &str,
        opts: &LookupOptions,
    ) -> Result<IpRegistrantResult, LookupError> {
        let parsed: IpAddr = ip
            .trim()
            .parse()
            .map_err(|_| LookupError::InvalidIp(ip.to_string()))?;
        let key = format!("ipreg:{}", parsed);

        if !opts.force_refresh {
            if let Some(hit) = self.cache_get::<IpRegistrantResult>(&key).await {
                return Ok(hit);
            }
        }

        let client = self.clone();
        let flight_key = key.clone();
        let force = opts.force_refresh;
        self.inner
            .ip_flights
            .run(&key, move || {
                async move {
                    if !force {
                        if let Some(hit) =
                            client.cache_get::<IpRegistrantResult>(&flight_key).await
                        {
                            return Ok(hit);
                        }
                    }

                    let result = client.inner.rdap.ip_registrant(&parsed).await?;
                    client
                        .cache_set(
                            &flight_key,
                            &result,
                            client.inner.config.ip_registrant_ttl(),
                        )
                        .await;
                    Ok(result)
                }
                .boxed()
            })
            .await
    }

    async fn domain_lookup_leader(
        self,
        name: String,
        apex: String,
        key: String,
        force: bool,
    ) -> Result<DomainResult, LookupError> {
        // Re-check under the flight: a previous leader may have populated the
        // cache while this caller waited for the map slot.
        if !force {
            if let Some(hit) = self.cache_get::<DomainResult>(&key).await {
                return Ok(hit);
            }
        }

        let mut rdap_nameservers: Vec<String> = Vec::new();
        let (registration, source, provider_key) = match self.inner.rdap.domain(&apex).await? {
            DomainRdap::Found {
                registration,
                nameservers,
                provider,
            } => {
                rdap_nameservers = nameservers;
                (Some(registration), Source::Rdap, provider)
            }
            DomainRdap::NoMatch => {
                debug!(apex = %apex, "falling back to WHOIS");
                let (registration, provider) = self.whois_registration(&apex).await?;
                (Some(registration), Source::Whois, provider)
            }
        };

        let ns_names = self
            .select_nameservers(&name, &apex, source, &rdap_nameservers)
            .await;

        let mut nameservers = Vec::new();
        let mut denial: Option<RateLimited> = None;
        'expansion: for hostname in &ns_names {
            let mut entry = NameserverInfo {
                hostname: hostname.clone(),
                ips: Vec::new(),
            };
            match self
                .lookup_nameserver(hostname, &LookupOptions::default())
                .await
            {
                Ok(resolved) => {
                    for ip in resolved.ips {
                        let address = ip.to_string();
                        match self
                            .lookup_ip_registrant(&address, &LookupOptions::default())
                            .await
                        {
                            Ok(found) => entry.ips.push(IpInfo {
                                address,
                                registrant_name: found.registrant,
                            }),
                            Err(LookupError::RateLimited(limited)) => {
                                nameservers.push(entry);
                                denial = Some(limited);
                                break 'expansion;
                            }
                            Err(err) => {
                                // Tolerated: record the address without a
                                // registrant and keep going.
                                warn!(ip = %address, %err, "IP registrant lookup failed");
                                entry.ips.push(IpInfo {
                                    address,
                                    registrant_name: String::new(),
                                });
                            }
                        }
                    }
                    nameservers.push(entry);
                }
                Err(err) => {
                    warn!(hostname = %hostname, %err, "nameserver resolution failed");
                    nameservers.push(entry);
                }
            }
        }

        let suggested_delay = denial
            .as_ref()
            .map(|limited| limited.retry_after)
            .unwrap_or_default();
        let result = DomainResult {
            registration,
            nameservers,
            source,
            provider_key,
            suggested_delay,
        };

        if let Some(mut limited) = denial {
            limited.partial = Some(Box::new(result));
            return Err(limited.into());
        }

        self.cache_set(&key, &result, self.inner.config.domain_ttl())
            .await;
        Ok(result)
    }

    /// WHOIS fallback: IANA bootstrap for the TLD, then the referral plus the
    /// conventional registry hosts; the first non-empty body wins. A
    /// `Registrar WHOIS Server` pointer in the winning body is followed when
    /// the limiter admits it.
    async fn whois_registration(
        &self,
        apex: &str,
    ) -> Result<(Registration, String), LookupError> {
        let bootstrap_host = self.inner.config.whois_bootstrap_host.clone();
        let tld = apex.rsplit('.').next().unwrap_or(apex).to_string();

        match self.inner.limiter.acquire(&bootstrap_host).await? {
            Admission::Granted => {}
            Admission::Denied(retry_after) => {
                return Err(RateLimited::new(bootstrap_host, retry_after).into());
            }
        }
        let iana_body = self.inner.whois.query(&bootstrap_host, &tld).await?;

        let mut candidates: Vec<String> = Vec::new();
        if let Some(referral) = whois::iana_referral(&iana_body) {
            candidates.push(referral);
        }
        candidates.push(format!("whois.registry.{}", tld));
        candidates.push(format!("whois.nic.{}", tld));
        let mut seen = HashSet::new();
        candidates.retain(|host| seen.insert(host.clone()));

        let mut last_err: Option<LookupError> = None;
        let mut chosen: Option<(String, String)> = None;
        for host in candidates {
            match self.inner.limiter.acquire(&host).await {
                Ok(Admission::Granted) => {}
                Ok(Admission::Denied(retry_after)) => {
                    last_err = Some(RateLimited::new(host.clone(), retry_after).into());
                    continue;
                }
                Err(err) => {
                    last_err = Some(err);
                    continue;
                }
            }
            match self.inner.whois.query(&host, apex).await {
                Ok(body) if !body.trim().is_empty() => {
                    chosen = Some((host, body));
                    break;
                }
                Ok(_) => debug!(host = %host, "empty WHOIS body"),
                Err(err) => {
                    warn!(host = %host, %err, "WHOIS query failed");
                    last_err = Some(err);
                }
            }
        }

        let Some((mut host, mut body)) = chosen else {
            return Err(last_err.unwrap_or_else(|| LookupError::NoWhoisBody(apex.to_string())));
        };

        if let Some(registrar_host) = parser::registrar_whois_server(&body) {
            if !registrar_host.eq_ignore_ascii_case(&host) {
                match self.inner.limiter.acquire(&registrar_host).await {
                    Ok(Admission::Granted) => {
                        match self.inner.whois.query(&registrar_host, apex).await {
                            Ok(registrar_body) if !registrar_body.trim().is_empty() => {
                                host = registrar_host;
                                body = registrar_body;
                            }
                            Ok(_) => debug!(host = %registrar_host, "empty registrar WHOIS body"),
                            Err(err) => {
                                // The registry body is still usable.
                                warn!(host = %registrar_host, %err, "registrar WHOIS fetch failed")
                            }
                        }
                    }
                    Ok(Admission::Denied(retry_after)) => {
                        return Err(RateLimited::new(registrar_host, retry_after).into());
                    }
                    Err(err) => {
                        warn!(host = %registrar_host, %err, "registrar limiter unavailable")
                    }
                }
            }
        }

        let registration = parser::parse_registration(&body, apex);
        Ok((registration, host))
    }

    /// Which nameserver names to expand: RDAP's answer for an apex query, a
    /// delegated zone discovered by walking the label chain, or the apex NS.
    async fn select_nameservers(
        &self,
        name: &str,
        apex: &str,
        source: Source,
        rdap_names: &[String],
    ) -> Vec<String> {
        if name == apex && source == Source::Rdap && !rdap_names.is_empty() {
            return rdap_names.to_vec();
        }

        let (walked, delegated) = self.delegation_walk(name, apex).await;
        if delegated && !walked.is_empty() {
            return walked;
        }
        if !rdap_names.is_empty() {
            return rdap_names.to_vec();
        }
        walked
    }

    // Walks NS queries from the full name down to the apex; the first level
    // with records wins. The zone counts as delegated only when that level is
    // below the apex.
    async fn delegation_walk(&self, name: &str, apex: &str) -> (Vec<String>, bool) {
        let mut current = name.to_string();
        loop {
            match self.inner.resolver.ns_records(&current).await {
                Ok(records) if !records.is_empty() => {
                    let names = records.iter().map(|r| normalize_hostname(r)).collect();
                    return (names, current != apex);
                }
                Ok(_) => {}
                Err(err) => warn!(zone = %current, %err, "NS query failed during delegation walk"),
            }
            if current == apex {
                break;
            }
            current = match current.split_once('.') {
                Some((_, rest)) if rest.len() >= apex.len() => rest.to_string(),
                _ => break,
            };
        }
        (Vec::new(), false)
    }

    async fn cache_get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.inner.cache.get(key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(key, %err, "cache read failed");
                None
            }
        }
    }

    async fn cache_set<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        if let Err(err) = self.inner.cache.set(key, value, ttl).await {
            warn!(key, %err, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_rules() {
        assert_eq!(normalize_domain("Example.COM."), "example.com");
        assert_eq!(normalize_domain("  ns1.Example.net  "), "ns1.example.net");
        assert_eq!(normalize_hostname("A.IANA-SERVERS.NET."), "a.iana-servers.net");
    }

    #[test]
    fn apex_is_etld_plus_one() {
        assert_eq!(
            registrable_apex("example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            registrable_apex("deep.sub.example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            registrable_apex("www.example.co.uk"),
            Some("example.co.uk".to_string())
        );
        assert_eq!(registrable_apex("com"), None);
        assert_eq!(registrable_apex(""), None);
    }

    #[test]
    fn cached_nameserver_round_trip() {
        let cached = CachedNameserver {
            hostname: "ns1.example.com".to_string(),
            ips: vec!["192.0.2.10".to_string(), "2001:db8::1".to_string(), "junk".to_string()],
        };
        let result = cached.into_result(Duration::from_secs(300));
        assert_eq!(result.hostname, "ns1.example.com");
        // Unparseable stored addresses are dropped on reconstruction.
        assert_eq!(result.ips.len(), 2);
        assert_eq!(result.ttl, Duration::from_secs(300));
    }

    #[test]
    fn missing_redis_settings_fail_construction() {
        let mut config = Config::default();
        config.backend = BackendKind::Redis;
        let err = RegistryClient::new(config).unwrap_err();
        assert!(matches!(err, LookupError::Config(_)));
    }
}
