//! RDAP (Registration Data Access Protocol) client.
//!
//! Provider selection is bootstrap-driven: the IANA bootstrap registries map a
//! TLD or an IP prefix to one or more base URLs, and the chosen URL's host is
//! the provider key used for rate limiting.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::clock::Clock;
use crate::config::Config;
use crate::errors::{LookupError, RateLimited};
use crate::limiter::{Admission, ProviderLimiter};
use crate::lookup::normalize_domain;
use crate::retry_after::parse_retry_after;
use crate::{
    Contact, Contacts, DsRecord, IpRegistrantResult, Registration, RegistryIdentity, Source,
};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Bootstrap {
    services: Vec<BootstrapService>,
}

// Bootstrap services are two-element arrays: [queries, base URLs].
#[derive(Debug, Clone, Deserialize)]
struct BootstrapService(Vec<String>, Vec<String>);

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapDomain {
    #[serde(rename = "ldhName")]
    pub ldh_name: Option<String>,
    pub handle: Option<String>,
    pub status: Option<Vec<String>>,
    pub events: Option<Vec<RdapEvent>>,
    pub entities: Option<Vec<RdapEntity>>,
    pub nameservers: Option<Vec<RdapNameserver>>,
    #[serde(rename = "publicIds")]
    pub public_ids: Option<Vec<RdapPublicId>>,
    #[serde(rename = "secureDNS")]
    pub secure_dns: Option<RdapSecureDns>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapNameserver {
    #[serde(rename = "ldhName")]
    pub ldh_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapEvent {
    #[serde(rename = "eventAction")]
    pub event_action: Option<String>,
    #[serde(rename = "eventDate")]
    pub event_date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapEntity {
    pub roles: Option<Vec<String>>,
    #[serde(rename = "vcardArray")]
    pub vcard_array: Option<serde_json::Value>,
    #[serde(rename = "publicIds")]
    pub public_ids: Option<Vec<RdapPublicId>>,
    pub links: Option<Vec<RdapLink>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapPublicId {
    #[serde(rename = "type")]
    pub id_type: Option<String>,
    pub identifier: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapLink {
    pub href: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapSecureDns {
    #[serde(rename = "delegationSigned")]
    pub delegation_signed: Option<bool>,
    #[serde(rename = "dsData", alias = "ds")]
    pub ds_data: Option<Vec<RdapDsData>>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RdapDsData {
    #[serde(rename = "keyTag")]
    pub key_tag: Option<u16>,
    pub algorithm: Option<u8>,
    #[serde(rename = "digestType")]
    pub digest_type: Option<u8>,
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RdapIpNetwork {
    entities: Option<Vec<RdapEntity>>,
}

/// Outcome of the RDAP path for a domain.
pub(crate) enum DomainRdap {
    Found {
        registration: Registration,
        nameservers: Vec<String>,
        provider: String,
    },
    /// Bootstrap had no URL for the TLD, or the response carried no domain
    /// object; the caller falls back to WHOIS.
    NoMatch,
}

pub(crate) struct RdapClient {
    http: reqwest::Client,
    limiter: Arc<dyn ProviderLimiter>,
    clock: Arc<dyn Clock>,
    default_block: Duration,
    dns_bootstrap_url: String,
    ipv4_bootstrap_url: String,
    ipv6_bootstrap_url: String,
    dns_bootstrap: OnceCell<Bootstrap>,
    ipv4_bootstrap: OnceCell<Bootstrap>,
    ipv6_bootstrap: OnceCell<Bootstrap>,
}

impl RdapClient {
    pub fn new(
        config: &Config,
        limiter: Arc<dyn ProviderLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LookupError> {
        let http = reqwest::Client::builder()
            .timeout(config.rdap_timeout())
            .user_agent(concat!("registry-lookup/", env!("CARGO_PKG_VERSION")))
            .gzip(true)
            .build()?;

        let mut default_block = config.default_block();
        if default_block.is_zero() {
            default_block = Duration::from_secs(2);
        }

        Ok(Self {
            http,
            limiter,
            clock,
            default_block,
            dns_bootstrap_url: config.rdap_bootstrap_dns_url.clone(),
            ipv4_bootstrap_url: config.rdap_bootstrap_ipv4_url.clone(),
            ipv6_bootstrap_url: config.rdap_bootstrap_ipv6_url.clone(),
            dns_bootstrap: OnceCell::new(),
            ipv4_bootstrap: OnceCell::new(),
            ipv6_bootstrap: OnceCell::new(),
        })
    }

    /// RDAP lookup for a registrable apex.
    pub async fn domain(&self, apex: &str) -> Result<DomainRdap, LookupError> {
        let tld = apex.rsplit('.').next().unwrap_or(apex);
        let bootstrap = self
            .bootstrap(&self.dns_bootstrap, &self.dns_bootstrap_url)
            .await?;

        let urls = bootstrap
            .services
            .iter()
            .find(|service| service.0.iter().any(|t| t.eq_ignore_ascii_case(tld)))
            .map(|service| service.1.as_slice())
            .unwrap_or_default();

        let Some((base, provider)) = select_base(urls) else {
            debug!(tld, "no RDAP bootstrap match");
            return Ok(DomainRdap::NoMatch);
        };

        let url = base
            .join(&format!("domain/{}", apex))
            .map_err(|err| LookupError::Internal(format!("RDAP URL for {}: {}", apex, err)))?;
        let body = self.fetch(&provider, url).await?;

        let domain: RdapDomain = match serde_json::from_str(&body) {
            Ok(domain) => domain,
            Err(err) => {
                warn!(apex, %err, "RDAP body is not a domain object");
                return Ok(DomainRdap::NoMatch);
            }
        };
        if domain.ldh_name.is_none() {
            return Ok(DomainRdap::NoMatch);
        }

        let nameservers = domain
            .nameservers
            .as_deref()
            .unwrap_or_default()
            .iter()
            .filter_map(|ns| ns.ldh_name.as_deref())
            .map(normalize_domain)
            .collect();

        let registration = map_domain(&domain, &provider);
        Ok(DomainRdap::Found {
            registration,
            nameservers,
            provider,
        })
    }

    /// RDAP lookup of the registrant organization for an IP address.
    pub async fn ip_registrant(&self, ip: &IpAddr) -> Result<IpRegistrantResult, LookupError> {
        let (cell, bootstrap_url) = match ip {
            IpAddr::V4(_) => (&self.ipv4_bootstrap, &self.ipv4_bootstrap_url),
            IpAddr::V6(_) => (&self.ipv6_bootstrap, &self.ipv6_bootstrap_url),
        };
        let bootstrap = self.bootstrap(cell, bootstrap_url).await?;

        let urls = bootstrap
            .services
            .iter()
            .find(|service| service.0.iter().any(|cidr| cidr_contains(cidr, ip)))
            .map(|service| service.1.as_slice())
            .unwrap_or_default();

        let Some((base, provider)) = select_base(urls) else {
            return Err(LookupError::BootstrapNoMatch(ip.to_string()));
        };

        let url = base
            .join(&format!("ip/{}", ip))
            .map_err(|err| LookupError::Internal(format!("RDAP URL for {}: {}", ip, err)))?;
        let body = self.fetch(&provider, url).await?;

        let registrant = serde_json::from_str::<RdapIpNetwork>(&body)
            .ok()
            .and_then(|network| ip_registrant_name(&network))
            .unwrap_or_default();

        Ok(IpRegistrantResult {
            ip: ip.to_string(),
            registrant,
            provider_key: provider,
        })
    }

    async fn bootstrap<'a>(
        &self,
        cell: &'a OnceCell<Bootstrap>,
        url: &str,
    ) -> Result<&'a Bootstrap, LookupError> {
        cell.get_or_try_init(|| async {
            debug!(url, "fetching RDAP bootstrap registry");
            let response = self.http.get(url).send().await?;
            if !response.status().is_success() {
                return Err(LookupError::UpstreamStatus(response.status().as_u16()));
            }
            Ok(response.json::<Bootstrap>().await?)
        })
        .await
    }

    /// Limiter-gated GET with 429/503 handling: a 429, or a 503 carrying
    /// `Retry-After`, extends the provider's block window and surfaces as
    /// [`RateLimited`]; every other non-success status propagates unchanged.
    async fn fetch(&self, provider: &str, url: Url) -> Result<String, LookupError> {
        match self.limiter.acquire(provider).await? {
            Admission::Granted => {}
            Admission::Denied(retry_after) => {
                return Err(RateLimited::new(provider, retry_after).into());
            }
        }

        debug!(%url, "RDAP query");
        let response = self
            .http
            .get(url)
            .header("Accept", "application/rdap+json, application/json")
            .send()
            .await?;

        let status = response.status().as_u16();
        if status == 429 || status == 503 {
            let now = self.clock.now();
            let delay = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .map(|value| parse_retry_after(value, now))
                .unwrap_or(Duration::ZERO);

            if !delay.is_zero() || status == 429 {
                let block = delay.max(self.default_block);
                let until = now
                    + chrono::Duration::from_std(block)
                        .unwrap_or_else(|_| chrono::Duration::seconds(2));
                self.limiter.block_until(provider, until).await?;
                return Err(RateLimited::new(provider, delay).into());
            }
            return Err(LookupError::UpstreamStatus(status));
        }
        if !response.status().is_success() {
            return Err(LookupError::UpstreamStatus(status));
        }

        Ok(response.text().await?)
    }
}

// First HTTPS URL, else the first URL of any scheme. The URL's host is the
// provider key.
fn select_base(urls: &[String]) -> Option<(Url, String)> {
    let chosen = urls
        .iter()
        .find(|u| u.starts_with("https://"))
        .or_else(|| urls.first())?;

    let mut base = chosen.clone();
    if !base.ends_with('/') {
        base.push('/');
    }
    let url = Url::parse(&base).ok()?;
    let provider = url.host_str()?.to_string();
    Some((url, provider))
}

fn cidr_contains(cidr: &str, ip: &IpAddr) -> bool {
    let Some((network, length)) = cidr.split_once('/') else {
        return false;
    };
    let Ok(length) = length.parse::<u32>() else {
        return false;
    };

    match (network.trim().parse::<IpAddr>(), ip) {
        (Ok(IpAddr::V4(network)), IpAddr::V4(ip)) => {
            if length > 32 {
                return false;
            }
            if length == 0 {
                return true;
            }
            let mask = u32::MAX << (32 - length);
            (u32::from(network) & mask) == (u32::from(*ip) & mask)
        }
        (Ok(IpAddr::V6(network)), IpAddr::V6(ip)) => {
            if length > 128 {
                return false;
            }
            if length == 0 {
                return true;
            }
            let mask = u128::MAX << (128 - length);
            (u128::from(network) & mask) == (u128::from(*ip) & mask)
        }
        _ => false,
    }
}

pub(crate) fn map_domain(domain: &RdapDomain, provider: &str) -> Registration {
    let mut registration = Registration {
        domain: domain
            .ldh_name
            .as_deref()
            .map(normalize_domain)
            .unwrap_or_default(),
        handle: domain.handle.clone().unwrap_or_default(),
        statuses: domain.status.clone().unwrap_or_default(),
        registry: RegistryIdentity {
            name: provider.to_string(),
            url: format!("https://{}", provider),
        },
        source: Source::Rdap,
        ..Default::default()
    };

    registration.registry_domain_id = domain
        .public_ids
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|id| {
            let id_type = id.id_type.as_deref().unwrap_or_default().to_lowercase();
            (id_type.contains("roid") || id_type.contains("domain"))
                && !id_type.contains("iana")
                && !id_type.contains("registrar")
        })
        .and_then(|id| id.identifier.clone())
        .unwrap_or_default();

    for event in domain.events.as_deref().unwrap_or_default() {
        let Some(date) = event
            .event_date
            .as_deref()
            .and_then(|d| chrono::DateTime::parse_from_rfc3339(d).ok())
            .map(|d| d.with_timezone(&chrono::Utc))
        else {
            continue;
        };
        match event.event_action.as_deref() {
            Some("registration") => registration.created_at = Some(date),
            Some("last changed") => registration.updated_at = Some(date),
            Some("expiration") => registration.expires_at = Some(date),
            _ => {}
        }
    }

    if let Some(secure_dns) = &domain.secure_dns {
        registration.dnssec.enabled = secure_dns.delegation_signed;
        registration.dnssec.ds = secure_dns
            .ds_data
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|ds| DsRecord {
                key_tag: ds.key_tag.unwrap_or_default(),
                algorithm: ds.algorithm.unwrap_or_default(),
                digest_type: ds.digest_type.unwrap_or_default(),
                digest: ds.digest.clone().unwrap_or_default(),
            })
            .collect();
    }

    let mut contacts = Contacts::default();
    for entity in domain.entities.as_deref().unwrap_or_default() {
        let roles = entity.roles.as_deref().unwrap_or_default();

        if roles.iter().any(|r| r == "registrar") && registration.registrar.name.is_empty() {
            registration.registrar.name = entity_contact(entity).name;
            registration.registrar.iana_id = entity
                .public_ids
                .as_deref()
                .unwrap_or_default()
                .iter()
                .find(|id| {
                    id.id_type
                        .as_deref()
                        .unwrap_or_default()
                        .to_lowercase()
                        .contains("iana")
                })
                .and_then(|id| id.identifier.clone())
                .unwrap_or_default();
            registration.registrar.url = entity
                .links
                .as_deref()
                .unwrap_or_default()
                .first()
                .and_then(|link| link.href.clone())
                .unwrap_or_default();
        }

        if roles.iter().any(|r| r == "registrant") && contacts.registrant.is_none() {
            let contact = entity_contact(entity);
            if !contact.is_empty() {
                contacts.registrant = Some(contact);
            }
        }
        if roles.iter().any(|r| r == "administrative") && contacts.admin.is_none() {
            let contact = entity_contact(entity);
            if !contact.is_empty() {
                contacts.admin = Some(contact);
            }
        }
        if roles.iter().any(|r| r == "technical") && contacts.tech.is_none() {
            let contact = entity_contact(entity);
            if !contact.is_empty() {
                contacts.tech = Some(contact);
            }
        }
        if roles.iter().any(|r| r == "abuse") && registration.abuse.email.is_empty() {
            let contact = entity_contact(entity);
            registration.abuse.email = contact.email;
            registration.abuse.phone = contact.phone;
        }
    }
    registration.contacts = contacts;

    registration
}

fn ip_registrant_name(network: &RdapIpNetwork) -> Option<String> {
    network
        .entities
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|entity| {
            entity
                .roles
                .as_deref()
                .unwrap_or_default()
                .iter()
                .any(|r| r == "registrant")
        })
        .map(|entity| entity_contact(entity).name)
}

// vCard name preference: `org` over `fn`; `tel` values often carry a
// `tel:` URI prefix.
fn entity_contact(entity: &RdapEntity) -> Contact {
    let vcard = entity.vcard_array.as_ref();
    let name = vcard
        .and_then(|v| vcard_text(v, "org").or_else(|| vcard_text(v, "fn")))
        .unwrap_or_default();
    let email = vcard.and_then(|v| vcard_text(v, "email")).unwrap_or_default();
    let phone = vcard
        .and_then(|v| vcard_text(v, "tel"))
        .map(|t| t.trim_start_matches("tel:").to_string())
        .unwrap_or_default();

    Contact {
        name: elide_redacted(name),
        email: elide_redacted(email),
        phone: elide_redacted(phone),
    }
}

fn elide_redacted(value: String) -> String {
    if value.to_lowercase().contains("redacted") {
        String::new()
    } else {
        value
    }
}

// A jCard is ["vcard", [[name, params, type, value], ...]].
fn vcard_text(vcard: &serde_json::Value, property: &str) -> Option<String> {
    let entries = vcard.get(1)?.as_array()?;
    for entry in entries {
        let Some(fields) = entry.as_array() else {
            continue;
        };
        let matches = fields
            .first()
            .and_then(serde_json::Value::as_str)
            .is_some_and(|name| name.eq_ignore_ascii_case(property));
        if !matches {
            continue;
        }

        let text = match fields.get(3) {
            Some(serde_json::Value::String(s)) => s.trim().to_string(),
            Some(serde_json::Value::Array(parts)) => parts
                .iter()
                .filter_map(serde_json::Value::as_str)
                .collect::<Vec<_>>()
                .join(" ")
                .trim()
                .to_string(),
            _ => String::new(),
        };
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}
