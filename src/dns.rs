use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::TokioAsyncResolver;

use crate::errors::LookupError;

/// DNS capability used by the lookup engine: NS delegation queries and
/// A/AAAA expansion. Injected so tests can stub answers.
#[async_trait]
pub trait NameResolver: Send + Sync {
    /// NS record targets for `name`, in answer order. An empty answer is not
    /// an error.
    async fn ns_records(&self, name: &str) -> Result<Vec<String>, LookupError>;

    /// A and AAAA addresses for `host`, in answer order.
    async fn ip_records(&self, host: &str) -> Result<Vec<IpAddr>, LookupError>;
}

/// Resolver over the system DNS configuration, falling back to the library
/// defaults when no system configuration can be read.
pub struct SystemResolver {
    resolver: TokioAsyncResolver,
}

impl SystemResolver {
    pub fn new() -> Result<Self, LookupError> {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(err) => {
                warn!(%err, "system DNS configuration unavailable, using defaults");
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Ok(Self { resolver })
    }
}

fn empty_on_no_records<T>(err: ResolveError) -> Result<Vec<T>, LookupError> {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => Ok(Vec::new()),
        _ => Err(err.into()),
    }
}

#[async_trait]
impl NameResolver for SystemResolver {
    async fn ns_records(&self, name: &str) -> Result<Vec<String>, LookupError> {
        debug!(name, "NS query");
        match self.resolver.ns_lookup(name).await {
            Ok(lookup) => Ok(lookup.iter().map(|ns| ns.0.to_utf8()).collect()),
            Err(err) => empty_on_no_records(err),
        }
    }

    async fn ip_records(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        debug!(host, "A/AAAA query");
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) => empty_on_no_records(err),
        }
    }
}
