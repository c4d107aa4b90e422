//! End-to-end lookup scenarios against mock RDAP servers (wiremock), local
//! WHOIS listeners, and a stubbed DNS resolver.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use registry_lookup::{
    Config, LimiterSettings, LookupError, LookupOptions, MemoryLimiter, NameResolver,
    ProviderLimiter, RegistryClient, Source, SystemClock,
};

#[derive(Default)]
struct StubResolver {
    ns: HashMap<String, Vec<String>>,
    ips: HashMap<String, Vec<IpAddr>>,
    fail_ips: HashSet<String>,
    ns_calls: AtomicUsize,
    ip_calls: AtomicUsize,
}

#[async_trait]
impl NameResolver for StubResolver {
    async fn ns_records(&self, name: &str) -> Result<Vec<String>, LookupError> {
        self.ns_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.ns.get(name).cloned().unwrap_or_default())
    }

    async fn ip_records(&self, host: &str) -> Result<Vec<IpAddr>, LookupError> {
        self.ip_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_ips.contains(host) {
            return Err(LookupError::Timeout);
        }
        Ok(self.ips.get(host).cloned().unwrap_or_default())
    }
}

/// Minimal WHOIS listener; the response body can be swapped between calls.
async fn whois_listener(body: Arc<Mutex<String>>) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = connections.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let response = body.lock().unwrap().clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 512];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    (format!("127.0.0.1:{}", addr.port()), connections)
}

fn test_config(rdap_server: &MockServer) -> Config {
    let mut config = Config::default();
    config.rdap_bootstrap_dns_url = format!("{}/dns.json", rdap_server.uri());
    config.rdap_bootstrap_ipv4_url = format!("{}/ipv4.json", rdap_server.uri());
    config.rdap_bootstrap_ipv6_url = format!("{}/ipv6.json", rdap_server.uri());
    config.whois_timeout_seconds = 2;
    config
}

async fn mount_dns_bootstrap(server: &MockServer, tlds: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/dns.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "description": "RDAP bootstrap file for Domain Name System registrations",
            "services": [[tlds, [format!("{}/rdap/", server.uri())]]],
            "version": "1.0"
        })))
        .mount(server)
        .await;
}

async fn mount_ipv4_bootstrap(server: &MockServer, cidrs: &[&str]) {
    Mock::given(method("GET"))
        .and(path("/ipv4.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "services": [[cidrs, [format!("{}/rdap-ip/", server.uri())]]],
            "version": "1.0"
        })))
        .mount(server)
        .await;
}

fn rdap_domain_body(ldh_name: &str, nameservers: &[&str]) -> serde_json::Value {
    json!({
        "objectClassName": "domain",
        "ldhName": ldh_name,
        "handle": "H123",
        "status": ["active"],
        "events": [
            {"eventAction": "registration", "eventDate": "1995-08-14T04:00:00Z"},
            {"eventAction": "expiration", "eventDate": "2030-08-13T04:00:00Z"}
        ],
        "entities": [{
            "roles": ["registrar"],
            "vcardArray": ["vcard", [["version", {}, "text", "4.0"], ["fn", {}, "text", "Example Registrar"]]],
            "publicIds": [{"type": "IANA Registrar ID", "identifier": "376"}]
        }],
        "nameservers": nameservers
            .iter()
            .map(|ns| json!({"objectClassName": "nameserver", "ldhName": ns}))
            .collect::<Vec<_>>()
    })
}

fn rdap_ip_body(org: &str) -> serde_json::Value {
    json!({
        "objectClassName": "ip network",
        "entities": [{
            "roles": ["registrant"],
            "vcardArray": ["vcard", [["version", {}, "text", "4.0"], ["org", {}, "text", org]]]
        }]
    })
}

fn provider_of(server: &MockServer) -> String {
    url::Url::parse(&server.uri())
        .unwrap()
        .host_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn rdap_happy_path_for_apex() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;
    mount_ipv4_bootstrap(&server, &["192.0.2.0/24"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rdap_domain_body("EXAMPLE.COM", &["ns1.example.com"])),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rdap-ip/ip/192.0.2.10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_ip_body("ACME")))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = Arc::new(StubResolver {
        ips: HashMap::from([(
            "ns1.example.com".to_string(),
            vec!["192.0.2.10".parse().unwrap()],
        )]),
        ..Default::default()
    });

    let client = RegistryClient::builder(test_config(&server))
        .resolver(resolver.clone())
        .build()
        .unwrap();

    let result = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap();

    let provider = provider_of(&server);
    assert_eq!(result.source, Source::Rdap);
    assert_eq!(result.provider_key, provider);
    assert_eq!(result.suggested_delay, Duration::ZERO);

    let registration = result.registration.as_ref().unwrap();
    assert_eq!(registration.domain, "example.com");
    assert_eq!(registration.source, Source::Rdap);
    assert_eq!(registration.registry.name, provider);
    assert_eq!(registration.registrar.name, "Example Registrar");

    assert_eq!(result.nameservers.len(), 1);
    assert_eq!(result.nameservers[0].hostname, "ns1.example.com");
    assert_eq!(result.nameservers[0].ips.len(), 1);
    assert_eq!(result.nameservers[0].ips[0].address, "192.0.2.10");
    assert_eq!(result.nameservers[0].ips[0].registrant_name, "ACME");

    // The domain snapshot is cached: a second call performs no upstream work
    // (the mocks expect exactly one hit each).
    let again = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(again, result);
}

#[tokio::test]
async fn rdap_429_blocks_provider_and_propagates_retry_after() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "10"))
        .expect(1)
        .mount(&server)
        .await;

    let client = RegistryClient::builder(test_config(&server))
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    let err = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    let limited = err.rate_limit().expect("expected a rate-limit error");
    assert_eq!(limited.provider, provider_of(&server));
    assert_eq!(limited.retry_after, Duration::from_secs(10));
    assert!(limited.partial.is_none());

    // The provider is now blocked: a retry is denied locally, before any
    // network I/O (the RDAP mock still saw exactly one request).
    let err = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    let limited = err.rate_limit().expect("expected a local denial");
    assert!(limited.retry_after > Duration::from_secs(8));
    assert!(limited.retry_after <= Duration::from_secs(10));
}

#[tokio::test]
async fn whois_fallback_when_bootstrap_has_no_match() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    let registry_body = Arc::new(Mutex::new("Registrar: Test Registrar\r\n".to_string()));
    let (registry_host, registry_connections) = whois_listener(registry_body).await;

    let iana_body = Arc::new(Mutex::new(format!("refer: {}\r\n", registry_host)));
    let (iana_host, iana_connections) = whois_listener(iana_body).await;

    let mut config = test_config(&server);
    config.whois_bootstrap_host = iana_host;

    let client = RegistryClient::builder(config)
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .lookup_domain("example.zz", &LookupOptions::default())
                    .await
            })
        })
        .collect();

    for task in tasks {
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.source, Source::Whois);
        assert_eq!(result.provider_key, registry_host);
        let registration = result.registration.unwrap();
        assert_eq!(registration.source, Source::Whois);
        assert_eq!(registration.registrar.name, "Test Registrar");
    }

    // Exactly two WHOIS fetches per real miss: one IANA bootstrap, one
    // registry query, regardless of 20 concurrent callers.
    assert_eq!(iana_connections.load(Ordering::SeqCst), 1);
    assert_eq!(registry_connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn whois_registrar_indirection_follows_the_pointer() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    let registrar_body = Arc::new(Mutex::new(
        "Registrar: Full Service Registrar\r\nRegistrant Organization: ACME Corp\r\n".to_string(),
    ));
    let (registrar_host, registrar_connections) = whois_listener(registrar_body).await;

    let registry_body = Arc::new(Mutex::new(format!(
        "Registrar: Thin Registry View\r\nRegistrar WHOIS Server: {}\r\n",
        registrar_host
    )));
    let (registry_host, _) = whois_listener(registry_body).await;

    let iana_body = Arc::new(Mutex::new(format!("refer: {}\r\n", registry_host)));
    let (iana_host, _) = whois_listener(iana_body).await;

    let mut config = test_config(&server);
    config.whois_bootstrap_host = iana_host;

    let client = RegistryClient::builder(config)
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    let result = client
        .lookup_domain("example.zz", &LookupOptions::default())
        .await
        .unwrap();

    // The registrar body wins and the registrar host becomes the provider.
    assert_eq!(result.provider_key, registrar_host);
    let registration = result.registration.unwrap();
    assert_eq!(registration.registrar.name, "Full Service Registrar");
    assert_eq!(
        registration.contacts.registrant.unwrap().name,
        "ACME Corp"
    );
    assert_eq!(registrar_connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn limiter_denial_prevents_upstream_io() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_domain_body("example.com", &[])))
        .expect(0)
        .mount(&server)
        .await;

    let limiter = Arc::new(MemoryLimiter::new(
        LimiterSettings::default(),
        Arc::new(SystemClock),
    ));
    let provider = provider_of(&server);
    limiter
        .block_until(&provider, Utc::now() + chrono::Duration::milliseconds(123))
        .await
        .unwrap();

    let client = RegistryClient::builder(test_config(&server))
        .resolver(Arc::new(StubResolver::default()))
        .limiter(limiter)
        .build()
        .unwrap();

    let err = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    let limited = err.rate_limit().expect("expected a rate-limit error");
    assert_eq!(limited.provider, provider);
    assert!(limited.retry_after > Duration::ZERO);
    assert!(limited.retry_after <= Duration::from_millis(123));
    assert!(limited.partial.is_none());
}

#[tokio::test]
async fn partial_result_when_ip_registrant_is_rate_limited() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;
    mount_ipv4_bootstrap(&server, &["192.0.2.0/24"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rdap_domain_body("example.com", &["ns1.example.com"])),
        )
        .expect(1)
        .mount(&server)
        .await;
    // The IP lookup is denied by the limiter before any I/O happens.
    Mock::given(method("GET"))
        .and(path("/rdap-ip/ip/192.0.2.10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_ip_body("ACME")))
        .expect(0)
        .mount(&server)
        .await;

    let resolver = Arc::new(StubResolver {
        ips: HashMap::from([(
            "ns1.example.com".to_string(),
            vec!["192.0.2.10".parse().unwrap()],
        )]),
        ..Default::default()
    });

    // One token total and no refill: the domain fetch spends it, the IP fetch
    // is denied with the 300ms block.
    let limiter = Arc::new(MemoryLimiter::new(
        LimiterSettings {
            rate_per_second: 0.0,
            burst: 1.0,
            default_block: Duration::from_millis(300),
            state_ttl: Duration::from_secs(1800),
        },
        Arc::new(SystemClock),
    ));

    let client = RegistryClient::builder(test_config(&server))
        .resolver(resolver.clone())
        .limiter(limiter)
        .build()
        .unwrap();

    let err = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    let limited = err.rate_limit().expect("expected a rate-limit error");
    assert_eq!(limited.retry_after, Duration::from_millis(300));

    let partial = limited.partial.as_ref().expect("expected a partial result");
    assert!(partial.registration.is_some());
    assert_eq!(partial.source, Source::Rdap);
    assert_eq!(partial.suggested_delay, Duration::from_millis(300));
    assert_eq!(partial.nameservers.len(), 1);
    assert_eq!(partial.nameservers[0].hostname, "ns1.example.com");
    assert!(partial.nameservers[0].ips.is_empty());

    // The nameserver cache survived the failed domain lookup...
    let before = resolver.ip_calls.load(Ordering::SeqCst);
    client
        .lookup_nameserver("ns1.example.com", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(resolver.ip_calls.load(Ordering::SeqCst), before);

    // ...but the failing IP was never cached: looking it up again goes back
    // to the limiter and is denied, not served from cache.
    let err = client
        .lookup_ip_registrant("192.0.2.10", &LookupOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());

    // And the domain snapshot itself was not cached either.
    let err = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    assert!(err.is_rate_limited());
}

#[tokio::test]
async fn whois_error_does_not_populate_cache() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    let registry_body = Arc::new(Mutex::new(String::new()));
    let (registry_host, registry_connections) = whois_listener(registry_body.clone()).await;

    let iana_body = Arc::new(Mutex::new(format!("refer: {}\r\n", registry_host)));
    let (iana_host, iana_connections) = whois_listener(iana_body).await;

    let mut config = test_config(&server);
    config.whois_bootstrap_host = iana_host;

    let client = RegistryClient::builder(config)
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    // First call: every candidate body is empty, so the lookup errors.
    let first = client
        .lookup_domain("example.zz", &LookupOptions::default())
        .await;
    assert!(first.is_err());
    assert_eq!(iana_connections.load(Ordering::SeqCst), 1);

    // Second call with a fixed registry: fresh fetches, not a cached error.
    *registry_body.lock().unwrap() = "Registrar: Renewed Registrar\r\n".to_string();
    let second = client
        .lookup_domain("example.zz", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(
        second.registration.unwrap().registrar.name,
        "Renewed Registrar"
    );
    assert_eq!(iana_connections.load(Ordering::SeqCst), 2);
    assert_eq!(registry_connections.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn concurrent_domain_lookups_coalesce() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;
    mount_ipv4_bootstrap(&server, &["192.0.2.0/24"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rdap_domain_body("example.com", &["ns1.example.com"]))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rdap-ip/ip/192.0.2.10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_ip_body("ACME")))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = Arc::new(StubResolver {
        ips: HashMap::from([(
            "ns1.example.com".to_string(),
            vec!["192.0.2.10".parse().unwrap()],
        )]),
        ..Default::default()
    });

    let client = RegistryClient::builder(test_config(&server))
        .resolver(resolver)
        .build()
        .unwrap();

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .lookup_domain("example.com", &LookupOptions::default())
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }
    for result in &results[1..] {
        assert_eq!(result, &results[0]);
    }
}

#[tokio::test]
async fn normalization_shares_cache_key_and_flight() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_domain_body("example.com", &[])))
        .expect(1)
        .mount(&server)
        .await;

    let client = RegistryClient::builder(test_config(&server))
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    let first = client
        .lookup_domain("Example.COM.", &LookupOptions::default())
        .await
        .unwrap();
    let second = client
        .lookup_domain("example.com", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn ip_registrant_lookup_caches_on_success() {
    let server = MockServer::start().await;
    mount_ipv4_bootstrap(&server, &["192.0.2.0/24"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap-ip/ip/192.0.2.10"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_ip_body("ACME")))
        .expect(1)
        .mount(&server)
        .await;

    let client = RegistryClient::builder(test_config(&server))
        .resolver(Arc::new(StubResolver::default()))
        .build()
        .unwrap();

    let first = client
        .lookup_ip_registrant("192.0.2.10", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(first.ip, "192.0.2.10");
    assert_eq!(first.registrant, "ACME");
    assert_eq!(first.provider_key, provider_of(&server));

    let second = client
        .lookup_ip_registrant("192.0.2.10", &LookupOptions::default())
        .await
        .unwrap();
    assert_eq!(second, first);

    let err = client
        .lookup_ip_registrant("not-an-ip", &LookupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LookupError::InvalidIp(_)));
}

#[tokio::test]
async fn nameserver_resolver_error_is_not_cached() {
    let server = MockServer::start().await;

    let resolver = Arc::new(StubResolver {
        fail_ips: HashSet::from(["ns1.example.com".to_string()]),
        ..Default::default()
    });

    let client = RegistryClient::builder(test_config(&server))
        .resolver(resolver.clone())
        .build()
        .unwrap();

    let err = client
        .lookup_nameserver("ns1.example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, LookupError::Timeout));

    let _ = client
        .lookup_nameserver("ns1.example.com", &LookupOptions::default())
        .await
        .unwrap_err();
    // Both calls reached the resolver: the error was never cached.
    assert_eq!(resolver.ip_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn delegated_subdomain_uses_delegation_nameservers() {
    let server = MockServer::start().await;
    mount_dns_bootstrap(&server, &["com"]).await;
    mount_ipv4_bootstrap(&server, &["192.0.2.0/24"]).await;

    Mock::given(method("GET"))
        .and(path("/rdap/domain/example.com"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(rdap_domain_body("example.com", &["ns1.example.com"])),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/rdap-ip/ip/192.0.2.53"))
        .respond_with(ResponseTemplate::new(200).set_body_json(rdap_ip_body("Sub DNS Inc")))
        .mount(&server)
        .await;

    // sub.example.com is its own zone with dedicated nameservers.
    let resolver = Arc::new(StubResolver {
        ns: HashMap::from([(
            "sub.example.com".to_string(),
            vec!["ns1.sub-dns.net.".to_string()],
        )]),
        ips: HashMap::from([(
            "ns1.sub-dns.net".to_string(),
            vec!["192.0.2.53".parse().unwrap()],
        )]),
        ..Default::default()
    });

    let client = RegistryClient::builder(test_config(&server))
        .resolver(resolver)
        .build()
        .unwrap();

    let result = client
        .lookup_domain("sub.example.com", &LookupOptions::default())
        .await
        .unwrap();

    // Registration facts still come from the apex RDAP record, but the
    // nameserver set is the delegated zone's.
    assert_eq!(result.source, Source::Rdap);
    assert_eq!(result.nameservers.len(), 1);
    assert_eq!(result.nameservers[0].hostname, "ns1.sub-dns.net");
    assert_eq!(result.nameservers[0].ips[0].registrant_name, "Sub DNS Inc");
}
