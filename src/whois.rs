use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::debug;

use crate::errors::LookupError;

// Standard whois protocol port; host strings may override it as "host:port".
const WHOIS_PORT: u16 = 43;

/// Plain-text WHOIS query engine (TCP 43).
pub struct WhoisFetcher {
    timeout: Duration,
    max_response_size: usize,
    query_semaphore: Arc<Semaphore>,
}

impl WhoisFetcher {
    pub fn new(timeout: Duration, max_response_size: usize, concurrent_queries: usize) -> Self {
        Self {
            timeout,
            max_response_size,
            query_semaphore: Arc::new(Semaphore::new(concurrent_queries.max(1))),
        }
    }

    /// Sends `query` to `server` and reads the response until EOF.
    pub async fn query(&self, server: &str, query: &str) -> Result<String, LookupError> {
        let _permit = self
            .query_semaphore
            .acquire()
            .await
            .map_err(|_| LookupError::Internal("whois query semaphore closed".to_string()))?;

        let mut stream = self.connect(server).await?;
        self.send_query(&mut stream, query).await?;
        self.read_response(&mut stream).await
    }

    async fn connect(&self, server: &str) -> Result<TcpStream, LookupError> {
        let (host, port) = split_host_port(server);
        debug!(host, port, "connecting to whois server");
        let stream = timeout(self.timeout, TcpStream::connect((host, port))).await??;

        if let Err(err) = stream.set_nodelay(true) {
            debug!(%err, "failed to set TCP_NODELAY");
        }

        Ok(stream)
    }

    async fn send_query(&self, stream: &mut TcpStream, query: &str) -> Result<(), LookupError> {
        let line = format!("{}\r\n", query);
        stream.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn read_response(&self, stream: &mut TcpStream) -> Result<String, LookupError> {
        let mut buffer = vec![0u8; 4096];
        let mut response = Vec::new();

        loop {
            match timeout(self.timeout, stream.read(&mut buffer)).await? {
                Ok(0) => break,
                Ok(n) => {
                    response.extend_from_slice(&buffer[..n]);
                    if response.len() > self.max_response_size {
                        return Err(LookupError::ResponseTooLarge);
                    }
                }
                Err(err) => return Err(err.into()),
            }
        }

        String::from_utf8(response).map_err(|_| LookupError::InvalidUtf8)
    }
}

/// The referral pointer in an IANA TLD record: `refer:` (current format) or
/// `whois:` (older records).
pub fn iana_referral(body: &str) -> Option<String> {
    for line in body.lines() {
        if let Some((key, value)) = line.trim().split_once(':') {
            let key = key.trim();
            if key.eq_ignore_ascii_case("refer") || key.eq_ignore_ascii_case("whois") {
                if let Some(host) = value.trim().split_whitespace().next() {
                    return Some(host.to_string());
                }
            }
        }
    }
    None
}

fn split_host_port(server: &str) -> (&str, u16) {
    if let Some((host, port)) = server.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host, port);
        }
    }
    (server, WHOIS_PORT)
}
