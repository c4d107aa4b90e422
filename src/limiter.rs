use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::Script;
use tracing::debug;

use crate::clock::Clock;
use crate::config::Config;
use crate::errors::LookupError;

/// Outcome of [`ProviderLimiter::acquire`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Denied; the duration is the suggested wait before retrying.
    Denied(Duration),
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Per-provider token bucket with forward-only block windows.
///
/// One bucket per provider key: capacity `burst`, linear refill of
/// `rate_per_second` tokens per second. A deny marks the bucket blocked for
/// `default_block`; upstream `Retry-After` hints extend the window through
/// [`ProviderLimiter::block_until`]. Block windows only ever move forward.
#[async_trait]
pub trait ProviderLimiter: Send + Sync {
    async fn acquire(&self, provider: &str) -> Result<Admission, LookupError>;
    async fn block_until(&self, provider: &str, until: DateTime<Utc>) -> Result<(), LookupError>;
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterSettings {
    pub rate_per_second: f64,
    pub burst: f64,
    pub default_block: Duration,
    pub state_ttl: Duration,
}

impl LimiterSettings {
    pub fn from_config(config: &Config) -> Self {
        let mut default_block = config.default_block();
        if default_block.is_zero() {
            default_block = Duration::from_secs(2);
        }
        Self {
            rate_per_second: config.rate_per_second,
            burst: config.burst,
            default_block,
            state_ttl: config.limiter_state_ttl(),
        }
    }
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn canonical_provider(provider: &str) -> &str {
    if provider.is_empty() {
        "default"
    } else {
        provider
    }
}

struct Bucket {
    tokens: f64,
    last_refill: DateTime<Utc>,
    blocked_until: Option<DateTime<Utc>>,
    last_touched: DateTime<Utc>,
}

/// Limiter state held in a mutex-guarded table. Expired buckets are swept
/// opportunistically on every touch.
pub struct MemoryLimiter {
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl MemoryLimiter {
    pub fn new(settings: LimiterSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn sweep(&self, buckets: &mut HashMap<String, Bucket>, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.settings.state_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(30));
        buckets.retain(|_, bucket| now - bucket.last_touched < ttl);
    }
}

#[async_trait]
impl ProviderLimiter for MemoryLimiter {
    async fn acquire(&self, provider: &str) -> Result<Admission, LookupError> {
        let provider = canonical_provider(provider);
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        self.sweep(&mut buckets, now);

        let settings = self.settings;
        let bucket = buckets.entry(provider.to_string()).or_insert(Bucket {
            tokens: settings.burst,
            last_refill: now,
            blocked_until: None,
            last_touched: now,
        });
        bucket.last_touched = now;

        if let Some(blocked_until) = bucket.blocked_until {
            if blocked_until > now {
                let remaining = (blocked_until - now).to_std().unwrap_or(Duration::ZERO);
                debug!(provider, ?remaining, "provider blocked");
                return Ok(Admission::Denied(remaining));
            }
        }

        let elapsed = (now - bucket.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * settings.rate_per_second)
            .clamp(0.0, settings.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(Admission::Granted)
        } else {
            let until = now
                + chrono::Duration::from_std(settings.default_block)
                    .unwrap_or_else(|_| chrono::Duration::seconds(2));
            bucket.blocked_until = Some(until);
            debug!(provider, block = ?settings.default_block, "bucket empty, blocking");
            Ok(Admission::Denied(settings.default_block))
        }
    }

    async fn block_until(&self, provider: &str, until: DateTime<Utc>) -> Result<(), LookupError> {
        let provider = canonical_provider(provider);
        let now = self.clock.now();
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        self.sweep(&mut buckets, now);

        let settings = self.settings;
        let bucket = buckets.entry(provider.to_string()).or_insert(Bucket {
            tokens: settings.burst,
            last_refill: now,
            blocked_until: None,
            last_touched: now,
        });
        bucket.last_touched = now;

        // Block windows only extend forward.
        if bucket.blocked_until.is_none_or(|current| until > current) {
            bucket.blocked_until = Some(until);
        }
        Ok(())
    }
}

// Atomic read-refill-decide-write; the whole sequence runs server-side so
// concurrent replicas cannot double-spend a token.
const ACQUIRE_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local burst = tonumber(ARGV[3])
local block_ms = tonumber(ARGV[4])
local ttl_ms = tonumber(ARGV[5])

local blocked = tonumber(redis.call('HGET', key, 'blocked_until')) or 0
if blocked > now then
  redis.call('PEXPIRE', key, ttl_ms)
  return {0, blocked - now}
end

local tokens = tonumber(redis.call('HGET', key, 'tokens'))
local last = tonumber(redis.call('HGET', key, 'last_refill')) or now
if tokens == nil then
  tokens = burst
  last = now
end

tokens = tokens + ((now - last) / 1000.0) * rate
if tokens > burst then tokens = burst end
if tokens < 0 then tokens = 0 end

local ok = 0
local retry = 0
if tokens >= 1 then
  tokens = tokens - 1
  ok = 1
else
  redis.call('HSET', key, 'blocked_until', now + block_ms)
  retry = block_ms
end

redis.call('HSET', key, 'tokens', tokens, 'last_refill', now)
redis.call('PEXPIRE', key, ttl_ms)
return {ok, retry}
"#;

const BLOCK_SCRIPT: &str = r#"
local key = KEYS[1]
local until_ms = tonumber(ARGV[1])
local ttl_ms = tonumber(ARGV[2])

local current = tonumber(redis.call('HGET', key, 'blocked_until')) or 0
if until_ms > current then
  redis.call('HSET', key, 'blocked_until', until_ms)
end
redis.call('PEXPIRE', key, ttl_ms)
return 1
"#;

/// Limiter state shared through redis: one hash per provider with fields
/// `tokens`, `last_refill` and `blocked_until` (both in milliseconds since the
/// epoch), expired by `PEXPIRE` after the state TTL.
pub struct RedisLimiter {
    client: redis::Client,
    prefix: String,
    settings: LimiterSettings,
    clock: Arc<dyn Clock>,
    acquire_script: Script,
    block_script: Script,
}

impl RedisLimiter {
    pub fn new(
        client: redis::Client,
        prefix: impl Into<String>,
        settings: LimiterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            prefix: prefix.into(),
            settings,
            clock,
            acquire_script: Script::new(ACQUIRE_SCRIPT),
            block_script: Script::new(BLOCK_SCRIPT),
        }
    }

    fn key(&self, provider: &str) -> String {
        format!("{}rl:{}", self.prefix, provider)
    }
}

#[async_trait]
impl ProviderLimiter for RedisLimiter {
    async fn acquire(&self, provider: &str) -> Result<Admission, LookupError> {
        let provider = canonical_provider(provider);
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let now_ms = self.clock.now().timestamp_millis();
        let (ok, retry_ms): (i64, i64) = self
            .acquire_script
            .key(self.key(provider))
            .arg(now_ms)
            .arg(self.settings.rate_per_second)
            .arg(self.settings.burst)
            .arg(self.settings.default_block.as_millis() as i64)
            .arg(self.settings.state_ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;

        if ok == 1 {
            Ok(Admission::Granted)
        } else {
            Ok(Admission::Denied(Duration::from_millis(retry_ms.max(0) as u64)))
        }
    }

    async fn block_until(&self, provider: &str, until: DateTime<Utc>) -> Result<(), LookupError> {
        let provider = canonical_provider(provider);
        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let _: i64 = self
            .block_script
            .key(self.key(provider))
            .arg(until.timestamp_millis())
            .arg(self.settings.state_ttl.as_millis() as i64)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }
}
