//! Redis lock provider (`SET NX PX` with token-checked release).
//!
//! The lease expires after `ttl` even if never dropped, so `ttl` must exceed
//! the longest expected run of the guarded work.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::Client;
use tracing::warn;
use uuid::Uuid;

use super::{Lease, LockError, LockProvider};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

#[derive(Clone)]
pub struct RedisLockProvider {
    client: Arc<Client>,
    prefix: String,
    ttl: Duration,
}

impl RedisLockProvider {
    pub fn new(redis_url: &str, ttl: Duration) -> Result<Self, LockError> {
        let client = Client::open(redis_url).map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            client: Arc::new(client),
            prefix: "courier:lock:".to_string(),
            ttl,
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn set_nx(client: &Client, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = client
            .get_connection()
            .map_err(|e| LockError::Backend(e.to_string()))?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query(&mut conn)
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(reply.is_some())
    }
}

struct RedisGuard {
    client: Arc<Client>,
    key: String,
    token: String,
}

impl RedisGuard {
    fn release(client: &Client, key: &str, token: &str) {
        let result = client.get_connection().and_then(|mut conn| {
            redis::Script::new(RELEASE_SCRIPT)
                .key(key)
                .arg(token)
                .invoke::<i32>(&mut conn)
        });
        if let Err(e) = result {
            warn!(key, error = %e, "failed to release redis lock; it will expire");
        }
    }
}

impl Drop for RedisGuard {
    fn drop(&mut self) {
        let client = self.client.clone();
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || Self::release(&client, &key, &token));
            }
            Err(_) => Self::release(&client, &key, &token),
        }
    }
}

#[async_trait]
impl LockProvider for RedisLockProvider {
    async fn try_acquire(&self, key: &str) -> Result<Option<Lease>, LockError> {
        let redis_key = format!("{}{}", self.prefix, key);
        let token = Uuid::now_v7().to_string();

        let client = self.client.clone();
        let ttl = self.ttl;
        let (k, t) = (redis_key.clone(), token.clone());
        let acquired = tokio::task::spawn_blocking(move || Self::set_nx(&client, &k, &t, ttl))
            .await
            .map_err(|e| LockError::Backend(format!("lock task failed: {e}")))??;

        if !acquired {
            return Ok(None);
        }

        let guard = RedisGuard {
            client: self.client.clone(),
            key: redis_key,
            token,
        };
        Ok(Some(Lease::new(key, guard)))
    }
}
