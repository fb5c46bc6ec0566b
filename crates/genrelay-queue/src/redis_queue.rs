//! Redis-backed [`JobQueue`] with a visibility timeout.
//!
//! Layout under the queue name:
//! - `<name>:ready`     sorted set of activation ids scored by due time (ms)
//! - `<name>:inflight`  sorted set of claimed ids scored by redelivery deadline (ms)
//! - `<name>:payload`   hash of id -> activation JSON

use anyhow::{Context, Result};
use async_trait::async_trait;
use genrelay_core::{Clock, JobDescriptor, SystemClock};
use redis::Script;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::JobQueue;
use crate::activation::{Activation, ActivationKind};

/// Ids redelivered per claim call, bounding the script's run time.
const REQUEUE_BATCH: u32 = 100;

// KEYS[1] ready, KEYS[2] inflight, KEYS[3] payload
// ARGV[1] now (ms), ARGV[2] visibility timeout (ms), ARGV[3] requeue batch
const CLAIM_LUA: &str = r#"
local now = tonumber(ARGV[1])
local expired = redis.call("ZRANGEBYSCORE", KEYS[2], "-inf", now, "LIMIT", 0, tonumber(ARGV[3]))
for _, id in ipairs(expired) do
  redis.call("ZREM", KEYS[2], id)
  redis.call("ZADD", KEYS[1], now, id)
end

local ids = redis.call("ZRANGEBYSCORE", KEYS[1], "-inf", now, "LIMIT", 0, 1)
if #ids == 0 then
  return false
end
local id = ids[1]
local payload = redis.call("HGET", KEYS[3], id)
redis.call("ZREM", KEYS[1], id)
if not payload then
  return false
end
redis.call("ZADD", KEYS[2], now + tonumber(ARGV[2]), id)
return {id, payload}
"#;

pub struct RedisQueue {
    conn: ConnectionManager,
    name: String,
    visibility_timeout: Duration,
    clock: Arc<dyn Clock>,
    claim: Script,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("name", &self.name)
            .field("visibility_timeout", &self.visibility_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisQueue {
    pub async fn connect(url: &str, name: impl Into<String>, visibility_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid redis url: {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to redis at {url}"))?;
        Ok(Self::from_connection(conn, name, visibility_timeout))
    }

    pub fn from_connection(
        conn: ConnectionManager,
        name: impl Into<String>,
        visibility_timeout: Duration,
    ) -> Self {
        Self {
            conn,
            name: name.into(),
            visibility_timeout,
            clock: Arc::new(SystemClock),
            claim: Script::new(CLAIM_LUA),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now_ms(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    async fn schedule(&self, activation: &Activation, delay: Duration) -> Result<()> {
        let payload = activation
            .to_json()
            .context("failed to serialize activation")?;
        let id = activation.id.to_string();
        let due = self.now_ms() + delay.as_millis() as i64;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(payload_key(&self.name), &id, payload)
            .ignore()
            .zrem(inflight_key(&self.name), &id)
            .ignore()
            .zadd(ready_key(&self.name), &id, due)
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to schedule activation {id}"))?;
        Ok(())
    }

    async fn forget(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .zrem(inflight_key(&self.name), id)
            .ignore()
            .hdel(payload_key(&self.name), id)
            .ignore()
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to remove activation {id}"))?;
        Ok(())
    }
}

fn ready_key(name: &str) -> String {
    format!("{name}:ready")
}

fn inflight_key(name: &str) -> String {
    format!("{name}:inflight")
}

fn payload_key(name: &str) -> String {
    format!("{name}:payload")
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue_activation(
        &self,
        kind: ActivationKind,
        descriptor: JobDescriptor,
        delay: Duration,
    ) -> Result<Ulid> {
        let activation = Activation::new(kind, descriptor);
        self.schedule(&activation, delay).await?;
        debug!(id = %activation.id, %kind, delay_s = delay.as_secs(), "activation enqueued");
        Ok(activation.id)
    }

    async fn next_ready(&self) -> Result<Option<Activation>> {
        let mut conn = self.conn.clone();
        let claimed: Option<(String, String)> = self
            .claim
            .key(ready_key(&self.name))
            .key(inflight_key(&self.name))
            .key(payload_key(&self.name))
            .arg(self.now_ms())
            .arg(self.visibility_timeout.as_millis() as u64)
            .arg(REQUEUE_BATCH)
            .invoke_async(&mut conn)
            .await
            .context("claim script failed")?;
        let Some((id, payload)) = claimed else {
            return Ok(None);
        };
        match Activation::from_json(&payload) {
            Ok(activation) => Ok(Some(activation)),
            Err(e) => {
                warn!(id = %id, error = %e, "dropping undecodable activation payload");
                self.forget(&id).await?;
                Ok(None)
            }
        }
    }

    async fn ack(&self, activation: &Activation) -> Result<()> {
        self.forget(&activation.id.to_string()).await
    }

    async fn retry(&self, mut activation: Activation, delay: Duration) -> Result<()> {
        activation.attempt += 1;
        self.schedule(&activation, delay).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keys_derive_from_queue_name() {
        assert_eq!(ready_key("q:generate"), "q:generate:ready");
        assert_eq!(inflight_key("q:generate"), "q:generate:inflight");
        assert_eq!(payload_key("q:generate"), "q:generate:payload");
    }

    #[test]
    fn test_claim_script_requeues_before_claiming() {
        let requeue = CLAIM_LUA.find("KEYS[2], \"-inf\"").unwrap();
        let claim = CLAIM_LUA.find("KEYS[1], \"-inf\"").unwrap();
        assert!(requeue < claim);
    }
}
