//! Redis-backed [`SharedStore`].
//!
//! Admission runs as one Lua script, which Redis executes atomically. Keys
//! for one bucket share a `{hash tag}` so the script stays valid on a
//! cluster.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use genrelay_core::DenyReason;
use redis::Script;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::debug;

use crate::store::{AdmitDecision, AdmitRequest, SharedStore, SlotSnapshot};

// KEYS[1] rate window (sorted set), KEYS[2] holder counter, KEYS[3] member sequence
// ARGV[1] now (s), ARGV[2] window (s), ARGV[3] rpm (-1 off), ARGV[4] concurrency (-1 off),
// ARGV[5] lease (ms)
const ADMIT_LUA: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local rpm = tonumber(ARGV[3])
local conc = tonumber(ARGV[4])
local lease = tonumber(ARGV[5])

if conc > 0 then
  local holders = tonumber(redis.call("GET", KEYS[2]) or "0")
  if holders >= conc then
    return {0, "concurrency"}
  end
end

if rpm > 0 then
  redis.call("ZREMRANGEBYSCORE", KEYS[1], "-inf", now - window)
  if redis.call("ZCARD", KEYS[1]) >= rpm then
    return {0, "rpm"}
  end
end

if conc > 0 then
  redis.call("INCR", KEYS[2])
  redis.call("PEXPIRE", KEYS[2], lease)
end

if rpm > 0 then
  local ttl = math.ceil(window * 2)
  local seq = redis.call("INCR", KEYS[3])
  redis.call("EXPIRE", KEYS[3], ttl)
  redis.call("ZADD", KEYS[1], now, tostring(now) .. "-" .. tostring(seq))
  redis.call("EXPIRE", KEYS[1], ttl)
end

return {1, "ok"}
"#;

// KEYS[1] holder counter
const RELEASE_LUA: &str = r#"
local holders = tonumber(redis.call("GET", KEYS[1]) or "0")
if holders > 0 then
  redis.call("DECR", KEYS[1])
end
return 1
"#;

pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    admit: Script,
    release: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self> {
        let client = redis::Client::open(url)
            .with_context(|| format!("Invalid redis url: {url}"))?;
        let conn = ConnectionManager::new(client)
            .await
            .with_context(|| format!("Failed to connect to redis at {url}"))?;
        Ok(Self::from_connection(conn, prefix))
    }

    pub fn from_connection(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            admit: Script::new(ADMIT_LUA),
            release: Script::new(RELEASE_LUA),
        }
    }

    fn rate_key(&self, key: &str) -> String {
        bucket_key(&self.prefix, key, "rpm")
    }

    fn holders_key(&self, key: &str) -> String {
        bucket_key(&self.prefix, key, "sem")
    }

    fn seq_key(&self, key: &str) -> String {
        bucket_key(&self.prefix, key, "seq")
    }

    fn marker_key(&self, marker: &str) -> String {
        format!("{}:done:{}", self.prefix, marker)
    }
}

fn bucket_key(prefix: &str, key: &str, suffix: &str) -> String {
    format!("{prefix}:{{{key}}}:{suffix}")
}

fn limit_arg(limit: Option<u32>) -> i64 {
    limit.map(i64::from).unwrap_or(-1)
}

fn parse_decision(ok: i64, reason: &str) -> Result<AdmitDecision> {
    if ok == 1 {
        return Ok(AdmitDecision::Admitted);
    }
    match reason.parse::<DenyReason>() {
        Ok(reason) => Ok(AdmitDecision::Denied(reason)),
        Err(e) => bail!("admission script returned {ok}/{reason}: {e}"),
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    async fn try_admit(&self, request: &AdmitRequest) -> Result<AdmitDecision> {
        let mut conn = self.conn.clone();
        let (ok, reason): (i64, String) = self
            .admit
            .key(self.rate_key(&request.key))
            .key(self.holders_key(&request.key))
            .key(self.seq_key(&request.key))
            .arg(request.now)
            .arg(request.window_s)
            .arg(limit_arg(request.rpm))
            .arg(limit_arg(request.concurrency))
            .arg(request.lease.as_millis() as u64)
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("admission script failed for '{}'", request.key))?;
        debug!(key = %request.key, ok, reason = %reason, "admission attempt");
        parse_decision(ok, &reason)
    }

    async fn release(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = self
            .release
            .key(self.holders_key(key))
            .invoke_async(&mut conn)
            .await
            .with_context(|| format!("release script failed for '{key}'"))?;
        Ok(())
    }

    async fn snapshot(&self, key: &str, now: f64, window_s: u64) -> Result<SlotSnapshot> {
        let mut conn = self.conn.clone();
        let holders: Option<u64> = redis::cmd("GET")
            .arg(self.holders_key(key))
            .query_async(&mut conn)
            .await
            .context("failed to read holder counter")?;
        let cutoff = format!("({}", now - window_s as f64);
        let window_entries: u64 = redis::cmd("ZCOUNT")
            .arg(self.rate_key(key))
            .arg(cutoff)
            .arg("+inf")
            .query_async(&mut conn)
            .await
            .context("failed to count rate window")?;
        Ok(SlotSnapshot {
            holders: holders.unwrap_or(0),
            window_entries,
        })
    }

    async fn terminal_state(&self, marker: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(self.marker_key(marker))
            .query_async(&mut conn)
            .await
            .context("failed to read terminal marker")?;
        Ok(value)
    }

    async fn claim_terminal(&self, marker: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let set: Option<String> = redis::cmd("SET")
            .arg(self.marker_key(marker))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .context("failed to claim terminal marker")?;
        Ok(set.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_arg_disables_with_negative() {
        assert_eq!(limit_arg(None), -1);
        assert_eq!(limit_arg(Some(4)), 4);
    }

    #[test]
    fn test_parse_decision() {
        assert_eq!(parse_decision(1, "ok").unwrap(), AdmitDecision::Admitted);
        assert_eq!(
            parse_decision(0, "concurrency").unwrap(),
            AdmitDecision::Denied(DenyReason::Concurrency)
        );
        assert_eq!(
            parse_decision(0, "rpm").unwrap(),
            AdmitDecision::Denied(DenyReason::Rate)
        );
        assert!(parse_decision(0, "garbage").is_err());
    }

    #[test]
    fn test_bucket_keys_share_hash_tag() {
        assert_eq!(bucket_key("lim", "gemini", "rpm"), "lim:{gemini}:rpm");
        assert_eq!(bucket_key("lim", "gemini", "sem"), "lim:{gemini}:sem");
    }

    #[test]
    fn test_admit_script_declares_all_keys() {
        assert!(ADMIT_LUA.contains("KEYS[1]"));
        assert!(ADMIT_LUA.contains("KEYS[2]"));
        assert!(ADMIT_LUA.contains("KEYS[3]"));
        assert!(RELEASE_LUA.contains("KEYS[1]"));
    }
}
