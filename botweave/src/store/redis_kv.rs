//! Redis-backed `KvStore`.
//!
//! Uses one `ConnectionManager` per process (cloned per call). CAS and
//! counter-with-TTL are Lua scripts so they stay atomic across processes.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{KvError, KvStore};

/// Sentinel for "key must be absent" in the CAS script. Stored values are
/// JSON or decimal counters, so the sentinel can never collide.
const ABSENT: &str = "__absent__";

const CAS_SCRIPT: &str = r#"
local cur = redis.call('GET', KEYS[1])
local expected = ARGV[1]
local matches
if expected == '__absent__' then
  matches = (cur == false)
else
  matches = (cur == expected)
end
if matches then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SET', KEYS[1], ARGV[2], 'EX', ARGV[3])
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
"#;

const INCR_SCRIPT: &str = r#"
local v = redis.call('INCRBY', KEYS[1], ARGV[1])
if v == tonumber(ARGV[1]) and tonumber(ARGV[2]) > 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return v
"#;

pub struct RedisKv {
    manager: ConnectionManager,
    cas: Script,
    incr: Script,
}

impl RedisKv {
    /// Connect to `redis_url` and build the manager.
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url).map_err(map_err)?;
        let manager = client.get_connection_manager().await.map_err(map_err)?;
        Ok(Self {
            manager,
            cas: Script::new(CAS_SCRIPT),
            incr: Script::new(INCR_SCRIPT),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

fn map_err(e: redis::RedisError) -> KvError {
    if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
        KvError::Unavailable(e.to_string())
    } else {
        KvError::Other(e.to_string())
    }
}

fn ttl_secs(ttl: Option<Duration>) -> u64 {
    ttl.map(|d| d.as_secs().max(1)).unwrap_or(0)
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut conn = self.conn();
        conn.get(key).await.map_err(map_err)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), KvError> {
        let mut conn = self.conn();
        match ttl {
            Some(d) => conn
                .set_ex::<_, _, ()>(key, value, d.as_secs().max(1))
                .await
                .map_err(map_err),
            None => conn.set::<_, _, ()>(key, value).await.map_err(map_err),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut conn = self.conn();
        conn.del::<_, ()>(key).await.map_err(map_err)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, KvError> {
        let mut conn = self.conn();
        let won: i64 = self
            .cas
            .key(key)
            .arg(expected.unwrap_or(ABSENT))
            .arg(new)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)?;
        Ok(won == 1)
    }

    async fn incr(&self, key: &str, by: i64, ttl: Option<Duration>) -> Result<i64, KvError> {
        let mut conn = self.conn();
        self.incr
            .key(key)
            .arg(by)
            .arg(ttl_secs(ttl))
            .invoke_async(&mut conn)
            .await
            .map_err(map_err)
    }

    async fn ping(&self) -> Result<(), KvError> {
        let mut conn = self.conn();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(map_err)
    }
}
