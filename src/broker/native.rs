//! Native substrate: the blocking Redis protocol.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde_json::Value;
use std::time::Duration;

use super::{normalize_text, Broker, BrokerResult, Popped};

/// Longest single BLPOP. Longer timeouts return `None` early; the worker
/// simply pops again.
const MAX_BLOCK: Duration = Duration::from_secs(86400);

/// Connection parameters for `host:port`.
///
/// The password travels as its own field, so it needs no URL escaping.
pub fn connection_info(host: &str, port: u16, password: Option<String>) -> ConnectionInfo {
    ConnectionInfo {
        addr: ConnectionAddr::Tcp(host.to_string(), port),
        redis: RedisConnectionInfo {
            password,
            ..Default::default()
        },
    }
}

/// Broker over a multiplexed Redis connection.
///
/// The connection is established once and reused; clones share it.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connect to the broker described by `info` (a URL or [`ConnectionInfo`]).
    pub async fn connect(info: impl IntoConnectionInfo) -> BrokerResult<Self> {
        let client = redis::Client::open(info)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    /// One non-blocking pass over `keys`.
    async fn pop_once(&self, keys: &[String]) -> BrokerResult<Option<Popped>> {
        let mut conn = self.conn.clone();
        for key in keys {
            // Bytes, not String: the entry is already gone from the server, so
            // a UTF-8 failure must still reach the caller as an entry.
            let entry: Option<Vec<u8>> = conn.lpop(key, None).await?;
            if let Some(bytes) = entry {
                return Ok(Some(Popped::from_bytes(key.clone(), bytes)));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn get(&self, key: &str) -> BrokerResult<Option<Value>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value.map(normalize_text))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let reply: String = conn.set_ex(key, value, ttl.as_secs().max(1)).await?;
        Ok(reply.eq_ignore_ascii_case("OK"))
    }

    async fn delete(&self, keys: &[String]) -> BrokerResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(keys).await?;
        Ok(removed)
    }

    async fn push(&self, key: &str, values: &[String]) -> BrokerResult<u64> {
        if values.is_empty() {
            return self.len(key).await;
        }
        let mut conn = self.conn.clone();
        let len: u64 = conn.rpush(key, values).await?;
        Ok(len)
    }

    async fn blocking_pop(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> BrokerResult<Option<Popped>> {
        if keys.is_empty() {
            return Ok(None);
        }
        // BLPOP treats 0 as "wait forever".
        if timeout.is_zero() {
            return self.pop_once(keys).await;
        }

        let mut conn = self.conn.clone();
        let timeout = timeout.min(MAX_BLOCK);
        let result: Option<(String, Vec<u8>)> = conn.blpop(keys, timeout.as_secs_f64()).await?;
        Ok(result.map(|(key, bytes)| Popped::from_bytes(key, bytes)))
    }

    async fn publish(&self, channel: &str, message: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let receivers: u64 = conn.publish(channel, message).await?;
        Ok(receivers)
    }

    async fn len(&self, key: &str) -> BrokerResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.llen(key).await?;
        Ok(len)
    }

    async fn range(&self, key: &str, start: i64, end: i64) -> BrokerResult<Vec<Value>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = conn.lrange(key, start as isize, end as isize).await?;
        Ok(items.into_iter().map(normalize_text).collect())
    }

    async fn ping(&self) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(reply.eq_ignore_ascii_case("PONG"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_with_reserved_characters() {
        let info = connection_info("cache", 6380, Some("pa#ss/w?@".to_string()));
        assert_eq!(info.addr, ConnectionAddr::Tcp("cache".to_string(), 6380));
        assert_eq!(info.redis.password.as_deref(), Some("pa#ss/w?@"));

        // Opening a client only validates parameters; nothing connects.
        assert!(redis::Client::open(info).is_ok());
    }

    #[test]
    fn test_no_password() {
        let info = connection_info("localhost", 6379, None);
        assert_eq!(info.redis.password, None);
        assert_eq!(info.redis.db, 0);
    }
}
