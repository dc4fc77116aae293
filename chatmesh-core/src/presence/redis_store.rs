//! Redis-backed presence directory.
//!
//! One string key per user (`user:<username>` → node address), written with
//! plain `SET` and no expiry. All nodes of a cluster point at the same Redis.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};

use super::{presence_key, PresenceDirectory, PresenceError};

/// Delete KEYS[1] only while it still equals ARGV[1].
const RETRACT_IF_OWNER: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

impl From<redis::RedisError> for PresenceError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_io_error() || e.is_timeout() {
            PresenceError::Unavailable(e.to_string())
        } else {
            PresenceError::Backend(e.to_string())
        }
    }
}

/// Normalise `host:port` into a `redis://` URL; full URLs pass through.
pub fn redis_url(host: &str) -> String {
    if host.contains("://") {
        host.to_string()
    } else {
        format!("redis://{host}")
    }
}

pub struct RedisPresence {
    /// Multiplexed: clones share one socket.
    conn: MultiplexedConnection,
    url: String,
}

impl RedisPresence {
    /// Connect and verify the server answers `PING`.
    pub async fn connect(host: &str) -> Result<Self, PresenceError> {
        let url = redis_url(host);
        let client = redis::Client::open(url.as_str())
            .map_err(|e| PresenceError::Unavailable(format!("Invalid Redis URL {url}: {e}")))?;
        let conn = client.get_multiplexed_async_connection().await?;

        let presence = Self { conn, url };
        presence.ping().await?;
        log::info!("Connected to Redis presence directory at {}", presence.url);
        Ok(presence)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl PresenceDirectory for RedisPresence {
    async fn publish(&self, user: &str, node_addr: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(presence_key(user), node_addr).await?;
        log::debug!("Published presence {user} -> {node_addr}");
        Ok(())
    }

    async fn resolve(&self, user: &str) -> Result<Option<String>, PresenceError> {
        let mut conn = self.conn.clone();
        let addr: Option<String> = conn.get(presence_key(user)).await?;
        Ok(addr)
    }

    async fn retract(&self, user: &str) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(presence_key(user)).await?;
        log::debug!("Retracted presence for {user}");
        Ok(())
    }

    async fn retract_if_owner(&self, user: &str, node_addr: &str) -> Result<bool, PresenceError> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(RETRACT_IF_OWNER)
            .key(presence_key(user))
            .arg(node_addr)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }

    async fn ping(&self) -> Result<(), PresenceError> {
        let mut conn = self.conn.clone();
        let reply: String = redis::cmd("PING").query_async(&mut conn).await?;
        if reply != "PONG" {
            return Err(PresenceError::Backend(format!("Unexpected PING reply: {reply}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_url_normalisation() {
        assert_eq!(redis_url("redis:6379"), "redis://redis:6379");
        assert_eq!(redis_url("redis://cache:6380/2"), "redis://cache:6380/2");
        assert_eq!(redis_url("rediss://secure:6379"), "rediss://secure:6379");
    }

    #[tokio::test]
    async fn test_connect_unreachable_fails() {
        // Port 1 is never a Redis server; startup must fail, not degrade.
        let result = RedisPresence::connect("127.0.0.1:1").await;
        assert!(result.is_err());
    }
}
