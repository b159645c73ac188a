use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tracing::debug;

/// Redis client wrapper around a multiplexed, auto-reconnecting connection.
///
/// Cloning is cheap and every clone shares the same underlying connection.
/// Stores built on top of it never close it; the owner decides its lifetime.
#[derive(Clone)]
pub struct RedisClient {
    manager: ConnectionManager,
}

impl RedisClient {
    /// Connects to Redis
    ///
    /// # Arguments
    /// * `url` - Connection URL (e.g., "redis://localhost:6379/0")
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("Invalid Redis URL")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;
        debug!("redis connection established");
        Ok(Self { manager })
    }

    /// Pings the server to verify connectivity
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.connection();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .context("Redis PING failed")?;
        debug!("redis connection successful");
        Ok(())
    }

    /// Gets a handle on the shared connection
    pub fn connection(&self) -> ConnectionManager {
        self.manager.clone()
    }
}
