use async_trait::async_trait;
use redis::AsyncCommands;
use seatlock_core::{LockService, StoreError, StoreResult};
use std::time::Duration;
use tracing::info;

// Deletes KEYS[1] only while it still holds ARGV[1].
const RELEASE_IF_HELD: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn connection(&self) -> StoreResult<redis::aio::MultiplexedConnection> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(StoreError::lock_service)
    }
}

#[async_trait]
impl LockService for RedisClient {
    async fn try_acquire(&self, key: &str, holder: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.connection().await?;

        // SET NX: Only set if key does not exist
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(holder)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(StoreError::lock_service)?;

        if result.is_some() {
            info!("Seat lock acquired: {} -> {}", key, holder);
        }
        Ok(result.is_some())
    }

    async fn holder(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        conn.get(key).await.map_err(StoreError::lock_service)
    }

    async fn release(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await.map_err(StoreError::lock_service)?;
        Ok(removed > 0)
    }

    async fn release_if_held(&self, key: &str, holder: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = redis::Script::new(RELEASE_IF_HELD)
            .key(key)
            .arg(holder)
            .invoke_async(&mut conn)
            .await
            .map_err(StoreError::lock_service)?;
        Ok(removed > 0)
    }
}
