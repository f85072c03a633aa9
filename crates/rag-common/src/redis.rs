/// Redis wrapper with graceful degradation.
///
/// All operations return `Option<T>` or `bool`. On any Redis error, the operation logs a
/// warning and degrades to a no-op. The backend is fully functional without Redis.
use redis::AsyncCommands;
use tracing::warn;

pub struct RedisCache {
    client: Option<redis::Client>,
}

impl RedisCache {
    /// Attempt to connect to Redis. If the URL is `None` or connection fails,
    /// returns a `RedisCache` that always degrades gracefully (no-ops).
    pub fn new(url: Option<&str>) -> Self {
        let client = url.and_then(|u| {
            redis::Client::open(u)
                .inspect_err(|e| warn!(error = %e, url = u, "failed to create redis client, redis disabled"))
                .ok()
        });
        Self { client }
    }

    /// Test the connection by sending a PING. Returns `true` if Redis is reachable.
    pub async fn is_available(&self) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        match client.get_multiplexed_async_connection().await {
            Ok(mut conn) => {
                let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
                result.is_ok()
            }
            Err(_) => false,
        }
    }

    /// Get a value from Redis. Returns `None` if Redis is unavailable or the key doesn't exist.
    pub async fn get(&self, key: &str) -> Option<String> {
        let client = self.client.as_ref()?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))
            .ok()?;
        let value: Option<String> = conn
            .get(key)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis GET failed"))
            .ok()?;
        value
    }

    /// Set a value in Redis with no expiry. Returns `true` if successful.
    pub async fn set(&self, key: &str, value: &str) -> bool {
        let Some(client) = &self.client else {
            return false;
        };
        let Ok(mut conn) = client
            .get_multiplexed_async_connection()
            .await
            .inspect_err(|e| warn!(error = %e, "redis connection failed"))
        else {
            return false;
        };
        conn.set::<_, _, ()>(key, value)
            .await
            .inspect_err(|e| warn!(error = %e, key, "redis SET failed"))
            .is_ok()
    }
}
