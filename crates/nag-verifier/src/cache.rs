/// Redis-backed index state.
///
/// All operations degrade gracefully when Redis is unavailable.
///
/// Key schema:
/// - `nag:v1:index_fingerprint:{table}` — sha256 of the embedder and sources the table was built from
use rag_common::redis::RedisCache;

const KEY_PREFIX: &str = "nag:v1:";

pub struct IndexCache {
    redis: RedisCache,
}

impl IndexCache {
    pub fn new(redis: RedisCache) -> Self {
        Self { redis }
    }

    /// Whether fingerprints can be read and written at all.
    pub async fn is_available(&self) -> bool {
        self.redis.is_available().await
    }

    pub async fn get_fingerprint(&self, table: &str) -> Option<String> {
        self.redis.get(&fingerprint_key(table)).await
    }

    pub async fn set_fingerprint(&self, table: &str, fingerprint: &str) -> bool {
        self.redis.set(&fingerprint_key(table), fingerprint).await
    }
}

fn fingerprint_key(table: &str) -> String {
    format!("{KEY_PREFIX}index_fingerprint:{table}")
}
