//! KV store contract (C12): the fast, TTL-bearing side of persistence —
//! quote cache, work queues, cooldown/blacklist gates, and sorted-set
//! history — as opposed to the durable store's relational tables.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::time::Duration;

pub use memory::InMemoryKv;
pub use redis_store::RedisKv;

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()>;
    async fn del(&self, key: &str) -> anyhow::Result<()>;

    /// `true` if the key was absent (this call created it with the TTL);
    /// `false` if it was already present. Used for cooldown gating.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool>;

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()>;
    async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool>;

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()>;
    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>>;
    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, String)>>;

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<()>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>>;

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()>;
    async fn zrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>>;
    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()>;
}
