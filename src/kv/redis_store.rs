//! `redis`-backed KV store built on `redis::aio::ConnectionManager`
//! (the `tokio-comp` + `connection-manager` feature pair) for automatic
//! reconnection without the caller having to retry dropped connections.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use super::KvStore;

#[derive(Clone)]
pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get(key).await?)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let _: () = conn.set_ex(key, value, secs).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let set: bool = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(secs)
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map(|r| r.is_some())
            .unwrap_or_else(|e| {
                warn!(error = %e, key, "redis SET NX EX failed");
                false
            });
        Ok(set)
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(key, member).await?;
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(key, member).await?)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.hget(key, field).await?)
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        let mut conn = self.conn.clone();
        let map: std::collections::HashMap<String, String> = conn.hgetall(key).await?;
        Ok(map.into_iter().collect())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.lpush(key, value).await?;
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.ltrim(key, start, stop).await?;
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zadd(key, member, score).await?;
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.zrange(key, start, stop).await?)
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.zrem(key, member).await?;
        Ok(())
    }
}
