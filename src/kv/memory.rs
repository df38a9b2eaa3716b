//! In-memory KV store used by integration tests so the pipeline runs
//! hermetically without a live redis instance.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::KvStore;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
pub struct InMemoryKv {
    strings: Mutex<HashMap<String, Entry>>,
    sets: Mutex<HashMap<String, std::collections::HashSet<String>>>,
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    lists: Mutex<HashMap<String, Vec<String>>>,
    zsets: Mutex<HashMap<String, Vec<(String, f64)>>>,
}

impl InMemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at.map(|t| Instant::now() < t).unwrap_or(true)
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let map = self.strings.lock();
        Ok(map
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
        self.strings.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> anyhow::Result<()> {
        self.strings.lock().remove(key);
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
        let mut map = self.strings.lock();
        let occupied = map.get(key).map(Self::is_live).unwrap_or(false);
        if occupied {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn sadd(&self, key: &str, member: &str) -> anyhow::Result<()> {
        self.sets
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn sismember(&self, key: &str, member: &str) -> anyhow::Result<bool> {
        Ok(self
            .sets
            .lock()
            .get(key)
            .map(|s| s.contains(member))
            .unwrap_or(false))
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> anyhow::Result<()> {
        self.hashes
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> anyhow::Result<Option<String>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .and_then(|h| h.get(field).cloned()))
    }

    async fn hgetall(&self, key: &str) -> anyhow::Result<Vec<(String, String)>> {
        Ok(self
            .hashes
            .lock()
            .get(key)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn lpush(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.lists
            .lock()
            .entry(key.to_string())
            .or_default()
            .insert(0, value.to_string());
        Ok(())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<()> {
        let mut lists = self.lists.lock();
        if let Some(list) = lists.get_mut(key) {
            let len = list.len() as isize;
            let (s, e) = normalize_range(start, stop, len);
            *list = list[s..=e.min(list.len().saturating_sub(1))].to_vec();
        }
        Ok(())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        let lists = self.lists.lock();
        let Some(list) = lists.get(key) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let (s, e) = normalize_range(start, stop, len);
        Ok(list[s..=e.min(list.len() - 1)].to_vec())
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> anyhow::Result<()> {
        let mut zsets = self.zsets.lock();
        let set = zsets.entry(key.to_string()).or_default();
        set.retain(|(m, _)| m != member);
        set.push((member.to_string(), score));
        set.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        Ok(())
    }

    async fn zrange(&self, key: &str, start: isize, stop: isize) -> anyhow::Result<Vec<String>> {
        let zsets = self.zsets.lock();
        let Some(set) = zsets.get(key) else {
            return Ok(Vec::new());
        };
        let len = set.len() as isize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let (s, e) = normalize_range(start, stop, len);
        Ok(set[s..=e.min(set.len() - 1)]
            .iter()
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zrem(&self, key: &str, member: &str) -> anyhow::Result<()> {
        if let Some(set) = self.zsets.lock().get_mut(key) {
            set.retain(|(m, _)| m != member);
        }
        Ok(())
    }
}

/// Translate redis-style (possibly negative) start/stop indices into a
/// concrete, clamped `[start, stop]` pair over a collection of length `len`.
fn normalize_range(start: isize, stop: isize, len: isize) -> (usize, usize) {
    if len == 0 {
        return (0, 0);
    }
    let norm = |i: isize| -> isize {
        if i < 0 {
            (len + i).max(0)
        } else {
            i
        }
    };
    let s = norm(start).min(len - 1).max(0) as usize;
    let e = norm(stop).min(len - 1).max(0) as usize;
    (s, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_only_succeeds_once() {
        let kv = InMemoryKv::new();
        assert!(kv.set_nx_ex("cooldown:a", "1", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.set_nx_ex("cooldown:a", "1", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn zrange_returns_ascending_score_order() {
        let kv = InMemoryKv::new();
        kv.zadd("hist", "b", 2.0).await.unwrap();
        kv.zadd("hist", "a", 1.0).await.unwrap();
        kv.zadd("hist", "c", 3.0).await.unwrap();
        assert_eq!(kv.zrange("hist", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn expired_string_keys_read_as_absent() {
        let kv = InMemoryKv::new();
        kv.set_ex("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}
