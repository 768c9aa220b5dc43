//! In-process store with Redis semantics
//! Sets, sorted sets, TTLs on logical time, atomic pipelines

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

use super::{Command, KeyValueStore, Pipeline, Reply, Script, StoreError};
use crate::metrics;
use crate::types::Timestamp;

#[derive(Debug)]
enum Value {
    Set(BTreeSet<Bytes>),
    SortedSet(HashMap<String, u64>),
}

impl Value {
    fn is_empty(&self) -> bool {
        match self {
            Value::Set(members) => members.is_empty(),
            Value::SortedSet(members) => members.is_empty(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Timestamp>,
}

impl Entry {
    fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }
}

/// Keyspace guarded by the store lock.
///
/// Expired keys are evicted on access and, through `expiry`, purged before
/// every pipeline, so keys nobody touches again do not stay resident.
#[derive(Debug, Default)]
struct Keyspace {
    entries: HashMap<String, Entry>,
    /// (expires_at, key) of every key with a TTL. Entries can outlive their
    /// key; `purge_expired` checks them against the live entry.
    expiry: BTreeSet<(Timestamp, String)>,
}

impl Keyspace {
    /// Drop every key whose TTL elapsed at or before `now`
    fn purge_expired(&mut self, now: Timestamp) -> usize {
        let mut purged = 0;
        while let Some((at, _)) = self.expiry.first() {
            if *at > now {
                break;
            }
            let Some((at, key)) = self.expiry.pop_first() else {
                break;
            };
            if self.entries.get(&key).map_or(false, |e| e.expires_at == Some(at)) {
                self.entries.remove(&key);
                purged += 1;
            }
        }
        purged
    }

    fn evict_expired(&mut self, key: &str, now: Timestamp) {
        if self.entries.get(key).map_or(false, |e| e.is_expired(now)) {
            trace!(key, "evicting expired key");
            self.entries.remove(key);
        }
    }

    fn get(&mut self, key: &str, now: Timestamp) -> Option<&mut Entry> {
        self.evict_expired(key, now);
        self.entries.get_mut(key)
    }

    fn get_or_insert(&mut self, key: &str, now: Timestamp, empty: fn() -> Value) -> &mut Entry {
        self.evict_expired(key, now);
        self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: empty(),
            expires_at: None,
        })
    }

    /// Redis never keeps empty collections around.
    fn remove_if_empty(&mut self, key: &str) {
        if self.entries.get(key).map_or(false, |e| e.value.is_empty()) {
            self.entries.remove(key);
        }
    }

    fn apply(&mut self, now: Timestamp, command: &Command) -> Result<Reply, StoreError> {
        match command {
            Command::SAdd { key, members } => {
                let entry = self.get_or_insert(key, now, || Value::Set(BTreeSet::new()));
                let Value::Set(set) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                let added = members.iter().filter(|m| set.insert((*m).clone())).count();
                self.remove_if_empty(key);
                Ok(Reply::Integer(added as i64))
            }
            Command::SMembers { key } => match self.get(key, now) {
                None => Ok(Reply::Members(Vec::new())),
                Some(Entry { value: Value::Set(set), .. }) => {
                    Ok(Reply::Members(set.iter().cloned().collect()))
                }
                Some(_) => Err(StoreError::WrongType(key.clone())),
            },
            Command::ZAdd { key, score, member } => {
                let entry = self.get_or_insert(key, now, || Value::SortedSet(HashMap::new()));
                let Value::SortedSet(zset) = &mut entry.value else {
                    return Err(StoreError::WrongType(key.clone()));
                };
                let added = zset.insert(member.clone(), *score).is_none();
                Ok(Reply::Integer(added as i64))
            }
            Command::ZRangeByScore { key, max, limit } => match self.get(key, now) {
                None => Ok(Reply::Scored(Vec::new())),
                Some(Entry { value: Value::SortedSet(zset), .. }) => {
                    let mut ready: Vec<(String, u64)> = zset
                        .iter()
                        .filter(|(_, score)| **score <= *max)
                        .map(|(member, score)| (member.clone(), *score))
                        .collect();
                    ready.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                    ready.truncate(*limit);
                    Ok(Reply::Scored(ready))
                }
                Some(_) => Err(StoreError::WrongType(key.clone())),
            },
            Command::ZRem { key, members } => {
                let removed = match self.get(key, now) {
                    None => 0,
                    Some(Entry { value: Value::SortedSet(zset), .. }) => {
                        members.iter().filter(|m| zset.remove(*m).is_some()).count()
                    }
                    Some(_) => return Err(StoreError::WrongType(key.clone())),
                };
                self.remove_if_empty(key);
                Ok(Reply::Integer(removed as i64))
            }
            Command::Expire { key, ttl } => Ok(Reply::Integer(self.expire(key, now, *ttl))),
            Command::Ttl { key } => {
                let ttl = match self.get(key, now) {
                    None => -2,
                    Some(entry) => entry
                        .expires_at
                        .map_or(-1, |at| at.saturating_sub(now) as i64),
                };
                Ok(Reply::Integer(ttl))
            }
            Command::Del { keys } => {
                let mut deleted = 0;
                for key in keys {
                    self.evict_expired(key, now);
                    if self.entries.remove(key).is_some() {
                        deleted += 1;
                    }
                }
                Ok(Reply::Integer(deleted))
            }
            Command::Eval(script) => self.eval(now, script),
        }
    }

    fn expire(&mut self, key: &str, now: Timestamp, ttl: Duration) -> i64 {
        let secs = ttl.as_secs();
        if secs == 0 {
            self.evict_expired(key, now);
            return self.entries.remove(key).map_or(0, |_| 1);
        }
        let expires_at = now.saturating_add(secs);
        let previous = match self.get(key, now) {
            None => return 0,
            Some(entry) => entry.expires_at.replace(expires_at),
        };
        if let Some(previous) = previous {
            self.expiry.remove(&(previous, key.to_string()));
        }
        self.expiry.insert((expires_at, key.to_string()));
        1
    }

    fn eval(&mut self, now: Timestamp, script: &Script) -> Result<Reply, StoreError> {
        match script {
            Script::ReleaseSegment {
                queue,
                member,
                deadline,
                members,
            } => {
                let current = match self.get(queue, now) {
                    None => None,
                    Some(Entry { value: Value::SortedSet(zset), .. }) => zset.get(member).copied(),
                    Some(_) => return Err(StoreError::WrongType(queue.clone())),
                };
                if current != Some(*deadline) {
                    return Ok(Reply::Integer(0));
                }
                let size = match self.get(member, now) {
                    None => 0,
                    Some(Entry { value: Value::Set(set), .. }) => set.len(),
                    Some(_) => return Err(StoreError::WrongType(member.clone())),
                };
                if size != *members {
                    return Ok(Reply::Integer(0));
                }
                if let Some(Entry { value: Value::SortedSet(zset), .. }) = self.entries.get_mut(queue) {
                    zset.remove(member);
                }
                self.remove_if_empty(queue);
                self.entries.remove(member);
                Ok(Reply::Integer(1))
            }
        }
    }
}

/// In-process [`KeyValueStore`].
///
/// Every pipeline runs under one lock, so pipelines are atomic with respect to
/// each other. Like Redis, a failing command neither rolls back nor stops the
/// other commands of its pipeline; the first error is returned afterwards.
pub struct MemoryStore {
    keyspace: Mutex<Keyspace>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            keyspace: Mutex::new(Keyspace::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate losing (or regaining) the connection to the store
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Live keys at `now`, sorted
    pub fn keys(&self, now: Timestamp) -> Vec<String> {
        let mut keyspace = self.keyspace.lock();
        keyspace.purge_expired(now);
        let mut keys: Vec<String> = keyspace.entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Remaining lifetime of `key` in seconds; `-1` without expiry, `-2` when missing
    pub fn ttl(&self, key: &str, now: Timestamp) -> i64 {
        let command = Command::Ttl { key: key.to_string() };
        match self.keyspace.lock().apply(now, &command) {
            Ok(Reply::Integer(ttl)) => ttl,
            _ => -2,
        }
    }

    pub fn is_empty(&self, now: Timestamp) -> bool {
        self.keys(now).is_empty()
    }

    /// Keys held in memory right now, expired or not
    pub fn resident(&self) -> usize {
        self.keyspace.lock().entries.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }

        let now = pipeline.now();
        let mut keyspace = self.keyspace.lock();

        let purged = keyspace.purge_expired(now);
        if purged > 0 {
            metrics::EXPIRED_KEYS.inc_by(purged as u64);
            debug!(purged, now, "purged expired keys");
        }

        // Like EXEC: every command runs, errors are reported afterwards
        let mut replies = Vec::with_capacity(pipeline.commands().len());
        let mut first_error = None;
        for command in pipeline.commands() {
            match keyspace.apply(now, command) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(replies),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run(store: &MemoryStore, now: Timestamp, build: impl FnOnce(&mut Pipeline)) -> Vec<Reply> {
        let mut pipeline = Pipeline::new(now);
        build(&mut pipeline);
        store.execute(pipeline).await.unwrap()
    }

    #[tokio::test]
    async fn test_sadd_suppresses_duplicates() {
        let store = MemoryStore::new();
        let replies = run(&store, 0, |p| {
            p.sadd("s", Bytes::from_static(b"a"));
            p.sadd("s", Bytes::from_static(b"a"));
            p.sadd("s", Bytes::from_static(b"b"));
            p.smembers("s");
        })
        .await;

        assert_eq!(replies[0], Reply::Integer(1));
        assert_eq!(replies[1], Reply::Integer(0));
        assert_eq!(
            replies[3],
            Reply::Members(vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")])
        );
    }

    #[tokio::test]
    async fn test_zadd_overwrites_score() {
        let store = MemoryStore::new();
        let replies = run(&store, 0, |p| {
            p.zadd("q", 60, "seg");
            p.zadd("q", 10, "seg");
            p.zrangebyscore("q", 10, 10);
        })
        .await;

        assert_eq!(replies[2], Reply::Scored(vec![("seg".to_string(), 10)]));
    }

    #[tokio::test]
    async fn test_zrangebyscore_orders_and_limits() {
        let store = MemoryStore::new();
        let replies = run(&store, 0, |p| {
            p.zadd("q", 30, "c");
            p.zadd("q", 10, "b");
            p.zadd("q", 10, "a");
            p.zadd("q", 99, "late");
            p.zrangebyscore("q", 50, 2);
        })
        .await;

        assert_eq!(
            replies[4],
            Reply::Scored(vec![("a".to_string(), 10), ("b".to_string(), 10)])
        );
    }

    #[tokio::test]
    async fn test_expire_and_ttl() {
        let store = MemoryStore::new();
        run(&store, 100, |p| {
            p.sadd("s", Bytes::from_static(b"a"));
        })
        .await;
        assert_eq!(store.ttl("s", 100), -1);
        assert_eq!(store.ttl("missing", 100), -2);

        run(&store, 100, |p| {
            p.expire("s", Duration::from_secs(50));
        })
        .await;
        assert_eq!(store.ttl("s", 120), 30);

        // Expired at exactly the deadline
        assert_eq!(store.ttl("s", 150), -2);
        assert!(store.is_empty(150));
    }

    #[tokio::test]
    async fn test_sadd_keeps_existing_ttl() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            p.sadd("s", Bytes::from_static(b"a"));
            p.expire("s", Duration::from_secs(10));
        })
        .await;
        run(&store, 5, |p| {
            p.sadd("s", Bytes::from_static(b"b"));
        })
        .await;
        assert_eq!(store.ttl("s", 5), 5);
    }

    #[tokio::test]
    async fn test_empty_collections_disappear() {
        let store = MemoryStore::new();
        let replies = run(&store, 0, |p| {
            p.zadd("q", 1, "m");
            p.zrem("q", vec!["m".to_string()]);
        })
        .await;

        assert_eq!(replies[1], Reply::Integer(1));
        assert!(store.is_empty(0));
    }

    #[tokio::test]
    async fn test_del_counts_existing_keys() {
        let store = MemoryStore::new();
        let replies = run(&store, 0, |p| {
            p.sadd("a", Bytes::from_static(b"x"));
            p.zadd("b", 1, "m");
            p.del(vec!["a".to_string(), "b".to_string(), "c".to_string()]);
        })
        .await;

        assert_eq!(replies[2], Reply::Integer(2));
        assert!(store.is_empty(0));
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            p.zadd("q", 1, "m");
        })
        .await;

        let mut pipeline = Pipeline::new(0);
        pipeline.sadd("q", Bytes::from_static(b"a"));
        let result = store.execute(pipeline).await;
        assert!(matches!(result, Err(StoreError::WrongType(key)) if key == "q"));
    }

    #[tokio::test]
    async fn test_failed_command_does_not_skip_the_rest() {
        let store = MemoryStore::new();
        let mut pipeline = Pipeline::new(0);
        pipeline
            .zadd("q", 1, "m")
            .sadd("q", Bytes::from_static(b"a"))
            .sadd("s", Bytes::from_static(b"b"))
            .expire("s", Duration::from_secs(10));

        assert!(matches!(store.execute(pipeline).await, Err(StoreError::WrongType(_))));
        assert_eq!(store.ttl("s", 0), 10);
    }

    #[tokio::test]
    async fn test_untouched_expired_keys_are_purged() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            for i in 0..100 {
                let key = format!("orphan-{}", i);
                p.sadd(key.clone(), Bytes::from_static(b"x"));
                p.expire(key, Duration::from_secs(360));
            }
        })
        .await;
        assert_eq!(store.resident(), 100);

        // Unrelated traffic after the TTL reclaims them without reading them
        run(&store, 1000, |p| {
            p.zadd("q", 1060, "live");
        })
        .await;
        assert_eq!(store.resident(), 1);
    }

    #[tokio::test]
    async fn test_extended_ttl_is_not_purged_early() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            p.sadd("s", Bytes::from_static(b"a"));
            p.expire("s", Duration::from_secs(10));
        })
        .await;
        run(&store, 5, |p| {
            p.expire("s", Duration::from_secs(10));
        })
        .await;

        run(&store, 12, |_| {}).await;
        assert_eq!(store.resident(), 1);
        assert_eq!(store.ttl("s", 12), 3);

        run(&store, 15, |_| {}).await;
        assert_eq!(store.resident(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_pipelines() {
        let store = MemoryStore::new();
        store.set_available(false);

        let mut pipeline = Pipeline::new(0);
        pipeline.sadd("s", Bytes::from_static(b"a"));
        assert!(matches!(store.execute(pipeline).await, Err(StoreError::Unavailable(_))));
        assert!(store.is_empty(0));

        store.set_available(true);
        let mut pipeline = Pipeline::new(0);
        pipeline.sadd("s", Bytes::from_static(b"a"));
        assert!(store.execute(pipeline).await.is_ok());
    }

    #[tokio::test]
    async fn test_release_segment_requires_matching_deadline() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            p.sadd("seg", Bytes::from_static(b"a"));
            p.zadd("q", 10, "seg");
        })
        .await;

        let release = |deadline, members| Script::ReleaseSegment {
            queue: "q".to_string(),
            member: "seg".to_string(),
            deadline,
            members,
        };

        let replies = run(&store, 20, |p| {
            p.eval(release(60, 1));
        })
        .await;
        assert_eq!(replies[0], Reply::Integer(0));
        assert_eq!(store.keys(20), vec!["q".to_string(), "seg".to_string()]);

        let replies = run(&store, 20, |p| {
            p.eval(release(10, 1));
            p.eval(release(10, 1));
        })
        .await;
        assert_eq!(replies, vec![Reply::Integer(1), Reply::Integer(0)]);
        assert!(store.is_empty(20));
    }

    #[tokio::test]
    async fn test_release_segment_requires_unchanged_members() {
        let store = MemoryStore::new();
        run(&store, 0, |p| {
            p.sadd("seg", Bytes::from_static(b"a"));
            p.sadd("seg", Bytes::from_static(b"b"));
            p.zadd("q", 10, "seg");
        })
        .await;

        let replies = run(&store, 20, |p| {
            p.eval(Script::ReleaseSegment {
                queue: "q".to_string(),
                member: "seg".to_string(),
                deadline: 10,
                members: 1,
            });
        })
        .await;
        assert_eq!(replies[0], Reply::Integer(0));
        assert_eq!(store.keys(20), vec!["q".to_string(), "seg".to_string()]);
    }
}
