//! Deadline scheduler
//!
//! One sorted set per shard holds the flush deadline of every open segment.
//! Every write re-arms the deadline of its segment, overwriting the previous
//! one: a root span arms the short linger, any other span the long linger.
//! Whatever span was written last decides when the segment becomes ready.

use std::time::Duration;

use crate::keys;
use crate::store::{Pipeline, Script};
use crate::types::Timestamp;

#[derive(Debug, Clone)]
pub struct DeadlineScheduler {
    short_linger: Duration,
    long_linger: Duration,
    ttl: Duration,
}

impl DeadlineScheduler {
    pub fn new(short_linger: Duration, long_linger: Duration, ttl: Duration) -> Self {
        Self {
            short_linger,
            long_linger,
            ttl,
        }
    }

    pub fn deadline_for(&self, is_root: bool, now: Timestamp) -> Timestamp {
        let linger = if is_root { self.short_linger } else { self.long_linger };
        now.saturating_add(linger.as_secs())
    }

    /// Overwrite the deadline of a segment
    pub fn rearm(&self, pipeline: &mut Pipeline, shard: u32, set_key: &str, deadline: Timestamp) {
        pipeline.zadd(keys::queue_key(shard), deadline, set_key);
    }

    /// Keep the queue itself from outliving the segments it references
    pub fn refresh_ttl(&self, pipeline: &mut Pipeline, shard: u32) {
        pipeline.expire(keys::queue_key(shard), self.ttl);
    }

    /// Segments of a shard whose deadline is at or before `now`, oldest first
    pub fn ready(&self, pipeline: &mut Pipeline, shard: u32, now: Timestamp, limit: usize) {
        pipeline.zrangebyscore(keys::queue_key(shard), now, limit);
    }

    /// Drop a segment, unless it changed after it was read with `deadline`
    /// and `members` spans
    pub fn release(
        &self,
        pipeline: &mut Pipeline,
        shard: u32,
        set_key: &str,
        deadline: Timestamp,
        members: usize,
    ) {
        pipeline.eval(Script::ReleaseSegment {
            queue: keys::queue_key(shard),
            member: set_key.to_string(),
            deadline,
            members,
        });
    }

    /// Unconditionally forget a queue entry and whatever is stored under it
    pub fn discard(&self, pipeline: &mut Pipeline, shard: u32, set_key: &str) {
        pipeline
            .zrem(keys::queue_key(shard), vec![set_key.to_string()])
            .del(vec![set_key.to_string()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Command;

    fn scheduler() -> DeadlineScheduler {
        DeadlineScheduler::new(
            Duration::from_secs(10),
            Duration::from_secs(60),
            Duration::from_secs(360),
        )
    }

    #[test]
    fn test_deadline_depends_on_root() {
        let scheduler = scheduler();
        assert_eq!(scheduler.deadline_for(true, 100), 110);
        assert_eq!(scheduler.deadline_for(false, 100), 160);
    }

    #[test]
    fn test_release_carries_the_observed_segment() {
        let mut pipeline = Pipeline::new(0);
        scheduler().release(&mut pipeline, 2, "seg", 70, 3);

        assert_eq!(
            pipeline.commands(),
            &[Command::Eval(Script::ReleaseSegment {
                queue: "span-buf:q:2".to_string(),
                member: "seg".to_string(),
                deadline: 70,
                members: 3,
            })]
        );
    }

    #[test]
    fn test_deadline_saturates() {
        assert_eq!(scheduler().deadline_for(false, u64::MAX - 1), u64::MAX);
    }
}
