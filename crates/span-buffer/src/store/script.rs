//! Server side scripts
//! Multi-key compare-and-act steps that Redis runs as Lua via EVAL

/// Scripts the buffer needs beyond plain commands
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Script {
    /// Drop a segment from its queue and delete its member set, but only while
    /// the queued deadline still equals `deadline` and the set still holds
    /// exactly `members` spans. Members are only ever added, so an unchanged
    /// count means no span arrived after the segment was read.
    ///
    /// Replies `1` when the segment was released, `0` otherwise.
    ///
    /// ```lua
    /// local score = redis.call('ZSCORE', KEYS[1], ARGV[1])
    /// if score and tonumber(score) == tonumber(ARGV[2])
    ///     and redis.call('SCARD', ARGV[1]) == tonumber(ARGV[3]) then
    ///     redis.call('ZREM', KEYS[1], ARGV[1])
    ///     redis.call('DEL', ARGV[1])
    ///     return 1
    /// end
    /// return 0
    /// ```
    ReleaseSegment {
        queue: String,
        member: String,
        deadline: u64,
        members: usize,
    },
}
