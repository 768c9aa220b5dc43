//! Key-value store abstraction
//! A Redis-shaped command set executed as atomic pipelines

pub mod memory;
pub mod script;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;

use crate::types::Timestamp;
pub use script::Script;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("WRONGTYPE Operation against key {0} holding the wrong kind of value")]
    WrongType(String),
    #[error("unexpected reply: expected {expected}, got {got}")]
    UnexpectedReply { expected: &'static str, got: String },
}

/// Commands understood by a [`KeyValueStore`]
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// SADD key member [member ...]
    SAdd { key: String, members: Vec<Bytes> },
    /// SMEMBERS key
    SMembers { key: String },
    /// ZADD key score member, overwriting any previous score
    ZAdd { key: String, score: u64, member: String },
    /// ZRANGEBYSCORE key -inf max WITHSCORES LIMIT 0 count
    ZRangeByScore { key: String, max: u64, limit: usize },
    /// ZREM key member [member ...]
    ZRem { key: String, members: Vec<String> },
    /// EXPIRE key seconds
    Expire { key: String, ttl: Duration },
    /// TTL key
    Ttl { key: String },
    /// DEL key [key ...]
    Del { keys: Vec<String> },
    /// EVAL of one of the buffer's server side scripts
    Eval(Script),
}

/// Replies, one per command, in pipeline order
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Integer(i64),
    Members(Vec<Bytes>),
    Scored(Vec<(String, u64)>),
}

impl Reply {
    pub fn into_integer(self) -> Result<i64, StoreError> {
        match self {
            Reply::Integer(n) => Ok(n),
            other => Err(other.unexpected("integer")),
        }
    }

    pub fn into_members(self) -> Result<Vec<Bytes>, StoreError> {
        match self {
            Reply::Members(members) => Ok(members),
            other => Err(other.unexpected("members")),
        }
    }

    pub fn into_scored(self) -> Result<Vec<(String, u64)>, StoreError> {
        match self {
            Reply::Scored(entries) => Ok(entries),
            other => Err(other.unexpected("scored members")),
        }
    }

    fn unexpected(&self, expected: &'static str) -> StoreError {
        StoreError::UnexpectedReply {
            expected,
            got: format!("{:?}", self),
        }
    }
}

/// Ordered batch of commands applied atomically (MULTI/EXEC).
///
/// `now` is the logical time at which TTLs are evaluated and set.
#[derive(Clone, Debug)]
pub struct Pipeline {
    now: Timestamp,
    commands: Vec<Command>,
}

impl Pipeline {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now,
            commands: Vec::new(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn push(&mut self, command: Command) -> &mut Self {
        self.commands.push(command);
        self
    }

    pub fn sadd(&mut self, key: impl Into<String>, member: Bytes) -> &mut Self {
        self.push(Command::SAdd {
            key: key.into(),
            members: vec![member],
        })
    }

    pub fn smembers(&mut self, key: impl Into<String>) -> &mut Self {
        self.push(Command::SMembers { key: key.into() })
    }

    pub fn zadd(&mut self, key: impl Into<String>, score: u64, member: impl Into<String>) -> &mut Self {
        self.push(Command::ZAdd {
            key: key.into(),
            score,
            member: member.into(),
        })
    }

    pub fn zrangebyscore(&mut self, key: impl Into<String>, max: u64, limit: usize) -> &mut Self {
        self.push(Command::ZRangeByScore {
            key: key.into(),
            max,
            limit,
        })
    }

    pub fn zrem(&mut self, key: impl Into<String>, members: Vec<String>) -> &mut Self {
        self.push(Command::ZRem {
            key: key.into(),
            members,
        })
    }

    pub fn expire(&mut self, key: impl Into<String>, ttl: Duration) -> &mut Self {
        self.push(Command::Expire { key: key.into(), ttl })
    }

    pub fn del(&mut self, keys: Vec<String>) -> &mut Self {
        self.push(Command::Del { keys })
    }

    pub fn eval(&mut self, script: Script) -> &mut Self {
        self.push(Command::Eval(script))
    }
}

/// Trait for the store holding all buffer state (Redis in production).
///
/// Implementations must apply a pipeline atomically: no other pipeline may
/// observe a partially applied one.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn execute(&self, pipeline: Pipeline) -> Result<Vec<Reply>, StoreError>;
}
