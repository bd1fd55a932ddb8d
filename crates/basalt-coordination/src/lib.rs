//! Redis-backed distributed coordination: process-local and Redis-backed
//! mutexes, leader election, and a per-key mesh of peers with request/
//! response RPC over pub/sub.
//!
//! Every component is built against the [`redis_backend::RedisBackend`] /
//! [`redis_backend::RedisSubscriber`] traits rather than a concrete Redis
//! client, so tests run against the in-memory fakes in [`testing`] without a
//! live Redis server.

pub mod error;
pub mod keyspace;
pub mod leader;
pub mod mesh;
pub mod mutex;
pub mod redis_backend;
pub mod script_runner;
pub mod testing;

pub use error::{CoordinationError, Result};
pub use leader::{Leader, LeaderOptions, LeaderState};
pub use mesh::{Mesh, MeshNode, MeshOptions};
pub use mutex::{Mutex, MutexOptions, MutexOutcome};
pub use redis_backend::{
    RealRedisBackend, RealRedisSubscriber, RealRedisSubscriberFactory, RedisBackend,
    RedisSubscriber, RedisSubscriberFactory,
};
pub use script_runner::RedisScriptRunner;
