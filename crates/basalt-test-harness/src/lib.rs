//! Shared fixtures for `basalt-coordination`, `basalt-migration` and
//! `basalt-srpc` tests that need more than one crate's pieces wired
//! together: an in-memory Redis stand-in (re-exported from
//! `basalt-coordination::testing` for convenience), a table-driven
//! [`catalog::FixtureCatalog`] for schema-differ tests, and a
//! [`srpc::LoopbackSrpc`] that runs a real `SrpcServer` + `SrpcClient` pair
//! over a loopback TCP socket.
//!
//! Each crate's own unit tests already build narrower fakes inline
//! (`basalt-migration::catalog`'s `FakeCatalog`, `basalt-srpc::substream`'s
//! `FakeHost`); this crate exists for tests that need a fixture shared
//! across more than one of them, or a real network round-trip.

pub mod catalog;
pub mod srpc;

pub use basalt_coordination::testing::{
    InMemoryRedisBackend, InMemorySubscriberFactory, InstanceIdLedger,
};
