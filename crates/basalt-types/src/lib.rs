//! Shared primitive types for `basalt-coordination`, `basalt-srpc` and
//! `basalt-migration`.
//!
//! These are the small, ubiquitous, `Copy`-friendly values referenced by the
//! data model of all three subsystems: opaque ownership tokens for locks and
//! leader terms, monotonic mesh instance ids, wire-level request and
//! substream ids, and a millisecond clock helper used for heartbeat and
//! clock-drift comparisons.

use std::fmt::{self, Display};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// An opaque value that identifies the holder of a lock or leader term.
///
/// Freshly generated on every acquisition so that a stale renew/release
/// issued after the holder has already lost ownership can never affect the
/// new holder's claim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerToken(String);

impl OwnerToken {
    /// Generates a fresh, globally unique owner token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for OwnerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for OwnerToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A mesh node's monotonic instance id, issued by `INCR` on a per-key Redis
/// counter. Unique for the lifetime of the mesh key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for InstanceId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl From<InstanceId> for u32 {
    fn from(id: InstanceId) -> Self {
        id.0
    }
}

/// A request correlation id, unique per originator per connection lifetime.
///
/// Used both by mesh `invoke()` and by SRPC envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Generates a fresh request id (UUID v4; see distilled-spec Open
    /// Question about v7 stream ids — request ids have no ordering
    /// requirement so v4 is sufficient and keeps generation allocation-free
    /// of any clock read).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A multiplexed byte-substream id, scoped to one SRPC stream.
///
/// Sender-allocated ids on one side of a connection start at 1 and step by
/// 2; the other side starts at 2 and steps by 2, so concurrently created
/// substreams can never collide without any negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SubstreamId(u32);

impl SubstreamId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Returns the next id a sender on this side of the connection should
    /// use, stepping by 2 from `self`.
    pub fn next(self) -> Self {
        Self(self.0 + 2)
    }
}

impl Display for SubstreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which parity of substream ids a connection side allocates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubstreamParity {
    /// Starts at 1, steps by 2 (odd ids).
    Odd,
    /// Starts at 2, steps by 2 (even ids).
    Even,
}

impl SubstreamParity {
    pub fn first(self) -> SubstreamId {
        match self {
            Self::Odd => SubstreamId::new(1),
            Self::Even => SubstreamId::new(2),
        }
    }
}

/// Returns the current wall-clock time in milliseconds since the Unix epoch.
///
/// Used for clock-drift checks (SRPC auth) and heartbeat staleness (mesh
/// cleanup is computed server-side via Redis `TIME` instead, precisely to
/// avoid relying on this for anything safety-critical).
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_tokens_are_unique() {
        let a = OwnerToken::generate();
        let b = OwnerToken::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn substream_parity_starts_correctly() {
        assert_eq!(SubstreamParity::Odd.first(), SubstreamId::new(1));
        assert_eq!(SubstreamParity::Even.first(), SubstreamId::new(2));
    }

    #[test]
    fn substream_id_steps_by_two() {
        let id = SubstreamParity::Odd.first();
        assert_eq!(id.next(), SubstreamId::new(3));
        assert_eq!(id.next().next(), SubstreamId::new(5));
    }

    #[test]
    fn now_ms_is_monotonically_plausible() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }

    #[test]
    fn instance_id_roundtrips_through_u32() {
        let id = InstanceId::new(42);
        assert_eq!(u32::from(id), 42);
    }
}
