//! Cryptographic primitives shared by `basalt-coordination`, `basalt-srpc`
//! and `basalt-migration`.
//!
//! Two small, audited primitives live here rather than behind a generic
//! "crypto" facade: HMAC-SHA256 request signing (SRPC handshake auth) and a
//! table-driven CRC32 (SRPC frame checksums, migration artifact integrity).
//! Both are cheap enough, and narrow enough in scope, that vendoring them
//! beats pulling in a general-purpose crate for two functions.

pub mod crc32;
pub mod hmac;

pub use crc32::crc32;
pub use hmac::{sign, verify, HmacError};
