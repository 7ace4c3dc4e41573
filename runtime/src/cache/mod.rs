//! File-level digest cache.
//!
//! Remembers the digest of large files keyed by absolute path so unchanged
//! files are not re-hashed across builds.

pub mod digest_cache;

pub use digest_cache::{CacheItem, DigestCache, DEFAULT_LOCK_TIMEOUT, DEFAULT_TTL};
