//! Key/value stores used to record which lock keys are currently held.
//!
//! A [`Cache`] is deliberately narrow: three operations against a flat map of
//! string keys to opaque byte values, plus a conditional insert used by
//! [`Lock`](crate::Lock) to claim a key.
//!
//! # Backends
//!
//! - [`MemoryCache`]: in-process map, shared by every lock built on the same
//!   `Arc`
//! - [`RedisCache`]: fields of one Redis hash, shared across processes
//!   (requires `redis-tokio` or `redis-smol`)
//!
//! # Atomicity
//!
//! The provided [`Cache::check_in_if_absent`] is a plain `check` followed by a
//! `check_in`. Two callers can both observe the key as absent and both claim it.
//! Both shipped backends override it with an atomic operation; custom backends
//! that need strict mutual exclusion must do the same.

use async_trait::async_trait;

use crate::ThrottlingError;

mod memory_cache;
pub use memory_cache::*;

#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
#[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
mod redis_cache;
#[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
pub use redis_cache::*;

/// Check-in / check / check-out contract over a key/value store.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn check_in(&self, key: &str, value: &[u8]) -> Result<(), ThrottlingError>;

    /// Read the value stored under `key`, or `None` if absent.
    async fn check(&self, key: &str) -> Result<Option<Vec<u8>>, ThrottlingError>;

    /// Remove `key`. Removing an absent key is a no-op.
    async fn check_out(&self, key: &str) -> Result<(), ThrottlingError>;

    /// Store `value` under `key` only if the key is absent.
    ///
    /// Returns `true` if the value was stored. See the [module docs](self) for the
    /// atomicity of the provided implementation.
    async fn check_in_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, ThrottlingError> {
        if self.check(key).await?.is_some() {
            return Ok(false);
        }

        self.check_in(key, value).await?;

        Ok(true)
    }
}
