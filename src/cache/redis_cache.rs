use std::{ops::Deref, sync::Arc};

use async_trait::async_trait;
use redis::{AsyncCommands, aio::ConnectionManager};

use crate::{Cache, ThrottlingError};

/// A validated name for the Redis hash holding lock keys.
///
/// This is a string with the following constraints:
/// - Must not be empty
/// - Must not be longer than 255 bytes
#[derive(Debug, Clone, PartialEq, PartialOrd, Hash, Eq)]
pub struct HashName(Arc<str>);

impl HashName {
    /// The default hash name, `"locked"`.
    pub fn default_name() -> Self {
        Self(Arc::from("locked"))
    }

    /// The hash name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for HashName {
    fn default() -> Self {
        Self::default_name()
    }
}

impl Deref for HashName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<String> for HashName {
    type Error = ThrottlingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.is_empty() {
            Err(ThrottlingError::InvalidHashName(
                "hash name must not be empty".to_string(),
            ))
        } else if value.len() > 255 {
            Err(ThrottlingError::InvalidHashName(
                "hash name must not be longer than 255 characters".to_string(),
            ))
        } else {
            Ok(Self(Arc::from(value)))
        }
    }
}

impl TryFrom<&str> for HashName {
    type Error = ThrottlingError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_from(value.to_string())
    }
}

/// Configuration for [`RedisCache`].
///
/// # Examples
///
/// ```ignore
/// use throttling::{HashName, RedisCacheOptions};
///
/// let client = redis::Client::open("redis://127.0.0.1:6379/")?;
/// let connection_manager = client.get_connection_manager().await?;
///
/// let options = RedisCacheOptions {
///     connection_manager,
///     hash_name: Some(HashName::try_from("api_keys_locked")?),
/// };
/// ```
#[derive(Clone)]
pub struct RedisCacheOptions {
    /// Redis connection manager from the `redis` crate.
    ///
    /// Reconnection is handled by the manager; this crate never retries a failed
    /// command.
    pub connection_manager: ConnectionManager,

    /// Hash holding the checked-in keys. Defaults to `"locked"`.
    pub hash_name: Option<HashName>,
}

/// [`Cache`] stored as fields of a single Redis hash.
///
/// | operation                  | command  |
/// |----------------------------|----------|
/// | `check_in`                 | `HSET`   |
/// | `check`                    | `HGET`   |
/// | `check_out`                | `HDEL`   |
/// | `check_in_if_absent`       | `HSETNX` |
///
/// Processes sharing a hash name share lock state, so give each independent
/// resource pool its own hash. Fields carry no TTL: a process that dies while
/// holding a key leaves it checked in until someone checks it out. The same
/// happens when a `check_in_if_absent` future is dropped after Redis applied the
/// `HSETNX` but before the reply arrived: the field is set, the caller never
/// learns it won, and the key stays locked until checked out.
pub struct RedisCache {
    connection_manager: ConnectionManager,
    hash_name: HashName,
}

impl RedisCache {
    /// Create a cache from `options`.
    pub fn new(options: RedisCacheOptions) -> Self {
        Self {
            connection_manager: options.connection_manager,
            hash_name: options.hash_name.unwrap_or_default(),
        }
    }

    /// Name of the backing hash.
    pub fn hash_name(&self) -> &HashName {
        &self.hash_name
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn check_in(&self, key: &str, value: &[u8]) -> Result<(), ThrottlingError> {
        let mut connection_manager = self.connection_manager.clone();
        let _: () = connection_manager
            .hset(self.hash_name.as_str(), key, value)
            .await?;

        Ok(())
    }

    async fn check(&self, key: &str) -> Result<Option<Vec<u8>>, ThrottlingError> {
        let mut connection_manager = self.connection_manager.clone();
        let value: Option<Vec<u8>> = connection_manager
            .hget(self.hash_name.as_str(), key)
            .await?;

        Ok(value)
    }

    async fn check_out(&self, key: &str) -> Result<(), ThrottlingError> {
        let mut connection_manager = self.connection_manager.clone();
        let _: () = connection_manager
            .hdel(self.hash_name.as_str(), key)
            .await?;

        Ok(())
    }

    async fn check_in_if_absent(&self, key: &str, value: &[u8]) -> Result<bool, ThrottlingError> {
        let mut connection_manager = self.connection_manager.clone();
        let stored: bool = connection_manager
            .hset_nx(self.hash_name.as_str(), key, value)
            .await?;

        Ok(stored)
    }
} // end impl Cache for RedisCache
