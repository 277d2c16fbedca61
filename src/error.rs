/// Error type for this crate.
#[derive(Debug, thiserror::Error)]
pub enum ThrottlingError {
    /// The rate string does not match `<count>/[factor]<unit>`.
    #[error("malformed rate: {0}")]
    MalformedRate(String),

    /// Every candidate resource is blocked.
    #[error("no resources available")]
    NoResourcesAvailable,

    /// A resource selector points past the end of the pool.
    #[error("resource index {0} is out of range")]
    ResourceIndexOutOfRange(usize),

    /// The resource is not a member of the pool.
    #[error("resource not found in pool")]
    ResourceNotFound,

    /// The pool was built with two equal resources.
    #[error("duplicate resource at index {0}")]
    DuplicateResource(usize),

    /// Invalid Redis hash name.
    #[error("invalid hash name: {0}")]
    InvalidHashName(String),

    /// Redis error.
    #[cfg(any(feature = "redis-tokio", feature = "redis-smol"))]
    #[cfg_attr(docsrs, doc(cfg(any(feature = "redis-tokio", feature = "redis-smol"))))]
    #[error("redis error: {0}")]
    RedisError(#[from] redis::RedisError),
}
