use std::{sync::Arc, time::Duration};

use crate::{Cache, MemoryCache, ThrottlingError, runtime};

/// Configuration for [`Lock`].
#[derive(Clone, Debug)]
pub struct LockOptions {
    /// Pause between two attempts to claim a held key.
    pub retry_interval: Duration,
    /// Value checked in under a claimed key.
    pub sentinel: Vec<u8>,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            retry_interval: Duration::from_secs(1),
            sentinel: b"1".to_vec(),
        }
    }
}

/// Polling mutual exclusion over a [`Cache`].
///
/// A key is held while it is checked in. [`acquire`](Lock::acquire) keeps trying
/// to claim the key, sleeping `retry_interval` between attempts, and
/// [`release`](Lock::release) checks it out.
///
/// # Semantics & Limitations
///
/// - **Advisory:** nothing stops a caller from touching a resource without the lock
/// - **No ownership:** any holder of the lock can release any key, and releasing a
///   key that is not held is a silent no-op
/// - **No FIFO:** waiters are not queued; whoever polls first after a release wins
/// - **No timeout:** `acquire` waits for as long as the key stays held. Wrap it in
///   your runtime's timeout if needed; dropping the future leaves nothing behind.
/// - **Atomicity** comes from the cache's
///   [`check_in_if_absent`](Cache::check_in_if_absent). Both shipped backends are
///   atomic.
///
/// Cloning a `Lock` is cheap and the clones share the cache.
///
/// # Examples
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use throttling::Lock;
///
/// let lock = Lock::memory();
///
/// lock.acquire("0").await.unwrap();
/// assert!(lock.check("0").await.unwrap().is_some());
///
/// lock.release("0").await.unwrap();
/// assert!(lock.check("0").await.unwrap().is_none());
/// # });
/// ```
#[derive(Clone)]
pub struct Lock {
    cache: Arc<dyn Cache>,
    retry_interval: Duration,
    sentinel: Arc<[u8]>,
}

impl Lock {
    /// Create a lock on top of `cache`.
    pub fn new(cache: Arc<dyn Cache>, options: LockOptions) -> Self {
        Self {
            cache,
            retry_interval: options.retry_interval,
            sentinel: Arc::from(options.sentinel),
        }
    }

    /// Create a process-local lock backed by a fresh [`MemoryCache`].
    pub fn memory() -> Self {
        Self::new(Arc::new(MemoryCache::new()), LockOptions::default())
    }

    /// Pause between two attempts to claim a held key.
    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }

    /// Wait until `key` is free, then claim it.
    ///
    /// Cache errors are returned as-is; they are not retried.
    pub async fn acquire(&self, key: &str) -> Result<(), ThrottlingError> {
        loop {
            if self.cache.check_in_if_absent(key, &self.sentinel).await? {
                tracing::debug!(key, "Lock acquired");
                return Ok(());
            }

            tracing::trace!(
                key,
                retry_interval_ms = self.retry_interval.as_millis() as u64,
                "Lock held elsewhere, retrying"
            );

            runtime::sleep(self.retry_interval).await;
        }
    } // end method acquire

    /// Free `key`. Freeing a key that is not held is a no-op.
    pub async fn release(&self, key: &str) -> Result<(), ThrottlingError> {
        self.cache.check_out(key).await?;
        tracing::debug!(key, "Lock released");

        Ok(())
    } // end method release

    /// Read the value held under `key`, or `None` if the key is free.
    pub async fn check(&self, key: &str) -> Result<Option<Vec<u8>>, ThrottlingError> {
        self.cache.check(key).await
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("retry_interval", &self.retry_interval)
            .finish_non_exhaustive()
    }
}
