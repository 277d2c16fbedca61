use std::{
    collections::BTreeSet,
    ops::Deref,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::{Lock, Rate, ThrottlingError, common::History, runtime};

/// Configuration for [`DistributedThrottle`].
#[derive(Clone, Debug, Default)]
pub struct DistributedThrottleOptions {
    /// Rate applied to each resource independently.
    pub rate: Rate,
    /// Try vacant resources in random order instead of pool order.
    pub shuffle: bool,
    /// Lock claimed for the selected resource while it is held.
    ///
    /// Use a lock over a shared cache (e.g. [`RedisCache`](crate::RedisCache)) to
    /// keep processes from using the same resource at the same time.
    pub lock: Option<Lock>,
}

#[derive(Debug, Default)]
struct Slot {
    history: History,
    /// Acquisitions handed out but not yet released.
    pending: u64,
}

impl Slot {
    fn usage(&self) -> u64 {
        self.history.len() as u64 + self.pending
    }
}

#[derive(Debug)]
struct PoolState {
    rate: Rate,
    slots: Vec<Slot>,
    blocked: BTreeSet<usize>,
}

impl PoolState {
    fn flush(&mut self, now: Instant) {
        let period = self.rate.period();
        for slot in &mut self.slots {
            slot.history.evict(now, period);
        }
    }

    /// Time until one of `candidates` may have room again.
    fn retry_after(&self, candidates: &[usize], now: Instant) -> Duration {
        let period = self.rate.period();

        // Candidates full of in-flight acquisitions free up no sooner than a full
        // period after their release.
        candidates
            .iter()
            .filter_map(|&index| self.slots[index].history.retry_after(now, period))
            .min()
            .unwrap_or(period)
    }
}

/// A pool of interchangeable resources, each throttled by its own sliding window.
///
/// [`acquire`](DistributedThrottle::acquire) hands out the first resource whose
/// window has room, waiting if none has. Resources can be taken out of rotation
/// with [`block`](DistributedThrottle::block), and an optional [`Lock`] makes a
/// resource exclusive to one holder at a time, across processes when the lock's
/// cache is shared.
///
/// # Algorithm
///
/// 1. **Candidates:** every resource, or only the selected one; blocked
///    resources are removed. No candidate left fails immediately with
///    [`ThrottlingError::NoResourcesAvailable`].
/// 2. **Order:** pool order, or a random permutation when `shuffle` is set
/// 3. **Selection:** evict expired entries from every history, then take the
///    first candidate with `history + in_flight < limit` (first fit)
/// 4. **Waiting:** if no candidate has room, sleep until the oldest entry among
///    them expires and go back to 3
/// 5. **Locking:** claim the lock keyed by the resource's position, if configured
/// 6. **Release:** the timestamp is appended when the [`ResourceGuard`] is
///    released or dropped, and the lock is freed
///
/// # Semantics & Limitations
///
/// - **In-flight accounting:** a handed-out resource counts against its window
///   until released, so concurrent callers are spread over the pool
/// - **Failure atomic:** if acquisition is cancelled, or claiming the lock fails,
///   the reservation is rolled back and nothing is recorded
/// - **No FIFO:** waiters are not queued and can starve under contention
/// - **No timeout:** wrap `acquire` in your runtime's timeout if needed
/// - **Lock keys** are derived from positions (`"0"`, `"1"`, ...), so every process
///   sharing a lock hash must list the pool in the same order
///
/// # Examples
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use throttling::{DistributedThrottle, DistributedThrottleOptions};
///
/// let tokens = vec!["token-a", "token-b", "token-c"];
/// let pool = DistributedThrottle::new(
///     tokens,
///     DistributedThrottleOptions {
///         rate: "1/s".parse().unwrap(),
///         ..Default::default()
///     },
/// )
/// .unwrap();
///
/// let token = pool.acquire(None).await.unwrap();
/// assert_eq!(*token, "token-a");
/// token.release().await.unwrap();
///
/// // token-a has used its quota, so token-b is next
/// let used = pool.with_resource(None, async |token| token.to_string()).await.unwrap();
/// assert_eq!(used, "token-b");
///
/// pool.block(&"token-c").unwrap();
/// assert!(pool.is_blocked(2));
/// # });
/// ```
pub struct DistributedThrottle<R> {
    resources: Vec<R>,
    shuffle: bool,
    lock: Option<Lock>,
    state: Mutex<PoolState>,
}

impl<R> DistributedThrottle<R>
where
    R: PartialEq,
{
    /// Create a pool over `resources`.
    ///
    /// Fails with [`ThrottlingError::DuplicateResource`] if two resources compare
    /// equal, since [`block`](Self::block) looks resources up by value.
    pub fn new(
        resources: Vec<R>,
        options: DistributedThrottleOptions,
    ) -> Result<Self, ThrottlingError> {
        if let Some(duplicate) =
            (1..resources.len()).find(|&i| resources[..i].contains(&resources[i]))
        {
            return Err(ThrottlingError::DuplicateResource(duplicate));
        }

        let slots = resources.iter().map(|_| Slot::default()).collect();

        Ok(Self {
            resources,
            shuffle: options.shuffle,
            lock: options.lock,
            state: Mutex::new(PoolState {
                rate: options.rate,
                slots,
                blocked: BTreeSet::new(),
            }),
        })
    } // end constructor

    /// Take `resource` out of rotation.
    ///
    /// Its history is kept. Blocking twice is harmless.
    pub fn block(&self, resource: &R) -> Result<(), ThrottlingError> {
        let index = self.position(resource)?;
        self.block_index(index)
    }

    /// Put `resource` back into rotation.
    pub fn unblock(&self, resource: &R) -> Result<(), ThrottlingError> {
        let index = self.position(resource)?;
        self.unblock_index(index)
    }

    fn position(&self, resource: &R) -> Result<usize, ThrottlingError> {
        self.resources
            .iter()
            .position(|r| r == resource)
            .ok_or(ThrottlingError::ResourceNotFound)
    }
}

impl<R> DistributedThrottle<R> {
    /// Resources in pool order.
    pub fn resources(&self) -> &[R] {
        &self.resources
    }

    /// Rate applied to each resource.
    pub fn rate(&self) -> Rate {
        self.state().rate
    }

    /// Replace the rate. Histories are kept and judged against the new rate.
    pub fn set_rate(&self, rate: Rate) {
        self.state().rate = rate;
    }

    /// `true` if candidates are tried in random order.
    pub fn shuffle(&self) -> bool {
        self.shuffle
    }

    /// The lock guarding resources, if any.
    pub fn lock(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    /// Take the resource at `index` out of rotation.
    pub fn block_index(&self, index: usize) -> Result<(), ThrottlingError> {
        self.check_index(index)?;

        if self.state().blocked.insert(index) {
            tracing::debug!(index, "Resource blocked");
        }

        Ok(())
    }

    /// Put the resource at `index` back into rotation.
    pub fn unblock_index(&self, index: usize) -> Result<(), ThrottlingError> {
        self.check_index(index)?;

        if self.state().blocked.remove(&index) {
            tracing::debug!(index, "Resource unblocked");
        }

        Ok(())
    }

    /// `true` if the resource at `index` is blocked.
    pub fn is_blocked(&self, index: usize) -> bool {
        self.state().blocked.contains(&index)
    }

    /// Admissions counted against the resource at `index` in the current window,
    /// including acquisitions not yet released.
    pub fn usage(&self, index: usize) -> Result<u64, ThrottlingError> {
        self.check_index(index)?;

        let mut state = self.state();
        let period = state.rate.period();
        let slot = &mut state.slots[index];
        slot.history.evict(Instant::now(), period);

        Ok(slot.usage())
    }

    /// Wait for a vacant resource and hold it.
    ///
    /// `selector` restricts the choice to the resource at that index. Fails
    /// immediately with [`ThrottlingError::NoResourcesAvailable`] when every
    /// candidate is blocked, and with any error from the lock's cache.
    ///
    /// # Cancellation
    ///
    /// Dropping the returned future before it completes leaves no trace: the
    /// resource is neither recorded nor locked.
    pub async fn acquire(
        &self,
        selector: Option<usize>,
    ) -> Result<ResourceGuard<'_, R>, ThrottlingError> {
        let mut candidates = match selector {
            None => (0..self.resources.len()).collect::<Vec<_>>(),
            Some(index) => {
                self.check_index(index)?;
                vec![index]
            }
        };

        if self.shuffle {
            candidates.shuffle(&mut rand::rng());
        }

        let reservation = loop {
            let wait = {
                let mut state = self.state();
                let now = Instant::now();
                state.flush(now);

                candidates.retain(|index| !state.blocked.contains(index));

                if candidates.is_empty() {
                    return Err(ThrottlingError::NoResourcesAvailable);
                }

                let limit = state.rate.limit();
                let vacant = candidates
                    .iter()
                    .copied()
                    .find(|&index| state.slots[index].usage() < limit);

                match vacant {
                    Some(index) => {
                        state.slots[index].pending += 1;
                        break Reservation {
                            pool: self,
                            index,
                            armed: true,
                        };
                    }
                    None => state.retry_after(&candidates, now),
                }
            };

            tracing::trace!(
                wait_ms = wait.as_millis() as u64,
                candidates = candidates.len(),
                "All candidate resources at capacity"
            );

            runtime::sleep(wait).await;
        };

        let lock = match &self.lock {
            None => None,
            Some(lock) => {
                let key = lock_key(reservation.index);
                lock.acquire(&key).await?;
                Some((lock.clone(), key))
            }
        };

        tracing::trace!(index = reservation.index, "Resource acquired");

        Ok(ResourceGuard {
            pool: self,
            index: reservation.index,
            reservation: Some(reservation),
            lock,
        })
    } // end method acquire

    /// Hold a vacant resource while `f` runs, then release it.
    ///
    /// Returns the output of `f`. If `f` panics the resource is released by
    /// [`ResourceGuard`]'s drop.
    pub async fn with_resource<T, F>(
        &self,
        selector: Option<usize>,
        f: F,
    ) -> Result<T, ThrottlingError>
    where
        F: AsyncFnOnce(&R) -> T,
    {
        let guard = self.acquire(selector).await?;
        let output = f(guard.resource()).await;
        guard.release().await?;

        Ok(output)
    }

    fn check_index(&self, index: usize) -> Result<(), ThrottlingError> {
        if index < self.resources.len() {
            Ok(())
        } else {
            Err(ThrottlingError::ResourceIndexOutOfRange(index))
        }
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
} // end of impl

/// Key under which the resource at `index` is locked.
pub(crate) fn lock_key(index: usize) -> String {
    index.to_string()
}

/// One unit of a resource's window, taken but not yet recorded.
struct Reservation<'a, R> {
    pool: &'a DistributedThrottle<R>,
    index: usize,
    armed: bool,
}

impl<R> Reservation<'_, R> {
    /// Turn the reservation into a history entry stamped now.
    fn commit(mut self) {
        let mut state = self.pool.state();
        let slot = &mut state.slots[self.index];
        slot.pending = slot.pending.saturating_sub(1);
        slot.history.record(Instant::now());
        self.armed = false;
    }
}

impl<R> Drop for Reservation<'_, R> {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.pool.state();
            let slot = &mut state.slots[self.index];
            slot.pending = slot.pending.saturating_sub(1);
        }
    }
}

/// A resource held from a [`DistributedThrottle`].
///
/// Dereferences to the resource. Prefer [`release`](ResourceGuard::release),
/// which frees the lock before returning and reports lock errors. Dropping the
/// guard records the use too, but the lock is then freed by a background task on
/// the runtime.
pub struct ResourceGuard<'a, R> {
    pool: &'a DistributedThrottle<R>,
    index: usize,
    reservation: Option<Reservation<'a, R>>,
    lock: Option<(Lock, String)>,
}

impl<'a, R> ResourceGuard<'a, R> {
    /// Position of the resource in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// The held resource.
    pub fn resource(&self) -> &'a R {
        &self.pool.resources[self.index]
    }

    /// Record the use of the resource and free its lock.
    pub async fn release(mut self) -> Result<(), ThrottlingError> {
        if let Some(reservation) = self.reservation.take() {
            reservation.commit();
        }

        if let Some((lock, key)) = self.lock.take() {
            lock.release(&key).await?;
        }

        Ok(())
    } // end method release
}

impl<R> Deref for ResourceGuard<'_, R> {
    type Target = R;

    fn deref(&self) -> &Self::Target {
        self.resource()
    }
}

impl<R> Drop for ResourceGuard<'_, R> {
    fn drop(&mut self) {
        if let Some(reservation) = self.reservation.take() {
            reservation.commit();
        }

        if let Some((lock, key)) = self.lock.take() {
            let spawned = runtime::spawn_task(async move {
                if let Err(err) = lock.release(&key).await {
                    tracing::error!(error = ?err, key = %key, "Failed to release resource lock");
                }
            });

            if !spawned {
                tracing::error!("No async runtime to release resource lock, key stays held");
            }
        }
    }
}
