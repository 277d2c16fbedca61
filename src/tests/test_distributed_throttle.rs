use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::{Duration, Instant},
};

use futures::{FutureExt, future::try_join_all};

use super::runtime::{async_sleep, block_on};
use crate::{
    DistributedThrottle, DistributedThrottleOptions, Lock, LockOptions, MemoryCache, Rate,
    ThrottlingError, distributed::lock_key,
};

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct Resource {
    name: &'static str,
}

fn resources() -> Vec<Resource> {
    vec![
        Resource { name: "abc" },
        Resource { name: "def" },
        Resource { name: "ghi" },
    ]
}

fn pool(rate: &str, shuffle: bool, lock: Option<Lock>) -> DistributedThrottle<Resource> {
    DistributedThrottle::new(
        resources(),
        DistributedThrottleOptions {
            rate: rate.parse().unwrap(),
            shuffle,
            lock,
        },
    )
    .unwrap()
}

fn fast_lock() -> Lock {
    Lock::new(
        Arc::new(MemoryCache::new()),
        LockOptions {
            retry_interval: Duration::from_millis(20),
            ..Default::default()
        },
    )
}

/// `limit × resources` acquisitions fit in one period, the next one waits.
async fn exhaust_then_wait(pool: &DistributedThrottle<Resource>) {
    let rate = pool.rate();
    let capacity = rate.limit() as usize * pool.resources().len();

    let start = Instant::now();
    for _ in 0..capacity {
        pool.with_resource(None, async |_| ()).await.unwrap();
    }
    assert!(start.elapsed() <= rate.period());

    pool.with_resource(None, async |_| ()).await.unwrap();
    assert!(start.elapsed() >= rate.period());
}

#[test]
fn acquire_sequential() {
    block_on(async {
        for rate in ["3/s", "6/s", "8/2s"] {
            exhaust_then_wait(&pool(rate, false, None)).await;
        }
    });
}

#[test]
fn acquire_with_shuffle() {
    block_on(async {
        exhaust_then_wait(&pool("3/s", true, None)).await;
    });
}

#[test]
fn acquire_with_locking() {
    block_on(async {
        exhaust_then_wait(&pool("3/s", false, Some(fast_lock()))).await;
    });
}

#[test]
fn first_fit_in_pool_order_without_shuffle() {
    block_on(async {
        let pool = pool("2/s", false, None);

        let mut picked = Vec::new();
        for _ in 0..6 {
            let name = pool
                .with_resource(None, async |r| r.name)
                .await
                .unwrap();
            picked.push(name);
        }

        assert_eq!(picked, ["abc", "abc", "def", "def", "ghi", "ghi"]);
    });
}

#[test]
fn concurrent_acquisitions_get_distinct_resources() {
    block_on(async {
        let pool = pool("1/s", false, None);

        let guards = try_join_all((0..3).map(|_| pool.acquire(None))).await.unwrap();

        let names: BTreeSet<_> = guards.iter().map(|g| g.name).collect();
        assert_eq!(names, BTreeSet::from(["abc", "def", "ghi"]));

        for guard in guards {
            guard.release().await.unwrap();
        }
    });
}

#[test]
fn shuffle_spreads_first_picks() {
    block_on(async {
        let mut first_picks: HashMap<&str, u32> = HashMap::new();

        for _ in 0..60 {
            let pool = pool("1/s", true, None);
            let name = pool.with_resource(None, async |r| r.name).await.unwrap();
            *first_picks.entry(name).or_default() += 1;
        }

        assert!(first_picks.len() > 1, "{first_picks:?}");
    });
}

#[test]
fn blocked_resources_are_never_returned() {
    block_on(async {
        let pool = pool("2/s", false, None);
        pool.block(&Resource { name: "abc" }).unwrap();
        assert!(pool.is_blocked(0));

        for _ in 0..4 {
            let name = pool.with_resource(None, async |r| r.name).await.unwrap();
            assert_ne!(name, "abc");
        }

        assert_eq!(pool.usage(0).unwrap(), 0);
    });
}

#[test]
fn all_blocked_fails_immediately() {
    block_on(async {
        let pool = pool("3/s", false, None);
        for r in resources() {
            pool.block(&r).unwrap();
        }

        let start = Instant::now();
        let result = pool.acquire(None).await;
        assert!(matches!(result, Err(ThrottlingError::NoResourcesAvailable)));
        assert!(start.elapsed() < Duration::from_millis(50));
    });
}

#[test]
fn all_blocked_fails_even_when_saturated() {
    block_on(async {
        let pool = pool("1/s", false, None);
        for _ in 0..3 {
            pool.with_resource(None, async |_| ()).await.unwrap();
        }
        for i in 0..3 {
            pool.block_index(i).unwrap();
        }

        let start = Instant::now();
        assert!(matches!(
            pool.acquire(None).await,
            Err(ThrottlingError::NoResourcesAvailable)
        ));
        assert!(start.elapsed() < Duration::from_millis(50));
    });
}

#[test]
fn blocking_is_idempotent_and_reversible() {
    block_on(async {
        let pool = pool("1/s", false, None);
        let abc = Resource { name: "abc" };

        pool.with_resource(None, async |_| ()).await.unwrap();
        assert_eq!(pool.usage(0).unwrap(), 1);

        pool.block(&abc).unwrap();
        pool.block(&abc).unwrap();
        pool.unblock(&abc).unwrap();
        assert!(!pool.is_blocked(0));

        // history survived the block
        assert_eq!(pool.usage(0).unwrap(), 1);
        let name = pool.with_resource(None, async |r| r.name).await.unwrap();
        assert_eq!(name, "def");

        pool.unblock(&abc).unwrap();
    });
}

#[test]
fn block_unknown_resource_fails() {
    let pool = pool("1/s", false, None);

    assert!(matches!(
        pool.block(&Resource { name: "zzz" }),
        Err(ThrottlingError::ResourceNotFound)
    ));
    assert!(matches!(
        pool.block_index(3),
        Err(ThrottlingError::ResourceIndexOutOfRange(3))
    ));
    assert!(matches!(
        pool.unblock_index(3),
        Err(ThrottlingError::ResourceIndexOutOfRange(3))
    ));
}

#[test]
fn blocking_while_waiting_fails_the_waiter() {
    block_on(async {
        let pool = pool("1/s", false, None);
        pool.with_resource(Some(0), async |_| ()).await.unwrap();

        let waiter = pool.acquire(Some(0));
        let blocker = async {
            async_sleep(Duration::from_millis(50)).await;
            pool.block_index(0).unwrap();
        };

        let (result, ()) = futures::join!(waiter, blocker);
        assert!(matches!(result, Err(ThrottlingError::NoResourcesAvailable)));
    });
}

#[test]
fn selector_restricts_to_one_resource() {
    block_on(async {
        let pool = pool("1/s", false, None);
        let start = Instant::now();

        let name = pool.with_resource(Some(2), async |r| r.name).await.unwrap();
        assert_eq!(name, "ghi");

        // ghi is saturated although abc and def are vacant
        let guard = pool.acquire(Some(2)).await.unwrap();
        assert_eq!(guard.index(), 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
    });
}

#[test]
fn selector_out_of_range_fails() {
    block_on(async {
        let pool = pool("1/s", false, None);
        assert!(matches!(
            pool.acquire(Some(3)).await,
            Err(ThrottlingError::ResourceIndexOutOfRange(3))
        ));
    });
}

#[test]
fn selector_on_blocked_resource_fails() {
    block_on(async {
        let pool = pool("1/s", false, None);
        pool.block_index(1).unwrap();
        assert!(matches!(
            pool.acquire(Some(1)).await,
            Err(ThrottlingError::NoResourcesAvailable)
        ));
    });
}

#[test]
fn empty_pool_has_no_resources() {
    block_on(async {
        let pool: DistributedThrottle<Resource> =
            DistributedThrottle::new(Vec::new(), DistributedThrottleOptions::default()).unwrap();

        assert!(matches!(
            pool.acquire(None).await,
            Err(ThrottlingError::NoResourcesAvailable)
        ));
    });
}

#[test]
fn duplicate_resources_are_rejected() {
    let result = DistributedThrottle::new(
        vec!["a", "b", "a"],
        DistributedThrottleOptions::default(),
    );

    assert!(matches!(result, Err(ThrottlingError::DuplicateResource(2))));
}

#[test]
fn history_is_recorded_on_release() {
    block_on(async {
        let pool = pool("2/s", false, None);

        let guard = pool.acquire(None).await.unwrap();
        assert_eq!(guard.index(), 0);
        assert_eq!(pool.usage(0).unwrap(), 1);

        guard.release().await.unwrap();
        assert_eq!(pool.usage(0).unwrap(), 1);
    });
}

#[test]
fn dropping_a_guard_records_the_use() {
    block_on(async {
        let pool = pool("1/s", false, None);

        {
            let guard = pool.acquire(None).await.unwrap();
            assert_eq!(guard.name, "abc");
        }

        assert_eq!(pool.usage(0).unwrap(), 1);
        let name = pool.with_resource(None, async |r| r.name).await.unwrap();
        assert_eq!(name, "def");
    });
}

#[test]
fn wait_ends_when_the_oldest_entry_expires() {
    block_on(async {
        let pool = DistributedThrottle::new(
            resources(),
            DistributedThrottleOptions {
                rate: Rate::new(1, Duration::from_millis(200)).unwrap(),
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..3 {
            pool.with_resource(None, async |_| ()).await.unwrap();
        }

        let start = Instant::now();
        let name = pool.with_resource(None, async |r| r.name).await.unwrap();
        let waited = start.elapsed();

        assert_eq!(name, "abc");
        assert!(waited < Duration::from_millis(400), "{waited:?}");
    });
}

#[test]
fn lock_is_held_while_the_resource_is() {
    block_on(async {
        let lock = fast_lock();
        let pool = pool("3/s", false, Some(lock.clone()));

        let guard = pool.acquire(None).await.unwrap();
        let key = lock_key(guard.index());
        assert!(lock.check(&key).await.unwrap().is_some());

        guard.release().await.unwrap();
        assert!(lock.check(&key).await.unwrap().is_none());
    });
}

#[test]
fn lock_held_elsewhere_blocks_a_vacant_resource() {
    block_on(async {
        let lock = fast_lock();
        let pool = pool("3/s", false, Some(lock.clone()));

        // another process holds resource 0
        lock.acquire(&lock_key(0)).await.unwrap();

        let start = Instant::now();
        let other = async {
            async_sleep(Duration::from_millis(100)).await;
            lock.release(&lock_key(0)).await.unwrap();
        };
        let (guard, ()) = futures::join!(pool.acquire(Some(0)), other);

        let guard = guard.unwrap();
        assert_eq!(guard.index(), 0);
        assert!(start.elapsed() >= Duration::from_millis(100));
        guard.release().await.unwrap();
    });
}

#[test]
fn cancelled_acquire_rolls_back_the_reservation() {
    block_on(async {
        let lock = fast_lock();
        let pool = pool("1/s", false, Some(lock.clone()));
        lock.acquire(&lock_key(0)).await.unwrap();

        // window-vacant, lock-held: the future parks in the lock and is dropped
        assert!(pool.acquire(Some(0)).now_or_never().is_none());

        assert_eq!(pool.usage(0).unwrap(), 0);
        assert!(lock.check(&lock_key(0)).await.unwrap().is_some());

        lock.release(&lock_key(0)).await.unwrap();
        let guard = pool.acquire(Some(0)).await.unwrap();
        guard.release().await.unwrap();
        assert_eq!(pool.usage(0).unwrap(), 1);
    });
}

#[test]
fn dropped_guard_releases_its_lock_in_the_background() {
    block_on(async {
        let lock = fast_lock();
        let pool = pool("3/s", false, Some(lock.clone()));

        drop(pool.acquire(Some(1)).await.unwrap());

        let mut released = false;
        for _ in 0..50 {
            if lock.check(&lock_key(1)).await.unwrap().is_none() {
                released = true;
                break;
            }
            async_sleep(Duration::from_millis(10)).await;
        }
        assert!(released);
        assert_eq!(pool.usage(1).unwrap(), 1);
    });
}

#[test]
fn set_rate_changes_every_resource() {
    block_on(async {
        let pool = pool("1/s", false, None);
        pool.with_resource(Some(0), async |_| ()).await.unwrap();

        pool.set_rate("2/s".parse().unwrap());
        assert_eq!(pool.rate().limit(), 2);

        let name = pool.with_resource(None, async |r| r.name).await.unwrap();
        assert_eq!(name, "abc");
    });
}
