use std::{
    future::{Future, IntoFuture},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use futures::future::BoxFuture;

use crate::{Rate, common::History, runtime};

struct ThrottleState {
    rate: Rate,
    history: History,
}

/// Single-quota sliding-window throttle.
///
/// Admits at most `rate.limit()` callers within any trailing `rate.period()`.
/// Callers over the limit are suspended until the oldest admission leaves the
/// window.
///
/// # Calling conventions
///
/// All three go through [`delay`](Throttle::delay):
///
/// - **await:** `(&throttle).await`
/// - **scoped:** [`throttle.run(future)`](Throttle::run)
/// - **decorator:** [`throttle.wrap(f)`](Throttle::wrap), then
///   [`call`](Throttled::call) as often as needed
///
/// # Algorithm
///
/// 1. Evict admissions whose age has reached the period (oldest first)
/// 2. If fewer than `limit` remain, record `now` and admit
/// 3. Otherwise sleep until the oldest admission expires and start over
///
/// The window is exact: no buckets, no approximation. An admission is recorded
/// when it is granted, so the quota is spent by entering the protected region,
/// whatever happens inside it.
///
/// # Semantics & Limitations
///
/// - **No FIFO:** a newly arriving caller can be admitted ahead of one that has
///   been sleeping
/// - **No timeout:** a caller waits until admitted. Dropping a waiting future is
///   safe; nothing is recorded for it.
/// - **Process-scoped:** history lives in memory and is lost on restart
///
/// # Examples
///
/// ```
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// use std::sync::Arc;
/// use throttling::Throttle;
///
/// let throttle = Arc::new(Throttle::new("3/s".parse().unwrap()));
///
/// // await
/// (&*throttle).await;
///
/// // scoped
/// let answer = throttle.run(async { 42 }).await;
/// assert_eq!(answer, 42);
///
/// // decorator
/// let double = throttle.wrap(|x: u32| async move { x * 2 });
/// assert_eq!(double.call(21).await, 42);
/// # });
/// ```
pub struct Throttle {
    state: Mutex<ThrottleState>,
}

impl Throttle {
    /// Create a throttle with an empty history.
    pub fn new(rate: Rate) -> Self {
        Self {
            state: Mutex::new(ThrottleState {
                rate,
                history: History::default(),
            }),
        }
    }

    /// The current rate.
    pub fn rate(&self) -> Rate {
        self.state().rate
    }

    /// Replace the rate. History is kept and judged against the new rate.
    pub fn set_rate(&self, rate: Rate) {
        self.state().rate = rate;
    }

    /// Number of admissions in the current window.
    pub fn usage(&self) -> usize {
        let mut state = self.state();
        let period = state.rate.period();
        state.history.evict(Instant::now(), period);
        state.history.len()
    }

    /// Suspend until admitted.
    pub async fn delay(&self) {
        loop {
            let wait = {
                let mut state = self.state();
                let now = Instant::now();
                let ThrottleState { rate, history } = &mut *state;

                history.evict(now, rate.period());

                if (history.len() as u64) < rate.limit() {
                    history.record(now);
                    return;
                }

                history.retry_after(now, rate.period()).unwrap_or(rate.period())
            };

            tracing::trace!(wait_ms = wait.as_millis() as u64, "Throttle at capacity");

            runtime::sleep(wait).await;
        }
    } // end method delay

    /// Wait for admission, then drive `fut` to completion.
    ///
    /// Nothing is recorded when `fut` finishes, whether it succeeds or fails.
    pub async fn run<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        self.delay().await;
        fut.await
    }

    /// Wrap `f` so every [`call`](Throttled::call) is admitted by this throttle
    /// first.
    pub fn wrap<F>(self: &Arc<Self>, f: F) -> Throttled<F> {
        Throttled {
            throttle: Arc::clone(self),
            f,
        }
    }

    fn state(&self) -> MutexGuard<'_, ThrottleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
} // end of impl

impl<'a> IntoFuture for &'a Throttle {
    type Output = ();
    type IntoFuture = BoxFuture<'a, ()>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.delay())
    }
}

/// An async function whose every call waits for a [`Throttle`].
///
/// Created by [`Throttle::wrap`].
pub struct Throttled<F> {
    throttle: Arc<Throttle>,
    f: F,
}

impl<F> Throttled<F> {
    /// Wait for admission, then call the wrapped function with `args`.
    ///
    /// The function's output, including any error it returns, is passed through
    /// unchanged.
    pub async fn call<A, Fut>(&self, args: A) -> Fut::Output
    where
        F: Fn(A) -> Fut,
        Fut: Future,
    {
        self.throttle.delay().await;
        (self.f)(args).await
    }

    /// The throttle gating this function.
    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }
}

impl<F> Clone for Throttled<F>
where
    F: Clone,
{
    fn clone(&self) -> Self {
        Self {
            throttle: Arc::clone(&self.throttle),
            f: self.f.clone(),
        }
    }
}
