//! Bounded, lazily filled resource pool with rate-limited creation.
//!
//! Items are created on demand, at most one creation per `creation_interval`, and never more than
//! `size` items exist (pending + available + in use). A caller leases one item for the duration of
//! an action; the item goes back to the pool afterwards unless the removal predicate rejects it.

use drill_core::{DrillError, DrillResult};
use futures_util::future::BoxFuture;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

const MIN_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Upper bound on pending + available + in-use items.
    pub size: usize,
    /// Minimum spacing between two creation attempts. The first attempt is immediate.
    pub creation_interval: Duration,
    /// How long a lease may wait for an item. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            size: 8,
            creation_interval: Duration::from_secs(1),
            timeout: Some(Duration::from_secs(5)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub pending: usize,
    pub available: usize,
    pub in_use: usize,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.pending + self.available + self.in_use
    }
}

type CreateFn<T> = Box<dyn Fn() -> BoxFuture<'static, DrillResult<T>> + Send + Sync>;
type RemoveFn<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type CreatedFn<T> = Box<dyn Fn(T) + Send + Sync>;

pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct PoolInner<T> {
    options: PoolOptions,
    create: CreateFn<T>,
    should_remove: RemoveFn<T>,
    on_created: CreatedFn<T>,
    state: Mutex<PoolState<T>>,
    changed: Notify,
}

struct PoolState<T> {
    available: VecDeque<T>,
    pending: usize,
    in_use: usize,
    last_creation: Option<Instant>,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.pending + self.available.len() + self.in_use
    }
}

impl<T: Clone + Send + 'static> Pool<T> {
    /// Build a pool.
    ///
    /// * `create` - Produces a new item; failures are logged and free the slot.
    /// * `should_remove` - Checked before handing out an item and when it is returned.
    /// * `on_created` - Runs once for every successfully created item.
    pub fn new<C, Fut, R, O>(options: PoolOptions, create: C, should_remove: R, on_created: O) -> Self
    where
        C: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = DrillResult<T>> + Send + 'static,
        R: Fn(&T) -> bool + Send + Sync + 'static,
        O: Fn(T) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(PoolInner {
                options,
                create: Box::new(move || Box::pin(create())),
                should_remove: Box::new(should_remove),
                on_created: Box::new(on_created),
                state: Mutex::new(PoolState {
                    available: VecDeque::new(),
                    pending: 0,
                    in_use: 0,
                    last_creation: None,
                }),
                changed: Notify::new(),
            }),
        }
    }

    /// Lease an item, run `action` with it, and return the item to the pool.
    ///
    /// Fails with [`DrillError::Timeout`] if no item became available in time. The item is
    /// returned whether the action succeeds or fails.
    pub async fn use_resource<F, Fut, R>(&self, action: F) -> DrillResult<R>
    where
        F: FnOnce(T) -> Fut,
        Fut: Future<Output = DrillResult<R>>,
    {
        let lease = self.acquire().await?;
        let result = action(lease.item().clone()).await;
        drop(lease);
        result
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock_state();
        PoolStats {
            pending: state.pending,
            available: state.available.len(),
            in_use: state.in_use,
        }
    }

    /// Take every idle item out of the pool.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock_state().available.drain(..).collect()
    }

    async fn acquire(&self) -> DrillResult<Lease<T>> {
        let deadline = self.inner.options.timeout.map(|t| Instant::now() + t);

        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let retry_in = {
                let mut state = self.inner.lock_state();
                self.inner.evict(&mut state);
                if let Some(item) = state.available.pop_front() {
                    state.in_use += 1;
                    return Ok(Lease {
                        pool: self.inner.clone(),
                        item,
                    });
                }
                self.inner.try_create(&mut state)
            };

            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DrillError::Timeout);
                    }
                    retry_in.min(deadline - now)
                }
                None => retry_in,
            };
            let _ = tokio::time::timeout(wait.max(MIN_WAIT), notified).await;
        }
    }
}

impl<T: Clone + Send + 'static> PoolInner<T> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn evict(&self, state: &mut PoolState<T>) {
        let before = state.available.len();
        state.available.retain(|item| !(self.should_remove)(item));
        let evicted = before - state.available.len();
        if evicted > 0 {
            trace!(evicted, "evicted pooled items");
        }
    }

    /// Start a creation if the rate limit and capacity allow it.
    ///
    /// Returns how long the caller should wait before checking again.
    fn try_create(self: &Arc<Self>, state: &mut PoolState<T>) -> Duration {
        let interval = self.options.creation_interval;
        let now = Instant::now();
        if let Some(last) = state.last_creation {
            let next = last + interval;
            if now < next {
                return next - now;
            }
        }
        state.last_creation = Some(now);

        if state.total() >= self.options.size {
            return interval;
        }

        state.pending += 1;
        let pending = (self.create)();
        let inner = self.clone();
        tokio::spawn(async move {
            let result = pending.await;
            let created = {
                let mut state = inner.lock_state();
                state.pending -= 1;
                match result {
                    Ok(item) => {
                        state.available.push_back(item.clone());
                        Some(item)
                    }
                    Err(e) => {
                        debug!(error = %e, "pool item creation failed");
                        None
                    }
                }
            };
            if let Some(item) = created {
                (inner.on_created)(item);
            }
            inner.changed.notify_waiters();
        });

        interval
    }
}

struct Lease<T: Clone + Send + 'static> {
    pool: Arc<PoolInner<T>>,
    item: T,
}

impl<T: Clone + Send + 'static> Lease<T> {
    fn item(&self) -> &T {
        &self.item
    }
}

impl<T: Clone + Send + 'static> Drop for Lease<T> {
    fn drop(&mut self) {
        {
            let mut state = self.pool.lock_state();
            state.in_use -= 1;
            if !(self.pool.should_remove)(&self.item) {
                state.available.push_back(self.item.clone());
            }
        }
        self.pool.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn counting_pool(options: PoolOptions) -> (Pool<usize>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let pool = Pool::new(
            options,
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(n) }
            },
            |_| false,
            |_| {},
        );
        (pool, created)
    }

    #[tokio::test]
    async fn creates_lazily_and_reuses() {
        let (pool, created) = counting_pool(PoolOptions::default());
        assert_eq!(created.load(Ordering::SeqCst), 0);

        let first = pool.use_resource(|n| async move { Ok(n) }).await.unwrap();
        let second = pool.use_resource(|n| async move { Ok(n) }).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(
            pool.stats(),
            PoolStats {
                pending: 0,
                available: 1,
                in_use: 0
            }
        );
    }

    #[tokio::test]
    async fn never_exceeds_size_under_concurrency() {
        let options = PoolOptions {
            size: 3,
            creation_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        };
        let (pool, created) = counting_pool(options);

        let mut tasks = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.use_resource(|_| {
                    let pool = pool.clone();
                    async move {
                        assert!(pool.stats().total() <= 3);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(())
                    }
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(created.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.total() <= 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_size_with_failing_creations() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool: Pool<usize> = Pool::new(
            PoolOptions {
                size: 3,
                creation_interval: Duration::from_millis(1),
                timeout: Some(Duration::from_secs(10)),
            },
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    if attempt % 2 == 0 {
                        Err(DrillError::Closed)
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| false,
            |_| {},
        );

        let done = Arc::new(AtomicBool::new(false));
        let watcher = {
            let pool = pool.clone();
            let done = done.clone();
            tokio::spawn(async move {
                let mut max_total = 0;
                while !done.load(Ordering::SeqCst) {
                    max_total = max_total.max(pool.stats().total());
                    tokio::task::yield_now().await;
                }
                max_total
            })
        };

        let mut tasks = Vec::new();
        for _ in 0..40 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.use_resource(|n| async move {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    Ok(n)
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        done.store(true, Ordering::SeqCst);

        let max_total = watcher.await.unwrap();
        assert!(max_total <= 3, "{max_total} resources tracked");
        assert!(attempts.load(Ordering::SeqCst) >= 2);
        let stats = pool.stats();
        assert!(stats.total() <= 3);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn concurrent_leases_get_distinct_items() {
        let options = PoolOptions {
            size: 2,
            creation_interval: Duration::from_millis(1),
            timeout: Some(Duration::from_secs(5)),
        };
        let (pool, _) = counting_pool(options);

        let (a, b) = tokio::join!(
            pool.use_resource(|n| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n)
            }),
            pool.use_resource(|n| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(n)
            }),
        );
        assert_ne!(a.unwrap(), b.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_when_creation_keeps_failing() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool: Pool<usize> = Pool::new(
            PoolOptions {
                size: 2,
                creation_interval: Duration::from_millis(100),
                timeout: Some(Duration::from_millis(1000)),
            },
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(DrillError::Closed) }
            },
            |_| false,
            |_| {},
        );

        let started = Instant::now();
        let result = pool.use_resource(|n| async move { Ok(n) }).await;
        assert!(matches!(result, Err(DrillError::Timeout)));
        assert!(started.elapsed() >= Duration::from_millis(1000));
        // One attempt per interval, starting immediately.
        let made = attempts.load(Ordering::SeqCst);
        assert!((9..=11).contains(&made), "{made} attempts");
        assert_eq!(pool.stats().pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_creation_frees_its_slot() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let pool: Pool<usize> = Pool::new(
            PoolOptions {
                size: 1,
                creation_interval: Duration::from_millis(100),
                timeout: Some(Duration::from_secs(1)),
            },
            move || {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(DrillError::Closed)
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| false,
            |_| {},
        );

        let value = pool.use_resource(|n| async move { Ok(n) }).await.unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test]
    async fn removal_predicate_evicts_dead_items() {
        let pool: Pool<Arc<AtomicBool>> = Pool::new(
            PoolOptions {
                creation_interval: Duration::from_millis(1),
                ..Default::default()
            },
            || async { Ok(Arc::new(AtomicBool::new(false))) },
            |item: &Arc<AtomicBool>| item.load(Ordering::SeqCst),
            |_| {},
        );

        let first = pool
            .use_resource(|item| async move { Ok(item) })
            .await
            .unwrap();
        first.store(true, Ordering::SeqCst);

        let second = pool
            .use_resource(|item| async move { Ok(item) })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.stats().available, 1);
    }

    #[tokio::test]
    async fn item_returns_after_failed_action() {
        let (pool, _) = counting_pool(PoolOptions::default());
        let result: DrillResult<()> = pool
            .use_resource(|_| async { Err(DrillError::Closed) })
            .await;
        assert!(result.is_err());
        assert_eq!(
            pool.stats(),
            PoolStats {
                pending: 0,
                available: 1,
                in_use: 0
            }
        );
    }

    #[tokio::test]
    async fn drain_takes_idle_items() {
        let (pool, _) = counting_pool(PoolOptions::default());
        pool.use_resource(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(pool.drain(), vec![0]);
        assert_eq!(pool.stats().total(), 0);
    }

    #[tokio::test]
    async fn on_created_sees_every_new_item() {
        let seen = Arc::new(AtomicUsize::new(0));
        let hook = seen.clone();
        let pool: Pool<usize> = Pool::new(
            PoolOptions::default(),
            || async { Ok(7) },
            |_| false,
            move |item| {
                assert_eq!(item, 7);
                hook.fetch_add(1, Ordering::SeqCst);
            },
        );
        pool.use_resource(|_| async { Ok(()) }).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
