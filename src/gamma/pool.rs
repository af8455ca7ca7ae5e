//! Bounded pool of reusable device handles.
//!
//! Handles are created lazily up to the pool capacity. A caller that finds
//! the pool exhausted waits up to a timeout for a handle to be returned and
//! then fails with [`GammaError::ResourceExhausted`]. Handles go back to the
//! pool when the [`PooledHandle`] guard drops.

use std::ops::{Deref, DerefMut};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{GammaError, GammaResult};
use crate::utils::lock;

type Factory<H> = Box<dyn Fn() -> GammaResult<H> + Send + Sync>;

struct PoolInner<H> {
    idle: Vec<H>,
    outstanding: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub idle: usize,
    pub outstanding: usize,
    pub created: usize,
}

pub struct HandlePool<H> {
    inner: Mutex<PoolInner<H>>,
    available: Condvar,
    capacity: usize,
    created: Mutex<usize>,
    factory: Factory<H>,
}

impl<H> HandlePool<H> {
    pub fn new(
        capacity: usize,
        factory: impl Fn() -> GammaResult<H> + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Mutex::new(PoolInner {
                idle: Vec::new(),
                outstanding: 0,
            }),
            available: Condvar::new(),
            capacity: capacity.max(1),
            created: Mutex::new(0),
            factory: Box::new(factory),
        }
    }

    /// Take a handle, creating one if the pool is below capacity.
    pub fn acquire(&self, timeout: Duration) -> GammaResult<PooledHandle<'_, H>> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);

        loop {
            if let Some(handle) = inner.idle.pop() {
                inner.outstanding += 1;
                return Ok(PooledHandle {
                    pool: self,
                    handle: Some(handle),
                });
            }

            if inner.outstanding < self.capacity {
                // Reserve the slot, then build outside the lock
                inner.outstanding += 1;
                drop(inner);
                return match (self.factory)() {
                    Ok(handle) => {
                        *lock(&self.created) += 1;
                        Ok(PooledHandle {
                            pool: self,
                            handle: Some(handle),
                        })
                    }
                    Err(e) => {
                        self.release(None);
                        Err(e)
                    }
                };
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GammaError::ResourceExhausted(timeout));
            }
            let (guard, _) = self
                .available
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    /// Drop every idle handle. Outstanding handles return normally.
    pub fn drain_idle(&self) {
        lock(&self.inner).idle.clear();
    }

    pub fn stats(&self) -> PoolStats {
        let inner = lock(&self.inner);
        PoolStats {
            capacity: self.capacity,
            idle: inner.idle.len(),
            outstanding: inner.outstanding,
            created: *lock(&self.created),
        }
    }

    fn release(&self, handle: Option<H>) {
        let mut inner = lock(&self.inner);
        inner.outstanding = inner.outstanding.saturating_sub(1);
        if let Some(handle) = handle {
            inner.idle.push(handle);
        }
        drop(inner);
        self.available.notify_one();
    }
}

/// Scoped loan of a pooled handle.
pub struct PooledHandle<'a, H> {
    pool: &'a HandlePool<H>,
    handle: Option<H>,
}

impl<H> PooledHandle<'_, H> {
    /// Destroy the handle instead of returning it, freeing its slot. Used
    /// when the handle is known to be broken.
    pub fn discard(mut self) {
        self.handle.take();
    }
}

impl<H> Deref for PooledHandle<'_, H> {
    type Target = H;

    fn deref(&self) -> &H {
        match &self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<H> DerefMut for PooledHandle<'_, H> {
    fn deref_mut(&mut self) -> &mut H {
        match &mut self.handle {
            Some(handle) => handle,
            None => unreachable!("pooled handle used after release"),
        }
    }
}

impl<H> Drop for PooledHandle<'_, H> {
    fn drop(&mut self) {
        self.pool.release(self.handle.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    fn counting_pool(capacity: usize) -> (HandlePool<usize>, Arc<AtomicUsize>) {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let pool = HandlePool::new(capacity, move || Ok(c.fetch_add(1, Ordering::SeqCst)));
        (pool, counter)
    }

    #[test]
    fn test_handles_are_reused() {
        let (pool, created) = counting_pool(2);
        for _ in 0..5 {
            let handle = pool.acquire(Duration::from_millis(10)).unwrap();
            assert_eq!(*handle, 0);
        }
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_exhaustion_times_out_without_corrupting_state() {
        let (pool, _) = counting_pool(1);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();
        let start = Instant::now();
        let result = pool.acquire(Duration::from_millis(50));
        assert!(matches!(result, Err(GammaError::ResourceExhausted(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
        drop(held);

        assert!(pool.acquire(Duration::from_millis(10)).is_ok());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_waiter_receives_released_handle() {
        let (pool, _) = counting_pool(1);
        let pool = Arc::new(pool);
        let held = pool.acquire(Duration::from_millis(10)).unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || pool.acquire(Duration::from_secs(2)).map(|h| *h))
        };
        thread::sleep(Duration::from_millis(50));
        drop(held);

        assert_eq!(waiter.join().unwrap(), Ok(0));
    }

    #[test]
    fn test_failed_factory_frees_slot() {
        let pool: HandlePool<u8> =
            HandlePool::new(1, || Err(GammaError::Device("no device".into())));
        assert!(pool.acquire(Duration::from_millis(10)).is_err());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_discard_frees_slot() {
        let (pool, created) = counting_pool(1);
        pool.acquire(Duration::from_millis(10)).unwrap().discard();
        assert_eq!(pool.stats().idle, 0);
        let _again = pool.acquire(Duration::from_millis(10)).unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
