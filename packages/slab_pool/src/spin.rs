use std::hint::spin_loop;
use std::sync::atomic::{AtomicBool, Ordering};

/// Upper bound on the back-off delay, in spin-loop hint iterations.
const MAX_BACKOFF: u32 = 64;

/// A test-and-set spinlock with exponential back-off.
///
/// The uncontended path is a single atomic swap. Under contention the lock backs off by
/// doubling runs of [`std::hint::spin_loop`] between retries, up to [`MAX_BACKOFF`]
/// iterations, which keeps the contended cache line from bouncing between cores on every
/// failed attempt.
///
/// This is a [`lock_api::RawMutex`], so it can be combined with [`lock_api::Mutex`] (see
/// [`SpinMutex`]) or used to parameterize any code that is generic over its raw mutex.
/// Appropriate for short critical sections only; a blocked thread burns CPU rather than
/// parking.
#[derive(Debug)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    /// Creates a new unlocked spinlock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }
}

impl Default for SpinLock {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: `lock` provides mutual exclusion: it only returns once the swap observed `false`,
// and every `false -> true` transition is an acquire that pairs with the release store in
// `unlock`.
unsafe impl lock_api::RawMutex for SpinLock {
    #[allow(
        clippy::declare_interior_mutable_const,
        reason = "required shape of lock_api::RawMutex::INIT"
    )]
    const INIT: Self = Self::new();

    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        // Fast path: no contention.
        if !self.locked.swap(true, Ordering::Acquire) {
            return;
        }

        // Slow path: exponential back-off between test-and-set retries.
        let mut backoff = 1_u32;
        while self.locked.swap(true, Ordering::Acquire) {
            for _ in 0..backoff {
                spin_loop();
            }

            if backoff < MAX_BACKOFF {
                backoff <<= 1;
            }
        }
    }

    fn try_lock(&self) -> bool {
        !self.locked.swap(true, Ordering::Acquire)
    }

    unsafe fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }
}

/// A [`lock_api::Mutex`] running on the back-off [`SpinLock`].
pub type SpinMutex<T> = lock_api::Mutex<SpinLock, T>;

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(SpinLock: Send, Sync);
    assert_impl_all!(SpinMutex<u64>: Send, Sync);

    #[test]
    fn smoke_test() {
        let mutex = SpinMutex::new(0_u64);

        {
            let mut guard = mutex.lock();
            *guard += 1;
        }

        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let mutex = SpinMutex::new(());

        let guard = mutex.lock();
        assert!(mutex.try_lock().is_none());
        drop(guard);

        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn counts_correctly_under_contention() {
        const THREADS: usize = 4;
        const INCREMENTS: usize = 10_000;

        let counter = Arc::new(SpinMutex::new(0_usize));

        let threads: Vec<_> = (0..THREADS)
            .map(|_| {
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..INCREMENTS {
                        *counter.lock() += 1;
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(*counter.lock(), THREADS * INCREMENTS);
    }
}
